//! Device Acquisition: pick and open a camera by facing

use tracing::{info, warn};

use super::{
    CameraBackend, CameraDevice, CaptureError, CaptureResult, DeviceDescriptor, DeviceEventSender,
    Facing,
};
use crate::crash::mark_hardware_call;

/// The device that was opened and how it was chosen
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceSelection {
    pub descriptor: DeviceDescriptor,
    /// False when the requested facing was missing and the first device was used
    pub exact_match: bool,
}

/// Selects and opens camera devices
pub struct DeviceAcquisition {
    backend: Box<dyn CameraBackend>,
    fallback: bool,
}

/// First device with the requested facing, else (if allowed) the first device
fn select_device(
    devices: &[DeviceDescriptor],
    facing: Facing,
    fallback: bool,
) -> Option<(DeviceDescriptor, bool)> {
    if let Some(device) = devices.iter().find(|d| d.facing == facing) {
        return Some((device.clone(), true));
    }
    if fallback {
        return devices.first().map(|d| (d.clone(), false));
    }
    None
}

impl DeviceAcquisition {
    pub fn new(backend: Box<dyn CameraBackend>, fallback: bool) -> Self {
        Self { backend, fallback }
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    /// Enumerate, select by `facing`, and open.
    ///
    /// Notifications about the opened device are sent to `events` and are
    /// not retried here.
    pub async fn open(
        &self,
        facing: Facing,
        events: DeviceEventSender,
    ) -> CaptureResult<(Box<dyn CameraDevice>, DeviceSelection)> {
        mark_hardware_call("device acquisition: enumerate");
        let devices = self.backend.enumerate().await?;
        if devices.is_empty() {
            return Err(CaptureError::DeviceUnavailable(format!(
                "no cameras found ({} backend)",
                self.backend.name()
            )));
        }

        let (descriptor, exact_match) = select_device(&devices, facing, self.fallback)
            .ok_or_else(|| {
                CaptureError::DeviceUnavailable(format!(
                    "no {}-facing camera among {} device(s)",
                    facing,
                    devices.len()
                ))
            })?;

        if exact_match {
            info!("Selected {} camera {} ({})", facing, descriptor.name, descriptor.id);
        } else {
            warn!(
                "No {}-facing camera, falling back to {} ({})",
                facing, descriptor.name, descriptor.id
            );
        }

        mark_hardware_call("device acquisition: open");
        let device = self.backend.open(&descriptor, events).await?;

        Ok((
            device,
            DeviceSelection {
                descriptor,
                exact_match,
            },
        ))
    }
}

//! Camera backend traits

use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::mpsc;

use tracing::{debug, error};

use super::{
    CaptureError, CaptureResult, DeviceDescriptor, DeviceEvent, DeviceFault, Facing, StreamFormat,
};
use crate::encoder::InputSurface;

/// Channel the camera worker uses to forward device notifications
pub type DeviceEventSender = mpsc::UnboundedSender<DeviceEvent>;

/// Enumerates and opens cameras
#[async_trait]
pub trait CameraBackend: Send + Sync {
    /// Short backend name for logs
    fn name(&self) -> &'static str;

    /// List available cameras in a stable order
    async fn enumerate(&self) -> CaptureResult<Vec<DeviceDescriptor>>;

    /// Open a camera for exclusive use.
    /// Later notifications about the device are sent to `events`.
    async fn open(
        &self,
        descriptor: &DeviceDescriptor,
        events: DeviceEventSender,
    ) -> CaptureResult<Box<dyn CameraDevice>>;
}

/// An opened camera
#[async_trait]
pub trait CameraDevice: Send + Sync {
    fn descriptor(&self) -> &DeviceDescriptor;

    /// Bind the device output to `surface` using `format`.
    /// No frames are produced until the repeating request is started.
    async fn create_session(
        &mut self,
        format: StreamFormat,
        surface: InputSurface,
    ) -> CaptureResult<Box<dyn ConfiguredSession>>;

    /// Release the device. Calling it twice is a no-op.
    async fn close(&mut self);
}

/// A device output bound to an encoder surface
#[async_trait]
pub trait ConfiguredSession: Send + Sync {
    /// Begin issuing capture requests continuously at the configured rate
    async fn set_repeating_request(&mut self) -> CaptureResult<()>;

    /// Halt the repeating request, waiting for the in-flight frame
    async fn stop_repeating(&mut self);

    /// Release the binding
    async fn close(&mut self);

    /// Frames handed to the surface so far
    fn frames_delivered(&self) -> u64;
}

/// Sink failures in a row before the encoder is considered gone
const MAX_SINK_ERRORS: u32 = 5;

/// What happened to one frame handed to [`FrameForwarder::forward`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Forwarded {
    Delivered,
    /// Encoding is not running (yet), or the encoder is behind
    Dropped,
    /// The encoder stopped taking frames and a fault was reported.
    /// The caller should stop streaming.
    EncoderGone,
}

/// Feeds camera frames into an encoder surface from a capture worker.
/// A broken pipe, or a run of sink errors, is reported once as
/// [`DeviceFault::Encoder`] on the device event channel.
pub struct FrameForwarder {
    device_id: String,
    surface: InputSurface,
    events: DeviceEventSender,
    consecutive_errors: u32,
}

impl FrameForwarder {
    pub fn new(device_id: String, surface: InputSurface, events: DeviceEventSender) -> Self {
        Self {
            device_id,
            surface,
            events,
            consecutive_errors: 0,
        }
    }

    pub fn forward(&mut self, frame: &[u8]) -> Forwarded {
        let err = match self.surface.submit(frame) {
            Ok(delivered) => {
                self.consecutive_errors = 0;
                return if delivered {
                    Forwarded::Delivered
                } else {
                    Forwarded::Dropped
                };
            }
            Err(e) => e,
        };

        self.consecutive_errors += 1;
        if err.kind() != std::io::ErrorKind::BrokenPipe
            && self.consecutive_errors < MAX_SINK_ERRORS
        {
            debug!("Encoder surface rejected frame from {}: {}", self.device_id, err);
            return Forwarded::Dropped;
        }

        error!("Encoder stopped accepting frames from {}: {}", self.device_id, err);
        let _ = self.events.send(DeviceEvent::Error {
            device_id: self.device_id.clone(),
            fault: DeviceFault::Encoder,
        });
        Forwarded::EncoderGone
    }
}

/// Classify a device by its name when the hardware does not report facing
pub fn classify_facing(name: &str) -> Option<Facing> {
    let name = name.to_ascii_lowercase();
    const FRONT: [&str; 5] = ["front", "user", "integrated", "facetime", "webcam"];
    const BACK: [&str; 4] = ["back", "rear", "environment", "world"];

    if BACK.iter().any(|k| name.contains(k)) {
        Some(Facing::Back)
    } else if FRONT.iter().any(|k| name.contains(k)) {
        Some(Facing::Front)
    } else {
        None
    }
}

/// Resolve the facing of a device: explicit override, then name, then front
pub fn resolve_facing(id: &str, name: &str, overrides: &HashMap<String, Facing>) -> Facing {
    overrides
        .get(id)
        .copied()
        .or_else(|| classify_facing(name))
        .unwrap_or(Facing::Front)
}

/// Backend for platforms without camera support
pub struct UnsupportedCameraBackend;

#[async_trait]
impl CameraBackend for UnsupportedCameraBackend {
    fn name(&self) -> &'static str {
        "unsupported"
    }

    async fn enumerate(&self) -> CaptureResult<Vec<DeviceDescriptor>> {
        Ok(Vec::new())
    }

    async fn open(
        &self,
        descriptor: &DeviceDescriptor,
        _events: DeviceEventSender,
    ) -> CaptureResult<Box<dyn CameraDevice>> {
        Err(CaptureError::DeviceUnavailable(format!(
            "camera access is not supported on this platform ({})",
            descriptor.id
        )))
    }
}

/// Create the camera backend for the current platform
pub fn create_camera_backend(facing_overrides: HashMap<String, Facing>) -> Box<dyn CameraBackend> {
    #[cfg(target_os = "linux")]
    {
        tracing::info!("Using V4L2 camera backend");
        Box::new(super::v4l2_backend::V4l2Backend::new(facing_overrides))
    }

    #[cfg(not(target_os = "linux"))]
    {
        let _ = facing_overrides;
        tracing::warn!("No camera backend for this platform");
        Box::new(UnsupportedCameraBackend)
    }
}

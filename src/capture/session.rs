//! Session Manager: binds an open device to the encoder input surface

use tracing::{debug, info, warn};

use super::{
    CameraDevice, CapabilitySummary, CaptureError, CaptureResult, ConfiguredSession,
    DeviceDescriptor, PixelFormat, Resolution, StreamFormat,
};
use crate::crash::mark_hardware_call;
use crate::encoder::InputSurface;

/// Pixel formats in the order we want them
const PIXEL_FORMAT_PREFERENCE: [PixelFormat; 3] =
    [PixelFormat::Yuyv, PixelFormat::Mjpeg, PixelFormat::Nv12];

/// Requested stream shape before negotiation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamPreferences {
    /// Tallest frame we want (0 = no limit)
    pub max_height: u32,
    pub fps: u32,
}

/// Pick the stream format for a device from its capability summary
pub fn negotiate_stream_format(
    caps: &CapabilitySummary,
    prefs: StreamPreferences,
) -> CaptureResult<StreamFormat> {
    let pixel_format = PIXEL_FORMAT_PREFERENCE
        .iter()
        .copied()
        .find(|f| caps.pixel_formats.contains(f))
        .ok_or_else(|| {
            CaptureError::ConfigurationFailed(format!(
                "no supported pixel format among {:?}",
                caps.pixel_formats
            ))
        })?;

    let area = |r: &Resolution| (r.width as u64) * (r.height as u64);
    let fits = |r: &&Resolution| prefs.max_height == 0 || r.height <= prefs.max_height;
    let resolution = caps
        .resolutions
        .iter()
        .filter(fits)
        .max_by_key(|r| area(*r))
        // Everything is taller than the limit: take the smallest frame
        .or_else(|| caps.resolutions.iter().min_by_key(|r| area(*r)))
        .copied()
        .ok_or_else(|| CaptureError::ConfigurationFailed("no frame sizes reported".to_string()))?;

    let fps = if caps.max_fps == 0 {
        prefs.fps
    } else {
        prefs.fps.clamp(caps.min_fps.min(caps.max_fps), caps.max_fps)
    };
    if fps == 0 {
        return Err(CaptureError::ConfigurationFailed(
            "frame rate resolved to zero".to_string(),
        ));
    }

    Ok(StreamFormat {
        pixel_format,
        resolution,
        fps,
    })
}

/// A configured capture session. Closing is idempotent.
pub struct SessionHandle {
    device_id: String,
    format: StreamFormat,
    inner: Option<Box<dyn ConfiguredSession>>,
}

impl SessionHandle {
    pub fn format(&self) -> StreamFormat {
        self.format
    }

    pub fn is_open(&self) -> bool {
        self.inner.is_some()
    }

    /// Halt the repeating request and release the binding
    pub async fn close(&mut self) {
        let Some(mut session) = self.inner.take() else {
            return;
        };

        mark_hardware_call("session close");
        session.stop_repeating().await;
        let frames = session.frames_delivered();
        session.close().await;
        info!("Capture session on {} closed after {} frames", self.device_id, frames);
    }
}

/// Builds capture sessions
pub struct SessionManager {
    preferences: StreamPreferences,
}

impl SessionManager {
    pub fn new(preferences: StreamPreferences) -> Self {
        Self { preferences }
    }

    /// Negotiate the stream format for `descriptor`
    pub fn negotiate(&self, descriptor: &DeviceDescriptor) -> CaptureResult<StreamFormat> {
        let format = negotiate_stream_format(&descriptor.capabilities, self.preferences)?;
        debug!("Negotiated {} for {}", format, descriptor.id);
        Ok(format)
    }

    /// Bind `device` to `surface` and start the repeating capture request.
    ///
    /// On failure nothing is left streaming: a binding whose repeating
    /// request cannot start is closed before the error is returned.
    pub async fn configure(
        &self,
        device: &mut dyn CameraDevice,
        surface: InputSurface,
    ) -> CaptureResult<SessionHandle> {
        let format = surface.format();
        let device_id = device.descriptor().id.clone();

        mark_hardware_call("session configure");
        let mut session = device
            .create_session(format, surface)
            .await
            .map_err(as_configuration_failure)?;

        if let Err(e) = session.set_repeating_request().await {
            warn!("Repeating request failed on {}: {}", device_id, e);
            session.close().await;
            return Err(as_configuration_failure(e));
        }

        info!("Capture session on {} streaming {}", device_id, format);
        Ok(SessionHandle {
            device_id,
            format,
            inner: Some(session),
        })
    }
}

/// Keep device-level errors (busy, gone, denied) and label the rest
fn as_configuration_failure(err: CaptureError) -> CaptureError {
    match err {
        CaptureError::DeviceBusy(_)
        | CaptureError::DeviceUnavailable(_)
        | CaptureError::PermissionDenied(_)
        | CaptureError::ConfigurationFailed(_) => err,
        other => CaptureError::ConfigurationFailed(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::{CaptureErrorKind, Facing};
    use crate::testing::{descriptor, FakeCamera, NullSink};
    use crate::capture::CameraBackend;
    use std::sync::Arc;
    use tokio::sync::mpsc;

    fn caps(formats: &[PixelFormat], sizes: &[(u32, u32)], min: u32, max: u32) -> CapabilitySummary {
        CapabilitySummary {
            pixel_formats: formats.to_vec(),
            resolutions: sizes.iter().map(|(w, h)| Resolution::new(*w, *h)).collect(),
            min_fps: min,
            max_fps: max,
        }
    }

    #[test]
    fn test_negotiate_prefers_yuyv_and_largest_fitting() {
        let caps = caps(
            &[PixelFormat::Mjpeg, PixelFormat::Yuyv],
            &[(640, 480), (1920, 1080), (3840, 2160), (1280, 720)],
            5,
            30,
        );
        let format = negotiate_stream_format(&caps, StreamPreferences { max_height: 1080, fps: 60 }).unwrap();

        assert_eq!(format.pixel_format, PixelFormat::Yuyv);
        assert_eq!(format.resolution, Resolution::new(1920, 1080));
        assert_eq!(format.fps, 30);
    }

    #[test]
    fn test_negotiate_falls_back_to_smallest() {
        let caps = caps(&[PixelFormat::Nv12], &[(3840, 2160), (2560, 1440)], 15, 30);
        let format = negotiate_stream_format(&caps, StreamPreferences { max_height: 720, fps: 10 }).unwrap();

        assert_eq!(format.pixel_format, PixelFormat::Nv12);
        assert_eq!(format.resolution, Resolution::new(2560, 1440));
        assert_eq!(format.fps, 15);
    }

    #[test]
    fn test_negotiate_rejects_unusable_caps() {
        let prefs = StreamPreferences { max_height: 0, fps: 30 };

        let no_format = caps(&[], &[(640, 480)], 30, 30);
        assert_eq!(
            negotiate_stream_format(&no_format, prefs).unwrap_err().kind(),
            CaptureErrorKind::ConfigurationFailed
        );

        let no_sizes = caps(&[PixelFormat::Yuyv], &[], 30, 30);
        assert_eq!(
            negotiate_stream_format(&no_sizes, prefs).unwrap_err().kind(),
            CaptureErrorKind::ConfigurationFailed
        );
    }

    async fn open_fake(camera: &FakeCamera) -> Box<dyn CameraDevice> {
        let (tx, _rx) = mpsc::unbounded_channel();
        camera
            .open(&descriptor("/dev/video0", Facing::Back), tx)
            .await
            .unwrap()
    }

    fn surface() -> InputSurface {
        let caps = descriptor("/dev/video0", Facing::Back).capabilities;
        let format = negotiate_stream_format(&caps, StreamPreferences { max_height: 0, fps: 30 }).unwrap();
        InputSurface::new(Arc::new(NullSink), format)
    }

    #[tokio::test]
    async fn test_failed_repeating_request_closes_binding() {
        let camera = FakeCamera::with_devices(vec![descriptor("/dev/video0", Facing::Back)]);
        camera.fail_repeating_request();
        let mut device = open_fake(&camera).await;

        let manager = SessionManager::new(StreamPreferences { max_height: 0, fps: 30 });
        let err = manager.configure(device.as_mut(), surface()).await.err().unwrap();

        assert_eq!(err.kind(), CaptureErrorKind::ConfigurationFailed);
        assert_eq!(camera.counters().held_sessions(), 0);
        assert_eq!(camera.counters().streaming(), 0);
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let camera = FakeCamera::with_devices(vec![descriptor("/dev/video0", Facing::Back)]);
        let mut device = open_fake(&camera).await;

        let manager = SessionManager::new(StreamPreferences { max_height: 0, fps: 30 });
        let mut handle = manager.configure(device.as_mut(), surface()).await.unwrap();
        assert_eq!(camera.counters().streaming(), 1);

        handle.close().await;
        handle.close().await;
        assert!(!handle.is_open());
        assert_eq!(camera.counters().held_sessions(), 0);
        assert_eq!(camera.counters().streaming(), 0);
        assert_eq!(camera.counters().sessions_closed(), 1);
    }
}

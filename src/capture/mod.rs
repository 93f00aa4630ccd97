//! Camera device layer
//!
//! Device Acquisition (enumerate + open by facing) and the Session Manager
//! that binds an open device to an encoder input surface. Hardware access
//! goes through the [`CameraBackend`] trait so the controller never touches
//! V4L2 (or any other camera API) directly.

mod acquisition;
mod backend;
mod session;
#[cfg(target_os = "linux")]
pub(crate) mod v4l2_backend;

pub use acquisition::{DeviceAcquisition, DeviceSelection};
pub use backend::*;
pub use session::{SessionHandle, SessionManager, StreamPreferences};

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// Logical camera orientation used for device selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Facing {
    Front,
    #[default]
    Back,
}

impl fmt::Display for Facing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Facing::Front => write!(f, "front"),
            Facing::Back => write!(f, "back"),
        }
    }
}

impl std::str::FromStr for Facing {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "front" | "user" => Ok(Facing::Front),
            "back" | "rear" | "environment" => Ok(Facing::Back),
            other => Err(format!("unknown facing '{}', expected front or back", other)),
        }
    }
}

/// Pixel layouts the session can bind to an encoder surface
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PixelFormat {
    /// Packed YUV 4:2:2
    Yuyv,
    /// Motion JPEG, one JPEG image per frame
    Mjpeg,
    /// Semi-planar YUV 4:2:0
    Nv12,
}

impl PixelFormat {
    pub fn fourcc(&self) -> [u8; 4] {
        match self {
            PixelFormat::Yuyv => *b"YUYV",
            PixelFormat::Mjpeg => *b"MJPG",
            PixelFormat::Nv12 => *b"NV12",
        }
    }

    pub fn from_fourcc(fourcc: &[u8; 4]) -> Option<Self> {
        match fourcc {
            b"YUYV" => Some(PixelFormat::Yuyv),
            b"MJPG" => Some(PixelFormat::Mjpeg),
            b"NV12" => Some(PixelFormat::Nv12),
            _ => None,
        }
    }
}

/// Frame size in pixels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// What a device can produce, summarized at enumeration time
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilitySummary {
    /// Supported pixel formats, in the order the driver reported them
    pub pixel_formats: Vec<PixelFormat>,
    /// Supported frame sizes (discrete sizes, or common sizes inside a stepwise range)
    pub resolutions: Vec<Resolution>,
    /// Lowest supported frame rate
    pub min_fps: u32,
    /// Highest supported frame rate
    pub max_fps: u32,
}

/// One enumerable camera. Produced during enumeration and never mutated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceDescriptor {
    /// Stable identifier (the device node path on V4L2)
    pub id: String,
    /// Human-readable device name
    pub name: String,
    pub facing: Facing,
    pub capabilities: CapabilitySummary,
    /// Backend-specific location of the device
    pub path: PathBuf,
}

/// The frame layout negotiated between a device and the encoder input surface
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamFormat {
    pub pixel_format: PixelFormat,
    pub resolution: Resolution,
    pub fps: u32,
}

impl fmt::Display for StreamFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} {} @ {}fps", self.pixel_format, self.resolution, self.fps)
    }
}

/// Value object passed once into `start()`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordingRequest {
    pub facing: Facing,
    /// Directory to write the recording into instead of the configured one
    #[serde(default)]
    pub output_dir: Option<PathBuf>,
}

impl RecordingRequest {
    pub fn new(facing: Facing) -> Self {
        Self {
            facing,
            output_dir: None,
        }
    }
}

/// Fault codes a camera can report asynchronously after it was opened
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceFault {
    /// Another client took the camera
    InUse,
    /// Too many cameras are open system-wide
    MaxInUse,
    /// Access was revoked by policy
    Disabled,
    /// The device reported a fatal error
    Device,
    /// The camera service itself failed
    Service,
    /// The encoder stopped accepting frames from the device
    Encoder,
}

/// Notifications delivered from the camera worker, forwarded verbatim
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceEvent {
    Opened { device_id: String },
    Disconnected { device_id: String },
    Error { device_id: String, fault: DeviceFault },
}

impl DeviceEvent {
    /// The capture error this notification implies, if any
    pub fn as_error(&self) -> Option<CaptureError> {
        match self {
            DeviceEvent::Opened { .. } => None,
            DeviceEvent::Disconnected { device_id } => Some(CaptureError::DeviceUnavailable(
                format!("{} disconnected", device_id),
            )),
            DeviceEvent::Error { device_id, fault } => Some(match fault {
                DeviceFault::InUse | DeviceFault::MaxInUse => {
                    CaptureError::DeviceBusy(format!("{} taken by another client", device_id))
                }
                DeviceFault::Disabled => {
                    CaptureError::PermissionDenied(format!("{} disabled by policy", device_id))
                }
                DeviceFault::Device | DeviceFault::Service => CaptureError::DeviceUnavailable(
                    format!("{} reported a fatal error ({:?})", device_id, fault),
                ),
                DeviceFault::Encoder => CaptureError::EncoderFailure(format!(
                    "encoder stopped accepting frames from {}",
                    device_id
                )),
            }),
        }
    }
}

/// Errors reported by the capture pipeline
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CaptureError {
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("No camera available: {0}")]
    DeviceUnavailable(String),

    #[error("Camera busy: {0}")]
    DeviceBusy(String),

    #[error("Capture session configuration failed: {0}")]
    ConfigurationFailed(String),

    #[error("Encoder failure: {0}")]
    EncoderFailure(String),

    #[error("Already recording")]
    AlreadyRecording,

    #[error("Not recording")]
    NotRecording,

    #[error("Start cancelled by stop before recording began")]
    Cancelled,
}

impl CaptureError {
    pub fn kind(&self) -> CaptureErrorKind {
        match self {
            CaptureError::PermissionDenied(_) => CaptureErrorKind::PermissionDenied,
            CaptureError::DeviceUnavailable(_) => CaptureErrorKind::DeviceUnavailable,
            CaptureError::DeviceBusy(_) => CaptureErrorKind::DeviceBusy,
            CaptureError::ConfigurationFailed(_) => CaptureErrorKind::ConfigurationFailed,
            CaptureError::EncoderFailure(_) => CaptureErrorKind::EncoderFailure,
            CaptureError::AlreadyRecording => CaptureErrorKind::AlreadyRecording,
            CaptureError::NotRecording => CaptureErrorKind::NotRecording,
            CaptureError::Cancelled => CaptureErrorKind::Cancelled,
        }
    }

    /// Map an OS error from opening or probing a device
    pub fn from_io(device: &str, err: &std::io::Error) -> Self {
        #[cfg(unix)]
        if err.raw_os_error() == Some(libc::EBUSY) {
            return CaptureError::DeviceBusy(format!("{}: {}", device, err));
        }

        match err.kind() {
            std::io::ErrorKind::PermissionDenied => {
                CaptureError::PermissionDenied(format!("{}: {}", device, err))
            }
            _ => CaptureError::DeviceUnavailable(format!("{}: {}", device, err)),
        }
    }
}

/// Wire-level error identifier exposed to the UI layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CaptureErrorKind {
    PermissionDenied,
    DeviceUnavailable,
    DeviceBusy,
    ConfigurationFailed,
    EncoderFailure,
    AlreadyRecording,
    NotRecording,
    Cancelled,
}

pub type CaptureResult<T> = Result<T, CaptureError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_facing_parse() {
        assert_eq!("Front".parse::<Facing>().unwrap(), Facing::Front);
        assert_eq!("rear".parse::<Facing>().unwrap(), Facing::Back);
        assert!("sideways".parse::<Facing>().is_err());
    }

    #[test]
    fn test_device_event_errors() {
        let busy = DeviceEvent::Error {
            device_id: "/dev/video0".to_string(),
            fault: DeviceFault::InUse,
        };
        assert_eq!(busy.as_error().unwrap().kind(), CaptureErrorKind::DeviceBusy);

        let gone = DeviceEvent::Disconnected {
            device_id: "/dev/video0".to_string(),
        };
        assert_eq!(gone.as_error().unwrap().kind(), CaptureErrorKind::DeviceUnavailable);

        let opened = DeviceEvent::Opened {
            device_id: "/dev/video0".to_string(),
        };
        assert!(opened.as_error().is_none());
    }

    #[test]
    fn test_io_error_mapping() {
        let denied = std::io::Error::from(std::io::ErrorKind::PermissionDenied);
        assert_eq!(
            CaptureError::from_io("/dev/video0", &denied).kind(),
            CaptureErrorKind::PermissionDenied
        );

        let missing = std::io::Error::from(std::io::ErrorKind::NotFound);
        assert_eq!(
            CaptureError::from_io("/dev/video0", &missing).kind(),
            CaptureErrorKind::DeviceUnavailable
        );

        #[cfg(unix)]
        {
            let busy = std::io::Error::from_raw_os_error(libc::EBUSY);
            assert_eq!(
                CaptureError::from_io("/dev/video0", &busy).kind(),
                CaptureErrorKind::DeviceBusy
            );
        }
    }

    #[test]
    fn test_fourcc_round_trip() {
        for format in [PixelFormat::Yuyv, PixelFormat::Mjpeg, PixelFormat::Nv12] {
            assert_eq!(PixelFormat::from_fourcc(&format.fourcc()), Some(format));
        }
        assert_eq!(PixelFormat::from_fourcc(b"Y16 "), None);
    }
}

//! V4L2 camera backend
//!
//! Cameras are `/dev/video*` capture nodes. Frames are dequeued from an
//! mmap stream on a dedicated `camera-worker` thread and handed straight to
//! the encoder input surface. Disconnects and stream failures are reported
//! on the device event channel, as is an encoder that stops taking frames.

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};
use v4l::buffer::Type;
use v4l::io::mmap::Stream;
use v4l::io::traits::CaptureStream;
use v4l::prelude::*;
use v4l::video::capture::Parameters;
use v4l::video::Capture;
use v4l::{Format, FourCC};

use super::{
    resolve_facing, CameraBackend, CameraDevice, CapabilitySummary, CaptureError, CaptureResult,
    ConfiguredSession, DeviceDescriptor, DeviceEvent, DeviceEventSender, DeviceFault, Facing,
    Forwarded, FrameForwarder, PixelFormat, Resolution, StreamFormat,
};
use crate::crash::mark_hardware_call;
use crate::encoder::InputSurface;

const STREAM_BUFFERS: u32 = 4;
/// How long the first frame may take after streaming starts
const FIRST_FRAME_TIMEOUT: Duration = Duration::from_secs(5);
/// How long to wait for the worker to notice the stop flag
const WORKER_JOIN_TIMEOUT: Duration = Duration::from_secs(3);
/// Consecutive dequeue failures before the device is reported as failed
const MAX_CONSECUTIVE_ERRORS: u32 = 10;
/// Sizes probed inside a stepwise frame size range
const STEPWISE_SIZES: [(u32, u32); 5] = [(640, 480), (1280, 720), (1920, 1080), (2560, 1440), (3840, 2160)];

/// Camera backend for Video4Linux2 devices
pub struct V4l2Backend {
    facing_overrides: HashMap<String, Facing>,
}

impl V4l2Backend {
    pub fn new(facing_overrides: HashMap<String, Facing>) -> Self {
        Self { facing_overrides }
    }
}

/// `/dev/videoN` nodes sorted by N
fn video_nodes(dev_dir: &Path) -> Vec<PathBuf> {
    let Ok(entries) = std::fs::read_dir(dev_dir) else {
        return Vec::new();
    };

    let mut nodes: Vec<(u32, PathBuf)> = entries
        .flatten()
        .filter_map(|entry| {
            let name = entry.file_name();
            let index = name.to_str()?.strip_prefix("video")?.parse().ok()?;
            Some((index, entry.path()))
        })
        .collect();
    nodes.sort_by_key(|(index, _)| *index);
    nodes.into_iter().map(|(_, path)| path).collect()
}

fn fps_of(numerator: u32, denominator: u32) -> Option<u32> {
    (numerator > 0).then(|| denominator / numerator)
}

/// Summarize what a device can stream in the pixel formats we handle
fn probe_capabilities(dev: &Device) -> CapabilitySummary {
    let mut summary = CapabilitySummary::default();
    let mut min_fps = u32::MAX;
    let mut max_fps = 0;

    let formats = dev.enum_formats().into_iter().flatten();
    for desc in formats {
        let Some(pixel_format) = PixelFormat::from_fourcc(&desc.fourcc.repr) else {
            debug!("Skipping unsupported pixel format {}", desc.fourcc);
            continue;
        };
        if !summary.pixel_formats.contains(&pixel_format) {
            summary.pixel_formats.push(pixel_format);
        }

        let Ok(sizes) = dev.enum_framesizes(desc.fourcc) else {
            continue;
        };
        for size in sizes {
            let candidates: Vec<Resolution> = match size.size {
                v4l::framesize::FrameSizeEnum::Discrete(d) => vec![Resolution::new(d.width, d.height)],
                v4l::framesize::FrameSizeEnum::Stepwise(step) => STEPWISE_SIZES
                    .iter()
                    .filter(|(w, h)| {
                        *w >= step.min_width
                            && *w <= step.max_width
                            && *h >= step.min_height
                            && *h <= step.max_height
                    })
                    .map(|(w, h)| Resolution::new(*w, *h))
                    .collect(),
            };

            for resolution in candidates {
                if let Ok(intervals) =
                    dev.enum_frameintervals(desc.fourcc, resolution.width, resolution.height)
                {
                    for interval in intervals {
                        let range = match interval.interval {
                            v4l::frameinterval::FrameIntervalEnum::Discrete(frac) => {
                                fps_of(frac.numerator, frac.denominator).map(|fps| (fps, fps))
                            }
                            v4l::frameinterval::FrameIntervalEnum::Stepwise(step) => {
                                // Longest interval is the lowest rate
                                let low = fps_of(step.max.numerator, step.max.denominator);
                                let high = fps_of(step.min.numerator, step.min.denominator);
                                low.zip(high)
                            }
                        };
                        if let Some((low, high)) = range {
                            min_fps = min_fps.min(low.max(1));
                            max_fps = max_fps.max(high);
                        }
                    }
                }

                if !summary.resolutions.contains(&resolution) {
                    summary.resolutions.push(resolution);
                }
            }
        }
    }

    if max_fps > 0 {
        summary.min_fps = min_fps;
        summary.max_fps = max_fps;
    }
    summary
}

fn describe_node(path: &Path, overrides: &HashMap<String, Facing>) -> Option<DeviceDescriptor> {
    let dev = match Device::with_path(path) {
        Ok(dev) => dev,
        Err(e) => {
            debug!("Cannot open {:?} for enumeration: {}", path, e);
            return None;
        }
    };
    let caps = dev.query_caps().ok()?;
    if !caps.capabilities.contains(v4l::capability::Flags::VIDEO_CAPTURE) {
        // Metadata and output nodes
        return None;
    }

    let id = path.to_string_lossy().into_owned();
    let facing = resolve_facing(&id, &caps.card, overrides);
    let capabilities = probe_capabilities(&dev);
    debug!(
        "Found {} ({}, driver {}): {} facing, formats {:?}, {} sizes, {}-{} fps",
        id,
        caps.card,
        caps.driver,
        facing,
        capabilities.pixel_formats,
        capabilities.resolutions.len(),
        capabilities.min_fps,
        capabilities.max_fps
    );

    Some(DeviceDescriptor {
        id,
        name: caps.card,
        facing,
        capabilities,
        path: path.to_path_buf(),
    })
}

#[async_trait]
impl CameraBackend for V4l2Backend {
    fn name(&self) -> &'static str {
        "v4l2"
    }

    async fn enumerate(&self) -> CaptureResult<Vec<DeviceDescriptor>> {
        let overrides = self.facing_overrides.clone();
        mark_hardware_call("v4l2 enumerate");
        tokio::task::spawn_blocking(move || {
            video_nodes(Path::new("/dev"))
                .iter()
                .filter_map(|path| describe_node(path, &overrides))
                .collect()
        })
        .await
        .map_err(|e| CaptureError::DeviceUnavailable(format!("enumeration task failed: {}", e)))
    }

    async fn open(
        &self,
        descriptor: &DeviceDescriptor,
        events: DeviceEventSender,
    ) -> CaptureResult<Box<dyn CameraDevice>> {
        let id = descriptor.id.clone();
        let path = descriptor.path.clone();

        mark_hardware_call("v4l2 open");
        let device = tokio::task::spawn_blocking(move || -> CaptureResult<Device> {
            let dev = Device::with_path(&path).map_err(|e| CaptureError::from_io(&id, &e))?;

            // Re-applying the current format fails with EBUSY while another
            // process is streaming from the device
            let current = dev.format().map_err(|e| CaptureError::from_io(&id, &e))?;
            dev.set_format(&current)
                .map_err(|e| CaptureError::from_io(&id, &e))?;
            Ok(dev)
        })
        .await
        .map_err(|e| CaptureError::DeviceUnavailable(format!("open task failed: {}", e)))??;

        info!("Opened camera {} ({})", descriptor.name, descriptor.id);
        let _ = events.send(DeviceEvent::Opened {
            device_id: descriptor.id.clone(),
        });

        Ok(Box::new(V4l2Camera {
            descriptor: descriptor.clone(),
            device: Some(Arc::new(device)),
            events,
        }))
    }
}

struct V4l2Camera {
    descriptor: DeviceDescriptor,
    device: Option<Arc<Device>>,
    events: DeviceEventSender,
}

#[async_trait]
impl CameraDevice for V4l2Camera {
    fn descriptor(&self) -> &DeviceDescriptor {
        &self.descriptor
    }

    async fn create_session(
        &mut self,
        format: StreamFormat,
        surface: InputSurface,
    ) -> CaptureResult<Box<dyn ConfiguredSession>> {
        let device = self.device.clone().ok_or_else(|| {
            CaptureError::DeviceUnavailable(format!("{} is closed", self.descriptor.id))
        })?;
        let id = self.descriptor.id.clone();

        mark_hardware_call("v4l2 set format");
        let worker_device = device.clone();
        tokio::task::spawn_blocking(move || apply_format(&worker_device, &id, format))
            .await
            .map_err(|e| CaptureError::ConfigurationFailed(format!("format task failed: {}", e)))??;

        Ok(Box::new(V4l2Session {
            device_id: self.descriptor.id.clone(),
            device,
            surface,
            events: self.events.clone(),
            stop: Arc::new(AtomicBool::new(false)),
            frames: Arc::new(AtomicU64::new(0)),
            worker: None,
        }))
    }

    async fn close(&mut self) {
        if self.device.take().is_some() {
            info!("Closed camera {}", self.descriptor.id);
        }
    }
}

fn apply_format(dev: &Device, id: &str, format: StreamFormat) -> CaptureResult<()> {
    let fourcc = FourCC::new(&format.pixel_format.fourcc());
    let requested = Format::new(format.resolution.width, format.resolution.height, fourcc);
    let actual = dev.set_format(&requested).map_err(|e| match CaptureError::from_io(id, &e) {
        CaptureError::DeviceUnavailable(msg) => CaptureError::ConfigurationFailed(msg),
        other => other,
    })?;

    if actual.fourcc != fourcc
        || actual.width != format.resolution.width
        || actual.height != format.resolution.height
    {
        return Err(CaptureError::ConfigurationFailed(format!(
            "{} accepted {}x{} {} instead of {}",
            id, actual.width, actual.height, actual.fourcc, format
        )));
    }

    if let Err(e) = dev.set_params(&Parameters::with_fps(format.fps)) {
        warn!("{} rejected {} fps, using driver default: {}", id, format.fps, e);
    }
    Ok(())
}

struct V4l2Session {
    device_id: String,
    device: Arc<Device>,
    surface: InputSurface,
    events: DeviceEventSender,
    stop: Arc<AtomicBool>,
    frames: Arc<AtomicU64>,
    worker: Option<JoinHandle<()>>,
}

/// Dequeue frames until stopped, forwarding them to the surface
fn capture_loop(
    device: Arc<Device>,
    device_id: String,
    surface: InputSurface,
    events: DeviceEventSender,
    stop: Arc<AtomicBool>,
    frames: Arc<AtomicU64>,
    ready: oneshot::Sender<CaptureResult<()>>,
) {
    let mut ready = Some(ready);
    let mut forwarder = FrameForwarder::new(device_id.clone(), surface, events.clone());

    let mut stream = match Stream::with_buffers(&device, Type::VideoCapture, STREAM_BUFFERS) {
        Ok(stream) => stream,
        Err(e) => {
            if let Some(ready) = ready.take() {
                let _ = ready.send(Err(CaptureError::ConfigurationFailed(format!(
                    "{}: cannot create stream: {}",
                    device_id, e
                ))));
            }
            return;
        }
    };

    let mut consecutive_errors = 0;
    while !stop.load(Ordering::SeqCst) {
        match stream.next() {
            Ok((buf, meta)) => {
                consecutive_errors = 0;
                let used = meta.bytesused as usize;
                let frame = if used > 0 && used <= buf.len() { &buf[..used] } else { buf };

                let forwarded = forwarder.forward(frame);
                if forwarded == Forwarded::Delivered {
                    frames.fetch_add(1, Ordering::Relaxed);
                }

                if let Some(ready) = ready.take() {
                    let _ = ready.send(Ok(()));
                }
                if forwarded == Forwarded::EncoderGone {
                    break;
                }
            }
            Err(e) if e.raw_os_error() == Some(libc::ENODEV) => {
                warn!("{} disconnected", device_id);
                let _ = events.send(DeviceEvent::Disconnected {
                    device_id: device_id.clone(),
                });
                break;
            }
            Err(e) => {
                consecutive_errors += 1;
                warn!("Frame dequeue failed on {} ({}): {}", device_id, consecutive_errors, e);
                if consecutive_errors >= MAX_CONSECUTIVE_ERRORS {
                    error!("{} keeps failing, giving up", device_id);
                    let _ = events.send(DeviceEvent::Error {
                        device_id: device_id.clone(),
                        fault: DeviceFault::Device,
                    });
                    break;
                }
                std::thread::sleep(Duration::from_millis(10));
            }
        }
    }

    if let Some(ready) = ready.take() {
        let _ = ready.send(Err(CaptureError::ConfigurationFailed(format!(
            "{} stopped before delivering a frame",
            device_id
        ))));
    }
    debug!("Camera worker for {} exiting", device_id);
}

#[async_trait]
impl ConfiguredSession for V4l2Session {
    async fn set_repeating_request(&mut self) -> CaptureResult<()> {
        if self.worker.is_some() {
            return Ok(());
        }

        let (ready_tx, ready_rx) = oneshot::channel();
        self.stop.store(false, Ordering::SeqCst);

        let device = self.device.clone();
        let device_id = self.device_id.clone();
        let surface = self.surface.clone();
        let events = self.events.clone();
        let stop = self.stop.clone();
        let frames = self.frames.clone();

        mark_hardware_call("v4l2 stream on");
        let worker = std::thread::Builder::new()
            .name("camera-worker".to_string())
            .spawn(move || capture_loop(device, device_id, surface, events, stop, frames, ready_tx))
            .map_err(|e| {
                CaptureError::ConfigurationFailed(format!("cannot spawn camera worker: {}", e))
            })?;
        self.worker = Some(worker);

        let result = match tokio::time::timeout(FIRST_FRAME_TIMEOUT, ready_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(CaptureError::ConfigurationFailed(
                "camera worker exited unexpectedly".to_string(),
            )),
            Err(_) => Err(CaptureError::ConfigurationFailed(format!(
                "{} delivered no frame within {:?}",
                self.device_id, FIRST_FRAME_TIMEOUT
            ))),
        };

        if result.is_err() {
            self.stop_repeating().await;
        }
        result
    }

    async fn stop_repeating(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        let Some(worker) = self.worker.take() else {
            return;
        };

        let join = tokio::task::spawn_blocking(move || worker.join());
        match tokio::time::timeout(WORKER_JOIN_TIMEOUT, join).await {
            Ok(Ok(Ok(()))) => debug!("Camera worker for {} joined", self.device_id),
            Ok(Ok(Err(_))) => error!("Camera worker for {} panicked", self.device_id),
            Ok(Err(e)) => error!("Failed to join camera worker: {}", e),
            Err(_) => warn!(
                "Camera worker for {} still blocked after {:?}, detaching",
                self.device_id, WORKER_JOIN_TIMEOUT
            ),
        }
    }

    async fn close(&mut self) {
        self.stop_repeating().await;
    }

    fn frames_delivered(&self) -> u64 {
        self.frames.load(Ordering::Relaxed)
    }
}

impl Drop for V4l2Session {
    fn drop(&mut self) {
        // Dropped without close (e.g. a panicking step): let the worker exit on its own
        self.stop.store(true, Ordering::SeqCst);
        if self.worker.take().is_some() {
            warn!("Camera session for {} dropped while streaming", self.device_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_video_nodes_sorted_numerically() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["video10", "video2", "video0", "vbi0", "videoX", "media0"] {
            std::fs::write(dir.path().join(name), b"").unwrap();
        }

        let nodes: Vec<String> = video_nodes(dir.path())
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(nodes, vec!["video0", "video2", "video10"]);
    }

    #[test]
    fn test_fps_of() {
        assert_eq!(fps_of(1, 30), Some(30));
        assert_eq!(fps_of(1001, 30000), Some(29));
        assert_eq!(fps_of(0, 30), None);
    }
}

//! ffmpeg-based encoder
//!
//! The encoder is an `ffmpeg` child process reading raw frames from its
//! stdin, which acts as the input surface. The process is spawned by
//! `prepare()`, so the surface exists before the capture session binds to
//! it; frames are dropped until `start()` opens the gate. A writer thread
//! owns stdin and is fed through a small bounded queue, so a stalled ffmpeg
//! costs dropped frames instead of a blocked camera worker. Stopping closes
//! the queue and waits (bounded) for ffmpeg to flush the container.

use async_trait::async_trait;
use std::collections::HashSet;
use std::collections::VecDeque;
use std::io::{BufRead, BufReader, ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStderr, ChildStdin, Command, Stdio};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, SyncSender, TrySendError};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::OnceCell;
use tracing::{debug, error, info, warn};

use super::{
    AudioSource, Container, EncoderBackend, EncoderCapabilities, EncoderSettings, FrameSink,
    InputSurface, PreparedEncoder, VideoCodec,
};
use crate::capture::{CaptureError, CaptureResult, PixelFormat};
use crate::crash::mark_hardware_call;

const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(50);
/// Frames queued for the writer thread before new ones are dropped
const FRAME_QUEUE_DEPTH: usize = 4;
/// Lines of ffmpeg stderr kept for error messages
const STDERR_TAIL_LINES: usize = 20;
/// How long to wait for the stderr reader once ffmpeg has exited
const STDERR_GRACE: Duration = Duration::from_millis(500);

/// ffmpeg encoder names for each codec, best first
fn encoder_candidates(codec: VideoCodec) -> &'static [&'static str] {
    match codec {
        VideoCodec::Hevc => &["libx265"],
        VideoCodec::H264 => &["libx264", "libopenh264"],
        VideoCodec::Av1 => &["libsvtav1", "libaom-av1"],
        VideoCodec::Mpeg4 => &["mpeg4"],
    }
}

/// Parse `ffmpeg -encoders` output into the set of encoder names
fn parse_encoder_list(listing: &str) -> HashSet<String> {
    listing
        .lines()
        .skip_while(|line| !line.trim_start().starts_with("------"))
        .skip(1)
        .filter_map(|line| {
            let mut parts = line.split_whitespace();
            let flags = parts.next()?;
            let name = parts.next()?;
            (flags.len() == 6).then(|| name.to_string())
        })
        .collect()
}

/// Parse `ffmpeg -devices` output into the audio inputs we know how to drive
fn parse_input_devices(listing: &str) -> Vec<AudioSource> {
    let mut sources = Vec::new();
    for line in listing
        .lines()
        .skip_while(|line| !line.trim_start().starts_with("---"))
        .skip(1)
    {
        let mut parts = line.split_whitespace();
        let (Some(flags), Some(name)) = (parts.next(), parts.next()) else {
            continue;
        };
        if !flags.contains('D') {
            continue;
        }
        let source = match name {
            "pulse" => AudioSource::Pulse,
            "alsa" => AudioSource::Alsa,
            _ => continue,
        };
        if !sources.contains(&source) {
            sources.push(source);
        }
    }
    sources
}

/// What the local ffmpeg binary offers
#[derive(Debug, Clone, Default)]
struct FfmpegProbe {
    encoders: HashSet<String>,
    audio_sources: Vec<AudioSource>,
}

impl FfmpegProbe {
    fn encoder_for(&self, codec: VideoCodec) -> Option<&'static str> {
        encoder_candidates(codec)
            .iter()
            .copied()
            .find(|name| self.encoders.contains(*name))
    }

    fn capabilities(&self) -> EncoderCapabilities {
        let video_codecs = [VideoCodec::Hevc, VideoCodec::H264, VideoCodec::Av1, VideoCodec::Mpeg4]
            .into_iter()
            .filter(|codec| self.encoder_for(*codec).is_some())
            .collect();

        EncoderCapabilities {
            video_codecs,
            audio_sources: self.audio_sources.clone(),
        }
    }
}

/// Build the ffmpeg command line for `settings`
fn build_ffmpeg_args(settings: &EncoderSettings, encoder: &str) -> Vec<String> {
    let input = settings.input;
    let mut args: Vec<String> = ["-hide_banner", "-loglevel", "error", "-y"]
        .iter()
        .map(|s| s.to_string())
        .collect();

    match input.pixel_format {
        PixelFormat::Mjpeg => {
            args.extend(["-f".into(), "mjpeg".into()]);
            args.extend(["-framerate".into(), input.fps.to_string()]);
        }
        PixelFormat::Yuyv | PixelFormat::Nv12 => {
            let pix_fmt = if input.pixel_format == PixelFormat::Yuyv {
                "yuyv422"
            } else {
                "nv12"
            };
            args.extend(["-f".into(), "rawvideo".into()]);
            args.extend(["-pix_fmt".into(), pix_fmt.into()]);
            args.extend(["-video_size".into(), input.resolution.to_string()]);
            args.extend(["-framerate".into(), input.fps.to_string()]);
        }
    }
    args.extend(["-i".into(), "pipe:0".into()]);

    if let Some(audio) = settings.audio {
        let format = match audio.source {
            AudioSource::Pulse => "pulse",
            AudioSource::Alsa => "alsa",
        };
        args.extend(["-f".into(), format.into(), "-i".into(), "default".into()]);
        args.extend(["-map".into(), "0:v".into(), "-map".into(), "1:a".into()]);
    }

    args.extend(["-c:v".into(), encoder.into()]);
    args.extend(["-b:v".into(), format!("{}k", settings.video_bitrate_kbps)]);
    args.extend(["-pix_fmt".into(), "yuv420p".into()]);
    if settings.output_size != input.resolution {
        args.extend([
            "-vf".into(),
            format!("scale={}:{}", settings.output_size.width, settings.output_size.height),
        ]);
    }

    if let Some(audio) = settings.audio {
        args.extend(["-c:a".into(), "aac".into()]);
        args.extend(["-b:a".into(), format!("{}k", audio.bitrate_kbps)]);
        // Live audio never reaches EOF on its own; end with the video pipe
        args.push("-shortest".into());
    }

    match settings.container {
        Container::Mp4 => {
            args.extend(["-f".into(), "mp4".into()]);
            args.extend(["-movflags".into(), "+faststart".into()]);
        }
        Container::Matroska => args.extend(["-f".into(), "matroska".into()]),
    }

    args.push(settings.output_path.to_string_lossy().into_owned());
    args
}

/// Encoder backend that drives an `ffmpeg` binary
pub struct FfmpegBackend {
    program: PathBuf,
    stop_timeout: Duration,
    probe: OnceCell<FfmpegProbe>,
}

impl FfmpegBackend {
    pub fn new(program: PathBuf, stop_timeout: Duration) -> Self {
        Self {
            program,
            stop_timeout,
            probe: OnceCell::new(),
        }
    }

    async fn probe(&self) -> &FfmpegProbe {
        self.probe
            .get_or_init(|| async {
                let program = self.program.clone();
                tokio::task::spawn_blocking(move || run_probe(&program))
                    .await
                    .unwrap_or_default()
            })
            .await
    }
}

fn run_probe(program: &Path) -> FfmpegProbe {
    let run = |flag: &str| -> Option<String> {
        match Command::new(program).args(["-hide_banner", flag]).output() {
            Ok(output) => Some(String::from_utf8_lossy(&output.stdout).into_owned()),
            Err(e) => {
                warn!("Failed to run {:?} {}: {}", program, flag, e);
                None
            }
        }
    };

    let encoders = run("-encoders")
        .map(|listing| parse_encoder_list(&listing))
        .unwrap_or_default();
    let audio_sources = run("-devices")
        .map(|listing| parse_input_devices(&listing))
        .unwrap_or_default();

    debug!(
        "ffmpeg probe: {} encoders, audio sources {:?}",
        encoders.len(),
        audio_sources
    );

    FfmpegProbe {
        encoders,
        audio_sources,
    }
}

#[async_trait]
impl EncoderBackend for FfmpegBackend {
    fn name(&self) -> &'static str {
        "ffmpeg"
    }

    async fn capabilities(&self) -> EncoderCapabilities {
        self.probe().await.capabilities()
    }

    async fn prepare(&self, settings: EncoderSettings) -> CaptureResult<Box<dyn PreparedEncoder>> {
        let encoder = self.probe().await.encoder_for(settings.video_codec).ok_or_else(|| {
            CaptureError::EncoderFailure(format!(
                "ffmpeg has no encoder for {:?}",
                settings.video_codec
            ))
        })?;

        let args = build_ffmpeg_args(&settings, encoder);
        info!(
            "Preparing ffmpeg encoder: {} {} -> {} ({} Kbps, audio: {:?}) at {:?}",
            settings.input,
            encoder,
            settings.output_size,
            settings.video_bitrate_kbps,
            settings.audio.map(|a| a.source),
            settings.output_path
        );

        mark_hardware_call("encoder prepare: spawning ffmpeg");
        let mut child = Command::new(&self.program)
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| {
                CaptureError::EncoderFailure(format!("failed to spawn {:?}: {}", self.program, e))
            })?;

        let sink = match spawn_io_threads(&mut child) {
            Ok(sink) => sink,
            Err(e) => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(CaptureError::EncoderFailure(format!(
                    "cannot start ffmpeg I/O threads: {}",
                    e
                )));
            }
        };
        let sink = Arc::new(sink);

        Ok(Box::new(FfmpegEncoder {
            surface: InputSurface::new(sink.clone(), settings.input),
            sink,
            child: Some(child),
            output_path: settings.output_path,
            stop_timeout: self.stop_timeout,
            started: false,
        }))
    }
}

/// Start the stdin writer and stderr reader for a freshly spawned ffmpeg
fn spawn_io_threads(child: &mut Child) -> std::io::Result<PipeSink> {
    let stdin = child
        .stdin
        .take()
        .ok_or_else(|| std::io::Error::new(ErrorKind::BrokenPipe, "ffmpeg stdin missing"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| std::io::Error::new(ErrorKind::BrokenPipe, "ffmpeg stderr missing"))?;

    let (tail_tx, tail_rx) = mpsc::channel();
    std::thread::Builder::new()
        .name("ffmpeg-stderr".to_string())
        .spawn(move || {
            let _ = tail_tx.send(read_stderr(stderr));
        })?;

    let (frame_tx, frame_rx) = mpsc::sync_channel(FRAME_QUEUE_DEPTH);
    let frames = Arc::new(AtomicU64::new(0));
    let written = frames.clone();
    std::thread::Builder::new()
        .name("ffmpeg-writer".to_string())
        .spawn(move || write_frames(stdin, frame_rx, written))?;

    Ok(PipeSink {
        queue: Mutex::new(Some(frame_tx)),
        open: AtomicBool::new(false),
        frames,
        dropped: AtomicU64::new(0),
        stderr: Mutex::new(Some(tail_rx)),
    })
}

/// Copy queued frames into ffmpeg until the queue closes or the pipe breaks.
/// Dropping stdin on return is what signals EOF to ffmpeg.
fn write_frames(mut stdin: ChildStdin, frames: Receiver<Vec<u8>>, written: Arc<AtomicU64>) {
    for frame in frames {
        if let Err(e) = stdin.write_all(&frame) {
            warn!("ffmpeg stopped accepting frames: {}", e);
            return;
        }
        written.fetch_add(1, Ordering::Relaxed);
    }
    debug!("ffmpeg input closed after {} frames", written.load(Ordering::Relaxed));
}

/// Log ffmpeg's stderr as it arrives and return the last few lines
fn read_stderr(stderr: ChildStderr) -> String {
    let mut tail = VecDeque::with_capacity(STDERR_TAIL_LINES);
    for line in BufReader::new(stderr).lines() {
        let Ok(line) = line else { break };
        debug!("ffmpeg: {}", line);
        if tail.len() == STDERR_TAIL_LINES {
            tail.pop_front();
        }
        tail.push_back(line);
    }
    Vec::from(tail).join("\n")
}

/// ffmpeg stdin, gated until the encoder starts
struct PipeSink {
    queue: Mutex<Option<SyncSender<Vec<u8>>>>,
    open: AtomicBool,
    /// Frames the writer thread handed to ffmpeg
    frames: Arc<AtomicU64>,
    /// Frames dropped because the queue was full
    dropped: AtomicU64,
    stderr: Mutex<Option<Receiver<String>>>,
}

impl PipeSink {
    /// Close the gate and the queue. The writer drains what is queued, then
    /// drops stdin so ffmpeg sees EOF. Never waits on the writer.
    fn close(&self) {
        self.open.store(false, Ordering::SeqCst);
        drop(lock(&self.queue).take());
    }

    /// The tail of ffmpeg's stderr, once the process has exited
    fn stderr_tail(&self) -> String {
        match lock(&self.stderr).take() {
            Some(rx) => rx.recv_timeout(STDERR_GRACE).unwrap_or_default(),
            None => String::new(),
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl FrameSink for PipeSink {
    fn submit(&self, frame: &[u8]) -> std::io::Result<bool> {
        if !self.open.load(Ordering::SeqCst) {
            return Ok(false);
        }

        let guard = lock(&self.queue);
        let Some(queue) = guard.as_ref() else {
            return Ok(false);
        };
        match queue.try_send(frame.to_vec()) {
            Ok(()) => Ok(true),
            Err(TrySendError::Full(_)) => {
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                if dropped.is_power_of_two() {
                    warn!("ffmpeg is falling behind, {} frames dropped", dropped);
                }
                Ok(false)
            }
            Err(TrySendError::Disconnected(_)) => Err(std::io::Error::new(
                ErrorKind::BrokenPipe,
                "ffmpeg is no longer reading frames",
            )),
        }
    }
}

struct FfmpegEncoder {
    surface: InputSurface,
    sink: Arc<PipeSink>,
    child: Option<Child>,
    output_path: PathBuf,
    stop_timeout: Duration,
    started: bool,
}

/// Wait for `child` to exit, killing it after `timeout`.
/// Returns None if it had to be killed.
fn wait_bounded(mut child: Child, timeout: Duration) -> Option<std::process::ExitStatus> {
    let deadline = Instant::now() + timeout;
    loop {
        match child.try_wait() {
            Ok(Some(status)) => return Some(status),
            Ok(None) if Instant::now() < deadline => std::thread::sleep(EXIT_POLL_INTERVAL),
            Ok(None) => {
                warn!("ffmpeg did not exit within {:?}, killing it", timeout);
                break;
            }
            Err(e) => {
                error!("Failed to poll ffmpeg: {}", e);
                break;
            }
        }
    }
    // The kill also unblocks a writer stuck on a full pipe
    let _ = child.kill();
    let _ = child.wait();
    None
}

#[async_trait]
impl PreparedEncoder for FfmpegEncoder {
    fn input_surface(&self) -> InputSurface {
        self.surface.clone()
    }

    fn output_path(&self) -> &Path {
        &self.output_path
    }

    fn is_started(&self) -> bool {
        self.started
    }

    async fn start(&mut self) -> CaptureResult<()> {
        let Some(child) = self.child.as_mut() else {
            return Err(CaptureError::EncoderFailure("encoder already stopped".to_string()));
        };

        match child.try_wait() {
            Ok(None) => {}
            Ok(Some(status)) => {
                return Err(CaptureError::EncoderFailure(format!(
                    "ffmpeg exited before start ({}): {}",
                    status,
                    self.sink.stderr_tail()
                )));
            }
            Err(e) => {
                return Err(CaptureError::EncoderFailure(format!("cannot poll ffmpeg: {}", e)));
            }
        }

        self.sink.open.store(true, Ordering::SeqCst);
        self.started = true;
        info!("Encoder started, writing to {:?}", self.output_path);
        Ok(())
    }

    async fn stop(&mut self) -> CaptureResult<()> {
        let Some(child) = self.child.take() else {
            debug!("Encoder already stopped");
            return Ok(());
        };

        self.sink.close();
        let timeout = self.stop_timeout;
        let was_started = std::mem::replace(&mut self.started, false);

        if !was_started {
            let mut child = child;
            let _ = child.kill();
            let _ = tokio::task::spawn_blocking(move || child.wait()).await;
            match tokio::fs::remove_file(&self.output_path).await {
                Ok(()) => debug!("Discarded unstarted output {:?}", self.output_path),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!("Failed to discard {:?}: {}", self.output_path, e),
            }
            return Ok(());
        }

        mark_hardware_call("encoder stop: waiting for ffmpeg to flush");
        let sink = self.sink.clone();
        let (status, stderr) = tokio::task::spawn_blocking(move || {
            let status = wait_bounded(child, timeout);
            (status, sink.stderr_tail())
        })
        .await
        .map_err(|e| CaptureError::EncoderFailure(format!("encoder stop task failed: {}", e)))?;

        let frames = self.sink.frames.load(Ordering::Relaxed);
        let dropped = self.sink.dropped.load(Ordering::Relaxed);
        match status {
            Some(status) if status.success() => {
                info!(
                    "Encoder flushed {} frames to {:?} ({} dropped)",
                    frames, self.output_path, dropped
                );
                Ok(())
            }
            Some(status) => Err(CaptureError::EncoderFailure(format!(
                "ffmpeg exited with {}: {}",
                status, stderr
            ))),
            None => Err(CaptureError::EncoderFailure(format!(
                "ffmpeg did not finish within {:?}",
                timeout
            ))),
        }
    }
}

impl Drop for FfmpegEncoder {
    fn drop(&mut self) {
        if let Some(mut child) = self.child.take() {
            warn!("Encoder dropped while running, killing ffmpeg");
            self.sink.close();
            let _ = child.kill();
            let _ = child.wait();
        }
    }
}

//! Encoder/Writer
//!
//! Configures the audio/video encoder that produces the output file and
//! exposes its input surface to the capture session. Codec and audio source
//! are negotiated from what the encoder actually supports, falling back from
//! the preferred codec family to H.264 and finally the built-in MPEG-4 Part 2
//! encoder.

mod ffmpeg_backend;
mod output;

pub use ffmpeg_backend::FfmpegBackend;
pub use output::{default_output_directory, prepare_output_path};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use crate::capture::{CaptureError, CaptureResult, Resolution, StreamFormat};
use crate::config::EncoderConfig;

/// Receives raw frames from a capture session
pub trait FrameSink: Send + Sync {
    /// Hand one frame to the encoder.
    /// Returns `Ok(false)` when the frame was dropped because encoding is not running.
    fn submit(&self, frame: &[u8]) -> std::io::Result<bool>;
}

/// The encoder's input. Exists from `prepare()` until the encoder is stopped.
#[derive(Clone)]
pub struct InputSurface {
    sink: Arc<dyn FrameSink>,
    format: StreamFormat,
}

impl InputSurface {
    pub fn new(sink: Arc<dyn FrameSink>, format: StreamFormat) -> Self {
        Self { sink, format }
    }

    /// The frame layout the encoder expects
    pub fn format(&self) -> StreamFormat {
        self.format
    }

    pub fn submit(&self, frame: &[u8]) -> std::io::Result<bool> {
        self.sink.submit(frame)
    }
}

impl fmt::Debug for InputSurface {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InputSurface")
            .field("format", &self.format)
            .finish_non_exhaustive()
    }
}

/// Video codec preference for recording
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VideoCodecPreference {
    /// HEVC (H.265), falling back to H.264
    #[default]
    HevcPreferred,
    /// H.264, the most compatible choice
    H264Preferred,
    /// AV1, falling back to H.264
    Av1Preferred,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VideoCodec {
    Hevc,
    H264,
    Av1,
    /// MPEG-4 Part 2, always built into the encoder
    Mpeg4,
}

impl VideoCodecPreference {
    /// Codecs to try, best first
    pub fn candidates(&self) -> &'static [VideoCodec] {
        match self {
            VideoCodecPreference::HevcPreferred => {
                &[VideoCodec::Hevc, VideoCodec::H264, VideoCodec::Mpeg4]
            }
            VideoCodecPreference::H264Preferred => &[VideoCodec::H264, VideoCodec::Mpeg4],
            VideoCodecPreference::Av1Preferred => {
                &[VideoCodec::Av1, VideoCodec::H264, VideoCodec::Mpeg4]
            }
        }
    }
}

/// Audio inputs the encoder can record from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AudioSource {
    /// PulseAudio / PipeWire pulse server
    Pulse,
    /// ALSA default capture device
    Alsa,
}

impl AudioSource {
    /// Preference order when several sources exist
    pub const PREFERENCE: [AudioSource; 2] = [AudioSource::Pulse, AudioSource::Alsa];
}

/// Output container
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Container {
    #[default]
    Mp4,
    Matroska,
}

impl Container {
    pub fn extension(&self) -> &'static str {
        match self {
            Container::Mp4 => "mp4",
            Container::Matroska => "mkv",
        }
    }
}

/// What the encoder can do on this host
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EncoderCapabilities {
    pub video_codecs: Vec<VideoCodec>,
    pub audio_sources: Vec<AudioSource>,
}

impl EncoderCapabilities {
    pub fn select_video_codec(&self, preference: VideoCodecPreference) -> Option<VideoCodec> {
        preference
            .candidates()
            .iter()
            .copied()
            .find(|codec| self.video_codecs.contains(codec))
    }

    pub fn select_audio_source(&self) -> Option<AudioSource> {
        AudioSource::PREFERENCE
            .iter()
            .copied()
            .find(|source| self.audio_sources.contains(source))
    }
}

/// Audio half of the encoder configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioSettings {
    pub source: AudioSource,
    /// Bitrate in Kbps
    pub bitrate_kbps: u32,
}

/// Complete encoder configuration, fixed before `prepare()`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncoderSettings {
    pub output_path: PathBuf,
    pub container: Container,
    /// Layout of frames arriving on the input surface
    pub input: StreamFormat,
    /// Encoded frame size
    pub output_size: Resolution,
    pub video_codec: VideoCodec,
    /// Bitrate in Kbps
    pub video_bitrate_kbps: u32,
    pub audio: Option<AudioSettings>,
}

/// Produces prepared encoders
#[async_trait]
pub trait EncoderBackend: Send + Sync {
    fn name(&self) -> &'static str;

    /// Probe supported codecs and audio sources
    async fn capabilities(&self) -> EncoderCapabilities;

    /// Fully configure an encoder. The returned encoder has an input surface
    /// but drops frames until started.
    async fn prepare(&self, settings: EncoderSettings) -> CaptureResult<Box<dyn PreparedEncoder>>;
}

/// A configured encoder
#[async_trait]
pub trait PreparedEncoder: Send + Sync {
    fn input_surface(&self) -> InputSurface;

    fn output_path(&self) -> &Path;

    fn is_started(&self) -> bool;

    /// Begin writing frames to the output file
    async fn start(&mut self) -> CaptureResult<()>;

    /// Stop writing and flush the output file. An encoder that never
    /// started discards its output instead.
    async fn stop(&mut self) -> CaptureResult<()>;
}

/// Calculate encoded dimensions with aspect-preserving downscale.
///
/// Returns the source size when `max_height` is 0 or not exceeded. Both
/// dimensions are rounded up to even values, which most encoders require.
pub fn calculate_output_dimensions(source: Resolution, max_height: u32) -> Resolution {
    if max_height == 0 || source.height <= max_height {
        return Resolution::new(make_even(source.width), make_even(source.height));
    }

    let aspect = source.width as f64 / source.height as f64;
    let width = (max_height as f64 * aspect).round() as u32;
    Resolution::new(make_even(width), make_even(max_height))
}

fn make_even(v: u32) -> u32 {
    v + (v % 2)
}

/// The Encoder/Writer component used by the controller
pub struct EncoderWriter {
    backend: Box<dyn EncoderBackend>,
    config: EncoderConfig,
    capabilities: OnceCell<EncoderCapabilities>,
}

impl EncoderWriter {
    pub fn new(backend: Box<dyn EncoderBackend>, config: EncoderConfig) -> Self {
        Self {
            backend,
            config,
            capabilities: OnceCell::new(),
        }
    }

    pub fn config(&self) -> &EncoderConfig {
        &self.config
    }

    /// Capabilities are probed once and cached for the process lifetime
    pub async fn capabilities(&self) -> &EncoderCapabilities {
        self.capabilities
            .get_or_init(|| async {
                let caps = self.backend.capabilities().await;
                info!(
                    "{} encoder capabilities: video {:?}, audio {:?}",
                    self.backend.name(),
                    caps.video_codecs,
                    caps.audio_sources
                );
                caps
            })
            .await
    }

    /// Negotiate codec, audio source and output size for `input`
    pub async fn settings_for(
        &self,
        input: StreamFormat,
        output_path: PathBuf,
    ) -> CaptureResult<EncoderSettings> {
        let caps = self.capabilities().await;

        let video_codec = caps
            .select_video_codec(self.config.codec_preference)
            .ok_or_else(|| {
                CaptureError::EncoderFailure(format!(
                    "no usable video encoder for {:?} ({} backend)",
                    self.config.codec_preference,
                    self.backend.name()
                ))
            })?;

        let audio = if self.config.enable_audio {
            match caps.select_audio_source() {
                Some(source) => Some(AudioSettings {
                    source,
                    bitrate_kbps: self.config.audio_bitrate,
                }),
                None => {
                    warn!("Audio enabled but no audio source available, recording video only");
                    None
                }
            }
        } else {
            None
        };

        Ok(EncoderSettings {
            output_path,
            container: self.config.container,
            input,
            output_size: calculate_output_dimensions(input.resolution, self.config.max_output_height),
            video_codec,
            video_bitrate_kbps: self.config.video_bitrate,
            audio,
        })
    }

    /// Configure and prepare an encoder writing to `output_path`
    pub async fn prepare(
        &self,
        input: StreamFormat,
        output_path: PathBuf,
    ) -> CaptureResult<Box<dyn PreparedEncoder>> {
        let settings = self.settings_for(input, output_path).await?;
        debug!("Preparing encoder: {:?}", settings);
        self.backend.prepare(settings).await
    }
}

//! Configuration management for the backcam agent

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::capture::Facing;
use crate::encoder::{Container, VideoCodecPreference};

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Device selection and output placement
    #[serde(default)]
    pub capture: CaptureConfig,

    /// Encoder settings
    #[serde(default)]
    pub encoder: EncoderConfig,

    /// Indicator and wake lock settings
    #[serde(default)]
    pub liveness: LivenessConfig,

    /// Per-device overrides
    #[serde(default)]
    pub devices: DevicesConfig,

    /// Control socket
    #[serde(default)]
    pub command: CommandConfig,

    /// Path to config file (not serialized)
    #[serde(skip)]
    config_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureConfig {
    /// Facing used when a client does not name one
    #[serde(default)]
    pub default_facing: Facing,

    /// Fall back to the first camera when none matches the requested facing.
    /// When false, a missing facing is reported as DeviceUnavailable.
    #[serde(default = "default_true")]
    pub facing_fallback: bool,

    /// Where recordings are written (defaults to Videos/Backcam)
    #[serde(default)]
    pub output_directory: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncoderConfig {
    /// Video codec preference, falls back to H.264 then MPEG-4
    #[serde(default)]
    pub codec_preference: VideoCodecPreference,

    /// Video bitrate in Kbps
    #[serde(default = "default_video_bitrate")]
    pub video_bitrate: u32,

    /// Audio bitrate in Kbps
    #[serde(default = "default_audio_bitrate")]
    pub audio_bitrate: u32,

    /// Record microphone audio alongside video
    #[serde(default = "default_true")]
    pub enable_audio: bool,

    /// Requested capture frame rate, clamped to what the camera supports
    #[serde(default = "default_fps")]
    pub fps: u32,

    /// Maximum frame height for capture and output (0 = no limit)
    #[serde(default = "default_max_output_height")]
    pub max_output_height: u32,

    #[serde(default)]
    pub container: Container,

    /// ffmpeg binary, looked up on PATH unless absolute
    #[serde(default = "default_ffmpeg_path")]
    pub ffmpeg_path: PathBuf,

    /// How long to wait for the encoder to flush on stop
    #[serde(default = "default_stop_timeout")]
    pub stop_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LivenessConfig {
    /// Safety ceiling for the wake lock, not a recording limit
    #[serde(default = "default_wake_lock_max_hold")]
    pub wake_lock_max_hold_secs: u64,

    #[serde(default = "default_indicator_title")]
    pub indicator_title: String,

    #[serde(default = "default_indicator_body")]
    pub indicator_body: String,

    /// Notification channel identity for the indicator
    #[serde(default = "default_channel_id")]
    pub channel_id: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DevicesConfig {
    /// Facing for devices that do not report one, keyed by device path
    #[serde(default)]
    pub facing_overrides: HashMap<String, Facing>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CommandConfig {
    /// Control socket path (defaults to the runtime directory)
    #[serde(default)]
    pub socket_path: Option<PathBuf>,
}

// Default value functions
fn default_true() -> bool {
    true
}

fn default_video_bitrate() -> u32 {
    10000
}

fn default_audio_bitrate() -> u32 {
    128
}

fn default_fps() -> u32 {
    30
}

fn default_max_output_height() -> u32 {
    1080
}

fn default_ffmpeg_path() -> PathBuf {
    PathBuf::from("ffmpeg")
}

fn default_stop_timeout() -> u64 {
    10
}

fn default_wake_lock_max_hold() -> u64 {
    4 * 60 * 60
}

fn default_indicator_title() -> String {
    "Recording video".to_string()
}

fn default_indicator_body() -> String {
    "The camera is recording in the background".to_string()
}

fn default_channel_id() -> String {
    "backcam-recording".to_string()
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            default_facing: Facing::default(),
            facing_fallback: true,
            output_directory: None,
        }
    }
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            codec_preference: VideoCodecPreference::default(),
            video_bitrate: default_video_bitrate(),
            audio_bitrate: default_audio_bitrate(),
            enable_audio: true,
            fps: default_fps(),
            max_output_height: default_max_output_height(),
            container: Container::default(),
            ffmpeg_path: default_ffmpeg_path(),
            stop_timeout_secs: default_stop_timeout(),
        }
    }
}

impl EncoderConfig {
    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_timeout_secs)
    }
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self {
            wake_lock_max_hold_secs: default_wake_lock_max_hold(),
            indicator_title: default_indicator_title(),
            indicator_body: default_indicator_body(),
            channel_id: default_channel_id(),
        }
    }
}

impl LivenessConfig {
    pub fn wake_lock_max_hold(&self) -> Duration {
        Duration::from_secs(self.wake_lock_max_hold_secs)
    }
}

impl Config {
    /// Load configuration from default location or create default
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::default_config_path()?)
    }

    /// Load configuration from `config_path`, writing defaults if it does not exist
    pub fn load_from(config_path: &Path) -> Result<Self> {
        if config_path.exists() {
            let contents = std::fs::read_to_string(config_path)
                .with_context(|| format!("Failed to read config file: {:?}", config_path))?;

            let mut config: Config = toml::from_str(&contents)
                .with_context(|| format!("Failed to parse config file: {:?}", config_path))?;

            config.config_path = Some(config_path.to_path_buf());
            Ok(config)
        } else {
            let config = Config {
                config_path: Some(config_path.to_path_buf()),
                ..Config::default()
            };
            config.save()?;
            Ok(config)
        }
    }

    /// Save configuration to file
    pub fn save(&self) -> Result<()> {
        let config_path = self.config_path()?;

        // Ensure parent directory exists
        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create config directory: {:?}", parent))?;
        }

        let contents = toml::to_string_pretty(self).context("Failed to serialize config")?;

        std::fs::write(&config_path, contents)
            .with_context(|| format!("Failed to write config file: {:?}", config_path))?;

        Ok(())
    }

    /// Get the config file path
    pub fn config_path(&self) -> Result<PathBuf> {
        match &self.config_path {
            Some(path) => Ok(path.clone()),
            None => Self::default_config_path(),
        }
    }

    fn project_dirs() -> Result<directories::ProjectDirs> {
        directories::ProjectDirs::from("dev", "backcam", "agent")
            .context("Failed to determine config directory")
    }

    /// Get default config path
    fn default_config_path() -> Result<PathBuf> {
        Ok(Self::project_dirs()?.config_dir().join("config.toml"))
    }

    /// Directory recordings go to unless a request names one
    pub fn output_directory(&self) -> PathBuf {
        self.capture
            .output_directory
            .clone()
            .unwrap_or_else(crate::encoder::default_output_directory)
    }

    /// Control socket path: configured, else the runtime dir, else the temp dir
    pub fn socket_path(&self) -> PathBuf {
        if let Some(path) = &self.command.socket_path {
            return path.clone();
        }

        Self::project_dirs()
            .ok()
            .and_then(|dirs| dirs.runtime_dir().map(|d| d.join("backcam.sock")))
            .unwrap_or_else(|| std::env::temp_dir().join("backcam.sock"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_load_writes_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let config = Config::load_from(&path).unwrap();
        assert!(path.exists());
        assert!(config.capture.facing_fallback);
        assert_eq!(config.encoder, EncoderConfig::default());
        assert_eq!(config.liveness.wake_lock_max_hold(), Duration::from_secs(4 * 60 * 60));
        assert_eq!(config.config_path().unwrap(), path);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            r#"
[capture]
default_facing = "front"
facing_fallback = false

[encoder]
codec_preference = "h264_preferred"
container = "matroska"

[devices.facing_overrides]
"/dev/video2" = "back"
"#,
        )
        .unwrap();

        let config = Config::load_from(&path).unwrap();
        assert_eq!(config.capture.default_facing, Facing::Front);
        assert!(!config.capture.facing_fallback);
        assert_eq!(config.encoder.codec_preference, VideoCodecPreference::H264Preferred);
        assert_eq!(config.encoder.container, Container::Matroska);
        assert_eq!(config.encoder.fps, 30);
        assert_eq!(
            config.devices.facing_overrides.get("/dev/video2"),
            Some(&Facing::Back)
        );
    }

    #[test]
    fn test_invalid_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[encoder]\nfps = \"fast\"\n").unwrap();

        let err = Config::load_from(&path).unwrap_err();
        assert!(format!("{:#}", err).contains("Failed to parse config file"));
    }

    #[test]
    fn test_save_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");

        let mut config = Config::load_from(&path).unwrap();
        config.command.socket_path = Some(dir.path().join("ctl.sock"));
        config.save().unwrap();

        let reloaded = Config::load_from(&path).unwrap();
        assert_eq!(reloaded.socket_path(), dir.path().join("ctl.sock"));
    }
}

//! Output file naming and placement

use chrono::{DateTime, Local};
use std::path::{Path, PathBuf};
use uuid::Uuid;

use super::Container;
use crate::capture::{CaptureError, CaptureResult};

const MEDIA_SUBDIRECTORY: &str = "Backcam";

/// The OS-visible media directory recordings go to by default
pub fn default_output_directory() -> PathBuf {
    directories::UserDirs::new()
        .and_then(|dirs| dirs.video_dir().map(|d| d.join(MEDIA_SUBDIRECTORY)))
        .unwrap_or_else(|| std::env::temp_dir().join("backcam-recordings"))
}

/// `VID_<yyyyMMdd_HHmmss>_<8 hex chars of the session id>.<ext>`
pub fn recording_file_name(started: DateTime<Local>, session_id: &Uuid, container: Container) -> String {
    let simple = session_id.simple().to_string();
    format!(
        "VID_{}_{}.{}",
        started.format("%Y%m%d_%H%M%S"),
        &simple[..8],
        container.extension()
    )
}

/// Create `dir` if needed and return a path for a new recording that does
/// not collide with an existing file.
pub fn prepare_output_path(
    dir: &Path,
    started: DateTime<Local>,
    session_id: &Uuid,
    container: Container,
) -> CaptureResult<PathBuf> {
    std::fs::create_dir_all(dir).map_err(|e| {
        CaptureError::EncoderFailure(format!("cannot create output directory {:?}: {}", dir, e))
    })?;

    let name = recording_file_name(started, session_id, container);
    let mut path = dir.join(&name);
    let mut suffix = 1;
    while path.exists() {
        let stem = name.trim_end_matches(&format!(".{}", container.extension()));
        path = dir.join(format!("{}_{}.{}", stem, suffix, container.extension()));
        suffix += 1;
    }

    Ok(path)
}

//! Capture states and status snapshots

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use uuid::Uuid;

use crate::capture::Facing;

/// Lifecycle of the capture session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum CaptureState {
    #[default]
    Idle,
    /// Liveness acquired, device being opened
    Opening,
    DeviceOpen,
    /// Encoder prepare, session configure, encoder start
    Configuring,
    Recording,
    Stopping,
    /// A step failed; teardown in progress
    Error,
}

impl CaptureState {
    /// Whether a lifecycle step may be running for this state
    pub fn is_acquiring(&self) -> bool {
        matches!(self, CaptureState::Opening | CaptureState::DeviceOpen | CaptureState::Configuring)
    }

    pub fn can_transition_to(&self, next: CaptureState) -> bool {
        use CaptureState::*;
        matches!(
            (self, next),
            (Idle, Opening)
                | (Opening, DeviceOpen)
                | (Opening, Stopping)
                | (Opening, Error)
                | (DeviceOpen, Configuring)
                | (DeviceOpen, Stopping)
                | (DeviceOpen, Error)
                | (Configuring, Recording)
                | (Configuring, Stopping)
                | (Configuring, Error)
                | (Recording, Stopping)
                | (Recording, Error)
                | (Stopping, Idle)
                | (Error, Idle)
        )
    }
}

impl fmt::Display for CaptureState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Point-in-time view of the controller
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub state: CaptureState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub facing: Option<Facing>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_name: Option<String>,
    /// False when the requested facing was missing and another camera was used
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exact_match: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use CaptureState::*;

    #[test]
    fn test_happy_path_transitions() {
        let path = [Idle, Opening, DeviceOpen, Configuring, Recording, Stopping, Idle];
        for pair in path.windows(2) {
            assert!(pair[0].can_transition_to(pair[1]), "{} -> {}", pair[0], pair[1]);
        }
    }

    #[test]
    fn test_error_drains_to_idle_only() {
        for state in [Opening, DeviceOpen, Configuring, Recording] {
            assert!(state.can_transition_to(Error));
        }
        assert!(!Idle.can_transition_to(Error));
        assert!(Error.can_transition_to(Idle));
        assert!(!Error.can_transition_to(Opening));
        assert!(!Recording.can_transition_to(Opening));
    }

    #[test]
    fn test_snapshot_wire_shape() {
        let idle = serde_json::to_value(StatusSnapshot::default()).unwrap();
        assert_eq!(idle, serde_json::json!({ "state": "Idle" }));
    }
}

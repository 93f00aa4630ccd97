//! Capture controller - single owner of the capture session state machine

mod engine;
mod state;

pub use engine::{create_controller_channels, CaptureController, CapturePipeline};
pub use state::{CaptureState, StatusSnapshot};

use std::path::PathBuf;
use tokio::sync::oneshot;
use uuid::Uuid;

use crate::capture::{CaptureErrorKind, CaptureResult, RecordingRequest};

/// Reply channel for a controller command
pub type Reply<T> = oneshot::Sender<T>;

/// Commands that can be sent to the controller
#[derive(Debug)]
pub enum ControllerCommand {
    /// Start recording; replied once recording began or the attempt was torn down
    Start {
        request: RecordingRequest,
        reply: Reply<CaptureResult<()>>,
    },
    /// Stop recording; replied once the session is back to Idle
    Stop { reply: Reply<CaptureResult<()>> },
    /// Snapshot the current state
    Status { reply: Reply<StatusSnapshot> },
    /// Stop any session and exit the controller loop
    Shutdown,
}

/// Status updates from the controller
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControllerStatus {
    StateChanged {
        state: CaptureState,
        session_id: Option<Uuid>,
    },
    /// The encoder stopped and flushed; the file is complete
    RecordingFinished { session_id: Uuid, path: PathBuf },
    /// A session ended because of an error
    Failed {
        session_id: Uuid,
        kind: CaptureErrorKind,
        message: String,
    },
}

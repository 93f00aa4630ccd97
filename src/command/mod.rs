//! Command interface
//!
//! The thin boundary the UI layer talks to. Every call sends one command to
//! the capture controller and awaits its reply; no camera work happens on
//! the caller's task.

#[cfg(unix)]
mod server;

#[cfg(unix)]
pub use server::{send_request, CommandServer};

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, warn};

use crate::capture::{CaptureError, CaptureResult, Facing, RecordingRequest};
use crate::controller::{ControllerCommand, ControllerStatus, StatusSnapshot};

/// Handle for issuing capture commands; cheap to clone
#[derive(Clone)]
pub struct CommandInterface {
    cmd_tx: mpsc::Sender<ControllerCommand>,
    status_tx: broadcast::Sender<ControllerStatus>,
    /// Used when a wire request names no camera
    default_facing: Facing,
}

fn controller_gone() -> CaptureError {
    CaptureError::DeviceUnavailable("capture service is not running".to_string())
}

impl CommandInterface {
    pub fn new(
        cmd_tx: mpsc::Sender<ControllerCommand>,
        status_tx: broadcast::Sender<ControllerStatus>,
    ) -> Self {
        Self {
            cmd_tx,
            status_tx,
            default_facing: Facing::default(),
        }
    }

    pub fn with_default_facing(mut self, facing: Facing) -> Self {
        self.default_facing = facing;
        self
    }

    pub async fn start_capture(&self, facing: Facing) -> CaptureResult<()> {
        self.start(RecordingRequest::new(facing)).await
    }

    /// Resolves once recording has begun, or with the error that ended the attempt
    pub async fn start(&self, request: RecordingRequest) -> CaptureResult<()> {
        let (reply, rx) = oneshot::channel();
        self.send(ControllerCommand::Start { request, reply }).await?;
        rx.await.map_err(|_| controller_gone())?
    }

    /// Resolves once the session is back to Idle. Stopping an idle service succeeds.
    pub async fn stop_capture(&self) -> CaptureResult<()> {
        let (reply, rx) = oneshot::channel();
        self.send(ControllerCommand::Stop { reply }).await?;
        match rx.await.map_err(|_| controller_gone())? {
            Err(CaptureError::NotRecording) => Ok(()),
            other => other,
        }
    }

    pub async fn status(&self) -> CaptureResult<StatusSnapshot> {
        let (reply, rx) = oneshot::channel();
        self.send(ControllerCommand::Status { reply }).await?;
        rx.await.map_err(|_| controller_gone())
    }

    /// Subscribe to state changes and recording results
    pub fn subscribe(&self) -> broadcast::Receiver<ControllerStatus> {
        self.status_tx.subscribe()
    }

    /// Ask the controller to stop any session and exit
    pub async fn shutdown(&self) {
        if self.cmd_tx.send(ControllerCommand::Shutdown).await.is_err() {
            debug!("Controller already stopped");
        }
    }

    async fn send(&self, cmd: ControllerCommand) -> CaptureResult<()> {
        self.cmd_tx.send(cmd).await.map_err(|_| controller_gone())
    }

    /// Execute one wire request
    pub async fn handle(&self, request: Request) -> Response {
        match request {
            Request::StartCapture { facing, output_dir } => {
                let request = RecordingRequest {
                    facing: facing.unwrap_or(self.default_facing),
                    output_dir,
                };
                Response::from_result(self.start(request).await)
            }
            Request::StopCapture => Response::from_result(self.stop_capture().await),
            Request::Status => match self.status().await {
                Ok(status) => Response::status(status),
                Err(e) => Response::from_error(&e),
            },
        }
    }

    /// Parse and execute one line of the control protocol
    pub async fn handle_line(&self, line: &str) -> Response {
        match serde_json::from_str::<Request>(line) {
            Ok(request) => {
                debug!("Command request: {:?}", request);
                self.handle(request).await
            }
            Err(e) => {
                warn!("Malformed command request: {}", e);
                Response::error("InvalidRequest", e.to_string())
            }
        }
    }
}

/// One request of the control protocol
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Request {
    StartCapture {
        /// Falls back to the configured default facing
        #[serde(default, skip_serializing_if = "Option::is_none")]
        facing: Option<Facing>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        output_dir: Option<PathBuf>,
    },
    StopCapture,
    Status,
}

/// Reply to a [`Request`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
    pub ok: bool,
    /// Error kind name, e.g. `AlreadyRecording`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<StatusSnapshot>,
}

impl Response {
    pub fn ok() -> Self {
        Self {
            ok: true,
            error: None,
            message: None,
            status: None,
        }
    }

    pub fn status(status: StatusSnapshot) -> Self {
        Self {
            status: Some(status),
            ..Self::ok()
        }
    }

    pub fn error(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            ok: false,
            error: Some(kind.into()),
            message: Some(message.into()),
            status: None,
        }
    }

    pub fn from_error(err: &CaptureError) -> Self {
        Self::error(format!("{:?}", err.kind()), err.to_string())
    }

    pub fn from_result(result: CaptureResult<()>) -> Self {
        match result {
            Ok(()) => Self::ok(),
            Err(e) => Self::from_error(&e),
        }
    }
}

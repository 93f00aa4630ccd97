//! Capture controller
//!
//! A single-writer actor that owns the capture session. Commands arrive on
//! an mpsc channel and are answered through oneshot replies. Every hardware
//! step (acquire, configure, teardown) runs in its own task that takes the
//! handles it needs and hands them back in its outcome message, so at most
//! one transition is in flight and the actor loop never blocks on hardware.
//!
//! Device notifications from the camera worker are tagged with the session
//! that opened the device and land on their own FIFO channel.

use anyhow::Result;
use chrono::{DateTime, Local, Utc};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::{CaptureState, ControllerCommand, ControllerStatus, Reply, StatusSnapshot};
use crate::capture::{
    CameraDevice, CaptureError, CaptureResult, DeviceAcquisition, DeviceEvent, DeviceEventSender,
    DeviceSelection, Facing, RecordingRequest, SessionHandle, SessionManager,
};
use crate::encoder::{prepare_output_path, EncoderWriter, PreparedEncoder};
use crate::liveness::{LivenessGuard, LivenessToken};

/// The components the controller orchestrates
pub struct CapturePipeline {
    pub acquisition: DeviceAcquisition,
    pub sessions: SessionManager,
    pub encoder: EncoderWriter,
    pub liveness: LivenessGuard,
    /// Where recordings go when the request carries no directory hint
    pub output_dir: PathBuf,
}

/// Handles owned by a session. Moved into a step task and returned with its outcome.
#[derive(Default)]
struct SessionResources {
    token: Option<LivenessToken>,
    device: Option<Box<dyn CameraDevice>>,
    session: Option<SessionHandle>,
    encoder: Option<Box<dyn PreparedEncoder>>,
}

enum StepOutcome {
    Acquired {
        session_id: Uuid,
        resources: SessionResources,
        result: CaptureResult<DeviceSelection>,
    },
    Configured {
        session_id: Uuid,
        resources: SessionResources,
        result: CaptureResult<PathBuf>,
    },
    TornDown {
        session_id: Uuid,
        /// Set when a started encoder stopped cleanly
        finished: Option<PathBuf>,
    },
    /// The step task panicked; its handles were dropped with it
    Aborted { session_id: Uuid, step: &'static str },
}

struct CaptureSession {
    id: Uuid,
    request: RecordingRequest,
    started_at: DateTime<Local>,
    resources: SessionResources,
    selection: Option<DeviceSelection>,
    output_path: Option<PathBuf>,
    /// Caller of `start()`, answered on Recording or after teardown
    pending_start: Option<Reply<CaptureResult<()>>>,
    /// Callers of `stop()`, answered when the session reaches Idle
    stop_waiters: Vec<Reply<CaptureResult<()>>>,
    stop_requested: bool,
    /// Device fault seen while a step was in flight
    fault: Option<CaptureError>,
    /// Error reported to the start caller and broadcast after teardown
    failure: Option<CaptureError>,
    finished: Option<PathBuf>,
}

impl CaptureSession {
    fn new(request: RecordingRequest, reply: Reply<CaptureResult<()>>) -> Self {
        Self {
            id: Uuid::new_v4(),
            request,
            started_at: Local::now(),
            resources: SessionResources::default(),
            selection: None,
            output_path: None,
            pending_start: Some(reply),
            stop_waiters: Vec::new(),
            stop_requested: false,
            fault: None,
            failure: None,
            finished: None,
        }
    }
}

/// The capture controller owns the session state machine
pub struct CaptureController {
    pipeline: Arc<CapturePipeline>,
    /// Command receiver
    cmd_rx: mpsc::Receiver<ControllerCommand>,
    /// Status broadcaster
    status_tx: broadcast::Sender<ControllerStatus>,
    step_tx: mpsc::UnboundedSender<StepOutcome>,
    step_rx: mpsc::UnboundedReceiver<StepOutcome>,
    device_tx: mpsc::UnboundedSender<(Uuid, DeviceEvent)>,
    device_rx: mpsc::UnboundedReceiver<(Uuid, DeviceEvent)>,
    state: CaptureState,
    session: Option<CaptureSession>,
    shutting_down: bool,
}

impl CaptureController {
    pub fn new(
        pipeline: CapturePipeline,
        cmd_rx: mpsc::Receiver<ControllerCommand>,
        status_tx: broadcast::Sender<ControllerStatus>,
    ) -> Self {
        let (step_tx, step_rx) = mpsc::unbounded_channel();
        let (device_tx, device_rx) = mpsc::unbounded_channel();

        Self {
            pipeline: Arc::new(pipeline),
            cmd_rx,
            status_tx,
            step_tx,
            step_rx,
            device_tx,
            device_rx,
            state: CaptureState::Idle,
            session: None,
            shutting_down: false,
        }
    }

    /// Run the controller loop until shutdown
    pub async fn run(&mut self) -> Result<()> {
        info!(
            "Capture controller starting (camera: {}, output: {:?})",
            self.pipeline.acquisition.backend_name(),
            self.pipeline.output_dir
        );

        // Broadcast initial status
        let _ = self.status_tx.send(ControllerStatus::StateChanged {
            state: self.state,
            session_id: None,
        });

        let mut commands_open = true;
        loop {
            if self.shutting_down && self.session.is_none() {
                break;
            }

            tokio::select! {
                cmd = self.cmd_rx.recv(), if commands_open => {
                    match cmd {
                        Some(cmd) => self.handle_command(cmd),
                        None => {
                            info!("Command channel closed");
                            commands_open = false;
                            self.begin_shutdown();
                        }
                    }
                }

                Some(outcome) = self.step_rx.recv() => {
                    self.handle_step(outcome);
                }

                Some((session_id, event)) = self.device_rx.recv() => {
                    self.handle_device_event(session_id, event);
                }
            }
        }

        info!("Capture controller stopped");
        Ok(())
    }

    fn handle_command(&mut self, cmd: ControllerCommand) {
        match cmd {
            ControllerCommand::Start { request, reply } => self.start(request, reply),
            ControllerCommand::Stop { reply } => self.request_stop(Some(reply)),
            ControllerCommand::Status { reply } => {
                let _ = reply.send(self.snapshot());
            }
            ControllerCommand::Shutdown => {
                info!("Shutdown command received");
                self.begin_shutdown();
            }
        }
    }

    fn start(&mut self, request: RecordingRequest, reply: Reply<CaptureResult<()>>) {
        if let Some(session) = &self.session {
            debug!("Rejecting start: session {} is {}", session.id, self.state);
            let _ = reply.send(Err(CaptureError::AlreadyRecording));
            return;
        }
        if self.shutting_down {
            let _ = reply.send(Err(CaptureError::DeviceUnavailable(
                "capture service is shutting down".to_string(),
            )));
            return;
        }

        let facing = request.facing;
        let session = CaptureSession::new(request, reply);
        let session_id = session.id;
        info!("Starting capture session {} ({} camera)", session_id, facing);

        self.session = Some(session);
        self.set_state(CaptureState::Opening);
        self.spawn_acquire(session_id, facing);
    }

    /// Stop now, defer until the in-flight step resolves, or join a teardown
    fn request_stop(&mut self, reply: Option<Reply<CaptureResult<()>>>) {
        let state = self.state;
        let Some(session) = self.session.as_mut() else {
            debug!("Stop while idle");
            if let Some(reply) = reply {
                let _ = reply.send(Ok(()));
            }
            return;
        };

        if let Some(reply) = reply {
            session.stop_waiters.push(reply);
        }

        match state {
            CaptureState::Opening | CaptureState::DeviceOpen | CaptureState::Configuring => {
                if !session.stop_requested {
                    info!(
                        "Stop requested while {}, deferring until session {} settles",
                        state, session.id
                    );
                }
                session.stop_requested = true;
            }
            CaptureState::Recording => {
                info!("Stopping capture session {}", session.id);
                self.begin_teardown(CaptureState::Stopping);
            }
            _ => debug!("Stop joins the teardown of session {}", session.id),
        }
    }

    fn begin_shutdown(&mut self) {
        self.shutting_down = true;
        if self.session.is_some() {
            self.request_stop(None);
        }
    }

    fn handle_step(&mut self, outcome: StepOutcome) {
        match outcome {
            StepOutcome::Acquired {
                session_id,
                resources,
                result,
            } => {
                let Some(session) = self.current_session(session_id) else {
                    orphan(resources);
                    return;
                };
                session.resources = resources;

                match result {
                    Err(e) => self.fail(e),
                    Ok(selection) => {
                        session.selection = Some(selection);
                        if let Some(fault) = session.fault.take() {
                            self.fail(fault);
                        } else if session.stop_requested {
                            self.begin_teardown(CaptureState::Stopping);
                        } else {
                            self.set_state(CaptureState::DeviceOpen);
                            self.set_state(CaptureState::Configuring);
                            self.spawn_configure();
                        }
                    }
                }
            }

            StepOutcome::Configured {
                session_id,
                resources,
                result,
            } => {
                let Some(session) = self.current_session(session_id) else {
                    orphan(resources);
                    return;
                };
                session.resources = resources;

                match result {
                    Err(e) => self.fail(e),
                    Ok(path) => {
                        session.output_path = Some(path);
                        if let Some(fault) = session.fault.take() {
                            self.fail(fault);
                        } else if session.stop_requested {
                            self.begin_teardown(CaptureState::Stopping);
                        } else {
                            if let Some(handle) = &session.resources.session {
                                info!(
                                    "Session {} recording {} to {:?}",
                                    session.id,
                                    handle.format(),
                                    session.output_path
                                );
                            }
                            let reply = session.pending_start.take();
                            self.set_state(CaptureState::Recording);
                            if let Some(reply) = reply {
                                let _ = reply.send(Ok(()));
                            }
                        }
                    }
                }
            }

            StepOutcome::TornDown {
                session_id,
                finished,
            } => {
                let Some(session) = self.current_session(session_id) else {
                    return;
                };
                session.finished = finished;
                self.finish_session();
            }

            StepOutcome::Aborted { session_id, step } => {
                let Some(session) = self.current_session(session_id) else {
                    return;
                };
                session
                    .failure
                    .get_or_insert(CaptureError::DeviceUnavailable(format!(
                        "capture {} step aborted",
                        step
                    )));
                if self.state.is_acquiring() {
                    self.set_state(CaptureState::Error);
                }
                self.finish_session();
            }
        }
    }

    fn handle_device_event(&mut self, session_id: Uuid, event: DeviceEvent) {
        let state = self.state;
        let Some(session) = self.session.as_mut().filter(|s| s.id == session_id) else {
            debug!("Ignoring {:?} from an earlier session", event);
            return;
        };

        let Some(err) = event.as_error() else {
            debug!("Device event for session {}: {:?}", session_id, event);
            return;
        };

        match state {
            CaptureState::Recording => {
                warn!("{:?} while recording", event);
                self.fail(err);
            }
            CaptureState::Opening | CaptureState::DeviceOpen | CaptureState::Configuring => {
                warn!("{:?} while {}, failing once the step resolves", event, state);
                session.fault.get_or_insert(err);
            }
            _ => debug!("Ignoring {:?} during teardown", event),
        }
    }

    fn current_session(&mut self, session_id: Uuid) -> Option<&mut CaptureSession> {
        let session = self.session.as_mut().filter(|s| s.id == session_id);
        if session.is_none() {
            error!("Step outcome for unknown session {}", session_id);
        }
        session
    }

    fn fail(&mut self, err: CaptureError) {
        let state = self.state;
        let Some(session) = self.session.as_mut() else {
            return;
        };
        error!("Capture session {} failed while {}: {}", session.id, state, err);
        session.failure.get_or_insert(err);
        self.begin_teardown(CaptureState::Error);
    }

    /// Enter Stopping or Error and release everything in reverse order
    fn begin_teardown(&mut self, next: CaptureState) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        let session_id = session.id;
        let resources = std::mem::take(&mut session.resources);

        self.set_state(next);
        self.spawn_step(session_id, "teardown", async move {
            let finished = release_resources(resources).await;
            StepOutcome::TornDown {
                session_id,
                finished,
            }
        });
    }

    /// Teardown finished: back to Idle, then answer everyone waiting
    fn finish_session(&mut self) {
        let Some(mut session) = self.session.take() else {
            return;
        };

        if let Some(err) = &session.failure {
            let _ = self.status_tx.send(ControllerStatus::Failed {
                session_id: session.id,
                kind: err.kind(),
                message: err.to_string(),
            });
        }
        if let Some(path) = session.finished.take() {
            info!("Recording {} finished: {:?}", session.id, path);
            let _ = self.status_tx.send(ControllerStatus::RecordingFinished {
                session_id: session.id,
                path,
            });
        }

        self.set_state(CaptureState::Idle);
        info!("Capture session {} ended", session.id);

        if let Some(reply) = session.pending_start.take() {
            let result = match session.failure.take() {
                Some(err) => Err(err),
                None => Err(CaptureError::Cancelled),
            };
            let _ = reply.send(result);
        }
        for waiter in session.stop_waiters.drain(..) {
            let _ = waiter.send(Ok(()));
        }
    }

    fn set_state(&mut self, next: CaptureState) {
        if !self.state.can_transition_to(next) {
            warn!("Unexpected state transition {} -> {}", self.state, next);
        }
        debug!("State {} -> {}", self.state, next);
        self.state = next;

        let _ = self.status_tx.send(ControllerStatus::StateChanged {
            state: next,
            session_id: self.session.as_ref().map(|s| s.id),
        });
    }

    fn snapshot(&self) -> StatusSnapshot {
        let Some(session) = &self.session else {
            return StatusSnapshot {
                state: self.state,
                ..StatusSnapshot::default()
            };
        };

        let descriptor = session.selection.as_ref().map(|s| &s.descriptor);
        StatusSnapshot {
            state: self.state,
            session_id: Some(session.id),
            facing: Some(session.request.facing),
            device_id: descriptor.map(|d| d.id.clone()),
            device_name: descriptor.map(|d| d.name.clone()),
            exact_match: session.selection.as_ref().map(|s| s.exact_match),
            output_path: session.output_path.clone(),
            started_at: Some(session.started_at.with_timezone(&Utc)),
        }
    }

    fn spawn_acquire(&self, session_id: Uuid, facing: Facing) {
        let pipeline = self.pipeline.clone();
        let events = forward_device_events(session_id, self.device_tx.clone());

        self.spawn_step(session_id, "acquire", async move {
            let mut resources = SessionResources {
                token: Some(pipeline.liveness.acquire(session_id).await),
                ..SessionResources::default()
            };

            let result = match pipeline.acquisition.open(facing, events).await {
                Ok((device, selection)) => {
                    resources.device = Some(device);
                    Ok(selection)
                }
                Err(e) => Err(e),
            };

            StepOutcome::Acquired {
                session_id,
                resources,
                result,
            }
        });
    }

    fn spawn_configure(&mut self) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        let session_id = session.id;
        let started_at = session.started_at;
        let mut resources = std::mem::take(&mut session.resources);
        let pipeline = self.pipeline.clone();
        let output_dir = session
            .request
            .output_dir
            .clone()
            .unwrap_or_else(|| pipeline.output_dir.clone());

        self.spawn_step(session_id, "configure", async move {
            let result =
                configure_pipeline(&pipeline, &mut resources, session_id, started_at, &output_dir)
                    .await;
            StepOutcome::Configured {
                session_id,
                resources,
                result,
            }
        });
    }

    /// Run a lifecycle step; a panicking step still reports back
    fn spawn_step<F>(&self, session_id: Uuid, step: &'static str, fut: F)
    where
        F: Future<Output = StepOutcome> + Send + 'static,
    {
        let step_tx = self.step_tx.clone();
        let task = tokio::spawn(fut);
        tokio::spawn(async move {
            let outcome = match task.await {
                Ok(outcome) => outcome,
                Err(e) => {
                    error!("Capture {} step for session {} failed: {}", step, session_id, e);
                    StepOutcome::Aborted { session_id, step }
                }
            };
            let _ = step_tx.send(outcome);
        });
    }
}

/// Negotiate the stream, prepare the encoder, bind the session, start encoding.
/// Handles acquired along the way stay in `resources` even on failure.
async fn configure_pipeline(
    pipeline: &CapturePipeline,
    resources: &mut SessionResources,
    session_id: Uuid,
    started_at: DateTime<Local>,
    output_dir: &Path,
) -> CaptureResult<PathBuf> {
    let device = resources
        .device
        .as_mut()
        .ok_or_else(|| CaptureError::DeviceUnavailable("no open device".to_string()))?;

    let format = pipeline.sessions.negotiate(device.descriptor())?;

    let container = pipeline.encoder.config().container;
    let dir = output_dir.to_path_buf();
    let path = tokio::task::spawn_blocking(move || {
        prepare_output_path(&dir, started_at, &session_id, container)
    })
    .await
    .map_err(|e| CaptureError::EncoderFailure(format!("output path task failed: {}", e)))??;

    let encoder = resources
        .encoder
        .insert(pipeline.encoder.prepare(format, path.clone()).await?);

    let session = pipeline
        .sessions
        .configure(device.as_mut(), encoder.input_surface())
        .await?;
    resources.session = Some(session);

    encoder.start().await.map_err(|e| match e {
        CaptureError::EncoderFailure(_) => e,
        other => CaptureError::EncoderFailure(other.to_string()),
    })?;

    Ok(path)
}

/// Encoder stop, session close, device close, liveness release.
/// Failures are logged and never skip the remaining steps.
async fn release_resources(resources: SessionResources) -> Option<PathBuf> {
    let SessionResources {
        token,
        device,
        session,
        encoder,
    } = resources;
    let mut finished = None;

    if let Some(mut encoder) = encoder {
        let started = encoder.is_started();
        let path = encoder.output_path().to_path_buf();
        match encoder.stop().await {
            Ok(()) if started => finished = Some(path),
            Ok(()) => debug!("Encoder for {:?} never started, output discarded", path),
            Err(e) => warn!("Encoder stop failed for {:?}: {}", path, e),
        }
    }
    if let Some(mut session) = session {
        session.close().await;
    }
    if let Some(mut device) = device {
        device.close().await;
    }
    if let Some(mut token) = token {
        debug!("Releasing liveness for session {}", token.session_id());
        token.release().await;
    }

    finished
}

/// Release handles that came back for a session the controller no longer tracks
fn orphan(resources: SessionResources) {
    tokio::spawn(async move {
        release_resources(resources).await;
    });
}

/// Per-session sender whose events reach the controller tagged with `session_id`
fn forward_device_events(
    session_id: Uuid,
    device_tx: mpsc::UnboundedSender<(Uuid, DeviceEvent)>,
) -> DeviceEventSender {
    let (tx, mut rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            if device_tx.send((session_id, event)).is_err() {
                break;
            }
        }
    });
    tx
}

/// Create channels for controller communication
pub fn create_controller_channels() -> (
    mpsc::Sender<ControllerCommand>,
    mpsc::Receiver<ControllerCommand>,
    broadcast::Sender<ControllerStatus>,
    broadcast::Receiver<ControllerStatus>,
) {
    let (cmd_tx, cmd_rx) = mpsc::channel(32);
    let (status_tx, status_rx) = broadcast::channel(64);
    (cmd_tx, cmd_rx, status_tx, status_rx)
}

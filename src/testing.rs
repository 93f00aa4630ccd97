//! Fake camera, encoder and liveness backends with counters and failure injection.
//! Fakes built with a shared [`CallLog`] also record the order of hardware calls.

use async_trait::async_trait;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

use crate::capture::{
    CameraBackend, CameraDevice, CapabilitySummary, CaptureError, CaptureResult,
    ConfiguredSession, DeviceDescriptor, DeviceEvent, DeviceEventSender, Facing, Forwarded,
    FrameForwarder, PixelFormat, Resolution, StreamFormat,
};
use crate::encoder::{
    AudioSource, EncoderBackend, EncoderCapabilities, EncoderSettings, FrameSink, InputSurface,
    PreparedEncoder, VideoCodec,
};
use crate::liveness::{IndicatorHandle, IndicatorSpec, LivenessBackend, WakeLock};

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap()
}

fn count(counter: &AtomicUsize) -> usize {
    counter.load(Ordering::SeqCst)
}

fn bump(counter: &AtomicUsize) {
    counter.fetch_add(1, Ordering::SeqCst);
}

/// Ordered record of calls across every fake sharing it
#[derive(Clone, Default)]
pub(crate) struct CallLog(Arc<Mutex<Vec<&'static str>>>);

impl CallLog {
    fn record(&self, call: &'static str) {
        lock(&self.0).push(call);
    }

    pub fn calls(&self) -> Vec<&'static str> {
        lock(&self.0).clone()
    }
}

/// A 720p YUYV/MJPEG camera descriptor
pub(crate) fn descriptor(id: &str, facing: Facing) -> DeviceDescriptor {
    DeviceDescriptor {
        id: id.to_string(),
        name: format!("Fake {} camera", facing),
        facing,
        capabilities: CapabilitySummary {
            pixel_formats: vec![PixelFormat::Yuyv, PixelFormat::Mjpeg],
            resolutions: vec![Resolution::new(640, 480), Resolution::new(1280, 720)],
            min_fps: 5,
            max_fps: 30,
        },
        path: id.into(),
    }
}

/// Sink that accepts and discards every frame
pub(crate) struct NullSink;

impl FrameSink for NullSink {
    fn submit(&self, _frame: &[u8]) -> std::io::Result<bool> {
        Ok(true)
    }
}

// ---------------------------------------------------------------------------
// Camera
// ---------------------------------------------------------------------------

#[derive(Default)]
pub(crate) struct CameraCounters {
    open_attempts: AtomicUsize,
    opened: AtomicUsize,
    devices_closed: AtomicUsize,
    sessions_created: AtomicUsize,
    sessions_closed: AtomicUsize,
    streaming_started: AtomicUsize,
    streaming_stopped: AtomicUsize,
}

impl CameraCounters {
    pub fn open_attempts(&self) -> usize {
        count(&self.open_attempts)
    }

    pub fn opened(&self) -> usize {
        count(&self.opened)
    }

    pub fn held_devices(&self) -> usize {
        self.opened() - count(&self.devices_closed)
    }

    pub fn held_sessions(&self) -> usize {
        count(&self.sessions_created) - self.sessions_closed()
    }

    pub fn sessions_closed(&self) -> usize {
        count(&self.sessions_closed)
    }

    pub fn streaming(&self) -> usize {
        count(&self.streaming_started) - count(&self.streaming_stopped)
    }
}

#[derive(Default)]
struct CameraState {
    devices: Mutex<Vec<DeviceDescriptor>>,
    counters: Arc<CameraCounters>,
    open_error: Mutex<Option<CaptureError>>,
    session_error: Mutex<Option<CaptureError>>,
    fail_repeating: AtomicBool,
    open_gate: Mutex<Option<Arc<Notify>>>,
    events: Mutex<Option<(String, DeviceEventSender)>>,
    /// Frame path of the streaming session
    forwarder: Mutex<Option<FrameForwarder>>,
    log: CallLog,
}

#[derive(Clone, Default)]
pub(crate) struct FakeCamera {
    state: Arc<CameraState>,
}

impl FakeCamera {
    pub fn with_devices(devices: Vec<DeviceDescriptor>) -> Self {
        Self::logged(devices, CallLog::default())
    }

    pub fn logged(devices: Vec<DeviceDescriptor>, log: CallLog) -> Self {
        Self {
            state: Arc::new(CameraState {
                devices: Mutex::new(devices),
                log,
                ..CameraState::default()
            }),
        }
    }

    pub fn counters(&self) -> Arc<CameraCounters> {
        self.state.counters.clone()
    }

    pub fn fail_open(&self, err: CaptureError) {
        *lock(&self.state.open_error) = Some(err);
    }

    pub fn fail_session(&self, err: CaptureError) {
        *lock(&self.state.session_error) = Some(err);
    }

    pub fn fail_repeating_request(&self) {
        self.state.fail_repeating.store(true, Ordering::SeqCst);
    }

    /// Block `open()` until the returned gate is notified
    pub fn hold_open(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *lock(&self.state.open_gate) = Some(gate.clone());
        gate
    }

    /// Deliver a notification for the most recently opened device
    pub fn emit(&self, make: impl FnOnce(String) -> DeviceEvent) {
        let guard = lock(&self.state.events);
        let (id, tx) = guard.as_ref().expect("no device opened yet");
        tx.send(make(id.clone())).unwrap();
    }

    /// Push one frame through the streaming session, like a capture worker would
    pub fn deliver_frame(&self) -> Option<Forwarded> {
        lock(&self.state.forwarder)
            .as_mut()
            .map(|forwarder| forwarder.forward(&[0u8; 32]))
    }
}

#[async_trait]
impl CameraBackend for FakeCamera {
    fn name(&self) -> &'static str {
        "fake"
    }

    async fn enumerate(&self) -> CaptureResult<Vec<DeviceDescriptor>> {
        Ok(lock(&self.state.devices).clone())
    }

    async fn open(
        &self,
        descriptor: &DeviceDescriptor,
        events: DeviceEventSender,
    ) -> CaptureResult<Box<dyn CameraDevice>> {
        bump(&self.state.counters.open_attempts);

        let gate = lock(&self.state.open_gate).take();
        if let Some(gate) = gate {
            gate.notified().await;
        }

        if let Some(err) = lock(&self.state.open_error).clone() {
            return Err(err);
        }

        bump(&self.state.counters.opened);
        self.state.log.record("device open");
        let _ = events.send(DeviceEvent::Opened {
            device_id: descriptor.id.clone(),
        });
        *lock(&self.state.events) = Some((descriptor.id.clone(), events));

        Ok(Box::new(FakeDevice {
            descriptor: descriptor.clone(),
            state: self.state.clone(),
            closed: false,
        }))
    }
}

struct FakeDevice {
    descriptor: DeviceDescriptor,
    state: Arc<CameraState>,
    closed: bool,
}

#[async_trait]
impl CameraDevice for FakeDevice {
    fn descriptor(&self) -> &DeviceDescriptor {
        &self.descriptor
    }

    async fn create_session(
        &mut self,
        _format: StreamFormat,
        surface: InputSurface,
    ) -> CaptureResult<Box<dyn ConfiguredSession>> {
        if let Some(err) = lock(&self.state.session_error).clone() {
            return Err(err);
        }

        bump(&self.state.counters.sessions_created);
        self.state.log.record("session configure");
        Ok(Box::new(FakeSession {
            state: self.state.clone(),
            device_id: self.descriptor.id.clone(),
            surface,
            streaming: false,
            closed: false,
            frames: AtomicU64::new(0),
        }))
    }

    async fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            bump(&self.state.counters.devices_closed);
            self.state.log.record("device close");
        }
    }
}

struct FakeSession {
    state: Arc<CameraState>,
    device_id: String,
    surface: InputSurface,
    streaming: bool,
    closed: bool,
    frames: AtomicU64,
}

#[async_trait]
impl ConfiguredSession for FakeSession {
    async fn set_repeating_request(&mut self) -> CaptureResult<()> {
        if self.state.fail_repeating.load(Ordering::SeqCst) {
            return Err(CaptureError::ConfigurationFailed(
                "injected repeating request failure".to_string(),
            ));
        }

        self.streaming = true;
        bump(&self.state.counters.streaming_started);
        self.state.log.record("repeating request");
        if let Ok(true) = self.surface.submit(&[0u8; 32]) {
            self.frames.fetch_add(1, Ordering::SeqCst);
        }

        let events = lock(&self.state.events).as_ref().map(|(_, tx)| tx.clone());
        if let Some(events) = events {
            let forwarder = FrameForwarder::new(self.device_id.clone(), self.surface.clone(), events);
            *lock(&self.state.forwarder) = Some(forwarder);
        }
        Ok(())
    }

    async fn stop_repeating(&mut self) {
        if self.streaming {
            self.streaming = false;
            bump(&self.state.counters.streaming_stopped);
            lock(&self.state.forwarder).take();
        }
    }

    async fn close(&mut self) {
        self.stop_repeating().await;
        if !self.closed {
            self.closed = true;
            bump(&self.state.counters.sessions_closed);
            self.state.log.record("session close");
        }
    }

    fn frames_delivered(&self) -> u64 {
        self.frames.load(Ordering::SeqCst)
    }
}

// ---------------------------------------------------------------------------
// Encoder
// ---------------------------------------------------------------------------

#[derive(Default)]
pub(crate) struct EncoderCounters {
    prepared: AtomicUsize,
    started: AtomicUsize,
    stopped: AtomicUsize,
    discarded: AtomicUsize,
}

impl EncoderCounters {
    pub fn prepared(&self) -> usize {
        count(&self.prepared)
    }

    pub fn started(&self) -> usize {
        count(&self.started)
    }

    pub fn discarded(&self) -> usize {
        count(&self.discarded)
    }

    /// Prepared encoders that were neither stopped nor discarded
    pub fn held(&self) -> usize {
        self.prepared() - count(&self.stopped) - self.discarded()
    }
}

struct EncoderState {
    capabilities: Mutex<EncoderCapabilities>,
    counters: Arc<EncoderCounters>,
    prepare_error: Mutex<Option<CaptureError>>,
    start_error: Mutex<Option<CaptureError>>,
    prepare_gate: Mutex<Option<Arc<Notify>>>,
    /// Sink of the most recently prepared encoder
    sink: Mutex<Option<Arc<GatedSink>>>,
    log: CallLog,
}

#[derive(Clone)]
pub(crate) struct FakeEncoder {
    state: Arc<EncoderState>,
}

impl Default for FakeEncoder {
    fn default() -> Self {
        Self::logged(CallLog::default())
    }
}

impl FakeEncoder {
    pub fn logged(log: CallLog) -> Self {
        Self {
            state: Arc::new(EncoderState {
                capabilities: Mutex::new(EncoderCapabilities {
                    video_codecs: vec![VideoCodec::H264, VideoCodec::Mpeg4],
                    audio_sources: vec![AudioSource::Pulse],
                }),
                counters: Arc::default(),
                prepare_error: Mutex::new(None),
                start_error: Mutex::new(None),
                prepare_gate: Mutex::new(None),
                sink: Mutex::new(None),
                log,
            }),
        }
    }

    pub fn counters(&self) -> Arc<EncoderCounters> {
        self.state.counters.clone()
    }

    pub fn fail_prepare(&self, err: CaptureError) {
        *lock(&self.state.prepare_error) = Some(err);
    }

    pub fn fail_start(&self, err: CaptureError) {
        *lock(&self.state.start_error) = Some(err);
    }

    /// Block `prepare()` until the returned gate is notified
    pub fn hold_prepare(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *lock(&self.state.prepare_gate) = Some(gate.clone());
        gate
    }

    /// Make the running encoder fail like a process that died: frames get a
    /// broken pipe and stopping reports an error
    pub fn break_sink(&self) {
        if let Some(sink) = lock(&self.state.sink).as_ref() {
            sink.broken.store(true, Ordering::SeqCst);
        }
    }
}

#[async_trait]
impl EncoderBackend for FakeEncoder {
    fn name(&self) -> &'static str {
        "fake"
    }

    async fn capabilities(&self) -> EncoderCapabilities {
        lock(&self.state.capabilities).clone()
    }

    async fn prepare(&self, settings: EncoderSettings) -> CaptureResult<Box<dyn PreparedEncoder>> {
        let gate = lock(&self.state.prepare_gate).take();
        if let Some(gate) = gate {
            gate.notified().await;
        }

        if let Some(err) = lock(&self.state.prepare_error).clone() {
            return Err(err);
        }

        // Like a real muxer, the output file exists from prepare onwards
        std::fs::write(&settings.output_path, b"")
            .map_err(|e| CaptureError::EncoderFailure(e.to_string()))?;
        bump(&self.state.counters.prepared);
        self.state.log.record("encoder prepare");

        let sink = Arc::new(GatedSink::default());
        *lock(&self.state.sink) = Some(sink.clone());
        Ok(Box::new(FakePreparedEncoder {
            surface: InputSurface::new(sink.clone(), settings.input),
            sink,
            settings,
            state: self.state.clone(),
            started: false,
            finished: false,
        }))
    }
}

#[derive(Default)]
struct GatedSink {
    open: AtomicBool,
    broken: AtomicBool,
    frames: AtomicU64,
}

impl FrameSink for GatedSink {
    fn submit(&self, _frame: &[u8]) -> std::io::Result<bool> {
        if self.broken.load(Ordering::SeqCst) {
            return Err(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "encoder exited",
            ));
        }
        if !self.open.load(Ordering::SeqCst) {
            return Ok(false);
        }
        self.frames.fetch_add(1, Ordering::SeqCst);
        Ok(true)
    }
}

struct FakePreparedEncoder {
    surface: InputSurface,
    sink: Arc<GatedSink>,
    settings: EncoderSettings,
    state: Arc<EncoderState>,
    started: bool,
    finished: bool,
}

#[async_trait]
impl PreparedEncoder for FakePreparedEncoder {
    fn input_surface(&self) -> InputSurface {
        self.surface.clone()
    }

    fn output_path(&self) -> &Path {
        &self.settings.output_path
    }

    fn is_started(&self) -> bool {
        self.started
    }

    async fn start(&mut self) -> CaptureResult<()> {
        if let Some(err) = lock(&self.state.start_error).clone() {
            return Err(err);
        }
        self.started = true;
        self.sink.open.store(true, Ordering::SeqCst);
        bump(&self.state.counters.started);
        self.state.log.record("encoder start");
        Ok(())
    }

    async fn stop(&mut self) -> CaptureResult<()> {
        if self.finished {
            return Ok(());
        }
        self.finished = true;
        self.sink.open.store(false, Ordering::SeqCst);

        if !self.started {
            let _ = std::fs::remove_file(&self.settings.output_path);
            bump(&self.state.counters.discarded);
            self.state.log.record("encoder discard");
            return Ok(());
        }

        bump(&self.state.counters.stopped);
        self.state.log.record("encoder stop");
        if self.sink.broken.load(Ordering::SeqCst) {
            return Err(CaptureError::EncoderFailure("encoder exited early".to_string()));
        }
        std::fs::write(&self.settings.output_path, b"fake video")
            .map_err(|e| CaptureError::EncoderFailure(e.to_string()))?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Liveness
// ---------------------------------------------------------------------------

#[derive(Default)]
pub(crate) struct LivenessCounters {
    wake_locks_acquired: AtomicUsize,
    wake_locks_released: AtomicUsize,
    indicators_shown: AtomicUsize,
    indicators_hidden: AtomicUsize,
}

impl LivenessCounters {
    pub fn wake_locks_acquired(&self) -> usize {
        count(&self.wake_locks_acquired)
    }

    pub fn wake_locks_released(&self) -> usize {
        count(&self.wake_locks_released)
    }

    pub fn wake_locks_held(&self) -> usize {
        self.wake_locks_acquired() - self.wake_locks_released()
    }

    pub fn indicators_visible(&self) -> usize {
        count(&self.indicators_shown) - count(&self.indicators_hidden)
    }
}

#[derive(Default)]
struct LivenessState {
    counters: Arc<LivenessCounters>,
    fail_wake_lock: AtomicBool,
    fail_indicator: AtomicBool,
    log: CallLog,
}

#[derive(Clone, Default)]
pub(crate) struct FakeLiveness {
    state: Arc<LivenessState>,
}

impl FakeLiveness {
    pub fn logged(log: CallLog) -> Self {
        Self {
            state: Arc::new(LivenessState {
                log,
                ..LivenessState::default()
            }),
        }
    }

    pub fn counters(&self) -> Arc<LivenessCounters> {
        self.state.counters.clone()
    }

    pub fn fail_wake_lock(&self) {
        self.state.fail_wake_lock.store(true, Ordering::SeqCst);
    }

    pub fn fail_indicator(&self) {
        self.state.fail_indicator.store(true, Ordering::SeqCst);
    }
}

struct FakeHandle {
    state: Arc<LivenessState>,
}

#[async_trait]
impl IndicatorHandle for FakeHandle {
    async fn hide(self: Box<Self>) {
        bump(&self.state.counters.indicators_hidden);
        self.state.log.record("indicator hide");
    }
}

#[async_trait]
impl WakeLock for FakeHandle {
    async fn release(self: Box<Self>) {
        bump(&self.state.counters.wake_locks_released);
        self.state.log.record("wake lock release");
    }
}

#[async_trait]
impl LivenessBackend for FakeLiveness {
    fn name(&self) -> &'static str {
        "fake"
    }

    async fn show_indicator(&self, _spec: &IndicatorSpec) -> anyhow::Result<Box<dyn IndicatorHandle>> {
        if self.state.fail_indicator.load(Ordering::SeqCst) {
            anyhow::bail!("no notification daemon");
        }
        bump(&self.state.counters.indicators_shown);
        self.state.log.record("indicator show");
        Ok(Box::new(FakeHandle {
            state: self.state.clone(),
        }))
    }

    async fn acquire_wake_lock(&self, _reason: &str) -> anyhow::Result<Box<dyn WakeLock>> {
        if self.state.fail_wake_lock.load(Ordering::SeqCst) {
            anyhow::bail!("no inhibitor service");
        }
        bump(&self.state.counters.wake_locks_acquired);
        self.state.log.record("wake lock acquire");
        Ok(Box::new(FakeHandle {
            state: self.state.clone(),
        }))
    }
}

//! Liveness Guard
//!
//! Keeps the host visible and awake while a session exists: a resident
//! "recording in progress" indicator plus an idle/sleep inhibitor. The wake
//! lock has a hard ceiling and is dropped early (with a warning) if a
//! session outlives it. Both pieces are best-effort so headless hosts
//! without a notification daemon or logind can still record.

#[cfg(target_os = "linux")]
mod freedesktop;

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::LivenessConfig;

/// What the recording indicator shows
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndicatorSpec {
    /// Channel identity the indicator is posted under
    pub channel_id: String,
    pub title: String,
    pub body: String,
}

/// A visible indicator; hiding consumes it
#[async_trait]
pub trait IndicatorHandle: Send + Sync {
    async fn hide(self: Box<Self>);
}

/// A held wake lock; releasing consumes it
#[async_trait]
pub trait WakeLock: Send + Sync {
    async fn release(self: Box<Self>);
}

/// Platform services the guard drives
#[async_trait]
pub trait LivenessBackend: Send + Sync {
    fn name(&self) -> &'static str;

    async fn show_indicator(&self, spec: &IndicatorSpec) -> anyhow::Result<Box<dyn IndicatorHandle>>;

    async fn acquire_wake_lock(&self, reason: &str) -> anyhow::Result<Box<dyn WakeLock>>;
}

type SharedWakeLock = Arc<Mutex<Option<Box<dyn WakeLock>>>>;

/// Liveness for one capture session. Release is idempotent.
pub struct LivenessToken {
    session_id: Uuid,
    channel_id: String,
    indicator: Option<Box<dyn IndicatorHandle>>,
    wake_lock: SharedWakeLock,
    ceiling: Option<JoinHandle<()>>,
    released: bool,
}

impl LivenessToken {
    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    pub fn channel_id(&self) -> &str {
        &self.channel_id
    }

    pub fn is_released(&self) -> bool {
        self.released
    }

    /// Whether the wake lock is still held (false once the ceiling elapsed)
    pub async fn holds_wake_lock(&self) -> bool {
        self.wake_lock.lock().await.is_some()
    }

    /// Hide the indicator and release the wake lock
    pub async fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;

        if let Some(ceiling) = self.ceiling.take() {
            ceiling.abort();
        }
        if let Some(lock) = self.wake_lock.lock().await.take() {
            lock.release().await;
        }
        if let Some(indicator) = self.indicator.take() {
            indicator.hide().await;
        }
        info!("Liveness released for session {}", self.session_id);
    }
}

impl Drop for LivenessToken {
    fn drop(&mut self) {
        if !self.released {
            warn!("Liveness token for session {} dropped without release", self.session_id);
            if let Some(ceiling) = self.ceiling.take() {
                ceiling.abort();
            }
        }
    }
}

/// Issues liveness tokens
pub struct LivenessGuard {
    backend: Box<dyn LivenessBackend>,
    spec: IndicatorSpec,
    max_hold: Duration,
}

impl LivenessGuard {
    pub fn new(backend: Box<dyn LivenessBackend>, config: &LivenessConfig) -> Self {
        Self {
            backend,
            spec: IndicatorSpec {
                channel_id: config.channel_id.clone(),
                title: config.indicator_title.clone(),
                body: config.indicator_body.clone(),
            },
            max_hold: config.wake_lock_max_hold(),
        }
    }

    /// Show the indicator and take the wake lock for `session_id`
    pub async fn acquire(&self, session_id: Uuid) -> LivenessToken {
        let indicator = match self.backend.show_indicator(&self.spec).await {
            Ok(indicator) => Some(indicator),
            Err(e) => {
                warn!("Recording indicator unavailable ({}): {:#}", self.backend.name(), e);
                None
            }
        };

        let reason = format!("Recording video (session {})", session_id);
        let lock = match self.backend.acquire_wake_lock(&reason).await {
            Ok(lock) => Some(lock),
            Err(e) => {
                warn!("Wake lock unavailable ({}): {:#}", self.backend.name(), e);
                None
            }
        };

        let has_lock = lock.is_some();
        let wake_lock: SharedWakeLock = Arc::new(Mutex::new(lock));
        let ceiling = has_lock.then(|| spawn_ceiling(wake_lock.clone(), self.max_hold, session_id));

        info!(
            "Liveness acquired for session {} (indicator: {}, wake lock: {})",
            session_id,
            indicator.is_some(),
            has_lock
        );

        LivenessToken {
            session_id,
            channel_id: self.spec.channel_id.clone(),
            indicator,
            wake_lock,
            ceiling,
            released: false,
        }
    }
}

fn spawn_ceiling(wake_lock: SharedWakeLock, max_hold: Duration, session_id: Uuid) -> JoinHandle<()> {
    tokio::spawn(async move {
        tokio::time::sleep(max_hold).await;
        if let Some(lock) = wake_lock.lock().await.take() {
            warn!(
                "Wake lock for session {} reached its {:?} ceiling, releasing early",
                session_id, max_hold
            );
            lock.release().await;
        }
    })
}

/// Backend for hosts without indicator or inhibitor services
#[cfg_attr(target_os = "linux", allow(dead_code))]
pub struct NoopLivenessBackend;

#[cfg_attr(target_os = "linux", allow(dead_code))]
struct NoopHandle(&'static str);

#[async_trait]
impl IndicatorHandle for NoopHandle {
    async fn hide(self: Box<Self>) {
        debug!("{} released (no-op)", self.0);
    }
}

#[async_trait]
impl WakeLock for NoopHandle {
    async fn release(self: Box<Self>) {
        debug!("{} released (no-op)", self.0);
    }
}

#[async_trait]
impl LivenessBackend for NoopLivenessBackend {
    fn name(&self) -> &'static str {
        "noop"
    }

    async fn show_indicator(&self, spec: &IndicatorSpec) -> anyhow::Result<Box<dyn IndicatorHandle>> {
        info!("Recording indicator (no-op): {}", spec.title);
        Ok(Box::new(NoopHandle("indicator")))
    }

    async fn acquire_wake_lock(&self, _reason: &str) -> anyhow::Result<Box<dyn WakeLock>> {
        Ok(Box::new(NoopHandle("wake lock")))
    }
}

/// Create the liveness backend for the current platform
pub fn create_liveness_backend() -> Box<dyn LivenessBackend> {
    #[cfg(target_os = "linux")]
    {
        info!("Using freedesktop liveness backend");
        Box::new(freedesktop::FreedesktopLiveness::new())
    }

    #[cfg(not(target_os = "linux"))]
    {
        warn!("No liveness backend for this platform, recording without indicator or wake lock");
        Box::new(NoopLivenessBackend)
    }
}

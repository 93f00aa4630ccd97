//! Freedesktop liveness backend
//!
//! Wake lock: systemd-logind `Inhibit("sleep:idle", ..., "block")` on the
//! system bus. The inhibitor lives as long as the returned file descriptor.
//! Indicator: a resident, non-expiring desktop notification on the session
//! bus, closed when the session ends.

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use tracing::{debug, warn};
use zbus::zvariant::{OwnedFd, Value};

use super::{IndicatorHandle, IndicatorSpec, LivenessBackend, WakeLock};

const APP_NAME: &str = "backcam";

#[derive(Default)]
pub struct FreedesktopLiveness;

impl FreedesktopLiveness {
    pub fn new() -> Self {
        Self
    }
}

async fn notifications_proxy(connection: &zbus::Connection) -> zbus::Result<zbus::Proxy<'static>> {
    zbus::Proxy::new(
        connection,
        "org.freedesktop.Notifications",
        "/org/freedesktop/Notifications",
        "org.freedesktop.Notifications",
    )
    .await
}

#[async_trait]
impl LivenessBackend for FreedesktopLiveness {
    fn name(&self) -> &'static str {
        "freedesktop"
    }

    async fn show_indicator(&self, spec: &IndicatorSpec) -> Result<Box<dyn IndicatorHandle>> {
        let connection = zbus::Connection::session()
            .await
            .context("Failed to connect to session D-Bus")?;
        let proxy = notifications_proxy(&connection)
            .await
            .context("Failed to create notifications proxy")?;

        let mut hints: HashMap<&str, Value<'_>> = HashMap::new();
        hints.insert("resident", Value::from(true));
        hints.insert("urgency", Value::from(1u8));
        hints.insert("category", Value::from("device"));
        hints.insert("x-backcam-channel", Value::from(spec.channel_id.as_str()));
        let actions: Vec<&str> = Vec::new();

        let id: u32 = proxy
            .call(
                "Notify",
                &(
                    APP_NAME,
                    0u32,
                    "camera-video",
                    spec.title.as_str(),
                    spec.body.as_str(),
                    actions,
                    hints,
                    0i32,
                ),
            )
            .await
            .context("Notify call failed")?;

        debug!("Recording indicator posted as notification {}", id);
        Ok(Box::new(ResidentNotification { connection, id }))
    }

    async fn acquire_wake_lock(&self, reason: &str) -> Result<Box<dyn WakeLock>> {
        let connection = zbus::Connection::system()
            .await
            .context("Failed to connect to system D-Bus")?;
        let proxy = zbus::Proxy::new(
            &connection,
            "org.freedesktop.login1",
            "/org/freedesktop/login1",
            "org.freedesktop.login1.Manager",
        )
        .await
        .context("Failed to create logind proxy")?;

        let fd: OwnedFd = proxy
            .call("Inhibit", &("sleep:idle", APP_NAME, reason, "block"))
            .await
            .context("logind Inhibit call failed")?;

        debug!("Holding logind sleep:idle inhibitor");
        Ok(Box::new(LogindInhibitor { fd }))
    }
}

struct ResidentNotification {
    connection: zbus::Connection,
    id: u32,
}

#[async_trait]
impl IndicatorHandle for ResidentNotification {
    async fn hide(self: Box<Self>) {
        let result: zbus::Result<()> = match notifications_proxy(&self.connection).await {
            Ok(proxy) => proxy.call("CloseNotification", &(self.id,)).await,
            Err(e) => Err(e),
        };
        match result {
            Ok(()) => debug!("Closed recording indicator {}", self.id),
            Err(e) => warn!("Failed to close recording indicator {}: {}", self.id, e),
        }
    }
}

struct LogindInhibitor {
    fd: OwnedFd,
}

#[async_trait]
impl WakeLock for LogindInhibitor {
    async fn release(self: Box<Self>) {
        // Closing the descriptor ends the inhibitor
        drop(self.fd);
        debug!("Released logind inhibitor");
    }
}

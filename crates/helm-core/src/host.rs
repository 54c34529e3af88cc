//! Contract with the native host that spawns the engine and bridge processes.

use async_trait::async_trait;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::broadcast;

use helm_types::StatusPayload;

use crate::error::Result;

#[async_trait]
pub trait Host: Send + Sync {
    /// Push channel of engine status changes.
    fn subscribe_status(&self) -> broadcast::Receiver<StatusPayload>;

    /// Current status, for subscribers that attach after the last push.
    async fn engine_status(&self) -> Result<StatusPayload>;

    async fn workspace_dir(&self) -> Result<String>;

    async fn check_plugin_installed(&self) -> Result<bool>;

    async fn install_plugin(&self) -> Result<()>;

    /// Terminates a bridge process that is holding its port without serving the engine.
    async fn kill_stale_bridge(&self) -> Result<()>;
}

/// Polls until `port` can be bound on loopback. Returns whether it was released.
pub async fn wait_for_port_release(port: u16, attempts: u32, interval: Duration) -> bool {
    for attempt in 0..attempts {
        if TcpListener::bind(("127.0.0.1", port)).await.is_ok() {
            tracing::debug!(port, attempt, "port released");
            return true;
        }
        tokio::time::sleep(interval).await;
    }
    tracing::warn!(port, "port may still be in use");
    false
}

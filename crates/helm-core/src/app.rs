//! Owns the long-lived pieces of the desktop client and wires them together.

use std::path::Path;
use std::sync::Arc;

use helm_client::{BridgeProbe, HttpBridgeProbe};
use helm_observability::{
    init_process_logging, LogRingBuffer, LoggingInitInfo, ProcessKind, WorkerGuard,
};

use crate::config::HelmConfig;
use crate::error::{HelmError, Result};
use crate::host::Host;
use crate::persist::StateRepository;
use crate::store::SessionStore;
use crate::supervisor::{ConnectionSupervisor, EngineConnector, HttpConnector};

pub struct HelmApp {
    config: HelmConfig,
    store: SessionStore,
    supervisor: ConnectionSupervisor,
    logs: Arc<LogRingBuffer>,
}

impl HelmApp {
    /// Builds the app against the real HTTP engine client and bridge probe.
    pub fn new(config: HelmConfig, host: Arc<dyn Host>, repo: Arc<dyn StateRepository>) -> Result<Self> {
        config.validate()?;
        let probe = HttpBridgeProbe::new(config.bridge.health_port, config.bridge.probe_timeout())?;
        let connector = HttpConnector::new(config.engine.request_timeout());
        Ok(Self::with_parts(config, host, repo, Arc::new(connector), Arc::new(probe)))
    }

    pub fn with_parts(
        config: HelmConfig,
        host: Arc<dyn Host>,
        repo: Arc<dyn StateRepository>,
        connector: Arc<dyn EngineConnector>,
        probe: Arc<dyn BridgeProbe>,
    ) -> Self {
        let store = SessionStore::new(host.clone(), repo, config.store.clone());
        let supervisor = ConnectionSupervisor::new(&config, host, connector, probe, store.clone());
        Self {
            config,
            store,
            supervisor,
            logs: Arc::new(LogRingBuffer::default()),
        }
    }

    /// Installs desktop logging; recent lines are also kept in [`HelmApp::logs`].
    pub fn init_logging(
        &self,
        logs_dir: &Path,
        retention_days: u64,
    ) -> Result<(WorkerGuard, LoggingInitInfo)> {
        init_process_logging(
            ProcessKind::Desktop,
            logs_dir,
            retention_days,
            Some(self.logs.clone()),
        )
        .map_err(|e| HelmError::Logging(e.to_string()))
    }

    pub async fn start(&self) {
        tracing::info!(
            bridge_enabled = self.config.bridge.enabled,
            bridge_server = %self.config.bridge.server_name,
            "starting connection supervisor"
        );
        self.supervisor.start().await;
    }

    pub async fn shutdown(&self) {
        self.supervisor.stop().await;
        tracing::info!("connection supervisor stopped");
    }

    pub fn store(&self) -> &SessionStore {
        &self.store
    }

    pub fn supervisor(&self) -> &ConnectionSupervisor {
        &self.supervisor
    }

    /// Tail of recent log lines for the log viewer.
    pub fn logs(&self) -> &Arc<LogRingBuffer> {
        &self.logs
    }

    pub fn config(&self) -> &HelmConfig {
        &self.config
    }
}

//! Bridge health detection: the engine's view of the bridge first, the bridge's own
//! health endpoint second.

use std::sync::Arc;
use tokio::sync::Notify;
use tokio::time::MissedTickBehavior;

use helm_client::{BridgeProbe, EngineApi};
use helm_observability::{emit_event, ObservabilityEvent, ProcessKind};
use helm_types::{BridgeHealth, McpServerStatus};

use crate::config::BridgeConfig;
use crate::host::Host;
use crate::store::SessionStore;

pub const MSG_BRIDGE_LOST: &str = "Bridge connection lost, reconnecting";
pub const MSG_BRIDGE_STARTING: &str = "Bridge is still starting";
pub const MSG_BRIDGE_UNREACHABLE: &str = "Bridge is not reachable";
pub const MSG_EDITOR_DETACHED: &str = "Studio plugin is not connected";

/// What the engine said about the bridge entry.
enum EngineView {
    Entry(McpServerStatus),
    Missing,
    Unreachable,
}

async fn engine_view(engine: &dyn EngineApi, server_name: &str) -> EngineView {
    match engine.mcp_status().await {
        Ok(mut servers) => match servers.remove(server_name) {
            Some(status) => EngineView::Entry(status),
            None => EngineView::Missing,
        },
        Err(e) => {
            tracing::debug!("engine bridge status unavailable: {}", e);
            EngineView::Unreachable
        }
    }
}

async fn direct_probe(probe: &dyn BridgeProbe) -> BridgeHealth {
    match probe.probe().await {
        Ok(report) if report.fully_attached() => BridgeHealth::connected(),
        Ok(_) => BridgeHealth::disconnected(MSG_EDITOR_DETACHED),
        Err(e) => {
            tracing::debug!("bridge health probe failed: {}", e);
            BridgeHealth::failed(MSG_BRIDGE_UNREACHABLE)
        }
    }
}

async fn reconnect(engine: &dyn EngineApi, server_name: &str) {
    if let Err(e) = engine.mcp_connect(server_name).await {
        tracing::warn!(server = server_name, "bridge reconnect request failed: {}", e);
    }
}

/// One detection pass. Performs remediation (stale kill, reconnect) as a side effect.
pub async fn detect_bridge(
    engine: &dyn EngineApi,
    probe: &dyn BridgeProbe,
    host: &dyn Host,
    server_name: &str,
) -> BridgeHealth {
    match engine_view(engine, server_name).await {
        EngineView::Entry(McpServerStatus::Failed { error }) => {
            tracing::info!(server = server_name, error = ?error, "engine reports bridge failed");
            match probe.probe().await {
                Ok(_) => {
                    // Something answers on the bridge port but the engine lost it: stale process.
                    emit_event(
                        tracing::Level::WARN,
                        ProcessKind::Desktop,
                        ObservabilityEvent {
                            status: Some("stale"),
                            error_code: Some("bridge_port_squatted"),
                            detail: error.as_deref(),
                            ..ObservabilityEvent::new("bridge.kill_stale", "bridge")
                        },
                    );
                    if let Err(e) = host.kill_stale_bridge().await {
                        tracing::warn!("failed to kill stale bridge: {}", e);
                    }
                    reconnect(engine, server_name).await;
                    BridgeHealth::disconnected(MSG_BRIDGE_LOST)
                }
                Err(_) => {
                    reconnect(engine, server_name).await;
                    BridgeHealth::disconnected(MSG_BRIDGE_STARTING)
                }
            }
        }
        // The engine only knows its own link; attachment of the editor is the bridge's to report.
        EngineView::Entry(McpServerStatus::Connected) => direct_probe(probe).await,
        EngineView::Entry(other) => BridgeHealth::disconnected(other.label()),
        EngineView::Missing | EngineView::Unreachable => direct_probe(probe).await,
    }
}

/// Polls on the configured interval and whenever `trigger` fires. Runs until dropped.
pub(crate) async fn poll_loop(
    store: SessionStore,
    engine: Arc<dyn EngineApi>,
    probe: Arc<dyn BridgeProbe>,
    host: Arc<dyn Host>,
    config: BridgeConfig,
    trigger: Arc<Notify>,
) {
    if !config.enabled {
        store.set_bridge_health(BridgeHealth::disabled());
        std::future::pending::<()>().await;
        return;
    }

    let mut ticker = tokio::time::interval(config.poll_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = trigger.notified() => {
                tracing::debug!("out-of-band bridge probe");
            }
        }
        let health = detect_bridge(
            engine.as_ref(),
            probe.as_ref(),
            host.as_ref(),
            &config.server_name,
        )
        .await;
        store.set_bridge_health(health);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StoreConfig;
    use crate::persist::memory::MemoryRepository;
    use crate::testing::{FakeEngine, FakeHost, FakeProbe};
    use helm_client::BridgeHealthReport;
    use helm_types::BridgeStatus;
    use std::time::Duration;

    const NAME: &str = "roblox-studio";

    fn attached() -> Option<BridgeHealthReport> {
        Some(BridgeHealthReport {
            plugin_connected: true,
            server_active: true,
        })
    }

    fn failed_entry() -> McpServerStatus {
        McpServerStatus::Failed {
            error: Some("Connection closed".to_string()),
        }
    }

    #[tokio::test]
    async fn failed_entry_with_dead_port_reconnects_without_kill() {
        let engine = FakeEngine::new();
        engine.set_mcp(NAME, failed_entry());
        let host = FakeHost::with_journal(engine.journal());
        let probe = FakeProbe::new(None);

        let health = detect_bridge(&engine, &probe, &host, NAME).await;

        assert_eq!(health.status, BridgeStatus::Disconnected);
        assert!(health.error.unwrap().contains("starting"));
        assert_eq!(host.calls("kill_stale_bridge"), 0);
        assert_eq!(engine.calls("mcp_connect"), 1);
    }

    #[tokio::test]
    async fn failed_entry_with_live_port_kills_once_then_reconnects() {
        let engine = FakeEngine::new();
        engine.set_mcp(NAME, failed_entry());
        let journal = engine.journal();
        let host = FakeHost::with_journal(journal.clone());
        let probe = FakeProbe::new(Some(BridgeHealthReport::default()));

        let health = detect_bridge(&engine, &probe, &host, NAME).await;

        assert_eq!(health, BridgeHealth::disconnected(MSG_BRIDGE_LOST));
        let order: Vec<String> = journal
            .lock()
            .unwrap()
            .iter()
            .filter(|c| *c == "kill_stale_bridge" || *c == "mcp_connect")
            .cloned()
            .collect();
        assert_eq!(order, vec!["kill_stale_bridge", "mcp_connect"]);
    }

    #[tokio::test]
    async fn other_engine_states_use_their_label() {
        let engine = FakeEngine::new();
        engine.set_mcp(NAME, McpServerStatus::NeedsAuth);
        let host = FakeHost::new();
        let probe = FakeProbe::new(attached());

        let health = detect_bridge(&engine, &probe, &host, NAME).await;

        assert_eq!(health, BridgeHealth::disconnected("needs_auth"));
        assert_eq!(probe.calls(), 0);
    }

    #[tokio::test]
    async fn missing_entry_falls_back_to_direct_probe() {
        let engine = FakeEngine::new();
        let host = FakeHost::new();

        let unreachable = detect_bridge(&engine, &FakeProbe::new(None), &host, NAME).await;
        assert_eq!(unreachable.status, BridgeStatus::Failed);

        let detached = detect_bridge(
            &engine,
            &FakeProbe::new(Some(BridgeHealthReport {
                plugin_connected: false,
                server_active: true,
            })),
            &host,
            NAME,
        )
        .await;
        assert_eq!(detached, BridgeHealth::disconnected(MSG_EDITOR_DETACHED));

        let connected = detect_bridge(&engine, &FakeProbe::new(attached()), &host, NAME).await;
        assert_eq!(connected, BridgeHealth::connected());
    }

    #[tokio::test]
    async fn unreachable_engine_falls_back_to_direct_probe() {
        let engine = FakeEngine::new();
        engine.fail("mcp_status");
        let health = detect_bridge(&engine, &FakeProbe::new(attached()), &FakeHost::new(), NAME).await;
        assert_eq!(health.status, BridgeStatus::Connected);
    }

    #[tokio::test]
    async fn poll_loop_writes_store_and_honours_trigger() {
        let engine = Arc::new(FakeEngine::new());
        let host = Arc::new(FakeHost::new());
        let probe = Arc::new(FakeProbe::new(attached()));
        let store = SessionStore::new(
            host.clone(),
            Arc::new(MemoryRepository::default()),
            StoreConfig::default(),
        );
        let trigger = Arc::new(Notify::new());
        let config = BridgeConfig {
            poll_interval_ms: 60_000,
            ..Default::default()
        };

        let task = tokio::spawn(poll_loop(
            store.clone(),
            engine,
            probe.clone(),
            host,
            config,
            trigger.clone(),
        ));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(store.snapshot().bridge.status, BridgeStatus::Connected);
        assert_eq!(probe.calls(), 1);

        trigger.notify_one();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(probe.calls(), 2);
        task.abort();
    }

    #[tokio::test]
    async fn disabled_bridge_is_never_probed() {
        let engine = Arc::new(FakeEngine::new());
        let host = Arc::new(FakeHost::new());
        let probe = Arc::new(FakeProbe::new(attached()));
        let store = SessionStore::new(
            host.clone(),
            Arc::new(MemoryRepository::default()),
            StoreConfig::default(),
        );
        let config = BridgeConfig {
            enabled: false,
            ..Default::default()
        };
        let task = tokio::spawn(poll_loop(
            store.clone(),
            engine,
            probe.clone(),
            host,
            config,
            Arc::new(Notify::new()),
        ));
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(store.snapshot().bridge, BridgeHealth::disabled());
        assert_eq!(probe.calls(), 0);
        task.abort();
    }
}

//! Drives the engine client through the host's status signal: build, initialize,
//! subscribe, and rebuild when anything breaks.

use futures::StreamExt;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, watch, Mutex, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use helm_client::{BridgeProbe, EngineApi, EngineClient};
use helm_observability::{emit_event, ObservabilityEvent, ProcessKind};
use helm_types::{EngineStatus, StatusPayload};

use crate::bridge;
use crate::config::{BridgeConfig, HelmConfig, SupervisorConfig};
use crate::error::Result;
use crate::host::Host;
use crate::snapshot::StoreEffect;
use crate::store::{InitOutcome, SessionStore};

/// Builds engine clients. Split out so the supervisor can run against fakes.
pub trait EngineConnector: Send + Sync {
    fn connect(&self, port: u16, directory: &str) -> Result<Arc<dyn EngineApi>>;
}

pub struct HttpConnector {
    request_timeout: Duration,
}

impl HttpConnector {
    pub fn new(request_timeout: Duration) -> Self {
        Self { request_timeout }
    }
}

impl EngineConnector for HttpConnector {
    fn connect(&self, port: u16, directory: &str) -> Result<Arc<dyn EngineApi>> {
        let client = EngineClient::new(port, Some(directory.to_string()), self.request_timeout)?;
        Ok(Arc::new(client))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionView {
    pub status: EngineStatus,
    pub port: u16,
    pub client_present: bool,
    pub ready: bool,
    pub subscribed: bool,
    pub stream_failures: u32,
    /// Persistent banner with a manual reconnect action.
    pub degraded_notice: bool,
    pub init_error: Option<String>,
}

impl Default for ConnectionView {
    fn default() -> Self {
        Self {
            status: EngineStatus::Stopped,
            port: 0,
            client_present: false,
            ready: false,
            subscribed: false,
            stream_failures: 0,
            degraded_notice: false,
            init_error: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ConnectionNotice {
    Disconnected,
    Reconnected,
    StreamDegraded { failures: u32 },
    StreamRestored,
}

/// Remembers the previous coarse status to decide which transitions are announced.
#[derive(Debug, Default)]
struct StatusTracker {
    previous: Option<&'static str>,
    announced_disconnect: bool,
}

impl StatusTracker {
    fn observe(&mut self, status: &EngineStatus, ever_ready: bool) -> Option<ConnectionNotice> {
        let was_running = self.previous.replace(status.label()) == Some("running");
        if was_running && !status.is_running() && ever_ready {
            self.announced_disconnect = true;
            return Some(ConnectionNotice::Disconnected);
        }
        if status.is_running() && !was_running && self.announced_disconnect {
            self.announced_disconnect = false;
            return Some(ConnectionNotice::Reconnected);
        }
        None
    }
}

enum Next {
    Status(StatusPayload),
    Rebuild,
    Exit,
}

struct Inner {
    config: SupervisorConfig,
    bridge_config: BridgeConfig,
    host: Arc<dyn Host>,
    connector: Arc<dyn EngineConnector>,
    probe: Arc<dyn BridgeProbe>,
    store: SessionStore,
    view: watch::Sender<ConnectionView>,
    notices: broadcast::Sender<ConnectionNotice>,
    reconnect: Notify,
    ever_ready: AtomicBool,
}

struct TaskState {
    running: bool,
    cancel: Option<CancellationToken>,
    task: Option<JoinHandle<()>>,
}

pub struct ConnectionSupervisor {
    inner: Arc<Inner>,
    state: Mutex<TaskState>,
}

impl ConnectionSupervisor {
    pub fn new(
        config: &HelmConfig,
        host: Arc<dyn Host>,
        connector: Arc<dyn EngineConnector>,
        probe: Arc<dyn BridgeProbe>,
        store: SessionStore,
    ) -> Self {
        let (view, _) = watch::channel(ConnectionView::default());
        let (notices, _) = broadcast::channel(64);
        Self {
            inner: Arc::new(Inner {
                config: config.supervisor.clone(),
                bridge_config: config.bridge.clone(),
                host,
                connector,
                probe,
                store,
                view,
                notices,
                reconnect: Notify::new(),
                ever_ready: AtomicBool::new(false),
            }),
            state: Mutex::new(TaskState {
                running: false,
                cancel: None,
                task: None,
            }),
        }
    }

    pub fn subscribe_view(&self) -> watch::Receiver<ConnectionView> {
        self.inner.view.subscribe()
    }

    pub fn subscribe_notices(&self) -> broadcast::Receiver<ConnectionNotice> {
        self.inner.notices.subscribe()
    }

    pub fn view(&self) -> ConnectionView {
        self.inner.view.borrow().clone()
    }

    pub async fn start(&self) {
        let mut state = self.state.lock().await;
        if state.running {
            return;
        }
        let cancel = CancellationToken::new();
        let inner = self.inner.clone();
        state.task = Some(tokio::spawn(inner.run(cancel.clone())));
        state.cancel = Some(cancel);
        state.running = true;
    }

    /// Cancels the supervisor task and waits for it, leaving no client behind.
    pub async fn stop(&self) {
        let mut state = self.state.lock().await;
        if let Some(cancel) = state.cancel.take() {
            cancel.cancel();
        }
        if let Some(task) = state.task.take() {
            if let Err(e) = task.await {
                tracing::warn!("supervisor task ended abnormally: {}", e);
            }
        }
        self.inner.teardown();
        state.running = false;
    }

    /// Drops the current client; the state machine rebuilds it from scratch.
    pub fn reconnect(&self) {
        tracing::info!("manual reconnect requested");
        self.inner.reconnect.notify_one();
    }

    pub fn dismiss_degraded_notice(&self) {
        self.inner.view.send_if_modified(|v| {
            let was_shown = v.degraded_notice;
            v.degraded_notice = false;
            was_shown
        });
    }
}

impl Inner {
    async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut status_rx = self.host.subscribe_status();
        let mut current = tokio::select! {
            _ = cancel.cancelled() => return,
            status = self.host.engine_status() => status.unwrap_or_else(|e| {
                tracing::warn!("engine status unavailable: {}", e);
                StatusPayload::stopped()
            }),
        };
        let mut tracker = StatusTracker::default();
        self.on_status(&mut tracker, &current);

        loop {
            let next = if current.status.is_running() {
                self.run_connected(&cancel, &mut status_rx, &current).await
            } else {
                self.teardown();
                self.wait_for_change(&cancel, &mut status_rx, &current).await
            };
            match next {
                Next::Status(payload) => {
                    current = payload;
                    self.on_status(&mut tracker, &current);
                }
                Next::Rebuild => {}
                Next::Exit => break,
            }
        }
        self.teardown();
        tracing::debug!("supervisor stopped");
    }

    fn on_status(&self, tracker: &mut StatusTracker, payload: &StatusPayload) {
        tracing::info!(status = payload.status.label(), port = payload.port, "engine status");
        self.view.send_modify(|v| {
            v.status = payload.status.clone();
            v.port = payload.port;
        });
        let ever_ready = self.ever_ready.load(Ordering::SeqCst);
        if let Some(notice) = tracker.observe(&payload.status, ever_ready) {
            emit_event(
                tracing::Level::INFO,
                ProcessKind::Desktop,
                ObservabilityEvent {
                    status: Some(payload.status.label()),
                    ..ObservabilityEvent::new(
                        match notice {
                            ConnectionNotice::Disconnected => "engine.disconnected",
                            _ => "engine.reconnected",
                        },
                        "supervisor",
                    )
                },
            );
            let _ = self.notices.send(notice);
        }
    }

    /// Next status push that differs from `current`. A lagged receiver re-reads the
    /// host's current value; `None` once the host has gone away.
    async fn next_status(
        &self,
        rx: &mut broadcast::Receiver<StatusPayload>,
        current: &StatusPayload,
    ) -> Option<StatusPayload> {
        loop {
            let payload = match rx.recv().await {
                Ok(payload) => payload,
                Err(RecvError::Lagged(skipped)) => {
                    tracing::debug!(skipped, "status receiver lagged, pulling current status");
                    match self.host.engine_status().await {
                        Ok(payload) => payload,
                        Err(e) => {
                            tracing::warn!("engine status unavailable: {}", e);
                            continue;
                        }
                    }
                }
                Err(RecvError::Closed) => return None,
            };
            if payload != *current {
                return Some(payload);
            }
        }
    }

    async fn wait_for_change(
        &self,
        cancel: &CancellationToken,
        rx: &mut broadcast::Receiver<StatusPayload>,
        current: &StatusPayload,
    ) -> Next {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Next::Exit,
                _ = self.reconnect.notified() => {
                    tracing::debug!("reconnect ignored while engine is {}", current.status.label());
                }
                next = self.next_status(rx, current) => {
                    return match next {
                        Some(payload) => Next::Status(payload),
                        None => {
                            tracing::warn!("host status channel closed");
                            Next::Exit
                        }
                    };
                }
            }
        }
    }

    async fn run_connected(
        &self,
        cancel: &CancellationToken,
        rx: &mut broadcast::Receiver<StatusPayload>,
        current: &StatusPayload,
    ) -> Next {
        let session = self.connected_session(current.port);
        tokio::pin!(session);
        let mut session_done = false;

        let next = loop {
            tokio::select! {
                _ = cancel.cancelled() => break Next::Exit,
                _ = &mut session, if !session_done => {
                    // Init gave up; wait for a status change or a manual reconnect.
                    session_done = true;
                }
                _ = self.reconnect.notified() => break Next::Rebuild,
                next = self.next_status(rx, current) => {
                    break match next {
                        Some(payload) => Next::Status(payload),
                        None => {
                            tracing::warn!("host status channel closed");
                            Next::Exit
                        }
                    };
                }
            }
        };
        self.teardown();
        next
    }

    async fn connected_session(&self, port: u16) {
        let directory = self.acquire_directory().await;
        let client = match self.connector.connect(port, &directory) {
            Ok(client) => client,
            Err(e) => {
                tracing::error!(port, "failed to build engine client: {}", e);
                self.view.send_modify(|v| v.init_error = Some(e.to_string()));
                return;
            }
        };
        self.store.attach_client(client.clone());
        self.view.send_modify(|v| {
            v.client_present = true;
            v.ready = false;
            v.init_error = None;
        });

        if let Err(e) = self.initialize_with_backoff().await {
            let detail = e.to_string();
            emit_event(
                tracing::Level::ERROR,
                ProcessKind::Desktop,
                ObservabilityEvent {
                    error_code: Some("init_exhausted"),
                    detail: Some(detail.as_str()),
                    ..ObservabilityEvent::new("engine.init_failed", "supervisor")
                },
            );
            self.view.send_modify(|v| v.init_error = Some(detail));
            return;
        }

        self.ever_ready.store(true, Ordering::SeqCst);
        self.view.send_modify(|v| v.ready = true);
        emit_event(
            tracing::Level::INFO,
            ProcessKind::Desktop,
            ObservabilityEvent::new("engine.ready", "supervisor"),
        );

        let trigger = Arc::new(Notify::new());
        let poller = bridge::poll_loop(
            self.store.clone(),
            client.clone(),
            self.probe.clone(),
            self.host.clone(),
            self.bridge_config.clone(),
            trigger.clone(),
        );
        tokio::select! {
            _ = self.event_loop(client, &trigger) => {}
            _ = poller => {}
        }
    }

    async fn acquire_directory(&self) -> String {
        loop {
            match self.host.workspace_dir().await {
                Ok(directory) => return directory,
                Err(e) => {
                    tracing::debug!("workspace directory unavailable, retrying: {}", e);
                    tokio::time::sleep(self.config.directory_retry()).await;
                }
            }
        }
    }

    async fn initialize_with_backoff(&self) -> Result<()> {
        let mut attempt = 1;
        loop {
            match self.store.initialize().await {
                Ok(InitOutcome::Committed) => return Ok(()),
                Ok(InitOutcome::Stale) => {
                    tracing::debug!("a newer initialization owns the commit");
                    return Ok(());
                }
                Err(e) if attempt >= self.config.init_max_attempts => return Err(e),
                Err(e) => {
                    let delay = self.config.init_delay(attempt);
                    tracing::debug!(attempt, ?delay, "initialization failed, retrying: {}", e);
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }

    async fn event_loop(&self, client: Arc<dyn EngineApi>, trigger: &Notify) {
        let mut failures: u32 = 0;
        loop {
            match client.subscribe_events().await {
                Ok(mut stream) => {
                    self.stream_opened(failures);
                    failures = 0;
                    while let Some(item) = stream.next().await {
                        match item {
                            Ok(event) => {
                                tracing::trace!(
                                    kind = event.kind(),
                                    session_id = ?event.session_id(),
                                    "engine event"
                                );
                                if let Some(StoreEffect::ProbeBridge) = self.store.handle_event(&event) {
                                    trigger.notify_one();
                                }
                            }
                            Err(e) => {
                                tracing::warn!("event stream read failed: {}", e);
                                break;
                            }
                        }
                    }
                    tracing::info!("event stream closed, resubscribing");
                }
                Err(e) => tracing::warn!("event stream open failed: {}", e),
            }
            failures += 1;
            self.stream_failed(failures);
            tokio::time::sleep(self.config.stream_retry()).await;
        }
    }

    fn stream_opened(&self, previous_failures: u32) {
        if previous_failures >= self.config.degraded_threshold {
            tracing::info!(previous_failures, "event stream restored");
            let _ = self.notices.send(ConnectionNotice::StreamRestored);
        }
        self.view.send_modify(|v| {
            v.subscribed = true;
            v.stream_failures = 0;
            v.degraded_notice = false;
        });
    }

    fn stream_failed(&self, failures: u32) {
        let crossed = failures == self.config.degraded_threshold;
        if crossed {
            emit_event(
                tracing::Level::WARN,
                ProcessKind::Desktop,
                ObservabilityEvent {
                    status: Some("degraded"),
                    error_code: Some("stream_failures"),
                    ..ObservabilityEvent::new("engine.stream_degraded", "supervisor")
                },
            );
            let _ = self.notices.send(ConnectionNotice::StreamDegraded { failures });
        }
        self.view.send_modify(|v| {
            v.subscribed = false;
            v.stream_failures = failures;
            if crossed {
                v.degraded_notice = true;
            }
        });
    }

    fn teardown(&self) {
        if self.store.is_attached() {
            tracing::info!("discarding engine client");
        }
        self.store.detach_client();
        self.view.send_modify(|v| {
            v.client_present = false;
            v.ready = false;
            v.subscribed = false;
            v.stream_failures = 0;
            v.degraded_notice = false;
        });
    }
}

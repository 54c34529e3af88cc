//! In-crate fakes for the engine, bridge and host.

use async_trait::async_trait;
use futures::StreamExt;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{broadcast, Notify};

use helm_client::{BridgeHealthReport, BridgeProbe, ClientError, EngineApi, EventStream};
use helm_types::{
    Agent, AuthMethod, EngineEvent, McpServerStatus, MessageWithParts, OAuthAuthorization,
    OAuthMode, PermissionReply, PermissionRequest, PromptRequest, ProviderCatalog,
    QuestionRequest, Session, SessionStatus, SessionTime, StatusPayload, Todo,
};

use crate::error::{HelmError, Result as HelmResult};
use crate::host::Host;
use crate::supervisor::EngineConnector;

type ClientResult<T> = helm_client::Result<T>;
pub type Journal = Arc<Mutex<Vec<String>>>;

pub fn session(id: &str) -> Session {
    Session {
        id: id.to_string(),
        title: format!("Session {id}"),
        time: SessionTime::default(),
        parent_id: None,
        directory: None,
    }
}

fn server_error(name: &str) -> ClientError {
    ClientError::Status {
        url: format!("/{name}"),
        status: 500,
        body: "injected failure".to_string(),
    }
}

/// Pauses one call until the test releases it.
#[derive(Default)]
pub struct Gate {
    pub entered: Notify,
    pub release: Notify,
}

pub enum StreamScript {
    /// Opening the stream fails.
    Fail,
    /// Emits the events, then ends.
    End(Vec<EngineEvent>),
    /// Emits the events, then stays open.
    Hold(Vec<EngineEvent>),
}

pub struct FakeEngine {
    journal: Journal,
    sessions: Mutex<Vec<Session>>,
    catalog: Mutex<ProviderCatalog>,
    statuses: Mutex<HashMap<String, SessionStatus>>,
    questions: Mutex<Vec<QuestionRequest>>,
    mcp: Mutex<HashMap<String, McpServerStatus>>,
    failing: Mutex<HashSet<String>>,
    prompts: Mutex<Vec<(String, PromptRequest)>>,
    gate: Mutex<Option<Arc<Gate>>>,
    messages: Mutex<HashMap<String, Vec<MessageWithParts>>>,
    messages_gate: Mutex<Option<Arc<Gate>>>,
    streams: Mutex<VecDeque<StreamScript>>,
    next_id: AtomicU64,
}

impl FakeEngine {
    pub fn new() -> Self {
        Self {
            journal: Arc::new(Mutex::new(Vec::new())),
            sessions: Mutex::new(Vec::new()),
            catalog: Mutex::new(ProviderCatalog::default()),
            statuses: Mutex::new(HashMap::new()),
            questions: Mutex::new(Vec::new()),
            mcp: Mutex::new(HashMap::new()),
            failing: Mutex::new(HashSet::new()),
            prompts: Mutex::new(Vec::new()),
            gate: Mutex::new(None),
            messages: Mutex::new(HashMap::new()),
            messages_gate: Mutex::new(None),
            streams: Mutex::new(VecDeque::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn journal(&self) -> Journal {
        self.journal.clone()
    }

    pub fn set_sessions(&self, sessions: Vec<Session>) {
        *self.sessions.lock().unwrap() = sessions;
    }

    pub fn set_catalog(&self, catalog: ProviderCatalog) {
        *self.catalog.lock().unwrap() = catalog;
    }

    pub fn set_questions(&self, questions: Vec<QuestionRequest>) {
        *self.questions.lock().unwrap() = questions;
    }

    pub fn set_mcp(&self, name: &str, status: McpServerStatus) {
        self.mcp.lock().unwrap().insert(name.to_string(), status);
    }

    pub fn fail(&self, method: &str) {
        self.failing.lock().unwrap().insert(method.to_string());
    }

    pub fn heal(&self, method: &str) {
        self.failing.lock().unwrap().remove(method);
    }

    pub fn script_streams(&self, scripts: impl IntoIterator<Item = StreamScript>) {
        self.streams.lock().unwrap().extend(scripts);
    }

    pub fn gate_next_list_sessions(&self) -> Arc<Gate> {
        let gate = Arc::new(Gate::default());
        *self.gate.lock().unwrap() = Some(gate.clone());
        gate
    }

    pub fn set_messages(&self, session_id: &str, messages: Vec<MessageWithParts>) {
        self.messages
            .lock()
            .unwrap()
            .insert(session_id.to_string(), messages);
    }

    pub fn gate_next_session_messages(&self) -> Arc<Gate> {
        let gate = Arc::new(Gate::default());
        *self.messages_gate.lock().unwrap() = Some(gate.clone());
        gate
    }

    pub fn calls(&self, method: &str) -> usize {
        self.journal
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.as_str() == method)
            .count()
    }

    pub fn prompts(&self) -> Vec<(String, PromptRequest)> {
        self.prompts.lock().unwrap().clone()
    }

    fn record(&self, method: &str) -> ClientResult<()> {
        self.journal.lock().unwrap().push(method.to_string());
        if self.failing.lock().unwrap().contains(method) {
            return Err(server_error(method));
        }
        Ok(())
    }
}

#[async_trait]
impl EngineApi for FakeEngine {
    async fn list_sessions(&self) -> ClientResult<Vec<Session>> {
        self.record("list_sessions")?;
        let sessions = self.sessions.lock().unwrap().clone();
        let gate = self.gate.lock().unwrap().take();
        if let Some(gate) = gate {
            gate.entered.notify_one();
            gate.release.notified().await;
        }
        Ok(sessions)
    }

    async fn create_session(&self, title: Option<String>) -> ClientResult<Session> {
        self.record("create_session")?;
        let id = format!("ses_{}", self.next_id.fetch_add(1, Ordering::SeqCst));
        let mut created = session(&id);
        if let Some(title) = title {
            created.title = title;
        }
        self.sessions.lock().unwrap().push(created.clone());
        Ok(created)
    }

    async fn delete_session(&self, session_id: &str) -> ClientResult<()> {
        self.record("delete_session")?;
        self.sessions.lock().unwrap().retain(|s| s.id != session_id);
        Ok(())
    }

    async fn session_messages(&self, session_id: &str) -> ClientResult<Vec<MessageWithParts>> {
        self.record("session_messages")?;
        let messages = self
            .messages
            .lock()
            .unwrap()
            .get(session_id)
            .cloned()
            .unwrap_or_default();
        let gate = self.messages_gate.lock().unwrap().take();
        if let Some(gate) = gate {
            gate.entered.notify_one();
            gate.release.notified().await;
        }
        Ok(messages)
    }

    async fn session_todos(&self, _session_id: &str) -> ClientResult<Vec<Todo>> {
        self.record("session_todos")?;
        Ok(Vec::new())
    }

    async fn session_statuses(&self) -> ClientResult<HashMap<String, SessionStatus>> {
        self.record("session_statuses")?;
        Ok(self.statuses.lock().unwrap().clone())
    }

    async fn prompt_async(&self, session_id: &str, request: PromptRequest) -> ClientResult<()> {
        self.record("prompt_async")?;
        self.prompts
            .lock()
            .unwrap()
            .push((session_id.to_string(), request));
        Ok(())
    }

    async fn abort_session(&self, _session_id: &str) -> ClientResult<()> {
        self.record("abort_session")
    }

    async fn subscribe_events(&self) -> ClientResult<EventStream> {
        self.record("subscribe_events")?;
        let script = self
            .streams
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(StreamScript::Hold(Vec::new()));
        match script {
            StreamScript::Fail => Err(ClientError::Stream("connection refused".to_string())),
            StreamScript::End(events) => {
                Ok(futures::stream::iter(events.into_iter().map(Ok)).boxed())
            }
            StreamScript::Hold(events) => Ok(futures::stream::iter(events.into_iter().map(Ok))
                .chain(futures::stream::pending())
                .boxed()),
        }
    }

    async fn list_questions(&self) -> ClientResult<Vec<QuestionRequest>> {
        self.record("list_questions")?;
        Ok(self.questions.lock().unwrap().clone())
    }

    async fn reply_question(&self, _request_id: &str, _answers: Vec<Vec<String>>) -> ClientResult<()> {
        self.record("reply_question")
    }

    async fn reject_question(&self, _request_id: &str) -> ClientResult<()> {
        self.record("reject_question")
    }

    async fn list_permissions(&self) -> ClientResult<Vec<PermissionRequest>> {
        self.record("list_permissions")?;
        Ok(Vec::new())
    }

    async fn reply_permission(&self, _request_id: &str, _reply: PermissionReply) -> ClientResult<()> {
        self.record("reply_permission")
    }

    async fn provider_catalog(&self) -> ClientResult<ProviderCatalog> {
        self.record("provider_catalog")?;
        Ok(self.catalog.lock().unwrap().clone())
    }

    async fn auth_methods(&self) -> ClientResult<HashMap<String, Vec<AuthMethod>>> {
        self.record("auth_methods")?;
        Ok(HashMap::new())
    }

    async fn list_agents(&self) -> ClientResult<Vec<Agent>> {
        self.record("list_agents")?;
        Ok(Vec::new())
    }

    async fn set_api_key(&self, _provider_id: &str, _key: &str) -> ClientResult<()> {
        self.record("set_api_key")
    }

    async fn remove_auth(&self, _provider_id: &str) -> ClientResult<()> {
        self.record("remove_auth")
    }

    async fn oauth_authorize(&self, provider_id: &str, _method: usize) -> ClientResult<OAuthAuthorization> {
        self.record("oauth_authorize")?;
        Ok(OAuthAuthorization {
            url: format!("https://auth.example/{provider_id}"),
            method: OAuthMode::Code,
            instructions: String::new(),
        })
    }

    async fn oauth_callback(&self, _provider_id: &str, _method: usize, _code: Option<String>) -> ClientResult<()> {
        self.record("oauth_callback")
    }

    async fn dispose_instance(&self) -> ClientResult<()> {
        self.record("dispose_instance")
    }

    async fn mcp_status(&self) -> ClientResult<HashMap<String, McpServerStatus>> {
        self.record("mcp_status")?;
        Ok(self.mcp.lock().unwrap().clone())
    }

    async fn mcp_connect(&self, _name: &str) -> ClientResult<()> {
        self.record("mcp_connect")
    }
}

/// Bridge probe answering from a settable report; `None` means nothing is listening.
pub struct FakeProbe {
    report: Mutex<Option<BridgeHealthReport>>,
    calls: AtomicU32,
}

impl FakeProbe {
    pub fn new(report: Option<BridgeHealthReport>) -> Self {
        Self {
            report: Mutex::new(report),
            calls: AtomicU32::new(0),
        }
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BridgeProbe for FakeProbe {
    async fn probe(&self) -> ClientResult<BridgeHealthReport> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        (*self.report.lock().unwrap())
            .ok_or_else(|| ClientError::Stream("operation timed out".to_string()))
    }
}

pub struct FakeHost {
    journal: Journal,
    status_tx: broadcast::Sender<StatusPayload>,
    current: Mutex<StatusPayload>,
    directory_failures: AtomicU32,
    plugin_installed: AtomicBool,
}

impl FakeHost {
    pub fn new() -> Self {
        Self::with_journal(Arc::new(Mutex::new(Vec::new())))
    }

    pub fn with_journal(journal: Journal) -> Self {
        let (status_tx, _) = broadcast::channel(16);
        Self {
            journal,
            status_tx,
            current: Mutex::new(StatusPayload::stopped()),
            directory_failures: AtomicU32::new(0),
            plugin_installed: AtomicBool::new(false),
        }
    }

    pub fn push_status(&self, payload: StatusPayload) {
        *self.current.lock().unwrap() = payload.clone();
        let _ = self.status_tx.send(payload);
    }

    pub fn fail_workspace_dir(&self, times: u32) {
        self.directory_failures.store(times, Ordering::SeqCst);
    }

    pub fn calls(&self, method: &str) -> usize {
        self.journal
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.as_str() == method)
            .count()
    }
}

#[async_trait]
impl Host for FakeHost {
    fn subscribe_status(&self) -> broadcast::Receiver<StatusPayload> {
        self.status_tx.subscribe()
    }

    async fn engine_status(&self) -> HelmResult<StatusPayload> {
        Ok(self.current.lock().unwrap().clone())
    }

    async fn workspace_dir(&self) -> HelmResult<String> {
        self.journal.lock().unwrap().push("workspace_dir".to_string());
        let remaining = self.directory_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.directory_failures.store(remaining - 1, Ordering::SeqCst);
            return Err(HelmError::Host("host not ready".to_string()));
        }
        Ok("/tmp/workspace".to_string())
    }

    async fn check_plugin_installed(&self) -> HelmResult<bool> {
        Ok(self.plugin_installed.load(Ordering::SeqCst))
    }

    async fn install_plugin(&self) -> HelmResult<()> {
        self.plugin_installed.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn kill_stale_bridge(&self) -> HelmResult<()> {
        self.journal.lock().unwrap().push("kill_stale_bridge".to_string());
        Ok(())
    }
}

/// Hands out the same fake engine for every connection.
pub struct FakeConnector {
    engine: Arc<FakeEngine>,
    connects: AtomicU32,
}

impl FakeConnector {
    pub fn new(engine: Arc<FakeEngine>) -> Self {
        Self {
            engine,
            connects: AtomicU32::new(0),
        }
    }

    pub fn connects(&self) -> u32 {
        self.connects.load(Ordering::SeqCst)
    }
}

impl EngineConnector for FakeConnector {
    fn connect(&self, _port: u16, _directory: &str) -> HelmResult<Arc<dyn EngineApi>> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        Ok(self.engine.clone())
    }
}

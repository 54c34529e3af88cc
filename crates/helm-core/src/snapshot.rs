//! The UI-facing state and the pure rules that move it forward.

use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap};

use helm_types::{
    Agent, AuthMethod, BridgeHealth, EngineEvent, MessageWithParts, ModelRef, PermissionRequest,
    ProviderCatalog, QuestionRequest, Session, SessionStatus, Todo,
};

use crate::persist::PersistedState;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Catalog {
    pub providers: ProviderCatalog,
    pub auth_methods: HashMap<String, Vec<AuthMethod>>,
    pub agents: Vec<Agent>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    pub initialized: bool,
    pub sessions: Vec<Session>,
    pub session_status: HashMap<String, SessionStatus>,
    pub own_sessions: BTreeSet<String>,
    pub active_session_id: Option<String>,
    pub messages: Vec<MessageWithParts>,
    pub todos: Vec<Todo>,
    pub question: Option<QuestionRequest>,
    pub permission: Option<PermissionRequest>,
    pub is_busy: bool,
    pub last_error: Option<String>,
    pub catalog: Catalog,
    pub selected_model: Option<ModelRef>,
    pub selected_agent: Option<String>,
    pub selected_variant: Option<String>,
    pub hidden_models: BTreeSet<String>,
    pub session_models: BTreeMap<String, String>,
    pub has_launched: bool,
    pub plugin_installed: bool,
    pub bridge: BridgeHealth,
    /// Bumped whenever a status event for the active session lands.
    #[serde(skip)]
    pub busy_revision: u64,
}

/// Follow-up work an event asks of the owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreEffect {
    ProbeBridge,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Applied {
    pub changed: bool,
    pub effect: Option<StoreEffect>,
}

impl Applied {
    fn changed() -> Self {
        Self {
            changed: true,
            effect: None,
        }
    }

    fn ignored() -> Self {
        Self::default()
    }
}

/// Results of one initialization round trip, ready to commit.
#[derive(Debug, Clone, Default)]
pub struct InitData {
    pub sessions: Vec<Session>,
    pub providers: ProviderCatalog,
    pub session_status: HashMap<String, SessionStatus>,
    pub agents: Vec<Agent>,
    pub auth_methods: HashMap<String, Vec<AuthMethod>>,
    pub plugin_installed: bool,
}

/// Last-used model while its provider is connected, else the engine default of the
/// first connected provider, else nothing.
pub fn resolve_initial_model(
    catalog: &ProviderCatalog,
    last_used: Option<&ModelRef>,
) -> Option<ModelRef> {
    if let Some(last) = last_used {
        if catalog.is_connected(&last.provider_id) {
            return Some(last.clone());
        }
    }
    catalog.first_connected_default()
}

fn error_text(error: &Value) -> Option<String> {
    let name = error.get("name").and_then(Value::as_str);
    if name == Some("MessageAbortedError") {
        return None;
    }
    let message = error
        .pointer("/data/message")
        .or_else(|| error.get("message"))
        .and_then(Value::as_str);
    match (name, message) {
        (_, Some(message)) => Some(message.to_string()),
        (Some(name), None) => Some(name.to_string()),
        (None, None) => Some(error.to_string()),
    }
}

impl Snapshot {
    pub fn is_active(&self, session_id: &str) -> bool {
        self.active_session_id.as_deref() == Some(session_id)
    }

    pub fn active_session(&self) -> Option<&Session> {
        let id = self.active_session_id.as_deref()?;
        self.sessions.iter().find(|s| s.id == id)
    }

    pub fn visible_sessions(&self, only_own: bool) -> Vec<&Session> {
        self.sessions
            .iter()
            .filter(|s| !only_own || self.own_sessions.contains(&s.id))
            .collect()
    }

    pub fn is_model_hidden(&self, model: &ModelRef) -> bool {
        self.hidden_models.contains(&model.key())
    }

    /// Model a send for the active session would use.
    pub fn effective_model(&self) -> Option<ModelRef> {
        self.active_session_id
            .as_ref()
            .and_then(|id| self.session_models.get(id))
            .and_then(|key| ModelRef::parse(key))
            .or_else(|| self.selected_model.clone())
    }

    fn clear_session_detail(&mut self) {
        self.messages.clear();
        self.todos.clear();
        self.question = None;
        self.permission = None;
        self.last_error = None;
    }

    /// Switches the active session and drops everything scoped to the old one.
    pub fn activate_session(&mut self, session_id: Option<&str>) {
        self.active_session_id = session_id.map(str::to_string);
        self.clear_session_detail();
        self.is_busy = session_id
            .and_then(|id| self.session_status.get(id))
            .is_some_and(SessionStatus::is_busy);
        self.busy_revision += 1;
        if let Some(model) = session_id
            .and_then(|id| self.session_models.get(id))
            .and_then(|key| ModelRef::parse(key))
        {
            self.selected_model = Some(model);
        }
    }

    pub fn apply_init(&mut self, data: InitData, persisted: &PersistedState) {
        self.sessions = data.sessions;
        self.session_status = data.session_status;
        self.catalog = Catalog {
            providers: data.providers,
            auth_methods: data.auth_methods,
            agents: data.agents,
        };
        self.plugin_installed = data.plugin_installed;
        self.own_sessions = persisted.own_sessions.clone();
        self.hidden_models = persisted.hidden_models.clone();
        self.session_models = persisted.session_models.clone();
        self.has_launched = persisted.has_launched;
        self.selected_model =
            resolve_initial_model(&self.catalog.providers, persisted.last_model_ref().as_ref());

        if let Some(active) = self.active_session_id.clone() {
            if self.sessions.iter().any(|s| s.id == active) {
                self.is_busy = self
                    .session_status
                    .get(&active)
                    .is_some_and(SessionStatus::is_busy);
            } else {
                self.activate_session(None);
            }
        }
        self.initialized = true;
    }

    /// Applies one engine event. Events scoped to a session other than the active one
    /// only touch the session list and status map.
    pub fn apply_event(&mut self, event: &EngineEvent) -> Applied {
        match event {
            EngineEvent::SessionCreated { info } => {
                if self.sessions.iter().any(|s| s.id == info.id) {
                    return Applied::ignored();
                }
                self.sessions.insert(0, info.clone());
                Applied::changed()
            }
            EngineEvent::SessionUpdated { info } => {
                match self.sessions.iter_mut().find(|s| s.id == info.id) {
                    Some(existing) if existing == info => return Applied::ignored(),
                    Some(existing) => *existing = info.clone(),
                    None => self.sessions.insert(0, info.clone()),
                }
                Applied::changed()
            }
            EngineEvent::SessionDeleted { info } => {
                let before = self.sessions.len();
                self.sessions.retain(|s| s.id != info.id);
                let status_removed = self.session_status.remove(&info.id).is_some();
                let was_active = self.is_active(&info.id);
                if was_active {
                    self.activate_session(None);
                }
                Applied {
                    changed: was_active || status_removed || self.sessions.len() != before,
                    effect: None,
                }
            }
            EngineEvent::SessionStatusChanged { session_id, status } => {
                self.set_session_status(session_id, status.clone())
            }
            EngineEvent::SessionIdle { session_id } => {
                self.set_session_status(session_id, SessionStatus::Idle)
            }
            EngineEvent::SessionError { session_id, error } => {
                let Some(session_id) = session_id else {
                    return Applied::ignored();
                };
                if !self.is_active(session_id) {
                    return Applied::ignored();
                }
                self.last_error = error.as_ref().and_then(error_text);
                Applied::changed()
            }
            EngineEvent::MessageUpdated { info } => {
                if !self.is_active(&info.session_id) {
                    return Applied::ignored();
                }
                match self.messages.iter_mut().find(|m| m.info.id == info.id) {
                    Some(existing) => existing.info = info.clone(),
                    None => self.messages.push(MessageWithParts::new(info.clone())),
                }
                Applied::changed()
            }
            EngineEvent::MessageRemoved {
                session_id,
                message_id,
            } => {
                if !self.is_active(session_id) {
                    return Applied::ignored();
                }
                let before = self.messages.len();
                self.messages.retain(|m| &m.info.id != message_id);
                Applied {
                    changed: self.messages.len() != before,
                    effect: None,
                }
            }
            EngineEvent::PartUpdated { part } => {
                if !self.is_active(&part.session_id) {
                    return Applied::ignored();
                }
                let Some(message) = self
                    .messages
                    .iter_mut()
                    .find(|m| m.info.id == part.message_id)
                else {
                    tracing::debug!(
                        message_id = %part.message_id,
                        part_id = %part.id,
                        "part for unknown message ignored"
                    );
                    return Applied::ignored();
                };
                message.upsert_part(part.clone());
                Applied::changed()
            }
            EngineEvent::PartRemoved {
                session_id,
                message_id,
                part_id,
            } => {
                if !self.is_active(session_id) {
                    return Applied::ignored();
                }
                let changed = self
                    .messages
                    .iter_mut()
                    .find(|m| &m.info.id == message_id)
                    .is_some_and(|m| m.remove_part(part_id));
                Applied {
                    changed,
                    effect: None,
                }
            }
            EngineEvent::TodoUpdated { session_id, todos } => {
                if !self.is_active(session_id) {
                    return Applied::ignored();
                }
                self.todos = todos.clone();
                Applied::changed()
            }
            EngineEvent::QuestionAsked(request) => {
                if !self.is_active(&request.session_id) {
                    return Applied::ignored();
                }
                self.question = Some(request.clone());
                Applied::changed()
            }
            EngineEvent::QuestionReplied {
                session_id,
                request_id,
            }
            | EngineEvent::QuestionRejected {
                session_id,
                request_id,
            } => {
                if !self.is_active(session_id) {
                    return Applied::ignored();
                }
                self.clear_question(request_id)
            }
            EngineEvent::PermissionAsked(request) => {
                if !self.is_active(&request.session_id) {
                    return Applied::ignored();
                }
                self.permission = Some(request.clone());
                Applied::changed()
            }
            EngineEvent::PermissionReplied {
                session_id,
                request_id,
                ..
            } => {
                if !self.is_active(session_id) {
                    return Applied::ignored();
                }
                self.clear_permission(request_id)
            }
            EngineEvent::McpToolsChanged { .. } => Applied {
                changed: false,
                effect: Some(StoreEffect::ProbeBridge),
            },
        }
    }

    fn set_session_status(&mut self, session_id: &str, status: SessionStatus) -> Applied {
        let busy = status.is_busy();
        self.session_status.insert(session_id.to_string(), status);
        if self.is_active(session_id) {
            self.is_busy = busy;
            self.busy_revision += 1;
        }
        Applied::changed()
    }

    pub(crate) fn clear_question(&mut self, request_id: &str) -> Applied {
        match &self.question {
            Some(q) if q.id == request_id => {
                self.question = None;
                Applied::changed()
            }
            _ => Applied::ignored(),
        }
    }

    pub(crate) fn clear_permission(&mut self, request_id: &str) -> Applied {
        match &self.permission {
            Some(p) if p.id == request_id => {
                self.permission = None;
                Applied::changed()
            }
            _ => Applied::ignored(),
        }
    }
}

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use helm_client::EngineApi;
use helm_observability::{emit_event, redact_text, ObservabilityEvent, ProcessKind};
use helm_types::{
    BridgeHealth, EngineEvent, ModelRef, OAuthAuthorization, PermissionReply, PromptRequest,
    Session, SessionStatus,
};

use crate::config::StoreConfig;
use crate::error::{HelmError, Result};
use crate::host::Host;
use crate::persist::{PersistedField, StateRepository};
use crate::snapshot::{resolve_initial_model, InitData, Snapshot, StoreEffect};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitOutcome {
    Committed,
    /// A newer attempt started while this one was in flight; nothing was written.
    Stale,
}

/// Owner of the session snapshot. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct SessionStore {
    state: Arc<watch::Sender<Snapshot>>,
    client: Arc<RwLock<Option<Arc<dyn EngineApi>>>>,
    host: Arc<dyn Host>,
    repo: Arc<dyn StateRepository>,
    generation: Arc<AtomicU64>,
    /// Bumped by every session-detail load; only the newest load commits.
    detail_generation: Arc<AtomicU64>,
    background: Arc<Mutex<CancellationToken>>,
    config: StoreConfig,
}

impl SessionStore {
    pub fn new(host: Arc<dyn Host>, repo: Arc<dyn StateRepository>, config: StoreConfig) -> Self {
        let (tx, _rx) = watch::channel(Snapshot::default());
        Self {
            state: Arc::new(tx),
            client: Arc::new(RwLock::new(None)),
            host,
            repo,
            generation: Arc::new(AtomicU64::new(0)),
            detail_generation: Arc::new(AtomicU64::new(0)),
            background: Arc::new(Mutex::new(CancellationToken::new())),
            config,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<Snapshot> {
        self.state.subscribe()
    }

    pub fn snapshot(&self) -> Snapshot {
        self.state.borrow().clone()
    }

    pub fn attach_client(&self, client: Arc<dyn EngineApi>) {
        *self.client.write().unwrap_or_else(|e| e.into_inner()) = Some(client);
    }

    /// Drops the client and cancels background work that could still write.
    pub fn detach_client(&self) {
        self.client.write().unwrap_or_else(|e| e.into_inner()).take();
        // Outstanding initializations become stale.
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.detail_generation.fetch_add(1, Ordering::SeqCst);
        let mut token = self.background.lock().unwrap_or_else(|e| e.into_inner());
        token.cancel();
        *token = CancellationToken::new();
    }

    pub fn is_attached(&self) -> bool {
        self.client
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .is_some()
    }

    fn client(&self) -> Result<Arc<dyn EngineApi>> {
        self.client
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .ok_or(HelmError::NotConnected)
    }

    fn background_token(&self) -> CancellationToken {
        self.background
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn persist(&self, field: PersistedField) {
        let key = field.key();
        if let Err(e) = self.repo.save_field(field) {
            tracing::warn!(key, "failed to persist: {}", e);
        }
    }

    fn active_session_id(&self) -> Result<String> {
        self.state
            .borrow()
            .active_session_id
            .clone()
            .ok_or(HelmError::NoActiveSession)
    }

    fn is_stale(&self, generation: u64) -> bool {
        self.generation.load(Ordering::SeqCst) != generation
    }

    /// One initialization attempt. Sessions, providers and statuses are required;
    /// agents, auth methods and the plugin check degrade to empty.
    pub async fn initialize(&self) -> Result<InitOutcome> {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let client = self.client()?;

        let (sessions, providers, statuses, agents, auth_methods, plugin) = tokio::join!(
            client.list_sessions(),
            client.provider_catalog(),
            client.session_statuses(),
            client.list_agents(),
            client.auth_methods(),
            self.host.check_plugin_installed(),
        );

        if self.is_stale(generation) {
            tracing::debug!(generation, "discarding stale initialization");
            return Ok(InitOutcome::Stale);
        }

        let data = InitData {
            sessions: sessions?,
            providers: providers?,
            session_status: statuses?,
            agents: agents.unwrap_or_else(|e| {
                tracing::warn!("agent list unavailable: {}", e);
                Vec::new()
            }),
            auth_methods: auth_methods.unwrap_or_else(|e| {
                tracing::warn!("auth methods unavailable: {}", e);
                HashMap::new()
            }),
            plugin_installed: plugin.unwrap_or_else(|e| {
                tracing::warn!("plugin check failed: {}", e);
                false
            }),
        };
        let persisted = self.repo.load_all().unwrap_or_else(|e| {
            tracing::warn!("persisted state unavailable: {}", e);
            Default::default()
        });

        self.state.send_modify(|s| s.apply_init(data, &persisted));
        let session_count = self.state.borrow().sessions.len();
        tracing::info!(generation, sessions = session_count, "store initialized");

        let active = self.state.borrow().active_session_id.clone();
        if let Some(active) = active {
            // Re-init after a reconnect: the detail may have moved on while we were away.
            if let Err(e) = self.load_session_detail(&client, &active).await {
                tracing::warn!(session_id = %active, "failed to reload active session: {}", e);
            }
        }
        Ok(InitOutcome::Committed)
    }

    /// Applies one engine event to the snapshot, notifying subscribers if anything moved.
    pub fn handle_event(&self, event: &EngineEvent) -> Option<StoreEffect> {
        let mut effect = None;
        self.state.send_if_modified(|s| {
            let applied = s.apply_event(event);
            effect = applied.effect;
            applied.changed
        });
        effect
    }

    pub(crate) fn set_bridge_health(&self, health: BridgeHealth) {
        self.state.send_if_modified(|s| {
            if s.bridge == health {
                return false;
            }
            tracing::info!(status = ?health.status, error = ?health.error, "bridge status changed");
            s.bridge = health;
            true
        });
    }

    async fn load_session_detail(&self, client: &Arc<dyn EngineApi>, session_id: &str) -> Result<()> {
        let load = self.detail_generation.fetch_add(1, Ordering::SeqCst) + 1;
        let (messages, todos, questions, permissions) = tokio::join!(
            client.session_messages(session_id),
            client.session_todos(session_id),
            client.list_questions(),
            client.list_permissions(),
        );
        let messages = messages?;
        let todos = todos.unwrap_or_else(|e| {
            tracing::debug!("todos unavailable: {}", e);
            Vec::new()
        });
        let question = questions
            .unwrap_or_default()
            .into_iter()
            .find(|q| q.session_id == session_id);
        let permission = permissions
            .unwrap_or_default()
            .into_iter()
            .find(|p| p.session_id == session_id);

        if self.detail_generation.load(Ordering::SeqCst) != load {
            tracing::debug!(session_id, "discarding superseded session detail");
            return Ok(());
        }
        self.state.send_if_modified(|s| {
            if !s.is_active(session_id) {
                return false;
            }
            s.messages = messages;
            s.todos = todos;
            s.question = question;
            s.permission = permission;
            true
        });
        Ok(())
    }

    pub async fn select_session(&self, session_id: &str) -> Result<()> {
        let client = self.client()?;
        self.state.send_modify(|s| s.activate_session(Some(session_id)));
        self.load_session_detail(&client, session_id).await
    }

    pub fn clear_active_session(&self) {
        self.state.send_modify(|s| s.activate_session(None));
    }

    pub async fn create_session(&self, title: Option<String>) -> Result<Session> {
        let client = self.client()?;
        let session = client.create_session(title).await.map_err(|e| {
            tracing::warn!("create session failed: {}", e);
            e
        })?;

        let mut own = None;
        self.state.send_modify(|s| {
            if !s.sessions.iter().any(|x| x.id == session.id) {
                s.sessions.insert(0, session.clone());
            }
            s.own_sessions.insert(session.id.clone());
            own = Some(s.own_sessions.clone());
            s.activate_session(Some(&session.id));
        });
        if let Some(own) = own {
            self.persist(PersistedField::OwnSessions(own));
        }
        Ok(session)
    }

    pub async fn delete_session(&self, session_id: &str) -> Result<()> {
        let client = self.client()?;
        client.delete_session(session_id).await.map_err(|e| {
            tracing::warn!(session_id, "delete session failed: {}", e);
            e
        })?;

        let mut own = None;
        let mut models = None;
        self.state.send_modify(|s| {
            s.sessions.retain(|x| x.id != session_id);
            s.session_status.remove(session_id);
            if s.own_sessions.remove(session_id) {
                own = Some(s.own_sessions.clone());
            }
            if s.session_models.remove(session_id).is_some() {
                models = Some(s.session_models.clone());
            }
            if s.is_active(session_id) {
                s.activate_session(None);
            }
        });
        if let Some(own) = own {
            self.persist(PersistedField::OwnSessions(own));
        }
        if let Some(models) = models {
            self.persist(PersistedField::SessionModels(models));
        }
        Ok(())
    }

    /// Sends a prompt to the active session. Busy is set before the call and
    /// reverted if the call fails; the engine's status events own it afterwards.
    pub async fn send_message(&self, text: impl Into<String>) -> Result<()> {
        let client = self.client()?;
        let (session_id, request) = {
            let snap = self.state.borrow();
            let session_id = snap
                .active_session_id
                .clone()
                .ok_or(HelmError::NoActiveSession)?;
            let mut request = PromptRequest::text(text);
            request.model = snap.effective_model();
            request.agent = snap.selected_agent.clone();
            request.variant = snap.selected_variant.clone();
            (session_id, request)
        };
        let model = request.model.clone();

        let mut revision = 0;
        self.state.send_modify(|s| {
            s.is_busy = true;
            s.last_error = None;
            revision = s.busy_revision;
        });

        match client.prompt_async(&session_id, request).await {
            Ok(()) => {
                self.spawn_busy_reconcile(client, session_id, revision);
                Ok(())
            }
            Err(e) => {
                let detail = e.to_string();
                emit_event(
                    tracing::Level::WARN,
                    ProcessKind::Desktop,
                    ObservabilityEvent {
                        session_id: Some(session_id.as_str()),
                        provider_id: model.as_ref().map(|m| m.provider_id.as_str()),
                        model_id: model.as_ref().map(|m| m.model_id.as_str()),
                        error_code: Some("prompt_failed"),
                        detail: Some(detail.as_str()),
                        ..ObservabilityEvent::new("session.send_failed", "store")
                    },
                );
                self.state.send_if_modified(|s| {
                    if !s.is_active(&session_id) || s.busy_revision != revision {
                        return false;
                    }
                    s.is_busy = false;
                    true
                });
                Err(e.into())
            }
        }
    }

    /// If no status event for the session arrives in time, ask the engine directly.
    fn spawn_busy_reconcile(&self, client: Arc<dyn EngineApi>, session_id: String, revision: u64) {
        let store = self.clone();
        let token = self.background_token();
        let delay = self.config.busy_reconcile();
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
            let waiting = {
                let snap = store.state.borrow();
                snap.is_active(&session_id) && snap.is_busy && snap.busy_revision == revision
            };
            if !waiting {
                return;
            }
            let statuses = tokio::select! {
                _ = token.cancelled() => return,
                statuses = client.session_statuses() => statuses,
            };
            match statuses {
                Ok(statuses) => {
                    let status = statuses
                        .get(&session_id)
                        .cloned()
                        .unwrap_or(SessionStatus::Idle);
                    tracing::info!(session_id = %session_id, busy = status.is_busy(), "reconciled busy flag");
                    store.state.send_if_modified(|s| {
                        if !s.is_active(&session_id) || s.busy_revision != revision {
                            return false;
                        }
                        s.is_busy = status.is_busy();
                        s.session_status.insert(session_id.clone(), status);
                        true
                    });
                }
                Err(e) => tracing::warn!("busy reconcile failed: {}", e),
            }
        });
    }

    pub async fn abort(&self) -> Result<()> {
        let client = self.client()?;
        let session_id = self.active_session_id()?;
        client.abort_session(&session_id).await.map_err(|e| {
            tracing::warn!(session_id = %session_id, "abort failed: {}", e);
            e
        })?;
        self.state.send_if_modified(|s| {
            if !s.is_active(&session_id) {
                return false;
            }
            s.is_busy = false;
            s.busy_revision += 1;
            true
        });
        Ok(())
    }

    pub async fn answer_question(&self, request_id: &str, answers: Vec<Vec<String>>) -> Result<()> {
        let client = self.client()?;
        client.reply_question(request_id, answers).await.map_err(|e| {
            tracing::warn!(request_id, "question reply failed: {}", e);
            e
        })?;
        self.state.send_if_modified(|s| s.clear_question(request_id).changed);
        Ok(())
    }

    pub async fn reject_question(&self, request_id: &str) -> Result<()> {
        let client = self.client()?;
        client.reject_question(request_id).await.map_err(|e| {
            tracing::warn!(request_id, "question reject failed: {}", e);
            e
        })?;
        self.state.send_if_modified(|s| s.clear_question(request_id).changed);
        Ok(())
    }

    pub async fn reply_permission(&self, request_id: &str, reply: PermissionReply) -> Result<()> {
        let client = self.client()?;
        client.reply_permission(request_id, reply).await.map_err(|e| {
            tracing::warn!(request_id, "permission reply failed: {}", e);
            e
        })?;
        self.state.send_if_modified(|s| s.clear_permission(request_id).changed);
        Ok(())
    }

    pub fn select_model(&self, model: ModelRef) {
        let mut session_models = None;
        self.state.send_modify(|s| {
            if let Some(active) = s.active_session_id.clone() {
                s.session_models.insert(active, model.key());
                session_models = Some(s.session_models.clone());
            }
            s.selected_model = Some(model.clone());
        });
        self.persist(PersistedField::LastModel(Some(model.key())));
        if let Some(models) = session_models {
            self.persist(PersistedField::SessionModels(models));
        }
    }

    pub fn select_agent(&self, agent: Option<String>) {
        self.state.send_modify(|s| s.selected_agent = agent);
    }

    pub fn select_variant(&self, variant: Option<String>) {
        self.state.send_modify(|s| s.selected_variant = variant);
    }

    pub fn set_model_hidden(&self, model: &ModelRef, hidden: bool) {
        let key = model.key();
        let mut updated = None;
        self.state.send_if_modified(|s| {
            let changed = if hidden {
                s.hidden_models.insert(key.clone())
            } else {
                s.hidden_models.remove(&key)
            };
            if changed {
                updated = Some(s.hidden_models.clone());
            }
            changed
        });
        if let Some(hidden_models) = updated {
            self.persist(PersistedField::HiddenModels(hidden_models));
        }
    }

    pub fn mark_launched(&self) {
        self.state.send_modify(|s| s.has_launched = true);
        self.persist(PersistedField::HasLaunched(true));
    }

    pub async fn install_plugin(&self) -> Result<()> {
        self.host.install_plugin().await?;
        self.state.send_modify(|s| s.plugin_installed = true);
        Ok(())
    }

    pub async fn set_api_key(&self, provider_id: &str, key: &str) -> Result<()> {
        let client = self.client()?;
        tracing::info!(provider_id, key = %redact_text(key), "setting provider key");
        client.set_api_key(provider_id, key).await.map_err(|e| {
            tracing::warn!(provider_id, "set key failed: {}", e);
            e
        })?;
        self.refresh_after_auth_change(&client, provider_id).await
    }

    pub async fn start_oauth(&self, provider_id: &str, method: usize) -> Result<OAuthAuthorization> {
        let client = self.client()?;
        let authorization = client.oauth_authorize(provider_id, method).await.map_err(|e| {
            tracing::warn!(provider_id, "oauth authorize failed: {}", e);
            e
        })?;
        self.refresh_after_auth_change(&client, provider_id).await?;
        Ok(authorization)
    }

    pub async fn complete_oauth(
        &self,
        provider_id: &str,
        method: usize,
        code: Option<String>,
    ) -> Result<()> {
        let client = self.client()?;
        client
            .oauth_callback(provider_id, method, code)
            .await
            .map_err(|e| {
                tracing::warn!(provider_id, "oauth callback failed: {}", e);
                e
            })?;
        self.refresh_after_auth_change(&client, provider_id).await
    }

    pub async fn disconnect_provider(&self, provider_id: &str) -> Result<()> {
        let client = self.client()?;
        client.remove_auth(provider_id).await.map_err(|e| {
            tracing::warn!(provider_id, "disconnect failed: {}", e);
            e
        })?;
        self.refresh_after_auth_change(&client, provider_id).await
    }

    /// Invalidates the engine's cached provider state, then reloads the catalog.
    async fn refresh_after_auth_change(&self, client: &Arc<dyn EngineApi>, provider_id: &str) -> Result<()> {
        emit_event(
            tracing::Level::INFO,
            ProcessKind::Desktop,
            ObservabilityEvent {
                provider_id: Some(provider_id),
                ..ObservabilityEvent::new("provider.auth_changed", "store")
            },
        );
        client.dispose_instance().await?;
        let (providers, auth_methods) = tokio::join!(client.provider_catalog(), client.auth_methods());
        let providers = providers?;
        let auth_methods = auth_methods.unwrap_or_else(|e| {
            tracing::warn!("auth methods unavailable: {}", e);
            HashMap::new()
        });
        self.state.send_modify(|s| {
            let keep = s
                .selected_model
                .as_ref()
                .is_some_and(|m| providers.is_connected(&m.provider_id));
            if !keep {
                s.selected_model = resolve_initial_model(&providers, s.selected_model.as_ref());
            }
            s.catalog.providers = providers;
            s.catalog.auth_methods = auth_methods;
        });
        Ok(())
    }
}

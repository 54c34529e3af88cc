use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use reqwest::{Client, Method, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use serde_json::json;
use std::collections::HashMap;
use std::time::Duration;

use helm_types::{
    Agent, AuthMethod, EngineEvent, McpServerStatus, MessageWithParts, OAuthAuthorization,
    PermissionReply, PermissionRequest, PromptRequest, ProviderCatalog, QuestionRequest, Session,
    SessionStatus, Todo,
};

use crate::error::{ClientError, Result};
use crate::sse;

pub type EventStream = BoxStream<'static, Result<EngineEvent>>;

/// Everything the client layer asks of the session engine.
#[async_trait]
pub trait EngineApi: Send + Sync {
    async fn list_sessions(&self) -> Result<Vec<Session>>;
    async fn create_session(&self, title: Option<String>) -> Result<Session>;
    async fn delete_session(&self, session_id: &str) -> Result<()>;
    async fn session_messages(&self, session_id: &str) -> Result<Vec<MessageWithParts>>;
    async fn session_todos(&self, session_id: &str) -> Result<Vec<Todo>>;
    /// Non-idle sessions only; a missing id means idle.
    async fn session_statuses(&self) -> Result<HashMap<String, SessionStatus>>;
    async fn prompt_async(&self, session_id: &str, request: PromptRequest) -> Result<()>;
    async fn abort_session(&self, session_id: &str) -> Result<()>;

    async fn subscribe_events(&self) -> Result<EventStream>;

    async fn list_questions(&self) -> Result<Vec<QuestionRequest>>;
    async fn reply_question(&self, request_id: &str, answers: Vec<Vec<String>>) -> Result<()>;
    async fn reject_question(&self, request_id: &str) -> Result<()>;
    async fn list_permissions(&self) -> Result<Vec<PermissionRequest>>;
    async fn reply_permission(&self, request_id: &str, reply: PermissionReply) -> Result<()>;

    async fn provider_catalog(&self) -> Result<ProviderCatalog>;
    async fn auth_methods(&self) -> Result<HashMap<String, Vec<AuthMethod>>>;
    async fn list_agents(&self) -> Result<Vec<Agent>>;

    async fn set_api_key(&self, provider_id: &str, key: &str) -> Result<()>;
    async fn remove_auth(&self, provider_id: &str) -> Result<()>;
    async fn oauth_authorize(&self, provider_id: &str, method: usize)
        -> Result<OAuthAuthorization>;
    async fn oauth_callback(
        &self,
        provider_id: &str,
        method: usize,
        code: Option<String>,
    ) -> Result<()>;
    /// Drops the engine's cached per-directory state (providers, auth).
    async fn dispose_instance(&self) -> Result<()>;

    async fn mcp_status(&self) -> Result<HashMap<String, McpServerStatus>>;
    async fn mcp_connect(&self, name: &str) -> Result<()>;
}

fn build_http_client(timeout: Duration) -> Result<Client> {
    Ok(Client::builder().timeout(timeout).build()?)
}

fn build_stream_client() -> Result<Client> {
    Ok(Client::builder()
        .http1_only()
        .tcp_keepalive(Duration::from_secs(60))
        .build()?)
}

/// reqwest-backed client bound to one engine port and workspace directory.
#[derive(Clone)]
pub struct EngineClient {
    base_url: String,
    directory: Option<String>,
    http_client: Client,
    stream_client: Client,
}

impl EngineClient {
    pub fn new(port: u16, directory: Option<String>, request_timeout: Duration) -> Result<Self> {
        Self::with_base_url(format!("http://127.0.0.1:{}", port), directory, request_timeout)
    }

    pub fn with_base_url(
        base_url: impl Into<String>,
        directory: Option<String>,
        request_timeout: Duration,
    ) -> Result<Self> {
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            directory,
            http_client: build_http_client(request_timeout)?,
            stream_client: build_stream_client()?,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let url = format!("{}{}", self.base_url, path);
        let req = self.http_client.request(method, url);
        match self.directory.as_deref() {
            Some(directory) => req.query(&[("directory", directory)]),
            None => req,
        }
    }

    async fn fetch<T: DeserializeOwned>(&self, req: RequestBuilder) -> Result<T> {
        let response = req.send().await?;
        let (url, body) = Self::checked_body(response).await?;
        serde_json::from_str(&body).map_err(|e| {
            tracing::error!("Failed to parse response from {}: {}", url, e);
            tracing::debug!("Response body: {}", &body[..floor_char(&body, 1000)]);
            ClientError::Decode {
                url,
                message: e.to_string(),
            }
        })
    }

    async fn execute(&self, req: RequestBuilder) -> Result<()> {
        let response = req.send().await?;
        Self::checked_body(response).await.map(|_| ())
    }

    async fn checked_body(response: Response) -> Result<(String, String)> {
        let status = response.status();
        let url = response.url().path().to_string();
        let body = response.text().await.unwrap_or_default();
        if status.is_success() {
            tracing::trace!("Response from {}: {}", url, &body[..floor_char(&body, 500)]);
            return Ok((url, body));
        }
        tracing::warn!("Request to {} failed ({}): {}", url, status, &body[..floor_char(&body, 500)]);
        Err(ClientError::Status {
            url,
            status: status.as_u16(),
            body,
        })
    }
}

fn floor_char(s: &str, max: usize) -> usize {
    if s.len() <= max {
        return s.len();
    }
    let mut idx = max;
    while !s.is_char_boundary(idx) {
        idx -= 1;
    }
    idx
}

#[async_trait]
impl EngineApi for EngineClient {
    async fn list_sessions(&self) -> Result<Vec<Session>> {
        self.fetch(self.request(Method::GET, "/session")).await
    }

    async fn create_session(&self, title: Option<String>) -> Result<Session> {
        let body = match title {
            Some(title) => json!({ "title": title }),
            None => json!({}),
        };
        self.fetch(self.request(Method::POST, "/session").json(&body))
            .await
    }

    async fn delete_session(&self, session_id: &str) -> Result<()> {
        self.execute(self.request(Method::DELETE, &format!("/session/{}", session_id)))
            .await
    }

    async fn session_messages(&self, session_id: &str) -> Result<Vec<MessageWithParts>> {
        self.fetch(self.request(Method::GET, &format!("/session/{}/message", session_id)))
            .await
    }

    async fn session_todos(&self, session_id: &str) -> Result<Vec<Todo>> {
        self.fetch(self.request(Method::GET, &format!("/session/{}/todo", session_id)))
            .await
    }

    async fn session_statuses(&self) -> Result<HashMap<String, SessionStatus>> {
        self.fetch(self.request(Method::GET, "/session/status")).await
    }

    async fn prompt_async(&self, session_id: &str, request: PromptRequest) -> Result<()> {
        tracing::debug!(
            session_id,
            model = request.model.as_ref().map(|m| m.key()).unwrap_or_default(),
            "sending prompt"
        );
        self.execute(
            self.request(Method::POST, &format!("/session/{}/prompt_async", session_id))
                .json(&request),
        )
        .await
    }

    async fn abort_session(&self, session_id: &str) -> Result<()> {
        self.execute(
            self.request(Method::POST, &format!("/session/{}/abort", session_id))
                .timeout(Duration::from_secs(5)),
        )
        .await
    }

    async fn subscribe_events(&self) -> Result<EventStream> {
        let url = format!("{}/event", self.base_url);
        tracing::debug!("Subscribing to events at: {}", url);

        let mut req = self
            .stream_client
            .get(&url)
            .header("Accept", "text/event-stream");
        if let Some(directory) = self.directory.as_deref() {
            req = req.query(&[("directory", directory)]);
        }
        let response = req.send().await?;
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(ClientError::Status {
                url: "/event".to_string(),
                status,
                body,
            });
        }

        let bytes = response.bytes_stream();
        let stream = async_stream::stream! {
            let mut decoder = sse::EventDecoder::default();
            futures::pin_mut!(bytes);
            while let Some(chunk) = bytes.next().await {
                match chunk {
                    Ok(chunk) => {
                        for event in decoder.push(&chunk) {
                            yield Ok(event);
                        }
                    }
                    Err(e) => {
                        tracing::warn!("event stream read failed: {}", e);
                        yield Err(ClientError::Stream(e.to_string()));
                        break;
                    }
                }
            }
            tracing::debug!("event stream ended");
        };
        Ok(stream.boxed())
    }

    async fn list_questions(&self) -> Result<Vec<QuestionRequest>> {
        self.fetch(self.request(Method::GET, "/question")).await
    }

    async fn reply_question(&self, request_id: &str, answers: Vec<Vec<String>>) -> Result<()> {
        self.execute(
            self.request(Method::POST, &format!("/question/{}/reply", request_id))
                .json(&json!({ "answers": answers })),
        )
        .await
    }

    async fn reject_question(&self, request_id: &str) -> Result<()> {
        self.execute(self.request(Method::POST, &format!("/question/{}/reject", request_id)))
            .await
    }

    async fn list_permissions(&self) -> Result<Vec<PermissionRequest>> {
        self.fetch(self.request(Method::GET, "/permission")).await
    }

    async fn reply_permission(&self, request_id: &str, reply: PermissionReply) -> Result<()> {
        self.execute(
            self.request(Method::POST, &format!("/permission/{}/reply", request_id))
                .json(&json!({ "reply": reply })),
        )
        .await
    }

    async fn provider_catalog(&self) -> Result<ProviderCatalog> {
        self.fetch(self.request(Method::GET, "/provider")).await
    }

    async fn auth_methods(&self) -> Result<HashMap<String, Vec<AuthMethod>>> {
        self.fetch(self.request(Method::GET, "/provider/auth")).await
    }

    async fn list_agents(&self) -> Result<Vec<Agent>> {
        self.fetch(self.request(Method::GET, "/agent")).await
    }

    async fn set_api_key(&self, provider_id: &str, key: &str) -> Result<()> {
        self.execute(
            self.request(Method::PUT, &format!("/auth/{}", provider_id))
                .json(&json!({ "type": "api", "key": key })),
        )
        .await
    }

    async fn remove_auth(&self, provider_id: &str) -> Result<()> {
        self.execute(self.request(Method::DELETE, &format!("/auth/{}", provider_id)))
            .await
    }

    async fn oauth_authorize(
        &self,
        provider_id: &str,
        method: usize,
    ) -> Result<OAuthAuthorization> {
        self.fetch(
            self.request(
                Method::POST,
                &format!("/provider/{}/oauth/authorize", provider_id),
            )
            .json(&json!({ "method": method })),
        )
        .await
    }

    async fn oauth_callback(
        &self,
        provider_id: &str,
        method: usize,
        code: Option<String>,
    ) -> Result<()> {
        let mut body = json!({ "method": method });
        if let Some(code) = code {
            body["code"] = json!(code);
        }
        self.execute(
            self.request(
                Method::POST,
                &format!("/provider/{}/oauth/callback", provider_id),
            )
            .json(&body),
        )
        .await
    }

    async fn dispose_instance(&self) -> Result<()> {
        self.execute(self.request(Method::POST, "/instance/dispose"))
            .await
    }

    async fn mcp_status(&self) -> Result<HashMap<String, McpServerStatus>> {
        self.fetch(self.request(Method::GET, "/mcp")).await
    }

    async fn mcp_connect(&self, name: &str) -> Result<()> {
        self.execute(self.request(Method::POST, &format!("/mcp/{}/connect", name)))
            .await
    }
}

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;

use crate::error::{ClientError, Result};

/// What the bridge's own `/health` endpoint says about itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
pub struct BridgeHealthReport {
    #[serde(rename = "pluginConnected", alias = "plugin_connected", default)]
    pub plugin_connected: bool,
    #[serde(rename = "mcpServerActive", alias = "mcp_server_active", default)]
    pub server_active: bool,
}

impl BridgeHealthReport {
    pub fn fully_attached(&self) -> bool {
        self.plugin_connected && self.server_active
    }
}

#[async_trait]
pub trait BridgeProbe: Send + Sync {
    /// Succeeds whenever something answered 2xx on the bridge health port.
    async fn probe(&self) -> Result<BridgeHealthReport>;
}

pub struct HttpBridgeProbe {
    url: String,
    client: Client,
}

impl HttpBridgeProbe {
    pub fn new(port: u16, timeout: Duration) -> Result<Self> {
        Self::with_url(format!("http://127.0.0.1:{}/health", port), timeout)
    }

    pub fn with_url(url: impl Into<String>, timeout: Duration) -> Result<Self> {
        Ok(Self {
            url: url.into(),
            client: Client::builder().timeout(timeout).build()?,
        })
    }
}

#[async_trait]
impl BridgeProbe for HttpBridgeProbe {
    async fn probe(&self) -> Result<BridgeHealthReport> {
        let response = self.client.get(&self.url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(ClientError::Status {
                url: self.url.clone(),
                status: status.as_u16(),
                body: String::new(),
            });
        }
        let body = response.text().await.unwrap_or_default();
        Ok(serde_json::from_str(&body).unwrap_or_else(|e| {
            tracing::debug!("bridge health body not understood ({}): {}", e, body);
            BridgeHealthReport::default()
        }))
    }
}

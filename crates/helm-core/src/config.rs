use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::{HelmError, Result};

pub const DEFAULT_BRIDGE_PORT: u16 = 3002;
pub const DEFAULT_BRIDGE_SERVER: &str = "roblox-studio";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    pub directory_retry_ms: u64,
    pub init_base_delay_ms: u64,
    pub init_max_attempts: u32,
    pub stream_retry_ms: u64,
    /// Consecutive stream failures before the degraded notice is shown.
    pub degraded_threshold: u32,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            directory_retry_ms: 1000,
            init_base_delay_ms: 500,
            init_max_attempts: 5,
            stream_retry_ms: 2000,
            degraded_threshold: 3,
        }
    }
}

impl SupervisorConfig {
    pub fn directory_retry(&self) -> Duration {
        Duration::from_millis(self.directory_retry_ms)
    }

    pub fn stream_retry(&self) -> Duration {
        Duration::from_millis(self.stream_retry_ms)
    }

    /// Delay before init attempt `attempt + 1`, doubling from the base.
    pub fn init_delay(&self, attempt: u32) -> Duration {
        let factor = 1u64 << attempt.saturating_sub(1).min(16);
        Duration::from_millis(self.init_base_delay_ms.saturating_mul(factor))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub busy_reconcile_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            busy_reconcile_ms: 45_000,
        }
    }
}

impl StoreConfig {
    pub fn busy_reconcile(&self) -> Duration {
        Duration::from_millis(self.busy_reconcile_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    pub enabled: bool,
    /// Name of the bridge entry in the engine's server map.
    pub server_name: String,
    pub health_port: u16,
    pub poll_interval_ms: u64,
    pub probe_timeout_ms: u64,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            server_name: DEFAULT_BRIDGE_SERVER.to_string(),
            health_port: DEFAULT_BRIDGE_PORT,
            poll_interval_ms: 5000,
            probe_timeout_ms: 1500,
        }
    }
}

impl BridgeConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub request_timeout_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: 30_000,
        }
    }
}

impl EngineConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HelmConfig {
    pub supervisor: SupervisorConfig,
    pub store: StoreConfig,
    pub bridge: BridgeConfig,
    pub engine: EngineConfig,
}

impl HelmConfig {
    /// Reads the JSON file if present, applies environment overrides, then validates.
    pub fn load(path: &Path) -> Result<Self> {
        let mut config = if path.exists() {
            let raw = std::fs::read_to_string(path)?;
            serde_json::from_str::<HelmConfig>(&raw)?
        } else {
            tracing::debug!("no config at {}, using defaults", path.display());
            HelmConfig::default()
        };
        config.apply_env(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(port) = lookup("HELM_BRIDGE_PORT").and_then(|v| v.trim().parse().ok()) {
            self.bridge.health_port = port;
        }
        if let Some(name) = lookup("HELM_BRIDGE_SERVER").filter(|v| !v.trim().is_empty()) {
            self.bridge.server_name = name.trim().to_string();
        }
        if let Some(ms) = lookup("HELM_POLL_INTERVAL_MS").and_then(|v| v.trim().parse().ok()) {
            self.bridge.poll_interval_ms = ms;
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.supervisor.init_max_attempts == 0 {
            return Err(HelmError::InvalidConfig(
                "supervisor.init_max_attempts must be at least 1".to_string(),
            ));
        }
        if self.supervisor.degraded_threshold == 0 {
            return Err(HelmError::InvalidConfig(
                "supervisor.degraded_threshold must be at least 1".to_string(),
            ));
        }
        if self.bridge.poll_interval_ms == 0 {
            return Err(HelmError::InvalidConfig(
                "bridge.poll_interval_ms must be positive".to_string(),
            ));
        }
        if self.bridge.server_name.trim().is_empty() {
            return Err(HelmError::InvalidConfig(
                "bridge.server_name must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

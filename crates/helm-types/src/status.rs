use serde::{Deserialize, Serialize};

/// Engine process status as pushed by the host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum EngineStatus {
    Stopped,
    Starting,
    Running,
    Error(String),
}

impl EngineStatus {
    pub fn label(&self) -> &'static str {
        match self {
            EngineStatus::Stopped => "stopped",
            EngineStatus::Starting => "starting",
            EngineStatus::Running => "running",
            EngineStatus::Error(_) => "error",
        }
    }

    pub fn is_running(&self) -> bool {
        matches!(self, EngineStatus::Running)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusPayload {
    pub status: EngineStatus,
    pub port: u16,
}

impl StatusPayload {
    pub fn new(status: EngineStatus, port: u16) -> Self {
        Self { status, port }
    }

    pub fn stopped() -> Self {
        Self::new(EngineStatus::Stopped, 0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BridgeStatus {
    #[default]
    Unknown,
    Connected,
    Disconnected,
    Failed,
    Disabled,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BridgeHealth {
    pub status: BridgeStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl BridgeHealth {
    pub fn connected() -> Self {
        Self {
            status: BridgeStatus::Connected,
            error: None,
        }
    }

    pub fn disabled() -> Self {
        Self {
            status: BridgeStatus::Disabled,
            error: None,
        }
    }

    pub fn disconnected(reason: impl Into<String>) -> Self {
        Self {
            status: BridgeStatus::Disconnected,
            error: Some(reason.into()),
        }
    }

    pub fn failed(reason: impl Into<String>) -> Self {
        Self {
            status: BridgeStatus::Failed,
            error: Some(reason.into()),
        }
    }
}

/// One entry of the engine's `GET /mcp` map.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum McpServerStatus {
    Connected,
    Disabled,
    Failed {
        #[serde(default)]
        error: Option<String>,
    },
    NeedsAuth,
    NeedsClientRegistration {
        #[serde(default)]
        error: Option<String>,
    },
    #[serde(other)]
    Unknown,
}

impl McpServerStatus {
    pub fn label(&self) -> &'static str {
        match self {
            McpServerStatus::Connected => "connected",
            McpServerStatus::Disabled => "disabled",
            McpServerStatus::Failed { .. } => "failed",
            McpServerStatus::NeedsAuth => "needs_auth",
            McpServerStatus::NeedsClientRegistration { .. } => "needs_client_registration",
            McpServerStatus::Unknown => "unknown",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn engine_status_matches_host_payload_shape() {
        let running: StatusPayload =
            serde_json::from_str(r#"{"status":"Running","port":4096}"#).unwrap();
        assert_eq!(running, StatusPayload::new(EngineStatus::Running, 4096));

        let errored: StatusPayload =
            serde_json::from_str(r#"{"status":{"Error":"spawn failed"},"port":0}"#).unwrap();
        assert_eq!(errored.status, EngineStatus::Error("spawn failed".to_string()));
        assert_eq!(errored.status.label(), "error");
    }

    #[test]
    fn mcp_status_tolerates_unknown_states() {
        let failed: McpServerStatus =
            serde_json::from_str(r#"{"status":"failed","error":"Connection closed"}"#).unwrap();
        assert_eq!(failed.label(), "failed");

        let other: McpServerStatus = serde_json::from_str(r#"{"status":"warming"}"#).unwrap();
        assert_eq!(other, McpServerStatus::Unknown);
    }
}

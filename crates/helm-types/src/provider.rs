use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::fmt;

/// A provider/model pair. Persisted and compared through its `provider/model` key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ModelRef {
    #[serde(rename = "providerID", alias = "providerId")]
    pub provider_id: String,
    #[serde(rename = "modelID", alias = "modelId")]
    pub model_id: String,
}

impl ModelRef {
    pub fn new(provider_id: impl Into<String>, model_id: impl Into<String>) -> Self {
        Self {
            provider_id: provider_id.into(),
            model_id: model_id.into(),
        }
    }

    pub fn key(&self) -> String {
        format!("{}/{}", self.provider_id, self.model_id)
    }

    /// Splits on the first `/`; model ids may themselves contain slashes.
    pub fn parse(key: &str) -> Option<Self> {
        let (provider, model) = key.split_once('/')?;
        if provider.is_empty() || model.is_empty() {
            return None;
        }
        Some(Self::new(provider, model))
    }
}

impl fmt::Display for ModelRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.provider_id, self.model_id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Model {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub variants: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Provider {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub models: BTreeMap<String, Model>,
}

/// Response of `GET /provider`.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ProviderCatalog {
    #[serde(default)]
    pub all: Vec<Provider>,
    #[serde(default)]
    pub default: HashMap<String, String>,
    #[serde(default)]
    pub connected: Vec<String>,
}

impl ProviderCatalog {
    pub fn is_connected(&self, provider_id: &str) -> bool {
        self.connected.iter().any(|id| id == provider_id)
    }

    pub fn provider(&self, provider_id: &str) -> Option<&Provider> {
        self.all.iter().find(|p| p.id == provider_id)
    }

    /// Engine default for the first connected provider that reports one.
    pub fn first_connected_default(&self) -> Option<ModelRef> {
        self.connected.iter().find_map(|provider_id| {
            self.default
                .get(provider_id)
                .map(|model_id| ModelRef::new(provider_id.clone(), model_id.clone()))
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthMethodKind {
    Oauth,
    Api,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthMethod {
    #[serde(rename = "type")]
    pub kind: AuthMethodKind,
    #[serde(default)]
    pub label: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OAuthMode {
    Auto,
    Code,
}

/// Response of `POST /provider/{id}/oauth/authorize`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OAuthAuthorization {
    pub url: String,
    pub method: OAuthMode,
    #[serde(default)]
    pub instructions: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Agent {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub mode: AgentMode,
    #[serde(default)]
    pub hidden: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentMode {
    Primary,
    Subagent,
    #[default]
    All,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn model_ref_key_round_trips_slashed_model_ids() {
        let model = ModelRef::parse("openrouter/anthropic/claude-sonnet").unwrap();
        assert_eq!(model.provider_id, "openrouter");
        assert_eq!(model.model_id, "anthropic/claude-sonnet");
        assert_eq!(model.key(), "openrouter/anthropic/claude-sonnet");
        assert!(ModelRef::parse("no-slash").is_none());
        assert!(ModelRef::parse("/model").is_none());
    }

    #[test]
    fn catalog_default_follows_connected_order() {
        let catalog: ProviderCatalog = serde_json::from_value(json!({
            "all": [
                {"id": "anthropic", "name": "Anthropic", "models": {"claude": {"id": "claude", "name": "Claude"}}},
                {"id": "openai", "name": "OpenAI", "models": {}}
            ],
            "default": {"anthropic": "claude", "openai": "gpt"},
            "connected": ["openai", "anthropic"]
        }))
        .unwrap();
        assert_eq!(
            catalog.first_connected_default(),
            Some(ModelRef::new("openai", "gpt"))
        );
        assert!(catalog.is_connected("anthropic"));
        assert_eq!(catalog.provider("anthropic").unwrap().models.len(), 1);
    }
}

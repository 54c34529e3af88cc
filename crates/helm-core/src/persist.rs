//! Persisted user state: own sessions, hidden models, first-run flag, model choices.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use helm_types::ModelRef;

use crate::error::{HelmError, Result};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedState {
    #[serde(default)]
    pub own_sessions: BTreeSet<String>,
    /// `provider/model` keys hidden from the picker.
    #[serde(default)]
    pub hidden_models: BTreeSet<String>,
    #[serde(default)]
    pub has_launched: bool,
    /// Session id to `provider/model` key.
    #[serde(default)]
    pub session_models: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_model: Option<String>,
}

impl PersistedState {
    pub fn last_model_ref(&self) -> Option<ModelRef> {
        self.last_model.as_deref().and_then(ModelRef::parse)
    }

    pub fn session_model(&self, session_id: &str) -> Option<ModelRef> {
        self.session_models
            .get(session_id)
            .and_then(|key| ModelRef::parse(key))
    }

    pub fn apply(&mut self, field: PersistedField) {
        match field {
            PersistedField::OwnSessions(v) => self.own_sessions = v,
            PersistedField::HiddenModels(v) => self.hidden_models = v,
            PersistedField::HasLaunched(v) => self.has_launched = v,
            PersistedField::SessionModels(v) => self.session_models = v,
            PersistedField::LastModel(v) => self.last_model = v,
        }
    }
}

/// One persisted key with its full new value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PersistedField {
    OwnSessions(BTreeSet<String>),
    HiddenModels(BTreeSet<String>),
    HasLaunched(bool),
    SessionModels(BTreeMap<String, String>),
    LastModel(Option<String>),
}

impl PersistedField {
    pub fn key(&self) -> &'static str {
        match self {
            PersistedField::OwnSessions(_) => "ownSessions",
            PersistedField::HiddenModels(_) => "hiddenModels",
            PersistedField::HasLaunched(_) => "hasLaunched",
            PersistedField::SessionModels(_) => "sessionModels",
            PersistedField::LastModel(_) => "lastModel",
        }
    }

    fn to_value(&self) -> Result<Value> {
        let value = match self {
            PersistedField::OwnSessions(v) | PersistedField::HiddenModels(v) => {
                serde_json::to_value(v)?
            }
            PersistedField::HasLaunched(v) => Value::Bool(*v),
            PersistedField::SessionModels(v) => serde_json::to_value(v)?,
            PersistedField::LastModel(v) => serde_json::to_value(v)?,
        };
        Ok(value)
    }
}

pub trait StateRepository: Send + Sync {
    fn load_all(&self) -> Result<PersistedState>;
    fn save_field(&self, field: PersistedField) -> Result<()>;
}

/// JSON file store. Writes merge one key into the existing document so keys
/// owned by other components survive.
pub struct JsonFileRepository {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonFileRepository {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    /// `<data dir>/helm/state.json`, falling back to the working directory.
    pub fn default_path() -> PathBuf {
        dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("helm")
            .join("state.json")
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_document(&self) -> Result<Map<String, Value>> {
        if !self.path.exists() {
            return Ok(Map::new());
        }
        let raw = fs::read_to_string(&self.path)?;
        match serde_json::from_str::<Value>(&raw) {
            Ok(Value::Object(map)) => Ok(map),
            Ok(_) | Err(_) => {
                tracing::warn!("state file {} is corrupt, starting fresh", self.path.display());
                Ok(Map::new())
            }
        }
    }
}

impl StateRepository for JsonFileRepository {
    fn load_all(&self) -> Result<PersistedState> {
        let doc = self.read_document()?;
        serde_json::from_value(Value::Object(doc)).or_else(|e| {
            tracing::warn!("state file has unexpected shape, using defaults: {}", e);
            Ok(PersistedState::default())
        })
    }

    fn save_field(&self, field: PersistedField) -> Result<()> {
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        let mut doc = self.read_document()?;
        match field.to_value()? {
            Value::Null => {
                doc.remove(field.key());
            }
            value => {
                doc.insert(field.key().to_string(), value);
            }
        }
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(&Value::Object(doc))?;
        atomic_write(&self.path, &content)
    }
}

fn atomic_write(path: &Path, content: &str) -> Result<()> {
    let temp_path = path.with_extension("tmp");
    fs::write(&temp_path, content)
        .map_err(|e| HelmError::Persist(format!("Failed to write temp file: {}", e)))?;
    fs::rename(&temp_path, path)
        .map_err(|e| HelmError::Persist(format!("Failed to rename temp file: {}", e)))?;
    Ok(())
}

use helm_client::ClientError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum HelmError {
    #[error("Engine error: {0}")]
    Client(#[from] ClientError),

    #[error("Host error: {0}")]
    Host(String),

    #[error("Persistence error: {0}")]
    Persist(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Engine is not connected")]
    NotConnected,

    #[error("No active session")]
    NoActiveSession,

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Logging setup failed: {0}")]
    Logging(String),
}

// UI layers receive errors as display strings.
impl serde::Serialize for HelmError {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

pub type Result<T> = std::result::Result<T, HelmError>;

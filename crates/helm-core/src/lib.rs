pub mod app;
pub mod bridge;
pub mod config;
pub mod error;
pub mod host;
pub mod persist;
pub mod snapshot;
pub mod store;
pub mod supervisor;

#[cfg(test)]
mod testing;

pub use app::HelmApp;
pub use bridge::detect_bridge;
pub use config::{BridgeConfig, EngineConfig, HelmConfig, StoreConfig, SupervisorConfig};
pub use error::{HelmError, Result};
pub use host::{wait_for_port_release, Host};
pub use persist::{JsonFileRepository, PersistedField, PersistedState, StateRepository};
pub use snapshot::{Catalog, Snapshot, StoreEffect};
pub use store::{InitOutcome, SessionStore};
pub use supervisor::{
    ConnectionNotice, ConnectionSupervisor, ConnectionView, EngineConnector, HttpConnector,
};

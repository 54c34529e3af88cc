pub mod bridge;
pub mod engine;
pub mod error;
pub mod sse;

pub use bridge::{BridgeHealthReport, BridgeProbe, HttpBridgeProbe};
pub use engine::{EngineApi, EngineClient, EventStream};
pub use error::{ClientError, Result};

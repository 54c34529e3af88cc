pub mod event;
pub mod provider;
pub mod request;
pub mod session;
pub mod status;

pub use event::*;
pub use provider::*;
pub use request::*;
pub use session::*;
pub use status::*;

pub mod bridge;
pub mod cli;
pub mod config;
pub(crate) mod dispatch;
pub mod error;
pub mod host;
pub mod loader;
pub(crate) mod resolver;
pub mod runtime;

pub use bridge::{Bridge, BridgeState};
pub use config::BridgeConfig;
pub use error::{BridgeError, UnwrapError};
pub use host::{HostObject, HostRef};
pub use runtime::{AnyRef, ObjectRef, RuntimeHandle};

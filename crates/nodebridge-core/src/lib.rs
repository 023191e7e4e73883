pub mod bridge;
pub mod channel;
pub mod config;
pub mod engine;
pub mod error;
pub mod lifecycle;
pub mod paths;
pub mod provision;
pub mod ready;
pub mod transport;

#[cfg(test)]
mod testing;

pub use bridge::{HostEnvironment, ListenerHandle, NodeJsBridge, ReadyHandle, StartOptions};
pub use config::{BridgeConfig, StartMode};
pub use engine::{EngineState, NodeEngine, StartHandle, StartRequest};
pub use error::{ConfigError, LaunchError, SendError, StartError};
pub use transport::{NodeProcess, ProcessRuntimeConfig, StdioNodeProcess};

pub mod agent;
pub mod config;
pub mod host;
pub mod sim;
pub mod tags;

// Core API
pub use agent::{FATAL_EXIT_CODE, HostEvents, TagAgent, TagStats, fatal_error};
pub use config::{AgentConfig, ConfigError};
pub use host::{
    Capabilities, HostError, HostEvent, HostRuntime, NO_TAG, NativeBinding, NativeMethod,
    SetupError, TagWord,
};
pub use tags::{OwnedHandle, SweepState};

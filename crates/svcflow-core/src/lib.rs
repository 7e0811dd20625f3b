pub mod config;
pub mod types;

pub use config::{
    BackendConfig, ConfigError, DispatcherConfig, EventsConfig, FlowConfig, LifecycleConfig,
    StoreConfig,
};
pub use types::*;

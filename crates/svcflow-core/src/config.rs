//! flow.toml configuration parser.
//!
//! Every section and field is optional; a missing file section falls back
//! to the defaults below.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::types::ShutdownAction;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("dispatcher.concurrency must be at least 1")]
    ZeroConcurrency,

    #[error("events.max_concurrent_waits must be at least 1")]
    ZeroWaitLimit,

    #[error("events.wait_timeout_secs must be greater than 0")]
    ZeroWaitTimeout,

    #[error("lifecycle.action_number must be at least 1")]
    ZeroActionNumber,

    #[error("invalid subscriber endpoint: {0}")]
    Endpoint(String),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FlowConfig {
    pub store: StoreConfig,
    pub backend: BackendConfig,
    pub events: EventsConfig,
    pub dispatcher: DispatcherConfig,
    pub lifecycle: LifecycleConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub path: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("/var/lib/svcflow/flow.redb"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    /// `host:port` of the compute backend's HTTP endpoint.
    pub endpoint: String,
    pub request_timeout_secs: u64,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            endpoint: "127.0.0.1:2633".to_string(),
            request_timeout_secs: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EventsConfig {
    /// Publisher to subscribe to, e.g. `tcp://localhost:2101`.
    pub subscriber_endpoint: String,
    /// Receive timeout before falling back to polling the backend.
    pub wait_timeout_secs: u64,
    /// Upper bound on waits running at the same time.
    pub max_concurrent_waits: usize,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            subscriber_endpoint: "tcp://localhost:2101".to_string(),
            wait_timeout_secs: 30,
            max_concurrent_waits: 64,
        }
    }
}

impl EventsConfig {
    pub fn wait_timeout(&self) -> Duration {
        Duration::from_secs(self.wait_timeout_secs)
    }

    /// The `host:port` part of the subscriber endpoint.
    pub fn subscriber_addr(&self) -> Result<String, ConfigError> {
        let addr = self
            .subscriber_endpoint
            .strip_prefix("tcp://")
            .unwrap_or(&self.subscriber_endpoint);

        match addr.rsplit_once(':') {
            Some((host, port)) if !host.is_empty() && port.parse::<u16>().is_ok() => {
                Ok(addr.to_string())
            }
            _ => Err(ConfigError::Endpoint(self.subscriber_endpoint.clone())),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    pub concurrency: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self { concurrency: 10 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LifecycleConfig {
    pub default_cooldown_secs: u64,
    pub shutdown_action: ShutdownAction,
    /// Destroy nodes immediately when a service is deleted.
    pub force_deletion: bool,
    /// Seconds between batches of a scheduled role action.
    pub action_period_secs: u64,
    /// Nodes per batch of a scheduled role action.
    pub action_number: u32,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            default_cooldown_secs: 300,
            shutdown_action: ShutdownAction::Terminate,
            force_deletion: false,
            action_period_secs: 60,
            action_number: 1,
        }
    }
}

impl LifecycleConfig {
    pub fn default_cooldown(&self) -> Duration {
        Duration::from_secs(self.default_cooldown_secs)
    }
}

impl FlowConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: FlowConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Reject values the engine cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.dispatcher.concurrency == 0 {
            return Err(ConfigError::ZeroConcurrency);
        }
        if self.events.max_concurrent_waits == 0 {
            return Err(ConfigError::ZeroWaitLimit);
        }
        if self.events.wait_timeout_secs == 0 {
            return Err(ConfigError::ZeroWaitTimeout);
        }
        if self.lifecycle.action_number == 0 {
            return Err(ConfigError::ZeroActionNumber);
        }
        self.events.subscriber_addr()?;
        Ok(())
    }
}

// Runtime Configuration
//
// Configuration for the durable runtime, built in code or loaded from
// environment variables.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::engine::ExecutorConfig;
use crate::queue::PollerConfig;

/// Executor id used when none is configured
///
/// Recovery only resumes instances owned by the same executor id, so a
/// restarted process must come back with the id it had before.
pub const DEFAULT_EXECUTOR_ID: &str = "local";

/// Application version used when none is configured
pub const DEFAULT_APP_VERSION: &str = "0";

/// Where workflow state is kept
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StoreConfig {
    /// Process-local store; state is lost when the process exits
    Memory,

    /// PostgreSQL database
    Postgres {
        url: String,
        /// Overrides the user in `url`
        user: Option<String>,
        /// Overrides the password in `url`
        #[serde(skip_serializing)]
        password: Option<String>,
        max_connections: u32,
    },
}

impl StoreConfig {
    pub fn postgres(url: impl Into<String>) -> Self {
        Self::Postgres {
            url: url.into(),
            user: None,
            password: None,
            max_connections: 10,
        }
    }
}

/// Configuration of a [`DurableRuntime`](crate::DurableRuntime)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DurableConfig {
    /// Application name, used in logs
    pub app_name: String,

    /// Version tag stamped on every instance this process creates; only
    /// instances with a matching tag are recovered or dispatched here
    pub app_version: String,

    /// Identity of this process in the store
    pub executor_id: String,

    pub store: StoreConfig,

    pub dispatcher: PollerConfig,

    pub executor: ExecutorConfig,

    /// How long `shutdown` waits for in-flight attempts to stop
    #[serde(with = "duration_millis")]
    pub shutdown_timeout: Duration,
}

impl Default for DurableConfig {
    fn default() -> Self {
        Self {
            app_name: "durable".to_string(),
            app_version: DEFAULT_APP_VERSION.to_string(),
            executor_id: DEFAULT_EXECUTOR_ID.to_string(),
            store: StoreConfig::Memory,
            dispatcher: PollerConfig::default(),
            executor: ExecutorConfig::default(),
            shutdown_timeout: Duration::from_secs(10),
        }
    }
}

impl DurableConfig {
    /// In-memory configuration named `app_name`
    pub fn new(app_name: impl Into<String>) -> Self {
        Self {
            app_name: app_name.into(),
            ..Default::default()
        }
    }

    /// Create configuration from environment variables
    ///
    /// Environment variables:
    /// - `DURABLE_APP_NAME`: application name (default: durable)
    /// - `DURABLE_APP_VERSION`: application version tag (default: 0)
    /// - `DURABLE_EXECUTOR_ID`: executor identity (default: local)
    /// - `DURABLE_DATABASE_URL` or `DATABASE_URL`: PostgreSQL URL; the
    ///   in-memory store is used when neither is set
    /// - `PGUSER`, `PGPASSWORD`: credentials overriding those in the URL
    /// - `DURABLE_MAX_CONNECTIONS`: connection pool size (default: 10)
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let store = match lookup("DURABLE_DATABASE_URL").or_else(|| lookup("DATABASE_URL")) {
            Some(url) if !url.trim().is_empty() => {
                let max_connections = match lookup("DURABLE_MAX_CONNECTIONS") {
                    Some(raw) => raw.trim().parse().map_err(|_| ConfigError::Invalid {
                        key: "DURABLE_MAX_CONNECTIONS",
                        value: raw,
                    })?,
                    None => 10,
                };
                StoreConfig::Postgres {
                    url,
                    user: lookup("PGUSER"),
                    password: lookup("PGPASSWORD"),
                    max_connections,
                }
            }
            _ => StoreConfig::Memory,
        };

        Ok(Self {
            app_name: lookup("DURABLE_APP_NAME").unwrap_or(defaults.app_name),
            app_version: lookup("DURABLE_APP_VERSION").unwrap_or(defaults.app_version),
            executor_id: lookup("DURABLE_EXECUTOR_ID").unwrap_or(defaults.executor_id),
            store,
            ..defaults
        })
    }

    pub fn with_app_version(mut self, version: impl Into<String>) -> Self {
        self.app_version = version.into();
        self
    }

    pub fn with_executor_id(mut self, executor_id: impl Into<String>) -> Self {
        self.executor_id = executor_id.into();
        self
    }

    pub fn with_store(mut self, store: StoreConfig) -> Self {
        self.store = store;
        self
    }

    pub fn with_dispatcher(mut self, dispatcher: PollerConfig) -> Self {
        self.dispatcher = dispatcher;
        self
    }

    pub fn with_executor(mut self, executor: ExecutorConfig) -> Self {
        self.executor = executor;
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Reject settings the runtime cannot start with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.executor_id.trim().is_empty() {
            return Err(ConfigError::Missing("executor_id"));
        }
        if self.app_version.trim().is_empty() {
            return Err(ConfigError::Missing("app_version"));
        }
        if let StoreConfig::Postgres { url, .. } = &self.store {
            if url.trim().is_empty() {
                return Err(ConfigError::Missing("store.url"));
            }
        }
        Ok(())
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing configuration value: {0}")]
    Missing(&'static str),

    #[error("invalid value for {key}: {value:?}")]
    Invalid { key: &'static str, value: String },
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}

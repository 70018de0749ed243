use std::collections::HashMap;
use std::time::Duration;

use config::{Config as ConfigLib, ConfigBuilder, ConfigError, Environment, builder::DefaultState};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub webhooks: WebhooksConfig,
    pub scheduler: SchedulerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// SQLite file holding subscriptions and the delivery log.
    /// `:memory:` keeps everything in process.
    pub path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhooksConfig {
    pub dispatch_timeout_secs: u64,
    pub max_attempts: u32,
    pub retry_base_delay_secs: u64,
    pub retry_max_delay_secs: u64,
    /// How long a worker owns a delivery while an attempt is in flight.
    pub claim_lease_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    pub interval_secs: u64,
    pub concurrency: usize,
    pub batch_size: usize,
}

impl WebhooksConfig {
    pub fn dispatch_timeout(&self) -> Duration {
        Duration::from_secs(self.dispatch_timeout_secs)
    }

    pub fn claim_lease(&self) -> Duration {
        Duration::from_secs(self.claim_lease_secs)
    }
}

impl SchedulerConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.max(1))
    }
}

impl Config {
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_with_sources(None)
    }

    pub fn load_with_sources(env_vars: Option<HashMap<String, String>>) -> Result<Self, ConfigError> {
        let mut builder = Self::set_defaults()?;
        // Explicit overrides replace the process environment so tests stay isolated
        if let Some(vars) = env_vars {
            for (key, value) in vars {
                builder = builder.set_override(&key, value)?;
            }
        } else {
            // e.g. APP_SERVER__PORT or APP_WEBHOOKS__MAX_ATTEMPTS
            builder = builder.add_source(
                Environment::with_prefix("APP")
                    .prefix_separator("_")
                    .separator("__"),
            );
        }

        builder.build()?.try_deserialize()
    }

    /// Set default values for the configuration.
    /// This is used when no environment variables or config file are provided
    fn set_defaults() -> Result<ConfigBuilder<DefaultState>, ConfigError> {
        ConfigLib::builder()
            .set_default("server.host", "127.0.0.1")?
            .set_default("server.port", 3000)?
            .set_default("database.path", "webhooks.db")?
            .set_default("webhooks.dispatch_timeout_secs", 30)?
            .set_default("webhooks.max_attempts", 5)?
            .set_default("webhooks.retry_base_delay_secs", 60)?
            .set_default("webhooks.retry_max_delay_secs", 86_400)?
            .set_default("webhooks.claim_lease_secs", 120)?
            .set_default("scheduler.interval_secs", 60)?
            .set_default("scheduler.concurrency", 8)?
            .set_default("scheduler.batch_size", 100)
    }
}

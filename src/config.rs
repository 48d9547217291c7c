//! Service configuration
//!
//! Defaults, then an optional `tenant-ledger.toml`, then `LEDGER_*`
//! environment variables (`__` separates nested keys, e.g.
//! `LEDGER_RECONCILER__BATCH_SIZE=50`). `DATABASE_URL` overrides
//! `database_url` when set.

use config::{builder::DefaultState, Config, ConfigBuilder, Environment, File};
use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;
use tracing::info;

use crate::error::{LedgerError, LedgerResult};

const CONFIG_FILE: &str = "tenant-ledger";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub database_url: String,
    pub server_host: String,
    pub server_port: u16,
    pub writer: WriterConfig,
    pub reconciler: ReconcilerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WriterConfig {
    /// Head reads attempted before an append gives up on a contended tenant.
    pub max_append_attempts: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconcilerConfig {
    pub enabled: bool,
    pub interval_secs: u64,
    /// Unhashed records backfilled per cycle.
    pub batch_size: u32,
    /// Run the validation sweep on every Nth cycle.
    pub validation_every_cycles: u64,
    /// Trailing records per tenant re-derived by the sweep.
    pub validation_window: u32,
    pub failure_cooldown_secs: u64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite://tenant-ledger.db?mode=rwc".to_string(),
            server_host: "0.0.0.0".to_string(),
            server_port: 3000,
            writer: WriterConfig::default(),
            reconciler: ReconcilerConfig::default(),
        }
    }
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            max_append_attempts: 5,
        }
    }
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 10,
            batch_size: 100,
            validation_every_cycles: 30,
            validation_window: 500,
            failure_cooldown_secs: 30,
        }
    }
}

impl ReconcilerConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn failure_cooldown(&self) -> Duration {
        Duration::from_secs(self.failure_cooldown_secs)
    }
}

impl AppConfig {
    /// Load configuration from the config file and environment
    pub fn load() -> LedgerResult<Self> {
        let builder = Config::builder()
            .add_source(File::with_name(CONFIG_FILE).required(false))
            .add_source(
                Environment::with_prefix("LEDGER")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .set_override_option("database_url", env::var("DATABASE_URL").ok())?;

        let config = Self::from_builder(builder)?;
        info!(
            "Configuration loaded (server {}:{}, reconciler enabled: {})",
            config.server_host, config.server_port, config.reconciler.enabled
        );
        Ok(config)
    }

    fn from_builder(builder: ConfigBuilder<DefaultState>) -> LedgerResult<Self> {
        let config: AppConfig = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings that would stall the writer or the reconciler
    pub fn validate(&self) -> LedgerResult<()> {
        if self.database_url.trim().is_empty() {
            return Err(LedgerError::ConfigError(
                "database_url must not be empty".to_string(),
            ));
        }

        if self.writer.max_append_attempts == 0 {
            return Err(LedgerError::ConfigError(
                "writer.max_append_attempts must be at least 1".to_string(),
            ));
        }

        let reconciler = &self.reconciler;
        if reconciler.interval_secs == 0 {
            return Err(LedgerError::ConfigError(
                "reconciler.interval_secs must be at least 1".to_string(),
            ));
        }

        if reconciler.batch_size == 0 {
            return Err(LedgerError::ConfigError(
                "reconciler.batch_size must be at least 1".to_string(),
            ));
        }

        if reconciler.validation_every_cycles == 0 {
            return Err(LedgerError::ConfigError(
                "reconciler.validation_every_cycles must be at least 1".to_string(),
            ));
        }

        if reconciler.validation_window < 2 {
            return Err(LedgerError::ConfigError(format!(
                "reconciler.validation_window ({}) must cover at least two records",
                reconciler.validation_window
            )));
        }

        Ok(())
    }
}

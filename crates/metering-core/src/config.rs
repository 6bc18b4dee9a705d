use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::time::Duration;

/// Main metering configuration
#[derive(Debug, Clone, Deserialize)]
pub struct MeteringConfig {
    pub database: DatabaseConfig,
    pub ledger: LedgerConfig,
    pub catalog: CatalogConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl MeteringConfig {
    /// Load configuration from environment variables
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from_env("METERING")
    }

    /// Load configuration from environment with custom prefix
    pub fn load_from_env(prefix: &str) -> Result<Self, ConfigError> {
        let builder = Self::with_defaults(Config::builder())?.add_source(
            Environment::with_prefix(prefix)
                .separator("__")
                .try_parsing(true),
        );

        Self::validated(builder.build()?.try_deserialize()?)
    }

    /// Load configuration from file with environment overrides
    pub fn load_from_file(path: &str) -> Result<Self, ConfigError> {
        let builder = Self::with_defaults(Config::builder())?
            .add_source(File::with_name(path))
            .add_source(
                Environment::with_prefix("METERING")
                    .separator("__")
                    .try_parsing(true),
            );

        Self::validated(builder.build()?.try_deserialize()?)
    }

    fn validated(config: Self) -> Result<Self, ConfigError> {
        config.ledger.validate()?;
        Ok(config)
    }

    fn with_defaults(
        builder: config::ConfigBuilder<config::builder::DefaultState>,
    ) -> Result<config::ConfigBuilder<config::builder::DefaultState>, ConfigError> {
        builder
            .set_default("database.url", "postgres://localhost/metering")?
            .set_default("database.max_connections", default_max_connections())?
            .set_default("database.min_connections", default_min_connections())?
            .set_default("database.lock_timeout_ms", default_lock_timeout_ms())?
            .set_default("ledger.reservation_ttl_seconds", default_reservation_ttl_seconds())?
            .set_default("ledger.max_retries", default_max_retries())?
            .set_default("ledger.initial_backoff_ms", default_initial_backoff_ms())?
            .set_default("ledger.max_backoff_ms", default_max_backoff_ms())?
            .set_default("ledger.warning_threshold", default_warning_threshold())?
            .set_default("catalog.path", "catalog.toml")?
            .set_default("logging.level", "info")?
            .set_default("logging.json", false)
    }
}

/// Database configuration
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,
    /// How long a debit waits on the per-(tenant, pool) lock
    #[serde(default = "default_lock_timeout_ms")]
    pub lock_timeout_ms: u64,
}

impl DatabaseConfig {
    pub fn new(url: String) -> Self {
        Self {
            url,
            max_connections: default_max_connections(),
            min_connections: default_min_connections(),
            lock_timeout_ms: default_lock_timeout_ms(),
        }
    }

    pub fn with_pool_size(mut self, min: u32, max: u32) -> Self {
        self.min_connections = min;
        self.max_connections = max;
        self
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }
}

fn default_max_connections() -> u32 {
    10
}

fn default_min_connections() -> u32 {
    2
}

fn default_lock_timeout_ms() -> u64 {
    2_000
}

/// Longest reservation a long-running action may hold
pub const MAX_RESERVATION_TTL_SECONDS: u64 = 7 * 24 * 60 * 60;

/// Ledger behaviour
#[derive(Debug, Clone, Deserialize)]
pub struct LedgerConfig {
    #[serde(default = "default_reservation_ttl_seconds")]
    pub reservation_ttl_seconds: u64,
    /// Retries after a concurrency conflict before surfacing it
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    /// Fraction of the included allotment at which usage is logged as a warning
    #[serde(default = "default_warning_threshold")]
    pub warning_threshold: f64,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            reservation_ttl_seconds: default_reservation_ttl_seconds(),
            max_retries: default_max_retries(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            warning_threshold: default_warning_threshold(),
        }
    }
}

impl LedgerConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(1..=MAX_RESERVATION_TTL_SECONDS).contains(&self.reservation_ttl_seconds) {
            return Err(ConfigError::Message(format!(
                "ledger.reservation_ttl_seconds must be between 1 and {MAX_RESERVATION_TTL_SECONDS}, got {}",
                self.reservation_ttl_seconds
            )));
        }
        if !(0.0..=1.0).contains(&self.warning_threshold) {
            return Err(ConfigError::Message(format!(
                "ledger.warning_threshold must be within 0..=1, got {}",
                self.warning_threshold
            )));
        }
        Ok(())
    }

    pub fn with_reservation_ttl(mut self, seconds: u64) -> Self {
        self.reservation_ttl_seconds = seconds;
        self
    }

    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    pub fn reservation_ttl(&self) -> Duration {
        Duration::from_secs(self.reservation_ttl_seconds)
    }

    pub fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.initial_backoff_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }
}

fn default_reservation_ttl_seconds() -> u64 {
    300
}

fn default_max_retries() -> u32 {
    5
}

fn default_initial_backoff_ms() -> u64 {
    10
}

fn default_max_backoff_ms() -> u64 {
    500
}

fn default_warning_threshold() -> f64 {
    0.8
}

/// Pricing catalog location
#[derive(Debug, Clone, Deserialize)]
pub struct CatalogConfig {
    pub path: String,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

//! Configuration loading and validation.
//!
//! Loads Herald configuration from `./herald.toml` (or `$HERALD_CONFIG_PATH`).
//! Every section is optional and falls back to defaults.
//!
//! Precedence: env vars > config file > defaults.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::delivery::{DeliveryConfig, StoreFaultPolicy, DEFAULT_BATCH_LIMIT};
use crate::reconcile::ReconcileConfig;
use crate::store::sqlite::DEFAULT_BUSY_TIMEOUT;

/// Largest accepted `delivery.batch_limit`.
pub const MAX_BATCH_LIMIT: u32 = 100;

/// Minimum headroom of `database.busy_timeout_secs` over
/// `webhook.timeout_secs`.
pub const BUSY_TIMEOUT_MARGIN_SECS: u64 = 5;

/// Largest accepted `cache.record_ttl_secs` (ten years).
pub const MAX_RECORD_TTL_SECS: u64 = 315_360_000;

// ── Top-level config ────────────────────────────────────────────

/// Top-level Herald configuration loaded from TOML.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct HeraldConfig {
    /// Durable store location (`[database]`).
    pub database: DatabaseConfig,
    /// Record cache connection (`[cache]`).
    pub cache: CacheConfig,
    /// External sender endpoint (`[webhook]`).
    pub webhook: WebhookConfig,
    /// Delivery engine tuning (`[delivery]`).
    pub delivery: DeliverySettings,
    /// Reconciler tuning (`[reconcile]`).
    pub reconcile: ReconcileSettings,
    /// HTTP control surface (`[server]`).
    pub server: ServerConfig,
    /// Log output (`[logging]`).
    pub logging: LoggingConfig,
}

impl HeraldConfig {
    /// Load configuration with precedence: env vars > TOML file > defaults.
    ///
    /// Config file path: `$HERALD_CONFIG_PATH` or `./herald.toml`.
    /// A missing file yields defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load() -> Result<Self> {
        let mut config = Self::load_from_file()?;
        config.apply_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    fn load_from_file() -> Result<Self> {
        let path = Self::config_path_with(|key| std::env::var(key).ok());
        match std::fs::read_to_string(&path) {
            Ok(contents) => {
                tracing::info!(path = %path.display(), "loading config from file");
                Self::from_toml(&contents)
                    .with_context(|| format!("invalid config file {}", path.display()))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!("no config file found, using defaults");
                Ok(Self::default())
            }
            Err(e) => Err(anyhow::anyhow!(
                "failed to read config file {}: {e}",
                path.display()
            )),
        }
    }

    /// Resolve the config file path using a custom env resolver.
    pub fn config_path_with(env: impl Fn(&str) -> Option<String>) -> PathBuf {
        env("HERALD_CONFIG_PATH").map_or_else(|| PathBuf::from("herald.toml"), PathBuf::from)
    }

    /// Apply environment variable overrides (env > config > defaults).
    ///
    /// Takes a resolver function so tests need not touch the process environment.
    pub fn apply_overrides(&mut self, env: impl Fn(&str) -> Option<String>) {
        if let Some(v) = env("HERALD_DATABASE_PATH") {
            self.database.path = Some(PathBuf::from(v));
        }
        if let Some(v) = env("HERALD_REDIS_URL") {
            self.cache.redis_url = v;
        }
        if let Some(v) = env("HERALD_WEBHOOK_URL") {
            self.webhook.url = v;
        }
        if let Some(v) = env("HERALD_BIND") {
            self.server.bind = v;
        }
        if let Some(v) = env("HERALD_BATCH_LIMIT") {
            match v.parse() {
                Ok(n) => self.delivery.batch_limit = n,
                Err(_) => tracing::warn!(
                    var = "HERALD_BATCH_LIMIT",
                    value = %v,
                    "ignoring invalid env override"
                ),
            }
        }
        if let Some(v) = env("HERALD_LOG_DIR") {
            self.logging.dir = Some(PathBuf::from(v));
        }
    }

    /// Parse a TOML string into config.
    ///
    /// # Errors
    ///
    /// Returns an error on malformed TOML or unknown enum values.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        let config: HeraldConfig =
            toml::from_str(toml_str).context("failed to parse config TOML")?;
        Ok(config)
    }

    /// Validate that configuration values are within sane bounds.
    ///
    /// # Errors
    ///
    /// Returns the first violated constraint.
    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(
            (1..=MAX_BATCH_LIMIT).contains(&self.delivery.batch_limit),
            "delivery.batch_limit must be in 1..={MAX_BATCH_LIMIT}"
        );
        anyhow::ensure!(
            self.delivery.tick_interval_secs > 0,
            "delivery.tick_interval_secs must be > 0"
        );
        anyhow::ensure!(
            self.delivery.batch_timeout_secs > 0,
            "delivery.batch_timeout_secs must be > 0"
        );
        anyhow::ensure!(
            self.webhook.timeout_secs > 0,
            "webhook.timeout_secs must be > 0"
        );
        let worst_batch_secs = u64::from(self.delivery.batch_limit)
            .checked_mul(self.webhook.timeout_secs)
            .context("delivery.batch_limit * webhook.timeout_secs overflows")?;
        anyhow::ensure!(
            self.delivery.batch_timeout_secs >= worst_batch_secs,
            "delivery.batch_timeout_secs ({}) must be >= batch_limit * webhook.timeout_secs ({worst_batch_secs})",
            self.delivery.batch_timeout_secs
        );
        let min_busy_secs = self.webhook.timeout_secs.saturating_add(BUSY_TIMEOUT_MARGIN_SECS);
        anyhow::ensure!(
            self.database.busy_timeout_secs >= min_busy_secs,
            "database.busy_timeout_secs ({}) must be >= webhook.timeout_secs + {BUSY_TIMEOUT_MARGIN_SECS} ({min_busy_secs})",
            self.database.busy_timeout_secs
        );
        anyhow::ensure!(
            self.cache.record_ttl_secs <= MAX_RECORD_TTL_SECS,
            "cache.record_ttl_secs must be <= {MAX_RECORD_TTL_SECS}"
        );
        anyhow::ensure!(
            self.reconcile.interval_secs > 0,
            "reconcile.interval_secs must be > 0"
        );
        anyhow::ensure!(
            self.reconcile.sweep_timeout_secs > 0,
            "reconcile.sweep_timeout_secs must be > 0"
        );

        let webhook = url::Url::parse(&self.webhook.url)
            .with_context(|| format!("webhook.url is not a valid URL: {:?}", self.webhook.url))?;
        anyhow::ensure!(
            matches!(webhook.scheme(), "http" | "https"),
            "webhook.url must use http or https"
        );

        self.server
            .bind
            .parse::<SocketAddr>()
            .with_context(|| format!("server.bind is not a socket address: {:?}", self.server.bind))?;
        Ok(())
    }

    /// Engine tuning derived from `[delivery]` and `[cache]`.
    pub fn delivery_config(&self) -> DeliveryConfig {
        DeliveryConfig {
            batch_limit: self.delivery.batch_limit,
            tick_interval: Duration::from_secs(self.delivery.tick_interval_secs),
            batch_timeout: Duration::from_secs(self.delivery.batch_timeout_secs),
            on_store_error: self.delivery.on_store_error,
            record_ttl: self.cache.record_ttl(),
        }
    }

    /// Reconciler tuning derived from `[reconcile]` and `[cache]`.
    pub fn reconcile_config(&self) -> ReconcileConfig {
        ReconcileConfig {
            interval: Duration::from_secs(self.reconcile.interval_secs),
            sweep_timeout: Duration::from_secs(self.reconcile.sweep_timeout_secs),
            record_ttl: self.cache.record_ttl(),
        }
    }

    /// Database file: `[database] path`, or `herald.db` in the data directory.
    ///
    /// # Errors
    ///
    /// Returns an error if no path is configured and the home directory
    /// cannot be determined.
    pub fn database_path(&self) -> Result<PathBuf> {
        match &self.database.path {
            Some(path) => Ok(path.clone()),
            None => Ok(data_dir()?.join("herald.db")),
        }
    }

    /// Log directory: `[logging] dir`, or `logs/` in the data directory.
    ///
    /// # Errors
    ///
    /// Returns an error if no directory is configured and the home directory
    /// cannot be determined.
    pub fn log_dir(&self) -> Result<PathBuf> {
        match &self.logging.dir {
            Some(dir) => Ok(dir.clone()),
            None => Ok(data_dir()?.join("logs")),
        }
    }
}

/// Resolve the default data directory (`~/.herald/`).
///
/// # Errors
///
/// Returns an error if the home directory cannot be determined.
pub fn data_dir() -> Result<PathBuf> {
    let home = directories::BaseDirs::new()
        .ok_or_else(|| anyhow::anyhow!("cannot determine home directory"))?;
    Ok(home.home_dir().join(".herald"))
}

// ── Sections ────────────────────────────────────────────────────

/// Durable store settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// SQLite file. Defaults to `~/.herald/herald.db`.
    pub path: Option<PathBuf>,
    /// Seconds a writer waits for SQLite's write lock.
    pub busy_timeout_secs: u64,
}

impl DatabaseConfig {
    /// Write-lock wait as a duration.
    pub fn busy_timeout(&self) -> Duration {
        Duration::from_secs(self.busy_timeout_secs)
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: None,
            busy_timeout_secs: DEFAULT_BUSY_TIMEOUT.as_secs(),
        }
    }
}

/// Record cache settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Redis connection URL.
    pub redis_url: String,
    /// Record expiry in seconds; `0` keeps records indefinitely.
    pub record_ttl_secs: u64,
}

impl CacheConfig {
    /// Record expiry as a duration, `None` when indefinite.
    pub fn record_ttl(&self) -> Option<Duration> {
        (self.record_ttl_secs > 0).then(|| Duration::from_secs(self.record_ttl_secs))
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            redis_url: "redis://127.0.0.1:6379/0".to_owned(),
            record_ttl_secs: 0,
        }
    }
}

/// External sender settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WebhookConfig {
    /// Endpoint receiving one `POST` per message.
    pub url: String,
    /// Per-request timeout in seconds.
    pub timeout_secs: u64,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            url: "http://127.0.0.1:9000/webhook".to_owned(),
            timeout_secs: 10,
        }
    }
}

/// Delivery engine settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DeliverySettings {
    /// Messages claimed per tick.
    pub batch_limit: u32,
    /// Seconds between ticks.
    pub tick_interval_secs: u64,
    /// Deadline for one batch in seconds.
    pub batch_timeout_secs: u64,
    /// `halt` or `continue` on a store fault.
    pub on_store_error: StoreFaultPolicy,
}

impl Default for DeliverySettings {
    fn default() -> Self {
        Self {
            batch_limit: DEFAULT_BATCH_LIMIT,
            tick_interval_secs: 5,
            batch_timeout_secs: 30,
            on_store_error: StoreFaultPolicy::Halt,
        }
    }
}

/// Reconciler settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ReconcileSettings {
    /// Seconds between sweeps.
    pub interval_secs: u64,
    /// Deadline for one sweep in seconds.
    pub sweep_timeout_secs: u64,
}

impl Default for ReconcileSettings {
    fn default() -> Self {
        Self {
            interval_secs: 30,
            sweep_timeout_secs: 60,
        }
    }
}

/// HTTP control surface settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Listen address.
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:8080".to_owned(),
        }
    }
}

/// Log output settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter when `RUST_LOG` is unset.
    pub level: String,
    /// Directory for rotated JSON logs. Defaults to `~/.herald/logs`.
    pub dir: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_owned(),
            dir: None,
        }
    }
}

//! # Engine Configuration
//!
//! Configuration management for the checkout engine.
//!
//! ## Configuration Sources
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Configuration Priority                               │
//! │                                                                         │
//! │  1. Environment Variables (highest priority)                            │
//! │     MERIDIAN_DB_PATH=/var/lib/meridian/engine.db                        │
//! │     MERIDIAN_CURRENCY=EUR                                               │
//! │                                                                         │
//! │  2. TOML Config File                                                    │
//! │     ~/.config/meridian/engine.toml (Linux)                              │
//! │     ~/Library/Application Support/com.meridian.engine/engine.toml      │
//! │                                                                         │
//! │  3. Default Values (lowest priority)                                    │
//! │     USD, 2 decimals, prices exclusive of tax, 5s lock timeout           │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Configuration File Format
//! ```toml
//! # engine.toml
//! [store]
//! id = "store-001"
//! currency = "USD"
//! price_decimals = 2
//! prices_include_tax = false
//!
//! [database]
//! path = "meridian.db"
//! max_connections = 8
//!
//! [settlement]
//! lock_timeout_ms = 5000
//! complete_on_payment = true
//!
//! [loyalty]
//! points_per_currency_unit = 1
//!
//! [events]
//! poll_interval_secs = 5
//! batch_size = 100
//! max_attempts = 10
//! ```

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info, warn};

use meridian_core::validation::{validate_currency, validate_price_decimals};
use meridian_core::types::STANDARD_TAX_CLASS;
use meridian_core::DEFAULT_CURRENCY;
use meridian_db::DbConfig;

use crate::error::{EngineError, EngineResult};

// =============================================================================
// Store Configuration
// =============================================================================

/// Store-wide pricing settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_store_id")]
    pub id: String,

    #[serde(default)]
    pub name: String,

    /// ISO 4217 code used for every quote.
    #[serde(default = "default_currency")]
    pub currency: String,

    /// Decimals tax lines are rounded to.
    #[serde(default = "default_price_decimals")]
    pub price_decimals: u32,

    /// Catalog prices are gross.
    #[serde(default)]
    pub prices_include_tax: bool,

    /// Tax class used for shipping.
    #[serde(default = "default_shipping_tax_class")]
    pub shipping_tax_class: String,
}

fn default_store_id() -> String {
    "default-store".to_string()
}

fn default_currency() -> String {
    DEFAULT_CURRENCY.to_string()
}

fn default_price_decimals() -> u32 {
    2
}

fn default_shipping_tax_class() -> String {
    STANDARD_TAX_CLASS.to_string()
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreConfig {
            id: default_store_id(),
            name: "Default Store".to_string(),
            currency: default_currency(),
            price_decimals: default_price_decimals(),
            prices_include_tax: false,
            shipping_tax_class: default_shipping_tax_class(),
        }
    }
}

// =============================================================================
// Database Settings
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseSettings {
    /// SQLite file, or `:memory:`.
    #[serde(default = "default_db_path")]
    pub path: PathBuf,

    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    #[serde(default = "default_busy_timeout")]
    pub busy_timeout_ms: u64,
}

fn default_db_path() -> PathBuf {
    PathBuf::from("meridian.db")
}

fn default_max_connections() -> u32 {
    8
}

fn default_busy_timeout() -> u64 {
    5_000
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        DatabaseSettings {
            path: default_db_path(),
            max_connections: default_max_connections(),
            busy_timeout_ms: default_busy_timeout(),
        }
    }
}

impl DatabaseSettings {
    /// Pool configuration for these settings.
    pub fn db_config(&self) -> DbConfig {
        if self.path.as_os_str() == ":memory:" {
            return DbConfig::in_memory();
        }
        DbConfig::new(self.path.clone())
            .max_connections(self.max_connections)
            .busy_timeout(Duration::from_millis(self.busy_timeout_ms))
    }
}

// =============================================================================
// Settlement Settings
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SettlementSettings {
    /// Longest a settlement or refund waits for its row locks.
    #[serde(default = "default_lock_timeout")]
    pub lock_timeout_ms: u64,

    /// A paid order goes straight to `completed`; otherwise it stops at
    /// `processing` until fulfilment moves it on.
    #[serde(default = "default_true")]
    pub complete_on_payment: bool,
}

fn default_lock_timeout() -> u64 {
    5_000
}

fn default_true() -> bool {
    true
}

impl Default for SettlementSettings {
    fn default() -> Self {
        SettlementSettings {
            lock_timeout_ms: default_lock_timeout(),
            complete_on_payment: true,
        }
    }
}

impl SettlementSettings {
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }
}

// =============================================================================
// Loyalty Settings
// =============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoyaltySettings {
    /// Points per whole currency unit of a completed order. 0 disables
    /// earning.
    #[serde(default)]
    pub points_per_currency_unit: u32,
}

// =============================================================================
// Event Settings
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventSettings {
    /// Interval between outbox poll cycles (seconds).
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,

    /// Outbox entries handed to the sink per cycle.
    #[serde(default = "default_batch_size")]
    pub batch_size: u32,

    /// Deliveries attempted before an entry is skipped.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

fn default_poll_interval() -> u64 {
    5
}

fn default_batch_size() -> u32 {
    100
}

fn default_max_attempts() -> u32 {
    10
}

impl Default for EventSettings {
    fn default() -> Self {
        EventSettings {
            poll_interval_secs: default_poll_interval(),
            batch_size: default_batch_size(),
            max_attempts: default_max_attempts(),
        }
    }
}

// =============================================================================
// Main Engine Configuration
// =============================================================================

/// Complete engine configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub store: StoreConfig,

    #[serde(default)]
    pub database: DatabaseSettings,

    #[serde(default)]
    pub settlement: SettlementSettings,

    #[serde(default)]
    pub loyalty: LoyaltySettings,

    #[serde(default)]
    pub events: EventSettings,
}

impl EngineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Defaults with an in-memory database, for tests and demos.
    pub fn in_memory() -> Self {
        let mut config = Self::default();
        config.database.path = PathBuf::from(":memory:");
        config
    }

    /// Loads configuration from file, environment, and defaults.
    ///
    /// ## Load Order (later overrides earlier)
    /// 1. Default values
    /// 2. Config file (engine.toml)
    /// 3. Environment variables
    pub fn load(config_path: Option<PathBuf>) -> EngineResult<Self> {
        let mut config = Self::default();

        if let Some(path) = config_path.or_else(Self::default_config_path) {
            if path.exists() {
                info!(?path, "Loading engine config from file");
                let contents = std::fs::read_to_string(&path)?;
                config = toml::from_str(&contents)?;
            } else {
                debug!(?path, "Config file not found, using defaults");
            }
        }

        config.apply_env_overrides();
        config.validate()?;

        Ok(config)
    }

    /// Loads config or returns default if load fails.
    pub fn load_or_default(config_path: Option<PathBuf>) -> Self {
        Self::load(config_path).unwrap_or_else(|e| {
            warn!("Failed to load engine config: {}. Using defaults.", e);
            Self::default()
        })
    }

    /// Saves configuration to file.
    pub fn save(&self, config_path: Option<PathBuf>) -> EngineResult<()> {
        let path = config_path
            .or_else(Self::default_config_path)
            .ok_or_else(|| EngineError::ConfigSaveFailed("No config path available".into()))?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let contents = toml::to_string_pretty(self)?;
        std::fs::write(&path, contents)?;

        info!(?path, "Engine config saved");
        Ok(())
    }

    pub fn validate(&self) -> EngineResult<()> {
        if self.store.id.trim().is_empty() {
            return Err(EngineError::InvalidConfig("store.id must not be empty".into()));
        }
        validate_currency(&self.store.currency).map_err(|e| EngineError::InvalidConfig(e.to_string()))?;
        validate_price_decimals(self.store.price_decimals)
            .map_err(|e| EngineError::InvalidConfig(e.to_string()))?;

        if self.database.max_connections == 0 {
            return Err(EngineError::InvalidConfig(
                "database.max_connections must be greater than 0".into(),
            ));
        }
        if self.settlement.lock_timeout_ms == 0 {
            return Err(EngineError::InvalidConfig(
                "settlement.lock_timeout_ms must be greater than 0".into(),
            ));
        }
        if self.events.batch_size == 0 {
            return Err(EngineError::InvalidConfig("events.batch_size must be greater than 0".into()));
        }
        if self.events.max_attempts == 0 {
            return Err(EngineError::InvalidConfig("events.max_attempts must be greater than 0".into()));
        }

        Ok(())
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(path) = std::env::var("MERIDIAN_DB_PATH") {
            debug!(path = %path, "Overriding database path from environment");
            self.database.path = PathBuf::from(path);
        }

        if let Ok(currency) = std::env::var("MERIDIAN_CURRENCY") {
            self.store.currency = currency.to_uppercase();
        }

        if let Ok(decimals) = std::env::var("MERIDIAN_PRICE_DECIMALS") {
            match decimals.parse::<u32>() {
                Ok(d) => self.store.price_decimals = d,
                Err(_) => warn!(value = %decimals, "Ignoring unparseable MERIDIAN_PRICE_DECIMALS"),
            }
        }

        if let Ok(inclusive) = std::env::var("MERIDIAN_PRICES_INCLUDE_TAX") {
            match inclusive.to_lowercase().as_str() {
                "1" | "true" | "yes" => self.store.prices_include_tax = true,
                "0" | "false" | "no" => self.store.prices_include_tax = false,
                _ => warn!(value = %inclusive, "Ignoring unparseable MERIDIAN_PRICES_INCLUDE_TAX"),
            }
        }

        if let Ok(timeout) = std::env::var("MERIDIAN_LOCK_TIMEOUT_MS") {
            if let Ok(ms) = timeout.parse::<u64>() {
                debug!(ms, "Overriding lock timeout from environment");
                self.settlement.lock_timeout_ms = ms;
            }
        }

        if let Ok(id) = std::env::var("MERIDIAN_STORE_ID") {
            self.store.id = id;
        }
    }

    fn default_config_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("com", "meridian", "engine").map(|dirs| dirs.config_dir().join("engine.toml"))
    }
}

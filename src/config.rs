//! Engine configuration

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{LifecycleError, Result};
use crate::lifecycle::{DomainWindows, LifecycleConfig};
use crate::schedule::CronTrigger;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub contracts: ContractsConfig,
    #[serde(default)]
    pub subscriptions: SubscriptionsConfig,
    #[serde(default)]
    pub api: ApiConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// SQLite database file
    #[serde(default = "default_store_path")]
    pub path: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_store_path(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Maximum rows per scan query
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Bound on one entity's transaction in milliseconds
    #[serde(default = "default_transaction_timeout")]
    pub transaction_timeout_ms: u64,

    /// Scan and count without writing
    #[serde(default)]
    pub dry_run: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            transaction_timeout_ms: default_transaction_timeout(),
            dry_run: false,
        }
    }
}

/// Contract windows and schedule
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContractsConfig {
    /// Run contracts on their schedule
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Days before `end_date` the contract moves to expiring soon
    #[serde(default = "default_contract_window")]
    pub expiring_soon_days: i64,

    /// Days past `end_date` before the contract expires
    #[serde(default)]
    pub grace_period_days: i64,

    /// Cron expression, 5 or 6 fields
    #[serde(default = "default_contract_schedule")]
    pub schedule: String,
}

impl ContractsConfig {
    pub fn windows(&self) -> DomainWindows {
        DomainWindows::days(self.expiring_soon_days, self.grace_period_days)
    }
}

impl Default for ContractsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            expiring_soon_days: default_contract_window(),
            grace_period_days: 0,
            schedule: default_contract_schedule(),
        }
    }
}

/// Subscription windows and schedule
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriptionsConfig {
    /// Run subscriptions on their schedule
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Days before `end_date` the expiration warning goes out
    #[serde(default = "default_subscription_window")]
    pub expiring_soon_days: i64,

    /// Days of access kept after expiry before suspension
    #[serde(default = "default_subscription_grace")]
    pub grace_period_days: i64,

    /// Cron expression, 5 or 6 fields
    #[serde(default = "default_subscription_schedule")]
    pub schedule: String,
}

impl SubscriptionsConfig {
    pub fn windows(&self) -> DomainWindows {
        DomainWindows::days(self.expiring_soon_days, self.grace_period_days)
    }
}

impl Default for SubscriptionsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            expiring_soon_days: default_subscription_window(),
            grace_period_days: default_subscription_grace(),
            schedule: default_subscription_schedule(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    /// Serve the admin HTTP API alongside the scheduler
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// HTTP API port
    #[serde(default = "default_http_port")]
    pub http_port: u16,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            http_port: default_http_port(),
        }
    }
}

// Defaults
fn default_store_path() -> PathBuf { PathBuf::from("lifecycle.db") }
fn default_batch_size() -> usize { 100 }
fn default_transaction_timeout() -> u64 { 5000 }
fn default_true() -> bool { true }
fn default_contract_window() -> i64 { 5 }
fn default_contract_schedule() -> String { "0 8,20 * * *".to_string() }
fn default_subscription_window() -> i64 { 7 }
fn default_subscription_grace() -> i64 { 7 }
fn default_subscription_schedule() -> String { "0 9 * * *".to_string() }
fn default_http_port() -> u16 { 8080 }

impl Config {
    /// Parse and validate a TOML document.
    pub fn from_toml(raw: &str) -> Result<Self> {
        let config: Config =
            toml::from_str(raw).map_err(|e| LifecycleError::Config(format!("invalid TOML: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| LifecycleError::Config(format!("cannot read {}: {}", path.display(), e)))?;
        Self::from_toml(&raw)
    }

    pub fn validate(&self) -> Result<()> {
        if self.engine.batch_size == 0 {
            return Err(LifecycleError::Config("engine.batch_size must be at least 1".to_string()));
        }
        if self.engine.transaction_timeout_ms == 0 {
            return Err(LifecycleError::Config(
                "engine.transaction_timeout_ms must be positive".to_string(),
            ));
        }
        let domains = [
            (
                "contracts",
                self.contracts.expiring_soon_days,
                self.contracts.grace_period_days,
                &self.contracts.schedule,
            ),
            (
                "subscriptions",
                self.subscriptions.expiring_soon_days,
                self.subscriptions.grace_period_days,
                &self.subscriptions.schedule,
            ),
        ];
        for (name, expiring_soon_days, grace_period_days, schedule) in domains {
            if expiring_soon_days < 0 {
                return Err(LifecycleError::Config(format!(
                    "{}.expiring_soon_days must not be negative",
                    name
                )));
            }
            if grace_period_days < 0 {
                return Err(LifecycleError::Config(format!(
                    "{}.grace_period_days must not be negative",
                    name
                )));
            }
            CronTrigger::parse(schedule)
                .map_err(|e| LifecycleError::Config(format!("{}.schedule: {}", name, e)))?;
        }
        Ok(())
    }

    /// Engine settings derived from this file
    pub fn lifecycle(&self) -> LifecycleConfig {
        LifecycleConfig {
            batch_size: self.engine.batch_size,
            transaction_timeout: Duration::from_millis(self.engine.transaction_timeout_ms),
            dry_run: self.engine.dry_run,
            contracts: self.contracts.windows(),
            subscriptions: self.subscriptions.windows(),
        }
    }
}

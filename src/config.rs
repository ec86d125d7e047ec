//! Service settings: an optional TOML file, then `SETTLEPAY_*` environment
//! overrides, then CLI flags (applied by the binary).

use crate::application::ServiceConfig;
use crate::application::collection::CollectionConfig;
use crate::application::jobs::JobSchedule;
use crate::application::payout::RetryPolicy;
use crate::error::{PaymentError, Result};
use crate::infrastructure::gateway::GatewayConfig;
use chrono::FixedOffset;
use serde::Deserialize;
use std::env;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const ENV_CONSUMER_KEY: &str = "SETTLEPAY_CONSUMER_KEY";
pub const ENV_CONSUMER_SECRET: &str = "SETTLEPAY_CONSUMER_SECRET";
pub const ENV_PASSKEY: &str = "SETTLEPAY_PASSKEY";
pub const ENV_SECURITY_CREDENTIAL: &str = "SETTLEPAY_SECURITY_CREDENTIAL";
pub const ENV_GATEWAY_URL: &str = "SETTLEPAY_GATEWAY_URL";
pub const ENV_CALLBACK_BASE: &str = "SETTLEPAY_CALLBACK_BASE";
pub const ENV_CATALOG_PATH: &str = "SETTLEPAY_CATALOG_PATH";
pub const ENV_SETTLEMENT_OFFSET_HOURS: &str = "SETTLEPAY_SETTLEMENT_OFFSET_HOURS";

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct Settings {
    pub listen: SocketAddr,
    pub catalog_path: Option<PathBuf>,
    pub gateway: GatewayConfig,
    pub collection: CollectionConfig,
    pub payout: PayoutSettings,
    pub settlement: SettlementSettings,
    pub reconciliation: ReconciliationSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([0, 0, 0, 0], 8080)),
            catalog_path: None,
            gateway: GatewayConfig::default(),
            collection: CollectionConfig::default(),
            payout: PayoutSettings::default(),
            settlement: SettlementSettings::default(),
            reconciliation: ReconciliationSettings::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PayoutSettings {
    pub max_attempts: u32,
    pub base_delay_secs: u64,
    pub max_delay_secs: u64,
    pub interval_secs: u64,
}

impl Default for PayoutSettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_secs: 5 * 60,
            max_delay_secs: 6 * 60 * 60,
            interval_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SettlementSettings {
    /// Settlement days are calendar days at this UTC offset.
    pub utc_offset_hours: i32,
    /// How often the scheduler checks whether yesterday still needs settling.
    pub interval_secs: u64,
}

impl Default for SettlementSettings {
    fn default() -> Self {
        Self {
            utc_offset_hours: 3,
            interval_secs: 15 * 60,
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ReconciliationSettings {
    pub stale_after_secs: u64,
    pub sweep_interval_secs: u64,
}

impl Default for ReconciliationSettings {
    fn default() -> Self {
        Self {
            stale_after_secs: 5 * 60,
            sweep_interval_secs: 60,
        }
    }
}

impl Settings {
    /// Reads `path` if given (defaults otherwise) and applies environment
    /// overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let settings = match path {
            Some(path) => Self::from_toml(&std::fs::read_to_string(path)?)?,
            None => Self::default(),
        };
        settings.from_env()
    }

    pub fn from_toml(raw: &str) -> Result<Self> {
        toml::from_str(raw).map_err(|e| PaymentError::ConfigError(e.to_string()))
    }

    pub fn from_env(self) -> Result<Self> {
        self.with_overrides(|key| env::var(key).ok())
    }

    /// Applies overrides from `lookup`, keyed by the `SETTLEPAY_*` names.
    pub fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        if let Some(key) = lookup(ENV_CONSUMER_KEY) {
            self.gateway.consumer_key = key;
        }
        if let Some(secret) = lookup(ENV_CONSUMER_SECRET) {
            self.gateway.consumer_secret = secret;
        }
        if let Some(passkey) = lookup(ENV_PASSKEY) {
            self.gateway.passkey = passkey;
        }
        if let Some(credential) = lookup(ENV_SECURITY_CREDENTIAL) {
            self.gateway.security_credential = credential;
        }
        if let Some(url) = lookup(ENV_GATEWAY_URL) {
            self.gateway.base_url = url;
        }
        if let Some(url) = lookup(ENV_CALLBACK_BASE) {
            self.gateway.callback_base = url;
        }
        if let Some(path) = lookup(ENV_CATALOG_PATH) {
            self.catalog_path = Some(PathBuf::from(path));
        }
        if let Some(hours) = lookup(ENV_SETTLEMENT_OFFSET_HOURS) {
            self.settlement.utc_offset_hours = hours.trim().parse().map_err(|_| {
                PaymentError::ConfigError(format!(
                    "{ENV_SETTLEMENT_OFFSET_HOURS} must be a whole number of hours, got '{hours}'"
                ))
            })?;
        }
        Ok(self)
    }

    pub fn settlement_offset(&self) -> Result<FixedOffset> {
        let hours = self.settlement.utc_offset_hours;
        FixedOffset::east_opt(hours * 3600).ok_or_else(|| {
            PaymentError::ConfigError(format!("settlement UTC offset {hours}h is out of range"))
        })
    }

    pub fn retry_policy(&self) -> Result<RetryPolicy> {
        if self.payout.max_attempts == 0 {
            return Err(PaymentError::ConfigError(
                "payout.max_attempts must be at least 1".to_string(),
            ));
        }
        Ok(RetryPolicy {
            max_attempts: self.payout.max_attempts,
            base_delay: seconds(self.payout.base_delay_secs)?,
            max_delay: seconds(self.payout.max_delay_secs)?,
        })
    }

    pub fn service_config(&self) -> Result<ServiceConfig> {
        if self.collection.min_amount == 0 || self.collection.min_amount > self.collection.max_amount
        {
            return Err(PaymentError::ConfigError(format!(
                "collection amount bounds {}..={} are invalid",
                self.collection.min_amount, self.collection.max_amount
            )));
        }
        Ok(ServiceConfig {
            collection: self.collection,
            retry: self.retry_policy()?,
            settlement_offset: self.settlement_offset()?,
        })
    }

    pub fn job_schedule(&self) -> Result<JobSchedule> {
        Ok(JobSchedule {
            settlement_every: Duration::from_secs(self.settlement.interval_secs.max(1)),
            payouts_every: Duration::from_secs(self.payout.interval_secs.max(1)),
            sweep_every: Duration::from_secs(self.reconciliation.sweep_interval_secs.max(1)),
            stale_after: seconds(self.reconciliation.stale_after_secs)?,
        })
    }
}

fn seconds(secs: u64) -> Result<chrono::Duration> {
    i64::try_from(secs)
        .ok()
        .and_then(chrono::Duration::try_seconds)
        .ok_or_else(|| PaymentError::ConfigError(format!("{secs}s is out of range")))
}

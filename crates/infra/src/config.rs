//! Configuration loading and representation.
//!
//! Everything is read from `STOCKBOOK_*` environment variables:
//!
//! | variable | default |
//! |---|---|
//! | `STOCKBOOK_DATABASE_URL` | required |
//! | `STOCKBOOK_DB_MAX_CONNECTIONS` | `10` |
//! | `STOCKBOOK_LOCK_TIMEOUT_MS` | `5000` |
//! | `STOCKBOOK_APPLY_SCHEMA` | `true` |
//! | `STOCKBOOK_RELAY_WORKERS` | `2` |
//! | `STOCKBOOK_RELAY_POLL_MS` | `200` |
//! | `STOCKBOOK_RELAY_LEASE_SECS` | `30` |
//! | `STOCKBOOK_RELAY_BUSINESS_ID` | unset (all businesses) |
//! | `STOCKBOOK_RETRY_MAX_ATTEMPTS` | `5` |
//! | `STOCKBOOK_RETRY_STRATEGY` | `exponential` (`fixed`, `linear`) |
//! | `STOCKBOOK_RETRY_BASE_MS` | `500` |
//! | `STOCKBOOK_RETRY_MAX_MS` | `60000` |
//! | `STOCKBOOK_RETRY_JITTER` | `0.1` |
//! | `STOCKBOOK_COGS_ACCOUNT_ID` | unset |
//! | `STOCKBOOK_GOODS_RECEIVED_ACCOUNT_ID` | unset |
//! | `STOCKBOOK_ADJUSTMENT_ACCOUNT_ID` | unset |
//! | `STOCKBOOK_OPENING_EQUITY_ACCOUNT_ID` | unset |
//!
//! The four account ids go together: set all of them to post inventory
//! journals, or none to skip accounting.

use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

use stockbook_accounting::CounterAccounts;
use stockbook_core::{AccountId, BusinessId};

use crate::outbox::{BackoffStrategy, RelayConfig, RetryPolicy};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),

    #[error("{name} has invalid value {value:?}: {reason}")]
    Invalid {
        name: &'static str,
        value: String,
        reason: String,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct InfraConfig {
    pub database_url: String,
    pub max_connections: u32,
    /// Postgres `lock_timeout` for every stock transaction
    pub lock_timeout: Duration,
    /// Apply the bundled schema at startup
    pub apply_schema: bool,
    pub relay_workers: usize,
    pub poll_interval: Duration,
    pub lease: Duration,
    pub relay_business_id: Option<BusinessId>,
    pub retry: RetryPolicy,
    pub counter_accounts: Option<CounterAccounts>,
}

impl InfraConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from an arbitrary variable source. Empty values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        let database_url =
            get("STOCKBOOK_DATABASE_URL").ok_or(ConfigError::Missing("STOCKBOOK_DATABASE_URL"))?;

        let defaults = RetryPolicy::default();
        let retry = RetryPolicy {
            max_attempts: parse_or(&get, "STOCKBOOK_RETRY_MAX_ATTEMPTS", defaults.max_attempts)?,
            base_delay: Duration::from_millis(parse_or(
                &get,
                "STOCKBOOK_RETRY_BASE_MS",
                defaults.base_delay.as_millis() as u64,
            )?),
            max_delay: Duration::from_millis(parse_or(
                &get,
                "STOCKBOOK_RETRY_MAX_MS",
                defaults.max_delay.as_millis() as u64,
            )?),
            strategy: parse_or::<BackoffStrategy, _>(&get, "STOCKBOOK_RETRY_STRATEGY", defaults.strategy)?,
            jitter: parse_or(&get, "STOCKBOOK_RETRY_JITTER", defaults.jitter)?,
        };
        if !(0.0..=1.0).contains(&retry.jitter) {
            return Err(ConfigError::Invalid {
                name: "STOCKBOOK_RETRY_JITTER",
                value: retry.jitter.to_string(),
                reason: "must be between 0 and 1".to_string(),
            });
        }

        let relay_workers: usize = parse_or(&get, "STOCKBOOK_RELAY_WORKERS", 2)?;
        if relay_workers == 0 {
            return Err(ConfigError::Invalid {
                name: "STOCKBOOK_RELAY_WORKERS",
                value: "0".to_string(),
                reason: "at least one relay worker is needed".to_string(),
            });
        }

        Ok(Self {
            database_url,
            max_connections: parse_or(&get, "STOCKBOOK_DB_MAX_CONNECTIONS", 10)?,
            lock_timeout: Duration::from_millis(parse_or(&get, "STOCKBOOK_LOCK_TIMEOUT_MS", 5_000)?),
            apply_schema: parse_or(&get, "STOCKBOOK_APPLY_SCHEMA", true)?,
            relay_workers,
            poll_interval: Duration::from_millis(parse_or(&get, "STOCKBOOK_RELAY_POLL_MS", 200)?),
            lease: Duration::from_secs(parse_or(&get, "STOCKBOOK_RELAY_LEASE_SECS", 30)?),
            relay_business_id: get("STOCKBOOK_RELAY_BUSINESS_ID")
                .map(|v| parse_value("STOCKBOOK_RELAY_BUSINESS_ID", &v))
                .transpose()?,
            retry,
            counter_accounts: counter_accounts(&get)?,
        })
    }

    /// Relay configuration for worker number `index`.
    pub fn relay_config(&self, index: usize) -> RelayConfig {
        RelayConfig {
            name: format!("outbox-relay-{index}"),
            poll_interval: self.poll_interval,
            lease: self.lease,
            business_id: self.relay_business_id,
            retry: self.retry.clone(),
        }
    }
}

const ACCOUNT_VARS: [&str; 4] = [
    "STOCKBOOK_COGS_ACCOUNT_ID",
    "STOCKBOOK_GOODS_RECEIVED_ACCOUNT_ID",
    "STOCKBOOK_ADJUSTMENT_ACCOUNT_ID",
    "STOCKBOOK_OPENING_EQUITY_ACCOUNT_ID",
];

fn counter_accounts<G>(get: &G) -> Result<Option<CounterAccounts>, ConfigError>
where
    G: Fn(&str) -> Option<String>,
{
    let mut ids = Vec::with_capacity(ACCOUNT_VARS.len());
    for name in ACCOUNT_VARS {
        match get(name) {
            Some(value) => ids.push(parse_value::<AccountId>(name, &value)?),
            None if ids.is_empty() => continue,
            None => return Err(ConfigError::Missing(name)),
        }
    }
    match ids.as_slice() {
        [] => Ok(None),
        [cogs, received, adjustment, equity] => Ok(Some(CounterAccounts {
            cost_of_goods_sold: *cogs,
            goods_received_clearing: *received,
            inventory_adjustment: *adjustment,
            opening_balance_equity: *equity,
        })),
        // A later variable was set while an earlier one was not.
        _ => Err(ConfigError::Missing(ACCOUNT_VARS[0])),
    }
}

fn parse_value<T>(name: &'static str, value: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    value.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
        name,
        value: value.to_string(),
        reason: e.to_string(),
    })
}

fn parse_or<T, G>(get: &G, name: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    G: Fn(&str) -> Option<String>,
{
    match get(name) {
        Some(value) => parse_value(name, &value),
        None => Ok(default),
    }
}

//! Runtime configuration, read from environment variables.
//!
//! | variable | default |
//! |---|---|
//! | `LEDGER_MAX_ATTEMPTS` | 3 |
//! | `LEDGER_RETRY_BASE_MS` | 100 |
//! | `LEDGER_RETRY_JITTER` | 0.0 |
//! | `LEDGER_TX_TIMEOUT_MS` | 10000 |
//! | `LEDGER_LOCK_TIMEOUT_MS` | 5000 |
//! | `LEDGER_PG_ISOLATION` | `read_committed` |
//! | `RECONCILE_STALE_MINUTES` | 30 |
//! | `RECONCILE_BATCH_LIMIT` | 50 |
//! | `RECONCILE_INTERVAL_SECS` | 900 |
//! | `CACHE_AUDIT_INTERVAL_SECS` | 86400 |
//! | `CACHE_AUDIT_AUTO_REPAIR` | false |
//! | `COST_SEND_OFFER`, `COST_UNLOCK_INTEREST`, `COST_FEATURE_LISTING`, `COST_REPUBLISH`, `COST_SUBSCRIPTION_RENEWAL` | see `ActionCosts` |

use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use creditledger_ledger::ActionCosts;

use crate::concurrency::{ConcurrencyController, RetryPolicy};
use crate::ledger_store::{PgIsolation, PgLedgerOptions};
use crate::payments::ReconcileConfig;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value for {name}: {message}")]
    Invalid { name: &'static str, message: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    pub max_attempts: u32,
    pub retry_base_ms: u64,
    pub retry_jitter: f64,
    pub attempt_timeout_ms: u64,
    pub lock_timeout_ms: u64,
    pub pg_isolation: PgIsolation,
    pub reconcile: ReconcileSettings,
    pub audit: AuditSettings,
    pub costs: ActionCosts,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconcileSettings {
    pub stale_minutes: u64,
    pub batch_limit: u32,
    pub interval_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditSettings {
    pub interval_secs: u64,
    pub auto_repair: bool,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            retry_base_ms: 100,
            retry_jitter: 0.0,
            attempt_timeout_ms: 10_000,
            lock_timeout_ms: 5_000,
            pg_isolation: PgIsolation::default(),
            reconcile: ReconcileSettings::default(),
            audit: AuditSettings::default(),
            costs: ActionCosts::default(),
        }
    }
}

impl Default for ReconcileSettings {
    fn default() -> Self {
        Self {
            stale_minutes: 30,
            batch_limit: 50,
            interval_secs: 900,
        }
    }
}

impl Default for AuditSettings {
    fn default() -> Self {
        Self {
            interval_secs: 86_400,
            auto_repair: false,
        }
    }
}

impl LedgerConfig {
    /// Read configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Read configuration through `lookup`; unset names keep their defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut cfg = Self::default();
        let env = Env { lookup };

        env.parse("LEDGER_MAX_ATTEMPTS", &mut cfg.max_attempts)?;
        env.parse("LEDGER_RETRY_BASE_MS", &mut cfg.retry_base_ms)?;
        env.parse("LEDGER_RETRY_JITTER", &mut cfg.retry_jitter)?;
        env.parse("LEDGER_TX_TIMEOUT_MS", &mut cfg.attempt_timeout_ms)?;
        env.parse("LEDGER_LOCK_TIMEOUT_MS", &mut cfg.lock_timeout_ms)?;
        env.parse("LEDGER_PG_ISOLATION", &mut cfg.pg_isolation)?;
        env.parse("RECONCILE_STALE_MINUTES", &mut cfg.reconcile.stale_minutes)?;
        env.parse("RECONCILE_BATCH_LIMIT", &mut cfg.reconcile.batch_limit)?;
        env.parse("RECONCILE_INTERVAL_SECS", &mut cfg.reconcile.interval_secs)?;
        env.parse("CACHE_AUDIT_INTERVAL_SECS", &mut cfg.audit.interval_secs)?;
        env.parse("CACHE_AUDIT_AUTO_REPAIR", &mut cfg.audit.auto_repair)?;
        env.parse("COST_SEND_OFFER", &mut cfg.costs.send_offer)?;
        env.parse("COST_UNLOCK_INTEREST", &mut cfg.costs.unlock_interest)?;
        env.parse("COST_FEATURE_LISTING", &mut cfg.costs.feature_listing)?;
        env.parse("COST_REPUBLISH", &mut cfg.costs.republish)?;
        env.parse("COST_SUBSCRIPTION_RENEWAL", &mut cfg.costs.subscription_renewal)?;

        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_attempts == 0 {
            return Err(ConfigError::Invalid {
                name: "LEDGER_MAX_ATTEMPTS",
                message: "must be at least 1".to_string(),
            });
        }
        if !(0.0..=1.0).contains(&self.retry_jitter) {
            return Err(ConfigError::Invalid {
                name: "LEDGER_RETRY_JITTER",
                message: "must be between 0.0 and 1.0".to_string(),
            });
        }
        if self.reconcile.batch_limit == 0 {
            return Err(ConfigError::Invalid {
                name: "RECONCILE_BATCH_LIMIT",
                message: "must be at least 1".to_string(),
            });
        }
        self.costs.validate().map_err(|e| ConfigError::Invalid {
            name: "COST_*",
            message: e.to_string(),
        })
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::linear(self.max_attempts, Duration::from_millis(self.retry_base_ms))
            .with_jitter(self.retry_jitter)
    }

    pub fn controller(&self) -> ConcurrencyController {
        ConcurrencyController::new(
            self.retry_policy(),
            Duration::from_millis(self.attempt_timeout_ms),
        )
    }

    pub fn pg_options(&self) -> PgLedgerOptions {
        PgLedgerOptions {
            isolation: self.pg_isolation,
            lock_timeout: Duration::from_millis(self.lock_timeout_ms),
            statement_timeout: Duration::from_millis(self.attempt_timeout_ms),
        }
    }

    pub fn reconcile_config(&self) -> ReconcileConfig {
        ReconcileConfig {
            stale_after: Duration::from_secs(self.reconcile.stale_minutes * 60),
            batch_limit: self.reconcile.batch_limit,
        }
    }

    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_secs(self.reconcile.interval_secs)
    }

    pub fn audit_interval(&self) -> Duration {
        Duration::from_secs(self.audit.interval_secs)
    }
}

struct Env<F> {
    lookup: F,
}

impl<F: Fn(&str) -> Option<String>> Env<F> {
    fn parse<T>(&self, name: &'static str, target: &mut T) -> Result<(), ConfigError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        let Some(raw) = (self.lookup)(name) else {
            return Ok(());
        };
        let raw = raw.trim();
        if raw.is_empty() {
            return Ok(());
        }
        *target = raw.parse().map_err(|e: T::Err| ConfigError::Invalid {
            name,
            message: e.to_string(),
        })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn defaults_match_documented_values() {
        let cfg = LedgerConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(cfg, LedgerConfig::default());
        assert_eq!(cfg.retry_policy().delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(cfg.controller().attempt_timeout(), Duration::from_secs(10));
        assert_eq!(cfg.reconcile_config().stale_after, Duration::from_secs(30 * 60));
        assert_eq!(cfg.reconcile_config().batch_limit, 50);
    }

    #[test]
    fn overrides_are_applied() {
        let cfg = LedgerConfig::from_lookup(lookup(&[
            ("LEDGER_MAX_ATTEMPTS", "5"),
            ("LEDGER_PG_ISOLATION", "serializable"),
            ("CACHE_AUDIT_AUTO_REPAIR", "true"),
            ("COST_REPUBLISH", "7"),
            ("RECONCILE_BATCH_LIMIT", " "),
        ]))
        .unwrap();
        assert_eq!(cfg.max_attempts, 5);
        assert_eq!(cfg.pg_isolation, PgIsolation::Serializable);
        assert!(cfg.audit.auto_repair);
        assert_eq!(cfg.costs.republish, 7);
        assert_eq!(cfg.reconcile.batch_limit, 50);
    }

    #[test]
    fn malformed_values_name_the_variable() {
        let err = LedgerConfig::from_lookup(lookup(&[("LEDGER_RETRY_BASE_MS", "fast")])).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { name: "LEDGER_RETRY_BASE_MS", .. }));

        let err = LedgerConfig::from_lookup(lookup(&[("LEDGER_MAX_ATTEMPTS", "0")])).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { name: "LEDGER_MAX_ATTEMPTS", .. }));

        let err = LedgerConfig::from_lookup(lookup(&[("COST_SEND_OFFER", "-1")])).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { name: "COST_*", .. }));
    }
}

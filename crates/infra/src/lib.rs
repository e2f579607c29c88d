//! Infrastructure layer: ledger storage, the ledger engine and its
//! concurrency controller, payments, background jobs, configuration.

pub mod actions;
pub mod audit;
pub mod concurrency;
pub mod config;
pub mod engine;
pub mod error;
pub mod ledger_store;
pub mod payments;
pub mod periodic;

pub use actions::{ActionGateway, ActionOutcome, AdjustmentOutcome};
pub use audit::{AuditReport, CacheAuditor, Drift};
pub use concurrency::{BackoffStrategy, ConcurrencyController, RetryPolicy};
pub use config::{ConfigError, LedgerConfig};
pub use engine::{CachedBalance, LedgerEngine};
pub use error::{LedgerError, LedgerResult};

//! Append-only ledger store boundary.
//!
//! The engine talks to storage only through [`LedgerStore`] and the
//! transaction-scoped [`LedgerUnit`] it hands out. Two implementations:
//! an in-memory store for tests/dev and a Postgres store for production.

pub mod in_memory;
pub mod postgres;
pub mod query;
pub mod r#trait;

pub use in_memory::InMemoryLedgerStore;
pub use postgres::{PgIsolation, PgLedgerOptions, PostgresLedgerStore};
pub use query::{EntryPage, Pagination};
pub use r#trait::{LedgerStore, LedgerStoreError, LedgerUnit};

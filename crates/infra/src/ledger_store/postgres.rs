//! Postgres-backed ledger store.
//!
//! Every unit runs in its own transaction and takes a transaction-scoped
//! advisory lock keyed by the account before reading anything, so two units
//! on the same account never interleave. The balance read additionally locks
//! the account's entry rows (`FOR UPDATE`).
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | LedgerStoreError | Scenario |
//! |------------|----------------------|------------------|----------|
//! | Database | `40001` | `Transient` | Serialization failure |
//! | Database | `40P01` | `Transient` | Deadlock detected |
//! | Database | `55P03` | `Transient` | `lock_timeout` expired |
//! | Database | `57014` | `Transient` | `statement_timeout` expired |
//! | Database | `23505` on the key column | `DuplicateIdempotencyKey` | Key already recorded |
//! | Database | `23514` | `InvalidAppend` | Check constraint (zero amount, negative cache) |
//! | Database (other) | Any other | `Backend` | Other database errors |
//! | PoolTimedOut / Io | N/A | `Transient` | Connection pressure |
//! | Io during commit | N/A | `Backend` | Commit outcome unknown |
//! | Other | N/A | `Backend` | Pool closed, protocol errors, etc. |

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::{debug, instrument};

use creditledger_core::{AccountId, EntryId};
use creditledger_ledger::{BalanceCache, EntryType, IdempotencyKey, LedgerEntry, NewLedgerEntry};

use super::query::{EntryPage, Pagination};
use super::r#trait::{LedgerStore, LedgerStoreError, LedgerUnit};

/// Schema applied by [`PostgresLedgerStore::ensure_schema`].
pub const SCHEMA_SQL: &str = include_str!("../../migrations/0001_ledger.sql");

/// Transaction isolation used for ledger units.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PgIsolation {
    /// READ COMMITTED plus the per-account advisory lock. Each statement sees
    /// everything committed before the lock was granted.
    #[default]
    LockedReadCommitted,
    /// SERIALIZABLE plus the per-account advisory lock. Conflicts surface as
    /// serialization failures and are retried by the caller.
    Serializable,
}

impl core::str::FromStr for PgIsolation {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "read_committed" | "locked_read_committed" => Ok(PgIsolation::LockedReadCommitted),
            "serializable" => Ok(PgIsolation::Serializable),
            other => Err(format!("unknown isolation level '{other}'")),
        }
    }
}

/// Per-unit transaction settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PgLedgerOptions {
    pub isolation: PgIsolation,
    /// How long a unit waits for the account lock before failing transiently.
    pub lock_timeout: Duration,
    /// Upper bound for any single statement inside a unit.
    pub statement_timeout: Duration,
}

impl Default for PgLedgerOptions {
    fn default() -> Self {
        Self {
            isolation: PgIsolation::default(),
            lock_timeout: Duration::from_secs(5),
            statement_timeout: Duration::from_secs(10),
        }
    }
}

/// Postgres-backed append-only ledger store.
///
/// `Send + Sync`; clones share the same connection pool.
#[derive(Debug, Clone)]
pub struct PostgresLedgerStore {
    pool: PgPool,
    options: PgLedgerOptions,
}

impl PostgresLedgerStore {
    pub fn new(pool: PgPool) -> Self {
        Self::with_options(pool, PgLedgerOptions::default())
    }

    pub fn with_options(pool: PgPool, options: PgLedgerOptions) -> Self {
        Self { pool, options }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create tables, indexes and the append-only trigger if missing.
    pub async fn ensure_schema(&self) -> Result<(), LedgerStoreError> {
        sqlx::raw_sql(SCHEMA_SQL)
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("ensure_schema", e))?;
        Ok(())
    }
}

/// Advisory lock key for an account: the two halves of the UUID folded together.
fn advisory_key(account_id: AccountId) -> i64 {
    let (hi, lo) = account_id.as_uuid().as_u64_pair();
    (hi ^ lo) as i64
}

fn millis(d: Duration) -> String {
    format!("{}ms", d.as_millis())
}

#[async_trait]
impl LedgerStore for PostgresLedgerStore {
    #[instrument(skip(self), fields(account_id = %account_id), err)]
    async fn begin(&self, account_id: AccountId) -> Result<Box<dyn LedgerUnit>, LedgerStoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        if self.options.isolation == PgIsolation::Serializable {
            sqlx::query("SET TRANSACTION ISOLATION LEVEL SERIALIZABLE")
                .execute(&mut *tx)
                .await
                .map_err(|e| map_sqlx_error("set_isolation", e))?;
        }

        sqlx::query("SELECT set_config('lock_timeout', $1, true), set_config('statement_timeout', $2, true)")
            .bind(millis(self.options.lock_timeout))
            .bind(millis(self.options.statement_timeout))
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("set_timeouts", e))?;

        sqlx::query("SELECT pg_advisory_xact_lock($1)")
            .bind(advisory_key(account_id))
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("account_lock", e))?;

        debug!("account lock acquired");
        Ok(Box::new(PostgresUnit {
            tx: Some(tx),
            account_id,
        }))
    }

    #[instrument(skip(self), fields(key = %key), err)]
    async fn find_by_idempotency_key(
        &self,
        key: &IdempotencyKey,
    ) -> Result<Option<LedgerEntry>, LedgerStoreError> {
        let row = sqlx::query(&format!("{SELECT_ENTRY} WHERE idempotency_key = $1"))
            .bind(key.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("find_by_idempotency_key", e))?;

        row.map(|r| decode_entry(&r)).transpose()
    }

    async fn sum_balance(&self, account_id: AccountId) -> Result<i64, LedgerStoreError> {
        let row = sqlx::query(
            "SELECT COALESCE(SUM(amount), 0)::BIGINT AS balance FROM ledger_entries WHERE account_id = $1",
        )
        .bind(account_id.as_uuid())
        .fetch_one(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("sum_balance", e))?;

        row.try_get("balance")
            .map_err(|e| LedgerStoreError::Corrupt(format!("failed to read balance: {e}")))
    }

    async fn cached_balance(
        &self,
        account_id: AccountId,
    ) -> Result<Option<BalanceCache>, LedgerStoreError> {
        let row = sqlx::query(
            "SELECT account_id, cached_value, last_synced_at FROM balance_cache WHERE account_id = $1",
        )
        .bind(account_id.as_uuid())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("cached_balance", e))?;

        row.map(|r| decode_cache(&r)).transpose()
    }

    async fn list_entries(
        &self,
        account_id: AccountId,
        pagination: Pagination,
    ) -> Result<EntryPage, LedgerStoreError> {
        let count_row = sqlx::query("SELECT COUNT(*) AS total FROM ledger_entries WHERE account_id = $1")
            .bind(account_id.as_uuid())
            .fetch_one(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("count_entries", e))?;
        let total: i64 = count_row
            .try_get("total")
            .map_err(|e| LedgerStoreError::Corrupt(format!("failed to read count: {e}")))?;

        let rows = sqlx::query(&format!(
            "{SELECT_ENTRY} WHERE account_id = $1 ORDER BY created_at ASC, entry_id ASC LIMIT $2 OFFSET $3"
        ))
        .bind(account_id.as_uuid())
        .bind(i64::from(pagination.limit))
        .bind(i64::from(pagination.offset))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_entries", e))?;

        let entries = rows.iter().map(decode_entry).collect::<Result<Vec<_>, _>>()?;
        Ok(EntryPage::new(entries, total as u64, pagination))
    }

    async fn known_accounts(&self) -> Result<Vec<AccountId>, LedgerStoreError> {
        let rows = sqlx::query(
            r#"
            SELECT account_id FROM ledger_entries
            UNION
            SELECT account_id FROM balance_cache
            ORDER BY account_id
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("known_accounts", e))?;

        rows.iter()
            .map(|r| {
                r.try_get::<uuid::Uuid, _>("account_id")
                    .map(AccountId::from_uuid)
                    .map_err(|e| LedgerStoreError::Corrupt(format!("failed to read account id: {e}")))
            })
            .collect()
    }
}

/// One open transaction holding an account's advisory lock.
///
/// Dropping it without `commit` rolls the transaction back.
struct PostgresUnit {
    tx: Option<Transaction<'static, Postgres>>,
    account_id: AccountId,
}

impl PostgresUnit {
    fn tx(&mut self) -> Result<&mut Transaction<'static, Postgres>, LedgerStoreError> {
        self.tx
            .as_mut()
            .ok_or_else(|| LedgerStoreError::InvalidAppend("unit already committed".to_string()))
    }
}

#[async_trait]
impl LedgerUnit for PostgresUnit {
    fn account_id(&self) -> AccountId {
        self.account_id
    }

    async fn locked_balance(&mut self) -> Result<i64, LedgerStoreError> {
        let account_id = self.account_id;
        let tx = self.tx()?;
        let row = sqlx::query(
            r#"
            SELECT COALESCE(SUM(amount), 0)::BIGINT AS balance
            FROM (
                SELECT amount FROM ledger_entries WHERE account_id = $1 FOR UPDATE
            ) locked
            "#,
        )
        .bind(account_id.as_uuid())
        .fetch_one(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error("locked_balance", e))?;

        row.try_get("balance")
            .map_err(|e| LedgerStoreError::Corrupt(format!("failed to read balance: {e}")))
    }

    async fn insert_entry(&mut self, entry: NewLedgerEntry) -> Result<LedgerEntry, LedgerStoreError> {
        if entry.account_id != self.account_id {
            return Err(LedgerStoreError::InvalidAppend(format!(
                "entry for account {} staged in unit for account {}",
                entry.account_id, self.account_id
            )));
        }

        let entry_id = EntryId::new();
        let created_at = Utc::now();
        let tx = self.tx()?;
        sqlx::query(
            r#"
            INSERT INTO ledger_entries (
                entry_id,
                account_id,
                amount,
                entry_type,
                reason,
                related_id,
                idempotency_key,
                created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(entry_id.as_uuid())
        .bind(entry.account_id.as_uuid())
        .bind(entry.amount)
        .bind(entry.entry_type.as_str())
        .bind(&entry.reason)
        .bind(entry.related_id.as_deref())
        .bind(entry.idempotency_key.as_ref().map(IdempotencyKey::as_str))
        .bind(created_at)
        .execute(&mut **tx)
        .await
        .map_err(|e| {
            if is_key_violation(&e) {
                LedgerStoreError::DuplicateIdempotencyKey(
                    entry
                        .idempotency_key
                        .as_ref()
                        .map(ToString::to_string)
                        .unwrap_or_default(),
                )
            } else {
                map_sqlx_error("insert_entry", e)
            }
        })?;

        Ok(entry.into_entry(entry_id, created_at))
    }

    async fn apply_cache_delta(
        &mut self,
        delta: i64,
        balance_after: i64,
    ) -> Result<i64, LedgerStoreError> {
        let account_id = self.account_id;
        let tx = self.tx()?;
        let row = sqlx::query(
            r#"
            INSERT INTO balance_cache (account_id, cached_value, last_synced_at)
            VALUES ($1, GREATEST($3, 0), NOW())
            ON CONFLICT (account_id) DO UPDATE
            SET cached_value = GREATEST(balance_cache.cached_value + $2, 0),
                last_synced_at = NOW()
            RETURNING cached_value
            "#,
        )
        .bind(account_id.as_uuid())
        .bind(delta)
        .bind(balance_after)
        .fetch_one(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error("apply_cache_delta", e))?;

        row.try_get("cached_value")
            .map_err(|e| LedgerStoreError::Corrupt(format!("failed to read cache value: {e}")))
    }

    async fn set_cache(&mut self, value: i64) -> Result<BalanceCache, LedgerStoreError> {
        let account_id = self.account_id;
        let tx = self.tx()?;
        let row = sqlx::query(
            r#"
            INSERT INTO balance_cache (account_id, cached_value, last_synced_at)
            VALUES ($1, GREATEST($2, 0), NOW())
            ON CONFLICT (account_id) DO UPDATE
            SET cached_value = GREATEST($2, 0),
                last_synced_at = NOW()
            RETURNING account_id, cached_value, last_synced_at
            "#,
        )
        .bind(account_id.as_uuid())
        .bind(value)
        .fetch_one(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error("set_cache", e))?;

        decode_cache(&row)
    }

    async fn commit(&mut self) -> Result<(), LedgerStoreError> {
        let tx = self
            .tx
            .take()
            .ok_or_else(|| LedgerStoreError::InvalidAppend("unit already committed".to_string()))?;
        // A commit lost on the wire may still have landed: never transient.
        tx.commit().await.map_err(|e| match e {
            sqlx::Error::Io(io) => LedgerStoreError::Backend(format!("commit outcome unknown: {io}")),
            e => map_sqlx_error("commit_transaction", e),
        })
    }
}

const SELECT_ENTRY: &str = r#"
    SELECT
        entry_id,
        account_id,
        amount,
        entry_type,
        reason,
        related_id,
        idempotency_key,
        created_at
    FROM ledger_entries
"#;

// SQLx row types

#[derive(Debug)]
struct LedgerEntryRow {
    entry_id: uuid::Uuid,
    account_id: uuid::Uuid,
    amount: i64,
    entry_type: String,
    reason: String,
    related_id: Option<String>,
    idempotency_key: Option<String>,
    created_at: DateTime<Utc>,
}

impl<'r> sqlx::FromRow<'r, PgRow> for LedgerEntryRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(LedgerEntryRow {
            entry_id: row.try_get("entry_id")?,
            account_id: row.try_get("account_id")?,
            amount: row.try_get("amount")?,
            entry_type: row.try_get("entry_type")?,
            reason: row.try_get("reason")?,
            related_id: row.try_get("related_id")?,
            idempotency_key: row.try_get("idempotency_key")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

impl TryFrom<LedgerEntryRow> for LedgerEntry {
    type Error = LedgerStoreError;

    fn try_from(row: LedgerEntryRow) -> Result<Self, Self::Error> {
        let entry_type: EntryType = row
            .entry_type
            .parse()
            .map_err(|e| LedgerStoreError::Corrupt(format!("entry {}: {e}", row.entry_id)))?;
        let idempotency_key = row
            .idempotency_key
            .map(IdempotencyKey::new)
            .transpose()
            .map_err(|e| LedgerStoreError::Corrupt(format!("entry {}: {e}", row.entry_id)))?;

        Ok(LedgerEntry {
            entry_id: EntryId::from_uuid(row.entry_id),
            account_id: AccountId::from_uuid(row.account_id),
            amount: row.amount,
            entry_type,
            reason: row.reason,
            related_id: row.related_id,
            idempotency_key,
            created_at: row.created_at,
        })
    }
}

fn decode_entry(row: &PgRow) -> Result<LedgerEntry, LedgerStoreError> {
    let raw = <LedgerEntryRow as sqlx::FromRow<PgRow>>::from_row(row)
        .map_err(|e| LedgerStoreError::Corrupt(format!("failed to deserialize entry row: {e}")))?;
    raw.try_into()
}

fn decode_cache(row: &PgRow) -> Result<BalanceCache, LedgerStoreError> {
    let decode = || -> Result<BalanceCache, sqlx::Error> {
        Ok(BalanceCache {
            account_id: AccountId::from_uuid(row.try_get("account_id")?),
            cached_value: row.try_get("cached_value")?,
            last_synced_at: row.try_get("last_synced_at")?,
        })
    };
    decode().map_err(|e| LedgerStoreError::Corrupt(format!("failed to deserialize cache row: {e}")))
}

/// SQLSTATE codes a retry can resolve.
const TRANSIENT_CODES: [&str; 4] = ["40001", "40P01", "55P03", "57014"];

pub(crate) fn is_transient_code(code: &str) -> bool {
    TRANSIENT_CODES.contains(&code)
}

/// Map a SQLx error to a `LedgerStoreError`.
pub(crate) fn map_sqlx_error(operation: &str, err: sqlx::Error) -> LedgerStoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            match db_err.code() {
                Some(code) if is_transient_code(code.as_ref()) => LedgerStoreError::Transient(msg),
                Some(code) if code.as_ref() == "23505" => {
                    LedgerStoreError::DuplicateIdempotencyKey(msg)
                }
                Some(code) if code.as_ref() == "23514" => LedgerStoreError::InvalidAppend(msg),
                _ => LedgerStoreError::Backend(msg),
            }
        }
        sqlx::Error::PoolTimedOut => {
            LedgerStoreError::Transient(format!("connection pool timed out in {operation}"))
        }
        sqlx::Error::Io(e) => LedgerStoreError::Transient(format!("io error in {operation}: {e}")),
        sqlx::Error::PoolClosed => {
            LedgerStoreError::Backend(format!("connection pool closed in {operation}"))
        }
        _ => LedgerStoreError::Backend(format!("sqlx error in {operation}: {err}")),
    }
}

/// Unique violation on the idempotency key column.
fn is_key_violation(err: &sqlx::Error) -> bool {
    if let sqlx::Error::Database(db_err) = err {
        let unique = db_err.code().is_some_and(|c| c.as_ref() == "23505");
        let on_key = db_err
            .constraint()
            .is_none_or(|c| c.contains("idempotency_key"));
        return unique && on_key;
    }
    false
}

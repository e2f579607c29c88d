//! Postgres-backed payment session store (`payment_sessions` table, created by
//! `PostgresLedgerStore::ensure_schema`).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use tracing::instrument;

use creditledger_core::AccountId;

use super::session::{PaymentError, PaymentSession, PaymentSessionStore, SessionId, SessionStatus};

#[derive(Debug, Clone)]
pub struct PostgresPaymentSessionStore {
    pool: PgPool,
}

impl PostgresPaymentSessionStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> PaymentError {
    PaymentError::Store(format!("sqlx error in {operation}: {err}"))
}

const SELECT_SESSION: &str = r#"
    SELECT session_id, account_id, credits, status, created_at, updated_at
    FROM payment_sessions
"#;

fn decode_session(row: &PgRow) -> Result<PaymentSession, PaymentError> {
    let decode = || -> Result<(String, uuid::Uuid, i64, String, DateTime<Utc>, DateTime<Utc>), sqlx::Error> {
        Ok((
            row.try_get("session_id")?,
            row.try_get("account_id")?,
            row.try_get("credits")?,
            row.try_get("status")?,
            row.try_get("created_at")?,
            row.try_get("updated_at")?,
        ))
    };
    let (session_id, account_id, credits, status, created_at, updated_at) =
        decode().map_err(|e| PaymentError::Store(format!("failed to deserialize session row: {e}")))?;

    Ok(PaymentSession {
        session_id: SessionId::new(session_id)?,
        account_id: AccountId::from_uuid(account_id),
        credits,
        status: status.parse()?,
        created_at,
        updated_at,
    })
}

#[async_trait]
impl PaymentSessionStore for PostgresPaymentSessionStore {
    #[instrument(skip(self, session), fields(session_id = %session.session_id), err)]
    async fn record_pending(&self, session: PaymentSession) -> Result<PaymentSession, PaymentError> {
        sqlx::query(
            r#"
            INSERT INTO payment_sessions (session_id, account_id, credits, status, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (session_id) DO NOTHING
            "#,
        )
        .bind(session.session_id.as_str())
        .bind(session.account_id.as_uuid())
        .bind(session.credits)
        .bind(session.status.as_str())
        .bind(session.created_at)
        .bind(session.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("record_pending", e))?;

        let stored = self
            .get(&session.session_id)
            .await?
            .ok_or_else(|| PaymentError::NotFound(session.session_id.to_string()))?;
        if stored.account_id != session.account_id || stored.credits != session.credits {
            return Err(PaymentError::Conflict(format!(
                "session {} already recorded with different terms",
                session.session_id
            )));
        }
        Ok(stored)
    }

    async fn get(&self, session_id: &SessionId) -> Result<Option<PaymentSession>, PaymentError> {
        let row = sqlx::query(&format!("{SELECT_SESSION} WHERE session_id = $1"))
            .bind(session_id.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("get_session", e))?;
        row.map(|r| decode_session(&r)).transpose()
    }

    async fn stale_pending(
        &self,
        older_than: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<PaymentSession>, PaymentError> {
        let rows = sqlx::query(&format!(
            "{SELECT_SESSION} WHERE status = 'pending' AND created_at < $1 ORDER BY created_at ASC, session_id ASC LIMIT $2"
        ))
        .bind(older_than)
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("stale_pending", e))?;
        rows.iter().map(decode_session).collect()
    }

    async fn mark_completed(&self, session_id: &SessionId, now: DateTime<Utc>) -> Result<bool, PaymentError> {
        self.transition(session_id, SessionStatus::Completed, &["pending", "failed"], now)
            .await
    }

    async fn mark_failed(&self, session_id: &SessionId, now: DateTime<Utc>) -> Result<bool, PaymentError> {
        self.transition(session_id, SessionStatus::Failed, &["pending"], now)
            .await
    }
}

impl PostgresPaymentSessionStore {
    async fn transition(
        &self,
        session_id: &SessionId,
        to: SessionStatus,
        allowed_from: &[&str],
        now: DateTime<Utc>,
    ) -> Result<bool, PaymentError> {
        let from: Vec<String> = allowed_from.iter().map(|s| s.to_string()).collect();
        let result = sqlx::query(
            "UPDATE payment_sessions SET status = $2, updated_at = $3 WHERE session_id = $1 AND status = ANY($4)",
        )
        .bind(session_id.as_str())
        .bind(to.as_str())
        .bind(now)
        .bind(&from)
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("transition", e))?;

        if result.rows_affected() > 0 {
            return Ok(true);
        }
        match self.get(session_id).await? {
            Some(_) => Ok(false),
            None => Err(PaymentError::NotFound(session_id.to_string())),
        }
    }
}

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use creditledger_core::AccountId;
use creditledger_infra::payments::ProviderStatus;

use crate::app::errors;

// -------------------------
// Request DTOs
// -------------------------

#[derive(Debug, Deserialize)]
pub struct EntriesQuery {
    pub limit: Option<u32>,
    pub offset: Option<u32>,
}

#[derive(Debug, Deserialize)]
pub struct PerformActionRequest {
    pub action: String,
    pub target_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct OpenSessionRequest {
    pub session_id: String,
    pub account_id: String,
    pub credits: i64,
}

/// Provider notification about a checkout session.
///
/// `status` is only what the sender claims; the provider is asked before
/// anything settles.
#[derive(Debug, Deserialize)]
pub struct WebhookRequest {
    pub session_id: String,
    pub status: Option<ProviderStatus>,
}

#[derive(Debug, Deserialize)]
pub struct AdjustmentRequest {
    pub amount: i64,
    pub reason: Option<String>,
    /// Operator name; part of the idempotency key.
    pub admin: Option<String>,
    /// When the adjustment was issued. Retries must resend the same value.
    pub issued_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
pub struct CacheAuditQuery {
    pub repair: Option<bool>,
}

// -------------------------
// Response DTOs
// -------------------------

#[derive(Debug, Serialize)]
pub struct BalanceResponse {
    pub account_id: AccountId,
    /// Sum of the account's ledger entries.
    pub balance: i64,
    /// Balance cache value (falls back to the ledger sum without a cache row).
    pub cached: i64,
}

#[derive(Debug, Serialize)]
pub struct SyncResponse {
    pub account_id: AccountId,
    pub balance: i64,
}

pub fn parse_account_id(raw: &str) -> Result<AccountId, axum::response::Response> {
    raw.trim()
        .parse()
        .map_err(errors::domain_error_to_response)
}

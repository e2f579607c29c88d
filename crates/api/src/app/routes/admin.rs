//! Operator endpoints, behind the `ADMIN_TOKEN` bearer check.

use std::sync::Arc;

use axum::{
    extract::{Extension, Path, Query},
    http::StatusCode,
    response::IntoResponse,
    routing::post,
    Json, Router,
};
use chrono::Utc;

use creditledger_infra::AdjustmentOutcome;

use crate::app::services::AppServices;
use crate::app::{dto, errors};

pub fn router() -> Router {
    Router::new()
        .route("/accounts/:id/adjustments", post(adjust_balance))
        .route("/accounts/:id/sync", post(sync_cache))
        .route("/cache-audit", post(cache_audit))
}

/// POST /admin/accounts/:id/adjustments
pub async fn adjust_balance(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
    Json(body): Json<dto::AdjustmentRequest>,
) -> axum::response::Response {
    let account_id = match dto::parse_account_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    let admin = body
        .admin
        .as_deref()
        .map(str::trim)
        .filter(|a| !a.is_empty())
        .unwrap_or("admin");
    let issued_at = body.issued_at.unwrap_or_else(Utc::now);

    let outcome = match services
        .gateway
        .adjust(admin, account_id, body.amount, body.reason.as_deref().unwrap_or(""), issued_at)
        .await
    {
        Ok(o) => o,
        Err(e) => return errors::ledger_error_to_response(e),
    };

    let status = match outcome {
        AdjustmentOutcome::Applied { .. } | AdjustmentOutcome::Replayed { .. } => StatusCode::OK,
        AdjustmentOutcome::Insufficient { .. } => StatusCode::UNPROCESSABLE_ENTITY,
    };
    (status, Json(outcome)).into_response()
}

/// POST /admin/accounts/:id/sync - rebuild the cache row from the ledger
pub async fn sync_cache(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let account_id = match dto::parse_account_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };

    match services.engine.sync_cache(account_id).await {
        Ok(balance) => (StatusCode::OK, Json(dto::SyncResponse { account_id, balance })).into_response(),
        Err(e) => errors::ledger_error_to_response(e),
    }
}

/// POST /admin/cache-audit?repair=bool
pub async fn cache_audit(
    Extension(services): Extension<Arc<AppServices>>,
    Query(query): Query<dto::CacheAuditQuery>,
) -> axum::response::Response {
    let repair = query.repair.unwrap_or(services.config.audit.auto_repair);
    match services.auditor.audit(repair).await {
        Ok(report) => (StatusCode::OK, Json(report)).into_response(),
        Err(e) => errors::ledger_error_to_response(e),
    }
}

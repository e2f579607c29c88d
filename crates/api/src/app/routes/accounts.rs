use std::sync::Arc;

use axum::{
    extract::{Extension, Path, Query},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;

use creditledger_infra::ledger_store::Pagination;
use creditledger_infra::ActionOutcome;
use creditledger_ledger::ActionKind;

use crate::app::services::AppServices;
use crate::app::{dto, errors};

pub fn router() -> Router {
    Router::new()
        .route("/:id/balance", get(get_balance))
        .route("/:id/entries", get(list_entries))
        .route("/:id/actions", post(perform_action))
}

/// GET /accounts/:id/balance
pub async fn get_balance(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let account_id = match dto::parse_account_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };

    let balance = match services.engine.get_balance(account_id).await {
        Ok(b) => b,
        Err(e) => return errors::ledger_error_to_response(e),
    };
    let cached = match services.engine.cached_balance(account_id).await {
        Ok(c) => c.value,
        Err(e) => return errors::ledger_error_to_response(e),
    };

    (
        StatusCode::OK,
        Json(dto::BalanceResponse {
            account_id,
            balance,
            cached,
        }),
    )
        .into_response()
}

/// GET /accounts/:id/entries?limit&offset
pub async fn list_entries(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
    Query(query): Query<dto::EntriesQuery>,
) -> axum::response::Response {
    let account_id = match dto::parse_account_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };

    match services
        .engine
        .entries(account_id, Pagination::new(query.limit, query.offset))
        .await
    {
        Ok(page) => (StatusCode::OK, Json(page)).into_response(),
        Err(e) => errors::ledger_error_to_response(e),
    }
}

/// POST /accounts/:id/actions
///
/// 200 when performed or already paid for, 402 when the balance is short.
pub async fn perform_action(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
    Json(body): Json<dto::PerformActionRequest>,
) -> axum::response::Response {
    let actor = match dto::parse_account_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    let action: ActionKind = match body.action.trim().parse() {
        Ok(a) => a,
        Err(e) => return errors::domain_error_to_response(e),
    };

    let outcome = match services
        .gateway
        .perform(actor, action, body.target_id.as_deref(), Utc::now())
        .await
    {
        Ok(o) => o,
        Err(e) => return errors::ledger_error_to_response(e),
    };

    let status = match outcome {
        ActionOutcome::InsufficientBalance { .. } => StatusCode::PAYMENT_REQUIRED,
        ActionOutcome::Performed { .. } | ActionOutcome::AlreadyPerformed { .. } => StatusCode::OK,
    };
    (status, Json(outcome)).into_response()
}

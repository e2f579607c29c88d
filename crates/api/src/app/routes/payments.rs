use std::sync::Arc;

use axum::{
    extract::Extension,
    http::StatusCode,
    response::IntoResponse,
    routing::post,
    Json, Router,
};
use chrono::Utc;

use creditledger_infra::payments::{ProviderStatus, SessionId, Settlement};

use crate::app::services::AppServices;
use crate::app::{dto, errors};

pub fn router() -> Router {
    Router::new()
        .route("/sessions", post(open_session))
        .route("/webhook", post(webhook))
}

/// POST /payments/sessions - remember a checkout so it can be reconciled later
pub async fn open_session(
    Extension(services): Extension<Arc<AppServices>>,
    Json(body): Json<dto::OpenSessionRequest>,
) -> axum::response::Response {
    let account_id = match dto::parse_account_id(&body.account_id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    let session_id = match SessionId::new(body.session_id) {
        Ok(id) => id,
        Err(e) => return errors::payment_error_to_response(e),
    };

    match services
        .checkout
        .open(session_id, account_id, body.credits, Utc::now())
        .await
    {
        Ok(session) => (StatusCode::CREATED, Json(session)).into_response(),
        Err(e) => errors::payment_error_to_response(e),
    }
}

/// POST /payments/webhook - provider notification
///
/// The body only names the session. Its state is confirmed with the provider
/// before anything is credited or failed. Deliveries may repeat; a paid
/// session is credited once.
pub async fn webhook(
    Extension(services): Extension<Arc<AppServices>>,
    Json(body): Json<dto::WebhookRequest>,
) -> axum::response::Response {
    let session_id = match SessionId::new(body.session_id) {
        Ok(id) => id,
        Err(e) => return errors::payment_error_to_response(e),
    };

    let settled = match services
        .checkout
        .settle(&session_id, services.provider.as_ref(), Utc::now())
        .await
    {
        Ok(settled) => settled,
        Err(e) => return errors::payment_error_to_response(e),
    };

    if body.status == Some(ProviderStatus::Paid) && !matches!(settled, Settlement::Credited(_)) {
        tracing::warn!(session_id = %session_id, "webhook claimed payment the provider does not confirm");
    }

    match settled {
        Settlement::Credited(outcome) => (StatusCode::OK, Json(outcome)).into_response(),
        Settlement::Failed { changed } => (
            StatusCode::OK,
            Json(serde_json::json!({
                "session_id": session_id,
                "status": "failed",
                "changed": changed,
            })),
        )
            .into_response(),
        Settlement::Open => (
            StatusCode::ACCEPTED,
            Json(serde_json::json!({
                "session_id": session_id,
                "status": "pending",
            })),
        )
            .into_response(),
    }
}

//! Scheduler hooks, behind the `CRON_SECRET` bearer check.

use std::sync::Arc;

use axum::{extract::Extension, http::StatusCode, response::IntoResponse, routing::post, Json, Router};
use chrono::Utc;

use crate::app::errors;
use crate::app::services::AppServices;

pub fn router() -> Router {
    Router::new().route("/reconcile", post(reconcile))
}

/// POST /cron/reconcile - run one reconciliation batch now
pub async fn reconcile(Extension(services): Extension<Arc<AppServices>>) -> axum::response::Response {
    match services.reconciliation.run_once(Utc::now()).await {
        Ok(report) => (StatusCode::OK, Json(report)).into_response(),
        Err(e) => errors::payment_error_to_response(e),
    }
}

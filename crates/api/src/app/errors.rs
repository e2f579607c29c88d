use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use serde_json::json;

use creditledger_core::DomainError;
use creditledger_infra::ledger_store::LedgerStoreError;
use creditledger_infra::payments::{PaymentError, ProviderError};
use creditledger_infra::LedgerError;

pub fn ledger_error_to_response(err: LedgerError) -> axum::response::Response {
    match err {
        LedgerError::Validation(msg) => json_error(StatusCode::BAD_REQUEST, "validation_error", msg),
        e @ LedgerError::IdempotencyKeyReused { .. } => {
            json_error(StatusCode::CONFLICT, "idempotency_key_reused", e.to_string())
        }
        e @ LedgerError::WouldGoNegative { .. } => {
            json_error(StatusCode::UNPROCESSABLE_ENTITY, "would_go_negative", e.to_string())
        }
        e @ LedgerError::Unavailable { .. } => unavailable(e.to_string()),
        LedgerError::Store(e) => store_error_to_response(e),
    }
}

fn store_error_to_response(err: LedgerStoreError) -> axum::response::Response {
    if err.is_transient() {
        return unavailable(err.to_string());
    }
    tracing::error!(error = %err, "ledger store error");
    json_error(StatusCode::INTERNAL_SERVER_ERROR, "store_error", err.to_string())
}

pub fn payment_error_to_response(err: PaymentError) -> axum::response::Response {
    match err {
        PaymentError::Validation(msg) => json_error(StatusCode::BAD_REQUEST, "validation_error", msg),
        PaymentError::NotFound(msg) => json_error(StatusCode::NOT_FOUND, "not_found", msg),
        PaymentError::Conflict(msg) => json_error(StatusCode::CONFLICT, "conflict", msg),
        PaymentError::Store(msg) => {
            tracing::error!(error = %msg, "payment session store error");
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "store_error", msg)
        }
        PaymentError::Provider(e @ ProviderError::UnknownSession(_)) => {
            json_error(StatusCode::NOT_FOUND, "unknown_session", e.to_string())
        }
        PaymentError::Provider(e @ ProviderError::Unavailable(_)) => {
            json_error(StatusCode::BAD_GATEWAY, "provider_unavailable", e.to_string())
        }
        PaymentError::Ledger(e) => ledger_error_to_response(e),
    }
}

pub fn domain_error_to_response(err: DomainError) -> axum::response::Response {
    match err {
        DomainError::InvalidId(msg) => json_error(StatusCode::BAD_REQUEST, "invalid_id", msg),
        DomainError::Validation(msg) | DomainError::InvariantViolation(msg) => {
            json_error(StatusCode::BAD_REQUEST, "validation_error", msg)
        }
    }
}

/// 503 with `Retry-After`: nothing was committed and the same request may be sent again.
fn unavailable(message: String) -> axum::response::Response {
    let mut response = json_error(StatusCode::SERVICE_UNAVAILABLE, "unavailable", message);
    response
        .headers_mut()
        .insert(header::RETRY_AFTER, header::HeaderValue::from_static("1"));
    response
}

pub fn json_error(
    status: StatusCode,
    code: &'static str,
    message: impl Into<String>,
) -> axum::response::Response {
    (
        status,
        axum::Json(json!({
            "error": code,
            "message": message.into(),
        })),
    )
        .into_response()
}

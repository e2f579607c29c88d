use std::sync::Arc;

use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    middleware::Next,
    response::Response,
};
use subtle::ConstantTimeEq;

/// Shared secret a route group expects as its bearer token.
///
/// `None` means the group is not configured and every request is refused.
#[derive(Clone)]
pub struct BearerSecret {
    name: &'static str,
    secret: Option<Arc<str>>,
}

impl BearerSecret {
    pub fn new(name: &'static str, secret: Option<String>) -> Self {
        Self {
            name,
            secret: secret.map(Arc::from),
        }
    }
}

pub async fn require_bearer(
    State(expected): State<BearerSecret>,
    req: axum::http::Request<axum::body::Body>,
    next: Next,
) -> Result<Response, StatusCode> {
    let Some(secret) = expected.secret.as_deref() else {
        tracing::warn!(group = expected.name, "request refused: secret not configured");
        return Err(StatusCode::UNAUTHORIZED);
    };

    let token = extract_bearer(req.headers())?;
    if !secret_matches(token, secret) {
        tracing::warn!(group = expected.name, "request refused: bad bearer token");
        return Err(StatusCode::UNAUTHORIZED);
    }

    Ok(next.run(req).await)
}

fn extract_bearer(headers: &HeaderMap) -> Result<&str, StatusCode> {
    let header = headers
        .get(axum::http::header::AUTHORIZATION)
        .ok_or(StatusCode::UNAUTHORIZED)?;

    let header = header.to_str().map_err(|_| StatusCode::UNAUTHORIZED)?;

    let header = header
        .strip_prefix("Bearer ")
        .ok_or(StatusCode::UNAUTHORIZED)?;

    let token = header.trim();
    if token.is_empty() {
        return Err(StatusCode::UNAUTHORIZED);
    }

    Ok(token)
}

fn secret_matches(token: &str, secret: &str) -> bool {
    bool::from(token.as_bytes().ct_eq(secret.as_bytes()))
}

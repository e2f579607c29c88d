use axum::{routing::get, Router};

pub mod accounts;
pub mod admin;
pub mod cron;
pub mod payments;
pub mod system;

/// Router for endpoints open to any caller.
pub fn public_router() -> Router {
    Router::new()
        .route("/health", get(system::health))
        .nest("/accounts", accounts::router())
}

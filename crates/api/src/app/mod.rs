//! HTTP application wiring (Axum router + service wiring).
//!
//! - `services.rs`: ledger store, engine, payments and schedules
//! - `routes/`: handlers, one file per area
//! - `dto.rs`: request/response bodies
//! - `errors.rs`: consistent `{ "error", "message" }` responses

use std::sync::Arc;

use axum::{Extension, Router};
use tower::ServiceBuilder;

use crate::middleware::{require_bearer, BearerSecret};
use crate::settings::ApiSettings;

pub mod dto;
pub mod errors;
pub mod routes;
pub mod services;

use services::AppServices;

/// Build the full HTTP router (used by `main.rs` and the black-box tests).
pub fn build_app(services: Arc<AppServices>, settings: &ApiSettings) -> Router {
    let admin = routes::admin::router().route_layer(axum::middleware::from_fn_with_state(
        BearerSecret::new("admin", settings.admin_token.clone()),
        require_bearer,
    ));
    let cron = routes::cron::router().route_layer(axum::middleware::from_fn_with_state(
        BearerSecret::new("cron", settings.cron_secret.clone()),
        require_bearer,
    ));
    let payments = routes::payments::router().route_layer(axum::middleware::from_fn_with_state(
        BearerSecret::new("payments", settings.payments_secret.clone()),
        require_bearer,
    ));

    routes::public_router()
        .nest("/admin", admin)
        .nest("/cron", cron)
        .nest("/payments", payments)
        .layer(ServiceBuilder::new().layer(Extension(services)))
}

//! HTTP API for the credit ledger: routing, auth and request/response mapping.

pub mod app;
pub mod middleware;
pub mod settings;

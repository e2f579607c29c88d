use std::sync::Arc;

use anyhow::Context;

use creditledger_api::app::{self, services};
use creditledger_api::settings::ApiSettings;
use creditledger_infra::LedgerConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    creditledger_observability::init();

    let settings = ApiSettings::from_env()?;
    let config = LedgerConfig::from_env().context("invalid ledger configuration")?;

    if settings.admin_token.is_none() {
        tracing::warn!("ADMIN_TOKEN not set; admin routes will refuse every request");
    }
    if settings.cron_secret.is_none() {
        tracing::warn!("CRON_SECRET not set; cron routes will refuse every request");
    }
    if settings.payments_secret.is_none() {
        tracing::warn!("PAYMENT_WEBHOOK_SECRET not set; payment routes will refuse every request");
    }

    let services = Arc::new(services::build_services(&settings, config).await?);
    let jobs = settings
        .run_background_jobs
        .then(|| services::BackgroundJobs::spawn(services.clone()));

    let app = app::build_app(services, &settings);

    let listener = tokio::net::TcpListener::bind(settings.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", settings.bind_addr))?;

    tracing::info!("listening on {}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    if let Some(jobs) = jobs {
        jobs.shutdown().await;
    }
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown signal received");
}

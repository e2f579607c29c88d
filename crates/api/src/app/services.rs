//! Service wiring: ledger store, engine, payments, schedules.

use std::sync::Arc;

use anyhow::Context;
use chrono::Utc;
use sqlx::postgres::PgPoolOptions;

use creditledger_infra::ledger_store::{InMemoryLedgerStore, LedgerStore, PostgresLedgerStore};
use creditledger_infra::payments::{
    CheckoutCompletion, InMemoryPaymentProvider, InMemoryPaymentSessionStore, PaymentProvider,
    PaymentSessionStore, PostgresPaymentSessionStore, ReconciliationJob,
};
use creditledger_infra::periodic::{spawn_periodic, PeriodicConfig, PeriodicHandle};
use creditledger_infra::{ActionGateway, CacheAuditor, LedgerConfig, LedgerEngine};

use crate::settings::ApiSettings;

/// Ledger store behind the API, chosen at startup.
pub type SharedLedgerStore = Arc<dyn LedgerStore>;

pub struct AppServices {
    pub config: LedgerConfig,
    pub engine: Arc<LedgerEngine<SharedLedgerStore>>,
    pub gateway: ActionGateway<SharedLedgerStore>,
    pub checkout: Arc<CheckoutCompletion<SharedLedgerStore>>,
    /// Asked to confirm every webhook before it settles a session.
    pub provider: Arc<dyn PaymentProvider>,
    pub reconciliation: ReconciliationJob<SharedLedgerStore>,
    pub auditor: CacheAuditor<SharedLedgerStore>,
}

impl AppServices {
    pub fn new(
        config: LedgerConfig,
        store: SharedLedgerStore,
        sessions: Arc<dyn PaymentSessionStore>,
        provider: Arc<dyn PaymentProvider>,
    ) -> Self {
        let engine = Arc::new(LedgerEngine::with_controller(store, config.controller()));
        let checkout = Arc::new(CheckoutCompletion::new(engine.clone(), sessions));

        Self {
            gateway: ActionGateway::new(engine.clone(), config.costs.clone()),
            reconciliation: ReconciliationJob::new(checkout.clone(), provider.clone(), config.reconcile_config()),
            provider,
            auditor: CacheAuditor::new(engine.clone()),
            checkout,
            engine,
            config,
        }
    }

    /// In-memory stores (dev/test).
    pub fn in_memory(config: LedgerConfig, provider: Arc<dyn PaymentProvider>) -> Self {
        Self::new(
            config,
            Arc::new(InMemoryLedgerStore::new()),
            Arc::new(InMemoryPaymentSessionStore::new()),
            provider,
        )
    }

    /// Postgres-backed stores; installs the schema if missing.
    pub async fn persistent(
        config: LedgerConfig,
        database_url: &str,
        provider: Arc<dyn PaymentProvider>,
    ) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(20)
            .connect(database_url)
            .await
            .context("failed to connect to Postgres")?;

        let store = PostgresLedgerStore::with_options(pool.clone(), config.pg_options());
        store.ensure_schema().await.context("failed to install ledger schema")?;

        Ok(Self::new(
            config,
            Arc::new(store),
            Arc::new(PostgresPaymentSessionStore::new(pool)),
            provider,
        ))
    }
}

/// Build services from process settings.
///
/// No provider client is wired in: webhooks and the reconciliation job ask a
/// scripted provider, which knows nothing until told, so no session settles.
pub async fn build_services(settings: &ApiSettings, config: LedgerConfig) -> anyhow::Result<AppServices> {
    let provider: Arc<dyn PaymentProvider> = Arc::new(InMemoryPaymentProvider::new());

    if settings.use_persistent_stores {
        let url = settings
            .database_url
            .as_deref()
            .context("DATABASE_URL must be set when USE_PERSISTENT_STORES=true")?;
        tracing::info!(isolation = ?config.pg_isolation, "using Postgres ledger store");
        AppServices::persistent(config, url, provider).await
    } else {
        tracing::info!("using in-memory ledger store");
        Ok(AppServices::in_memory(config, provider))
    }
}

/// Reconciliation and cache audit schedules.
pub struct BackgroundJobs {
    pub reconciliation: PeriodicHandle,
    pub cache_audit: PeriodicHandle,
}

impl BackgroundJobs {
    pub fn spawn(services: Arc<AppServices>) -> Self {
        let reconcile_services = services.clone();
        let reconciliation = spawn_periodic(
            PeriodicConfig::new("payment_reconciliation", services.config.reconcile_interval()),
            move || {
                let services = reconcile_services.clone();
                async move { services.reconciliation.run_once(Utc::now()).await }
            },
        );

        let audit_services = services.clone();
        let auto_repair = services.config.audit.auto_repair;
        let cache_audit = spawn_periodic(
            PeriodicConfig::new("cache_audit", services.config.audit_interval()),
            move || {
                let services = audit_services.clone();
                async move { services.auditor.audit(auto_repair).await }
            },
        );

        Self {
            reconciliation,
            cache_audit,
        }
    }

    pub async fn shutdown(self) {
        self.reconciliation.shutdown().await;
        self.cache_audit.shutdown().await;
    }
}

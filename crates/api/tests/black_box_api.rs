use std::sync::Arc;

use reqwest::StatusCode;
use serde_json::{json, Value};

use creditledger_api::app::{build_app, services::AppServices};
use creditledger_api::settings::ApiSettings;
use creditledger_core::AccountId;
use creditledger_infra::payments::{InMemoryPaymentProvider, ProviderStatus, SessionId};
use creditledger_infra::LedgerConfig;

const ADMIN_TOKEN: &str = "admin-test-token";
const CRON_SECRET: &str = "cron-test-secret";
const PAYMENTS_SECRET: &str = "payments-test-secret";

struct TestServer {
    base_url: String,
    provider: Arc<InMemoryPaymentProvider>,
    client: reqwest::Client,
    handle: tokio::task::JoinHandle<()>,
}

impl TestServer {
    async fn spawn() -> Self {
        let mut config = LedgerConfig::default();
        // Every pending session is immediately eligible for reconciliation.
        config.reconcile.stale_minutes = 0;

        let provider = Arc::new(InMemoryPaymentProvider::new());
        let services = Arc::new(AppServices::in_memory(config, provider.clone()));
        let settings = ApiSettings {
            admin_token: Some(ADMIN_TOKEN.to_string()),
            cron_secret: Some(CRON_SECRET.to_string()),
            payments_secret: Some(PAYMENTS_SECRET.to_string()),
            run_background_jobs: false,
            ..ApiSettings::default()
        };

        // Same router as prod, bound to an ephemeral port.
        let app = build_app(services, &settings);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("failed to bind ephemeral port");
        let addr = listener.local_addr().unwrap();
        let base_url = format!("http://{}", addr);

        let handle = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            base_url,
            provider,
            client: reqwest::Client::new(),
            handle,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn adjust(&self, account: AccountId, amount: i64) -> reqwest::Response {
        self.client
            .post(self.url(&format!("/admin/accounts/{account}/adjustments")))
            .bearer_auth(ADMIN_TOKEN)
            .json(&json!({ "amount": amount, "reason": "test funding", "admin": "tester" }))
            .send()
            .await
            .unwrap()
    }

    async fn balance(&self, account: AccountId) -> Value {
        let res = self
            .client
            .get(self.url(&format!("/accounts/{account}/balance")))
            .send()
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        res.json().await.unwrap()
    }

    async fn action(&self, account: AccountId, action: &str, target: &str) -> reqwest::Response {
        self.client
            .post(self.url(&format!("/accounts/{account}/actions")))
            .json(&json!({ "action": action, "target_id": target }))
            .send()
            .await
            .unwrap()
    }

    async fn open_session(&self, session_id: &str, account: AccountId, credits: i64) {
        let res = self
            .client
            .post(self.url("/payments/sessions"))
            .bearer_auth(PAYMENTS_SECRET)
            .json(&json!({ "session_id": session_id, "account_id": account.to_string(), "credits": credits }))
            .send()
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::CREATED);
    }

    fn provider_reports(&self, session_id: &str, status: ProviderStatus) {
        self.provider.set_status(SessionId::new(session_id).unwrap(), status);
    }

    async fn webhook(&self, session_id: &str, status: &str) -> reqwest::Response {
        self.client
            .post(self.url("/payments/webhook"))
            .bearer_auth(PAYMENTS_SECRET)
            .json(&json!({ "session_id": session_id, "status": status }))
            .send()
            .await
            .unwrap()
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

#[tokio::test]
async fn health_is_public() {
    let srv = TestServer::spawn().await;
    let res = srv.client.get(srv.url("/health")).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);
}

#[tokio::test]
async fn admin_and_cron_routes_require_their_tokens() {
    let srv = TestServer::spawn().await;
    let account = AccountId::new();

    let res = srv
        .client
        .post(srv.url(&format!("/admin/accounts/{account}/sync")))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::UNAUTHORIZED);

    // The cron secret does not open admin routes, and vice versa.
    let res = srv
        .client
        .post(srv.url(&format!("/admin/accounts/{account}/sync")))
        .bearer_auth(CRON_SECRET)
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::UNAUTHORIZED);

    let res = srv
        .client
        .post(srv.url("/cron/reconcile"))
        .bearer_auth(ADMIN_TOKEN)
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn invalid_account_id_is_a_bad_request() {
    let srv = TestServer::spawn().await;
    let res = srv
        .client
        .get(srv.url("/accounts/not-a-uuid/balance"))
        .send()
        .await
        .unwrap();

    assert_eq!(res.status(), StatusCode::BAD_REQUEST);
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["error"], "invalid_id");
}

#[tokio::test]
async fn actions_charge_once_and_refuse_when_short() {
    let srv = TestServer::spawn().await;
    let account = AccountId::new();
    assert_eq!(srv.adjust(account, 20).await.status(), StatusCode::OK);

    let res = srv.action(account, "send_offer", "req-1").await;
    assert_eq!(res.status(), StatusCode::OK);
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["status"], "performed");
    assert_eq!(body["new_balance"], 15);

    let res = srv.action(account, "send_offer", "req-1").await;
    assert_eq!(res.status(), StatusCode::OK);
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["status"], "already_performed");
    assert_eq!(body["balance"], 15);

    assert_eq!(srv.action(account, "feature_listing", "listing-1").await.status(), StatusCode::OK);

    let res = srv.action(account, "feature_listing", "listing-2").await;
    assert_eq!(res.status(), StatusCode::PAYMENT_REQUIRED);
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["status"], "insufficient_balance");
    assert_eq!(body["balance"], 5);
    assert_eq!(body["cost"], 10);

    let balance = srv.balance(account).await;
    assert_eq!(balance["balance"], 5);
    assert_eq!(balance["cached"], 5);

    let res = srv
        .client
        .get(srv.url(&format!("/accounts/{account}/entries?limit=2")))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let page: Value = res.json().await.unwrap();
    assert_eq!(page["total"], 3);
    assert_eq!(page["entries"].as_array().unwrap().len(), 2);
    assert_eq!(page["has_more"], true);
}

#[tokio::test]
async fn unknown_action_is_rejected() {
    let srv = TestServer::spawn().await;
    let res = srv.action(AccountId::new(), "teleport", "x").await;
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_actions_never_overdraw() {
    let srv = Arc::new(TestServer::spawn().await);
    let account = AccountId::new();
    assert_eq!(srv.adjust(account, 10).await.status(), StatusCode::OK);

    let handles: Vec<_> = (0..5)
        .map(|i| {
            let srv = srv.clone();
            tokio::spawn(async move { srv.action(account, "send_offer", &format!("req-{i}")).await.status() })
        })
        .collect();

    let mut statuses = Vec::new();
    for handle in handles {
        statuses.push(handle.await.unwrap());
    }

    assert_eq!(statuses.iter().filter(|s| **s == StatusCode::OK).count(), 2);
    assert_eq!(statuses.iter().filter(|s| **s == StatusCode::PAYMENT_REQUIRED).count(), 3);
    assert_eq!(srv.balance(account).await["balance"], 0);
}

#[tokio::test]
async fn repeated_webhooks_credit_once() {
    let srv = TestServer::spawn().await;
    let account = AccountId::new();
    srv.open_session("cs_webhook_1", account, 100).await;
    srv.provider_reports("cs_webhook_1", ProviderStatus::Paid);

    let res = srv.webhook("cs_webhook_1", "paid").await;
    assert_eq!(res.status(), StatusCode::OK);
    let first: Value = res.json().await.unwrap();
    assert_eq!(first["idempotent"], false);
    assert_eq!(first["new_balance"], 100);

    let res = srv.webhook("cs_webhook_1", "paid").await;
    let second: Value = res.json().await.unwrap();
    assert_eq!(second["idempotent"], true);

    assert_eq!(srv.balance(account).await["balance"], 100);
}

#[tokio::test]
async fn expired_webhook_marks_session_failed() {
    let srv = TestServer::spawn().await;
    srv.open_session("cs_expired_1", AccountId::new(), 50).await;
    srv.provider_reports("cs_expired_1", ProviderStatus::Expired);

    let res = srv.webhook("cs_expired_1", "expired").await;
    assert_eq!(res.status(), StatusCode::OK);
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["changed"], true);

    let res = srv.webhook("cs_missing", "paid").await;
    assert_eq!(res.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn forged_paid_webhook_credits_nothing() {
    let srv = TestServer::spawn().await;
    let account = AccountId::new();
    srv.open_session("cs_forged_1", account, 1_000_000).await;

    // The provider has never seen this checkout.
    let res = srv.webhook("cs_forged_1", "paid").await;
    assert_eq!(res.status(), StatusCode::NOT_FOUND);
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["error"], "unknown_session");

    // Started but not paid.
    srv.provider_reports("cs_forged_1", ProviderStatus::Open);
    let res = srv.webhook("cs_forged_1", "paid").await;
    assert_eq!(res.status(), StatusCode::ACCEPTED);
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["status"], "pending");

    assert_eq!(srv.balance(account).await["balance"], 0);
}

#[tokio::test]
async fn payment_routes_require_the_payments_secret() {
    let srv = TestServer::spawn().await;
    let account = AccountId::new();
    srv.open_session("cs_auth_1", account, 100).await;
    srv.provider_reports("cs_auth_1", ProviderStatus::Paid);

    let unsigned = srv
        .client
        .post(srv.url("/payments/webhook"))
        .json(&json!({ "session_id": "cs_auth_1", "status": "paid" }))
        .send()
        .await
        .unwrap();
    assert_eq!(unsigned.status(), StatusCode::UNAUTHORIZED);

    let wrong_secret = srv
        .client
        .post(srv.url("/payments/sessions"))
        .bearer_auth(ADMIN_TOKEN)
        .json(&json!({ "session_id": "cs_auth_2", "account_id": account.to_string(), "credits": 5 }))
        .send()
        .await
        .unwrap();
    assert_eq!(wrong_secret.status(), StatusCode::UNAUTHORIZED);

    assert_eq!(srv.balance(account).await["balance"], 0);
}

#[tokio::test]
async fn reconciliation_recovers_a_missed_webhook() {
    let srv = TestServer::spawn().await;
    let account = AccountId::new();
    srv.open_session("cs_missed_1", account, 40).await;
    srv.provider
        .set_status(SessionId::new("cs_missed_1").unwrap(), ProviderStatus::Paid);

    let res = srv
        .client
        .post(srv.url("/cron/reconcile"))
        .bearer_auth(CRON_SECRET)
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let report: Value = res.json().await.unwrap();
    assert_eq!(report["credited"], 1);

    // The late webhook finds the credit already applied.
    let res = srv.webhook("cs_missed_1", "paid").await;
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["idempotent"], true);
    assert_eq!(srv.balance(account).await["balance"], 40);
}

#[tokio::test]
async fn admin_sync_and_audit_report_a_clean_cache() {
    let srv = TestServer::spawn().await;
    let account = AccountId::new();
    assert_eq!(srv.adjust(account, 25).await.status(), StatusCode::OK);
    assert_eq!(srv.adjust(account, -5).await.status(), StatusCode::OK);

    let res = srv
        .client
        .post(srv.url(&format!("/admin/accounts/{account}/sync")))
        .bearer_auth(ADMIN_TOKEN)
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["balance"], 20);

    let res = srv
        .client
        .post(srv.url("/admin/cache-audit?repair=true"))
        .bearer_auth(ADMIN_TOKEN)
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let report: Value = res.json().await.unwrap();
    assert_eq!(report["checked"], 1);
    assert!(report["drifted"].as_array().unwrap().is_empty());
}

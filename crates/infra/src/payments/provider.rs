use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::session::SessionId;

/// Payment state of a checkout session as reported by the provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderStatus {
    Paid,
    Unpaid,
    Expired,
    /// Checkout still in progress.
    Open,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProviderError {
    #[error("provider does not know session {0}")]
    UnknownSession(String),

    #[error("payment provider unavailable: {0}")]
    Unavailable(String),
}

/// Read-only view of the external payment provider.
#[async_trait]
pub trait PaymentProvider: Send + Sync {
    async fn session_status(&self, session_id: &SessionId) -> Result<ProviderStatus, ProviderError>;
}

/// Scripted provider for tests/dev: answers whatever status was last set.
#[derive(Debug, Default)]
pub struct InMemoryPaymentProvider {
    statuses: RwLock<HashMap<SessionId, ProviderStatus>>,
}

impl InMemoryPaymentProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_status(&self, session_id: SessionId, status: ProviderStatus) {
        if let Ok(mut statuses) = self.statuses.write() {
            statuses.insert(session_id, status);
        }
    }
}

#[async_trait]
impl PaymentProvider for InMemoryPaymentProvider {
    async fn session_status(&self, session_id: &SessionId) -> Result<ProviderStatus, ProviderError> {
        let statuses = self
            .statuses
            .read()
            .map_err(|_| ProviderError::Unavailable("lock poisoned".to_string()))?;
        statuses
            .get(session_id)
            .copied()
            .ok_or_else(|| ProviderError::UnknownSession(session_id.to_string()))
    }
}

//! Credit purchases through an external payment provider.

pub mod checkout;
pub mod postgres;
pub mod provider;
pub mod reconciliation;
pub mod session;

pub use checkout::{CheckoutCompletion, CompletionOutcome, Settlement};
pub use postgres::PostgresPaymentSessionStore;
pub use provider::{InMemoryPaymentProvider, PaymentProvider, ProviderError, ProviderStatus};
pub use reconciliation::{ReconcileConfig, ReconcileReport, ReconciliationJob};
pub use session::{
    InMemoryPaymentSessionStore, PaymentError, PaymentSession, PaymentSessionStore, SessionId, SessionStatus,
};

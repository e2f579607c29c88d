//! Paid marketplace actions and their prices.

use core::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use creditledger_core::{AccountId, DomainError, DomainResult};

use crate::idempotency::{IdempotencyKey, KeyScope};

/// An action an account pays credits to perform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    /// Send an offer in response to a request.
    SendOffer,
    /// Reveal the contact behind an expression of interest.
    UnlockInterest,
    /// Promote a listing to the featured slot.
    FeatureListing,
    /// Bump a listing back to the top.
    Republish,
    SubscriptionRenewal,
}

impl ActionKind {
    pub const ALL: [ActionKind; 5] = [
        ActionKind::SendOffer,
        ActionKind::UnlockInterest,
        ActionKind::FeatureListing,
        ActionKind::Republish,
        ActionKind::SubscriptionRenewal,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ActionKind::SendOffer => "send_offer",
            ActionKind::UnlockInterest => "unlock_interest",
            ActionKind::FeatureListing => "feature_listing",
            ActionKind::Republish => "republish",
            ActionKind::SubscriptionRenewal => "subscription_renewal",
        }
    }

    /// Repeatability of the action, which decides its key shape.
    pub fn scope(&self) -> KeyScope {
        match self {
            ActionKind::SendOffer | ActionKind::UnlockInterest => KeyScope::OneShot,
            ActionKind::FeatureListing | ActionKind::Republish => KeyScope::Daily,
            ActionKind::SubscriptionRenewal => KeyScope::Monthly,
        }
    }

    pub fn requires_target(&self) -> bool {
        !matches!(self, ActionKind::SubscriptionRenewal)
    }

    /// Deterministic key for `actor` performing this action on `target` at `at`.
    pub fn idempotency_key(
        &self,
        actor: AccountId,
        target: Option<&str>,
        at: DateTime<Utc>,
    ) -> DomainResult<IdempotencyKey> {
        let has_target = target.is_some_and(|t| !t.trim().is_empty());
        if self.requires_target() && !has_target {
            return Err(DomainError::validation(format!(
                "action '{}' requires a target id",
                self.as_str()
            )));
        }
        IdempotencyKey::for_action(self.as_str(), self.scope(), actor, target, at)
    }
}

impl core::fmt::Display for ActionKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ActionKind {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ActionKind::ALL
            .into_iter()
            .find(|a| a.as_str() == s)
            .ok_or_else(|| DomainError::validation(format!("unknown action '{s}'")))
    }
}

/// Credit price of each action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ActionCosts {
    pub send_offer: i64,
    pub unlock_interest: i64,
    pub feature_listing: i64,
    pub republish: i64,
    pub subscription_renewal: i64,
}

impl Default for ActionCosts {
    fn default() -> Self {
        Self {
            send_offer: 5,
            unlock_interest: 5,
            feature_listing: 10,
            republish: 3,
            subscription_renewal: 20,
        }
    }
}

impl ActionCosts {
    pub fn cost_of(&self, action: ActionKind) -> i64 {
        match action {
            ActionKind::SendOffer => self.send_offer,
            ActionKind::UnlockInterest => self.unlock_interest,
            ActionKind::FeatureListing => self.feature_listing,
            ActionKind::Republish => self.republish,
            ActionKind::SubscriptionRenewal => self.subscription_renewal,
        }
    }

    /// Every price must be a positive integer.
    pub fn validate(&self) -> DomainResult<()> {
        for action in ActionKind::ALL {
            let cost = self.cost_of(action);
            if cost <= 0 {
                return Err(DomainError::validation(format!(
                    "cost of '{action}' must be positive (got {cost})"
                )));
            }
        }
        Ok(())
    }
}

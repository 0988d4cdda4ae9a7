//! Canonical payment events.
//!
//! Provider webhooks are normalized into a [`PaymentEvent`] at the boundary, so the
//! ledger and the payment log never see provider-specific shapes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::AccountId;

/// Supported payment providers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Provider {
    /// Stripe Checkout.
    Stripe,
    /// PayPal Orders / Captures.
    #[serde(rename = "paypal")]
    PayPal,
}

impl Provider {
    /// Stable lowercase name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Stripe => "stripe",
            Self::PayPal => "paypal",
        }
    }
}

impl std::fmt::Display for Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Provider {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "stripe" => Ok(Self::Stripe),
            "paypal" => Ok(Self::PayPal),
            other => Err(format!("unknown provider: {other}")),
        }
    }
}

/// Outcome reported by the provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentOutcome {
    /// Money was captured.
    Completed,
    /// The payment failed or was declined.
    Failed,
}

impl PaymentOutcome {
    /// Stable lowercase name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl std::str::FromStr for PaymentOutcome {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown payment outcome: {other}")),
        }
    }
}

/// A provider webhook in canonical form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentEvent {
    /// Which provider sent the event.
    pub provider: Provider,
    /// Provider payment id; the dedup key.
    pub external_id: String,
    /// Account to credit.
    pub account_id: AccountId,
    /// Purchased plan / package.
    pub plan_id: String,
    /// Credits granted by the plan.
    pub credits: i64,
    /// Amount paid, in minor currency units.
    pub amount_minor: i64,
    /// ISO currency code, uppercase.
    pub currency: String,
    /// Completed or failed.
    pub outcome: PaymentOutcome,
    /// The verbatim payload, kept for audit.
    pub raw_payload: serde_json::Value,
}

/// Processing status of a stored payment event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    /// Recorded, ledger credit not yet committed.
    Received,
    /// Ledger credit committed.
    Applied,
    /// Provider reported failure; no balance change.
    Failed,
}

impl PaymentStatus {
    /// Stable lowercase name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Received => "received",
            Self::Applied => "applied",
            Self::Failed => "failed",
        }
    }
}

impl std::str::FromStr for PaymentStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "received" => Ok(Self::Received),
            "applied" => Ok(Self::Applied),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown payment status: {other}")),
        }
    }
}

/// A consumed payment event as stored in the dedup store / payment log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentRecord {
    /// The canonical event.
    pub event: PaymentEvent,
    /// Processing status.
    pub status: PaymentStatus,
    /// First time this external id was seen.
    pub created_at: DateTime<Utc>,
    /// Last status change.
    pub updated_at: DateTime<Utc>,
}

impl PaymentRecord {
    /// Create a freshly received record.
    #[must_use]
    pub fn received(event: PaymentEvent) -> Self {
        let now = Utc::now();
        Self {
            event,
            status: PaymentStatus::Received,
            created_at: now,
            updated_at: now,
        }
    }

    /// Whether a new delivery with `outcome` has nothing left to do.
    ///
    /// Applied records are final. A failed record is final unless the new event
    /// reports completion (e.g. an async payment that eventually succeeded).
    /// Received records still need their ledger credit.
    #[must_use]
    pub fn is_settled_for(&self, outcome: PaymentOutcome) -> bool {
        match self.status {
            PaymentStatus::Applied => true,
            PaymentStatus::Failed => outcome == PaymentOutcome::Failed,
            PaymentStatus::Received => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(outcome: PaymentOutcome) -> PaymentEvent {
        PaymentEvent {
            provider: Provider::PayPal,
            external_id: "cap_123".into(),
            account_id: AccountId::new("acct_1").unwrap(),
            plan_id: "credits_100".into(),
            credits: 100,
            amount_minor: 1000,
            currency: "USD".into(),
            outcome,
            raw_payload: serde_json::json!({}),
        }
    }

    #[test]
    fn applied_record_is_settled() {
        let mut record = PaymentRecord::received(event(PaymentOutcome::Completed));
        assert!(!record.is_settled_for(PaymentOutcome::Completed));
        record.status = PaymentStatus::Applied;
        assert!(record.is_settled_for(PaymentOutcome::Completed));
        assert!(record.is_settled_for(PaymentOutcome::Failed));
    }

    #[test]
    fn failed_record_upgrades_on_completion() {
        let mut record = PaymentRecord::received(event(PaymentOutcome::Failed));
        record.status = PaymentStatus::Failed;
        assert!(record.is_settled_for(PaymentOutcome::Failed));
        assert!(!record.is_settled_for(PaymentOutcome::Completed));
    }

    #[test]
    fn provider_names() {
        assert_eq!(Provider::PayPal.as_str(), "paypal");
        assert_eq!(
            serde_json::to_string(&Provider::PayPal).unwrap(),
            "\"paypal\""
        );
        assert_eq!("stripe".parse::<Provider>(), Ok(Provider::Stripe));
    }
}

//! Durable audit records.
//!
//! Rejected webhooks, failed payments, and reconciliation anomalies are written
//! here so they can be reviewed by hand.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::AuditId;

/// What an audit record is about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditKind {
    /// A webhook was rejected (malformed, unsupported, unknown plan).
    WebhookRejected,
    /// A provider reported a failed payment.
    PaymentFailed,
    /// A job consumed more than it reserved.
    ReconciliationAnomaly,
    /// A ledger call failed after its payment was recorded.
    LedgerFailure,
}

impl AuditKind {
    /// Stable lowercase name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::WebhookRejected => "webhook_rejected",
            Self::PaymentFailed => "payment_failed",
            Self::ReconciliationAnomaly => "reconciliation_anomaly",
            Self::LedgerFailure => "ledger_failure",
        }
    }
}

impl std::str::FromStr for AuditKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "webhook_rejected" => Ok(Self::WebhookRejected),
            "payment_failed" => Ok(Self::PaymentFailed),
            "reconciliation_anomaly" => Ok(Self::ReconciliationAnomaly),
            "ledger_failure" => Ok(Self::LedgerFailure),
            other => Err(format!("unknown audit kind: {other}")),
        }
    }
}

/// One audit log row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditRecord {
    /// Record id.
    pub id: AuditId,
    /// Record kind.
    pub kind: AuditKind,
    /// What the record refers to (external id, job id, account id).
    pub subject: String,
    /// Structured details.
    pub detail: serde_json::Value,
    /// When the record was written.
    pub created_at: DateTime<Utc>,
}

impl AuditRecord {
    /// Create a new record stamped now.
    #[must_use]
    pub fn new(kind: AuditKind, subject: impl Into<String>, detail: serde_json::Value) -> Self {
        Self {
            id: AuditId::generate(),
            kind,
            subject: subject.into(),
            detail,
            created_at: Utc::now(),
        }
    }
}

//! Ledger entry types for pagecredit.
//!
//! Every balance change is recorded as an immutable [`LedgerEntry`]. The sum of an
//! account's entry deltas always equals its balance.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{AccountId, EntryId};

/// An immutable ledger entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    /// Unique entry ID (ULID for time-ordering).
    pub id: EntryId,

    /// The account whose balance was affected.
    pub account_id: AccountId,

    /// Signed balance change. Positive = credit, negative = debit.
    pub delta: i64,

    /// Classification of the entry.
    pub kind: EntryKind,

    /// Human-readable reason.
    pub reason: String,

    /// Caller- or event-supplied key. Unique across the whole ledger.
    pub idempotency_key: String,

    /// Balance after this entry was applied.
    pub balance_after: i64,

    /// Additional metadata (job id, provider, plan, ...).
    pub metadata: serde_json::Value,

    /// When the entry was created.
    pub created_at: DateTime<Utc>,
}

/// Type of ledger entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryKind {
    /// Provisional deduction for a batch job.
    Reservation,

    /// Direct deduction outside the batch flow.
    Debit,

    /// Credits bought through a payment provider.
    Purchase,

    /// Unused reservation returned to the account.
    Refund,

    /// Credits granted by an operator.
    Grant,
}

impl EntryKind {
    /// Check if this kind adds credits.
    #[must_use]
    pub const fn is_credit(&self) -> bool {
        matches!(self, Self::Purchase | Self::Refund | Self::Grant)
    }

    /// Check if this kind removes credits.
    #[must_use]
    pub const fn is_debit(&self) -> bool {
        matches!(self, Self::Reservation | Self::Debit)
    }

    /// Stable lowercase name (matches the serde representation).
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Reservation => "reservation",
            Self::Debit => "debit",
            Self::Purchase => "purchase",
            Self::Refund => "refund",
            Self::Grant => "grant",
        }
    }
}

impl std::str::FromStr for EntryKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "reservation" => Ok(Self::Reservation),
            "debit" => Ok(Self::Debit),
            "purchase" => Ok(Self::Purchase),
            "refund" => Ok(Self::Refund),
            "grant" => Ok(Self::Grant),
            other => Err(format!("unknown entry kind: {other}")),
        }
    }
}

/// A request to append one entry to the ledger.
///
/// The store turns this into a [`LedgerEntry`] atomically with the balance update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryRequest {
    /// Account to mutate.
    pub account_id: AccountId,
    /// Signed balance change.
    pub delta: i64,
    /// Entry classification.
    pub kind: EntryKind,
    /// Human-readable reason.
    pub reason: String,
    /// Idempotency key.
    pub idempotency_key: String,
    /// Additional metadata.
    pub metadata: serde_json::Value,
}

impl EntryRequest {
    /// Build a debit-side request (`delta = -amount`).
    #[must_use]
    pub fn debit(
        kind: EntryKind,
        account_id: AccountId,
        amount: i64,
        idempotency_key: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            account_id,
            delta: -amount.abs(),
            kind,
            reason: reason.into(),
            idempotency_key: idempotency_key.into(),
            metadata: serde_json::Value::Null,
        }
    }

    /// Build a credit-side request (`delta = +amount`).
    #[must_use]
    pub fn credit(
        kind: EntryKind,
        account_id: AccountId,
        amount: i64,
        idempotency_key: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            account_id,
            delta: amount.abs(),
            kind,
            reason: reason.into(),
            idempotency_key: idempotency_key.into(),
            metadata: serde_json::Value::Null,
        }
    }

    /// Attach metadata.
    #[must_use]
    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }

    /// Materialize the entry given the balance after it is applied.
    #[must_use]
    pub fn into_entry(self, balance_after: i64) -> LedgerEntry {
        LedgerEntry {
            id: EntryId::generate(),
            account_id: self.account_id,
            delta: self.delta,
            kind: self.kind,
            reason: self.reason,
            idempotency_key: self.idempotency_key,
            balance_after,
            metadata: self.metadata,
            created_at: Utc::now(),
        }
    }

    /// Whether an existing entry with the same key describes the same mutation.
    #[must_use]
    pub fn matches(&self, entry: &LedgerEntry) -> bool {
        entry.account_id == self.account_id && entry.delta == self.delta
    }
}

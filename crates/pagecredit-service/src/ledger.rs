//! The credit ledger.
//!
//! Every balance mutation in the service goes through [`CreditLedger`]. It adds
//! argument validation and reconciliation on top of [`Store::apply_entry`]; the
//! atomicity itself comes from the store transaction, never from a lock here.

use std::sync::Arc;

use serde::Serialize;

use pagecredit_core::{
    Account, AccountId, AuditKind, AuditRecord, EntryKind, EntryRequest, JobId, LedgerEntry,
};
use pagecredit_store::{ApplyOutcome, Store, StoreError};

/// Ledger-level failures.
#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    /// The debit would make the balance negative.
    #[error("insufficient funds: balance={balance}, required={required}")]
    InsufficientFunds {
        /// Current balance.
        balance: i64,
        /// Credits the debit needed.
        required: i64,
    },

    /// Debits are refused on disabled accounts.
    #[error("account disabled: {0}")]
    AccountDisabled(String),

    /// The idempotency key belongs to a different mutation.
    #[error("idempotency key reused with different parameters: {0}")]
    IdempotencyConflict(String),

    /// Amounts must be strictly positive.
    #[error("invalid amount: {0}")]
    InvalidAmount(i64),

    /// Storage failed; nothing was applied.
    #[error(transparent)]
    Store(StoreError),
}

impl From<StoreError> for LedgerError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::InsufficientCredits { balance, required } => {
                Self::InsufficientFunds { balance, required }
            }
            StoreError::AccountDisabled { account_id } => Self::AccountDisabled(account_id),
            StoreError::IdempotencyConflict { key } => Self::IdempotencyConflict(key),
            other => Self::Store(other),
        }
    }
}

/// Result of reconciling a reservation against actual consumption.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Reconciled {
    /// Credits returned to the account.
    pub refunded: i64,
    /// Balance after the refund, when one was written.
    pub new_balance: Option<i64>,
}

/// Stored balance compared with the sum of ledger deltas.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BalanceAudit {
    /// The audited account.
    pub account_id: AccountId,
    /// Balance column.
    pub balance: i64,
    /// Sum of every entry delta.
    pub ledger_sum: i64,
    /// Whether the two agree.
    pub consistent: bool,
}

/// Atomic, idempotent credit mutations.
#[derive(Clone)]
pub struct CreditLedger {
    store: Arc<dyn Store>,
}

impl CreditLedger {
    /// Create a ledger over `store`.
    #[must_use]
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Apply an arbitrary entry request.
    ///
    /// # Errors
    ///
    /// See [`Store::apply_entry`]; a zero delta is rejected as `InvalidAmount`.
    pub async fn apply(&self, request: EntryRequest) -> Result<ApplyOutcome, LedgerError> {
        if request.delta == 0 {
            return Err(LedgerError::InvalidAmount(0));
        }
        let kind = request.kind;
        let account_id = request.account_id.clone();
        let outcome = self.store.apply_entry(request).await?;

        match &outcome {
            ApplyOutcome::Applied(entry) => tracing::info!(
                account_id = %account_id,
                kind = kind.as_str(),
                delta = entry.delta,
                balance_after = entry.balance_after,
                key = %entry.idempotency_key,
                "Ledger entry applied"
            ),
            ApplyOutcome::AlreadyApplied(entry) => tracing::debug!(
                account_id = %account_id,
                key = %entry.idempotency_key,
                "Idempotent replay, returning prior entry"
            ),
        }
        Ok(outcome)
    }

    /// Reserve credits for a batch job.
    ///
    /// # Errors
    ///
    /// Returns `InsufficientFunds`, `AccountDisabled`, `IdempotencyConflict`,
    /// `InvalidAmount` for non-positive amounts, or a storage error.
    pub async fn reserve(
        &self,
        account_id: &AccountId,
        amount: i64,
        idempotency_key: &str,
        reason: &str,
    ) -> Result<ApplyOutcome, LedgerError> {
        self.debit(EntryKind::Reservation, account_id, amount, idempotency_key, reason)
            .await
    }

    /// Deduct credits outside the batch flow.
    ///
    /// # Errors
    ///
    /// Same as [`CreditLedger::reserve`].
    pub async fn deduct(
        &self,
        account_id: &AccountId,
        amount: i64,
        idempotency_key: &str,
        reason: &str,
    ) -> Result<ApplyOutcome, LedgerError> {
        self.debit(EntryKind::Debit, account_id, amount, idempotency_key, reason)
            .await
    }

    /// Add credits. There is no floor check and disabled accounts still receive them.
    ///
    /// # Errors
    ///
    /// Returns `IdempotencyConflict`, `InvalidAmount` for non-positive amounts, or a
    /// storage error.
    pub async fn credit(
        &self,
        kind: EntryKind,
        account_id: &AccountId,
        amount: i64,
        idempotency_key: &str,
        reason: &str,
    ) -> Result<ApplyOutcome, LedgerError> {
        if amount <= 0 {
            return Err(LedgerError::InvalidAmount(amount));
        }
        self.apply(EntryRequest::credit(
            kind,
            account_id.clone(),
            amount,
            idempotency_key,
            reason,
        ))
        .await
    }

    async fn debit(
        &self,
        kind: EntryKind,
        account_id: &AccountId,
        amount: i64,
        idempotency_key: &str,
        reason: &str,
    ) -> Result<ApplyOutcome, LedgerError> {
        if amount <= 0 {
            return Err(LedgerError::InvalidAmount(amount));
        }
        self.apply(EntryRequest::debit(
            kind,
            account_id.clone(),
            amount,
            idempotency_key,
            reason,
        ))
        .await
    }

    /// Settle a job's reservation against what it actually consumed.
    ///
    /// Unused credits are refunded under `idempotency_key`. Consumption above the
    /// reservation is never charged; it is written to the audit log instead, once
    /// per job however often the job is reconciled.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the refund or the audit record cannot be written.
    pub async fn reconcile(
        &self,
        account_id: &AccountId,
        job_id: &JobId,
        reserved: i64,
        actual: i64,
        idempotency_key: &str,
    ) -> Result<Reconciled, LedgerError> {
        if actual > reserved {
            tracing::warn!(
                account_id = %account_id,
                job_id = %job_id,
                reserved,
                actual,
                "Job consumed more than it reserved"
            );
            let subject = job_id.to_string();
            let recorded = self
                .store
                .list_audit(Some(AuditKind::ReconciliationAnomaly), Some(&subject), 1)
                .await?;
            if recorded.is_empty() {
                self.store
                    .append_audit(&AuditRecord::new(
                        AuditKind::ReconciliationAnomaly,
                        subject,
                        serde_json::json!({
                            "account_id": account_id,
                            "reserved": reserved,
                            "actual": actual,
                        }),
                    ))
                    .await?;
            }
            return Ok(Reconciled {
                refunded: 0,
                new_balance: None,
            });
        }

        let refund = reserved - actual;
        if refund == 0 {
            return Ok(Reconciled {
                refunded: 0,
                new_balance: None,
            });
        }

        let request = EntryRequest::credit(
            EntryKind::Refund,
            account_id.clone(),
            refund,
            idempotency_key,
            "unused reservation",
        )
        .with_metadata(serde_json::json!({
            "job_id": job_id,
            "reserved": reserved,
            "actual": actual,
        }));
        let outcome = self.apply(request).await?;

        Ok(Reconciled {
            refunded: refund,
            new_balance: Some(outcome.entry().balance_after),
        })
    }

    /// Current balance; unknown accounts have zero.
    ///
    /// # Errors
    ///
    /// Returns a storage error.
    pub async fn balance(&self, account_id: &AccountId) -> Result<i64, LedgerError> {
        Ok(self
            .store
            .get_account(account_id)
            .await?
            .map_or(0, |account| account.balance))
    }

    /// The account record, if it exists.
    ///
    /// # Errors
    ///
    /// Returns a storage error.
    pub async fn account(&self, account_id: &AccountId) -> Result<Option<Account>, LedgerError> {
        Ok(self.store.get_account(account_id).await?)
    }

    /// Entries for an account, newest first.
    ///
    /// # Errors
    ///
    /// Returns a storage error.
    pub async fn history(
        &self,
        account_id: &AccountId,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<LedgerEntry>, LedgerError> {
        Ok(self.store.list_entries(account_id, limit, offset).await?)
    }

    /// Recompute the balance from the ledger and compare.
    ///
    /// # Errors
    ///
    /// Returns a storage error.
    pub async fn audit_balance(&self, account_id: &AccountId) -> Result<BalanceAudit, LedgerError> {
        let balance = self.balance(account_id).await?;
        let ledger_sum = self.store.sum_deltas(account_id).await?;
        let consistent = balance == ledger_sum;
        if !consistent {
            tracing::error!(
                account_id = %account_id,
                balance,
                ledger_sum,
                "Balance does not match ledger"
            );
        }
        Ok(BalanceAudit {
            account_id: account_id.clone(),
            balance,
            ledger_sum,
            consistent,
        })
    }

    /// Enable or disable spending on an account.
    ///
    /// # Errors
    ///
    /// Returns a storage error.
    pub async fn set_disabled(
        &self,
        account_id: &AccountId,
        disabled: bool,
    ) -> Result<Account, LedgerError> {
        let account = self.store.set_account_disabled(account_id, disabled).await?;
        tracing::info!(account_id = %account_id, disabled, "Account spending flag changed");
        Ok(account)
    }
}

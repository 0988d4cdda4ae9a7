//! Storage layer for pagecredit.
//!
//! The [`Store`] trait owns every durable table of the service: accounts, the
//! append-only ledger, the payment dedup log, the audit log, batch jobs and rate
//! limit windows. Three backends implement it:
//!
//! - [`MemoryStore`]: a single mutex around plain maps, for tests and local runs
//! - [`PgStore`]: PostgreSQL via `sqlx`, row locks plus unique constraints
//! - `RocksStore` (feature `rocksdb-backend`): an embedded `TransactionDB`
//!
//! # Atomicity
//!
//! Every balance mutation goes through [`Store::apply_entry`], which checks the
//! idempotency key, applies the delta and appends the entry in one transaction.
//! Callers never read a balance and write it back themselves.
//!
//! # Example
//!
//! ```no_run
//! use pagecredit_core::{AccountId, EntryKind, EntryRequest};
//! use pagecredit_store::{MemoryStore, Store};
//!
//! # async fn run() -> pagecredit_store::Result<()> {
//! let store = MemoryStore::new();
//! let account = AccountId::new("acct_1").unwrap();
//! let request = EntryRequest::credit(EntryKind::Grant, account.clone(), 100, "grant:1", "welcome");
//! store.apply_entry(request).await?;
//! assert_eq!(store.get_account(&account).await?.unwrap().balance, 100);
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod error;
pub mod memory;
pub mod postgres;

#[cfg(feature = "rocksdb-backend")]
pub mod keys;
#[cfg(feature = "rocksdb-backend")]
pub mod rocks;
#[cfg(feature = "rocksdb-backend")]
pub mod schema;

pub use error::{Result, StoreError};
pub use memory::MemoryStore;
pub use postgres::PgStore;
#[cfg(feature = "rocksdb-backend")]
pub use rocks::RocksStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use pagecredit_core::{
    Account, AccountId, AuditKind, AuditRecord, BatchJob, EntryRequest, JobId, LedgerEntry,
    PaymentRecord,
};

/// Result of appending a ledger entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// The entry was written by this call.
    Applied(LedgerEntry),
    /// An entry with the same idempotency key already existed; nothing changed.
    AlreadyApplied(LedgerEntry),
}

impl ApplyOutcome {
    /// The entry, whether new or pre-existing.
    #[must_use]
    pub fn entry(&self) -> &LedgerEntry {
        match self {
            Self::Applied(entry) | Self::AlreadyApplied(entry) => entry,
        }
    }

    /// Consume the outcome and return the entry.
    #[must_use]
    pub fn into_entry(self) -> LedgerEntry {
        match self {
            Self::Applied(entry) | Self::AlreadyApplied(entry) => entry,
        }
    }

    /// Whether this call wrote the entry.
    #[must_use]
    pub const fn is_new(&self) -> bool {
        matches!(self, Self::Applied(_))
    }
}

/// Resolve a replayed idempotency key against the stored entry.
///
/// # Errors
///
/// Returns `StoreError::IdempotencyConflict` if the replay names a different
/// account or amount.
pub fn resolve_replay(request: &EntryRequest, existing: LedgerEntry) -> Result<ApplyOutcome> {
    if request.matches(&existing) {
        Ok(ApplyOutcome::AlreadyApplied(existing))
    } else {
        Err(StoreError::IdempotencyConflict {
            key: request.idempotency_key.clone(),
        })
    }
}

/// Check a debit against the account state, returning the new balance.
///
/// # Errors
///
/// - `StoreError::AccountDisabled` for debits on a disabled account.
/// - `StoreError::InsufficientCredits` if the balance would go negative.
pub fn checked_balance(account: &Account, delta: i64) -> Result<i64> {
    if delta < 0 {
        if account.disabled {
            return Err(StoreError::AccountDisabled {
                account_id: account.account_id.to_string(),
            });
        }
        if !account.has_sufficient_credits(-delta) {
            return Err(StoreError::InsufficientCredits {
                balance: account.balance,
                required: -delta,
            });
        }
    }
    account
        .balance
        .checked_add(delta)
        .ok_or_else(|| StoreError::Database(format!("balance overflow for {}", account.account_id)))
}

/// Check that a `save_job` write may replace `stored`.
///
/// # Errors
///
/// - `StoreError::JobFinished` if `stored` is terminal.
/// - `StoreError::LeaseLost` if `stored` is owned by someone other than the writer.
pub fn check_job_write(stored: &BatchJob, next: &BatchJob) -> Result<()> {
    if stored.state.is_terminal() {
        return Err(StoreError::JobFinished {
            id: stored.id.to_string(),
        });
    }
    if stored.owner_id.is_some() && stored.owner_id != next.owner_id {
        return Err(StoreError::LeaseLost {
            id: stored.id.to_string(),
        });
    }
    Ok(())
}

/// The storage trait defining all database operations.
///
/// Implementations must make each method atomic on its own; compound flows in the
/// service rely on idempotency keys rather than cross-call transactions.
#[async_trait]
pub trait Store: Send + Sync {
    // =========================================================================
    // Account Operations
    // =========================================================================

    /// Get an account. Accounts are created implicitly by their first entry.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    async fn get_account(&self, account_id: &AccountId) -> Result<Option<Account>>;

    /// Enable or disable an account, creating it if missing.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    async fn set_account_disabled(&self, account_id: &AccountId, disabled: bool)
        -> Result<Account>;

    // =========================================================================
    // Ledger Operations
    // =========================================================================

    /// Apply a balance change and append its entry atomically.
    ///
    /// If an entry with the same idempotency key exists, nothing is written and
    /// the stored entry is returned as `AlreadyApplied`.
    ///
    /// # Errors
    ///
    /// - `StoreError::IdempotencyConflict` if the key exists with another account or delta.
    /// - `StoreError::InsufficientCredits` if a debit would make the balance negative.
    /// - `StoreError::AccountDisabled` for debits on a disabled account.
    async fn apply_entry(&self, request: EntryRequest) -> Result<ApplyOutcome>;

    /// Look up an entry by idempotency key.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    async fn get_entry_by_key(&self, idempotency_key: &str) -> Result<Option<LedgerEntry>>;

    /// List entries for an account, newest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    async fn list_entries(
        &self,
        account_id: &AccountId,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<LedgerEntry>>;

    /// Sum of every entry delta for an account.
    ///
    /// Always equals the account balance; exposed for audits.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    async fn sum_deltas(&self, account_id: &AccountId) -> Result<i64>;

    // =========================================================================
    // Payment Operations
    // =========================================================================

    /// Get a payment record by provider payment id.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    async fn get_payment(&self, external_id: &str) -> Result<Option<PaymentRecord>>;

    /// Insert a payment record unless one exists for the same external id.
    ///
    /// Returns the existing record when there was one, `None` when inserted.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    async fn insert_payment_if_absent(&self, record: &PaymentRecord)
        -> Result<Option<PaymentRecord>>;

    /// Overwrite a payment record (status change, failed-to-completed upgrade).
    ///
    /// An `applied` record is final: writing any other status over it is
    /// skipped and `false` is returned.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    async fn save_payment(&self, record: &PaymentRecord) -> Result<bool>;

    // =========================================================================
    // Audit Operations
    // =========================================================================

    /// Append an audit record.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    async fn append_audit(&self, record: &AuditRecord) -> Result<()>;

    /// List audit records, newest first, optionally filtered by kind and subject.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    async fn list_audit(
        &self,
        kind: Option<AuditKind>,
        subject: Option<&str>,
        limit: usize,
    ) -> Result<Vec<AuditRecord>>;

    // =========================================================================
    // Job Operations
    // =========================================================================

    /// Insert a new job with its tasks, including its initial lease.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::DuplicateKey` if the submission key is taken.
    async fn insert_job(&self, job: &BatchJob) -> Result<()>;

    /// Get a job with its tasks.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    async fn get_job(&self, job_id: &JobId) -> Result<Option<BatchJob>>;

    /// Find the job funded by a submission key.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    async fn find_job_by_submission_key(&self, submission_key: &str) -> Result<Option<BatchJob>>;

    /// Persist job state and tasks.
    ///
    /// A stored `cancel_requested` flag is never cleared by this call and the
    /// stored lease is left as is; only [`Store::claim_job`] moves it.
    ///
    /// # Errors
    ///
    /// - `StoreError::NotFound` if the job does not exist.
    /// - `StoreError::JobFinished` if the stored job is already terminal.
    /// - `StoreError::LeaseLost` if another instance owns the stored job.
    async fn save_job(&self, job: &BatchJob) -> Result<()>;

    /// Take or renew the processing lease on a non-terminal job.
    ///
    /// Succeeds when the job has no owner, is owned by `owner`, or its lease
    /// expired before `now`. Returns the job as stored after the claim, or
    /// `None` if the job is missing, terminal or leased elsewhere.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    async fn claim_job(
        &self,
        job_id: &JobId,
        owner: &str,
        now: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<Option<BatchJob>>;

    /// Flag a job for cancellation and return it.
    ///
    /// Terminal jobs are returned unchanged.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    async fn request_cancel(&self, job_id: &JobId) -> Result<Option<BatchJob>>;

    /// Whether cancellation was requested for a job.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    async fn cancel_requested(&self, job_id: &JobId) -> Result<bool>;

    /// Jobs in a non-terminal state, oldest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    async fn list_incomplete_jobs(&self) -> Result<Vec<BatchJob>>;

    // =========================================================================
    // Rate Limit Operations
    // =========================================================================

    /// Increment the counter for `(identity, window_start)` and return the new count.
    ///
    /// Windows that started before `window_start` may be discarded.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    async fn increment_window(&self, identity: &str, window_start: i64) -> Result<u32>;
}

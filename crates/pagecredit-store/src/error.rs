//! Error types for pagecredit storage.

/// Result type for storage operations.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Errors that can occur in storage operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Database operation failed.
    #[error("database error: {0}")]
    Database(String),

    /// Serialization/deserialization failed.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Record not found.
    #[error("{entity} not found: {id}")]
    NotFound {
        /// Kind of record.
        entity: &'static str,
        /// Identifier that was looked up.
        id: String,
    },

    /// Insufficient credits for a debit.
    #[error("insufficient credits: balance={balance}, required={required}")]
    InsufficientCredits {
        /// Current balance.
        balance: i64,
        /// Credits the debit needed.
        required: i64,
    },

    /// Debits are refused while an account is disabled.
    #[error("account disabled: {account_id}")]
    AccountDisabled {
        /// The disabled account.
        account_id: String,
    },

    /// An idempotency key was replayed with a different account or amount.
    #[error("idempotency key reused with different parameters: {key}")]
    IdempotencyConflict {
        /// The reused key.
        key: String,
    },

    /// The job already reached a terminal state and no longer accepts writes.
    #[error("job already finished: {id}")]
    JobFinished {
        /// The finished job.
        id: String,
    },

    /// Another instance holds the processing lease on the job.
    #[error("job leased by another instance: {id}")]
    LeaseLost {
        /// The contested job.
        id: String,
    },

    /// A unique key (job submission key) already exists.
    #[error("duplicate key: {key}")]
    DuplicateKey {
        /// The conflicting key.
        key: String,
    },
}

impl StoreError {
    /// Shorthand for a `NotFound` error.
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        Self::Database(err.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

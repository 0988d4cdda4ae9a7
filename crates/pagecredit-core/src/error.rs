//! Error types for pagecredit domain logic.

use crate::ids::IdError;
use crate::JobState;

/// Result type for domain operations.
pub type Result<T> = std::result::Result<T, BillingError>;

/// Errors raised by domain validation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BillingError {
    /// Insufficient credits for the operation.
    #[error("insufficient credits: balance={balance}, required={required}")]
    InsufficientCredits {
        /// Current balance.
        balance: i64,
        /// Required amount.
        required: i64,
    },

    /// Amount is zero, negative, or out of range.
    #[error("invalid amount: {0}")]
    InvalidAmount(String),

    /// Operation is not in the supported set.
    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    /// Job state machine violation.
    #[error("invalid job transition from {from:?} to {to:?}")]
    InvalidTransition {
        /// The current state.
        from: JobState,
        /// The requested state.
        to: JobState,
    },

    /// Invalid identifier.
    #[error("invalid identifier: {0}")]
    InvalidId(#[from] IdError),
}

//! API error types and responses.

use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

use pagecredit_store::StoreError;

use crate::jobs::JobError;
use crate::ledger::LedgerError;

/// API error type.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// Unauthorized - missing or invalid credentials.
    #[error("unauthorized")]
    Unauthorized,

    /// Forbidden - valid credentials but the action is not allowed.
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// Resource not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// Bad request - invalid input.
    #[error("bad request: {0}")]
    BadRequest(String),

    /// Conflict - an idempotency key was reused with different parameters.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Insufficient credits.
    #[error("need {} more credits", .required - .balance)]
    InsufficientCredits {
        /// Current balance.
        balance: i64,
        /// Required amount.
        required: i64,
    },

    /// Too many requests in the current window.
    #[error("rate limit exceeded")]
    RateLimited {
        /// Seconds until the window resets.
        retry_after_secs: u64,
    },

    /// Internal server error.
    #[error("internal error: {0}")]
    Internal(String),
}

/// JSON error response body.
#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: ErrorBody,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    code: String,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<serde_json::Value>,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, message, details) = match &self {
            Self::Unauthorized => (
                StatusCode::UNAUTHORIZED,
                "unauthorized",
                self.to_string(),
                None,
            ),
            Self::Forbidden(msg) => (StatusCode::FORBIDDEN, "forbidden", msg.clone(), None),
            Self::NotFound(msg) => (StatusCode::NOT_FOUND, "not_found", msg.clone(), None),
            Self::BadRequest(msg) => (StatusCode::BAD_REQUEST, "bad_request", msg.clone(), None),
            Self::Conflict(msg) => (StatusCode::CONFLICT, "conflict", msg.clone(), None),
            Self::InsufficientCredits { balance, required } => (
                StatusCode::PAYMENT_REQUIRED,
                "insufficient_credits",
                self.to_string(),
                Some(serde_json::json!({
                    "balance": balance,
                    "required": required,
                    "shortfall": required - balance,
                })),
            ),
            Self::RateLimited { retry_after_secs } => (
                StatusCode::TOO_MANY_REQUESTS,
                "rate_limited",
                self.to_string(),
                Some(serde_json::json!({ "retry_after": retry_after_secs })),
            ),
            Self::Internal(msg) => {
                tracing::error!(error = %msg, "Internal server error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal_error",
                    "An internal error occurred".to_string(),
                    None,
                )
            }
        };

        let body = ErrorResponse {
            error: ErrorBody {
                code: code.to_string(),
                message,
                details,
            },
        };

        let mut response = (status, Json(body)).into_response();
        if let Self::RateLimited { retry_after_secs } = self {
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, retry_after_secs.into());
        }
        response
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound { entity, id } => Self::NotFound(format!("{entity} not found: {id}")),
            StoreError::InsufficientCredits { balance, required } => {
                Self::InsufficientCredits { balance, required }
            }
            StoreError::AccountDisabled { account_id } => {
                Self::Forbidden(format!("account {account_id} is disabled"))
            }
            StoreError::IdempotencyConflict { key } => Self::Conflict(format!(
                "idempotency key {key} was already used with different parameters"
            )),
            StoreError::DuplicateKey { key } => Self::Conflict(format!("duplicate key: {key}")),
            StoreError::JobFinished { id } => Self::Conflict(format!("job {id} already finished")),
            StoreError::LeaseLost { id } => {
                Self::Conflict(format!("job {id} is processed by another instance"))
            }
            StoreError::Database(msg) | StoreError::Serialization(msg) => Self::Internal(msg),
        }
    }
}

impl From<LedgerError> for ApiError {
    fn from(err: LedgerError) -> Self {
        match err {
            LedgerError::InsufficientFunds { balance, required } => {
                Self::InsufficientCredits { balance, required }
            }
            LedgerError::AccountDisabled(account_id) => {
                Self::Forbidden(format!("account {account_id} is disabled"))
            }
            LedgerError::IdempotencyConflict(key) => Self::Conflict(format!(
                "idempotency key {key} was already used with different parameters"
            )),
            LedgerError::InvalidAmount(amount) => {
                Self::BadRequest(format!("amount must be positive, got {amount}"))
            }
            LedgerError::Store(err) => err.into(),
        }
    }
}

impl From<JobError> for ApiError {
    fn from(err: JobError) -> Self {
        match err {
            JobError::RateLimited { retry_after_secs } => Self::RateLimited { retry_after_secs },
            JobError::InvalidInput(msg) => Self::BadRequest(msg),
            JobError::NotFound(id) => Self::NotFound(format!("job not found: {id}")),
            JobError::State(err) => Self::Internal(err.to_string()),
            JobError::Ledger(err) => err.into(),
            JobError::Store(err) => err.into(),
        }
    }
}

impl From<pagecredit_core::BillingError> for ApiError {
    fn from(err: pagecredit_core::BillingError) -> Self {
        Self::BadRequest(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insufficient_credits_message_names_shortfall() {
        let err = ApiError::InsufficientCredits {
            balance: 3,
            required: 10,
        };
        assert_eq!(err.to_string(), "need 7 more credits");
        assert_eq!(err.into_response().status(), StatusCode::PAYMENT_REQUIRED);
    }

    #[test]
    fn rate_limited_sets_retry_after() {
        let response = ApiError::RateLimited {
            retry_after_secs: 42,
        }
        .into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers()[header::RETRY_AFTER], "42");
    }

    #[test]
    fn storage_errors_are_internal() {
        let err: ApiError = StoreError::Database("connection reset".into()).into();
        assert!(matches!(err, ApiError::Internal(_)));

        let err: ApiError = StoreError::IdempotencyConflict { key: "k".into() }.into();
        assert!(matches!(err, ApiError::Conflict(_)));
    }
}

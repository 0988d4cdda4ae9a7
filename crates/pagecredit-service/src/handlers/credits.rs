//! Credit balance, history and direct charge handlers.

use std::sync::Arc;

use axum::extract::{Query, State};
use axum::Json;
use serde::{Deserialize, Serialize};

use pagecredit_core::{AccountId, EntryKind, LedgerEntry};
use pagecredit_store::ApplyOutcome;

use crate::auth::{AuthUser, ServiceAuth};
use crate::error::ApiError;
use crate::state::AppState;

/// Largest page accepted by the transaction listing.
const MAX_PAGE_SIZE: usize = 200;

/// Balance response.
#[derive(Debug, Serialize)]
pub struct BalanceResponse {
    /// Account id.
    pub account_id: AccountId,
    /// Balance in credits.
    pub balance: i64,
    /// Whether spending is disabled.
    pub disabled: bool,
}

/// Get the caller's credit balance. Unknown accounts report zero.
pub async fn get_balance(
    State(state): State<Arc<AppState>>,
    auth: AuthUser,
) -> Result<Json<BalanceResponse>, ApiError> {
    let account = state.ledger.account(&auth.account_id).await?;

    Ok(Json(BalanceResponse {
        balance: account.as_ref().map_or(0, |a| a.balance),
        disabled: account.is_some_and(|a| a.disabled),
        account_id: auth.account_id,
    }))
}

/// Transaction list query parameters.
#[derive(Debug, Deserialize)]
pub struct ListTransactionsQuery {
    /// Maximum number of entries to return (default: 50).
    #[serde(default = "default_limit")]
    pub limit: usize,
    /// Offset for pagination (default: 0).
    #[serde(default)]
    pub offset: usize,
}

fn default_limit() -> usize {
    50
}

/// One ledger entry as returned to clients.
#[derive(Debug, Serialize)]
pub struct TransactionResponse {
    /// Entry id.
    pub id: String,
    /// Signed balance change.
    pub delta: i64,
    /// Entry kind.
    pub kind: EntryKind,
    /// Balance after this entry.
    pub balance_after: i64,
    /// Reason.
    pub reason: String,
    /// Idempotency key.
    pub idempotency_key: String,
    /// Timestamp.
    pub created_at: String,
}

impl From<&LedgerEntry> for TransactionResponse {
    fn from(entry: &LedgerEntry) -> Self {
        Self {
            id: entry.id.to_string(),
            delta: entry.delta,
            kind: entry.kind,
            balance_after: entry.balance_after,
            reason: entry.reason.clone(),
            idempotency_key: entry.idempotency_key.clone(),
            created_at: entry.created_at.to_rfc3339(),
        }
    }
}

/// List transactions response.
#[derive(Debug, Serialize)]
pub struct ListTransactionsResponse {
    /// Entries, newest first.
    pub transactions: Vec<TransactionResponse>,
    /// Whether there are more entries.
    pub has_more: bool,
}

/// List the caller's ledger entries.
pub async fn list_transactions(
    State(state): State<Arc<AppState>>,
    auth: AuthUser,
    Query(query): Query<ListTransactionsQuery>,
) -> Result<Json<ListTransactionsResponse>, ApiError> {
    // Fetch one more than requested to determine has_more
    let limit = query.limit.clamp(1, MAX_PAGE_SIZE);
    let entries = state
        .ledger
        .history(&auth.account_id, limit + 1, query.offset)
        .await?;

    let has_more = entries.len() > limit;
    let transactions = entries.iter().take(limit).map(TransactionResponse::from).collect();

    Ok(Json(ListTransactionsResponse {
        transactions,
        has_more,
    }))
}

/// Direct deduction request.
#[derive(Debug, Deserialize)]
pub struct DeductRequest {
    /// Credits to deduct.
    pub amount: i64,
    /// Client key; retries with the same key are no-ops.
    pub idempotency_key: String,
    /// Why the credits are spent.
    #[serde(default)]
    pub reason: Option<String>,
}

/// Result of a ledger mutation.
#[derive(Debug, Serialize)]
pub struct EntryResponse {
    /// Entry id (the prior entry on replay).
    pub entry_id: String,
    /// Balance right after the entry.
    pub balance: i64,
    /// Whether this call was an idempotent replay.
    pub already_applied: bool,
}

impl From<ApplyOutcome> for EntryResponse {
    fn from(outcome: ApplyOutcome) -> Self {
        let already_applied = !outcome.is_new();
        let entry = outcome.into_entry();
        Self {
            entry_id: entry.id.to_string(),
            balance: entry.balance_after,
            already_applied,
        }
    }
}

fn require_key(key: &str) -> Result<(), ApiError> {
    if key.trim().is_empty() {
        return Err(ApiError::BadRequest("idempotency_key is required".into()));
    }
    Ok(())
}

/// Ledger key for a client deduction, scoped to the caller's account.
///
/// Client keys never share a namespace with server keys such as
/// `payment:{provider}:{id}` or `refund:{job}`.
fn deduct_key(account_id: &AccountId, key: &str) -> String {
    format!("deduct:{account_id}:{key}")
}

/// Ledger key for an operator grant.
fn grant_key(key: &str) -> String {
    format!("grant:{key}")
}

/// Deduct credits from the caller's account.
pub async fn deduct(
    State(state): State<Arc<AppState>>,
    auth: AuthUser,
    Json(request): Json<DeductRequest>,
) -> Result<Json<EntryResponse>, ApiError> {
    let decision = state.rate_limiter.check(auth.account_id.as_str()).await?;
    if !decision.allowed {
        return Err(ApiError::RateLimited {
            retry_after_secs: decision.retry_after_secs,
        });
    }
    require_key(&request.idempotency_key)?;

    let outcome = state
        .ledger
        .deduct(
            &auth.account_id,
            request.amount,
            &deduct_key(&auth.account_id, &request.idempotency_key),
            request.reason.as_deref().unwrap_or("usage"),
        )
        .await?;

    Ok(Json(outcome.into()))
}

/// Operator credit grant request.
#[derive(Debug, Deserialize)]
pub struct GrantRequest {
    /// Account to credit.
    pub account_id: AccountId,
    /// Credits to add.
    pub amount: i64,
    /// Caller key; retries with the same key are no-ops.
    pub idempotency_key: String,
    /// Why the credits are granted.
    #[serde(default)]
    pub reason: Option<String>,
}

/// Grant credits to any account (service API key).
pub async fn grant(
    State(state): State<Arc<AppState>>,
    service: ServiceAuth,
    Json(request): Json<GrantRequest>,
) -> Result<Json<EntryResponse>, ApiError> {
    require_key(&request.idempotency_key)?;

    let outcome = state
        .ledger
        .credit(
            EntryKind::Grant,
            &request.account_id,
            request.amount,
            &grant_key(&request.idempotency_key),
            request.reason.as_deref().unwrap_or("grant"),
        )
        .await?;

    tracing::info!(
        service = %service.service_name,
        account_id = %request.account_id,
        amount = request.amount,
        "Credits granted"
    );

    Ok(Json(outcome.into()))
}

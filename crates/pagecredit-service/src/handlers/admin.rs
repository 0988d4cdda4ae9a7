//! Operator endpoints (service API key).

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::Json;
use serde::{Deserialize, Serialize};

use pagecredit_core::{Account, AccountId, AuditKind, AuditRecord};

use crate::auth::ServiceAuth;
use crate::error::ApiError;
use crate::ledger::BalanceAudit;
use crate::state::AppState;

fn parse_account(raw: &str) -> Result<AccountId, ApiError> {
    raw.parse::<AccountId>()
        .map_err(|e| ApiError::BadRequest(e.to_string()))
}

/// Block debits on an account. Credits still apply.
pub async fn disable_account(
    State(state): State<Arc<AppState>>,
    service: ServiceAuth,
    Path(account_id): Path<String>,
) -> Result<Json<Account>, ApiError> {
    let account_id = parse_account(&account_id)?;
    let account = state.ledger.set_disabled(&account_id, true).await?;
    tracing::info!(service = %service.service_name, account_id = %account_id, "Account disabled");
    Ok(Json(account))
}

/// Re-enable debits on an account.
pub async fn enable_account(
    State(state): State<Arc<AppState>>,
    service: ServiceAuth,
    Path(account_id): Path<String>,
) -> Result<Json<Account>, ApiError> {
    let account_id = parse_account(&account_id)?;
    let account = state.ledger.set_disabled(&account_id, false).await?;
    tracing::info!(service = %service.service_name, account_id = %account_id, "Account enabled");
    Ok(Json(account))
}

/// Compare an account's balance with the sum of its ledger entries.
pub async fn audit_balance(
    State(state): State<Arc<AppState>>,
    _service: ServiceAuth,
    Path(account_id): Path<String>,
) -> Result<Json<BalanceAudit>, ApiError> {
    let account_id = parse_account(&account_id)?;
    Ok(Json(state.ledger.audit_balance(&account_id).await?))
}

/// Audit log query.
#[derive(Debug, Deserialize)]
pub struct AuditLogQuery {
    /// Filter by kind, e.g. `webhook_rejected`.
    pub kind: Option<String>,
    /// Filter by subject (external id, job id).
    pub subject: Option<String>,
    /// Max records (default 100).
    #[serde(default = "default_limit")]
    pub limit: usize,
}

fn default_limit() -> usize {
    100
}

/// Audit log response.
#[derive(Debug, Serialize)]
pub struct AuditLogResponse {
    /// Records, newest first.
    pub records: Vec<AuditRecord>,
}

/// List audit records.
pub async fn list_audit_log(
    State(state): State<Arc<AppState>>,
    _service: ServiceAuth,
    Query(query): Query<AuditLogQuery>,
) -> Result<Json<AuditLogResponse>, ApiError> {
    let kind = query
        .kind
        .as_deref()
        .map(str::parse::<AuditKind>)
        .transpose()
        .map_err(ApiError::BadRequest)?;

    let records = state
        .store
        .list_audit(kind, query.subject.as_deref(), query.limit.clamp(1, 1000))
        .await?;

    Ok(Json(AuditLogResponse { records }))
}

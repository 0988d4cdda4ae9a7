//! Payment provider webhook handlers.

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::Json;

use pagecredit_core::Provider;

use crate::error::ApiError;
use crate::payments::{GatewayError, GatewayOutcome, ProviderPayload};
use crate::state::AppState;

/// Handle Stripe webhooks.
pub async fn stripe_webhook(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<(StatusCode, Json<GatewayOutcome>), ApiError> {
    handle(&state, Provider::Stripe, &headers, &body).await
}

/// Handle PayPal webhooks.
pub async fn paypal_webhook(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<(StatusCode, Json<GatewayOutcome>), ApiError> {
    handle(&state, Provider::PayPal, &headers, &body).await
}

async fn handle(
    state: &AppState,
    provider: Provider,
    headers: &HeaderMap,
    body: &[u8],
) -> Result<(StatusCode, Json<GatewayOutcome>), ApiError> {
    state.verifier.verify(provider, headers, body).map_err(|e| {
        tracing::warn!(provider = %provider, error = %e, "Webhook signature rejected");
        ApiError::BadRequest(e.to_string())
    })?;

    let outcome = state
        .gateway
        .handle(ProviderPayload::new(provider, body))
        .await
        .map_err(|e| match e {
            GatewayError::Store(err) => ApiError::from(err),
            GatewayError::Ledger(err) => ApiError::Internal(err.to_string()),
        })?;

    let status = match &outcome {
        GatewayOutcome::Accepted { .. }
        | GatewayOutcome::Duplicate { .. }
        | GatewayOutcome::Ignored { .. } => StatusCode::OK,
        GatewayOutcome::Rejected { code: "unknown_plan", .. } => StatusCode::UNPROCESSABLE_ENTITY,
        GatewayOutcome::Rejected { .. } => StatusCode::BAD_REQUEST,
    };

    Ok((status, Json(outcome)))
}

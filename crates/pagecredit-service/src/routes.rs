//! Router configuration.

use std::sync::Arc;
use std::time::Duration;

use axum::routing::{get, post};
use axum::Router;
use tower::limit::ConcurrencyLimitLayer;
use tower_http::cors::{Any, CorsLayer};
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use crate::handlers::{admin, credits, health, jobs, webhooks};
use crate::state::AppState;

/// Maximum concurrent requests for job endpoints.
const JOBS_MAX_CONCURRENT_REQUESTS: usize = 100;

/// Maximum concurrent requests for general API endpoints.
const API_MAX_CONCURRENT_REQUESTS: usize = 50;

/// Create the service router with all routes and middleware.
///
/// # Routes
///
/// ## Public
/// - `GET /health` - Health check
///
/// ## Credits (user JWT)
/// - `GET /v1/credits/balance` - Current balance
/// - `GET /v1/credits/transactions` - Ledger history
/// - `POST /v1/credits/deduct` - Direct deduction (rate-limited)
///
/// ## Jobs (user JWT)
/// - `POST /v1/jobs` - Submit a batch (rate-limited)
/// - `GET /v1/jobs/{job_id}` - Job status
/// - `POST /v1/jobs/{job_id}/cancel` - Cancel a job
///
/// ## Operators (service API key)
/// - `POST /v1/credits/grant` - Grant credits
/// - `POST /v1/admin/accounts/{account_id}/disable` and `/enable`
/// - `GET /v1/admin/accounts/{account_id}/audit` - Balance conservation check
/// - `GET /v1/admin/audit-log` - Audit records
///
/// ## Webhooks (signature verification)
/// - `POST /webhooks/stripe`
/// - `POST /webhooks/paypal`
pub fn create_router(state: Arc<AppState>) -> Router {
    let cors = build_cors_layer(&state.config.cors_origins);
    let max_body_bytes = state.config.max_body_bytes;
    let request_timeout_seconds = state.config.request_timeout_seconds;

    let job_routes = Router::new()
        .route("/", post(jobs::create_job))
        .route("/:job_id", get(jobs::get_job))
        .route("/:job_id/cancel", post(jobs::cancel_job))
        .layer(ConcurrencyLimitLayer::new(JOBS_MAX_CONCURRENT_REQUESTS));

    let admin_routes = Router::new()
        .route("/accounts/:account_id/disable", post(admin::disable_account))
        .route("/accounts/:account_id/enable", post(admin::enable_account))
        .route("/accounts/:account_id/audit", get(admin::audit_balance))
        .route("/audit-log", get(admin::list_audit_log));

    let api_routes = Router::new()
        .route("/credits/balance", get(credits::get_balance))
        .route("/credits/transactions", get(credits::list_transactions))
        .route("/credits/deduct", post(credits::deduct))
        .route("/credits/grant", post(credits::grant))
        .nest("/jobs", job_routes)
        .nest("/admin", admin_routes)
        .layer(ConcurrencyLimitLayer::new(API_MAX_CONCURRENT_REQUESTS));

    Router::new()
        .route("/health", get(health::health))
        .nest("/v1", api_routes)
        // Webhooks are throttled by the providers, not by us
        .route("/webhooks/stripe", post(webhooks::stripe_webhook))
        .route("/webhooks/paypal", post(webhooks::paypal_webhook))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .layer(RequestBodyLimitLayer::new(max_body_bytes))
        .layer(TimeoutLayer::new(Duration::from_secs(request_timeout_seconds)))
        .with_state(state)
}

/// Build the CORS layer from configured origins.
fn build_cors_layer(origins: &[String]) -> CorsLayer {
    if origins.iter().any(|o| o == "*") {
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any)
    } else {
        let origins: Vec<_> = origins.iter().filter_map(|o| o.parse().ok()).collect();

        CorsLayer::new()
            .allow_origin(origins)
            .allow_methods(Any)
            .allow_headers(Any)
    }
}

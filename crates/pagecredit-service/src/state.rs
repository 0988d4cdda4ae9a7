//! Application state.

use std::sync::Arc;

use pagecredit_store::Store;

use crate::config::{RateLimitBackend, ServiceConfig};
use crate::jobs::{BatchOrchestrator, JobSettings, Processor};
use crate::ledger::CreditLedger;
use crate::payments::{HmacVerifier, ReconciliationGateway, WebhookVerifier};
use crate::rate_limit::{LocalRateLimiter, RateLimiter, StoreRateLimiter};

/// Application state shared across handlers.
pub struct AppState {
    /// The storage backend.
    pub store: Arc<dyn Store>,

    /// Service configuration.
    pub config: ServiceConfig,

    /// Credit ledger.
    pub ledger: CreditLedger,

    /// Payment webhook gateway.
    pub gateway: ReconciliationGateway,

    /// Webhook signature check.
    pub verifier: Arc<dyn WebhookVerifier>,

    /// Batch job orchestrator.
    pub jobs: Arc<BatchOrchestrator>,

    /// Request rate limiter for deductions and job submissions.
    pub rate_limiter: Arc<dyn RateLimiter>,

    local_limiter: Option<LocalRateLimiter>,
}

impl AppState {
    /// Wire the service components together.
    #[must_use]
    pub fn new(store: Arc<dyn Store>, config: ServiceConfig, processor: Arc<dyn Processor>) -> Self {
        let pricing = Arc::new(config.pricing.clone());
        let ledger = CreditLedger::new(Arc::clone(&store));
        let gateway =
            ReconciliationGateway::new(Arc::clone(&store), ledger.clone(), Arc::clone(&pricing));
        let verifier: Arc<dyn WebhookVerifier> = Arc::new(HmacVerifier::new(
            config.stripe_webhook_secret.clone(),
            config.paypal_webhook_secret.clone(),
        ));

        let (rate_limiter, local_limiter): (Arc<dyn RateLimiter>, _) =
            match config.rate_limit_backend {
                RateLimitBackend::Local => {
                    let limiter = LocalRateLimiter::new(
                        config.rate_limit_max_requests,
                        config.rate_limit_window_seconds,
                    );
                    (Arc::new(limiter.clone()), Some(limiter))
                }
                RateLimitBackend::Store => (
                    Arc::new(StoreRateLimiter::new(
                        Arc::clone(&store),
                        config.rate_limit_max_requests,
                        config.rate_limit_window_seconds,
                    )),
                    None,
                ),
            };
        tracing::info!(
            backend = ?config.rate_limit_backend,
            max_requests = config.rate_limit_max_requests,
            window_seconds = config.rate_limit_window_seconds,
            "Rate limiter configured"
        );

        let jobs = Arc::new(BatchOrchestrator::new(
            Arc::clone(&store),
            ledger.clone(),
            processor,
            pricing,
            Arc::clone(&rate_limiter),
            JobSettings::from_config(&config),
        ));

        Self {
            store,
            config,
            ledger,
            gateway,
            verifier,
            jobs,
            rate_limiter,
            local_limiter,
        }
    }

    /// Start background maintenance (stale rate window sweeping).
    pub fn spawn_background_tasks(&self) {
        if let Some(limiter) = &self.local_limiter {
            limiter.spawn_sweeper();
        }
    }
}

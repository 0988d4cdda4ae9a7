//! pagecredit HTTP API service.
//!
//! A pay-per-use credit service for document processing:
//!
//! - [`ledger`]: atomic, idempotent credit mutations
//! - [`payments`]: Stripe and PayPal webhooks reconciled into ledger credits
//! - [`jobs`]: batch jobs that reserve credits, process files and refund the unused part
//! - [`rate_limit`]: fixed-window request limiting
//!
//! # Authentication
//!
//! 1. **User JWTs** (HS256, `sub` = account id) for balance, deductions and jobs
//! 2. **Service API key** (`x-api-key`) for grants and operator endpoints

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
// Allow some pedantic lints that are noisy for Axum handler functions
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::unused_async)]

pub mod auth;
pub mod config;
pub mod crypto;
pub mod error;
pub mod handlers;
pub mod jobs;
pub mod ledger;
pub mod payments;
pub mod rate_limit;
pub mod routes;
pub mod state;

pub use config::ServiceConfig;
pub use error::ApiError;
pub use ledger::CreditLedger;
pub use routes::create_router;
pub use state::AppState;

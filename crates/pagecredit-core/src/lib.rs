//! Core types for pagecredit.
//!
//! This crate provides the foundational types shared by the store and the service:
//!
//! - **Identifiers**: `AccountId`, `EntryId`, `AuditId`, `JobId`
//! - **Accounts**: `Account`
//! - **Ledger**: `LedgerEntry`, `EntryRequest`, `EntryKind`
//! - **Payments**: `PaymentEvent`, `PaymentRecord`, `Provider`
//! - **Jobs**: `BatchJob`, `FileTask`, `JobState`, `FileState`
//! - **Pricing**: `PricingConfig`, `Operation`
//! - **Audit**: `AuditRecord`, `AuditKind`
//!
//! # Credit Unit
//!
//! Balances are integer credits (`i64`). One file processed by a basic operation
//! costs one credit; plans grant a fixed number of credits.

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod account;
pub mod audit;
pub mod error;
pub mod ids;
pub mod job;
pub mod ledger;
pub mod money;
pub mod operation;
pub mod payment;
pub mod pricing;

pub use account::Account;
pub use audit::{AuditKind, AuditRecord};
pub use error::{BillingError, Result};
pub use ids::{AccountId, AuditId, EntryId, IdError, JobId, MAX_ACCOUNT_ID_LEN};
pub use job::{BatchJob, FileState, FileTask, JobState, Progress, CANCELLED_REASON};
pub use ledger::{EntryKind, EntryRequest, LedgerEntry};
pub use money::decimal_to_minor;
pub use operation::Operation;
pub use payment::{PaymentEvent, PaymentOutcome, PaymentRecord, PaymentStatus, Provider};
pub use pricing::{PricingConfig, DEFAULT_UNIT_COST};

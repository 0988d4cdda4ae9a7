//! Batch job orchestration.
//!
//! A job reserves `unit_cost × files` credits up front, drives every file through
//! the [`Processor`] with bounded parallelism and retries, then reconciles the
//! reservation against the files that actually completed.

pub mod orchestrator;
pub mod processor;

use std::time::Duration;

use pagecredit_core::{BillingError, JobId, Operation};
use pagecredit_store::StoreError;

use crate::config::ServiceConfig;
use crate::ledger::LedgerError;

pub use orchestrator::BatchOrchestrator;
pub use processor::{HttpProcessor, NoopProcessor, ProcessingError, Processor};

/// Longest accepted client request key.
pub const MAX_REQUEST_KEY_LEN: usize = 128;

/// Job orchestration errors.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    /// The account exceeded its submission rate.
    #[error("rate limit exceeded, retry in {retry_after_secs}s")]
    RateLimited {
        /// Seconds until the window resets.
        retry_after_secs: u64,
    },

    /// The submission failed validation.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// No such job for this account.
    #[error("job not found: {0}")]
    NotFound(JobId),

    /// The reservation or refund failed.
    #[error(transparent)]
    Ledger(#[from] LedgerError),

    /// Job state could not be read or written.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// A job state transition was refused.
    #[error(transparent)]
    State(#[from] BillingError),
}

/// A batch submission.
#[derive(Debug, Clone)]
pub struct SubmitRequest {
    /// Operation applied to every file.
    pub operation: Operation,
    /// Input document references.
    pub files: Vec<String>,
    /// Options passed to the processor.
    pub options: serde_json::Value,
    /// Client key making retries of this submission idempotent.
    pub request_key: Option<String>,
}

/// Orchestrator tuning.
#[derive(Debug, Clone)]
pub struct JobSettings {
    /// Files processed concurrently per job.
    pub max_parallel_files: usize,
    /// Attempts per file, including the first.
    pub max_file_attempts: u32,
    /// First retry delay.
    pub retry_base: Duration,
    /// Retry delay cap.
    pub retry_max: Duration,
    /// Most files accepted in one submission.
    pub max_files: usize,
    /// Owner name written on the jobs this process drives.
    pub instance_id: String,
    /// Lease length; drivers renew at a third of it.
    pub lease: Duration,
}

impl JobSettings {
    /// Read the job settings out of the service configuration.
    #[must_use]
    pub fn from_config(config: &ServiceConfig) -> Self {
        Self {
            max_parallel_files: config.job_max_parallel_files.max(1),
            max_file_attempts: config.job_max_file_attempts.max(1),
            retry_base: Duration::from_millis(config.job_retry_base_ms),
            retry_max: Duration::from_millis(config.job_retry_max_ms),
            max_files: config.job_max_files.max(1),
            instance_id: config.instance_id.clone(),
            lease: Duration::from_secs(config.job_lease_seconds.max(1)),
        }
    }
}

impl Default for JobSettings {
    fn default() -> Self {
        Self::from_config(&ServiceConfig::default())
    }
}

//! Batch job types.
//!
//! A [`BatchJob`] walks `Pending → Reserved → Running → {Completed, PartiallyFailed,
//! Failed}`. It owns one [`FileTask`] per input; tasks are never shared between jobs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::BillingError;
use crate::{AccountId, JobId, Operation};

/// Reason recorded on tasks that never ran because the job was cancelled.
pub const CANCELLED_REASON: &str = "cancelled";

/// Lifecycle state of a batch job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Accepted, credits not yet reserved.
    Pending,
    /// Credits reserved, work not yet dispatched.
    Reserved,
    /// Files are being processed.
    Running,
    /// Every file succeeded.
    Completed,
    /// Some files succeeded.
    PartiallyFailed,
    /// No file succeeded.
    Failed,
}

impl JobState {
    /// Terminal states are never left.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::PartiallyFailed | Self::Failed)
    }

    /// Whether `self → next` is a legal transition.
    #[must_use]
    pub const fn can_transition_to(&self, next: Self) -> bool {
        matches!(
            (*self, next),
            (Self::Pending, Self::Reserved)
                | (Self::Reserved, Self::Running)
                | (
                    Self::Running,
                    Self::Completed | Self::PartiallyFailed | Self::Failed
                )
        )
    }

    /// Stable lowercase name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Reserved => "reserved",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::PartiallyFailed => "partially_failed",
            Self::Failed => "failed",
        }
    }
}

impl std::str::FromStr for JobState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "reserved" => Ok(Self::Reserved),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "partially_failed" => Ok(Self::PartiallyFailed),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown job state: {other}")),
        }
    }
}

/// State of a single file within a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileState {
    /// Waiting to be dispatched.
    Pending,
    /// Handed to the processor.
    Processing,
    /// Produced an output.
    Completed,
    /// Gave up on this file.
    Failed,
}

impl FileState {
    /// Completed and failed tasks do not change again.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Stable lowercase name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl std::str::FromStr for FileState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "processing" => Ok(Self::Processing),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown file state: {other}")),
        }
    }
}

/// One input file of a batch job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileTask {
    /// Position of the input in the submission.
    pub index: u32,
    /// Reference to the input document.
    pub input_ref: String,
    /// Reference to the produced document, once completed.
    pub output_ref: Option<String>,
    /// Current state.
    pub state: FileState,
    /// Number of processing attempts made so far.
    pub attempts: u32,
    /// Last error, for failed tasks.
    pub error: Option<String>,
}

impl FileTask {
    /// Create a pending task.
    #[must_use]
    pub fn pending(index: u32, input_ref: impl Into<String>) -> Self {
        Self {
            index,
            input_ref: input_ref.into(),
            output_ref: None,
            state: FileState::Pending,
            attempts: 0,
            error: None,
        }
    }
}

/// Per-file progress counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Progress {
    /// Number of files in the job.
    pub total: usize,
    /// Files that produced an output.
    pub completed: usize,
    /// Files that gave up.
    pub failed: usize,
    /// Files pending or processing.
    pub remaining: usize,
}

/// A multi-file processing job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchJob {
    /// Job id.
    pub id: JobId,
    /// Owning account.
    pub account_id: AccountId,
    /// Operation applied to every file.
    pub operation: Operation,
    /// Operation options, passed through to the processor.
    pub options: serde_json::Value,
    /// Idempotency key of the reservation that funds this job.
    pub submission_key: String,
    /// Lifecycle state.
    pub state: JobState,
    /// One task per input, in submission order.
    pub files: Vec<FileTask>,
    /// Credits reserved at submission.
    pub reserved_credits: i64,
    /// Credits actually consumed, set when the job finishes.
    pub actual_credits: Option<i64>,
    /// Credits returned to the account at reconciliation.
    pub refunded_credits: Option<i64>,
    /// Set once cancellation was requested.
    pub cancel_requested: bool,
    /// Instance currently driving the job.
    #[serde(default)]
    pub owner_id: Option<String>,
    /// The owner must renew its claim before this instant.
    #[serde(default)]
    pub lease_expires_at: Option<DateTime<Utc>>,
    /// When the job was created.
    pub created_at: DateTime<Utc>,
    /// When the job was last updated.
    pub updated_at: DateTime<Utc>,
}

impl BatchJob {
    /// Create a job in the `Reserved` state with one pending task per input.
    #[must_use]
    pub fn reserved(
        account_id: AccountId,
        operation: Operation,
        inputs: &[String],
        options: serde_json::Value,
        submission_key: String,
        reserved_credits: i64,
    ) -> Self {
        let now = Utc::now();
        let files = inputs
            .iter()
            .zip(0u32..)
            .map(|(input, index)| FileTask::pending(index, input.clone()))
            .collect();

        Self {
            id: JobId::generate(),
            account_id,
            operation,
            options,
            submission_key,
            state: JobState::Reserved,
            files,
            reserved_credits,
            actual_credits: None,
            refunded_credits: None,
            cancel_requested: false,
            owner_id: None,
            lease_expires_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Move to `next`, rejecting illegal transitions.
    ///
    /// # Errors
    ///
    /// Returns `BillingError::InvalidTransition` if the state machine forbids it.
    pub fn transition(&mut self, next: JobState) -> Result<(), BillingError> {
        if !self.state.can_transition_to(next) {
            return Err(BillingError::InvalidTransition {
                from: self.state,
                to: next,
            });
        }
        self.state = next;
        self.touch();
        Ok(())
    }

    /// Whether `owner` may take the processing lease at `now`.
    ///
    /// Terminal jobs are never claimable. Otherwise the lease is free when it
    /// was never taken, is already held by `owner`, or has lapsed.
    #[must_use]
    pub fn lease_available(&self, owner: &str, now: DateTime<Utc>) -> bool {
        if self.state.is_terminal() {
            return false;
        }
        match (&self.owner_id, self.lease_expires_at) {
            (None, _) => true,
            (Some(current), _) if current == owner => true,
            (Some(_), Some(expires)) => expires < now,
            (Some(_), None) => true,
        }
    }

    /// Record `owner` as the lease holder until `until`.
    pub fn set_lease(&mut self, owner: &str, until: DateTime<Utc>) {
        self.owner_id = Some(owner.to_string());
        self.lease_expires_at = Some(until);
    }

    /// Bump `updated_at`.
    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    /// Current progress counters.
    #[must_use]
    pub fn progress(&self) -> Progress {
        let completed = self.count(FileState::Completed);
        let failed = self.count(FileState::Failed);
        Progress {
            total: self.files.len(),
            completed,
            failed,
            remaining: self.files.len() - completed - failed,
        }
    }

    /// Whether every task reached a terminal per-file state.
    #[must_use]
    pub fn all_tasks_terminal(&self) -> bool {
        self.files.iter().all(|task| task.state.is_terminal())
    }

    /// Mark every not-yet-started task as failed with `reason`.
    ///
    /// Returns the number of tasks affected.
    pub fn fail_pending(&mut self, reason: &str) -> usize {
        let mut affected = 0;
        for task in &mut self.files {
            if task.state == FileState::Pending {
                task.state = FileState::Failed;
                task.error = Some(reason.to_string());
                affected += 1;
            }
        }
        if affected > 0 {
            self.touch();
        }
        affected
    }

    /// Terminal state implied by the task outcomes.
    #[must_use]
    pub fn outcome_state(&self) -> JobState {
        let progress = self.progress();
        if progress.completed == progress.total {
            JobState::Completed
        } else if progress.completed > 0 {
            JobState::PartiallyFailed
        } else {
            JobState::Failed
        }
    }

    fn count(&self, state: FileState) -> usize {
        self.files.iter().filter(|task| task.state == state).count()
    }
}

//! The batch job driver.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use pagecredit_core::{
    AccountId, AuditKind, AuditRecord, BatchJob, EntryKind, EntryRequest, FileState, FileTask,
    JobId, JobState, Operation, PricingConfig, CANCELLED_REASON,
};
use pagecredit_store::{Store, StoreError};

use super::{JobError, JobSettings, ProcessingError, Processor, SubmitRequest, MAX_REQUEST_KEY_LEN};
use crate::ledger::CreditLedger;
use crate::rate_limit::RateLimiter;

/// Error recorded on tasks whose worker died mid-flight.
const INTERRUPTED_REASON: &str = "interrupted";

/// Shortest interval between lease renewals.
const MIN_RENEWAL_PERIOD: Duration = Duration::from_millis(10);

/// Accepts, drives, cancels and resumes batch jobs.
pub struct BatchOrchestrator {
    store: Arc<dyn Store>,
    ledger: CreditLedger,
    processor: Arc<dyn Processor>,
    pricing: Arc<PricingConfig>,
    rate_limiter: Arc<dyn RateLimiter>,
    settings: JobSettings,
    running: DashMap<JobId, CancellationToken>,
}

impl BatchOrchestrator {
    /// Create an orchestrator.
    #[must_use]
    pub fn new(
        store: Arc<dyn Store>,
        ledger: CreditLedger,
        processor: Arc<dyn Processor>,
        pricing: Arc<PricingConfig>,
        rate_limiter: Arc<dyn RateLimiter>,
        settings: JobSettings,
    ) -> Self {
        Self {
            store,
            ledger,
            processor,
            pricing,
            rate_limiter,
            settings,
            running: DashMap::new(),
        }
    }

    /// Number of jobs with a live driver in this process.
    #[must_use]
    pub fn active_jobs(&self) -> usize {
        self.running.len()
    }

    /// Reserve credits for a batch and start processing it.
    ///
    /// Resubmitting with the same request key returns the job created the first
    /// time without reserving again.
    ///
    /// # Errors
    ///
    /// Returns `RateLimited`, `InvalidInput`, a ledger error (notably
    /// `InsufficientFunds`) or a storage error.
    pub async fn submit(
        self: &Arc<Self>,
        account_id: &AccountId,
        request: SubmitRequest,
    ) -> Result<BatchJob, JobError> {
        let decision = self.rate_limiter.check(account_id.as_str()).await?;
        if !decision.allowed {
            tracing::warn!(account_id = %account_id, "Job submission rate limited");
            return Err(JobError::RateLimited {
                retry_after_secs: decision.retry_after_secs,
            });
        }

        let files = self.validate_files(request.files)?;
        let reserved = self
            .pricing
            .batch_cost(request.operation, files.len())
            .ok_or_else(|| JobError::InvalidInput("batch cost overflows".into()))?;
        let submission_key = submission_key(account_id, request.request_key.as_deref())?;
        let options = match request.options {
            serde_json::Value::Null => serde_json::json!({}),
            other => other,
        };

        let reservation = EntryRequest::debit(
            EntryKind::Reservation,
            account_id.clone(),
            reserved,
            submission_key.clone(),
            format!("batch {} x{}", request.operation, files.len()),
        )
        .with_metadata(serde_json::json!({
            "operation": request.operation,
            "files": files.len(),
        }));
        let outcome = self.ledger.apply(reservation).await?;

        let mut job = BatchJob::reserved(
            account_id.clone(),
            request.operation,
            &files,
            options,
            submission_key.clone(),
            reserved,
        );
        let (_, lease_until) = self.lease_window();
        job.set_lease(&self.settings.instance_id, lease_until);

        if !outcome.is_new() {
            if let Some(existing) = self.store.find_job_by_submission_key(&submission_key).await? {
                tracing::debug!(job_id = %existing.id, key = %submission_key, "Submission replayed");
                return Ok(existing);
            }
            tracing::warn!(
                key = %submission_key,
                "Reservation exists without a job, creating it now"
            );
            job.reserved_credits = -outcome.entry().delta;
        }

        match self.store.insert_job(&job).await {
            Ok(()) => {}
            Err(StoreError::DuplicateKey { .. }) => {
                return self
                    .store
                    .find_job_by_submission_key(&submission_key)
                    .await?
                    .ok_or(JobError::NotFound(job.id));
            }
            Err(e) => return Err(e.into()),
        }

        job.transition(JobState::Running)?;
        self.store.save_job(&job).await?;

        tracing::info!(
            job_id = %job.id,
            account_id = %account_id,
            operation = %job.operation,
            files = job.files.len(),
            reserved = job.reserved_credits,
            "Batch job accepted"
        );

        self.spawn_driver(job.clone());
        Ok(job)
    }

    /// Fetch a job owned by `account_id`.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for unknown jobs and jobs of other accounts.
    pub async fn get(&self, account_id: &AccountId, job_id: &JobId) -> Result<BatchJob, JobError> {
        self.store
            .get_job(job_id)
            .await?
            .filter(|job| &job.account_id == account_id)
            .ok_or(JobError::NotFound(*job_id))
    }

    /// Ask a running job to stop.
    ///
    /// Files already being processed finish; the rest are marked cancelled and
    /// refunded at reconciliation. A finished job is returned unchanged.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for unknown or foreign jobs, or a storage error.
    pub async fn cancel(&self, account_id: &AccountId, job_id: &JobId) -> Result<BatchJob, JobError> {
        let job = self.get(account_id, job_id).await?;
        if job.state.is_terminal() {
            return Ok(job);
        }

        let job = self
            .store
            .request_cancel(job_id)
            .await?
            .ok_or(JobError::NotFound(*job_id))?;
        if let Some(token) = self.running.get(job_id) {
            token.cancel();
        }

        tracing::info!(job_id = %job_id, account_id = %account_id, "Job cancellation requested");
        Ok(job)
    }

    /// Restart drivers for jobs a previous process left unfinished.
    ///
    /// Only jobs whose lease this instance can take are resumed: unowned jobs,
    /// jobs already owned by this instance, and jobs whose owner stopped
    /// renewing. Returns the number of jobs resumed.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the jobs cannot be listed or saved.
    pub async fn resume_incomplete(self: &Arc<Self>) -> Result<usize, JobError> {
        let mut resumed = 0;
        for listed in self.store.list_incomplete_jobs().await? {
            if self.running.contains_key(&listed.id) {
                continue;
            }
            let Some(mut job) = self.claim(&listed.id).await? else {
                tracing::debug!(
                    job_id = %listed.id,
                    owner = listed.owner_id.as_deref().unwrap_or_default(),
                    "Job leased by another instance"
                );
                continue;
            };

            for task in &mut job.files {
                if task.state == FileState::Processing {
                    task.state = FileState::Pending;
                }
            }
            match job.state {
                JobState::Reserved => job.transition(JobState::Running)?,
                JobState::Running => job.touch(),
                other => {
                    tracing::warn!(job_id = %job.id, state = other.as_str(), "Skipping unresumable job");
                    continue;
                }
            }

            self.store.save_job(&job).await?;
            tracing::info!(job_id = %job.id, progress = ?job.progress(), "Resuming job");
            self.spawn_driver(job);
            resumed += 1;
        }
        Ok(resumed)
    }

    fn lease_window(&self) -> (DateTime<Utc>, DateTime<Utc>) {
        let now = Utc::now();
        let lease = chrono::Duration::from_std(self.settings.lease)
            .unwrap_or_else(|_| chrono::Duration::seconds(30));
        (now, now + lease)
    }

    /// Take or renew this instance's lease on a job.
    async fn claim(&self, job_id: &JobId) -> Result<Option<BatchJob>, StoreError> {
        let (now, until) = self.lease_window();
        self.store
            .claim_job(job_id, &self.settings.instance_id, now, until)
            .await
    }

    /// Renew the lease until `stop` fires; cancel the job if it is lost.
    async fn renew_lease(
        self: Arc<Self>,
        job_id: JobId,
        stop: CancellationToken,
        job: CancellationToken,
    ) {
        let period = (self.settings.lease / 3).max(MIN_RENEWAL_PERIOD);
        loop {
            tokio::select! {
                () = stop.cancelled() => return,
                () = tokio::time::sleep(period) => {}
            }
            match self.claim(&job_id).await {
                Ok(Some(_)) => {}
                Ok(None) => {
                    tracing::warn!(job_id = %job_id, "Job lease lost, stopping driver");
                    job.cancel();
                    return;
                }
                Err(e) => tracing::warn!(job_id = %job_id, error = %e, "Could not renew job lease"),
            }
        }
    }

    fn validate_files(&self, files: Vec<String>) -> Result<Vec<String>, JobError> {
        if files.is_empty() {
            return Err(JobError::InvalidInput("files must not be empty".into()));
        }
        if files.len() > self.settings.max_files {
            return Err(JobError::InvalidInput(format!(
                "at most {} files per job, got {}",
                self.settings.max_files,
                files.len()
            )));
        }
        files
            .into_iter()
            .enumerate()
            .map(|(i, file)| {
                let file = file.trim().to_string();
                if file.is_empty() {
                    Err(JobError::InvalidInput(format!("files[{i}] is empty")))
                } else {
                    Ok(file)
                }
            })
            .collect()
    }

    fn spawn_driver(self: &Arc<Self>, job: BatchJob) {
        let token = CancellationToken::new();
        if job.cancel_requested {
            token.cancel();
        }
        self.running.insert(job.id, token.clone());

        let this = Arc::clone(self);
        tokio::spawn(async move {
            let job_id = job.id;
            if let Err(e) = Arc::clone(&this).drive(job, token).await {
                tracing::error!(job_id = %job_id, error = %e, "Job driver failed");
            }
            this.running.remove(&job_id);
        });
    }

    async fn drive(self: Arc<Self>, job: BatchJob, token: CancellationToken) -> Result<(), JobError> {
        let job_id = job.id;
        let operation = job.operation;
        let options = Arc::new(job.options.clone());
        let pending: Vec<(usize, String)> = job
            .files
            .iter()
            .enumerate()
            .filter(|(_, task)| task.state == FileState::Pending)
            .map(|(idx, task)| (idx, task.input_ref.clone()))
            .collect();

        let renewal = CancellationToken::new();
        let stop_renewal = renewal.clone().drop_guard();
        tokio::spawn(Arc::clone(&self).renew_lease(job_id, renewal, token.clone()));

        let shared = Arc::new(Mutex::new(job));
        let semaphore = Arc::new(Semaphore::new(self.settings.max_parallel_files));
        let mut workers = JoinSet::new();

        for (idx, input_ref) in pending {
            let permit = tokio::select! {
                biased;
                () = token.cancelled() => break,
                permit = Arc::clone(&semaphore).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            match self.store.cancel_requested(&job_id).await {
                Ok(true) => token.cancel(),
                Ok(false) => {}
                Err(e) => tracing::warn!(job_id = %job_id, error = %e, "Could not read cancel flag"),
            }
            if token.is_cancelled() {
                break;
            }

            self.update_task(&shared, idx, |task| task.state = FileState::Processing)
                .await;

            let this = Arc::clone(&self);
            let shared = Arc::clone(&shared);
            let options = Arc::clone(&options);
            let token = token.clone();
            workers.spawn(async move {
                let _permit = permit;
                let (attempts, result) = this
                    .process_with_retry(operation, &input_ref, &options, &token)
                    .await;
                this.update_task(&shared, idx, |task| {
                    task.attempts = attempts;
                    match result {
                        Ok(output_ref) => {
                            task.state = FileState::Completed;
                            task.output_ref = Some(output_ref);
                            task.error = None;
                        }
                        Err(e) => {
                            task.state = FileState::Failed;
                            task.error = Some(e.to_string());
                        }
                    }
                })
                .await;
            });
        }

        while let Some(joined) = workers.join_next().await {
            if let Err(e) = joined {
                tracing::error!(job_id = %job_id, error = %e, "File worker panicked");
            }
        }

        drop(stop_renewal);
        let job = shared.lock().await.clone();
        self.finalize(job).await
    }

    async fn process_with_retry(
        &self,
        operation: Operation,
        input_ref: &str,
        options: &serde_json::Value,
        token: &CancellationToken,
    ) -> (u32, Result<String, ProcessingError>) {
        let mut backoff = self.settings.retry_base;
        let mut attempt = 0;

        loop {
            attempt += 1;
            match self.processor.process(operation, input_ref, options).await {
                Ok(output_ref) => return (attempt, Ok(output_ref)),
                Err(e) if e.is_retryable() && attempt < self.settings.max_file_attempts => {
                    tracing::debug!(
                        input_ref,
                        attempt,
                        backoff_ms = u64::try_from(backoff.as_millis()).unwrap_or(u64::MAX),
                        error = %e,
                        "Processing failed, retrying"
                    );
                    tokio::select! {
                        () = token.cancelled() => return (attempt, Err(e)),
                        () = tokio::time::sleep(backoff) => {}
                    }
                    backoff = (backoff * 2).min(self.settings.retry_max);
                }
                Err(e) => {
                    tracing::warn!(input_ref, attempt, error = %e, "Processing failed");
                    return (attempt, Err(e));
                }
            }
        }
    }

    /// Apply `update` to one task and persist the job.
    async fn update_task<F>(&self, shared: &Mutex<BatchJob>, idx: usize, update: F)
    where
        F: FnOnce(&mut FileTask),
    {
        let mut job = shared.lock().await;
        let Some(task) = job.files.get_mut(idx) else {
            return;
        };
        update(task);
        job.touch();
        if let Err(e) = self.store.save_job(&job).await {
            tracing::error!(job_id = %job.id, error = %e, "Failed to persist task progress");
        }
    }

    async fn finalize(&self, mut job: BatchJob) -> Result<(), JobError> {
        if self.claim(&job.id).await?.is_none() {
            tracing::warn!(job_id = %job.id, "Job lease lost before reconciliation");
            return Ok(());
        }

        let cancelled = job.fail_pending(CANCELLED_REASON);
        for task in &mut job.files {
            if task.state == FileState::Processing {
                task.state = FileState::Failed;
                task.error = Some(INTERRUPTED_REASON.to_string());
            }
        }

        let completed = job.progress().completed;
        let actual = i64::try_from(completed)
            .ok()
            .and_then(|n| n.checked_mul(self.pricing.unit_cost(job.operation)))
            .unwrap_or(job.reserved_credits);

        let key = format!("refund:{}", job.id);
        let reconciled = match self
            .ledger
            .reconcile(&job.account_id, &job.id, job.reserved_credits, actual, &key)
            .await
        {
            Ok(reconciled) => reconciled,
            Err(e) => {
                tracing::error!(job_id = %job.id, error = %e, "Reconciliation failed, job left running");
                self.store.save_job(&job).await?;
                self.store
                    .append_audit(&AuditRecord::new(
                        AuditKind::LedgerFailure,
                        job.id.to_string(),
                        serde_json::json!({
                            "account_id": job.account_id,
                            "reserved": job.reserved_credits,
                            "actual": actual,
                            "error": e.to_string(),
                        }),
                    ))
                    .await?;
                return Err(e.into());
            }
        };

        job.actual_credits = Some(actual);
        job.refunded_credits = Some(reconciled.refunded);
        let state = job.outcome_state();
        job.transition(state)?;
        self.store.save_job(&job).await?;

        tracing::info!(
            job_id = %job.id,
            account_id = %job.account_id,
            state = state.as_str(),
            completed,
            cancelled,
            reserved = job.reserved_credits,
            actual,
            refunded = reconciled.refunded,
            "Batch job finished"
        );
        Ok(())
    }
}

fn submission_key(account_id: &AccountId, request_key: Option<&str>) -> Result<String, JobError> {
    match request_key.map(str::trim) {
        Some("") => Err(JobError::InvalidInput("request key must not be empty".into())),
        Some(key) if key.len() > MAX_REQUEST_KEY_LEN => Err(JobError::InvalidInput(format!(
            "request key longer than {MAX_REQUEST_KEY_LEN} characters"
        ))),
        Some(key) => Ok(format!("batch:{account_id}:{key}")),
        None => Ok(format!("batch:{account_id}:{}", uuid::Uuid::new_v4())),
    }
}

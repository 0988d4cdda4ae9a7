//! PostgreSQL storage implementation.
//!
//! Balance changes lock the account row with `SELECT ... FOR UPDATE`; the
//! `ledger_entries.idempotency_key` unique constraint catches any replay that
//! slips past the in-transaction lookup.

use std::fmt::Display;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::{debug, instrument, warn};

use pagecredit_core::{
    Account, AccountId, AuditKind, AuditRecord, BatchJob, EntryRequest, FileTask, JobId,
    LedgerEntry, PaymentEvent, PaymentRecord, PaymentStatus,
};

use crate::error::{Result, StoreError};
use crate::{check_job_write, checked_balance, resolve_replay, ApplyOutcome, Store};

const TERMINAL_JOB_STATES: [&str; 3] = ["completed", "partially_failed", "failed"];

/// PostgreSQL-backed storage implementation.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    /// Wrap an existing pool.
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect to `database_url` and run pending migrations.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection or a migration fails.
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|e| StoreError::Database(format!("migration failed: {e}")))?;

        Ok(Self { pool })
    }

    /// The underlying pool.
    #[must_use]
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn load_tasks(&self, job_id: &JobId) -> Result<Vec<FileTask>> {
        let rows = sqlx::query(
            r"
            SELECT idx, input_ref, output_ref, state, attempts, error
            FROM file_tasks
            WHERE job_id = $1
            ORDER BY idx
            ",
        )
        .bind(job_id.as_uuid())
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(task_from_row).collect()
    }

    async fn load_job(&self, row: Option<PgRow>) -> Result<Option<BatchJob>> {
        let Some(row) = row else {
            return Ok(None);
        };
        let mut job = job_from_row(&row)?;
        job.files = self.load_tasks(&job.id).await?;
        Ok(Some(job))
    }

    async fn upsert_tasks(
        tx: &mut Transaction<'_, Postgres>,
        job_id: &JobId,
        tasks: &[FileTask],
    ) -> Result<()> {
        for task in tasks {
            sqlx::query(
                r"
                INSERT INTO file_tasks (job_id, idx, input_ref, output_ref, state, attempts, error)
                VALUES ($1, $2, $3, $4, $5, $6, $7)
                ON CONFLICT (job_id, idx) DO UPDATE
                SET output_ref = EXCLUDED.output_ref,
                    state = EXCLUDED.state,
                    attempts = EXCLUDED.attempts,
                    error = EXCLUDED.error
                ",
            )
            .bind(job_id.as_uuid())
            .bind(to_i32(task.index)?)
            .bind(&task.input_ref)
            .bind(task.output_ref.as_deref())
            .bind(task.state.as_str())
            .bind(to_i32(task.attempts)?)
            .bind(task.error.as_deref())
            .execute(&mut **tx)
            .await?;
        }
        Ok(())
    }
}

#[async_trait]
impl Store for PgStore {
    // =========================================================================
    // Account Operations
    // =========================================================================

    #[instrument(skip(self))]
    async fn get_account(&self, account_id: &AccountId) -> Result<Option<Account>> {
        let row = sqlx::query(
            r"
            SELECT account_id, balance, disabled, created_at, updated_at
            FROM accounts
            WHERE account_id = $1
            ",
        )
        .bind(account_id.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(account_from_row).transpose()
    }

    #[instrument(skip(self))]
    async fn set_account_disabled(
        &self,
        account_id: &AccountId,
        disabled: bool,
    ) -> Result<Account> {
        let row = sqlx::query(
            r"
            INSERT INTO accounts (account_id, balance, disabled, created_at, updated_at)
            VALUES ($1, 0, $2, now(), now())
            ON CONFLICT (account_id) DO UPDATE
            SET disabled = EXCLUDED.disabled, updated_at = now()
            RETURNING account_id, balance, disabled, created_at, updated_at
            ",
        )
        .bind(account_id.as_str())
        .bind(disabled)
        .fetch_one(&self.pool)
        .await?;

        account_from_row(&row)
    }

    // =========================================================================
    // Ledger Operations
    // =========================================================================

    #[instrument(skip(self, request), fields(key = %request.idempotency_key))]
    async fn apply_entry(&self, request: EntryRequest) -> Result<ApplyOutcome> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r"
            INSERT INTO accounts (account_id, balance, disabled, created_at, updated_at)
            VALUES ($1, 0, FALSE, now(), now())
            ON CONFLICT (account_id) DO NOTHING
            ",
        )
        .bind(request.account_id.as_str())
        .execute(&mut *tx)
        .await?;

        let account_row = sqlx::query(
            r"
            SELECT account_id, balance, disabled, created_at, updated_at
            FROM accounts
            WHERE account_id = $1
            FOR UPDATE
            ",
        )
        .bind(request.account_id.as_str())
        .fetch_one(&mut *tx)
        .await?;

        let existing = sqlx::query(&format!(
            "SELECT {ENTRY_COLUMNS} FROM ledger_entries WHERE idempotency_key = $1"
        ))
        .bind(&request.idempotency_key)
        .fetch_optional(&mut *tx)
        .await?;

        if let Some(row) = existing {
            tx.rollback().await?;
            return resolve_replay(&request, entry_from_row(&row)?);
        }

        let account = account_from_row(&account_row)?;
        let balance_after = checked_balance(&account, request.delta)?;

        sqlx::query("UPDATE accounts SET balance = $2, updated_at = now() WHERE account_id = $1")
            .bind(request.account_id.as_str())
            .bind(balance_after)
            .execute(&mut *tx)
            .await?;

        let replay = request.clone();
        let entry = request.into_entry(balance_after);
        let inserted = sqlx::query(
            r"
            INSERT INTO ledger_entries
                (id, account_id, delta, kind, reason, idempotency_key, balance_after, metadata, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ",
        )
        .bind(entry.id.to_string())
        .bind(entry.account_id.as_str())
        .bind(entry.delta)
        .bind(entry.kind.as_str())
        .bind(&entry.reason)
        .bind(&entry.idempotency_key)
        .bind(entry.balance_after)
        .bind(&entry.metadata)
        .bind(entry.created_at)
        .execute(&mut *tx)
        .await;

        if let Err(err) = inserted {
            if is_unique_violation(&err) {
                // A concurrent call on another account committed the same key first.
                drop(tx);
                warn!(key = %replay.idempotency_key, "Idempotency key raced, resolving replay");
                let existing = self
                    .get_entry_by_key(&replay.idempotency_key)
                    .await?
                    .ok_or_else(|| StoreError::not_found("ledger entry", &replay.idempotency_key))?;
                return resolve_replay(&replay, existing);
            }
            return Err(err.into());
        }

        tx.commit().await?;
        debug!(balance_after, "Ledger entry applied");
        Ok(ApplyOutcome::Applied(entry))
    }

    async fn get_entry_by_key(&self, idempotency_key: &str) -> Result<Option<LedgerEntry>> {
        let row = sqlx::query(&format!(
            "SELECT {ENTRY_COLUMNS} FROM ledger_entries WHERE idempotency_key = $1"
        ))
        .bind(idempotency_key)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(entry_from_row).transpose()
    }

    async fn list_entries(
        &self,
        account_id: &AccountId,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<LedgerEntry>> {
        let rows = sqlx::query(&format!(
            "SELECT {ENTRY_COLUMNS} FROM ledger_entries WHERE account_id = $1 \
             ORDER BY seq DESC LIMIT $2 OFFSET $3"
        ))
        .bind(account_id.as_str())
        .bind(to_i64(limit)?)
        .bind(to_i64(offset)?)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(entry_from_row).collect()
    }

    async fn sum_deltas(&self, account_id: &AccountId) -> Result<i64> {
        let row = sqlx::query(
            "SELECT COALESCE(SUM(delta), 0)::BIGINT AS total FROM ledger_entries WHERE account_id = $1",
        )
        .bind(account_id.as_str())
        .fetch_one(&self.pool)
        .await?;

        Ok(row.try_get("total")?)
    }

    // =========================================================================
    // Payment Operations
    // =========================================================================

    async fn get_payment(&self, external_id: &str) -> Result<Option<PaymentRecord>> {
        let row = sqlx::query(&format!(
            "SELECT {PAYMENT_COLUMNS} FROM payment_events WHERE external_id = $1"
        ))
        .bind(external_id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(payment_from_row).transpose()
    }

    #[instrument(skip(self, record), fields(external_id = %record.event.external_id))]
    async fn insert_payment_if_absent(
        &self,
        record: &PaymentRecord,
    ) -> Result<Option<PaymentRecord>> {
        let event = &record.event;
        let inserted = sqlx::query(
            r"
            INSERT INTO payment_events
                (external_id, provider, account_id, plan_id, credits, amount_minor, currency,
                 outcome, status, raw_payload, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            ON CONFLICT (external_id) DO NOTHING
            ",
        )
        .bind(&event.external_id)
        .bind(event.provider.as_str())
        .bind(event.account_id.as_str())
        .bind(&event.plan_id)
        .bind(event.credits)
        .bind(event.amount_minor)
        .bind(&event.currency)
        .bind(event.outcome.as_str())
        .bind(record.status.as_str())
        .bind(&event.raw_payload)
        .bind(record.created_at)
        .bind(record.updated_at)
        .execute(&self.pool)
        .await?;

        if inserted.rows_affected() == 1 {
            return Ok(None);
        }
        self.get_payment(&event.external_id).await
    }

    async fn save_payment(&self, record: &PaymentRecord) -> Result<bool> {
        let event = &record.event;
        let updated = sqlx::query(
            r"
            UPDATE payment_events
            SET account_id = $2, plan_id = $3, credits = $4, amount_minor = $5, currency = $6,
                outcome = $7, status = $8, raw_payload = $9, updated_at = $10
            WHERE external_id = $1 AND (status <> $11 OR $8 = $11)
            ",
        )
        .bind(&event.external_id)
        .bind(event.account_id.as_str())
        .bind(&event.plan_id)
        .bind(event.credits)
        .bind(event.amount_minor)
        .bind(&event.currency)
        .bind(event.outcome.as_str())
        .bind(record.status.as_str())
        .bind(&event.raw_payload)
        .bind(record.updated_at)
        .bind(PaymentStatus::Applied.as_str())
        .execute(&self.pool)
        .await?;
        Ok(updated.rows_affected() == 1)
    }

    // =========================================================================
    // Audit Operations
    // =========================================================================

    async fn append_audit(&self, record: &AuditRecord) -> Result<()> {
        sqlx::query(
            "INSERT INTO audit_log (id, kind, subject, detail, created_at) VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(record.id.to_string())
        .bind(record.kind.as_str())
        .bind(&record.subject)
        .bind(&record.detail)
        .bind(record.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_audit(
        &self,
        kind: Option<AuditKind>,
        subject: Option<&str>,
        limit: usize,
    ) -> Result<Vec<AuditRecord>> {
        let rows = sqlx::query(
            r"
            SELECT id, kind, subject, detail, created_at
            FROM audit_log
            WHERE ($1::TEXT IS NULL OR kind = $1)
              AND ($2::TEXT IS NULL OR subject = $2)
            ORDER BY seq DESC
            LIMIT $3
            ",
        )
        .bind(kind.map(|k| k.as_str()))
        .bind(subject)
        .bind(to_i64(limit)?)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(audit_from_row).collect()
    }

    // =========================================================================
    // Job Operations
    // =========================================================================

    #[instrument(skip(self, job), fields(job_id = %job.id))]
    async fn insert_job(&self, job: &BatchJob) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        let inserted = sqlx::query(
            r"
            INSERT INTO batch_jobs
                (id, account_id, operation, options, submission_key, state, reserved_credits,
                 actual_credits, refunded_credits, cancel_requested, owner_id, lease_expires_at,
                 created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            ON CONFLICT (submission_key) DO NOTHING
            ",
        )
        .bind(job.id.as_uuid())
        .bind(job.account_id.as_str())
        .bind(job.operation.as_str())
        .bind(&job.options)
        .bind(&job.submission_key)
        .bind(job.state.as_str())
        .bind(job.reserved_credits)
        .bind(job.actual_credits)
        .bind(job.refunded_credits)
        .bind(job.cancel_requested)
        .bind(job.owner_id.as_deref())
        .bind(job.lease_expires_at)
        .bind(job.created_at)
        .bind(job.updated_at)
        .execute(&mut *tx)
        .await?;

        if inserted.rows_affected() == 0 {
            return Err(StoreError::DuplicateKey {
                key: job.submission_key.clone(),
            });
        }

        Self::upsert_tasks(&mut tx, &job.id, &job.files).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn get_job(&self, job_id: &JobId) -> Result<Option<BatchJob>> {
        let row = sqlx::query(&format!("SELECT {JOB_COLUMNS} FROM batch_jobs WHERE id = $1"))
            .bind(job_id.as_uuid())
            .fetch_optional(&self.pool)
            .await?;

        self.load_job(row).await
    }

    async fn find_job_by_submission_key(&self, submission_key: &str) -> Result<Option<BatchJob>> {
        let row = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM batch_jobs WHERE submission_key = $1"
        ))
        .bind(submission_key)
        .fetch_optional(&self.pool)
        .await?;

        self.load_job(row).await
    }

    #[instrument(skip(self, job), fields(job_id = %job.id, state = job.state.as_str()))]
    async fn save_job(&self, job: &BatchJob) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM batch_jobs WHERE id = $1 FOR UPDATE"
        ))
        .bind(job.id.as_uuid())
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| StoreError::not_found("job", job.id))?;
        check_job_write(&job_from_row(&row)?, job)?;

        sqlx::query(
            r"
            UPDATE batch_jobs
            SET state = $2,
                actual_credits = $3,
                refunded_credits = $4,
                cancel_requested = cancel_requested OR $5,
                updated_at = $6
            WHERE id = $1
            ",
        )
        .bind(job.id.as_uuid())
        .bind(job.state.as_str())
        .bind(job.actual_credits)
        .bind(job.refunded_credits)
        .bind(job.cancel_requested)
        .bind(job.updated_at)
        .execute(&mut *tx)
        .await?;

        Self::upsert_tasks(&mut tx, &job.id, &job.files).await?;
        tx.commit().await?;
        Ok(())
    }

    #[instrument(skip(self, job_id, now, until), fields(job_id = %job_id))]
    async fn claim_job(
        &self,
        job_id: &JobId,
        owner: &str,
        now: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<Option<BatchJob>> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM batch_jobs WHERE id = $1 FOR UPDATE"
        ))
        .bind(job_id.as_uuid())
        .fetch_optional(&mut *tx)
        .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        if !job_from_row(&row)?.lease_available(owner, now) {
            debug!(owner, "Job lease held elsewhere");
            return Ok(None);
        }

        sqlx::query("UPDATE batch_jobs SET owner_id = $2, lease_expires_at = $3 WHERE id = $1")
            .bind(job_id.as_uuid())
            .bind(owner)
            .bind(until)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        self.get_job(job_id).await
    }

    async fn request_cancel(&self, job_id: &JobId) -> Result<Option<BatchJob>> {
        sqlx::query(
            r"
            UPDATE batch_jobs
            SET cancel_requested = TRUE, updated_at = now()
            WHERE id = $1 AND NOT cancel_requested AND state <> ALL($2)
            ",
        )
        .bind(job_id.as_uuid())
        .bind(&TERMINAL_JOB_STATES[..])
        .execute(&self.pool)
        .await?;

        self.get_job(job_id).await
    }

    async fn cancel_requested(&self, job_id: &JobId) -> Result<bool> {
        let flag: Option<bool> =
            sqlx::query_scalar("SELECT cancel_requested FROM batch_jobs WHERE id = $1")
                .bind(job_id.as_uuid())
                .fetch_optional(&self.pool)
                .await?;
        Ok(flag.unwrap_or(false))
    }

    async fn list_incomplete_jobs(&self) -> Result<Vec<BatchJob>> {
        let rows = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM batch_jobs WHERE state <> ALL($1) ORDER BY created_at"
        ))
        .bind(&TERMINAL_JOB_STATES[..])
        .fetch_all(&self.pool)
        .await?;

        let mut jobs = Vec::with_capacity(rows.len());
        for row in rows {
            if let Some(job) = self.load_job(Some(row)).await? {
                jobs.push(job);
            }
        }
        Ok(jobs)
    }

    // =========================================================================
    // Rate Limit Operations
    // =========================================================================

    async fn increment_window(&self, identity: &str, window_start: i64) -> Result<u32> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM rate_windows WHERE identity = $1 AND window_start < $2")
            .bind(identity)
            .bind(window_start)
            .execute(&mut *tx)
            .await?;

        let count: i32 = sqlx::query_scalar(
            r"
            INSERT INTO rate_windows (identity, window_start, count)
            VALUES ($1, $2, 1)
            ON CONFLICT (identity, window_start) DO UPDATE
            SET count = rate_windows.count + 1
            RETURNING count
            ",
        )
        .bind(identity)
        .bind(window_start)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        u32::try_from(count).map_err(|e| StoreError::Serialization(e.to_string()))
    }
}

// =============================================================================
// Row mapping
// =============================================================================

const ENTRY_COLUMNS: &str =
    "id, account_id, delta, kind, reason, idempotency_key, balance_after, metadata, created_at";

const PAYMENT_COLUMNS: &str = "external_id, provider, account_id, plan_id, credits, amount_minor, \
     currency, outcome, status, raw_payload, created_at, updated_at";

const JOB_COLUMNS: &str = "id, account_id, operation, options, submission_key, state, \
     reserved_credits, actual_credits, refunded_credits, cancel_requested, owner_id, \
     lease_expires_at, created_at, updated_at";

fn parse<T>(value: &str) -> Result<T>
where
    T: FromStr,
    T::Err: Display,
{
    value
        .parse()
        .map_err(|e: T::Err| StoreError::Serialization(e.to_string()))
}

fn to_i32(value: u32) -> Result<i32> {
    i32::try_from(value).map_err(|e| StoreError::Serialization(e.to_string()))
}

fn to_i64(value: usize) -> Result<i64> {
    i64::try_from(value).map_err(|e| StoreError::Serialization(e.to_string()))
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.is_unique_violation())
}

fn account_id_from(row: &PgRow) -> Result<AccountId> {
    let raw: String = row.try_get("account_id")?;
    AccountId::new(raw).map_err(|e| StoreError::Serialization(e.to_string()))
}

fn account_from_row(row: &PgRow) -> Result<Account> {
    Ok(Account {
        account_id: account_id_from(row)?,
        balance: row.try_get("balance")?,
        disabled: row.try_get("disabled")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn entry_from_row(row: &PgRow) -> Result<LedgerEntry> {
    let id: String = row.try_get("id")?;
    let kind: String = row.try_get("kind")?;
    Ok(LedgerEntry {
        id: parse(&id)?,
        account_id: account_id_from(row)?,
        delta: row.try_get("delta")?,
        kind: parse(&kind)?,
        reason: row.try_get("reason")?,
        idempotency_key: row.try_get("idempotency_key")?,
        balance_after: row.try_get("balance_after")?,
        metadata: row.try_get("metadata")?,
        created_at: row.try_get("created_at")?,
    })
}

fn payment_from_row(row: &PgRow) -> Result<PaymentRecord> {
    let provider: String = row.try_get("provider")?;
    let outcome: String = row.try_get("outcome")?;
    let status: String = row.try_get("status")?;
    Ok(PaymentRecord {
        event: PaymentEvent {
            provider: parse(&provider)?,
            external_id: row.try_get("external_id")?,
            account_id: account_id_from(row)?,
            plan_id: row.try_get("plan_id")?,
            credits: row.try_get("credits")?,
            amount_minor: row.try_get("amount_minor")?,
            currency: row.try_get("currency")?,
            outcome: parse(&outcome)?,
            raw_payload: row.try_get("raw_payload")?,
        },
        status: parse(&status)?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn audit_from_row(row: &PgRow) -> Result<AuditRecord> {
    let id: String = row.try_get("id")?;
    let kind: String = row.try_get("kind")?;
    Ok(AuditRecord {
        id: parse(&id)?,
        kind: parse(&kind)?,
        subject: row.try_get("subject")?,
        detail: row.try_get("detail")?,
        created_at: row.try_get("created_at")?,
    })
}

fn job_from_row(row: &PgRow) -> Result<BatchJob> {
    let id: uuid::Uuid = row.try_get("id")?;
    let operation: String = row.try_get("operation")?;
    let state: String = row.try_get("state")?;
    let created_at: DateTime<Utc> = row.try_get("created_at")?;
    Ok(BatchJob {
        id: JobId::from_uuid(id),
        account_id: account_id_from(row)?,
        operation: parse(&operation)?,
        options: row.try_get("options")?,
        submission_key: row.try_get("submission_key")?,
        state: parse(&state)?,
        files: Vec::new(),
        reserved_credits: row.try_get("reserved_credits")?,
        actual_credits: row.try_get("actual_credits")?,
        refunded_credits: row.try_get("refunded_credits")?,
        cancel_requested: row.try_get("cancel_requested")?,
        owner_id: row.try_get("owner_id")?,
        lease_expires_at: row.try_get("lease_expires_at")?,
        created_at,
        updated_at: row.try_get("updated_at")?,
    })
}

fn task_from_row(row: &PgRow) -> Result<FileTask> {
    let index: i32 = row.try_get("idx")?;
    let attempts: i32 = row.try_get("attempts")?;
    let state: String = row.try_get("state")?;
    Ok(FileTask {
        index: u32::try_from(index).map_err(|e| StoreError::Serialization(e.to_string()))?,
        input_ref: row.try_get("input_ref")?,
        output_ref: row.try_get("output_ref")?,
        state: parse(&state)?,
        attempts: u32::try_from(attempts).map_err(|e| StoreError::Serialization(e.to_string()))?,
        error: row.try_get("error")?,
    })
}

//! In-memory storage implementation.
//!
//! Every operation takes one mutex for its whole duration, which gives the same
//! all-or-nothing behaviour as a database transaction. Nothing is awaited while
//! the lock is held.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use pagecredit_core::{
    Account, AccountId, AuditKind, AuditRecord, BatchJob, EntryRequest, JobId, LedgerEntry,
    PaymentRecord, PaymentStatus,
};

use crate::error::{Result, StoreError};
use crate::{check_job_write, checked_balance, resolve_replay, ApplyOutcome, Store};

#[derive(Default)]
struct Tables {
    accounts: HashMap<AccountId, Account>,
    entries: Vec<LedgerEntry>,
    entries_by_key: HashMap<String, usize>,
    payments: HashMap<String, PaymentRecord>,
    audit: Vec<AuditRecord>,
    jobs: HashMap<JobId, BatchJob>,
    jobs_by_key: HashMap<String, JobId>,
    windows: HashMap<String, (i64, u32)>,
}

/// Storage backed by process memory.
#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl MemoryStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn get_account(&self, account_id: &AccountId) -> Result<Option<Account>> {
        Ok(self.tables.lock().accounts.get(account_id).cloned())
    }

    async fn set_account_disabled(
        &self,
        account_id: &AccountId,
        disabled: bool,
    ) -> Result<Account> {
        let mut tables = self.tables.lock();
        let account = tables
            .accounts
            .entry(account_id.clone())
            .or_insert_with(|| Account::new(account_id.clone()));
        account.disabled = disabled;
        account.updated_at = Utc::now();
        Ok(account.clone())
    }

    async fn apply_entry(&self, request: EntryRequest) -> Result<ApplyOutcome> {
        let mut tables = self.tables.lock();

        if let Some(&index) = tables.entries_by_key.get(&request.idempotency_key) {
            return resolve_replay(&request, tables.entries[index].clone());
        }

        let account = tables
            .accounts
            .entry(request.account_id.clone())
            .or_insert_with(|| Account::new(request.account_id.clone()));
        let balance_after = checked_balance(account, request.delta)?;
        account.balance = balance_after;
        account.updated_at = Utc::now();

        let entry = request.into_entry(balance_after);
        let index = tables.entries.len();
        tables
            .entries_by_key
            .insert(entry.idempotency_key.clone(), index);
        tables.entries.push(entry.clone());

        Ok(ApplyOutcome::Applied(entry))
    }

    async fn get_entry_by_key(&self, idempotency_key: &str) -> Result<Option<LedgerEntry>> {
        let tables = self.tables.lock();
        Ok(tables
            .entries_by_key
            .get(idempotency_key)
            .map(|&index| tables.entries[index].clone()))
    }

    async fn list_entries(
        &self,
        account_id: &AccountId,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<LedgerEntry>> {
        let tables = self.tables.lock();
        Ok(tables
            .entries
            .iter()
            .rev()
            .filter(|entry| &entry.account_id == account_id)
            .skip(offset)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn sum_deltas(&self, account_id: &AccountId) -> Result<i64> {
        let tables = self.tables.lock();
        Ok(tables
            .entries
            .iter()
            .filter(|entry| &entry.account_id == account_id)
            .map(|entry| entry.delta)
            .sum())
    }

    async fn get_payment(&self, external_id: &str) -> Result<Option<PaymentRecord>> {
        Ok(self.tables.lock().payments.get(external_id).cloned())
    }

    async fn insert_payment_if_absent(
        &self,
        record: &PaymentRecord,
    ) -> Result<Option<PaymentRecord>> {
        let mut tables = self.tables.lock();
        if let Some(existing) = tables.payments.get(&record.event.external_id) {
            return Ok(Some(existing.clone()));
        }
        tables
            .payments
            .insert(record.event.external_id.clone(), record.clone());
        Ok(None)
    }

    async fn save_payment(&self, record: &PaymentRecord) -> Result<bool> {
        let mut tables = self.tables.lock();
        if let Some(existing) = tables.payments.get(&record.event.external_id) {
            if existing.status == PaymentStatus::Applied && record.status != PaymentStatus::Applied
            {
                return Ok(false);
            }
        }
        tables
            .payments
            .insert(record.event.external_id.clone(), record.clone());
        Ok(true)
    }

    async fn append_audit(&self, record: &AuditRecord) -> Result<()> {
        self.tables.lock().audit.push(record.clone());
        Ok(())
    }

    async fn list_audit(
        &self,
        kind: Option<AuditKind>,
        subject: Option<&str>,
        limit: usize,
    ) -> Result<Vec<AuditRecord>> {
        let tables = self.tables.lock();
        Ok(tables
            .audit
            .iter()
            .rev()
            .filter(|record| kind.map_or(true, |k| record.kind == k))
            .filter(|record| subject.map_or(true, |s| record.subject == s))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn insert_job(&self, job: &BatchJob) -> Result<()> {
        let mut tables = self.tables.lock();
        if tables.jobs_by_key.contains_key(&job.submission_key) {
            return Err(StoreError::DuplicateKey {
                key: job.submission_key.clone(),
            });
        }
        tables
            .jobs_by_key
            .insert(job.submission_key.clone(), job.id);
        tables.jobs.insert(job.id, job.clone());
        Ok(())
    }

    async fn get_job(&self, job_id: &JobId) -> Result<Option<BatchJob>> {
        Ok(self.tables.lock().jobs.get(job_id).cloned())
    }

    async fn find_job_by_submission_key(&self, submission_key: &str) -> Result<Option<BatchJob>> {
        let tables = self.tables.lock();
        Ok(tables
            .jobs_by_key
            .get(submission_key)
            .and_then(|id| tables.jobs.get(id))
            .cloned())
    }

    async fn save_job(&self, job: &BatchJob) -> Result<()> {
        let mut tables = self.tables.lock();
        let stored = tables
            .jobs
            .get_mut(&job.id)
            .ok_or_else(|| StoreError::not_found("job", job.id))?;
        check_job_write(stored, job)?;
        let mut next = job.clone();
        next.cancel_requested = stored.cancel_requested || job.cancel_requested;
        next.owner_id = stored.owner_id.take();
        next.lease_expires_at = stored.lease_expires_at;
        *stored = next;
        Ok(())
    }

    async fn claim_job(
        &self,
        job_id: &JobId,
        owner: &str,
        now: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<Option<BatchJob>> {
        let mut tables = self.tables.lock();
        Ok(tables
            .jobs
            .get_mut(job_id)
            .filter(|job| job.lease_available(owner, now))
            .map(|job| {
                job.set_lease(owner, until);
                job.clone()
            }))
    }

    async fn request_cancel(&self, job_id: &JobId) -> Result<Option<BatchJob>> {
        let mut tables = self.tables.lock();
        Ok(tables.jobs.get_mut(job_id).map(|job| {
            if !job.state.is_terminal() && !job.cancel_requested {
                job.cancel_requested = true;
                job.touch();
            }
            job.clone()
        }))
    }

    async fn cancel_requested(&self, job_id: &JobId) -> Result<bool> {
        Ok(self
            .tables
            .lock()
            .jobs
            .get(job_id)
            .is_some_and(|job| job.cancel_requested))
    }

    async fn list_incomplete_jobs(&self) -> Result<Vec<BatchJob>> {
        let tables = self.tables.lock();
        let mut jobs: Vec<BatchJob> = tables
            .jobs
            .values()
            .filter(|job| !job.state.is_terminal())
            .cloned()
            .collect();
        jobs.sort_by_key(|job| job.created_at);
        Ok(jobs)
    }

    async fn increment_window(&self, identity: &str, window_start: i64) -> Result<u32> {
        let mut tables = self.tables.lock();
        let slot = tables
            .windows
            .entry(identity.to_string())
            .or_insert((window_start, 0));
        if slot.0 != window_start {
            *slot = (window_start, 0);
        }
        slot.1 = slot.1.saturating_add(1);
        Ok(slot.1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pagecredit_core::{
        AuditKind, EntryKind, JobState, Operation, PaymentEvent, PaymentOutcome, PaymentStatus,
        Provider,
    };
    use std::sync::Arc;

    fn account() -> AccountId {
        AccountId::new("acct_1").unwrap()
    }

    fn grant(amount: i64, key: &str) -> EntryRequest {
        EntryRequest::credit(EntryKind::Grant, account(), amount, key, "grant")
    }

    fn reserve(amount: i64, key: &str) -> EntryRequest {
        EntryRequest::debit(EntryKind::Reservation, account(), amount, key, "reserve")
    }

    // =========================================================================
    // Ledger
    // =========================================================================

    #[tokio::test]
    async fn first_entry_creates_account() {
        let store = MemoryStore::new();
        assert!(store.get_account(&account()).await.unwrap().is_none());

        let outcome = store.apply_entry(grant(100, "g1")).await.unwrap();
        assert!(outcome.is_new());
        assert_eq!(outcome.entry().balance_after, 100);

        let acct = store.get_account(&account()).await.unwrap().unwrap();
        assert_eq!(acct.balance, 100);
    }

    #[tokio::test]
    async fn replayed_key_is_a_no_op() {
        let store = MemoryStore::new();
        let first = store.apply_entry(grant(100, "g1")).await.unwrap();
        let second = store.apply_entry(grant(100, "g1")).await.unwrap();

        assert!(!second.is_new());
        assert_eq!(first.entry().id, second.entry().id);
        assert_eq!(store.get_account(&account()).await.unwrap().unwrap().balance, 100);
        assert_eq!(store.list_entries(&account(), 10, 0).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn replayed_key_with_other_amount_conflicts() {
        let store = MemoryStore::new();
        store.apply_entry(grant(100, "g1")).await.unwrap();

        let err = store.apply_entry(grant(50, "g1")).await.unwrap_err();
        assert!(matches!(err, StoreError::IdempotencyConflict { key } if key == "g1"));
    }

    #[tokio::test]
    async fn debit_never_goes_negative() {
        let store = MemoryStore::new();
        store.apply_entry(grant(10, "g1")).await.unwrap();

        let err = store.apply_entry(reserve(11, "r1")).await.unwrap_err();
        assert!(matches!(
            err,
            StoreError::InsufficientCredits {
                balance: 10,
                required: 11
            }
        ));
        assert_eq!(store.get_account(&account()).await.unwrap().unwrap().balance, 10);
        assert!(store.get_entry_by_key("r1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn disabled_account_rejects_debits_but_accepts_credits() {
        let store = MemoryStore::new();
        store.apply_entry(grant(10, "g1")).await.unwrap();
        store.set_account_disabled(&account(), true).await.unwrap();

        let err = store.apply_entry(reserve(1, "r1")).await.unwrap_err();
        assert!(matches!(err, StoreError::AccountDisabled { .. }));

        store.apply_entry(grant(5, "g2")).await.unwrap();
        assert_eq!(store.get_account(&account()).await.unwrap().unwrap().balance, 15);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_reservations_never_overdraw() {
        let store = Arc::new(MemoryStore::new());
        store.apply_entry(grant(100, "g1")).await.unwrap();

        let tasks: Vec<_> = (0..10)
            .map(|i| {
                let store = Arc::clone(&store);
                tokio::spawn(async move { store.apply_entry(reserve(50, &format!("r{i}"))).await })
            })
            .collect();

        let results = futures::future::join_all(tasks).await;
        let succeeded = results
            .into_iter()
            .filter(|r| matches!(r, Ok(Ok(_))))
            .count();

        assert_eq!(succeeded, 2);
        assert_eq!(store.get_account(&account()).await.unwrap().unwrap().balance, 0);
    }

    #[tokio::test]
    async fn balance_equals_sum_of_deltas() {
        let store = MemoryStore::new();
        store.apply_entry(grant(100, "g1")).await.unwrap();
        store.apply_entry(reserve(30, "r1")).await.unwrap();
        let _ = store.apply_entry(reserve(500, "r2")).await;
        store
            .apply_entry(EntryRequest::credit(
                EntryKind::Refund,
                account(),
                10,
                "refund:1",
                "refund",
            ))
            .await
            .unwrap();

        let balance = store.get_account(&account()).await.unwrap().unwrap().balance;
        assert_eq!(balance, 80);
        assert_eq!(store.sum_deltas(&account()).await.unwrap(), balance);
    }

    #[tokio::test]
    async fn entries_are_listed_newest_first() {
        let store = MemoryStore::new();
        store.apply_entry(grant(1, "a")).await.unwrap();
        store.apply_entry(grant(2, "b")).await.unwrap();
        store.apply_entry(grant(3, "c")).await.unwrap();

        let page = store.list_entries(&account(), 2, 0).await.unwrap();
        assert_eq!(page[0].idempotency_key, "c");
        assert_eq!(page[1].idempotency_key, "b");

        let rest = store.list_entries(&account(), 2, 2).await.unwrap();
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].idempotency_key, "a");
    }

    // =========================================================================
    // Payments, audit, jobs
    // =========================================================================

    #[tokio::test]
    async fn payment_insert_is_first_writer_wins() {
        let store = MemoryStore::new();
        let record = PaymentRecord::received(PaymentEvent {
            provider: Provider::Stripe,
            external_id: "cs_1".into(),
            account_id: account(),
            plan_id: "credits_100".into(),
            credits: 100,
            amount_minor: 999,
            currency: "USD".into(),
            outcome: PaymentOutcome::Completed,
            raw_payload: serde_json::json!({}),
        });

        assert!(store.insert_payment_if_absent(&record).await.unwrap().is_none());

        let mut applied = record.clone();
        applied.status = PaymentStatus::Applied;
        assert!(store.save_payment(&applied).await.unwrap());

        let existing = store.insert_payment_if_absent(&record).await.unwrap().unwrap();
        assert_eq!(existing.status, PaymentStatus::Applied);
    }

    #[tokio::test]
    async fn applied_payment_is_never_downgraded() {
        let store = MemoryStore::new();
        let mut record = PaymentRecord::received(PaymentEvent {
            provider: Provider::PayPal,
            external_id: "cap_1".into(),
            account_id: account(),
            plan_id: "credits_100".into(),
            credits: 100,
            amount_minor: 999,
            currency: "USD".into(),
            outcome: PaymentOutcome::Completed,
            raw_payload: serde_json::json!({}),
        });
        store.insert_payment_if_absent(&record).await.unwrap();

        record.status = PaymentStatus::Applied;
        assert!(store.save_payment(&record).await.unwrap());

        for status in [PaymentStatus::Failed, PaymentStatus::Received] {
            record.status = status;
            assert!(!store.save_payment(&record).await.unwrap());
        }
        let stored = store.get_payment("cap_1").await.unwrap().unwrap();
        assert_eq!(stored.status, PaymentStatus::Applied);
    }

    #[tokio::test]
    async fn audit_filters_by_kind() {
        let store = MemoryStore::new();
        store
            .append_audit(&AuditRecord::new(
                AuditKind::WebhookRejected,
                "evt_1",
                serde_json::json!({}),
            ))
            .await
            .unwrap();
        store
            .append_audit(&AuditRecord::new(
                AuditKind::PaymentFailed,
                "evt_2",
                serde_json::json!({}),
            ))
            .await
            .unwrap();

        let rejected = store
            .list_audit(Some(AuditKind::WebhookRejected), None, 10)
            .await
            .unwrap();
        assert_eq!(rejected.len(), 1);
        assert_eq!(rejected[0].subject, "evt_1");
        assert_eq!(store.list_audit(None, None, 10).await.unwrap().len(), 2);
    }

    fn job(key: &str) -> BatchJob {
        BatchJob::reserved(
            account(),
            Operation::Compress,
            &["in/1.pdf".to_string()],
            serde_json::json!({}),
            key.to_string(),
            1,
        )
    }

    #[tokio::test]
    async fn submission_key_is_unique() {
        let store = MemoryStore::new();
        store.insert_job(&job("batch:acct_1:k")).await.unwrap();

        let err = store.insert_job(&job("batch:acct_1:k")).await.unwrap_err();
        assert!(matches!(err, StoreError::DuplicateKey { .. }));
        assert!(store
            .find_job_by_submission_key("batch:acct_1:k")
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn save_job_keeps_cancel_flag() {
        let store = MemoryStore::new();
        let mut job = job("k");
        store.insert_job(&job).await.unwrap();
        store.request_cancel(&job.id).await.unwrap();

        job.transition(JobState::Running).unwrap();
        store.save_job(&job).await.unwrap();

        assert!(store.cancel_requested(&job.id).await.unwrap());
        let stored = store.get_job(&job.id).await.unwrap().unwrap();
        assert_eq!(stored.state, JobState::Running);
        assert_eq!(store.list_incomplete_jobs().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn finished_job_rejects_further_writes() {
        let store = MemoryStore::new();
        let mut job = job("k");
        store.insert_job(&job).await.unwrap();
        job.transition(JobState::Running).unwrap();
        store.save_job(&job).await.unwrap();

        let running = job.clone();
        job.transition(JobState::Completed).unwrap();
        store.save_job(&job).await.unwrap();

        let err = store.save_job(&running).await.unwrap_err();
        assert!(matches!(err, StoreError::JobFinished { .. }));
        let stored = store.get_job(&job.id).await.unwrap().unwrap();
        assert_eq!(stored.state, JobState::Completed);
        assert!(store.list_incomplete_jobs().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn lease_is_held_until_it_expires() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let lease = chrono::Duration::seconds(30);
        let mut job = job("k");
        job.set_lease("node-a", now + lease);
        store.insert_job(&job).await.unwrap();

        assert!(store.claim_job(&job.id, "node-b", now, now + lease).await.unwrap().is_none());
        let renewed = store
            .claim_job(&job.id, "node-a", now, now + lease * 2)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(renewed.lease_expires_at, Some(now + lease * 2));

        let later = now + lease * 3;
        let taken = store
            .claim_job(&job.id, "node-b", later, later + lease)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(taken.owner_id.as_deref(), Some("node-b"));

        job.transition(JobState::Running).unwrap();
        let err = store.save_job(&job).await.unwrap_err();
        assert!(matches!(err, StoreError::LeaseLost { .. }));
    }

    #[tokio::test]
    async fn rate_window_resets_on_new_window() {
        let store = MemoryStore::new();
        assert_eq!(store.increment_window("acct_1", 60).await.unwrap(), 1);
        assert_eq!(store.increment_window("acct_1", 60).await.unwrap(), 2);
        assert_eq!(store.increment_window("acct_1", 120).await.unwrap(), 1);
        assert_eq!(store.increment_window("acct_2", 120).await.unwrap(), 1);
    }
}

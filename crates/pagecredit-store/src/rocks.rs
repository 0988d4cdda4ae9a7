//! `RocksDB` storage implementation.
//!
//! Uses a pessimistic `TransactionDB`: every read that feeds a write goes through
//! `get_for_update`, so concurrent calls on the same account, idempotency key or
//! job serialize on RocksDB's row locks.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rocksdb::{
    BoundColumnFamily, ColumnFamilyDescriptor, ErrorKind, IteratorMode, MultiThreaded, Options,
    Transaction, TransactionDB, TransactionDBOptions,
};
use tracing::debug;

use pagecredit_core::{
    Account, AccountId, AuditKind, AuditRecord, BatchJob, EntryId, EntryRequest, JobId,
    LedgerEntry, PaymentRecord, PaymentStatus,
};

use crate::error::{Result, StoreError};
use crate::keys;
use crate::schema::{all_column_families, cf};
use crate::{check_job_write, checked_balance, resolve_replay, ApplyOutcome, Store};

type Db = TransactionDB<MultiThreaded>;
type Txn<'a> = Transaction<'a, Db>;

/// Attempts for a transaction that lost a lock race.
const MAX_TXN_ATTEMPTS: u32 = 5;

enum TxnError {
    Store(StoreError),
    Rocks(rocksdb::Error),
}

impl From<StoreError> for TxnError {
    fn from(err: StoreError) -> Self {
        Self::Store(err)
    }
}

impl From<rocksdb::Error> for TxnError {
    fn from(err: rocksdb::Error) -> Self {
        Self::Rocks(err)
    }
}

fn db_error(err: &rocksdb::Error) -> StoreError {
    StoreError::Database(err.to_string())
}

/// RocksDB-backed storage implementation.
pub struct RocksStore {
    db: Arc<Db>,
}

impl RocksStore {
    /// Open or create a `RocksDB` database at the given path.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or created.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        let cf_descriptors: Vec<_> = all_column_families()
            .into_iter()
            .map(|name| ColumnFamilyDescriptor::new(name, Options::default()))
            .collect();

        let db = Db::open_cf_descriptors(&opts, &TransactionDBOptions::default(), path, cf_descriptors)
            .map_err(|e| db_error(&e))?;

        Ok(Self { db: Arc::new(db) })
    }

    /// Get a column family handle.
    fn cf(&self, name: &str) -> Result<Arc<BoundColumnFamily<'_>>> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::Database(format!("column family not found: {name}")))
    }

    /// Serialize a value using CBOR.
    fn serialize<T: serde::Serialize>(value: &T) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        ciborium::into_writer(value, &mut buf)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        Ok(buf)
    }

    /// Deserialize a value from CBOR.
    fn deserialize<T: serde::de::DeserializeOwned>(data: &[u8]) -> Result<T> {
        ciborium::from_reader(data).map_err(|e| StoreError::Serialization(e.to_string()))
    }

    fn get<T: serde::de::DeserializeOwned>(&self, cf_name: &str, key: &[u8]) -> Result<Option<T>> {
        let cf = self.cf(cf_name)?;
        self.db
            .get_cf(&cf, key)
            .map_err(|e| db_error(&e))?
            .map(|data| Self::deserialize(&data))
            .transpose()
    }

    /// Run `body` in a transaction, retrying when it loses a lock race.
    fn with_txn<T>(
        &self,
        mut body: impl FnMut(&Txn<'_>) -> std::result::Result<T, TxnError>,
    ) -> Result<T> {
        let mut attempt = 1;
        loop {
            let txn = self.db.transaction();
            let result = body(&txn).and_then(|value| {
                txn.commit()?;
                Ok(value)
            });
            match result {
                Ok(value) => return Ok(value),
                Err(TxnError::Store(err)) => return Err(err),
                Err(TxnError::Rocks(err)) => {
                    let retryable = matches!(
                        err.kind(),
                        ErrorKind::Busy | ErrorKind::TimedOut | ErrorKind::TryAgain
                    );
                    if !retryable || attempt >= MAX_TXN_ATTEMPTS {
                        return Err(db_error(&err));
                    }
                    debug!(attempt, error = %err, "Retrying RocksDB transaction");
                    attempt += 1;
                }
            }
        }
    }

    fn load_entry(&self, entry_id_bytes: &[u8]) -> Result<Option<LedgerEntry>> {
        self.get(cf::ENTRIES, entry_id_bytes)
    }

    fn account_entry_ids(&self, account_id: &AccountId) -> Result<Vec<EntryId>> {
        let cf = self.cf(cf::ENTRIES_BY_ACCOUNT)?;
        let prefix = keys::account_entries_prefix(account_id);
        let iter = self.db.iterator_cf(
            &cf,
            IteratorMode::From(&prefix, rocksdb::Direction::Forward),
        );

        let mut ids = Vec::new();
        for item in iter {
            let (key, _) = item.map_err(|e| db_error(&e))?;
            if !key.starts_with(&prefix) {
                break;
            }
            if let Some(id) = keys::entry_id_from_account_key(&key) {
                ids.push(id);
            }
        }
        Ok(ids)
    }

    fn all_jobs(&self) -> Result<Vec<BatchJob>> {
        let cf = self.cf(cf::JOBS)?;
        let mut jobs = Vec::new();
        for item in self.db.iterator_cf(&cf, IteratorMode::Start) {
            let (_, value) = item.map_err(|e| db_error(&e))?;
            jobs.push(Self::deserialize::<BatchJob>(&value)?);
        }
        Ok(jobs)
    }
}

#[async_trait]
impl Store for RocksStore {
    // =========================================================================
    // Account Operations
    // =========================================================================

    async fn get_account(&self, account_id: &AccountId) -> Result<Option<Account>> {
        self.get(cf::ACCOUNTS, &keys::account_key(account_id))
    }

    async fn set_account_disabled(
        &self,
        account_id: &AccountId,
        disabled: bool,
    ) -> Result<Account> {
        let cf_accounts = self.cf(cf::ACCOUNTS)?;
        let key = keys::account_key(account_id);

        self.with_txn(|txn| {
            let mut account = match txn.get_for_update_cf(&cf_accounts, &key, true)? {
                Some(data) => Self::deserialize::<Account>(&data)?,
                None => Account::new(account_id.clone()),
            };
            account.disabled = disabled;
            account.updated_at = Utc::now();
            txn.put_cf(&cf_accounts, &key, Self::serialize(&account)?)?;
            Ok(account)
        })
    }

    // =========================================================================
    // Ledger Operations
    // =========================================================================

    async fn apply_entry(&self, request: EntryRequest) -> Result<ApplyOutcome> {
        let cf_accounts = self.cf(cf::ACCOUNTS)?;
        let cf_entries = self.cf(cf::ENTRIES)?;
        let cf_by_account = self.cf(cf::ENTRIES_BY_ACCOUNT)?;
        let cf_by_key = self.cf(cf::ENTRIES_BY_KEY)?;

        let idem_key = keys::idempotency_key(&request.idempotency_key);
        let account_key = keys::account_key(&request.account_id);

        self.with_txn(|txn| {
            if let Some(entry_id) = txn.get_for_update_cf(&cf_by_key, &idem_key, true)? {
                let existing = txn
                    .get_cf(&cf_entries, &entry_id)?
                    .map(|data| Self::deserialize::<LedgerEntry>(&data))
                    .transpose()?
                    .ok_or_else(|| {
                        StoreError::not_found("ledger entry", &request.idempotency_key)
                    })?;
                return Ok(resolve_replay(&request, existing)?);
            }

            let mut account = match txn.get_for_update_cf(&cf_accounts, &account_key, true)? {
                Some(data) => Self::deserialize::<Account>(&data)?,
                None => Account::new(request.account_id.clone()),
            };
            let balance_after = checked_balance(&account, request.delta)?;
            account.balance = balance_after;
            account.updated_at = Utc::now();

            let entry = request.clone().into_entry(balance_after);
            let entry_key = keys::entry_key(&entry.id);

            txn.put_cf(&cf_accounts, &account_key, Self::serialize(&account)?)?;
            txn.put_cf(&cf_entries, &entry_key, Self::serialize(&entry)?)?;
            txn.put_cf(
                &cf_by_account,
                keys::account_entry_key(&entry.account_id, &entry.id),
                [],
            )?;
            txn.put_cf(&cf_by_key, &idem_key, &entry_key)?;

            Ok(ApplyOutcome::Applied(entry))
        })
    }

    async fn get_entry_by_key(&self, idempotency_key: &str) -> Result<Option<LedgerEntry>> {
        let cf = self.cf(cf::ENTRIES_BY_KEY)?;
        let Some(entry_id) = self
            .db
            .get_cf(&cf, keys::idempotency_key(idempotency_key))
            .map_err(|e| db_error(&e))?
        else {
            return Ok(None);
        };
        self.load_entry(&entry_id)
    }

    async fn list_entries(
        &self,
        account_id: &AccountId,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<LedgerEntry>> {
        let mut entries = Vec::new();
        for id in self
            .account_entry_ids(account_id)?
            .into_iter()
            .rev()
            .skip(offset)
            .take(limit)
        {
            if let Some(entry) = self.load_entry(&keys::entry_key(&id))? {
                entries.push(entry);
            }
        }
        Ok(entries)
    }

    async fn sum_deltas(&self, account_id: &AccountId) -> Result<i64> {
        let mut total = 0i64;
        for id in self.account_entry_ids(account_id)? {
            if let Some(entry) = self.load_entry(&keys::entry_key(&id))? {
                total += entry.delta;
            }
        }
        Ok(total)
    }

    // =========================================================================
    // Payment Operations
    // =========================================================================

    async fn get_payment(&self, external_id: &str) -> Result<Option<PaymentRecord>> {
        self.get(cf::PAYMENTS, &keys::payment_key(external_id))
    }

    async fn insert_payment_if_absent(
        &self,
        record: &PaymentRecord,
    ) -> Result<Option<PaymentRecord>> {
        let cf = self.cf(cf::PAYMENTS)?;
        let key = keys::payment_key(&record.event.external_id);

        self.with_txn(|txn| {
            if let Some(data) = txn.get_for_update_cf(&cf, &key, true)? {
                return Ok(Some(Self::deserialize(&data)?));
            }
            txn.put_cf(&cf, &key, Self::serialize(record)?)?;
            Ok(None)
        })
    }

    async fn save_payment(&self, record: &PaymentRecord) -> Result<bool> {
        let cf = self.cf(cf::PAYMENTS)?;
        let key = keys::payment_key(&record.event.external_id);

        self.with_txn(|txn| {
            if let Some(data) = txn.get_for_update_cf(&cf, &key, true)? {
                let existing: PaymentRecord = Self::deserialize(&data)?;
                if existing.status == PaymentStatus::Applied
                    && record.status != PaymentStatus::Applied
                {
                    return Ok(false);
                }
            }
            txn.put_cf(&cf, &key, Self::serialize(record)?)?;
            Ok(true)
        })
    }

    // =========================================================================
    // Audit Operations
    // =========================================================================

    async fn append_audit(&self, record: &AuditRecord) -> Result<()> {
        let cf = self.cf(cf::AUDIT)?;
        self.db
            .put_cf(&cf, keys::audit_key(&record.id), Self::serialize(record)?)
            .map_err(|e| db_error(&e))
    }

    async fn list_audit(
        &self,
        kind: Option<AuditKind>,
        subject: Option<&str>,
        limit: usize,
    ) -> Result<Vec<AuditRecord>> {
        let cf = self.cf(cf::AUDIT)?;
        let mut records = Vec::new();
        for item in self.db.iterator_cf(&cf, IteratorMode::End) {
            if records.len() >= limit {
                break;
            }
            let (_, value) = item.map_err(|e| db_error(&e))?;
            let record: AuditRecord = Self::deserialize(&value)?;
            if kind.map_or(true, |k| record.kind == k)
                && subject.map_or(true, |s| record.subject == s)
            {
                records.push(record);
            }
        }
        Ok(records)
    }

    // =========================================================================
    // Job Operations
    // =========================================================================

    async fn insert_job(&self, job: &BatchJob) -> Result<()> {
        let cf_jobs = self.cf(cf::JOBS)?;
        let cf_by_key = self.cf(cf::JOBS_BY_KEY)?;
        let index_key = keys::submission_key(&job.submission_key);
        let job_key = keys::job_key(&job.id);

        self.with_txn(|txn| {
            if txn.get_for_update_cf(&cf_by_key, &index_key, true)?.is_some() {
                return Err(StoreError::DuplicateKey {
                    key: job.submission_key.clone(),
                }
                .into());
            }
            txn.put_cf(&cf_jobs, &job_key, Self::serialize(job)?)?;
            txn.put_cf(&cf_by_key, &index_key, &job_key)?;
            Ok(())
        })
    }

    async fn get_job(&self, job_id: &JobId) -> Result<Option<BatchJob>> {
        self.get(cf::JOBS, &keys::job_key(job_id))
    }

    async fn find_job_by_submission_key(&self, submission_key: &str) -> Result<Option<BatchJob>> {
        let cf = self.cf(cf::JOBS_BY_KEY)?;
        let Some(job_key) = self
            .db
            .get_cf(&cf, keys::submission_key(submission_key))
            .map_err(|e| db_error(&e))?
        else {
            return Ok(None);
        };
        self.get(cf::JOBS, &job_key)
    }

    async fn save_job(&self, job: &BatchJob) -> Result<()> {
        let cf = self.cf(cf::JOBS)?;
        let key = keys::job_key(&job.id);

        self.with_txn(|txn| {
            let stored: BatchJob = txn
                .get_for_update_cf(&cf, &key, true)?
                .map(|data| Self::deserialize(&data))
                .transpose()?
                .ok_or_else(|| StoreError::not_found("job", job.id))?;
            check_job_write(&stored, job)?;
            let mut next = job.clone();
            next.cancel_requested = stored.cancel_requested || job.cancel_requested;
            next.owner_id = stored.owner_id;
            next.lease_expires_at = stored.lease_expires_at;
            txn.put_cf(&cf, &key, Self::serialize(&next)?)?;
            Ok(())
        })
    }

    async fn claim_job(
        &self,
        job_id: &JobId,
        owner: &str,
        now: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<Option<BatchJob>> {
        let cf = self.cf(cf::JOBS)?;
        let key = keys::job_key(job_id);

        self.with_txn(|txn| {
            let Some(data) = txn.get_for_update_cf(&cf, &key, true)? else {
                return Ok(None);
            };
            let mut job: BatchJob = Self::deserialize(&data)?;
            if !job.lease_available(owner, now) {
                return Ok(None);
            }
            job.set_lease(owner, until);
            txn.put_cf(&cf, &key, Self::serialize(&job)?)?;
            Ok(Some(job))
        })
    }

    async fn request_cancel(&self, job_id: &JobId) -> Result<Option<BatchJob>> {
        let cf = self.cf(cf::JOBS)?;
        let key = keys::job_key(job_id);

        self.with_txn(|txn| {
            let Some(data) = txn.get_for_update_cf(&cf, &key, true)? else {
                return Ok(None);
            };
            let mut job: BatchJob = Self::deserialize(&data)?;
            if !job.state.is_terminal() && !job.cancel_requested {
                job.cancel_requested = true;
                job.touch();
                txn.put_cf(&cf, &key, Self::serialize(&job)?)?;
            }
            Ok(Some(job))
        })
    }

    async fn cancel_requested(&self, job_id: &JobId) -> Result<bool> {
        Ok(self
            .get::<BatchJob>(cf::JOBS, &keys::job_key(job_id))?
            .is_some_and(|job| job.cancel_requested))
    }

    async fn list_incomplete_jobs(&self) -> Result<Vec<BatchJob>> {
        let mut jobs: Vec<BatchJob> = self
            .all_jobs()?
            .into_iter()
            .filter(|job| !job.state.is_terminal())
            .collect();
        jobs.sort_by_key(|job| job.created_at);
        Ok(jobs)
    }

    // =========================================================================
    // Rate Limit Operations
    // =========================================================================

    async fn increment_window(&self, identity: &str, window_start: i64) -> Result<u32> {
        let cf = self.cf(cf::RATE_WINDOWS)?;
        let key = keys::window_key(identity);

        self.with_txn(|txn| {
            let (start, count) = match txn.get_for_update_cf(&cf, &key, true)? {
                Some(data) => Self::deserialize::<(i64, u32)>(&data)?,
                None => (window_start, 0),
            };
            let count = if start == window_start {
                count.saturating_add(1)
            } else {
                1
            };
            txn.put_cf(&cf, &key, Self::serialize(&(window_start, count))?)?;
            Ok(count)
        })
    }
}

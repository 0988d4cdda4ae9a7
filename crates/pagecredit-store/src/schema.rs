//! Column families of the embedded `RocksDB` backend.

/// Column family names for the `RocksDB` database.
pub mod cf {
    /// Account records, keyed by account id.
    pub const ACCOUNTS: &str = "accounts";

    /// Ledger entries, keyed by entry id (ULID, time-ordered).
    pub const ENTRIES: &str = "ledger_entries";

    /// Index: entries by account, keyed by `account_id || 0x00 || entry_id`.
    /// Value is empty (index only).
    pub const ENTRIES_BY_ACCOUNT: &str = "entries_by_account";

    /// Index: idempotency key to entry id.
    pub const ENTRIES_BY_KEY: &str = "entries_by_key";

    /// Payment records, keyed by provider payment id.
    pub const PAYMENTS: &str = "payment_events";

    /// Audit records, keyed by audit id (ULID).
    pub const AUDIT: &str = "audit_log";

    /// Batch jobs with their tasks, keyed by job id.
    pub const JOBS: &str = "batch_jobs";

    /// Index: submission key to job id.
    pub const JOBS_BY_KEY: &str = "jobs_by_submission_key";

    /// Current rate limit window per identity.
    pub const RATE_WINDOWS: &str = "rate_windows";
}

/// Returns all column family names for database initialization.
#[must_use]
pub fn all_column_families() -> Vec<&'static str> {
    vec![
        cf::ACCOUNTS,
        cf::ENTRIES,
        cf::ENTRIES_BY_ACCOUNT,
        cf::ENTRIES_BY_KEY,
        cf::PAYMENTS,
        cf::AUDIT,
        cf::JOBS,
        cf::JOBS_BY_KEY,
        cf::RATE_WINDOWS,
    ]
}

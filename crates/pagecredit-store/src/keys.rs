//! Key encoding utilities for `RocksDB`.

use pagecredit_core::{AccountId, AuditId, EntryId, JobId};

const SEPARATOR: u8 = 0x00;

/// Create an account key.
#[must_use]
pub fn account_key(account_id: &AccountId) -> Vec<u8> {
    account_id.as_str().as_bytes().to_vec()
}

/// Create a ledger entry key.
#[must_use]
pub fn entry_key(entry_id: &EntryId) -> Vec<u8> {
    entry_id.to_bytes().to_vec()
}

/// Create an account-entry index key.
///
/// Format: `account_id || 0x00 || entry_id (16 bytes)`
///
/// Account ids never contain control characters, so the separator cannot
/// collide, and ULIDs keep each account's entries sorted by time.
#[must_use]
pub fn account_entry_key(account_id: &AccountId, entry_id: &EntryId) -> Vec<u8> {
    let mut key = account_entries_prefix(account_id);
    key.extend_from_slice(&entry_id.to_bytes());
    key
}

/// Create a prefix for iterating all entries of an account.
#[must_use]
pub fn account_entries_prefix(account_id: &AccountId) -> Vec<u8> {
    let raw = account_id.as_str().as_bytes();
    let mut key = Vec::with_capacity(raw.len() + 17);
    key.extend_from_slice(raw);
    key.push(SEPARATOR);
    key
}

/// Extract the entry id from an account-entry index key.
///
/// Returns `None` if the key is shorter than an entry id.
#[must_use]
pub fn entry_id_from_account_key(key: &[u8]) -> Option<EntryId> {
    let start = key.len().checked_sub(16)?;
    let bytes: [u8; 16] = key[start..].try_into().ok()?;
    Some(EntryId::from_bytes(bytes))
}

/// Create an idempotency key index key.
#[must_use]
pub fn idempotency_key(key: &str) -> Vec<u8> {
    key.as_bytes().to_vec()
}

/// Create a payment key from the provider payment id.
#[must_use]
pub fn payment_key(external_id: &str) -> Vec<u8> {
    external_id.as_bytes().to_vec()
}

/// Create an audit record key.
#[must_use]
pub fn audit_key(audit_id: &AuditId) -> Vec<u8> {
    audit_id.to_bytes().to_vec()
}

/// Create a job key.
#[must_use]
pub fn job_key(job_id: &JobId) -> Vec<u8> {
    job_id.as_bytes().to_vec()
}

/// Create a submission key index key.
#[must_use]
pub fn submission_key(key: &str) -> Vec<u8> {
    key.as_bytes().to_vec()
}

/// Create a rate window key.
#[must_use]
pub fn window_key(identity: &str) -> Vec<u8> {
    identity.as_bytes().to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn account_entry_key_format() {
        let account = AccountId::new("acct_1").unwrap();
        let entry = EntryId::generate();
        let key = account_entry_key(&account, &entry);

        assert_eq!(key.len(), "acct_1".len() + 1 + 16);
        assert!(key.starts_with(&account_entries_prefix(&account)));
        assert_eq!(entry_id_from_account_key(&key), Some(entry));
    }

    #[test]
    fn prefixes_do_not_overlap() {
        let short = account_entries_prefix(&AccountId::new("acct_1").unwrap());
        let long = account_entries_prefix(&AccountId::new("acct_10").unwrap());
        assert!(!long.starts_with(&short));
    }

    #[test]
    fn short_key_has_no_entry_id() {
        assert_eq!(entry_id_from_account_key(b"short"), None);
    }
}

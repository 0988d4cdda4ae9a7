//! Account types for pagecredit.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::AccountId;

/// A credit account.
///
/// Accounts are created implicitly on their first ledger reference and are never
/// deleted. The balance is only ever changed together with a ledger entry, inside
/// one store transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    /// The account id (from the identity provider).
    pub account_id: AccountId,

    /// Current balance in credits. Never negative.
    pub balance: i64,

    /// Soft-disabled accounts cannot spend credits but still receive them.
    #[serde(default)]
    pub disabled: bool,

    /// When the account was created.
    pub created_at: DateTime<Utc>,

    /// When the account was last updated.
    pub updated_at: DateTime<Utc>,
}

impl Account {
    /// Create a new account with zero balance.
    #[must_use]
    pub fn new(account_id: AccountId) -> Self {
        let now = Utc::now();
        Self {
            account_id,
            balance: 0,
            disabled: false,
            created_at: now,
            updated_at: now,
        }
    }

    /// Check if the account can cover a deduction.
    #[must_use]
    pub fn has_sufficient_credits(&self, amount: i64) -> bool {
        self.balance >= amount
    }

    /// How many credits are missing to cover `amount` (zero if covered).
    #[must_use]
    pub fn shortfall(&self, amount: i64) -> i64 {
        (amount - self.balance).max(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn account_with(balance: i64) -> Account {
        let mut account = Account::new(AccountId::new("acct_1").unwrap());
        account.balance = balance;
        account
    }

    #[test]
    fn new_account_has_zero_balance() {
        let account = Account::new(AccountId::new("acct_1").unwrap());
        assert_eq!(account.balance, 0);
        assert!(!account.disabled);
    }

    #[test]
    fn account_sufficient_credits() {
        let account = account_with(10);
        assert!(account.has_sufficient_credits(10));
        assert!(!account.has_sufficient_credits(11));
        assert_eq!(account.shortfall(22), 12);
        assert_eq!(account.shortfall(3), 0);
    }
}

//! In-memory account store (§4.A).
//!
//! A mapping from account name to account record, guarded so the
//! request handler sees a linearizable view per account across
//! requests. Mirrors the teacher's pattern of wrapping a plain
//! `HashMap` in a single `parking_lot::Mutex` for structural
//! mutations (insert/delete), consistent with §5's "single
//! process-wide mutex ... is adequate".

use std::collections::HashMap;

use parking_lot::Mutex;

use crate::protocol::Amount;

/// A single account's balance and lock state.
///
/// Invariants (§3 I1-I4), enforced by the lock manager and request
/// handler rather than by this struct alone:
/// - a write-lock holder implies no read-lock holders (I1)
/// - two or more read-lock holders implies no write-lock holder (I2)
/// - a client appears at most once across readers ∪ writer (I3)
/// - `balance` may be negative only while a write lock is held (I4)
#[derive(Debug, Clone)]
pub struct Account {
    pub balance: Amount,
    /// Becomes `true` on the creating transaction's COMMIT; an
    /// account that is not yet established vanishes on the creator's
    /// ABORT instead.
    pub established: bool,
}

impl Account {
    fn new(balance: Amount, established: bool) -> Self {
        Self { balance, established }
    }
}

/// The server's account map.
///
/// Exposes lookup-or-insert (used only by DEPOSIT's creation branch),
/// lookup, and delete. There is no separate `exists` query; a lookup
/// returning `None` serves that role.
#[derive(Default)]
pub struct AccountStore {
    accounts: Mutex<HashMap<String, Account>>,
}

impl AccountStore {
    pub fn new() -> Self {
        Self { accounts: Mutex::new(HashMap::new()) }
    }

    /// Returns a snapshot of the account, if present.
    pub fn get(&self, name: &str) -> Option<Account> {
        self.accounts.lock().get(name).cloned()
    }

    /// Returns true if `name` names an existing account.
    pub fn exists(&self, name: &str) -> bool {
        self.accounts.lock().contains_key(name)
    }

    /// Inserts a brand-new, not-yet-established account if one does
    /// not already exist. Returns `true` if the insert happened.
    pub fn try_create(&self, name: &str, balance: Amount) -> bool {
        let mut accounts = self.accounts.lock();
        if accounts.contains_key(name) {
            return false;
        }
        accounts.insert(name.to_string(), Account::new(balance, false));
        true
    }

    /// Adds `delta` to an existing account's balance and returns the
    /// new balance. Panics if the account does not exist — callers
    /// must hold the appropriate lock and have already confirmed
    /// existence.
    pub fn apply_delta(&self, name: &str, delta: Amount) -> Amount {
        let mut accounts = self.accounts.lock();
        let account = accounts
            .get_mut(name)
            .expect("apply_delta called on an absent account");
        account.balance += delta;
        account.balance
    }

    /// Marks an account established (on creator COMMIT).
    pub fn establish(&self, name: &str) {
        if let Some(account) = self.accounts.lock().get_mut(name) {
            account.established = true;
        }
    }

    /// Restores an established account's balance to `value` (on
    /// creator ABORT of an already-established account — a no-op in
    /// practice since only the creator could still hold the write
    /// lock on a not-yet-established account, but kept total for
    /// uniformity with the spec's per-account restore rule).
    pub fn restore(&self, name: &str, value: Amount) {
        if let Some(account) = self.accounts.lock().get_mut(name) {
            account.balance = value;
        }
    }

    /// Deletes a not-yet-established account (on creator ABORT).
    pub fn delete(&self, name: &str) {
        self.accounts.lock().remove(name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn try_create_only_succeeds_once() {
        let store = AccountStore::new();
        assert!(store.try_create("x", 10));
        assert!(!store.try_create("x", 20));
        assert_eq!(store.get("x").unwrap().balance, 10);
    }

    #[test]
    fn abort_of_unestablished_account_deletes_it() {
        let store = AccountStore::new();
        store.try_create("x", 10);
        store.delete("x");
        assert!(!store.exists("x"));
    }

    #[test]
    fn commit_establishes_and_survives_future_aborts() {
        let store = AccountStore::new();
        store.try_create("x", 10);
        store.establish("x");
        assert!(store.get("x").unwrap().established);
    }
}

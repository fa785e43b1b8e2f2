//! Per-account two-phase locking (§4.B).
//!
//! Grounded in the teacher's `transaction::lock_manager::LockManager`:
//! a `parking_lot::Mutex`-guarded table plus a `parking_lot::Condvar`
//! signalled on every release, so waiters block without polling
//! instead of the source's 500ms busy-sleep (§9 re-architecture
//! guidance). Unlike the teacher's lock manager, requests here never
//! time out — the spec treats deadlock avoidance as a non-goal and
//! leaves a stalled waiter to operator-driven ABORT (§4.B, §5).

use std::collections::HashMap;

use parking_lot::{Condvar, Mutex};

/// Holders of a single account's lock.
#[derive(Debug, Default)]
struct LockEntry {
    /// Read-lock holders, each client appearing at most once (I3).
    readers: Vec<String>,
    /// The sole write-lock holder, if any (I1).
    writer: Option<String>,
}

impl LockEntry {
    fn is_empty(&self) -> bool {
        self.readers.is_empty() && self.writer.is_none()
    }
}

#[derive(Default)]
struct LockManagerState {
    /// account name -> lock entry.
    accounts: HashMap<String, LockEntry>,
    /// client id -> accounts it currently holds any lock on. The
    /// exact inverse index of the per-account holder sets, used to
    /// release all of a client's locks without scanning every
    /// account (§3 per-client lock set invariant).
    client_locks: HashMap<String, Vec<String>>,
}

/// Two-phase lock manager over account names.
pub struct LockManager {
    state: Mutex<LockManagerState>,
    released: Condvar,
}

impl LockManager {
    pub fn new() -> Self {
        Self { state: Mutex::new(LockManagerState::default()), released: Condvar::new() }
    }

    /// Blocks until `client` holds a read lock on `account`.
    ///
    /// Returns immediately if the client already holds the write
    /// lock (which implicitly satisfies any read) or already holds a
    /// read lock (idempotent reacquisition). Otherwise waits for the
    /// account to have no write-lock holder.
    pub fn request_read(&self, account: &str, client: &str) {
        let mut guard = self.state.lock();
        loop {
            let entry = guard.accounts.entry(account.to_string()).or_default();

            if entry.writer.as_deref() == Some(client) {
                return;
            }
            if entry.readers.iter().any(|c| c == client) {
                return;
            }
            if entry.writer.is_none() {
                entry.readers.push(client.to_string());
                Self::track(&mut guard.client_locks, client, account);
                tracing::debug!(client, account, "read lock granted");
                return;
            }

            self.released.wait(&mut guard);
        }
    }

    /// Blocks until `client` holds the write lock on `account`.
    ///
    /// Returns immediately if the client already holds it. Upgrades
    /// in place when the client is the sole reader. Grants outright
    /// when there is no writer and no readers. Otherwise waits.
    pub fn request_write(&self, account: &str, client: &str) {
        let mut guard = self.state.lock();
        loop {
            let entry = guard.accounts.entry(account.to_string()).or_default();

            if entry.writer.as_deref() == Some(client) {
                return;
            }

            if entry.writer.is_none() {
                if entry.readers.is_empty() {
                    entry.writer = Some(client.to_string());
                    Self::track(&mut guard.client_locks, client, account);
                    tracing::debug!(client, account, "write lock granted");
                    return;
                }
                if entry.readers.len() == 1 && entry.readers[0] == client {
                    entry.readers.clear();
                    entry.writer = Some(client.to_string());
                    // already tracked from the prior read acquisition
                    tracing::debug!(client, account, "write lock upgraded from sole reader");
                    return;
                }
            }

            self.released.wait(&mut guard);
        }
    }

    /// Releases every lock `client` holds, across all accounts, and
    /// wakes every waiter so it can retry acquisition.
    ///
    /// Unlike the original source (§9: an early `break` inside the
    /// reader-list scan released only the first matching read lock
    /// per account), this removes the client from the *entire*
    /// reader list, as the spec mandates.
    pub fn release_all(&self, client: &str) {
        let mut guard = self.state.lock();
        let Some(accounts) = guard.client_locks.remove(client) else {
            return;
        };

        for account in accounts {
            if let Some(entry) = guard.accounts.get_mut(&account) {
                if entry.writer.as_deref() == Some(client) {
                    entry.writer = None;
                } else {
                    entry.readers.retain(|c| c != client);
                }
                if entry.is_empty() {
                    guard.accounts.remove(&account);
                }
            }
        }

        tracing::debug!(client, "released all locks");
        self.released.notify_all();
    }

    /// Releases a single lock `client` holds on `account`, if any.
    ///
    /// Used when a request discovers, only after acquiring the lock,
    /// that the account does not exist (the new-account visibility
    /// recheck in §4.C coming back negative): the server must not
    /// retain the lock behind an `AccountNotExist` response, since
    /// the coordinator will never mark this server touched and so
    /// will never send it a COMMIT/ABORT to release it via
    /// `release_all` (§4.D "that server has already unwound").
    pub fn release(&self, account: &str, client: &str) {
        let mut guard = self.state.lock();
        if let Some(entry) = guard.accounts.get_mut(account) {
            if entry.writer.as_deref() == Some(client) {
                entry.writer = None;
            } else {
                entry.readers.retain(|c| c != client);
            }
            if entry.is_empty() {
                guard.accounts.remove(account);
            }
        }
        if let Some(held) = guard.client_locks.get_mut(client) {
            held.retain(|a| a != account);
        }
        self.released.notify_all();
    }

    /// Returns the accounts `client` currently holds any lock on.
    /// Exposed for tests verifying the lock-set-accuracy property.
    pub fn locks_held_by(&self, client: &str) -> Vec<String> {
        self.state.lock().client_locks.get(client).cloned().unwrap_or_default()
    }

    /// Returns the current reader list and writer for an account.
    /// Exposed for tests verifying I1-I3.
    pub fn holders(&self, account: &str) -> (Vec<String>, Option<String>) {
        let guard = self.state.lock();
        match guard.accounts.get(account) {
            Some(entry) => (entry.readers.clone(), entry.writer.clone()),
            None => (Vec::new(), None),
        }
    }

    fn track(client_locks: &mut HashMap<String, Vec<String>>, client: &str, account: &str) {
        let held = client_locks.entry(client.to_string()).or_default();
        if !held.iter().any(|a| a == account) {
            held.push(account.to_string());
        }
    }
}

impl Default for LockManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn idempotent_read_reacquisition_does_not_grow_reader_list() {
        let lm = LockManager::new();
        lm.request_read("x", "c1");
        lm.request_read("x", "c1");
        let (readers, _) = lm.holders("x");
        assert_eq!(readers, vec!["c1".to_string()]);
    }

    #[test]
    fn write_holder_implicitly_satisfies_a_later_read() {
        let lm = LockManager::new();
        lm.request_write("x", "c1");
        lm.request_read("x", "c1");
        let (readers, writer) = lm.holders("x");
        assert!(readers.is_empty());
        assert_eq!(writer, Some("c1".to_string()));
    }

    #[test]
    fn upgrade_from_sole_reader_succeeds() {
        let lm = LockManager::new();
        lm.request_read("x", "c1");
        lm.request_write("x", "c1");
        let (readers, writer) = lm.holders("x");
        assert!(readers.is_empty());
        assert_eq!(writer, Some("c1".to_string()));
    }

    #[test]
    fn multiple_readers_block_upgrade() {
        let lm = Arc::new(LockManager::new());
        lm.request_read("x", "c1");
        lm.request_read("x", "c2");

        let lm2 = lm.clone();
        let upgraded = thread::spawn(move || {
            lm2.request_write("x", "c1");
        });

        thread::sleep(Duration::from_millis(50));
        assert!(!upgraded.is_finished());

        lm.release_all("c2");
        upgraded.join().unwrap();
        let (readers, writer) = lm.holders("x");
        assert!(readers.is_empty());
        assert_eq!(writer, Some("c1".to_string()));
    }

    #[test]
    fn release_all_removes_full_reader_list_not_just_first_match() {
        let lm = LockManager::new();
        lm.request_read("x", "c1");
        lm.request_read("y", "c1");
        lm.release_all("c1");
        assert_eq!(lm.holders("x"), (Vec::new(), None));
        assert_eq!(lm.holders("y"), (Vec::new(), None));
        assert!(lm.locks_held_by("c1").is_empty());
    }

    #[test]
    fn release_drops_just_the_one_account_and_keeps_others_held() {
        let lm = LockManager::new();
        lm.request_read("x", "c1");
        lm.request_read("y", "c1");
        lm.release("x", "c1");
        assert_eq!(lm.holders("x"), (Vec::new(), None));
        assert_eq!(lm.holders("y"), (vec!["c1".to_string()], None));
        assert_eq!(lm.locks_held_by("c1"), vec!["y".to_string()]);
    }

    #[test]
    fn lock_set_is_exact_inverse_of_holders() {
        let lm = LockManager::new();
        lm.request_read("x", "c1");
        lm.request_write("y", "c1");
        let mut held = lm.locks_held_by("c1");
        held.sort();
        assert_eq!(held, vec!["x".to_string(), "y".to_string()]);
    }

    #[test]
    fn a_blocked_writer_wakes_once_the_other_writer_releases() {
        let lm = Arc::new(LockManager::new());
        lm.request_write("x", "c1");

        let lm2 = lm.clone();
        let waiter = thread::spawn(move || {
            lm2.request_write("x", "c2");
        });

        thread::sleep(Duration::from_millis(50));
        assert!(!waiter.is_finished());

        lm.release_all("c1");
        waiter.join().unwrap();
        let (_, writer) = lm.holders("x");
        assert_eq!(writer, Some("c2".to_string()));
    }
}

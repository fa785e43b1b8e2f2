//! Per-request dispatch (§4.C).
//!
//! One [`Handler`] is shared (via `Arc`) by every connection on a
//! server. Each method implements one operation's full protocol,
//! including the new-account visibility rule: a client may only see
//! an account it is about to create once it holds that account's
//! write lock, so every operation that might touch a just-created
//! account re-checks existence after acquiring the lock rather than
//! before (grounded in `original_source/server_f/server.go`, the only
//! one of the two Go server variants that implements this correctly).

use std::collections::HashMap;

use crate::protocol::{Amount, Request, Response};
use crate::server::account::AccountStore;
use crate::server::lock_manager::LockManager;

pub struct Handler {
    accounts: AccountStore,
    locks: LockManager,
}

impl Handler {
    pub fn new() -> Self {
        Self { accounts: AccountStore::new(), locks: LockManager::new() }
    }

    /// DEPOSIT: creates the account on first touch, otherwise adds to
    /// the existing balance. Always takes the write lock, since a
    /// deposit mutates the balance (or brings the account into
    /// existence) either way.
    pub fn deposit(&self, client_id: &str, account: &str, amount: Amount) -> Response {
        self.locks.request_write(account, client_id);

        if self.accounts.try_create(account, amount) {
            return Response::success(amount);
        }

        let balance = self.accounts.apply_delta(account, amount);
        Response::success(balance)
    }

    /// WITHDRAW: takes the write lock, then only succeeds against an
    /// account that exists. A withdrawal is permitted to drive the
    /// balance negative (I4) — rejection on insufficient funds is not
    /// part of this protocol, matching the source's commit-time-only
    /// validation.
    pub fn withdraw(&self, client_id: &str, account: &str, amount: Amount) -> Response {
        self.locks.request_write(account, client_id);

        if !self.accounts.exists(account) {
            // Already unwound: the coordinator never learns this
            // server was touched, so it will never send a COMMIT or
            // ABORT here to trigger release_all.
            self.locks.release(account, client_id);
            return Response::account_not_exist();
        }

        let balance = self.accounts.apply_delta(account, -amount);
        Response::success(balance)
    }

    /// BALANCE: takes the read lock, then checks existence. A read
    /// lock is sufficient because a balance query does not need to
    /// exclude other readers, only the account's sole writer (I1).
    pub fn balance(&self, client_id: &str, account: &str) -> Response {
        self.locks.request_read(account, client_id);

        match self.accounts.get(account) {
            Some(acct) => Response::success(acct.balance),
            None => {
                self.locks.release(account, client_id);
                Response::account_not_exist()
            }
        }
    }

    /// COMMIT: establishes every account this client created and
    /// releases all of its locks. `values` carries the client's final
    /// view of each touched account's balance but is otherwise
    /// unused here — the balances are already durable in the account
    /// store from the preceding DEPOSIT/WITHDRAW calls.
    pub fn commit(&self, client_id: &str, values: &HashMap<String, Amount>) -> Response {
        for account in values.keys() {
            self.accounts.establish(account);
        }
        self.locks.release_all(client_id);
        tracing::info!(client = client_id, accounts = values.len(), "commit");
        Response::success(0)
    }

    /// ABORT: restores every touched account to its pre-transaction
    /// value, deleting any that the client created and never
    /// committed, then releases all of its locks. `values` carries
    /// the backup balances the client captured before its first
    /// mutation of each account.
    pub fn abort(&self, client_id: &str, values: &HashMap<String, Amount>) -> Response {
        for (account, &backup) in values {
            match self.accounts.get(account) {
                Some(acct) if acct.established => self.accounts.restore(account, backup),
                Some(_) => self.accounts.delete(account),
                None => {}
            }
        }
        self.locks.release_all(client_id);
        tracing::info!(client = client_id, accounts = values.len(), "abort");
        Response::aborted()
    }

    /// Dispatches a decoded request to the matching operation.
    pub fn handle(&self, request: &Request) -> Response {
        use crate::protocol::Operation::*;
        match request.operation {
            Deposit => self.deposit(&request.client_id, &request.account, request.amount),
            Withdraw => self.withdraw(&request.client_id, &request.account, request.amount),
            Balance => self.balance(&request.client_id, &request.account),
            Commit => self.commit(&request.client_id, &request.values),
            Abort => self.abort(&request.client_id, &request.values),
        }
    }

    /// Releases every lock held by `client_id` without touching
    /// account state. Called when a connection drops before sending
    /// COMMIT or ABORT (§5, §9 REDESIGN FLAG R-1: a leaked lock from a
    /// broken connection would otherwise wedge every future
    /// transaction that touches the same account).
    pub fn disconnect(&self, client_id: &str) {
        self.locks.release_all(client_id);
    }
}

impl Default for Handler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deposit_creates_then_accumulates() {
        let h = Handler::new();
        let r1 = h.deposit("c1", "x", 100);
        assert_eq!(r1.amount, 100);
        h.commit("c1", &HashMap::from([("x".to_string(), 100)]));

        let r2 = h.deposit("c2", "x", 50);
        assert_eq!(r2.amount, 150);
    }

    #[test]
    fn withdraw_against_unknown_account_reports_not_exist() {
        let h = Handler::new();
        let r = h.withdraw("c1", "ghost", 10);
        assert_eq!(r.status, crate::protocol::Status::AccountNotExist);
    }

    #[test]
    fn a_recheck_that_finds_the_account_gone_leaves_no_lock_behind() {
        let h = Handler::new();
        h.deposit("c1", "x", 100);
        h.abort("c1", &HashMap::from([("x".to_string(), 0)]));

        // c2 never saw a Success response on this server, so the
        // coordinator will never address it with COMMIT/ABORT; the
        // handler itself must have already released c2's lock.
        let r = h.withdraw("c2", "x", 10);
        assert_eq!(r.status, crate::protocol::Status::AccountNotExist);
        assert!(h.locks.locks_held_by("c2").is_empty());
    }

    #[test]
    fn abort_of_a_fresh_account_makes_it_vanish() {
        let h = Handler::new();
        h.deposit("c1", "x", 100);
        assert!(h.accounts.exists("x"));

        h.abort("c1", &HashMap::from([("x".to_string(), 0)]));
        assert!(!h.accounts.exists("x"));
    }

    #[test]
    fn abort_of_an_established_account_restores_the_backup_value() {
        let h = Handler::new();
        h.deposit("c1", "x", 100);
        h.commit("c1", &HashMap::from([("x".to_string(), 100)]));

        h.withdraw("c2", "x", 40);
        assert_eq!(h.accounts.get("x").unwrap().balance, 60);

        h.abort("c2", &HashMap::from([("x".to_string(), 100)]));
        assert_eq!(h.accounts.get("x").unwrap().balance, 100);
    }

    #[test]
    fn disconnect_releases_locks_without_touching_balances() {
        let h = Handler::new();
        h.deposit("c1", "x", 100);
        h.disconnect("c1");
        assert!(h.locks.locks_held_by("c1").is_empty());
        assert_eq!(h.accounts.get("x").unwrap().balance, 100);
    }

    #[test]
    fn new_account_is_invisible_to_another_client_until_established() {
        let h = Handler::new();
        h.deposit("c1", "x", 100);

        // c2's BALANCE call blocks on the write lock in a real
        // connection; here we assert the pre-commit state directly
        // since this test is synchronous and single-threaded.
        assert!(h.accounts.exists("x"));
        h.commit("c1", &HashMap::from([("x".to_string(), 100)]));

        let r = h.balance("c2", "x");
        assert_eq!(r.amount, 100);
    }
}

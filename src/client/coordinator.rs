//! Transaction coordinator (§4.D).
//!
//! Tracks tentative balances and their pre-transaction backups across
//! every server the active transaction has touched, validates the
//! commit precondition, and builds the per-server slices that the
//! fan-out in [`crate::client::dispatcher`] broadcasts on COMMIT or
//! ABORT. Grounded in the shape of the teacher's
//! `transaction::two_phase_commit::TwoPhaseCommitCoordinator` — a
//! coordinator object tracking per-participant state — simplified to
//! the spec's flat, prepare-less broadcast: there is no prepare phase
//! and no participant-state machine, only current/backup maps.

use std::collections::{HashMap, HashSet};

use crate::protocol::{Amount, Operation};

/// A (server name, account name) pair — the coordinator's key space.
type Key = (String, String);

/// Per-transaction client-side state (§3 "Client-side entities").
#[derive(Debug, Default)]
pub struct Coordinator {
    current: HashMap<Key, Amount>,
    backup: HashMap<Key, Amount>,
    servers: HashSet<String>,
}

impl Coordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Clears all transaction state, as every BEGIN requires (§4.D).
    pub fn reset(&mut self) {
        self.current.clear();
        self.backup.clear();
        self.servers.clear();
    }

    /// Records a successful response to DEPOSIT/WITHDRAW/BALANCE.
    ///
    /// The backup value is computed only the first time this
    /// transaction touches (server, account) — §4.D's three backup
    /// formulas invert the operation's effect on the returned
    /// balance to recover what the account held before this
    /// transaction began.
    pub fn record(&mut self, server: &str, account: &str, op: Operation, request_amount: Amount, response_amount: Amount) {
        let key = (server.to_string(), account.to_string());

        if !self.backup.contains_key(&key) {
            let backup = match op {
                Operation::Balance => response_amount,
                Operation::Deposit => response_amount - request_amount,
                Operation::Withdraw => response_amount + request_amount,
                Operation::Commit | Operation::Abort => response_amount,
            };
            self.backup.insert(key.clone(), backup);
        }

        self.current.insert(key, response_amount);
        self.servers.insert(server.to_string());
    }

    /// True iff every tentative balance is non-negative (§8
    /// "no-negative-at-commit").
    pub fn commit_precondition_holds(&self) -> bool {
        self.current.values().all(|&amount| amount >= 0)
    }

    /// Every server this transaction has sent at least one
    /// successful operation to (I6).
    pub fn touched_servers(&self) -> Vec<String> {
        self.servers.iter().cloned().collect()
    }

    /// This server's slice of `current`, to broadcast on COMMIT.
    pub fn current_slice(&self, server: &str) -> HashMap<String, Amount> {
        self.current
            .iter()
            .filter(|((s, _), _)| s == server)
            .map(|((_, account), amount)| (account.clone(), *amount))
            .collect()
    }

    /// This server's slice of `backup`, to broadcast on ABORT.
    pub fn backup_slice(&self, server: &str) -> HashMap<String, Amount> {
        self.backup
            .iter()
            .filter(|((s, _), _)| s == server)
            .map(|((_, account), amount)| (account.clone(), *amount))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_touch_of_an_account_derives_the_backup_from_the_operation() {
        let mut c = Coordinator::new();
        c.record("A", "x", Operation::Deposit, 10, 10);
        assert_eq!(c.backup_slice("A").get("x"), Some(&0));

        c.record("A", "x", Operation::Deposit, 5, 15);
        // backup stays pinned to the first touch
        assert_eq!(c.backup_slice("A").get("x"), Some(&0));
        assert_eq!(c.current_slice("A").get("x"), Some(&15));
    }

    #[test]
    fn withdraw_backup_adds_back_the_withdrawn_amount() {
        let mut c = Coordinator::new();
        c.record("A", "x", Operation::Withdraw, 30, 70);
        assert_eq!(c.backup_slice("A").get("x"), Some(&100));
    }

    #[test]
    fn commit_precondition_fails_on_any_negative_balance() {
        let mut c = Coordinator::new();
        c.record("A", "x", Operation::Deposit, 50, 50);
        c.record("A", "x", Operation::Withdraw, 70, -20);
        assert!(!c.commit_precondition_holds());
    }

    #[test]
    fn touched_servers_tracks_every_distinct_server_seen() {
        let mut c = Coordinator::new();
        c.record("A", "x", Operation::Deposit, 10, 10);
        c.record("B", "y", Operation::Deposit, 20, 20);
        let mut servers = c.touched_servers();
        servers.sort();
        assert_eq!(servers, vec!["A".to_string(), "B".to_string()]);
    }

    #[test]
    fn reset_clears_all_transaction_state() {
        let mut c = Coordinator::new();
        c.record("A", "x", Operation::Deposit, 10, 10);
        c.reset();
        assert!(c.touched_servers().is_empty());
        assert!(c.current_slice("A").is_empty());
    }
}

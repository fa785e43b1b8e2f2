//! Session dispatcher (§4.E).
//!
//! Reads one line at a time from standard input and drives the
//! [`Coordinator`] and the per-server connections. The one subtlety
//! worth a comment anywhere in this module: while a DEPOSIT/WITHDRAW/
//! BALANCE is in flight, the dispatcher keeps reading the next line
//! concurrently so a user-typed ABORT is not stuck behind a stalled
//! server. `tokio::select!` races the in-flight response against the
//! next line exactly as §9 suggests ("two cooperating tasks ... plus
//! a separate channel carrying user lines"); when the line really is
//! an ABORT, it is pipelined straight onto the same connection's write
//! half instead of waiting for the stale response, so a session stuck
//! behind another client's lock is actually recoverable rather than
//! merely flagged.

use std::collections::HashMap;
use std::io;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};

use crate::client::connection::ServerConnection;
use crate::client::coordinator::Coordinator;
use crate::client::error::{ClientError, ClientResult};
use crate::protocol::{Amount, Operation, Request};

enum Command {
    Begin,
    Commit,
    Abort,
    Op { server: String, account: String, op: Operation, amount: Amount },
}

impl Command {
    fn parse(line: &str) -> Option<Command> {
        let fields: Vec<&str> = line.split_whitespace().collect();
        match fields.as_slice() {
            ["BEGIN"] => Some(Command::Begin),
            ["COMMIT"] => Some(Command::Commit),
            ["ABORT"] => Some(Command::Abort),
            [op @ ("DEPOSIT" | "WITHDRAW"), target, amount] => {
                let (server, account) = target.split_once('.')?;
                let amount: Amount = amount.parse().ok()?;
                let op = if *op == "DEPOSIT" { Operation::Deposit } else { Operation::Withdraw };
                Some(Command::Op { server: server.to_string(), account: account.to_string(), op, amount })
            }
            ["BALANCE", target] => {
                let (server, account) = target.split_once('.')?;
                Some(Command::Op { server: server.to_string(), account: account.to_string(), op: Operation::Balance, amount: 0 })
            }
            _ => None,
        }
    }
}

enum State {
    Idle,
    Active,
}

pub struct Dispatcher {
    client_id: String,
    connections: HashMap<String, ServerConnection>,
    coordinator: Coordinator,
    state: State,
    /// A line read ahead of schedule (while racing an in-flight
    /// request) that the next loop iteration must consume before
    /// reading stdin again.
    pending_line: Option<String>,
}

impl Dispatcher {
    pub fn new(client_id: impl Into<String>, connections: HashMap<String, ServerConnection>) -> Self {
        Self {
            client_id: client_id.into(),
            connections,
            coordinator: Coordinator::new(),
            state: State::Idle,
            pending_line: None,
        }
    }

    /// Runs the REPL off standard input until it closes.
    pub async fn run(&mut self) -> ClientResult<()> {
        self.run_with(tokio::io::stdin()).await
    }

    /// Runs the REPL off an arbitrary line source. Split out of
    /// [`Self::run`] so tests can drive the dispatcher over an
    /// in-memory pipe instead of the process's real stdin.
    pub async fn run_with<R>(&mut self, input: R) -> ClientResult<()>
    where
        R: AsyncRead + Unpin,
    {
        let mut lines = BufReader::new(input).lines();

        loop {
            let line = match self.pending_line.take() {
                Some(line) => line,
                None => match Self::next_line(&mut lines).await? {
                    Some(line) => line,
                    None => break,
                },
            };

            let command = Command::parse(line.trim());
            match (&self.state, command) {
                (State::Idle, Some(Command::Begin)) => {
                    self.coordinator.reset();
                    println!("OK");
                    self.state = State::Active;
                }
                (State::Idle, _) => {
                    // Commands outside BEGIN while idle are dropped (§4.E).
                }
                (State::Active, Some(Command::Commit)) => {
                    self.do_commit().await;
                    self.state = State::Idle;
                }
                (State::Active, Some(Command::Abort)) => {
                    self.do_abort().await;
                    self.state = State::Idle;
                }
                (State::Active, Some(Command::Op { server, account, op, amount })) => {
                    if self.do_operation(server, account, op, amount, &mut lines).await? {
                        self.state = State::Idle;
                    }
                }
                (State::Active, None) => {
                    // Unrecognized input while active: ignored rather than
                    // tearing down the transaction over a typo.
                }
            }
        }

        Ok(())
    }

    async fn next_line<R>(lines: &mut tokio::io::Lines<BufReader<R>>) -> io::Result<Option<String>>
    where
        R: AsyncRead + Unpin,
    {
        lines.next_line().await
    }

    /// Sends one DEPOSIT/WITHDRAW/BALANCE, racing it against the next
    /// stdin line. If that line is ABORT before the response arrives,
    /// the ABORT is pipelined onto the same connection right away
    /// (§4.E) rather than waiting on a response that may be stuck
    /// behind another session's lock for a long time. Returns `true`
    /// if the transaction tore down and the dispatcher should go idle.
    async fn do_operation<R>(
        &mut self,
        server: String,
        account: String,
        op: Operation,
        amount: Amount,
        lines: &mut tokio::io::Lines<BufReader<R>>,
    ) -> ClientResult<bool>
    where
        R: AsyncRead + Unpin,
    {
        let Some(conn) = self.connections.get_mut(&server) else {
            tracing::warn!("{}", ClientError::UnknownServer(server));
            println!("NOT FOUND, ABORTED");
            return Ok(true);
        };

        let request = match op {
            Operation::Deposit => Request::deposit(&self.client_id, &account, amount),
            Operation::Withdraw => Request::withdraw(&self.client_id, &account, amount),
            Operation::Balance => Request::balance(&self.client_id, &account),
            Operation::Commit | Operation::Abort => unreachable!("Command::parse never yields these"),
        };

        if conn.send_request(&request).await.is_err() {
            self.do_abort().await;
            return Ok(true);
        }

        loop {
            tokio::select! {
                biased;
                response = self.connections.get_mut(&server).expect("connection present for the server just used above").recv_response() => {
                    return self.handle_operation_response(&server, &account, op, amount, response).await;
                }
                next = Self::next_line(lines) => {
                    match next? {
                        Some(next_line) if next_line.trim() == "ABORT" => {
                            self.abort_overlapping(&server).await;
                            return Ok(true);
                        }
                        Some(other) => {
                            self.pending_line = Some(other);
                        }
                        None => return Ok(true),
                    }
                }
            }
        }
    }

    async fn handle_operation_response(
        &mut self,
        server: &str,
        account: &str,
        op: Operation,
        amount: Amount,
        response: ClientResult<crate::protocol::Response>,
    ) -> ClientResult<bool> {
        let response = match response {
            Ok(response) => response,
            Err(_) => {
                self.do_abort().await;
                return Ok(true);
            }
        };

        use crate::protocol::Status;
        match response.status {
            Status::Success => {
                self.coordinator.record(server, account, op, amount, response.amount);
                match op {
                    Operation::Balance => println!("{}.{} = {}", server, account, response.amount),
                    _ => println!("OK"),
                }
                Ok(false)
            }
            Status::AccountNotExist => {
                println!("NOT FOUND, ABORTED");
                self.broadcast_abort_except(Some(server)).await;
                self.coordinator.reset();
                Ok(true)
            }
            Status::Aborted | Status::Unknown => {
                self.broadcast_abort_except(Some(server)).await;
                println!("ABORTED");
                self.coordinator.reset();
                Ok(true)
            }
        }
    }

    /// Overlaps a user-typed ABORT with the still-pending response on
    /// `stuck_server` (§4.E): pipelines an ABORT request onto that
    /// same connection without waiting for the stale response — the
    /// server will process it once whatever lock the original request
    /// is waiting on eventually frees up — then fans the ordinary
    /// ABORT out to every other touched server and reports `ABORTED`
    /// right away.
    async fn abort_overlapping(&mut self, stuck_server: &str) {
        if let Some(conn) = self.connections.get_mut(stuck_server) {
            conn.abandon_oldest_response();
            let backup = self.coordinator.backup_slice(stuck_server);
            let _ = conn.send_and_forget(&Request::abort(&self.client_id, backup)).await;
        }
        self.broadcast_abort_except(Some(stuck_server)).await;
        println!("ABORTED");
        self.coordinator.reset();
    }

    async fn do_commit(&mut self) {
        if self.coordinator.commit_precondition_holds() {
            let requests = self
                .coordinator
                .touched_servers()
                .into_iter()
                .map(|server| {
                    let slice = self.coordinator.current_slice(&server);
                    (server, Request::commit(&self.client_id, slice))
                })
                .collect();
            self.fan_out(requests).await;
            println!("COMMIT OK");
        } else {
            self.broadcast_abort_except(None).await;
            println!("ABORTED");
        }
        self.coordinator.reset();
    }

    async fn do_abort(&mut self) {
        self.broadcast_abort_except(None).await;
        println!("ABORTED");
        self.coordinator.reset();
    }

    /// Fans ABORT out to every touched server except `skip`, if given
    /// — the server that just produced the failure (or is still stuck
    /// on the in-flight request) has already unwound or is being
    /// unwound separately (§4.D "that server has already unwound").
    async fn broadcast_abort_except(&mut self, skip: Option<&str>) {
        let requests = self
            .coordinator
            .touched_servers()
            .into_iter()
            .filter(|server| Some(server.as_str()) != skip)
            .map(|server| {
                let slice = self.coordinator.backup_slice(&server);
                (server, Request::abort(&self.client_id, slice))
            })
            .collect();
        self.fan_out(requests).await;
    }

    /// Sends one request per touched server concurrently (§9: "a
    /// correct parallelisation is permitted by the spec and is
    /// encouraged"). Connections are borrowed out of the map for the
    /// duration of their own task and put back once every task
    /// finishes, since `JoinSet` tasks must own what they touch.
    async fn fan_out(&mut self, requests: Vec<(String, Request)>) {
        let mut tasks = tokio::task::JoinSet::new();
        for (server, request) in requests {
            let Some(mut conn) = self.connections.remove(&server) else { continue };
            tasks.spawn(async move {
                let _ = conn.send(&request).await;
                conn
            });
        }
        while let Some(result) = tasks.join_next().await {
            if let Ok(conn) = result {
                self.connections.insert(conn.name().to_string(), conn);
            }
        }
    }
}

impl From<io::Error> for ClientError {
    fn from(err: io::Error) -> Self {
        ClientError::Config(format!("stdin read error: {}", err))
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;

    use super::*;
    use crate::protocol::Status;
    use crate::server::Server;

    async fn spawn_server() -> std::net::SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = Server::new();
        tokio::spawn(async move {
            let _ = server.serve(listener).await;
        });
        addr
    }

    #[tokio::test]
    async fn user_abort_escapes_a_request_stuck_behind_another_sessions_lock() {
        let addr = spawn_server().await;

        // A second session creates "x" and never commits, holding its
        // write lock forever — the exact stall §4.E exists to let an
        // operator escape.
        let mut blocker = ServerConnection::connect("A", &addr.to_string()).await.unwrap();
        let held = blocker.send(&Request::deposit("blocker", "x", 1)).await.unwrap();
        assert_eq!(held.status, Status::Success);

        let conn = ServerConnection::connect("A", &addr.to_string()).await.unwrap();
        let mut dispatcher = Dispatcher::new("c2", HashMap::from([("A".to_string(), conn)]));

        let (mut input, output) = tokio::io::duplex(4096);
        tokio::spawn(async move {
            input.write_all(b"BEGIN\nDEPOSIT A.x 5\nABORT\n").await.unwrap();
        });

        let result = tokio::time::timeout(Duration::from_secs(2), dispatcher.run_with(output)).await;
        assert!(result.is_ok(), "dispatcher hung instead of honoring the overlapping ABORT");
    }

    #[tokio::test]
    async fn a_transaction_commits_normally_when_nothing_overlaps() {
        let addr = spawn_server().await;
        let conn = ServerConnection::connect("A", &addr.to_string()).await.unwrap();
        let mut dispatcher = Dispatcher::new("c1", HashMap::from([("A".to_string(), conn)]));

        let (mut input, output) = tokio::io::duplex(4096);
        tokio::spawn(async move {
            input.write_all(b"BEGIN\nDEPOSIT A.x 10\nCOMMIT\n").await.unwrap();
        });

        let result = tokio::time::timeout(Duration::from_secs(2), dispatcher.run_with(output)).await;
        assert!(result.is_ok());
        assert!(result.unwrap().is_ok());
    }
}

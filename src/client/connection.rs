//! Per-server connection (§2, §6).
//!
//! The client holds one persistent connection per configured server
//! for the lifetime of the session, mirroring the original
//! implementation's `serverConnPool` dialed once at startup in
//! `configAndConnectServers`. A background task owns the read half and
//! forwards every decoded response onto an unbounded channel in wire
//! order, so the write half stays free for the dispatcher to use
//! independently — in particular to pipeline a user-typed ABORT onto
//! the wire while a DEPOSIT/WITHDRAW/BALANCE is still blocked behind
//! another session's lock (§4.E), without waiting on that stale
//! response first.

use std::io;

use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::client::error::{ClientError, ClientResult};
use crate::protocol::{read_message, write_message, Request, Response};

pub struct ServerConnection {
    name: String,
    write_half: OwnedWriteHalf,
    responses: mpsc::UnboundedReceiver<ClientResult<Response>>,
    reader: JoinHandle<()>,
    /// Responses owed to an earlier request this connection gave up on
    /// (§4.E's overlapping-ABORT escape) that [`Self::recv_response`]
    /// must silently drain before handing back a real one, so the
    /// FIFO order of this connection's responses stays aligned with
    /// whatever the dispatcher sends next.
    to_discard: usize,
}

impl ServerConnection {
    pub async fn connect(name: &str, addr: &str) -> ClientResult<Self> {
        let stream = TcpStream::connect(addr).await.map_err(|source| ClientError::Connect {
            name: name.to_string(),
            addr: addr.to_string(),
            source,
        })?;
        let (read_half, write_half) = stream.into_split();
        let (tx, rx) = mpsc::unbounded_channel();
        let reader = tokio::spawn(read_responses(name.to_string(), read_half, tx));
        Ok(Self { name: name.to_string(), write_half, responses: rx, reader, to_discard: 0 })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Writes `request` onto the wire and returns as soon as it is
    /// sent, without waiting for a response. Pair with
    /// [`Self::recv_response`] for the ordinary round trip.
    pub async fn send_request(&mut self, request: &Request) -> ClientResult<()> {
        write_message(&mut self.write_half, request)
            .await
            .map_err(|source| ClientError::ConnectionLost(self.name.clone(), source))
    }

    /// Marks the oldest still-unread response on this connection as
    /// one the dispatcher has given up on — used when an in-flight
    /// request is abandoned mid-wait rather than ever read.
    pub fn abandon_oldest_response(&mut self) {
        self.to_discard += 1;
    }

    /// Sends `request` and leaves its response to be drained by a
    /// later [`Self::recv_response`] call instead of returned here.
    /// This is how the dispatcher overlaps a user-typed ABORT with a
    /// request still blocked on another session's lock: the ABORT
    /// goes out immediately, and its eventual response — along with
    /// whatever response the abandoned request eventually gets — is
    /// discarded transparently the next time this connection is
    /// really read from.
    pub async fn send_and_forget(&mut self, request: &Request) -> ClientResult<()> {
        self.send_request(request).await?;
        self.to_discard += 1;
        Ok(())
    }

    /// Awaits the next response in wire order, first discarding
    /// whatever [`Self::abandon_oldest_response`]/[`Self::send_and_forget`]
    /// left owed.
    pub async fn recv_response(&mut self) -> ClientResult<Response> {
        while self.to_discard > 0 {
            self.to_discard -= 1;
            self.next_response().await?;
        }
        self.next_response().await
    }

    /// Sends `request` and waits for its matching response — the
    /// simple round trip used by the COMMIT/ABORT fan-out, where the
    /// write is never split from the read that follows it.
    pub async fn send(&mut self, request: &Request) -> ClientResult<Response> {
        self.send_request(request).await?;
        self.recv_response().await
    }

    async fn next_response(&mut self) -> ClientResult<Response> {
        match self.responses.recv().await {
            Some(result) => result,
            None => Err(ClientError::ConnectionLost(
                self.name.clone(),
                io::Error::new(io::ErrorKind::UnexpectedEof, "server closed the connection"),
            )),
        }
    }
}

impl Drop for ServerConnection {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

/// Runs for the life of one connection, decoding responses off the
/// read half strictly in arrival order and forwarding each onto `tx`.
/// Exists so a write is never blocked behind a read the dispatcher
/// hasn't gotten around to yet.
async fn read_responses(name: String, mut read_half: OwnedReadHalf, tx: mpsc::UnboundedSender<ClientResult<Response>>) {
    let mut buf = Vec::new();
    loop {
        match read_message::<_, Response>(&mut read_half, &mut buf).await {
            Ok(Some(response)) => {
                if tx.send(Ok(response)).is_err() {
                    return;
                }
            }
            Ok(None) => return,
            Err(source) => {
                let _ = tx.send(Err(ClientError::ConnectionLost(name.clone(), source)));
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Status;
    use crate::server::Server;
    use tokio::net::TcpListener;

    async fn spawn_server() -> ServerConnection {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = Server::new();
        tokio::spawn(async move {
            let _ = server.serve(listener).await;
        });
        ServerConnection::connect("A", &addr.to_string()).await.unwrap()
    }

    #[tokio::test]
    async fn send_request_and_recv_response_round_trip_independently() {
        let mut conn = spawn_server().await;
        conn.send_request(&Request::deposit("c1", "x", 10)).await.unwrap();
        let response = conn.recv_response().await.unwrap();
        assert_eq!(response.status, Status::Success);
        assert_eq!(response.amount, 10);
    }

    #[tokio::test]
    async fn abandoned_and_forgotten_responses_are_skipped_in_order() {
        let mut conn = spawn_server().await;

        // Sent but never read via `recv_response` — simulates the
        // original request §4.E's overlap gives up on.
        conn.send_request(&Request::deposit("c1", "x", 10)).await.unwrap();
        conn.abandon_oldest_response();

        // Sent and forgotten in one call — simulates the pipelined
        // ABORT that accompanies the give-up.
        conn.send_and_forget(&Request::withdraw("c1", "x", 3)).await.unwrap();

        // The next real round trip must see its own response, not the
        // two still sitting unread ahead of it on the wire.
        let response = conn.send(&Request::balance("c1", "x")).await.unwrap();
        assert_eq!(response.status, Status::Success);
        assert_eq!(response.amount, 7);
    }
}

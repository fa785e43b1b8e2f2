//! Per-connection accept loop and request pump (§4.C, §5).
//!
//! Grounded in the teacher's `network::server::Server`/`ConnectionHandler`
//! split: a bounded accept loop spawns one task per connection, which
//! owns the socket for its lifetime. Blocking lock waits inside
//! [`Handler`] are pushed onto a `spawn_blocking` thread so a client
//! stalled on a contended lock never stalls the Tokio reactor thread
//! running every other connection.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};

use crate::protocol::{read_message, write_message, Request, Response};
use crate::server::error::{ServerError, ServerResult};
use crate::server::handler::Handler;

/// Caps concurrently accepted connections, mirroring the teacher's
/// `MAX_CONCURRENT_CONNECTIONS` guard in its accept loop.
pub const MAX_CONCURRENT_CONNECTIONS: usize = 10_000;

pub struct Server {
    handler: Arc<Handler>,
    active_connections: Arc<std::sync::atomic::AtomicUsize>,
}

impl Server {
    pub fn new() -> Self {
        Self {
            handler: Arc::new(Handler::new()),
            active_connections: Arc::new(std::sync::atomic::AtomicUsize::new(0)),
        }
    }

    /// Binds `addr` and serves connections until the process is
    /// killed. Each connection handles requests serially (the
    /// protocol has no pipelining) but many connections run
    /// concurrently.
    pub async fn run(&self, addr: &str) -> ServerResult<()> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| ServerError::Bind { addr: addr.to_string(), source })?;
        tracing::info!("server listening on {}", addr);
        self.serve(listener).await
    }

    /// Serves connections off an already-bound listener. Split out of
    /// [`Server::run`] so integration tests can bind an ephemeral port
    /// (`127.0.0.1:0`), read back the address the OS assigned, and
    /// only then start accepting.
    pub async fn serve(&self, listener: TcpListener) -> ServerResult<()> {
        loop {
            let (socket, peer) = listener.accept().await?;

            let current = self.active_connections.load(std::sync::atomic::Ordering::Relaxed);
            if current >= MAX_CONCURRENT_CONNECTIONS {
                tracing::warn!(
                    "connection limit reached ({}/{}), rejecting {}",
                    current,
                    MAX_CONCURRENT_CONNECTIONS,
                    peer
                );
                continue;
            }
            self.active_connections.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            tracing::info!("accepted connection from {} ({} active)", peer, current + 1);

            let handler = self.handler.clone();
            let active_connections = self.active_connections.clone();
            tokio::spawn(async move {
                serve_connection(socket, peer, handler.clone()).await;
                active_connections.fetch_sub(1, std::sync::atomic::Ordering::Relaxed);
            });
        }
    }
}

impl Default for Server {
    fn default() -> Self {
        Self::new()
    }
}

/// Reads requests off `socket` until it closes, dispatching each to
/// `handler` and writing back the response.
///
/// A client is expected to end its session with COMMIT or ABORT, but
/// the connection can also just drop (crash, network partition). In
/// that case `handler.disconnect` releases whatever locks the client
/// still held, so a vanished client can never wedge another client's
/// transaction (§9 REDESIGN FLAG R-1).
async fn serve_connection(mut socket: TcpStream, peer: SocketAddr, handler: Arc<Handler>) {
    let mut buf = Vec::new();
    let mut client_id: Option<String> = None;

    loop {
        let request: Request = match read_message(&mut socket, &mut buf).await {
            Ok(Some(req)) => req,
            Ok(None) => break,
            Err(err) => {
                tracing::warn!("connection from {} closed mid-record: {}", peer, err);
                break;
            }
        };

        client_id = Some(request.client_id.clone());

        let task_handler = handler.clone();
        let response: Response = match tokio::task::spawn_blocking(move || task_handler.handle(&request)).await {
            Ok(response) => response,
            Err(join_err) => {
                tracing::error!("request handler panicked for {}: {}", peer, join_err);
                break;
            }
        };

        if let Err(err) = write_message(&mut socket, &response).await {
            tracing::warn!("failed writing response to {}: {}", peer, err);
            break;
        }
    }

    if let Some(client_id) = client_id {
        let cleanup_handler = handler.clone();
        let _ = tokio::task::spawn_blocking(move || cleanup_handler.disconnect(&client_id)).await;
    }
}

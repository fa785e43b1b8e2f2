//! A small distributed transactional banking store.
//!
//! Servers (`src/server`) each hold a disjoint set of named accounts
//! behind a per-account two-phase lock manager. Clients (`src/client`)
//! hold one connection per server and multiplex a single interactive
//! transaction over them, fanning a best-effort COMMIT or ABORT out to
//! every server the transaction touched. `src/protocol` is the wire
//! format shared by both; `src/config` is the line-oriented deployment
//! file both binaries read.

pub mod client;
pub mod config;
pub mod protocol;
pub mod server;

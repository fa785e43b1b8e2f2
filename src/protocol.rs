//! Wire protocol shared by the server and the client.
//!
//! Records are self-framing JSON objects: each side runs a
//! [`serde_json`] decoder directly over the TCP stream and decodes one
//! value at a time. There is no length prefix — the JSON grammar
//! itself delimits a record, the same approach the original
//! implementation took with Go's `encoding/json` streaming decoder.

use std::collections::HashMap;
use std::io;

use serde::{Deserialize, Serialize};
use serde_repr::{Deserialize_repr, Serialize_repr};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// An account balance. May be transiently negative mid-transaction.
pub type Amount = i64;

/// Operation tag carried on the wire, in the stable order DEPOSIT,
/// BALANCE, WITHDRAW, COMMIT, ABORT.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize_repr, Deserialize_repr)]
#[repr(u8)]
pub enum Operation {
    Deposit = 0,
    Balance = 1,
    Withdraw = 2,
    Commit = 3,
    Abort = 4,
}

/// Status tag carried on the wire, in the stable order Success,
/// AccountNotExist, Aborted, Unknown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize_repr, Deserialize_repr)]
#[repr(u8)]
pub enum Status {
    Success = 0,
    AccountNotExist = 1,
    Aborted = 2,
    Unknown = 3,
}

/// A request sent from a client to a single server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Request {
    pub operation: Operation,
    /// Empty for COMMIT/ABORT.
    #[serde(default)]
    pub account: String,
    #[serde(default)]
    pub amount: Amount,
    /// Populated on COMMIT with current balances, on ABORT with
    /// pre-transaction backups. Empty otherwise.
    #[serde(default)]
    pub values: HashMap<String, Amount>,
    pub client_id: String,
}

impl Request {
    pub fn deposit(client_id: impl Into<String>, account: impl Into<String>, amount: Amount) -> Self {
        Self {
            operation: Operation::Deposit,
            account: account.into(),
            amount,
            values: HashMap::new(),
            client_id: client_id.into(),
        }
    }

    pub fn withdraw(client_id: impl Into<String>, account: impl Into<String>, amount: Amount) -> Self {
        Self {
            operation: Operation::Withdraw,
            account: account.into(),
            amount,
            values: HashMap::new(),
            client_id: client_id.into(),
        }
    }

    pub fn balance(client_id: impl Into<String>, account: impl Into<String>) -> Self {
        Self {
            operation: Operation::Balance,
            account: account.into(),
            amount: 0,
            values: HashMap::new(),
            client_id: client_id.into(),
        }
    }

    pub fn commit(client_id: impl Into<String>, values: HashMap<String, Amount>) -> Self {
        Self {
            operation: Operation::Commit,
            account: String::new(),
            amount: 0,
            values,
            client_id: client_id.into(),
        }
    }

    pub fn abort(client_id: impl Into<String>, values: HashMap<String, Amount>) -> Self {
        Self {
            operation: Operation::Abort,
            account: String::new(),
            amount: 0,
            values,
            client_id: client_id.into(),
        }
    }
}

/// A response sent from a server back to the client that made the request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Response {
    pub status: Status,
    /// Meaningful on `Success` for balance-bearing operations.
    #[serde(default)]
    pub amount: Amount,
}

impl Response {
    pub fn success(amount: Amount) -> Self {
        Self { status: Status::Success, amount }
    }

    pub fn account_not_exist() -> Self {
        Self { status: Status::AccountNotExist, amount: 0 }
    }

    pub fn aborted() -> Self {
        Self { status: Status::Aborted, amount: 0 }
    }
}

/// Writes one JSON record to the stream. Carries no length prefix;
/// the JSON object itself is the frame.
pub async fn write_message<W, T>(writer: &mut W, message: &T) -> io::Result<()>
where
    W: AsyncWriteExt + Unpin,
    T: Serialize,
{
    let bytes = serde_json::to_vec(message)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    writer.write_all(&bytes).await
}

/// Reads the next self-framing JSON record from the stream.
///
/// Bytes are accumulated into `buf` until a complete JSON value can be
/// parsed; this mirrors Go's `json.Decoder`, which buffers exactly as
/// much of the stream as one value needs and leaves the remainder for
/// the next `Decode` call. Returns `Ok(None)` on a clean EOF with no
/// partial record pending.
pub async fn read_message<R, T>(reader: &mut R, buf: &mut Vec<u8>) -> io::Result<Option<T>>
where
    R: AsyncReadExt + Unpin,
    T: for<'de> Deserialize<'de>,
{
    loop {
        if !buf.is_empty() {
            let mut de = serde_json::Deserializer::from_slice(buf);
            match T::deserialize(&mut de) {
                Ok(value) => {
                    let consumed = de.byte_offset();
                    buf.drain(..consumed);
                    return Ok(Some(value));
                }
                Err(e) if e.is_eof() => {
                    // Need more bytes before this record is complete.
                }
                Err(e) => return Err(io::Error::new(io::ErrorKind::InvalidData, e)),
            }
        }

        let mut chunk = [0u8; 4096];
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            if buf.is_empty() {
                return Ok(None);
            }
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed mid-record",
            ));
        }
        buf.extend_from_slice(&chunk[..n]);
    }
}

//! Unix-socket client for the config store's framed wire protocol
//!
//! Requests and replies share one frame shape: a 16-byte little-endian
//! header (`op`, `req_id`, `tx_id`, `len`) followed by `len` bytes of
//! NUL-delimited text payload. Replies mirror the request's op, except for
//! `ERROR` replies whose payload is a symbolic errno. Requests on one
//! connection are answered in order, so the client serializes round trips
//! behind a connection mutex.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use byteorder::{ByteOrder, LittleEndian};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;
use tokio::sync::Mutex;
use tracing::{debug, trace};

use super::{ConfigStore, Result, StoreError, StoreTxn};

const OP_DIRECTORY: u32 = 1;
const OP_READ: u32 = 2;
const OP_TRANSACTION_START: u32 = 6;
const OP_TRANSACTION_END: u32 = 7;
const OP_WRITE: u32 = 11;
const OP_ERROR: u32 = 16;

const HEADER_LEN: usize = 16;
/// Store payloads are capped; anything larger is a protocol violation.
const MAX_PAYLOAD: usize = 4096;

/// No transaction.
const NO_TXN: u32 = 0;

fn encode_header(op: u32, req_id: u32, tx_id: u32, len: u32) -> [u8; HEADER_LEN] {
    let mut header = [0u8; HEADER_LEN];
    LittleEndian::write_u32(&mut header[0..4], op);
    LittleEndian::write_u32(&mut header[4..8], req_id);
    LittleEndian::write_u32(&mut header[8..12], tx_id);
    LittleEndian::write_u32(&mut header[12..16], len);
    header
}

fn decode_header(header: &[u8; HEADER_LEN]) -> (u32, u32, u32, u32) {
    (
        LittleEndian::read_u32(&header[0..4]),
        LittleEndian::read_u32(&header[4..8]),
        LittleEndian::read_u32(&header[8..12]),
        LittleEndian::read_u32(&header[12..16]),
    )
}

/// NUL-terminate and join request parts.
fn encode_payload(parts: &[&str]) -> Vec<u8> {
    let mut payload = Vec::new();
    for part in parts {
        payload.extend_from_slice(part.as_bytes());
        payload.push(0);
    }
    payload
}

/// A reply payload as one string, trailing NULs stripped.
fn payload_string(bytes: &[u8]) -> String {
    let end = bytes.iter().rposition(|&b| b != 0).map_or(0, |i| i + 1);
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

/// A reply payload as NUL-separated entries.
fn payload_entries(bytes: &[u8]) -> Vec<String> {
    bytes
        .split(|&b| b == 0)
        .filter(|chunk| !chunk.is_empty())
        .map(|chunk| String::from_utf8_lossy(chunk).into_owned())
        .collect()
}

struct StoreConn {
    stream: UnixStream,
    next_req: u32,
}

impl StoreConn {
    async fn roundtrip(&mut self, op: u32, tx_id: u32, payload: &[u8]) -> Result<(u32, Vec<u8>)> {
        let req_id = self.next_req;
        self.next_req = self.next_req.wrapping_add(1);
        let header = encode_header(op, req_id, tx_id, payload.len() as u32);
        self.stream.write_all(&header).await?;
        self.stream.write_all(payload).await?;

        let mut reply_header = [0u8; HEADER_LEN];
        self.stream.read_exact(&mut reply_header).await?;
        let (reply_op, _reply_req, _reply_tx, len) = decode_header(&reply_header);
        let len = len as usize;
        if len > MAX_PAYLOAD {
            return Err(StoreError::Malformed(format!(
                "oversized reply: {} bytes",
                len
            )));
        }
        let mut reply = vec![0u8; len];
        self.stream.read_exact(&mut reply).await?;
        trace!(op, reply_op, len, "store round trip");
        Ok((reply_op, reply))
    }
}

async fn request(
    conn: &Mutex<StoreConn>,
    op: u32,
    tx_id: u32,
    parts: &[&str],
) -> Result<Vec<u8>> {
    let payload = encode_payload(parts);
    let (reply_op, reply) = conn.lock().await.roundtrip(op, tx_id, &payload).await?;
    if reply_op == OP_ERROR {
        let errno = payload_string(&reply);
        return Err(match errno.as_str() {
            "ENOENT" => StoreError::NotFound,
            "EAGAIN" => StoreError::Conflict,
            _ => StoreError::Rejected(errno),
        });
    }
    if reply_op != op {
        return Err(StoreError::Malformed(format!(
            "reply op {} for request op {}",
            reply_op, op
        )));
    }
    Ok(reply)
}

/// Config-store client over the store's unix socket.
pub struct WireStore {
    conn: Arc<Mutex<StoreConn>>,
}

impl WireStore {
    /// Connect to the store socket.
    pub async fn connect(path: impl AsRef<Path>) -> Result<Self> {
        let stream = UnixStream::connect(path.as_ref()).await?;
        debug!(path = %path.as_ref().display(), "connected to config store");
        Ok(Self {
            conn: Arc::new(Mutex::new(StoreConn {
                stream,
                next_req: 1,
            })),
        })
    }
}

#[async_trait]
impl ConfigStore for WireStore {
    async fn read(&self, path: &str) -> Result<Option<String>> {
        match request(&self.conn, OP_READ, NO_TXN, &[path]).await {
            Ok(reply) => Ok(Some(payload_string(&reply))),
            Err(StoreError::NotFound) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn list(&self, path: &str) -> Result<Vec<String>> {
        match request(&self.conn, OP_DIRECTORY, NO_TXN, &[path]).await {
            Ok(reply) => Ok(payload_entries(&reply)),
            Err(StoreError::NotFound) => Ok(Vec::new()),
            Err(e) => Err(e),
        }
    }

    async fn begin(&self) -> Result<Box<dyn StoreTxn>> {
        let reply = request(&self.conn, OP_TRANSACTION_START, NO_TXN, &[""]).await?;
        let id = payload_string(&reply)
            .parse()
            .map_err(|_| StoreError::Malformed("unparsable transaction id".to_string()))?;
        trace!(id, "transaction started");
        Ok(Box::new(WireTxn {
            conn: Arc::clone(&self.conn),
            id,
        }))
    }
}

struct WireTxn {
    conn: Arc<Mutex<StoreConn>>,
    id: u32,
}

#[async_trait]
impl StoreTxn for WireTxn {
    async fn write(&mut self, path: &str, value: &str) -> Result<()> {
        request(&self.conn, OP_WRITE, self.id, &[path, value])
            .await
            .map(drop)
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        request(&self.conn, OP_TRANSACTION_END, self.id, &["T"])
            .await
            .map(drop)
    }

    async fn abort(self: Box<Self>) -> Result<()> {
        request(&self.conn, OP_TRANSACTION_END, self.id, &["F"])
            .await
            .map(drop)
    }
}

//! Config-store access
//!
//! The hypervisor's configuration store is a hierarchical, transactional
//! key-value database describing guest device topology. The daemon reads
//! and writes one guest's USB subtree:
//!
//! - `/domain/<id>/device/usb/<controller>/port/<port>`: empty when the
//!   slot is free, a device's sys name while an attach is in flight or
//!   completed
//! - `/domain/<id>/device/usb/<controller>/{type,usb-ver,num-ports}`:
//!   controller descriptor
//! - `/domain-list/<id>/name`: guest name lookup
//!
//! Access goes through the [`ConfigStore`] trait so tests can substitute
//! an in-memory implementation for the wire client.

pub mod mem;
pub mod wire;

pub use mem::MemStore;
pub use wire::WireStore;

use async_trait::async_trait;
use thiserror::Error;

/// Config-store errors
#[derive(Debug, Error)]
pub enum StoreError {
    /// I/O failure on the store socket
    #[error("store I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A reply violated the wire format
    #[error("malformed store reply: {0}")]
    Malformed(String),

    /// The requested path does not exist
    #[error("no such store entry")]
    NotFound,

    /// A transaction could not commit because of a concurrent change
    #[error("transaction conflict")]
    Conflict,

    /// The store rejected the request with the given errno
    #[error("store rejected request: {0}")]
    Rejected(String),
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// Read access plus transaction entry for one config store.
#[async_trait]
pub trait ConfigStore: Send + Sync {
    /// Value at `path`, or `None` when the path does not exist.
    async fn read(&self, path: &str) -> Result<Option<String>>;

    /// Child names directly under `path`; empty when the path does not
    /// exist.
    async fn list(&self, path: &str) -> Result<Vec<String>>;

    /// Open a transaction. Writes stage inside it and become visible only
    /// on commit.
    async fn begin(&self) -> Result<Box<dyn StoreTxn>>;
}

/// One open store transaction.
#[async_trait]
pub trait StoreTxn: Send {
    /// Stage one value write.
    async fn write(&mut self, path: &str, value: &str) -> Result<()>;

    /// Apply all staged writes atomically.
    async fn commit(self: Box<Self>) -> Result<()>;

    /// Discard all staged writes.
    async fn abort(self: Box<Self>) -> Result<()>;
}

/// Root of the running-domain name list.
pub const DOMAIN_LIST_ROOT: &str = "/domain-list";

/// Path of a domain's name entry.
pub fn domain_name_path(domain_id: &str) -> String {
    format!("{}/{}/name", DOMAIN_LIST_ROOT, domain_id)
}

/// Root of a domain's virtual USB subtree.
pub fn usb_root(domain_id: &str) -> String {
    format!("/domain/{}/device/usb", domain_id)
}

/// Root of one controller's descriptor.
pub fn controller_root(domain_id: &str, controller: u32) -> String {
    format!("{}/{}", usb_root(domain_id), controller)
}

/// Directory holding one controller's port slots.
pub fn ports_root(domain_id: &str, controller: u32) -> String {
    format!("{}/port", controller_root(domain_id, controller))
}

/// Path of one port slot.
pub fn port_path(domain_id: &str, controller: u32, port: u32) -> String {
    format!("{}/{}", ports_root(domain_id, controller), port)
}

//! In-memory config store
//!
//! Staged-write implementation of [`ConfigStore`] used by the test suites:
//! transactions collect writes and apply them on commit, which is exactly
//! the observable contract of the wire store.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::{ConfigStore, Result, StoreTxn};

type Entries = Arc<Mutex<BTreeMap<String, String>>>;

/// In-memory hierarchical key-value store.
#[derive(Default, Clone)]
pub struct MemStore {
    entries: Entries,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed one entry, bypassing transactions.
    pub async fn insert(&self, path: &str, value: &str) {
        self.entries
            .lock()
            .await
            .insert(path.to_string(), value.to_string());
    }

    /// Direct lookup, for assertions.
    pub async fn get(&self, path: &str) -> Option<String> {
        self.entries.lock().await.get(path).cloned()
    }
}

#[async_trait]
impl ConfigStore for MemStore {
    async fn read(&self, path: &str) -> Result<Option<String>> {
        Ok(self.entries.lock().await.get(path).cloned())
    }

    async fn list(&self, path: &str) -> Result<Vec<String>> {
        let prefix = format!("{}/", path);
        let entries = self.entries.lock().await;
        let mut children: Vec<String> = Vec::new();
        for key in entries.keys() {
            if let Some(rest) = key.strip_prefix(&prefix) {
                let child = rest.split('/').next().unwrap_or(rest);
                if !child.is_empty() && children.iter().all(|c| c.as_str() != child) {
                    children.push(child.to_string());
                }
            }
        }
        Ok(children)
    }

    async fn begin(&self) -> Result<Box<dyn StoreTxn>> {
        Ok(Box::new(MemTxn {
            entries: Arc::clone(&self.entries),
            staged: Vec::new(),
        }))
    }
}

struct MemTxn {
    entries: Entries,
    staged: Vec<(String, String)>,
}

#[async_trait]
impl StoreTxn for MemTxn {
    async fn write(&mut self, path: &str, value: &str) -> Result<()> {
        self.staged.push((path.to_string(), value.to_string()));
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        let mut entries = self.entries.lock().await;
        for (path, value) in self.staged {
            entries.insert(path, value);
        }
        Ok(())
    }

    async fn abort(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::port_path;

    #[tokio::test]
    async fn test_commit_applies_staged_writes() {
        let store = MemStore::new();
        let mut txn = store.begin().await.unwrap();
        txn.write(&port_path("4", 0, 1), "3-1.4").await.unwrap();
        assert_eq!(store.get(&port_path("4", 0, 1)).await, None);
        txn.commit().await.unwrap();
        assert_eq!(
            store.get(&port_path("4", 0, 1)).await.as_deref(),
            Some("3-1.4")
        );
    }

    #[tokio::test]
    async fn test_abort_discards_staged_writes() {
        let store = MemStore::new();
        let mut txn = store.begin().await.unwrap();
        txn.write(&port_path("4", 0, 1), "3-1.4").await.unwrap();
        txn.abort().await.unwrap();
        assert_eq!(store.get(&port_path("4", 0, 1)).await, None);
    }

    #[tokio::test]
    async fn test_list_returns_direct_children_once() {
        let store = MemStore::new();
        store.insert("/domain/4/device/usb/0/type", "emulated").await;
        store.insert("/domain/4/device/usb/0/port/1", "").await;
        store.insert("/domain/4/device/usb/0/port/2", "").await;
        store.insert("/domain/4/device/usb/1/port/1", "").await;

        let controllers = store.list("/domain/4/device/usb").await.unwrap();
        assert_eq!(controllers, vec!["0", "1"]);

        let ports = store.list("/domain/4/device/usb/0/port").await.unwrap();
        assert_eq!(ports, vec!["1", "2"]);

        assert!(store.list("/domain/9").await.unwrap().is_empty());
    }
}

//! Subscription records and their persistence.
//!
//! A subscription says: "when `action` is published here, notify `receiver`
//! on the peer reachable at `address`". Records are never mutated; creating
//! an exact duplicate is a no-op.

use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Subscription {
    pub address: String,
    pub action: String,
    pub receiver: String,
}

impl Subscription {
    pub fn new(
        address: impl Into<String>,
        action: impl Into<String>,
        receiver: impl Into<String>,
    ) -> Self {
        Self {
            address: address.into(),
            action: action.into(),
            receiver: receiver.into(),
        }
    }
}

/// A stored subscription together with its store-assigned identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionRecord {
    pub id: u64,
    #[serde(flatten)]
    pub subscription: Subscription,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateOutcome {
    Created(u64),
    AlreadyExists(u64),
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("subscription store io '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("subscription store '{path}' is corrupt: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

#[async_trait]
pub trait SubscriptionStore: Send + Sync + 'static {
    async fn find_by_action(&self, action: &str) -> Result<Vec<SubscriptionRecord>, StoreError>;

    /// Idempotent: an identical subscription returns the existing record's id.
    async fn create(&self, subscription: Subscription) -> Result<CreateOutcome, StoreError>;

    async fn list(&self) -> Result<Vec<SubscriptionRecord>, StoreError>;
}

#[derive(Debug, Default)]
struct Records {
    next_id: u64,
    records: Vec<SubscriptionRecord>,
}

impl Records {
    fn from_records(records: Vec<SubscriptionRecord>) -> Self {
        let next_id = records.iter().map(|r| r.id).max().unwrap_or(0);
        Self { next_id, records }
    }

    fn insert(&mut self, subscription: Subscription) -> CreateOutcome {
        if let Some(existing) = self
            .records
            .iter()
            .find(|r| r.subscription == subscription)
        {
            return CreateOutcome::AlreadyExists(existing.id);
        }
        self.next_id += 1;
        self.records.push(SubscriptionRecord {
            id: self.next_id,
            subscription,
        });
        CreateOutcome::Created(self.next_id)
    }

    fn by_action(&self, action: &str) -> Vec<SubscriptionRecord> {
        self.records
            .iter()
            .filter(|r| r.subscription.action == action)
            .cloned()
            .collect()
    }
}

/// Process-lifetime store.
#[derive(Debug, Default)]
pub struct MemorySubscriptionStore {
    inner: Mutex<Records>,
}

impl MemorySubscriptionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SubscriptionStore for MemorySubscriptionStore {
    async fn find_by_action(&self, action: &str) -> Result<Vec<SubscriptionRecord>, StoreError> {
        Ok(self
            .inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .by_action(action))
    }

    async fn create(&self, subscription: Subscription) -> Result<CreateOutcome, StoreError> {
        Ok(self
            .inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(subscription))
    }

    async fn list(&self) -> Result<Vec<SubscriptionRecord>, StoreError> {
        Ok(self
            .inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .records
            .clone())
    }
}

/// JSON file backed store. The whole file is rewritten (temp file + rename)
/// after every new subscription.
#[derive(Debug)]
pub struct FileSubscriptionStore {
    path: PathBuf,
    inner: tokio::sync::Mutex<Records>,
}

impl FileSubscriptionStore {
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let records = match tokio::fs::read(&path).await {
            Ok(bytes) if bytes.iter().all(u8::is_ascii_whitespace) => Vec::new(),
            Ok(bytes) => {
                serde_json::from_slice(&bytes).map_err(|source| StoreError::Corrupt {
                    path: path.clone(),
                    source,
                })?
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(source) => return Err(StoreError::Io { path, source }),
        };
        debug!(
            target: "peer::subscriptions",
            "loaded {} subscriptions from '{}'",
            records.len(),
            path.display()
        );
        Ok(Self {
            path,
            inner: tokio::sync::Mutex::new(Records::from_records(records)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn persist(&self, records: &[SubscriptionRecord]) -> Result<(), StoreError> {
        let io_err = |source| StoreError::Io {
            path: self.path.clone(),
            source,
        };
        let json = serde_json::to_vec_pretty(records).map_err(|source| StoreError::Corrupt {
            path: self.path.clone(),
            source,
        })?;
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await.map_err(io_err)?;
        }
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json).await.map_err(io_err)?;
        tokio::fs::rename(&tmp, &self.path).await.map_err(io_err)?;
        Ok(())
    }
}

#[async_trait]
impl SubscriptionStore for FileSubscriptionStore {
    async fn find_by_action(&self, action: &str) -> Result<Vec<SubscriptionRecord>, StoreError> {
        Ok(self.inner.lock().await.by_action(action))
    }

    async fn create(&self, subscription: Subscription) -> Result<CreateOutcome, StoreError> {
        let mut inner = self.inner.lock().await;
        let outcome = inner.insert(subscription);
        if let CreateOutcome::Created(id) = outcome {
            if let Err(e) = self.persist(&inner.records).await {
                // Keep memory and disk in agreement.
                inner.records.retain(|r| r.id != id);
                return Err(e);
            }
        }
        Ok(outcome)
    }

    async fn list(&self) -> Result<Vec<SubscriptionRecord>, StoreError> {
        Ok(self.inner.lock().await.records.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sub(address: &str) -> Subscription {
        Subscription::new(address, "test", "inbox")
    }

    #[tokio::test]
    async fn identical_subscription_is_stored_once() {
        let store = MemorySubscriptionStore::new();
        let first = store.create(sub("10.0.0.1:5243")).await.unwrap();
        let second = store.create(sub("10.0.0.1:5243")).await.unwrap();

        assert_eq!(first, CreateOutcome::Created(1));
        assert_eq!(second, CreateOutcome::AlreadyExists(1));
        assert_eq!(store.list().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn find_filters_by_action() {
        let store = MemorySubscriptionStore::new();
        store.create(sub("a:1")).await.unwrap();
        store.create(sub("b:1")).await.unwrap();
        store
            .create(Subscription::new("a:1", "other", "inbox"))
            .await
            .unwrap();

        let found = store.find_by_action("test").await.unwrap();
        let addresses: Vec<_> = found.iter().map(|r| r.subscription.address.as_str()).collect();
        assert_eq!(addresses, ["a:1", "b:1"]);
    }

    #[tokio::test]
    async fn file_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data/subscriptions.json");

        let store = FileSubscriptionStore::open(&path).await.unwrap();
        store.create(sub("a:1")).await.unwrap();
        store.create(sub("b:1")).await.unwrap();
        store.create(sub("a:1")).await.unwrap();
        drop(store);

        let reopened = FileSubscriptionStore::open(&path).await.unwrap();
        assert_eq!(reopened.list().await.unwrap().len(), 2);
        assert_eq!(
            reopened.create(sub("c:1")).await.unwrap(),
            CreateOutcome::Created(3)
        );
    }

    #[tokio::test]
    async fn corrupt_file_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("subscriptions.json");
        std::fs::write(&path, b"{ not json").unwrap();
        assert!(matches!(
            FileSubscriptionStore::open(&path).await,
            Err(StoreError::Corrupt { .. })
        ));
    }
}

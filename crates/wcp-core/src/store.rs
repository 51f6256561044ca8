//! Persistence for sequence tables.
//!
//! The embedder supplies any async key-value store; [`MemoryKvStore`] covers
//! tests and ephemeral clients. [`SequenceStore`] layers the protocol's
//! storage layout on top: one key per (kind, table), holding the canonical
//! JSON list of records. Tables are written whole and flushed before the
//! corresponding event is emitted, so an observer that reads storage after
//! seeing an event sees the update.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};
use tokio::sync::RwLock;

use crate::error::ClientError;
use crate::types::SequenceKind;

/// Default context segment of storage keys.
pub const DEFAULT_CONTEXT: &str = "client";

/// Storage-layout version prefix.
const STORAGE_PREFIX: &str = "wc@2";

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("storage operation failed: {0}")]
    OperationFailed(String),

    #[error("stored data is corrupt: {0}")]
    Corrupt(String),
}

impl From<StoreError> for ClientError {
    fn from(e: StoreError) -> Self {
        ClientError::Storage(e.to_string())
    }
}

/// Async key-value storage the embedder provides.
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;

    async fn set(&self, key: &str, value: Vec<u8>) -> Result<(), StoreError>;

    async fn del(&self, key: &str) -> Result<(), StoreError>;

    async fn keys(&self, prefix: &str) -> Result<Vec<String>, StoreError>;
}

/// In-memory store for tests and ephemeral clients.
#[derive(Default)]
pub struct MemoryKvStore {
    entries: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn new_shared() -> Arc<Self> {
        Arc::new(Self::new())
    }
}

#[async_trait]
impl KvStore for MemoryKvStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.entries.read().await.get(key).cloned())
    }

    async fn set(&self, key: &str, value: Vec<u8>) -> Result<(), StoreError> {
        self.entries.write().await.insert(key.to_owned(), value);
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<(), StoreError> {
        self.entries.write().await.remove(key);
        Ok(())
    }

    async fn keys(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        Ok(self
            .entries
            .read()
            .await
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }
}

/// Which table a write addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Table {
    Settled,
    Pending,
}

impl Table {
    fn as_str(self) -> &'static str {
        match self {
            Table::Settled => "settled",
            Table::Pending => "pending",
        }
    }
}

/// Typed persistence of sequence tables over a [`KvStore`].
#[derive(Clone)]
pub struct SequenceStore {
    kv: Arc<dyn KvStore>,
    context: String,
}

impl SequenceStore {
    pub fn new(kv: Arc<dyn KvStore>, override_context: Option<String>) -> Self {
        Self {
            kv,
            context: override_context.unwrap_or_else(|| DEFAULT_CONTEXT.to_owned()),
        }
    }

    /// `wc@2:{context}//{kind}:{table}`
    pub fn key(&self, kind: SequenceKind, table: Table) -> String {
        format!(
            "{STORAGE_PREFIX}:{}//{}:{}",
            self.context,
            kind.as_str(),
            table.as_str()
        )
    }

    /// Overwrite one table with the given record list.
    pub async fn save<T: Serialize>(
        &self,
        kind: SequenceKind,
        table: Table,
        records: &[T],
    ) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec(records)
            .map_err(|e| StoreError::OperationFailed(e.to_string()))?;
        self.kv.set(&self.key(kind, table), bytes).await
    }

    /// Load one table; a missing key is an empty table.
    pub async fn load<T: DeserializeOwned>(
        &self,
        kind: SequenceKind,
        table: Table,
    ) -> Result<Vec<T>, StoreError> {
        match self.kv.get(&self.key(kind, table)).await? {
            Some(bytes) => {
                serde_json::from_slice(&bytes).map_err(|e| StoreError::Corrupt(e.to_string()))
            }
            None => Ok(Vec::new()),
        }
    }
}

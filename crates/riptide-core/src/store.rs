//! Persistence bridge for detached sessions.
//!
//! When a session detaches, the manager snapshots it into a
//! [`SessionRecord`] and hands the serialized bytes to a [`SessionStore`].
//! If the process dies (or the registry evicts the session) before the
//! client returns, the record is enough to rebuild a session with the same
//! id, route, kv data and sequence counter — the client then receives a
//! full resync instead of a replay.

use std::collections::HashMap;
use std::net::IpAddr;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::frame::Seq;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store backend error: {0}")]
    Backend(String),
    #[error("corrupt session record: {0}")]
    Corrupt(String),
}

/// Everything needed to rebuild a session after an outage. The replay
/// buffer is deliberately not persisted; restore always resyncs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRecord {
    pub id: String,
    pub user_id: String,
    pub ip: IpAddr,
    pub route: String,
    pub created_at: u64,
    pub last_active: u64,
    #[serde(default)]
    pub detached_at: u64,
    pub last_seq: Seq,
    #[serde(default)]
    pub data: HashMap<String, serde_json::Value>,
}

impl SessionRecord {
    pub fn to_bytes(&self) -> Result<Bytes, StoreError> {
        serde_json::to_vec(self)
            .map(Bytes::from)
            .map_err(|err| StoreError::Corrupt(err.to_string()))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, StoreError> {
        serde_json::from_slice(bytes).map_err(|err| StoreError::Corrupt(err.to_string()))
    }
}

/// Plaintext metadata handed to the adapter next to the opaque record so it
/// can keep its own TTL/LRU bookkeeping without parsing the payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreMeta {
    pub id: String,
    pub user_id: String,
    pub ip: IpAddr,
    pub created_at: u64,
    pub last_active: u64,
}

#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn save(&self, id: &str, record: Bytes, meta: &StoreMeta) -> Result<(), StoreError>;
    async fn load(&self, id: &str) -> Result<Option<Bytes>, StoreError>;
    async fn remove(&self, id: &str) -> Result<(), StoreError>;
}

struct StoredEntry {
    record: Bytes,
    last_active: u64,
}

/// Capacity-bounded in-memory adapter. Single-process deployments and tests
/// use this; production gateways plug in a shared backend instead.
pub struct MemorySessionStore {
    capacity: usize,
    entries: Mutex<HashMap<String, StoredEntry>>,
}

impl MemorySessionStore {
    pub fn new(capacity: usize) -> Self {
        Self { capacity: capacity.max(1), entries: Mutex::new(HashMap::new()) }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn save(&self, id: &str, record: Bytes, meta: &StoreMeta) -> Result<(), StoreError> {
        let mut entries = self.entries.lock();
        entries.insert(id.to_string(), StoredEntry { record, last_active: meta.last_active });
        while entries.len() > self.capacity {
            let stalest = entries
                .iter()
                .min_by_key(|(_, entry)| entry.last_active)
                .map(|(key, _)| key.clone());
            match stalest {
                Some(key) => {
                    entries.remove(&key);
                }
                None => break,
            }
        }
        Ok(())
    }

    async fn load(&self, id: &str) -> Result<Option<Bytes>, StoreError> {
        Ok(self.entries.lock().get(id).map(|entry| entry.record.clone()))
    }

    async fn remove(&self, id: &str) -> Result<(), StoreError> {
        self.entries.lock().remove(id);
        Ok(())
    }
}

//! Pluggable key-value storage used by the rate limiter
//!
//! Values are JSON documents. Values written with a TTL are wrapped as
//! `{ "data": ..., "expiresAt": <ms> }` and expired transparently on read.

pub mod memory;

pub use memory::MemoryStore;

use crate::error::StorageError;
use async_trait::async_trait;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;

/// TTL envelope stored by backends that lack native expiry
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TtlValue {
    pub data: Value,
    pub expires_at: i64,
}

impl TtlValue {
    pub fn is_expired(&self, now_ms: i64) -> bool {
        self.expires_at <= now_ms
    }
}

#[async_trait]
pub trait KeyValueStore: Send + Sync + 'static {
    /// Read a value; expired entries read as `None`
    async fn get(&self, key: &str) -> Result<Option<Value>, StorageError>;

    /// Write a value, optionally expiring after `ttl_seconds`
    async fn set(&self, key: &str, value: Value, ttl_seconds: Option<u64>) -> Result<(), StorageError>;

    async fn delete(&self, key: &str) -> Result<(), StorageError>;

    /// Add one to an integer counter, creating it at 1; the TTL applies on creation
    async fn increment(&self, key: &str, ttl_seconds: Option<u64>) -> Result<i64, StorageError>;

    /// List keys starting with `prefix` (used by the periodic sweep)
    async fn keys(&self, prefix: &str) -> Result<Vec<String>, StorageError>;
}

/// Typed helpers over the JSON contract
#[async_trait]
pub trait KeyValueStoreExt: KeyValueStore {
    async fn get_as<T: DeserializeOwned + Send>(&self, key: &str) -> Result<Option<T>, StorageError> {
        match self.get(key).await? {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }

    async fn set_as<T: Serialize + Sync>(
        &self,
        key: &str,
        value: &T,
        ttl_seconds: Option<u64>,
    ) -> Result<(), StorageError> {
        let value = serde_json::to_value(value)?;
        self.set(key, value, ttl_seconds).await
    }
}

impl<S: KeyValueStore + ?Sized> KeyValueStoreExt for S {}

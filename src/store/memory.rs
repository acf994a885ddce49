//! In-process store backed by DashMap

use super::{KeyValueStore, TtlValue};
use crate::clock::{Clock, SystemClock};
use crate::error::StorageError;
use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use std::sync::Arc;

#[derive(Debug, Clone)]
enum Slot {
    Plain(Value),
    Wrapped(TtlValue),
}

/// Single-process `KeyValueStore`
///
/// Expired entries are removed when they are read or listed.
pub struct MemoryStore {
    entries: DashMap<String, Slot>,
    clock: Arc<dyn Clock>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock::new()))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: DashMap::new(),
            clock,
        }
    }

    /// Number of stored entries, including expired ones not yet observed
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn wrap(&self, value: Value, ttl_seconds: Option<u64>) -> Slot {
        match ttl_seconds {
            Some(ttl) => Slot::Wrapped(TtlValue {
                data: value,
                expires_at: self.clock.now_ms() + (ttl as i64) * 1000,
            }),
            None => Slot::Plain(value),
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Value>, StorageError> {
        let now = self.clock.now_ms();

        let slot = match self.entries.get(key) {
            Some(entry) => entry.value().clone(),
            None => return Ok(None),
        };

        match slot {
            Slot::Plain(value) => Ok(Some(value)),
            Slot::Wrapped(wrapped) if wrapped.is_expired(now) => {
                self.entries
                    .remove_if(key, |_, slot| matches!(slot, Slot::Wrapped(w) if w.is_expired(now)));
                Ok(None)
            }
            Slot::Wrapped(wrapped) => Ok(Some(wrapped.data)),
        }
    }

    async fn set(&self, key: &str, value: Value, ttl_seconds: Option<u64>) -> Result<(), StorageError> {
        let slot = self.wrap(value, ttl_seconds);
        self.entries.insert(key.to_string(), slot);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        self.entries.remove(key);
        Ok(())
    }

    async fn increment(&self, key: &str, ttl_seconds: Option<u64>) -> Result<i64, StorageError> {
        let now = self.clock.now_ms();
        let fresh = self.wrap(Value::from(0), ttl_seconds);

        let mut entry = self.entries.entry(key.to_string()).or_insert_with(|| fresh.clone());
        let expired = matches!(entry.value(), Slot::Wrapped(w) if w.is_expired(now));
        if expired {
            *entry.value_mut() = fresh;
        }

        let current = match entry.value() {
            Slot::Plain(v) => v,
            Slot::Wrapped(w) => &w.data,
        };
        let next = current
            .as_i64()
            .ok_or_else(|| StorageError::Backend(format!("value at '{}' is not an integer", key)))?
            + 1;

        match entry.value_mut() {
            Slot::Plain(v) => *v = Value::from(next),
            Slot::Wrapped(w) => w.data = Value::from(next),
        }

        Ok(next)
    }

    async fn keys(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        let now = self.clock.now_ms();
        self.entries
            .retain(|_, slot| !matches!(slot, Slot::Wrapped(w) if w.is_expired(now)));

        Ok(self
            .entries
            .iter()
            .filter(|entry| entry.key().starts_with(prefix))
            .map(|entry| entry.key().clone())
            .collect())
    }
}

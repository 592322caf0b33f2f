//! Key-value backend with TTLs and atomic conditional writes.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::Instant;

/// Errors raised by key-value backends.
#[derive(Debug, Error)]
pub enum KeyValueError {
    /// Backend could not be reached or rejected the operation.
    #[error("key-value backend unavailable: {0}")]
    Unavailable(String),
}

/// Minimal KV contract used for locks and job status records.
///
/// Conditional operations must be atomic with respect to each other.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Read a live value.
    async fn get(&self, key: &str) -> Result<Option<String>, KeyValueError>;

    /// Write unconditionally.
    async fn set(&self, key: &str, value: String, ttl: Option<Duration>) -> Result<(), KeyValueError>;

    /// Write only when no live value exists. Returns whether the write happened.
    async fn set_if_absent(
        &self,
        key: &str,
        value: String,
        ttl: Option<Duration>,
    ) -> Result<bool, KeyValueError>;

    /// Write only when the live value equals `expected` (`None` meaning absent).
    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&str>,
        value: String,
        ttl: Option<Duration>,
    ) -> Result<bool, KeyValueError>;

    /// Delete only when the live value equals `expected`.
    async fn compare_and_delete(&self, key: &str, expected: &str) -> Result<bool, KeyValueError>;

    /// Delete unconditionally. Returns whether a live value was removed.
    async fn delete(&self, key: &str) -> Result<bool, KeyValueError>;

    /// Check backend availability.
    async fn ping(&self) -> Result<(), KeyValueError> {
        Ok(())
    }
}

struct Slot {
    value: String,
    expires_at: Option<Instant>,
}

impl Slot {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.is_none_or(|deadline| deadline > now)
    }
}

/// How often writes sweep out expired keys that were never read again.
const SWEEP_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Default)]
struct Slots {
    map: HashMap<String, Slot>,
    next_sweep: Option<Instant>,
}

impl Slots {
    fn live(&mut self, key: &str) -> Option<&Slot> {
        let now = Instant::now();
        if self.map.get(key).is_some_and(|slot| !slot.is_live(now)) {
            self.map.remove(key);
        }
        self.map.get(key)
    }

    fn write(&mut self, key: &str, value: String, ttl: Option<Duration>) {
        let now = Instant::now();
        if self.next_sweep.is_none_or(|due| due <= now) {
            self.map.retain(|_, slot| slot.is_live(now));
            self.next_sweep = Some(now + SWEEP_INTERVAL);
        }
        let slot = Slot {
            value,
            expires_at: ttl.map(|ttl| now + ttl),
        };
        self.map.insert(key.to_string(), slot);
    }
}

/// Process-local [`KeyValueStore`].
///
/// Expired keys are dropped when read, and writes periodically sweep the rest.
#[derive(Default)]
pub struct InMemoryKeyValueStore {
    slots: Mutex<Slots>,
}

impl InMemoryKeyValueStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(test)]
    async fn slot_count(&self) -> usize {
        self.slots.lock().await.map.len()
    }
}

#[async_trait]
impl KeyValueStore for InMemoryKeyValueStore {
    async fn get(&self, key: &str) -> Result<Option<String>, KeyValueError> {
        let mut slots = self.slots.lock().await;
        Ok(slots.live(key).map(|slot| slot.value.clone()))
    }

    async fn set(&self, key: &str, value: String, ttl: Option<Duration>) -> Result<(), KeyValueError> {
        self.slots.lock().await.write(key, value, ttl);
        Ok(())
    }

    async fn set_if_absent(
        &self,
        key: &str,
        value: String,
        ttl: Option<Duration>,
    ) -> Result<bool, KeyValueError> {
        let mut slots = self.slots.lock().await;
        if slots.live(key).is_some() {
            return Ok(false);
        }
        slots.write(key, value, ttl);
        Ok(true)
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&str>,
        value: String,
        ttl: Option<Duration>,
    ) -> Result<bool, KeyValueError> {
        let mut slots = self.slots.lock().await;
        let current = slots.live(key).map(|slot| slot.value.as_str());
        if current != expected {
            return Ok(false);
        }
        slots.write(key, value, ttl);
        Ok(true)
    }

    async fn compare_and_delete(&self, key: &str, expected: &str) -> Result<bool, KeyValueError> {
        let mut slots = self.slots.lock().await;
        if slots.live(key).is_some_and(|slot| slot.value == expected) {
            slots.map.remove(key);
            return Ok(true);
        }
        Ok(false)
    }

    async fn delete(&self, key: &str) -> Result<bool, KeyValueError> {
        let mut slots = self.slots.lock().await;
        let existed = slots.live(key).is_some();
        slots.map.remove(key);
        Ok(existed)
    }
}

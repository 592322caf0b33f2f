//! Per-key exclusive locks with self-expiry.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use uuid::Uuid;

use super::kv::{KeyValueError, KeyValueStore};

const LOCK_PREFIX: &str = "lock:";
const MAX_BACKOFF: Duration = Duration::from_secs(5);

/// Errors raised by [`DistributedMutex`].
#[derive(Debug, Error)]
pub enum LockError {
    /// Another holder owns the lock.
    #[error("lock '{key}' is held by another worker")]
    Busy {
        /// Contended key.
        key: String,
    },
    /// The lock expired (and may have been taken by someone else) before release.
    #[error("lock '{key}' expired before release")]
    AlreadyExpired {
        /// Released key.
        key: String,
    },
    /// Backend failure.
    #[error(transparent)]
    Backend(#[from] KeyValueError),
}

/// Proof of ownership returned by [`DistributedMutex::acquire`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockToken {
    key: String,
    holder: String,
}

impl LockToken {
    /// Locked key.
    pub fn key(&self) -> &str {
        &self.key
    }
}

/// Exclusive lock over the KV backend.
///
/// Acquisition is an atomic set-if-absent of a random holder token; release is a
/// compare-and-delete on that token, so an expired holder can never release a successor's lock.
#[derive(Clone)]
pub struct DistributedMutex {
    kv: Arc<dyn KeyValueStore>,
}

impl DistributedMutex {
    /// Locks backed by `kv`.
    pub fn new(kv: Arc<dyn KeyValueStore>) -> Self {
        Self { kv }
    }

    /// Try once to take `key` for `ttl`.
    pub async fn acquire(&self, key: &str, ttl: Duration) -> Result<LockToken, LockError> {
        let holder = Uuid::new_v4().to_string();
        let storage_key = format!("{LOCK_PREFIX}{key}");
        if self
            .kv
            .set_if_absent(&storage_key, holder.clone(), Some(ttl))
            .await?
        {
            tracing::debug!(key, ttl_secs = ttl.as_secs(), "Lock acquired");
            Ok(LockToken {
                key: key.to_string(),
                holder,
            })
        } else {
            Err(LockError::Busy {
                key: key.to_string(),
            })
        }
    }

    /// Take `key`, retrying up to `attempts` times with exponential backoff.
    pub async fn acquire_with_retry(
        &self,
        key: &str,
        ttl: Duration,
        attempts: u32,
        backoff: Duration,
    ) -> Result<LockToken, LockError> {
        let mut delay = backoff;
        let mut attempt = 1;
        loop {
            match self.acquire(key, ttl).await {
                Err(LockError::Busy { .. }) if attempt < attempts => {
                    tracing::trace!(key, attempt, delay_ms = delay.as_millis() as u64, "Lock busy");
                    tokio::time::sleep(delay).await;
                    delay = (delay * 2).min(MAX_BACKOFF);
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    /// Release a lock previously returned by [`Self::acquire`].
    pub async fn release(&self, token: &LockToken) -> Result<(), LockError> {
        let storage_key = format!("{LOCK_PREFIX}{}", token.key);
        if self.kv.compare_and_delete(&storage_key, &token.holder).await? {
            tracing::debug!(key = %token.key, "Lock released");
            Ok(())
        } else {
            Err(LockError::AlreadyExpired {
                key: token.key.clone(),
            })
        }
    }

    /// Take `key` once and hold it in a guard that releases it when dropped.
    pub async fn lock(&self, key: &str, ttl: Duration) -> Result<LockGuard, LockError> {
        let token = self.acquire(key, ttl).await?;
        Ok(LockGuard {
            mutex: self.clone(),
            token: Some(token),
        })
    }

    /// Whether any holder currently owns `key`.
    pub async fn is_locked(&self, key: &str) -> Result<bool, LockError> {
        Ok(self.kv.get(&format!("{LOCK_PREFIX}{key}")).await?.is_some())
    }
}

/// Held lock returned by [`DistributedMutex::lock`].
///
/// Prefer [`LockGuard::release`]. A guard dropped without it (an early return or an unwinding
/// panic) releases the lock from a spawned task on the current runtime.
pub struct LockGuard {
    mutex: DistributedMutex,
    token: Option<LockToken>,
}

impl LockGuard {
    /// Locked key.
    pub fn key(&self) -> &str {
        self.token.as_ref().map_or("", LockToken::key)
    }

    /// Release the lock now.
    pub async fn release(mut self) -> Result<(), LockError> {
        match self.token.take() {
            Some(token) => self.mutex.release(&token).await,
            None => Ok(()),
        }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        let Some(token) = self.token.take() else {
            return;
        };
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::warn!(key = %token.key, "Lock dropped outside a runtime; it will expire");
            return;
        };
        let mutex = self.mutex.clone();
        runtime.spawn(async move {
            match mutex.release(&token).await {
                Ok(()) => tracing::debug!(key = %token.key, "Dropped lock released"),
                Err(error) => {
                    tracing::warn!(key = %token.key, error = %error, "Dropped lock release failed")
                }
            }
        });
    }
}

use std::{collections::HashMap, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::Mutex;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum LockError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("lock service unavailable: {0}")]
    Unavailable(String),
}

/// A held lock. Only the holder of the token may release it.
#[derive(Debug, Clone, PartialEq)]
pub struct Lease {
    pub key: String,
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

impl Lease {
    /// TTLs past the representable range saturate at the latest instant.
    pub fn new(key: &str, ttl: Duration) -> Self {
        let now = Utc::now();
        let expires_at = chrono::Duration::from_std(ttl)
            .ok()
            .and_then(|ttl| now.checked_add_signed(ttl))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);

        Self {
            key: key.to_string(),
            token: Uuid::new_v4().to_string(),
            expires_at,
        }
    }
}

/// Lease-based mutual exclusion shared by every service instance.
#[async_trait]
pub trait LeaseLock: Send + Sync {
    /// `None` means someone else holds the key.
    async fn try_acquire(&self, key: &str, ttl: Duration) -> Result<Option<Lease>, LockError>;

    /// Returns false when the lease had already expired or been taken over.
    async fn release(&self, lease: &Lease) -> Result<bool, LockError>;

    async fn health_check(&self) -> Result<(), LockError>;
}

pub fn task_lock_key(tenant: &str, task: &str) -> String {
    format!("lock:{}:{}", tenant, task)
}

/// Single-process lock, for tests and `STORE_BACKEND=memory` runs.
#[derive(Debug, Default)]
pub struct InMemoryLock {
    held: Mutex<HashMap<String, Lease>>,
}

impl InMemoryLock {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LeaseLock for InMemoryLock {
    async fn try_acquire(&self, key: &str, ttl: Duration) -> Result<Option<Lease>, LockError> {
        let mut held = self.held.lock().await;

        if held
            .get(key)
            .is_some_and(|current| current.expires_at > Utc::now())
        {
            return Ok(None);
        }

        let lease = Lease::new(key, ttl);
        held.insert(key.to_string(), lease.clone());
        Ok(Some(lease))
    }

    async fn release(&self, lease: &Lease) -> Result<bool, LockError> {
        let mut held = self.held.lock().await;

        match held.get(&lease.key) {
            Some(current) if current.token == lease.token => {
                held.remove(&lease.key);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn health_check(&self) -> Result<(), LockError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn second_acquire_is_refused_until_release() {
        let lock = InMemoryLock::new();
        let key = task_lock_key("project-a", "dispatch");

        let lease = lock
            .try_acquire(&key, Duration::from_secs(60))
            .await
            .unwrap()
            .unwrap();
        assert!(lock.try_acquire(&key, Duration::from_secs(60)).await.unwrap().is_none());

        assert!(lock.release(&lease).await.unwrap());
        assert!(lock.try_acquire(&key, Duration::from_secs(60)).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn expired_lease_can_be_taken_over_and_old_holder_cannot_release() {
        let lock = InMemoryLock::new();

        let stale = lock
            .try_acquire("lock:t:match", Duration::from_millis(1))
            .await
            .unwrap()
            .unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        let fresh = lock
            .try_acquire("lock:t:match", Duration::from_secs(60))
            .await
            .unwrap();
        assert!(fresh.is_some());
        assert!(!lock.release(&stale).await.unwrap());
    }

    #[test]
    fn oversized_ttl_saturates_instead_of_overflowing() {
        let unbounded = Lease::new("lock:t:dispatch", Duration::MAX);
        assert_eq!(unbounded.expires_at, DateTime::<Utc>::MAX_UTC);

        // Fits a chrono duration but not a date.
        let far = Lease::new("lock:t:dispatch", Duration::from_secs(10u64.pow(15)));
        assert_eq!(far.expires_at, DateTime::<Utc>::MAX_UTC);

        let short = Lease::new("lock:t:dispatch", Duration::from_secs(60));
        assert!(short.expires_at < DateTime::<Utc>::MAX_UTC);
    }

    #[tokio::test]
    async fn held_forever_lease_blocks_others() {
        let lock = InMemoryLock::new();

        assert!(lock.try_acquire("lock:t:match", Duration::MAX).await.unwrap().is_some());
        assert!(lock.try_acquire("lock:t:match", Duration::from_secs(1)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn keys_are_independent() {
        let lock = InMemoryLock::new();
        let ttl = Duration::from_secs(60);

        assert!(lock.try_acquire("lock:t:match", ttl).await.unwrap().is_some());
        assert!(lock.try_acquire("lock:t:dispatch", ttl).await.unwrap().is_some());
        assert!(lock.try_acquire("lock:u:match", ttl).await.unwrap().is_some());
    }
}

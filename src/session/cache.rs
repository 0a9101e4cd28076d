//! Cache provider abstraction for the distributed session mirror.

use async_trait::async_trait;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::Mutex;

use super::Session;

/// Errors from the cache side of the session store.
#[derive(Debug, Error)]
pub enum CacheError {
    /// The cache backend could not be reached or rejected the operation.
    #[error("session cache unavailable")]
    Unavailable(#[source] anyhow::Error),

    /// The per-call timeout elapsed before the backend answered.
    #[error("session cache operation timed out")]
    Timeout,

    /// A cached record could not be encoded or decoded.
    #[error("session cache serialization failed")]
    Serialization(#[from] serde_json::Error),
}

pub type CacheResult<T> = Result<T, CacheError>;

/// Session mirror operations.
///
/// Implementations must be safe for concurrent use; entries expire after the
/// TTL given at write time, which is how cache staleness is bounded.
#[async_trait]
pub trait SessionCache: Send + Sync {
    /// Stores or replaces the mirror for a session.
    async fn put(&self, session: &Session, ttl: Duration) -> CacheResult<()>;

    /// Fetches a mirrored session, `None` on miss or expiry.
    async fn get(&self, session_id: &str) -> CacheResult<Option<Session>>;

    /// Removes a mirror; succeeds even when the key is absent.
    async fn delete(&self, session_id: &str) -> CacheResult<()>;

    /// Cheap reachability probe for health reporting.
    async fn ping(&self) -> CacheResult<()>;
}

/// Process-local cache used for single-node deployments and tests.
///
/// Holds the same mirror semantics as the distributed backend, including
/// TTL-bounded entries, so dev-mode behavior matches production shape.
#[derive(Debug, Default)]
pub struct InMemorySessionCache {
    entries: Mutex<HashMap<String, (Session, Instant)>>,
}

impl InMemorySessionCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionCache for InMemorySessionCache {
    async fn put(&self, session: &Session, ttl: Duration) -> CacheResult<()> {
        let deadline = Instant::now() + ttl;
        let mut entries = self.entries.lock().await;
        entries.retain(|_, (_, expires)| *expires > Instant::now());
        entries.insert(session.session_id.clone(), (session.clone(), deadline));
        Ok(())
    }

    async fn get(&self, session_id: &str) -> CacheResult<Option<Session>> {
        let mut entries = self.entries.lock().await;
        match entries.get(session_id) {
            Some((session, expires)) if *expires > Instant::now() => {
                return Ok(Some(session.clone()))
            }
            Some(_) => {}
            None => return Ok(None),
        }
        entries.remove(session_id);
        Ok(None)
    }

    async fn delete(&self, session_id: &str) -> CacheResult<()> {
        self.entries.lock().await.remove(session_id);
        Ok(())
    }

    async fn ping(&self) -> CacheResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration as ChronoDuration, Utc};
    use uuid::Uuid;

    fn sample(id: &str) -> Session {
        let now = Utc::now();
        Session {
            session_id: id.to_string(),
            user_id: Uuid::new_v4(),
            created_at: now,
            last_used_at: now,
            expires_at: now + ChronoDuration::hours(1),
            client_ip: Some("192.0.2.1".to_string()),
            user_agent: None,
            roles: vec!["member".to_string()],
        }
    }

    #[tokio::test]
    async fn put_get_delete_round_trip() {
        let cache = InMemorySessionCache::new();
        let session = sample("s1");

        cache
            .put(&session, Duration::from_secs(30))
            .await
            .expect("put");
        let fetched = cache.get("s1").await.expect("get");
        assert_eq!(fetched, Some(session));

        cache.delete("s1").await.expect("delete");
        assert_eq!(cache.get("s1").await.expect("get"), None);

        // Deleting an absent key is not an error.
        cache.delete("s1").await.expect("idempotent delete");
    }

    #[tokio::test]
    async fn entries_expire_after_ttl() {
        let cache = InMemorySessionCache::new();
        cache
            .put(&sample("s1"), Duration::from_millis(10))
            .await
            .expect("put");

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(cache.get("s1").await.expect("get"), None);
    }
}

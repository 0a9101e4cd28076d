//! Session lifecycle across the relational store and the distributed cache.
//!
//! The relational store is authoritative; the cache is a read-preferred
//! mirror that may transiently diverge. All lifecycle mutation goes through
//! [`store::SessionStore`]; nothing else writes session state.

pub mod cache;
pub mod postgres;
pub mod redis;
pub mod store;

pub use cache::{CacheError, CacheResult, InMemorySessionCache, SessionCache};
pub use postgres::PgSessionRepository;
pub use redis::{RedisConfig, RedisSessionCache};
pub use store::{CreatedSession, InsertOutcome, Invalidated, SessionRepository, SessionStore};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

const DEFAULT_SESSION_TTL_SECONDS: i64 = 12 * 60 * 60;
const DEFAULT_CACHE_TTL_SECONDS: i64 = 60;

/// One authenticated browser/client interaction.
///
/// `roles` are the owner's legacy role flags as read from the relational
/// store; translating them into scopes is resolver policy, not session state.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Session {
    pub session_id: String,
    pub user_id: Uuid,
    pub created_at: DateTime<Utc>,
    pub last_used_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub client_ip: Option<String>,
    pub user_agent: Option<String>,
    pub roles: Vec<String>,
}

impl Session {
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    /// Seconds of life left at `now`; zero once expired.
    #[must_use]
    pub fn remaining_seconds(&self, now: DateTime<Utc>) -> i64 {
        (self.expires_at - now).num_seconds().max(0)
    }
}

/// Lifecycle policy shared by every store operation.
#[derive(Debug, Clone)]
pub struct SessionPolicy {
    session_ttl_seconds: i64,
    sliding: bool,
    cache_ttl_seconds: i64,
    cache_write_fatal: bool,
}

impl Default for SessionPolicy {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionPolicy {
    #[must_use]
    pub fn new() -> Self {
        Self {
            session_ttl_seconds: DEFAULT_SESSION_TTL_SECONDS,
            sliding: false,
            cache_ttl_seconds: DEFAULT_CACHE_TTL_SECONDS,
            cache_write_fatal: false,
        }
    }

    #[must_use]
    pub fn with_session_ttl_seconds(mut self, seconds: i64) -> Self {
        self.session_ttl_seconds = seconds;
        self
    }

    #[must_use]
    pub fn with_sliding(mut self, sliding: bool) -> Self {
        self.sliding = sliding;
        self
    }

    #[must_use]
    pub fn with_cache_ttl_seconds(mut self, seconds: i64) -> Self {
        self.cache_ttl_seconds = seconds;
        self
    }

    #[must_use]
    pub fn with_cache_write_fatal(mut self, fatal: bool) -> Self {
        self.cache_write_fatal = fatal;
        self
    }

    #[must_use]
    pub fn session_ttl(&self) -> Duration {
        Duration::seconds(self.session_ttl_seconds)
    }

    #[must_use]
    pub fn session_ttl_seconds(&self) -> i64 {
        self.session_ttl_seconds
    }

    #[must_use]
    pub fn sliding(&self) -> bool {
        self.sliding
    }

    /// Upper bound on how long a cache mirror may outlive the truth in the
    /// relational store.
    #[must_use]
    pub fn cache_ttl_seconds(&self) -> i64 {
        self.cache_ttl_seconds
    }

    #[must_use]
    pub fn cache_write_fatal(&self) -> bool {
        self.cache_write_fatal
    }
}

/// Errors from session lifecycle operations.
///
/// Callers are expected to match: unknown sessions are terminal for the
/// request, creation failures may be retried whole, deletion failures need
/// operator reconciliation when partial.
#[derive(Debug, Error)]
pub enum SessionError {
    /// No live, unexpired session in either store.
    #[error("no live session found")]
    UserSessionUnknown,

    /// The durable write failed (or the owning user is unknown); no session
    /// exists anywhere.
    #[error("session creation failed")]
    CreationFailed(#[source] anyhow::Error),

    /// Deletion was attempted against both stores and at least one failed.
    #[error("session deletion failed (durable deleted: {durable_deleted}, cache deleted: {cache_deleted})")]
    DeletionFailed {
        durable_deleted: bool,
        cache_deleted: bool,
        #[source]
        source: anyhow::Error,
    },

    /// Both lookup paths failed; distinct from "not found".
    #[error("session lookup failed")]
    LookupFailed(#[source] anyhow::Error),
}

impl SessionError {
    #[must_use]
    pub fn is_unknown(&self) -> bool {
        matches!(self, Self::UserSessionUnknown)
    }

    /// True when exactly one store completed the deletion.
    #[must_use]
    pub fn is_partial_deletion(&self) -> bool {
        matches!(
            self,
            Self::DeletionFailed {
                durable_deleted,
                cache_deleted,
                ..
            } if durable_deleted != cache_deleted
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;

    fn session(expires_at: DateTime<Utc>) -> Session {
        Session {
            session_id: "sid".to_string(),
            user_id: Uuid::nil(),
            created_at: expires_at - Duration::hours(1),
            last_used_at: expires_at - Duration::hours(1),
            expires_at,
            client_ip: None,
            user_agent: None,
            roles: vec![],
        }
    }

    #[test]
    fn expiry_boundary_is_exclusive() {
        let now = Utc::now();
        assert!(session(now).is_expired(now));
        assert!(!session(now + Duration::seconds(1)).is_expired(now));
        assert!(session(now - Duration::seconds(1)).is_expired(now));
    }

    #[test]
    fn remaining_seconds_floors_at_zero() {
        let now = Utc::now();
        assert_eq!(session(now - Duration::hours(1)).remaining_seconds(now), 0);
        assert_eq!(
            session(now + Duration::seconds(90)).remaining_seconds(now),
            90
        );
    }

    #[test]
    fn policy_defaults_and_overrides() {
        let policy = SessionPolicy::new();
        assert_eq!(policy.session_ttl_seconds(), DEFAULT_SESSION_TTL_SECONDS);
        assert_eq!(policy.cache_ttl_seconds(), DEFAULT_CACHE_TTL_SECONDS);
        assert!(!policy.sliding());
        assert!(!policy.cache_write_fatal());

        let policy = policy
            .with_session_ttl_seconds(600)
            .with_sliding(true)
            .with_cache_ttl_seconds(5)
            .with_cache_write_fatal(true);
        assert_eq!(policy.session_ttl_seconds(), 600);
        assert_eq!(policy.cache_ttl_seconds(), 5);
        assert!(policy.sliding());
        assert!(policy.cache_write_fatal());
    }

    #[test]
    fn partial_deletion_is_distinguishable() {
        let partial = SessionError::DeletionFailed {
            durable_deleted: true,
            cache_deleted: false,
            source: anyhow!("cache unreachable"),
        };
        assert!(partial.is_partial_deletion());

        let total = SessionError::DeletionFailed {
            durable_deleted: false,
            cache_deleted: false,
            source: anyhow!("both stores unreachable"),
        };
        assert!(!total.is_partial_deletion());
        assert!(!SessionError::UserSessionUnknown.is_partial_deletion());
        assert!(SessionError::UserSessionUnknown.is_unknown());
    }
}

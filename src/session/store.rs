//! Dual-store session lifecycle protocol.
//!
//! The relational repository is the source of truth for "does this session
//! exist"; the cache is a read-preferred mirror whose entries carry a TTL
//! that bounds how long they may outlive the truth. A session is never
//! created in the cache alone, and the durable write always completes before
//! the mirror is attempted.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use base64ct::{Base64UrlUnpadded, Encoding};
use chrono::{DateTime, Utc};
use rand::{rngs::OsRng, RngCore};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, warn};
use uuid::Uuid;

use super::cache::SessionCache;
use super::{Session, SessionError, SessionPolicy};

const ID_GENERATION_ATTEMPTS: usize = 3;
const READ_RETRY_DELAY: Duration = Duration::from_millis(50);

/// Outcome of a durable insert attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    /// The generated identifier already exists; the caller regenerates.
    DuplicateId,
}

/// Authoritative session storage operations.
///
/// Implementations must make `insert` atomic: a timed-out call either
/// committed the row or left nothing behind, never a half-written session.
#[async_trait]
pub trait SessionRepository: Send + Sync {
    /// Role flags of an active user, `None` when no active user exists.
    async fn user_roles(&self, user_id: Uuid) -> Result<Option<Vec<String>>>;

    async fn insert(&self, session: &Session) -> Result<InsertOutcome>;

    /// Fetches a live, unexpired session and records the access.
    async fn fetch_live(&self, session_id: &str) -> Result<Option<Session>>;

    /// Deletes a session row; `false` when nothing was there.
    async fn delete(&self, session_id: &str) -> Result<bool>;

    /// Moves `expires_at` forward for a still-live session.
    async fn extend(&self, session_id: &str, expires_at: DateTime<Utc>) -> Result<bool>;

    /// Removes expired rows, returning how many were deleted.
    async fn purge_expired(&self) -> Result<u64>;
}

/// A freshly created session plus the state of its cache mirror.
///
/// `cache_mirrored == false` is the degraded-success condition: the session
/// is valid (the durable write committed) but services reading only the
/// cache will not see it until read-through repopulates the mirror.
#[derive(Debug)]
pub struct CreatedSession {
    pub session: Session,
    pub cache_mirrored: bool,
}

/// Result of an invalidation that reached both stores.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Invalidated {
    Removed,
    NotFound,
}

/// Session lifecycle across the relational store and the cache mirror.
pub struct SessionStore {
    repo: Arc<dyn SessionRepository>,
    cache: Arc<dyn SessionCache>,
    policy: SessionPolicy,
}

impl SessionStore {
    #[must_use]
    pub fn new(
        repo: Arc<dyn SessionRepository>,
        cache: Arc<dyn SessionCache>,
        policy: SessionPolicy,
    ) -> Self {
        Self {
            repo,
            cache,
            policy,
        }
    }

    #[must_use]
    pub fn policy(&self) -> &SessionPolicy {
        &self.policy
    }

    /// Creates a session: durable write first, then the cache mirror.
    ///
    /// A failed mirror write degrades the result rather than failing it,
    /// unless the policy marks cache writes fatal, in which case the durable
    /// row is compensated away before the error is returned.
    ///
    /// # Errors
    ///
    /// `SessionError::CreationFailed` when the durable write fails, the user
    /// is unknown or inactive, or a fatal-policy mirror write failed.
    pub async fn create(
        &self,
        user_id: Uuid,
        client_ip: Option<String>,
        user_agent: Option<String>,
    ) -> Result<CreatedSession, SessionError> {
        let roles = self
            .repo
            .user_roles(user_id)
            .await
            .map_err(SessionError::CreationFailed)?
            .ok_or_else(|| {
                SessionError::CreationFailed(anyhow!("unknown or inactive user: {user_id}"))
            })?;

        let now = Utc::now();
        let mut session = Session {
            session_id: String::new(),
            user_id,
            created_at: now,
            last_used_at: now,
            expires_at: now + self.policy.session_ttl(),
            client_ip,
            user_agent,
            roles,
        };

        // Regenerate on identifier collision rather than failing the login.
        let mut inserted = false;
        for _ in 0..ID_GENERATION_ATTEMPTS {
            session.session_id = generate_session_id().map_err(SessionError::CreationFailed)?;
            match self
                .repo
                .insert(&session)
                .await
                .map_err(SessionError::CreationFailed)?
            {
                InsertOutcome::Inserted => {
                    inserted = true;
                    break;
                }
                InsertOutcome::DuplicateId => {}
            }
        }
        if !inserted {
            return Err(SessionError::CreationFailed(anyhow!(
                "failed to generate a unique session id"
            )));
        }

        let cache_mirrored = match self
            .cache
            .put(&session, self.mirror_ttl(&session, now))
            .await
        {
            Ok(()) => true,
            Err(err) => {
                if self.policy.cache_write_fatal() {
                    // Compensate so no session exists that the caller was
                    // told failed; best effort, the row expires regardless.
                    if let Err(delete_err) = self.repo.delete(&session.session_id).await {
                        error!(
                            session_id = %session.session_id,
                            error = %delete_err,
                            "failed to compensate durable session after fatal cache miss"
                        );
                    }
                    return Err(SessionError::CreationFailed(
                        anyhow::Error::new(err).context("session cache mirror write failed"),
                    ));
                }
                warn!(
                    session_id = %session.session_id,
                    error = %err,
                    "session created without cache mirror"
                );
                false
            }
        };

        Ok(CreatedSession {
            session,
            cache_mirrored,
        })
    }

    /// Reads a session, preferring the cache and falling back to the
    /// relational store with read-through repopulation.
    ///
    /// # Errors
    ///
    /// `SessionError::UserSessionUnknown` when neither store has a live
    /// record; `SessionError::LookupFailed` when the durable lookup failed
    /// after a bounded retry.
    pub async fn read(&self, session_id: &str) -> Result<Session, SessionError> {
        let now = Utc::now();
        match self.cache.get(session_id).await {
            Ok(Some(session)) if !session.is_expired(now) => return Ok(session),
            Ok(Some(_)) => {
                // Expired mirror: drop it and let the durable store decide.
                if let Err(err) = self.cache.delete(session_id).await {
                    warn!(error = %err, "failed to evict expired session mirror");
                }
            }
            Ok(None) => {}
            Err(err) => {
                warn!(error = %err, "session cache read failed, falling back to durable store");
            }
        }

        let session = self
            .fetch_live_with_retry(session_id)
            .await
            .map_err(SessionError::LookupFailed)?
            .ok_or(SessionError::UserSessionUnknown)?;

        // Read-through: repopulate the mirror so peers see this session.
        if let Err(err) = self
            .cache
            .put(&session, self.mirror_ttl(&session, Utc::now()))
            .await
        {
            warn!(error = %err, "failed to repopulate session cache");
        }

        Ok(session)
    }

    /// Removes a session from both stores, attempting both deletions even
    /// when the first fails.
    ///
    /// # Errors
    ///
    /// `SessionError::DeletionFailed` reports which store(s) completed so
    /// partial failure is distinguishable from total failure.
    pub async fn invalidate(&self, session_id: &str) -> Result<Invalidated, SessionError> {
        let durable = self.repo.delete(session_id).await;
        let cache = self.cache.delete(session_id).await;

        match (durable, cache) {
            (Ok(found), Ok(())) => Ok(if found {
                Invalidated::Removed
            } else {
                Invalidated::NotFound
            }),
            (Err(err), Ok(())) => Err(SessionError::DeletionFailed {
                durable_deleted: false,
                cache_deleted: true,
                source: err.context("durable session delete failed"),
            }),
            (Ok(_), Err(err)) => Err(SessionError::DeletionFailed {
                durable_deleted: true,
                cache_deleted: false,
                source: anyhow::Error::new(err).context("cache session delete failed"),
            }),
            (Err(durable_err), Err(cache_err)) => Err(SessionError::DeletionFailed {
                durable_deleted: false,
                cache_deleted: false,
                source: durable_err
                    .context(format!("cache delete also failed: {cache_err}"))
                    .context("both session deletes failed"),
            }),
        }
    }

    /// Extends a session under sliding expiration; a no-op (`Ok(None)`) when
    /// the policy does not slide.
    ///
    /// # Errors
    ///
    /// `SessionError::UserSessionUnknown` when the session is not live in
    /// the durable store; `SessionError::LookupFailed` on store errors.
    pub async fn renew(&self, session_id: &str) -> Result<Option<Session>, SessionError> {
        if !self.policy.sliding() {
            return Ok(None);
        }

        let expires_at = Utc::now() + self.policy.session_ttl();
        let extended = self
            .repo
            .extend(session_id, expires_at)
            .await
            .map_err(SessionError::LookupFailed)?;
        if !extended {
            return Err(SessionError::UserSessionUnknown);
        }

        let session = self
            .repo
            .fetch_live(session_id)
            .await
            .map_err(SessionError::LookupFailed)?
            .ok_or(SessionError::UserSessionUnknown)?;

        if let Err(err) = self
            .cache
            .put(&session, self.mirror_ttl(&session, Utc::now()))
            .await
        {
            warn!(error = %err, "failed to refresh session cache after renewal");
        }

        Ok(Some(session))
    }

    /// Deletes expired rows from the durable store; mirrors age out on
    /// their own TTL.
    ///
    /// # Errors
    ///
    /// Returns the repository error when the purge query fails.
    pub async fn purge_expired(&self) -> Result<u64> {
        self.repo
            .purge_expired()
            .await
            .context("failed to purge expired sessions")
    }

    /// Mirror TTL: never longer than the session has left to live, never
    /// longer than the configured staleness bound.
    fn mirror_ttl(&self, session: &Session, now: DateTime<Utc>) -> Duration {
        let remaining = session.remaining_seconds(now);
        let bounded = remaining.min(self.policy.cache_ttl_seconds()).max(1);
        Duration::from_secs(u64::try_from(bounded).unwrap_or(1))
    }

    async fn fetch_live_with_retry(&self, session_id: &str) -> Result<Option<Session>> {
        // Reads are idempotent, so one bounded retry is safe; writes are
        // never retried here.
        match self.repo.fetch_live(session_id).await {
            Ok(found) => Ok(found),
            Err(first) => {
                warn!(error = %first, "durable session lookup failed, retrying once");
                tokio::time::sleep(READ_RETRY_DELAY).await;
                self.repo
                    .fetch_live(session_id)
                    .await
                    .with_context(|| format!("durable session lookup failed twice: {first}"))
            }
        }
    }
}

/// Opaque session identifier: 32 random bytes, url-safe encoded.
///
/// The raw id is the browser credential, so it comes from the OS entropy
/// source, same as any other token material.
fn generate_session_id() -> Result<String> {
    let mut bytes = [0u8; 32];
    OsRng
        .try_fill_bytes(&mut bytes)
        .context("failed to generate session id")?;
    Ok(Base64UrlUnpadded::encode_string(&bytes))
}

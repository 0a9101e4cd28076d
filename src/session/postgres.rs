//! Relational session storage, the authoritative store of record.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use tracing::Instrument;
use uuid::Uuid;

use super::store::{InsertOutcome, SessionRepository};
use super::Session;

/// sqlx-backed repository over the legacy session table.
///
/// Only the fields the core reads and writes are modeled here; the rest of
/// the legacy schema belongs to its owners.
pub struct PgSessionRepository {
    pool: PgPool,
}

impl PgSessionRepository {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

pub(crate) fn is_unique_violation(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db_err) => db_err.code().is_some_and(|code| code.as_ref() == "23505"),
        _ => false,
    }
}

#[async_trait]
impl SessionRepository for PgSessionRepository {
    async fn user_roles(&self, user_id: Uuid) -> Result<Option<Vec<String>>> {
        // Only active users can own new sessions.
        let query = "SELECT roles FROM users WHERE id = $1 AND status = 'active'";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "SELECT",
            db.statement = query
        );
        let row = sqlx::query(query)
            .bind(user_id)
            .fetch_optional(&self.pool)
            .instrument(span)
            .await
            .context("failed to lookup user roles")?;

        Ok(row.map(|row| row.get("roles")))
    }

    async fn insert(&self, session: &Session) -> Result<InsertOutcome> {
        let query = r"
            INSERT INTO user_sessions
                (session_id, user_id, created_at, last_used_at, expires_at, client_ip, user_agent)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
        ";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "INSERT",
            db.statement = query
        );
        let result = sqlx::query(query)
            .bind(&session.session_id)
            .bind(session.user_id)
            .bind(session.created_at)
            .bind(session.last_used_at)
            .bind(session.expires_at)
            .bind(&session.client_ip)
            .bind(&session.user_agent)
            .execute(&self.pool)
            .instrument(span)
            .await;

        match result {
            Ok(_) => Ok(InsertOutcome::Inserted),
            Err(err) if is_unique_violation(&err) => Ok(InsertOutcome::DuplicateId),
            Err(err) => Err(err).context("failed to insert session"),
        }
    }

    async fn fetch_live(&self, session_id: &str) -> Result<Option<Session>> {
        // Only live sessions owned by active users count as existing.
        let query = r"
            SELECT s.session_id, s.user_id, s.created_at, s.last_used_at, s.expires_at,
                   s.client_ip, s.user_agent, u.roles
            FROM user_sessions s
            JOIN users u ON u.id = s.user_id
            WHERE s.session_id = $1
              AND s.expires_at > NOW()
              AND u.status = 'active'
            LIMIT 1
        ";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "SELECT",
            db.statement = query
        );
        let row = sqlx::query(query)
            .bind(session_id)
            .fetch_optional(&self.pool)
            .instrument(span)
            .await
            .context("failed to lookup session")?;

        let Some(row) = row else {
            return Ok(None);
        };

        // Record activity for audit/visibility without extending the session.
        let query = r"
            UPDATE user_sessions
            SET last_used_at = NOW()
            WHERE session_id = $1
            RETURNING last_used_at
        ";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "UPDATE",
            db.statement = query
        );
        let touched = sqlx::query(query)
            .bind(session_id)
            .fetch_optional(&self.pool)
            .instrument(span)
            .await
            .context("failed to update session last_used_at")?;

        let last_used_at: DateTime<Utc> = touched
            .map_or_else(|| row.get("last_used_at"), |t| t.get("last_used_at"));

        Ok(Some(Session {
            session_id: row.get("session_id"),
            user_id: row.get("user_id"),
            created_at: row.get("created_at"),
            last_used_at,
            expires_at: row.get("expires_at"),
            client_ip: row.get("client_ip"),
            user_agent: row.get("user_agent"),
            roles: row.get("roles"),
        }))
    }

    async fn delete(&self, session_id: &str) -> Result<bool> {
        let query = "DELETE FROM user_sessions WHERE session_id = $1";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "DELETE",
            db.statement = query
        );
        let result = sqlx::query(query)
            .bind(session_id)
            .execute(&self.pool)
            .instrument(span)
            .await
            .context("failed to delete session")?;

        Ok(result.rows_affected() > 0)
    }

    async fn extend(&self, session_id: &str, expires_at: DateTime<Utc>) -> Result<bool> {
        // Expired sessions cannot be revived by renewal.
        let query = r"
            UPDATE user_sessions
            SET expires_at = $2, last_used_at = NOW()
            WHERE session_id = $1
              AND expires_at > NOW()
        ";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "UPDATE",
            db.statement = query
        );
        let result = sqlx::query(query)
            .bind(session_id)
            .bind(expires_at)
            .execute(&self.pool)
            .instrument(span)
            .await
            .context("failed to extend session")?;

        Ok(result.rows_affected() > 0)
    }

    async fn purge_expired(&self) -> Result<u64> {
        let query = "DELETE FROM user_sessions WHERE expires_at <= NOW()";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "DELETE",
            db.statement = query
        );
        let result = sqlx::query(query)
            .execute(&self.pool)
            .instrument(span)
            .await
            .context("failed to purge expired sessions")?;

        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::error::{DatabaseError, ErrorKind};
    use std::borrow::Cow;
    use std::error::Error as StdError;
    use std::fmt;

    #[derive(Debug)]
    struct TestDbError {
        code: Option<&'static str>,
    }

    impl fmt::Display for TestDbError {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "test database error")
        }
    }

    impl StdError for TestDbError {}

    impl DatabaseError for TestDbError {
        fn message(&self) -> &'static str {
            "test database error"
        }

        fn code(&self) -> Option<Cow<'_, str>> {
            self.code.map(Cow::Borrowed)
        }

        fn as_error(&self) -> &(dyn StdError + Send + Sync + 'static) {
            self
        }

        fn as_error_mut(&mut self) -> &mut (dyn StdError + Send + Sync + 'static) {
            self
        }

        fn into_error(self: Box<Self>) -> Box<dyn StdError + Send + Sync + 'static> {
            self
        }

        fn kind(&self) -> ErrorKind {
            ErrorKind::UniqueViolation
        }
    }

    #[test]
    fn is_unique_violation_matches_sqlstate() {
        let err = sqlx::Error::Database(Box::new(TestDbError {
            code: Some("23505"),
        }));
        assert!(is_unique_violation(&err));

        let err = sqlx::Error::Database(Box::new(TestDbError {
            code: Some("99999"),
        }));
        assert!(!is_unique_violation(&err));

        let err = sqlx::Error::RowNotFound;
        assert!(!is_unique_violation(&err));
    }
}

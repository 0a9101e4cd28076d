//! Redis-backed session mirror.

use anyhow::{Context as _, Result};
use async_trait::async_trait;
use fred::error::Error as FredError;
use fred::prelude::*;
use std::future::Future;
use std::time::Duration;
use tokio::time::timeout;

use super::cache::{CacheError, CacheResult, SessionCache};
use super::Session;

const DEFAULT_OP_TIMEOUT: Duration = Duration::from_secs(2);
const DEFAULT_KEY_PREFIX: &str = "identeco";

/// Safely convert seconds to i64 for Redis expiration.
#[allow(clippy::cast_possible_wrap)]
const fn seconds_to_i64(seconds: u64) -> i64 {
    seconds as i64
}

#[derive(Debug, Clone)]
pub struct RedisConfig {
    url: String,
    clustered: bool,
    key_prefix: String,
    op_timeout: Duration,
}

impl RedisConfig {
    #[must_use]
    pub fn new(url: String) -> Self {
        Self {
            url,
            clustered: false,
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
            op_timeout: DEFAULT_OP_TIMEOUT,
        }
    }

    /// Treat the URL as a Redis Cluster seed list.
    #[must_use]
    pub fn with_clustered(mut self, clustered: bool) -> Self {
        self.clustered = clustered;
        self
    }

    #[must_use]
    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    #[must_use]
    pub fn with_op_timeout(mut self, op_timeout: Duration) -> Self {
        self.op_timeout = op_timeout;
        self
    }

    /// URL handed to the client, with the cluster scheme applied when the
    /// topology flag says so.
    fn client_url(&self) -> String {
        if self.clustered && self.url.starts_with("redis://") {
            self.url.replacen("redis://", "redis-cluster://", 1)
        } else if self.clustered && self.url.starts_with("rediss://") {
            self.url.replacen("rediss://", "rediss-cluster://", 1)
        } else {
            self.url.clone()
        }
    }
}

/// Distributed session cache shared with peer services.
pub struct RedisSessionCache {
    client: Client,
    config: RedisConfig,
}

impl RedisSessionCache {
    /// Connect and wait for the first successful handshake.
    ///
    /// # Errors
    ///
    /// Returns an error when the URL is invalid or the backend is
    /// unreachable at startup.
    pub async fn connect(config: RedisConfig) -> Result<Self> {
        let fred_config =
            Config::from_url(&config.client_url()).context("invalid cache URL")?;
        let client = Builder::from_config(fred_config)
            .build()
            .context("failed to build cache client")?;
        client
            .init()
            .await
            .context("failed to connect to session cache")?;

        Ok(Self { client, config })
    }

    fn key(&self, session_id: &str) -> String {
        format!("{}:session:{}", self.config.key_prefix, session_id)
    }

    /// Apply the per-call timeout so a stalled backend cannot hold a
    /// request's identity resolution hostage.
    async fn bounded<T, F>(&self, operation: F) -> CacheResult<T>
    where
        F: Future<Output = Result<T, FredError>>,
    {
        match timeout(self.config.op_timeout, operation).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(err)) => Err(CacheError::Unavailable(anyhow::Error::new(err))),
            Err(_) => Err(CacheError::Timeout),
        }
    }
}

#[async_trait]
impl SessionCache for RedisSessionCache {
    async fn put(&self, session: &Session, ttl: Duration) -> CacheResult<()> {
        let key = self.key(&session.session_id);
        let json = serde_json::to_string(session)?;
        let seconds = seconds_to_i64(ttl.as_secs().max(1));

        self.bounded(self.client.set::<(), _, _>(
            &key,
            json,
            Some(Expiration::EX(seconds)),
            None,
            false,
        ))
        .await
    }

    async fn get(&self, session_id: &str) -> CacheResult<Option<Session>> {
        let key = self.key(session_id);
        let value: Option<String> = self.bounded(self.client.get(&key)).await?;
        value
            .map(|json| serde_json::from_str(&json))
            .transpose()
            .map_err(CacheError::from)
    }

    async fn delete(&self, session_id: &str) -> CacheResult<()> {
        let key = self.key(session_id);
        self.bounded(self.client.del::<u64, _>(&key)).await?;
        Ok(())
    }

    async fn ping(&self) -> CacheResult<()> {
        self.bounded(self.client.ping::<()>(None)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cluster_flag_rewrites_the_scheme() {
        let config = RedisConfig::new("redis://cache.internal:6379".to_string());
        assert_eq!(config.client_url(), "redis://cache.internal:6379");

        let config = config.with_clustered(true);
        assert_eq!(config.client_url(), "redis-cluster://cache.internal:6379");

        let tls = RedisConfig::new("rediss://cache.internal:6380".to_string())
            .with_clustered(true);
        assert_eq!(tls.client_url(), "rediss-cluster://cache.internal:6380");
    }

    #[test]
    fn keys_are_prefixed_per_deployment() {
        let config = RedisConfig::new("redis://cache.internal:6379".to_string())
            .with_key_prefix("identeco-staging");
        // Key layout is part of the wire contract with peer services.
        assert_eq!(config.key_prefix, "identeco-staging");
    }

    #[test]
    fn defaults_bound_operations() {
        let config = RedisConfig::new("redis://cache.internal:6379".to_string());
        assert_eq!(config.op_timeout, DEFAULT_OP_TIMEOUT);
        assert!(!config.clustered);
    }
}

//! Health endpoint with build metadata and dependency status.

use axum::{
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Json},
    Extension,
};
use serde_json::json;
use sqlx::PgPool;
use std::sync::Arc;
use tracing::warn;

use crate::session::SessionCache;
use crate::GIT_COMMIT_HASH;

#[utoipa::path(
    get,
    path = "/health",
    responses(
        (status = 200, description = "Service and both session stores are reachable"),
        (status = 503, description = "A session store is unreachable")
    ),
    tag = "health"
)]
pub async fn health(
    pool: Extension<PgPool>,
    Extension(cache): Extension<Arc<dyn SessionCache>>,
) -> impl IntoResponse {
    let database_ok = match sqlx::query("SELECT 1").execute(&*pool).await {
        Ok(_) => true,
        Err(err) => {
            warn!(error = %err, "database unreachable during health check");
            false
        }
    };
    let cache_ok = match cache.ping().await {
        Ok(()) => true,
        Err(err) => {
            warn!(error = %err, "session cache unreachable during health check");
            false
        }
    };

    let body = Json(json!({
        "name": env!("CARGO_PKG_NAME"),
        "version": env!("CARGO_PKG_VERSION"),
        "build": GIT_COMMIT_HASH,
        "database": if database_ok { "ok" } else { "error" },
        "cache": if cache_ok { "ok" } else { "error" },
    }));

    let short_hash = if GIT_COMMIT_HASH.len() > 7 {
        &GIT_COMMIT_HASH[0..7]
    } else {
        ""
    };

    let mut headers = HeaderMap::new();
    if let Ok(value) = format!(
        "{}:{}:{}",
        env!("CARGO_PKG_NAME"),
        env!("CARGO_PKG_VERSION"),
        short_hash
    )
    .parse()
    {
        headers.insert("X-App", value);
    }

    let status = if database_ok && cache_ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (status, headers, body)
}

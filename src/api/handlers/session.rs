//! Session wire API: lookup for peer services, create/invalidate for login
//! orchestrators, and the browser logout path.

use axum::{
    extract::{Path, Query},
    http::{
        header::{InvalidHeaderValue, LOCATION, SET_COOKIE, USER_AGENT},
        HeaderMap, HeaderValue, StatusCode,
    },
    response::{IntoResponse, Response},
    Extension, Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tracing::{error, info};
use utoipa::ToSchema;
use uuid::Uuid;

use super::extract_client_ip;
use crate::api::auth::{
    cookie_value, redirect::RedirectPolicy, scope::require_scope, AuthOutcome, ScopeMap,
};
use crate::api::CookieConfig;
use crate::session::{Invalidated, Session, SessionStore};

/// Wire shape peer services consume when resolving a session id.
#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct SessionResponse {
    pub user_id: String,
    pub scopes: Vec<String>,
    pub expires_at: DateTime<Utc>,
}

impl SessionResponse {
    fn from_session(session: &Session, scope_map: &ScopeMap) -> Self {
        Self {
            user_id: session.user_id.to_string(),
            scopes: scope_map.scopes_for(&session.roles).into_iter().collect(),
            expires_at: session.expires_at,
        }
    }
}

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct CreateSessionRequest {
    pub user_id: Uuid,
    /// Defaults to the address in the forwarding headers when omitted.
    pub client_ip: Option<String>,
    pub user_agent: Option<String>,
}

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct CreateSessionResponse {
    pub session_id: String,
    pub user_id: String,
    pub scopes: Vec<String>,
    pub expires_at: DateTime<Utc>,
    /// False when the session exists durably but the cache mirror failed;
    /// peers reading only the cache will not see it until read-through.
    pub cache_mirrored: bool,
}

#[utoipa::path(
    get,
    path = "/v1/sessions/{session_id}",
    params(
        ("session_id" = String, Path, description = "Opaque session identifier")
    ),
    responses(
        (status = 200, description = "Live session", body = SessionResponse),
        (status = 401, description = "Missing credentials"),
        (status = 403, description = "Missing sessions:read scope"),
        (status = 404, description = "No live session with this id")
    ),
    tag = "sessions"
)]
pub async fn get_session(
    Path(session_id): Path<String>,
    Extension(outcome): Extension<AuthOutcome>,
    Extension(store): Extension<Arc<SessionStore>>,
    Extension(scope_map): Extension<Arc<ScopeMap>>,
) -> Response {
    let grant = match require_scope(&outcome, "sessions:read") {
        Ok(grant) => grant,
        Err(err) => return err.into_response(),
    };

    match store.read(&session_id).await {
        Ok(session) => {
            info!(actor = %grant.user_id, "session resolved for peer service");
            (
                StatusCode::OK,
                Json(SessionResponse::from_session(&session, &scope_map)),
            )
                .into_response()
        }
        Err(err) if err.is_unknown() => StatusCode::NOT_FOUND.into_response(),
        Err(err) => {
            error!("session lookup failed: {err:#}");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

#[utoipa::path(
    post,
    path = "/v1/sessions",
    request_body = CreateSessionRequest,
    responses(
        (status = 201, description = "Session created", body = CreateSessionResponse),
        (status = 401, description = "Missing credentials"),
        (status = 403, description = "Missing sessions:write scope"),
        (status = 500, description = "Durable session write failed")
    ),
    tag = "sessions"
)]
pub async fn create_session(
    headers: HeaderMap,
    Extension(outcome): Extension<AuthOutcome>,
    Extension(store): Extension<Arc<SessionStore>>,
    Extension(scope_map): Extension<Arc<ScopeMap>>,
    Extension(cookie_config): Extension<Arc<CookieConfig>>,
    Json(body): Json<CreateSessionRequest>,
) -> Response {
    let grant = match require_scope(&outcome, "sessions:write") {
        Ok(grant) => grant,
        Err(err) => return err.into_response(),
    };

    let client_ip = body.client_ip.or_else(|| extract_client_ip(&headers));
    let user_agent = body.user_agent.or_else(|| {
        headers
            .get(USER_AGENT)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string)
    });

    match store.create(body.user_id, client_ip, user_agent).await {
        Ok(created) => {
            info!(
                actor = %grant.user_id,
                user_id = %created.session.user_id,
                cache_mirrored = created.cache_mirrored,
                "session created"
            );
            let mut response_headers = HeaderMap::new();
            let max_age = created.session.remaining_seconds(Utc::now());
            if let Ok(cookie) =
                session_cookie(&cookie_config, &created.session.session_id, max_age)
            {
                response_headers.insert(SET_COOKIE, cookie);
            }
            let response = CreateSessionResponse {
                session_id: created.session.session_id.clone(),
                user_id: created.session.user_id.to_string(),
                scopes: scope_map
                    .scopes_for(&created.session.roles)
                    .into_iter()
                    .collect(),
                expires_at: created.session.expires_at,
                cache_mirrored: created.cache_mirrored,
            };
            (StatusCode::CREATED, response_headers, Json(response)).into_response()
        }
        Err(err) => {
            error!("session creation failed: {err:#}");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": "session creation failed" })),
            )
                .into_response()
        }
    }
}

#[utoipa::path(
    delete,
    path = "/v1/sessions/{session_id}",
    params(
        ("session_id" = String, Path, description = "Opaque session identifier")
    ),
    responses(
        (status = 204, description = "Session removed from both stores"),
        (status = 401, description = "Missing credentials"),
        (status = 403, description = "Missing sessions:write scope"),
        (status = 404, description = "No session with this id"),
        (status = 502, description = "At least one store failed the delete")
    ),
    tag = "sessions"
)]
pub async fn delete_session(
    Path(session_id): Path<String>,
    Extension(outcome): Extension<AuthOutcome>,
    Extension(store): Extension<Arc<SessionStore>>,
) -> Response {
    let grant = match require_scope(&outcome, "sessions:write") {
        Ok(grant) => grant,
        Err(err) => return err.into_response(),
    };

    match store.invalidate(&session_id).await {
        Ok(Invalidated::Removed) => {
            info!(actor = %grant.user_id, "session invalidated");
            StatusCode::NO_CONTENT.into_response()
        }
        Ok(Invalidated::NotFound) => StatusCode::NOT_FOUND.into_response(),
        Err(err) => {
            // The log carries which store failed; the body stays generic.
            error!(
                partial = err.is_partial_deletion(),
                "session deletion failed: {err:#}"
            );
            (
                StatusCode::BAD_GATEWAY,
                Json(json!({ "error": "session deletion incomplete" })),
            )
                .into_response()
        }
    }
}

#[derive(Deserialize, Debug)]
pub struct LogoutParams {
    pub next: Option<String>,
}

#[utoipa::path(
    post,
    path = "/v1/auth/logout",
    params(
        ("next" = Option<String>, Query, description = "Post-logout redirect target")
    ),
    responses(
        (status = 303, description = "Session cleared, redirecting")
    ),
    tag = "auth"
)]
pub async fn logout(
    headers: HeaderMap,
    Query(params): Query<LogoutParams>,
    Extension(store): Extension<Arc<SessionStore>>,
    Extension(cookie_config): Extension<Arc<CookieConfig>>,
    Extension(redirect): Extension<Arc<RedirectPolicy>>,
) -> Response {
    if let Some(session_id) = cookie_value(&headers, cookie_config.name()) {
        if let Err(err) = store.invalidate(&session_id).await {
            error!("failed to invalidate session on logout: {err:#}");
        }
    }

    // Always clear the cookie, even if the session record was missing.
    let mut response_headers = HeaderMap::new();
    if let Ok(cookie) = clear_session_cookie(&cookie_config) {
        response_headers.insert(SET_COOKIE, cookie);
    }

    let next = redirect.good_next_page(params.next.as_deref());
    match HeaderValue::from_str(next) {
        Ok(location) => {
            response_headers.insert(LOCATION, location);
            (StatusCode::SEE_OTHER, response_headers).into_response()
        }
        Err(_) => (StatusCode::NO_CONTENT, response_headers).into_response(),
    }
}

/// Build a secure `HttpOnly` cookie for the session id.
pub(crate) fn session_cookie(
    config: &CookieConfig,
    session_id: &str,
    max_age_seconds: i64,
) -> Result<HeaderValue, InvalidHeaderValue> {
    let mut cookie = format!(
        "{}={session_id}; Path=/; HttpOnly; SameSite=Lax; Max-Age={max_age_seconds}",
        config.name()
    );
    if config.secure() {
        cookie.push_str("; Secure");
    }
    HeaderValue::from_str(&cookie)
}

fn clear_session_cookie(config: &CookieConfig) -> Result<HeaderValue, InvalidHeaderValue> {
    let mut cookie = format!(
        "{}=; Path=/; HttpOnly; SameSite=Lax; Max-Age=0",
        config.name()
    );
    if config.secure() {
        cookie.push_str("; Secure");
    }
    HeaderValue::from_str(&cookie)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_cookie_carries_flags() {
        let config = CookieConfig::new("identeco_session".to_string(), true);
        let cookie = session_cookie(&config, "abc123", 3600).expect("cookie");
        let value = cookie.to_str().expect("ascii");
        assert!(value.starts_with("identeco_session=abc123; "));
        assert!(value.contains("HttpOnly"));
        assert!(value.contains("SameSite=Lax"));
        assert!(value.contains("Max-Age=3600"));
        assert!(value.ends_with("; Secure"));
    }

    #[test]
    fn insecure_deployments_drop_the_secure_flag() {
        let config = CookieConfig::new("identeco_session".to_string(), false);
        let cookie = session_cookie(&config, "abc123", 60).expect("cookie");
        assert!(!cookie.to_str().expect("ascii").contains("Secure"));
    }

    #[test]
    fn clearing_expires_the_cookie() {
        let config = CookieConfig::new("identeco_session".to_string(), true);
        let cookie = clear_session_cookie(&config).expect("cookie");
        let value = cookie.to_str().expect("ascii");
        assert!(value.starts_with("identeco_session=; "));
        assert!(value.contains("Max-Age=0"));
    }
}

//! Per-request identity resolution.
//!
//! The resolver runs once per inbound request, before application logic. It
//! only annotates the request with an [`AuthOutcome`]; rejecting a request
//! is the scope authorizer's job.

pub mod redirect;
pub mod scope;

use axum::{
    extract::Request,
    http::{
        header::{AUTHORIZATION, COOKIE},
        HeaderMap,
    },
    middleware::Next,
    response::Response,
    Extension,
};
use secrecy::{ExposeSecret, SecretString};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::session::SessionStore;
use crate::token::{self, BearerClaims};

/// Immutable per-request identity, discarded when the response completes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthContext {
    user_id: Uuid,
    scopes: BTreeSet<String>,
    client_id: Option<String>,
    raw_token: Option<String>,
}

impl AuthContext {
    fn from_claims(claims: BearerClaims, raw_token: &str) -> Self {
        Self {
            user_id: claims.sub,
            scopes: claims.scopes.into_iter().collect(),
            client_id: claims.client_id,
            raw_token: Some(raw_token.to_string()),
        }
    }

    /// Cookie sessions carry the session id as the presented credential.
    fn from_session(user_id: Uuid, session_id: &str, scopes: BTreeSet<String>) -> Self {
        Self {
            user_id,
            scopes,
            client_id: None,
            raw_token: Some(session_id.to_string()),
        }
    }

    #[must_use]
    pub fn user_id(&self) -> Uuid {
        self.user_id
    }

    #[must_use]
    pub fn scopes(&self) -> &BTreeSet<String> {
        &self.scopes
    }

    #[must_use]
    pub fn client_id(&self) -> Option<&str> {
        self.client_id.as_deref()
    }

    #[must_use]
    pub fn raw_token(&self) -> Option<&str> {
        self.raw_token.as_deref()
    }
}

/// Why a presented bearer credential was rejected. Audit-log detail only;
/// responses never carry it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BearerRejection {
    Malformed,
    InvalidSignature,
    Expired,
}

impl From<token::Error> for BearerRejection {
    fn from(err: token::Error) -> Self {
        match err {
            token::Error::Malformed => Self::Malformed,
            token::Error::InvalidSignature => Self::InvalidSignature,
            token::Error::Expired => Self::Expired,
        }
    }
}

/// What identity resolution concluded for this request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthOutcome {
    Authenticated(AuthContext),
    /// No usable credential was presented.
    Anonymous,
    /// A bearer credential was presented and failed verification. This is a
    /// hard failure for the request: cookie resolution is not attempted, so
    /// stripping or corrupting a token cannot downgrade to a weaker path.
    InvalidBearer(BearerRejection),
}

impl AuthOutcome {
    #[must_use]
    pub fn context(&self) -> Option<&AuthContext> {
        match self {
            Self::Authenticated(context) => Some(context),
            Self::Anonymous | Self::InvalidBearer(_) => None,
        }
    }
}

/// Legacy role flag → scope translation table.
///
/// The mapping is deployment policy, loaded from configuration; roles with
/// no entry translate to no scopes.
#[derive(Debug, Clone, Default)]
pub struct ScopeMap {
    map: HashMap<String, Vec<String>>,
}

impl ScopeMap {
    #[must_use]
    pub fn new(map: HashMap<String, Vec<String>>) -> Self {
        Self { map }
    }

    #[must_use]
    pub fn scopes_for(&self, roles: &[String]) -> BTreeSet<String> {
        roles
            .iter()
            .filter_map(|role| self.map.get(role))
            .flatten()
            .cloned()
            .collect()
    }
}

pub struct IdentityResolver {
    signing_secret: SecretString,
    store: Arc<SessionStore>,
    scope_map: Arc<ScopeMap>,
    cookie_name: String,
    leeway_seconds: i64,
}

impl IdentityResolver {
    #[must_use]
    pub fn new(
        signing_secret: SecretString,
        store: Arc<SessionStore>,
        scope_map: Arc<ScopeMap>,
        cookie_name: String,
        leeway_seconds: i64,
    ) -> Self {
        Self {
            signing_secret,
            store,
            scope_map,
            cookie_name,
            leeway_seconds,
        }
    }

    #[must_use]
    pub fn cookie_name(&self) -> &str {
        &self.cookie_name
    }

    #[must_use]
    pub fn scope_map(&self) -> &ScopeMap {
        &self.scope_map
    }

    /// Establish an identity for the request, strictly ordered: a bearer
    /// credential is verified first; only when no bearer credential exists
    /// at all is the legacy cookie session consulted.
    pub async fn resolve(&self, headers: &HeaderMap) -> AuthOutcome {
        if let Some(raw_token) = bearer_token(headers) {
            return match token::verify(
                &raw_token,
                self.signing_secret.expose_secret().as_bytes(),
                token::now_unix_seconds(),
                self.leeway_seconds,
            ) {
                Ok(claims) => AuthOutcome::Authenticated(AuthContext::from_claims(
                    claims,
                    &raw_token,
                )),
                Err(err) => {
                    match err {
                        token::Error::InvalidSignature => {
                            warn!("rejecting bearer token with invalid signature");
                        }
                        token::Error::Malformed => {
                            warn!("rejecting malformed bearer token");
                        }
                        token::Error::Expired => {
                            info!("rejecting expired bearer token");
                        }
                    }
                    AuthOutcome::InvalidBearer(err.into())
                }
            };
        }

        let Some(session_id) = cookie_value(headers, &self.cookie_name) else {
            debug!("request carries no credential");
            return AuthOutcome::Anonymous;
        };

        match self.store.read(&session_id).await {
            Ok(session) => {
                // Sliding renewal is best effort; the session just read
                // stays authoritative for this request if it fails.
                let session = match self.store.renew(&session_id).await {
                    Ok(Some(renewed)) => renewed,
                    Ok(None) => session,
                    Err(err) => {
                        warn!(error = %err, "session renewal failed");
                        session
                    }
                };
                let scopes = self.scope_map.scopes_for(&session.roles);
                AuthOutcome::Authenticated(AuthContext::from_session(
                    session.user_id,
                    &session_id,
                    scopes,
                ))
            }
            Err(err) if err.is_unknown() => {
                info!("session cookie does not name a live session");
                AuthOutcome::Anonymous
            }
            Err(err) => {
                error!(error = %err, "session lookup failed during identity resolution");
                AuthOutcome::Anonymous
            }
        }
    }
}

/// Middleware: attach the resolved [`AuthOutcome`] to the request.
pub async fn resolve_identity(
    Extension(resolver): Extension<Arc<IdentityResolver>>,
    mut request: Request,
    next: Next,
) -> Response {
    let outcome = resolver.resolve(request.headers()).await;
    request.extensions_mut().insert(outcome);
    next.run(request).await
}

fn bearer_token(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(AUTHORIZATION)?.to_str().ok()?;
    let trimmed = value.trim();
    let token = trimmed
        .strip_prefix("Bearer ")
        .or_else(|| trimmed.strip_prefix("bearer "))?
        .trim();
    if token.is_empty() {
        None
    } else {
        Some(token.to_string())
    }
}

pub(crate) fn cookie_value(headers: &HeaderMap, cookie_name: &str) -> Option<String> {
    let header = headers.get(COOKIE)?;
    let value = header.to_str().ok()?;
    for pair in value.split(';') {
        let trimmed = pair.trim();
        let mut parts = trimmed.splitn(2, '=');
        let key = parts.next()?.trim();
        let val = parts.next()?.trim();
        if key == cookie_name {
            return Some(val.to_string());
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{
        InMemorySessionCache, InsertOutcome, SessionPolicy, SessionRepository,
    };
    use anyhow::Result as AnyResult;
    use async_trait::async_trait;
    use axum::http::HeaderValue;
    use chrono::{DateTime, Utc};
    use std::collections::HashMap as StdHashMap;
    use tokio::sync::Mutex;

    const SECRET: &str = "a-unit-test-secret-at-least-32-bytes!";
    const COOKIE_NAME: &str = "identeco_session";

    #[derive(Default)]
    struct MemoryRepository {
        users: Mutex<StdHashMap<Uuid, Vec<String>>>,
        rows: Mutex<StdHashMap<String, crate::session::Session>>,
    }

    #[async_trait]
    impl SessionRepository for MemoryRepository {
        async fn user_roles(&self, user_id: Uuid) -> AnyResult<Option<Vec<String>>> {
            Ok(self.users.lock().await.get(&user_id).cloned())
        }

        async fn insert(
            &self,
            session: &crate::session::Session,
        ) -> AnyResult<InsertOutcome> {
            let mut rows = self.rows.lock().await;
            if rows.contains_key(&session.session_id) {
                return Ok(InsertOutcome::DuplicateId);
            }
            rows.insert(session.session_id.clone(), session.clone());
            Ok(InsertOutcome::Inserted)
        }

        async fn fetch_live(
            &self,
            session_id: &str,
        ) -> AnyResult<Option<crate::session::Session>> {
            Ok(self
                .rows
                .lock()
                .await
                .get(session_id)
                .filter(|session| !session.is_expired(Utc::now()))
                .cloned())
        }

        async fn delete(&self, session_id: &str) -> AnyResult<bool> {
            Ok(self.rows.lock().await.remove(session_id).is_some())
        }

        async fn extend(
            &self,
            session_id: &str,
            expires_at: DateTime<Utc>,
        ) -> AnyResult<bool> {
            let mut rows = self.rows.lock().await;
            match rows.get_mut(session_id) {
                Some(session) if !session.is_expired(Utc::now()) => {
                    session.expires_at = expires_at;
                    Ok(true)
                }
                _ => Ok(false),
            }
        }

        async fn purge_expired(&self) -> AnyResult<u64> {
            Ok(0)
        }
    }

    async fn resolver_with_session() -> (IdentityResolver, Uuid, String) {
        let repo = Arc::new(MemoryRepository::default());
        let user_id = Uuid::new_v4();
        repo.users
            .lock()
            .await
            .insert(user_id, vec!["member".to_string()]);

        let store = Arc::new(SessionStore::new(
            repo,
            Arc::new(InMemorySessionCache::new()),
            SessionPolicy::new(),
        ));
        let created = store
            .create(user_id, None, None)
            .await
            .expect("session created");

        let mut map = StdHashMap::new();
        map.insert(
            "member".to_string(),
            vec!["sessions:read".to_string()],
        );
        let resolver = IdentityResolver::new(
            SecretString::from(SECRET.to_string()),
            store,
            Arc::new(ScopeMap::new(map)),
            COOKIE_NAME.to_string(),
            0,
        );
        (resolver, user_id, created.session.session_id)
    }

    fn bearer_headers(token: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {token}")).expect("header"),
        );
        headers
    }

    fn cookie_headers(session_id: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(
            COOKIE,
            HeaderValue::from_str(&format!("{COOKIE_NAME}={session_id}; theme=dark"))
                .expect("header"),
        );
        headers
    }

    fn signed_token(user_id: Uuid, exp: i64) -> String {
        let claims = BearerClaims::new(user_id, vec!["sessions:write".to_string()], exp)
            .with_client_id("mesh-gateway");
        token::sign(&claims, SECRET.as_bytes()).expect("signed")
    }

    #[tokio::test]
    async fn valid_bearer_token_authenticates() {
        let (resolver, _, _) = resolver_with_session().await;
        let user_id = Uuid::new_v4();
        let raw = signed_token(user_id, token::now_unix_seconds() + 60);

        let outcome = resolver.resolve(&bearer_headers(&raw)).await;
        let context = outcome.context().expect("authenticated");
        assert_eq!(context.user_id(), user_id);
        assert!(context.scopes().contains("sessions:write"));
        assert_eq!(context.client_id(), Some("mesh-gateway"));
        assert_eq!(context.raw_token(), Some(raw.as_str()));
    }

    #[tokio::test]
    async fn expired_bearer_does_not_fall_back_to_cookie() {
        let (resolver, user_id, session_id) = resolver_with_session().await;
        let raw = signed_token(user_id, token::now_unix_seconds() - 10);

        // Both credentials presented: the dead bearer token wins and the
        // perfectly valid cookie is never consulted.
        let mut headers = bearer_headers(&raw);
        headers.insert(
            COOKIE,
            HeaderValue::from_str(&format!("{COOKIE_NAME}={session_id}")).expect("header"),
        );

        let outcome = resolver.resolve(&headers).await;
        assert_eq!(
            outcome,
            AuthOutcome::InvalidBearer(BearerRejection::Expired)
        );
    }

    #[tokio::test]
    async fn tampered_bearer_is_invalid_signature() {
        let (resolver, _, _) = resolver_with_session().await;
        let raw = signed_token(Uuid::new_v4(), token::now_unix_seconds() + 60);
        let mut tampered = raw.into_bytes();
        let last = tampered.len() - 1;
        tampered[last] = if tampered[last] == b'A' { b'B' } else { b'A' };
        let tampered = String::from_utf8(tampered).expect("ascii");

        let outcome = resolver.resolve(&bearer_headers(&tampered)).await;
        assert_eq!(
            outcome,
            AuthOutcome::InvalidBearer(BearerRejection::InvalidSignature)
        );
    }

    #[tokio::test]
    async fn cookie_session_resolves_with_mapped_scopes() {
        let (resolver, user_id, session_id) = resolver_with_session().await;

        let outcome = resolver.resolve(&cookie_headers(&session_id)).await;
        let context = outcome.context().expect("authenticated");
        assert_eq!(context.user_id(), user_id);
        assert!(context.scopes().contains("sessions:read"));
        assert_eq!(context.client_id(), None);
        assert_eq!(context.raw_token(), Some(session_id.as_str()));
    }

    #[tokio::test]
    async fn unknown_cookie_is_anonymous() {
        let (resolver, _, _) = resolver_with_session().await;
        let outcome = resolver.resolve(&cookie_headers("no-such-session")).await;
        assert_eq!(outcome, AuthOutcome::Anonymous);
    }

    #[tokio::test]
    async fn no_credential_is_anonymous() {
        let (resolver, _, _) = resolver_with_session().await;
        let outcome = resolver.resolve(&HeaderMap::new()).await;
        assert_eq!(outcome, AuthOutcome::Anonymous);
    }

    #[test]
    fn bearer_extraction_requires_a_value() {
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer "));
        assert_eq!(bearer_token(&headers), None);

        headers.insert(AUTHORIZATION, HeaderValue::from_static("Basic dXNlcg=="));
        assert_eq!(bearer_token(&headers), None);

        headers.insert(AUTHORIZATION, HeaderValue::from_static("bearer abc"));
        assert_eq!(bearer_token(&headers), Some("abc".to_string()));
    }

    #[test]
    fn cookie_extraction_walks_pairs() {
        let mut headers = HeaderMap::new();
        headers.insert(
            COOKIE,
            HeaderValue::from_static("theme=dark; identeco_session=abc123; lang=eo"),
        );
        assert_eq!(
            cookie_value(&headers, COOKIE_NAME),
            Some("abc123".to_string())
        );
        assert_eq!(cookie_value(&headers, "missing"), None);
    }

    #[test]
    fn scope_map_translates_and_deduplicates() {
        let mut map = StdHashMap::new();
        map.insert(
            "admin".to_string(),
            vec!["sessions:read".to_string(), "sessions:write".to_string()],
        );
        map.insert("member".to_string(), vec!["sessions:read".to_string()]);
        let scope_map = ScopeMap::new(map);

        let scopes = scope_map.scopes_for(&[
            "admin".to_string(),
            "member".to_string(),
            "unmapped".to_string(),
        ]);
        assert_eq!(scopes.len(), 2);
        assert!(scopes.contains("sessions:read"));
        assert!(scopes.contains("sessions:write"));

        assert!(scope_map.scopes_for(&["unmapped".to_string()]).is_empty());
    }
}

//! HTTP surface and server wiring.

pub mod auth;
pub(crate) mod handlers;
mod openapi;

pub use openapi::ApiDoc;

use anyhow::{anyhow, Context, Result};
use axum::{
    body::Body,
    extract::MatchedPath,
    http::{
        header::{AUTHORIZATION, CONTENT_TYPE},
        HeaderName, HeaderValue, Method, Request,
    },
    middleware,
    routing::{get, post},
    Extension, Router,
};
use secrecy::SecretString;
use sqlx::postgres::PgPoolOptions;
use std::{collections::HashMap, sync::Arc, time::Duration};
use tokio::net::TcpListener;
use tower::ServiceBuilder;
use tower_http::{
    cors::{AllowOrigin, CorsLayer},
    request_id::PropagateRequestIdLayer,
    set_header::SetRequestHeaderLayer,
    trace::TraceLayer,
};
use tracing::{error, info, info_span, warn, Span};
use ulid::Ulid;
use url::Url;

use crate::session::{
    InMemorySessionCache, PgSessionRepository, RedisConfig, RedisSessionCache, SessionCache,
    SessionPolicy, SessionStore,
};
use auth::{redirect::RedirectPolicy, IdentityResolver, ScopeMap};

const DEFAULT_COOKIE_NAME: &str = "identeco_session";
const DEFAULT_CAPTCHA_TTL_SECONDS: i64 = 5 * 60;
const PURGE_INTERVAL: Duration = Duration::from_secs(15 * 60);

/// Session cookie surface, externally configured.
#[derive(Debug, Clone)]
pub struct CookieConfig {
    name: String,
    secure: bool,
}

impl CookieConfig {
    #[must_use]
    pub fn new(name: String, secure: bool) -> Self {
        Self { name, secure }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn secure(&self) -> bool {
        self.secure
    }
}

/// Challenge issuing/verification settings.
#[derive(Debug, Clone)]
pub struct CaptchaConfig {
    secret: SecretString,
    ttl_seconds: i64,
}

impl CaptchaConfig {
    #[must_use]
    pub fn new(secret: SecretString, ttl_seconds: i64) -> Self {
        Self {
            secret,
            ttl_seconds,
        }
    }

    #[must_use]
    pub fn secret(&self) -> &SecretString {
        &self.secret
    }

    #[must_use]
    pub fn ttl_seconds(&self) -> i64 {
        self.ttl_seconds
    }
}

/// Everything the server needs, assembled once at startup. Components
/// receive what they need at construction; nothing reads the process
/// environment at request time.
#[derive(Debug, Clone)]
pub struct ApiConfig {
    signing_secret: SecretString,
    redirect: RedirectPolicy,
    cookie_name: String,
    frontend_origin: Option<String>,
    session_policy: SessionPolicy,
    cache_url: Option<String>,
    cache_clustered: bool,
    role_scopes: HashMap<String, Vec<String>>,
    token_leeway_seconds: i64,
    captcha_ttl_seconds: i64,
}

impl ApiConfig {
    #[must_use]
    pub fn new(signing_secret: SecretString, redirect: RedirectPolicy) -> Self {
        Self {
            signing_secret,
            redirect,
            cookie_name: DEFAULT_COOKIE_NAME.to_string(),
            frontend_origin: None,
            session_policy: SessionPolicy::new(),
            cache_url: None,
            cache_clustered: false,
            role_scopes: HashMap::new(),
            token_leeway_seconds: 0,
            captcha_ttl_seconds: DEFAULT_CAPTCHA_TTL_SECONDS,
        }
    }

    #[must_use]
    pub fn with_cookie_name(mut self, name: String) -> Self {
        self.cookie_name = name;
        self
    }

    #[must_use]
    pub fn with_frontend_origin(mut self, origin: Option<String>) -> Self {
        self.frontend_origin = origin;
        self
    }

    #[must_use]
    pub fn with_session_policy(mut self, policy: SessionPolicy) -> Self {
        self.session_policy = policy;
        self
    }

    #[must_use]
    pub fn with_cache_url(mut self, url: Option<String>) -> Self {
        self.cache_url = url;
        self
    }

    #[must_use]
    pub fn with_cache_clustered(mut self, clustered: bool) -> Self {
        self.cache_clustered = clustered;
        self
    }

    #[must_use]
    pub fn with_role_scopes(mut self, role_scopes: HashMap<String, Vec<String>>) -> Self {
        self.role_scopes = role_scopes;
        self
    }

    #[must_use]
    pub fn with_token_leeway_seconds(mut self, seconds: i64) -> Self {
        self.token_leeway_seconds = seconds;
        self
    }

    #[must_use]
    pub fn with_captcha_ttl_seconds(mut self, seconds: i64) -> Self {
        self.captcha_ttl_seconds = seconds;
        self
    }

    /// Only mark cookies secure when the browser origin is served over HTTPS.
    fn cookie_secure(&self) -> bool {
        self.frontend_origin
            .as_deref()
            .map_or(true, |origin| origin.starts_with("https://"))
    }
}

/// Start the server
/// # Errors
/// Return error if failed to start the server
pub async fn new(port: u16, dsn: String, config: ApiConfig) -> Result<()> {
    // Connect to database
    let pool = PgPoolOptions::new()
        .min_connections(1)
        .max_connections(5)
        .max_lifetime(Duration::from_secs(60 * 2))
        .acquire_timeout(Duration::from_secs(5))
        .test_before_acquire(true)
        .connect(&dsn)
        .await
        .context("Failed to connect to database")?;

    let cache: Arc<dyn SessionCache> = match config.cache_url.as_deref() {
        Some(url) => {
            let redis_config =
                RedisConfig::new(url.to_string()).with_clustered(config.cache_clustered);
            Arc::new(
                RedisSessionCache::connect(redis_config)
                    .await
                    .context("Failed to connect to session cache")?,
            )
        }
        None => {
            warn!("no cache URL configured; session mirrors stay process-local");
            Arc::new(InMemorySessionCache::new())
        }
    };

    let repo = Arc::new(PgSessionRepository::new(pool.clone()));
    let store = Arc::new(SessionStore::new(
        repo,
        cache.clone(),
        config.session_policy.clone(),
    ));
    let scope_map = Arc::new(ScopeMap::new(config.role_scopes.clone()));
    let resolver = Arc::new(IdentityResolver::new(
        config.signing_secret.clone(),
        store.clone(),
        scope_map.clone(),
        config.cookie_name.clone(),
        config.token_leeway_seconds,
    ));
    let cookie_config = Arc::new(CookieConfig::new(
        config.cookie_name.clone(),
        config.cookie_secure(),
    ));
    let captcha_config = Arc::new(CaptchaConfig::new(
        config.signing_secret.clone(),
        config.captcha_ttl_seconds,
    ));
    let redirect = Arc::new(config.redirect.clone());

    spawn_purge_worker(store.clone());

    let app = Router::new()
        .route("/health", get(handlers::health::health))
        .route("/openapi.json", get(openapi::serve))
        .route("/v1/sessions", post(handlers::session::create_session))
        .route(
            "/v1/sessions/:session_id",
            get(handlers::session::get_session).delete(handlers::session::delete_session),
        )
        .route("/v1/auth/logout", post(handlers::session::logout))
        .route("/v1/captcha", post(handlers::captcha::new_challenge))
        .route("/v1/captcha/image", get(handlers::captcha::challenge_image))
        .route(
            "/v1/captcha/verify",
            post(handlers::captcha::verify_challenge),
        )
        .layer(middleware::from_fn(auth::resolve_identity))
        .layer(
            ServiceBuilder::new()
                .layer(SetRequestHeaderLayer::if_not_present(
                    HeaderName::from_static("x-request-id"),
                    |_req: &_| HeaderValue::from_str(Ulid::new().to_string().as_str()).ok(),
                ))
                .layer(PropagateRequestIdLayer::new(HeaderName::from_static(
                    "x-request-id",
                )))
                .layer(TraceLayer::new_for_http().make_span_with(make_span))
                .layer(Extension(resolver))
                .layer(Extension(store))
                .layer(Extension(scope_map))
                .layer(Extension(cookie_config))
                .layer(Extension(captcha_config))
                .layer(Extension(redirect))
                .layer(Extension(cache))
                .layer(Extension(pool.clone())),
        );

    let app = match config.frontend_origin.as_deref() {
        Some(origin) => {
            let origin_value = frontend_origin(origin)?;
            let cors = CorsLayer::new()
                .allow_headers([CONTENT_TYPE, AUTHORIZATION])
                .allow_methods([Method::GET, Method::POST, Method::DELETE])
                .allow_origin(AllowOrigin::exact(origin_value))
                .allow_credentials(true);
            app.layer(cors)
        }
        None => app,
    };

    let listener = TcpListener::bind(format!("::0:{port}")).await?;

    info!("Listening on [::]:{}", port);

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

/// Sweep expired rows out of the durable store; mirrors age out on their
/// own TTL and need no sweeping.
fn spawn_purge_worker(store: Arc<SessionStore>) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(PURGE_INTERVAL);
        loop {
            ticker.tick().await;
            match store.purge_expired().await {
                Ok(0) => {}
                Ok(purged) => info!(purged, "purged expired sessions"),
                Err(err) => warn!("session purge failed: {err:#}"),
            }
        }
    });
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(error = %err, "failed to listen for shutdown signal");
        return;
    }
    info!("Gracefully shutdown");
}

fn make_span(request: &Request<Body>) -> Span {
    let request_id = request
        .headers()
        .get("x-request-id")
        .and_then(|val| val.to_str().ok())
        .unwrap_or("none");
    let matched_path = request
        .extensions()
        .get::<MatchedPath>()
        .map_or_else(|| request.uri().path(), MatchedPath::as_str);

    info_span!(
        "http.request",
        http.method = %request.method(),
        http.route = matched_path,
        request_id
    )
}

fn frontend_origin(frontend_origin: &str) -> Result<HeaderValue> {
    let parsed = Url::parse(frontend_origin)
        .with_context(|| format!("Invalid frontend origin: {frontend_origin}"))?;
    let host = parsed
        .host_str()
        .ok_or_else(|| anyhow!("Frontend origin must include a valid host: {frontend_origin}"))?;
    let port = parsed
        .port()
        .map_or_else(String::new, |port| format!(":{port}"));
    let origin = format!("{}://{}{}", parsed.scheme(), host, port);
    HeaderValue::from_str(&origin).context("Failed to build frontend origin header")
}

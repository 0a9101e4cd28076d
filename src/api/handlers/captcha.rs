//! Stateless challenge endpoints.
//!
//! The token is the only state: it travels to the client on issue and must
//! be echoed back with the user's answer. Every operation re-derives the
//! composite key from the server secret and the caller's address.

use axum::{
    extract::Query,
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Extension, Json,
};
use secrecy::ExposeSecret;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tracing::{error, info, warn};
use utoipa::ToSchema;

use super::extract_client_ip;
use crate::api::CaptchaConfig;
use crate::captcha;
use crate::token::now_unix_seconds;

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct ChallengeResponse {
    /// Opaque token the client echoes back with the answer.
    pub token: String,
    pub expires_in: i64,
}

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct VerifyChallengeRequest {
    pub token: String,
    pub value: String,
}

#[derive(Deserialize, Debug)]
pub struct ImageParams {
    pub token: String,
}

fn client_ip_or_reject(headers: &HeaderMap) -> Result<String, Response> {
    extract_client_ip(headers).ok_or_else(|| {
        warn!("refusing challenge operation without a client address");
        (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "client address unknown" })),
        )
            .into_response()
    })
}

#[utoipa::path(
    post,
    path = "/v1/captcha",
    responses(
        (status = 201, description = "Challenge issued", body = ChallengeResponse),
        (status = 400, description = "Client address could not be determined")
    ),
    tag = "captcha"
)]
pub async fn new_challenge(
    headers: HeaderMap,
    Extension(config): Extension<Arc<CaptchaConfig>>,
) -> Response {
    let client_ip = match client_ip_or_reject(&headers) {
        Ok(ip) => ip,
        Err(response) => return response,
    };

    match captcha::new(
        config.secret().expose_secret().as_bytes(),
        &client_ip,
        config.ttl_seconds(),
        now_unix_seconds(),
    ) {
        Ok(token) => (
            StatusCode::CREATED,
            Json(ChallengeResponse {
                token,
                expires_in: config.ttl_seconds(),
            }),
        )
            .into_response(),
        Err(err) => {
            error!("failed to issue challenge: {err:#}");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

#[utoipa::path(
    get,
    path = "/v1/captcha/image",
    params(
        ("token" = String, Query, description = "Challenge token to render")
    ),
    responses(
        (status = 200, description = "Challenge image as SVG"),
        (status = 400, description = "Client address could not be determined"),
        (status = 404, description = "Token does not verify for this client")
    ),
    tag = "captcha"
)]
pub async fn challenge_image(
    headers: HeaderMap,
    Query(params): Query<ImageParams>,
    Extension(config): Extension<Arc<CaptchaConfig>>,
) -> Response {
    let client_ip = match client_ip_or_reject(&headers) {
        Ok(ip) => ip,
        Err(response) => return response,
    };

    match captcha::render(
        &params.token,
        config.secret().expose_secret().as_bytes(),
        &client_ip,
    ) {
        Ok(image) => (
            StatusCode::OK,
            [
                (header::CONTENT_TYPE, "image/svg+xml"),
                (header::CACHE_CONTROL, "no-store"),
            ],
            image,
        )
            .into_response(),
        Err(_) => {
            info!("refusing to render a challenge that does not verify");
            StatusCode::NOT_FOUND.into_response()
        }
    }
}

#[utoipa::path(
    post,
    path = "/v1/captcha/verify",
    request_body = VerifyChallengeRequest,
    responses(
        (status = 204, description = "Challenge answered correctly"),
        (status = 400, description = "Invalid or expired token, or wrong value")
    ),
    tag = "captcha"
)]
pub async fn verify_challenge(
    headers: HeaderMap,
    Extension(config): Extension<Arc<CaptchaConfig>>,
    Json(body): Json<VerifyChallengeRequest>,
) -> Response {
    let client_ip = match client_ip_or_reject(&headers) {
        Ok(ip) => ip,
        Err(response) => return response,
    };

    match captcha::check(
        &body.token,
        &body.value,
        config.secret().expose_secret().as_bytes(),
        &client_ip,
        now_unix_seconds(),
    ) {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(err) => {
            // The audit log records the precise kind; the client learns only
            // that the challenge failed.
            info!(kind = %err, %client_ip, "challenge verification failed");
            (
                StatusCode::BAD_REQUEST,
                Json(json!({ "error": "invalid captcha" })),
            )
                .into_response()
        }
    }
}

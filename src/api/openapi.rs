//! `OpenAPI` document for the HTTP surface.

use axum::Json;
use utoipa::OpenApi;

use super::handlers::captcha::{ChallengeResponse, VerifyChallengeRequest};
use super::handlers::session::{CreateSessionRequest, CreateSessionResponse, SessionResponse};

#[derive(OpenApi)]
#[openapi(
    paths(
        super::handlers::health::health,
        super::handlers::session::get_session,
        super::handlers::session::create_session,
        super::handlers::session::delete_session,
        super::handlers::session::logout,
        super::handlers::captcha::new_challenge,
        super::handlers::captcha::challenge_image,
        super::handlers::captcha::verify_challenge,
    ),
    components(schemas(
        SessionResponse,
        CreateSessionRequest,
        CreateSessionResponse,
        ChallengeResponse,
        VerifyChallengeRequest,
    )),
    tags(
        (name = "sessions", description = "Session lifecycle and peer lookup"),
        (name = "auth", description = "Browser session endpoints"),
        (name = "captcha", description = "Stateless challenge endpoints"),
        (name = "health", description = "Service health")
    )
)]
pub struct ApiDoc;

pub async fn serve() -> Json<utoipa::openapi::OpenApi> {
    Json(ApiDoc::openapi())
}

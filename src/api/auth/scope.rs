//! Scope-based authorization gate.
//!
//! A pure decision over the [`AuthOutcome`] the resolver attached; no I/O.
//! Missing credentials and missing scope are distinct errors, but the
//! response body never reveals which part of a credential failed; the
//! audit log carries the detail.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use std::collections::BTreeSet;
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use super::AuthOutcome;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AuthzError {
    /// No usable auth material on the request.
    #[error("missing credentials")]
    MissingCredentials,
    /// Credentials are present but lack the required capability.
    #[error("forbidden")]
    Forbidden,
}

impl IntoResponse for AuthzError {
    fn into_response(self) -> Response {
        let status = match self {
            Self::MissingCredentials => StatusCode::UNAUTHORIZED,
            Self::Forbidden => StatusCode::FORBIDDEN,
        };
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

/// What a protected operation may use once the gate passes: identity for
/// audit logging, the raw token for pass-through to sub-requests.
#[derive(Debug)]
pub struct Grant<'a> {
    pub user_id: Uuid,
    pub client_id: Option<&'a str>,
    pub raw_token: &'a str,
    pub scopes: &'a BTreeSet<String>,
}

/// Gate an operation on `required_scope`.
///
/// # Errors
///
/// - `MissingCredentials` when the request is anonymous, carried an invalid
///   bearer credential, or the context lacks a raw token,
/// - `Forbidden` when the authenticated context does not hold the scope.
pub fn require_scope<'a>(
    outcome: &'a AuthOutcome,
    required_scope: &str,
) -> Result<Grant<'a>, AuthzError> {
    let context = match outcome {
        AuthOutcome::Authenticated(context) => context,
        AuthOutcome::Anonymous => {
            info!(required_scope, "rejecting unauthenticated request");
            return Err(AuthzError::MissingCredentials);
        }
        AuthOutcome::InvalidBearer(rejection) => {
            warn!(
                required_scope,
                ?rejection,
                "rejecting request with invalid bearer credential"
            );
            return Err(AuthzError::MissingCredentials);
        }
    };

    let Some(raw_token) = context.raw_token() else {
        warn!(required_scope, "auth context lacks a raw token");
        return Err(AuthzError::MissingCredentials);
    };

    if !context.scopes().contains(required_scope) {
        info!(
            user_id = %context.user_id(),
            required_scope,
            "rejecting request lacking scope"
        );
        return Err(AuthzError::Forbidden);
    }

    Ok(Grant {
        user_id: context.user_id(),
        client_id: context.client_id(),
        raw_token,
        scopes: context.scopes(),
    })
}

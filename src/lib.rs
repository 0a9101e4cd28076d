//! # Identeco (identity resolution & session lifecycle)
//!
//! `identeco` resolves the identity and authorization scope of inbound
//! requests in the service mesh, and owns the lifecycle of user sessions
//! across two independent stores of record: the legacy relational session
//! table (authoritative) and the distributed session cache (read-preferred
//! mirror shared with peer services).
//!
//! ## Identity Resolution
//!
//! Each request is annotated exactly once, in strict order: a signed bearer
//! token is verified first; only when no bearer credential is present at all
//! is the legacy cookie session consulted. An invalid-but-present bearer
//! token is a hard failure for the request and never falls back to cookie
//! auth, so stripping or corrupting a token cannot downgrade to a weaker
//! path.
//!
//! ## Sessions
//!
//! Session creation writes the relational store first and mirrors into the
//! cache best-effort; reads prefer the cache and read through to the
//! relational store on miss. Mirror entries carry a TTL that bounds how long
//! they may outlive the truth.
//!
//! ## Authorization
//!
//! Protected operations are gated on named scopes carried by the bearer
//! claims or translated from legacy role flags via a configurable mapping.
//! Missing credentials and missing scope are distinct failures, though the
//! response body never reveals which part of a credential failed.

pub mod api;
pub mod captcha;
pub mod cli;
pub mod session;
pub mod token;

#[allow(clippy::doc_markdown, clippy::needless_raw_string_hashes)]
pub mod built_info {
    include!(concat!(env!("OUT_DIR"), "/built.rs"));
}

pub const GIT_COMMIT_HASH: &str = match built_info::GIT_COMMIT_HASH {
    Some(hash) => hash,
    None => "unknown",
};

pub const APP_USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"),);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_git_commit_hash_format() {
        if GIT_COMMIT_HASH == "unknown" {
            // Acceptable in non-git build environments
            return;
        }
        // Should be a hex string (full SHA-1 is 40 chars, but could be short)
        assert!(
            GIT_COMMIT_HASH.chars().all(|c| c.is_ascii_hexdigit()),
            "GIT_COMMIT_HASH should be a hex string, got: {GIT_COMMIT_HASH}"
        );
        assert!(
            GIT_COMMIT_HASH.len() >= 7,
            "GIT_COMMIT_HASH should be at least 7 characters long, got: {GIT_COMMIT_HASH}"
        );
    }

    #[test]
    fn test_app_user_agent_format() {
        assert!(APP_USER_AGENT.starts_with(env!("CARGO_PKG_NAME")));
        assert!(APP_USER_AGENT.contains(env!("CARGO_PKG_VERSION")));
    }
}

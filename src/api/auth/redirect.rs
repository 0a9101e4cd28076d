//! Post-login/logout redirect target validation.

use anyhow::{Context, Result};
use regex::Regex;

/// Default allow-pattern: same-site relative paths with an optional query.
pub const DEFAULT_ALLOW_PATTERN: &str = r"^/[A-Za-z0-9_\-./~%?=&]*$";
pub const DEFAULT_MAX_LEN: usize = 512;
pub const DEFAULT_PAGE: &str = "/";

/// Validates candidate redirect targets against an allow-pattern and a
/// length bound; anything that fails falls back to the fixed default.
#[derive(Debug, Clone)]
pub struct RedirectPolicy {
    allow: Regex,
    max_len: usize,
    default_page: String,
}

impl RedirectPolicy {
    /// Build the policy from configuration strings.
    ///
    /// # Errors
    ///
    /// Returns an error when the allow-pattern is not a valid regex; this is
    /// a startup-time configuration failure, not a per-request one.
    pub fn from_config(pattern: &str, max_len: usize, default_page: String) -> Result<Self> {
        let allow = Regex::new(pattern)
            .with_context(|| format!("invalid redirect allow-pattern: {pattern}"))?;
        Ok(Self {
            allow,
            max_len,
            default_page,
        })
    }

    #[must_use]
    pub fn default_page(&self) -> &str {
        &self.default_page
    }

    /// The redirect target actually used: the candidate when it survives
    /// validation, the configured default otherwise.
    ///
    /// Absolute URLs and protocol-relative targets (`//host`) always fall
    /// back, closing the open-redirect hole regardless of the pattern.
    #[must_use]
    pub fn good_next_page<'a>(&'a self, candidate: Option<&'a str>) -> &'a str {
        let Some(candidate) = candidate.map(str::trim) else {
            return &self.default_page;
        };
        if candidate.is_empty() || candidate.len() > self.max_len {
            return &self.default_page;
        }
        if !candidate.starts_with('/') || candidate.starts_with("//") {
            return &self.default_page;
        }
        if !self.allow.is_match(candidate) {
            return &self.default_page;
        }
        candidate
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> RedirectPolicy {
        RedirectPolicy::from_config(DEFAULT_ALLOW_PATTERN, DEFAULT_MAX_LEN, "/".to_string())
            .expect("default pattern compiles")
    }

    #[test]
    fn foreign_absolute_url_falls_back_to_default() {
        let policy = policy();
        assert_eq!(
            policy.good_next_page(Some("https://evil.example/x")),
            "/"
        );
    }

    #[test]
    fn same_site_relative_path_passes_unchanged() {
        let policy = policy();
        assert_eq!(
            policy.good_next_page(Some("/account/settings?tab=security")),
            "/account/settings?tab=security"
        );
    }

    #[test]
    fn protocol_relative_target_falls_back() {
        let policy = policy();
        assert_eq!(policy.good_next_page(Some("//evil.example/x")), "/");
    }

    #[test]
    fn over_length_target_falls_back() {
        let policy = policy();
        let long = format!("/{}", "a".repeat(DEFAULT_MAX_LEN));
        assert_eq!(policy.good_next_page(Some(&long)), "/");
    }

    #[test]
    fn missing_or_empty_candidate_uses_default() {
        let policy = policy();
        assert_eq!(policy.good_next_page(None), "/");
        assert_eq!(policy.good_next_page(Some("   ")), "/");
    }

    #[test]
    fn pattern_violations_fall_back() {
        let policy = policy();
        assert_eq!(policy.good_next_page(Some("/path with spaces")), "/");
        assert_eq!(policy.good_next_page(Some("/path\\x")), "/");
    }

    #[test]
    fn invalid_pattern_is_a_configuration_error() {
        let result = RedirectPolicy::from_config("([", 10, "/".to_string());
        assert!(result.is_err());
    }
}

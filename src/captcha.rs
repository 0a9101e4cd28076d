//! Stateless challenge tokens for human verification.
//!
//! A challenge is fully self-describing: the expected value and an absolute
//! expiry travel inside the token, signed with a key derived from the server
//! secret and the requesting client's address. No server-side record exists.
//! Folding the address into the MAC key (rather than carrying it as a claim)
//! means a token intercepted in transit cannot be replayed from a different
//! address; it is not a defense against address spoofing. Within its TTL a
//! token remains replayable from the originating address, so callers must
//! treat one successful check as consuming the token.

use anyhow::{Context, Result};
use base64ct::{Base64UrlUnpadded, Encoding};
use hmac::{Hmac, Mac};
use rand::{rngs::OsRng, RngCore};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

/// Number of characters the user is asked to transcribe.
pub const VALUE_LEN: usize = 6;

// Lowercase letters and digits without lookalikes (no i, l, o, 0, 1).
const CHARSET: &[u8] = b"abcdefghjkmnpqrstuvwxyz23456789";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum Error {
    /// Decoding or signature verification failed, or the token is expired.
    #[error("invalid challenge token")]
    InvalidToken,
    /// The token is valid but the submitted value does not match.
    #[error("challenge value does not match")]
    InvalidValue,
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
struct ChallengePayload {
    value: String,
    exp: i64,
}

fn composite_mac(secret: &[u8], client_ip: &str) -> HmacSha256 {
    let mut key = Vec::with_capacity(secret.len() + client_ip.len());
    key.extend_from_slice(secret);
    key.extend_from_slice(client_ip.as_bytes());
    HmacSha256::new_from_slice(&key).expect("HMAC accepts keys of any length")
}

fn seal(payload: &ChallengePayload, secret: &[u8], client_ip: &str) -> String {
    let json = serde_json::to_vec(payload).expect("challenge payload serializes");
    let payload_b64 = Base64UrlUnpadded::encode_string(&json);

    let mut mac = composite_mac(secret, client_ip);
    mac.update(payload_b64.as_bytes());
    let tag = mac.finalize().into_bytes();

    format!("{payload_b64}.{}", Base64UrlUnpadded::encode_string(&tag))
}

fn open(token: &str, secret: &[u8], client_ip: &str) -> Result<ChallengePayload, Error> {
    let mut parts = token.split('.');
    let payload_b64 = parts.next().ok_or(Error::InvalidToken)?;
    let sig_b64 = parts.next().ok_or(Error::InvalidToken)?;
    if parts.next().is_some() {
        return Err(Error::InvalidToken);
    }

    let tag = Base64UrlUnpadded::decode_vec(sig_b64).map_err(|_| Error::InvalidToken)?;
    let mut mac = composite_mac(secret, client_ip);
    mac.update(payload_b64.as_bytes());
    mac.verify_slice(&tag).map_err(|_| Error::InvalidToken)?;

    let json = Base64UrlUnpadded::decode_vec(payload_b64).map_err(|_| Error::InvalidToken)?;
    serde_json::from_slice(&json).map_err(|_| Error::InvalidToken)
}

/// Generate a random challenge value from the transcription charset.
fn generate_value() -> Result<String> {
    let mut bytes = [0u8; VALUE_LEN];
    OsRng
        .try_fill_bytes(&mut bytes)
        .context("failed to generate challenge value")?;
    Ok(bytes
        .iter()
        .map(|b| CHARSET[*b as usize % CHARSET.len()] as char)
        .collect())
}

/// Create a new challenge token bound to `client_ip`, expiring `ttl_seconds`
/// after `now_unix_seconds`.
///
/// # Errors
///
/// Returns an error only if the system randomness source fails.
pub fn new(
    secret: &[u8],
    client_ip: &str,
    ttl_seconds: i64,
    now_unix_seconds: i64,
) -> Result<String> {
    let payload = ChallengePayload {
        value: generate_value()?,
        exp: now_unix_seconds.saturating_add(ttl_seconds),
    };
    Ok(seal(&payload, secret, client_ip))
}

/// Check a submitted value against a challenge token.
///
/// # Errors
///
/// - `InvalidToken` when the token fails to decode under the composite key
///   (wrong secret or different client address) or is expired,
/// - `InvalidValue` when the token is valid but the value does not match.
pub fn check(
    token: &str,
    candidate_value: &str,
    secret: &[u8],
    client_ip: &str,
    now_unix_seconds: i64,
) -> Result<(), Error> {
    let payload = open(token, secret, client_ip)?;
    if payload.exp <= now_unix_seconds {
        return Err(Error::InvalidToken);
    }
    if !payload.value.eq_ignore_ascii_case(candidate_value.trim()) {
        return Err(Error::InvalidValue);
    }
    Ok(())
}

/// Render the challenge as an SVG image.
///
/// Pure rendering: the token must authenticate under the composite key, but
/// expiry is not consulted here; `check` owns that decision.
///
/// # Errors
///
/// Returns `InvalidToken` when the token fails to decode.
pub fn render(token: &str, secret: &[u8], client_ip: &str) -> Result<Vec<u8>, Error> {
    let payload = open(token, secret, client_ip)?;
    Ok(render_svg(&payload.value))
}

/// Draw the value with per-glyph jitter and strike-through curves.
///
/// Jitter is derived from a digest of the value so the same token always
/// renders the same image.
fn render_svg(value: &str) -> Vec<u8> {
    let digest = Sha256::digest(value.as_bytes());
    let width = 40 + 30 * value.len();
    let height = 70;

    let mut svg = String::new();
    svg.push_str(&format!(
        r#"<svg xmlns="http://www.w3.org/2000/svg" width="{width}" height="{height}" viewBox="0 0 {width} {height}">"#
    ));
    svg.push_str(r##"<rect width="100%" height="100%" fill="#f4f1ea"/>"##);

    for (i, ch) in value.chars().enumerate() {
        let seed = digest[i % digest.len()];
        let x = 24 + 30 * i;
        let y = 40 + i64::from(seed % 13) - 6;
        let rotation = i64::from(seed % 29) - 14;
        svg.push_str(&format!(
            r##"<text x="{x}" y="{y}" font-family="monospace" font-size="34" fill="#2d2a26" transform="rotate({rotation} {x} {y})">{ch}</text>"##
        ));
    }

    for line in 0..3 {
        let a = digest[(8 + line * 3) % digest.len()];
        let b = digest[(9 + line * 3) % digest.len()];
        let c = digest[(10 + line * 3) % digest.len()];
        let y0 = 10 + u32::from(a) % 50;
        let y1 = 10 + u32::from(b) % 50;
        let ctrl = 5 + u32::from(c) % 60;
        svg.push_str(&format!(
            r##"<path d="M0 {y0} Q {mid} {ctrl} {width} {y1}" stroke="#8a8478" stroke-width="2" fill="none"/>"##,
            mid = width / 2,
        ));
    }

    svg.push_str("</svg>");
    svg.into_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &[u8] = b"a-unit-test-secret-at-least-32-bytes!";
    const CLIENT_IP: &str = "192.0.2.10";
    const NOW: i64 = 1_700_000_000;

    fn sealed(value: &str, exp: i64) -> String {
        seal(
            &ChallengePayload {
                value: value.to_string(),
                exp,
            },
            SECRET,
            CLIENT_IP,
        )
    }

    #[test]
    fn correct_value_from_originating_ip_passes() {
        let token = sealed("abc123", NOW + 300);
        assert_eq!(check(&token, "abc123", SECRET, CLIENT_IP, NOW), Ok(()));
    }

    #[test]
    fn value_comparison_ignores_case_and_whitespace() {
        let token = sealed("abc123", NOW + 300);
        assert_eq!(check(&token, " ABC123 ", SECRET, CLIENT_IP, NOW), Ok(()));
    }

    #[test]
    fn wrong_value_is_invalid_value() {
        let token = sealed("abc123", NOW + 300);
        assert_eq!(
            check(&token, "zzzzzz", SECRET, CLIENT_IP, NOW),
            Err(Error::InvalidValue)
        );
    }

    #[test]
    fn different_ip_is_invalid_token() {
        let token = sealed("abc123", NOW + 300);
        assert_eq!(
            check(&token, "abc123", SECRET, "198.51.100.7", NOW),
            Err(Error::InvalidToken)
        );
    }

    #[test]
    fn expired_token_is_invalid_regardless_of_value() {
        let token = sealed("abc123", NOW - 1);
        assert_eq!(
            check(&token, "abc123", SECRET, CLIENT_IP, NOW),
            Err(Error::InvalidToken)
        );
    }

    #[test]
    fn tampered_payload_is_invalid_token() {
        let token = sealed("abc123", NOW + 300);
        let mut bytes = token.into_bytes();
        bytes[2] = if bytes[2] == b'A' { b'B' } else { b'A' };
        let tampered = String::from_utf8(bytes).expect("ascii token");
        assert_eq!(
            check(&tampered, "abc123", SECRET, CLIENT_IP, NOW),
            Err(Error::InvalidToken)
        );
    }

    #[test]
    fn new_tokens_verify_via_render_and_are_fresh() {
        let token = new(SECRET, CLIENT_IP, 300, NOW).expect("challenge");
        // The embedded value is recoverable by the owner of the secret.
        let payload = open(&token, SECRET, CLIENT_IP).expect("opens");
        assert_eq!(payload.value.len(), VALUE_LEN);
        assert!(payload
            .value
            .bytes()
            .all(|b| CHARSET.contains(&b)));
        assert_eq!(payload.exp, NOW + 300);
        assert_eq!(
            check(&token, &payload.value, SECRET, CLIENT_IP, NOW),
            Ok(())
        );
    }

    #[test]
    fn render_is_deterministic_and_contains_glyphs() {
        let token = sealed("xy42ab", NOW + 300);
        let first = render(&token, SECRET, CLIENT_IP).expect("renders");
        let second = render(&token, SECRET, CLIENT_IP).expect("renders");
        assert_eq!(first, second);

        let svg = String::from_utf8(first).expect("svg is utf-8");
        assert!(svg.starts_with("<svg"));
        assert_eq!(svg.matches("<text").count(), 6);
    }

    #[test]
    fn render_rejects_foreign_tokens() {
        let token = sealed("abc123", NOW + 300);
        assert_eq!(
            render(&token, SECRET, "203.0.113.99"),
            Err(Error::InvalidToken)
        );
    }
}

//! Optional API key check for the `/v1/*` surface.

use std::collections::HashSet;

use hyper::header::AUTHORIZATION;
use hyper::HeaderMap;
use lazy_static::lazy_static;

use crate::web::error::OrchestratorError;

lazy_static! {
    /// Sample-config values that mean "auth not configured".
    static ref PLACEHOLDER_API_KEYS: HashSet<&'static str> =
        ["default-key", "default-key-change-me"].into_iter().collect();
}

/// The key clients must present, or `None` when auth is disabled.
pub fn effective_api_key(configured: &str) -> Option<String> {
    let key = configured.trim();
    if key.is_empty() || PLACEHOLDER_API_KEYS.contains(key) {
        None
    } else {
        Some(key.to_string())
    }
}

/// Key offered via `Authorization: Bearer` or, failing that, `X-API-Key`.
fn provided_key(headers: &HeaderMap) -> Option<&str> {
    let bearer = headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| {
            let (scheme, token) = v.split_once(' ')?;
            scheme.eq_ignore_ascii_case("bearer").then(|| token.trim())
        })
        .filter(|token| !token.is_empty());

    bearer.or_else(|| {
        headers
            .get("x-api-key")
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
    })
}

pub fn check_api_key(expected: Option<&str>, path: &str, headers: &HeaderMap) -> Result<(), OrchestratorError> {
    let Some(expected) = expected else {
        return Ok(());
    };
    if !path.starts_with("/v1/") {
        return Ok(());
    }
    match provided_key(headers) {
        Some(key) if key == expected => Ok(()),
        _ => Err(OrchestratorError::Unauthorized),
    }
}

//! Static bearer-token check.

use crate::error::ProxyError;
use actix_web::HttpRequest;

const BEARER_PREFIX: &str = "Bearer ";

/// Validate an `Authorization` header value against `expected`.
///
/// An empty `expected` key disables the check.
pub fn check_bearer(expected: &str, header: Option<&str>) -> Result<(), ProxyError> {
    if expected.is_empty() {
        return Ok(());
    }

    let token = header
        .and_then(|value| value.strip_prefix(BEARER_PREFIX))
        .ok_or_else(|| ProxyError::Unauthorized("Missing bearer token".to_string()))?;

    if token != expected {
        return Err(ProxyError::Forbidden("Invalid bearer token".to_string()));
    }
    Ok(())
}

pub fn authorization(req: &HttpRequest) -> Option<&str> {
    req.headers()
        .get("authorization")
        .and_then(|value| value.to_str().ok())
}

pub fn authorize(req: &HttpRequest, expected: &str) -> Result<(), ProxyError> {
    check_bearer(expected, authorization(req))
}

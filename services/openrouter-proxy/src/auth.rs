//! Local authentication gate
//!
//! Every request outside the configured public paths must carry
//! `Authorization: Bearer <access-key>`. The comparison is constant-time so
//! the gate leaks nothing about the key through response timing. A denial
//! short-circuits before any key selection happens.

use axum::http::{HeaderMap, StatusCode, header};
use axum::response::Response;
use common::Secret;
use subtle::ConstantTimeEq;
use tracing::debug;

use crate::relay::error_response;

/// Gate decision for an inbound request.
pub enum Gate {
    Allowed,
    Denied(Response),
}

/// Whether a path is served without local authentication (prefix match).
pub fn is_public(path: &str, public_endpoints: &[String]) -> bool {
    public_endpoints.iter().any(|ep| path.starts_with(ep.as_str()))
}

/// Check the local access key for a request path.
pub fn authorize(
    headers: &HeaderMap,
    path: &str,
    access_key: &Secret<String>,
    public_endpoints: &[String],
    request_id: &str,
) -> Gate {
    if is_public(path, public_endpoints) {
        return Gate::Allowed;
    }

    let Some(value) = headers.get(header::AUTHORIZATION) else {
        debug!(path, "request missing authorization header");
        return denied("Authorization header missing", request_id);
    };
    let Ok(value) = value.to_str() else {
        return denied("Invalid authorization header", request_id);
    };
    let Some((scheme, token)) = value.split_once(' ') else {
        return denied("Invalid authentication scheme", request_id);
    };
    if !scheme.eq_ignore_ascii_case("bearer") {
        return denied("Invalid authentication scheme", request_id);
    }

    let matches: bool = token
        .trim()
        .as_bytes()
        .ct_eq(access_key.expose().as_bytes())
        .into();
    if matches {
        Gate::Allowed
    } else {
        debug!(path, "access key mismatch");
        denied("Invalid access key", request_id)
    }
}

fn denied(message: &str, request_id: &str) -> Gate {
    Gate::Denied(error_response(
        StatusCode::UNAUTHORIZED,
        "auth_error",
        message,
        request_id,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn access_key() -> Secret<String> {
        Secret::new("local-secret-key".to_string())
    }

    fn public_endpoints() -> Vec<String> {
        vec!["/api/v1/models".to_string()]
    }

    fn headers_with_auth(value: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, HeaderValue::from_str(value).unwrap());
        headers
    }

    fn assert_denied(gate: Gate) -> Response {
        match gate {
            Gate::Denied(resp) => {
                assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
                resp
            }
            Gate::Allowed => panic!("expected Denied"),
        }
    }

    #[test]
    fn public_path_allowed_without_header() {
        let gate = authorize(
            &HeaderMap::new(),
            "/api/v1/models",
            &access_key(),
            &public_endpoints(),
            "req_test",
        );
        assert!(matches!(gate, Gate::Allowed));
    }

    #[test]
    fn public_prefix_match_covers_subpaths() {
        let gate = authorize(
            &HeaderMap::new(),
            "/api/v1/models/openai/gpt-4o",
            &access_key(),
            &public_endpoints(),
            "req_test",
        );
        assert!(matches!(gate, Gate::Allowed));
    }

    #[test]
    fn missing_header_denied() {
        let gate = authorize(
            &HeaderMap::new(),
            "/api/v1/chat/completions",
            &access_key(),
            &public_endpoints(),
            "req_test",
        );
        assert_denied(gate);
    }

    #[test]
    fn wrong_scheme_denied() {
        let gate = authorize(
            &headers_with_auth("Basic bG9jYWw="),
            "/api/v1/chat/completions",
            &access_key(),
            &public_endpoints(),
            "req_test",
        );
        assert_denied(gate);
    }

    #[test]
    fn wrong_key_denied() {
        let gate = authorize(
            &headers_with_auth("Bearer not-the-key"),
            "/api/v1/chat/completions",
            &access_key(),
            &public_endpoints(),
            "req_test",
        );
        assert_denied(gate);
    }

    #[test]
    fn correct_key_allowed() {
        let gate = authorize(
            &headers_with_auth("Bearer local-secret-key"),
            "/api/v1/chat/completions",
            &access_key(),
            &public_endpoints(),
            "req_test",
        );
        assert!(matches!(gate, Gate::Allowed));
    }

    #[test]
    fn bearer_scheme_is_case_insensitive() {
        let gate = authorize(
            &headers_with_auth("bearer local-secret-key"),
            "/api/v1/chat/completions",
            &access_key(),
            &public_endpoints(),
            "req_test",
        );
        assert!(matches!(gate, Gate::Allowed));
    }

    #[test]
    fn key_with_different_length_denied() {
        // ct_eq on unequal lengths must still deny, not panic.
        let gate = authorize(
            &headers_with_auth("Bearer local-secret-key-plus-extra"),
            "/api/v1/chat/completions",
            &access_key(),
            &public_endpoints(),
            "req_test",
        );
        assert_denied(gate);
    }

    #[test]
    fn is_public_requires_prefix() {
        assert!(is_public("/api/v1/models", &public_endpoints()));
        assert!(!is_public("/api/v1/chat/completions", &public_endpoints()));
        assert!(!is_public("/health", &public_endpoints()));
    }
}

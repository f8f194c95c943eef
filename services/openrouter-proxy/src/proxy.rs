//! Request handling and key rotation
//!
//! Receives inbound requests, authenticates them against the local access
//! key, then drives the retry loop: pick a key, dispatch, and on a rate-limit
//! hit cool the key down and move to the next one. A request makes at most
//! one attempt per pool key; when every key is cooling down the client gets a
//! 429 describing the pool state.

use crate::auth::{self, Gate};
use crate::config::Config;
use crate::metrics;
use crate::relay::{Dispatcher, Outcome, error_response, is_hop_by_hop};
use axum::body::Body;
use axum::http::{Request, StatusCode, header};
use axum::response::{IntoResponse, Response};
use common::Secret;
use keypool::{KeyPool, Selector};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info, instrument, warn};

/// Maximum inbound request body size (10 MiB)
const MAX_BODY_BYTES: usize = 10 * 1024 * 1024;

/// Paths (relative to the upstream base URL) that accept a model field and
/// are subject to the free-model filter.
const COMPLETION_ENDPOINTS: &[&str] = &["/completions", "/chat/completions"];

/// Path prefix the proxy serves; everything else is 404.
const API_PREFIX: &str = "/api/v1";

/// Shared state passed to the proxy handler via axum State extractor
#[derive(Clone)]
pub struct ProxyState {
    pub dispatcher: Arc<Dispatcher>,
    pub pool: Arc<KeyPool>,
    pub selector: Selector,
    pub base_url: String,
    pub access_key: Secret<String>,
    pub public_endpoints: Vec<String>,
    pub free_models_only: bool,
}

impl ProxyState {
    pub fn new(config: &Config, dispatcher: Dispatcher, pool: KeyPool) -> Self {
        Self {
            dispatcher: Arc::new(dispatcher),
            pool: Arc::new(pool),
            selector: Selector {
                strategy: config.openrouter.strategy,
                same: config.openrouter.same,
            },
            base_url: config.openrouter.base_url.clone(),
            access_key: config
                .server
                .access_key
                .clone()
                .unwrap_or_else(|| Secret::new(String::new())),
            public_endpoints: config.server.public_endpoints.clone(),
            free_models_only: config.openrouter.free_models_only,
        }
    }
}

/// Handle one inbound API request end to end.
#[instrument(skip_all, fields(request_id = %request_id, method = %request.method(), path = %request.uri().path()))]
pub async fn proxy_request(
    state: &ProxyState,
    request: Request<Body>,
    request_id: String,
) -> Response {
    let started = Instant::now();
    let method = request.method().clone();
    let resp = handle(state, request, &request_id).await;
    metrics::record_request(resp.status().as_u16(), method.as_str(), started.elapsed());
    resp
}

async fn handle(state: &ProxyState, request: Request<Body>, request_id: &str) -> Response {
    let path = request.uri().path().to_string();

    let Some(rest) = path.strip_prefix(API_PREFIX) else {
        return error_response(
            StatusCode::NOT_FOUND,
            "not_found",
            "unknown path",
            request_id,
        );
    };

    match auth::authorize(
        request.headers(),
        &path,
        &state.access_key,
        &state.public_endpoints,
        request_id,
    ) {
        Gate::Allowed => {}
        Gate::Denied(resp) => {
            metrics::record_auth_failure();
            return resp;
        }
    }

    // Build the upstream URL from the base URL plus the path after the API
    // prefix, carrying the query string through.
    let upstream_url = match request.uri().query() {
        Some(q) => format!("{}{rest}?{q}", state.base_url),
        None => format!("{}{rest}", state.base_url),
    };

    let method = match reqwest::Method::from_bytes(request.method().as_str().as_bytes()) {
        Ok(m) => m,
        Err(e) => {
            return error_response(
                StatusCode::METHOD_NOT_ALLOWED,
                "proxy_error",
                &format!("unsupported method: {e}"),
                request_id,
            );
        }
    };

    // Collect request headers, dropping hop-by-hop plus the ones the proxy
    // owns: host (wrong for upstream), authorization (replaced by a pool
    // key), content-length (reqwest recomputes it).
    let mut headers = reqwest::header::HeaderMap::new();
    for (name, value) in request.headers() {
        if is_hop_by_hop(name.as_str()) {
            continue;
        }
        if name == header::HOST
            || name == header::AUTHORIZATION
            || name == header::CONTENT_LENGTH
        {
            continue;
        }
        headers.insert(name.clone(), value.clone());
    }

    let body = match axum::body::to_bytes(request.into_body(), MAX_BODY_BYTES).await {
        Ok(b) => b,
        Err(e) => {
            error!(error = %e, "failed to read request body");
            return error_response(
                StatusCode::BAD_REQUEST,
                "proxy_error",
                &format!("invalid request body: {e}"),
                request_id,
            );
        }
    };

    if state.free_models_only
        && COMPLETION_ENDPOINTS.contains(&rest)
        && let Some(resp) = reject_paid_model(&body, request_id)
    {
        return resp;
    }

    // Public endpoints go out without a pool key and without retry.
    if auth::is_public(&path, &state.public_endpoints) {
        return match state
            .dispatcher
            .dispatch(method, &upstream_url, headers, body, None, request_id)
            .await
        {
            Outcome::Relay(resp) | Outcome::Fail(resp) => resp,
            // Unreachable without a credential, but degrade gracefully.
            Outcome::RateLimited { .. } => error_response(
                StatusCode::TOO_MANY_REQUESTS,
                "proxy_error",
                "upstream rate limited",
                request_id,
            ),
        };
    }

    // Retry loop: at most one attempt per key, never revisiting a key that
    // was rate limited during this request.
    let mut excluded: HashSet<usize> = HashSet::new();
    for attempt in 0..state.pool.len() {
        let Some(selected) = state.selector.pick(&state.pool, &excluded).await else {
            break;
        };

        if attempt > 0 {
            info!(
                attempt,
                key = %state.pool.masked(selected.index),
                "retrying with next key"
            );
        }

        match state
            .dispatcher
            .dispatch(
                method.clone(),
                &upstream_url,
                headers.clone(),
                body.clone(),
                Some(&selected.credential),
                request_id,
            )
            .await
        {
            Outcome::Relay(resp) => {
                // Relayed upstream errors are final but not successes: only a
                // 2xx earns the last-success slot the `same` option prefers.
                if resp.status().is_success() {
                    state.pool.mark_used(selected.index).await;
                }
                return resp;
            }
            Outcome::Fail(resp) => return resp,
            Outcome::RateLimited { reset_at_ms } => {
                metrics::record_cooldown(&state.pool.masked(selected.index));
                state.pool.cool_down(selected.index, reset_at_ms).await;
                excluded.insert(selected.index);
            }
        }
    }

    let (total, available, cooling) = state.pool.counts().await;
    warn!(total, available, cooling, "key pool exhausted");
    metrics::record_pool_exhausted();
    (
        StatusCode::TOO_MANY_REQUESTS,
        [(header::CONTENT_TYPE, "application/json")],
        state.pool.exhausted_body().await.to_string(),
    )
        .into_response()
}

/// Enforce the free-model policy on completion requests: the JSON body must
/// name a model with the `:free` suffix. Malformed bodies are left for
/// upstream to reject.
fn reject_paid_model(body: &[u8], request_id: &str) -> Option<Response> {
    let payload: serde_json::Value = serde_json::from_slice(body).ok()?;
    let model = payload.get("model")?.as_str()?;
    if model.ends_with(":free") {
        return None;
    }
    Some(error_response(
        StatusCode::BAD_REQUEST,
        "invalid_request_error",
        &format!("model '{model}' is not a free model (expected a ':free' suffix)"),
        request_id,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn free_filter_rejects_paid_model() {
        let body = serde_json::json!({"model": "openai/gpt-4o"}).to_string();
        let resp = reject_paid_model(body.as_bytes(), "req_test").unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn free_filter_accepts_free_model() {
        let body = serde_json::json!({"model": "meta-llama/llama-3.1-8b-instruct:free"}).to_string();
        assert!(reject_paid_model(body.as_bytes(), "req_test").is_none());
    }

    #[test]
    fn free_filter_ignores_malformed_body() {
        assert!(reject_paid_model(b"not json", "req_test").is_none());
        assert!(reject_paid_model(b"{}", "req_test").is_none());
    }

    #[test]
    fn completion_endpoints_cover_both_shapes() {
        assert!(COMPLETION_ENDPOINTS.contains(&"/chat/completions"));
        assert!(COMPLETION_ENDPOINTS.contains(&"/completions"));
        assert!(!COMPLETION_ENDPOINTS.contains(&"/models"));
    }
}

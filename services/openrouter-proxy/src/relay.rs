//! Upstream dispatch
//!
//! Sends a single attempt to OpenRouter with one pool key attached and
//! classifies the result: relay it verbatim, or report a rate-limit hit so the
//! retry loop can rotate to another key. Rate limits hide in three places —
//! the HTTP status, a JSON error embedded in a 200 body, and the first event
//! of an SSE stream — so successful responses get a first-chunk peek before
//! the body is handed back to the client.

use axum::body::Body;
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use futures_util::StreamExt;
use keypool::{Classifier, RATE_LIMIT_STATUS, RateLimitHit};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Headers to strip in both directions (hop-by-hop per RFC 2616 Section 13.5.1)
pub const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Check if a header is hop-by-hop (stripped before forwarding)
pub fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP_HEADERS
        .iter()
        .any(|h| h.eq_ignore_ascii_case(name))
}

/// JSON error response: {"error":{"type":"...","message":"...","request_id":"req_..."}}
pub fn error_response(
    status: StatusCode,
    error_type: &str,
    message: &str,
    request_id: &str,
) -> Response {
    let body = serde_json::json!({
        "error": {
            "type": error_type,
            "message": message,
            "request_id": request_id,
        }
    });
    (
        status,
        [(header::CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
        .into_response()
}

/// Result of one upstream attempt with one key.
pub enum Outcome {
    /// Response is final, relay it to the client as-is.
    Relay(Response),
    /// The key that made this attempt hit a rate limit. Cool it down
    /// (honouring the reset hint when present) and try another key.
    RateLimited { reset_at_ms: Option<u64> },
    /// Upstream rejected the request for a reason no other key will fix.
    Fail(Response),
}

/// Sends requests upstream and classifies the responses.
pub struct Dispatcher {
    client: reqwest::Client,
    classifier: Classifier,
    /// Pause before reporting a vendor-embedded rate limit, giving the
    /// vendor's own window a chance to clear (0 disables).
    vendor_rate_delay: Duration,
}

impl Dispatcher {
    pub fn new(client: reqwest::Client, vendor_rate_delay: Duration) -> Self {
        Self {
            client,
            classifier: Classifier::default(),
            vendor_rate_delay,
        }
    }

    /// One attempt against `url`. `credential` is the pool key to attach; when
    /// `None` (public endpoints) the request goes out bare and every response
    /// is relayed without rate-limit classification.
    pub async fn dispatch(
        &self,
        method: reqwest::Method,
        url: &str,
        headers: reqwest::header::HeaderMap,
        body: Bytes,
        credential: Option<&str>,
        request_id: &str,
    ) -> Outcome {
        let mut req = self
            .client
            .request(method, url)
            .headers(headers)
            .body(body);
        if let Some(key) = credential {
            req = req.bearer_auth(key);
        }

        let resp = match req.send().await {
            Ok(resp) => resp,
            Err(e) if e.is_timeout() => {
                error!(error = %e, url, "upstream timeout");
                return Outcome::Fail(error_response(
                    StatusCode::GATEWAY_TIMEOUT,
                    "proxy_error",
                    &format!("upstream timeout: {e}"),
                    request_id,
                ));
            }
            Err(e) => {
                error!(error = %e, url, "upstream request failed");
                return Outcome::Fail(error_response(
                    StatusCode::BAD_GATEWAY,
                    "proxy_error",
                    &format!("upstream error: {e}"),
                    request_id,
                ));
            }
        };

        let status = resp.status();

        if credential.is_none() {
            return Outcome::Relay(self.relay_streaming(resp).await);
        }

        if status.as_u16() == RATE_LIMIT_STATUS {
            // Buffer the body: the reset hint lives in the error payload.
            let text = resp.text().await.unwrap_or_default();
            let hit = self.classifier.scan_json(&text);
            let reset_at_ms = hit.as_ref().and_then(|h| h.reset_at_ms);
            if let Some(hit) = &hit {
                self.vendor_pause(hit).await;
            }
            info!(reset_at_ms, "upstream returned 429, rotating key");
            return Outcome::RateLimited { reset_at_ms };
        }

        if !status.is_success() {
            // Client errors and non-429 upstream failures are final: no other
            // key would change the answer, so relay them verbatim.
            debug!(status = status.as_u16(), "relaying upstream error response");
            return Outcome::Relay(self.relay_streaming(resp).await);
        }

        self.peek_and_relay(resp, request_id).await
    }

    /// Pause once when a vendor with its own throttling window produced the
    /// rate limit, so rotation does not immediately re-trip that window.
    /// Applies to both a plain 429 and an error embedded in a 2xx body.
    async fn vendor_pause(&self, hit: &RateLimitHit) {
        if let Some(vendor) = hit.vendor
            && !self.vendor_rate_delay.is_zero()
        {
            warn!(
                vendor,
                delay_secs = self.vendor_rate_delay.as_secs(),
                "vendor rate limit, pausing before rotation"
            );
            tokio::time::sleep(self.vendor_rate_delay).await;
        }
    }

    /// Relay a response without inspecting the body.
    async fn relay_streaming(&self, resp: reqwest::Response) -> Response {
        let status = resp.status();
        let headers = resp.headers().clone();
        let body = Body::from_stream(resp.bytes_stream());
        build_response(status, &headers, body)
    }

    /// Peek at the first body chunk of a successful response. Some vendors
    /// report quota exhaustion inside a 200 body (JSON error object, or the
    /// first SSE event of a stream), which must still rotate the key.
    async fn peek_and_relay(&self, resp: reqwest::Response, request_id: &str) -> Outcome {
        let status = resp.status();
        let headers = resp.headers().clone();
        let sse = headers
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|ct| ct.starts_with("text/event-stream"));

        let mut stream = resp.bytes_stream();
        let first = match stream.next().await {
            Some(Ok(chunk)) => chunk,
            Some(Err(e)) => {
                error!(error = %e, "failed to read upstream response body");
                return Outcome::Fail(error_response(
                    StatusCode::BAD_GATEWAY,
                    "proxy_error",
                    &format!("upstream response read error: {e}"),
                    request_id,
                ));
            }
            // Empty body, nothing to classify.
            None => {
                return Outcome::Relay(build_response(status, &headers, Body::empty()));
            }
        };

        // Only text bodies can carry an embedded error; binary chunks are
        // relayed untouched.
        let hit = match std::str::from_utf8(&first) {
            Ok(text) if sse => self.classifier.scan_sse(text),
            Ok(text) => self.classifier.scan_json(text),
            Err(_) => None,
        };

        if let Some(hit) = hit {
            self.vendor_pause(&hit).await;
            info!("rate limit embedded in response body, rotating key");
            return Outcome::RateLimited {
                reset_at_ms: hit.reset_at_ms,
            };
        }

        // Chain the inspected chunk back in front of the remaining stream,
        // preserving the original chunk boundaries.
        let body = Body::from_stream(futures_util::stream::once(async move { Ok(first) }).chain(stream));
        Outcome::Relay(build_response(status, &headers, body))
    }
}

fn build_response(
    status: reqwest::StatusCode,
    headers: &reqwest::header::HeaderMap,
    body: Body,
) -> Response {
    let mut response = Response::builder().status(status);
    for (name, value) in headers {
        if !is_hop_by_hop(name.as_str()) {
            response = response.header(name, value);
        }
    }
    response.body(body).unwrap_or_else(|e| {
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("response build error: {e}"),
        )
            .into_response()
    })
}

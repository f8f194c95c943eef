//! Rate-limit classification for upstream response bodies
//!
//! OpenRouter reports rate limits two ways: a plain HTTP 429, and an error
//! object embedded in a nominally successful JSON or SSE body, carrying the
//! originating provider's status and an optional `X-RateLimit-Reset` hint in
//! epoch milliseconds. Some routed vendors (Google) embed their own
//! "resource exhausted" payloads in the error's raw metadata; those are
//! matched by a pluggable [`VendorDetector`] rather than hard-coded parsing,
//! since the exact format is heuristic and drifts.

use serde_json::Value;

/// HTTP status upstream uses for key-level rate limits.
pub const RATE_LIMIT_STATUS: u16 = 429;

/// A detected rate-limit signal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitHit {
    /// Server-provided reset time in epoch milliseconds, when present.
    pub reset_at_ms: Option<u64>,
    /// Name of the vendor detector that matched, if the error came from a
    /// routed vendor with its own throttling policy (drives the configured
    /// rate delay).
    pub vendor: Option<&'static str>,
}

/// Matches vendor-specific rate-limit payloads embedded in error metadata.
pub trait VendorDetector: Send + Sync {
    fn name(&self) -> &'static str;
    fn matches(&self, raw: &str) -> bool;
}

/// Google generative-language errors: a JSON payload whose `error.status`
/// is `RESOURCE_EXHAUSTED`.
pub struct GoogleDetector;

impl VendorDetector for GoogleDetector {
    fn name(&self) -> &'static str {
        "google"
    }

    fn matches(&self, raw: &str) -> bool {
        serde_json::from_str::<Value>(raw)
            .ok()
            .and_then(|v| {
                v.get("error")
                    .and_then(|e| e.get("status"))
                    .and_then(|s| s.as_str())
                    .map(|s| s == "RESOURCE_EXHAUSTED")
            })
            .unwrap_or(false)
    }
}

/// Scans response payloads for rate-limit errors.
pub struct Classifier {
    vendors: Vec<Box<dyn VendorDetector>>,
}

impl Default for Classifier {
    fn default() -> Self {
        Self {
            vendors: vec![Box::new(GoogleDetector)],
        }
    }
}

impl Classifier {
    pub fn new(vendors: Vec<Box<dyn VendorDetector>>) -> Self {
        Self { vendors }
    }

    /// Scan a JSON payload for an embedded rate-limit error.
    ///
    /// Returns a hit when the payload carries an `error` object with either a
    /// positive `X-RateLimit-Reset` in its metadata headers, a 429 code, or a
    /// vendor-detected exhaustion payload in its raw metadata. Anything that
    /// fails to parse is not a rate limit.
    pub fn scan_json(&self, payload: &str) -> Option<RateLimitHit> {
        let value: Value = serde_json::from_str(payload).ok()?;
        let error = value.get("error")?.as_object()?;

        if let Some(reset) = extract_reset(error)
            && reset > 0
        {
            return Some(RateLimitHit {
                reset_at_ms: Some(reset),
                vendor: None,
            });
        }

        let code = error.get("code").and_then(Value::as_u64).unwrap_or(0);
        if code != u64::from(RATE_LIMIT_STATUS) {
            return None;
        }

        let raw = error
            .get("metadata")
            .and_then(|m| m.get("raw"))
            .and_then(Value::as_str)
            .unwrap_or("");
        let vendor = self
            .vendors
            .iter()
            .find(|d| d.matches(raw))
            .map(|d| d.name());

        Some(RateLimitHit {
            reset_at_ms: None,
            vendor,
        })
    }

    /// Scan the first chunk of an SSE stream for an embedded rate-limit error.
    ///
    /// Error events arrive as the first `data:` line of the stream; ordinary
    /// completion deltas parse cleanly and produce no hit.
    pub fn scan_sse(&self, chunk: &str) -> Option<RateLimitHit> {
        for line in chunk.lines() {
            let Some(payload) = line.strip_prefix("data: ") else {
                continue;
            };
            if payload == "[DONE]" {
                continue;
            }
            if let Some(hit) = self.scan_json(payload) {
                return Some(hit);
            }
        }
        None
    }
}

/// Pull `X-RateLimit-Reset` (epoch ms) out of the error's metadata headers.
/// Upstream serializes it as either a number or a numeric string.
fn extract_reset(error: &serde_json::Map<String, Value>) -> Option<u64> {
    let reset = error
        .get("metadata")?
        .get("headers")?
        .get("X-RateLimit-Reset")?;
    match reset {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

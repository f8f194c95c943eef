//! Key pool for the OpenRouter rotation proxy
//!
//! Manages the configured pool of upstream API keys: per-key health state with
//! lazy cooldown expiry, pluggable selection strategies, and classification of
//! rate-limit errors embedded in upstream response bodies.
//!
//! Key lifecycle:
//! 1. Keys are loaded once from config, pool size is fixed for process lifetime
//! 2. The selector picks an eligible key per strategy (round-robin by default)
//! 3. Upstream signals a rate limit → key enters `CoolingDown` until a deadline
//! 4. The deadline passes → the key transitions back to `Available` on the
//!    next eligibility check (no background timer)
//! 5. Every key cooling down at once → pool exhaustion, surfaced to the caller

pub mod classify;
pub mod pool;
pub mod select;

pub use classify::{Classifier, GoogleDetector, RATE_LIMIT_STATUS, RateLimitHit, VendorDetector};
pub use pool::{KeyPool, KeyStatus, SelectedKey};
pub use select::{Selector, Strategy};

//! Key registry and cooldown state machine
//!
//! The pool holds the ordered credential list (fixed at load time) and a
//! mutable slot per key (Available, CoolingDown). The credential strings are
//! the single source of truth; selection returns a clone for the outbound
//! Authorization header.
//!
//! Cooldown transitions happen automatically: when a CoolingDown key is
//! checked and its deadline has passed, it transitions back to Available
//! without explicit action.

use std::sync::atomic::AtomicUsize;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use common::Secret;
use tokio::sync::RwLock;
use tracing::{info, warn};

/// Runtime status of a pool key.
///
/// Transitions:
/// - Available → CoolingDown (observed rate-limit event)
/// - CoolingDown → Available (deadline passed, evaluated lazily at read time)
#[derive(Debug, Clone)]
pub enum KeyStatus {
    Available,
    CoolingDown { until: Instant },
}

impl KeyStatus {
    /// Status label for logging and the exhausted-pool body.
    pub fn label(&self) -> &'static str {
        match self {
            KeyStatus::Available => "available",
            KeyStatus::CoolingDown { .. } => "cooling_down",
        }
    }
}

/// Mutable per-key state. The credential itself lives in the immutable list.
#[derive(Debug)]
struct KeySlot {
    status: KeyStatus,
    last_used_at: Option<Instant>,
}

/// A selected key with its credential, ready for a request.
#[derive(Debug)]
pub struct SelectedKey {
    pub index: usize,
    pub credential: String,
}

/// Pool of upstream API keys with per-key cooldown state.
///
/// The slot list sits behind a single `RwLock` held only for state checks and
/// updates, never across an outbound call. The round-robin cursor is an
/// `AtomicUsize`; a race between concurrent selectors may duplicate a pick,
/// which costs at most one extra dispatch attempt.
#[derive(Debug)]
pub struct KeyPool {
    keys: Vec<Secret<String>>,
    slots: RwLock<Vec<KeySlot>>,
    pub(crate) cursor: AtomicUsize,
    last_success: RwLock<Option<usize>>,
    cooldown: Duration,
}

impl KeyPool {
    /// Create a pool from the configured credentials.
    ///
    /// The pool never changes size at runtime; an empty key list is a fatal
    /// configuration error.
    pub fn new(keys: Vec<Secret<String>>, cooldown: Duration) -> common::Result<Self> {
        if keys.is_empty() {
            return Err(common::Error::Config(
                "at least one upstream API key is required".into(),
            ));
        }
        let slots = keys
            .iter()
            .map(|_| KeySlot {
                status: KeyStatus::Available,
                last_used_at: None,
            })
            .collect();
        info!(keys = keys.len(), "key pool initialized");
        Ok(Self {
            keys,
            slots: RwLock::new(slots),
            cursor: AtomicUsize::new(0),
            last_success: RwLock::new(None),
            cooldown,
        })
    }

    /// Number of keys in the pool.
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Masked credential for logs (`sk-o****6789`).
    pub fn masked(&self, index: usize) -> String {
        self.keys[index].masked()
    }

    pub(crate) fn selected(&self, index: usize) -> SelectedKey {
        SelectedKey {
            index,
            credential: self.keys[index].expose().clone(),
        }
    }

    /// Indices of keys currently eligible for selection, in pool order.
    ///
    /// A CoolingDown key whose deadline has passed is promoted back to
    /// Available as a side effect of the read.
    pub async fn eligible(&self) -> Vec<usize> {
        let now = Instant::now();
        let mut slots = self.slots.write().await;
        let mut out = Vec::new();
        for (index, slot) in slots.iter_mut().enumerate() {
            match slot.status {
                KeyStatus::Available => out.push(index),
                KeyStatus::CoolingDown { until } => {
                    if now >= until {
                        info!(key = %self.masked(index), "cooldown expired, key available again");
                        slot.status = KeyStatus::Available;
                        out.push(index);
                    }
                }
            }
        }
        out
    }

    /// Put a key into cooldown after an observed rate-limit event.
    ///
    /// `reset_at_ms` is an optional server-provided reset time in epoch
    /// milliseconds (OpenRouter's `X-RateLimit-Reset`). The hint is honored
    /// only when it lies beyond the default cooldown deadline; a hint in the
    /// past or shorter than the configured cooldown falls back to the
    /// default. Concurrent cooldowns for the same key are last-write-wins.
    pub async fn cool_down(&self, index: usize, reset_at_ms: Option<u64>) {
        let now = Instant::now();
        let default_until = now + self.cooldown;

        let hinted = reset_at_ms.and_then(|ms| {
            let target = UNIX_EPOCH + Duration::from_millis(ms);
            target
                .duration_since(SystemTime::now())
                .ok()
                .map(|delta| now + delta)
        });

        let until = match hinted {
            Some(h) if h > default_until => {
                info!(
                    key = %self.masked(index),
                    reset_in_secs = (h - now).as_secs(),
                    "using server-provided reset time"
                );
                h
            }
            Some(_) => {
                warn!(
                    key = %self.masked(index),
                    cooldown_secs = self.cooldown.as_secs(),
                    "server reset time shorter than configured cooldown, using default"
                );
                default_until
            }
            None => {
                if reset_at_ms.is_some() {
                    warn!(
                        key = %self.masked(index),
                        cooldown_secs = self.cooldown.as_secs(),
                        "server reset time is in the past, using default cooldown"
                    );
                } else {
                    info!(
                        key = %self.masked(index),
                        cooldown_secs = self.cooldown.as_secs(),
                        "key entering cooldown"
                    );
                }
                default_until
            }
        };

        let mut slots = self.slots.write().await;
        slots[index].status = KeyStatus::CoolingDown { until };
    }

    /// Record a successful use of a key (round-robin and `same` bookkeeping).
    pub async fn mark_used(&self, index: usize) {
        {
            let mut slots = self.slots.write().await;
            slots[index].last_used_at = Some(Instant::now());
        }
        *self.last_success.write().await = Some(index);
    }

    /// Index of the most recently successful key, if any.
    pub async fn last_success(&self) -> Option<usize> {
        *self.last_success.read().await
    }

    /// Count keys by status: (total, available, cooling_down).
    ///
    /// Pure read — expired cooldowns are counted as available but not
    /// promoted here.
    pub async fn counts(&self) -> (usize, usize, usize) {
        let now = Instant::now();
        let slots = self.slots.read().await;
        let total = slots.len();
        let mut available = 0usize;
        let mut cooling = 0usize;
        for slot in slots.iter() {
            match slot.status {
                KeyStatus::Available => available += 1,
                KeyStatus::CoolingDown { until } => {
                    if now >= until {
                        available += 1;
                    } else {
                        cooling += 1;
                    }
                }
            }
        }
        (total, available, cooling)
    }

    /// Time until the soonest cooling key becomes available, if any key is
    /// cooling down.
    pub async fn next_available_in(&self) -> Option<Duration> {
        let now = Instant::now();
        let slots = self.slots.read().await;
        slots
            .iter()
            .filter_map(|slot| match slot.status {
                KeyStatus::CoolingDown { until } if until > now => Some(until - now),
                _ => None,
            })
            .min()
    }

    /// JSON body for the pool-exhausted response: every key is cooling down,
    /// with a hint telling the caller when the soonest key frees up.
    pub async fn exhausted_body(&self) -> serde_json::Value {
        let (total, available, cooling) = self.counts().await;
        let next_in = self.next_available_in().await.map(|d| d.as_secs());
        serde_json::json!({
            "error": {
                "type": "pool_exhausted",
                "message": "All API keys are currently cooling down due to rate limits. Please try again later.",
                "pool": {
                    "keys_total": total,
                    "keys_available": available,
                    "keys_cooling_down": cooling,
                    "next_available_in_secs": next_in,
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_pool(keys: &[&str], cooldown: Duration) -> KeyPool {
        KeyPool::new(
            keys.iter()
                .map(|k| Secret::new(k.to_string()))
                .collect(),
            cooldown,
        )
        .unwrap()
    }

    /// Epoch milliseconds for a point `secs` in the future.
    fn future_reset_ms(secs: u64) -> u64 {
        (SystemTime::now() + Duration::from_secs(secs))
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_millis() as u64
    }

    #[test]
    fn empty_pool_is_rejected() {
        let err = KeyPool::new(vec![], Duration::from_secs(60)).unwrap_err();
        assert!(err.to_string().contains("at least one"), "got: {err}");
    }

    #[tokio::test]
    async fn all_keys_start_eligible_in_pool_order() {
        let pool = test_pool(
            &["sk-or-v1-alpha0001", "sk-or-v1-bravo0002", "sk-or-v1-charl0003"],
            Duration::from_secs(60),
        );
        assert_eq!(pool.eligible().await, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn cool_down_excludes_key() {
        let pool = test_pool(
            &["sk-or-v1-alpha0001", "sk-or-v1-bravo0002"],
            Duration::from_secs(60),
        );
        pool.cool_down(0, None).await;
        assert_eq!(pool.eligible().await, vec![1]);

        let (total, available, cooling) = pool.counts().await;
        assert_eq!((total, available, cooling), (2, 1, 1));
    }

    #[tokio::test]
    async fn expired_cooldown_promotes_on_read() {
        let pool = test_pool(&["sk-or-v1-alpha0001"], Duration::from_secs(0));
        pool.cool_down(0, None).await;

        // Zero cooldown: the deadline is already reached once time advances.
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(pool.eligible().await, vec![0]);
    }

    #[tokio::test]
    async fn reset_hint_in_the_past_falls_back_to_default() {
        let pool = test_pool(&["sk-or-v1-alpha0001"], Duration::from_secs(60));
        pool.cool_down(0, Some(1_000)).await;

        let remaining = pool.next_available_in().await.unwrap();
        // Default 60s cooldown applied, not the ancient hint.
        assert!(remaining > Duration::from_secs(55), "remaining: {remaining:?}");
        assert!(remaining <= Duration::from_secs(60));
    }

    #[tokio::test]
    async fn reset_hint_beyond_default_cooldown_is_honored() {
        let pool = test_pool(&["sk-or-v1-alpha0001"], Duration::from_secs(1));
        pool.cool_down(0, Some(future_reset_ms(120))).await;

        let remaining = pool.next_available_in().await.unwrap();
        assert!(remaining > Duration::from_secs(60), "remaining: {remaining:?}");
    }

    #[tokio::test]
    async fn reset_hint_shorter_than_default_uses_default() {
        let pool = test_pool(&["sk-or-v1-alpha0001"], Duration::from_secs(600));
        pool.cool_down(0, Some(future_reset_ms(5))).await;

        let remaining = pool.next_available_in().await.unwrap();
        assert!(remaining > Duration::from_secs(500), "remaining: {remaining:?}");
    }

    #[tokio::test]
    async fn mark_used_records_last_success() {
        let pool = test_pool(
            &["sk-or-v1-alpha0001", "sk-or-v1-bravo0002"],
            Duration::from_secs(60),
        );
        assert_eq!(pool.last_success().await, None);
        pool.mark_used(1).await;
        assert_eq!(pool.last_success().await, Some(1));
    }

    #[tokio::test]
    async fn exhausted_body_reports_counts_and_next_available() {
        let pool = test_pool(
            &["sk-or-v1-alpha0001", "sk-or-v1-bravo0002"],
            Duration::from_secs(60),
        );
        pool.cool_down(0, None).await;
        pool.cool_down(1, None).await;

        let body = pool.exhausted_body().await;
        assert_eq!(body["error"]["type"], "pool_exhausted");
        assert_eq!(body["error"]["pool"]["keys_total"], 2);
        assert_eq!(body["error"]["pool"]["keys_available"], 0);
        assert_eq!(body["error"]["pool"]["keys_cooling_down"], 2);
        let next = body["error"]["pool"]["next_available_in_secs"]
            .as_u64()
            .unwrap();
        assert!(next <= 60, "next_available_in_secs: {next}");
    }

    #[tokio::test]
    async fn selected_returns_credential_clone() {
        let pool = test_pool(&["sk-or-v1-alpha0001"], Duration::from_secs(60));
        let selected = pool.selected(0);
        assert_eq!(selected.index, 0);
        assert_eq!(selected.credential, "sk-or-v1-alpha0001");
    }

    #[tokio::test]
    async fn masked_never_exposes_middle_of_key() {
        let pool = test_pool(&["sk-or-v1-alpha0001"], Duration::from_secs(60));
        let masked = pool.masked(0);
        assert_eq!(masked, "sk-o****0001");
        assert!(!masked.contains("alpha"));
    }
}

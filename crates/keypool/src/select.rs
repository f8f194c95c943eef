//! Key selection strategies
//!
//! The selector picks the next key to try from the pool, skipping keys the
//! current request has already burned. Strategy is a configuration-time
//! choice, immutable for the process lifetime.

use std::collections::HashSet;
use std::sync::atomic::Ordering;

use rand::RngExt;
use serde::Deserialize;

use crate::pool::{KeyPool, SelectedKey};

/// Base selection strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Strategy {
    /// Cycle through the pool in fixed order (default).
    RoundRobin,
    /// Always take the first eligible key in pool order.
    First,
    /// Uniformly sample one eligible key.
    Random,
}

impl Default for Strategy {
    fn default() -> Self {
        Strategy::RoundRobin
    }
}

/// Configured selector: a base strategy plus the `same` option, which prefers
/// the most recently successful key while it remains eligible.
#[derive(Debug, Clone, Copy)]
pub struct Selector {
    pub strategy: Strategy,
    pub same: bool,
}

impl Selector {
    pub fn new(strategy: Strategy, same: bool) -> Self {
        Self { strategy, same }
    }

    /// Pick the next key to try, excluding keys already used by this request.
    ///
    /// Returns `None` when no eligible key remains — the terminal signal for
    /// the retry loop. With `same` set, the last successfully used key is
    /// returned without advancing the round-robin cursor, so the cursor
    /// position survives a sticky streak.
    pub async fn pick(&self, pool: &KeyPool, excluding: &HashSet<usize>) -> Option<SelectedKey> {
        let eligible: Vec<usize> = pool
            .eligible()
            .await
            .into_iter()
            .filter(|index| !excluding.contains(index))
            .collect();
        if eligible.is_empty() {
            return None;
        }

        if self.same
            && let Some(last) = pool.last_success().await
            && eligible.contains(&last)
        {
            return Some(pool.selected(last));
        }

        let index = match self.strategy {
            Strategy::First => eligible[0],
            Strategy::Random => eligible[rand::rng().random_range(0..eligible.len())],
            Strategy::RoundRobin => {
                let n = pool.len();
                let start = pool.cursor.load(Ordering::Relaxed) % n;
                let chosen = (0..n)
                    .map(|offset| (start + offset) % n)
                    .find(|candidate| eligible.contains(candidate))
                    .unwrap_or(eligible[0]);
                // Best-effort fairness: a racing selector may land on the
                // same key, costing one duplicate dispatch at worst.
                pool.cursor.store(chosen + 1, Ordering::Relaxed);
                chosen
            }
        };
        Some(pool.selected(index))
    }
}

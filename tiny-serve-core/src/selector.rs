//! Instance selection policies.
//!
//! One tagged enum covers all routing strategies; the strategy is stored by
//! value, not behind a trait object. `select` returns `None` when nothing
//! is healthy, which callers treat as a retryable scheduling failure.

use std::sync::atomic::{AtomicUsize, Ordering};

use rand::Rng;
use serde::{Deserialize, Serialize};
use xxhash_rust::xxh64::xxh64;

use crate::instance::Instance;

/// How an instance is picked for a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionPolicy {
    /// Rotating index over the healthy set.
    RoundRobin,
    /// Minimum load score (`running + 0.5 * waiting`).
    LeastLoaded,
    Random,
    /// `hash(request_id) mod |healthy|` for sticky routing.
    Hash,
}

/// A selection policy plus its mutable cursor state.
pub struct Selector {
    policy: SelectionPolicy,
    cursor: AtomicUsize,
}

impl Selector {
    pub fn new(policy: SelectionPolicy) -> Self {
        Self {
            policy,
            cursor: AtomicUsize::new(0),
        }
    }

    pub fn policy(&self) -> SelectionPolicy {
        self.policy
    }

    /// Pick one healthy instance for `request_id`, or `None` when the list
    /// contains no healthy instance.
    pub fn select(&self, instances: &[Instance], request_id: &str) -> Option<Instance> {
        let healthy: Vec<&Instance> = instances.iter().filter(|i| i.healthy).collect();
        if healthy.is_empty() {
            return None;
        }

        let idx = match self.policy {
            SelectionPolicy::RoundRobin => {
                self.cursor.fetch_add(1, Ordering::Relaxed) % healthy.len()
            }
            SelectionPolicy::LeastLoaded => healthy
                .iter()
                .enumerate()
                .min_by(|(_, a), (_, b)| a.load_score().total_cmp(&b.load_score()))
                .map(|(i, _)| i)?,
            SelectionPolicy::Random => rand::thread_rng().gen_range(0..healthy.len()),
            SelectionPolicy::Hash => (xxh64(request_id.as_bytes(), 0) as usize) % healthy.len(),
        };
        Some(healthy[idx].clone())
    }
}

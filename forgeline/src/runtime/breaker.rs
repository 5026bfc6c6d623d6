//! Consecutive-failure circuit breaker keyed by (project, agent, mode).
//!
//! The store is injected into the runtime. Counters reset on a success for the
//! same key or through [`BreakerStore::reset`].

use std::collections::HashMap;
use std::fmt;
use std::sync::{Mutex, PoisonError};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::core::types::{AgentRole, Mode};

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BreakerKey {
    pub project_id: String,
    pub agent: AgentRole,
    pub mode: Mode,
}

impl BreakerKey {
    pub fn new(project_id: impl Into<String>, agent: AgentRole, mode: Mode) -> Self {
        Self {
            project_id: project_id.into(),
            agent,
            mode,
        }
    }
}

impl fmt::Display for BreakerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.project_id, self.agent, self.mode)
    }
}

/// Shared failure counters.
pub trait BreakerStore: Send + Sync {
    fn failures(&self, key: &BreakerKey) -> u32;
    /// Increment and return the new count.
    fn record_failure(&self, key: &BreakerKey) -> u32;
    fn record_success(&self, key: &BreakerKey);
    /// Operator intervention: close the circuit for `key`.
    fn reset(&self, key: &BreakerKey);
    /// Keys whose count reached `threshold`, sorted.
    fn open_keys(&self, threshold: u32) -> Vec<BreakerKey>;
}

#[derive(Debug, Default)]
pub struct InMemoryBreakerStore {
    counters: Mutex<HashMap<BreakerKey, u32>>,
}

impl InMemoryBreakerStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl BreakerStore for InMemoryBreakerStore {
    fn failures(&self, key: &BreakerKey) -> u32 {
        let counters = self.counters.lock().unwrap_or_else(PoisonError::into_inner);
        counters.get(key).copied().unwrap_or(0)
    }

    fn record_failure(&self, key: &BreakerKey) -> u32 {
        let mut counters = self.counters.lock().unwrap_or_else(PoisonError::into_inner);
        let count = counters.entry(key.clone()).or_insert(0);
        *count += 1;
        warn!(key = %key, failures = *count, "circuit breaker failure recorded");
        *count
    }

    fn record_success(&self, key: &BreakerKey) {
        let mut counters = self.counters.lock().unwrap_or_else(PoisonError::into_inner);
        counters.remove(key);
    }

    fn reset(&self, key: &BreakerKey) {
        let mut counters = self.counters.lock().unwrap_or_else(PoisonError::into_inner);
        if counters.remove(key).is_some() {
            info!(key = %key, "circuit breaker reset");
        }
    }

    fn open_keys(&self, threshold: u32) -> Vec<BreakerKey> {
        let counters = self.counters.lock().unwrap_or_else(PoisonError::into_inner);
        let mut keys: Vec<_> = counters
            .iter()
            .filter(|(_, count)| is_open(**count, threshold))
            .map(|(key, _)| key.clone())
            .collect();
        keys.sort();
        keys
    }
}

/// Whether `failures` keeps the circuit open at `threshold`.
pub fn is_open(failures: u32, threshold: u32) -> bool {
    threshold > 0 && failures >= threshold
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(project: &str) -> BreakerKey {
        BreakerKey::new(project, AgentRole::Dev, Mode::ImplementTask)
    }

    #[test]
    fn counts_per_key_and_resets_on_success() {
        let store = InMemoryBreakerStore::new();
        assert_eq!(store.record_failure(&key("a")), 1);
        assert_eq!(store.record_failure(&key("a")), 2);
        assert_eq!(store.record_failure(&key("b")), 1);
        store.record_success(&key("a"));
        assert_eq!(store.failures(&key("a")), 0);
        assert_eq!(store.failures(&key("b")), 1);
    }

    #[test]
    fn open_keys_lists_tripped_circuits() {
        let store = InMemoryBreakerStore::new();
        for _ in 0..3 {
            store.record_failure(&key("a"));
        }
        store.record_failure(&key("b"));
        assert_eq!(store.open_keys(3), vec![key("a")]);
        store.reset(&key("a"));
        assert!(store.open_keys(3).is_empty());
    }

    #[test]
    fn zero_threshold_never_opens() {
        assert!(!is_open(10, 0));
        assert!(is_open(3, 3));
        assert!(!is_open(2, 3));
    }

    #[test]
    fn key_displays_all_parts() {
        assert_eq!(key("p1").to_string(), "p1:DEV:implement_task");
    }
}

//! Per-instance circuit breaker for automatic re-authentication.
//!
//! Counts consecutive authentication rejections per instance. Once the count
//! reaches the threshold the breaker is open and automatic paths (keepalive,
//! 401-triggered re-auth) must skip the instance. Manual connects reset it
//! first, so a user action is never blocked.
//!
//! State is in memory only and starts empty on every process start; an
//! instance without an entry has zero failures.

use crate::registry::InstanceId;
use std::{
    collections::HashMap,
    sync::{Mutex, PoisonError},
};
use tracing::{debug, warn};

pub const DEFAULT_THRESHOLD: u32 = 3;

#[derive(Debug)]
pub struct CircuitBreaker {
    threshold: u32,
    failures: Mutex<HashMap<InstanceId, u32>>,
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(DEFAULT_THRESHOLD)
    }
}

impl CircuitBreaker {
    #[must_use]
    pub fn new(threshold: u32) -> Self {
        Self {
            threshold: threshold.max(1),
            failures: Mutex::new(HashMap::new()),
        }
    }

    #[must_use]
    pub fn threshold(&self) -> u32 {
        self.threshold
    }

    /// Records one authentication failure and returns the new count.
    pub fn record_failure(&self, id: &InstanceId) -> u32 {
        let mut failures = self.failures.lock().unwrap_or_else(PoisonError::into_inner);
        let count = failures.entry(id.clone()).or_insert(0);
        *count = count.saturating_add(1);

        if *count == self.threshold {
            warn!(
                instance_id = %id,
                failures = *count,
                "circuit breaker open, automatic re-authentication suspended"
            );
        } else {
            debug!(instance_id = %id, failures = *count, "authentication failure recorded");
        }

        *count
    }

    pub fn record_success(&self, id: &InstanceId) {
        self.reset(id);
    }

    pub fn reset(&self, id: &InstanceId) {
        let mut failures = self.failures.lock().unwrap_or_else(PoisonError::into_inner);
        if failures.remove(id).is_some() {
            debug!(instance_id = %id, "circuit breaker reset");
        }
    }

    #[must_use]
    pub fn failure_count(&self, id: &InstanceId) -> u32 {
        self.failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .copied()
            .unwrap_or(0)
    }

    #[must_use]
    pub fn is_open(&self, id: &InstanceId) -> bool {
        self.failure_count(id) >= self.threshold
    }

    /// Drops the entry of a deleted instance.
    pub fn forget(&self, id: &InstanceId) {
        self.failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_entry_means_closed() {
        let breaker = CircuitBreaker::default();
        let id = InstanceId::new();
        assert_eq!(breaker.failure_count(&id), 0);
        assert!(!breaker.is_open(&id));
    }

    #[test]
    fn test_opens_at_threshold_and_isolates_instances() {
        let breaker = CircuitBreaker::new(3);
        let x = InstanceId::new();
        let y = InstanceId::new();

        breaker.record_failure(&x);
        breaker.record_failure(&x);
        assert!(!breaker.is_open(&x));

        assert_eq!(breaker.record_failure(&x), 3);
        assert!(breaker.is_open(&x));
        assert!(!breaker.is_open(&y));
        assert_eq!(breaker.failure_count(&y), 0);
    }

    #[test]
    fn test_success_and_reset_close_the_breaker() {
        let breaker = CircuitBreaker::new(2);
        let id = InstanceId::new();

        breaker.record_failure(&id);
        breaker.record_failure(&id);
        assert!(breaker.is_open(&id));

        breaker.record_success(&id);
        assert!(!breaker.is_open(&id));

        breaker.record_failure(&id);
        breaker.record_failure(&id);
        breaker.reset(&id);
        assert_eq!(breaker.failure_count(&id), 0);
    }

    #[test]
    fn test_zero_threshold_is_clamped() {
        let breaker = CircuitBreaker::new(0);
        assert_eq!(breaker.threshold(), 1);
        assert!(!breaker.is_open(&InstanceId::new()));
    }
}

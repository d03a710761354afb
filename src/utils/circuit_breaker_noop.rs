//! Pass-through circuit breaker
//!
//! Admits every call and never trips. Only meant for local experiments where
//! the breaker gets in the way; counters are still kept.

use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::utils::circuit_breaker::{
    BreakerPermit, CircuitBreaker, CircuitBreakerState, CircuitBreakerStats,
};

#[derive(Debug, Default)]
pub struct NoOpCircuitBreaker {
    successful_calls: AtomicU64,
    failed_calls: AtomicU64,
}

impl NoOpCircuitBreaker {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CircuitBreaker for NoOpCircuitBreaker {
    async fn try_acquire(&self) -> Option<BreakerPermit> {
        Some(BreakerPermit::admitted())
    }

    async fn record_success(&self, _permit: BreakerPermit) {
        self.successful_calls.fetch_add(1, Ordering::Relaxed);
    }

    async fn record_failure(&self, _permit: BreakerPermit) {
        self.failed_calls.fetch_add(1, Ordering::Relaxed);
    }

    async fn state(&self) -> CircuitBreakerState {
        CircuitBreakerState::Closed
    }

    async fn force_open(&self) {}

    async fn force_closed(&self) {}

    async fn stats(&self) -> CircuitBreakerStats {
        let successful_calls = self.successful_calls.load(Ordering::Relaxed);
        let failed_calls = self.failed_calls.load(Ordering::Relaxed);
        CircuitBreakerStats {
            state: CircuitBreakerState::Closed,
            failure_count: 0,
            success_count: 0,
            half_open_probe_count: 0,
            total_calls: successful_calls + failed_calls,
            successful_calls,
            failed_calls,
            rejected_calls: 0,
            trips: 0,
            next_retry_time: None,
            last_state_change: None,
        }
    }
}

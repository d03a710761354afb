//! Consecutive-failure circuit breaker
//!
//! Closed counts consecutive failures and trips to Open at the threshold.
//! Open rejects everything until the cooldown has elapsed, then moves to
//! HalfOpen, which admits a bounded number of concurrent probes. Enough
//! successful probes close the breaker; any probe failure re-opens it with a
//! fresh cooldown. Outcomes of calls admitted before the breaker reached
//! HalfOpen only update the counters.

use async_trait::async_trait;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::utils::circuit_breaker::{
    BreakerPermit, CircuitBreaker, CircuitBreakerConfig, CircuitBreakerState, CircuitBreakerStats,
    ProbeBudget,
};

/// State tracking for the simple circuit breaker
#[derive(Debug, Clone)]
struct SimpleCircuitBreakerState {
    state: CircuitBreakerState,
    /// Number of consecutive failures while closed
    failure_count: u32,
    /// Number of successful probes while half-open
    success_count: u32,
    /// Probe slots of the current state; replaced on every transition
    probes: ProbeBudget,
    /// When an open breaker starts admitting probes
    next_retry_time: Option<Instant>,
    total_calls: u64,
    successful_calls: u64,
    failed_calls: u64,
    rejected_calls: u64,
    trips: u64,
    last_state_change: Option<Instant>,
}

impl Default for SimpleCircuitBreakerState {
    fn default() -> Self {
        Self {
            state: CircuitBreakerState::Closed,
            failure_count: 0,
            success_count: 0,
            probes: fresh_budget(),
            next_retry_time: None,
            total_calls: 0,
            successful_calls: 0,
            failed_calls: 0,
            rejected_calls: 0,
            trips: 0,
            last_state_change: Some(Instant::now()),
        }
    }
}

fn fresh_budget() -> ProbeBudget {
    Arc::new(AtomicU32::new(0))
}

impl SimpleCircuitBreakerState {
    fn trip(&mut self, config: &CircuitBreakerConfig) {
        let now = Instant::now();
        self.state = CircuitBreakerState::Open;
        self.next_retry_time = Some(now + config.cooldown);
        self.success_count = 0;
        self.probes = fresh_budget();
        self.trips += 1;
        self.last_state_change = Some(now);
    }

    fn half_open(&mut self) {
        self.state = CircuitBreakerState::HalfOpen;
        self.success_count = 0;
        self.probes = fresh_budget();
        self.last_state_change = Some(Instant::now());
    }

    fn close(&mut self) {
        self.state = CircuitBreakerState::Closed;
        self.failure_count = 0;
        self.success_count = 0;
        self.probes = fresh_budget();
        self.next_retry_time = None;
        self.last_state_change = Some(Instant::now());
    }
}

/// Circuit breaker for one external endpoint
#[derive(Debug)]
pub struct SimpleCircuitBreaker {
    config: CircuitBreakerConfig,
    state: RwLock<SimpleCircuitBreakerState>,
}

impl SimpleCircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        info!("Creating SimpleCircuitBreaker with config: {:?}", config);
        Self {
            config,
            state: RwLock::new(SimpleCircuitBreakerState::default()),
        }
    }
}

#[async_trait]
impl CircuitBreaker for SimpleCircuitBreaker {
    async fn try_acquire(&self) -> Option<BreakerPermit> {
        let mut state = self.state.write().await;

        if state.state == CircuitBreakerState::Open {
            let cooled_down = state
                .next_retry_time
                .is_some_and(|next_retry| Instant::now() >= next_retry);
            if !cooled_down {
                debug!("Circuit breaker still open, blocking request");
                state.rejected_calls += 1;
                return None;
            }
            info!("Circuit breaker transitioning from Open to HalfOpen");
            state.half_open();
        }

        match state.state {
            CircuitBreakerState::Closed => Some(BreakerPermit::admitted()),
            CircuitBreakerState::HalfOpen => {
                // Drops only ever lower the count, so check-then-add under the write lock holds
                if state.probes.load(Ordering::Acquire) < self.config.half_open_max_probes {
                    state.probes.fetch_add(1, Ordering::AcqRel);
                    Some(BreakerPermit::probe(&state.probes))
                } else {
                    debug!("Circuit breaker half-open probe budget in use, blocking request");
                    state.rejected_calls += 1;
                    None
                }
            }
            CircuitBreakerState::Open => None,
        }
    }

    async fn record_success(&self, permit: BreakerPermit) {
        let mut state = self.state.write().await;
        state.total_calls += 1;
        state.successful_calls += 1;

        match state.state {
            CircuitBreakerState::Closed => state.failure_count = 0,
            CircuitBreakerState::HalfOpen if permit.is_probe_of(&state.probes) => {
                state.success_count += 1;
                if state.success_count >= self.config.success_threshold {
                    info!("Circuit breaker transitioning from HalfOpen to Closed");
                    state.close();
                }
            }
            // Admitted before the current state; says nothing about the probes
            CircuitBreakerState::HalfOpen | CircuitBreakerState::Open => {}
        }
    }

    async fn record_failure(&self, permit: BreakerPermit) {
        let mut state = self.state.write().await;
        state.total_calls += 1;
        state.failed_calls += 1;

        match state.state {
            CircuitBreakerState::Closed => {
                state.failure_count += 1;
                if state.failure_count >= self.config.failure_threshold {
                    warn!(
                        "Circuit breaker opening due to {} consecutive failures",
                        state.failure_count
                    );
                    state.trip(&self.config);
                }
            }
            CircuitBreakerState::HalfOpen if permit.is_probe_of(&state.probes) => {
                warn!("Circuit breaker returning to Open state from HalfOpen due to failure");
                state.trip(&self.config);
            }
            CircuitBreakerState::HalfOpen | CircuitBreakerState::Open => {}
        }
    }

    async fn state(&self) -> CircuitBreakerState {
        self.state.read().await.state
    }

    async fn force_open(&self) {
        let mut state = self.state.write().await;
        info!("Manually forcing circuit breaker to Open state");
        state.trip(&self.config);
    }

    async fn force_closed(&self) {
        let mut state = self.state.write().await;
        info!("Manually forcing circuit breaker to Closed state");
        state.close();
    }

    async fn stats(&self) -> CircuitBreakerStats {
        let state = self.state.read().await;
        CircuitBreakerStats {
            state: state.state,
            failure_count: state.failure_count,
            success_count: state.success_count,
            half_open_probe_count: state.probes.load(Ordering::Acquire),
            total_calls: state.total_calls,
            successful_calls: state.successful_calls,
            failed_calls: state.failed_calls,
            rejected_calls: state.rejected_calls,
            trips: state.trips,
            next_retry_time: state.next_retry_time,
            last_state_change: state.last_state_change,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn breaker(failure_threshold: u32, success_threshold: u32) -> SimpleCircuitBreaker {
        SimpleCircuitBreaker::new(CircuitBreakerConfig {
            failure_threshold,
            cooldown: Duration::from_secs(30),
            success_threshold,
            half_open_max_probes: 1,
        })
    }

    async fn fail_times(breaker: &SimpleCircuitBreaker, times: u32) {
        for _ in 0..times {
            let permit = breaker.try_acquire().await.unwrap();
            breaker.record_failure(permit).await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_opens_after_threshold_and_short_circuits() {
        let breaker = breaker(5, 2);
        fail_times(&breaker, 4).await;
        assert_eq!(breaker.state().await, CircuitBreakerState::Closed);

        fail_times(&breaker, 1).await;
        assert_eq!(breaker.state().await, CircuitBreakerState::Open);

        assert!(breaker.try_acquire().await.is_none());
        tokio::time::advance(Duration::from_secs(29)).await;
        assert!(breaker.try_acquire().await.is_none());

        let stats = breaker.stats().await;
        assert_eq!(stats.rejected_calls, 2);
        assert_eq!(stats.trips, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_in_closed_resets_failure_count() {
        let breaker = breaker(3, 1);
        fail_times(&breaker, 2).await;
        let permit = breaker.try_acquire().await.unwrap();
        assert!(!permit.is_probe());
        breaker.record_success(permit).await;
        assert_eq!(breaker.stats().await.failure_count, 0);

        fail_times(&breaker, 2).await;
        assert_eq!(breaker.state().await, CircuitBreakerState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_success_streak_closes() {
        let breaker = breaker(2, 2);
        fail_times(&breaker, 2).await;
        tokio::time::advance(Duration::from_secs(30)).await;

        let probe = breaker.try_acquire().await.unwrap();
        assert!(probe.is_probe());
        assert_eq!(breaker.state().await, CircuitBreakerState::HalfOpen);
        // Only one probe at a time
        assert!(breaker.try_acquire().await.is_none());
        breaker.record_success(probe).await;
        assert_eq!(breaker.state().await, CircuitBreakerState::HalfOpen);
        assert_eq!(breaker.stats().await.half_open_probe_count, 0);

        let probe = breaker.try_acquire().await.unwrap();
        breaker.record_success(probe).await;
        assert_eq!(breaker.state().await, CircuitBreakerState::Closed);
        assert_eq!(breaker.stats().await.failure_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_failure_reopens_with_fresh_cooldown() {
        let breaker = breaker(2, 3);
        fail_times(&breaker, 2).await;
        tokio::time::advance(Duration::from_secs(30)).await;

        let probe = breaker.try_acquire().await.unwrap();
        breaker.record_success(probe).await;
        let probe = breaker.try_acquire().await.unwrap();
        breaker.record_failure(probe).await;
        assert_eq!(breaker.state().await, CircuitBreakerState::Open);

        tokio::time::advance(Duration::from_secs(20)).await;
        assert!(breaker.try_acquire().await.is_none());
        tokio::time::advance(Duration::from_secs(10)).await;
        assert!(breaker.try_acquire().await.is_some());
        assert_eq!(breaker.stats().await.trips, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_probe_frees_its_slot() {
        let breaker = breaker(1, 1);
        breaker.force_open().await;
        tokio::time::advance(Duration::from_secs(30)).await;

        let probe = breaker.try_acquire().await.unwrap();
        assert!(breaker.try_acquire().await.is_none());
        assert_eq!(breaker.stats().await.half_open_probe_count, 1);

        // Caller went away without reporting
        drop(probe);

        assert_eq!(breaker.stats().await.half_open_probe_count, 0);
        let probe = breaker.try_acquire().await.unwrap();
        breaker.record_success(probe).await;
        assert_eq!(breaker.state().await, CircuitBreakerState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_outcomes_of_closed_calls_do_not_count_as_probes() {
        let breaker = breaker(2, 1);
        let early_success = breaker.try_acquire().await.unwrap();
        let early_failure = breaker.try_acquire().await.unwrap();
        fail_times(&breaker, 2).await;
        tokio::time::advance(Duration::from_secs(30)).await;

        let probe = breaker.try_acquire().await.unwrap();
        assert_eq!(breaker.state().await, CircuitBreakerState::HalfOpen);

        breaker.record_success(early_success).await;
        breaker.record_failure(early_failure).await;
        let stats = breaker.stats().await;
        assert_eq!(stats.state, CircuitBreakerState::HalfOpen);
        assert_eq!(stats.success_count, 0);
        assert_eq!(stats.half_open_probe_count, 1);
        assert_eq!(stats.trips, 1);

        breaker.record_success(probe).await;
        assert_eq!(breaker.state().await, CircuitBreakerState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_force_closed_is_an_administrative_reset() {
        let breaker = breaker(1, 1);
        breaker.force_open().await;
        assert!(breaker.try_acquire().await.is_none());

        breaker.force_closed().await;
        assert_eq!(breaker.state().await, CircuitBreakerState::Closed);
        assert!(breaker.try_acquire().await.is_some());
    }
}

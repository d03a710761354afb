use async_trait::async_trait;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tokio::time::Instant;
use tracing::warn;

use crate::errors::{AppError, AppResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, strum::Display)]
pub enum CircuitBreakerState {
    Closed,
    Open,
    HalfOpen,
}

/// Probes in use during one half-open period.
///
/// A breaker starts a fresh budget every time it changes state, so permits
/// from an earlier period can never release a slot of the current one.
pub type ProbeBudget = Arc<AtomicU32>;

/// Admission handed out by [`CircuitBreaker::try_acquire`].
///
/// A permit admitted as a half-open probe holds one slot of the probe budget
/// until it is dropped, whether or not its outcome was reported. A cancelled
/// call therefore never wedges the breaker in HalfOpen.
#[derive(Debug)]
pub struct BreakerPermit {
    probe: Option<ProbeBudget>,
}

impl BreakerPermit {
    /// A call admitted while closed
    pub fn admitted() -> Self {
        Self { probe: None }
    }

    /// A half-open probe; the caller has already counted it in `budget`
    pub fn probe(budget: &ProbeBudget) -> Self {
        Self {
            probe: Some(budget.clone()),
        }
    }

    pub fn is_probe(&self) -> bool {
        self.probe.is_some()
    }

    /// Whether this permit was admitted as a probe from `budget`
    pub fn is_probe_of(&self, budget: &ProbeBudget) -> bool {
        self.probe
            .as_ref()
            .is_some_and(|probe| Arc::ptr_eq(probe, budget))
    }
}

impl Drop for BreakerPermit {
    fn drop(&mut self) {
        if let Some(budget) = self.probe.take() {
            let _ = budget.fetch_update(Ordering::AcqRel, Ordering::Acquire, |in_use| {
                in_use.checked_sub(1)
            });
        }
    }
}

/// Gate guarding one external endpoint.
///
/// Callers ask [`try_acquire`](CircuitBreaker::try_acquire) before contacting
/// the endpoint and report the outcome of an admitted call by handing its
/// permit to [`record_success`](CircuitBreaker::record_success) or
/// [`record_failure`](CircuitBreaker::record_failure). Only outcomes of
/// probe permits move a half-open breaker.
#[async_trait]
pub trait CircuitBreaker: Send + Sync + std::fmt::Debug {
    /// A permit if a call may go through right now. Rejections are counted.
    async fn try_acquire(&self) -> Option<BreakerPermit>;

    /// Report an admitted call that succeeded
    async fn record_success(&self, permit: BreakerPermit);

    /// Report an admitted call that failed
    async fn record_failure(&self, permit: BreakerPermit);

    /// Get current circuit breaker state
    async fn state(&self) -> CircuitBreakerState;

    /// Force circuit breaker to open state
    async fn force_open(&self);

    /// Administrative reset to closed state with cleared counters
    async fn force_closed(&self);

    /// Get circuit breaker statistics
    async fn stats(&self) -> CircuitBreakerStats;
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct CircuitBreakerStats {
    pub state: CircuitBreakerState,
    /// Consecutive failures counted while closed
    pub failure_count: u32,
    /// Successful probes counted while half-open
    pub success_count: u32,
    /// Probes currently admitted while half-open
    pub half_open_probe_count: u32,
    pub total_calls: u64,
    pub successful_calls: u64,
    pub failed_calls: u64,
    pub rejected_calls: u64,
    /// Number of times the breaker moved to Open
    pub trips: u64,
    #[serde(skip)]
    pub next_retry_time: Option<Instant>,
    #[serde(skip)]
    pub last_state_change: Option<Instant>,
}

impl CircuitBreakerStats {
    pub fn failure_rate(&self) -> f64 {
        if self.total_calls > 0 {
            self.failed_calls as f64 / self.total_calls as f64
        } else {
            0.0
        }
    }
}

/// Runtime configuration for circuit breakers
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures in Closed that trip the breaker
    pub failure_threshold: u32,
    /// Time spent Open before probes are allowed
    pub cooldown: Duration,
    /// Successful probes in HalfOpen needed to close again
    pub success_threshold: u32,
    /// Probes admitted concurrently while HalfOpen
    pub half_open_max_probes: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown: Duration::from_secs(30),
            success_threshold: 2,
            half_open_max_probes: 1,
        }
    }
}

impl From<&crate::config::CircuitBreakerProfileConfig> for CircuitBreakerConfig {
    fn from(profile: &crate::config::CircuitBreakerProfileConfig) -> Self {
        Self {
            failure_threshold: profile.failure_threshold,
            cooldown: profile.cooldown,
            success_threshold: profile.success_threshold,
            half_open_max_probes: profile.half_open_max_probes,
        }
    }
}

/// Create a circuit breaker from a config profile
pub fn create_circuit_breaker(
    profile: &crate::config::CircuitBreakerProfileConfig,
) -> AppResult<Arc<dyn CircuitBreaker>> {
    use crate::utils::{
        circuit_breaker_noop::NoOpCircuitBreaker, circuit_breaker_simple::SimpleCircuitBreaker,
    };

    match profile.implementation_type.as_str() {
        "simple" => Ok(Arc::new(SimpleCircuitBreaker::new(profile.into()))),
        "noop" => {
            warn!("CREATING NOOP CIRCUIT BREAKER - THIS SHOULD NOT BE USED IN PRODUCTION!");
            Ok(Arc::new(NoOpCircuitBreaker::new()))
        }
        other => Err(AppError::configuration(format!(
            "Unsupported circuit breaker type: {other} (supported: simple, noop)"
        ))),
    }
}

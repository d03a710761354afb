//! Resilient wrapper around the generation provider
//!
//! Every attempt goes through the same gates, in order:
//!
//! 1. a bulkhead slot (FIFO wait, no deadline)
//! 2. the endpoint's circuit breaker
//! 3. a timeout-bounded provider call, whose outcome is recorded on the breaker
//!
//! The slot is released before any backoff sleep. A [`RetrySchedule`] decides
//! whether a failed attempt is retried and for how long to wait. Only
//! timeouts and 5xx/429 answers are retried; other provider errors and an
//! open circuit end the call immediately.

use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::InvokerConfig;
use crate::errors::{AppResult, InvocationError, InvocationResult};
use crate::models::{Artifact, JobPayload};
use crate::observability::AppObservability;
use crate::services::bulkhead::Bulkhead;
use crate::services::circuit_breaker_manager::CircuitBreakerManager;
use crate::services::provider::GenerationProvider;
use crate::utils::{BreakerPermit, CircuitBreaker, RetryConfig, RetryDecision, RetrySchedule};

/// Outcome of one resilient invocation
#[derive(Debug, Clone)]
pub struct Invocation {
    pub result: InvocationResult<Artifact>,
    /// Attempts started, including ones refused by the breaker
    pub attempts: u32,
    /// The artifact came from the fallback provider
    pub used_fallback: bool,
    pub elapsed: Duration,
}

impl Invocation {
    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }
}

pub struct ResilientInvoker {
    endpoint: String,
    provider: Arc<dyn GenerationProvider>,
    fallback: Option<Arc<dyn GenerationProvider>>,
    breaker: Arc<dyn CircuitBreaker>,
    bulkhead: Arc<Bulkhead>,
    retry: RetryConfig,
    timeout: Duration,
    observability: AppObservability,
}

impl ResilientInvoker {
    pub fn new<S: Into<String>>(
        endpoint: S,
        provider: Arc<dyn GenerationProvider>,
        breaker: Arc<dyn CircuitBreaker>,
        bulkhead: Arc<Bulkhead>,
        retry: RetryConfig,
        timeout: Duration,
    ) -> Self {
        Self {
            endpoint: endpoint.into(),
            provider,
            fallback: None,
            breaker,
            bulkhead,
            retry,
            timeout,
            observability: AppObservability::from_global(),
        }
    }

    /// Build an invoker for `config.endpoint`, taking its breaker from `breakers`
    pub async fn from_config(
        config: &InvokerConfig,
        provider: Arc<dyn GenerationProvider>,
        breakers: &CircuitBreakerManager,
    ) -> AppResult<Self> {
        let breaker = breakers.get_circuit_breaker(&config.endpoint).await?;
        let bulkhead = Arc::new(Bulkhead::new(config.endpoint.clone(), &config.bulkhead));
        info!(
            "Resilient invoker for '{}': timeout {:?}, {} attempts, {} concurrent",
            config.endpoint,
            config.timeout,
            config.retry.max_attempts,
            bulkhead.capacity()
        );
        Ok(Self::new(
            config.endpoint.clone(),
            provider,
            breaker,
            bulkhead,
            config.retry.clone(),
            config.timeout,
        ))
    }

    /// Provider used once when the breaker refuses a call
    pub fn with_fallback(mut self, fallback: Arc<dyn GenerationProvider>) -> Self {
        self.fallback = Some(fallback);
        self
    }

    pub fn with_observability(mut self, observability: AppObservability) -> Self {
        self.observability = observability;
        self
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn bulkhead(&self) -> &Arc<Bulkhead> {
        &self.bulkhead
    }

    pub fn breaker(&self) -> &Arc<dyn CircuitBreaker> {
        &self.breaker
    }

    /// Run the provider call under timeout, retry, breaker and bulkhead
    pub async fn invoke(&self, payload: &JobPayload) -> Invocation {
        let started = Instant::now();
        let mut schedule = RetrySchedule::new(self.retry.clone());

        loop {
            let attempt = schedule.start_attempt();
            let err = match self.attempt(payload).await {
                Ok(artifact) => {
                    if attempt > 1 {
                        info!(
                            "Provider '{}' succeeded on attempt {}/{}",
                            self.endpoint,
                            attempt,
                            schedule.max_attempts()
                        );
                    }
                    return self.finish(Ok(artifact), attempt, false, started);
                }
                Err(err) => err,
            };

            match err {
                InvocationError::CircuitOpen { .. } => {
                    return self.on_circuit_open(payload, err, attempt, started).await;
                }
                InvocationError::Cancelled { .. } => {
                    return self.finish(Err(err), attempt, false, started);
                }
                _ => {}
            }

            match schedule.on_failure(err.is_retryable()) {
                RetryDecision::RetryAfter(delay) => {
                    warn!(
                        "Provider '{}' attempt {}/{} failed: {}. Retrying in {:?}",
                        self.endpoint,
                        attempt,
                        schedule.max_attempts(),
                        err,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                }
                RetryDecision::GiveUp => {
                    let err = if err.is_retryable() {
                        InvocationError::RetriesExhausted {
                            attempts: attempt,
                            last: Box::new(err),
                        }
                    } else {
                        err
                    };
                    warn!("Provider '{}' call failed: {}", self.endpoint, err);
                    return self.finish(Err(err), attempt, false, started);
                }
            }
        }
    }

    /// One pass through the bulkhead, the breaker and the timeout
    async fn attempt(&self, payload: &JobPayload) -> InvocationResult<Artifact> {
        let _permit = self.bulkhead.acquire().await?;

        // Dropping this future mid-call releases the permit and with it any probe slot
        let Some(breaker_permit) = self.breaker.try_acquire().await else {
            self.observability.breaker_rejections.add(1, &[]);
            return Err(InvocationError::CircuitOpen {
                endpoint: self.endpoint.clone(),
            });
        };
        if breaker_permit.is_probe() {
            debug!("Probing half-open endpoint '{}'", self.endpoint);
        }

        match tokio::time::timeout(self.timeout, self.provider.generate(payload)).await {
            Ok(Ok(artifact)) => {
                self.breaker.record_success(breaker_permit).await;
                Ok(artifact)
            }
            Ok(Err(provider_err)) => {
                let err = InvocationError::from(provider_err);
                if err.is_retryable() {
                    self.record_breaker_failure(breaker_permit).await;
                } else {
                    // The endpoint answered; a rejected request says nothing about its health
                    self.breaker.record_success(breaker_permit).await;
                }
                Err(err)
            }
            Err(_) => {
                debug!(
                    "Provider '{}' attempt exceeded {:?}, dropping it",
                    self.endpoint, self.timeout
                );
                self.record_breaker_failure(breaker_permit).await;
                Err(InvocationError::Timeout(self.timeout))
            }
        }
    }

    async fn record_breaker_failure(&self, permit: BreakerPermit) {
        let trips_before = self.breaker.stats().await.trips;
        self.breaker.record_failure(permit).await;
        let stats = self.breaker.stats().await;
        if stats.trips > trips_before {
            warn!(
                "Circuit breaker for '{}' opened after {} failed calls",
                self.endpoint, stats.failed_calls
            );
            self.observability.breaker_trips.add(1, &[]);
        }
    }

    async fn on_circuit_open(
        &self,
        payload: &JobPayload,
        err: InvocationError,
        attempts: u32,
        started: Instant,
    ) -> Invocation {
        let Some(fallback) = &self.fallback else {
            debug!("Circuit open for '{}', no fallback configured", self.endpoint);
            return self.finish(Err(err), attempts, false, started);
        };

        self.observability.fallback_invocations.add(1, &[]);
        info!(
            "Circuit open for '{}', using fallback provider '{}'",
            self.endpoint,
            fallback.name()
        );

        let outcome = match self.bulkhead.acquire().await {
            Ok(_permit) => tokio::time::timeout(self.timeout, fallback.generate(payload)).await,
            Err(cancelled) => return self.finish(Err(cancelled), attempts, false, started),
        };

        match outcome {
            Ok(Ok(artifact)) => self.finish(Ok(artifact), attempts, true, started),
            Ok(Err(fallback_err)) => {
                warn!(
                    "Fallback provider for '{}' failed: {}",
                    self.endpoint, fallback_err
                );
                self.finish(Err(err), attempts, false, started)
            }
            Err(_) => {
                warn!(
                    "Fallback provider for '{}' timed out after {:?}",
                    self.endpoint, self.timeout
                );
                self.finish(Err(err), attempts, false, started)
            }
        }
    }

    fn finish(
        &self,
        result: InvocationResult<Artifact>,
        attempts: u32,
        used_fallback: bool,
        started: Instant,
    ) -> Invocation {
        Invocation {
            result,
            attempts,
            used_fallback,
            elapsed: started.elapsed(),
        }
    }
}

impl std::fmt::Debug for ResilientInvoker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResilientInvoker")
            .field("endpoint", &self.endpoint)
            .field("timeout", &self.timeout)
            .field("retry", &self.retry)
            .field("bulkhead", &self.bulkhead)
            .field("has_fallback", &self.fallback.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::provider::{MockGenerationProvider, ProviderError};
    use crate::utils::circuit_breaker::CircuitBreakerConfig;
    use crate::utils::circuit_breaker_simple::SimpleCircuitBreaker;
    use crate::utils::CircuitBreakerState;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn payload() -> JobPayload {
        JobPayload::new(json!({"prompt": "chiptune"}))
    }

    fn artifact() -> Artifact {
        Artifact {
            uri: "mock://ok".to_string(),
            duration: Duration::from_secs(120),
        }
    }

    fn retry(max_attempts: u32) -> RetryConfig {
        RetryConfig {
            max_attempts,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            backoff_factor: 2.0,
            jitter: false,
        }
    }

    fn breaker(failure_threshold: u32) -> Arc<dyn CircuitBreaker> {
        Arc::new(SimpleCircuitBreaker::new(CircuitBreakerConfig {
            failure_threshold,
            cooldown: Duration::from_secs(30),
            success_threshold: 1,
            half_open_max_probes: 1,
        }))
    }

    fn invoker(
        provider: MockGenerationProvider,
        breaker: Arc<dyn CircuitBreaker>,
        max_attempts: u32,
    ) -> ResilientInvoker {
        ResilientInvoker::new(
            "music",
            Arc::new(provider),
            breaker,
            Arc::new(Bulkhead::with_capacity("music", 4)),
            retry(max_attempts),
            Duration::from_secs(5),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_on_first_attempt() {
        let mut provider = MockGenerationProvider::new();
        provider
            .expect_generate()
            .times(1)
            .returning(|_| Ok(artifact()));

        let invocation = invoker(provider, breaker(5), 3).invoke(&payload()).await;

        assert_eq!(invocation.result, Ok(artifact()));
        assert_eq!(invocation.attempts, 1);
        assert!(!invocation.used_fallback);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_transient_errors_with_backoff() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut provider = MockGenerationProvider::new();
        {
            let calls = calls.clone();
            provider.expect_generate().times(3).returning(move |_| {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(ProviderError::new(503, "busy"))
                } else {
                    Ok(artifact())
                }
            });
        }

        let invocation = invoker(provider, breaker(5), 3).invoke(&payload()).await;

        assert!(invocation.is_success());
        assert_eq!(invocation.attempts, 3);
        // 1s after the first failure, 2s after the second
        assert_eq!(invocation.elapsed, Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_makes_exactly_max_attempts_then_gives_up() {
        let mut provider = MockGenerationProvider::new();
        provider
            .expect_generate()
            .times(4)
            .returning(|_| Err(ProviderError::new(500, "boom")));

        let invocation = invoker(provider, breaker(10), 4).invoke(&payload()).await;

        assert_eq!(invocation.attempts, 4);
        match invocation.result {
            Err(InvocationError::RetriesExhausted { attempts, last }) => {
                assert_eq!(attempts, 4);
                assert_eq!(*last, InvocationError::provider(500, "boom"));
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_retryable_error_fails_immediately() {
        let mut provider = MockGenerationProvider::new();
        provider
            .expect_generate()
            .times(1)
            .returning(|_| Err(ProviderError::new(422, "prompt rejected")));
        let breaker = breaker(1);

        let invocation = invoker(provider, breaker.clone(), 3)
            .invoke(&payload())
            .await;

        assert_eq!(invocation.attempts, 1);
        assert_eq!(
            invocation.result,
            Err(InvocationError::provider(422, "prompt rejected"))
        );
        assert_eq!(breaker.state().await, CircuitBreakerState::Closed);
    }

    /// Never answers; counts calls and tracks concurrency
    #[derive(Default)]
    struct SlowProvider {
        calls: AtomicUsize,
        current: AtomicUsize,
        peak: AtomicUsize,
        hang: bool,
    }

    #[async_trait::async_trait]
    impl GenerationProvider for SlowProvider {
        fn name(&self) -> String {
            "slow".to_string()
        }

        async fn generate(&self, _payload: &JobPayload) -> Result<Artifact, ProviderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            if self.hang {
                std::future::pending::<()>().await;
            }
            tokio::time::sleep(Duration::from_secs(1)).await;
            self.current.fetch_sub(1, Ordering::SeqCst);
            Ok(artifact())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_attempt_timeouts_exhaust_retries() {
        let provider = Arc::new(SlowProvider {
            hang: true,
            ..SlowProvider::default()
        });
        let invoker = ResilientInvoker::new(
            "music",
            provider.clone(),
            breaker(10),
            Arc::new(Bulkhead::with_capacity("music", 1)),
            retry(3),
            Duration::from_secs(5),
        );

        let invocation = invoker.invoke(&payload()).await;

        assert_eq!(invocation.attempts, 3);
        assert_eq!(provider.calls.load(Ordering::SeqCst), 3);
        // 5s + 1s + 5s + 2s + 5s
        assert_eq!(invocation.elapsed, Duration::from_secs(18));
        match invocation.result {
            Err(InvocationError::RetriesExhausted { attempts: 3, last }) => {
                assert_eq!(*last, InvocationError::Timeout(Duration::from_secs(5)));
            }
            other => panic!("unexpected result: {other:?}"),
        }
        assert_eq!(invoker.bulkhead().in_flight(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_breaker_short_circuits_until_cooldown() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut provider = MockGenerationProvider::new();
        {
            let calls = calls.clone();
            provider.expect_generate().times(6).returning(move |_| {
                if calls.fetch_add(1, Ordering::SeqCst) < 5 {
                    Err(ProviderError::new(503, "down"))
                } else {
                    Ok(artifact())
                }
            });
        }
        let breaker = breaker(5);
        let invoker = invoker(provider, breaker.clone(), 1);

        for _ in 0..5 {
            let invocation = invoker.invoke(&payload()).await;
            assert!(matches!(
                invocation.result,
                Err(InvocationError::RetriesExhausted { attempts: 1, .. })
            ));
        }
        assert_eq!(breaker.state().await, CircuitBreakerState::Open);

        for _ in 0..3 {
            let invocation = invoker.invoke(&payload()).await;
            assert_eq!(
                invocation.result,
                Err(InvocationError::CircuitOpen {
                    endpoint: "music".to_string()
                })
            );
            assert_eq!(invocation.attempts, 1);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 5);

        tokio::time::advance(Duration::from_secs(30)).await;
        let probe = invoker.invoke(&payload()).await;
        assert!(probe.is_success());
        assert_eq!(breaker.state().await, CircuitBreakerState::Closed);
        assert_eq!(breaker.stats().await.rejected_calls, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_half_open_invocation_releases_probe() {
        let breaker = breaker(1);
        breaker.force_open().await;
        tokio::time::advance(Duration::from_secs(30)).await;

        let hanging = ResilientInvoker::new(
            "music",
            Arc::new(SlowProvider {
                hang: true,
                ..SlowProvider::default()
            }),
            breaker.clone(),
            Arc::new(Bulkhead::with_capacity("music", 1)),
            retry(1),
            Duration::from_secs(5),
        );
        let cut_short =
            tokio::time::timeout(Duration::from_secs(1), hanging.invoke(&payload())).await;
        assert!(cut_short.is_err());

        let stats = breaker.stats().await;
        assert_eq!(stats.state, CircuitBreakerState::HalfOpen);
        assert_eq!(stats.half_open_probe_count, 0);
        assert_eq!(hanging.bulkhead().in_flight(), 0);

        tokio::time::advance(Duration::from_secs(3600)).await;
        let mut provider = MockGenerationProvider::new();
        provider
            .expect_generate()
            .times(1)
            .returning(|_| Ok(artifact()));
        let healthy = invoker(provider, breaker.clone(), 1);

        assert!(healthy.invoke(&payload()).await.is_success());
        assert_eq!(breaker.state().await, CircuitBreakerState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fallback_used_when_circuit_open() {
        let mut primary = MockGenerationProvider::new();
        primary.expect_generate().never();
        let mut fallback = MockGenerationProvider::new();
        fallback.expect_name().return_const("backup".to_string());
        fallback
            .expect_generate()
            .times(1)
            .returning(|_| Ok(artifact()));

        let breaker = breaker(5);
        breaker.force_open().await;
        let invoker = invoker(primary, breaker, 3).with_fallback(Arc::new(fallback));

        let invocation = invoker.invoke(&payload()).await;

        assert_eq!(invocation.result, Ok(artifact()));
        assert!(invocation.used_fallback);
        assert_eq!(invocation.attempts, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_bulkhead_caps_concurrent_provider_calls() {
        let provider = Arc::new(SlowProvider::default());
        let invoker = Arc::new(ResilientInvoker::new(
            "music",
            provider.clone(),
            breaker(5),
            Arc::new(Bulkhead::with_capacity("music", 3)),
            retry(1),
            Duration::from_secs(5),
        ));

        let handles: Vec<_> = (0..10)
            .map(|_| {
                let invoker = invoker.clone();
                tokio::spawn(async move { invoker.invoke(&payload()).await })
            })
            .collect();
        for handle in handles {
            assert!(handle.await.unwrap().is_success());
        }

        assert_eq!(provider.calls.load(Ordering::SeqCst), 10);
        assert_eq!(provider.peak.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_closed_bulkhead_cancels_invocation() {
        let mut provider = MockGenerationProvider::new();
        provider.expect_generate().never();
        let invoker = invoker(provider, breaker(5), 3);
        invoker.bulkhead().close();

        let invocation = invoker.invoke(&payload()).await;

        assert!(matches!(
            invocation.result,
            Err(InvocationError::Cancelled { .. })
        ));
        assert_eq!(invocation.attempts, 1);
    }
}

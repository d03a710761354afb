use futures::future::join_all;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::config::{CircuitBreakerConfig, CircuitBreakerProfileConfig};
use crate::errors::{AppError, AppResult};
use crate::utils::circuit_breaker::{CircuitBreaker, CircuitBreakerStats, create_circuit_breaker};

/// One circuit breaker per external endpoint, created on first use.
///
/// A breaker lives as long as the process: every holder shares the same
/// instance, and only [`reset`](CircuitBreakerManager::reset) closes it
/// from outside its own state machine.
#[derive(Clone)]
pub struct CircuitBreakerManager {
    /// Currently active circuit breakers indexed by endpoint name
    active_breakers: Arc<RwLock<HashMap<String, Arc<dyn CircuitBreaker>>>>,
    config: Arc<CircuitBreakerConfig>,
}

impl CircuitBreakerManager {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            active_breakers: Arc::new(RwLock::new(HashMap::new())),
            config: Arc::new(config),
        }
    }

    /// Get the configuration profile for an endpoint
    fn endpoint_profile(&self, endpoint: &str) -> &CircuitBreakerProfileConfig {
        self.config.profile_for(endpoint)
    }

    /// Get or create the circuit breaker for an endpoint
    pub async fn get_circuit_breaker(&self, endpoint: &str) -> AppResult<Arc<dyn CircuitBreaker>> {
        {
            let breakers = self.active_breakers.read().await;
            if let Some(breaker) = breakers.get(endpoint) {
                return Ok(breaker.clone());
            }
        }

        let profile = self.endpoint_profile(endpoint);
        let mut breakers = self.active_breakers.write().await;
        // Another caller may have created it while we waited for the write lock
        if let Some(breaker) = breakers.get(endpoint) {
            return Ok(breaker.clone());
        }

        info!(
            "Creating circuit breaker for endpoint '{}' with profile: {:?}",
            endpoint, profile
        );
        let breaker = create_circuit_breaker(profile)?;
        breakers.insert(endpoint.to_string(), breaker.clone());
        Ok(breaker)
    }

    /// Get statistics for all active circuit breakers
    pub async fn get_all_stats(&self) -> HashMap<String, CircuitBreakerStats> {
        let breakers: Vec<(String, Arc<dyn CircuitBreaker>)> = self
            .active_breakers
            .read()
            .await
            .iter()
            .map(|(endpoint, breaker)| (endpoint.clone(), breaker.clone()))
            .collect();

        join_all(breakers.into_iter().map(|(endpoint, breaker)| async move {
            let stats = breaker.stats().await;
            (endpoint, stats)
        }))
        .await
        .into_iter()
        .collect()
    }

    /// Force a breaker open (emergency stop for an endpoint)
    pub async fn force_circuit_open(&self, endpoint: &str) -> AppResult<()> {
        let breaker = self.active_breaker(endpoint).await?;
        breaker.force_open().await;
        warn!("Manually forced circuit breaker open for endpoint '{}'", endpoint);
        Ok(())
    }

    /// Administrative reset: the only way to close a breaker outside its own state machine
    pub async fn reset(&self, endpoint: &str) -> AppResult<()> {
        let breaker = self.active_breaker(endpoint).await?;
        breaker.force_closed().await;
        info!("Circuit breaker for endpoint '{}' reset by operator", endpoint);
        Ok(())
    }

    async fn active_breaker(&self, endpoint: &str) -> AppResult<Arc<dyn CircuitBreaker>> {
        self.active_breakers
            .read()
            .await
            .get(endpoint)
            .cloned()
            .ok_or_else(|| AppError::not_found("circuit breaker", endpoint))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::CircuitBreakerState;
    use std::time::Duration;

    fn config_with_profile(endpoint: &str, failure_threshold: u32) -> CircuitBreakerConfig {
        let mut config = CircuitBreakerConfig::default();
        config.profiles.insert(
            endpoint.to_string(),
            CircuitBreakerProfileConfig {
                failure_threshold,
                cooldown: Duration::from_secs(60),
                ..CircuitBreakerProfileConfig::default()
            },
        );
        config
    }

    #[tokio::test]
    async fn test_one_breaker_per_endpoint() {
        let manager = CircuitBreakerManager::new(CircuitBreakerConfig::default());

        let a = manager.get_circuit_breaker("music").await.unwrap();
        let b = manager.get_circuit_breaker("music").await.unwrap();
        let other = manager.get_circuit_breaker("voice").await.unwrap();

        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &other));
        assert_eq!(manager.get_all_stats().await.len(), 2);
    }

    #[tokio::test]
    async fn test_endpoint_profile_overrides_global() {
        let manager = CircuitBreakerManager::new(config_with_profile("music", 1));
        let breaker = manager.get_circuit_breaker("music").await.unwrap();

        let permit = breaker.try_acquire().await.unwrap();
        breaker.record_failure(permit).await;
        assert_eq!(breaker.state().await, CircuitBreakerState::Open);

        let stats = manager.get_all_stats().await;
        assert_eq!(stats["music"].trips, 1);
    }

    #[tokio::test]
    async fn test_reset_closes_open_breaker() {
        let manager = CircuitBreakerManager::new(CircuitBreakerConfig::default());
        let breaker = manager.get_circuit_breaker("music").await.unwrap();

        manager.force_circuit_open("music").await.unwrap();
        assert_eq!(breaker.state().await, CircuitBreakerState::Open);

        manager.reset("music").await.unwrap();
        assert_eq!(breaker.state().await, CircuitBreakerState::Closed);

        let err = manager.reset("unknown").await.unwrap_err();
        assert!(matches!(err, AppError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_reset_reaches_breaker_held_by_invoker() {
        use crate::config::InvokerConfig;
        use crate::services::provider::SimulatedProvider;
        use crate::services::resilient_invoker::ResilientInvoker;

        let invoker_config = InvokerConfig {
            endpoint: "music".to_string(),
            circuit_breaker: config_with_profile("music", 1),
            ..InvokerConfig::default()
        };
        let manager = CircuitBreakerManager::new(invoker_config.circuit_breaker.clone());
        let invoker = ResilientInvoker::from_config(
            &invoker_config,
            Arc::new(SimulatedProvider::new("music")),
            &manager,
        )
        .await
        .unwrap();

        let permit = invoker.breaker().try_acquire().await.unwrap();
        invoker.breaker().record_failure(permit).await;
        assert_eq!(invoker.breaker().state().await, CircuitBreakerState::Open);

        manager.reset("music").await.unwrap();

        let managed = manager.get_circuit_breaker("music").await.unwrap();
        assert!(Arc::ptr_eq(&managed, invoker.breaker()));
        assert_eq!(invoker.breaker().state().await, CircuitBreakerState::Closed);
    }
}

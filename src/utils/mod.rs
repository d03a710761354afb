pub mod circuit_breaker;
pub mod circuit_breaker_noop;
pub mod circuit_breaker_simple;
pub mod retry;

pub use circuit_breaker::{
    BreakerPermit, CircuitBreaker, CircuitBreakerConfig, CircuitBreakerState, CircuitBreakerStats,
    create_circuit_breaker,
};
pub use retry::{RetryConfig, RetryDecision, RetrySchedule};

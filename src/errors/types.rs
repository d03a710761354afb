//! Error type definitions for airwave
//!
//! The hierarchy mirrors the lifecycle of a job: validation happens at intake,
//! invocation errors come out of the resilience layer, and scheduling errors
//! come out of the broadcast planner.

use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

use crate::models::JobStatus;

/// Top-level application error type
#[derive(Error, Debug)]
pub enum AppError {
    /// Submission rejected before entering the queue (banned submitter, malformed payload)
    #[error("Validation error: {message}")]
    Validation { message: String },

    /// A job was asked to move along an edge its lifecycle does not allow
    #[error("Invalid status transition for job {job_id}: {from} -> {to}")]
    InvalidTransition {
        job_id: Uuid,
        from: JobStatus,
        to: JobStatus,
    },

    /// Resource not found errors
    #[error("Not found: {resource} with id {id}")]
    NotFound { resource: String, id: String },

    /// The same job id was inserted twice
    #[error("Duplicate {resource} with id {id}")]
    Duplicate { resource: String, id: String },

    /// The planner could not pick any candidate from a non-empty window.
    /// This indicates a defect: the diversity relaxation rule exists to prevent it.
    #[error("Scheduling deadlock: {message}")]
    SchedulingDeadlock { message: String },

    /// Configuration errors
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// Failures surfaced by the resilient invoker
    #[error("Invocation error: {0}")]
    Invocation(#[from] InvocationError),

    /// Generic internal errors
    #[error("Internal error: {message}")]
    Internal { message: String },
}

/// Failure taxonomy of a single resilient provider invocation
#[derive(Error, Debug, Clone, PartialEq)]
pub enum InvocationError {
    /// The attempt did not complete within its deadline; any late result is discarded
    #[error("attempt timed out after {0:?}")]
    Timeout(Duration),

    /// The provider answered with an error code
    #[error("provider error {code}: {message}")]
    ProviderError { code: u16, message: String },

    /// The breaker for the endpoint rejected the call without contacting the provider
    #[error("circuit open for endpoint '{endpoint}'")]
    CircuitOpen { endpoint: String },

    /// Every allowed attempt failed with a retryable error; `last` is the final failure
    #[error("retries exhausted after {attempts} attempts: {last}")]
    RetriesExhausted {
        attempts: u32,
        last: Box<InvocationError>,
    },

    /// The bulkhead was closed while the attempt waited for a slot (shutdown)
    #[error("invocation cancelled: {reason}")]
    Cancelled { reason: String },
}

impl InvocationError {
    /// Create a provider error
    pub fn provider<M: Into<String>>(code: u16, message: M) -> Self {
        Self::ProviderError {
            code,
            message: message.into(),
        }
    }

    /// Whether another attempt may succeed: timeouts and 5xx/429-equivalent provider codes
    pub fn is_retryable(&self) -> bool {
        match self {
            InvocationError::Timeout(_) => true,
            InvocationError::ProviderError { code, .. } => *code >= 500 || *code == 429,
            InvocationError::CircuitOpen { .. }
            | InvocationError::RetriesExhausted { .. }
            | InvocationError::Cancelled { .. } => false,
        }
    }

    /// Coarse classification used in failure reports
    pub fn kind(&self) -> FailureKind {
        match self {
            InvocationError::Timeout(_) => FailureKind::Timeout,
            InvocationError::ProviderError { .. } => FailureKind::ProviderError,
            InvocationError::CircuitOpen { .. } => FailureKind::CircuitOpen,
            InvocationError::RetriesExhausted { .. } => FailureKind::RetriesExhausted,
            InvocationError::Cancelled { .. } => FailureKind::Cancelled,
        }
    }
}

/// Reason a job ended up terminally failed
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, strum::Display, strum::AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum FailureKind {
    /// Submitter was banned after the job entered the queue
    Banned,
    Timeout,
    ProviderError,
    CircuitOpen,
    RetriesExhausted,
    /// Shutdown interrupted the invocation
    Cancelled,
    /// An operator gave up on an in-flight dispatch
    Abandoned,
}

/// Convenience methods for creating common error types
impl AppError {
    /// Create a validation error with a custom message
    pub fn validation<S: Into<String>>(message: S) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    /// Create a not found error
    pub fn not_found<R: Into<String>, I: ToString>(resource: R, id: I) -> Self {
        Self::NotFound {
            resource: resource.into(),
            id: id.to_string(),
        }
    }

    /// Create a configuration error
    pub fn configuration<S: Into<String>>(message: S) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create an internal error
    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(InvocationError::Timeout(Duration::from_secs(5)).is_retryable());
        assert!(InvocationError::provider(503, "unavailable").is_retryable());
        assert!(InvocationError::provider(429, "slow down").is_retryable());
        assert!(!InvocationError::provider(400, "bad prompt").is_retryable());
        assert!(
            !InvocationError::CircuitOpen {
                endpoint: "music".to_string()
            }
            .is_retryable()
        );
    }

    #[test]
    fn test_failure_kind_names() {
        let exhausted = InvocationError::RetriesExhausted {
            attempts: 3,
            last: Box::new(InvocationError::Timeout(Duration::from_secs(5))),
        };
        assert_eq!(exhausted.kind(), FailureKind::RetriesExhausted);
        assert_eq!(exhausted.kind().to_string(), "retries_exhausted");
        assert_eq!(FailureKind::CircuitOpen.as_ref(), "circuit_open");
        assert!(exhausted.to_string().contains("3 attempts"));
    }
}

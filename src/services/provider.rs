//! Generation provider boundary
//!
//! The provider turns an opaque payload into an audio artifact. It is slow,
//! rate limited and fails intermittently; everything in front of it lives in
//! [`super::resilient_invoker`].

use async_trait::async_trait;
use rand::Rng;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

use crate::errors::InvocationError;
use crate::models::{Artifact, JobPayload};

/// Error answered by the provider, with an HTTP-like status code
#[derive(Error, Debug, Clone, PartialEq)]
#[error("provider returned {code}: {message}")]
pub struct ProviderError {
    pub code: u16,
    pub message: String,
}

impl ProviderError {
    pub fn new<M: Into<String>>(code: u16, message: M) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl From<ProviderError> for InvocationError {
    fn from(err: ProviderError) -> Self {
        InvocationError::ProviderError {
            code: err.code,
            message: err.message,
        }
    }
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait GenerationProvider: Send + Sync {
    /// Human-readable provider name for logs
    fn name(&self) -> String;

    async fn generate(&self, payload: &JobPayload) -> Result<Artifact, ProviderError>;
}

/// Provider that sleeps for a random latency and fails at a configured rate.
///
/// Drives the `run-demo` command and the end-to-end tests.
#[derive(Debug, Clone)]
pub struct SimulatedProvider {
    name: String,
    failure_rate: f64,
    min_latency: Duration,
    max_latency: Duration,
    artifact_secs: (u64, u64),
}

impl SimulatedProvider {
    pub fn new<S: Into<String>>(name: S) -> Self {
        Self {
            name: name.into(),
            failure_rate: 0.0,
            min_latency: Duration::from_millis(50),
            max_latency: Duration::from_millis(250),
            artifact_secs: (120, 240),
        }
    }

    /// Probability in [0, 1] that a call answers 503
    pub fn with_failure_rate(mut self, failure_rate: f64) -> Self {
        self.failure_rate = failure_rate.clamp(0.0, 1.0);
        self
    }

    pub fn with_latency(mut self, min: Duration, max: Duration) -> Self {
        self.min_latency = min;
        self.max_latency = max.max(min);
        self
    }

    /// Range of generated airtime in seconds
    pub fn with_artifact_secs(mut self, min: u64, max: u64) -> Self {
        self.artifact_secs = (min, max.max(min));
        self
    }
}

#[async_trait]
impl GenerationProvider for SimulatedProvider {
    fn name(&self) -> String {
        self.name.clone()
    }

    async fn generate(&self, _payload: &JobPayload) -> Result<Artifact, ProviderError> {
        let (latency, fails, airtime) = {
            let mut rng = rand::rng();
            let latency = rng.random_range(self.min_latency..=self.max_latency);
            let fails = rng.random_bool(self.failure_rate);
            let airtime = rng.random_range(self.artifact_secs.0..=self.artifact_secs.1);
            (latency, fails, airtime)
        };

        tokio::time::sleep(latency).await;

        if fails {
            debug!("Simulated provider '{}' failing after {:?}", self.name, latency);
            return Err(ProviderError::new(503, "simulated upstream overload"));
        }

        Ok(Artifact {
            uri: format!("sim://{}/{}", self.name, Uuid::new_v4()),
            duration: Duration::from_secs(airtime),
        })
    }
}

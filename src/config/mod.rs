use anyhow::Result;
use chrono::NaiveTime;
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tracing::info;

pub mod defaults;
pub mod duration_serde;

use crate::errors::{AppError, AppResult};
use crate::utils::retry::RetryConfig;
use defaults::*;
use duration_serde::duration;

/// Environment variable prefix; nested keys use `__`, e.g. `AIRWAVE_INVOKER__TIMEOUT=10s`
pub const ENV_PREFIX: &str = "AIRWAVE_";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub dispatcher: DispatcherConfig,
    #[serde(default)]
    pub invoker: InvokerConfig,
    #[serde(default)]
    pub broadcast: BroadcastConfig,
}

/// Pending pool settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Submissions beyond this many pending jobs are rejected
    #[serde(default = "default_max_pending")]
    pub max_pending: usize,
    /// Average generation time used for the wait estimate returned at intake
    #[serde(default = "default_estimated_generation_time", with = "duration")]
    pub estimated_generation_time: Duration,
}

/// What the dispatcher does with a job whose call was rejected by an open breaker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum CircuitOpenPolicy {
    /// Terminally fail the job and report it
    #[default]
    Fail,
    /// Put the job back into the pending pool after `requeue_delay`
    Requeue,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatcherConfig {
    /// Fallback wake-up interval when no submission or completion arrives
    #[serde(default = "default_poll_interval", with = "duration")]
    pub poll_interval: Duration,
    #[serde(default)]
    pub circuit_open_policy: CircuitOpenPolicy,
    #[serde(default = "default_requeue_delay", with = "duration")]
    pub requeue_delay: Duration,
    /// Circuit-open requeues allowed per job before it is failed
    #[serde(default = "default_max_requeues")]
    pub max_requeues: u32,
    /// How long shutdown waits for in-flight jobs
    #[serde(default = "default_shutdown_grace", with = "duration")]
    pub shutdown_grace: Duration,
    /// Terminal jobs kept for status lookups
    #[serde(default = "default_archive_capacity")]
    pub archive_capacity: usize,
}

/// Resilience settings for the external generation provider
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvokerConfig {
    /// Name of the endpoint; selects the circuit breaker profile
    #[serde(default = "default_provider_endpoint")]
    pub endpoint: String,
    /// Deadline for a single attempt
    #[serde(default = "default_attempt_timeout", with = "duration")]
    pub timeout: Duration,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub bulkhead: BulkheadConfig,
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BulkheadConfig {
    /// Concurrent in-flight provider calls; also the dispatcher's worker budget
    #[serde(default = "default_bulkhead_max_concurrent")]
    pub max_concurrent: usize,
}

/// Circuit breaker settings: a global profile plus per-endpoint overrides
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    #[serde(default)]
    pub global: CircuitBreakerProfileConfig,
    #[serde(default)]
    pub profiles: HashMap<String, CircuitBreakerProfileConfig>,
}

impl CircuitBreakerConfig {
    /// Profile for an endpoint, falling back to the global one
    pub fn profile_for(&self, endpoint: &str) -> &CircuitBreakerProfileConfig {
        self.profiles.get(endpoint).unwrap_or(&self.global)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreakerProfileConfig {
    /// "simple" or "noop"
    #[serde(default = "default_breaker_implementation")]
    pub implementation_type: String,
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_breaker_cooldown", with = "duration")]
    pub cooldown: Duration,
    #[serde(default = "default_success_threshold")]
    pub success_threshold: u32,
    #[serde(default = "default_half_open_max_probes")]
    pub half_open_max_probes: u32,
}

/// Time-of-day window (UTC) during which engagement weights steer slot selection.
/// `start > end` wraps past midnight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeakWindow {
    pub start: NaiveTime,
    pub end: NaiveTime,
}

impl PeakWindow {
    pub fn contains(&self, time: NaiveTime) -> bool {
        if self.start <= self.end {
            time >= self.start && time < self.end
        } else {
            time >= self.start || time < self.end
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BroadcastConfig {
    /// The first slot never starts earlier than now + min_buffer
    #[serde(default = "default_min_buffer", with = "duration")]
    pub min_buffer: Duration,
    /// Transition overhead reserved between consecutive slots
    #[serde(default = "default_transition_gap", with = "duration")]
    pub transition_gap: Duration,
    /// Slot length for jobs whose artifact carries no duration
    #[serde(default = "default_slot_duration", with = "duration")]
    pub default_slot_duration: Duration,
    /// Ready jobs considered for each slot before the diversity rule is relaxed
    #[serde(default = "default_lookahead")]
    pub lookahead: usize,
    /// How far ahead of now the timeline is filled
    #[serde(default = "default_planning_horizon", with = "duration")]
    pub planning_horizon: Duration,
    #[serde(default = "default_plan_interval", with = "duration")]
    pub plan_interval: Duration,
    #[serde(default)]
    pub peak_hours: Vec<PeakWindow>,
    /// Engagement weight per category, used during peak hours
    #[serde(default)]
    pub category_weights: HashMap<String, f64>,
}

impl BroadcastConfig {
    pub fn category_weight(&self, category: &str) -> f64 {
        self.category_weights
            .get(category)
            .copied()
            .unwrap_or(DEFAULT_CATEGORY_WEIGHT)
    }

    pub fn is_peak(&self, time: NaiveTime) -> bool {
        self.peak_hours.iter().any(|window| window.contains(time))
    }
}

// Queue defaults
fn default_max_pending() -> usize {
    DEFAULT_MAX_PENDING
}

fn default_estimated_generation_time() -> Duration {
    Duration::from_secs(DEFAULT_ESTIMATED_GENERATION_SECS)
}

// Dispatcher defaults
fn default_poll_interval() -> Duration {
    Duration::from_millis(DEFAULT_POLL_INTERVAL_MS)
}

fn default_requeue_delay() -> Duration {
    Duration::from_secs(DEFAULT_REQUEUE_DELAY_SECS)
}

fn default_max_requeues() -> u32 {
    DEFAULT_MAX_REQUEUES
}

fn default_shutdown_grace() -> Duration {
    Duration::from_secs(DEFAULT_SHUTDOWN_GRACE_SECS)
}

fn default_archive_capacity() -> usize {
    DEFAULT_ARCHIVE_CAPACITY
}

// Invoker defaults
fn default_provider_endpoint() -> String {
    DEFAULT_PROVIDER_ENDPOINT.to_string()
}

fn default_attempt_timeout() -> Duration {
    Duration::from_secs(DEFAULT_ATTEMPT_TIMEOUT_SECS)
}

fn default_bulkhead_max_concurrent() -> usize {
    DEFAULT_BULKHEAD_MAX_CONCURRENT
}

fn default_breaker_implementation() -> String {
    DEFAULT_BREAKER_IMPLEMENTATION.to_string()
}

fn default_failure_threshold() -> u32 {
    DEFAULT_FAILURE_THRESHOLD
}

fn default_breaker_cooldown() -> Duration {
    Duration::from_secs(DEFAULT_BREAKER_COOLDOWN_SECS)
}

fn default_success_threshold() -> u32 {
    DEFAULT_SUCCESS_THRESHOLD
}

fn default_half_open_max_probes() -> u32 {
    DEFAULT_HALF_OPEN_MAX_PROBES
}

// Broadcast defaults
fn default_min_buffer() -> Duration {
    Duration::from_secs(DEFAULT_MIN_BUFFER_SECS)
}

fn default_transition_gap() -> Duration {
    Duration::from_secs(DEFAULT_TRANSITION_GAP_SECS)
}

fn default_slot_duration() -> Duration {
    Duration::from_secs(DEFAULT_SLOT_DURATION_SECS)
}

fn default_lookahead() -> usize {
    DEFAULT_LOOKAHEAD
}

fn default_planning_horizon() -> Duration {
    Duration::from_secs(DEFAULT_PLANNING_HORIZON_SECS)
}

fn default_plan_interval() -> Duration {
    Duration::from_secs(DEFAULT_PLAN_INTERVAL_SECS)
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_pending: default_max_pending(),
            estimated_generation_time: default_estimated_generation_time(),
        }
    }
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            poll_interval: default_poll_interval(),
            circuit_open_policy: CircuitOpenPolicy::default(),
            requeue_delay: default_requeue_delay(),
            max_requeues: default_max_requeues(),
            shutdown_grace: default_shutdown_grace(),
            archive_capacity: default_archive_capacity(),
        }
    }
}

impl Default for InvokerConfig {
    fn default() -> Self {
        Self {
            endpoint: default_provider_endpoint(),
            timeout: default_attempt_timeout(),
            retry: RetryConfig::default(),
            bulkhead: BulkheadConfig::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
        }
    }
}

impl Default for BulkheadConfig {
    fn default() -> Self {
        Self {
            max_concurrent: default_bulkhead_max_concurrent(),
        }
    }
}

impl Default for CircuitBreakerProfileConfig {
    fn default() -> Self {
        Self {
            implementation_type: default_breaker_implementation(),
            failure_threshold: default_failure_threshold(),
            cooldown: default_breaker_cooldown(),
            success_threshold: default_success_threshold(),
            half_open_max_probes: default_half_open_max_probes(),
        }
    }
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        Self {
            min_buffer: default_min_buffer(),
            transition_gap: default_transition_gap(),
            default_slot_duration: default_slot_duration(),
            lookahead: default_lookahead(),
            planning_horizon: default_planning_horizon(),
            plan_interval: default_plan_interval(),
            peak_hours: Vec::new(),
            category_weights: HashMap::new(),
        }
    }
}

impl Config {
    /// Load from `CONFIG_FILE` (default `airwave.toml`)
    pub fn load() -> Result<Self> {
        let config_file =
            std::env::var("CONFIG_FILE").unwrap_or_else(|_| "airwave.toml".to_string());
        Self::load_from_file(&config_file)
    }

    /// Defaults, then the TOML file if it exists, then `AIRWAVE_*` environment overrides
    pub fn load_from_file(config_file: &str) -> Result<Self> {
        let mut figment = Figment::from(Serialized::defaults(Config::default()));
        if std::path::Path::new(config_file).exists() {
            figment = figment.merge(Toml::file(config_file));
            info!("Loading configuration from: {}", config_file);
        } else {
            info!("Config file {} not found, using defaults", config_file);
        }

        let config: Config = figment
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the runtime cannot honour
    pub fn validate(&self) -> AppResult<()> {
        if self.invoker.bulkhead.max_concurrent == 0 {
            return Err(AppError::configuration(
                "invoker.bulkhead.max_concurrent must be at least 1",
            ));
        }
        if self.invoker.retry.max_attempts == 0 {
            return Err(AppError::configuration(
                "invoker.retry.max_attempts must be at least 1",
            ));
        }
        let factor = self.invoker.retry.backoff_factor;
        if factor.is_nan() || factor < 1.0 {
            return Err(AppError::configuration(
                "invoker.retry.backoff_factor must be >= 1.0",
            ));
        }
        if self.invoker.timeout.is_zero() {
            return Err(AppError::configuration("invoker.timeout must be positive"));
        }

        let breaker = &self.invoker.circuit_breaker;
        for (name, profile) in
            std::iter::once(("global", &breaker.global)).chain(
                breaker.profiles.iter().map(|(name, profile)| (name.as_str(), profile)),
            )
        {
            if profile.failure_threshold == 0
                || profile.success_threshold == 0
                || profile.half_open_max_probes == 0
            {
                return Err(AppError::configuration(format!(
                    "circuit breaker profile '{name}': thresholds and probe count must be at least 1"
                )));
            }
        }

        if self.broadcast.lookahead == 0 {
            return Err(AppError::configuration(
                "broadcast.lookahead must be at least 1",
            ));
        }
        if let Some((category, weight)) = self
            .broadcast
            .category_weights
            .iter()
            .find(|(_, weight)| !weight.is_finite() || **weight < 0.0)
        {
            return Err(AppError::configuration(format!(
                "broadcast.category_weights['{category}'] = {weight} is not a non-negative number"
            )));
        }
        Ok(())
    }
}

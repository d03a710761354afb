/// Configuration default values
///
/// All default values for configuration options live here so they can be
/// changed in one place.
// Queue defaults
pub const DEFAULT_MAX_PENDING: usize = 10_000;
pub const DEFAULT_ESTIMATED_GENERATION_SECS: u64 = 90;

// Dispatcher defaults
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 1_000;
pub const DEFAULT_REQUEUE_DELAY_SECS: u64 = 30;
pub const DEFAULT_MAX_REQUEUES: u32 = 3;
pub const DEFAULT_SHUTDOWN_GRACE_SECS: u64 = 30;
pub const DEFAULT_ARCHIVE_CAPACITY: usize = 1_024;

// Invoker defaults
pub const DEFAULT_PROVIDER_ENDPOINT: &str = "generation";
pub const DEFAULT_ATTEMPT_TIMEOUT_SECS: u64 = 5;
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
pub const DEFAULT_BASE_DELAY_MS: u64 = 1_000;
pub const DEFAULT_MAX_DELAY_MS: u64 = 30_000;
pub const DEFAULT_BACKOFF_FACTOR: f64 = 2.0;
pub const DEFAULT_BULKHEAD_MAX_CONCURRENT: usize = 4;

// Circuit breaker defaults
pub const DEFAULT_BREAKER_IMPLEMENTATION: &str = "simple";
pub const DEFAULT_FAILURE_THRESHOLD: u32 = 5;
pub const DEFAULT_BREAKER_COOLDOWN_SECS: u64 = 30;
pub const DEFAULT_SUCCESS_THRESHOLD: u32 = 2;
pub const DEFAULT_HALF_OPEN_MAX_PROBES: u32 = 1;

// Broadcast defaults
pub const DEFAULT_MIN_BUFFER_SECS: u64 = 30;
pub const DEFAULT_TRANSITION_GAP_SECS: u64 = 2;
pub const DEFAULT_SLOT_DURATION_SECS: u64 = 180;
pub const DEFAULT_LOOKAHEAD: usize = 5;
pub const DEFAULT_PLANNING_HORIZON_SECS: u64 = 3_600;
pub const DEFAULT_PLAN_INTERVAL_SECS: u64 = 5;
pub const DEFAULT_CATEGORY_WEIGHT: f64 = 1.0;

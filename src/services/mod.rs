//! Services around the resilient provider call and its collaborators

pub mod alerting;
pub mod bulkhead;
pub mod circuit_breaker_manager;
pub mod profile_store;
pub mod provider;
pub mod resilient_invoker;

pub use alerting::{AlertSink, FailureReport, MemoryAlertSink, TracingAlertSink};
pub use bulkhead::{Bulkhead, BulkheadPermit, BulkheadStats};
pub use circuit_breaker_manager::CircuitBreakerManager;
pub use profile_store::{InMemoryProfileStore, ProfileStore};
pub use provider::{GenerationProvider, ProviderError, SimulatedProvider};
pub use resilient_invoker::{Invocation, ResilientInvoker};

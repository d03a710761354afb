//! Centralized error handling for airwave
//!
//! This module unifies error types across the queue, the resilience layer and
//! the broadcast planner so that every failure carries enough context to
//! explain which layer failed.
//!
//! # Error Categories
//!
//! - **Validation Errors**: submissions rejected before entering the queue
//! - **Invocation Errors**: failures surfaced by the resilient provider wrapper
//! - **Lifecycle Errors**: illegal job status transitions, unknown job ids
//! - **Scheduling Errors**: planner defects (a deadlock must never happen)
//!
//! # Usage
//!
//! ```rust
//! use airwave::errors::{AppError, AppResult};
//!
//! fn example_function(payload_ok: bool) -> AppResult<()> {
//!     if !payload_ok {
//!         return Err(AppError::validation("payload is empty"));
//!     }
//!     Ok(())
//! }
//! ```

pub mod types;

pub use types::*;

/// Convenience type alias for Results using AppError
pub type AppResult<T> = Result<T, AppError>;

/// Convenience type alias for provider invocation Results
pub type InvocationResult<T> = Result<T, InvocationError>;

//! Job scheduling subsystem
//!
//! This module owns the path from submission to a resolved provider call:
//! - `reputation`: priority score from a submitter profile snapshot
//! - `PriorityQueue`: ordered pending pool with logarithmic updates
//! - `JobQueue`: shared, locked wrapper that handles intake and rescoring
//! - `Dispatcher`: pulls jobs within the worker budget and routes outcomes
//! - `JobArchive`: bounded store of terminal jobs for status lookups

pub mod archive;
pub mod dispatcher;
pub mod job_queue;
pub mod priority_queue;
pub mod reputation;
pub mod types;

pub use archive::JobArchive;
pub use dispatcher::Dispatcher;
pub use job_queue::JobQueue;
pub use priority_queue::PriorityQueue;
pub use types::*;

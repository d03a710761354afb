//! Domain models shared by the queue, the dispatcher and the broadcast planner

pub mod job;
pub mod profile;

pub use job::*;
pub use profile::*;

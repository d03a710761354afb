pub mod broadcast;
pub mod config;
pub mod errors;
pub mod job_scheduling;
pub mod models;
pub mod observability;
pub mod services;
pub mod utils;

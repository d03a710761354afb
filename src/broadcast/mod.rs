//! Broadcast timeline
//!
//! Generated jobs wait in a ready pool until the [`BroadcastPlanner`] places
//! them into time slots. A [`PlaybackExecutor`] collaborator plays each slot
//! when it comes due.

pub mod planner;

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use serde::Serialize;
use std::time::Duration;
use uuid::Uuid;

use crate::errors::AppResult;
use crate::models::Job;

pub use planner::BroadcastPlanner;

/// A reserved time interval on the broadcast timeline
#[derive(Debug, Clone, Serialize)]
pub struct Slot {
    pub id: Uuid,
    pub start: DateTime<Utc>,
    #[serde(with = "crate::config::duration_serde::duration")]
    pub expected_duration: Duration,
    /// Slots are created when a job is assigned, so this is only empty for
    /// slots built by hand
    pub job: Option<Job>,
}

impl Slot {
    pub fn new(start: DateTime<Utc>, expected_duration: Duration, job: Job) -> Self {
        Self {
            id: Uuid::new_v4(),
            start,
            expected_duration,
            job: Some(job),
        }
    }

    pub fn end(&self) -> DateTime<Utc> {
        offset(self.start, self.expected_duration)
    }

    pub fn job_id(&self) -> Option<Uuid> {
        self.job.as_ref().map(|job| job.id)
    }

    pub fn category(&self) -> Option<&str> {
        self.job.as_ref().map(|job| job.category.as_str())
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.start <= now
    }
}

/// `time + duration`, saturating at the latest representable instant
pub(crate) fn offset(time: DateTime<Utc>, duration: Duration) -> DateTime<Utc> {
    TimeDelta::from_std(duration)
        .ok()
        .and_then(|delta| time.checked_add_signed(delta))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Plays the audio of a slot. Returning `Ok` means the slot went on air.
#[async_trait]
pub trait PlaybackExecutor: Send + Sync {
    async fn play(&self, slot: &Slot) -> AppResult<()>;
}

/// Executor that only logs what would be played
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingPlaybackExecutor;

#[async_trait]
impl PlaybackExecutor for LoggingPlaybackExecutor {
    async fn play(&self, slot: &Slot) -> AppResult<()> {
        tracing::info!(
            "On air at {}: job {:?} ({}, {:?})",
            slot.start.format("%H:%M:%S"),
            slot.job_id(),
            slot.category().unwrap_or("-"),
            slot.expected_duration
        );
        Ok(())
    }
}

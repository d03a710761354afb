//! Job scheduling type definitions

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::cmp::Ordering;
use std::time::Duration;
use uuid::Uuid;

use crate::models::Job;

/// Ordering key of a pending job
///
/// Higher scores sort first; equal scores fall back to submission time and
/// then to the insertion sequence so that jobs submitted in the same instant
/// keep their arrival order.
#[derive(Debug, Clone, Copy)]
pub struct QueueKey {
    pub score: f64,
    pub submitted_at: DateTime<Utc>,
    pub seq: u64,
}

impl QueueKey {
    pub fn new(score: f64, submitted_at: DateTime<Utc>, seq: u64) -> Self {
        Self {
            score,
            submitted_at,
            seq,
        }
    }
}

impl PartialEq for QueueKey {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for QueueKey {}

impl PartialOrd for QueueKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueueKey {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .score
            .total_cmp(&self.score)
            .then_with(|| self.submitted_at.cmp(&other.submitted_at))
            .then_with(|| self.seq.cmp(&other.seq))
    }
}

/// Result of a pop: the next eligible job plus jobs dropped on the way
#[derive(Debug, Default)]
pub struct PopOutcome {
    /// Highest-priority job whose submitter is not banned
    pub job: Option<Job>,
    /// Jobs of banned submitters, already moved to `Failed`
    pub dropped: Vec<Job>,
}

/// One row of a queue snapshot
#[derive(Debug, Clone, Serialize)]
pub struct QueueEntry {
    /// 1-based position in dispatch order
    pub position: usize,
    pub job_id: Uuid,
    pub submitter_id: String,
    pub priority_score: f64,
    pub submitted_at: DateTime<Utc>,
    pub category: String,
}

/// Read-only ordered projection of the pending pool
#[derive(Debug, Clone, Serialize)]
pub struct QueueSnapshot {
    pub taken_at: DateTime<Utc>,
    pub entries: Vec<QueueEntry>,
}

impl QueueSnapshot {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Returned to the intake collaborator for every accepted submission
#[derive(Debug, Clone, Serialize)]
pub struct SubmissionReceipt {
    pub job_id: Uuid,
    /// 1-based position at the time of submission
    pub position: usize,
    #[serde(with = "crate::config::duration_serde::duration")]
    pub estimated_wait: Duration,
    pub priority_score: f64,
}

/// Statistics about the dispatcher state
#[derive(Debug, Clone, Default, Serialize)]
pub struct DispatcherStats {
    /// Jobs waiting in the priority queue
    pub pending: usize,
    /// Worker slots in use, including abandoned workers still winding down
    pub in_flight: usize,
    /// Jobs waiting out the requeue delay after an open circuit
    pub awaiting_requeue: usize,
    /// Worker budget (bulkhead capacity)
    pub capacity: usize,
    /// Total dispatches since start, including re-dispatches after a requeue
    pub dispatched: u64,
    pub ready: u64,
    pub failed: u64,
    pub requeued: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_key_ordering() {
        let now = Utc::now();
        let later = now + chrono::Duration::seconds(1);

        let high = QueueKey::new(200.0, later, 5);
        let low_early = QueueKey::new(100.0, now, 9);
        let low_late = QueueKey::new(100.0, later, 1);
        let low_late_second = QueueKey::new(100.0, later, 2);

        let mut keys = vec![low_late_second, low_early, high, low_late];
        keys.sort();

        assert_eq!(keys[0].score, 200.0);
        assert_eq!(keys[1].submitted_at, now);
        assert_eq!(keys[2].seq, 1);
        assert_eq!(keys[3].seq, 2);
    }
}

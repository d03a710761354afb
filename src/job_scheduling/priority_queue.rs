//! Pending pool ordered by priority score
//!
//! A `BTreeMap` keyed by [`QueueKey`] holds the dispatch order and a
//! `HashMap` indexes each job by id, so insert, remove, pop and score updates
//! stay logarithmic at any queue size. The structure is synchronous; the
//! shared async wrapper lives in [`super::job_queue`].

use chrono::Utc;
use std::collections::{BTreeMap, HashMap, HashSet};
use tracing::{debug, warn};
use uuid::Uuid;

use super::types::{PopOutcome, QueueEntry, QueueKey, QueueSnapshot};
use crate::errors::{AppError, AppResult};
use crate::models::{Job, JobStatus};

pub const BANNED_REASON: &str = "submitter banned";

#[derive(Debug)]
struct Entry {
    key: QueueKey,
    job: Job,
}

#[derive(Debug, Default)]
pub struct PriorityQueue {
    order: BTreeMap<QueueKey, Uuid>,
    entries: HashMap<Uuid, Entry>,
    by_submitter: HashMap<String, HashSet<Uuid>>,
    next_seq: u64,
}

impl PriorityQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, id: &Uuid) -> Option<&Job> {
        self.entries.get(id).map(|entry| &entry.job)
    }

    /// Insert a pending job using its current `priority_score`
    pub fn insert(&mut self, job: Job) -> AppResult<()> {
        if self.entries.contains_key(&job.id) {
            return Err(AppError::Duplicate {
                resource: "job".to_string(),
                id: job.id.to_string(),
            });
        }
        if job.status != JobStatus::Pending {
            return Err(AppError::validation(format!(
                "job {} is {} and cannot be queued",
                job.id, job.status
            )));
        }

        let key = QueueKey::new(job.priority_score, job.submitted_at, self.next_seq);
        self.next_seq += 1;

        self.order.insert(key, job.id);
        self.by_submitter
            .entry(job.submitter_id.clone())
            .or_default()
            .insert(job.id);
        debug!(
            "Queued job {} for {} with score {:.1}",
            job.id, job.submitter_id, job.priority_score
        );
        self.entries.insert(job.id, Entry { key, job });
        Ok(())
    }

    /// Highest-priority job without removing it
    pub fn peek(&self) -> Option<&Job> {
        self.order
            .first_key_value()
            .and_then(|(_, id)| self.get(id))
    }

    /// Remove and return the highest-priority job whose submitter is not banned.
    ///
    /// Jobs of banned submitters encountered on the way are removed, marked
    /// `Failed` with [`BANNED_REASON`] and returned in `dropped`.
    pub fn pop<F>(&mut self, is_banned: F) -> PopOutcome
    where
        F: Fn(&str) -> bool,
    {
        let mut outcome = PopOutcome::default();

        while let Some((_, id)) = self.order.pop_first() {
            let Some(mut job) = self.detach(&id) else {
                warn!("Queue order referenced unknown job {}", id);
                continue;
            };

            if is_banned(&job.submitter_id) {
                if let Err(e) = job.fail(BANNED_REASON) {
                    warn!("Could not fail banned job {}: {}", job.id, e);
                }
                debug!("Dropped job {} of banned submitter {}", job.id, job.submitter_id);
                outcome.dropped.push(job);
                continue;
            }

            outcome.job = Some(job);
            break;
        }

        outcome
    }

    /// Remove a job regardless of its position
    pub fn remove(&mut self, id: &Uuid) -> Option<Job> {
        let entry = self.entries.get(id)?;
        self.order.remove(&entry.key);
        self.detach(id)
    }

    /// Change the score of a pending job and move it to its new position
    pub fn update_score(&mut self, id: &Uuid, score: f64) -> AppResult<()> {
        let entry = self
            .entries
            .get_mut(id)
            .ok_or_else(|| AppError::not_found("job", id))?;

        self.order.remove(&entry.key);
        entry.key.score = score;
        entry.job.priority_score = score;
        self.order.insert(entry.key, *id);
        Ok(())
    }

    /// 1-based position of a job in dispatch order
    pub fn position(&self, id: &Uuid) -> Option<usize> {
        let key = self.entries.get(id)?.key;
        Some(self.order.range(..key).count() + 1)
    }

    /// Ids of every pending job of `submitter_id`
    pub fn jobs_for_submitter(&self, submitter_id: &str) -> Vec<Uuid> {
        self.by_submitter
            .get(submitter_id)
            .map(|ids| ids.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Ordered read-only projection of the pending pool
    pub fn snapshot(&self) -> QueueSnapshot {
        let entries = self
            .order
            .values()
            .filter_map(|id| self.get(id))
            .enumerate()
            .map(|(index, job)| QueueEntry {
                position: index + 1,
                job_id: job.id,
                submitter_id: job.submitter_id.clone(),
                priority_score: job.priority_score,
                submitted_at: job.submitted_at,
                category: job.category.clone(),
            })
            .collect();

        QueueSnapshot {
            taken_at: Utc::now(),
            entries,
        }
    }

    /// Drop a job from the id and submitter indexes (not from `order`)
    fn detach(&mut self, id: &Uuid) -> Option<Job> {
        let entry = self.entries.remove(id)?;
        if let Some(ids) = self.by_submitter.get_mut(&entry.job.submitter_id) {
            ids.remove(id);
            if ids.is_empty() {
                self.by_submitter.remove(&entry.job.submitter_id);
            }
        }
        Some(entry.job)
    }
}

//! Broadcast slot planner
//!
//! Ready jobs are kept in priority order. Each planning pass appends slots to
//! the timeline until it reaches the planning horizon:
//!
//! - a slot starts no earlier than `now + min_buffer` and no earlier than the
//!   previous slot's end plus `transition_gap`
//! - its job is picked from the first `lookahead` ready jobs, skipping any
//!   that would make three same-category slots in a row
//! - if every candidate would, the first candidate is taken anyway
//! - during peak windows candidates are ordered by category weight before
//!   priority

use chrono::{DateTime, Utc};
use std::cmp::Ordering;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::{PlaybackExecutor, Slot, offset};
use crate::config::BroadcastConfig;
use crate::errors::{AppError, AppResult};
use crate::job_scheduling::archive::JobArchive;
use crate::models::{Job, JobStatus};
use crate::observability::AppObservability;

/// Same-category run length that the diversity rule refuses to extend
const MAX_CATEGORY_RUN: usize = 2;

#[derive(Debug, Default)]
struct PlannerState {
    /// Ready jobs, highest priority first
    ready: Vec<Job>,
    /// Scheduled slots in start order
    timeline: VecDeque<Slot>,
    /// Categories of the most recently assigned slots, oldest first
    recent_categories: VecDeque<String>,
}

pub struct BroadcastPlanner {
    config: BroadcastConfig,
    state: Mutex<PlannerState>,
    archive: Arc<JobArchive>,
    observability: AppObservability,
}

fn priority_order(a: &Job, b: &Job) -> Ordering {
    b.priority_score
        .total_cmp(&a.priority_score)
        .then_with(|| a.submitted_at.cmp(&b.submitted_at))
}

impl BroadcastPlanner {
    pub fn new(config: BroadcastConfig, archive: Arc<JobArchive>) -> Self {
        Self {
            config,
            state: Mutex::new(PlannerState::default()),
            archive,
            observability: AppObservability::from_global(),
        }
    }

    pub fn with_observability(mut self, observability: AppObservability) -> Self {
        self.observability = observability;
        self
    }

    /// Add a generated job to the ready pool
    pub async fn submit_ready(&self, job: Job) -> AppResult<()> {
        if job.status != JobStatus::Ready {
            return Err(AppError::validation(format!(
                "job {} is {} and cannot be broadcast",
                job.id, job.status
            )));
        }

        let mut state = self.state.lock().await;
        if state.ready.iter().any(|j| j.id == job.id) {
            return Err(AppError::Duplicate {
                resource: "ready job".to_string(),
                id: job.id.to_string(),
            });
        }
        let index = state
            .ready
            .partition_point(|j| priority_order(j, &job) != Ordering::Greater);
        debug!("Job {} ready for broadcast ({} waiting)", job.id, state.ready.len() + 1);
        state.ready.insert(index, job);
        Ok(())
    }

    /// Fill the timeline up to the planning horizon and return the new slots
    pub async fn plan(&self, now: DateTime<Utc>) -> AppResult<Vec<Slot>> {
        let horizon = offset(now, self.config.planning_horizon);
        let mut state = self.state.lock().await;
        let mut scheduled = Vec::new();

        while !state.ready.is_empty() {
            let start = self.next_start(&state, now);
            if start >= horizon {
                break;
            }

            let peak = self.config.is_peak(start.time());
            let (index, relaxed) = self.choose_candidate(&state, peak)?;
            if relaxed {
                self.observability.diversity_relaxations.add(1, &[]);
                debug!(
                    "No category-diverse candidate among {} ready jobs, relaxing",
                    state.ready.len().min(self.config.lookahead)
                );
            }

            let mut job = state.ready.remove(index);
            job.transition(JobStatus::Scheduled)?;

            state.recent_categories.push_back(job.category.clone());
            while state.recent_categories.len() > MAX_CATEGORY_RUN {
                state.recent_categories.pop_front();
            }

            let duration = job
                .expected_duration()
                .unwrap_or(self.config.default_slot_duration);
            let slot = Slot::new(start, duration, job);
            info!(
                "Scheduled job {:?} ({}) at {} for {:?}{}",
                slot.job_id(),
                slot.category().unwrap_or("-"),
                slot.start.format("%Y-%m-%d %H:%M:%S UTC"),
                duration,
                if peak { " [peak]" } else { "" }
            );
            state.timeline.push_back(slot.clone());
            scheduled.push(slot);
        }

        if !scheduled.is_empty() {
            self.observability
                .slots_scheduled
                .add(scheduled.len() as u64, &[]);
        }
        Ok(scheduled)
    }

    fn next_start(&self, state: &PlannerState, now: DateTime<Utc>) -> DateTime<Utc> {
        let earliest = offset(now, self.config.min_buffer);
        match state.timeline.back() {
            Some(last) => offset(last.end(), self.config.transition_gap).max(earliest),
            None => earliest,
        }
    }

    /// Index into `ready` of the job for the next slot, and whether the
    /// diversity rule had to be relaxed to find it
    fn choose_candidate(&self, state: &PlannerState, peak: bool) -> AppResult<(usize, bool)> {
        let window = state.ready.len().min(self.config.lookahead);
        let mut candidates: Vec<usize> = (0..window).collect();

        if peak {
            // Stable sort keeps priority order among equal weights
            candidates.sort_by(|&a, &b| {
                let weight_a = self.config.category_weight(&state.ready[a].category);
                let weight_b = self.config.category_weight(&state.ready[b].category);
                weight_b.total_cmp(&weight_a)
            });
        }

        let run_category = if state.recent_categories.len() == MAX_CATEGORY_RUN {
            let mut recent = state.recent_categories.iter();
            match (recent.next(), recent.next()) {
                (Some(a), Some(b)) if a == b => Some(a.as_str()),
                _ => None,
            }
        } else {
            None
        };

        if let Some(&index) = candidates
            .iter()
            .find(|&&i| run_category != Some(state.ready[i].category.as_str()))
        {
            return Ok((index, false));
        }

        candidates
            .first()
            .map(|&index| (index, true))
            .ok_or_else(|| AppError::SchedulingDeadlock {
                message: format!(
                    "no candidate among {} ready jobs with lookahead {}",
                    state.ready.len(),
                    self.config.lookahead
                ),
            })
    }

    /// Slots whose start time has passed, in start order
    pub async fn due_slots(&self, now: DateTime<Utc>) -> Vec<Slot> {
        self.state
            .lock()
            .await
            .timeline
            .iter()
            .take_while(|slot| slot.is_due(now))
            .cloned()
            .collect()
    }

    /// Record that a scheduled job went on air; its slot leaves the timeline
    pub async fn mark_played(&self, job_id: &Uuid) -> AppResult<Job> {
        let slot = {
            let mut state = self.state.lock().await;
            let index = state
                .timeline
                .iter()
                .position(|slot| slot.job_id() == Some(*job_id))
                .ok_or_else(|| AppError::not_found("scheduled job", job_id))?;
            state
                .timeline
                .remove(index)
                .ok_or_else(|| AppError::internal("timeline index out of range"))?
        };

        let mut job = slot
            .job
            .ok_or_else(|| AppError::not_found("scheduled job", job_id))?;
        job.transition(JobStatus::Played)?;
        self.observability.jobs_played.add(1, &[]);
        info!("Job {} played ({})", job.id, job.category);

        self.archive.archive(job.clone()).await;
        Ok(job)
    }

    /// Copy of the planned timeline
    pub async fn timeline(&self) -> Vec<Slot> {
        self.state.lock().await.timeline.iter().cloned().collect()
    }

    /// A job currently in the ready pool or on the timeline
    pub async fn job(&self, job_id: &Uuid) -> Option<Job> {
        let state = self.state.lock().await;
        state
            .ready
            .iter()
            .find(|job| job.id == *job_id)
            .or_else(|| {
                state
                    .timeline
                    .iter()
                    .filter_map(|slot| slot.job.as_ref())
                    .find(|job| job.id == *job_id)
            })
            .cloned()
    }

    pub async fn ready_count(&self) -> usize {
        self.state.lock().await.ready.len()
    }

    pub async fn scheduled_count(&self) -> usize {
        self.state.lock().await.timeline.len()
    }

    /// Hand every due slot to the executor in start order.
    ///
    /// Stops at the first playback error so that later slots never air
    /// before an earlier one; the failed slot is retried on the next pass.
    pub async fn play_due(&self, executor: &dyn PlaybackExecutor, now: DateTime<Utc>) -> usize {
        let mut played = 0;
        for slot in self.due_slots(now).await {
            let Some(job_id) = slot.job_id() else {
                continue;
            };
            if let Err(e) = executor.play(&slot).await {
                warn!("Playback of job {} failed, retrying next pass: {}", job_id, e);
                break;
            }
            match self.mark_played(&job_id).await {
                Ok(_) => played += 1,
                Err(e) => error!("Could not mark job {} played: {}", job_id, e),
            }
        }
        played
    }

    /// Plan and play on a fixed interval until cancelled
    pub async fn run(
        &self,
        executor: Arc<dyn PlaybackExecutor>,
        cancellation_token: CancellationToken,
    ) -> AppResult<()> {
        let period = self.config.plan_interval.max(Duration::from_millis(10));
        info!("Starting broadcast planner (plan interval: {:?})", period);
        let mut ticker = tokio::time::interval(period);

        loop {
            tokio::select! {
                _ = cancellation_token.cancelled() => {
                    info!("Broadcast planner received cancellation signal");
                    break;
                }
                _ = ticker.tick() => {
                    let now = Utc::now();
                    if let Err(e) = self.plan(now).await {
                        error!("Broadcast planning failed: {}", e);
                        if matches!(e, AppError::SchedulingDeadlock { .. }) {
                            return Err(e);
                        }
                    }
                    self.play_due(executor.as_ref(), now).await;
                }
            }
        }

        info!("Broadcast planner stopped");
        Ok(())
    }
}

//! Shared pending pool with intake, rescoring and ban filtering

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::priority_queue::PriorityQueue;
use super::reputation;
use super::types::{PopOutcome, QueueSnapshot, SubmissionReceipt};
use crate::config::QueueConfig;
use crate::errors::{AppError, AppResult};
use crate::models::{Job, JobStatus, NewJob};
use crate::observability::AppObservability;
use crate::services::profile_store::ProfileStore;

/// Thread-safe pending pool shared by intake and the dispatcher
pub struct JobQueue {
    pending: Mutex<PriorityQueue>,
    profiles: Arc<dyn ProfileStore>,
    config: QueueConfig,
    /// Workers used to turn a queue position into a wait estimate
    workers: usize,
    /// Signalled whenever a job becomes dispatchable
    notify: Arc<Notify>,
    observability: AppObservability,
}

impl JobQueue {
    pub fn new(profiles: Arc<dyn ProfileStore>, config: QueueConfig, workers: usize) -> Self {
        Self {
            pending: Mutex::new(PriorityQueue::new()),
            profiles,
            config,
            workers: workers.max(1),
            notify: Arc::new(Notify::new()),
            observability: AppObservability::from_global(),
        }
    }

    pub fn with_observability(mut self, observability: AppObservability) -> Self {
        self.observability = observability;
        self
    }

    /// Handle woken on every submission and requeue
    pub fn notifier(&self) -> Arc<Notify> {
        self.notify.clone()
    }

    /// Accept a new submission, score it and place it in the pending pool
    pub async fn submit(&self, request: NewJob) -> AppResult<SubmissionReceipt> {
        if let Err(e) = Self::validate_request(&request) {
            self.observability.jobs_rejected.add(1, &[]);
            return Err(e);
        }

        let profile = self
            .profiles
            .profile(&request.submitter_id)
            .await
            .unwrap_or_default();
        if profile.is_banned {
            self.observability.jobs_rejected.add(1, &[]);
            return Err(AppError::validation(format!(
                "submitter {} is banned",
                request.submitter_id
            )));
        }

        let mut job = Job::new(request);
        job.priority_score = reputation::score(&profile, &job);
        let job_id = job.id;
        let priority_score = job.priority_score;

        let position = {
            let mut pending = self.pending.lock().await;
            if pending.len() >= self.config.max_pending {
                self.observability.jobs_rejected.add(1, &[]);
                return Err(AppError::validation(format!(
                    "queue is full ({} pending jobs)",
                    pending.len()
                )));
            }
            pending.insert(job)?;
            pending.position(&job_id).unwrap_or(pending.len())
        };

        self.observability.jobs_submitted.add(1, &[]);
        self.notify.notify_one();

        let estimated_wait = self.estimate_wait(position);
        info!(
            "Accepted job {} with score {:.1} at position {} (estimated wait {:?})",
            job_id, priority_score, position, estimated_wait
        );

        Ok(SubmissionReceipt {
            job_id,
            position,
            estimated_wait,
            priority_score,
        })
    }

    fn validate_request(request: &NewJob) -> AppResult<()> {
        if request.submitter_id.trim().is_empty() {
            return Err(AppError::validation("submitter id is empty"));
        }
        if request.payload.is_malformed() {
            return Err(AppError::validation("payload is empty or malformed"));
        }
        Ok(())
    }

    /// Pop the next dispatchable job, dropping jobs of banned submitters.
    ///
    /// The banned set is read before the lock is taken so no lock is held
    /// across the profile store call.
    pub async fn pop_next(&self) -> PopOutcome {
        let banned = self.profiles.banned_submitters().await;
        let outcome = self
            .pending
            .lock()
            .await
            .pop(|submitter| banned.contains(submitter));

        if !outcome.dropped.is_empty() {
            info!(
                "Dropped {} pending jobs of banned submitters",
                outcome.dropped.len()
            );
        }
        outcome
    }

    /// Return a job to the pending pool with a freshly read score
    pub async fn requeue(&self, mut job: Job) -> AppResult<()> {
        if job.status != JobStatus::Pending {
            return Err(AppError::validation(format!(
                "job {} is {} and cannot be requeued",
                job.id, job.status
            )));
        }

        let profile = self
            .profiles
            .profile(&job.submitter_id)
            .await
            .unwrap_or_default();
        job.priority_score = reputation::score(&profile, &job);
        debug!("Requeueing job {} with score {:.1}", job.id, job.priority_score);

        self.pending.lock().await.insert(job)?;
        self.notify.notify_one();
        Ok(())
    }

    /// Re-read a submitter's profile and update the score of their pending jobs.
    ///
    /// Returns how many jobs were rescored. A ban is not applied here; those
    /// jobs are dropped when they reach the head of the queue.
    pub async fn rescore_submitter(&self, submitter_id: &str) -> AppResult<usize> {
        let profile = self
            .profiles
            .profile(submitter_id)
            .await
            .unwrap_or_default();

        let mut pending = self.pending.lock().await;
        let mut rescored = 0;
        for job_id in pending.jobs_for_submitter(submitter_id) {
            let Some(job) = pending.get(&job_id) else {
                continue;
            };
            let score = reputation::score(&profile, job);
            pending.update_score(&job_id, score)?;
            rescored += 1;
        }
        drop(pending);

        if rescored > 0 {
            self.observability.jobs_rescored.add(rescored as u64, &[]);
            debug!("Rescored {} pending jobs of {}", rescored, submitter_id);
        }
        Ok(rescored)
    }

    /// Consume profile update notifications (submitter ids) until cancelled
    pub async fn run_rescore_listener(
        &self,
        mut updates: mpsc::Receiver<String>,
        cancellation_token: CancellationToken,
    ) {
        info!("Profile update listener started");
        loop {
            tokio::select! {
                _ = cancellation_token.cancelled() => break,
                update = updates.recv() => {
                    let Some(submitter_id) = update else { break };
                    if let Err(e) = self.rescore_submitter(&submitter_id).await {
                        warn!("Failed to rescore jobs of {}: {}", submitter_id, e);
                    }
                }
            }
        }
        info!("Profile update listener stopped");
    }

    /// Withdraw a pending job
    pub async fn remove(&self, job_id: &Uuid) -> Option<Job> {
        self.pending.lock().await.remove(job_id)
    }

    pub async fn position(&self, job_id: &Uuid) -> Option<usize> {
        self.pending.lock().await.position(job_id)
    }

    pub async fn get(&self, job_id: &Uuid) -> Option<Job> {
        self.pending.lock().await.get(job_id).cloned()
    }

    pub async fn snapshot(&self) -> QueueSnapshot {
        self.pending.lock().await.snapshot()
    }

    pub async fn pending_count(&self) -> usize {
        self.pending.lock().await.len()
    }

    /// Rough wait for a job at `position`: full rounds of the worker pool
    /// ahead of it times the typical generation time
    fn estimate_wait(&self, position: usize) -> Duration {
        let rounds = position.div_ceil(self.workers);
        self.config
            .estimated_generation_time
            .saturating_mul(u32::try_from(rounds).unwrap_or(u32::MAX))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{JobPayload, SubmitterProfile};
    use crate::services::profile_store::InMemoryProfileStore;
    use serde_json::json;

    async fn queue_with_profiles(workers: usize) -> (JobQueue, Arc<InMemoryProfileStore>) {
        let profiles = Arc::new(InMemoryProfileStore::new());
        profiles
            .upsert("premium", SubmitterProfile::new(200.0, 5, true))
            .await;
        profiles
            .upsert("regular", SubmitterProfile::new(20.0, 0, false))
            .await;
        let config = QueueConfig {
            max_pending: 3,
            estimated_generation_time: Duration::from_secs(60),
        };
        (JobQueue::new(profiles.clone(), config, workers), profiles)
    }

    fn request(submitter: &str) -> NewJob {
        NewJob::new(
            submitter,
            JobPayload::new(json!({"prompt": "city pop"})),
            "citypop",
        )
    }

    #[tokio::test]
    async fn test_submit_scores_and_orders() {
        let (queue, _) = queue_with_profiles(1).await;

        let regular = queue.submit(request("regular")).await.unwrap();
        let premium = queue.submit(request("premium")).await.unwrap();

        assert_eq!(regular.priority_score, 110.0);
        assert_eq!(regular.position, 1);
        assert_eq!(premium.priority_score, 300.0);
        assert_eq!(premium.position, 1);
        assert_eq!(queue.position(&regular.job_id).await, Some(2));
        assert_eq!(premium.estimated_wait, Duration::from_secs(60));
    }

    #[tokio::test]
    async fn test_unknown_submitter_gets_base_score() {
        let (queue, _) = queue_with_profiles(2).await;
        let receipt = queue.submit(request("newcomer")).await.unwrap();
        assert_eq!(receipt.priority_score, reputation::BASE_SCORE);
    }

    #[tokio::test]
    async fn test_rejects_banned_and_malformed() {
        let (queue, profiles) = queue_with_profiles(1).await;
        profiles.upsert("mallory", SubmitterProfile::banned()).await;

        let banned = queue.submit(request("mallory")).await.unwrap_err();
        assert!(matches!(banned, AppError::Validation { .. }));

        let empty = NewJob::new("regular", JobPayload::new(json!({})), "pop");
        assert!(matches!(
            queue.submit(empty).await,
            Err(AppError::Validation { .. })
        ));
        assert_eq!(queue.pending_count().await, 0);
    }

    #[tokio::test]
    async fn test_max_pending_enforced() {
        let (queue, _) = queue_with_profiles(1).await;
        for _ in 0..3 {
            queue.submit(request("regular")).await.unwrap();
        }
        let err = queue.submit(request("regular")).await.unwrap_err();
        assert!(err.to_string().contains("queue is full"));
    }

    #[tokio::test]
    async fn test_estimated_wait_uses_worker_rounds() {
        let (queue, _) = queue_with_profiles(2).await;
        assert_eq!(queue.estimate_wait(1), Duration::from_secs(60));
        assert_eq!(queue.estimate_wait(2), Duration::from_secs(60));
        assert_eq!(queue.estimate_wait(3), Duration::from_secs(120));
    }

    #[tokio::test]
    async fn test_rescore_moves_job_ahead() {
        let (queue, profiles) = queue_with_profiles(1).await;
        let premium = queue.submit(request("premium")).await.unwrap();
        let regular = queue.submit(request("regular")).await.unwrap();
        assert_eq!(queue.position(&regular.job_id).await, Some(2));

        profiles
            .upsert("regular", SubmitterProfile::new(1000.0, 10, true))
            .await;
        assert_eq!(queue.rescore_submitter("regular").await.unwrap(), 1);

        assert_eq!(queue.position(&regular.job_id).await, Some(1));
        assert_eq!(queue.position(&premium.job_id).await, Some(2));
        let rescored = queue.get(&regular.job_id).await.unwrap();
        assert_eq!(rescored.priority_score, 100.0 + 500.0 + 100.0 + 50.0);
    }

    #[tokio::test]
    async fn test_ban_after_submission_drops_at_pop() {
        let (queue, profiles) = queue_with_profiles(1).await;
        let premium = queue.submit(request("premium")).await.unwrap();
        let regular = queue.submit(request("regular")).await.unwrap();

        profiles.upsert("premium", SubmitterProfile::banned()).await;
        queue.rescore_submitter("premium").await.unwrap();

        let outcome = queue.pop_next().await;
        assert_eq!(outcome.job.map(|j| j.id), Some(regular.job_id));
        assert_eq!(outcome.dropped.len(), 1);
        assert_eq!(outcome.dropped[0].id, premium.job_id);
        assert_eq!(outcome.dropped[0].status, JobStatus::Failed);
    }

    #[tokio::test]
    async fn test_requeue_requires_pending_status() {
        let (queue, _) = queue_with_profiles(1).await;
        queue.submit(request("regular")).await.unwrap();
        let mut job = queue.pop_next().await.job.unwrap();

        job.transition(JobStatus::Dispatched).unwrap();
        assert!(queue.requeue(job.clone()).await.is_err());

        job.transition(JobStatus::Pending).unwrap();
        queue.requeue(job.clone()).await.unwrap();
        assert_eq!(queue.position(&job.id).await, Some(1));
    }

    #[tokio::test]
    async fn test_rescore_listener_applies_updates() {
        let (queue, profiles) = queue_with_profiles(1).await;
        let queue = Arc::new(queue);
        let receipt = queue.submit(request("regular")).await.unwrap();

        let (tx, rx) = mpsc::channel(4);
        let cancel = CancellationToken::new();
        let listener = {
            let queue = queue.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { queue.run_rescore_listener(rx, cancel).await })
        };

        profiles
            .upsert("regular", SubmitterProfile::new(0.0, 1, false))
            .await;
        tx.send("regular".to_string()).await.unwrap();
        drop(tx);
        listener.await.unwrap();

        let job = queue.get(&receipt.job_id).await.unwrap();
        assert_eq!(job.priority_score, 110.0);
        assert!(!cancel.is_cancelled());
    }
}

//! Dispatcher: moves pending jobs through the resilient invoker
//!
//! The dispatcher keeps at most `capacity` jobs in flight (the bulkhead cap).
//! It wakes on every submission or completion and on a periodic tick, pops
//! jobs from the [`JobQueue`], and spawns one task per job. Each dispatch
//! carries a token and its own cancellation token. An abandoned dispatch is
//! failed and archived immediately, its worker is cancelled, and its slot is
//! only handed out again once that worker has exited, so a job is never
//! resolved twice and the bulkhead never gets more callers than it has slots.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio::time::{Instant, interval};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::archive::JobArchive;
use super::job_queue::JobQueue;
use super::types::DispatcherStats;
use crate::broadcast::BroadcastPlanner;
use crate::config::{CircuitOpenPolicy, DispatcherConfig};
use crate::errors::{AppError, AppResult, FailureKind, InvocationError};
use crate::models::{Job, JobStatus};
use crate::observability::AppObservability;
use crate::services::alerting::{AlertSink, FailureReport};
use crate::services::resilient_invoker::{Invocation, ResilientInvoker};

const ABANDONED_REASON: &str = "dispatch abandoned by operator";

/// Record of a job held by a worker
#[derive(Debug, Clone)]
struct InFlight {
    token: u64,
    /// The job as it was dispatched
    job: Job,
    cancel: CancellationToken,
    dispatched_at: Instant,
    /// Failed by an operator; the slot stays taken until the worker exits
    abandoned: bool,
}

#[derive(Debug, Default)]
struct DispatchCounters {
    dispatched: AtomicU64,
    ready: AtomicU64,
    failed: AtomicU64,
    requeued: AtomicU64,
}

struct DispatcherInner {
    queue: Arc<JobQueue>,
    invoker: Arc<ResilientInvoker>,
    planner: Arc<BroadcastPlanner>,
    alerts: Arc<dyn AlertSink>,
    archive: Arc<JobArchive>,
    config: DispatcherConfig,
    capacity: usize,
    in_flight: Mutex<HashMap<Uuid, InFlight>>,
    requeue_counts: Mutex<HashMap<Uuid, u32>>,
    /// Jobs sleeping out `requeue_delay` before going back to the queue
    awaiting_requeue: Mutex<HashMap<Uuid, Job>>,
    next_token: AtomicU64,
    /// Serialises pop-and-spawn so concurrent wakeups cannot overshoot capacity
    dispatch_lock: Mutex<()>,
    wake: Arc<Notify>,
    counters: DispatchCounters,
    observability: AppObservability,
}

/// Service responsible for dispatching pending jobs to the generation provider
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<DispatcherInner>,
}

impl Dispatcher {
    pub fn new(
        queue: Arc<JobQueue>,
        invoker: Arc<ResilientInvoker>,
        planner: Arc<BroadcastPlanner>,
        alerts: Arc<dyn AlertSink>,
        archive: Arc<JobArchive>,
        config: DispatcherConfig,
    ) -> Self {
        let capacity = invoker.bulkhead().capacity();
        let wake = queue.notifier();
        Self {
            inner: Arc::new(DispatcherInner {
                queue,
                invoker,
                planner,
                alerts,
                archive,
                config,
                capacity,
                in_flight: Mutex::new(HashMap::new()),
                requeue_counts: Mutex::new(HashMap::new()),
                awaiting_requeue: Mutex::new(HashMap::new()),
                next_token: AtomicU64::new(1),
                dispatch_lock: Mutex::new(()),
                wake,
                counters: DispatchCounters::default(),
                observability: AppObservability::from_global(),
            }),
        }
    }

    /// Must be called before the dispatcher is cloned or started
    pub fn with_observability(mut self, observability: AppObservability) -> Self {
        if let Some(inner) = Arc::get_mut(&mut self.inner) {
            inner.observability = observability;
        } else {
            warn!("Dispatcher already shared, observability not replaced");
        }
        self
    }

    /// Run the dispatcher until cancelled, then wait for in-flight jobs
    pub async fn run(&self, cancellation_token: CancellationToken) -> AppResult<()> {
        let inner = &self.inner;
        info!(
            "Starting dispatcher (capacity: {}, circuit-open policy: {:?})",
            inner.capacity, inner.config.circuit_open_policy
        );
        let mut ticker = interval(inner.config.poll_interval.max(Duration::from_millis(10)));

        loop {
            tokio::select! {
                _ = cancellation_token.cancelled() => {
                    info!("Dispatcher received cancellation signal");
                    self.shutdown().await;
                    break;
                }
                _ = inner.wake.notified() => {
                    self.dispatch_ready().await;
                }
                _ = ticker.tick() => {
                    self.dispatch_ready().await;
                }
            }
        }

        info!("Dispatcher stopped");
        Ok(())
    }

    /// Pop and start jobs while worker capacity is available.
    ///
    /// Returns the number of jobs started.
    pub async fn dispatch_ready(&self) -> usize {
        let _guard = self.inner.dispatch_lock.lock().await;
        let mut started = 0;

        loop {
            let in_flight = self.inner.in_flight.lock().await.len();
            if in_flight >= self.inner.capacity {
                debug!("At maximum in-flight jobs ({}), waiting", self.inner.capacity);
                break;
            }

            let outcome = self.inner.queue.pop_next().await;
            for dropped in outcome.dropped {
                self.inner.finish_failed(dropped, FailureKind::Banned).await;
            }
            let Some(job) = outcome.job else {
                break;
            };

            if self.inner.clone().start(job).await {
                started += 1;
            }
        }

        if started > 0 {
            debug!("Dispatched {} jobs", started);
        }
        started
    }

    /// Give up on an in-flight dispatch.
    ///
    /// The job is failed, reported and archived right away and its worker is
    /// cancelled. The worker slot is released once the worker has exited;
    /// anything it returns in the meantime is discarded.
    pub async fn abandon(&self, job_id: &Uuid) -> AppResult<()> {
        let inner = &self.inner;
        let (mut job, dispatched_at) = {
            let mut in_flight = inner.in_flight.lock().await;
            let entry = in_flight
                .get_mut(job_id)
                .filter(|entry| !entry.abandoned)
                .ok_or_else(|| AppError::not_found("in-flight job", job_id))?;
            entry.abandoned = true;
            entry.cancel.cancel();
            (entry.job.clone(), entry.dispatched_at)
        };
        inner.requeue_counts.lock().await.remove(job_id);

        warn!(
            "Abandoned job {} after {:?} in flight",
            job_id,
            dispatched_at.elapsed()
        );
        job.fail(ABANDONED_REASON)?;
        inner.finish_failed(job, FailureKind::Abandoned).await;
        Ok(())
    }

    /// Current status of a job anywhere in the pipeline
    pub async fn job_status(&self, job_id: &Uuid) -> Option<JobStatus> {
        let inner = &self.inner;
        if inner.queue.get(job_id).await.is_some() {
            return Some(JobStatus::Pending);
        }
        if inner
            .in_flight
            .lock()
            .await
            .get(job_id)
            .is_some_and(|entry| !entry.abandoned)
        {
            return Some(JobStatus::Dispatched);
        }
        if let Some(job) = inner.awaiting_requeue.lock().await.get(job_id) {
            return Some(job.status);
        }
        if let Some(job) = inner.planner.job(job_id).await {
            return Some(job.status);
        }
        inner.archive.get(job_id).await.map(|job| job.status)
    }

    /// Jobs held by a worker, excluding abandoned ones
    pub async fn in_flight_jobs(&self) -> Vec<Uuid> {
        self.inner
            .in_flight
            .lock()
            .await
            .iter()
            .filter(|(_, entry)| !entry.abandoned)
            .map(|(id, _)| *id)
            .collect()
    }

    pub async fn stats(&self) -> DispatcherStats {
        let inner = &self.inner;
        DispatcherStats {
            pending: inner.queue.pending_count().await,
            in_flight: inner.in_flight.lock().await.len(),
            awaiting_requeue: inner.awaiting_requeue.lock().await.len(),
            capacity: inner.capacity,
            dispatched: inner.counters.dispatched.load(Ordering::Relaxed),
            ready: inner.counters.ready.load(Ordering::Relaxed),
            failed: inner.counters.failed.load(Ordering::Relaxed),
            requeued: inner.counters.requeued.load(Ordering::Relaxed),
        }
    }

    /// Wait for running jobs up to the grace period, then stop bulkhead waiters
    async fn shutdown(&self) {
        let inner = &self.inner;
        info!("Waiting for in-flight jobs to complete...");
        let mut check_interval = interval(Duration::from_millis(100));
        let start_time = Instant::now();

        loop {
            let running = inner.in_flight.lock().await.len();
            if running == 0 {
                info!("All in-flight jobs completed");
                break;
            }
            if start_time.elapsed() >= inner.config.shutdown_grace {
                warn!(
                    "Timeout waiting for {} in-flight jobs, proceeding with shutdown",
                    running
                );
                self.dump_status().await;
                break;
            }
            debug!("Still waiting for {} in-flight jobs...", running);
            check_interval.tick().await;
        }

        inner.invoker.bulkhead().close();
    }

    async fn dump_status(&self) {
        let stats = self.stats().await;
        info!(
            "Dispatcher stats - pending: {}, in flight: {}/{}, awaiting requeue: {}, dispatched: {}, ready: {}, failed: {}, requeued: {}",
            stats.pending,
            stats.in_flight,
            stats.capacity,
            stats.awaiting_requeue,
            stats.dispatched,
            stats.ready,
            stats.failed,
            stats.requeued
        );
        for job_id in self.in_flight_jobs().await {
            info!("  - still in flight: {}", job_id);
        }
    }
}

impl DispatcherInner {
    /// Mark a popped job dispatched and spawn its worker
    async fn start(self: Arc<Self>, mut job: Job) -> bool {
        if let Err(e) = job.transition(JobStatus::Dispatched) {
            error!("Cannot dispatch job {}: {}", job.id, e);
            return false;
        }

        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        let cancel = CancellationToken::new();
        self.in_flight.lock().await.insert(
            job.id,
            InFlight {
                token,
                job: job.clone(),
                cancel: cancel.clone(),
                dispatched_at: Instant::now(),
                abandoned: false,
            },
        );
        self.counters.dispatched.fetch_add(1, Ordering::Relaxed);
        self.observability.jobs_dispatched.add(1, &[]);
        self.observability.in_flight.add(1, &[]);

        info!(
            "Dispatching job {} (score: {:.1}, attempts so far: {})",
            job.id, job.priority_score, job.attempts
        );

        tokio::spawn(async move {
            let invocation = tokio::select! {
                _ = cancel.cancelled() => {
                    // Dropping the invocation releases its bulkhead and breaker permits
                    debug!("Worker for job {} cancelled", job.id);
                    self.release_slot(&job.id, token).await;
                    self.wake.notify_one();
                    return;
                }
                invocation = self.invoker.invoke(&job.payload) => invocation,
            };
            let outcome = if invocation.is_success() { "ready" } else { "failed" };
            self.observability
                .record_generation(invocation.elapsed, invocation.attempts, outcome);
            self.resolve(job, token, invocation).await;
            self.wake.notify_one();
        });
        true
    }

    /// Drop the in-flight record of `token`. Returns whether the dispatch was still live.
    async fn release_slot(&self, job_id: &Uuid, token: u64) -> bool {
        let mut in_flight = self.in_flight.lock().await;
        match in_flight.get(job_id) {
            Some(entry) if entry.token == token => {
                let live = !entry.abandoned;
                in_flight.remove(job_id);
                self.observability.in_flight.add(-1, &[]);
                live
            }
            _ => false,
        }
    }

    async fn resolve(self: &Arc<Self>, mut job: Job, token: u64, invocation: Invocation) {
        job.record_attempts(invocation.attempts);

        if !self.release_slot(&job.id, token).await {
            // Already failed and archived by `abandon`
            debug!("Discarding stale resolution for job {}", job.id);
            return;
        }

        match invocation.result {
            Ok(artifact) => {
                self.requeue_counts.lock().await.remove(&job.id);
                if let Err(e) = job.complete(artifact) {
                    error!("Cannot complete job {}: {}", job.id, e);
                    return;
                }
                self.counters.ready.fetch_add(1, Ordering::Relaxed);
                self.observability.jobs_ready.add(1, &[]);
                info!(
                    "Job {} ready after {} attempts in {:?}{}",
                    job.id,
                    invocation.attempts,
                    invocation.elapsed,
                    if invocation.used_fallback { " (fallback)" } else { "" }
                );
                if let Err(e) = self.planner.submit_ready(job).await {
                    error!("Broadcast planner rejected ready job: {}", e);
                }
            }
            Err(err @ InvocationError::CircuitOpen { .. })
                if self.config.circuit_open_policy == CircuitOpenPolicy::Requeue =>
            {
                self.requeue_or_fail(job, err).await;
            }
            Err(err) => {
                self.requeue_counts.lock().await.remove(&job.id);
                let kind = err.kind();
                if let Err(e) = job.fail(err.to_string()) {
                    error!("Cannot fail job {}: {}", job.id, e);
                    return;
                }
                self.finish_failed(job, kind).await;
            }
        }
    }

    async fn requeue_or_fail(self: &Arc<Self>, mut job: Job, err: InvocationError) {
        let requeues = {
            let mut counts = self.requeue_counts.lock().await;
            let count = counts.entry(job.id).or_insert(0);
            *count += 1;
            *count
        };

        if requeues > self.config.max_requeues {
            self.requeue_counts.lock().await.remove(&job.id);
            let reason = format!("{} (gave up after {} requeues)", err, self.config.max_requeues);
            if let Err(e) = job.fail(reason) {
                error!("Cannot fail job {}: {}", job.id, e);
                return;
            }
            self.finish_failed(job, FailureKind::CircuitOpen).await;
            return;
        }

        if let Err(e) = job.transition(JobStatus::Pending) {
            error!("Cannot requeue job {}: {}", job.id, e);
            return;
        }
        job.last_error = Some(err.to_string());
        self.counters.requeued.fetch_add(1, Ordering::Relaxed);
        self.observability.jobs_requeued.add(1, &[]);
        info!(
            "Circuit open for job {}, requeueing in {:?} ({}/{})",
            job.id, self.config.requeue_delay, requeues, self.config.max_requeues
        );
        self.awaiting_requeue.lock().await.insert(job.id, job.clone());

        let inner = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(inner.config.requeue_delay).await;
            let job_id = job.id;
            let requeued = inner.queue.requeue(job.clone()).await;
            inner.awaiting_requeue.lock().await.remove(&job_id);
            if let Err(e) = requeued {
                error!("Requeue of job {} failed: {}", job_id, e);
                inner.requeue_counts.lock().await.remove(&job_id);
                let mut job = job;
                if job.fail(format!("requeue failed: {e}")).is_ok() {
                    inner.finish_failed(job, FailureKind::CircuitOpen).await;
                }
            }
        });
    }

    /// Count, report once and archive a job that is already `Failed`
    async fn finish_failed(&self, job: Job, kind: FailureKind) {
        self.counters.failed.fetch_add(1, Ordering::Relaxed);
        self.observability.record_failure(kind);
        warn!(
            "Job {} of {} failed ({}) after {} attempts",
            job.id, job.submitter_id, kind, job.attempts
        );
        self.alerts.report(FailureReport::from_job(&job, kind)).await;
        self.archive.archive(job).await;
    }
}

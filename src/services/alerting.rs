//! Failure reporting
//!
//! Every terminally failed job produces exactly one [`FailureReport`]. The
//! sink decides what to do with it; delivery to users is out of scope.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::error;
use uuid::Uuid;

use crate::errors::FailureKind;
use crate::models::Job;

#[derive(Debug, Clone, Serialize)]
pub struct FailureReport {
    pub job_id: Uuid,
    pub submitter_id: String,
    pub kind: FailureKind,
    pub attempts: u32,
    pub message: String,
    pub reported_at: DateTime<Utc>,
}

impl FailureReport {
    /// Build a report from a job that already carries its failure reason
    pub fn from_job(job: &Job, kind: FailureKind) -> Self {
        Self {
            job_id: job.id,
            submitter_id: job.submitter_id.clone(),
            kind,
            attempts: job.attempts,
            message: job.last_error.clone().unwrap_or_else(|| kind.to_string()),
            reported_at: Utc::now(),
        }
    }
}

#[async_trait]
pub trait AlertSink: Send + Sync {
    async fn report(&self, report: FailureReport);
}

/// Writes each report as a structured `error!` event
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAlertSink;

#[async_trait]
impl AlertSink for TracingAlertSink {
    async fn report(&self, report: FailureReport) {
        error!(
            job_id = %report.job_id,
            submitter_id = %report.submitter_id,
            kind = %report.kind,
            attempts = report.attempts,
            "Job failed: {}",
            report.message
        );
    }
}

/// Keeps reports in memory
#[derive(Debug, Default)]
pub struct MemoryAlertSink {
    reports: Mutex<Vec<FailureReport>>,
}

impl MemoryAlertSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn reports(&self) -> Vec<FailureReport> {
        self.reports.lock().await.clone()
    }

    pub async fn reports_for(&self, job_id: Uuid) -> Vec<FailureReport> {
        self.reports
            .lock()
            .await
            .iter()
            .filter(|r| r.job_id == job_id)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl AlertSink for MemoryAlertSink {
    async fn report(&self, report: FailureReport) {
        self.reports.lock().await.push(report);
    }
}

//! Bounded archive of terminal jobs
//!
//! Failed and played jobs leave the live structures and land here so that
//! status lookups keep working for a while. The oldest entries are evicted
//! once the capacity is reached.

use lru::LruCache;
use std::num::NonZeroUsize;
use tokio::sync::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::models::Job;

#[derive(Debug)]
pub struct JobArchive {
    jobs: Mutex<LruCache<Uuid, Job>>,
}

impl JobArchive {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            jobs: Mutex::new(LruCache::new(capacity)),
        }
    }

    pub async fn archive(&self, job: Job) {
        if !job.status.is_terminal() {
            warn!("Archiving job {} in non-terminal status {}", job.id, job.status);
        }
        debug!("Archived job {} ({})", job.id, job.status);
        if let Some((evicted, _)) = self.jobs.lock().await.push(job.id, job) {
            debug!("Evicted job {} from archive", evicted);
        }
    }

    pub async fn get(&self, id: &Uuid) -> Option<Job> {
        self.jobs.lock().await.peek(id).cloned()
    }

    pub async fn len(&self) -> usize {
        self.jobs.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.jobs.lock().await.is_empty()
    }
}

//! Submitter profile lookups
//!
//! Profiles are owned by an external community service. The queue only reads
//! snapshots: at intake for scoring, at pop time for the ban filter, and when
//! an update notification asks for a rescore.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use tokio::sync::RwLock;
use tracing::debug;

use crate::models::SubmitterProfile;

#[async_trait]
pub trait ProfileStore: Send + Sync {
    /// Current profile of a submitter, `None` when unknown
    async fn profile(&self, submitter_id: &str) -> Option<SubmitterProfile>;

    /// Every submitter currently banned
    async fn banned_submitters(&self) -> HashSet<String>;
}

#[derive(Debug, Default)]
pub struct InMemoryProfileStore {
    profiles: RwLock<HashMap<String, SubmitterProfile>>,
}

impl InMemoryProfileStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn upsert<S: Into<String>>(&self, submitter_id: S, profile: SubmitterProfile) {
        let submitter_id = submitter_id.into();
        debug!("Profile updated for {}: {:?}", submitter_id, profile);
        self.profiles.write().await.insert(submitter_id, profile);
    }

    pub async fn remove(&self, submitter_id: &str) -> Option<SubmitterProfile> {
        self.profiles.write().await.remove(submitter_id)
    }
}

#[async_trait]
impl ProfileStore for InMemoryProfileStore {
    async fn profile(&self, submitter_id: &str) -> Option<SubmitterProfile> {
        self.profiles.read().await.get(submitter_id).cloned()
    }

    async fn banned_submitters(&self) -> HashSet<String> {
        self.profiles
            .read()
            .await
            .iter()
            .filter(|(_, profile)| profile.is_banned)
            .map(|(id, _)| id.clone())
            .collect()
    }
}

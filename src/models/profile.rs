use serde::{Deserialize, Serialize};

/// Reputation inputs of a submitter, read as a snapshot at scoring time.
///
/// The profile store collaborator owns these values; the core never mutates them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SubmitterProfile {
    pub reputation_score: f64,
    pub upvotes_received: u32,
    pub is_premium: bool,
    pub is_banned: bool,
}

impl SubmitterProfile {
    pub fn new(reputation_score: f64, upvotes_received: u32, is_premium: bool) -> Self {
        Self {
            reputation_score,
            upvotes_received,
            is_premium,
            is_banned: false,
        }
    }

    pub fn banned() -> Self {
        Self {
            is_banned: true,
            ..Self::default()
        }
    }
}

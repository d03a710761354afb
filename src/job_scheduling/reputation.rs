//! Priority scoring from submitter reputation
//!
//! The formula is kept byte-for-byte compatible with existing deployments:
//!
//! ```text
//! score = 100 + reputation_score * 0.5 + upvotes_received * 10 + (is_premium ? 50 : 0)
//! ```
//!
//! There is no decay for time spent waiting, so a steady stream of premium
//! submissions can keep low-reputation jobs waiting indefinitely. FIFO
//! ordering only breaks ties between equal scores.

use crate::models::{Job, SubmitterProfile};

pub const BASE_SCORE: f64 = 100.0;
pub const REPUTATION_WEIGHT: f64 = 0.5;
pub const UPVOTE_WEIGHT: f64 = 10.0;
pub const PREMIUM_BONUS: f64 = 50.0;

/// Priority score of `job` for a submitter with `profile`.
///
/// Pure and deterministic. Banned submitters are filtered before scoring and
/// the result is not clamped.
pub fn score(profile: &SubmitterProfile, _job: &Job) -> f64 {
    let premium = if profile.is_premium { PREMIUM_BONUS } else { 0.0 };
    BASE_SCORE
        + profile.reputation_score * REPUTATION_WEIGHT
        + f64::from(profile.upvotes_received) * UPVOTE_WEIGHT
        + premium
}

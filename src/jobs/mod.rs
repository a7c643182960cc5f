// Background jobs — the durable work the engine schedules for itself.
//
// A job is persisted as (name, JSON payload, priority). The enum below is
// the typed form; `encode`/`decode` convert between the two so the queue
// never has to know what a payload means.

pub mod queue;
pub mod runner;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::db::models::Activity;
use crate::error::FeedError;
use crate::pipeline::fanout::FanoutOperation;

pub use queue::{Scheduler, StoreScheduler};
pub use runner::{DrainSummary, JobHandler, JobRunner, RunOutcome};

/// Scheduling priority of the page-walking fan-out job.
pub const FANOUT_PRIORITY: i32 = 0;
/// Scheduling priority of follow backfill and unfollow purge jobs.
pub const FOLLOW_PRIORITY: i32 = 0;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "name", content = "payload")]
pub enum Job {
    /// Walk one page of `source`'s followers starting at `offset`, schedule
    /// a delivery task per priority tier, then continue with the next page.
    #[serde(rename = "fanout")]
    Fanout {
        source: String,
        operation: FanoutOperation,
        activities: Vec<Activity>,
        offset: usize,
    },
    /// Apply `operation` for `activities` to each feed in `feeds`.
    #[serde(rename = "fanout_activities")]
    FanoutActivities {
        source: String,
        operation: FanoutOperation,
        feeds: Vec<String>,
        activities: Vec<Activity>,
    },
    /// Copy up to `limit` recent activities of each target into `feed`.
    #[serde(rename = "feed_follow_many")]
    FollowMany {
        feed: String,
        targets: Vec<String>,
        limit: usize,
    },
    /// Delete from `feed` everything copied from `sources`.
    #[serde(rename = "feed_unfollow_many")]
    UnfollowMany { feed: String, sources: Vec<String> },
}

impl Job {
    pub fn name(&self) -> &'static str {
        match self {
            Job::Fanout { .. } => "fanout",
            Job::FanoutActivities { .. } => "fanout_activities",
            Job::FollowMany { .. } => "feed_follow_many",
            Job::UnfollowMany { .. } => "feed_unfollow_many",
        }
    }

    /// The JSON payload stored alongside the job name.
    pub fn encode(&self) -> Result<String> {
        let mut tagged = serde_json::to_value(self).context("Failed to serialize job")?;
        let payload = tagged
            .get_mut("payload")
            .map(Value::take)
            .unwrap_or(Value::Null);
        Ok(payload.to_string())
    }

    /// Rebuild a job from its stored name and payload. An unknown name or a
    /// payload that does not fit is a permanent failure, not a retryable one.
    pub fn decode(name: &str, payload: &str) -> Result<Self> {
        let payload: Value = serde_json::from_str(payload)
            .map_err(|e| FeedError::Validation(format!("job {name}: payload is not JSON: {e}")))?;
        let job = serde_json::from_value(json!({ "name": name, "payload": payload }))
            .map_err(|e| FeedError::Validation(format!("job {name}: {e}")))?;
        Ok(job)
    }
}

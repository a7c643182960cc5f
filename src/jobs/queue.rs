// Scheduler — the handle components use to enqueue background work.
//
// Passed explicitly into the dispatcher and the follow orchestrator so tests
// can swap in a recording scheduler and inspect what would have run.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use tracing::debug;

use crate::db::FeedStore;

use super::Job;

#[async_trait]
pub trait Scheduler: Send + Sync {
    /// Enqueue `job` to run as soon as a worker is free. Higher `priority`
    /// runs first. Returns the job id.
    async fn schedule_now(&self, job: &Job, priority: i32) -> Result<i64>;
}

/// Scheduler backed by the store's job table.
pub struct StoreScheduler {
    store: Arc<dyn FeedStore>,
}

impl StoreScheduler {
    pub fn new(store: Arc<dyn FeedStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl Scheduler for StoreScheduler {
    async fn schedule_now(&self, job: &Job, priority: i32) -> Result<i64> {
        let payload = job.encode()?;
        let id = self
            .store
            .enqueue_job(job.name(), &payload, priority, Utc::now())
            .await?;
        debug!(job_id = id, name = job.name(), priority, "job scheduled");
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::JobStatus;
    use crate::db::SqliteStore;

    #[tokio::test]
    async fn test_scheduled_job_is_persisted_pending() {
        let store: Arc<dyn FeedStore> = Arc::new(SqliteStore::in_memory().unwrap());
        let scheduler = StoreScheduler::new(store.clone());
        let job = Job::FollowMany {
            feed: "timeline:1".into(),
            targets: vec!["user:2".into()],
            limit: 5,
        };
        let id = scheduler.schedule_now(&job, 10).await.unwrap();

        let record = store.get_job(id).await.unwrap().unwrap();
        assert_eq!(record.name, "feed_follow_many");
        assert_eq!(record.priority, 10);
        assert_eq!(record.status, JobStatus::Pending);
        assert_eq!(Job::decode(&record.name, &record.payload).unwrap(), job);
    }
}

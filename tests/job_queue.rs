// Job queue behaviour against the SQLite store: priority order, lock
// expiry (at-least-once re-delivery) and failure bookkeeping.

use std::sync::Arc;

use chrono::{Duration, Utc};
use feedmill::db::models::JobStatus;
use feedmill::db::{FeedStore, SqliteStore};
use feedmill::jobs::{Job, Scheduler, StoreScheduler};

fn store() -> Arc<dyn FeedStore> {
    Arc::new(SqliteStore::in_memory().unwrap())
}

fn purge(feed: &str) -> Job {
    Job::UnfollowMany {
        feed: feed.to_string(),
        sources: vec!["user:1".to_string()],
    }
}

#[tokio::test]
async fn higher_priority_is_claimed_first() {
    let store = store();
    let scheduler = StoreScheduler::new(store.clone());
    let low = scheduler.schedule_now(&purge("timeline:low"), -20).await.unwrap();
    let high = scheduler.schedule_now(&purge("timeline:high"), 20).await.unwrap();
    let normal = scheduler.schedule_now(&purge("timeline:normal"), 0).await.unwrap();

    let lifetime = Duration::seconds(60);
    let now = Utc::now();
    let order: Vec<i64> = [
        store.claim_job(now, lifetime).await.unwrap(),
        store.claim_job(now, lifetime).await.unwrap(),
        store.claim_job(now, lifetime).await.unwrap(),
    ]
    .into_iter()
    .map(|job| job.unwrap().id)
    .collect();
    assert_eq!(order, vec![high, normal, low]);
    assert!(store.claim_job(now, lifetime).await.unwrap().is_none());
}

#[tokio::test]
async fn expired_lock_makes_job_claimable_again() {
    let store = store();
    let id = StoreScheduler::new(store.clone())
        .schedule_now(&purge("timeline:1"), 0)
        .await
        .unwrap();

    let now = Utc::now();
    let lifetime = Duration::seconds(30);
    let first = store.claim_job(now, lifetime).await.unwrap().unwrap();
    assert_eq!(first.id, id);
    assert_eq!(first.status, JobStatus::Running);

    // Still locked
    assert!(store
        .claim_job(now + Duration::seconds(10), lifetime)
        .await
        .unwrap()
        .is_none());

    // The worker died; the lock runs out and another claim takes over
    let second = store
        .claim_job(now + Duration::seconds(31), lifetime)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(second.id, id);
    assert_eq!(second.attempts, 2);
}

#[tokio::test]
async fn failed_job_keeps_its_error() {
    let store = store();
    let id = StoreScheduler::new(store.clone())
        .schedule_now(&purge("timeline:1"), 0)
        .await
        .unwrap();
    store.claim_job(Utc::now(), Duration::seconds(30)).await.unwrap();
    store.fail_job(id, "feed vanished", false).await.unwrap();

    let record = store.get_job(id).await.unwrap().unwrap();
    assert_eq!(record.status, JobStatus::Failed);
    assert_eq!(record.last_error.as_deref(), Some("feed vanished"));
    assert_eq!(store.stats().await.unwrap().jobs_failed, 1);
    assert!(store
        .claim_job(Utc::now(), Duration::seconds(30))
        .await
        .unwrap()
        .is_none());
}

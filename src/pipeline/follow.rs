// Follow/unfollow orchestration.
//
// The edge is created or removed synchronously; the history work that goes
// with it (backfilling the target's recent activities into the follower,
// purging the source's copies out of it) runs later as a background job.
// Only flat feeds can be followed.

use std::sync::Arc;

use anyhow::{bail, Result};
use futures::future::try_join_all;
use tracing::info;

use crate::db::models::{ActivityQuery, ActivitySelector, NewActivity};
use crate::error::FeedError;
use crate::followship::FollowshipIndex;
use crate::jobs::{Job, Scheduler, FOLLOW_PRIORITY};

use super::router::FeedRouter;

pub struct FollowOrchestrator {
    index: Arc<FollowshipIndex>,
    router: Arc<FeedRouter>,
    scheduler: Arc<dyn Scheduler>,
    follow_limit: usize,
    keep_history: bool,
}

impl FollowOrchestrator {
    pub fn new(
        index: Arc<FollowshipIndex>,
        router: Arc<FeedRouter>,
        scheduler: Arc<dyn Scheduler>,
        follow_limit: usize,
        keep_history: bool,
    ) -> Self {
        Self {
            index,
            router,
            scheduler,
            follow_limit,
            keep_history,
        }
    }

    /// Make `follower` follow `target` and schedule the backfill. Returns
    /// false, doing nothing, when the edge already exists.
    pub async fn follow(&self, follower: &str, target: &str, priority: Option<i32>) -> Result<bool> {
        let resolver = self.router.resolver();
        resolver.resolve(follower)?;
        let (_, kind) = resolver.resolve(target)?;

        if self.index.get(follower, target).await?.is_some() {
            return Ok(false);
        }
        if !kind.is_followable() {
            return Err(FeedError::UnsupportedOperation(format!(
                "cannot follow {kind} feed {target}"
            ))
            .into());
        }
        if !self.index.add(follower, target, priority).await? {
            // Lost a race with a concurrent follow of the same pair.
            return Ok(false);
        }

        let job = Job::FollowMany {
            feed: follower.to_string(),
            targets: vec![target.to_string()],
            limit: self.follow_limit,
        };
        self.scheduler.schedule_now(&job, FOLLOW_PRIORITY).await?;
        info!(follower, target, "followed");
        Ok(true)
    }

    /// Remove the edge and, unless history is kept, schedule the purge.
    /// `keep_history` overrides the configured default. Returns false,
    /// doing nothing, when there was no edge.
    pub async fn unfollow(
        &self,
        follower: &str,
        source: &str,
        keep_history: Option<bool>,
    ) -> Result<bool> {
        let resolver = self.router.resolver();
        resolver.resolve(follower)?;
        let (_, kind) = resolver.resolve(source)?;

        if self.index.get(follower, source).await?.is_none() {
            return Ok(false);
        }
        if !kind.is_followable() {
            return Err(FeedError::UnsupportedOperation(format!(
                "cannot unfollow {kind} feed {source}"
            ))
            .into());
        }
        if !self.index.remove(follower, source).await? {
            return Ok(false);
        }

        if !keep_history.unwrap_or(self.keep_history) {
            let job = Job::UnfollowMany {
                feed: follower.to_string(),
                sources: vec![source.to_string()],
            };
            self.scheduler.schedule_now(&job, FOLLOW_PRIORITY).await?;
        }
        info!(follower, source, "unfollowed");
        Ok(true)
    }

    /// Copy up to `limit` of the most recent activities of each target into
    /// `feed`, with `source` set to the target. Returns the number written.
    pub async fn backfill(&self, feed: &str, targets: &[String], limit: usize) -> Result<usize> {
        if limit == 0 || targets.is_empty() {
            return Ok(0);
        }
        let query = ActivityQuery::recent(limit);
        let found = try_join_all(targets.iter().map(|t| self.router.find(t, &query))).await?;

        let copies: Vec<NewActivity> = targets
            .iter()
            .zip(found)
            .flat_map(|(target, (_, items))| {
                items
                    .into_activities()
                    .into_iter()
                    .take(limit)
                    .map(move |a| a.to_copy(feed, target))
            })
            .collect();
        if copies.is_empty() {
            return Ok(0);
        }

        let outcome = self.router.add(feed, copies).await?;
        if let Some(failure) = outcome.result.failures.first() {
            bail!(
                "backfill of {feed} failed for {} items, first: {}",
                outcome.result.failures.len(),
                failure.message
            );
        }
        info!(feed, targets = targets.len(), copied = outcome.activities.len(), "backfilled");
        Ok(outcome.activities.len())
    }

    /// Delete from `feed` every activity copied from one of `sources`.
    pub async fn purge(&self, feed: &str, sources: &[String]) -> Result<usize> {
        let selectors: Vec<ActivitySelector> = sources
            .iter()
            .map(|s| ActivitySelector::Source(s.clone()))
            .collect();
        let outcome = self.router.remove(feed, &selectors).await?;
        if let Some(failure) = outcome.result.failures.first() {
            bail!("purge of {feed} failed: {}", failure.message);
        }
        info!(feed, sources = sources.len(), removed = outcome.result.removed, "purged");
        Ok(outcome.result.removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineSettings;
    use crate::db::{FeedStore, SqliteStore};
    use crate::followship::TierThresholds;
    use crate::jobs::StoreScheduler;
    use crate::pipeline::Trimmer;
    use chrono::{Duration, TimeZone, Utc};

    fn orchestrator(limit: usize) -> (Arc<dyn FeedStore>, Arc<FeedRouter>, FollowOrchestrator) {
        let store: Arc<dyn FeedStore> = Arc::new(SqliteStore::in_memory().unwrap());
        let router = Arc::new(
            FeedRouter::new(store.clone(), &EngineSettings::default()).with_trimmer(Trimmer::never()),
        );
        let index = Arc::new(FollowshipIndex::new(store.clone(), TierThresholds::default()));
        let scheduler = Arc::new(StoreScheduler::new(store.clone()));
        let orchestrator = FollowOrchestrator::new(index, router.clone(), scheduler, limit, false);
        (store, router, orchestrator)
    }

    async fn publish(router: &FeedRouter, feed: &str, count: i64) {
        let start = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        let items = (0..count)
            .map(|n| {
                NewActivity::new(feed, "post", &format!("post:{n}"))
                    .with_time(start + Duration::minutes(n))
            })
            .collect();
        router.add(feed, items).await.unwrap();
    }

    #[tokio::test]
    async fn test_follow_rejects_aggregated_targets() {
        let (_, _, orchestrator) = orchestrator(5);
        let err = orchestrator
            .follow("timeline:1", "notification:2", None)
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<FeedError>(),
            Some(FeedError::UnsupportedOperation(_))
        ));
        assert!(orchestrator.follow("timeline:1", "user:", None).await.is_err());
    }

    #[tokio::test]
    async fn test_follow_twice_schedules_once() {
        let (store, _, orchestrator) = orchestrator(5);
        assert!(orchestrator.follow("timeline:1", "user:2", None).await.unwrap());
        assert!(!orchestrator.follow("timeline:1", "user:2", None).await.unwrap());
        assert_eq!(store.stats().await.unwrap().jobs_pending, 1);
    }

    #[tokio::test]
    async fn test_backfill_copies_most_recent() {
        let (_, router, orchestrator) = orchestrator(5);
        publish(&router, "user:2", 10).await;

        let copied = orchestrator
            .backfill("timeline:1", &["user:2".to_string()], 5)
            .await
            .unwrap();
        assert_eq!(copied, 5);
        let (_, items) = router.find("timeline:1", &ActivityQuery::recent(50)).await.unwrap();
        let items = items.into_activities();
        let objects: Vec<&str> = items.iter().map(|a| a.object.as_str()).collect();
        assert_eq!(objects, vec!["post:9", "post:8", "post:7", "post:6", "post:5"]);
        assert!(items.iter().all(|a| a.source.as_deref() == Some("user:2")));
    }

    #[tokio::test]
    async fn test_purge_removes_only_that_source() {
        let (_, router, orchestrator) = orchestrator(5);
        publish(&router, "user:2", 3).await;
        publish(&router, "user:3", 2).await;
        orchestrator
            .backfill("timeline:1", &["user:2".to_string(), "user:3".to_string()], 5)
            .await
            .unwrap();

        let removed = orchestrator
            .purge("timeline:1", &["user:2".to_string()])
            .await
            .unwrap();
        assert_eq!(removed, 3);
        let (_, items) = router.find("timeline:1", &ActivityQuery::recent(50)).await.unwrap();
        let items = items.into_activities();
        assert_eq!(items.len(), 2);
        assert!(items.iter().all(|a| a.source.as_deref() == Some("user:3")));
    }

    #[tokio::test]
    async fn test_unfollow_with_history_kept_schedules_nothing() {
        let (store, _, orchestrator) = orchestrator(5);
        orchestrator.follow("timeline:1", "user:2", None).await.unwrap();
        let pending = store.stats().await.unwrap().jobs_pending;
        assert!(orchestrator.unfollow("timeline:1", "user:2", Some(true)).await.unwrap());
        assert_eq!(store.stats().await.unwrap().jobs_pending, pending);
        assert!(!orchestrator.unfollow("timeline:1", "user:2", None).await.unwrap());
    }
}

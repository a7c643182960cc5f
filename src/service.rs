// Feed service — the operations the engine exposes to its callers.
//
// Wires the router, followship index, dispatcher and follow orchestrator
// together over one store and one scheduler. Writes to flat feeds are
// propagated: carbon copies are written directly at create time, and the
// fan-out to followers is scheduled as a background job. Copies are never
// propagated further.
//
// The service is also the job handler the worker runs jobs against.

use std::collections::HashSet;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use futures::future::join_all;
use tracing::{debug, warn};

use crate::activity::validate_activity;
use crate::config::EngineSettings;
use crate::db::models::{
    Activity, ActivityQuery, ActivitySelector, ActivityUpdate, BulkWriteResult, Feed, FeedItems,
    FeedSettings, Mark, NewActivity, StoreStats, WriteOutcome,
};
use crate::db::FeedStore;
use crate::error::FeedError;
use crate::feed::{is_placeholder, RankSpec};
use crate::followship::{FollowerLookup, FollowshipIndex, TieredFollowers};
use crate::jobs::{Job, JobHandler, Scheduler, StoreScheduler, FANOUT_PRIORITY};
use crate::pipeline::{apply_fanout, Dispatcher, FanoutOperation, FeedRouter, FollowOrchestrator};

pub struct FeedService {
    store: Arc<dyn FeedStore>,
    router: Arc<FeedRouter>,
    index: Arc<FollowshipIndex>,
    dispatcher: Dispatcher,
    orchestrator: FollowOrchestrator,
    scheduler: Arc<dyn Scheduler>,
}

impl FeedService {
    /// A service whose background work goes to the store's job table.
    pub fn new(store: Arc<dyn FeedStore>, settings: &EngineSettings) -> Self {
        let scheduler = Arc::new(StoreScheduler::new(store.clone()));
        Self::with_scheduler(store, settings, scheduler)
    }

    pub fn with_scheduler(
        store: Arc<dyn FeedStore>,
        settings: &EngineSettings,
        scheduler: Arc<dyn Scheduler>,
    ) -> Self {
        let router = Arc::new(FeedRouter::new(store.clone(), settings));
        Self::with_router(store, settings, scheduler, router)
    }

    /// Build around a preconfigured router (custom handlers or trimmer).
    pub fn with_router(
        store: Arc<dyn FeedStore>,
        settings: &EngineSettings,
        scheduler: Arc<dyn Scheduler>,
        router: Arc<FeedRouter>,
    ) -> Self {
        let index = Arc::new(FollowshipIndex::new(store.clone(), settings.tier_thresholds));
        let dispatcher = Dispatcher::new(index.clone(), scheduler.clone(), settings.fanout_page_size);
        let orchestrator = FollowOrchestrator::new(
            index.clone(),
            router.clone(),
            scheduler.clone(),
            settings.follow_limit,
            settings.keep_history,
        );
        Self {
            store,
            router,
            index,
            dispatcher,
            orchestrator,
            scheduler,
        }
    }

    pub fn store(&self) -> &Arc<dyn FeedStore> {
        &self.store
    }

    pub fn router(&self) -> &Arc<FeedRouter> {
        &self.router
    }

    pub async fn stats(&self) -> Result<StoreStats> {
        self.store.stats().await
    }

    // --- Feeds ---

    pub async fn get_or_create_feed(&self, id: &str) -> Result<Feed> {
        self.router.feed(id).await
    }

    /// Change a feed's settings, creating the feed first if needed.
    pub async fn configure_feed(&self, id: &str, settings: &FeedSettings) -> Result<Feed> {
        if settings.max_length == Some(0) {
            return Err(FeedError::Validation("maxLength must be at least 1".into()).into());
        }
        if let Some(rank) = &settings.rank {
            RankSpec::parse(rank)?;
        }
        if let Some(template) = &settings.aggregation {
            if template.trim().is_empty() {
                return Err(FeedError::Validation("aggregation template is empty".into()).into());
            }
        }
        let feed = self.router.feed(id).await?;
        self.store
            .update_feed_settings(&feed.id, settings)
            .await?
            .ok_or_else(|| FeedError::NotFound(format!("feed {}", feed.id)).into())
    }

    // --- Activities ---

    /// Add activities to a feed. Invalid input is rejected before anything
    /// is written. On flat feeds, each activity's cc feeds receive a direct
    /// copy and the feed's followers receive it through fan-out.
    pub async fn create_activity(
        &self,
        feed_id: &str,
        mut items: Vec<NewActivity>,
    ) -> Result<WriteOutcome> {
        if items.is_empty() {
            return Err(FeedError::Validation("no activities given".into()).into());
        }
        let feed = self.router.feed(feed_id).await?;
        let mut cc_lists = Vec::with_capacity(items.len());
        for item in &mut items {
            item.feed = feed.id.clone();
            validate_activity(item)?;
            cc_lists.push(self.cc_targets(&feed, &item.cc)?);
        }

        let outcome = self.router.add_to(&feed, items).await?;
        if !feed.kind.is_followable() {
            return Ok(outcome);
        }

        for (index, activity) in outcome.indexed() {
            if !cc_lists[index].is_empty() {
                self.deliver_cc(&feed, activity, &cc_lists[index]).await?;
            }
        }
        self.dispatcher
            .schedule(&feed.id, FanoutOperation::AddActivities, outcome.activities.clone())
            .await?;
        Ok(outcome)
    }

    /// De-duplicated, validated cc feeds of one activity. cc is only honored
    /// on flat feeds, and never back into the feed itself.
    fn cc_targets(&self, feed: &Feed, cc: &[String]) -> Result<Vec<String>, FeedError> {
        if cc.is_empty() || !feed.kind.is_followable() {
            return Ok(Vec::new());
        }
        let mut seen = HashSet::new();
        let mut targets = Vec::new();
        for target in cc {
            let (id, _) = self.router.resolver().resolve(target)?;
            let id = id.to_string();
            if id != feed.id && seen.insert(id.clone()) {
                targets.push(id);
            }
        }
        Ok(targets)
    }

    /// Write one activity's copies into its cc feeds, in parallel. A failing
    /// cc feed is logged and skipped; the ones that landed are recorded so
    /// removing the activity removes them too.
    async fn deliver_cc(&self, feed: &Feed, activity: &Activity, targets: &[String]) -> Result<()> {
        let writes = targets.iter().map(|target| async move {
            let copy = activity.to_copy(target, &feed.id);
            let result = self.router.add(target, vec![copy]).await;
            (target, result)
        });

        let mut delivered = Vec::new();
        for (target, result) in join_all(writes).await {
            match result {
                Ok(outcome) if outcome.result.is_ok() => delivered.push(target.clone()),
                Ok(outcome) => {
                    let message = outcome
                        .result
                        .failures
                        .first()
                        .map(|f| f.message.clone())
                        .unwrap_or_default();
                    warn!(feed = %feed.id, cc = %target, error = %message, "cc copy rejected");
                }
                Err(e) => warn!(feed = %feed.id, cc = %target, error = %e, "cc copy failed"),
            }
        }
        self.store.record_cc(activity.id, &delivered).await?;
        debug!(activity_id = activity.id, cc = delivered.len(), "cc copies written");
        Ok(())
    }

    /// Update activities addressed by id or `(foreignId, time)`. Updates
    /// apply to the addressed feed only.
    pub async fn update_activity(
        &self,
        feed_id: &str,
        updates: Vec<ActivityUpdate>,
    ) -> Result<BulkWriteResult> {
        if updates.is_empty() {
            return Err(FeedError::Validation("no updates given".into()).into());
        }
        for update in &updates {
            check_selector(&update.selector)?;
            if update.patch.is_empty() {
                return Err(FeedError::Validation("update changes no fields".into()).into());
            }
            for (name, value) in [("actor", &update.patch.actor), ("object", &update.patch.object)] {
                if value.as_deref().is_some_and(|v| v.trim().is_empty() || is_placeholder(v)) {
                    return Err(
                        FeedError::Validation(format!("{name} is not a usable value")).into(),
                    );
                }
            }
        }
        let feed = self.router.feed(feed_id).await?;
        self.router.update_in(&feed, &updates).await
    }

    /// Remove activities. On flat feeds the removal cascades to the cc
    /// copies and is fanned out to followers.
    pub async fn remove_activity(
        &self,
        feed_id: &str,
        selectors: Vec<ActivitySelector>,
    ) -> Result<WriteOutcome> {
        if selectors.is_empty() {
            return Err(FeedError::Validation("no activity selectors given".into()).into());
        }
        for selector in &selectors {
            check_selector(selector)?;
        }
        let feed = self.router.feed(feed_id).await?;
        let outcome = self.router.remove_from(&feed, &selectors).await?;
        if !feed.kind.is_followable() || outcome.activities.is_empty() {
            return Ok(outcome);
        }

        for activity in &outcome.activities {
            let copies = [ActivitySelector::copies_of(activity)];
            for cc in self.store.take_cc_links(activity.id).await? {
                if let Err(e) = self.router.remove(&cc, &copies).await {
                    warn!(feed = %feed.id, cc = %cc, error = %e, "cc copy removal failed");
                }
            }
        }
        self.dispatcher
            .schedule(&feed.id, FanoutOperation::RemoveActivities, outcome.activities.clone())
            .await?;
        Ok(outcome)
    }

    /// Flat feeds return activities; aggregated and notification feeds
    /// return buckets.
    pub async fn find_activities(&self, feed_id: &str, query: &ActivityQuery) -> Result<FeedItems> {
        let (_, items) = self.router.find(feed_id, query).await?;
        Ok(items)
    }

    // --- Followships ---

    pub async fn follow(&self, feed: &str, target: &str, priority: Option<i32>) -> Result<bool> {
        self.orchestrator.follow(feed, target, priority).await
    }

    pub async fn unfollow(&self, feed: &str, source: &str, keep_history: Option<bool>) -> Result<bool> {
        self.orchestrator.unfollow(feed, source, keep_history).await
    }

    pub async fn followers(&self, feed: &str, page_size: usize, offset: usize) -> Result<TieredFollowers> {
        self.index.list_followers(feed, page_size.max(1), offset).await
    }

    pub async fn followees(&self, feed: &str, page_size: usize, offset: usize) -> Result<TieredFollowers> {
        self.index.list_followees(feed, page_size.max(1), offset).await
    }

    // --- Notification engagement ---

    /// Mark buckets seen (all of the feed's buckets when none are listed).
    pub async fn mark_seen(&self, feed_id: &str, bucket_ids: &[i64]) -> Result<usize> {
        self.mark(feed_id, bucket_ids, Mark::Seen).await
    }

    pub async fn mark_read(&self, feed_id: &str, bucket_ids: &[i64]) -> Result<usize> {
        self.mark(feed_id, bucket_ids, Mark::Read).await
    }

    async fn mark(&self, feed_id: &str, bucket_ids: &[i64], mark: Mark) -> Result<usize> {
        let feed = self.router.feed(feed_id).await?;
        if !feed.kind.is_aggregated() {
            return Err(FeedError::UnsupportedOperation(format!(
                "{} is a {} feed and has no buckets to mark",
                feed.id, feed.kind
            ))
            .into());
        }
        self.store
            .mark_buckets(&feed.id, bucket_ids, mark, Utc::now())
            .await
    }
}

/// A foreignId selector needs a usable id; the other forms are typed.
fn check_selector(selector: &ActivitySelector) -> Result<(), FeedError> {
    if let ActivitySelector::Foreign { foreign_id, .. } = selector {
        if foreign_id.trim().is_empty() || is_placeholder(foreign_id) {
            return Err(FeedError::Validation(format!(
                "foreignId '{foreign_id}' is not usable"
            )));
        }
    }
    Ok(())
}

#[async_trait]
impl JobHandler for FeedService {
    async fn execute(&self, job: Job) -> Result<()> {
        match job {
            Job::Fanout {
                source,
                operation,
                activities,
                offset,
            } => {
                let page = self
                    .dispatcher
                    .dispatch_page(&source, operation, &activities, offset)
                    .await?;
                if let Some(next) = page.next_offset {
                    let continuation = Job::Fanout {
                        source,
                        operation,
                        activities,
                        offset: next,
                    };
                    self.scheduler
                        .schedule_now(&continuation, FANOUT_PRIORITY)
                        .await?;
                }
            }
            Job::FanoutActivities {
                source,
                operation,
                feeds,
                activities,
            } => {
                apply_fanout(&self.router, &source, operation, &feeds, &activities).await?;
            }
            Job::FollowMany {
                feed,
                targets,
                limit,
            } => {
                self.orchestrator.backfill(&feed, &targets, limit).await?;
            }
            Job::UnfollowMany { feed, sources } => {
                self.orchestrator.purge(&feed, &sources).await?;
            }
        }
        Ok(())
    }
}

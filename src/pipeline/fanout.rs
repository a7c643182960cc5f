// Fan-out dispatcher — propagates an add or remove on a source feed to the
// feeds that follow it.
//
// Followers are read one page at a time in priority order. For every
// non-empty priority tier of a page, one delivery task carrying
// {operation, target feeds, activities} is scheduled at that tier's
// priority, so the queue serves high-priority followers first. Delivery
// itself (`apply_fanout`) writes to each target feed independently: one
// failing feed never stops the others, and the collected failures are
// handed back so the job is retried. Copies are idempotent by origin, so
// a retried delivery does not duplicate anything.

use std::sync::Arc;

use anyhow::{bail, Result};
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::db::models::{Activity, ActivitySelector};
use crate::followship::FollowerLookup;
use crate::jobs::{Job, Scheduler, FANOUT_PRIORITY};

use super::router::FeedRouter;

/// Target feeds written in parallel by one delivery task.
const DELIVERY_CONCURRENCY: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FanoutOperation {
    AddActivities,
    RemoveActivities,
}

impl FanoutOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            FanoutOperation::AddActivities => "addActivities",
            FanoutOperation::RemoveActivities => "removeActivities",
        }
    }
}

/// Result of dispatching one follower page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageDispatch {
    pub followers: usize,
    /// Delivery tasks scheduled, one per non-empty tier.
    pub tasks: usize,
    /// Offset of the next page, if there is one.
    pub next_offset: Option<usize>,
}

/// Totals over a full dispatch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchSummary {
    pub pages: usize,
    pub followers: usize,
    pub tasks: usize,
}

pub struct Dispatcher {
    followers: Arc<dyn FollowerLookup>,
    scheduler: Arc<dyn Scheduler>,
    page_size: usize,
}

impl Dispatcher {
    pub fn new(
        followers: Arc<dyn FollowerLookup>,
        scheduler: Arc<dyn Scheduler>,
        page_size: usize,
    ) -> Self {
        Self {
            followers,
            scheduler,
            page_size: page_size.max(1),
        }
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Start a durable fan-out: enqueue the job that walks the first page.
    /// Each page job enqueues its own continuation, so an interrupted
    /// fan-out resumes at the page it was on instead of dropping the rest.
    pub async fn schedule(
        &self,
        source: &str,
        operation: FanoutOperation,
        activities: Vec<Activity>,
    ) -> Result<Option<i64>> {
        if activities.is_empty() {
            return Ok(None);
        }
        let job = Job::Fanout {
            source: source.to_string(),
            operation,
            activities,
            offset: 0,
        };
        let id = self.scheduler.schedule_now(&job, FANOUT_PRIORITY).await?;
        Ok(Some(id))
    }

    /// Schedule delivery tasks for the follower page at `offset`.
    pub async fn dispatch_page(
        &self,
        source: &str,
        operation: FanoutOperation,
        activities: &[Activity],
        offset: usize,
    ) -> Result<PageDispatch> {
        let page = self
            .followers
            .list_followers(source, self.page_size, offset)
            .await?;

        let mut tasks = 0;
        for (tier, feeds) in page.by_priority() {
            let job = Job::FanoutActivities {
                source: source.to_string(),
                operation,
                feeds: feeds.clone(),
                activities: activities.to_vec(),
            };
            self.scheduler.schedule_now(&job, tier.job_priority()).await?;
            debug!(source, %tier, feeds = feeds.len(), offset, "delivery task scheduled");
            tasks += 1;
        }

        Ok(PageDispatch {
            followers: page.len(),
            tasks,
            next_offset: page.has_more.then_some(offset + self.page_size),
        })
    }

    /// Walk every follower page in offset order within this call.
    ///
    /// Pages already scheduled stay scheduled if a later page fails.
    pub async fn dispatch(
        &self,
        source: &str,
        operation: FanoutOperation,
        activities: &[Activity],
    ) -> Result<DispatchSummary> {
        let mut summary = DispatchSummary::default();
        let mut offset = Some(0);
        while let Some(current) = offset {
            let page = self
                .dispatch_page(source, operation, activities, current)
                .await?;
            summary.pages += 1;
            summary.followers += page.followers;
            summary.tasks += page.tasks;
            offset = page.next_offset;
        }
        if summary.followers > 0 {
            info!(
                source,
                operation = operation.as_str(),
                followers = summary.followers,
                pages = summary.pages,
                "fan-out dispatched"
            );
        }
        Ok(summary)
    }
}

/// Apply one delivery task: write `activities` (or remove their copies)
/// in every feed of `feeds`. Returns the number of feeds written; fails
/// with the collected per-feed errors if any feed failed.
pub async fn apply_fanout(
    router: &FeedRouter,
    source: &str,
    operation: FanoutOperation,
    feeds: &[String],
    activities: &[Activity],
) -> Result<usize> {
    let results: Vec<(String, Result<()>)> = stream::iter(feeds.iter().cloned())
        .map(|feed| async move {
            let result = deliver(router, source, operation, &feed, activities).await;
            (feed, result)
        })
        .buffer_unordered(DELIVERY_CONCURRENCY)
        .collect()
        .await;

    let mut errors = Vec::new();
    for (feed, result) in results {
        if let Err(e) = result {
            warn!(source, feed = %feed, error = %e, "fan-out delivery failed");
            errors.push(format!("{feed}: {e:#}"));
        }
    }
    if !errors.is_empty() {
        bail!(
            "fan-out {} from {source} failed for {} of {} feeds: {}",
            operation.as_str(),
            errors.len(),
            feeds.len(),
            errors.join("; ")
        );
    }
    Ok(feeds.len())
}

async fn deliver(
    router: &FeedRouter,
    source: &str,
    operation: FanoutOperation,
    feed: &str,
    activities: &[Activity],
) -> Result<()> {
    let result = match operation {
        FanoutOperation::AddActivities => {
            let copies = activities.iter().map(|a| a.to_copy(feed, source)).collect();
            router.add(feed, copies).await?.result
        }
        FanoutOperation::RemoveActivities => {
            let selectors: Vec<ActivitySelector> =
                activities.iter().map(ActivitySelector::copies_of).collect();
            router.remove(feed, &selectors).await?.result
        }
    };
    if let Some(failure) = result.failures.first() {
        bail!(
            "{} of {} items failed, first: {}",
            result.failures.len(),
            activities.len(),
            failure.message
        );
    }
    Ok(())
}

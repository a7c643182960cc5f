// Activity store — flat feeds: an append log of activities per feed with
// idempotent upsert and removal by id or by (foreignId, time).
//
// Also home to activity validation, shared with the aggregation engine:
// required fields must be present and must not carry an unresolved
// placeholder such as "user:undefined".

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::db::models::{
    ActivityQuery, ActivitySelector, ActivityUpdate, BulkFailure, BulkWriteResult, Feed,
    FeedItems, NewActivity, WriteOutcome,
};
use crate::db::FeedStore;
use crate::error::FeedError;
use crate::feed::{is_placeholder, FeedId};
use crate::handler::FeedHandler;

/// Check the fields every activity needs before it is written.
pub fn validate_activity(activity: &NewActivity) -> Result<(), FeedError> {
    FeedId::parse(&activity.feed)
        .map_err(|e| FeedError::Validation(format!("feed: {e}")))?;
    for (name, value) in [
        ("actor", &activity.actor),
        ("verb", &activity.verb),
        ("object", &activity.object),
    ] {
        if value.trim().is_empty() {
            return Err(FeedError::Validation(format!("{name} is required")));
        }
        if is_placeholder(value) {
            return Err(FeedError::Validation(format!(
                "{name} '{value}' is an unresolved placeholder"
            )));
        }
    }
    if let Some(foreign_id) = &activity.foreign_id {
        if foreign_id.trim().is_empty() || is_placeholder(foreign_id) {
            return Err(FeedError::Validation(format!(
                "foreignId '{foreign_id}' is not usable"
            )));
        }
    }
    Ok(())
}

/// Build a selector from loosely supplied identity parts: either an id, or a
/// foreignId together with its time.
pub fn selector_from_parts(
    id: Option<i64>,
    foreign_id: Option<&str>,
    time: Option<DateTime<Utc>>,
) -> Result<ActivitySelector, FeedError> {
    match (id, foreign_id, time) {
        (Some(id), _, _) => Ok(ActivitySelector::Id(id)),
        (None, Some(foreign_id), Some(time)) if !foreign_id.trim().is_empty() => {
            Ok(ActivitySelector::foreign(foreign_id, time))
        }
        (None, Some(_), None) => Err(FeedError::Validation(
            "foreignId requires the activity time".to_string(),
        )),
        _ => Err(FeedError::Validation(
            "an id or a foreignId with time is required".to_string(),
        )),
    }
}

/// Stamp the feed onto each item and split off the invalid ones.
///
/// Returns the valid items with their positions in the batch, plus a
/// failure entry per rejected item.
pub(crate) fn prepare_batch(
    feed: &Feed,
    items: Vec<NewActivity>,
) -> (Vec<(usize, NewActivity)>, Vec<BulkFailure>) {
    let mut valid = Vec::with_capacity(items.len());
    let mut failures = Vec::new();
    for (index, mut item) in items.into_iter().enumerate() {
        item.feed = feed.id.clone();
        item.cc.clear();
        match validate_activity(&item) {
            Ok(()) => valid.push((index, item)),
            Err(e) => failures.push(BulkFailure {
                index,
                message: e.to_string(),
            }),
        }
    }
    (valid, failures)
}

pub struct ActivityStore {
    store: Arc<dyn FeedStore>,
}

impl ActivityStore {
    pub fn new(store: Arc<dyn FeedStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl FeedHandler for ActivityStore {
    async fn add_activities(&self, feed: &Feed, items: Vec<NewActivity>) -> Result<WriteOutcome> {
        let (valid, rejected) = prepare_batch(feed, items);
        let (positions, batch): (Vec<usize>, Vec<NewActivity>) = valid.into_iter().unzip();

        let mut outcome = self.store.insert_activities(&batch).await?;
        // Store failures are indexed within the valid batch; map them back
        for failure in &mut outcome.result.failures {
            failure.index = positions[failure.index];
        }
        outcome.result.failures.extend(rejected);
        Ok(outcome)
    }

    async fn update_activities(
        &self,
        feed: &Feed,
        updates: &[ActivityUpdate],
    ) -> Result<BulkWriteResult> {
        self.store.update_activities(&feed.id, updates).await
    }

    async fn remove_activities(
        &self,
        feed: &Feed,
        selectors: &[ActivitySelector],
    ) -> Result<WriteOutcome> {
        self.store.remove_activities(&feed.id, selectors).await
    }

    async fn find(&self, feed: &Feed, query: &ActivityQuery) -> Result<FeedItems> {
        let activities = self.store.find_activities(&feed.id, query).await?;
        Ok(FeedItems::Flat(activities))
    }

    async fn trim(&self, feed: &Feed, max_len: u32) -> Result<usize> {
        self.store.trim_activities(&feed.id, max_len).await
    }
}

// Feed handlers — the per-kind storage strategies and the registry that
// selects one for a feed.
//
// Flat feeds store raw activities (ActivityStore); aggregated and
// notification feeds store bounded buckets (AggregationEngine). The
// registry is built once at startup and resolved by FeedKind, so callers
// never branch on the kind themselves.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;

use crate::activity::ActivityStore;
use crate::aggregation::AggregationEngine;
use crate::config::EngineSettings;
use crate::db::models::{
    ActivityQuery, ActivitySelector, ActivityUpdate, BulkWriteResult, Feed, FeedItems,
    NewActivity, WriteOutcome,
};
use crate::db::FeedStore;
use crate::feed::FeedKind;

/// Storage operations on one feed. All bulk operations are unordered: a
/// failing item is reported in the result and never blocks its siblings.
#[async_trait]
pub trait FeedHandler: Send + Sync {
    /// Add activities to `feed`. Each item's `feed` is stamped with the
    /// feed id before it is written.
    async fn add_activities(&self, feed: &Feed, items: Vec<NewActivity>) -> Result<WriteOutcome>;

    async fn update_activities(&self, feed: &Feed, updates: &[ActivityUpdate])
        -> Result<BulkWriteResult>;

    async fn remove_activities(&self, feed: &Feed, selectors: &[ActivitySelector])
        -> Result<WriteOutcome>;

    async fn find(&self, feed: &Feed, query: &ActivityQuery) -> Result<FeedItems>;

    /// Bound the feed to `max_len` items by recency. Returns items removed.
    async fn trim(&self, feed: &Feed, max_len: u32) -> Result<usize>;
}

pub struct HandlerRegistry {
    flat: Arc<dyn FeedHandler>,
    aggregated: Arc<dyn FeedHandler>,
    notification: Arc<dyn FeedHandler>,
}

impl HandlerRegistry {
    /// The standard registry: ActivityStore for flat feeds, one
    /// AggregationEngine shared by aggregated and notification feeds (they
    /// differ only in their default template).
    pub fn new(store: Arc<dyn FeedStore>, settings: &EngineSettings) -> Self {
        let aggregation: Arc<dyn FeedHandler> = Arc::new(AggregationEngine::new(
            store.clone(),
            settings.max_aggregated_length,
        ));
        Self {
            flat: Arc::new(ActivityStore::new(store)),
            aggregated: aggregation.clone(),
            notification: aggregation,
        }
    }

    pub fn with_handlers(
        flat: Arc<dyn FeedHandler>,
        aggregated: Arc<dyn FeedHandler>,
        notification: Arc<dyn FeedHandler>,
    ) -> Self {
        Self {
            flat,
            aggregated,
            notification,
        }
    }

    pub fn handler(&self, kind: FeedKind) -> &Arc<dyn FeedHandler> {
        match kind {
            FeedKind::Flat => &self.flat,
            FeedKind::Aggregated => &self.aggregated,
            FeedKind::Notification => &self.notification,
        }
    }
}

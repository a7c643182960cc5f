// Feed router — addresses feeds by id string.
//
// Resolves an identifier to its kind, lazily creates the feed record, picks
// the handler registered for the kind and applies the write. Every
// mutation gets a chance to trim the touched feed afterwards. This is the
// single entry point the service, fan-out tasks and follow jobs write
// through, so they all see the same lazily created feeds.

use std::sync::Arc;

use anyhow::Result;
use tracing::warn;

use crate::config::EngineSettings;
use crate::db::models::{
    ActivityQuery, ActivitySelector, ActivityUpdate, BulkWriteResult, Feed, FeedItems, NewActivity,
    NewFeed, WriteOutcome,
};
use crate::db::FeedStore;
use crate::feed::FeedResolver;
use crate::handler::{FeedHandler, HandlerRegistry};

use super::trim::Trimmer;

pub struct FeedRouter {
    store: Arc<dyn FeedStore>,
    resolver: FeedResolver,
    registry: HandlerRegistry,
    trimmer: Trimmer,
    default_max_length: Option<u32>,
}

impl FeedRouter {
    pub fn new(store: Arc<dyn FeedStore>, settings: &EngineSettings) -> Self {
        Self {
            registry: HandlerRegistry::new(store.clone(), settings),
            resolver: FeedResolver::new(&settings.aggregated_prefix, &settings.notification_prefix),
            trimmer: Trimmer::new(settings.trim_chance),
            default_max_length: settings.default_max_length,
            store,
        }
    }

    /// Replace the trimmer (tests force or disable trimming this way).
    pub fn with_trimmer(mut self, trimmer: Trimmer) -> Self {
        self.trimmer = trimmer;
        self
    }

    pub fn with_registry(mut self, registry: HandlerRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn store(&self) -> &Arc<dyn FeedStore> {
        &self.store
    }

    pub fn resolver(&self) -> &FeedResolver {
        &self.resolver
    }

    /// Get-or-create the feed named by `id`.
    pub async fn feed(&self, id: &str) -> Result<Feed> {
        let (feed_id, kind) = self.resolver.resolve(id)?;
        self.store
            .get_or_create_feed(&NewFeed {
                id: feed_id.to_string(),
                group: feed_id.group,
                target: feed_id.target,
                kind,
                max_length: self.default_max_length,
            })
            .await
    }

    pub fn handler(&self, feed: &Feed) -> &Arc<dyn FeedHandler> {
        self.registry.handler(feed.kind)
    }

    pub async fn add(&self, feed_id: &str, items: Vec<NewActivity>) -> Result<WriteOutcome> {
        let feed = self.feed(feed_id).await?;
        self.add_to(&feed, items).await
    }

    /// Add to an already resolved feed.
    pub async fn add_to(&self, feed: &Feed, items: Vec<NewActivity>) -> Result<WriteOutcome> {
        let handler = self.handler(feed);
        let outcome = handler.add_activities(feed, items).await?;
        self.trim_after_write(handler.as_ref(), feed).await;
        Ok(outcome)
    }

    pub async fn update(&self, feed_id: &str, updates: &[ActivityUpdate]) -> Result<BulkWriteResult> {
        let feed = self.feed(feed_id).await?;
        self.update_in(&feed, updates).await
    }

    pub async fn update_in(&self, feed: &Feed, updates: &[ActivityUpdate]) -> Result<BulkWriteResult> {
        let handler = self.handler(feed);
        let result = handler.update_activities(feed, updates).await?;
        self.trim_after_write(handler.as_ref(), feed).await;
        Ok(result)
    }

    pub async fn remove(&self, feed_id: &str, selectors: &[ActivitySelector]) -> Result<WriteOutcome> {
        let feed = self.feed(feed_id).await?;
        self.remove_from(&feed, selectors).await
    }

    pub async fn remove_from(&self, feed: &Feed, selectors: &[ActivitySelector]) -> Result<WriteOutcome> {
        let handler = self.handler(feed);
        let outcome = handler.remove_activities(feed, selectors).await?;
        self.trim_after_write(handler.as_ref(), feed).await;
        Ok(outcome)
    }

    pub async fn find(&self, feed_id: &str, query: &ActivityQuery) -> Result<(Feed, FeedItems)> {
        let feed = self.feed(feed_id).await?;
        let items = self.handler(&feed).find(&feed, query).await?;
        Ok((feed, items))
    }

    /// The write already succeeded, so a failed trim is only logged; the
    /// next mutation gets another chance.
    async fn trim_after_write(&self, handler: &dyn FeedHandler, feed: &Feed) {
        if let Err(e) = self.trimmer.maybe_trim(handler, feed).await {
            warn!(feed = %feed.id, error = %e, "trim after write failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::SqliteStore;
    use crate::feed::FeedKind;
    use chrono::{Duration, TimeZone, Utc};

    fn router(trimmer: Trimmer) -> FeedRouter {
        let store: Arc<dyn FeedStore> = Arc::new(SqliteStore::in_memory().unwrap());
        FeedRouter::new(store, &EngineSettings::default()).with_trimmer(trimmer)
    }

    #[tokio::test]
    async fn test_feed_is_created_lazily_with_kind() {
        let router = router(Trimmer::never());
        let feed = router.feed("notification:9").await.unwrap();
        assert_eq!(feed.kind, FeedKind::Notification);
        assert_eq!(feed.max_length, Some(1000));
        let again = router.feed("notification:9").await.unwrap();
        assert_eq!(again.created_at, feed.created_at);
        assert!(router.feed("user:").await.is_err());
    }

    #[tokio::test]
    async fn test_forced_trim_keeps_most_recent() {
        let router = router(Trimmer::always());
        router.feed("user:42").await.unwrap();
        router
            .store()
            .update_feed_settings(
                "user:42",
                &crate::db::models::FeedSettings {
                    max_length: Some(3),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        for n in 0..5 {
            let item = NewActivity::new("user:42", "post", &format!("post:{n}"))
                .with_time(start + Duration::minutes(n));
            router.add("user:42", vec![item]).await.unwrap();
        }

        let (_, items) = router.find("user:42", &ActivityQuery::recent(10)).await.unwrap();
        let objects: Vec<String> = items.into_activities().into_iter().map(|a| a.object).collect();
        assert_eq!(objects, vec!["post:4", "post:3", "post:2"]);
    }
}

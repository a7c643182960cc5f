// Aggregation engine — aggregated and notification feeds.
//
// Incoming activities are grouped by (feed, group key, verb), where the
// group key is the feed's aggregation template formatted against the
// activity. Each group is appended to the open (not full) bucket for its
// key through the store's bounded append, which spills into a fresh bucket
// once the open one is full. A key can therefore own several buckets over
// time, but never more than one with room left.
//
// Updates and removals address individual bucket items; any bucket left
// empty afterwards is swept. The sweep is best-effort, so a reader may
// briefly see an empty bucket.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use tracing::{debug, warn};

use crate::activity::prepare_batch;
use crate::db::models::{
    Activity, ActivityQuery, ActivitySelector, ActivityUpdate, BucketKey, BulkFailure,
    BulkWriteResult, Feed, FeedItems, NewActivity, WriteOutcome,
};
use crate::db::FeedStore;
use crate::feed::format_aggregation;
use crate::handler::FeedHandler;

/// Bucket keys appended in parallel per add call.
const GROUP_CONCURRENCY: usize = 4;

pub struct AggregationEngine {
    store: Arc<dyn FeedStore>,
    max_len: u32,
}

/// Items of one add call that share a bucket key, with their batch positions.
struct Group {
    key: BucketKey,
    positions: Vec<usize>,
    items: Vec<NewActivity>,
}

impl AggregationEngine {
    pub fn new(store: Arc<dyn FeedStore>, max_len: u32) -> Self {
        Self {
            store,
            max_len: max_len.max(1),
        }
    }

    pub fn max_len(&self) -> u32 {
        self.max_len
    }

    /// The bucket key an activity lands under in `feed`.
    pub fn bucket_key(feed: &Feed, activity: &NewActivity) -> BucketKey {
        BucketKey {
            feed: feed.id.clone(),
            group: format_aggregation(feed.aggregation_template(), activity),
            verb: activity.verb.clone(),
        }
    }

    /// Group items by bucket key, keeping first-seen key order.
    fn group(feed: &Feed, items: Vec<(usize, NewActivity)>) -> Vec<Group> {
        let mut groups: Vec<Group> = Vec::new();
        let mut slots: HashMap<BucketKey, usize> = HashMap::new();
        for (position, item) in items {
            let key = Self::bucket_key(feed, &item);
            let slot = *slots.entry(key.clone()).or_insert_with(|| {
                groups.push(Group {
                    key,
                    positions: Vec::new(),
                    items: Vec::new(),
                });
                groups.len() - 1
            });
            groups[slot].positions.push(position);
            groups[slot].items.push(item);
        }
        groups
    }

    async fn sweep(&self) {
        match self.store.sweep_empty_buckets().await {
            Ok(0) => {}
            Ok(n) => debug!(buckets = n, "swept empty aggregation buckets"),
            Err(e) => warn!(error = %e, "failed to sweep empty aggregation buckets"),
        }
    }
}

#[async_trait]
impl FeedHandler for AggregationEngine {
    async fn add_activities(&self, feed: &Feed, items: Vec<NewActivity>) -> Result<WriteOutcome> {
        let (valid, rejected) = prepare_batch(feed, items);
        let groups = Self::group(feed, valid);

        let appended: Vec<(Vec<usize>, Result<WriteOutcome>)> = stream::iter(groups)
            .map(|group| async move {
                let result = self
                    .store
                    .bounded_append(&group.key, &group.items, self.max_len)
                    .await;
                (group.positions, result)
            })
            .buffer_unordered(GROUP_CONCURRENCY)
            .collect()
            .await;

        let mut written: Vec<(usize, Activity)> = Vec::new();
        let mut result = BulkWriteResult::default();
        for (positions, appended) in appended {
            match appended {
                Ok(outcome) => {
                    written.extend(positions.into_iter().zip(outcome.activities));
                    result.merge(outcome.result);
                }
                Err(e) => {
                    let message = format!("{e:#}");
                    warn!(feed = %feed.id, error = %message, "bucket append failed");
                    result
                        .failures
                        .extend(positions.into_iter().map(|index| BulkFailure {
                            index,
                            message: message.clone(),
                        }));
                }
            }
        }
        result.failures.extend(rejected);
        written.sort_by_key(|(position, _)| *position);

        Ok(WriteOutcome {
            activities: written.into_iter().map(|(_, a)| a).collect(),
            result,
        })
    }

    async fn update_activities(
        &self,
        feed: &Feed,
        updates: &[ActivityUpdate],
    ) -> Result<BulkWriteResult> {
        let result = self.store.update_activities(&feed.id, updates).await?;
        self.sweep().await;
        Ok(result)
    }

    async fn remove_activities(
        &self,
        feed: &Feed,
        selectors: &[ActivitySelector],
    ) -> Result<WriteOutcome> {
        let outcome = self.store.remove_activities(&feed.id, selectors).await?;
        self.sweep().await;
        Ok(outcome)
    }

    /// Buckets, most recently updated first, each ranked by the feed's rank.
    /// With a filter, buckets with no matching activity are left out.
    async fn find(&self, feed: &Feed, query: &ActivityQuery) -> Result<FeedItems> {
        let rank = feed.rank_spec();
        let mut buckets = self.store.find_buckets(&feed.id, query).await?;
        for bucket in &mut buckets {
            bucket.rank_activities(&rank);
        }
        if query.has_filter() {
            buckets.retain(|b| !b.activities.is_empty());
        }
        Ok(FeedItems::Aggregated(buckets))
    }

    async fn trim(&self, feed: &Feed, max_len: u32) -> Result<usize> {
        self.store.trim_buckets(&feed.id, max_len).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::NewFeed;
    use crate::db::SqliteStore;
    use crate::feed::FeedKind;
    use chrono::{TimeZone, Utc};

    async fn setup(id: &str, kind: FeedKind, max_len: u32) -> (AggregationEngine, Feed) {
        let store: Arc<dyn FeedStore> = Arc::new(SqliteStore::in_memory().unwrap());
        let (group, target) = id.split_once(':').unwrap();
        let feed = store
            .get_or_create_feed(&NewFeed {
                id: id.to_string(),
                group: group.to_string(),
                target: target.to_string(),
                kind,
                max_length: None,
            })
            .await
            .unwrap();
        (AggregationEngine::new(store, max_len), feed)
    }

    fn like(actor: &str, object: &str) -> NewActivity {
        NewActivity::new(actor, "like", object)
            .with_time(Utc.with_ymd_and_hms(2024, 6, 1, 10, 0, 0).unwrap())
    }

    async fn buckets(engine: &AggregationEngine, feed: &Feed) -> Vec<crate::db::models::AggregationBucket> {
        match engine.find(feed, &ActivityQuery::recent(50)).await.unwrap() {
            FeedItems::Aggregated(buckets) => buckets,
            FeedItems::Flat(_) => panic!("aggregated feed returned flat items"),
        }
    }

    #[tokio::test]
    async fn test_groups_by_verb_and_day() {
        let (engine, feed) = setup("aggregated:1", FeedKind::Aggregated, 15).await;
        let items = vec![
            like("user:a", "post:1"),
            like("user:b", "post:2"),
            NewActivity::new("user:c", "comment", "post:1")
                .with_time(Utc.with_ymd_and_hms(2024, 6, 1, 11, 0, 0).unwrap()),
        ];
        let outcome = engine.add_activities(&feed, items).await.unwrap();
        assert_eq!(outcome.activities.len(), 3);
        // Written records come back in submission order
        assert_eq!(outcome.activities[2].verb, "comment");

        let buckets = buckets(&engine, &feed).await;
        assert_eq!(buckets.len(), 2);
        let likes = buckets.iter().find(|b| b.verb == "like").unwrap();
        assert_eq!(likes.group, "like-2024-06-01");
        assert_eq!(likes.actors.len(), 2);
    }

    #[tokio::test]
    async fn test_notification_template_splits_by_object() {
        let (engine, feed) = setup("notification:1", FeedKind::Notification, 15).await;
        engine
            .add_activities(&feed, vec![like("user:a", "post:1"), like("user:b", "post:2")])
            .await
            .unwrap();
        let mut groups: Vec<String> = buckets(&engine, &feed).await.into_iter().map(|b| b.group).collect();
        groups.sort();
        assert_eq!(groups, vec!["like-post:1-2024-06-01", "like-post:2-2024-06-01"]);
    }

    #[tokio::test]
    async fn test_full_bucket_opens_a_new_one() {
        let (engine, feed) = setup("aggregated:1", FeedKind::Aggregated, 2).await;
        for n in 0..5 {
            engine
                .add_activities(&feed, vec![like(&format!("user:{n}"), "post:1")])
                .await
                .unwrap();
        }
        let buckets = buckets(&engine, &feed).await;
        assert_eq!(buckets.len(), 3);
        assert!(buckets.iter().all(|b| b.activities.len() <= 2));
        assert!(buckets.iter().all(|b| b.group == "like-2024-06-01"));
    }

    #[tokio::test]
    async fn test_concurrent_adds_on_one_key_stay_bounded() {
        let (engine, feed) = setup("aggregated:1", FeedKind::Aggregated, 4).await;
        let calls = (0..6).map(|call| {
            let items: Vec<NewActivity> = (0..3)
                .map(|n| like(&format!("user:{call}-{n}"), "post:1"))
                .collect();
            engine.add_activities(&feed, items)
        });
        for outcome in futures::future::join_all(calls).await {
            assert_eq!(outcome.unwrap().activities.len(), 3);
        }

        let buckets = buckets(&engine, &feed).await;
        assert!(buckets.iter().all(|b| b.activities.len() <= 4));
        let total: usize = buckets.iter().map(|b| b.activities.len()).sum();
        assert_eq!(total, 18);
    }

    #[tokio::test]
    async fn test_removing_last_item_drops_bucket() {
        let (engine, feed) = setup("aggregated:1", FeedKind::Aggregated, 15).await;
        let outcome = engine
            .add_activities(&feed, vec![like("user:a", "post:1")])
            .await
            .unwrap();
        let id = outcome.activities[0].id;
        engine
            .remove_activities(&feed, &[ActivitySelector::Id(id)])
            .await
            .unwrap();
        assert!(buckets(&engine, &feed).await.is_empty());
    }

    #[tokio::test]
    async fn test_filter_restricts_bucket_contents() {
        let (engine, feed) = setup("aggregated:1", FeedKind::Aggregated, 15).await;
        engine
            .add_activities(&feed, vec![like("user:a", "post:1"), like("user:b", "post:2")])
            .await
            .unwrap();
        let query = ActivityQuery {
            actor: Some("user:b".into()),
            ..ActivityQuery::recent(10)
        };
        let FeedItems::Aggregated(found) = engine.find(&feed, &query).await.unwrap() else {
            panic!("aggregated feed returned flat items");
        };
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].activities.len(), 1);
        assert_eq!(found[0].actors, vec!["user:b".to_string()]);
    }
}

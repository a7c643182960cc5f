// Storage trait — backend-agnostic async interface for all persistence.
//
// Implementors: SqliteStore (wraps rusqlite), PgStore (wraps sqlx).
// All methods are async so both sync (rusqlite via Mutex) and native async
// (sqlx) backends fit behind a single interface.
//
// Flat-feed activities and bucket items live in the same activity table;
// an item belongs to a bucket when its bucket id is set. Every exclusion the
// engine relies on (bounded bucket size, idempotent upsert by foreignId or
// origin) is enforced here with conditional writes, never with in-process
// locks in the callers.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};

use super::models::{
    Activity, ActivityQuery, ActivitySelector, ActivityUpdate, AggregationBucket, BucketKey,
    BulkWriteResult, Feed, FeedSettings, Followship, JobRecord, Mark, NewActivity, NewFeed,
    StoreStats, WriteOutcome,
};

#[async_trait]
pub trait FeedStore: Send + Sync {
    // --- Lifecycle ---

    /// Count the number of user-created tables in the database.
    async fn table_count(&self) -> Result<i64>;

    /// Row counts for the status report.
    async fn stats(&self) -> Result<StoreStats>;

    // --- Feeds ---

    /// Return the feed, creating it with the given defaults on first access.
    async fn get_or_create_feed(&self, feed: &NewFeed) -> Result<Feed>;

    async fn get_feed(&self, id: &str) -> Result<Option<Feed>>;

    /// Apply the set fields of `settings`. Returns None if the feed is absent.
    async fn update_feed_settings(&self, id: &str, settings: &FeedSettings)
        -> Result<Option<Feed>>;

    // --- Activities ---

    /// Unordered bulk insert into a flat feed. An item whose `origin` or
    /// `(foreignId, time)` already exists in its feed updates that record
    /// instead of inserting a duplicate.
    async fn insert_activities(&self, items: &[NewActivity]) -> Result<WriteOutcome>;

    /// Unordered bulk update of activities in `feed` (flat records and
    /// bucket items alike). Touches the owning bucket's `updated_at`.
    async fn update_activities(&self, feed: &str, updates: &[ActivityUpdate])
        -> Result<BulkWriteResult>;

    /// Unordered bulk removal from `feed`. Returns the removed records.
    /// Bucket counters are decremented; empty buckets are left for
    /// `sweep_empty_buckets`.
    async fn remove_activities(&self, feed: &str, selectors: &[ActivitySelector])
        -> Result<WriteOutcome>;

    /// Flat-feed read, most recent first by `(time, id)`.
    async fn find_activities(&self, feed: &str, query: &ActivityQuery)
        -> Result<Vec<Activity>>;

    /// Keep the `max_len` most recent flat records of `feed`; delete the rest.
    async fn trim_activities(&self, feed: &str, max_len: u32) -> Result<usize>;

    // --- cc bookkeeping ---

    /// Remember that `activity_id` was carbon-copied into `feeds`.
    async fn record_cc(&self, activity_id: i64, feeds: &[String]) -> Result<()>;

    /// Remove and return the cc feeds recorded for `activity_id`.
    async fn take_cc_links(&self, activity_id: i64) -> Result<Vec<String>>;

    // --- Aggregation buckets ---

    /// Append `items` to the not-full bucket for `key`, opening new buckets
    /// as needed so no bucket ever holds more than `max_len` items. Items
    /// matching an existing record of the feed by origin or
    /// `(foreignId, time)` are updated in place instead.
    ///
    /// The capacity check is a single conditional update on the bucket's
    /// counter, so concurrent appends can never overfill a bucket.
    async fn bounded_append(&self, key: &BucketKey, items: &[NewActivity], max_len: u32)
        -> Result<WriteOutcome>;

    /// Delete buckets whose item count dropped to zero.
    async fn sweep_empty_buckets(&self) -> Result<usize>;

    /// Buckets of `feed`, most recently updated first. When the query has a
    /// filter, only buckets containing a matching item are returned and
    /// their items are restricted to the matches.
    async fn find_buckets(&self, feed: &str, query: &ActivityQuery)
        -> Result<Vec<AggregationBucket>>;

    /// Keep the `max_len` most recently updated buckets of `feed`.
    async fn trim_buckets(&self, feed: &str, max_len: u32) -> Result<usize>;

    /// Stamp seen/read on the listed buckets (all buckets of the feed when
    /// `bucket_ids` is empty) and on the feed itself.
    async fn mark_buckets(&self, feed: &str, bucket_ids: &[i64], mark: Mark, at: DateTime<Utc>)
        -> Result<usize>;

    // --- Followships ---

    async fn get_followship(&self, follower: &str, followee: &str) -> Result<Option<Followship>>;

    /// Insert the edge. Returns false when it already existed.
    async fn insert_followship(&self, followship: &Followship) -> Result<bool>;

    /// Delete the edge. Returns false when it did not exist.
    async fn delete_followship(&self, follower: &str, followee: &str) -> Result<bool>;

    /// Edges pointing at `feed`, ordered by priority descending.
    async fn followers_of(&self, feed: &str, limit: usize, offset: usize)
        -> Result<Vec<Followship>>;

    /// Edges leaving `feed`, ordered by priority descending.
    async fn followees_of(&self, feed: &str, limit: usize, offset: usize)
        -> Result<Vec<Followship>>;

    // --- Jobs ---

    async fn enqueue_job(&self, name: &str, payload: &str, priority: i32, now: DateTime<Utc>)
        -> Result<i64>;

    /// Claim the highest-priority runnable job: pending, or running with an
    /// expired lock. Claiming locks it until `now + lock_lifetime` and
    /// increments its attempt counter.
    async fn claim_job(&self, now: DateTime<Utc>, lock_lifetime: Duration)
        -> Result<Option<JobRecord>>;

    async fn complete_job(&self, id: i64) -> Result<()>;

    /// Record a failure. With `retry` the job becomes pending again,
    /// otherwise it is marked failed for good.
    async fn fail_job(&self, id: i64, error: &str, retry: bool) -> Result<()>;

    async fn get_job(&self, id: i64) -> Result<Option<JobRecord>>;
}

// SqliteStore — rusqlite backend implementing the FeedStore trait.
//
// The Connection is wrapped in tokio::sync::Mutex because Connection is !Send.
// Trait methods lock the mutex, do synchronous rusqlite work, and return.
// The lock is never held across .await points.
//
// Holding the single connection also serializes writers, so the conditional
// bucket update in queries::bounded_append never races within one process;
// across processes SQLite's write lock gives the same guarantee.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use rusqlite::Connection;
use tokio::sync::Mutex;

use super::models::{
    Activity, ActivityQuery, ActivitySelector, ActivityUpdate, AggregationBucket, BucketKey,
    BulkWriteResult, Feed, FeedSettings, Followship, JobRecord, Mark, NewActivity, NewFeed,
    StoreStats, WriteOutcome,
};
use super::queries;
use super::traits::FeedStore;

pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Wrap an already-opened rusqlite Connection.
    pub fn new(conn: Connection) -> Self {
        Self {
            conn: Mutex::new(conn),
        }
    }

    /// A fresh in-memory store with the schema applied. Used by tests.
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        super::schema::create_tables(&conn)?;
        Ok(Self::new(conn))
    }
}

#[async_trait]
impl FeedStore for SqliteStore {
    async fn table_count(&self) -> Result<i64> {
        let conn = self.conn.lock().await;
        super::schema::table_count(&conn)
    }

    async fn stats(&self) -> Result<StoreStats> {
        let conn = self.conn.lock().await;
        queries::stats(&conn)
    }

    async fn get_or_create_feed(&self, feed: &NewFeed) -> Result<Feed> {
        let conn = self.conn.lock().await;
        queries::get_or_create_feed(&conn, feed)
    }

    async fn get_feed(&self, id: &str) -> Result<Option<Feed>> {
        let conn = self.conn.lock().await;
        queries::get_feed(&conn, id)
    }

    async fn update_feed_settings(
        &self,
        id: &str,
        settings: &FeedSettings,
    ) -> Result<Option<Feed>> {
        let conn = self.conn.lock().await;
        queries::update_feed_settings(&conn, id, settings)
    }

    async fn insert_activities(&self, items: &[NewActivity]) -> Result<WriteOutcome> {
        let conn = self.conn.lock().await;
        queries::insert_activities(&conn, items)
    }

    async fn update_activities(
        &self,
        feed: &str,
        updates: &[ActivityUpdate],
    ) -> Result<BulkWriteResult> {
        let conn = self.conn.lock().await;
        queries::update_activities(&conn, feed, updates)
    }

    async fn remove_activities(
        &self,
        feed: &str,
        selectors: &[ActivitySelector],
    ) -> Result<WriteOutcome> {
        let conn = self.conn.lock().await;
        queries::remove_activities(&conn, feed, selectors)
    }

    async fn find_activities(&self, feed: &str, query: &ActivityQuery) -> Result<Vec<Activity>> {
        let conn = self.conn.lock().await;
        queries::find_activities(&conn, feed, query)
    }

    async fn trim_activities(&self, feed: &str, max_len: u32) -> Result<usize> {
        let conn = self.conn.lock().await;
        queries::trim_activities(&conn, feed, max_len)
    }

    async fn record_cc(&self, activity_id: i64, feeds: &[String]) -> Result<()> {
        let conn = self.conn.lock().await;
        queries::record_cc(&conn, activity_id, feeds)
    }

    async fn take_cc_links(&self, activity_id: i64) -> Result<Vec<String>> {
        let conn = self.conn.lock().await;
        queries::take_cc_links(&conn, activity_id)
    }

    async fn bounded_append(
        &self,
        key: &BucketKey,
        items: &[NewActivity],
        max_len: u32,
    ) -> Result<WriteOutcome> {
        let conn = self.conn.lock().await;
        queries::bounded_append(&conn, key, items, max_len)
    }

    async fn sweep_empty_buckets(&self) -> Result<usize> {
        let conn = self.conn.lock().await;
        queries::sweep_empty_buckets(&conn)
    }

    async fn find_buckets(
        &self,
        feed: &str,
        query: &ActivityQuery,
    ) -> Result<Vec<AggregationBucket>> {
        let conn = self.conn.lock().await;
        queries::find_buckets(&conn, feed, query)
    }

    async fn trim_buckets(&self, feed: &str, max_len: u32) -> Result<usize> {
        let conn = self.conn.lock().await;
        queries::trim_buckets(&conn, feed, max_len)
    }

    async fn mark_buckets(
        &self,
        feed: &str,
        bucket_ids: &[i64],
        mark: Mark,
        at: DateTime<Utc>,
    ) -> Result<usize> {
        let conn = self.conn.lock().await;
        queries::mark_buckets(&conn, feed, bucket_ids, mark, at)
    }

    async fn get_followship(&self, follower: &str, followee: &str) -> Result<Option<Followship>> {
        let conn = self.conn.lock().await;
        queries::get_followship(&conn, follower, followee)
    }

    async fn insert_followship(&self, followship: &Followship) -> Result<bool> {
        let conn = self.conn.lock().await;
        queries::insert_followship(&conn, followship)
    }

    async fn delete_followship(&self, follower: &str, followee: &str) -> Result<bool> {
        let conn = self.conn.lock().await;
        queries::delete_followship(&conn, follower, followee)
    }

    async fn followers_of(
        &self,
        feed: &str,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Followship>> {
        let conn = self.conn.lock().await;
        queries::followers_of(&conn, feed, limit, offset)
    }

    async fn followees_of(
        &self,
        feed: &str,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Followship>> {
        let conn = self.conn.lock().await;
        queries::followees_of(&conn, feed, limit, offset)
    }

    async fn enqueue_job(
        &self,
        name: &str,
        payload: &str,
        priority: i32,
        now: DateTime<Utc>,
    ) -> Result<i64> {
        let conn = self.conn.lock().await;
        queries::enqueue_job(&conn, name, payload, priority, now)
    }

    async fn claim_job(
        &self,
        now: DateTime<Utc>,
        lock_lifetime: Duration,
    ) -> Result<Option<JobRecord>> {
        let conn = self.conn.lock().await;
        queries::claim_job(&conn, now, lock_lifetime)
    }

    async fn complete_job(&self, id: i64) -> Result<()> {
        let conn = self.conn.lock().await;
        queries::complete_job(&conn, id)
    }

    async fn fail_job(&self, id: i64, error: &str, retry: bool) -> Result<()> {
        let conn = self.conn.lock().await;
        queries::fail_job(&conn, id, error, retry)
    }

    async fn get_job(&self, id: i64) -> Result<Option<JobRecord>> {
        let conn = self.conn.lock().await;
        queries::get_job(&conn, id)
    }
}

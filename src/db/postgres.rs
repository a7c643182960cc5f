// PgStore — PostgreSQL backend implementing the FeedStore trait.
//
// Uses sqlx PgPool for native async queries. All queries use runtime
// parameter binding (not compile-time macros) to avoid requiring
// DATABASE_URL at compile time.
//
// Key differences from SQLite:
// - TIMESTAMPTZ instead of TEXT for timestamps
// - JSONB for free-form activity fields and job payloads
// - $1/$2 parameter syntax (handled by sqlx)
// - GENERATED ALWAYS AS IDENTITY for auto-increment
// - each bulk item runs in its own transaction instead of a savepoint
// - job claiming uses FOR UPDATE SKIP LOCKED so several workers can share
//   one queue

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde_json::{Map, Value};
use sqlx_core::pool::Pool;
use sqlx_core::row::Row;
use sqlx_postgres::{PgConnection, PgRow, Postgres};

use super::models::{
    Activity, ActivityQuery, ActivitySelector, ActivityUpdate, AggregationBucket, BatchKeys,
    BucketKey, BulkFailure, BulkWriteResult, Feed, FeedSettings, Followship, JobRecord, JobStatus,
    Mark, NewActivity, NewFeed, StoreStats, WriteOutcome,
};
use super::traits::FeedStore;
use crate::feed::FeedKind;

/// Type alias for the PostgreSQL connection pool.
pub type PgPool = Pool<Postgres>;

const ACTIVITY_COLUMNS: &str = "id, feed, actor, verb, object, target, foreign_id, time, \
     source, origin, popularity, extra, created_at, updated_at";

const FEED_COLUMNS: &str = "id, grp, target, kind, realtime, max_length, aggregation, rank, \
     seen_at, read_at, created_at, updated_at";

const JOB_COLUMNS: &str = "id, name, payload::text AS payload, priority, status, attempts, \
     locked_until, last_error, created_at";

pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    /// Connect to PostgreSQL and run migrations.
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = PgPool::connect(database_url)
            .await
            .with_context(|| format!("Failed to connect to PostgreSQL at {database_url}"))?;

        let store = Self { pool };
        store.run_migrations().await?;
        Ok(store)
    }

    /// Run all pending migrations.
    ///
    /// Holds a session-level advisory lock on a dedicated connection for the
    /// whole sequence so concurrently starting workers don't race to apply
    /// the same migration. The unlock always runs, even if a migration fails.
    async fn run_migrations(&self) -> Result<()> {
        // ASCII "FEEDMILL" as a big-endian i64.
        const MIGRATION_LOCK_KEY: i64 = 0x464545444D494C4C_u64 as i64;

        let mut lock_conn = self
            .pool
            .acquire()
            .await
            .context("Failed to acquire connection for migration advisory lock")?;

        sqlx_core::query::query("SELECT pg_advisory_lock($1)")
            .bind(MIGRATION_LOCK_KEY)
            .execute(&mut *lock_conn)
            .await
            .context("Failed to acquire migration advisory lock")?;

        let migration_result: Result<()> = async {
            sqlx_core::query::query(
                "CREATE TABLE IF NOT EXISTS schema_version (
                    version INTEGER PRIMARY KEY,
                    applied_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
                )",
            )
            .execute(&self.pool)
            .await?;

            let migrations = [(
                1,
                include_str!("../../migrations/postgres/0001_initial.sql"),
            )];

            for (version, sql) in migrations {
                let applied: bool = sqlx_core::query::query(
                    "SELECT COUNT(*) > 0 FROM schema_version WHERE version = $1",
                )
                .bind(version)
                .fetch_one(&self.pool)
                .await
                .map(|row| row.get::<bool, _>(0))
                .unwrap_or(false);

                if !applied {
                    // The schema change and its version row commit together
                    let mut tx = self.pool.begin().await?;
                    sqlx_core::raw_sql::raw_sql(sql).execute(&mut *tx).await?;
                    sqlx_core::query::query("INSERT INTO schema_version (version) VALUES ($1)")
                        .bind(version)
                        .execute(&mut *tx)
                        .await?;
                    tx.commit().await?;
                }
            }

            Ok(())
        }
        .await;

        let unlock_result = sqlx_core::query::query("SELECT pg_advisory_unlock($1)")
            .bind(MIGRATION_LOCK_KEY)
            .execute(&mut *lock_conn)
            .await
            .context("Failed to release migration advisory lock");

        // Migration error takes priority over unlock error.
        migration_result?;
        unlock_result?;

        Ok(())
    }
}

// --- Row helpers ---

fn activity_from_row(row: &PgRow) -> Result<Activity> {
    let extra = match row.try_get::<Value, _>("extra")? {
        Value::Object(map) => map,
        _ => Map::new(),
    };
    Ok(Activity {
        id: row.try_get("id")?,
        feed: row.try_get("feed")?,
        actor: row.try_get("actor")?,
        verb: row.try_get("verb")?,
        object: row.try_get("object")?,
        target: row.try_get("target")?,
        foreign_id: row.try_get("foreign_id")?,
        time: row.try_get("time")?,
        source: row.try_get("source")?,
        origin: row.try_get("origin")?,
        popularity: row.try_get("popularity")?,
        extra,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn feed_from_row(row: &PgRow) -> Result<Feed> {
    let kind_text: String = row.try_get("kind")?;
    let Some(kind) = FeedKind::parse(&kind_text) else {
        bail!("unknown feed kind '{kind_text}'");
    };
    Ok(Feed {
        id: row.try_get("id")?,
        group: row.try_get("grp")?,
        target: row.try_get("target")?,
        kind,
        realtime: row.try_get("realtime")?,
        max_length: row
            .try_get::<Option<i32>, _>("max_length")?
            .map(|n| n.max(0) as u32),
        aggregation: row.try_get("aggregation")?,
        rank: row.try_get("rank")?,
        seen_at: row.try_get("seen_at")?,
        read_at: row.try_get("read_at")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn job_from_row(row: &PgRow) -> Result<JobRecord> {
    let status_text: String = row.try_get("status")?;
    let Some(status) = JobStatus::parse(&status_text) else {
        bail!("unknown job status '{status_text}'");
    };
    Ok(JobRecord {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        payload: row.try_get("payload")?,
        priority: row.try_get("priority")?,
        status,
        attempts: row.try_get::<i32, _>("attempts")?.max(0) as u32,
        locked_until: row.try_get("locked_until")?,
        last_error: row.try_get("last_error")?,
        created_at: row.try_get("created_at")?,
    })
}

fn followship_from_row(row: &PgRow) -> Result<Followship> {
    Ok(Followship {
        follower: row.try_get("follower")?,
        followee: row.try_get("followee")?,
        priority: row.try_get("priority")?,
        created_at: row.try_get("created_at")?,
    })
}

fn failure(index: usize, e: anyhow::Error) -> BulkFailure {
    BulkFailure {
        index,
        message: format!("{e:#}"),
    }
}

fn clamp_i32(n: u32) -> i32 {
    n.min(i32::MAX as u32) as i32
}

// --- Per-item statements, run inside the caller's transaction ---

async fn get_activity(conn: &mut PgConnection, id: i64) -> Result<Option<Activity>> {
    let sql = format!("SELECT {ACTIVITY_COLUMNS} FROM activities WHERE id = $1");
    let row = sqlx_core::query::query(&sql)
        .bind(id)
        .fetch_optional(&mut *conn)
        .await?;
    row.as_ref().map(activity_from_row).transpose()
}

async fn find_existing(conn: &mut PgConnection, item: &NewActivity) -> Result<Option<i64>> {
    if let Some(origin) = item.origin {
        let row = sqlx_core::query::query(
            "SELECT id FROM activities WHERE feed = $1 AND origin = $2",
        )
        .bind(&item.feed)
        .bind(origin)
        .fetch_optional(&mut *conn)
        .await?;
        if let Some(row) = row {
            return Ok(Some(row.try_get(0)?));
        }
    }
    if let (Some(foreign_id), Some(time)) = (&item.foreign_id, item.time) {
        let row = sqlx_core::query::query(
            "SELECT id FROM activities WHERE feed = $1 AND foreign_id = $2 AND time = $3",
        )
        .bind(&item.feed)
        .bind(foreign_id)
        .bind(time)
        .fetch_optional(&mut *conn)
        .await?;
        return row
            .map(|r| r.try_get::<i64, _>(0))
            .transpose()
            .map_err(Into::into);
    }
    Ok(None)
}

async fn touch_owning_bucket(conn: &mut PgConnection, activity_id: i64) -> Result<()> {
    sqlx_core::query::query(
        "UPDATE buckets SET updated_at = NOW()
         WHERE id = (SELECT bucket_id FROM activities WHERE id = $1)",
    )
    .bind(activity_id)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

async fn refresh_activity(
    conn: &mut PgConnection,
    id: i64,
    item: &NewActivity,
) -> Result<Activity> {
    sqlx_core::query::query(
        "UPDATE activities SET
            actor = $2, verb = $3, object = $4, target = $5,
            source = COALESCE(source, $6),
            popularity = COALESCE($7, popularity),
            extra = $8,
            updated_at = NOW()
         WHERE id = $1",
    )
    .bind(id)
    .bind(&item.actor)
    .bind(&item.verb)
    .bind(&item.object)
    .bind(&item.target)
    .bind(&item.source)
    .bind(item.popularity)
    .bind(Value::Object(item.extra.clone()))
    .execute(&mut *conn)
    .await?;
    touch_owning_bucket(conn, id).await?;
    match get_activity(conn, id).await? {
        Some(activity) => Ok(activity),
        None => bail!("activity {id} vanished after update"),
    }
}

async fn insert_activity(
    conn: &mut PgConnection,
    item: &NewActivity,
    bucket_id: Option<i64>,
) -> Result<Activity> {
    let sql = format!(
        "INSERT INTO activities
            (feed, bucket_id, actor, verb, object, target, foreign_id, time,
             source, origin, popularity, extra)
         VALUES ($1, $2, $3, $4, $5, $6, $7, COALESCE($8, NOW()), $9, $10, $11, $12)
         RETURNING {ACTIVITY_COLUMNS}"
    );
    let row = sqlx_core::query::query(&sql)
        .bind(&item.feed)
        .bind(bucket_id)
        .bind(&item.actor)
        .bind(&item.verb)
        .bind(&item.object)
        .bind(&item.target)
        .bind(&item.foreign_id)
        .bind(item.time)
        .bind(&item.source)
        .bind(item.origin)
        .bind(item.popularity.unwrap_or(1))
        .bind(Value::Object(item.extra.clone()))
        .fetch_one(&mut *conn)
        .await?;
    activity_from_row(&row)
}

async fn select_ids(
    conn: &mut PgConnection,
    feed: &str,
    selector: &ActivitySelector,
) -> Result<Vec<i64>> {
    let rows = match selector {
        ActivitySelector::Id(id) => {
            sqlx_core::query::query("SELECT id FROM activities WHERE feed = $1 AND id = $2")
                .bind(feed)
                .bind(*id)
                .fetch_all(&mut *conn)
                .await?
        }
        ActivitySelector::Foreign { foreign_id, time } => sqlx_core::query::query(
            "SELECT id FROM activities WHERE feed = $1 AND foreign_id = $2 AND time = $3",
        )
        .bind(feed)
        .bind(foreign_id)
        .bind(*time)
        .fetch_all(&mut *conn)
        .await?,
        ActivitySelector::Origin(origin) => {
            sqlx_core::query::query("SELECT id FROM activities WHERE feed = $1 AND origin = $2")
                .bind(feed)
                .bind(*origin)
                .fetch_all(&mut *conn)
                .await?
        }
        ActivitySelector::Source(source) => {
            sqlx_core::query::query("SELECT id FROM activities WHERE feed = $1 AND source = $2")
                .bind(feed)
                .bind(source)
                .fetch_all(&mut *conn)
                .await?
        }
    };
    rows.iter()
        .map(|r| r.try_get::<i64, _>(0).map_err(Into::into))
        .collect()
}

#[async_trait]
impl FeedStore for PgStore {
    async fn table_count(&self) -> Result<i64> {
        let row = sqlx_core::query::query(
            "SELECT COUNT(*)::bigint FROM information_schema.tables
             WHERE table_schema = 'public' AND table_type = 'BASE TABLE'",
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(row.get::<i64, _>(0))
    }

    async fn stats(&self) -> Result<StoreStats> {
        let row = sqlx_core::query::query(
            "SELECT
                (SELECT COUNT(*) FROM feeds),
                (SELECT COUNT(*) FROM activities WHERE bucket_id IS NULL),
                (SELECT COUNT(*) FROM buckets),
                (SELECT COUNT(*) FROM activities WHERE bucket_id IS NOT NULL),
                (SELECT COUNT(*) FROM followships),
                (SELECT COUNT(*) FROM jobs WHERE status = 'pending'),
                (SELECT COUNT(*) FROM jobs WHERE status = 'running'),
                (SELECT COUNT(*) FROM jobs WHERE status = 'failed')",
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(StoreStats {
            feeds: row.get(0),
            activities: row.get(1),
            buckets: row.get(2),
            bucket_activities: row.get(3),
            followships: row.get(4),
            jobs_pending: row.get(5),
            jobs_running: row.get(6),
            jobs_failed: row.get(7),
        })
    }

    async fn get_or_create_feed(&self, feed: &NewFeed) -> Result<Feed> {
        sqlx_core::query::query(
            "INSERT INTO feeds (id, grp, target, kind, max_length)
             VALUES ($1, $2, $3, $4, $5)
             ON CONFLICT (id) DO NOTHING",
        )
        .bind(&feed.id)
        .bind(&feed.group)
        .bind(&feed.target)
        .bind(feed.kind.as_str())
        .bind(feed.max_length.map(clamp_i32))
        .execute(&self.pool)
        .await?;
        match self.get_feed(&feed.id).await? {
            Some(stored) => Ok(stored),
            None => bail!("feed {} vanished after insert", feed.id),
        }
    }

    async fn get_feed(&self, id: &str) -> Result<Option<Feed>> {
        let sql = format!("SELECT {FEED_COLUMNS} FROM feeds WHERE id = $1");
        let row = sqlx_core::query::query(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(feed_from_row).transpose()
    }

    async fn update_feed_settings(
        &self,
        id: &str,
        settings: &FeedSettings,
    ) -> Result<Option<Feed>> {
        let result = sqlx_core::query::query(
            "UPDATE feeds SET
                realtime = COALESCE($2, realtime),
                max_length = COALESCE($3, max_length),
                aggregation = COALESCE($4, aggregation),
                rank = COALESCE($5, rank),
                updated_at = NOW()
             WHERE id = $1",
        )
        .bind(id)
        .bind(settings.realtime)
        .bind(settings.max_length.map(clamp_i32))
        .bind(&settings.aggregation)
        .bind(&settings.rank)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Ok(None);
        }
        self.get_feed(id).await
    }

    async fn insert_activities(&self, items: &[NewActivity]) -> Result<WriteOutcome> {
        let mut outcome = WriteOutcome::default();
        for (index, item) in items.iter().enumerate() {
            let written: Result<(Activity, bool)> = async {
                let mut tx = self.pool.begin().await?;
                let written = match find_existing(&mut *tx, item).await? {
                    Some(id) => (refresh_activity(&mut *tx, id, item).await?, true),
                    None => (insert_activity(&mut *tx, item, None).await?, false),
                };
                tx.commit().await?;
                Ok(written)
            }
            .await;
            match written {
                Ok((activity, existed)) => {
                    if existed {
                        outcome.result.upserted += 1;
                    } else {
                        outcome.result.inserted += 1;
                    }
                    outcome.activities.push(activity);
                }
                Err(e) => outcome.result.failures.push(failure(index, e)),
            }
        }
        Ok(outcome)
    }

    async fn update_activities(
        &self,
        feed: &str,
        updates: &[ActivityUpdate],
    ) -> Result<BulkWriteResult> {
        let mut result = BulkWriteResult::default();
        for (index, update) in updates.iter().enumerate() {
            let applied: Result<(usize, usize)> = async {
                let mut tx = self.pool.begin().await?;
                let ids = select_ids(&mut *tx, feed, &update.selector).await?;
                let mut modified = 0;
                for id in &ids {
                    let Some(mut activity) = get_activity(&mut *tx, *id).await? else {
                        continue;
                    };
                    update.patch.apply(&mut activity);
                    sqlx_core::query::query(
                        "UPDATE activities SET
                            actor = $2, verb = $3, object = $4, target = $5,
                            popularity = $6, extra = $7, updated_at = NOW()
                         WHERE id = $1",
                    )
                    .bind(*id)
                    .bind(&activity.actor)
                    .bind(&activity.verb)
                    .bind(&activity.object)
                    .bind(&activity.target)
                    .bind(activity.popularity)
                    .bind(Value::Object(activity.extra))
                    .execute(&mut *tx)
                    .await?;
                    touch_owning_bucket(&mut *tx, *id).await?;
                    modified += 1;
                }
                tx.commit().await?;
                Ok((ids.len(), modified))
            }
            .await;
            match applied {
                Ok((matched, modified)) => {
                    result.matched += matched;
                    result.modified += modified;
                }
                Err(e) => result.failures.push(failure(index, e)),
            }
        }
        Ok(result)
    }

    async fn remove_activities(
        &self,
        feed: &str,
        selectors: &[ActivitySelector],
    ) -> Result<WriteOutcome> {
        let mut outcome = WriteOutcome::default();
        for (index, selector) in selectors.iter().enumerate() {
            let removed: Result<Vec<Activity>> = async {
                let mut tx = self.pool.begin().await?;
                let mut removed = Vec::new();
                for id in select_ids(&mut *tx, feed, selector).await? {
                    let sql = format!(
                        "DELETE FROM activities WHERE id = $1 RETURNING bucket_id, {ACTIVITY_COLUMNS}"
                    );
                    let Some(row) = sqlx_core::query::query(&sql)
                        .bind(id)
                        .fetch_optional(&mut *tx)
                        .await?
                    else {
                        continue;
                    };
                    let bucket_id: Option<i64> = row.try_get("bucket_id")?;
                    if let Some(bucket_id) = bucket_id {
                        sqlx_core::query::query(
                            "UPDATE buckets SET activity_count = activity_count - 1,
                                updated_at = NOW()
                             WHERE id = $1",
                        )
                        .bind(bucket_id)
                        .execute(&mut *tx)
                        .await?;
                    }
                    removed.push(activity_from_row(&row)?);
                }
                tx.commit().await?;
                Ok(removed)
            }
            .await;
            match removed {
                Ok(removed) => {
                    outcome.result.matched += removed.len();
                    outcome.result.removed += removed.len();
                    outcome.activities.extend(removed);
                }
                Err(e) => outcome.result.failures.push(failure(index, e)),
            }
        }
        Ok(outcome)
    }

    async fn find_activities(&self, feed: &str, query: &ActivityQuery) -> Result<Vec<Activity>> {
        let sql = format!(
            "SELECT {ACTIVITY_COLUMNS} FROM activities
             WHERE feed = $1 AND bucket_id IS NULL
               AND ($2::text IS NULL OR verb = $2)
               AND ($3::text IS NULL OR actor = $3)
               AND ($4::text IS NULL OR source = $4)
             ORDER BY time DESC, id DESC
             LIMIT $5 OFFSET $6"
        );
        let rows = sqlx_core::query::query(&sql)
            .bind(feed)
            .bind(&query.verb)
            .bind(&query.actor)
            .bind(&query.source)
            .bind(query.limit as i64)
            .bind(query.offset as i64)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(activity_from_row).collect()
    }

    async fn trim_activities(&self, feed: &str, max_len: u32) -> Result<usize> {
        let result = sqlx_core::query::query(
            "DELETE FROM activities
             WHERE feed = $1 AND bucket_id IS NULL
               AND id NOT IN (
                   SELECT id FROM activities
                   WHERE feed = $1 AND bucket_id IS NULL
                   ORDER BY time DESC, id DESC
                   LIMIT $2
               )",
        )
        .bind(feed)
        .bind(i64::from(max_len))
        .execute(&self.pool)
        .await?;
        if result.rows_affected() > 0 {
            sqlx_core::query::query(
                "DELETE FROM activity_cc c
                 WHERE NOT EXISTS (SELECT 1 FROM activities a WHERE a.id = c.activity_id)",
            )
            .execute(&self.pool)
            .await?;
        }
        Ok(result.rows_affected() as usize)
    }

    async fn record_cc(&self, activity_id: i64, feeds: &[String]) -> Result<()> {
        for feed in feeds {
            sqlx_core::query::query(
                "INSERT INTO activity_cc (activity_id, feed) VALUES ($1, $2)
                 ON CONFLICT DO NOTHING",
            )
            .bind(activity_id)
            .bind(feed)
            .execute(&self.pool)
            .await?;
        }
        Ok(())
    }

    async fn take_cc_links(&self, activity_id: i64) -> Result<Vec<String>> {
        let rows = sqlx_core::query::query(
            "DELETE FROM activity_cc WHERE activity_id = $1 RETURNING feed",
        )
        .bind(activity_id)
        .fetch_all(&self.pool)
        .await?;
        let mut feeds: Vec<String> = rows.iter().map(|r| r.get::<String, _>(0)).collect();
        feeds.sort();
        Ok(feeds)
    }

    async fn bounded_append(
        &self,
        key: &BucketKey,
        items: &[NewActivity],
        max_len: u32,
    ) -> Result<WriteOutcome> {
        if max_len == 0 {
            bail!("bucket length bound must be positive");
        }
        let max_len = i64::from(max_len);
        let mut tx = self.pool.begin().await?;
        let mut written: Vec<Option<Activity>> = vec![None; items.len()];
        let mut result = BulkWriteResult::default();

        let mut pending = Vec::new();
        let mut repeats = Vec::new();
        let mut keys = BatchKeys::default();
        for (index, item) in items.iter().enumerate() {
            if let Some(first) = keys.first_of(index, item) {
                repeats.push((index, first));
                continue;
            }
            match find_existing(&mut *tx, item).await? {
                Some(id) => {
                    written[index] = Some(refresh_activity(&mut *tx, id, item).await?);
                    result.upserted += 1;
                }
                None => pending.push(index),
            }
        }

        let mut cursor = 0;
        while cursor < pending.len() {
            let open = sqlx_core::query::query(
                "SELECT id, activity_count::bigint FROM buckets
                 WHERE feed = $1 AND grp = $2 AND verb = $3 AND activity_count < $4
                 ORDER BY id DESC LIMIT 1",
            )
            .bind(&key.feed)
            .bind(&key.group)
            .bind(&key.verb)
            .bind(max_len)
            .fetch_optional(&mut *tx)
            .await?;
            let (bucket_id, count): (i64, i64) = match open {
                Some(row) => (row.try_get(0)?, row.try_get(1)?),
                None => {
                    let row = sqlx_core::query::query(
                        "INSERT INTO buckets (feed, grp, verb, activity_count)
                         VALUES ($1, $2, $3, 0) RETURNING id",
                    )
                    .bind(&key.feed)
                    .bind(&key.group)
                    .bind(&key.verb)
                    .fetch_one(&mut *tx)
                    .await?;
                    (row.try_get(0)?, 0)
                }
            };

            let take = ((max_len - count) as usize).min(pending.len() - cursor);
            // Concurrent writers block on the row and re-check the predicate
            // against the committed count once they get it.
            let reserved = sqlx_core::query::query(
                "UPDATE buckets SET activity_count = activity_count + $2, updated_at = NOW()
                 WHERE id = $1 AND activity_count + $2 <= $3",
            )
            .bind(bucket_id)
            .bind(take as i32)
            .bind(max_len)
            .execute(&mut *tx)
            .await?;
            if reserved.rows_affected() == 0 {
                continue;
            }
            for &index in &pending[cursor..cursor + take] {
                written[index] = Some(insert_activity(&mut *tx, &items[index], Some(bucket_id)).await?);
                result.inserted += 1;
            }
            cursor += take;
        }

        for (index, first) in repeats {
            let Some(id) = written[first].as_ref().map(|a| a.id) else {
                bail!("batch item {first} was not written");
            };
            written[index] = Some(refresh_activity(&mut *tx, id, &items[index]).await?);
            result.upserted += 1;
        }

        tx.commit().await?;
        Ok(WriteOutcome {
            activities: written.into_iter().flatten().collect(),
            result,
        })
    }

    async fn sweep_empty_buckets(&self) -> Result<usize> {
        let result = sqlx_core::query::query("DELETE FROM buckets WHERE activity_count <= 0")
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() as usize)
    }

    async fn find_buckets(
        &self,
        feed: &str,
        query: &ActivityQuery,
    ) -> Result<Vec<AggregationBucket>> {
        let rows = sqlx_core::query::query(
            "SELECT id, feed, grp, verb, seen_at, read_at, created_at, updated_at
             FROM buckets b
             WHERE feed = $1
               AND (($2::text IS NULL AND $3::text IS NULL AND $4::text IS NULL) OR EXISTS (
                   SELECT 1 FROM activities a
                   WHERE a.bucket_id = b.id
                     AND ($2::text IS NULL OR a.verb = $2)
                     AND ($3::text IS NULL OR a.actor = $3)
                     AND ($4::text IS NULL OR a.source = $4)
               ))
             ORDER BY updated_at DESC, id DESC
             LIMIT $5 OFFSET $6",
        )
        .bind(feed)
        .bind(&query.verb)
        .bind(&query.actor)
        .bind(&query.source)
        .bind(query.limit as i64)
        .bind(query.offset as i64)
        .fetch_all(&self.pool)
        .await?;

        let items_sql = format!("SELECT {ACTIVITY_COLUMNS} FROM activities WHERE bucket_id = $1");
        let mut buckets = Vec::with_capacity(rows.len());
        for row in rows {
            let id: i64 = row.try_get("id")?;
            let items = sqlx_core::query::query(&items_sql)
                .bind(id)
                .fetch_all(&self.pool)
                .await?;
            let activities = items
                .iter()
                .map(activity_from_row)
                .collect::<Result<Vec<_>>>()?
                .into_iter()
                .filter(|a| query.matches(a))
                .collect();
            buckets.push(AggregationBucket {
                id,
                feed: row.try_get("feed")?,
                group: row.try_get("grp")?,
                verb: row.try_get("verb")?,
                actors: Vec::new(),
                objects: Vec::new(),
                activities,
                seen_at: row.try_get("seen_at")?,
                read_at: row.try_get("read_at")?,
                created_at: row.try_get("created_at")?,
                updated_at: row.try_get("updated_at")?,
            });
        }
        Ok(buckets)
    }

    async fn trim_buckets(&self, feed: &str, max_len: u32) -> Result<usize> {
        let mut tx = self.pool.begin().await?;
        let rows = sqlx_core::query::query(
            "SELECT id FROM buckets WHERE feed = $1
             ORDER BY updated_at DESC, id DESC
             OFFSET $2",
        )
        .bind(feed)
        .bind(i64::from(max_len))
        .fetch_all(&mut *tx)
        .await?;
        let ids: Vec<i64> = rows.iter().map(|r| r.get::<i64, _>(0)).collect();
        if ids.is_empty() {
            return Ok(0);
        }
        sqlx_core::query::query("DELETE FROM activities WHERE bucket_id = ANY($1)")
            .bind(ids.as_slice())
            .execute(&mut *tx)
            .await?;
        let result = sqlx_core::query::query("DELETE FROM buckets WHERE id = ANY($1)")
            .bind(ids.as_slice())
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(result.rows_affected() as usize)
    }

    async fn mark_buckets(
        &self,
        feed: &str,
        bucket_ids: &[i64],
        mark: Mark,
        at: DateTime<Utc>,
    ) -> Result<usize> {
        let column = match mark {
            Mark::Seen => "seen_at",
            Mark::Read => "read_at",
        };
        let result = if bucket_ids.is_empty() {
            sqlx_core::query::query(&format!(
                "UPDATE buckets SET {column} = $2 WHERE feed = $1"
            ))
            .bind(feed)
            .bind(at)
            .execute(&self.pool)
            .await?
        } else {
            sqlx_core::query::query(&format!(
                "UPDATE buckets SET {column} = $2 WHERE feed = $1 AND id = ANY($3)"
            ))
            .bind(feed)
            .bind(at)
            .bind(bucket_ids)
            .execute(&self.pool)
            .await?
        };
        sqlx_core::query::query(&format!("UPDATE feeds SET {column} = $2 WHERE id = $1"))
            .bind(feed)
            .bind(at)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() as usize)
    }

    async fn get_followship(&self, follower: &str, followee: &str) -> Result<Option<Followship>> {
        let row = sqlx_core::query::query(
            "SELECT follower, followee, priority, created_at FROM followships
             WHERE follower = $1 AND followee = $2",
        )
        .bind(follower)
        .bind(followee)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(followship_from_row).transpose()
    }

    async fn insert_followship(&self, followship: &Followship) -> Result<bool> {
        let result = sqlx_core::query::query(
            "INSERT INTO followships (follower, followee, priority, created_at)
             VALUES ($1, $2, $3, $4)
             ON CONFLICT (follower, followee) DO NOTHING",
        )
        .bind(&followship.follower)
        .bind(&followship.followee)
        .bind(followship.priority)
        .bind(followship.created_at)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn delete_followship(&self, follower: &str, followee: &str) -> Result<bool> {
        let result =
            sqlx_core::query::query("DELETE FROM followships WHERE follower = $1 AND followee = $2")
                .bind(follower)
                .bind(followee)
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn followers_of(
        &self,
        feed: &str,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Followship>> {
        let rows = sqlx_core::query::query(
            "SELECT follower, followee, priority, created_at FROM followships
             WHERE followee = $1
             ORDER BY priority DESC, seq ASC
             LIMIT $2 OFFSET $3",
        )
        .bind(feed)
        .bind(limit as i64)
        .bind(offset as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(followship_from_row).collect()
    }

    async fn followees_of(
        &self,
        feed: &str,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Followship>> {
        let rows = sqlx_core::query::query(
            "SELECT follower, followee, priority, created_at FROM followships
             WHERE follower = $1
             ORDER BY priority DESC, seq ASC
             LIMIT $2 OFFSET $3",
        )
        .bind(feed)
        .bind(limit as i64)
        .bind(offset as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(followship_from_row).collect()
    }

    async fn enqueue_job(
        &self,
        name: &str,
        payload: &str,
        priority: i32,
        now: DateTime<Utc>,
    ) -> Result<i64> {
        let row = sqlx_core::query::query(
            "INSERT INTO jobs (name, payload, priority, status, created_at, updated_at)
             VALUES ($1, $2::jsonb, $3, 'pending', $4, $4)
             RETURNING id",
        )
        .bind(name)
        .bind(payload)
        .bind(priority)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.get::<i64, _>(0))
    }

    async fn claim_job(
        &self,
        now: DateTime<Utc>,
        lock_lifetime: Duration,
    ) -> Result<Option<JobRecord>> {
        let sql = format!(
            "UPDATE jobs SET status = 'running', attempts = attempts + 1,
                locked_until = $2, updated_at = $1
             WHERE id = (
                 SELECT id FROM jobs
                 WHERE status = 'pending' OR (status = 'running' AND locked_until < $1)
                 ORDER BY priority DESC, id ASC
                 LIMIT 1
                 FOR UPDATE SKIP LOCKED
             )
             RETURNING {JOB_COLUMNS}"
        );
        let row = sqlx_core::query::query(&sql)
            .bind(now)
            .bind(now + lock_lifetime)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(job_from_row).transpose()
    }

    async fn complete_job(&self, id: i64) -> Result<()> {
        sqlx_core::query::query(
            "UPDATE jobs SET status = 'done', locked_until = NULL, updated_at = NOW()
             WHERE id = $1",
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn fail_job(&self, id: i64, error: &str, retry: bool) -> Result<()> {
        let status = if retry {
            JobStatus::Pending
        } else {
            JobStatus::Failed
        };
        sqlx_core::query::query(
            "UPDATE jobs SET status = $2, last_error = $3, locked_until = NULL, updated_at = NOW()
             WHERE id = $1",
        )
        .bind(id)
        .bind(status.as_str())
        .bind(error)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_job(&self, id: i64) -> Result<Option<JobRecord>> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = $1");
        let row = sqlx_core::query::query(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(job_from_row).transpose()
    }
}

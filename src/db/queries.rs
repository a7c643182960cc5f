// Database queries — CRUD operations for all tables.
//
// Every SQLite interaction goes through this module. This keeps SQL
// contained in one place and gives the rest of the app clean Rust interfaces.
//
// Bulk writes are unordered: each item runs inside its own savepoint, so a
// failing item is rolled back and reported while its siblings still commit.

use anyhow::{bail, Result};
use chrono::{DateTime, Duration, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde_json::{Map, Value};

use super::models::{
    format_timestamp, parse_timestamp, Activity, ActivityQuery, ActivitySelector, ActivityUpdate,
    AggregationBucket, BatchKeys, BucketKey, BulkFailure, BulkWriteResult, Feed, FeedSettings,
    Followship, JobRecord, JobStatus, Mark, NewActivity, NewFeed, StoreStats, WriteOutcome,
};
use crate::feed::FeedKind;

const ACTIVITY_COLUMNS: &str = "id, feed, actor, verb, object, target, foreign_id, time, \
     source, origin, popularity, extra, created_at, updated_at";

const FEED_COLUMNS: &str = "id, grp, target, kind, realtime, max_length, aggregation, rank, \
     seen_at, read_at, created_at, updated_at";

const JOB_COLUMNS: &str =
    "id, name, payload, priority, status, attempts, locked_until, last_error, created_at";

// --- Row helpers ---

fn conversion_error(idx: usize, e: anyhow::Error) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, e.into())
}

fn time_column(row: &Row, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let text: String = row.get(idx)?;
    parse_timestamp(&text).map_err(|e| conversion_error(idx, e))
}

fn opt_time_column(row: &Row, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let text: Option<String> = row.get(idx)?;
    text.map(|t| parse_timestamp(&t).map_err(|e| conversion_error(idx, e)))
        .transpose()
}

fn activity_from_row(row: &Row) -> rusqlite::Result<Activity> {
    let extra_json: String = row.get(11)?;
    let extra: Map<String, Value> =
        serde_json::from_str(&extra_json).map_err(|e| conversion_error(11, e.into()))?;
    Ok(Activity {
        id: row.get(0)?,
        feed: row.get(1)?,
        actor: row.get(2)?,
        verb: row.get(3)?,
        object: row.get(4)?,
        target: row.get(5)?,
        foreign_id: row.get(6)?,
        time: time_column(row, 7)?,
        source: row.get(8)?,
        origin: row.get(9)?,
        popularity: row.get(10)?,
        extra,
        created_at: time_column(row, 12)?,
        updated_at: time_column(row, 13)?,
    })
}

fn feed_from_row(row: &Row) -> rusqlite::Result<Feed> {
    let kind_text: String = row.get(3)?;
    let kind = FeedKind::parse(&kind_text)
        .ok_or_else(|| conversion_error(3, anyhow::anyhow!("unknown feed kind '{kind_text}'")))?;
    Ok(Feed {
        id: row.get(0)?,
        group: row.get(1)?,
        target: row.get(2)?,
        kind,
        realtime: row.get(4)?,
        max_length: row.get(5)?,
        aggregation: row.get(6)?,
        rank: row.get(7)?,
        seen_at: opt_time_column(row, 8)?,
        read_at: opt_time_column(row, 9)?,
        created_at: time_column(row, 10)?,
        updated_at: time_column(row, 11)?,
    })
}

fn job_from_row(row: &Row) -> rusqlite::Result<JobRecord> {
    let status_text: String = row.get(4)?;
    let status = JobStatus::parse(&status_text).ok_or_else(|| {
        conversion_error(4, anyhow::anyhow!("unknown job status '{status_text}'"))
    })?;
    Ok(JobRecord {
        id: row.get(0)?,
        name: row.get(1)?,
        payload: row.get(2)?,
        priority: row.get(3)?,
        status,
        attempts: row.get(5)?,
        locked_until: opt_time_column(row, 6)?,
        last_error: row.get(7)?,
        created_at: time_column(row, 8)?,
    })
}

fn followship_from_row(row: &Row) -> rusqlite::Result<Followship> {
    Ok(Followship {
        follower: row.get(0)?,
        followee: row.get(1)?,
        priority: row.get(2)?,
        created_at: time_column(row, 3)?,
    })
}

/// Run `f` inside a savepoint: committed on success, rolled back on error.
fn in_savepoint<T>(conn: &Connection, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
    conn.execute_batch("SAVEPOINT bulk_item")?;
    match f(conn) {
        Ok(value) => {
            conn.execute_batch("RELEASE bulk_item")?;
            Ok(value)
        }
        Err(e) => {
            conn.execute_batch("ROLLBACK TO bulk_item; RELEASE bulk_item")?;
            Err(e)
        }
    }
}

fn failure(index: usize, e: anyhow::Error) -> BulkFailure {
    BulkFailure {
        index,
        message: format!("{e:#}"),
    }
}

// --- Feeds ---

pub fn get_feed(conn: &Connection, id: &str) -> Result<Option<Feed>> {
    let sql = format!("SELECT {FEED_COLUMNS} FROM feeds WHERE id = ?1");
    let feed = conn.query_row(&sql, params![id], feed_from_row).optional()?;
    Ok(feed)
}

/// Insert the feed if absent, then read it back (upsert semantics).
pub fn get_or_create_feed(conn: &Connection, feed: &NewFeed) -> Result<Feed> {
    let now = format_timestamp(&Utc::now());
    conn.execute(
        "INSERT OR IGNORE INTO feeds (id, grp, target, kind, max_length, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)",
        params![
            feed.id,
            feed.group,
            feed.target,
            feed.kind.as_str(),
            feed.max_length,
            now
        ],
    )?;
    match get_feed(conn, &feed.id)? {
        Some(stored) => Ok(stored),
        None => bail!("feed {} vanished after insert", feed.id),
    }
}

pub fn update_feed_settings(
    conn: &Connection,
    id: &str,
    settings: &FeedSettings,
) -> Result<Option<Feed>> {
    let updated = conn.execute(
        "UPDATE feeds SET
            realtime = COALESCE(?2, realtime),
            max_length = COALESCE(?3, max_length),
            aggregation = COALESCE(?4, aggregation),
            rank = COALESCE(?5, rank),
            updated_at = ?6
         WHERE id = ?1",
        params![
            id,
            settings.realtime,
            settings.max_length,
            settings.aggregation,
            settings.rank,
            format_timestamp(&Utc::now())
        ],
    )?;
    if updated == 0 {
        return Ok(None);
    }
    get_feed(conn, id)
}

// --- Activities ---

pub fn get_activity(conn: &Connection, id: i64) -> Result<Option<Activity>> {
    let sql = format!("SELECT {ACTIVITY_COLUMNS} FROM activities WHERE id = ?1");
    let activity = conn.query_row(&sql, params![id], activity_from_row).optional()?;
    Ok(activity)
}

/// Id of the record in the item's feed sharing its origin or (foreignId, time).
fn find_existing(conn: &Connection, item: &NewActivity) -> Result<Option<i64>> {
    if let Some(origin) = item.origin {
        let found = conn
            .query_row(
                "SELECT id FROM activities WHERE feed = ?1 AND origin = ?2",
                params![item.feed, origin],
                |row| row.get(0),
            )
            .optional()?;
        if found.is_some() {
            return Ok(found);
        }
    }
    if let (Some(foreign_id), Some(time)) = (&item.foreign_id, &item.time) {
        let found = conn
            .query_row(
                "SELECT id FROM activities WHERE feed = ?1 AND foreign_id = ?2 AND time = ?3",
                params![item.feed, foreign_id, format_timestamp(time)],
                |row| row.get(0),
            )
            .optional()?;
        return Ok(found);
    }
    Ok(None)
}

fn touch_owning_bucket(conn: &Connection, activity_id: i64, now: &str) -> Result<()> {
    conn.execute(
        "UPDATE buckets SET updated_at = ?2
         WHERE id = (SELECT bucket_id FROM activities WHERE id = ?1)",
        params![activity_id, now],
    )?;
    Ok(())
}

/// Overwrite the mutable fields of an existing record with a re-submitted item.
/// A copy keeps the `source` it was first delivered from.
fn refresh_activity(conn: &Connection, id: i64, item: &NewActivity, now: &str) -> Result<Activity> {
    conn.execute(
        "UPDATE activities SET
            actor = ?2, verb = ?3, object = ?4, target = ?5,
            source = COALESCE(source, ?6),
            popularity = COALESCE(?7, popularity),
            extra = ?8,
            updated_at = ?9
         WHERE id = ?1",
        params![
            id,
            item.actor,
            item.verb,
            item.object,
            item.target,
            item.source,
            item.popularity,
            serde_json::to_string(&item.extra)?,
            now
        ],
    )?;
    touch_owning_bucket(conn, id, now)?;
    match get_activity(conn, id)? {
        Some(activity) => Ok(activity),
        None => bail!("activity {id} vanished after update"),
    }
}

fn insert_activity(
    conn: &Connection,
    item: &NewActivity,
    bucket_id: Option<i64>,
    now: &str,
) -> Result<Activity> {
    let time = item.time.as_ref().map(format_timestamp);
    conn.execute(
        "INSERT INTO activities
            (feed, bucket_id, actor, verb, object, target, foreign_id, time,
             source, origin, popularity, extra, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, COALESCE(?8, ?13), ?9, ?10, ?11, ?12, ?13, ?13)",
        params![
            item.feed,
            bucket_id,
            item.actor,
            item.verb,
            item.object,
            item.target,
            item.foreign_id,
            time,
            item.source,
            item.origin,
            item.popularity.unwrap_or(1),
            serde_json::to_string(&item.extra)?,
            now
        ],
    )?;
    let id = conn.last_insert_rowid();
    match get_activity(conn, id)? {
        Some(activity) => Ok(activity),
        None => bail!("activity {id} vanished after insert"),
    }
}

pub fn insert_activities(conn: &Connection, items: &[NewActivity]) -> Result<WriteOutcome> {
    let now = format_timestamp(&Utc::now());
    let mut outcome = WriteOutcome::default();
    for (index, item) in items.iter().enumerate() {
        let written = in_savepoint(conn, |c| match find_existing(c, item)? {
            Some(id) => refresh_activity(c, id, item, &now).map(|a| (a, true)),
            None => insert_activity(c, item, None, &now).map(|a| (a, false)),
        });
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

/// Ids of the records in `feed` matched by `selector`.
pub fn select_ids(conn: &Connection, feed: &str, selector: &ActivitySelector) -> Result<Vec<i64>> {
    let ids = match selector {
        ActivitySelector::Id(id) => {
            let mut stmt = conn.prepare("SELECT id FROM activities WHERE feed = ?1 AND id = ?2")?;
            let rows = stmt.query_map(params![feed, id], |row| row.get(0))?;
            rows.collect::<rusqlite::Result<Vec<i64>>>()?
        }
        ActivitySelector::Foreign { foreign_id, time } => {
            let mut stmt = conn.prepare(
                "SELECT id FROM activities WHERE feed = ?1 AND foreign_id = ?2 AND time = ?3",
            )?;
            let rows =
                stmt.query_map(params![feed, foreign_id, format_timestamp(time)], |row| {
                    row.get(0)
                })?;
            rows.collect::<rusqlite::Result<Vec<i64>>>()?
        }
        ActivitySelector::Origin(origin) => {
            let mut stmt =
                conn.prepare("SELECT id FROM activities WHERE feed = ?1 AND origin = ?2")?;
            let rows = stmt.query_map(params![feed, origin], |row| row.get(0))?;
            rows.collect::<rusqlite::Result<Vec<i64>>>()?
        }
        ActivitySelector::Source(source) => {
            let mut stmt =
                conn.prepare("SELECT id FROM activities WHERE feed = ?1 AND source = ?2")?;
            let rows = stmt.query_map(params![feed, source], |row| row.get(0))?;
            rows.collect::<rusqlite::Result<Vec<i64>>>()?
        }
    };
    Ok(ids)
}

pub fn update_activities(
    conn: &Connection,
    feed: &str,
    updates: &[ActivityUpdate],
) -> Result<BulkWriteResult> {
    let now = format_timestamp(&Utc::now());
    let mut result = BulkWriteResult::default();
    for (index, update) in updates.iter().enumerate() {
        let applied = in_savepoint(conn, |c| {
            let ids = select_ids(c, feed, &update.selector)?;
            let mut modified = 0;
            for id in &ids {
                let Some(mut activity) = get_activity(c, *id)? else {
                    continue;
                };
                update.patch.apply(&mut activity);
                c.execute(
                    "UPDATE activities SET
                        actor = ?2, verb = ?3, object = ?4, target = ?5,
                        popularity = ?6, extra = ?7, updated_at = ?8
                     WHERE id = ?1",
                    params![
                        id,
                        activity.actor,
                        activity.verb,
                        activity.object,
                        activity.target,
                        activity.popularity,
                        serde_json::to_string(&activity.extra)?,
                        now
                    ],
                )?;
                touch_owning_bucket(c, *id, &now)?;
                modified += 1;
            }
            Ok((ids.len(), modified))
        });
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

pub fn remove_activities(
    conn: &Connection,
    feed: &str,
    selectors: &[ActivitySelector],
) -> Result<WriteOutcome> {
    let mut outcome = WriteOutcome::default();
    for (index, selector) in selectors.iter().enumerate() {
        let removed = in_savepoint(conn, |c| {
            let mut removed = Vec::new();
            for id in select_ids(c, feed, selector)? {
                let Some(activity) = get_activity(c, id)? else {
                    continue;
                };
                let bucket_id: Option<i64> = c.query_row(
                    "SELECT bucket_id FROM activities WHERE id = ?1",
                    params![id],
                    |row| row.get(0),
                )?;
                c.execute("DELETE FROM activities WHERE id = ?1", params![id])?;
                if let Some(bucket_id) = bucket_id {
                    c.execute(
                        "UPDATE buckets SET activity_count = activity_count - 1, updated_at = ?2
                         WHERE id = ?1",
                        params![bucket_id, format_timestamp(&Utc::now())],
                    )?;
                }
                removed.push(activity);
            }
            Ok(removed)
        });
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

/// Flat records of a feed, most recent first.
pub fn find_activities(conn: &Connection, feed: &str, query: &ActivityQuery) -> Result<Vec<Activity>> {
    let sql = format!(
        "SELECT {ACTIVITY_COLUMNS} FROM activities
         WHERE feed = ?1 AND bucket_id IS NULL
           AND (?2 IS NULL OR verb = ?2)
           AND (?3 IS NULL OR actor = ?3)
           AND (?4 IS NULL OR source = ?4)
         ORDER BY time DESC, id DESC
         LIMIT ?5 OFFSET ?6"
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(
        params![
            feed,
            query.verb,
            query.actor,
            query.source,
            query.limit as i64,
            query.offset as i64
        ],
        activity_from_row,
    )?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

/// Delete every flat record ranked beyond `max_len` by recency.
pub fn trim_activities(conn: &Connection, feed: &str, max_len: u32) -> Result<usize> {
    let removed = conn.execute(
        "DELETE FROM activities
         WHERE feed = ?1 AND bucket_id IS NULL
           AND id NOT IN (
               SELECT id FROM activities
               WHERE feed = ?1 AND bucket_id IS NULL
               ORDER BY time DESC, id DESC
               LIMIT ?2
           )",
        params![feed, max_len],
    )?;
    if removed > 0 {
        conn.execute(
            "DELETE FROM activity_cc WHERE activity_id NOT IN (SELECT id FROM activities)",
            [],
        )?;
    }
    Ok(removed)
}

// --- cc bookkeeping ---

pub fn record_cc(conn: &Connection, activity_id: i64, feeds: &[String]) -> Result<()> {
    for feed in feeds {
        conn.execute(
            "INSERT OR IGNORE INTO activity_cc (activity_id, feed) VALUES (?1, ?2)",
            params![activity_id, feed],
        )?;
    }
    Ok(())
}

pub fn take_cc_links(conn: &Connection, activity_id: i64) -> Result<Vec<String>> {
    let mut stmt =
        conn.prepare("SELECT feed FROM activity_cc WHERE activity_id = ?1 ORDER BY feed")?;
    let feeds = stmt
        .query_map(params![activity_id], |row| row.get(0))?
        .collect::<rusqlite::Result<Vec<String>>>()?;
    conn.execute(
        "DELETE FROM activity_cc WHERE activity_id = ?1",
        params![activity_id],
    )?;
    Ok(feeds)
}

// --- Aggregation buckets ---

/// Append items to the open bucket for `key`, spilling into new buckets.
///
/// Runs as one unit: either every item lands or none does. Capacity is
/// reserved with a conditional update on `activity_count` before rows are
/// written, so a bucket can never exceed `max_len`.
pub fn bounded_append(
    conn: &Connection,
    key: &BucketKey,
    items: &[NewActivity],
    max_len: u32,
) -> Result<WriteOutcome> {
    if max_len == 0 {
        bail!("bucket length bound must be positive");
    }
    let max_len = i64::from(max_len);
    let now = format_timestamp(&Utc::now());

    in_savepoint(conn, |c| {
        let mut written: Vec<Option<Activity>> = vec![None; items.len()];
        let mut result = BulkWriteResult::default();

        // Re-deliveries update the existing record in place; repeats within
        // the batch refresh whatever the first occurrence wrote
        let mut pending = Vec::new();
        let mut repeats = Vec::new();
        let mut keys = BatchKeys::default();
        for (index, item) in items.iter().enumerate() {
            if let Some(first) = keys.first_of(index, item) {
                repeats.push((index, first));
                continue;
            }
            match find_existing(c, item)? {
                Some(id) => {
                    written[index] = Some(refresh_activity(c, id, item, &now)?);
                    result.upserted += 1;
                }
                None => pending.push(index),
            }
        }

        let mut cursor = 0;
        while cursor < pending.len() {
            let open: Option<(i64, i64)> = c
                .query_row(
                    "SELECT id, activity_count FROM buckets
                     WHERE feed = ?1 AND grp = ?2 AND verb = ?3 AND activity_count < ?4
                     ORDER BY id DESC LIMIT 1",
                    params![key.feed, key.group, key.verb, max_len],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?;
            let (bucket_id, count) = match open {
                Some(bucket) => bucket,
                None => {
                    c.execute(
                        "INSERT INTO buckets (feed, grp, verb, activity_count, created_at, updated_at)
                         VALUES (?1, ?2, ?3, 0, ?4, ?4)",
                        params![key.feed, key.group, key.verb, now],
                    )?;
                    (c.last_insert_rowid(), 0)
                }
            };

            let take = ((max_len - count) as usize).min(pending.len() - cursor);
            let reserved = c.execute(
                "UPDATE buckets SET activity_count = activity_count + ?2, updated_at = ?3
                 WHERE id = ?1 AND activity_count + ?2 <= ?4",
                params![bucket_id, take as i64, now, max_len],
            )?;
            if reserved == 0 {
                // Filled by another writer in the meantime
                continue;
            }
            for &index in &pending[cursor..cursor + take] {
                written[index] = Some(insert_activity(c, &items[index], Some(bucket_id), &now)?);
                result.inserted += 1;
            }
            cursor += take;
        }

        for (index, first) in repeats {
            let Some(id) = written[first].as_ref().map(|a| a.id) else {
                bail!("batch item {first} was not written");
            };
            written[index] = Some(refresh_activity(c, id, &items[index], &now)?);
            result.upserted += 1;
        }

        Ok(WriteOutcome {
            activities: written.into_iter().flatten().collect(),
            result,
        })
    })
}

pub fn sweep_empty_buckets(conn: &Connection) -> Result<usize> {
    let removed = conn.execute("DELETE FROM buckets WHERE activity_count <= 0", [])?;
    Ok(removed)
}

/// Buckets of a feed, most recently updated first, with their items loaded.
/// Items are unordered; callers rank them with the feed's rank spec.
pub fn find_buckets(
    conn: &Connection,
    feed: &str,
    query: &ActivityQuery,
) -> Result<Vec<AggregationBucket>> {
    let mut stmt = conn.prepare(
        "SELECT id, feed, grp, verb, seen_at, read_at, created_at, updated_at
         FROM buckets b
         WHERE feed = ?1
           AND ((?2 IS NULL AND ?3 IS NULL AND ?4 IS NULL) OR EXISTS (
               SELECT 1 FROM activities a
               WHERE a.bucket_id = b.id
                 AND (?2 IS NULL OR a.verb = ?2)
                 AND (?3 IS NULL OR a.actor = ?3)
                 AND (?4 IS NULL OR a.source = ?4)
           ))
         ORDER BY updated_at DESC, id DESC
         LIMIT ?5 OFFSET ?6",
    )?;
    let rows = stmt.query_map(
        params![
            feed,
            query.verb,
            query.actor,
            query.source,
            query.limit as i64,
            query.offset as i64
        ],
        |row| {
            Ok(AggregationBucket {
                id: row.get(0)?,
                feed: row.get(1)?,
                group: row.get(2)?,
                verb: row.get(3)?,
                actors: Vec::new(),
                objects: Vec::new(),
                activities: Vec::new(),
                seen_at: opt_time_column(row, 4)?,
                read_at: opt_time_column(row, 5)?,
                created_at: time_column(row, 6)?,
                updated_at: time_column(row, 7)?,
            })
        },
    )?;
    let mut buckets = rows.collect::<rusqlite::Result<Vec<_>>>()?;

    let sql = format!("SELECT {ACTIVITY_COLUMNS} FROM activities WHERE bucket_id = ?1");
    let mut items_stmt = conn.prepare(&sql)?;
    for bucket in &mut buckets {
        bucket.activities = items_stmt
            .query_map(params![bucket.id], activity_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?
            .into_iter()
            .filter(|a| query.matches(a))
            .collect();
    }
    Ok(buckets)
}

/// Delete every bucket (and its items) ranked beyond `max_len` by recency.
pub fn trim_buckets(conn: &Connection, feed: &str, max_len: u32) -> Result<usize> {
    let overflow = "SELECT id FROM buckets
         WHERE feed = ?1
           AND id NOT IN (
               SELECT id FROM buckets WHERE feed = ?1
               ORDER BY updated_at DESC, id DESC LIMIT ?2
           )";
    conn.execute(
        &format!("DELETE FROM activities WHERE bucket_id IN ({overflow})"),
        params![feed, max_len],
    )?;
    let removed = conn.execute(
        &format!("DELETE FROM buckets WHERE id IN ({overflow})"),
        params![feed, max_len],
    )?;
    Ok(removed)
}

pub fn mark_buckets(
    conn: &Connection,
    feed: &str,
    bucket_ids: &[i64],
    mark: Mark,
    at: DateTime<Utc>,
) -> Result<usize> {
    let column = match mark {
        Mark::Seen => "seen_at",
        Mark::Read => "read_at",
    };
    let at = format_timestamp(&at);
    let marked = if bucket_ids.is_empty() {
        conn.execute(
            &format!("UPDATE buckets SET {column} = ?2 WHERE feed = ?1"),
            params![feed, at],
        )?
    } else {
        let mut marked = 0;
        for id in bucket_ids {
            marked += conn.execute(
                &format!("UPDATE buckets SET {column} = ?3 WHERE feed = ?1 AND id = ?2"),
                params![feed, id, at],
            )?;
        }
        marked
    };
    conn.execute(
        &format!("UPDATE feeds SET {column} = ?2 WHERE id = ?1"),
        params![feed, at],
    )?;
    Ok(marked)
}

// --- Followships ---

pub fn get_followship(
    conn: &Connection,
    follower: &str,
    followee: &str,
) -> Result<Option<Followship>> {
    let followship = conn
        .query_row(
            "SELECT follower, followee, priority, created_at FROM followships
             WHERE follower = ?1 AND followee = ?2",
            params![follower, followee],
            followship_from_row,
        )
        .optional()?;
    Ok(followship)
}

pub fn insert_followship(conn: &Connection, followship: &Followship) -> Result<bool> {
    let inserted = conn.execute(
        "INSERT OR IGNORE INTO followships (follower, followee, priority, created_at)
         VALUES (?1, ?2, ?3, ?4)",
        params![
            followship.follower,
            followship.followee,
            followship.priority,
            format_timestamp(&followship.created_at)
        ],
    )?;
    Ok(inserted > 0)
}

pub fn delete_followship(conn: &Connection, follower: &str, followee: &str) -> Result<bool> {
    let deleted = conn.execute(
        "DELETE FROM followships WHERE follower = ?1 AND followee = ?2",
        params![follower, followee],
    )?;
    Ok(deleted > 0)
}

/// Edges into `feed`, by priority and then insertion order, so a new edge
/// never lands ahead of an existing one of the same priority.
pub fn followers_of(
    conn: &Connection,
    feed: &str,
    limit: usize,
    offset: usize,
) -> Result<Vec<Followship>> {
    let mut stmt = conn.prepare(
        "SELECT follower, followee, priority, created_at FROM followships
         WHERE followee = ?1
         ORDER BY priority DESC, rowid ASC
         LIMIT ?2 OFFSET ?3",
    )?;
    let rows = stmt.query_map(
        params![feed, limit as i64, offset as i64],
        followship_from_row,
    )?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

pub fn followees_of(
    conn: &Connection,
    feed: &str,
    limit: usize,
    offset: usize,
) -> Result<Vec<Followship>> {
    let mut stmt = conn.prepare(
        "SELECT follower, followee, priority, created_at FROM followships
         WHERE follower = ?1
         ORDER BY priority DESC, rowid ASC
         LIMIT ?2 OFFSET ?3",
    )?;
    let rows = stmt.query_map(
        params![feed, limit as i64, offset as i64],
        followship_from_row,
    )?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

// --- Jobs ---

pub fn enqueue_job(
    conn: &Connection,
    name: &str,
    payload: &str,
    priority: i32,
    now: DateTime<Utc>,
) -> Result<i64> {
    conn.execute(
        "INSERT INTO jobs (name, payload, priority, status, created_at, updated_at)
         VALUES (?1, ?2, ?3, 'pending', ?4, ?4)",
        params![name, payload, priority, format_timestamp(&now)],
    )?;
    Ok(conn.last_insert_rowid())
}

pub fn get_job(conn: &Connection, id: i64) -> Result<Option<JobRecord>> {
    let sql = format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?1");
    let job = conn.query_row(&sql, params![id], job_from_row).optional()?;
    Ok(job)
}

pub fn claim_job(
    conn: &Connection,
    now: DateTime<Utc>,
    lock_lifetime: Duration,
) -> Result<Option<JobRecord>> {
    let now_text = format_timestamp(&now);
    let id: Option<i64> = conn
        .query_row(
            "SELECT id FROM jobs
             WHERE status = 'pending' OR (status = 'running' AND locked_until < ?1)
             ORDER BY priority DESC, id ASC
             LIMIT 1",
            params![now_text],
            |row| row.get(0),
        )
        .optional()?;
    let Some(id) = id else {
        return Ok(None);
    };
    conn.execute(
        "UPDATE jobs SET status = 'running', attempts = attempts + 1,
            locked_until = ?2, updated_at = ?3
         WHERE id = ?1",
        params![id, format_timestamp(&(now + lock_lifetime)), now_text],
    )?;
    get_job(conn, id)
}

pub fn complete_job(conn: &Connection, id: i64) -> Result<()> {
    conn.execute(
        "UPDATE jobs SET status = 'done', locked_until = NULL, updated_at = ?2 WHERE id = ?1",
        params![id, format_timestamp(&Utc::now())],
    )?;
    Ok(())
}

pub fn fail_job(conn: &Connection, id: i64, error: &str, retry: bool) -> Result<()> {
    let status = if retry {
        JobStatus::Pending
    } else {
        JobStatus::Failed
    };
    conn.execute(
        "UPDATE jobs SET status = ?2, last_error = ?3, locked_until = NULL, updated_at = ?4
         WHERE id = ?1",
        params![id, status.as_str(), error, format_timestamp(&Utc::now())],
    )?;
    Ok(())
}

// --- Stats ---

pub fn stats(conn: &Connection) -> Result<StoreStats> {
    let count = |sql: &str| -> Result<i64> { Ok(conn.query_row(sql, [], |row| row.get(0))?) };
    Ok(StoreStats {
        feeds: count("SELECT COUNT(*) FROM feeds")?,
        activities: count("SELECT COUNT(*) FROM activities WHERE bucket_id IS NULL")?,
        buckets: count("SELECT COUNT(*) FROM buckets")?,
        bucket_activities: count("SELECT COUNT(*) FROM activities WHERE bucket_id IS NOT NULL")?,
        followships: count("SELECT COUNT(*) FROM followships")?,
        jobs_pending: count("SELECT COUNT(*) FROM jobs WHERE status = 'pending'")?,
        jobs_running: count("SELECT COUNT(*) FROM jobs WHERE status = 'running'")?,
        jobs_failed: count("SELECT COUNT(*) FROM jobs WHERE status = 'failed'")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::schema::create_tables;
    use chrono::TimeZone;

    fn test_db() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        create_tables(&conn).unwrap();
        conn
    }

    fn item(feed: &str, n: i64) -> NewActivity {
        let mut item = NewActivity::new("user:1", "post", &format!("post:{n}"))
            .with_time(Utc.timestamp_opt(1_700_000_000 + n, 0).unwrap());
        item.feed = feed.to_string();
        item
    }

    fn key(feed: &str) -> BucketKey {
        BucketKey {
            feed: feed.to_string(),
            group: "post-2023-11-14".to_string(),
            verb: "post".to_string(),
        }
    }

    #[test]
    fn test_get_or_create_feed_is_upsert() {
        let conn = test_db();
        let new = NewFeed {
            id: "user:1".into(),
            group: "user".into(),
            target: "1".into(),
            kind: FeedKind::Flat,
            max_length: Some(10),
        };
        let first = get_or_create_feed(&conn, &new).unwrap();
        let second = get_or_create_feed(&conn, &new).unwrap();
        assert_eq!(first.created_at, second.created_at);
        assert_eq!(first.max_length, Some(10));
        assert_eq!(stats(&conn).unwrap().feeds, 1);
    }

    #[test]
    fn test_insert_upserts_on_foreign_id_and_time() {
        let conn = test_db();
        let at = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let mut first = NewActivity::new("user:1", "like", "post:1").with_foreign_id("like:1", at);
        first.feed = "user:1".into();
        let mut again = first.clone();
        again.extra.insert("message".into(), Value::from("edited"));

        let outcome = insert_activities(&conn, &[first]).unwrap();
        assert_eq!(outcome.result.inserted, 1);
        let outcome = insert_activities(&conn, &[again]).unwrap();
        assert_eq!(outcome.result.upserted, 1);

        let stored = find_activities(&conn, "user:1", &ActivityQuery::recent(10)).unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].extra.get("message"), Some(&Value::from("edited")));
    }

    #[test]
    fn test_redelivered_copy_keeps_first_source() {
        let conn = test_db();
        let mut copy = item("timeline:1", 1);
        copy.origin = Some(7);
        copy.source = Some("user:2".into());
        let mut via_other = copy.clone();
        via_other.source = Some("timeline:3".into());

        insert_activities(&conn, &[copy]).unwrap();
        let outcome = insert_activities(&conn, &[via_other]).unwrap();
        assert_eq!(outcome.result.upserted, 1);
        assert_eq!(outcome.activities[0].source.as_deref(), Some("user:2"));
    }

    #[test]
    fn test_bulk_insert_is_unordered() {
        let conn = test_db();
        conn.execute_batch(
            "CREATE TRIGGER reject_post_2 BEFORE INSERT ON activities
             WHEN NEW.object = 'post:2' BEGIN SELECT RAISE(ABORT, 'rejected'); END;",
        )
        .unwrap();
        let items = [item("user:1", 1), item("user:1", 2), item("user:1", 3)];
        let outcome = insert_activities(&conn, &items).unwrap();
        assert_eq!(outcome.result.inserted, 2);
        assert_eq!(outcome.result.failures.len(), 1);
        assert_eq!(outcome.result.failures[0].index, 1);
        let indexed: Vec<usize> = outcome.indexed().iter().map(|(i, _)| *i).collect();
        assert_eq!(indexed, vec![0, 2]);
    }

    #[test]
    fn test_trim_keeps_most_recent() {
        let conn = test_db();
        let items: Vec<NewActivity> = (1..=5).map(|n| item("user:1", n)).collect();
        insert_activities(&conn, &items).unwrap();
        assert_eq!(trim_activities(&conn, "user:1", 3).unwrap(), 2);
        let left = find_activities(&conn, "user:1", &ActivityQuery::recent(10)).unwrap();
        let objects: Vec<&str> = left.iter().map(|a| a.object.as_str()).collect();
        assert_eq!(objects, vec!["post:5", "post:4", "post:3"]);
    }

    #[test]
    fn test_bounded_append_spills_into_new_bucket() {
        let conn = test_db();
        let items: Vec<NewActivity> = (1..=5).map(|n| item("aggregated:1", n)).collect();
        let outcome = bounded_append(&conn, &key("aggregated:1"), &items, 3).unwrap();
        assert_eq!(outcome.result.inserted, 5);

        let buckets = find_buckets(&conn, "aggregated:1", &ActivityQuery::recent(10)).unwrap();
        let mut sizes: Vec<usize> = buckets.iter().map(|b| b.activities.len()).collect();
        sizes.sort();
        assert_eq!(sizes, vec![2, 3]);
    }

    #[test]
    fn test_bounded_append_dedups_by_origin() {
        let conn = test_db();
        let mut copy = item("aggregated:1", 1);
        copy.origin = Some(7);
        bounded_append(&conn, &key("aggregated:1"), &[copy.clone()], 15).unwrap();
        let outcome = bounded_append(&conn, &key("aggregated:1"), &[copy], 15).unwrap();
        assert_eq!(outcome.result.upserted, 1);
        assert_eq!(stats(&conn).unwrap().bucket_activities, 1);
    }

    #[test]
    fn test_bounded_append_repeated_key_in_one_batch() {
        let conn = test_db();
        let time = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        let first = item("aggregated:1", 1).with_foreign_id("f1", time);
        let mut again = first.clone();
        again.object = "post:edited".into();
        let other = item("aggregated:1", 2);

        let outcome =
            bounded_append(&conn, &key("aggregated:1"), &[first, other, again], 15).unwrap();
        assert!(outcome.result.failures.is_empty());
        assert_eq!(outcome.result.inserted, 2);
        assert_eq!(outcome.result.upserted, 1);
        assert_eq!(outcome.activities.len(), 3);
        assert_eq!(outcome.activities[0].id, outcome.activities[2].id);
        assert_eq!(outcome.activities[2].object, "post:edited");
        assert_eq!(stats(&conn).unwrap().bucket_activities, 2);
    }

    #[test]
    fn test_bounded_append_repeated_origin_in_one_batch() {
        let conn = test_db();
        let mut copy = item("aggregated:1", 1);
        copy.origin = Some(7);
        let outcome =
            bounded_append(&conn, &key("aggregated:1"), &[copy.clone(), copy], 15).unwrap();
        assert_eq!(outcome.result.inserted, 1);
        assert_eq!(outcome.result.upserted, 1);
        assert_eq!(stats(&conn).unwrap().bucket_activities, 1);
    }

    #[test]
    fn test_remove_last_item_then_sweep_deletes_bucket() {
        let conn = test_db();
        let outcome = bounded_append(&conn, &key("aggregated:1"), &[item("aggregated:1", 1)], 15)
            .unwrap();
        let id = outcome.activities[0].id;
        remove_activities(&conn, "aggregated:1", &[ActivitySelector::Id(id)]).unwrap();
        assert_eq!(sweep_empty_buckets(&conn).unwrap(), 1);
        assert!(find_buckets(&conn, "aggregated:1", &ActivityQuery::recent(10))
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_followers_ordered_by_priority() {
        let conn = test_db();
        for (follower, priority) in [("timeline:a", 5), ("timeline:b", 90), ("timeline:c", 30)] {
            insert_followship(
                &conn,
                &Followship {
                    follower: follower.into(),
                    followee: "user:1".into(),
                    priority,
                    created_at: Utc::now(),
                },
            )
            .unwrap();
        }
        let followers = followers_of(&conn, "user:1", 10, 0).unwrap();
        let names: Vec<&str> = followers.iter().map(|f| f.follower.as_str()).collect();
        assert_eq!(names, vec!["timeline:b", "timeline:c", "timeline:a"]);
        assert_eq!(followers_of(&conn, "user:1", 2, 2).unwrap().len(), 1);
    }

    #[test]
    fn test_follower_pages_stable_under_equal_priority_insert() {
        let conn = test_db();
        let follow = |follower: &str| {
            insert_followship(
                &conn,
                &Followship {
                    follower: follower.into(),
                    followee: "user:1".into(),
                    priority: 10,
                    created_at: Utc::now(),
                },
            )
            .unwrap();
        };
        for follower in ["timeline:b", "timeline:c", "timeline:d"] {
            follow(follower);
        }
        let names = |page: Vec<Followship>| -> Vec<String> {
            page.into_iter().map(|f| f.follower).collect()
        };
        let first = names(followers_of(&conn, "user:1", 2, 0).unwrap());
        assert_eq!(first, vec!["timeline:b", "timeline:c"]);

        // Sorts first by name, but joins the end of its priority band
        follow("timeline:a");
        let second = names(followers_of(&conn, "user:1", 2, 2).unwrap());
        assert_eq!(second, vec!["timeline:d", "timeline:a"]);
    }

    #[test]
    fn test_claim_respects_priority_and_lock() {
        let conn = test_db();
        let now = Utc::now();
        let low = enqueue_job(&conn, "fanout", "{}", -10, now).unwrap();
        let high = enqueue_job(&conn, "fanout", "{}", 20, now).unwrap();

        let claimed = claim_job(&conn, now, Duration::seconds(60)).unwrap().unwrap();
        assert_eq!(claimed.id, high);
        assert_eq!(claimed.attempts, 1);
        let claimed = claim_job(&conn, now, Duration::seconds(60)).unwrap().unwrap();
        assert_eq!(claimed.id, low);
        assert!(claim_job(&conn, now, Duration::seconds(60)).unwrap().is_none());

        // An expired lock makes the job claimable again
        let later = now + Duration::seconds(120);
        let reclaimed = claim_job(&conn, later, Duration::seconds(60)).unwrap().unwrap();
        assert_eq!(reclaimed.id, high);
        assert_eq!(reclaimed.attempts, 2);
    }
}

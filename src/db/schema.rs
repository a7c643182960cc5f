// Database schema — table creation and migrations.
//
// A `schema_version` table records the applied schema version; the current
// schema is version 1 and is created in one idempotent batch.
//
// Timestamps are stored as RFC 3339 text with millisecond precision (see
// models::format_timestamp), so text ordering equals time ordering.

use anyhow::{Context, Result};
use rusqlite::Connection;

/// Create all tables if they don't exist yet.
///
/// This is idempotent — safe to call on every startup.
pub fn create_tables(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        -- Tracks schema version for future migrations
        CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        -- Feeds are created lazily on first access
        CREATE TABLE IF NOT EXISTS feeds (
            id TEXT PRIMARY KEY,               -- '<group>:<target>'
            grp TEXT NOT NULL,
            target TEXT NOT NULL,
            kind TEXT NOT NULL,                -- flat / aggregated / notification
            realtime INTEGER NOT NULL DEFAULT 0,
            max_length INTEGER,                -- trim threshold, NULL = never trim
            aggregation TEXT,                  -- aggregation template override
            rank TEXT,                         -- bucket rank spec override
            seen_at TEXT,
            read_at TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            UNIQUE (grp, target)
        );

        -- Aggregation buckets. activity_count mirrors the number of items
        -- and is the column the bounded append conditions on.
        CREATE TABLE IF NOT EXISTS buckets (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            feed TEXT NOT NULL,
            grp TEXT NOT NULL,                 -- formatted aggregation template
            verb TEXT NOT NULL,
            activity_count INTEGER NOT NULL DEFAULT 0,
            seen_at TEXT,
            read_at TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        -- Activities of flat feeds (bucket_id NULL) and bucket items
        CREATE TABLE IF NOT EXISTS activities (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            feed TEXT NOT NULL,
            bucket_id INTEGER,                 -- owning bucket, NULL for flat feeds
            actor TEXT NOT NULL,
            verb TEXT NOT NULL,
            object TEXT NOT NULL,
            target TEXT,
            foreign_id TEXT,
            time TEXT NOT NULL,
            source TEXT,                       -- feed a copy came from
            origin INTEGER,                    -- root activity id of a copy
            popularity INTEGER NOT NULL DEFAULT 1,
            extra TEXT NOT NULL DEFAULT '{}',  -- free-form fields as JSON
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        -- Feeds an activity was carbon-copied into, for removal cascade
        CREATE TABLE IF NOT EXISTS activity_cc (
            activity_id INTEGER NOT NULL,
            feed TEXT NOT NULL,
            PRIMARY KEY (activity_id, feed)
        );

        CREATE TABLE IF NOT EXISTS followships (
            follower TEXT NOT NULL,
            followee TEXT NOT NULL,
            priority INTEGER NOT NULL DEFAULT 10,
            created_at TEXT NOT NULL,
            PRIMARY KEY (follower, followee)
        );

        -- Durable background jobs
        CREATE TABLE IF NOT EXISTS jobs (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL,
            payload TEXT NOT NULL,             -- JSON job payload
            priority INTEGER NOT NULL DEFAULT 0,
            status TEXT NOT NULL DEFAULT 'pending',
            attempts INTEGER NOT NULL DEFAULT 0,
            locked_until TEXT,
            last_error TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        -- Idempotency keys, unique per feed
        CREATE UNIQUE INDEX IF NOT EXISTS idx_activities_foreign
            ON activities(feed, foreign_id, time) WHERE foreign_id IS NOT NULL;
        CREATE UNIQUE INDEX IF NOT EXISTS idx_activities_origin
            ON activities(feed, origin) WHERE origin IS NOT NULL;

        -- Recency reads and trimming
        CREATE INDEX IF NOT EXISTS idx_activities_recency
            ON activities(feed, time DESC, id DESC);
        CREATE INDEX IF NOT EXISTS idx_activities_bucket
            ON activities(bucket_id);
        CREATE INDEX IF NOT EXISTS idx_activities_source
            ON activities(feed, source);

        -- Finding the open bucket for a key
        CREATE INDEX IF NOT EXISTS idx_buckets_key
            ON buckets(feed, grp, verb, activity_count);
        CREATE INDEX IF NOT EXISTS idx_buckets_recency
            ON buckets(feed, updated_at DESC, id DESC);

        -- Follower lookups by priority
        CREATE INDEX IF NOT EXISTS idx_followships_followee
            ON followships(followee, priority DESC);
        CREATE INDEX IF NOT EXISTS idx_followships_follower
            ON followships(follower, priority DESC);

        -- Claiming jobs
        CREATE INDEX IF NOT EXISTS idx_jobs_claim
            ON jobs(status, priority DESC, id);
        ",
    )
    .context("Failed to create database tables")?;

    // Record initial schema version if not already set
    conn.execute(
        "INSERT OR IGNORE INTO schema_version (version) VALUES (?1)",
        [1],
    )?;

    Ok(())
}

/// Count the number of tables in the database (useful for init confirmation).
pub fn table_count(conn: &Connection) -> Result<i64> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name NOT LIKE 'sqlite_%'",
        [],
        |row| row.get(0),
    )?;
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_tables_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        // Running create_tables twice should not error
        create_tables(&conn).unwrap();
        create_tables(&conn).unwrap();
    }

    #[test]
    fn test_table_count() {
        let conn = Connection::open_in_memory().unwrap();
        create_tables(&conn).unwrap();
        let count = table_count(&conn).unwrap();
        // schema_version, feeds, buckets, activities, activity_cc,
        // followships, jobs = 7 tables
        assert_eq!(count, 7i64);
    }

    #[test]
    fn test_foreign_id_is_unique_per_feed() {
        let conn = Connection::open_in_memory().unwrap();
        create_tables(&conn).unwrap();
        let insert = "INSERT INTO activities
            (feed, actor, verb, object, foreign_id, time, created_at, updated_at)
            VALUES (?1, 'user:1', 'post', 'post:1', 'fid', '2024-01-01T00:00:00.000Z', '', '')";
        conn.execute(insert, ["user:1"]).unwrap();
        assert!(conn.execute(insert, ["user:1"]).is_err());
        // The same key in another feed is a different activity
        conn.execute(insert, ["timeline:2"]).unwrap();
    }

    #[test]
    fn test_migrations_recorded_once() {
        let conn = Connection::open_in_memory().unwrap();
        create_tables(&conn).unwrap();
        create_tables(&conn).unwrap();
        create_tables(&conn).unwrap();

        let versions: Vec<i64> = conn
            .prepare("SELECT version FROM schema_version ORDER BY version")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .map(|r| r.unwrap())
            .collect();
        assert_eq!(versions, vec![1]);
    }
}

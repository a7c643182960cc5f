// Database layer — persistence for feeds, activities, buckets, followships
// and background jobs.
//
// SQLite (rusqlite, "bundled" so there's no system dependency) is the
// default backend; the file lives wherever FEEDMILL_DB_PATH points. With the
// `postgres` feature, a postgres:// DATABASE_URL selects PgStore instead.
// Everything above this module talks to `Arc<dyn FeedStore>`.

pub mod models;
#[cfg(feature = "postgres")]
pub mod postgres;
#[cfg(feature = "sqlite")]
pub mod queries;
#[cfg(feature = "sqlite")]
pub mod schema;
#[cfg(feature = "sqlite")]
pub mod sqlite;
pub mod traits;

pub use traits::FeedStore;

#[cfg(feature = "postgres")]
pub use postgres::PgStore;
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteStore;

#[cfg(feature = "sqlite")]
use anyhow::Context;
use anyhow::Result;
#[cfg(feature = "sqlite")]
use rusqlite::Connection;
#[cfg(feature = "sqlite")]
use std::path::Path;
use std::sync::Arc;

/// Open (or create) the SQLite database and run migrations.
///
/// This is the main entry point — called by `feedmill init`.
#[cfg(feature = "sqlite")]
pub fn initialize(db_path: &str) -> Result<Connection> {
    // Create parent directories if needed
    if let Some(parent) = Path::new(db_path).parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory for database: {db_path}"))?;
        }
    }

    let conn = Connection::open(db_path)
        .with_context(|| format!("Failed to open database at {db_path}"))?;

    // Enable WAL mode for better concurrent read performance
    conn.pragma_update(None, "journal_mode", "WAL")?;

    schema::create_tables(&conn)?;

    Ok(conn)
}

/// Open an existing SQLite database (fails if it doesn't exist yet).
///
/// Migrations still run so a database created by an older build picks up
/// new tables.
#[cfg(feature = "sqlite")]
pub fn open(db_path: &str) -> Result<Connection> {
    if !Path::new(db_path).exists() {
        anyhow::bail!(
            "Database not found at {}. Run `feedmill init` first.",
            db_path
        );
    }

    let conn = Connection::open(db_path)
        .with_context(|| format!("Failed to open database at {db_path}"))?;

    conn.pragma_update(None, "journal_mode", "WAL")?;
    schema::create_tables(&conn)?;

    Ok(conn)
}

/// True when the URL selects the PostgreSQL backend.
pub fn is_postgres_url(url: &str) -> bool {
    url.starts_with("postgres://") || url.starts_with("postgresql://")
}

/// Connect to whichever backend the configuration selects.
///
/// `create` controls whether a missing SQLite file is created (`init`) or
/// reported as an error (every other command).
pub async fn connect(
    database_url: Option<&str>,
    db_path: &str,
    create: bool,
) -> Result<Arc<dyn FeedStore>> {
    if let Some(url) = database_url.filter(|u| is_postgres_url(u)) {
        return connect_postgres(url).await;
    }

    #[cfg(feature = "sqlite")]
    {
        let conn = if create {
            initialize(db_path)?
        } else {
            open(db_path)?
        };
        Ok(Arc::new(SqliteStore::new(conn)))
    }

    #[cfg(not(feature = "sqlite"))]
    {
        let _ = (db_path, create);
        anyhow::bail!("SQLite support is disabled; set DATABASE_URL to a postgres:// URL")
    }
}

#[cfg(feature = "postgres")]
async fn connect_postgres(url: &str) -> Result<Arc<dyn FeedStore>> {
    Ok(Arc::new(PgStore::connect(url).await?))
}

#[cfg(not(feature = "postgres"))]
async fn connect_postgres(_url: &str) -> Result<Arc<dyn FeedStore>> {
    anyhow::bail!("DATABASE_URL points at PostgreSQL but this build lacks the `postgres` feature")
}

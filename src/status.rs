// System status display — backend, row counts and job queue health.

use anyhow::Result;
use colored::Colorize;
use std::path::Path;
use std::sync::Arc;

use crate::config::Config;
use crate::db::FeedStore;

/// Display system status to the terminal.
pub async fn show(store: &Arc<dyn FeedStore>, config: &Config) -> Result<()> {
    println!("Backend: {}", config.backend_label());
    if config.database_url.is_none() {
        let file_size = std::fs::metadata(&config.db_path)
            .map(|m| format_bytes(m.len()))
            .unwrap_or_else(|_| "unknown".to_string());
        println!("Database file: {file_size}");
    }

    let stats = store.stats().await?;
    println!("Feeds: {}", stats.feeds);
    println!("Activities: {} in flat feeds", stats.activities);
    println!(
        "Aggregation buckets: {} holding {} activities",
        stats.buckets, stats.bucket_activities
    );
    println!("Followships: {}", stats.followships);

    let failed = if stats.jobs_failed > 0 {
        stats.jobs_failed.to_string().red().to_string()
    } else {
        stats.jobs_failed.to_string()
    };
    println!(
        "Jobs: {} pending, {} running, {} failed",
        stats.jobs_pending, stats.jobs_running, failed
    );
    if stats.jobs_pending > 0 {
        println!("  Run `feedmill work --once` to process them");
    }

    Ok(())
}

/// True when the SQLite file has not been created yet.
pub fn needs_init(config: &Config) -> bool {
    config.database_url.is_none() && !Path::new(&config.db_path).exists()
}

fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(2048), "2.0 KB");
        assert_eq!(format_bytes(3 * 1024 * 1024), "3.0 MB");
    }
}

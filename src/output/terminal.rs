// Colored terminal output for feed contents and follower lists.
//
// main.rs display calls delegate here so command handlers stay about
// what to do, not how it looks.

use colored::Colorize;

use crate::db::models::{Activity, AggregationBucket, BulkWriteResult, Feed, FeedItems};
use crate::followship::{PriorityTier, TieredFollowers};

/// Display a feed header followed by its items.
pub fn display_feed(feed: &Feed, items: &FeedItems) {
    println!(
        "\n{}",
        format!("=== {} ({}) ===", feed.id, feed.kind).bold()
    );
    if let Some(max) = feed.max_length {
        println!("  {}", format!("maxLength {max}").dimmed());
    }

    match items {
        FeedItems::Flat(activities) if activities.is_empty() => println!("  (empty)"),
        FeedItems::Aggregated(buckets) if buckets.is_empty() => println!("  (empty)"),
        FeedItems::Flat(activities) => {
            for activity in activities {
                display_activity(activity, "  ");
            }
        }
        FeedItems::Aggregated(buckets) => {
            for bucket in buckets {
                display_bucket(bucket);
            }
        }
    }
    println!();
}

fn display_activity(activity: &Activity, indent: &str) {
    let mut line = format!(
        "{indent}#{:<6} {} {} {}",
        activity.id,
        activity.actor,
        activity.verb.cyan(),
        super::truncate_chars(&activity.object, 60)
    );
    if let Some(source) = &activity.source {
        line.push_str(&format!(" {}", format!("via {source}").dimmed()));
    }
    println!("{line}");
    println!(
        "{indent}        {}",
        activity.time.format("%Y-%m-%d %H:%M:%S").to_string().dimmed()
    );
}

fn display_bucket(bucket: &AggregationBucket) {
    let unseen = if bucket.seen_at.is_none() {
        " new".yellow().to_string()
    } else {
        String::new()
    };
    println!(
        "  [{}] {} {} by {}{}",
        bucket.id,
        bucket.group.bold(),
        format!("({} activities)", bucket.activities.len()).dimmed(),
        summarize(&bucket.actors, 3),
        unseen
    );
    for activity in &bucket.activities {
        display_activity(activity, "      ");
    }
}

/// "a, b, c and 4 others"
fn summarize(values: &[String], shown: usize) -> String {
    if values.len() <= shown {
        return values.join(", ");
    }
    format!(
        "{} and {} others",
        values[..shown].join(", "),
        values.len() - shown
    )
}

/// Display one page of followers or followees by tier.
pub fn display_tiers(title: &str, page: &TieredFollowers) {
    println!("\n{}", format!("=== {title} ({}) ===", page.len()).bold());
    if page.is_empty() {
        println!("  (none)");
        return;
    }
    for (tier, feeds) in page.by_priority() {
        println!("  {}", colorize_tier(tier));
        for feed in feeds {
            println!("    {feed}");
        }
    }
    if page.has_more {
        println!("  {}", "more available, use --offset".dimmed());
    }
}

/// One-line summary of a bulk write, with each failure listed beneath.
pub fn display_write_result(action: &str, result: &BulkWriteResult) {
    let mut parts = Vec::new();
    for (label, n) in [
        ("inserted", result.inserted),
        ("upserted", result.upserted),
        ("modified", result.modified),
        ("removed", result.removed),
    ] {
        if n > 0 {
            parts.push(format!("{n} {label}"));
        }
    }
    if parts.is_empty() {
        parts.push("nothing changed".to_string());
    }
    println!("{action}: {}", parts.join(", "));
    for failure in &result.failures {
        println!(
            "  {} item {}: {}",
            "failed".red(),
            failure.index,
            failure.message
        );
    }
}

fn colorize_tier(tier: PriorityTier) -> colored::ColoredString {
    match tier {
        PriorityTier::Highest => tier.as_str().red().bold(),
        PriorityTier::High => tier.as_str().bright_red(),
        PriorityTier::Normal => tier.as_str().yellow(),
        PriorityTier::Low => tier.as_str().green(),
        PriorityTier::Lowest => tier.as_str().dimmed(),
    }
}

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use colored::Colorize;
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::info;

use feedmill::activity::selector_from_parts;
use feedmill::config::Config;
use feedmill::db::models::{ActivityQuery, FeedSettings, NewActivity};
use feedmill::db::FeedStore;
use feedmill::jobs::JobRunner;
use feedmill::output::terminal;
use feedmill::service::FeedService;

/// feedmill: activity feed fan-out and aggregation engine.
///
/// Publishes activities into feeds, pushes them to the feeds that follow
/// them, and groups them into bounded buckets on aggregated and
/// notification feeds.
#[derive(Parser)]
#[command(name = "feedmill", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database
    Init,

    /// Publish an activity to a feed (e.g. user:42)
    Publish {
        feed: String,
        actor: String,
        verb: String,
        object: String,

        #[arg(long)]
        target: Option<String>,

        /// External id; re-publishing the same id and time updates in place
        #[arg(long, requires = "time")]
        foreign_id: Option<String>,

        /// Event time (RFC 3339), defaults to now
        #[arg(long)]
        time: Option<DateTime<Utc>>,

        /// Extra feeds to copy the activity into (repeatable)
        #[arg(long)]
        cc: Vec<String>,

        #[arg(long)]
        popularity: Option<i64>,

        /// Free-form fields as a JSON object, e.g. '{"message":"hi"}'
        #[arg(long)]
        extra: Option<String>,
    },

    /// Remove an activity by id, or by foreign id and time
    Remove {
        feed: String,

        #[arg(long, conflicts_with = "foreign_id")]
        id: Option<i64>,

        #[arg(long)]
        foreign_id: Option<String>,

        #[arg(long)]
        time: Option<DateTime<Utc>>,
    },

    /// Make FEED follow TARGET and backfill its recent activities
    Follow {
        feed: String,
        target: String,

        /// Follow priority (default: 10); higher is delivered first
        #[arg(long)]
        priority: Option<i32>,
    },

    /// Make FEED stop following SOURCE and purge the copied activities
    Unfollow {
        feed: String,
        source: String,

        /// Keep the activities already copied from SOURCE
        #[arg(long)]
        keep_history: bool,
    },

    /// Show a feed's activities (or buckets)
    Feed {
        feed: String,

        #[arg(long, default_value = "25")]
        limit: usize,

        #[arg(long, default_value = "0")]
        offset: usize,

        #[arg(long)]
        verb: Option<String>,

        #[arg(long)]
        actor: Option<String>,

        /// Print JSON instead of the colored listing
        #[arg(long)]
        json: bool,
    },

    /// List a feed's followers by priority tier
    Followers {
        feed: String,

        /// List the feeds FEED follows instead
        #[arg(long)]
        followees: bool,

        #[arg(long, default_value = "100")]
        limit: usize,

        #[arg(long, default_value = "0")]
        offset: usize,
    },

    /// Change a feed's settings
    Configure {
        feed: String,

        #[arg(long)]
        max_length: Option<u32>,

        #[arg(long)]
        realtime: Option<bool>,

        /// Aggregation template, e.g. '${verb}-${actor}-${time}'
        #[arg(long)]
        aggregation: Option<String>,

        /// Bucket rank, e.g. -updated_at or popularity
        #[arg(long)]
        rank: Option<String>,
    },

    /// Mark buckets of a notification feed as seen (all when none given)
    Seen { feed: String, buckets: Vec<i64> },

    /// Mark buckets of a notification feed as read (all when none given)
    Read { feed: String, buckets: Vec<i64> },

    /// Run the background job worker
    Work {
        /// Drain the queue and exit instead of polling
        #[arg(long)]
        once: bool,
    },

    /// Show system status (row counts, job queue)
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (silently ignore if missing)
    let _ = dotenvy::dotenv();

    // Set up structured logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("feedmill=info")),
        )
        .init();

    let cli = Cli::parse();
    let config = Config::load()?;

    match cli.command {
        Commands::Init => {
            info!("Initializing feedmill database...");
            let store = connect(&config, true).await?;
            let table_count = store.table_count().await?;
            println!("Database initialized: {}", config.backend_label());
            println!("Tables created: {table_count}");
            println!("\nNext: publish something, e.g.");
            println!("  feedmill publish user:1 user:1 post post:1");
        }

        Commands::Publish {
            feed,
            actor,
            verb,
            object,
            target,
            foreign_id,
            time,
            cc,
            popularity,
            extra,
        } => {
            let service = open_service(&config).await?;
            let mut activity = NewActivity::new(&actor, &verb, &object);
            activity.target = target;
            activity.foreign_id = foreign_id;
            activity.time = time;
            activity.cc = cc;
            activity.popularity = popularity;
            if let Some(raw) = extra {
                activity.extra = serde_json::from_str::<Map<String, Value>>(&raw)
                    .context("--extra must be a JSON object")?;
            }

            let outcome = service.create_activity(&feed, vec![activity]).await?;
            terminal::display_write_result("Published", &outcome.result);
            for activity in &outcome.activities {
                println!("  id {} in {}", activity.id.to_string().bold(), activity.feed);
            }
        }

        Commands::Remove {
            feed,
            id,
            foreign_id,
            time,
        } => {
            let service = open_service(&config).await?;
            let selector = selector_from_parts(id, foreign_id.as_deref(), time)?;
            let outcome = service.remove_activity(&feed, vec![selector]).await?;
            terminal::display_write_result("Removed", &outcome.result);
        }

        Commands::Follow {
            feed,
            target,
            priority,
        } => {
            let service = open_service(&config).await?;
            if service.follow(&feed, &target, priority).await? {
                println!("{} now follows {}", feed.bold(), target.bold());
                println!("{}", "Backfill scheduled; run `feedmill work --once`.".dimmed());
            } else {
                println!("{feed} already follows {target}");
            }
        }

        Commands::Unfollow {
            feed,
            source,
            keep_history,
        } => {
            let service = open_service(&config).await?;
            let keep = keep_history.then_some(true);
            if service.unfollow(&feed, &source, keep).await? {
                println!("{} no longer follows {}", feed.bold(), source.bold());
            } else {
                println!("{feed} does not follow {source}");
            }
        }

        Commands::Feed {
            feed,
            limit,
            offset,
            verb,
            actor,
            json,
        } => {
            let service = open_service(&config).await?;
            let query = ActivityQuery {
                limit,
                offset,
                verb,
                actor,
                source: None,
            };
            let record = service.get_or_create_feed(&feed).await?;
            let items = service.find_activities(&feed, &query).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&items)?);
            } else {
                terminal::display_feed(&record, &items);
            }
        }

        Commands::Followers {
            feed,
            followees,
            limit,
            offset,
        } => {
            let service = open_service(&config).await?;
            if followees {
                let page = service.followees(&feed, limit, offset).await?;
                terminal::display_tiers(&format!("{feed} follows"), &page);
            } else {
                let page = service.followers(&feed, limit, offset).await?;
                terminal::display_tiers(&format!("Followers of {feed}"), &page);
            }
        }

        Commands::Configure {
            feed,
            max_length,
            realtime,
            aggregation,
            rank,
        } => {
            let service = open_service(&config).await?;
            let settings = FeedSettings {
                realtime,
                max_length,
                aggregation,
                rank,
            };
            let updated = service.configure_feed(&feed, &settings).await?;
            println!("{}", serde_json::to_string_pretty(&updated)?);
        }

        Commands::Seen { feed, buckets } => {
            let service = open_service(&config).await?;
            let marked = service.mark_seen(&feed, &buckets).await?;
            println!("Marked {marked} buckets seen");
        }

        Commands::Read { feed, buckets } => {
            let service = open_service(&config).await?;
            let marked = service.mark_read(&feed, &buckets).await?;
            println!("Marked {marked} buckets read");
        }

        Commands::Work { once } => {
            let store = connect(&config, false).await?;
            let settings = config.engine_settings();
            let service = Arc::new(FeedService::new(store.clone(), &settings));
            let runner = JobRunner::new(store, service, &settings);
            if once {
                let summary = runner.drain().await?;
                println!(
                    "Jobs: {} completed, {} retried, {} failed",
                    summary.completed.to_string().green(),
                    summary.retried,
                    if summary.failed > 0 {
                        summary.failed.to_string().red()
                    } else {
                        summary.failed.to_string().normal()
                    }
                );
            } else {
                runner
                    .run(async {
                        let _ = tokio::signal::ctrl_c().await;
                    })
                    .await?;
            }
        }

        Commands::Status => {
            if feedmill::status::needs_init(&config) {
                println!("Database: not initialized");
                println!("\nRun `feedmill init` to set up the database.");
                return Ok(());
            }
            let store = connect(&config, false).await?;
            feedmill::status::show(&store, &config).await?;
        }
    }

    Ok(())
}

/// Select the database backend based on configuration.
///
/// When DATABASE_URL points to PostgreSQL, uses the Postgres backend
/// (requires the `postgres` feature). Otherwise, falls back to SQLite.
async fn connect(config: &Config, create: bool) -> Result<Arc<dyn FeedStore>> {
    if config.database_url.is_some() {
        info!(backend = %config.backend_label(), "connecting");
    }
    feedmill::db::connect(config.database_url.as_deref(), &config.db_path, create).await
}

async fn open_service(config: &Config) -> Result<FeedService> {
    let store = connect(config, false).await?;
    Ok(FeedService::new(store, &config.engine_settings()))
}

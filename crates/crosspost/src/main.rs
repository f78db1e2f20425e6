//! crosspost: scheduled short-form content pipeline
//!
//! Main binary with subcommands:
//! - `run`: One pipeline run now
//! - `daemon`: Scheduler loop posting at the configured times
//! - `stats` / `export`: Analytics over published posts
//! - `schedule`: Manage the schedule book
//! - `approve` / `reject`: Decide on runs waiting for approval

use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use miette::{Result, miette};
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crosspost_analytics::{ContentId, FeedbackEngine};
use crosspost_pipeline::{Decision, RunOutcome};
use crosspost_scheduler::Trigger;

mod approvals;
mod daemon;
mod http;
mod schedule_book;
mod settings;

use approvals::ApprovalInbox;
use schedule_book::{BookTrigger, ScheduleBook};
use settings::Settings;

#[derive(Parser)]
#[command(name = "crosspost")]
#[command(about = "Scheduled short-form content pipeline", long_about = None)]
struct Cli {
    /// Path to the TOML config file
    #[arg(long, global = true, env = "CROSSPOST_CONFIG")]
    config: Option<PathBuf>,

    /// Log level used when RUST_LOG is not set
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Discover and run one candidate now
    Run {
        /// Run every stage except publishing
        #[arg(long)]
        dry_run: bool,

        /// Bearer token for the publisher
        #[arg(long, env = "CROSSPOST_PUBLISH_TOKEN", hide_env_values = true)]
        publish_token: Option<String>,
    },

    /// Run the scheduler until interrupted
    Daemon {
        /// Run every stage except publishing
        #[arg(long)]
        dry_run: bool,

        /// Bearer token for the publisher
        #[arg(long, env = "CROSSPOST_PUBLISH_TOKEN", hide_env_values = true)]
        publish_token: Option<String>,
    },

    /// Show engagement statistics and optimization insights
    Stats {
        /// How many top posts, hours and tags to show
        #[arg(long, default_value = "5")]
        top: usize,
    },

    /// Dump statistics and every post as JSON
    Export {
        /// Write to this file instead of stdout
        #[arg(long, short)]
        output: Option<PathBuf>,
    },

    /// Manage the schedule book
    Schedule {
        #[command(subcommand)]
        command: ScheduleCommand,
    },

    /// Approve a run waiting for approval
    Approve {
        #[arg(value_name = "CONTENT_ID")]
        content_id: String,
    },

    /// Reject a run waiting for approval
    Reject {
        #[arg(value_name = "CONTENT_ID")]
        content_id: String,
    },
}

#[derive(Subcommand)]
enum ScheduleCommand {
    /// List configured post times and booked schedules
    List,

    /// Book a recurring schedule
    Add {
        #[arg(long)]
        name: String,

        /// Comma-separated HH:MM times of day
        #[arg(long, value_delimiter = ',', required = true)]
        times: Vec<String>,

        /// IANA timezone, defaults to the configured schedule timezone
        #[arg(long)]
        timezone: Option<String>,
    },

    /// Book a one-shot run
    Once {
        #[arg(long)]
        name: String,

        /// RFC 3339 instant, e.g. 2026-05-01T19:00:00Z
        #[arg(long)]
        at: DateTime<Utc>,
    },

    /// Remove a booked schedule by id or unique id prefix
    Cancel {
        #[arg(value_name = "ID")]
        id: String,
    },

    /// Suggest post times from past engagement
    Suggest {
        #[arg(long, default_value = "3")]
        limit: usize,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| format!("crosspost={}", cli.log_level)),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let settings = Settings::load(cli.config.as_deref()).map_err(|e| miette!("{}", e))?;

    match cli.command {
        Commands::Run {
            dry_run,
            publish_token,
        } => run_single(settings, publish_token, dry_run).await,

        Commands::Daemon {
            dry_run,
            publish_token,
        } => daemon::run(settings, publish_token, dry_run).await,

        Commands::Stats { top } => show_stats(&settings, top).await,

        Commands::Export { output } => export(&settings, output).await,

        Commands::Schedule { command } => schedule(&settings, command).await,

        Commands::Approve { content_id } => decide(&settings, content_id, Decision::Approve).await,

        Commands::Reject { content_id } => decide(&settings, content_id, Decision::Reject).await,
    }
}

async fn run_single(settings: Settings, publish_token: Option<String>, dry_run: bool) -> Result<()> {
    settings.validate().map_err(|e| miette!("{}", e))?;

    let config = Arc::new(settings.pipeline_config(dry_run));
    let runtime = daemon::Runtime::open(&settings, publish_token).await?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let interrupt_tx = shutdown_tx.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("received shutdown signal");
            let _ = interrupt_tx.send(true);
        }
    });

    let poller = config.approval.enabled.then(|| {
        daemon::spawn_approval_poller(
            ApprovalInbox::new(settings.storage.approvals_dir()),
            runtime.pipeline.approvals().clone(),
            std::time::Duration::from_secs(settings.pipeline.approval_poll_secs),
            shutdown_rx.clone(),
        )
    });

    let result = runtime.pipeline.run_once(config, shutdown_rx).await;

    let _ = shutdown_tx.send(true);
    if let Some(poller) = poller {
        let _ = poller.await;
    }

    let Some(run) = result.map_err(|e| miette!("{}", e))? else {
        println!("No eligible candidates found.");
        return Ok(());
    };

    match &run.outcome {
        Some(RunOutcome::Published(receipt)) => {
            println!("Published {} as {}", run.content_id, receipt.url);
            Ok(())
        }
        Some(RunOutcome::Skipped(reason)) => {
            println!("Skipped {}: {}", run.content_id, reason);
            Ok(())
        }
        Some(RunOutcome::Failed { reason, detail }) => {
            if run.needs_attention {
                eprintln!("Run for {} needs operator attention.", run.content_id);
            }
            Err(miette!("run for {} failed: {}: {}", run.content_id, reason, detail))
        }
        None => Err(miette!("run for {} did not finish", run.content_id)),
    }
}

async fn show_stats(settings: &Settings, top: usize) -> Result<()> {
    let store = daemon::open_store(settings).await?;
    let engine = FeedbackEngine::new(
        store,
        settings.analytics_config().map_err(|e| miette!("{}", e))?,
    );

    let stats = engine.statistics().await.map_err(|e| miette!("{}", e))?;
    println!("\n=== Analytics Statistics ===\n");
    println!("total posts:            {}", stats.total_posts);
    println!("ranked posts:           {}", stats.ranked_posts);
    println!("total likes:            {}", stats.total_likes);
    println!("total comments:         {}", stats.total_comments);
    println!("total views:            {}", stats.total_views);
    println!("total engagement:       {}", stats.total_engagement);
    println!("mean engagement rate:   {:.2}%", stats.mean_engagement_rate);
    println!("avg likes per post:     {:.1}", stats.avg_likes_per_post);
    println!("avg comments per post:  {:.1}", stats.avg_comments_per_post);
    println!("avg views per post:     {:.1}", stats.avg_views_per_post);
    println!(
        "runs:                   {} published, {} skipped, {} failed",
        stats.runs.published, stats.runs.skipped, stats.runs.failed
    );

    let best = engine
        .best_performing_posts(top)
        .await
        .map_err(|e| miette!("{}", e))?;
    if !best.is_empty() {
        println!("\n=== Best Performing Posts ===\n");
        for (i, post) in best.iter().enumerate() {
            println!("{}. {}", i + 1, post.source_title);
            println!(
                "   Engagement: {:.2}%",
                post.engagement_rate().unwrap_or_default()
            );
            println!(
                "   Likes: {}, Comments: {}, Views: {}",
                post.engagement.likes, post.engagement.comments, post.engagement.views
            );
            println!("   URL: {}\n", post.url);
        }
    }

    if settings.analytics.enabled {
        let slots = engine
            .best_time_slots(top)
            .await
            .map_err(|e| miette!("{}", e))?;
        let tags = engine
            .best_hashtags(top * 2)
            .await
            .map_err(|e| miette!("{}", e))?;

        if !slots.is_empty() || !tags.is_empty() {
            println!("=== Optimization Insights ===\n");
        }
        if !slots.is_empty() {
            let times: Vec<String> = slots.iter().map(|s| s.time_of_day()).collect();
            println!(
                "Best posting times ({}): {}",
                engine.config().reporting_timezone,
                times.join(", ")
            );
        }
        if !tags.is_empty() {
            let tags: Vec<&str> = tags.iter().map(|t| t.tag.as_str()).collect();
            println!("Best hashtags: {}", tags.join(" "));
        }
    }

    Ok(())
}

async fn export(settings: &Settings, output: Option<PathBuf>) -> Result<()> {
    let store = daemon::open_store(settings).await?;
    let engine = FeedbackEngine::new(
        store,
        settings.analytics_config().map_err(|e| miette!("{}", e))?,
    );

    let export = engine.export().await.map_err(|e| miette!("{}", e))?;
    let json = serde_json::to_string_pretty(&export)
        .map_err(|e| miette!("failed to encode export: {}", e))?;

    match output {
        Some(path) => {
            tokio::fs::write(&path, json)
                .await
                .map_err(|e| miette!("failed to write {}: {}", path.display(), e))?;
            println!("Exported {} posts to {}", export.posts.len(), path.display());
        }
        None => println!("{}", json),
    }
    Ok(())
}

async fn schedule(settings: &Settings, command: ScheduleCommand) -> Result<()> {
    let mut book =
        ScheduleBook::load(settings.storage.schedules_path()).map_err(|e| miette!("{}", e))?;
    let now = Utc::now();

    match command {
        ScheduleCommand::List => {
            if settings.schedule.enabled {
                let times = settings.schedule.effective_times();
                println!(
                    "configured: {} ({})",
                    times.join(", "),
                    settings.schedule.timezone
                );
            } else {
                println!("configured: disabled");
            }

            if book.entries().is_empty() {
                println!("no booked schedules");
            }
            for entry in book.entries() {
                let next = entry
                    .trigger
                    .to_trigger()
                    .ok()
                    .and_then(|t| t.next_after(now))
                    .map(|at| at.to_rfc3339())
                    .unwrap_or_else(|| "never".to_string());
                let when = match &entry.trigger {
                    BookTrigger::Recurring { times, timezone } => {
                        format!("daily at {} ({})", times.join(", "), timezone)
                    }
                    BookTrigger::Once { at } => format!("once at {}", at.to_rfc3339()),
                };
                println!("{}  {}  {}  next: {}", entry.id, entry.name, when, next);
            }
        }

        ScheduleCommand::Add {
            name,
            times,
            timezone,
        } => {
            let timezone = timezone.unwrap_or_else(|| settings.schedule.timezone.clone());
            let entry = book
                .add(name, BookTrigger::Recurring { times, timezone }, now)
                .map_err(|e| miette!("{}", e))?;
            println!("Booked {} ({})", entry.name, entry.id);
        }

        ScheduleCommand::Once { name, at } => {
            let entry = book
                .add(name, BookTrigger::Once { at }, now)
                .map_err(|e| miette!("{}", e))?;
            println!("Booked {} ({}) for {}", entry.name, entry.id, at.to_rfc3339());
        }

        ScheduleCommand::Cancel { id } => {
            let entry = book.remove(&id).map_err(|e| miette!("{}", e))?;
            println!("Cancelled {} ({})", entry.name, entry.id);
        }

        ScheduleCommand::Suggest { limit } => {
            let store = daemon::open_store(settings).await?;
            let engine = FeedbackEngine::new(
                store,
                settings.analytics_config().map_err(|e| miette!("{}", e))?,
            );
            let slots = engine
                .best_time_slots(limit)
                .await
                .map_err(|e| miette!("{}", e))?;

            if slots.is_empty() {
                println!("Not enough engagement data to suggest times yet.");
                return Ok(());
            }

            let times: Vec<String> = slots.iter().map(|s| s.time_of_day()).collect();
            // Suggestions must be valid input for `schedule add`.
            Trigger::times_of_day(&times, &engine.config().reporting_timezone.to_string())
                .map_err(|e| miette!("{}", e))?;

            for slot in &slots {
                println!(
                    "{}  score {:.2}  mean rate {:.2}%  posts {}",
                    slot.time_of_day(),
                    slot.score,
                    slot.mean_rate,
                    slot.samples
                );
            }
            println!(
                "\ncrosspost schedule add --name suggested --times {} --timezone {}",
                times.join(","),
                engine.config().reporting_timezone
            );
        }
    }

    Ok(())
}

async fn decide(settings: &Settings, content_id: String, decision: Decision) -> Result<()> {
    let inbox = ApprovalInbox::new(settings.storage.approvals_dir());
    let content_id = ContentId::from(content_id);
    let path = inbox
        .submit(&content_id, decision)
        .await
        .map_err(|e| miette!("{}", e))?;

    let verb = match decision {
        Decision::Approve => "Approved",
        Decision::Reject => "Rejected",
    };
    info!(path = %path.display(), "wrote decision");
    println!(
        "{} {}; a running daemon picks this up within {}s.",
        verb, content_id, settings.pipeline.approval_poll_secs
    );
    Ok(())
}

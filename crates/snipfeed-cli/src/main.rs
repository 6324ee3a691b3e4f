mod app;
mod run;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use serde::Serialize;

use snipfeed_cron::AddFeedOptions;
use snipfeed_cron::schedule;

#[derive(Parser)]
#[command(name = "snipfeed", about = "Periodic RSS/Atom feed fetch scheduler")]
struct Cli {
    /// Config file (defaults to ~/.snipfeed/config.json5)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Directory for schedules.json and feeds.json (overrides config)
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start tracking a feed
    Add {
        url: String,

        /// Cron expression (e.g. "*/30 * * * *")
        #[arg(short, long)]
        interval: Option<String>,

        #[arg(short, long)]
        title: Option<String>,

        /// Register the feed without scheduling it
        #[arg(long)]
        disabled: bool,
    },
    /// Stop tracking a feed
    Remove { id: String },
    /// Change a feed's cron expression
    Update { id: String, interval: String },
    /// Enable a feed
    Enable { id: String },
    /// Disable a feed
    Disable { id: String },
    /// List scheduled feeds
    List,
    /// Show scheduler status
    Status,
    /// Show update statistics
    Stats {
        /// Zero the counters
        #[arg(long)]
        reset: bool,
    },
    /// Refresh a feed now
    Refresh { id: String },
    /// Check a cron expression
    Validate { expression: String },
    /// Run the scheduler until Ctrl-C
    Run,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    if let Commands::Validate { expression } = &cli.command {
        return validate(expression);
    }

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        let app = app::App::load(cli.config.as_deref(), cli.data_dir)?;
        let scheduler = &app.scheduler;

        match cli.command {
            Commands::Add {
                url,
                interval,
                title,
                disabled,
            } => {
                let added = scheduler
                    .add_feed(
                        &url,
                        AddFeedOptions {
                            interval,
                            title,
                            enabled: !disabled,
                        },
                    )
                    .await?;
                print_json(&added)?;
            }
            Commands::Remove { id } => {
                scheduler.remove_feed(&id).await?;
                print_json(&serde_json::json!({ "removed": id }))?;
            }
            Commands::Update { id, interval } => {
                let next_run = scheduler.update_feed_schedule(&id, &interval)?;
                print_json(&serde_json::json!({
                    "feed_id": id,
                    "interval": interval,
                    "next_run": next_run,
                }))?;
            }
            Commands::Enable { id } => print_json(&scheduler.set_feed_enabled(&id, true)?)?,
            Commands::Disable { id } => print_json(&scheduler.set_feed_enabled(&id, false)?)?,
            Commands::List => print_json(&app::describe_feeds(&scheduler.list_scheduled_feeds()))?,
            Commands::Status => print_json(&scheduler.get_status())?,
            Commands::Stats { reset } => {
                if reset {
                    scheduler.reset_stats();
                }
                print_json(&scheduler.get_update_stats())?;
            }
            Commands::Refresh { id } => {
                let outcome = scheduler.refresh_feed(&id).await?;
                print_json(&outcome)?;
                if !outcome.is_success() {
                    anyhow::bail!("refresh of {id} failed");
                }
            }
            Commands::Run => run::run(scheduler).await?,
            Commands::Validate { .. } => {}
        }

        app.close();
        anyhow::Ok(())
    })
}

fn validate(expression: &str) -> anyhow::Result<()> {
    match schedule::validate(expression) {
        Ok(()) => {
            let next_run = schedule::CronSchedule::parse(expression)
                .ok()
                .and_then(|s| s.next_run());
            print_json(&serde_json::json!({
                "valid": true,
                "description": schedule::describe(expression),
                "next_run": next_run,
            }))
        }
        Err(reasons) => {
            print_json(&serde_json::json!({ "valid": false, "reasons": reasons }))?;
            anyhow::bail!("invalid cron expression '{expression}'")
        }
    }
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

//! Foreground engine loop for `snipfeed run`.

use std::time::Duration;

use tracing::{info, warn};

use snipfeed_cron::FeedScheduler;

/// How often the loop logs a status line.
const STATUS_INTERVAL: Duration = Duration::from_secs(15 * 60);

/// Start the engine and keep it running until Ctrl-C.
pub async fn run(scheduler: &FeedScheduler) -> anyhow::Result<()> {
    if !scheduler.start() {
        warn!("Scheduler was already running");
    }
    let status = scheduler.get_status();
    info!(
        feeds = status.scheduled_feeds,
        jobs = status.active_jobs,
        "snipfeed running, press Ctrl-C to stop"
    );

    let mut ticker = tokio::time::interval(STATUS_INTERVAL);
    ticker.tick().await;
    loop {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result?;
                info!("Shutting down");
                break;
            }
            _ = ticker.tick() => {
                let stats = scheduler.get_update_stats();
                info!(
                    feeds = stats.total_feeds,
                    successful = stats.successful_updates,
                    failed = stats.failed_updates,
                    "Scheduler status"
                );
            }
        }
    }

    scheduler.stop();
    Ok(())
}

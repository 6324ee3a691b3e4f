//! Wiring: config, stores, fetcher and scheduler for one CLI invocation.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, warn};

use snipfeed_config::SnipfeedConfig;
use snipfeed_cron::{FeedScheduler, ScheduleRecord, ScheduleStore, schedule};
use snipfeed_feeds::{HttpFeedFetcher, JsonFeedStore};

const SCHEDULES_FILE: &str = "schedules.json";
const FEEDS_FILE: &str = "feeds.json";

pub struct App {
    pub scheduler: FeedScheduler,
}

impl App {
    pub fn load(config_path: Option<&Path>, data_dir: Option<PathBuf>) -> anyhow::Result<Self> {
        let config = match config_path {
            Some(path) => snipfeed_config::load_config_from(path),
            None => snipfeed_config::load_config(),
        }
        .context("Failed to load config")?;

        let data_dir = match data_dir {
            Some(dir) => dir,
            None => config.store.resolve_data_dir()?,
        };
        debug!("Using data directory {}", data_dir.display());

        Ok(Self {
            scheduler: build_scheduler(&config, &data_dir)?,
        })
    }

    /// Stop the engine and flush schedules to disk.
    pub fn close(&self) {
        if let Err(e) = self.scheduler.close() {
            warn!("Failed to save schedules on close: {e}");
        }
    }
}

fn build_scheduler(config: &SnipfeedConfig, data_dir: &Path) -> anyhow::Result<FeedScheduler> {
    let fetcher = HttpFeedFetcher::new(&config.fetcher).context("Failed to build HTTP client")?;
    let feeds = JsonFeedStore::open(&data_dir.join(FEEDS_FILE), config.store.max_items_per_feed)
        .context("Failed to open feed store")?;
    let store = ScheduleStore::open(&data_dir.join(SCHEDULES_FILE));

    let scheduler = FeedScheduler::new(
        config.scheduler.clone(),
        Arc::new(fetcher),
        Arc::new(feeds),
        store,
    )?;
    Ok(scheduler)
}

/// A schedule record with a readable interval, for `list`.
#[derive(Serialize)]
pub struct FeedListing<'a> {
    #[serde(flatten)]
    pub record: &'a ScheduleRecord,
    pub schedule: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub overdue_since: Option<DateTime<Utc>>,
}

pub fn describe_feeds(records: &[ScheduleRecord]) -> Vec<FeedListing<'_>> {
    let now = Utc::now();
    records
        .iter()
        .map(|record| FeedListing {
            record,
            schedule: schedule::describe(&record.interval),
            overdue_since: record.next_run.filter(|next| *next < now),
        })
        .collect()
}

//! snipfeed-cron: periodic feed refresh scheduling.
//!
//! Keeps one cron-driven job per tracked feed, refreshes feeds with bounded
//! retries, and persists per-feed schedule state and aggregate statistics.

pub mod error;
pub mod jobs;
pub mod retry;
pub mod schedule;
pub mod scheduler;
pub mod store;

#[cfg(test)]
pub(crate) mod testing;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use error::{SchedulerError, StoreError};
pub use retry::{RefreshOutcome, RetryPolicy};
pub use schedule::CronSchedule;
pub use scheduler::{AddFeedOptions, AddedFeed, EngineState, FeedScheduler, SchedulerStatus};
pub use store::ScheduleStore;

/// Persisted schedule state for one feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleRecord {
    /// Derived from the URL, see `snipfeed_types::feed_id_for_url`.
    pub id: String,
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    /// Cron expression (e.g. "*/30 * * * *").
    pub interval: String,
    /// Disabled feeds get no job when the scheduler starts.
    pub enabled: bool,
    /// Next scheduled attempt, recomputed from `interval` after every attempt.
    pub next_run: Option<DateTime<Utc>>,
    /// Most recent attempt, successful or not.
    pub last_run: Option<DateTime<Utc>>,
    pub last_success: Option<DateTime<Utc>>,
    /// Consecutive refreshes that exhausted every retry.
    #[serde(default)]
    pub failure_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Aggregate refresh counters for one scheduler instance.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineStats {
    pub total_feeds: usize,
    pub successful_updates: u64,
    pub failed_updates: u64,
    pub last_update_time: Option<DateTime<Utc>>,
}

//! Fetch-and-retry: one logical "refresh this feed" with bounded attempts.

use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tracing::{info, warn};

use snipfeed_config::SchedulerConfig;
use snipfeed_feeds::{FeedFetcher, FeedStore, FeedUpdate, FetchOptions};

use crate::ScheduleRecord;
use crate::store::ScheduleStore;

/// Attempt budget for one refresh.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first. At least 1.
    pub max_attempts: u32,
    /// Fixed pause between attempts.
    pub delay: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &SchedulerConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            delay: config.retry_delay(),
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&SchedulerConfig::default())
    }
}

/// Result of one refresh.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RefreshOutcome {
    Succeeded {
        feed_id: String,
        items_added: usize,
        /// 1-based attempt that succeeded.
        attempt: u32,
    },
    Failed {
        feed_id: String,
        error: String,
        attempts: u32,
    },
}

impl RefreshOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Succeeded { .. })
    }

    pub fn feed_id(&self) -> &str {
        match self {
            Self::Succeeded { feed_id, .. } | Self::Failed { feed_id, .. } => feed_id,
        }
    }
}

/// Collaborators used by [`refresh_with_retry`].
pub(crate) struct RefreshContext<'a> {
    pub store: &'a ScheduleStore,
    pub fetcher: &'a dyn FeedFetcher,
    pub feeds: &'a dyn FeedStore,
    pub policy: RetryPolicy,
    pub options: &'a FetchOptions,
}

/// Refresh `record`, retrying up to the policy's budget.
///
/// Attempts run sequentially. The record and stats are updated exactly once:
/// on the first success, or after the last attempt fails. A record removed
/// while the refresh ran is left alone.
pub(crate) async fn refresh_with_retry(
    ctx: &RefreshContext<'_>,
    record: &ScheduleRecord,
) -> RefreshOutcome {
    let feed_id = record.id.as_str();
    let max_attempts = ctx.policy.max_attempts.max(1);
    let mut last_error = String::new();

    for attempt in 1..=max_attempts {
        match attempt_once(ctx, &record.url).await {
            Ok(items_added) => {
                if ctx.store.record_success(feed_id, Utc::now()).is_some() {
                    ctx.store.save();
                } else {
                    warn!(feed_id, "Feed removed during refresh, result not recorded");
                }
                info!(feed_id, attempt, items_added, "Feed refreshed");
                return RefreshOutcome::Succeeded {
                    feed_id: feed_id.to_string(),
                    items_added,
                    attempt,
                };
            }
            Err(e) => {
                if attempt < max_attempts {
                    warn!(
                        feed_id,
                        attempt,
                        max_attempts,
                        retry_in_ms = ctx.policy.delay.as_millis() as u64,
                        "Feed refresh attempt failed: {e}"
                    );
                    tokio::time::sleep(ctx.policy.delay).await;
                }
                last_error = e;
            }
        }
    }

    if ctx
        .store
        .record_failure(feed_id, Utc::now(), &last_error)
        .is_some()
    {
        ctx.store.save();
    } else {
        warn!(feed_id, "Feed removed during refresh, failure not recorded");
    }
    warn!(
        feed_id,
        attempts = max_attempts,
        "Feed refresh failed after all attempts: {last_error}"
    );
    RefreshOutcome::Failed {
        feed_id: feed_id.to_string(),
        error: last_error,
        attempts: max_attempts,
    }
}

/// Fetch the feed and store its content. Returns the number of new items.
async fn attempt_once(ctx: &RefreshContext<'_>, url: &str) -> Result<usize, String> {
    let parsed = ctx
        .fetcher
        .fetch(url, ctx.options)
        .await
        .map_err(|e| e.to_string())?;
    let outcome = ctx
        .feeds
        .upsert(url, FeedUpdate::fetched(parsed, Utc::now()))
        .await
        .map_err(|e| format!("feed store: {e}"))?;
    Ok(outcome.items_added)
}

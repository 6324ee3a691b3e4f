//! Feed scheduler engine: lifecycle, feed registration and job management.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use snipfeed_config::SchedulerConfig;
use snipfeed_feeds::{FeedFetcher, FeedStore, FeedUpdate, FetchOptions};
use snipfeed_types::{StoredFeed, feed_id_for_url, normalize_feed_url};

use crate::error::SchedulerError;
use crate::jobs::{FireFuture, FireHandler, Job, JobTable};
use crate::retry::{RefreshContext, RefreshOutcome, RetryPolicy, refresh_with_retry};
use crate::schedule::CronSchedule;
use crate::store::ScheduleStore;
use crate::{EngineStats, ScheduleRecord};

/// Scheduler lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineState {
    Stopped,
    Running,
    Paused,
}

/// Options for [`FeedScheduler::add_feed`].
#[derive(Debug, Clone)]
pub struct AddFeedOptions {
    /// Cron expression; the configured default when `None`.
    pub interval: Option<String>,
    pub title: Option<String>,
    pub enabled: bool,
}

impl Default for AddFeedOptions {
    fn default() -> Self {
        Self {
            interval: None,
            title: None,
            enabled: true,
        }
    }
}

impl AddFeedOptions {
    pub fn with_interval(interval: impl Into<String>) -> Self {
        Self {
            interval: Some(interval.into()),
            ..Default::default()
        }
    }
}

/// Result of a successful [`FeedScheduler::add_feed`].
#[derive(Debug, Clone, Serialize)]
pub struct AddedFeed {
    pub feed_id: String,
    pub next_run: DateTime<Utc>,
    pub record: ScheduleRecord,
    /// Feed as registered in the feed store.
    pub feed: StoredFeed,
}

/// Snapshot returned by [`FeedScheduler::get_status`].
#[derive(Debug, Clone, Serialize)]
pub struct SchedulerStatus {
    pub state: EngineState,
    pub scheduled_feeds: usize,
    pub active_jobs: usize,
    pub is_running: bool,
    pub is_paused: bool,
    pub last_update: Option<DateTime<Utc>>,
    pub stats: EngineStats,
}

struct Shared {
    config: SchedulerConfig,
    policy: RetryPolicy,
    store: ScheduleStore,
    fetcher: Arc<dyn FeedFetcher>,
    feeds: Arc<dyn FeedStore>,
    state: watch::Sender<EngineState>,
    jobs: Mutex<JobTable>,
}

impl Shared {
    fn jobs(&self) -> MutexGuard<'_, JobTable> {
        self.jobs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn refresh(
        &self,
        feed_id: &str,
        options: &FetchOptions,
    ) -> Result<RefreshOutcome, SchedulerError> {
        let record = self
            .store
            .get(feed_id)
            .ok_or_else(|| SchedulerError::NotFound(feed_id.to_string()))?;
        let ctx = RefreshContext {
            store: &self.store,
            fetcher: self.fetcher.as_ref(),
            feeds: self.feeds.as_ref(),
            policy: self.policy,
            options,
        };
        Ok(refresh_with_retry(&ctx, &record).await)
    }
}

/// Runs one cron-driven refresh job per enabled feed.
///
/// Cloning is cheap and clones share the same engine.
#[derive(Clone)]
pub struct FeedScheduler {
    shared: Arc<Shared>,
}

impl FeedScheduler {
    /// Create a stopped scheduler over the given collaborators.
    pub fn new(
        config: SchedulerConfig,
        fetcher: Arc<dyn FeedFetcher>,
        feeds: Arc<dyn FeedStore>,
        store: ScheduleStore,
    ) -> Result<Self, SchedulerError> {
        if config.max_attempts == 0 {
            return Err(SchedulerError::Config(
                "max_attempts must be at least 1".to_string(),
            ));
        }
        CronSchedule::parse(&config.default_interval)
            .map_err(|reasons| SchedulerError::invalid_schedule(&config.default_interval, reasons))?;

        let (state, _) = watch::channel(EngineState::Stopped);
        Ok(Self {
            shared: Arc::new(Shared {
                policy: RetryPolicy::from_config(&config),
                config,
                store,
                fetcher,
                feeds,
                state,
                jobs: Mutex::new(JobTable::new()),
            }),
        })
    }

    pub fn state(&self) -> EngineState {
        *self.shared.state.borrow()
    }

    /// True while running or paused.
    pub fn is_running(&self) -> bool {
        self.state() != EngineState::Stopped
    }

    pub fn is_paused(&self) -> bool {
        self.state() == EngineState::Paused
    }

    /// Start the engine and create a job for every enabled feed.
    /// Returns `false` if it was not stopped.
    ///
    /// # Panics
    ///
    /// Panics when called outside a Tokio runtime while any feed is enabled,
    /// since each job is a spawned task. The same holds for the feed
    /// operations that create jobs on a running engine.
    pub fn start(&self) -> bool {
        // Lifecycle changes and job table edits share the job table lock.
        let mut jobs = self.shared.jobs();
        let started = self.transition(EngineState::Stopped, EngineState::Running);
        if !started {
            debug!(state = ?self.state(), "Start ignored");
            return false;
        }

        let records = self.shared.store.enabled();
        for record in &records {
            if let Some(job) = self.spawn_job(record) {
                jobs.insert(job);
            }
        }
        info!(jobs = jobs.len(), "Feed scheduler started");
        true
    }

    /// Stop the engine and cancel every job. In-flight refreshes finish.
    pub fn stop(&self) -> bool {
        let mut jobs = self.shared.jobs();
        let stopped = self.shared.state.send_if_modified(|state| {
            if *state == EngineState::Stopped {
                return false;
            }
            *state = EngineState::Stopped;
            true
        });
        if !stopped {
            debug!("Stop ignored, scheduler not running");
            return false;
        }
        let cancelled = jobs.clear();
        info!(cancelled, "Feed scheduler stopped");
        true
    }

    /// Keep jobs but stop them from firing.
    pub fn pause(&self) -> bool {
        let _jobs = self.shared.jobs();
        let paused = self.transition(EngineState::Running, EngineState::Paused);
        if paused {
            info!("Feed scheduler paused");
        } else {
            debug!(state = ?self.state(), "Pause ignored");
        }
        paused
    }

    pub fn resume(&self) -> bool {
        let _jobs = self.shared.jobs();
        let resumed = self.transition(EngineState::Paused, EngineState::Running);
        if resumed {
            info!("Feed scheduler resumed");
        } else {
            debug!(state = ?self.state(), "Resume ignored");
        }
        resumed
    }

    /// Stop, then persist the schedule store.
    pub fn close(&self) -> Result<(), crate::StoreError> {
        self.stop();
        self.shared.store.try_save()
    }

    /// Track a feed, or re-register one already tracked under the same URL.
    pub async fn add_feed(
        &self,
        url: &str,
        options: AddFeedOptions,
    ) -> Result<AddedFeed, SchedulerError> {
        let url = normalize_feed_url(url)?.to_string();
        let interval = options
            .interval
            .unwrap_or_else(|| self.shared.config.default_interval.clone());
        let schedule = CronSchedule::parse(&interval)
            .map_err(|reasons| SchedulerError::invalid_schedule(&interval, reasons))?;

        let feed_id = feed_id_for_url(&url)?;
        let existing = self.shared.store.get(&feed_id);
        if let Some(existing) = &existing {
            if existing.url != url {
                return Err(SchedulerError::IdCollision {
                    id: feed_id,
                    existing_url: existing.url.clone(),
                });
            }
        }

        let registered = self
            .shared
            .feeds
            .upsert(&url, FeedUpdate::registration(options.title.clone()))
            .await?;

        let now = Utc::now();
        let next_run = schedule.next_after(&now).ok_or_else(|| {
            SchedulerError::invalid_schedule(
                &interval,
                vec!["expression has no upcoming fire time".to_string()],
            )
        })?;
        let record = match existing {
            Some(previous) => ScheduleRecord {
                title: options.title.or(previous.title.clone()),
                interval: schedule.expression().to_string(),
                enabled: options.enabled,
                next_run: Some(next_run),
                ..previous
            },
            None => ScheduleRecord {
                id: feed_id.clone(),
                url: url.clone(),
                title: options.title,
                interval: schedule.expression().to_string(),
                enabled: options.enabled,
                next_run: Some(next_run),
                last_run: None,
                last_success: None,
                failure_count: 0,
                last_error: None,
                created_at: now,
            },
        };

        let replaced = self.shared.store.insert(record.clone()).is_some();
        self.shared.store.save();
        self.sync_job(&record.id);

        info!(
            feed_id = %feed_id,
            url = %url,
            interval = %record.interval,
            %next_run,
            replaced,
            "Feed scheduled"
        );
        Ok(AddedFeed {
            feed_id,
            next_run,
            record,
            feed: registered.feed,
        })
    }

    /// Stop tracking a feed and drop it from the feed store.
    pub async fn remove_feed(&self, feed_id: &str) -> Result<(), SchedulerError> {
        if !self.shared.store.contains(feed_id) {
            return Err(SchedulerError::NotFound(feed_id.to_string()));
        }
        let removed = {
            let mut jobs = self.shared.jobs();
            jobs.remove(feed_id);
            self.shared.store.remove(feed_id).is_some()
        };
        if removed {
            self.shared.store.save();
            info!(feed_id, "Feed unscheduled");
        }

        if let Err(e) = self.shared.feeds.remove(feed_id).await {
            warn!(feed_id, "Failed to remove feed from feed store: {e}");
        }
        Ok(())
    }

    /// Change a feed's cron expression. Returns the new next run time.
    pub fn update_feed_schedule(
        &self,
        feed_id: &str,
        interval: &str,
    ) -> Result<DateTime<Utc>, SchedulerError> {
        if !self.shared.store.contains(feed_id) {
            return Err(SchedulerError::NotFound(feed_id.to_string()));
        }
        let schedule = CronSchedule::parse(interval)
            .map_err(|reasons| SchedulerError::invalid_schedule(interval, reasons))?;
        let next_run = schedule.next_run().ok_or_else(|| {
            SchedulerError::invalid_schedule(
                interval,
                vec!["expression has no upcoming fire time".to_string()],
            )
        })?;

        let record = self
            .shared
            .store
            .update(feed_id, |record| {
                record.interval = schedule.expression().to_string();
                record.next_run = Some(next_run);
                record.clone()
            })
            .ok_or_else(|| SchedulerError::NotFound(feed_id.to_string()))?;
        self.shared.store.save();
        self.sync_job(&record.id);

        info!(feed_id, interval = %record.interval, %next_run, "Feed schedule updated");
        Ok(next_run)
    }

    /// Enable or disable a feed, creating or cancelling its job.
    pub fn set_feed_enabled(
        &self,
        feed_id: &str,
        enabled: bool,
    ) -> Result<ScheduleRecord, SchedulerError> {
        let record = self
            .shared
            .store
            .update(feed_id, |record| {
                record.enabled = enabled;
                record.clone()
            })
            .ok_or_else(|| SchedulerError::NotFound(feed_id.to_string()))?;
        self.shared.store.save();
        self.sync_job(&record.id);

        info!(feed_id, enabled, "Feed enabled flag changed");
        Ok(record)
    }

    /// Refresh a feed now, regardless of engine state.
    pub async fn refresh_feed(&self, feed_id: &str) -> Result<RefreshOutcome, SchedulerError> {
        self.refresh_feed_with(feed_id, &FetchOptions::default()).await
    }

    pub async fn refresh_feed_with(
        &self,
        feed_id: &str,
        options: &FetchOptions,
    ) -> Result<RefreshOutcome, SchedulerError> {
        self.shared.refresh(feed_id, options).await
    }

    pub fn list_scheduled_feeds(&self) -> Vec<ScheduleRecord> {
        self.shared.store.list()
    }

    pub fn get_status(&self) -> SchedulerStatus {
        let (state, active_jobs) = {
            let jobs = self.shared.jobs();
            (self.state(), jobs.len())
        };
        let stats = self.shared.store.stats();
        SchedulerStatus {
            state,
            scheduled_feeds: stats.total_feeds,
            active_jobs,
            is_running: state != EngineState::Stopped,
            is_paused: state == EngineState::Paused,
            last_update: stats.last_update_time,
            stats,
        }
    }

    pub fn get_update_stats(&self) -> EngineStats {
        self.shared.store.stats()
    }

    pub fn reset_stats(&self) {
        self.shared.store.reset_stats();
        self.shared.store.save();
        info!("Update statistics reset");
    }

    fn transition(&self, from: EngineState, to: EngineState) -> bool {
        self.shared.state.send_if_modified(|state| {
            if *state != from {
                return false;
            }
            *state = to;
            true
        })
    }

    /// Make the job table agree with the stored record for the current
    /// state. The record is re-read under the table lock, so the last
    /// writer's interval wins.
    fn sync_job(&self, feed_id: &str) {
        let mut jobs = self.shared.jobs();
        match self.shared.store.get(feed_id) {
            Some(record) if self.is_running() && record.enabled => {
                if let Some(job) = self.spawn_job(&record) {
                    jobs.insert(job);
                }
            }
            _ => {
                jobs.remove(feed_id);
            }
        }
    }

    fn spawn_job(&self, record: &ScheduleRecord) -> Option<Job> {
        match CronSchedule::parse(&record.interval) {
            Ok(schedule) => Some(Job::spawn(
                record.id.clone(),
                schedule,
                self.shared.state.subscribe(),
                self.fire_handler(),
            )),
            Err(reasons) => {
                warn!(
                    feed_id = %record.id,
                    interval = %record.interval,
                    "Not scheduling feed with invalid interval: {}",
                    reasons.join("; ")
                );
                None
            }
        }
    }

    /// Handler invoked by jobs. Holds the engine weakly so jobs never keep
    /// it alive.
    pub(crate) fn fire_handler(&self) -> FireHandler {
        let shared: Weak<Shared> = Arc::downgrade(&self.shared);
        Arc::new(move |feed_id: String| -> FireFuture {
            let shared = shared.clone();
            Box::pin(async move {
                let Some(shared) = shared.upgrade() else {
                    return Ok(());
                };
                debug!(feed_id = %feed_id, "Scheduled refresh firing");
                shared.refresh(&feed_id, &FetchOptions::default()).await?;
                Ok(())
            })
        })
    }

    #[cfg(test)]
    fn subscribe(&self) -> watch::Receiver<EngineState> {
        self.shared.state.subscribe()
    }
}

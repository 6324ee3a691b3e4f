//! Live per-feed timers.
//!
//! A [`Job`] is a tokio task that sleeps until the next fire time of its cron
//! schedule and then invokes a [`FireHandler`]. Jobs observe the engine state
//! through a `watch` channel: they wait while paused and exit once stopped.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::scheduler::EngineState;
use crate::schedule::CronSchedule;

/// Future returned by a [`FireHandler`].
pub type FireFuture = Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>>;

/// Async callback run when a job fires, given the feed id.
pub type FireHandler = Arc<dyn Fn(String) -> FireFuture + Send + Sync>;

/// A running timer for one feed. Dropping it cancels the timer.
pub struct Job {
    feed_id: String,
    interval: String,
    handle: JoinHandle<()>,
}

impl Job {
    /// Spawn the timer task for `feed_id`.
    pub fn spawn(
        feed_id: String,
        schedule: CronSchedule,
        state: watch::Receiver<EngineState>,
        handler: FireHandler,
    ) -> Self {
        let interval = schedule.expression().to_string();
        let handle = tokio::spawn(run_job(feed_id.clone(), schedule, state, handler));
        Self {
            feed_id,
            interval,
            handle,
        }
    }

    pub fn feed_id(&self) -> &str {
        &self.feed_id
    }

    pub fn interval(&self) -> &str {
        &self.interval
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

impl Drop for Job {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Feed id → live job. Holds at most one job per feed.
#[derive(Default)]
pub struct JobTable {
    jobs: HashMap<String, Job>,
}

impl JobTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a job, cancelling any previous job for the same feed.
    /// Returns whether a job was replaced.
    pub fn insert(&mut self, job: Job) -> bool {
        self.jobs.insert(job.feed_id.clone(), job).is_some()
    }

    /// Cancel and remove the job for `feed_id`.
    pub fn remove(&mut self, feed_id: &str) -> bool {
        self.jobs.remove(feed_id).is_some()
    }

    /// Cancel every job. Returns how many were removed.
    pub fn clear(&mut self) -> usize {
        let count = self.jobs.len();
        self.jobs.clear();
        count
    }

    pub fn get(&self, feed_id: &str) -> Option<&Job> {
        self.jobs.get(feed_id)
    }

    pub fn contains(&self, feed_id: &str) -> bool {
        self.jobs.contains_key(feed_id)
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}

async fn run_job(
    feed_id: String,
    schedule: CronSchedule,
    mut state: watch::Receiver<EngineState>,
    handler: FireHandler,
) {
    debug!(feed_id, interval = schedule.expression(), "Job started");
    // Last slot fired, so a timer waking a hair early cannot fire it twice.
    let mut last_slot: Option<DateTime<Utc>> = None;

    loop {
        loop {
            let current = *state.borrow_and_update();
            match current {
                EngineState::Running => break,
                EngineState::Stopped => {
                    debug!(feed_id, "Job exiting, scheduler stopped");
                    return;
                }
                EngineState::Paused => {
                    if state.changed().await.is_err() {
                        return;
                    }
                }
            }
        }

        let now = Utc::now();
        let from = last_slot.map_or(now, |slot| slot.max(now));
        let Some(next) = schedule.next_after(&from) else {
            warn!(feed_id, "Schedule has no upcoming fire time, job exiting");
            return;
        };
        tokio::select! {
            _ = tokio::time::sleep(wait_before(now, next)) => {}
            changed = state.changed() => {
                if changed.is_err() {
                    return;
                }
                // State changed while waiting: re-check it and recompute.
                continue;
            }
        }
        if Utc::now() < next {
            continue;
        }

        last_slot = Some(next);
        fire(&feed_id, &handler, &state).await;
    }
}

/// Longest single sleep. Far slots are reached in several hops.
const MAX_SLEEP: Duration = Duration::from_secs(24 * 60 * 60);

fn wait_before(now: DateTime<Utc>, next: DateTime<Utc>) -> Duration {
    (next - now)
        .to_std()
        .unwrap_or(Duration::ZERO)
        .min(MAX_SLEEP)
}

/// Invoke the handler for one fire, unless the engine is not running.
///
/// The handler runs in its own task: a panic or error is logged for this job
/// only, and cancelling the job does not cancel a refresh already underway.
pub(crate) async fn fire(
    feed_id: &str,
    handler: &FireHandler,
    state: &watch::Receiver<EngineState>,
) {
    if *state.borrow() != EngineState::Running {
        debug!(feed_id, "Skipping fire, scheduler not running");
        return;
    }

    match tokio::spawn(handler(feed_id.to_string())).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!(feed_id, "Scheduled refresh failed: {e:#}"),
        Err(e) => error!(feed_id, "Scheduled refresh panicked: {e}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn counting_handler(counter: Arc<AtomicU32>) -> FireHandler {
        Arc::new(move |_feed_id: String| -> FireFuture {
            let c = counter.clone();
            Box::pin(async move {
                c.fetch_add(1, Ordering::SeqCst);
                anyhow::Ok(())
            })
        })
    }

    #[tokio::test]
    async fn test_fire_runs_handler_when_running() {
        let counter = Arc::new(AtomicU32::new(0));
        let handler = counting_handler(counter.clone());
        let (_tx, rx) = watch::channel(EngineState::Running);

        fire("feed", &handler, &rx).await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_fire_is_noop_when_paused_or_stopped() {
        let counter = Arc::new(AtomicU32::new(0));
        let handler = counting_handler(counter.clone());
        let (tx, rx) = watch::channel(EngineState::Paused);

        fire("feed", &handler, &rx).await;
        tx.send_replace(EngineState::Stopped);
        fire("feed", &handler, &rx).await;
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }

    async fn failing_refresh(_feed_id: String) -> anyhow::Result<()> {
        Err(anyhow::anyhow!("fetch exploded"))
    }

    async fn panicking_refresh(_feed_id: String) -> anyhow::Result<()> {
        panic!("handler bug")
    }

    #[tokio::test]
    async fn test_fire_contains_errors_and_panics() {
        let (_tx, rx) = watch::channel(EngineState::Running);
        let failing: FireHandler = Arc::new(|id: String| -> FireFuture { Box::pin(failing_refresh(id)) });
        let panicking: FireHandler =
            Arc::new(|id: String| -> FireFuture { Box::pin(panicking_refresh(id)) });

        // Neither call may propagate.
        fire("a", &failing, &rx).await;
        fire("b", &panicking, &rx).await;
    }

    #[tokio::test]
    async fn test_table_replaces_and_cancels() {
        let counter = Arc::new(AtomicU32::new(0));
        let (_tx, rx) = watch::channel(EngineState::Running);
        let schedule = CronSchedule::parse("0 0 * * *").unwrap();

        let mut table = JobTable::new();
        let first = Job::spawn(
            "feed".into(),
            schedule.clone(),
            rx.clone(),
            counting_handler(counter.clone()),
        );
        assert!(!table.insert(first));
        let second = Job::spawn("feed".into(), schedule, rx, counting_handler(counter));
        assert!(table.insert(second));
        assert_eq!(table.len(), 1);
        assert_eq!(table.get("feed").unwrap().interval(), "0 0 * * *");

        assert!(table.remove("feed"));
        assert!(!table.remove("feed"));
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn test_job_exits_when_stopped() {
        let counter = Arc::new(AtomicU32::new(0));
        let (tx, rx) = watch::channel(EngineState::Running);
        let job = Job::spawn(
            "feed".into(),
            CronSchedule::parse("0 0 * * *").unwrap(),
            rx,
            counting_handler(counter.clone()),
        );

        tx.send_replace(EngineState::Stopped);
        tokio::time::timeout(Duration::from_secs(2), async {
            while !job.is_finished() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("job should exit promptly once stopped");
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_paused_job_stays_alive() {
        let counter = Arc::new(AtomicU32::new(0));
        let (tx, rx) = watch::channel(EngineState::Running);
        let job = Job::spawn(
            "feed".into(),
            CronSchedule::parse("0 0 * * *").unwrap(),
            rx,
            counting_handler(counter),
        );

        tx.send_replace(EngineState::Paused);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!job.is_finished());
        tx.send_replace(EngineState::Running);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!job.is_finished());
    }

    async fn wait_for_count(counter: &AtomicU32, at_least: u32, within: Duration) -> bool {
        tokio::time::timeout(within, async {
            while counter.load(Ordering::SeqCst) < at_least {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .is_ok()
    }

    #[tokio::test]
    async fn test_live_job_fires_pauses_and_resumes() {
        let counter = Arc::new(AtomicU32::new(0));
        let (tx, rx) = watch::channel(EngineState::Running);
        let _job = Job::spawn(
            "feed".into(),
            CronSchedule::with_seconds("* * * * * *"),
            rx,
            counting_handler(counter.clone()),
        );

        assert!(wait_for_count(&counter, 1, Duration::from_secs(3)).await);

        tx.send_replace(EngineState::Paused);
        // Let a fire already past its state check finish.
        tokio::time::sleep(Duration::from_millis(200)).await;
        let paused_at = counter.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(2200)).await;
        assert_eq!(counter.load(Ordering::SeqCst), paused_at);

        tx.send_replace(EngineState::Running);
        assert!(wait_for_count(&counter, paused_at + 1, Duration::from_secs(3)).await);
    }

    #[test]
    fn test_wait_is_capped_and_never_negative() {
        let now = Utc::now();
        assert_eq!(wait_before(now, now + chrono::Duration::days(3 * 365)), MAX_SLEEP);
        assert_eq!(wait_before(now, now - chrono::Duration::seconds(5)), Duration::ZERO);
        assert_eq!(
            wait_before(now, now + chrono::Duration::seconds(90)),
            Duration::from_secs(90)
        );
    }
}

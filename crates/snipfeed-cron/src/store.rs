//! JSON-file schedule storage.
//!
//! The in-memory state is the source of truth; [`ScheduleStore::save`] is a
//! separate, best-effort step whose failures are only logged.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::StoreError;
use crate::schedule::next_run_after;
use crate::{EngineStats, ScheduleRecord};

#[derive(Debug, Default)]
struct StoreState {
    feeds: BTreeMap<String, ScheduleRecord>,
    stats: EngineStats,
}

impl StoreState {
    fn sync_total(&mut self) {
        self.stats.total_feeds = self.feeds.len();
    }
}

#[derive(Serialize)]
struct ScheduleDocumentRef<'a> {
    feeds: &'a BTreeMap<String, ScheduleRecord>,
    stats: &'a EngineStats,
    last_saved: DateTime<Utc>,
}

#[derive(Deserialize)]
struct ScheduleDocument {
    #[serde(default)]
    feeds: BTreeMap<String, ScheduleRecord>,
    #[serde(default)]
    stats: EngineStats,
}

/// Persistent storage for schedule records and engine statistics.
pub struct ScheduleStore {
    path: Option<PathBuf>,
    state: Mutex<StoreState>,
    /// Serializes snapshot+write so an older snapshot never lands last.
    save_lock: Mutex<()>,
}

impl ScheduleStore {
    /// Open a store backed by `path`.
    ///
    /// A missing file starts empty; an unreadable or corrupt file is logged
    /// and also starts empty.
    pub fn open(path: &Path) -> Self {
        let mut state = match load_document(path) {
            Ok(Some(doc)) => {
                info!("Loaded {} feed schedules from {}", doc.feeds.len(), path.display());
                StoreState {
                    feeds: doc.feeds,
                    stats: doc.stats,
                }
            }
            Ok(None) => {
                debug!("No schedule file at {}, starting empty", path.display());
                StoreState::default()
            }
            Err(e) => {
                warn!(
                    "Failed to load schedules from {}, starting empty: {e}",
                    path.display()
                );
                StoreState::default()
            }
        };
        state.sync_total();

        Self {
            path: Some(path.to_path_buf()),
            state: Mutex::new(state),
            save_lock: Mutex::new(()),
        }
    }

    /// Store without a backing file (for testing and dry runs).
    pub fn in_memory() -> Self {
        Self {
            path: None,
            state: Mutex::new(StoreState::default()),
            save_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn lock(&self) -> MutexGuard<'_, StoreState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Get a record by feed id.
    pub fn get(&self, id: &str) -> Option<ScheduleRecord> {
        self.lock().feeds.get(id).cloned()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.lock().feeds.contains_key(id)
    }

    /// All records, ordered by id.
    pub fn list(&self) -> Vec<ScheduleRecord> {
        self.lock().feeds.values().cloned().collect()
    }

    pub fn enabled(&self) -> Vec<ScheduleRecord> {
        self.lock()
            .feeds
            .values()
            .filter(|r| r.enabled)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.lock().feeds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Insert or replace a record, returning the previous one.
    pub fn insert(&self, record: ScheduleRecord) -> Option<ScheduleRecord> {
        let mut state = self.lock();
        let previous = state.feeds.insert(record.id.clone(), record);
        state.sync_total();
        previous
    }

    /// Apply `f` to a record in place. Returns `None` if the id is unknown.
    pub fn update<R>(&self, id: &str, f: impl FnOnce(&mut ScheduleRecord) -> R) -> Option<R> {
        self.lock().feeds.get_mut(id).map(f)
    }

    /// Delete a record.
    pub fn remove(&self, id: &str) -> Option<ScheduleRecord> {
        let mut state = self.lock();
        let removed = state.feeds.remove(id);
        state.sync_total();
        removed
    }

    pub fn stats(&self) -> EngineStats {
        self.lock().stats.clone()
    }

    pub fn reset_stats(&self) {
        let mut state = self.lock();
        state.stats = EngineStats::default();
        state.sync_total();
    }

    /// Record a successful refresh: clears the failure streak and advances
    /// `next_run`. Returns the updated record, or `None` if it was removed.
    pub fn record_success(&self, id: &str, at: DateTime<Utc>) -> Option<ScheduleRecord> {
        let mut state = self.lock();
        let record = state.feeds.get_mut(id)?;
        record.last_run = Some(at);
        record.last_success = Some(at);
        record.failure_count = 0;
        record.last_error = None;
        record.next_run = next_run_after(&record.interval, &at);
        let updated = record.clone();

        state.stats.successful_updates += 1;
        state.stats.last_update_time = Some(at);
        Some(updated)
    }

    /// Record a refresh whose retries were exhausted.
    pub fn record_failure(
        &self,
        id: &str,
        at: DateTime<Utc>,
        error: &str,
    ) -> Option<ScheduleRecord> {
        let mut state = self.lock();
        let record = state.feeds.get_mut(id)?;
        record.last_run = Some(at);
        record.failure_count += 1;
        record.last_error = Some(error.to_string());
        record.next_run = next_run_after(&record.interval, &at);
        let updated = record.clone();

        state.stats.failed_updates += 1;
        state.stats.last_update_time = Some(at);
        Some(updated)
    }

    /// Persist the current state, logging any failure.
    pub fn save(&self) {
        if let Err(e) = self.try_save() {
            warn!("Failed to save feed schedules: {e}");
        }
    }

    /// Persist the current state.
    pub fn try_save(&self) -> Result<(), StoreError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let _guard = self.save_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let bytes = {
            let state = self.lock();
            serde_json::to_vec_pretty(&ScheduleDocumentRef {
                feeds: &state.feeds,
                stats: &state.stats,
                last_saved: Utc::now(),
            })?
        };
        snipfeed_feeds::write_atomic(path, &bytes)?;
        Ok(())
    }
}

fn load_document(path: &Path) -> Result<Option<ScheduleDocument>, StoreError> {
    if !path.exists() {
        return Ok(None);
    }
    let content = std::fs::read_to_string(path)?;
    Ok(Some(serde_json::from_str(&content)?))
}

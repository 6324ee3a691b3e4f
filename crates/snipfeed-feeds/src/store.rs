//! JSON-file feed storage.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use snipfeed_types::{FeedItem, InvalidFeedUrl, ParsedFeed, StoredFeed, feed_id_for_url};

#[derive(Debug, Error)]
pub enum FeedStoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    InvalidUrl(#[from] InvalidFeedUrl),
    #[error("feed store lock poisoned")]
    Poisoned,
}

/// Content written to the store for one feed.
#[derive(Debug, Clone, Default)]
pub struct FeedUpdate {
    pub title: Option<String>,
    pub description: Option<String>,
    pub link: Option<String>,
    pub items: Vec<FeedItem>,
    /// When the content was fetched; `None` for metadata-only registration.
    pub fetched_at: Option<DateTime<Utc>>,
}

impl FeedUpdate {
    /// Metadata-only update used when a feed is first registered.
    pub fn registration(title: Option<String>) -> Self {
        Self {
            title,
            ..Default::default()
        }
    }

    /// Update carrying freshly fetched content.
    pub fn fetched(feed: ParsedFeed, fetched_at: DateTime<Utc>) -> Self {
        Self {
            title: feed.title,
            description: feed.description,
            link: feed.link,
            items: feed.items,
            fetched_at: Some(fetched_at),
        }
    }
}

/// Result of [`FeedStore::upsert`].
#[derive(Debug, Clone, Serialize)]
pub struct UpsertOutcome {
    pub feed_id: String,
    /// Items not previously stored for this feed.
    pub items_added: usize,
    pub total_items: usize,
    pub feed: StoredFeed,
}

/// Persists feed metadata and items, keyed by [`feed_id_for_url`].
#[async_trait]
pub trait FeedStore: Send + Sync {
    async fn upsert(&self, url: &str, update: FeedUpdate) -> Result<UpsertOutcome, FeedStoreError>;

    /// Returns whether the feed existed.
    async fn remove(&self, feed_id: &str) -> Result<bool, FeedStoreError>;

    async fn get(&self, feed_id: &str) -> Result<Option<StoredFeed>, FeedStoreError>;

    async fn list(&self) -> Result<Vec<StoredFeed>, FeedStoreError>;
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct FeedsDocument {
    #[serde(default)]
    feeds: BTreeMap<String, StoredFeed>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    last_saved: Option<DateTime<Utc>>,
}

/// [`FeedStore`] keeping every feed in a single JSON document.
///
/// Changes are applied to a copy, written to disk, and only then committed
/// in memory, so a failed write leaves the store unchanged.
pub struct JsonFeedStore {
    path: Option<PathBuf>,
    max_items_per_feed: usize,
    feeds: Mutex<BTreeMap<String, StoredFeed>>,
}

impl JsonFeedStore {
    /// Open or create a feed store at the given path.
    pub fn open(path: &Path, max_items_per_feed: usize) -> Result<Self, FeedStoreError> {
        let feeds = if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let doc: FeedsDocument = serde_json::from_str(&content)?;
            info!("Loaded {} stored feeds from {}", doc.feeds.len(), path.display());
            doc.feeds
        } else {
            BTreeMap::new()
        };

        Ok(Self {
            path: Some(path.to_path_buf()),
            max_items_per_feed,
            feeds: Mutex::new(feeds),
        })
    }

    /// Store without a backing file (for testing).
    pub fn in_memory(max_items_per_feed: usize) -> Self {
        Self {
            path: None,
            max_items_per_feed,
            feeds: Mutex::new(BTreeMap::new()),
        }
    }

    fn persist(&self, feeds: &BTreeMap<String, StoredFeed>) -> Result<(), FeedStoreError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let doc = FeedsDocument {
            feeds: feeds.clone(),
            last_saved: Some(Utc::now()),
        };
        write_atomic(path, &serde_json::to_vec_pretty(&doc)?)?;
        Ok(())
    }

    fn merge(&self, existing: Option<StoredFeed>, id: &str, url: &str, update: FeedUpdate) -> (StoredFeed, usize) {
        let now = Utc::now();
        let mut feed = existing.unwrap_or_else(|| StoredFeed {
            id: id.to_string(),
            url: url.to_string(),
            title: None,
            description: None,
            link: None,
            items: Vec::new(),
            created_at: now,
            updated_at: now,
        });

        if update.title.is_some() {
            feed.title = update.title;
        }
        if update.description.is_some() {
            feed.description = update.description;
        }
        if update.link.is_some() {
            feed.link = update.link;
        }

        let known: HashSet<&str> = feed.items.iter().map(|i| i.id.as_str()).collect();
        let mut seen = HashSet::new();
        let fresh: Vec<FeedItem> = update
            .items
            .into_iter()
            .filter(|item| !known.contains(item.id.as_str()) && seen.insert(item.id.clone()))
            .collect();
        let added = fresh.len();

        if added > 0 {
            let mut items = fresh;
            items.append(&mut feed.items);
            items.truncate(self.max_items_per_feed);
            feed.items = items;
        }
        if let Some(fetched_at) = update.fetched_at {
            feed.updated_at = fetched_at;
        }
        (feed, added)
    }
}

#[async_trait]
impl FeedStore for JsonFeedStore {
    async fn upsert(&self, url: &str, update: FeedUpdate) -> Result<UpsertOutcome, FeedStoreError> {
        let id = feed_id_for_url(url)?;
        let mut feeds = self.feeds.lock().map_err(|_| FeedStoreError::Poisoned)?;

        let (feed, items_added) = self.merge(feeds.get(&id).cloned(), &id, url, update);
        let mut next = feeds.clone();
        next.insert(id.clone(), feed.clone());
        self.persist(&next)?;
        *feeds = next;

        Ok(UpsertOutcome {
            feed_id: id,
            items_added,
            total_items: feed.items.len(),
            feed,
        })
    }

    async fn remove(&self, feed_id: &str) -> Result<bool, FeedStoreError> {
        let mut feeds = self.feeds.lock().map_err(|_| FeedStoreError::Poisoned)?;
        if !feeds.contains_key(feed_id) {
            return Ok(false);
        }
        let mut next = feeds.clone();
        next.remove(feed_id);
        self.persist(&next)?;
        *feeds = next;
        Ok(true)
    }

    async fn get(&self, feed_id: &str) -> Result<Option<StoredFeed>, FeedStoreError> {
        let feeds = self.feeds.lock().map_err(|_| FeedStoreError::Poisoned)?;
        Ok(feeds.get(feed_id).cloned())
    }

    async fn list(&self) -> Result<Vec<StoredFeed>, FeedStoreError> {
        let feeds = self.feeds.lock().map_err(|_| FeedStoreError::Poisoned)?;
        Ok(feeds.values().cloned().collect())
    }
}

/// Write `bytes` to a sibling temp file and rename it over `path`.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    if let Some(dir) = path.parent() {
        if !dir.as_os_str().is_empty() {
            std::fs::create_dir_all(dir)?;
        }
    }
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    if let Err(e) = std::fs::write(&tmp, bytes).and_then(|()| std::fs::rename(&tmp, path)) {
        warn!("Atomic write to {} failed: {e}", path.display());
        let _ = std::fs::remove_file(&tmp);
        return Err(e);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(id: &str) -> FeedItem {
        FeedItem {
            id: id.into(),
            title: Some(format!("Title {id}")),
            link: Some(format!("https://a.example/{id}")),
            summary: None,
            published: None,
        }
    }

    fn fetched(items: Vec<FeedItem>) -> FeedUpdate {
        FeedUpdate::fetched(
            ParsedFeed {
                title: Some("Example".into()),
                items,
                ..Default::default()
            },
            Utc::now(),
        )
    }

    #[tokio::test]
    async fn test_registration_creates_empty_feed() {
        let store = JsonFeedStore::in_memory(10);
        let outcome = store
            .upsert(
                "https://a.example/feed.xml",
                FeedUpdate::registration(Some("A".into())),
            )
            .await
            .unwrap();
        assert_eq!(outcome.feed_id, feed_id_for_url("https://a.example/feed.xml").unwrap());
        assert_eq!(outcome.items_added, 0);
        assert_eq!(outcome.feed.title.as_deref(), Some("A"));
    }

    #[tokio::test]
    async fn test_upsert_deduplicates_items() {
        let store = JsonFeedStore::in_memory(10);
        let url = "https://a.example/feed.xml";
        let first = store.upsert(url, fetched(vec![item("1"), item("2")])).await.unwrap();
        assert_eq!(first.items_added, 2);

        let second = store
            .upsert(url, fetched(vec![item("3"), item("2"), item("3")]))
            .await
            .unwrap();
        assert_eq!(second.items_added, 1);
        assert_eq!(second.total_items, 3);
        // Newest first
        assert_eq!(second.feed.items[0].id, "3");
    }

    #[tokio::test]
    async fn test_upsert_caps_items() {
        let store = JsonFeedStore::in_memory(2);
        let outcome = store
            .upsert(
                "https://a.example/feed.xml",
                fetched(vec![item("1"), item("2"), item("3")]),
            )
            .await
            .unwrap();
        assert_eq!(outcome.total_items, 2);
    }

    #[tokio::test]
    async fn test_remove() {
        let store = JsonFeedStore::in_memory(10);
        let outcome = store
            .upsert("https://a.example/feed.xml", FeedUpdate::registration(None))
            .await
            .unwrap();
        assert!(store.remove(&outcome.feed_id).await.unwrap());
        assert!(!store.remove(&outcome.feed_id).await.unwrap());
        assert!(store.get(&outcome.feed_id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_persists_to_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("feeds.json");
        {
            let store = JsonFeedStore::open(&path, 10).unwrap();
            store
                .upsert("https://a.example/feed.xml", fetched(vec![item("1")]))
                .await
                .unwrap();
        }

        let reopened = JsonFeedStore::open(&path, 10).unwrap();
        let feeds = reopened.list().await.unwrap();
        assert_eq!(feeds.len(), 1);
        assert_eq!(feeds[0].items.len(), 1);
        assert!(!dir.path().join("feeds.json.tmp").exists());
    }

    #[tokio::test]
    async fn test_invalid_url_rejected() {
        let store = JsonFeedStore::in_memory(10);
        let result = store.upsert("ftp://a.example", FeedUpdate::registration(None)).await;
        assert!(matches!(result, Err(FeedStoreError::InvalidUrl(_))));
    }
}

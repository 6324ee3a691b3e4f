//! Scripted collaborators and fixtures shared by the unit tests.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;

use snipfeed_feeds::{
    FeedFetcher, FeedStore, FeedStoreError, FeedUpdate, FetchError, FetchOptions, UpsertOutcome,
};
use snipfeed_types::{FeedItem, ParsedFeed, StoredFeed, feed_id_for_url};

use crate::ScheduleRecord;
use crate::schedule::next_run_after;

/// A fresh enabled record for `url`.
pub fn record(url: &str, interval: &str) -> ScheduleRecord {
    let now = Utc::now();
    ScheduleRecord {
        id: feed_id_for_url(url).unwrap(),
        url: url.to_string(),
        title: None,
        interval: interval.to_string(),
        enabled: true,
        next_run: next_run_after(interval, &now),
        last_run: None,
        last_success: None,
        failure_count: 0,
        last_error: None,
        created_at: now,
    }
}

/// Two-item feed returned by [`ScriptedFetcher`] on success.
pub fn sample_feed() -> ParsedFeed {
    let item = |n: u32| FeedItem {
        id: format!("post-{n}"),
        title: Some(format!("Post {n}")),
        link: Some(format!("https://a.example/posts/{n}")),
        summary: None,
        published: None,
    };
    ParsedFeed {
        title: Some("Example feed".into()),
        description: None,
        link: Some("https://a.example/".into()),
        items: vec![item(2), item(1)],
    }
}

#[derive(Default)]
struct Script {
    fail_first: HashMap<String, u32>,
    always_fail: HashSet<String>,
    calls: HashMap<String, u32>,
}

/// Fetcher whose failures are scripted per URL.
#[derive(Default)]
pub struct ScriptedFetcher {
    script: Mutex<Script>,
}

impl ScriptedFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the first `n` calls for `url`, then succeed.
    pub fn fail_first(&self, url: &str, n: u32) {
        self.script.lock().unwrap().fail_first.insert(url.to_string(), n);
    }

    pub fn always_fail(&self, url: &str) {
        self.script.lock().unwrap().always_fail.insert(url.to_string());
    }

    pub fn calls(&self, url: &str) -> u32 {
        self.script
            .lock()
            .unwrap()
            .calls
            .get(url)
            .copied()
            .unwrap_or(0)
    }
}

#[async_trait]
impl FeedFetcher for ScriptedFetcher {
    async fn fetch(&self, url: &str, options: &FetchOptions) -> Result<ParsedFeed, FetchError> {
        if let Some(content) = &options.mock_content {
            return snipfeed_feeds::parse_feed(content.as_bytes());
        }

        let mut script = self.script.lock().unwrap();
        let calls = script.calls.entry(url.to_string()).or_insert(0);
        *calls += 1;
        let call = *calls;

        let scripted_failures = script.fail_first.get(url).copied().unwrap_or(0);
        if script.always_fail.contains(url) || call <= scripted_failures {
            return Err(FetchError::Other(format!("connection refused: {url}")));
        }
        Ok(sample_feed())
    }
}

/// Feed store that rejects every write.
pub struct BrokenFeedStore;

#[async_trait]
impl FeedStore for BrokenFeedStore {
    async fn upsert(&self, _url: &str, _update: FeedUpdate) -> Result<UpsertOutcome, FeedStoreError> {
        Err(FeedStoreError::Io(std::io::Error::other("disk full")))
    }

    async fn remove(&self, _feed_id: &str) -> Result<bool, FeedStoreError> {
        Err(FeedStoreError::Io(std::io::Error::other("disk full")))
    }

    async fn get(&self, _feed_id: &str) -> Result<Option<StoredFeed>, FeedStoreError> {
        Ok(None)
    }

    async fn list(&self) -> Result<Vec<StoredFeed>, FeedStoreError> {
        Ok(Vec::new())
    }
}

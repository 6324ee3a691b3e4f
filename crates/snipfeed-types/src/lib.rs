use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Number of hex characters kept from the URL digest.
const FEED_ID_LEN: usize = 16;

// ──────────────────── Feed Identity ────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InvalidFeedUrl {
    #[error("feed URL is empty")]
    Empty,
    #[error("feed URL is not a valid URL: {0}")]
    Malformed(String),
    #[error("feed URL must use http or https, got '{0}'")]
    UnsupportedScheme(String),
    #[error("feed URL has no host")]
    MissingHost,
}

/// Parse and normalize a feed URL, accepting only http(s) URLs with a host.
pub fn normalize_feed_url(raw: &str) -> Result<url::Url, InvalidFeedUrl> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err(InvalidFeedUrl::Empty);
    }
    let parsed = url::Url::parse(raw).map_err(|e| InvalidFeedUrl::Malformed(e.to_string()))?;
    match parsed.scheme() {
        "http" | "https" => {}
        other => return Err(InvalidFeedUrl::UnsupportedScheme(other.to_string())),
    }
    if parsed.host_str().is_none_or(str::is_empty) {
        return Err(InvalidFeedUrl::MissingHost);
    }
    Ok(parsed)
}

/// Derive the stable feed id for a URL.
///
/// The id is a pure function of the normalized URL, so the scheduler and the
/// feed store compute the same value independently.
pub fn feed_id_for_url(raw: &str) -> Result<String, InvalidFeedUrl> {
    let normalized = normalize_feed_url(raw)?;
    let mut hasher = Sha256::new();
    hasher.update(normalized.as_str().as_bytes());
    let mut id = hex::encode(hasher.finalize());
    id.truncate(FEED_ID_LEN);
    Ok(id)
}

// ──────────────────── Feed Content ────────────────────

/// A single entry of a fetched feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedItem {
    /// Entry guid, falling back to the link or a hash of the title.
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub published: Option<DateTime<Utc>>,
}

/// Parsed content returned by a feed fetcher.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ParsedFeed {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Home page of the feed's site.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link: Option<String>,
    #[serde(default)]
    pub items: Vec<FeedItem>,
}

/// A feed as persisted by the feed store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredFeed {
    pub id: String,
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link: Option<String>,
    /// Newest first.
    #[serde(default)]
    pub items: Vec<FeedItem>,
    pub created_at: DateTime<Utc>,
    /// Last time content was written for this feed.
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_feed_id_is_deterministic() {
        let a = feed_id_for_url("https://a.example/feed.xml").unwrap();
        let b = feed_id_for_url("https://a.example/feed.xml").unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), FEED_ID_LEN);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_feed_id_normalizes_host_case() {
        let a = feed_id_for_url("https://A.Example/feed.xml").unwrap();
        let b = feed_id_for_url("  https://a.example/feed.xml ").unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_feed_id_differs_per_url() {
        let a = feed_id_for_url("https://a.example/feed.xml").unwrap();
        let b = feed_id_for_url("https://b.example/feed.xml").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_invalid_urls_rejected() {
        assert_eq!(feed_id_for_url(""), Err(InvalidFeedUrl::Empty));
        assert!(matches!(
            feed_id_for_url("not a url"),
            Err(InvalidFeedUrl::Malformed(_))
        ));
        assert_eq!(
            feed_id_for_url("ftp://a.example/feed.xml"),
            Err(InvalidFeedUrl::UnsupportedScheme("ftp".into()))
        );
    }

    #[test]
    fn test_stored_feed_json_skips_empty_fields() {
        let feed = StoredFeed {
            id: "abc".into(),
            url: "https://a.example/feed.xml".into(),
            title: None,
            description: None,
            link: None,
            items: vec![],
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        let json = serde_json::to_value(&feed).unwrap();
        assert!(json.get("title").is_none());
        assert_eq!(json["items"], serde_json::json!([]));
    }
}

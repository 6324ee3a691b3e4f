//! Feed content fetching over HTTP.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::debug;

use snipfeed_config::FetcherConfig;
use snipfeed_types::{FeedItem, ParsedFeed};

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("server responded with HTTP {status} for {url}")]
    Status { url: String, status: u16 },
    #[error("failed to parse feed: {0}")]
    Parse(String),
    #[error("{0}")]
    Other(String),
}

/// Per-call fetch options.
#[derive(Debug, Clone, Default)]
pub struct FetchOptions {
    /// Parse this content instead of requesting the URL.
    pub mock_content: Option<String>,
}

impl FetchOptions {
    pub fn with_mock_content(content: impl Into<String>) -> Self {
        Self {
            mock_content: Some(content.into()),
        }
    }
}

/// Downloads and parses the content behind a feed URL.
#[async_trait]
pub trait FeedFetcher: Send + Sync {
    async fn fetch(&self, url: &str, options: &FetchOptions) -> Result<ParsedFeed, FetchError>;
}

/// [`FeedFetcher`] backed by a shared `reqwest` client.
pub struct HttpFeedFetcher {
    client: Client,
}

impl HttpFeedFetcher {
    pub fn new(config: &FetcherConfig) -> Result<Self, FetchError> {
        let client = Client::builder()
            .timeout(config.timeout())
            .connect_timeout(Duration::from_secs(10).min(config.timeout()))
            .user_agent(config.user_agent.clone())
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl FeedFetcher for HttpFeedFetcher {
    async fn fetch(&self, url: &str, options: &FetchOptions) -> Result<ParsedFeed, FetchError> {
        if let Some(content) = &options.mock_content {
            debug!(url, "Parsing mock feed content");
            return parse_feed(content.as_bytes());
        }

        let resp = self
            .client
            .get(url)
            .header(
                reqwest::header::ACCEPT,
                "application/rss+xml, application/atom+xml, application/feed+json, application/xml;q=0.9, */*;q=0.8",
            )
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            return Err(FetchError::Status {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }

        let body = resp.bytes().await?;
        debug!(url, bytes = body.len(), "Fetched feed");
        parse_feed(&body)
    }
}

/// Parse RSS, Atom or JSON Feed content.
pub fn parse_feed(content: &[u8]) -> Result<ParsedFeed, FetchError> {
    let feed = feed_rs::parser::parse(content).map_err(|e| FetchError::Parse(e.to_string()))?;

    let items = feed
        .entries
        .into_iter()
        .map(|entry| {
            let title = entry.title.map(|t| t.content.trim().to_string());
            let link = entry.links.first().map(|l| l.href.clone());
            let id = if !entry.id.trim().is_empty() {
                entry.id
            } else if let Some(link) = &link {
                link.clone()
            } else {
                hash_title(title.as_deref().unwrap_or_default())
            };
            FeedItem {
                id,
                title,
                link,
                summary: entry.summary.map(|s| s.content),
                published: entry.published.or(entry.updated),
            }
        })
        .collect();

    Ok(ParsedFeed {
        title: feed.title.map(|t| t.content.trim().to_string()),
        description: feed.description.map(|d| d.content),
        link: feed.links.first().map(|l| l.href.clone()),
        items,
    })
}

fn hash_title(title: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(title.as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    const RSS: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<rss version="2.0">
  <channel>
    <title>Example Feed</title>
    <link>https://a.example/</link>
    <description>Things happen</description>
    <item>
      <title>First post</title>
      <link>https://a.example/posts/1</link>
      <guid>post-1</guid>
      <description>Hello</description>
      <pubDate>Mon, 06 Jan 2025 10:00:00 GMT</pubDate>
    </item>
    <item>
      <title>Second post</title>
      <link>https://a.example/posts/2</link>
      <guid>post-2</guid>
    </item>
  </channel>
</rss>"#;

    #[test]
    fn test_parse_rss() {
        let feed = parse_feed(RSS.as_bytes()).unwrap();
        assert_eq!(feed.title.as_deref(), Some("Example Feed"));
        assert_eq!(feed.items.len(), 2);
        assert_eq!(feed.items[0].id, "post-1");
        assert_eq!(feed.items[0].title.as_deref(), Some("First post"));
        assert_eq!(
            feed.items[0].link.as_deref(),
            Some("https://a.example/posts/1")
        );
        assert!(feed.items[0].published.is_some());
    }

    #[test]
    fn test_parse_garbage_is_error() {
        let result = parse_feed(b"definitely not a feed");
        assert!(matches!(result, Err(FetchError::Parse(_))));
    }

    #[tokio::test]
    async fn test_mock_content_bypasses_network() {
        let fetcher = HttpFeedFetcher::new(&FetcherConfig::default()).unwrap();
        // Unroutable URL: only the mock path can succeed.
        let feed = fetcher
            .fetch(
                "http://invalid.invalid/feed.xml",
                &FetchOptions::with_mock_content(RSS),
            )
            .await
            .unwrap();
        assert_eq!(feed.items.len(), 2);
    }
}

//! snipfeed-feeds: collaborators consumed by the feed scheduler.
//!
//! - [`FeedFetcher`] downloads and parses feed content ([`HttpFeedFetcher`]).
//! - [`FeedStore`] persists feed metadata and items ([`JsonFeedStore`]).

pub mod fetcher;
pub mod store;

pub use fetcher::{FeedFetcher, FetchError, FetchOptions, HttpFeedFetcher, parse_feed};
pub use store::{FeedStore, FeedStoreError, FeedUpdate, JsonFeedStore, UpsertOutcome, write_atomic};

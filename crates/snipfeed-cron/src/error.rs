use thiserror::Error;

use snipfeed_feeds::FeedStoreError;
use snipfeed_types::InvalidFeedUrl;

/// Failures returned by [`crate::FeedScheduler`] operations.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("invalid schedule '{expression}': {}", .reasons.join("; "))]
    InvalidSchedule {
        expression: String,
        reasons: Vec<String>,
    },
    #[error("invalid feed URL: {0}")]
    InvalidUrl(#[from] InvalidFeedUrl),
    #[error("feed not found: {0}")]
    NotFound(String),
    #[error("feed id {id} is already used by {existing_url}")]
    IdCollision { id: String, existing_url: String },
    #[error("feed store error: {0}")]
    Collaborator(#[from] FeedStoreError),
    #[error("invalid scheduler config: {0}")]
    Config(String),
}

impl SchedulerError {
    pub(crate) fn invalid_schedule(expression: &str, reasons: Vec<String>) -> Self {
        Self::InvalidSchedule {
            expression: expression.to_string(),
            reasons,
        }
    }
}

/// Schedule store persistence failures. Logged, never returned by mutations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

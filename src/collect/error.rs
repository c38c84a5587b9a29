//! Error types for the per-request crawl pipeline
//!
//! Errors are split by how the worker pool reacts to them: permanent
//! discards are logged and dropped, transient failures go through the
//! failure bookkeeping and may be resubmitted once.

use thiserror::Error;

/// Errors produced while fetching a single page
#[derive(Error, Debug)]
pub enum FetchError {
    /// HTTP request error
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// Non-success status code
    #[error("Unexpected HTTP status: {0}")]
    Status(u16),

    /// Content decoding error
    #[error("Decoding error: {0}")]
    Decode(String),

    /// Invalid URL
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    /// Rate limiter refused or was cancelled
    #[error("Rate limiter: {0}")]
    Limit(#[from] LimitError),
}

impl FetchError {
    /// True when the limiter wait was aborted by cancellation
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Limit(LimitError::Cancelled))
    }
}

/// Errors raised by a rate limiter
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LimitError {
    /// Caller cancelled while waiting for a permit
    #[error("Rate limiter wait cancelled")]
    Cancelled,

    /// Requested burst can never be satisfied by the quota
    #[error("Rate limiter quota exhausted: {0}")]
    InsufficientCapacity(String),
}

/// Errors from the crawl pipeline
#[derive(Error, Debug)]
pub enum CrawlError {
    /// Request depth above the owning task's limit
    #[error("Max depth limit reached: depth {depth} > {max_depth}")]
    DepthExceeded { depth: u32, max_depth: u32 },

    /// Owning task has been deactivated
    #[error("Task closed: {0}")]
    TaskClosed(String),

    /// Fingerprint already visited
    #[error("Request already visited: {0}")]
    Duplicate(String),

    /// Body too small to contain useful content
    #[error("Body too short: {len} < {min}")]
    BodyTooShort { len: usize, min: usize },

    /// Body contains a known ban marker
    #[error("Fetch banned by remote site: {url}")]
    Banned { url: String },

    /// Fetch failure
    #[error("Fetch error: {0}")]
    Fetch(#[from] FetchError),

    /// A rule name with no entry in the task's rule tree
    #[error("Rule '{rule}' not found in task '{task}'")]
    RuleNotFound { task: String, rule: String },

    /// A parse rule or root generator failed
    #[error("Rule evaluation failed: {0}")]
    Rule(String),

    /// Task not present in the registry
    #[error("Unknown task: {0}")]
    UnknownTask(String),

    /// Storage collaborator failed
    #[error("Storage error: {0}")]
    Storage(String),

    /// The scheduler loop has stopped
    #[error("Scheduler closed")]
    SchedulerClosed,
}

impl CrawlError {
    /// Transient failures are the ones that enter the retry bookkeeping
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::Fetch(_) | Self::Banned { .. })
    }

    /// Permanent per-request discards, never resubmitted
    pub fn is_discard(&self) -> bool {
        matches!(
            self,
            Self::DepthExceeded { .. }
                | Self::TaskClosed(_)
                | Self::Duplicate(_)
                | Self::BodyTooShort { .. }
        )
    }
}

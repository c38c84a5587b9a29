//! Unified error handling for the crawlnet crate
//!
//! Each subsystem has its own error enum; [`Error`] wraps them all so
//! callers crossing module boundaries can classify a failure without
//! matching on every domain type. [`Crawler::run`](crate::engine::Crawler::run)
//! and the binary's commands return [`Result`].
//!
//! - [`ErrorCategory`] - Classification of errors for handling strategies
//! - [`Error`] - Unified error enum wrapping all domain-specific errors

use thiserror::Error;

// Re-export domain-specific errors for convenience
pub use crate::api::ApiError;
pub use crate::collect::error::{CrawlError, FetchError, LimitError};
pub use crate::master::error::MasterError;
pub use crate::store::error::StoreError;

/// Classification of errors for handling strategies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Fetch failures, bans, rate limiting
    Network,
    /// Rule evaluation and data decoding
    Parsing,
    /// Storage collaborator and I/O
    Storage,
    /// Election, store and assignment failures
    Coordination,
    /// Configuration and validation errors
    Config,
    /// Other/unknown errors
    Other,
}

/// Unified error type for the crawlnet crate
#[derive(Error, Debug)]
pub enum Error {
    /// Per-request pipeline errors
    #[error("Crawl error: {0}")]
    Crawl(#[from] CrawlError),

    #[error("Fetch error: {0}")]
    Fetch(#[from] FetchError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Master error: {0}")]
    Master(#[from] MasterError),

    #[error("API error: {0}")]
    Api(#[from] ApiError),

    #[error("Config error: {0}")]
    Config(String),

    /// Generic error with context
    #[error("{context}")]
    Other {
        context: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

impl Error {
    /// Check if this error is recoverable (can be retried)
    ///
    /// Transient fetch failures, bans and coordination errors are; request
    /// discards and configuration errors are not.
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Crawl(e) => e.is_recoverable(),
            Self::Fetch(e) => !e.is_cancelled(),
            Self::Store(e) => e.is_recoverable(),
            Self::Master(e) => e.is_recoverable(),
            Self::Api(ApiError::Client(_)) => true,
            Self::Api(_) => false,
            Self::Config(_) => false,
            Self::Other { .. } => false,
        }
    }

    /// Get the error category for handling strategies
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Crawl(e) => match e {
                CrawlError::Fetch(_) | CrawlError::Banned { .. } => ErrorCategory::Network,
                CrawlError::Rule(_) | CrawlError::RuleNotFound { .. } => ErrorCategory::Parsing,
                CrawlError::Storage(_) => ErrorCategory::Storage,
                CrawlError::UnknownTask(_) | CrawlError::SchedulerClosed => {
                    ErrorCategory::Coordination
                }
                _ => ErrorCategory::Other,
            },
            Self::Fetch(FetchError::Decode(_)) => ErrorCategory::Parsing,
            Self::Fetch(_) => ErrorCategory::Network,
            Self::Store(_) => ErrorCategory::Coordination,
            Self::Master(MasterError::Codec(_)) => ErrorCategory::Parsing,
            Self::Master(_) => ErrorCategory::Coordination,
            Self::Api(_) => ErrorCategory::Network,
            Self::Config(_) => ErrorCategory::Config,
            Self::Other { .. } => ErrorCategory::Other,
        }
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a generic error with context
    pub fn other(context: impl Into<String>) -> Self {
        Self::Other {
            context: context.into(),
            source: None,
        }
    }

    /// Create a generic error with context and source
    pub fn with_source(
        context: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Other {
            context: context.into(),
            source: Some(Box::new(source)),
        }
    }
}

// Conversion from anyhow::Error
impl From<anyhow::Error> for Error {
    fn from(err: anyhow::Error) -> Self {
        Self::Other {
            context: err.to_string(),
            source: None,
        }
    }
}

/// Result type alias using the unified Error type
pub type Result<T> = std::result::Result<T, Error>;

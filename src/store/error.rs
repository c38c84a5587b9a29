//! Errors from the consistent store, election and service registry

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// Backend could not be reached
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    /// The election session ended before or during a campaign
    #[error("Election session expired")]
    SessionExpired,

    /// No candidate currently holds leadership
    #[error("No leader elected")]
    NoLeader,

    /// Watch stream or backend shut down
    #[error("Store closed")]
    Closed,
}

impl StoreError {
    /// Every store error is retried by the coordinators; only `Closed` ends a loop
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, Self::Closed)
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;

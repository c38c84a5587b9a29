//! Master coordination errors

use thiserror::Error;

use crate::store::StoreError;

#[derive(Error, Debug)]
pub enum MasterError {
    /// Mutation sent to a follower; `leader` is the current leader identity, if known
    #[error("Not the leader (current leader: {})", leader.as_deref().unwrap_or("unknown"))]
    NotLeader { leader: Option<String> },

    /// Assignment attempted with empty membership
    #[error("no worker nodes")]
    NoWorkerNodes,

    #[error("No such resource: {0}")]
    UnknownResource(String),

    #[error("Invalid assigned node: {0:?}")]
    InvalidAssignedNode(String),

    #[error("Resource codec error: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("ID generator error: {0}")]
    IdGen(String),

    #[error("Local address discovery failed: {0}")]
    LocalAddress(String),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

impl MasterError {
    /// Coordination failures are retried by the caller or the next pass
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::NotLeader { .. } | Self::NoWorkerNodes => true,
            Self::Store(e) => e.is_recoverable(),
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, MasterError>;

//! Consistent store, leader election and service discovery
//!
//! The coordinators only see these traits. A production deployment backs
//! them with a strongly-consistent key-value service; [`memory`] provides
//! process-local versions used by single-process clusters and tests.

pub mod error;
pub mod memory;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};

pub use error::{Result, StoreError};
pub use memory::{MemoryElection, MemoryKv, MemoryRegistry};

/// Lease TTL election sessions are bound to
pub const ELECTION_LEASE_TTL: Duration = Duration::from_secs(5);

// ============================================================================
// Key-Value Store
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyValue {
    pub key: String,
    pub value: String,
}

/// Change notification for a watched prefix
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent {
    Put {
        key: String,
        value: String,
        prev: Option<String>,
    },
    Delete {
        key: String,
        prev: Option<String>,
    },
}

impl WatchEvent {
    pub fn key(&self) -> &str {
        match self {
            Self::Put { key, .. } | Self::Delete { key, .. } => key,
        }
    }
}

pub type WatchStream = mpsc::UnboundedReceiver<WatchEvent>;

#[async_trait]
pub trait KvStore: Send + Sync {
    async fn put(&self, key: &str, value: String) -> Result<()>;

    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// All entries under a prefix, in key order
    async fn get_prefix(&self, prefix: &str) -> Result<Vec<KeyValue>>;

    /// Remove a key, returning its previous value
    async fn delete(&self, key: &str) -> Result<Option<String>>;

    /// Stream of changes under a prefix, starting now
    async fn watch(&self, prefix: &str) -> Result<WatchStream>;
}

// ============================================================================
// Election
// ============================================================================

/// Lease-bound leader election over one well-known key
#[async_trait]
pub trait Election: Send + Sync {
    /// Block until `value` holds leadership
    ///
    /// Fails with `SessionExpired` if the candidate's session ends first.
    async fn campaign(&self, value: &str) -> Result<()>;

    /// Leadership changes; `None` while nobody leads
    fn observe(&self) -> watch::Receiver<Option<String>>;

    /// Authoritative current leader value
    async fn leader(&self) -> Result<String>;

    /// Refresh the lease of `value`'s session
    ///
    /// Fails with `SessionExpired` once the lease has lapsed; the holder
    /// must campaign again.
    async fn keep_alive(&self, value: &str) -> Result<()>;

    /// TTL of a session lease; holders refresh well inside it
    fn lease_ttl(&self) -> Duration {
        ELECTION_LEASE_TTL
    }

    /// Give up leadership or candidacy
    async fn resign(&self, value: &str) -> Result<()>;
}

// ============================================================================
// Service Discovery
// ============================================================================

/// One registered service instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub id: String,
    pub address: String,

    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl Node {
    pub fn new(id: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            address: address.into(),
            metadata: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceEvent {
    Registered(Node),
    Deregistered(Node),
}

pub type ServiceStream = mpsc::UnboundedReceiver<ServiceEvent>;

#[async_trait]
pub trait ServiceRegistry: Send + Sync {
    async fn register(&self, service: &str, node: Node) -> Result<()>;

    async fn deregister(&self, service: &str, node_id: &str) -> Result<()>;

    async fn get_service(&self, service: &str) -> Result<Vec<Node>>;

    async fn watch(&self, service: &str) -> Result<ServiceStream>;
}

/// The collaborators a clustered process needs
#[derive(Clone)]
pub struct Cluster {
    pub kv: Arc<dyn KvStore>,
    pub election: Arc<dyn Election>,
    pub registry: Arc<dyn ServiceRegistry>,
}

impl Cluster {
    /// Process-local cluster backed by the in-memory implementations
    pub fn in_memory() -> Self {
        Self {
            kv: Arc::new(MemoryKv::new()),
            election: Arc::new(MemoryElection::new()),
            registry: Arc::new(MemoryRegistry::new()),
        }
    }
}

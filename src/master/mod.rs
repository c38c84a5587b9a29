//! Master side of the cluster
//!
//! Masters elect one leader, which assigns each resource (crawl task) to the
//! least-loaded worker and persists the assignment in the consistent store.

pub mod coordinator;
pub mod error;
pub mod identity;
pub mod idgen;
pub mod node;
pub mod resource;

pub use coordinator::{Leadership, MasterConfig, MasterCoordinator};
pub use error::MasterError;
pub use node::{MembershipDiff, NodeSpec};
pub use resource::{ResourceSpec, ELECTION_KEY, RESOURCE_PATH};

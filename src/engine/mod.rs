//! Worker-side runtime
//!
//! One [`RequestScheduler`] feeds a [`WorkerPool`]; parse output flows to the
//! [`ResultSink`]. The [`WorkerCoordinator`] decides which registered tasks
//! run, and [`Crawler`] assembles all of it into a worker process.

pub mod builtin;
pub mod coordinator;
pub mod crawler;
pub mod registry;
pub mod scheduler;
pub mod sink;
pub mod worker;

pub use coordinator::{activate_seeds, WorkerCoordinator};
pub use crawler::{Crawler, CrawlerConfig};
pub use registry::TaskRegistry;
pub use scheduler::RequestScheduler;
pub use sink::ResultSink;
pub use worker::{ParseOutput, PoolConfig, WorkerPool, DEFAULT_BAN_MARKER};

//! crawlnet - Fault-tolerant distributed crawler
//!
//! Masters elect a leader through a consistent store; the leader assigns
//! each crawl task to the least-loaded worker. Workers watch their
//! assignments and run the assigned tasks through a priority scheduler and
//! a deduplicating worker pool.
//!
//! # Architecture
//!
//! The library is organized into several modules:
//!
//! - [`collect`] - Requests, tasks, rule trees, fetching, rate limits, storage
//! - [`engine`] - Worker runtime: scheduler, worker pool, result sink, coordinator
//! - [`master`] - Leader election and resource assignment
//! - [`store`] - Consistent store, election and discovery traits
//! - [`api`] - HTTP transport for the master
//! - [`config`] - Configuration management and settings
//! - [`metrics`] - Prometheus metrics
//! - [`utils`] - Common utilities and helpers
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use crawlnet::collect::{LogStorage, TaskOptions};
//! use crawlnet::engine::{builtin, Crawler, CrawlerConfig, TaskRegistry};
//! use crawlnet::collect::HttpFetcher;
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let options = TaskOptions {
//!         url: "https://example.com/".into(),
//!         ..TaskOptions::new("example")
//!     };
//!     let fetcher = Arc::new(HttpFetcher::new(std::time::Duration::from_secs(3))?);
//!     let mut registry = TaskRegistry::new();
//!     registry.add(builtin::link_follower(options, fetcher, Arc::new(LogStorage)));
//!
//!     let config = CrawlerConfig {
//!         seeds: vec!["example".into()],
//!         ..CrawlerConfig::default()
//!     };
//!     let crawler = Crawler::new(config, Arc::new(registry));
//!     crawler.run(None, CancellationToken::new()).await?;
//!     Ok(())
//! }
//! ```

pub mod api;
pub mod collect;
pub mod config;
pub mod engine;
pub mod error;
pub mod master;
pub mod metrics;
pub mod store;
pub mod utils;

pub use error::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::collect::{
        CrawlerContext, DataCell, Fetcher, HttpFetcher, Item, ParseResult, Request, RequestSeed,
        Rule, RuleTree, Storager, Task, TaskOptions,
    };
    pub use crate::config::Config;
    pub use crate::engine::{Crawler, CrawlerConfig, PoolConfig, TaskRegistry};
    pub use crate::error::{Error, ErrorCategory, Result};
    pub use crate::master::{Leadership, MasterConfig, MasterCoordinator};
    pub use crate::store::Cluster;
}

//! Crawl data model and per-task collaborators
//!
//! Everything a single task needs to turn a URL into parsed output lives
//! here: requests, rule trees, the fetcher, rate limiters and storage.
//! The worker-side runtime that drives them is in [`crate::engine`].

pub mod error;
pub mod fetcher;
pub mod limiter;
pub mod request;
pub mod rule;
pub mod storage;
pub mod task;

pub use error::{CrawlError, FetchError, LimitError};
pub use fetcher::{Fetcher, HttpFetcher};
pub use limiter::{LimitConfig, MultiLimiter, RateLimiter, TokenBucket, Unlimited};
pub use request::{fingerprint, Request, RequestSeed, TmpData};
pub use rule::{
    CrawlerContext, DataCell, Item, ParseFn, ParseResult, RootFn, Rule, RuleTree, ScriptEngine,
};
pub use storage::{LogStorage, MemoryStorage, Storager};
pub use task::{RuleModel, Task, TaskModel, TaskOptions};

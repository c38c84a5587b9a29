//! Task definitions
//!
//! A [`Task`] is created once at startup and lives for the whole process.
//! Only its `closed` flag changes, flipped by the worker coordinator on
//! activation and deactivation and read by worker loops on every request.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use super::fetcher::Fetcher;
use super::limiter::{self, LimitConfig, RateLimiter};
use super::rule::RuleTree;
use super::storage::Storager;

fn default_max_depth() -> u32 {
    5
}

/// Configurable part of a task
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskOptions {
    /// Unique task name, also the resource name in the store
    pub name: String,

    /// Entry URL, used by generic root generators
    pub url: String,

    /// Cookie header sent with every request
    pub cookie: String,

    /// Upper bound of the random pre-fetch delay, in seconds
    pub wait_time_secs: u64,

    /// Allow re-fetching visited fingerprints
    pub reload: bool,

    /// Deepest request depth that will be fetched
    #[serde(default = "default_max_depth")]
    pub max_depth: u32,

    /// Token buckets, all of which must admit a request
    pub limits: Vec<LimitConfig>,
}

impl Default for TaskOptions {
    fn default() -> Self {
        Self {
            name: String::new(),
            url: String::new(),
            cookie: String::new(),
            wait_time_secs: 0,
            reload: false,
            max_depth: default_max_depth(),
            limits: Vec::new(),
        }
    }
}

impl TaskOptions {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }
}

/// A named crawl job
pub struct Task {
    options: TaskOptions,
    rules: RuleTree,
    fetcher: Arc<dyn Fetcher>,
    storage: Arc<dyn Storager>,
    limiter: Arc<dyn RateLimiter>,
    closed: AtomicBool,
}

impl Task {
    /// Build a task; the limiter is derived from `options.limits`
    ///
    /// Tasks start closed and are opened on activation.
    pub fn new(
        options: TaskOptions,
        rules: RuleTree,
        fetcher: Arc<dyn Fetcher>,
        storage: Arc<dyn Storager>,
    ) -> Self {
        let limiter = limiter::from_configs(&options.limits);
        Self {
            options,
            rules,
            fetcher,
            storage,
            limiter,
            closed: AtomicBool::new(true),
        }
    }

    /// Replace the derived limiter
    pub fn with_limiter(mut self, limiter: Arc<dyn RateLimiter>) -> Self {
        self.limiter = limiter;
        self
    }

    pub fn name(&self) -> &str {
        &self.options.name
    }

    pub fn options(&self) -> &TaskOptions {
        &self.options
    }

    pub fn rules(&self) -> &RuleTree {
        &self.rules
    }

    pub fn fetcher(&self) -> &Arc<dyn Fetcher> {
        &self.fetcher
    }

    pub fn storage(&self) -> &Arc<dyn Storager> {
        &self.storage
    }

    pub fn limiter(&self) -> &Arc<dyn RateLimiter> {
        &self.limiter
    }

    pub fn wait_time(&self) -> Duration {
        Duration::from_secs(self.options.wait_time_secs)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Reject all future requests of this task
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    pub fn open(&self) {
        self.closed.store(false, Ordering::Release);
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("options", &self.options)
            .field("rules", &self.rules)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// One scripted rule
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleModel {
    pub name: String,

    /// Parse script source
    pub parse: String,
}

/// Scripted task definition, usually loaded from JSON
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskModel {
    #[serde(flatten)]
    pub options: TaskOptions,

    /// Root script source
    pub root: String,

    #[serde(default)]
    pub rules: Vec<RuleModel>,
}

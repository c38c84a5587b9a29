//! Crawl requests and their fingerprints

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::sync::Arc;

use super::error::CrawlError;
use super::task::Task;

/// Per-request scratch data handed from a parent rule to its children
pub type TmpData = serde_json::Map<String, serde_json::Value>;

fn default_method() -> String {
    "GET".to_string()
}

/// A request description without an owning task
///
/// Root generators and parse rules emit seeds; the engine turns them into
/// [`Request`]s by attaching the task and depth, so a task reference and a
/// depth are always present on anything that reaches the scheduler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestSeed {
    pub url: String,

    #[serde(default = "default_method")]
    pub method: String,

    /// Positive values go to the priority queue
    #[serde(default)]
    pub priority: i32,

    /// Target rule in the owning task's rule tree
    pub rule_name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tmp: Option<TmpData>,
}

impl RequestSeed {
    /// Create a GET seed for a rule
    pub fn new(url: impl Into<String>, rule_name: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            method: default_method(),
            priority: 0,
            rule_name: rule_name.into(),
            tmp: None,
        }
    }

    /// Set priority
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Set HTTP method
    pub fn with_method(mut self, method: impl Into<String>) -> Self {
        self.method = method.into();
        self
    }

    /// Attach a scratch value
    pub fn with_tmp(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.tmp.get_or_insert_with(TmpData::new).insert(key.into(), value);
        self
    }
}

/// One crawl unit owned by a live task
#[derive(Clone)]
pub struct Request {
    pub task: Arc<Task>,
    pub url: String,
    pub method: String,
    pub depth: u32,
    pub priority: i32,
    pub rule_name: String,
    pub tmp: Option<TmpData>,
}

impl Request {
    /// Bind a seed to its task at the given depth
    pub fn from_seed(seed: RequestSeed, task: Arc<Task>, depth: u32) -> Self {
        Self {
            task,
            url: seed.url,
            method: seed.method,
            depth,
            priority: seed.priority,
            rule_name: seed.rule_name,
            tmp: seed.tmp,
        }
    }

    /// Name of the owning task
    pub fn task_name(&self) -> &str {
        self.task.name()
    }

    /// Deterministic hash of url and method, used for dedup and retry tracking
    pub fn fingerprint(&self) -> String {
        fingerprint(&self.url, &self.method)
    }

    /// Reject requests that must never be fetched
    pub fn check(&self) -> Result<(), CrawlError> {
        let max_depth = self.task.options().max_depth;
        if self.depth > max_depth {
            return Err(CrawlError::DepthExceeded {
                depth: self.depth,
                max_depth,
            });
        }
        if self.task.is_closed() {
            return Err(CrawlError::TaskClosed(self.task_name().to_string()));
        }
        Ok(())
    }

    /// Read a scratch value set by the parent rule
    pub fn tmp_value(&self, key: &str) -> Option<&serde_json::Value> {
        self.tmp.as_ref().and_then(|tmp| tmp.get(key))
    }
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request")
            .field("task", &self.task_name())
            .field("url", &self.url)
            .field("method", &self.method)
            .field("depth", &self.depth)
            .field("priority", &self.priority)
            .field("rule_name", &self.rule_name)
            .finish()
    }
}

/// Fingerprint of a url/method pair
pub fn fingerprint(url: &str, method: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(url.as_bytes());
    hasher.update(method.as_bytes());
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collect::testing::task_with_depth;

    #[test]
    fn test_fingerprint_depends_on_method() {
        assert_eq!(fingerprint("http://a", "GET"), fingerprint("http://a", "GET"));
        assert_ne!(fingerprint("http://a", "GET"), fingerprint("http://a", "POST"));
        assert_eq!(fingerprint("http://a", "GET").len(), 64);
    }

    #[test]
    fn test_check_depth_limit() {
        let task = task_with_depth("depth", 2);
        task.open();
        let ok = Request::from_seed(RequestSeed::new("http://a", "list"), task.clone(), 2);
        assert!(ok.check().is_ok());

        let deep = Request::from_seed(RequestSeed::new("http://a", "list"), task, 3);
        assert!(matches!(
            deep.check(),
            Err(CrawlError::DepthExceeded { depth: 3, max_depth: 2 })
        ));
    }

    #[test]
    fn test_check_closed_task() {
        let task = task_with_depth("closed", 5);
        task.open();
        let req = Request::from_seed(RequestSeed::new("http://a", "list"), task.clone(), 0);
        assert!(req.check().is_ok());

        task.close();
        assert!(matches!(req.check(), Err(CrawlError::TaskClosed(_))));
    }

    #[test]
    fn test_seed_deserialize_defaults() {
        let seed: RequestSeed =
            serde_json::from_str(r#"{"url":"http://a","rule_name":"list"}"#).unwrap();
        assert_eq!(seed.method, "GET");
        assert_eq!(seed.priority, 0);
        assert!(seed.tmp.is_none());
    }

    #[test]
    fn test_tmp_carried_to_request() {
        let task = task_with_depth("tmp", 5);
        let seed = RequestSeed::new("http://a", "detail").with_tmp("title", "hello".into());
        let req = Request::from_seed(seed, task, 1);
        assert_eq!(req.tmp_value("title").and_then(|v| v.as_str()), Some("hello"));
        assert!(req.tmp_value("missing").is_none());
    }
}

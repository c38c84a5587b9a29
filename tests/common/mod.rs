//! Common test utilities

#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crawlnet::collect::{
    FetchError, Fetcher, MemoryStorage, Request, Storager, Task, TaskOptions,
};
use crawlnet::engine::builtin::link_follower;

/// Serves canned pages; unknown URLs fail with a 404
#[derive(Default)]
pub struct PageFetcher {
    pages: HashMap<String, String>,
    failures: Mutex<HashMap<String, usize>>,
    calls: Mutex<Vec<String>>,
}

impl PageFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn page(mut self, url: &str, body: &str) -> Self {
        self.pages.insert(url.to_string(), padded(body));
        self
    }

    /// Page served without padding, so it fails the minimum length check
    pub fn short_page(mut self, url: &str, body: &str) -> Self {
        self.pages.insert(url.to_string(), body.to_string());
        self
    }

    /// Fail the next `count` fetches of `url` with a 503
    pub fn failing(self, url: &str, count: usize) -> Self {
        self.failures.lock().unwrap().insert(url.to_string(), count);
        self
    }

    pub fn call_count(&self, url: &str) -> usize {
        self.calls.lock().unwrap().iter().filter(|u| *u == url).count()
    }
}

#[async_trait]
impl Fetcher for PageFetcher {
    async fn get(&self, request: &Request) -> Result<String, FetchError> {
        self.calls.lock().unwrap().push(request.url.clone());
        {
            let mut failures = self.failures.lock().unwrap();
            if let Some(left) = failures.get_mut(&request.url) {
                if *left > 0 {
                    *left -= 1;
                    return Err(FetchError::Status(503));
                }
            }
        }
        self.pages
            .get(&request.url)
            .cloned()
            .ok_or(FetchError::Status(404))
    }
}

/// Pad a body past the default minimum length
pub fn padded(body: &str) -> String {
    format!("{body}{}", " ".repeat(6000))
}

/// Link-following task over `fetcher`, storing into `storage`
pub fn site_task(
    name: &str,
    entry: &str,
    max_depth: u32,
    fetcher: Arc<dyn Fetcher>,
    storage: Arc<dyn Storager>,
) -> Task {
    let options = TaskOptions {
        url: entry.to_string(),
        max_depth,
        ..TaskOptions::new(name)
    };
    link_follower(options, fetcher, storage)
}

/// Titles of stored records, sorted
pub async fn titles(storage: &MemoryStorage) -> Vec<String> {
    let mut titles: Vec<String> = storage
        .cells()
        .await
        .iter()
        .filter_map(|c| c.get("title").and_then(|v| v.as_str()).map(str::to_string))
        .collect();
    titles.sort();
    titles
}

/// Poll an async condition until it holds or five seconds pass
pub async fn eventually<F, Fut>(what: &str, cond: F)
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let reached = tokio::time::timeout(Duration::from_secs(5), async {
        while !cond().await {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(reached.is_ok(), "timed out waiting for: {what}");
}

//! Worker pool and the per-request pipeline
//!
//! Each loop pulls one request, checks it, marks it visited, fetches,
//! validates the body, parses, and feeds children back to the scheduler.
//! Transient failures (fetch errors, bans) go through [`WorkerPool::set_failure`],
//! which resubmits a fingerprint at most once.

use rand::Rng;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::scheduler::RequestScheduler;
use crate::collect::{CrawlError, CrawlerContext, FetchError, Item, Request};

/// Marker served by a site that has flagged this crawler as a bot
pub const DEFAULT_BAN_MARKER: &str = "你访问豆瓣的方式有点像机器人程序";

/// Worker pool settings
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Number of concurrent worker loops
    pub work_count: usize,

    /// Bodies shorter than this are discarded
    pub min_body_len: usize,

    /// Any of these in a body marks the fetch as banned
    pub ban_markers: Vec<String>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            work_count: 5,
            min_body_len: 6000,
            ban_markers: vec![DEFAULT_BAN_MARKER.to_string()],
        }
    }
}

/// Parsed output handed to the result sink
#[derive(Debug, Clone)]
pub struct ParseOutput {
    pub task: String,
    pub url: String,

    /// Number of child requests the rule produced
    pub requests: usize,

    pub items: Vec<Item>,
}

/// Shared state of all worker loops
pub struct WorkerPool {
    config: PoolConfig,
    scheduler: RequestScheduler,
    out: mpsc::Sender<ParseOutput>,
    visited: Mutex<HashSet<String>>,
    // Grows for the lifetime of the process; entries are never removed
    failures: Mutex<HashMap<String, Request>>,
}

impl WorkerPool {
    pub fn new(
        config: PoolConfig,
        scheduler: RequestScheduler,
        out: mpsc::Sender<ParseOutput>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            scheduler,
            out,
            visited: Mutex::new(HashSet::new()),
            failures: Mutex::new(HashMap::new()),
        })
    }

    /// Start `work_count` loops
    pub fn spawn(self: &Arc<Self>, cancel: CancellationToken) -> Vec<JoinHandle<()>> {
        (0..self.config.work_count.max(1))
            .map(|id| tokio::spawn(self.clone().work_loop(id, cancel.clone())))
            .collect()
    }

    async fn work_loop(self: Arc<Self>, id: usize, cancel: CancellationToken) {
        tracing::debug!(worker = id, "Worker loop started");

        loop {
            let request = tokio::select! {
                _ = cancel.cancelled() => break,
                pulled = self.scheduler.pull() => match pulled {
                    Ok(request) => request,
                    Err(_) => break,
                },
            };

            if let Err(CrawlError::SchedulerClosed) = self.process(request, &cancel).await {
                break;
            }
        }

        tracing::debug!(worker = id, "Worker loop stopped");
    }

    /// Run one request through the pipeline
    ///
    /// Every outcome is logged here; the returned error only tells the
    /// caller what happened.
    pub async fn process(
        &self,
        request: Request,
        cancel: &CancellationToken,
    ) -> Result<(), CrawlError> {
        if let Err(e) = request.check() {
            tracing::warn!(url = %request.url, task = request.task_name(), error = %e, "Check failed");
            crate::metrics::record_discard("check");
            return Err(e);
        }

        if !request.task.options().reload && !self.mark_visited(&request).await {
            tracing::debug!(url = %request.url, "Request has been visited");
            crate::metrics::record_discard("duplicate");
            return Err(CrawlError::Duplicate(request.url.clone()));
        }

        let body = match self.fetch(&request, cancel).await {
            Ok(body) => body,
            Err(e) if e.is_cancelled() => {
                tracing::debug!(url = %request.url, "Fetch cancelled");
                return Err(e.into());
            }
            Err(e) => {
                tracing::warn!(url = %request.url, error = %e, "Fetch failed");
                crate::metrics::record_fetch(request.task_name(), "failed");
                self.set_failure(request).await?;
                return Err(e.into());
            }
        };

        if self
            .config
            .ban_markers
            .iter()
            .any(|marker| !marker.is_empty() && body.contains(marker.as_str()))
        {
            tracing::warn!(url = %request.url, "Fetch banned");
            crate::metrics::record_fetch(request.task_name(), "banned");
            let url = request.url.clone();
            self.set_failure(request).await?;
            return Err(CrawlError::Banned { url });
        }

        if body.len() < self.config.min_body_len {
            tracing::warn!(
                url = %request.url,
                length = body.len(),
                "Fetch body too short"
            );
            crate::metrics::record_fetch(request.task_name(), "short");
            return Err(CrawlError::BodyTooShort {
                len: body.len(),
                min: self.config.min_body_len,
            });
        }

        crate::metrics::record_fetch(request.task_name(), "ok");
        self.parse(request, &body).await
    }

    async fn fetch(
        &self,
        request: &Request,
        cancel: &CancellationToken,
    ) -> Result<String, FetchError> {
        request.task.limiter().wait(cancel).await?;

        let wait_ms = request.task.wait_time().as_millis() as u64;
        if wait_ms > 0 {
            let delay = rand::thread_rng().gen_range(0..wait_ms);
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }

        tracing::info!(url = %request.url, task = request.task_name(), "Fetching");
        request.task.fetcher().get(request).await
    }

    async fn parse(&self, request: Request, body: &str) -> Result<(), CrawlError> {
        let task = request.task.clone();
        let Some(rule) = task.rules().rule(&request.rule_name) else {
            tracing::error!(task = task.name(), rule = %request.rule_name, "Rule not found");
            return Err(CrawlError::RuleNotFound {
                task: task.name().to_string(),
                rule: request.rule_name.clone(),
            });
        };

        let result = {
            let ctx = CrawlerContext::new(body, &request);
            rule.parse.call(&ctx)
        };
        let result = match result {
            Ok(result) => result,
            Err(e) => {
                tracing::error!(url = %request.url, rule = %request.rule_name, error = %e, "Parse failed");
                return Err(e);
            }
        };

        let children: Vec<Request> = result
            .requests
            .into_iter()
            .map(|seed| Request::from_seed(seed, task.clone(), request.depth + 1))
            .collect();
        let requests = children.len();
        if requests > 0 {
            self.scheduler.push(children).await?;
        }

        let output = ParseOutput {
            task: task.name().to_string(),
            url: request.url,
            requests,
            items: result.items,
        };
        self.out
            .send(output)
            .await
            .map_err(|_| CrawlError::SchedulerClosed)
    }

    /// Check-and-mark in one critical section; false if already visited
    async fn mark_visited(&self, request: &Request) -> bool {
        self.visited.lock().await.insert(request.fingerprint())
    }

    pub async fn has_visited(&self, request: &Request) -> bool {
        self.visited.lock().await.contains(&request.fingerprint())
    }

    /// Record a transient failure and resubmit the request once
    ///
    /// The first failure of a fingerprint is recorded and resubmitted;
    /// later failures find the entry already present and are dropped.
    pub async fn set_failure(&self, request: Request) -> Result<(), CrawlError> {
        let fingerprint = request.fingerprint();
        let url = request.url.clone();

        if !request.task.options().reload {
            self.visited.lock().await.remove(&fingerprint);
        }

        let resubmit = {
            let mut failures = self.failures.lock().await;
            if failures.contains_key(&fingerprint) {
                None
            } else {
                failures.insert(fingerprint.clone(), request.clone());
                Some(request)
            }
        };

        match resubmit {
            Some(request) => {
                tracing::info!(%url, %fingerprint, "Resubmitting failed request");
                crate::metrics::record_retry();
                self.scheduler.push(std::iter::once(request)).await
            }
            None => {
                tracing::warn!(%url, %fingerprint, "Request failed again, not retrying");
                Ok(())
            }
        }
    }

    pub async fn failure_count(&self) -> usize {
        self.failures.lock().await.len()
    }
}

//! Worker coordinator: resource watch and task activation
//!
//! A worker runs the tasks whose resource record names it. The watch is
//! opened before the startup scan so no change between the two is lost;
//! after a broken watch the scan runs again to reconcile.

use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use super::registry::TaskRegistry;
use super::scheduler::RequestScheduler;
use crate::collect::{CrawlError, Request};
use crate::master::resource::{ResourceSpec, RESOURCE_PATH};
use crate::store::{KvStore, StoreError, WatchEvent, WatchStream};
use crate::utils::retry::{with_retry_if, RetryConfig};

pub struct WorkerCoordinator {
    id: String,
    registry: Arc<TaskRegistry>,
    scheduler: RequestScheduler,
    running: Mutex<HashSet<String>>,
}

impl WorkerCoordinator {
    pub fn new(
        id: impl Into<String>,
        registry: Arc<TaskRegistry>,
        scheduler: RequestScheduler,
    ) -> Arc<Self> {
        Arc::new(Self {
            id: id.into(),
            registry,
            scheduler,
            running: Mutex::new(HashSet::new()),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Names of running tasks, sorted
    pub async fn running(&self) -> Vec<String> {
        let mut names: Vec<String> = self.running.lock().await.iter().cloned().collect();
        names.sort();
        names
    }

    // ========================================================================
    // Activation
    // ========================================================================

    /// Start a task and push its root requests
    ///
    /// Returns false if the task was already running or is unknown.
    pub async fn activate(&self, name: &str) -> Result<bool, CrawlError> {
        let (task, seeds) = {
            let mut running = self.running.lock().await;
            if running.contains(name) {
                tracing::info!(task = name, "Task has running");
                return Ok(false);
            }
            let Some(task) = self.registry.get(name) else {
                tracing::error!(task = name, "Can not find preset task");
                return Ok(false);
            };

            task.open();
            let seeds = match task.rules().root() {
                Ok(seeds) => seeds,
                Err(e) => {
                    task.close();
                    tracing::error!(task = name, error = %e, "Get root failed");
                    return Err(e);
                }
            };
            running.insert(name.to_string());
            crate::metrics::set_running_tasks(running.len());
            (task, seeds)
        };

        tracing::info!(task = name, requests = seeds.len(), "Task activated");
        let requests: Vec<Request> = seeds
            .into_iter()
            .map(|seed| Request::from_seed(seed, task.clone(), 0))
            .collect();
        self.scheduler.push(requests).await?;
        Ok(true)
    }

    /// Close a task; in-flight requests drain and fail their next check
    pub async fn deactivate(&self, name: &str) -> bool {
        let mut running = self.running.lock().await;
        let Some(task) = self.registry.get(name) else {
            tracing::error!(task = name, "Can not find preset task");
            return false;
        };

        task.close();
        let was_running = running.remove(name);
        crate::metrics::set_running_tasks(running.len());
        tracing::info!(task = name, was_running, "Task deactivated");
        was_running
    }

    fn is_mine(&self, spec: &ResourceSpec) -> bool {
        matches!(spec.node_id(), Ok(id) if id == self.id)
    }

    // ========================================================================
    // Store Watch
    // ========================================================================

    /// Activate every resource assigned here and stop any running task that
    /// no longer is
    pub async fn load_resources(&self, kv: &dyn KvStore) -> Result<usize, StoreError> {
        let entries = kv.get_prefix(&format!("{RESOURCE_PATH}/")).await?;

        let mine: HashSet<String> = entries
            .iter()
            .filter_map(|entry| ResourceSpec::decode(&entry.value).ok())
            .filter(|spec| !spec.name.is_empty() && self.is_mine(spec))
            .map(|spec| spec.name)
            .collect();
        tracing::info!(worker = %self.id, length = mine.len(), "Load resource");

        for stale in self.running().await {
            if !mine.contains(&stale) {
                self.deactivate(&stale).await;
            }
        }

        let mut names: Vec<&String> = mine.iter().collect();
        names.sort();
        for name in names {
            if let Err(e) = self.activate(name).await {
                tracing::error!(task = %name, error = %e, "Activate failed");
            }
        }
        Ok(mine.len())
    }

    /// Apply one change from the resource watch
    pub async fn handle_event(&self, event: WatchEvent) {
        match event {
            WatchEvent::Put { key, value, prev } => {
                let spec = match ResourceSpec::decode(&value) {
                    Ok(spec) => spec,
                    Err(e) => {
                        tracing::debug!(%key, error = %e, "Decode resource failed");
                        return;
                    }
                };
                if spec.name.is_empty() {
                    return;
                }
                if prev.is_none() {
                    tracing::info!(resource = %spec.name, node = %spec.assigned_node, "Receive created resource");
                } else {
                    tracing::info!(resource = %spec.name, node = %spec.assigned_node, "Receive update resource");
                }

                if self.is_mine(&spec) {
                    if let Err(e) = self.activate(&spec.name).await {
                        tracing::error!(task = %spec.name, error = %e, "Activate failed");
                    }
                } else if self.running.lock().await.contains(&spec.name) {
                    tracing::info!(resource = %spec.name, "Resource moved to another node");
                    self.deactivate(&spec.name).await;
                }
            }
            WatchEvent::Delete { key, prev } => {
                let Some(prev) = prev else {
                    tracing::debug!(%key, "Delete without previous value");
                    return;
                };
                match ResourceSpec::decode(&prev) {
                    Ok(spec) if !spec.name.is_empty() => {
                        tracing::info!(resource = %spec.name, "Receive deleted resource");
                        self.deactivate(&spec.name).await;
                    }
                    Ok(_) => {}
                    Err(e) => tracing::debug!(%key, error = %e, "Decode resource failed"),
                }
            }
        }
    }

    /// Scan, then follow the resource watch until cancelled
    pub async fn run(self: Arc<Self>, kv: Arc<dyn KvStore>, cancel: CancellationToken) {
        let backoff = RetryConfig::with_delays(u32::MAX, 500, 10_000);
        let mut attempt = 0u32;

        loop {
            let stream = tokio::select! {
                _ = cancel.cancelled() => return,
                stream = self.open_watch(kv.as_ref(), &backoff) => stream,
            };
            let Some(mut stream) = stream else {
                return;
            };

            let scan = with_retry_if(
                &backoff,
                || self.load_resources(kv.as_ref()),
                StoreError::is_recoverable,
            );
            tokio::select! {
                _ = cancel.cancelled() => return,
                result = scan => {
                    if let Err(e) = result {
                        tracing::error!(error = %e, "Resource scan failed");
                    }
                }
            }

            if !self.follow(&mut stream, &cancel).await {
                return;
            }

            attempt = attempt.saturating_add(1);
            let delay = backoff.delay(attempt);
            tracing::warn!(delay_ms = delay.as_millis() as u64, "Watch resource closed, re-watching");
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    async fn open_watch(&self, kv: &dyn KvStore, backoff: &RetryConfig) -> Option<WatchStream> {
        let prefix = format!("{RESOURCE_PATH}/");
        with_retry_if(backoff, || kv.watch(&prefix), StoreError::is_recoverable)
            .await
            .map_err(|e| tracing::error!(error = %e, "Watch resource failed"))
            .ok()
    }

    /// Returns false when cancelled, true when the stream ended
    async fn follow(&self, stream: &mut WatchStream, cancel: &CancellationToken) -> bool {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return false,
                event = stream.recv() => match event {
                    Some(event) => self.handle_event(event).await,
                    None => return true,
                },
            }
        }
    }
}

/// Activate every named task without consulting the store
pub async fn activate_seeds(coordinator: &WorkerCoordinator, seeds: &[String]) -> usize {
    let mut activated = 0;
    for seed in seeds {
        match coordinator.activate(seed).await {
            Ok(true) => activated += 1,
            Ok(false) => {}
            Err(e) => tracing::error!(task = %seed, error = %e, "Task rule root failed"),
        }
    }
    activated
}

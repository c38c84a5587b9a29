//! Worker process composition
//!
//! Wires the scheduler, worker pool, result sink and worker coordinator
//! together. In cluster mode the worker registers itself for discovery and
//! follows its resource assignments; standalone it activates the configured
//! seed tasks directly.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::coordinator::{activate_seeds, WorkerCoordinator};
use super::registry::TaskRegistry;
use super::scheduler::RequestScheduler;
use super::sink::ResultSink;
use super::worker::{PoolConfig, WorkerPool};
use crate::master::identity;
use crate::error::Result;
use crate::store::{Cluster, Node};

/// Capacity of the worker pool to result sink channel
const RESULT_BUFFER: usize = 64;

/// Worker process settings
#[derive(Debug, Clone)]
pub struct CrawlerConfig {
    /// Discovery service the worker registers under
    pub service_name: String,

    /// Configured short id; a timestamp is used when empty
    pub id: String,

    /// Address advertised in discovery
    pub address: String,

    pub pool: PoolConfig,

    /// Quiet period after which the sink logs that no data arrived
    pub idle: Duration,

    /// Tasks started directly in standalone mode
    pub seeds: Vec<String>,
}

impl Default for CrawlerConfig {
    fn default() -> Self {
        Self {
            service_name: "crawlnet.worker".to_string(),
            id: String::new(),
            address: ":9090".to_string(),
            pool: PoolConfig::default(),
            idle: Duration::from_secs(10),
            seeds: Vec::new(),
        }
    }
}

impl CrawlerConfig {
    /// `<service_name>-<id>`, falling back to the current unix time for the id
    pub fn worker_id(&self) -> String {
        if self.id.is_empty() {
            let now = chrono::Utc::now().timestamp().to_string();
            identity::worker_id(&self.service_name, &now)
        } else {
            identity::worker_id(&self.service_name, &self.id)
        }
    }
}

pub struct Crawler {
    config: CrawlerConfig,
    registry: Arc<TaskRegistry>,
    worker_id: String,
}

impl Crawler {
    pub fn new(config: CrawlerConfig, registry: Arc<TaskRegistry>) -> Self {
        let worker_id = config.worker_id();
        Self {
            config,
            registry,
            worker_id,
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Run until `cancel` fires
    ///
    /// With a cluster the worker follows assignments from the store; without
    /// one it crawls the seed tasks. Only discovery registration can fail.
    pub async fn run(&self, cluster: Option<Cluster>, cancel: CancellationToken) -> Result<()> {
        let (scheduler, scheduler_handle) = RequestScheduler::spawn(cancel.clone());

        let (tx, rx) = mpsc::channel(RESULT_BUFFER);
        let pool = WorkerPool::new(self.config.pool.clone(), scheduler.clone(), tx);
        let worker_handles = pool.spawn(cancel.clone());

        let sink = ResultSink::new(self.registry.clone(), rx, self.config.idle);
        let sink_handle = tokio::spawn(sink.run(cancel.clone()));

        let coordinator =
            WorkerCoordinator::new(self.worker_id.clone(), self.registry.clone(), scheduler);

        tracing::info!(
            worker = %self.worker_id,
            tasks = self.registry.len(),
            work_count = self.config.pool.work_count,
            clustered = cluster.is_some(),
            "Crawler started"
        );

        let result = match cluster {
            Some(cluster) => self.run_clustered(&cluster, coordinator, &cancel).await,
            None => {
                let activated = activate_seeds(&coordinator, &self.config.seeds).await;
                tracing::info!(activated, "Seed tasks activated");
                cancel.cancelled().await;
                Ok(())
            }
        };

        // Registration failure leaves the pipeline running; stop it too
        cancel.cancel();
        for handle in worker_handles {
            let _ = handle.await;
        }
        let _ = sink_handle.await;
        let _ = scheduler_handle.await;

        tracing::info!(worker = %self.worker_id, "Crawler stopped");
        result
    }

    async fn run_clustered(
        &self,
        cluster: &Cluster,
        coordinator: Arc<WorkerCoordinator>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let mut node = Node::new(self.worker_id.clone(), self.config.address.clone());
        node.metadata
            .insert("work_count".to_string(), self.config.pool.work_count.to_string());

        cluster
            .registry
            .register(&self.config.service_name, node)
            .await?;

        coordinator.run(cluster.kv.clone(), cancel.clone()).await;

        if let Err(e) = cluster
            .registry
            .deregister(&self.config.service_name, &self.worker_id)
            .await
        {
            tracing::warn!(worker = %self.worker_id, error = %e, "Deregister failed");
        }
        Ok(())
    }
}

//! Master coordinator: leader election and resource assignment
//!
//! Every master campaigns on [`ELECTION_KEY`]. The winner loads all resource
//! records, refreshes worker membership, reassigns orphaned resources and
//! only then marks itself ready. While ready it is the single writer of
//! assignment records; followers reject mutations with
//! [`MasterError::NotLeader`] so the transport can forward them.
//!
//! The election session's lease is refreshed every third of its TTL; a
//! failed refresh demotes and re-campaigns. Leadership loss is also noticed
//! through the election's change notifications, and through a periodic
//! check of the authoritative leader value in case a session expiry went
//! unobserved.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::error::{MasterError, Result};
use super::idgen::IdGenerator;
use super::identity;
use super::node::{self, NodeSpec};
use super::resource::{
    encode_assigned_node, resource_path, ResourceSpec, ELECTION_KEY, RESOURCE_PATH,
};
use crate::store::{Cluster, Election, KvStore, ServiceRegistry, ServiceStream, StoreError};
use crate::utils::retry::RetryConfig;

/// What the transport layer needs to route a mutation
pub trait Leadership: Send + Sync {
    fn is_leader(&self) -> bool;

    /// Identity of the current leader, if one is known
    fn leader_id(&self) -> Option<String>;

    /// Reachable address of the current leader, if one is known
    fn leader_address(&self) -> Option<String> {
        self.leader_id()
            .and_then(|id| identity::leader_address(&id))
    }
}

/// Master settings
#[derive(Debug, Clone)]
pub struct MasterConfig {
    /// Full master identity, see [`identity::master_id`]
    pub id: String,

    /// Service name workers register under
    pub worker_service: String,

    /// Task names that must always have a resource record
    pub seeds: Vec<String>,

    /// Period of the authoritative leader check
    pub leader_check_interval: Duration,

    /// Node number of the ID generator
    pub id_node: u16,
}

impl Default for MasterConfig {
    fn default() -> Self {
        Self {
            id: "master-1-127.0.0.1:8081".to_string(),
            worker_service: "crawlnet.worker".to_string(),
            seeds: Vec::new(),
            leader_check_interval: Duration::from_secs(20),
            id_node: 1,
        }
    }
}

#[derive(Default)]
struct MasterState {
    resources: HashMap<String, ResourceSpec>,
    nodes: HashMap<String, NodeSpec>,
}

impl MasterState {
    /// Rebuild payloads from the resource map
    fn recompute_payloads(&mut self) {
        for spec in self.nodes.values_mut() {
            spec.payload = 0;
        }
        for resource in self.resources.values() {
            if let Ok(id) = resource.node_id() {
                if let Some(spec) = self.nodes.get_mut(id) {
                    spec.payload += 1;
                }
            }
        }
    }

    /// Least-loaded node; ties go to the smallest node ID
    fn least_loaded(&self) -> Option<String> {
        self.nodes
            .values()
            .min_by(|a, b| a.payload.cmp(&b.payload).then_with(|| a.id().cmp(b.id())))
            .map(|spec| spec.id().to_string())
    }
}

pub struct MasterCoordinator {
    config: MasterConfig,
    kv: Arc<dyn KvStore>,
    election: Arc<dyn Election>,
    registry: Arc<dyn ServiceRegistry>,
    ready: AtomicBool,
    leader: watch::Sender<Option<String>>,
    state: Mutex<MasterState>,
    idgen: IdGenerator,
}

impl MasterCoordinator {
    pub fn new(config: MasterConfig, cluster: &Cluster) -> Result<Arc<Self>> {
        let idgen = IdGenerator::new(config.id_node)?;
        tracing::info!(id = %config.id, "Master identity");

        Ok(Arc::new(Self {
            config,
            kv: cluster.kv.clone(),
            election: cluster.election.clone(),
            registry: cluster.registry.clone(),
            ready: AtomicBool::new(false),
            leader: watch::channel(None).0,
            state: Mutex::new(MasterState::default()),
            idgen,
        }))
    }

    pub fn id(&self) -> &str {
        &self.config.id
    }

    /// Snapshot of tracked resources, sorted by name
    pub async fn resources(&self) -> Vec<ResourceSpec> {
        let state = self.state.lock().await;
        let mut resources: Vec<ResourceSpec> = state.resources.values().cloned().collect();
        resources.sort_by(|a, b| a.name.cmp(&b.name));
        resources
    }

    /// Snapshot of known worker nodes, sorted by ID
    pub async fn nodes(&self) -> Vec<NodeSpec> {
        let state = self.state.lock().await;
        let mut nodes: Vec<NodeSpec> = state.nodes.values().cloned().collect();
        nodes.sort_by(|a, b| a.id().cmp(b.id()));
        nodes
    }

    // ========================================================================
    // Run Loop
    // ========================================================================

    /// Campaign, track membership and keep leadership honest until cancelled
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        if let Err(e) = self.update_nodes().await {
            tracing::error!(error = %e, "Initial worker membership lookup failed");
        }
        self.add_seeds().await;

        let (campaign_tx, mut campaign_rx) = mpsc::channel(1);
        let mut campaign = Some(self.spawn_campaign(campaign_tx.clone(), Duration::ZERO));
        let mut campaign_failures = 0u32;

        let mut leader_rx = self.election.observe();
        let mut workers = self.watch_workers().await;

        let mut tick = tokio::time::interval(self.config.leader_check_interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tick.tick().await;

        let mut keepalive = tokio::time::interval(self.election.lease_ttl() / 3);
        keepalive.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        keepalive.tick().await;

        let backoff = RetryConfig::with_delays(u32::MAX, 500, 10_000);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,

                Some(result) = campaign_rx.recv() => {
                    campaign = None;
                    match result {
                        Ok(()) => {
                            campaign_failures = 0;
                            tracing::info!(id = %self.config.id, "Campaign won");
                            self.set_cached_leader(Some(self.config.id.clone()));
                            if !self.is_leader() {
                                if let Err(e) = self.become_leader().await {
                                    tracing::error!(error = %e, "Become leader failed");
                                }
                            }
                        }
                        Err(e) => {
                            campaign_failures = campaign_failures.saturating_add(1);
                            tracing::error!(error = %e, "Leader campaign failed");
                            self.demote();
                            let delay = backoff.delay(campaign_failures);
                            campaign = Some(self.spawn_campaign(campaign_tx.clone(), delay));
                        }
                    }
                }

                changed = leader_rx.changed() => {
                    if changed.is_err() {
                        tracing::error!("Election observer closed");
                        break;
                    }
                    let leader = leader_rx.borrow_and_update().clone();
                    tracing::info!(leader = leader.as_deref().unwrap_or(""), "Watch leader change");
                    self.set_cached_leader(leader.clone());
                    if self.is_leader() && leader.as_deref() != Some(self.config.id.as_str()) {
                        tracing::warn!("Leadership moved elsewhere, demoting");
                        self.demote();
                        if campaign.is_none() {
                            campaign = Some(self.spawn_campaign(campaign_tx.clone(), Duration::ZERO));
                        }
                    }
                }

                event = next_worker_event(&mut workers) => {
                    match event {
                        Some(event) => {
                            tracing::info!(?event, "Watch worker change");
                            self.on_membership_change().await;
                        }
                        None => {
                            tracing::error!("Worker watch closed");
                            workers = None;
                        }
                    }
                }

                _ = keepalive.tick() => {
                    if let Err(e) = self.election.keep_alive(&self.config.id).await {
                        if self.is_leader() {
                            tracing::error!(error = %e, "Election session lost, demoting");
                            self.demote();
                        } else {
                            tracing::debug!(error = %e, "No live election session");
                        }
                        if campaign.is_none() {
                            campaign = Some(self.spawn_campaign(campaign_tx.clone(), Duration::ZERO));
                        }
                    }
                }

                _ = tick.tick() => {
                    if workers.is_none() {
                        workers = self.watch_workers().await;
                        if workers.is_some() {
                            self.on_membership_change().await;
                        }
                    }
                    if self.check_leadership().await && campaign.is_none() {
                        campaign = Some(self.spawn_campaign(campaign_tx.clone(), Duration::ZERO));
                    }
                }
            }
        }

        if let Some(handle) = campaign {
            handle.abort();
        }
        if let Err(e) = self.election.resign(&self.config.id).await {
            tracing::warn!(error = %e, "Resign failed");
        }
        self.demote();
        tracing::info!(id = %self.config.id, "Master stopped");
    }

    fn spawn_campaign(
        &self,
        tx: mpsc::Sender<std::result::Result<(), StoreError>>,
        delay: Duration,
    ) -> JoinHandle<()> {
        let election = self.election.clone();
        let id = self.config.id.clone();
        tokio::spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            tracing::debug!(key = ELECTION_KEY, %id, "Campaigning for leadership");
            let result = election.campaign(&id).await;
            let _ = tx.send(result).await;
        })
    }

    async fn watch_workers(&self) -> Option<ServiceStream> {
        match self.registry.watch(&self.config.worker_service).await {
            Ok(stream) => Some(stream),
            Err(e) => {
                tracing::error!(error = %e, "Watch worker failed");
                None
            }
        }
    }

    /// Compare the authoritative leader with our own view
    ///
    /// Returns true when a new campaign should be started.
    async fn check_leadership(&self) -> bool {
        match self.election.leader().await {
            Ok(leader) => {
                tracing::debug!(%leader, "Get leader");
                let is_us = leader == self.config.id;
                self.set_cached_leader(Some(leader));
                if self.is_leader() && !is_us {
                    tracing::warn!("No longer the leader, demoting");
                    self.demote();
                    return true;
                }
                if is_us && !self.is_leader() {
                    if let Err(e) = self.become_leader().await {
                        tracing::error!(error = %e, "Become leader failed");
                    }
                }
                false
            }
            Err(StoreError::NoLeader) => {
                tracing::warn!("Election has no leader");
                self.set_cached_leader(None);
                self.demote();
                true
            }
            Err(e) => {
                tracing::error!(error = %e, "Get leader failed");
                false
            }
        }
    }

    async fn on_membership_change(&self) {
        if let Err(e) = self.update_nodes().await {
            tracing::error!(error = %e, "Worker membership refresh failed");
            return;
        }
        if let Err(e) = self.reload().await {
            tracing::error!(error = %e, "Work change load resource failed");
            return;
        }
        if self.is_leader() {
            self.reassign().await;
        }
    }

    // ========================================================================
    // Leadership Transitions
    // ========================================================================

    /// Load everything, heal orphans, then start accepting mutations
    pub async fn become_leader(&self) -> Result<()> {
        self.update_nodes().await?;
        self.reload().await?;
        self.reassign().await;

        self.ready.store(true, Ordering::SeqCst);
        crate::metrics::set_leader(true);
        tracing::info!(id = %self.config.id, "Master change to leader");
        Ok(())
    }

    fn demote(&self) {
        if self.ready.swap(false, Ordering::SeqCst) {
            crate::metrics::set_leader(false);
            tracing::warn!(id = %self.config.id, "Master demoted");
        }
    }

    fn set_cached_leader(&self, leader: Option<String>) {
        self.leader.send_replace(leader);
    }

    // ========================================================================
    // Membership & Resources
    // ========================================================================

    /// Replace the membership snapshot with the registry's current view
    async fn update_nodes(&self) -> Result<()> {
        let nodes = self.registry.get_service(&self.config.worker_service).await?;
        let snapshot = node::snapshot(nodes);

        let mut state = self.state.lock().await;
        let diff = node::diff(&state.nodes, &snapshot);
        if !diff.is_empty() {
            tracing::info!(
                joined = ?diff.added,
                left = ?diff.removed,
                changed = ?diff.changed,
                "Worker membership changed"
            );
        }
        state.nodes = snapshot;
        state.recompute_payloads();
        crate::metrics::update_membership(state.nodes.len(), state.resources.len());
        Ok(())
    }

    /// Reload all resource records, keeping seeds that have none yet
    ///
    /// The state lock is held across the store read so an add or delete
    /// cannot commit between the snapshot and the swap.
    async fn reload(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        let prefix = format!("{RESOURCE_PATH}/");
        let entries = self.kv.get_prefix(&prefix).await?;

        let mut resources = HashMap::with_capacity(entries.len());
        for entry in entries {
            match ResourceSpec::decode(&entry.value) {
                Ok(spec) if !spec.name.is_empty() => {
                    resources.insert(spec.name.clone(), spec);
                }
                Ok(_) => tracing::debug!(key = %entry.key, "Skipping nameless resource"),
                Err(e) => tracing::debug!(key = %entry.key, error = %e, "Skipping undecodable record"),
            }
        }

        for seed in &self.config.seeds {
            resources
                .entry(seed.clone())
                .or_insert_with(|| ResourceSpec::new(seed.clone()));
        }
        state.resources = resources;
        state.recompute_payloads();
        tracing::info!(len = state.resources.len(), "Load resource");
        Ok(())
    }

    /// Track an unassigned record for every seed with nothing in the store
    pub async fn add_seeds(&self) {
        let mut missing = Vec::new();
        for seed in &self.config.seeds {
            match self.kv.get(&resource_path(seed)).await {
                Ok(Some(_)) => {}
                Ok(None) => missing.push(ResourceSpec::new(seed.clone())),
                Err(e) => tracing::error!(seed = %seed, error = %e, "Seed lookup failed"),
            }
        }

        let mut state = self.state.lock().await;
        for spec in missing {
            state.resources.entry(spec.name.clone()).or_insert(spec);
        }
    }

    /// Reassign every resource that is unassigned or whose node has left
    async fn reassign(&self) {
        let mut state = self.state.lock().await;

        let mut batch: Vec<ResourceSpec> = Vec::new();
        for resource in state.resources.values() {
            if !resource.is_assigned() {
                batch.push(resource.clone());
                continue;
            }
            match resource.node_id() {
                Ok(id) if !state.nodes.contains_key(id) => batch.push(resource.clone()),
                Ok(_) => {}
                Err(e) => tracing::error!(resource = %resource.name, error = %e, "Get node id failed"),
            }
        }
        batch.sort_by(|a, b| a.name.cmp(&b.name));

        if !batch.is_empty() {
            tracing::info!(count = batch.len(), "Reassigning resources");
        }
        for resource in batch {
            let name = resource.name.clone();
            if let Err(e) = self.assign(&mut state, resource).await {
                tracing::error!(resource = %name, error = %e, "Assign resource failed");
            }
        }
        crate::metrics::update_membership(state.nodes.len(), state.resources.len());
    }

    /// Persist `resource` on the least-loaded node
    async fn assign(&self, state: &mut MasterState, mut resource: ResourceSpec) -> Result<NodeSpec> {
        let node_id = state.least_loaded().ok_or(MasterError::NoWorkerNodes)?;
        let address = state
            .nodes
            .get(&node_id)
            .map(|spec| spec.node.address.clone())
            .unwrap_or_default();

        if resource.id.is_empty() {
            resource.id = self.idgen.generate_string();
        }
        resource.assigned_node = encode_assigned_node(&node_id, &address);
        resource.creation_time = chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default();

        self.kv.put(&resource.path(), resource.encode()?).await?;
        tracing::debug!(resource = %resource.name, node = %node_id, "Add resource");

        state.resources.insert(resource.name.clone(), resource);
        let spec = state
            .nodes
            .get_mut(&node_id)
            .ok_or_else(|| MasterError::InvalidAssignedNode(node_id.clone()))?;
        spec.payload += 1;
        crate::metrics::record_assignment(&node_id);
        Ok(spec.clone())
    }

    // ========================================================================
    // Add / Delete
    // ========================================================================

    fn ensure_leader(&self) -> Result<()> {
        if self.is_leader() {
            Ok(())
        } else {
            Err(MasterError::NotLeader {
                leader: self.leader_id(),
            })
        }
    }

    /// Assign a task to a worker and return the chosen node
    ///
    /// A resource already assigned to a live node keeps its assignment.
    pub async fn add_resource(&self, name: &str) -> Result<NodeSpec> {
        self.ensure_leader()?;
        let mut state = self.state.lock().await;

        if let Some(existing) = state.resources.get(name) {
            if let Ok(id) = existing.node_id() {
                if let Some(spec) = state.nodes.get(id) {
                    tracing::info!(resource = name, node = id, "Resource already assigned");
                    return Ok(spec.clone());
                }
            }
        }

        let resource = state
            .resources
            .get(name)
            .cloned()
            .unwrap_or_else(|| ResourceSpec::new(name));
        let spec = self.assign(&mut state, resource).await?;
        tracing::info!(resource = name, node = %spec.id(), "Resource assigned");
        Ok(spec)
    }

    /// Remove a task's record and release its node's payload
    pub async fn delete_resource(&self, name: &str) -> Result<()> {
        self.ensure_leader()?;
        let mut state = self.state.lock().await;

        let resource = state
            .resources
            .get(name)
            .cloned()
            .ok_or_else(|| MasterError::UnknownResource(name.to_string()))?;

        self.kv.delete(&resource.path()).await?;
        state.resources.remove(name);

        if resource.is_assigned() {
            match resource.node_id() {
                Ok(id) => {
                    if let Some(spec) = state.nodes.get_mut(id) {
                        spec.payload = spec.payload.saturating_sub(1);
                    }
                }
                Err(e) => tracing::warn!(resource = name, error = %e, "Deleted resource had bad assignment"),
            }
        }
        tracing::info!(resource = name, "Resource deleted");
        Ok(())
    }
}

impl Leadership for MasterCoordinator {
    fn is_leader(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    fn leader_id(&self) -> Option<String> {
        self.leader.borrow().clone()
    }
}

async fn next_worker_event(
    workers: &mut Option<ServiceStream>,
) -> Option<crate::store::ServiceEvent> {
    match workers {
        Some(stream) => stream.recv().await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex as StdMutex;
    use tokio::sync::Notify;

    use crate::store::{KeyValue, MemoryElection, MemoryKv, MemoryRegistry, Node, WatchStream};

    const SERVICE: &str = "crawlnet.worker";

    struct Fixture {
        kv: Arc<MemoryKv>,
        election: Arc<MemoryElection>,
        registry: Arc<MemoryRegistry>,
        cluster: Cluster,
    }

    fn fixture() -> Fixture {
        let kv = Arc::new(MemoryKv::new());
        let election = Arc::new(MemoryElection::new());
        let registry = Arc::new(MemoryRegistry::new());
        let cluster = Cluster {
            kv: kv.clone(),
            election: election.clone(),
            registry: registry.clone(),
        };
        Fixture {
            kv,
            election,
            registry,
            cluster,
        }
    }

    fn master(f: &Fixture, id: &str, seeds: &[&str]) -> Arc<MasterCoordinator> {
        master_on(&f.cluster, id, seeds)
    }

    fn master_on(cluster: &Cluster, id: &str, seeds: &[&str]) -> Arc<MasterCoordinator> {
        MasterCoordinator::new(
            MasterConfig {
                id: id.to_string(),
                worker_service: SERVICE.to_string(),
                seeds: seeds.iter().map(|s| s.to_string()).collect(),
                leader_check_interval: Duration::from_millis(50),
                id_node: 1,
            },
            cluster,
        )
        .unwrap()
    }

    async fn register(f: &Fixture, id: &str) {
        f.registry
            .register(SERVICE, Node::new(id, format!("{id}.local:9090")))
            .await
            .unwrap();
    }

    async fn stored(f: &Fixture, name: &str) -> Option<ResourceSpec> {
        f.kv
            .get(&resource_path(name))
            .await
            .unwrap()
            .map(|raw| ResourceSpec::decode(&raw).unwrap())
    }

    #[tokio::test]
    async fn test_follower_rejects_mutations() {
        let f = fixture();
        let m = master(&f, "master-1-10.0.0.1:8081", &[]);
        m.set_cached_leader(Some("master-2-10.0.0.2:8081".into()));

        match m.add_resource("books").await {
            Err(MasterError::NotLeader { leader }) => {
                assert_eq!(leader.as_deref(), Some("master-2-10.0.0.2:8081"));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(
            m.delete_resource("books").await,
            Err(MasterError::NotLeader { .. })
        ));
        assert_eq!(m.leader_address().as_deref(), Some("10.0.0.2:8081"));
    }

    #[tokio::test]
    async fn test_least_loaded_assignment() {
        let f = fixture();
        register(&f, "A").await;
        register(&f, "B").await;
        let m = master(&f, "master-1-10.0.0.1:8081", &[]);
        m.become_leader().await.unwrap();

        {
            let mut state = m.state.lock().await;
            state.nodes.get_mut("A").unwrap().payload = 2;
        }

        let chosen = m.add_resource("books").await.unwrap();
        assert_eq!(chosen.id(), "B");
        assert_eq!(chosen.payload, 1);

        let record = stored(&f, "books").await.unwrap();
        assert_eq!(record.assigned_node, "B|B.local:9090");
        assert!(!record.id.is_empty());
        assert!(record.creation_time > 0);
    }

    #[tokio::test]
    async fn test_assign_without_workers_fails() {
        let f = fixture();
        let m = master(&f, "master-1-10.0.0.1:8081", &[]);
        m.become_leader().await.unwrap();

        let err = m.add_resource("books").await.unwrap_err();
        assert!(matches!(err, MasterError::NoWorkerNodes));
        assert_eq!(err.to_string(), "no worker nodes");
        assert!(stored(&f, "books").await.is_none());
    }

    #[tokio::test]
    async fn test_add_is_idempotent_for_live_assignment() {
        let f = fixture();
        register(&f, "A").await;
        register(&f, "B").await;
        let m = master(&f, "master-1-10.0.0.1:8081", &[]);
        m.become_leader().await.unwrap();

        let first = m.add_resource("books").await.unwrap();
        let second = m.add_resource("books").await.unwrap();
        assert_eq!(first.id(), second.id());
        let nodes = m.nodes().await;
        assert_eq!(nodes.iter().map(|n| n.payload).sum::<usize>(), 1);
    }

    #[tokio::test]
    async fn test_delete_releases_payload() {
        let f = fixture();
        register(&f, "A").await;
        let m = master(&f, "master-1-10.0.0.1:8081", &[]);
        m.become_leader().await.unwrap();

        m.add_resource("books").await.unwrap();
        m.add_resource("movies").await.unwrap();
        assert_eq!(m.nodes().await[0].payload, 2);

        m.delete_resource("books").await.unwrap();
        assert_eq!(m.nodes().await[0].payload, 1);
        assert!(stored(&f, "books").await.is_none());
        assert!(matches!(
            m.delete_resource("books").await,
            Err(MasterError::UnknownResource(_))
        ));
    }

    #[tokio::test]
    async fn test_seeds_are_assigned_on_becoming_leader() {
        let f = fixture();
        register(&f, "A").await;
        let existing = ResourceSpec {
            id: "7".into(),
            name: "movies".into(),
            assigned_node: "A|A.local:9090".into(),
            creation_time: 1,
        };
        f.kv
            .put(&existing.path(), existing.encode().unwrap())
            .await
            .unwrap();

        let m = master(&f, "master-1-10.0.0.1:8081", &["books", "movies"]);
        m.add_seeds().await;
        assert_eq!(m.resources().await.len(), 1);

        m.become_leader().await.unwrap();
        let books = stored(&f, "books").await.unwrap();
        assert_eq!(books.node_id().unwrap(), "A");
        // Existing assignment untouched
        assert_eq!(stored(&f, "movies").await.unwrap(), existing);
        assert_eq!(m.nodes().await[0].payload, 2);
    }

    #[tokio::test]
    async fn test_reassignment_converges_after_node_departure() {
        let f = fixture();
        register(&f, "A").await;
        register(&f, "B").await;
        let m = master(&f, "master-1-10.0.0.1:8081", &[]);
        m.become_leader().await.unwrap();

        {
            let mut state = m.state.lock().await;
            state.nodes.get_mut("B").unwrap().payload = 100;
        }
        for name in ["r1", "r2", "r3"] {
            assert_eq!(m.add_resource(name).await.unwrap().id(), "A");
        }

        f.registry.deregister(SERVICE, "A").await.unwrap();
        m.on_membership_change().await;

        for name in ["r1", "r2", "r3"] {
            assert_eq!(stored(&f, name).await.unwrap().node_id().unwrap(), "B");
        }
        assert_eq!(m.nodes().await[0].payload, 3);

        // With nobody left the resources stay on the departed node until one joins
        f.registry.deregister(SERVICE, "B").await.unwrap();
        m.on_membership_change().await;
        assert!(m.nodes().await.is_empty());
        register(&f, "C").await;
        m.on_membership_change().await;
        for name in ["r1", "r2", "r3"] {
            assert_eq!(stored(&f, name).await.unwrap().node_id().unwrap(), "C");
        }
    }

    #[tokio::test]
    async fn test_ids_are_kept_on_reassignment() {
        let f = fixture();
        register(&f, "A").await;
        let m = master(&f, "master-1-10.0.0.1:8081", &[]);
        m.become_leader().await.unwrap();
        m.add_resource("books").await.unwrap();
        let before = stored(&f, "books").await.unwrap();

        register(&f, "B").await;
        f.registry.deregister(SERVICE, "A").await.unwrap();
        m.on_membership_change().await;

        let moved = stored(&f, "books").await.unwrap();
        assert_eq!(moved.id, before.id);
        assert_eq!(moved.node_id().unwrap(), "B");
    }

    #[tokio::test]
    async fn test_run_elects_single_leader_and_fails_over() {
        let f = fixture();
        register(&f, "A").await;
        let m1 = master(&f, "master-1-10.0.0.1:8081", &["books"]);
        let m2 = master(&f, "master-2-10.0.0.2:8081", &["books"]);

        let cancel1 = CancellationToken::new();
        let cancel2 = CancellationToken::new();
        let h1 = tokio::spawn(m1.clone().run(cancel1.clone()));
        wait_until(|| m1.is_leader()).await;
        let h2 = tokio::spawn(m2.clone().run(cancel2.clone()));
        wait_until(|| m2.leader_id().as_deref() == Some(m1.id())).await;

        assert!(!m2.is_leader());
        assert_eq!(stored(&f, "books").await.unwrap().node_id().unwrap(), "A");

        // Session loss on the leader
        f.election.expire(m1.id());
        wait_until(|| m2.is_leader()).await;
        wait_until(|| !m1.is_leader()).await;
        assert_eq!(m1.leader_id().as_deref(), Some(m2.id()));

        cancel1.cancel();
        cancel2.cancel();
        h1.await.unwrap();
        h2.await.unwrap();
    }

    /// Store whose next prefix read parks until released
    struct GatedKv {
        inner: MemoryKv,
        armed: AtomicBool,
        entered: Notify,
        release: Notify,
    }

    impl GatedKv {
        fn new() -> Self {
            Self {
                inner: MemoryKv::new(),
                armed: AtomicBool::new(false),
                entered: Notify::new(),
                release: Notify::new(),
            }
        }
    }

    #[async_trait]
    impl KvStore for GatedKv {
        async fn put(&self, key: &str, value: String) -> crate::store::Result<()> {
            self.inner.put(key, value).await
        }

        async fn get(&self, key: &str) -> crate::store::Result<Option<String>> {
            self.inner.get(key).await
        }

        async fn get_prefix(&self, prefix: &str) -> crate::store::Result<Vec<KeyValue>> {
            let entries = self.inner.get_prefix(prefix).await;
            if self.armed.swap(false, Ordering::SeqCst) {
                self.entered.notify_one();
                self.release.notified().await;
            }
            entries
        }

        async fn delete(&self, key: &str) -> crate::store::Result<Option<String>> {
            self.inner.delete(key).await
        }

        async fn watch(&self, prefix: &str) -> crate::store::Result<WatchStream> {
            self.inner.watch(prefix).await
        }
    }

    #[tokio::test]
    async fn test_reload_keeps_add_committed_during_read() {
        let kv = Arc::new(GatedKv::new());
        let registry = Arc::new(MemoryRegistry::new());
        let cluster = Cluster {
            kv: kv.clone(),
            election: Arc::new(MemoryElection::new()),
            registry: registry.clone(),
        };
        registry
            .register(SERVICE, Node::new("A", "A.local:9090"))
            .await
            .unwrap();
        let m = master_on(&cluster, "master-1-10.0.0.1:8081", &[]);
        m.become_leader().await.unwrap();

        kv.armed.store(true, Ordering::SeqCst);
        let reload = tokio::spawn({
            let m = m.clone();
            async move { m.on_membership_change().await }
        });
        kv.entered.notified().await;

        let add = tokio::spawn({
            let m = m.clone();
            async move { m.add_resource("books").await }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        kv.release.notify_one();

        reload.await.unwrap();
        assert_eq!(add.await.unwrap().unwrap().id(), "A");

        assert!(kv.get(&resource_path("books")).await.unwrap().is_some());
        let tracked: Vec<String> = m.resources().await.into_iter().map(|r| r.name).collect();
        assert_eq!(tracked, vec!["books".to_string()]);
        assert_eq!(m.nodes().await[0].payload, 1);

        m.delete_resource("books").await.unwrap();
        assert_eq!(m.nodes().await[0].payload, 0);
    }

    /// Election whose leader value changes without any notification
    struct SilentElection {
        leader: StdMutex<String>,
        observed: watch::Sender<Option<String>>,
    }

    impl SilentElection {
        fn new(leader: &str) -> Self {
            Self {
                leader: StdMutex::new(leader.to_string()),
                observed: watch::channel(None).0,
            }
        }

        fn set_leader(&self, leader: &str) {
            *self.leader.lock().unwrap() = leader.to_string();
        }
    }

    #[async_trait]
    impl Election for SilentElection {
        async fn campaign(&self, value: &str) -> crate::store::Result<()> {
            let leads = *self.leader.lock().unwrap() == value;
            if leads {
                return Ok(());
            }
            std::future::pending().await
        }

        fn observe(&self) -> watch::Receiver<Option<String>> {
            self.observed.subscribe()
        }

        async fn leader(&self) -> crate::store::Result<String> {
            Ok(self.leader.lock().unwrap().clone())
        }

        async fn keep_alive(&self, _value: &str) -> crate::store::Result<()> {
            Ok(())
        }

        async fn resign(&self, _value: &str) -> crate::store::Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_leader_check_demotes_without_notification() {
        let election = Arc::new(SilentElection::new("master-1-10.0.0.1:8081"));
        let registry = Arc::new(MemoryRegistry::new());
        let cluster = Cluster {
            kv: Arc::new(MemoryKv::new()),
            election: election.clone(),
            registry,
        };
        let m = master_on(&cluster, "master-1-10.0.0.1:8081", &[]);

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(m.clone().run(cancel.clone()));
        wait_until(|| m.is_leader()).await;

        election.set_leader("master-2-10.0.0.2:8081");
        // Check interval is 50ms; allow a few ticks
        tokio::time::timeout(Duration::from_millis(500), async {
            while m.is_leader() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("periodic leader check did not demote");
        assert_eq!(m.leader_address().as_deref(), Some("10.0.0.2:8081"));
        assert!(matches!(
            m.add_resource("books").await,
            Err(MasterError::NotLeader { .. })
        ));

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_keep_alive_holds_lease_across_ttls() {
        let f = fixture();
        let election = Arc::new(MemoryElection::with_ttl(Duration::from_millis(150)));
        let cluster = Cluster {
            election: election.clone(),
            ..f.cluster.clone()
        };
        let m = master_on(&cluster, "master-1-10.0.0.1:8081", &[]);

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(m.clone().run(cancel.clone()));
        wait_until(|| m.is_leader()).await;

        tokio::time::sleep(Duration::from_millis(600)).await;
        assert!(m.is_leader());
        assert_eq!(election.leader().await.unwrap(), m.id());

        cancel.cancel();
        handle.await.unwrap();
        assert!(election.candidates().is_empty());
    }

    async fn wait_until(cond: impl Fn() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !cond() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("condition not reached");
    }
}

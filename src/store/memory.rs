//! Process-local store, election and registry

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::time::Instant;

use super::{
    Election, KeyValue, KvStore, Node, Result, ServiceEvent, ServiceRegistry, ServiceStream,
    StoreError, WatchEvent, WatchStream, ELECTION_LEASE_TTL,
};

// ============================================================================
// Key-Value Store
// ============================================================================

#[derive(Default)]
struct KvState {
    data: BTreeMap<String, String>,
    watchers: Vec<(String, mpsc::UnboundedSender<WatchEvent>)>,
}

impl KvState {
    fn notify(&mut self, event: WatchEvent) {
        self.watchers.retain(|(prefix, tx)| {
            !event.key().starts_with(prefix.as_str()) || tx.send(event.clone()).is_ok()
        });
    }
}

/// Ordered in-memory key-value store with prefix watches
pub struct MemoryKv {
    state: Mutex<KvState>,
    available: AtomicBool,
}

impl Default for MemoryKv {
    fn default() -> Self {
        Self {
            state: Mutex::new(KvState::default()),
            available: AtomicBool::new(true),
        }
    }
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate an outage; every call fails while unavailable
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    fn check(&self) -> Result<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::Unavailable("memory store offline".into()))
        }
    }
}

#[async_trait]
impl KvStore for MemoryKv {
    async fn put(&self, key: &str, value: String) -> Result<()> {
        self.check()?;
        let mut state = self.state.lock().await;
        let prev = state.data.insert(key.to_string(), value.clone());
        state.notify(WatchEvent::Put {
            key: key.to_string(),
            value,
            prev,
        });
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        self.check()?;
        Ok(self.state.lock().await.data.get(key).cloned())
    }

    async fn get_prefix(&self, prefix: &str) -> Result<Vec<KeyValue>> {
        self.check()?;
        let state = self.state.lock().await;
        Ok(state
            .data
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, value)| KeyValue {
                key: key.clone(),
                value: value.clone(),
            })
            .collect())
    }

    async fn delete(&self, key: &str) -> Result<Option<String>> {
        self.check()?;
        let mut state = self.state.lock().await;
        let prev = state.data.remove(key);
        if prev.is_some() {
            state.notify(WatchEvent::Delete {
                key: key.to_string(),
                prev: prev.clone(),
            });
        }
        Ok(prev)
    }

    async fn watch(&self, prefix: &str) -> Result<WatchStream> {
        self.check()?;
        let (tx, rx) = mpsc::unbounded_channel();
        self.state.lock().await.watchers.push((prefix.to_string(), tx));
        Ok(rx)
    }
}

// ============================================================================
// Election
// ============================================================================

#[derive(Debug, Clone)]
struct Lease {
    value: String,
    deadline: Instant,
}

struct ElectionState {
    ttl: Duration,
    candidates: watch::Sender<Vec<Lease>>,
    leader: watch::Sender<Option<String>>,
}

impl ElectionState {
    fn modify(&self, f: impl FnOnce(&mut Vec<Lease>)) {
        self.candidates.send_modify(|candidates| {
            f(candidates);
            let front = candidates.first().map(|lease| lease.value.clone());
            self.leader.send_if_modified(|leader| {
                if *leader != front {
                    *leader = front;
                    true
                } else {
                    false
                }
            });
        });
    }

    /// Drop every lease whose deadline has passed
    fn reap(&self, now: Instant) -> Vec<String> {
        if !self.candidates.borrow().iter().any(|lease| lease.deadline <= now) {
            return Vec::new();
        }
        let mut expired = Vec::new();
        self.modify(|candidates| {
            candidates.retain(|lease| {
                if lease.deadline <= now {
                    expired.push(lease.value.clone());
                    false
                } else {
                    true
                }
            })
        });
        expired
    }
}

/// FIFO election: the earliest live candidate leads
///
/// Each candidate holds a lease of [`ELECTION_LEASE_TTL`] (or the TTL given
/// to [`with_ttl`](Self::with_ttl)). A lease that is not refreshed through
/// [`Election::keep_alive`] lapses and the candidate is dropped.
pub struct MemoryElection {
    state: Arc<ElectionState>,
    reaping: AtomicBool,
}

impl Default for MemoryElection {
    fn default() -> Self {
        Self::with_ttl(ELECTION_LEASE_TTL)
    }
}

impl MemoryElection {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            state: Arc::new(ElectionState {
                ttl,
                candidates: watch::channel(Vec::new()).0,
                leader: watch::channel(None).0,
            }),
            reaping: AtomicBool::new(false),
        }
    }

    /// End a candidate's session as if its lease had lapsed
    pub fn expire(&self, value: &str) {
        tracing::debug!(candidate = value, "Expiring election session");
        self.state.modify(|candidates| candidates.retain(|lease| lease.value != value));
    }

    pub fn candidates(&self) -> Vec<String> {
        self.state
            .candidates
            .borrow()
            .iter()
            .map(|lease| lease.value.clone())
            .collect()
    }

    /// Start the lease reaper once; it stops when the election is dropped
    fn start_reaper(&self) {
        if self.reaping.swap(true, Ordering::SeqCst) {
            return;
        }
        let weak = Arc::downgrade(&self.state);
        let period = (self.state.ttl / 4).max(Duration::from_millis(10));
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(period);
            loop {
                tick.tick().await;
                let Some(state) = weak.upgrade() else {
                    break;
                };
                for value in state.reap(Instant::now()) {
                    tracing::info!(candidate = %value, "Election lease expired");
                }
            }
        });
    }
}

#[async_trait]
impl Election for MemoryElection {
    async fn campaign(&self, value: &str) -> Result<()> {
        self.start_reaper();
        let mut rx = self.state.candidates.subscribe();
        let deadline = Instant::now() + self.state.ttl;
        self.state.modify(|candidates| {
            match candidates.iter_mut().find(|lease| lease.value == value) {
                Some(lease) => lease.deadline = deadline,
                None => candidates.push(Lease {
                    value: value.to_string(),
                    deadline,
                }),
            }
        });

        loop {
            {
                let candidates = rx.borrow_and_update();
                if candidates.first().map(|lease| lease.value.as_str()) == Some(value) {
                    return Ok(());
                }
                if !candidates.iter().any(|lease| lease.value == value) {
                    return Err(StoreError::SessionExpired);
                }
            }
            rx.changed().await.map_err(|_| StoreError::Closed)?;
        }
    }

    fn observe(&self) -> watch::Receiver<Option<String>> {
        self.state.leader.subscribe()
    }

    async fn leader(&self) -> Result<String> {
        self.state.leader.borrow().clone().ok_or(StoreError::NoLeader)
    }

    async fn keep_alive(&self, value: &str) -> Result<()> {
        let deadline = Instant::now() + self.state.ttl;
        let mut found = false;
        self.state.candidates.send_if_modified(|candidates| {
            if let Some(lease) = candidates.iter_mut().find(|lease| lease.value == value) {
                lease.deadline = deadline.max(lease.deadline);
                found = true;
            }
            false
        });
        if found {
            Ok(())
        } else {
            Err(StoreError::SessionExpired)
        }
    }

    fn lease_ttl(&self) -> Duration {
        self.state.ttl
    }

    async fn resign(&self, value: &str) -> Result<()> {
        self.state.modify(|candidates| candidates.retain(|lease| lease.value != value));
        Ok(())
    }
}

// ============================================================================
// Service Registry
// ============================================================================

#[derive(Default)]
struct RegistryState {
    services: HashMap<String, BTreeMap<String, Node>>,
    watchers: Vec<(String, mpsc::UnboundedSender<ServiceEvent>)>,
}

impl RegistryState {
    fn notify(&mut self, service: &str, event: ServiceEvent) {
        self.watchers
            .retain(|(name, tx)| name != service || tx.send(event.clone()).is_ok());
    }
}

#[derive(Default)]
pub struct MemoryRegistry {
    state: Mutex<RegistryState>,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ServiceRegistry for MemoryRegistry {
    async fn register(&self, service: &str, node: Node) -> Result<()> {
        let mut state = self.state.lock().await;
        state
            .services
            .entry(service.to_string())
            .or_default()
            .insert(node.id.clone(), node.clone());
        state.notify(service, ServiceEvent::Registered(node));
        Ok(())
    }

    async fn deregister(&self, service: &str, node_id: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        let removed = state
            .services
            .get_mut(service)
            .and_then(|nodes| nodes.remove(node_id));
        if let Some(node) = removed {
            state.notify(service, ServiceEvent::Deregistered(node));
        }
        Ok(())
    }

    async fn get_service(&self, service: &str) -> Result<Vec<Node>> {
        let state = self.state.lock().await;
        Ok(state
            .services
            .get(service)
            .map(|nodes| nodes.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn watch(&self, service: &str) -> Result<ServiceStream> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.state
            .lock()
            .await
            .watchers
            .push((service.to_string(), tx));
        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_kv_prefix_and_watch() {
        let kv = MemoryKv::new();
        let mut events = kv.watch("/resources/").await.unwrap();

        kv.put("/resources/a", "1".into()).await.unwrap();
        kv.put("/other/x", "x".into()).await.unwrap();
        kv.put("/resources/a", "2".into()).await.unwrap();
        kv.put("/resources/b", "3".into()).await.unwrap();

        let listed = kv.get_prefix("/resources/").await.unwrap();
        assert_eq!(
            listed.iter().map(|kv| kv.key.as_str()).collect::<Vec<_>>(),
            vec!["/resources/a", "/resources/b"]
        );

        assert_eq!(kv.delete("/resources/a").await.unwrap(), Some("2".into()));
        assert_eq!(kv.delete("/resources/a").await.unwrap(), None);

        let mut seen = Vec::new();
        while let Ok(event) = events.try_recv() {
            seen.push(event);
        }
        assert_eq!(seen.len(), 4);
        assert_eq!(
            seen[1],
            WatchEvent::Put {
                key: "/resources/a".into(),
                value: "2".into(),
                prev: Some("1".into()),
            }
        );
        assert_eq!(
            seen[3],
            WatchEvent::Delete {
                key: "/resources/a".into(),
                prev: Some("2".into()),
            }
        );
    }

    #[tokio::test]
    async fn test_kv_unavailable() {
        let kv = MemoryKv::new();
        kv.set_available(false);
        assert!(matches!(
            kv.get("/k").await,
            Err(StoreError::Unavailable(_))
        ));
        kv.set_available(true);
        assert_eq!(kv.get("/k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_election_fifo_and_failover() {
        let election = Arc::new(MemoryElection::new());
        let mut observed = election.observe();

        election.campaign("m1").await.unwrap();
        assert_eq!(election.leader().await.unwrap(), "m1");

        let follower = election.clone();
        let second = tokio::spawn(async move { follower.campaign("m2").await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!second.is_finished());

        election.expire("m1");
        second.await.unwrap().unwrap();
        assert_eq!(election.leader().await.unwrap(), "m2");

        observed.changed().await.unwrap();
        assert_eq!(observed.borrow_and_update().as_deref(), Some("m2"));
    }

    #[tokio::test]
    async fn test_campaign_fails_when_session_expires() {
        let election = Arc::new(MemoryElection::new());
        election.campaign("m1").await.unwrap();

        let follower = election.clone();
        let waiting = tokio::spawn(async move { follower.campaign("m2").await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        election.expire("m2");

        assert_eq!(waiting.await.unwrap(), Err(StoreError::SessionExpired));
        election.resign("m1").await.unwrap();
        assert_eq!(election.leader().await, Err(StoreError::NoLeader));
    }

    #[tokio::test]
    async fn test_lease_lapses_without_keep_alive() {
        let election = MemoryElection::with_ttl(Duration::from_millis(100));
        let mut observed = election.observe();
        election.campaign("m1").await.unwrap();
        assert_eq!(election.lease_ttl(), Duration::from_millis(100));

        observed.changed().await.unwrap();
        assert_eq!(observed.borrow_and_update().as_deref(), Some("m1"));

        tokio::time::timeout(Duration::from_secs(2), observed.changed())
            .await
            .unwrap()
            .unwrap();
        assert!(observed.borrow_and_update().is_none());
        assert_eq!(election.leader().await, Err(StoreError::NoLeader));
        assert_eq!(election.keep_alive("m1").await, Err(StoreError::SessionExpired));
    }

    #[tokio::test]
    async fn test_keep_alive_holds_leadership() {
        let election = MemoryElection::with_ttl(Duration::from_millis(100));
        election.campaign("m1").await.unwrap();

        for _ in 0..8 {
            tokio::time::sleep(Duration::from_millis(40)).await;
            election.keep_alive("m1").await.unwrap();
        }
        assert_eq!(election.leader().await.unwrap(), "m1");
        assert_eq!(election.keep_alive("m2").await, Err(StoreError::SessionExpired));
    }

    #[tokio::test]
    async fn test_waiting_candidate_expires_with_its_lease() {
        let election = Arc::new(MemoryElection::with_ttl(Duration::from_millis(100)));
        election.campaign("m1").await.unwrap();

        let follower = election.clone();
        let waiting = tokio::spawn(async move { follower.campaign("m2").await });
        // m1 stays alive while m2 never refreshes
        for _ in 0..6 {
            tokio::time::sleep(Duration::from_millis(40)).await;
            election.keep_alive("m1").await.unwrap();
        }

        assert_eq!(waiting.await.unwrap(), Err(StoreError::SessionExpired));
        assert_eq!(election.candidates(), vec!["m1".to_string()]);
    }

    #[tokio::test]
    async fn test_registry_watch() {
        let registry = MemoryRegistry::new();
        let mut events = registry.watch("worker").await.unwrap();

        registry.register("worker", Node::new("w1", "10.0.0.1:9090")).await.unwrap();
        registry.register("other", Node::new("o1", "x")).await.unwrap();
        registry.deregister("worker", "w1").await.unwrap();
        registry.deregister("worker", "w1").await.unwrap();

        assert!(matches!(events.try_recv(), Ok(ServiceEvent::Registered(n)) if n.id == "w1"));
        assert!(matches!(events.try_recv(), Ok(ServiceEvent::Deregistered(n)) if n.id == "w1"));
        assert!(events.try_recv().is_err());
        assert!(registry.get_service("worker").await.unwrap().is_empty());
    }
}

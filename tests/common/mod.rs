//! Shared fixtures: in-process queue, scripted nodes and a counting policy engine

#![allow(dead_code)]

use async_trait::async_trait;
use shardplace::common::{Error, PolicyRules, ProvisioningConfig, Result};
use shardplace::coordinator::cluster_state::{ClusterState, ClusterStateStore, Collection, ReplicaState};
use shardplace::coordinator::dispatcher::{
    CreateCoreRequest, NodeClient, NodeResponse, RequestStatus,
};
use shardplace::coordinator::placement::{PolicyEngine, PolicyOutcome, PolicyRequest, RulePolicyEngine};
use shardplace::coordinator::routing::Router;
use shardplace::coordinator::state_queue::{Mutation, StateQueue};
use shardplace::ReplicaProvisioner;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Applies every payload straight to the store
pub struct DirectQueue {
    store: Arc<ClusterStateStore>,
    pub enqueued: AtomicUsize,
    pub fail: bool,
}

impl DirectQueue {
    pub fn new(store: Arc<ClusterStateStore>) -> Self {
        Self {
            store,
            enqueued: AtomicUsize::new(0),
            fail: false,
        }
    }

    pub fn failing(store: Arc<ClusterStateStore>) -> Self {
        Self {
            fail: true,
            ..Self::new(store)
        }
    }

    pub fn count(&self) -> usize {
        self.enqueued.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StateQueue for DirectQueue {
    async fn enqueue(&self, payload: Vec<u8>) -> Result<()> {
        if self.fail {
            return Err(Error::ConnectionFailed("queue unavailable".into()));
        }
        self.enqueued.fetch_add(1, Ordering::SeqCst);
        self.store.apply(&Mutation::from_payload(&payload)?)?;
        Ok(())
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
pub enum NodeBehavior {
    /// Create succeeds; the replica stays down
    Succeed,
    /// Create succeeds and the node reports the replica active
    Activate,
    /// Create fails
    Fail,
    /// Create is accepted but the request never finishes
    Stuck,
}

pub struct MockNode {
    pub behavior: NodeBehavior,
    pub delay: Duration,
    store: Arc<ClusterStateStore>,
    pub requests: Mutex<Vec<CreateCoreRequest>>,
    pub completed: AtomicUsize,
}

impl MockNode {
    pub fn new(store: Arc<ClusterStateStore>, behavior: NodeBehavior) -> Self {
        Self {
            behavior,
            delay: Duration::ZERO,
            store,
            requests: Mutex::new(Vec::new()),
            completed: AtomicUsize::new(0),
        }
    }

    pub fn slow(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn calls(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

#[async_trait]
impl NodeClient for MockNode {
    async fn create_core(&self, _base_url: &str, request: &CreateCoreRequest) -> Result<NodeResponse> {
        self.requests.lock().unwrap().push(request.clone());
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.completed.fetch_add(1, Ordering::SeqCst);
        match self.behavior {
            NodeBehavior::Fail => Err(Error::Http("node returned 500: disk full".into())),
            NodeBehavior::Stuck => Ok(NodeResponse {
                status: RequestStatus::Submitted,
                message: None,
            }),
            NodeBehavior::Succeed => Ok(NodeResponse {
                status: RequestStatus::Completed,
                message: None,
            }),
            NodeBehavior::Activate => {
                self.store.apply(&Mutation::UpdateReplicaState {
                    collection: request.collection.clone(),
                    core: request.name.clone(),
                    state: ReplicaState::Active,
                })?;
                Ok(NodeResponse {
                    status: RequestStatus::Completed,
                    message: None,
                })
            }
        }
    }

    async fn request_status(&self, _base_url: &str, _request_id: &str) -> Result<NodeResponse> {
        let status = match self.behavior {
            NodeBehavior::Stuck => RequestStatus::Running,
            _ => RequestStatus::Completed,
        };
        Ok(NodeResponse {
            status,
            message: None,
        })
    }
}

/// Rule engine that counts calls and session releases
pub struct CountingEngine {
    inner: RulePolicyEngine,
    pub calls: AtomicUsize,
    pub releases: AtomicUsize,
}

impl CountingEngine {
    pub fn new() -> Self {
        let mut policies = BTreeMap::new();
        policies.insert("spread".to_string(), PolicyRules::default());
        Self {
            inner: RulePolicyEngine::new(policies),
            calls: AtomicUsize::new(0),
            releases: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn releases(&self) -> usize {
        self.releases.load(Ordering::SeqCst)
    }

    pub fn outstanding(&self) -> usize {
        self.inner.sessions().refs()
    }
}

#[async_trait]
impl PolicyEngine for CountingEngine {
    async fn identify_nodes(
        &self,
        request: &PolicyRequest<'_>,
        state: &ClusterState,
    ) -> Result<PolicyOutcome> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.inner.identify_nodes(request, state).await
    }

    fn release(&self, version: u64) {
        self.releases.fetch_add(1, Ordering::SeqCst);
        self.inner.release(version);
    }
}

pub fn settings() -> ProvisioningConfig {
    ProvisioningConfig {
        state_visibility_timeout_ms: 2_000,
        core_node_name_timeout_secs: 2,
        async_poll_interval_ms: 10,
        ..Default::default()
    }
}

/// Store with live nodes n1..n3 and `books` (shard1, shard2) using the `spread` policy
pub fn cluster() -> Arc<ClusterStateStore> {
    let store = Arc::new(ClusterStateStore::default());
    for node in ["n1", "n2", "n3"] {
        store
            .apply(&Mutation::NodeLive {
                node: node.to_string(),
                base_url: format!("http://{}:8983", node),
            })
            .unwrap();
    }
    let mut books = Collection::new(
        "books",
        "conf",
        Router::CompositeId,
        &["shard1".to_string(), "shard2".to_string()],
    );
    books.policy = Some("spread".to_string());
    store.apply(&Mutation::CreateCollection(books)).unwrap();
    store
}

pub struct Harness {
    pub store: Arc<ClusterStateStore>,
    pub queue: Arc<DirectQueue>,
    pub node: Arc<MockNode>,
    pub engine: Arc<CountingEngine>,
    pub provisioner: ReplicaProvisioner,
}

pub fn harness(behavior: NodeBehavior) -> Harness {
    let store = cluster();
    harness_with(store.clone(), MockNode::new(store, behavior), settings())
}

pub fn harness_with(
    store: Arc<ClusterStateStore>,
    node: MockNode,
    settings: ProvisioningConfig,
) -> Harness {
    let queue = Arc::new(DirectQueue::new(store.clone()));
    let node = Arc::new(node);
    let engine = Arc::new(CountingEngine::new());
    let provisioner = ReplicaProvisioner::new(
        settings,
        store.clone(),
        queue.clone(),
        node.clone(),
        Some(engine.clone()),
    );
    Harness {
        store,
        queue,
        node,
        engine,
        provisioner,
    }
}

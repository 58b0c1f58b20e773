//! State mutation queue, leader apply loop and the mutation publisher
//!
//! Mutations are JSON payloads appended to an ordered queue. A single
//! leader-gated apply loop drains the queue into the [`ClusterStateStore`].
//! The queue is a trait so the consensus layer behind it can be swapped.

use crate::common::{Error, Result};
use crate::coordinator::cluster_state::{ClusterStateStore, Collection, ReplicaState, ReplicaType};
use crate::coordinator::leader::Leadership;
use crate::coordinator::metadata::MutationLog;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

const LEADER_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// "Replica `core` of `shard` in `collection` should exist on `node_name`"
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AddReplicaMutation {
    pub collection: String,
    pub shard: String,
    pub core: String,
    pub state: ReplicaState,
    pub base_url: String,
    pub node_name: String,
    pub replica_type: ReplicaType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub core_node_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "operation", rename_all = "snake_case")]
pub enum Mutation {
    AddReplica(AddReplicaMutation),
    UpdateReplicaState {
        collection: String,
        core: String,
        state: ReplicaState,
    },
    CreateCollection(Collection),
    NodeLive {
        node: String,
        base_url: String,
    },
    NodeDown {
        node: String,
    },
}

impl Mutation {
    pub fn to_payload(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_payload(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Ordered append of opaque mutation payloads
#[async_trait]
pub trait StateQueue: Send + Sync {
    /// Returns once the payload is durably accepted
    async fn enqueue(&self, payload: Vec<u8>) -> Result<()>;
}

struct QueuedMutation {
    seq: Option<u64>,
    payload: Vec<u8>,
}

/// In-process queue, optionally backed by a [`MutationLog`]
pub struct LocalStateQueue {
    log: Option<Arc<MutationLog>>,
    tx: mpsc::UnboundedSender<QueuedMutation>,
}

impl LocalStateQueue {
    /// Memory-only queue; accepted mutations do not survive a restart
    pub fn in_memory() -> (Self, StateApplier) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { log: None, tx }, StateApplier { rx, log: None })
    }

    /// Durable queue; unapplied entries of a previous run are queued first
    pub fn durable(log: Arc<MutationLog>) -> Result<(Self, StateApplier)> {
        let (tx, rx) = mpsc::unbounded_channel();
        let pending = log.pending()?;
        if !pending.is_empty() {
            info!(count = pending.len(), "replaying unapplied state mutations");
        }
        for record in pending {
            tx.send(QueuedMutation {
                seq: Some(record.seq),
                payload: record.payload,
            })
            .map_err(|_| Error::StateStore("apply loop receiver dropped".into()))?;
        }
        Ok((
            Self {
                log: Some(log.clone()),
                tx,
            },
            StateApplier { rx, log: Some(log) },
        ))
    }
}

#[async_trait]
impl StateQueue for LocalStateQueue {
    async fn enqueue(&self, payload: Vec<u8>) -> Result<()> {
        let (seq, payload) = match &self.log {
            Some(log) => {
                let log = log.clone();
                tokio::task::spawn_blocking(move || log.append(&payload).map(|seq| (Some(seq), payload)))
                    .await
                    .map_err(|e| Error::Internal(format!("mutation log writer failed: {}", e)))??
            }
            None => (None, payload),
        };
        self.tx
            .send(QueuedMutation { seq, payload })
            .map_err(|_| Error::StateStore("state apply loop has stopped".into()))
    }
}

/// Drains the queue into the state store while this node is leader
pub struct StateApplier {
    rx: mpsc::UnboundedReceiver<QueuedMutation>,
    log: Option<Arc<MutationLog>>,
}

impl StateApplier {
    pub fn spawn(
        self,
        store: Arc<ClusterStateStore>,
        leadership: Arc<Leadership>,
    ) -> JoinHandle<()> {
        tokio::spawn(self.run(store, leadership))
    }

    pub async fn run(mut self, store: Arc<ClusterStateStore>, leadership: Arc<Leadership>) {
        while let Some(queued) = self.rx.recv().await {
            while !leadership.is_leader() {
                tokio::time::sleep(LEADER_POLL_INTERVAL).await;
            }
            self.apply_one(&store, queued);
        }
        info!("state apply loop stopped");
    }

    fn apply_one(&self, store: &ClusterStateStore, queued: QueuedMutation) {
        match Mutation::from_payload(&queued.payload).and_then(|m| store.apply(&m)) {
            Ok(version) => debug!(version, "applied state mutation"),
            // a mutation that cannot apply never will; drop it rather than wedge the queue
            Err(e) => error!(error = %e, "discarding state mutation"),
        }
        if let (Some(log), Some(seq)) = (&self.log, queued.seq) {
            if let Err(e) = log.remove(seq) {
                warn!(seq, error = %e, "failed to trim applied mutation from log");
            }
        }
    }
}

/// Builds add-replica records, enqueues them and waits for local visibility
pub struct StateMutationPublisher {
    queue: Arc<dyn StateQueue>,
    store: Arc<ClusterStateStore>,
    visibility_timeout: Duration,
}

impl StateMutationPublisher {
    pub fn new(
        queue: Arc<dyn StateQueue>,
        store: Arc<ClusterStateStore>,
        visibility_timeout: Duration,
    ) -> Self {
        Self {
            queue,
            store,
            visibility_timeout,
        }
    }

    pub fn queue(&self) -> &Arc<dyn StateQueue> {
        &self.queue
    }

    /// Enqueue the record and return the core-node-name the leader assigned
    pub async fn publish(&self, record: AddReplicaMutation) -> Result<String> {
        let collection = record.collection.clone();
        let shard = record.shard.clone();
        let core = record.core.clone();
        let node = record.node_name.clone();
        let payload = Mutation::AddReplica(record).to_payload()?;

        self.queue.enqueue(payload).await.map_err(|e| {
            Error::StateStore(format!("Exception updating state queue: {}", e))
        })?;
        info!(collection = %collection, core = %core, "add-replica mutation enqueued");

        self.wait_visible(&collection, &shard, &core, &node).await
    }

    /// Wait until `core` shows up on `node` in `shard` of the cached state.
    ///
    /// A record with the same core name elsewhere in the collection belongs
    /// to another request and fails the wait at once.
    pub async fn wait_visible(
        &self,
        collection: &str,
        shard: &str,
        core: &str,
        node: &str,
    ) -> Result<String> {
        let found = self
            .store
            .wait_for(self.visibility_timeout, |state| {
                let (on_shard, replica) = state
                    .collection(collection)?
                    .replicas()
                    .find(|(_, r)| r.core == core)?;
                if on_shard.name == shard && replica.node_name == node {
                    Some(Ok(replica.core_node_name.clone()))
                } else {
                    Some(Err(Error::BadRequest(format!(
                        "Another replica with the same core name already exists for this collection: {} (shard {}, node {})",
                        core, on_shard.name, replica.node_name
                    ))))
                }
            })
            .await
            .map_err(|e| match e {
                Error::Timeout(_) => Error::Timeout(format!(
                    "Could not find new replica {} in collection {} within {:?}",
                    core, collection, self.visibility_timeout
                )),
                other => other,
            })?;
        found
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::routing::Router;
    use tempfile::tempdir;

    struct BrokenQueue;

    #[async_trait]
    impl StateQueue for BrokenQueue {
        async fn enqueue(&self, _payload: Vec<u8>) -> Result<()> {
            Err(Error::ConnectionFailed("quorum lost".into()))
        }
    }

    fn record(core: &str) -> AddReplicaMutation {
        AddReplicaMutation {
            collection: "books".into(),
            shard: "shard1".into(),
            core: core.into(),
            state: ReplicaState::Down,
            base_url: "http://n1:8983".into(),
            node_name: "n1".into(),
            replica_type: ReplicaType::Tlog,
            core_node_name: None,
        }
    }

    fn books() -> Mutation {
        Mutation::CreateCollection(Collection::new(
            "books",
            "conf",
            Router::CompositeId,
            &["shard1".to_string()],
        ))
    }

    fn leader() -> Arc<Leadership> {
        let leadership = Arc::new(Leadership::new("coord-1"));
        leadership.become_leader();
        leadership
    }

    #[test]
    fn test_payload_format() {
        let json: serde_json::Value =
            serde_json::from_slice(&Mutation::AddReplica(record("c1")).to_payload().unwrap())
                .unwrap();
        assert_eq!(json["operation"], "add_replica");
        assert_eq!(json["state"], "down");
        assert_eq!(json["replica_type"], "tlog");
        assert!(json.get("core_node_name").is_none());
    }

    #[tokio::test]
    async fn test_publish_returns_assigned_core_node_name() {
        let store = Arc::new(ClusterStateStore::default());
        let (queue, applier) = LocalStateQueue::in_memory();
        applier.spawn(store.clone(), leader());
        queue.enqueue(books().to_payload().unwrap()).await.unwrap();

        let publisher =
            StateMutationPublisher::new(Arc::new(queue), store.clone(), Duration::from_secs(2));
        let name = publisher.publish(record("c1")).await.unwrap();
        assert_eq!(name, "core_node1");
        let replica = store
            .snapshot()
            .collection("books")
            .unwrap()
            .replica_by_core("c1")
            .cloned()
            .unwrap();
        assert_eq!(replica.state, ReplicaState::Down);
        assert_eq!(replica.replica_type, ReplicaType::Tlog);
    }

    #[tokio::test]
    async fn test_record_of_another_request_is_not_claimed() {
        let store = Arc::new(ClusterStateStore::default());
        let (queue, applier) = LocalStateQueue::in_memory();
        applier.spawn(store.clone(), leader());
        queue.enqueue(books().to_payload().unwrap()).await.unwrap();

        let publisher =
            StateMutationPublisher::new(Arc::new(queue), store.clone(), Duration::from_secs(2));
        publisher.publish(record("c1")).await.unwrap();

        let mut elsewhere = record("c1");
        elsewhere.node_name = "n2".into();
        elsewhere.base_url = "http://n2:8983".into();
        let err = publisher.publish(elsewhere).await.unwrap_err();
        assert!(matches!(err, Error::BadRequest(msg) if msg.contains("node n1")));
        assert_eq!(store.snapshot().collection("books").unwrap().replicas().count(), 1);
    }

    #[tokio::test]
    async fn test_enqueue_failure_is_state_store_error() {
        let store = Arc::new(ClusterStateStore::default());
        let publisher =
            StateMutationPublisher::new(Arc::new(BrokenQueue), store.clone(), Duration::from_secs(1));
        let err = publisher.publish(record("c1")).await.unwrap_err();
        assert!(matches!(err, Error::StateStore(_)));
        assert_eq!(store.version(), 0);
    }

    #[tokio::test]
    async fn test_follower_does_not_apply() {
        let store = Arc::new(ClusterStateStore::default());
        let (queue, applier) = LocalStateQueue::in_memory();
        let leadership = Arc::new(Leadership::new("coord-2"));
        applier.spawn(store.clone(), leadership.clone());

        queue.enqueue(books().to_payload().unwrap()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert_eq!(store.version(), 0);

        leadership.become_leader();
        store
            .wait_for(Duration::from_secs(2), |s| s.collection("books").map(|_| ()))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_durable_queue_replays_unapplied_entries() {
        let dir = tempdir().unwrap();
        let log = Arc::new(MutationLog::open(dir.path().join("queue")).unwrap());

        {
            // accepted but never applied: the applier is dropped
            let (queue, _applier) = LocalStateQueue::durable(log.clone()).unwrap();
            queue.enqueue(books().to_payload().unwrap()).await.unwrap();
        }
        assert_eq!(log.len().unwrap(), 1);

        let store = Arc::new(ClusterStateStore::default());
        let (_queue, applier) = LocalStateQueue::durable(log.clone()).unwrap();
        applier.spawn(store.clone(), leader());
        store
            .wait_for(Duration::from_secs(2), |s| s.collection("books").map(|_| ()))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(log.is_empty().unwrap());
    }
}

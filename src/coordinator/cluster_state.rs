//! Cluster state model and the locally cached, versioned state store
//!
//! Stores:
//! - Collections → shards → replicas
//! - Live node set (node name → base URL)
//!
//! The store is written only by the leader apply loop; readers take cheap
//! `Arc` snapshots. Every applied mutation bumps the version and notifies
//! the convergence watchers of the affected collections.

use crate::common::{Error, HashRange, Result};
use crate::coordinator::routing::Router;
use crate::coordinator::state_queue::{AddReplicaMutation, Mutation};
use crate::coordinator::watcher::{WatchGuard, WatcherRegistry};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, warn};

/// Replica type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplicaType {
    /// Normal-write replica, indexes locally
    #[default]
    Nrt,
    /// Transaction-log-only replica
    Tlog,
    /// Read-only replica pulling from the leader
    Pull,
}

impl ReplicaType {
    /// Single-letter tag used in generated core names
    pub fn letter(&self) -> char {
        match self {
            ReplicaType::Nrt => 'n',
            ReplicaType::Tlog => 't',
            ReplicaType::Pull => 'p',
        }
    }
}

impl std::fmt::Display for ReplicaType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReplicaType::Nrt => write!(f, "NRT"),
            ReplicaType::Tlog => write!(f, "TLOG"),
            ReplicaType::Pull => write!(f, "PULL"),
        }
    }
}

impl FromStr for ReplicaType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "nrt" => Ok(ReplicaType::Nrt),
            "tlog" => Ok(ReplicaType::Tlog),
            "pull" => Ok(ReplicaType::Pull),
            other => Err(Error::BadRequest(format!("Unknown replica type: {}", other))),
        }
    }
}

/// Replica lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplicaState {
    Down,
    Recovering,
    Active,
    Failed,
}

impl std::fmt::Display for ReplicaState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReplicaState::Down => write!(f, "down"),
            ReplicaState::Recovering => write!(f, "recovering"),
            ReplicaState::Active => write!(f, "active"),
            ReplicaState::Failed => write!(f, "failed"),
        }
    }
}

/// Shard lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShardState {
    #[default]
    Active,
    Inactive,
    Construction,
    Recovery,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Replica {
    pub core_node_name: String,
    pub core: String,
    pub node_name: String,
    pub base_url: String,
    pub replica_type: ReplicaType,
    pub state: ReplicaState,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Shard {
    pub name: String,
    #[serde(default)]
    pub state: ShardState,
    #[serde(default)]
    pub range: Option<HashRange>,
    /// Replicas keyed by core-node-name
    #[serde(default)]
    pub replicas: BTreeMap<String, Replica>,
}

impl Shard {
    pub fn new(name: impl Into<String>, range: Option<HashRange>) -> Self {
        Self {
            name: name.into(),
            state: ShardState::Active,
            range,
            replicas: BTreeMap::new(),
        }
    }

    pub fn is_active(&self) -> bool {
        self.state == ShardState::Active
    }

    pub fn replica_by_core(&self, core: &str) -> Option<&Replica> {
        self.replicas.values().find(|r| r.core == core)
    }

    pub fn hosts_node(&self, node: &str) -> bool {
        self.replicas.values().any(|r| r.node_name == node)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Collection {
    pub name: String,
    pub config_name: String,
    #[serde(default)]
    pub router: Router,
    #[serde(default)]
    pub policy: Option<String>,
    #[serde(default)]
    pub max_shards_per_node: Option<usize>,
    #[serde(default)]
    pub shards: BTreeMap<String, Shard>,
}

impl Collection {
    /// New collection; composite-id collections get the ring split across shards
    pub fn new(
        name: impl Into<String>,
        config_name: impl Into<String>,
        router: Router,
        shard_names: &[String],
    ) -> Self {
        let ranges = match router {
            Router::CompositeId => HashRange::full()
                .split(shard_names.len())
                .into_iter()
                .map(Some)
                .collect(),
            Router::Implicit => vec![None; shard_names.len()],
        };
        let shards = shard_names
            .iter()
            .zip(ranges)
            .map(|(name, range)| (name.clone(), Shard::new(name.clone(), range)))
            .collect();
        Self {
            name: name.into(),
            config_name: config_name.into(),
            router,
            policy: None,
            max_shards_per_node: None,
            shards,
        }
    }

    pub fn shard(&self, name: &str) -> Option<&Shard> {
        self.shards.get(name)
    }

    pub fn replicas(&self) -> impl Iterator<Item = (&Shard, &Replica)> {
        self.shards
            .values()
            .flat_map(|shard| shard.replicas.values().map(move |r| (shard, r)))
    }

    pub fn replica_by_core(&self, core: &str) -> Option<&Replica> {
        self.replicas().map(|(_, r)| r).find(|r| r.core == core)
    }

    /// Core names are unique across every shard of the collection
    pub fn has_core(&self, core: &str) -> bool {
        self.replica_by_core(core).is_some()
    }

    pub fn has_core_node_name(&self, core_node_name: &str) -> bool {
        self.replicas().any(|(_, r)| r.core_node_name == core_node_name)
    }

    pub fn replicas_on_node(&self, node: &str) -> usize {
        self.replicas().filter(|(_, r)| r.node_name == node).count()
    }

    /// Next free `core_nodeN` id across the collection
    pub fn next_core_node_name(&self) -> String {
        let max = self
            .replicas()
            .filter_map(|(_, r)| r.core_node_name.strip_prefix("core_node"))
            .filter_map(|n| n.parse::<u64>().ok())
            .max()
            .unwrap_or(0);
        format!("core_node{}", max + 1)
    }

    fn replica_by_core_mut(&mut self, core: &str) -> Option<&mut Replica> {
        self.shards
            .values_mut()
            .flat_map(|s| s.replicas.values_mut())
            .find(|r| r.core == core)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClusterState {
    pub version: u64,
    pub collections: BTreeMap<String, Collection>,
    /// Live node name → base URL
    pub live_nodes: BTreeMap<String, String>,
}

impl ClusterState {
    pub fn collection(&self, name: &str) -> Option<&Collection> {
        self.collections.get(name)
    }

    pub fn live_nodes_contain(&self, node: &str) -> bool {
        self.live_nodes.contains_key(node)
    }

    pub fn base_url_for(&self, node: &str) -> Option<&str> {
        self.live_nodes.get(node).map(String::as_str)
    }

    /// Replicas of every collection hosted on `node`
    pub fn replicas_on_node(&self, node: &str) -> usize {
        self.collections
            .values()
            .map(|c| c.replicas_on_node(node))
            .sum()
    }

    /// True when every core in `cores` exists in `collection` and is active
    pub fn all_active(&self, collection: &str, cores: &[String]) -> bool {
        let Some(coll) = self.collection(collection) else {
            return false;
        };
        cores.iter().all(|core| {
            coll.replica_by_core(core)
                .is_some_and(|r| r.state == ReplicaState::Active)
        })
    }

    /// Apply one mutation, returning the names of the collections it touched
    pub fn apply(&mut self, mutation: &Mutation) -> Result<Vec<String>> {
        match mutation {
            Mutation::AddReplica(add) => self.apply_add_replica(add),
            Mutation::UpdateReplicaState {
                collection,
                core,
                state,
            } => {
                let coll = self.collections.get_mut(collection).ok_or_else(|| {
                    Error::StateStore(format!("collection {} does not exist", collection))
                })?;
                match coll.replica_by_core_mut(core) {
                    Some(replica) => {
                        replica.state = *state;
                        Ok(vec![collection.clone()])
                    }
                    None => {
                        warn!(collection = %collection, core = %core, "state update for unknown replica ignored");
                        Ok(Vec::new())
                    }
                }
            }
            Mutation::CreateCollection(collection) => {
                if self.collections.contains_key(&collection.name) {
                    return Err(Error::StateStore(format!(
                        "collection {} already exists",
                        collection.name
                    )));
                }
                self.collections
                    .insert(collection.name.clone(), collection.clone());
                Ok(vec![collection.name.clone()])
            }
            Mutation::NodeLive { node, base_url } => {
                self.live_nodes.insert(node.clone(), base_url.clone());
                Ok(Vec::new())
            }
            Mutation::NodeDown { node } => {
                self.live_nodes.remove(node);
                let mut touched = Vec::new();
                for coll in self.collections.values_mut() {
                    let mut changed = false;
                    for replica in coll
                        .shards
                        .values_mut()
                        .flat_map(|s| s.replicas.values_mut())
                        .filter(|r| &r.node_name == node)
                    {
                        replica.state = ReplicaState::Down;
                        changed = true;
                    }
                    if changed {
                        touched.push(coll.name.clone());
                    }
                }
                Ok(touched)
            }
        }
    }

    fn apply_add_replica(&mut self, add: &AddReplicaMutation) -> Result<Vec<String>> {
        let coll = self.collections.get_mut(&add.collection).ok_or_else(|| {
            Error::StateStore(format!("collection {} does not exist", add.collection))
        })?;

        // core names are unique across the collection; only an exact replay is accepted
        if let Some((shard, existing)) = coll.replicas().find(|(_, r)| r.core == add.core) {
            if shard.name == add.shard && existing.node_name == add.node_name {
                debug!(core = %add.core, "replica already present, add is a no-op");
                return Ok(Vec::new());
            }
            return Err(Error::StateStore(format!(
                "core {} already exists in collection {} (shard {}, node {})",
                add.core, add.collection, shard.name, existing.node_name
            )));
        }
        if let Some(name) = &add.core_node_name {
            if coll.has_core_node_name(name) {
                return Err(Error::StateStore(format!(
                    "core node name {} already in use in collection {}",
                    name, add.collection
                )));
            }
        }

        let core_node_name = add
            .core_node_name
            .clone()
            .unwrap_or_else(|| coll.next_core_node_name());
        let shard = coll.shards.get_mut(&add.shard).ok_or_else(|| {
            Error::StateStore(format!(
                "shard {} of collection {} does not exist",
                add.shard, add.collection
            ))
        })?;

        shard.replicas.insert(
            core_node_name.clone(),
            Replica {
                core_node_name,
                core: add.core.clone(),
                node_name: add.node_name.clone(),
                base_url: add.base_url.clone(),
                replica_type: add.replica_type,
                state: add.state,
            },
        );
        Ok(vec![add.collection.clone()])
    }
}

/// Process-wide cluster state cache
pub struct ClusterStateStore {
    state: RwLock<Arc<ClusterState>>,
    version_tx: watch::Sender<u64>,
    watchers: Arc<WatcherRegistry>,
}

impl Default for ClusterStateStore {
    fn default() -> Self {
        Self::new(Arc::new(WatcherRegistry::new()))
    }
}

impl ClusterStateStore {
    pub fn new(watchers: Arc<WatcherRegistry>) -> Self {
        Self::with_state(ClusterState::default(), watchers)
    }

    pub fn with_state(state: ClusterState, watchers: Arc<WatcherRegistry>) -> Self {
        let (version_tx, _) = watch::channel(state.version);
        Self {
            state: RwLock::new(Arc::new(state)),
            version_tx,
            watchers,
        }
    }

    pub fn snapshot(&self) -> Arc<ClusterState> {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn version(&self) -> u64 {
        *self.version_tx.borrow()
    }

    pub fn watchers(&self) -> &Arc<WatcherRegistry> {
        &self.watchers
    }

    /// Apply a mutation and publish the new version
    pub fn apply(&self, mutation: &Mutation) -> Result<u64> {
        let (snapshot, touched) = {
            let mut guard = self.state.write().unwrap_or_else(PoisonError::into_inner);
            let mut next = ClusterState::clone(&guard);
            let touched = next.apply(mutation)?;
            next.version += 1;
            let snapshot = Arc::new(next);
            *guard = snapshot.clone();
            (snapshot, touched)
        };

        self.version_tx.send_replace(snapshot.version);
        for collection in &touched {
            self.watchers.notify(collection, &snapshot);
        }
        Ok(snapshot.version)
    }

    /// Register an active-replica watch for `cores` in `collection`.
    ///
    /// The current state is checked after registration so an activation that
    /// lands in between is never missed.
    pub fn watch_active(&self, collection: &str, cores: Vec<String>) -> WatchGuard {
        let guard = self.watchers.register(collection, cores);
        guard.check(&self.snapshot());
        guard
    }

    /// Wait until `check` yields a value, re-evaluating on every version bump
    pub async fn wait_for<T, F>(&self, timeout: Duration, mut check: F) -> Result<T>
    where
        F: FnMut(&ClusterState) -> Option<T>,
    {
        let deadline = tokio::time::Instant::now() + timeout;
        let mut rx = self.version_tx.subscribe();
        loop {
            if let Some(found) = check(&self.snapshot()) {
                return Ok(found);
            }
            match tokio::time::timeout_at(deadline, rx.changed()).await {
                Ok(Ok(())) => continue,
                Ok(Err(_)) => {
                    return Err(Error::Internal("cluster state channel closed".into()));
                }
                Err(_) => {
                    return Err(Error::Timeout(format!(
                        "condition not met in cluster state within {:?}",
                        timeout
                    )));
                }
            }
        }
    }
}

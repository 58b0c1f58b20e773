//! Placement of new replicas
//!
//! Two strategies pick the target node:
//! - policy-driven: a [`PolicyEngine`] ranks candidate nodes; the engine may
//!   open a reference on a versioned policy session, handed back to the
//!   caller as an owned [`PolicySession`]
//! - fallback: least-loaded live node, deterministic for a given state
//!
//! An explicit node from the caller bypasses both.

use crate::common::{hrw_weight, Error, PolicyRules, Result};
use crate::coordinator::cluster_state::{ClusterState, Collection, ReplicaType};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, warn};

/// Required replica counts per type
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplicaCounts {
    pub nrt: usize,
    pub tlog: usize,
    pub pull: usize,
}

impl ReplicaCounts {
    /// Exactly one replica of `replica_type`
    pub fn single(replica_type: ReplicaType) -> Self {
        Self {
            nrt: usize::from(replica_type == ReplicaType::Nrt),
            tlog: usize::from(replica_type == ReplicaType::Tlog),
            pull: usize::from(replica_type == ReplicaType::Pull),
        }
    }

    pub fn total(&self) -> usize {
        self.nrt + self.tlog + self.pull
    }
}

#[derive(Debug, Clone)]
pub struct PlacementRequest {
    pub collection: String,
    pub shard: String,
    pub replica_type: ReplicaType,
    /// Caller-chosen node; skips selection entirely
    pub node: Option<String>,
    /// Policy session version the caller already holds, if any
    pub held_session: Option<u64>,
}

/// What the policy engine is asked
#[derive(Debug, Clone)]
pub struct PolicyRequest<'a> {
    pub policy_name: Option<&'a str>,
    pub collection: &'a str,
    pub shard: &'a str,
    pub counts: ReplicaCounts,
    pub held_session: Option<u64>,
}

/// Ranked nodes plus the session version that produced them
#[derive(Debug, Clone, Default)]
pub struct PolicyOutcome {
    pub nodes: Vec<String>,
    pub session: Option<u64>,
}

/// External placement-policy engine
#[async_trait]
pub trait PolicyEngine: Send + Sync {
    async fn identify_nodes(
        &self,
        request: &PolicyRequest<'_>,
        state: &ClusterState,
    ) -> Result<PolicyOutcome>;

    /// Drop one reference on session `version`
    fn release(&self, version: u64);
}

/// One reference on a policy session.
///
/// [`PolicySession::release`] consumes the handle; an unreleased handle
/// releases itself on drop, so every exit path gives the reference back once.
pub struct PolicySession {
    version: u64,
    engine: Arc<dyn PolicyEngine>,
    released: bool,
}

impl PolicySession {
    pub fn new(version: u64, engine: Arc<dyn PolicyEngine>) -> Self {
        Self {
            version,
            engine,
            released: false,
        }
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn release(mut self) {
        self.release_once();
    }

    fn release_once(&mut self) {
        if !self.released {
            self.released = true;
            debug!(version = self.version, "releasing policy session");
            self.engine.release(self.version);
        }
    }
}

impl Drop for PolicySession {
    fn drop(&mut self) {
        self.release_once();
    }
}

impl std::fmt::Debug for PolicySession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PolicySession")
            .field("version", &self.version)
            .field("released", &self.released)
            .finish()
    }
}

/// Chosen node, and the session opened while choosing it
#[derive(Debug)]
pub struct Placement {
    pub node: String,
    pub session: Option<PolicySession>,
}

impl Placement {
    pub fn explicit(node: impl Into<String>) -> Self {
        Self {
            node: node.into(),
            session: None,
        }
    }
}

pub struct PlacementSelector {
    engine: Option<Arc<dyn PolicyEngine>>,
    cluster_policy: Option<String>,
}

impl PlacementSelector {
    pub fn new(engine: Option<Arc<dyn PolicyEngine>>, cluster_policy: Option<String>) -> Self {
        Self {
            engine,
            cluster_policy,
        }
    }

    fn engine_for(&self, collection: &Collection) -> Option<&Arc<dyn PolicyEngine>> {
        self.engine
            .as_ref()
            .filter(|_| collection.policy.is_some() || self.cluster_policy.is_some())
    }

    pub async fn select(&self, request: &PlacementRequest, state: &ClusterState) -> Result<Placement> {
        if let Some(node) = &request.node {
            return Ok(Placement::explicit(node.clone()));
        }

        let collection = state.collection(&request.collection).ok_or_else(|| {
            Error::BadRequest(format!("Collection: {} does not exist", request.collection))
        })?;

        match self.engine_for(collection) {
            Some(engine) => {
                self.select_with_policy(engine, collection, request, state)
                    .await
            }
            None => fallback_node(collection, &request.shard, state).map(Placement::explicit),
        }
    }

    async fn select_with_policy(
        &self,
        engine: &Arc<dyn PolicyEngine>,
        collection: &Collection,
        request: &PlacementRequest,
        state: &ClusterState,
    ) -> Result<Placement> {
        let policy_request = PolicyRequest {
            policy_name: collection
                .policy
                .as_deref()
                .or(self.cluster_policy.as_deref()),
            collection: &collection.name,
            shard: &request.shard,
            counts: ReplicaCounts::single(request.replica_type),
            held_session: request.held_session,
        };
        let outcome = engine.identify_nodes(&policy_request, state).await?;

        // a session other than the one held before the call is ours to release
        let session = outcome
            .session
            .filter(|version| request.held_session != Some(*version))
            .map(|version| PolicySession::new(version, engine.clone()));

        let node = outcome.nodes.into_iter().next().ok_or_else(|| {
            Error::Placement(format!(
                "policy {} found no node for collection {} shard {}",
                policy_request.policy_name.unwrap_or("<default>"),
                collection.name,
                request.shard
            ))
        })?;
        Ok(Placement { node, session })
    }
}

/// Least-loaded live node for a new replica of `shard`.
///
/// Order: nodes not yet hosting the shard, fewest replicas of this
/// collection, fewest replicas overall, then node name.
pub fn fallback_node(collection: &Collection, shard: &str, state: &ClusterState) -> Result<String> {
    let hosting = collection.shard(shard);
    let mut candidates: Vec<(bool, usize, usize, &String)> = state
        .live_nodes
        .keys()
        .map(|node| {
            (
                hosting.is_some_and(|s| s.hosts_node(node)),
                collection.replicas_on_node(node),
                state.replicas_on_node(node),
                node,
            )
        })
        .filter(|(_, in_collection, _, _)| {
            collection
                .max_shards_per_node
                .map_or(true, |max| *in_collection < max)
        })
        .collect();

    if candidates.is_empty() {
        return Err(Error::Placement(format!(
            "no live node can host another replica of collection {} ({} live nodes, max_shards_per_node {:?})",
            collection.name,
            state.live_nodes.len(),
            collection.max_shards_per_node
        )));
    }

    candidates.sort();
    Ok(candidates[0].3.clone())
}

#[derive(Debug, Default)]
struct SessionState {
    version: u64,
    refs: usize,
}

/// Reference-counted, versioned policy session
#[derive(Debug, Default)]
pub struct SessionRefs {
    inner: Mutex<SessionState>,
}

impl SessionRefs {
    /// Add a reference; a fresh version starts when none are outstanding
    pub fn acquire(&self) -> u64 {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        if inner.refs == 0 {
            inner.version += 1;
        }
        inner.refs += 1;
        inner.version
    }

    pub fn release(&self, version: u64) {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        if inner.version != version || inner.refs == 0 {
            warn!(version, current = inner.version, "release of stale policy session");
            return;
        }
        inner.refs -= 1;
    }

    pub fn refs(&self) -> usize {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner).refs
    }
}

/// Rule-based policy engine over named [`PolicyRules`]
pub struct RulePolicyEngine {
    policies: BTreeMap<String, PolicyRules>,
    sessions: SessionRefs,
}

impl RulePolicyEngine {
    pub fn new(policies: BTreeMap<String, PolicyRules>) -> Self {
        Self {
            policies,
            sessions: SessionRefs::default(),
        }
    }

    pub fn sessions(&self) -> &SessionRefs {
        &self.sessions
    }
}

#[async_trait]
impl PolicyEngine for RulePolicyEngine {
    async fn identify_nodes(
        &self,
        request: &PolicyRequest<'_>,
        state: &ClusterState,
    ) -> Result<PolicyOutcome> {
        let rules = match request.policy_name {
            Some(name) => self
                .policies
                .get(name)
                .ok_or_else(|| Error::BadRequest(format!("Unknown placement policy: {}", name)))?
                .clone(),
            None => PolicyRules::default(),
        };
        let session = match request.held_session {
            Some(version) => version,
            None => self.sessions.acquire(),
        };

        let collection = state.collection(request.collection);
        let shard = collection.and_then(|c| c.shard(request.shard));
        let max_per_shard = rules.max_shard_replicas_per_node.unwrap_or(1);
        let weight_key = format!("{}/{}", request.collection, request.shard);

        let mut ranked: Vec<(usize, std::cmp::Reverse<u64>, String)> = state
            .live_nodes
            .keys()
            .filter(|node| !rules.excluded_nodes.contains(node))
            .filter(|node| {
                let on_shard = shard.map_or(0, |s| {
                    s.replicas.values().filter(|r| &r.node_name == *node).count()
                });
                on_shard < max_per_shard
            })
            .filter(|node| {
                rules
                    .max_replicas_per_node
                    .map_or(true, |max| state.replicas_on_node(node) < max)
            })
            .map(|node| {
                (
                    state.replicas_on_node(node),
                    std::cmp::Reverse(hrw_weight(&weight_key, node)),
                    node.clone(),
                )
            })
            .collect();
        ranked.sort();

        Ok(PolicyOutcome {
            nodes: ranked
                .into_iter()
                .take(request.counts.total().max(1))
                .map(|(_, _, node)| node)
                .collect(),
            session: Some(session),
        })
    }

    fn release(&self, version: u64) {
        self.sessions.release(version);
    }
}

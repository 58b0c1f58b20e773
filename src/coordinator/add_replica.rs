//! Add-replica workflow
//!
//! Validation → placement → state mutation → dispatch → completion.
//! Everything that can be rejected is rejected before the first side effect.
//! The completion work is built once as a [`CompletionAction`] and then run
//! inline, in the background pool, or inline followed by a wait for the
//! replica to turn active, depending on the [`ExecutionMode`].

use crate::common::{non_blank, Error, ProvisioningConfig, Result};
use crate::coordinator::async_tracker::AsyncTracker;
use crate::coordinator::cluster_state::{ClusterStateStore, Collection, ReplicaState, ReplicaType};
use crate::coordinator::dispatcher::{
    CoreAction, CreateCoreRequest, DispatchHandle, NodeClient, OperationResults,
    ProvisioningDispatcher,
};
use crate::coordinator::placement::{
    Placement, PlacementRequest, PlacementSelector, PolicyEngine, PolicySession,
};
use crate::coordinator::state_queue::{
    AddReplicaMutation, Mutation, StateMutationPublisher, StateQueue,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const PROPERTY_PREFIX: &str = "property.";

/// Caller-facing add-replica parameters
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AddReplicaRequest {
    pub collection: String,
    pub node: Option<String>,
    pub shard: Option<String>,
    pub route_key: Option<String>,
    /// Core name; falls back to the `name` property
    #[serde(alias = "name")]
    pub core: Option<String>,
    pub core_node_name: Option<String>,
    #[serde(alias = "type")]
    pub replica_type: ReplicaType,
    pub timeout_secs: Option<u64>,
    pub parallel: bool,
    pub wait_for_final_state: bool,
    pub async_id: Option<String>,
    pub data_dir: Option<String>,
    pub ulog_dir: Option<String>,
    pub instance_dir: Option<String>,
    /// Passed through to the node; keys may carry the `property.` prefix
    pub properties: BTreeMap<String, String>,
    pub skip_create_replica_in_cluster_state: bool,
}

impl AddReplicaRequest {
    pub fn new(collection: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            ..Default::default()
        }
    }

    /// Properties with the `property.` prefix stripped
    pub fn node_properties(&self) -> BTreeMap<String, String> {
        self.properties
            .iter()
            .map(|(k, v)| {
                let key = k.strip_prefix(PROPERTY_PREFIX).unwrap_or(k);
                (key.to_string(), v.clone())
            })
            .collect()
    }

    fn requested_core(&self) -> Option<String> {
        non_blank(self.core.as_deref())
            .map(str::to_string)
            .or_else(|| self.node_properties().remove("name"))
            .filter(|name| !name.trim().is_empty())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AddReplicaResponse {
    pub collection: String,
    pub shard: String,
    pub core: String,
    pub node: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub core_node_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub async_id: Option<String>,
}

/// How the completion action runs relative to the caller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionMode {
    Inline,
    Background,
    AwaitActive(Duration),
}

impl ExecutionMode {
    pub fn for_request(request: &AddReplicaRequest, default_timeout: Duration) -> Self {
        if request.wait_for_final_state {
            let timeout = request
                .timeout_secs
                .map(Duration::from_secs)
                .unwrap_or(default_timeout);
            ExecutionMode::AwaitActive(timeout)
        } else if request.parallel {
            ExecutionMode::Background
        } else {
            ExecutionMode::Inline
        }
    }
}

/// Bounded set of background tasks for parallel completions
#[derive(Clone)]
pub struct CompletionPool {
    permits: Arc<Semaphore>,
}

impl CompletionPool {
    pub fn new(size: usize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(size.max(1))),
        }
    }

    /// Spawn `task`; it starts once a slot is free
    pub fn submit<F, T>(&self, task: F) -> JoinHandle<T>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let permits = self.permits.clone();
        tokio::spawn(async move {
            let _permit = permits.acquire_owned().await.ok();
            task.await
        })
    }

    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }
}

/// Called with the response and outcome once a completion action finishes
pub type CompletionHook = Arc<dyn Fn(&AddReplicaResponse, &Result<()>) + Send + Sync>;

/// The work left after dispatch: collect, confirm, release, report
pub struct CompletionAction {
    dispatcher: Arc<ProvisioningDispatcher>,
    store: Arc<ClusterStateStore>,
    tracker: Arc<AsyncTracker>,
    hook: Option<CompletionHook>,
    /// `None` in legacy mode
    core_node_name_timeout: Option<Duration>,
    handle: DispatchHandle,
    session: Option<PolicySession>,
    state_recorded: bool,
    response: AddReplicaResponse,
}

impl CompletionAction {
    /// Run to the end and record the outcome under the async id, if any
    pub async fn run(self) -> Result<()> {
        let tracker = self.tracker.clone();
        let async_id = self.response.async_id.clone();
        let (results, outcome) = self.execute().await;
        if let Some(async_id) = &async_id {
            tracker.finish(async_id, results, outcome.as_ref().err());
        }
        outcome
    }

    /// Collect, confirm, release and report; the async status is left to the caller
    async fn execute(self) -> (OperationResults, Result<()>) {
        let CompletionAction {
            dispatcher,
            store,
            tracker: _,
            hook,
            core_node_name_timeout,
            handle,
            session,
            state_recorded,
            response,
        } = self;

        let mut results = OperationResults::default();
        dispatcher.collect(handle, &mut results).await;

        let outcome = if results.has_failures() {
            let state_note = if state_recorded {
                "cluster state already records the replica as down"
            } else {
                "cluster state unchanged"
            };
            Err(Error::Dispatch {
                core: response.core.clone(),
                detail: format!("{} ({})", results.failure_summary(), state_note),
                state_recorded,
            })
        } else if let Some(timeout) = core_node_name_timeout {
            match wait_for_core_node_name(&store, &response, timeout).await {
                Ok(name) => {
                    debug!(core = %response.core, core_node_name = %name, "replica registered");
                    Ok(())
                }
                Err(e) => Err(e),
            }
        } else {
            Ok(())
        };

        if let Some(session) = session {
            session.release();
        }
        if let Some(hook) = &hook {
            hook(&response, &outcome);
        }
        (results, outcome)
    }
}

async fn wait_for_core_node_name(
    store: &ClusterStateStore,
    response: &AddReplicaResponse,
    timeout: Duration,
) -> Result<String> {
    store
        .wait_for(timeout, |state| {
            state
                .collection(&response.collection)?
                .replicas()
                .find(|(shard, r)| {
                    r.core == response.core
                        && r.node_name == response.node
                        && shard.name == response.shard
                })
                .map(|(_, r)| r.core_node_name.clone())
        })
        .await
        .map_err(|e| match e {
            Error::Timeout(_) => Error::Timeout(format!(
                "Could not find core node name for {} on {} within {:?}",
                response.core, response.node, timeout
            )),
            other => other,
        })
}

/// `<collection>_<shard>_replica_<t><n>`, unique within the collection and
/// not rejected by `taken`
pub fn synthesize_core_name(
    collection: &Collection,
    shard: &str,
    replica_type: ReplicaType,
    taken: impl Fn(&str) -> bool,
) -> String {
    let mut n = collection
        .shard(shard)
        .map(|s| s.replicas.len())
        .unwrap_or(0);
    loop {
        n += 1;
        let name = format!(
            "{}_{}_replica_{}{}",
            collection.name,
            shard,
            replica_type.letter(),
            n
        );
        if !collection.has_core(&name) && !taken(&name) {
            return name;
        }
    }
}

/// Core names claimed by requests that have not yet published their record
#[derive(Default)]
struct CoreReservations {
    claimed: Mutex<HashSet<(String, String)>>,
}

/// Held from validation until the request returns; unclaims on drop
struct CoreClaim {
    owner: Arc<CoreReservations>,
    key: (String, String),
}

impl Drop for CoreClaim {
    fn drop(&mut self) {
        self.owner
            .claimed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.key);
    }
}

/// Everything validation resolved, before any side effect
struct ValidatedRequest {
    shard: String,
    core: String,
    config_name: String,
    _claim: CoreClaim,
}

pub struct ReplicaProvisioner {
    settings: ProvisioningConfig,
    store: Arc<ClusterStateStore>,
    selector: PlacementSelector,
    publisher: StateMutationPublisher,
    dispatcher: Arc<ProvisioningDispatcher>,
    tracker: Arc<AsyncTracker>,
    reservations: Arc<CoreReservations>,
    pool: CompletionPool,
    on_complete: Option<CompletionHook>,
}

impl ReplicaProvisioner {
    pub fn new(
        settings: ProvisioningConfig,
        store: Arc<ClusterStateStore>,
        queue: Arc<dyn StateQueue>,
        node_client: Arc<dyn NodeClient>,
        policy_engine: Option<Arc<dyn PolicyEngine>>,
    ) -> Self {
        let selector = PlacementSelector::new(policy_engine, settings.cluster_policy.clone());
        let publisher =
            StateMutationPublisher::new(queue, store.clone(), settings.state_visibility_timeout());
        let dispatcher = Arc::new(ProvisioningDispatcher::new(
            node_client,
            settings.async_poll_interval(),
            settings.max_async_wait(),
        ));
        let pool = CompletionPool::new(settings.completion_pool_size);
        let tracker = Arc::new(AsyncTracker::with_retention(settings.async_status_retention));
        Self {
            settings,
            store,
            selector,
            publisher,
            dispatcher,
            tracker,
            reservations: Arc::new(CoreReservations::default()),
            pool,
            on_complete: None,
        }
    }

    pub fn with_on_complete(mut self, hook: CompletionHook) -> Self {
        self.on_complete = Some(hook);
        self
    }

    pub fn store(&self) -> &Arc<ClusterStateStore> {
        &self.store
    }

    pub fn tracker(&self) -> &Arc<AsyncTracker> {
        &self.tracker
    }

    pub fn settings(&self) -> &ProvisioningConfig {
        &self.settings
    }

    /// Enqueue a state mutation without waiting for it to apply
    pub async fn submit_mutation(&self, mutation: &Mutation) -> Result<()> {
        self.publisher
            .queue()
            .enqueue(mutation.to_payload()?)
            .await
            .map_err(|e| Error::StateStore(format!("Exception updating state queue: {}", e)))
    }

    /// Create a collection and wait until it is visible
    pub async fn create_collection(&self, collection: Collection) -> Result<()> {
        if collection.name.trim().is_empty() {
            return Err(Error::BadRequest("collection name is required".into()));
        }
        if collection.shards.is_empty() {
            return Err(Error::BadRequest("at least one shard is required".into()));
        }
        if self.store.snapshot().collection(&collection.name).is_some() {
            return Err(Error::BadRequest(format!(
                "collection already exists: {}",
                collection.name
            )));
        }
        let name = collection.name.clone();
        self.submit_mutation(&Mutation::CreateCollection(collection))
            .await?;
        self.store
            .wait_for(self.settings.state_visibility_timeout(), |state| {
                state.collection(&name).map(|_| ())
            })
            .await
    }

    pub async fn add_replica(&self, request: AddReplicaRequest) -> Result<AddReplicaResponse> {
        let validated = self.validate(&request)?;

        let async_id = non_blank(request.async_id.as_deref()).map(str::to_string);
        if let Some(async_id) = &async_id {
            self.tracker.submit(async_id, "add_replica")?;
        }

        let result = self.provision(&request, validated, async_id.clone()).await;
        // failures before the completion action still close the async entry
        if let (Err(e), Some(async_id)) = (&result, &async_id) {
            self.tracker
                .finish(async_id, OperationResults::default(), Some(e));
        }
        result
    }

    fn validate(&self, request: &AddReplicaRequest) -> Result<ValidatedRequest> {
        let collection_name = non_blank(Some(request.collection.as_str()))
            .ok_or_else(|| Error::BadRequest("Missing required parameter: collection".into()))?;

        // the snapshot is taken under the claim lock so a released claim is
        // always visible as a recorded replica
        let mut claimed = self
            .reservations
            .claimed
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let state = self.store.snapshot();
        let collection = state.collection(collection_name).ok_or_else(|| {
            Error::BadRequest(format!("Collection: {} does not exist", collection_name))
        })?;

        let shard = ProvisioningDispatcher::resolve_shard(
            collection,
            non_blank(request.shard.as_deref()),
            non_blank(request.route_key.as_deref()),
        )?;
        if collection.shard(&shard).is_none() {
            return Err(Error::BadRequest(format!(
                "Collection: {} shard: {} does not exist",
                collection_name, shard
            )));
        }

        let skip_state = request.skip_create_replica_in_cluster_state;
        match non_blank(request.node.as_deref()) {
            Some(node) if !state.live_nodes_contain(node) => {
                return Err(Error::BadRequest(format!("Node: {} is not live", node)));
            }
            None if skip_state => {
                return Err(Error::BadRequest(
                    "node is required when skip_create_replica_in_cluster_state is set".into(),
                ));
            }
            _ => {}
        }

        let in_flight = |core: &str| claimed.contains(&(collection_name.to_string(), core.to_string()));
        let core = match request.requested_core() {
            Some(core) => {
                // with skip set the record is expected to exist already
                if in_flight(&core) || (!skip_state && collection.has_core(&core)) {
                    return Err(Error::BadRequest(format!(
                        "Another replica with the same core name already exists for this collection: {}",
                        core
                    )));
                }
                core
            }
            None => synthesize_core_name(collection, &shard, request.replica_type, in_flight),
        };

        if let Some(name) = non_blank(request.core_node_name.as_deref()) {
            if !skip_state && collection.has_core_node_name(name) {
                return Err(Error::BadRequest(format!(
                    "Core node name {} is already in use in collection {}",
                    name, collection_name
                )));
            }
        }

        let key = (collection_name.to_string(), core.clone());
        claimed.insert(key.clone());
        Ok(ValidatedRequest {
            shard,
            core,
            config_name: collection.config_name.clone(),
            _claim: CoreClaim {
                owner: self.reservations.clone(),
                key,
            },
        })
    }

    async fn provision(
        &self,
        request: &AddReplicaRequest,
        validated: ValidatedRequest,
        async_id: Option<String>,
    ) -> Result<AddReplicaResponse> {
        // the claim stays held until this returns
        let ValidatedRequest {
            shard,
            core,
            config_name,
            _claim,
        } = validated;
        let collection = request.collection.trim().to_string();
        let explicit_node = non_blank(request.node.as_deref()).map(str::to_string);
        let skip_state = request.skip_create_replica_in_cluster_state;
        let legacy = self.settings.legacy_cloud;

        let state = self.store.snapshot();
        let Placement { node, session } = match (&explicit_node, skip_state) {
            (Some(node), true) => Placement::explicit(node.clone()),
            _ => {
                self.selector
                    .select(
                        &PlacementRequest {
                            collection: collection.clone(),
                            shard: shard.clone(),
                            replica_type: request.replica_type,
                            node: explicit_node.clone(),
                            held_session: None,
                        },
                        &state,
                    )
                    .await?
            }
        };
        // a dropped session releases itself on the early returns below
        let base_url = state
            .base_url_for(&node)
            .ok_or_else(|| Error::BadRequest(format!("Node: {} is not live", node)))?
            .to_string();
        info!(collection = %collection, shard = %shard, core = %core, node = %node, "adding replica");

        let explicit_core_node_name = non_blank(request.core_node_name.as_deref()).map(str::to_string);
        let (core_node_name, state_recorded) = if legacy {
            (explicit_core_node_name, false)
        } else if skip_state {
            let name = self
                .publisher
                .wait_visible(&collection, &shard, &core, &node)
                .await?;
            (Some(name), true)
        } else {
            let name = self
                .publisher
                .publish(AddReplicaMutation {
                    collection: collection.clone(),
                    shard: shard.clone(),
                    core: core.clone(),
                    state: ReplicaState::Down,
                    base_url: base_url.clone(),
                    node_name: node.clone(),
                    replica_type: request.replica_type,
                    core_node_name: explicit_core_node_name,
                })
                .await?;
            (Some(name), true)
        };

        let create = CreateCoreRequest {
            action: CoreAction::Create,
            name: core.clone(),
            collection_config_name: config_name,
            collection: collection.clone(),
            replica_type: request.replica_type,
            shard: shard.clone(),
            core_node_name: core_node_name.clone(),
            data_dir: non_blank(request.data_dir.as_deref()).map(str::to_string),
            ulog_dir: non_blank(request.ulog_dir.as_deref()).map(str::to_string),
            instance_dir: non_blank(request.instance_dir.as_deref()).map(str::to_string),
            async_id: None,
            properties: request.node_properties(),
        };
        let handle = self
            .dispatcher
            .dispatch(&node, &base_url, create, async_id.as_deref());

        let response = AddReplicaResponse {
            collection: collection.clone(),
            shard,
            core: core.clone(),
            node,
            core_node_name,
            async_id,
        };
        let action = CompletionAction {
            dispatcher: self.dispatcher.clone(),
            store: self.store.clone(),
            tracker: self.tracker.clone(),
            hook: self.on_complete.clone(),
            core_node_name_timeout: (!legacy).then(|| self.settings.core_node_name_timeout()),
            handle,
            session,
            state_recorded,
            response: response.clone(),
        };

        match ExecutionMode::for_request(request, self.settings.default_timeout()) {
            ExecutionMode::Inline => action.run().await?,
            ExecutionMode::Background => {
                self.pool.submit(async move {
                    if let Err(e) = action.run().await {
                        warn!(core = %core, error = %e, "background replica completion failed");
                    }
                });
            }
            ExecutionMode::AwaitActive(timeout) => {
                self.await_active(action, &response, timeout).await?;
            }
        }
        Ok(response)
    }

    /// Run the completion and wait for the replica to turn active, both
    /// bounded by one deadline. On timeout the completion keeps running in
    /// the background and still releases its session.
    async fn await_active(
        &self,
        action: CompletionAction,
        response: &AddReplicaResponse,
        timeout: Duration,
    ) -> Result<()> {
        let deadline = tokio::time::Instant::now() + timeout;
        let timed_out = || {
            Error::Timeout(format!(
                "Timeout waiting {} seconds for replica {} to become active",
                timeout.as_secs_f64(),
                response.core
            ))
        };
        let watch = self
            .store
            .watch_active(&response.collection, vec![response.core.clone()]);

        let mut completion = tokio::spawn(action.execute());
        let (results, outcome) = match tokio::time::timeout_at(deadline, &mut completion).await {
            Ok(joined) => joined
                .map_err(|e| Error::Internal(format!("completion task failed: {}", e)))?,
            Err(_) => {
                warn!(core = %response.core, "replica completion still running at deadline");
                return Err(timed_out());
            }
        };

        let outcome = match outcome {
            Ok(()) => {
                let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
                watch.wait(remaining).await.map_err(|_| timed_out())
            }
            Err(e) => Err(e),
        };
        if let Some(async_id) = &response.async_id {
            self.tracker.finish(async_id, results, outcome.as_ref().err());
        }
        outcome
    }
}

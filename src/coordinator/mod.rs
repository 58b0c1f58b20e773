//! Coordinator: replica provisioning control plane
//!
//! The coordinator is responsible for:
//! - Cluster state (collections → shards → replicas, live nodes)
//! - Placement decisions (policy engine or least-loaded fallback)
//! - State mutations through an ordered, durable queue applied by the leader
//! - Dispatching create-core requests to nodes
//! - Waiting for new replicas to become active

pub mod add_replica;
pub mod async_tracker;
pub mod cluster_state;
pub mod dispatcher;
pub mod http;
pub mod leader;
pub mod metadata;
pub mod node_client;
pub mod placement;
pub mod routing;
pub mod server;
pub mod state_queue;
pub mod watcher;

pub use add_replica::{AddReplicaRequest, AddReplicaResponse, ExecutionMode, ReplicaProvisioner};
pub use server::Coordinator;

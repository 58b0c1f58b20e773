//! Provisioning dispatcher: sends create-core instructions to nodes
//!
//! The transport is a [`NodeClient`]; this module only keeps the books.
//! Each dispatched request is spawned immediately and tracked by a
//! [`DispatchHandle`]; collecting the handle records its outcome into an
//! [`OperationResults`] exactly once.

use crate::common::{Error, Result};
use crate::coordinator::cluster_state::{Collection, ReplicaType};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum CoreAction {
    Create,
}

/// Create-core instruction sent to a node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateCoreRequest {
    pub action: CoreAction,
    pub name: String,
    pub collection_config_name: String,
    pub collection: String,
    pub replica_type: ReplicaType,
    pub shard: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub core_node_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_dir: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ulog_dir: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_dir: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub async_id: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub properties: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestStatus {
    Submitted,
    Running,
    Completed,
    Failed,
    NotFound,
}

impl RequestStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RequestStatus::Completed | RequestStatus::Failed | RequestStatus::NotFound
        )
    }
}

/// Node reply to a create or status request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeResponse {
    pub status: RequestStatus,
    #[serde(default)]
    pub message: Option<String>,
}

/// Wire transport to node provisioning endpoints
#[async_trait]
pub trait NodeClient: Send + Sync {
    async fn create_core(&self, base_url: &str, request: &CreateCoreRequest) -> Result<NodeResponse>;

    async fn request_status(&self, base_url: &str, request_id: &str) -> Result<NodeResponse>;
}

/// Per-node outcome of one operation
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OperationResults {
    pub success: BTreeMap<String, serde_json::Value>,
    pub failure: BTreeMap<String, String>,
}

impl OperationResults {
    pub fn record_success(&mut self, node: &str, value: serde_json::Value) {
        self.success.insert(node.to_string(), value);
    }

    pub fn record_failure(&mut self, node: &str, message: impl Into<String>) {
        self.failure.insert(node.to_string(), message.into());
    }

    pub fn has_failures(&self) -> bool {
        !self.failure.is_empty()
    }

    /// `node: message` pairs joined for error reporting
    pub fn failure_summary(&self) -> String {
        self.failure
            .iter()
            .map(|(node, msg)| format!("{}: {}", node, msg))
            .collect::<Vec<_>>()
            .join("; ")
    }
}

/// A dispatched, not yet collected, node request
pub struct DispatchHandle {
    node: String,
    base_url: String,
    /// node → node-side request id (async dispatches only)
    requests: BTreeMap<String, String>,
    task: JoinHandle<Result<NodeResponse>>,
}

impl DispatchHandle {
    pub fn node(&self) -> &str {
        &self.node
    }

    pub fn request_ids(&self) -> &BTreeMap<String, String> {
        &self.requests
    }
}

pub struct ProvisioningDispatcher {
    client: Arc<dyn NodeClient>,
    poll_interval: Duration,
    /// Bound on polling one async node request
    max_async_wait: Duration,
    seq: AtomicU64,
}

impl ProvisioningDispatcher {
    pub fn new(client: Arc<dyn NodeClient>, poll_interval: Duration, max_async_wait: Duration) -> Self {
        Self {
            client,
            poll_interval,
            max_async_wait,
            seq: AtomicU64::new(0),
        }
    }

    /// Resolve the target shard from an explicit name or a route key
    pub fn resolve_shard(
        collection: &Collection,
        shard: Option<&str>,
        route_key: Option<&str>,
    ) -> Result<String> {
        if let Some(shard) = shard {
            return Ok(shard.to_string());
        }
        let Some(route_key) = route_key else {
            return Err(Error::BadRequest(
                "Specify either 'shard' or 'route_key' param".into(),
            ));
        };
        collection
            .router
            .search_shards_single(route_key, collection)
            .first()
            .map(|s| s.name.clone())
            .ok_or_else(|| {
                Error::BadRequest(format!(
                    "No active shard serving route key {} found",
                    route_key
                ))
            })
    }

    /// Send `request` to `node` without waiting for the reply
    pub fn dispatch(
        &self,
        node: &str,
        base_url: &str,
        mut request: CreateCoreRequest,
        async_id: Option<&str>,
    ) -> DispatchHandle {
        let mut requests = BTreeMap::new();
        if let Some(async_id) = async_id {
            let request_id = format!("{}{}", async_id, self.seq.fetch_add(1, Ordering::Relaxed));
            requests.insert(node.to_string(), request_id.clone());
            request.async_id = Some(request_id);
        }
        info!(node, core = %request.name, async_id = ?request.async_id, "dispatching create-core request");

        let client = self.client.clone();
        let url = base_url.to_string();
        let task = tokio::spawn(async move { client.create_core(&url, &request).await });

        DispatchHandle {
            node: node.to_string(),
            base_url: base_url.to_string(),
            requests,
            task,
        }
    }

    /// Wait for the dispatched request and record its outcome
    pub async fn collect(&self, handle: DispatchHandle, results: &mut OperationResults) {
        let DispatchHandle {
            node,
            base_url,
            requests,
            task,
        } = handle;

        let response = match task.await {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => {
                warn!(node = %node, error = %e, "create-core request failed");
                results.record_failure(&node, e.to_string());
                return;
            }
            Err(e) => {
                results.record_failure(&node, format!("request task aborted: {}", e));
                return;
            }
        };

        let response = match requests.get(&node) {
            Some(request_id) if !response.status.is_terminal() => {
                match self.poll_until_done(&base_url, request_id).await {
                    Ok(done) => done,
                    Err(e) => {
                        results.record_failure(&node, e.to_string());
                        return;
                    }
                }
            }
            _ => response,
        };

        match response.status {
            RequestStatus::Completed | RequestStatus::Submitted | RequestStatus::Running => {
                let mut value = serde_json::json!({ "status": response.status });
                if let Some(request_id) = requests.get(&node) {
                    value["request_id"] = serde_json::Value::String(request_id.clone());
                }
                if let Some(message) = response.message {
                    value["message"] = serde_json::Value::String(message);
                }
                results.record_success(&node, value);
            }
            RequestStatus::Failed | RequestStatus::NotFound => {
                let message = response
                    .message
                    .unwrap_or_else(|| format!("request {:?}", response.status));
                results.record_failure(&node, message);
            }
        }
    }

    async fn poll_until_done(&self, base_url: &str, request_id: &str) -> Result<NodeResponse> {
        let deadline = tokio::time::Instant::now() + self.max_async_wait;
        loop {
            let status = self.client.request_status(base_url, request_id).await?;
            if status.status.is_terminal() {
                return Ok(status);
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(Error::Timeout(format!(
                    "async request {} still {:?} after {:?}",
                    request_id, status.status, self.max_async_wait
                )));
            }
            debug!(request_id, status = ?status.status, "waiting on async node request");
            tokio::time::sleep(self.poll_interval).await;
        }
    }
}

//! Admin API client used by the CLI

use crate::common::{Error, ErrorKind, Result};
use crate::coordinator::add_replica::{AddReplicaRequest, AddReplicaResponse};
use crate::coordinator::async_tracker::AsyncStatus;
use crate::coordinator::routing::Router;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::json;

#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: String,
    kind: ErrorKind,
}

pub struct AdminClient {
    base_url: String,
    client: reqwest::Client,
}

impl AdminClient {
    pub fn new(coordinator_url: &str) -> Self {
        Self {
            base_url: coordinator_url.trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
        }
    }

    pub async fn add_replica(&self, request: &AddReplicaRequest) -> Result<AddReplicaResponse> {
        let url = format!(
            "{}/admin/collections/{}/replicas",
            self.base_url, request.collection
        );
        let response = self.client.post(url).json(request).send().await?;
        Self::decode(response).await
    }

    pub async fn create_collection(
        &self,
        name: &str,
        config_name: &str,
        router: Router,
        shards: &[String],
    ) -> Result<serde_json::Value> {
        let body = json!({
            "name": name,
            "config_name": config_name,
            "router": router,
            "shards": shards,
        });
        let url = format!("{}/admin/collections", self.base_url);
        let response = self.client.post(url).json(&body).send().await?;
        Self::decode(response).await
    }

    /// `None` when the coordinator does not know the id
    pub async fn request_status(&self, async_id: &str) -> Result<Option<AsyncStatus>> {
        let url = format!("{}/admin/requests/{}", self.base_url, async_id);
        let response = self.client.get(url).send().await?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        Self::decode(response).await.map(Some)
    }

    pub async fn status(&self) -> Result<serde_json::Value> {
        let url = format!("{}/admin/status", self.base_url);
        let response = self.client.get(url).send().await?;
        Self::decode(response).await
    }

    pub async fn register_node(&self, node: &str, base_url: &str) -> Result<()> {
        let url = format!("{}/cluster/nodes", self.base_url);
        let response = self
            .client
            .post(url)
            .json(&json!({ "node": node, "base_url": base_url }))
            .send()
            .await?;
        Self::check(response).await
    }

    async fn check(response: reqwest::Response) -> Result<()> {
        if response.status().is_success() {
            return Ok(());
        }
        Err(Self::error_from(response).await)
    }

    async fn decode<T: DeserializeOwned>(response: reqwest::Response) -> Result<T> {
        if !response.status().is_success() {
            return Err(Self::error_from(response).await);
        }
        Ok(response.json().await?)
    }

    async fn error_from(response: reqwest::Response) -> Error {
        let status = response.status();
        let text = response.text().await.unwrap_or_default();
        match serde_json::from_str::<ErrorBody>(&text) {
            Ok(body) => match body.kind {
                ErrorKind::BadRequest => Error::BadRequest(body.error),
                ErrorKind::Timeout => Error::Timeout(body.error),
                ErrorKind::ServerError => Error::Http(format!("{}: {}", status, body.error)),
            },
            Err(_) => Error::Http(format!("{}: {}", status, text)),
        }
    }
}

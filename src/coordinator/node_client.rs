//! HTTP transport for node provisioning requests

use crate::common::{Error, Result};
use crate::coordinator::dispatcher::{CreateCoreRequest, NodeClient, NodeResponse, RequestStatus};
use async_trait::async_trait;
use std::time::Duration;

pub struct HttpNodeClient {
    client: reqwest::Client,
}

impl HttpNodeClient {
    pub fn new(request_timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()?;
        Ok(Self { client })
    }

    async fn read_response(response: reqwest::Response) -> Result<NodeResponse> {
        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Ok(NodeResponse {
                status: RequestStatus::NotFound,
                message: None,
            });
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Http(format!("node returned {}: {}", status, body)));
        }
        Ok(response.json().await?)
    }
}

#[async_trait]
impl NodeClient for HttpNodeClient {
    async fn create_core(&self, base_url: &str, request: &CreateCoreRequest) -> Result<NodeResponse> {
        let url = format!("{}/admin/cores", base_url.trim_end_matches('/'));
        let response = self.client.post(&url).json(request).send().await?;
        Self::read_response(response).await
    }

    async fn request_status(&self, base_url: &str, request_id: &str) -> Result<NodeResponse> {
        let url = format!(
            "{}/admin/cores/requests/{}",
            base_url.trim_end_matches('/'),
            request_id
        );
        let response = self.client.get(&url).send().await?;
        Self::read_response(response).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::Path;
    use axum::response::IntoResponse;
    use axum::routing::{get, post};
    use axum::{Json, Router};

    async fn serve(app: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
        format!("http://{}", addr)
    }

    #[tokio::test]
    async fn test_create_core_and_status() {
        let app = Router::new()
            .route(
                "/admin/cores",
                post(|Json(req): Json<CreateCoreRequest>| async move {
                    Json(NodeResponse {
                        status: RequestStatus::Submitted,
                        message: Some(req.name),
                    })
                }),
            )
            .route(
                "/admin/cores/requests/:id",
                get(|Path(id): Path<String>| async move {
                    if id == "known" {
                        Json(NodeResponse {
                            status: RequestStatus::Completed,
                            message: None,
                        })
                        .into_response()
                    } else {
                        axum::http::StatusCode::NOT_FOUND.into_response()
                    }
                }),
            );
        let base = serve(app).await;
        let client = HttpNodeClient::new(Duration::from_secs(5)).unwrap();

        let request: CreateCoreRequest = serde_json::from_value(serde_json::json!({
            "action": "CREATE",
            "name": "books_shard1_replica_n1",
            "collection_config_name": "conf",
            "collection": "books",
            "replica_type": "nrt",
            "shard": "shard1",
        }))
        .unwrap();
        let created = client.create_core(&base, &request).await.unwrap();
        assert_eq!(created.status, RequestStatus::Submitted);
        assert_eq!(created.message.as_deref(), Some("books_shard1_replica_n1"));

        let done = client.request_status(&base, "known").await.unwrap();
        assert_eq!(done.status, RequestStatus::Completed);
        let missing = client.request_status(&base, "other").await.unwrap();
        assert_eq!(missing.status, RequestStatus::NotFound);
    }

    #[tokio::test]
    async fn test_unreachable_node_is_connection_failure() {
        let client = HttpNodeClient::new(Duration::from_secs(1)).unwrap();
        let err = client
            .request_status("http://127.0.0.1:1", "x")
            .await
            .unwrap_err();
        assert!(err.is_retryable());
    }
}

//! Coordinator server

use crate::common::{Config, Result};
use crate::coordinator::add_replica::ReplicaProvisioner;
use crate::coordinator::cluster_state::ClusterStateStore;
use crate::coordinator::http::{create_router, CoordState};
use crate::coordinator::leader::Leadership;
use crate::coordinator::metadata::MutationLog;
use crate::coordinator::node_client::HttpNodeClient;
use crate::coordinator::placement::RulePolicyEngine;
use crate::coordinator::state_queue::LocalStateQueue;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

pub struct Coordinator {
    config: Config,
    state: CoordState,
    log: Arc<MutationLog>,
    applier: JoinHandle<()>,
}

impl Coordinator {
    /// Open the mutation log, replay it and start the apply loop.
    ///
    /// Must be called from within a tokio runtime.
    pub fn open(config: Config) -> Result<Self> {
        config.validate()?;
        let coord = &config.coordinator;

        let log = Arc::new(MutationLog::open(&coord.db_path)?);
        let (queue, applier) = LocalStateQueue::durable(log.clone())?;

        let store = Arc::new(ClusterStateStore::default());
        let leadership = Arc::new(Leadership::new(config.node_id.clone()));
        if coord.leader {
            leadership.become_leader();
        }
        let applier = applier.spawn(store.clone(), leadership.clone());

        let engine = Arc::new(RulePolicyEngine::new(config.provisioning.policies.clone()));
        let node_client = Arc::new(HttpNodeClient::new(Duration::from_millis(
            coord.node_request_timeout_ms,
        ))?);

        let provisioner = ReplicaProvisioner::new(
            config.provisioning.clone(),
            store,
            Arc::new(queue),
            node_client,
            Some(engine),
        );

        Ok(Self {
            state: CoordState {
                provisioner: Arc::new(provisioner),
                leadership,
            },
            config,
            log,
            applier,
        })
    }

    pub fn state(&self) -> &CoordState {
        &self.state
    }

    pub fn router(&self) -> axum::Router {
        create_router(self.state.clone())
    }

    pub async fn serve(self) -> Result<()> {
        let coord = &self.config.coordinator;
        tracing::info!("Starting coordinator: {}", self.config.node_id);
        tracing::info!("  HTTP API: {}", coord.bind_addr);
        tracing::info!("  DB path: {}", coord.db_path.display());
        tracing::info!("  Legacy cloud: {}", self.config.provisioning.legacy_cloud);

        let listener = tokio::net::TcpListener::bind(coord.bind_addr).await?;
        tracing::info!("✓ Coordinator ready ({})", self.state.leadership.role());

        axum::serve(listener, self.router())
            .with_graceful_shutdown(shutdown_signal())
            .await?;

        self.applier.abort();
        self.log.flush()?;
        tracing::info!("Coordinator stopped");
        Ok(())
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown signal received");
}

//! CLI for cluster operations

use clap::{Parser, Subcommand};
use shardplace::coordinator::cluster_state::ReplicaType;
use shardplace::coordinator::routing::Router;
use shardplace::ops::AdminClient;
use shardplace::common::parse_duration;
use shardplace::AddReplicaRequest;
use std::collections::BTreeMap;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "shardplace")]
#[command(about = "shardplace replica provisioning CLI")]
#[command(version)]
struct Cli {
    /// Coordinator URL
    #[arg(long, default_value = "http://localhost:5000")]
    coordinator: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Add a replica of a shard
    AddReplica {
        /// Collection
        collection: String,

        /// Shard (or use --route-key)
        #[arg(long)]
        shard: Option<String>,

        /// Route key resolved to a shard
        #[arg(long)]
        route_key: Option<String>,

        /// Target node (chosen by placement if omitted)
        #[arg(long)]
        node: Option<String>,

        /// Core name
        #[arg(long)]
        name: Option<String>,

        /// Replica type: nrt, tlog or pull
        #[arg(long = "type", default_value = "nrt")]
        replica_type: ReplicaType,

        /// Wait until the replica is active
        #[arg(long)]
        wait: bool,

        /// How long to wait with --wait (e.g. 90s, 10m)
        #[arg(long, value_parser = parse_timeout)]
        timeout: Option<Duration>,

        /// Return before the node finishes creating the core
        #[arg(long)]
        parallel: bool,

        /// Track the request under this id
        #[arg(long)]
        async_id: Option<String>,

        /// Extra core property, KEY=VALUE (repeatable)
        #[arg(long = "property", value_parser = parse_property)]
        properties: Vec<(String, String)>,
    },

    /// Create a collection
    CreateCollection {
        /// Collection name
        name: String,

        /// Shard names (comma-separated)
        #[arg(long, value_delimiter = ',', required = true)]
        shards: Vec<String>,

        /// Config set name
        #[arg(long, default_value = "_default")]
        config: String,

        /// Use implicit routing (route key names the shard)
        #[arg(long)]
        implicit: bool,
    },

    /// Show the status of an async request
    RequestStatus {
        /// Async id
        async_id: String,
    },

    /// Register a live node
    RegisterNode {
        /// Node name
        node: String,

        /// Node base URL
        base_url: String,
    },

    /// Show coordinator status
    Status,
}

fn parse_property(s: &str) -> Result<(String, String), String> {
    s.split_once('=')
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .ok_or_else(|| format!("expected KEY=VALUE, got {}", s))
}

fn parse_timeout(s: &str) -> Result<Duration, String> {
    let duration = parse_duration(s).map_err(|e| e.to_string())?;
    if duration.as_secs() == 0 {
        return Err("timeout must be at least 1s".to_string());
    }
    Ok(duration)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    let client = AdminClient::new(&cli.coordinator);

    match cli.command {
        Commands::AddReplica {
            collection,
            shard,
            route_key,
            node,
            name,
            replica_type,
            wait,
            timeout,
            parallel,
            async_id,
            properties,
        } => {
            let request = AddReplicaRequest {
                shard,
                route_key,
                node,
                core: name,
                replica_type,
                wait_for_final_state: wait,
                timeout_secs: timeout.map(|t| t.as_secs()),
                parallel,
                async_id,
                properties: properties.into_iter().collect::<BTreeMap<_, _>>(),
                ..AddReplicaRequest::new(collection)
            };
            let response = client.add_replica(&request).await?;
            println!("Replica added:");
            println!("  Collection: {}", response.collection);
            println!("  Shard: {}", response.shard);
            println!("  Core: {}", response.core);
            println!("  Node: {}", response.node);
            if let Some(core_node_name) = response.core_node_name {
                println!("  Core node name: {}", core_node_name);
            }
            if let Some(async_id) = response.async_id {
                println!("  Async id: {}", async_id);
            }
        }

        Commands::CreateCollection {
            name,
            shards,
            config,
            implicit,
        } => {
            let router = if implicit {
                Router::Implicit
            } else {
                Router::CompositeId
            };
            let created = client
                .create_collection(&name, &config, router, &shards)
                .await?;
            println!("{}", serde_json::to_string_pretty(&created)?);
        }

        Commands::RequestStatus { async_id } => match client.request_status(&async_id).await? {
            Some(status) => println!("{}", serde_json::to_string_pretty(&status)?),
            None => println!("Request {} not found", async_id),
        },

        Commands::RegisterNode { node, base_url } => {
            client.register_node(&node, &base_url).await?;
            println!("Node {} registered", node);
        }

        Commands::Status => {
            let status = client.status().await?;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
    }

    Ok(())
}

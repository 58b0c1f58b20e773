//! Coordinator binary

use clap::{Parser, Subcommand};
use shardplace::{common::Config, Coordinator};
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "shardplace-coord")]
#[command(about = "shardplace replica provisioning coordinator")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start coordinator server
    Serve {
        /// Node ID
        #[arg(long)]
        id: Option<String>,

        /// Bind address for HTTP
        #[arg(long)]
        bind: Option<SocketAddr>,

        /// Mutation log directory
        #[arg(long)]
        db: Option<PathBuf>,

        /// Config file name (without extension)
        #[arg(long, default_value = "shardplace")]
        config: String,

        /// Start as follower; queued mutations are not applied
        #[arg(long)]
        follower: bool,

        /// Skip cluster-state mutations and core-node-name waits
        #[arg(long)]
        legacy_cloud: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve {
            id,
            bind,
            db,
            config,
            follower,
            legacy_cloud,
        } => {
            // file and environment first, CLI flags win
            let mut config = Config::load_from(&config)?;
            if let Some(id) = id {
                config.node_id = id;
            }
            if let Some(bind) = bind {
                config.coordinator.bind_addr = bind;
            }
            if let Some(db) = db {
                config.coordinator.db_path = db;
            }
            if follower {
                config.coordinator.leader = false;
            }
            if legacy_cloud {
                config.provisioning.legacy_cloud = true;
            }

            tracing_subscriber::registry()
                .with(
                    tracing_subscriber::EnvFilter::try_from_default_env()
                        .unwrap_or_else(|_| config.log_level.clone().into()),
                )
                .with(tracing_subscriber::fmt::layer())
                .init();

            let coord = Coordinator::open(config)?;
            coord.serve().await?;
        }
    }

    Ok(())
}

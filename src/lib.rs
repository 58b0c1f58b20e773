//! # shardplace
//!
//! Control-plane logic that provisions a new replica of a shard onto a
//! cluster node and brings shared cluster state into agreement with it:
//! - Node selection through a pluggable placement policy with a fallback
//! - State mutations on an ordered, durable queue applied by one leader
//! - Create-core dispatch to the chosen node, sync or tracked by async id
//! - Bounded waits until the new replica is observed active
//!
//! ## Architecture

#![allow(clippy::result_large_err)]
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │                 Coordinator                  │
//! │  validate → place → publish → dispatch       │
//! │        │             │            │          │
//! │        │      ┌──────▼──────┐     │          │
//! │        │      │ state queue │     │          │
//! │        │      │ (RocksDB)   │     │          │
//! │        │      └──────┬──────┘     │          │
//! │        │      leader apply loop   │          │
//! │  ┌─────▼─────────────▼──────┐     │          │
//! │  │ cluster state + watchers │     │          │
//! │  └──────────────────────────┘     │          │
//! └───────────────────────────────────┼──────────┘
//!                                     │ HTTP
//!         ┌───────────────┬───────────┴───┐
//!       ┌─▼──────┐     ┌──▼─────┐     ┌───▼────┐
//!       │ node 1 │     │ node 2 │     │ node 3 │
//!       └────────┘     └────────┘     └────────┘
//! ```
//!
//! ## Usage
//!
//! ### Start a coordinator
//! ```bash
//! shardplace-coord serve \
//!   --id coord-1 \
//!   --bind 0.0.0.0:5000 \
//!   --db ./coord-data
//! ```
//!
//! ### Use the CLI
//! ```bash
//! shardplace create-collection books --shards shard1,shard2
//! shardplace add-replica books --shard shard1 --type tlog --wait
//! shardplace request-status job-42
//! shardplace status
//! ```

pub mod common;
pub mod coordinator;
pub mod ops;

// Re-export commonly used types
pub use common::{Config, Error, ErrorKind, Result};
pub use coordinator::{AddReplicaRequest, AddReplicaResponse, Coordinator, ReplicaProvisioner};

/// Current version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Build info
pub const BUILD_INFO: &str = concat!(env!("CARGO_PKG_VERSION"), " (", env!("CARGO_PKG_NAME"), ")");

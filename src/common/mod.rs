//! Common utilities and types shared across shardplace

pub mod config;
pub mod error;
pub mod hash;
pub mod tracing_middleware;
pub mod utils;

pub use config::{Config, CoordinatorConfig, PolicyRules, ProvisioningConfig};
pub use error::{Error, ErrorKind, Result};
pub use hash::{hrw_weight, route_hash, HashRange};
pub use utils::{non_blank, parse_duration, timestamp_now_millis};

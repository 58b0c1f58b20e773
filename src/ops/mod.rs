//! Ops commands for cluster management

pub mod admin;

pub use admin::AdminClient;

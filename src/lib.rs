//! Single-host, network-isolated QEMU clusters for integration testing.
//!
//! A [`cluster::Cluster`] owns a private network namespace with bridged
//! segments, DHCP/DNS, NTP and a discovery key/value service inside it, an
//! SSH agent holding a throwaway key, and the machines launched onto the
//! segments.

pub mod cleanup;
pub mod cli;
pub mod cluster;
pub mod commands;
pub mod config;
pub mod error;
pub mod network;
pub mod qemu;
pub mod services;
pub mod ssh;
pub mod storage;
pub mod utils;

// Re-export core types for convenience
pub use cluster::{Cluster, ClusterState, ConfigPayload, MachineOptions};
pub use config::Config;
pub use error::{Error, Result};

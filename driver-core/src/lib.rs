pub mod cluster;
pub mod config;
pub mod connection;
pub mod control;
pub mod error;
pub mod event;
pub mod ext;
pub mod host;
pub mod reconciler;
pub mod reconnection;
pub mod registry;
pub mod simulation;

pub const TOPOLOGY_CONFIG: &'static str = include_str!("../topology.toml");

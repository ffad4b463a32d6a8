pub mod client;
pub mod config;
pub mod error;
pub mod node;
pub mod roles;

pub use client::{ConnectionReplica, PeerClient};
pub use config::{Config, PeerEndpoint};
pub use error::{Result, VitalMeshError};
pub use node::{RoleHandler, ServiceNode};

// Re-export the workspace crates behind the root API.
pub use fleet;
pub use network;
pub use replication;
pub use security;

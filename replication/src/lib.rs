mod manager;
mod store;

pub use manager::{ReplicaLink, ReplicationConfig, ReplicationManager};
pub use store::{RecordVersion, ReplicationPackage, VersionStamp, VersionStore};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ReplicationError {
    #[error("replica link error: {0}")]
    Link(String),

    #[error("replica did not respond within {0:?}")]
    Timeout(std::time::Duration),
}

pub type Result<T> = std::result::Result<T, ReplicationError>;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum VitalMeshError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("network error: {0}")]
    Network(#[from] network::NetworkError),

    #[error("security error: {0}")]
    Security(#[from] security::SecurityError),

    #[error("replication error: {0}")]
    Replication(#[from] replication::ReplicationError),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("no available peer for {0}")]
    NoAvailablePeer(String),

    #[error("peer rejected request: {0}")]
    PeerRejected(String),
}

pub type Result<T> = std::result::Result<T, VitalMeshError>;

mod envelope;
mod tls;

pub use envelope::{SecureEnvelope, SecurityContext};
pub use tls::{client_connector, server_acceptor, TlsSettings, TransportSecurity};

pub type Result<T> = std::result::Result<T, SecurityError>;

#[derive(Debug, thiserror::Error)]
pub enum SecurityError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("integrity check failed: envelope hash does not match ciphertext")]
    Integrity,

    #[error("decryption failed: {0}")]
    Decryption(String),

    #[error("malformed envelope: {0}")]
    Malformed(String),

    #[error("invalid key material: {0}")]
    InvalidKey(String),

    #[error("TLS configuration error: {0}")]
    Tls(String),
}

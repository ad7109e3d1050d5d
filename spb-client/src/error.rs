use thiserror::Error;

/// Errors surfaced by a [Transport](crate::Transport) implementation.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("not connected")]
    NotConnected,
    #[error("already connected")]
    AlreadyConnected,
    #[error("invalid mqtt options: {0}")]
    InvalidOptions(String),
    #[error("tls configuration error: {0}")]
    Tls(String),
    #[error("connection rejected by broker: {reason}")]
    ConnectionRefused { reason: String },
    #[error("mqtt request failed: {0}")]
    Request(String),
    #[error("connection closed")]
    ConnectionClosed,
}

use std::time::Duration;

use spb_client::TransportError;
use thiserror::Error;

/// Errors returned by [EdgeNode](crate::EdgeNode) operations.
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("{0}")]
    ProtocolState(String),
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),
    #[error("payload error: {0}")]
    Payload(String),
}

impl Error {
    pub(crate) fn state(message: impl Into<String>) -> Self {
        Error::ProtocolState(message.into())
    }
}

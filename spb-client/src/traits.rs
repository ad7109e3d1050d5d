use async_trait::async_trait;
use spb_types::topic::QoS;

use crate::{LastWill, TransportError};

/// Thin interface over an async MQTT client.
///
/// Implementations deliver inbound publishes and connection loss as
/// [TransportEvent](crate::TransportEvent)s on a channel handed out at
/// construction, on a dedicated task. All methods are callable concurrently.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open the connection, lodging `will` with the broker when provided.
    ///
    /// Resolves once the broker acknowledges the connection. Callers bound
    /// the wait with their own deadline.
    async fn connect(&self, will: Option<LastWill>) -> Result<(), TransportError>;

    /// Gracefully close the connection. The broker does not publish the
    /// will on a requested disconnect.
    async fn disconnect(&self) -> Result<(), TransportError>;

    /// Queue a publish. Resolves when the client accepts the message, not
    /// when the broker acknowledges it.
    async fn publish(
        &self,
        topic: String,
        payload: Vec<u8>,
        qos: QoS,
        retain: bool,
    ) -> Result<(), TransportError>;

    /// Subscribe to a topic filter.
    async fn subscribe(&self, filter: String, qos: QoS) -> Result<(), TransportError>;
}

pub type DynTransport = dyn Transport;

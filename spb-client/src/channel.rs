use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex,
};

use async_trait::async_trait;
use spb_types::topic::QoS;
use tokio::sync::mpsc;

use crate::{LastWill, Transport, TransportError, TransportEvent};

/// An operation a [ChannelTransport] recorded for inspection.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportOp {
    Connect { will: Option<LastWill> },
    Disconnect,
    Publish {
        topic: String,
        payload: Vec<u8>,
        qos: QoS,
        retain: bool,
    },
    Subscribe { filter: String, qos: QoS },
}

/// The "broker" side of a [ChannelTransport].
///
/// Tests receive the operations a session performs from `rx_ops`, inject
/// inbound traffic through `tx_events`, and inspect the currently lodged
/// will.
///
/// ```no_run
/// use spb_client::channel::ChannelTransport;
/// use spb_client::TransportEvent;
///
/// let (transport, mut broker, events) = ChannelTransport::new();
/// // hand (transport, events) to a session, then:
/// broker.tx_events.send(TransportEvent::Message {
///     topic: "spBv1.0/STATE/SCADA01".into(),
///     payload: br#"{"online":true,"timestamp":1}"#.to_vec(),
/// }).unwrap();
/// let op = broker.rx_ops.try_recv();
/// ```
pub struct ChannelBroker {
    pub rx_ops: mpsc::UnboundedReceiver<TransportOp>,
    pub tx_events: mpsc::UnboundedSender<TransportEvent>,
    last_will: Arc<Mutex<Option<LastWill>>>,
    connected: Arc<AtomicBool>,
}

impl ChannelBroker {
    /// The will lodged by the most recent connect.
    pub fn last_will(&self) -> Option<LastWill> {
        self.last_will.lock().unwrap().clone()
    }

    /// Simulate an ungraceful connection loss: the transport becomes
    /// disconnected and the session receives [TransportEvent::ConnectionLost].
    pub fn drop_connection(&self) {
        self.connected.store(false, Ordering::SeqCst);
        _ = self.tx_events.send(TransportEvent::ConnectionLost);
    }
}

/// In-memory [Transport] that records operations instead of talking to a
/// broker. Connects always succeed.
pub struct ChannelTransport {
    tx_ops: mpsc::UnboundedSender<TransportOp>,
    connected: Arc<AtomicBool>,
    last_will: Arc<Mutex<Option<LastWill>>>,
}

impl ChannelTransport {
    pub fn new() -> (
        Self,
        ChannelBroker,
        mpsc::UnboundedReceiver<TransportEvent>,
    ) {
        let (tx_ops, rx_ops) = mpsc::unbounded_channel();
        let (tx_events, rx_events) = mpsc::unbounded_channel();
        let last_will = Arc::new(Mutex::new(None));
        let connected = Arc::new(AtomicBool::new(false));
        let transport = Self {
            tx_ops,
            connected: connected.clone(),
            last_will: last_will.clone(),
        };
        let broker = ChannelBroker {
            rx_ops,
            tx_events,
            last_will,
            connected,
        };
        (transport, broker, rx_events)
    }

    fn record(&self, op: TransportOp) -> Result<(), TransportError> {
        self.tx_ops
            .send(op)
            .map_err(|_| TransportError::ConnectionClosed)
    }
}

#[async_trait]
impl Transport for ChannelTransport {
    async fn connect(&self, will: Option<LastWill>) -> Result<(), TransportError> {
        if self.connected.swap(true, Ordering::SeqCst) {
            return Err(TransportError::AlreadyConnected);
        }
        *self.last_will.lock().unwrap() = will.clone();
        self.record(TransportOp::Connect { will })
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        if !self.connected.swap(false, Ordering::SeqCst) {
            return Err(TransportError::NotConnected);
        }
        self.record(TransportOp::Disconnect)
    }

    async fn publish(
        &self,
        topic: String,
        payload: Vec<u8>,
        qos: QoS,
        retain: bool,
    ) -> Result<(), TransportError> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(TransportError::NotConnected);
        }
        self.record(TransportOp::Publish {
            topic,
            payload,
            qos,
            retain,
        })
    }

    async fn subscribe(&self, filter: String, qos: QoS) -> Result<(), TransportError> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(TransportError::NotConnected);
        }
        self.record(TransportOp::Subscribe { filter, qos })
    }
}

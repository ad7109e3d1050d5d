use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{debug, error, info, warn};
use prost::Message;
use tokio::sync::mpsc;
use tokio::time::timeout;

use spb_client::{DynTransport, LastWill, Transport, TransportEvent};
use spb_types::payload::{Payload, StateCertificate};
use spb_types::topic::{
    group_filter, namespace_filter, node_filter, state_filter, MessageType, Topic, TopicError,
};
use spb_types::utils::{timestamp, validate_name};
use spb_types::PayloadBuilder;

use crate::validator::Validator;
use crate::{Error, HostApplicationConfig, NodeState};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const SUBSCRIBE_TIMEOUT: Duration = Duration::from_secs(5);
const DISCONNECT_TIMEOUT: Duration = Duration::from_secs(11);

/// Invoked with each received Sparkplug message after validation.
///
/// STATE messages arrive with a synthetic topic and an empty payload: their
/// JSON body is not a protobuf payload. Called on the session's dispatch
/// task with no internal lock held.
pub type MessageCallback = Arc<dyn Fn(&Topic, &Payload) + Send + Sync>;

struct HostState {
    is_connected: bool,
    validator: Validator,
}

struct Inner {
    config: HostApplicationConfig,
    transport: Arc<DynTransport>,
    state: Mutex<HostState>,
    message_callback: Mutex<Option<MessageCallback>>,
}

/// A Sparkplug B host application session: the SCADA-side consumer and
/// commander.
///
/// Publishes the host's STATE birth/death certificates, subscribes to the
/// namespace, tracks every observed node and device session through the
/// [Validator](crate::Validator), and forwards messages to the registered
/// callback. Cheap to clone; clones share one session.
#[derive(Clone)]
pub struct HostApplication {
    inner: Arc<Inner>,
}

impl HostApplication {
    /// Create a session over `transport`, consuming its event stream.
    ///
    /// Spawns the dispatch task, so this must be called within a tokio
    /// runtime.
    pub fn new<T: Transport + 'static>(
        config: HostApplicationConfig,
        transport: T,
        events: mpsc::UnboundedReceiver<TransportEvent>,
    ) -> Result<Self, Error> {
        validate_name(&config.host_id).map_err(Error::Config)?;

        let inner = Arc::new(Inner {
            config,
            transport: Arc::new(transport),
            state: Mutex::new(HostState {
                is_connected: false,
                validator: Validator::new(),
            }),
            message_callback: Mutex::new(None),
        });
        spawn_dispatch(&inner, events);
        Ok(Self { inner })
    }

    /// Register the message callback. Set before
    /// [connect](Self::connect) to avoid missing early traffic.
    pub fn set_message_callback(&self, callback: MessageCallback) {
        *self.inner.message_callback.lock().unwrap() = Some(callback);
    }

    /// Connect to the broker.
    ///
    /// Lodges an offline STATE certificate as a retained will so an
    /// ungraceful death flips this host's STATE. No online STATE is
    /// published yet; call [publish_state_birth](Self::publish_state_birth).
    pub async fn connect(&self) -> Result<(), Error> {
        {
            let state = self.inner.state.lock().unwrap();
            if state.is_connected {
                return Err(Error::state("already connected"));
            }
        }
        let will = LastWill {
            topic: state_filter(&self.inner.config.host_id),
            payload: StateCertificate::offline(timestamp()).to_bytes(),
            qos: self.inner.config.qos,
            retain: true,
        };
        timeout(CONNECT_TIMEOUT, self.inner.transport.connect(Some(will)))
            .await
            .map_err(|_| Error::Timeout(CONNECT_TIMEOUT))??;
        self.inner.state.lock().unwrap().is_connected = true;
        info!("Host application connected. Host = {}", self.inner.config.host_id);
        Ok(())
    }

    /// Gracefully disconnect. Publish a STATE death first: the broker
    /// discards the retained will on a clean disconnect.
    pub async fn disconnect(&self) -> Result<(), Error> {
        {
            let state = self.inner.state.lock().unwrap();
            if !state.is_connected {
                return Err(Error::state("not connected"));
            }
        }
        let result = timeout(DISCONNECT_TIMEOUT, self.inner.transport.disconnect())
            .await
            .map_err(|_| Error::Timeout(DISCONNECT_TIMEOUT));
        self.inner.state.lock().unwrap().is_connected = false;
        result??;
        info!("Host application disconnected. Host = {}", self.inner.config.host_id);
        Ok(())
    }

    fn check_connected(&self) -> Result<(), Error> {
        if !self.inner.state.lock().unwrap().is_connected {
            return Err(Error::state("not connected"));
        }
        Ok(())
    }

    async fn publish_state(&self, certificate: StateCertificate) -> Result<(), Error> {
        self.check_connected()?;
        self.inner
            .transport
            .publish(
                state_filter(&self.inner.config.host_id),
                certificate.to_bytes(),
                self.inner.config.qos,
                true,
            )
            .await?;
        Ok(())
    }

    /// Declare this host online: retained JSON
    /// `{"online":true,"timestamp":…}` on the host's STATE topic.
    pub async fn publish_state_birth(&self, timestamp_ms: u64) -> Result<(), Error> {
        self.publish_state(StateCertificate::online(timestamp_ms)).await
    }

    /// Declare this host offline. Invoke before
    /// [disconnect](Self::disconnect).
    pub async fn publish_state_death(&self, timestamp_ms: u64) -> Result<(), Error> {
        self.publish_state(StateCertificate::offline(timestamp_ms)).await
    }

    async fn subscribe(&self, filter: String) -> Result<(), Error> {
        self.check_connected()?;
        timeout(
            SUBSCRIBE_TIMEOUT,
            self.inner.transport.subscribe(filter, self.inner.config.qos),
        )
        .await
        .map_err(|_| Error::Timeout(SUBSCRIBE_TIMEOUT))??;
        Ok(())
    }

    /// Subscribe to every group in the namespace (`spBv1.0/#`).
    pub async fn subscribe_all_groups(&self) -> Result<(), Error> {
        self.subscribe(namespace_filter()).await
    }

    pub async fn subscribe_group(&self, group_id: &str) -> Result<(), Error> {
        self.subscribe(group_filter(group_id)).await
    }

    pub async fn subscribe_node(&self, group_id: &str, edge_node_id: &str) -> Result<(), Error> {
        self.subscribe(node_filter(group_id, edge_node_id)).await
    }

    /// Subscribe to another host's STATE topic.
    pub async fn subscribe_state(&self, host_id: &str) -> Result<(), Error> {
        self.subscribe(state_filter(host_id)).await
    }

    async fn publish_command(&self, topic: String, payload: PayloadBuilder) -> Result<(), Error> {
        self.check_connected()?;
        let mut p = payload.into_payload();
        if p.timestamp.is_none() {
            p.timestamp = Some(timestamp());
        }
        self.inner
            .transport
            .publish(
                topic,
                p.encode_to_vec(),
                self.inner.config.command_qos,
                false,
            )
            .await?;
        Ok(())
    }

    /// Publish an NCMD to an edge node. Commands carry no sequence number.
    pub async fn publish_node_command(
        &self,
        group_id: &str,
        target_edge_node_id: &str,
        payload: PayloadBuilder,
    ) -> Result<(), Error> {
        let topic = Topic::node(group_id, MessageType::NCmd, target_edge_node_id);
        self.publish_command(topic.to_topic_string(), payload).await
    }

    /// Ask an edge node to republish its births by sending a
    /// `Node Control/Rebirth` NCMD. Typical reaction to a sequence gap or an
    /// unknown alias.
    pub async fn publish_rebirth_request(
        &self,
        group_id: &str,
        target_edge_node_id: &str,
    ) -> Result<(), Error> {
        self.publish_node_command(
            group_id,
            target_edge_node_id,
            PayloadBuilder::new().add_node_control_rebirth(true),
        )
        .await
    }

    /// Publish a DCMD to a device.
    pub async fn publish_device_command(
        &self,
        group_id: &str,
        target_edge_node_id: &str,
        target_device_id: &str,
        payload: PayloadBuilder,
    ) -> Result<(), Error> {
        let topic = Topic::device(
            group_id,
            MessageType::DCmd,
            target_edge_node_id,
            target_device_id,
        );
        self.publish_command(topic.to_topic_string(), payload).await
    }

    /// Snapshot of the tracked state for one edge node.
    pub fn get_node_state(&self, group_id: &str, edge_node_id: &str) -> Option<NodeState> {
        self.inner
            .state
            .lock()
            .unwrap()
            .validator
            .node_state(group_id, edge_node_id)
            .cloned()
    }

    /// Resolve an alias to the metric name established at birth.
    pub fn get_metric_name(
        &self,
        group_id: &str,
        edge_node_id: &str,
        device_id: Option<&str>,
        alias: u64,
    ) -> Option<String> {
        self.inner
            .state
            .lock()
            .unwrap()
            .validator
            .metric_name(group_id, edge_node_id, device_id, alias)
            .map(str::to_string)
    }

    pub fn is_connected(&self) -> bool {
        self.inner.state.lock().unwrap().is_connected
    }
}

fn spawn_dispatch(inner: &Arc<Inner>, mut events: mpsc::UnboundedReceiver<TransportEvent>) {
    let weak = Arc::downgrade(inner);
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            let Some(inner) = weak.upgrade() else { break };
            match event {
                TransportEvent::Message { topic, payload } => {
                    inner.handle_message(&topic, &payload)
                }
                TransportEvent::ConnectionLost => inner.handle_connection_lost(),
            }
        }
    });
}

impl Inner {
    /// Parse, validate, deliver. Failures are logged and the message
    /// dropped; they never abort the session.
    fn handle_message(&self, topic: &str, payload: &[u8]) {
        let topic = match Topic::parse(topic) {
            Ok(topic) => topic,
            Err(TopicError::NotSparkplug) => return,
            Err(e) => {
                debug!("Ignoring unparseable topic {topic:?}: {e}");
                return;
            }
        };

        if topic.message_type == MessageType::State {
            // The JSON body is not a protobuf payload; hand the application
            // a synthetic topic with an empty one.
            self.deliver(&topic, &Payload::default());
            return;
        }

        let payload = match Payload::decode(payload) {
            Ok(payload) => payload,
            Err(e) => {
                error!("Failed to parse payload on {topic}: {e}");
                return;
            }
        };

        if self.config.validate_sequence {
            let anomalies = {
                let mut state = self.state.lock().unwrap();
                state.validator.process(&topic, &payload)
            };
            for anomaly in anomalies {
                warn!("{anomaly}");
            }
        }

        self.deliver(&topic, &payload);
    }

    fn deliver(&self, topic: &Topic, payload: &Payload) {
        let callback = self.message_callback.lock().unwrap().clone();
        if let Some(callback) = callback {
            callback(topic, payload);
        }
    }

    fn handle_connection_lost(&self) {
        self.state.lock().unwrap().is_connected = false;
        warn!("Connection lost. Host = {}", self.config.host_id);
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        let connected = self
            .state
            .get_mut()
            .map(|state| state.is_connected)
            .unwrap_or(false);
        if !connected {
            return;
        }
        let transport = self.transport.clone();
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                if let Err(e) = transport.disconnect().await {
                    debug!("Disconnect on drop failed: {e}");
                }
            });
        }
    }
}

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{debug, info, warn};
use prost::Message;
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;

use spb_client::{DynTransport, LastWill, Transport, TransportEvent};
use spb_types::constants::BDSEQ;
use spb_types::payload::{metric, DataType, Metric, Payload, StateCertificate};
use spb_types::topic::{state_filter, MessageType, QoS, Topic};
use spb_types::utils::{next_seq, timestamp, validate_name};
use spb_types::PayloadBuilder;

use crate::{EdgeNodeConfig, Error};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const SUBSCRIBE_TIMEOUT: Duration = Duration::from_secs(5);
const DISCONNECT_TIMEOUT: Duration = Duration::from_secs(11);

/// Invoked with each decoded NCMD/DCMD addressed to this node.
///
/// Called on the session's dispatch task with no internal lock held, so the
/// callback may call back into the [EdgeNode].
pub type CommandCallback = Arc<dyn Fn(Topic, Payload) + Send + Sync>;

struct DeviceState {
    is_online: bool,
    last_dbirth_payload: Option<Vec<u8>>,
}

struct SessionState {
    seq: u8,
    bd_seq: u64,
    is_connected: bool,
    primary_host_online: bool,
    last_nbirth_payload: Option<Vec<u8>>,
    death_payload: Vec<u8>,
    devices: HashMap<String, DeviceState>,
}

struct Inner {
    config: EdgeNodeConfig,
    transport: Arc<DynTransport>,
    state: Mutex<SessionState>,
    primary_host: watch::Sender<bool>,
    command_callback: Mutex<Option<CommandCallback>>,
}

/// A Sparkplug B edge node session.
///
/// Owns the birth/death lifecycle, the shared node+device message sequence
/// counter, the birth/death sequence (`bdSeq`) and the NDEATH will lodged
/// with the broker. Cheap to clone; clones share one session.
///
/// All state lives behind one coarse mutex. Operations take the lock to
/// update counters and assemble payload bytes, release it, and only then
/// call the transport, so the lock is never held across network waits or
/// user callbacks.
#[derive(Clone)]
pub struct EdgeNode {
    inner: Arc<Inner>,
}

fn death_payload_bytes(bd_seq: u64) -> Vec<u8> {
    PayloadBuilder::new().add_metric(BDSEQ, bd_seq).build()
}

fn contains_bdseq(payload: &Payload) -> bool {
    payload
        .metrics
        .iter()
        .any(|m| m.name.as_deref() == Some(BDSEQ))
}

impl EdgeNode {
    /// Create a session over `transport`, consuming its event stream.
    ///
    /// Spawns the dispatch task, so this must be called within a tokio
    /// runtime. The session is idle until [connect](Self::connect) is
    /// called.
    pub fn new<T: Transport + 'static>(
        config: EdgeNodeConfig,
        transport: T,
        events: mpsc::UnboundedReceiver<TransportEvent>,
    ) -> Result<Self, Error> {
        validate_name(&config.group_id).map_err(Error::Config)?;
        validate_name(&config.edge_node_id).map_err(Error::Config)?;
        if let Some(host) = &config.primary_host_id {
            validate_name(host).map_err(Error::Config)?;
        }

        let (primary_host, _) = watch::channel(false);
        let inner = Arc::new(Inner {
            config,
            transport: Arc::new(transport),
            state: Mutex::new(SessionState {
                seq: 0,
                bd_seq: 0,
                is_connected: false,
                primary_host_online: false,
                last_nbirth_payload: None,
                death_payload: Vec::new(),
                devices: HashMap::new(),
            }),
            primary_host,
            command_callback: Mutex::new(None),
        });
        spawn_dispatch(&inner, events);
        Ok(Self { inner })
    }

    /// Register the command callback. Set before [connect](Self::connect) to
    /// avoid missing early commands.
    pub fn set_command_callback(&self, callback: CommandCallback) {
        *self.inner.command_callback.lock().unwrap() = Some(callback);
    }

    fn node_topic(&self, message_type: MessageType) -> String {
        Topic::node(
            &self.inner.config.group_id,
            message_type,
            &self.inner.config.edge_node_id,
        )
        .to_topic_string()
    }

    fn device_topic(&self, message_type: MessageType, device_id: &str) -> String {
        Topic::device(
            &self.inner.config.group_id,
            message_type,
            &self.inner.config.edge_node_id,
            device_id,
        )
        .to_topic_string()
    }

    async fn subscribe(&self, filter: String, qos: QoS) -> Result<(), Error> {
        timeout(SUBSCRIBE_TIMEOUT, self.inner.transport.subscribe(filter, qos))
            .await
            .map_err(|_| Error::Timeout(SUBSCRIBE_TIMEOUT))??;
        Ok(())
    }

    /// Connect to the broker and open a new session.
    ///
    /// Increments `bdSeq`, lodges an NDEATH carrying it as the will message,
    /// subscribes to this node's NCMD topic and, when a primary host is
    /// configured, to its STATE topic.
    pub async fn connect(&self) -> Result<(), Error> {
        let bd_seq = {
            let state = self.inner.state.lock().unwrap();
            if state.is_connected {
                return Err(Error::state("already connected"));
            }
            state.bd_seq.wrapping_add(1)
        };
        self.connect_session(bd_seq).await
    }

    /// Connect with an explicit session number. `connect` and `rebirth` both
    /// funnel through here so `bdSeq` advances exactly once per session.
    async fn connect_session(&self, bd_seq: u64) -> Result<(), Error> {
        let config = &self.inner.config;
        let will = {
            let mut state = self.inner.state.lock().unwrap();
            state.bd_seq = bd_seq;
            state.death_payload = death_payload_bytes(bd_seq);
            state.primary_host_online = config.primary_host_id.is_none();
            LastWill {
                topic: self.node_topic(MessageType::NDeath),
                payload: state.death_payload.clone(),
                qos: config.death_qos,
                retain: false,
            }
        };
        self.inner.primary_host.send_replace(false);

        timeout(CONNECT_TIMEOUT, self.inner.transport.connect(Some(will)))
            .await
            .map_err(|_| Error::Timeout(CONNECT_TIMEOUT))??;
        self.inner.state.lock().unwrap().is_connected = true;
        info!(
            "Edge node connected. Node = {}/{}, bdSeq = {}",
            config.group_id, config.edge_node_id, bd_seq
        );

        self.subscribe(self.node_topic(MessageType::NCmd), QoS::AtLeastOnce)
            .await?;

        if let Some(host) = &config.primary_host_id {
            self.subscribe(state_filter(host), QoS::AtLeastOnce).await?;
            if !config.primary_host_wait.is_zero() {
                // The broker redelivers the retained STATE on subscribe;
                // give it the configured window before reporting back.
                let mut rx = self.inner.primary_host.subscribe();
                _ = timeout(config.primary_host_wait, async {
                    while !*rx.borrow_and_update() {
                        if rx.changed().await.is_err() {
                            break;
                        }
                    }
                })
                .await;
            }
        }
        Ok(())
    }

    /// Gracefully disconnect. The broker discards the lodged NDEATH on a
    /// clean disconnect; use [publish_death](Self::publish_death) to end the
    /// session with an explicit death certificate.
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
        info!(
            "Edge node disconnected. Node = {}/{}",
            self.inner.config.group_id, self.inner.config.edge_node_id
        );
        Ok(())
    }

    /// Publish the NBIRTH, opening the data phase of the session.
    ///
    /// Resets the message sequence to 0 and injects the `bdSeq` metric if the
    /// caller did not provide one. Gated on the primary host being online
    /// when one is configured.
    pub async fn publish_birth(&self, payload: PayloadBuilder) -> Result<(), Error> {
        let (topic, bytes, qos) = {
            let state = self.inner.state.lock().unwrap();
            if !state.is_connected {
                return Err(Error::state("not connected"));
            }
            if !state.primary_host_online {
                return Err(Error::state("primary host is not online"));
            }

            let mut p = payload.into_payload();
            p.seq = Some(0);
            if p.timestamp.is_none() {
                p.timestamp = Some(timestamp());
            }
            if !contains_bdseq(&p) {
                let mut m = Metric::new();
                m.set_name(BDSEQ.into())
                    .set_datatype(DataType::UInt64)
                    .set_value(metric::Value::LongValue(state.bd_seq));
                if let Some(ts) = p.timestamp {
                    m.set_timestamp(ts);
                }
                p.metrics.push(m);
            }
            (
                self.node_topic(MessageType::NBirth),
                p.encode_to_vec(),
                self.inner.config.data_qos,
            )
        };

        self.inner
            .transport
            .publish(topic, bytes.clone(), qos, false)
            .await?;

        let mut state = self.inner.state.lock().unwrap();
        state.seq = 0;
        state.last_nbirth_payload = Some(bytes);
        Ok(())
    }

    /// Publish an NDATA update. Consumes the next sequence number.
    pub async fn publish_data(&self, payload: PayloadBuilder) -> Result<(), Error> {
        let (topic, bytes, qos) = {
            let mut state = self.inner.state.lock().unwrap();
            if !state.is_connected {
                return Err(Error::state("not connected"));
            }
            state.seq = next_seq(state.seq);
            let mut p = payload.into_payload();
            if p.seq.is_none() {
                p.seq = Some(state.seq as u64);
            }
            if p.timestamp.is_none() {
                p.timestamp = Some(timestamp());
            }
            (
                self.node_topic(MessageType::NData),
                p.encode_to_vec(),
                self.inner.config.data_qos,
            )
        };
        self.inner.transport.publish(topic, bytes, qos, false).await?;
        Ok(())
    }

    /// Publish a DBIRTH for `device_id`, declaring it online.
    ///
    /// Subscribes to the device's DCMD topic before the birth goes out.
    /// Requires an NBIRTH first; shares the node's sequence counter.
    pub async fn publish_device_birth(
        &self,
        device_id: &str,
        payload: PayloadBuilder,
    ) -> Result<(), Error> {
        validate_name(device_id).map_err(Error::Config)?;
        let (topic, bytes, qos) = {
            let mut state = self.inner.state.lock().unwrap();
            if !state.is_connected {
                return Err(Error::state("not connected"));
            }
            if !state.primary_host_online {
                return Err(Error::state("primary host is not online"));
            }
            if state.last_nbirth_payload.is_none() {
                return Err(Error::state("Must publish NBIRTH before DBIRTH"));
            }
            state.seq = next_seq(state.seq);
            let mut p = payload.into_payload();
            p.seq = Some(state.seq as u64);
            if p.timestamp.is_none() {
                p.timestamp = Some(timestamp());
            }
            (
                self.device_topic(MessageType::DBirth, device_id),
                p.encode_to_vec(),
                self.inner.config.data_qos,
            )
        };

        self.subscribe(
            self.device_topic(MessageType::DCmd, device_id),
            QoS::AtLeastOnce,
        )
        .await?;

        self.inner
            .transport
            .publish(topic, bytes.clone(), qos, false)
            .await?;

        let mut state = self.inner.state.lock().unwrap();
        let device = state
            .devices
            .entry(device_id.to_string())
            .or_insert(DeviceState {
                is_online: false,
                last_dbirth_payload: None,
            });
        device.is_online = true;
        device.last_dbirth_payload = Some(bytes);
        Ok(())
    }

    /// Publish a DDATA update for a device born in the current session.
    pub async fn publish_device_data(
        &self,
        device_id: &str,
        payload: PayloadBuilder,
    ) -> Result<(), Error> {
        let (topic, bytes, qos) = {
            let mut state = self.inner.state.lock().unwrap();
            if !state.is_connected {
                return Err(Error::state("not connected"));
            }
            match state.devices.get(device_id) {
                Some(device) if device.is_online => {}
                _ => {
                    return Err(Error::state(format!(
                        "Must publish DBIRTH for device '{device_id}' before DDATA"
                    )))
                }
            }
            state.seq = next_seq(state.seq);
            let mut p = payload.into_payload();
            if p.seq.is_none() {
                p.seq = Some(state.seq as u64);
            }
            if p.timestamp.is_none() {
                p.timestamp = Some(timestamp());
            }
            (
                self.device_topic(MessageType::DData, device_id),
                p.encode_to_vec(),
                self.inner.config.data_qos,
            )
        };
        self.inner.transport.publish(topic, bytes, qos, false).await?;
        Ok(())
    }

    /// Publish a DDEATH, declaring the device offline. A new DBIRTH is
    /// required before further DDATA.
    pub async fn publish_device_death(&self, device_id: &str) -> Result<(), Error> {
        let (topic, bytes, qos) = {
            let mut state = self.inner.state.lock().unwrap();
            if !state.is_connected {
                return Err(Error::state("not connected"));
            }
            if !state.devices.contains_key(device_id) {
                return Err(Error::state(format!("unknown device: '{device_id}'")));
            }
            state.seq = next_seq(state.seq);
            let p = Payload {
                timestamp: Some(timestamp()),
                metrics: Vec::new(),
                seq: Some(state.seq as u64),
                uuid: None,
                body: None,
            };
            (
                self.device_topic(MessageType::DDeath, device_id),
                p.encode_to_vec(),
                self.inner.config.death_qos,
            )
        };

        self.inner.transport.publish(topic, bytes, qos, false).await?;

        let mut state = self.inner.state.lock().unwrap();
        if let Some(device) = state.devices.get_mut(device_id) {
            device.is_online = false;
        }
        Ok(())
    }

    /// Publish an explicit NDEATH and disconnect.
    ///
    /// Usually unnecessary: the broker delivers the lodged NDEATH when the
    /// connection is lost.
    pub async fn publish_death(&self) -> Result<(), Error> {
        let (topic, bytes, qos) = {
            let mut state = self.inner.state.lock().unwrap();
            if !state.is_connected {
                return Err(Error::state("not connected"));
            }
            state.seq = next_seq(state.seq);
            let p = PayloadBuilder::new()
                .add_metric(BDSEQ, state.bd_seq)
                .set_seq(state.seq as u64)
                .set_timestamp(timestamp())
                .into_payload();
            (
                self.node_topic(MessageType::NDeath),
                p.encode_to_vec(),
                self.inner.config.death_qos,
            )
        };
        self.inner.transport.publish(topic, bytes, qos, false).await?;
        self.disconnect().await
    }

    /// Tear the session down and open a new one, republishing the cached
    /// NBIRTH with the next `bdSeq`.
    ///
    /// The cached NBIRTH and the will payload are rewritten to the new
    /// `bdSeq` before the disconnect, and the reconnect adopts that value
    /// rather than incrementing again, so `bdSeq` advances exactly once per
    /// rebirth and the lodged NDEATH always matches the published NBIRTH.
    /// Devices belong to the old session afterwards: each needs a fresh
    /// DBIRTH before more DDATA.
    pub async fn rebirth(&self) -> Result<(), Error> {
        let (topic, bytes, qos, new_bdseq) = {
            let mut state = self.inner.state.lock().unwrap();
            if !state.is_connected {
                return Err(Error::state("not connected"));
            }
            let cached = state
                .last_nbirth_payload
                .as_ref()
                .ok_or_else(|| Error::state("no previous birth payload stored"))?;
            let mut p = Payload::decode(cached.as_slice())
                .map_err(|e| Error::Payload(format!("stored birth payload: {e}")))?;

            let new_bdseq = state.bd_seq.wrapping_add(1);
            for m in &mut p.metrics {
                if m.name.as_deref() == Some(BDSEQ) {
                    m.value = Some(metric::Value::LongValue(new_bdseq));
                    break;
                }
            }
            p.seq = Some(0);

            let bytes = p.encode_to_vec();
            state.last_nbirth_payload = Some(bytes.clone());
            state.death_payload = death_payload_bytes(new_bdseq);
            for device in state.devices.values_mut() {
                device.is_online = false;
            }
            (
                self.node_topic(MessageType::NBirth),
                bytes,
                self.inner.config.data_qos,
                new_bdseq,
            )
        };

        info!(
            "Rebirthing node. Node = {}/{}, bdSeq = {}",
            self.inner.config.group_id, self.inner.config.edge_node_id, new_bdseq
        );
        self.disconnect().await?;
        self.connect_session(new_bdseq).await?;
        self.inner.transport.publish(topic, bytes, qos, false).await?;
        self.inner.state.lock().unwrap().seq = 0;
        Ok(())
    }

    /// Publish an NCMD to another edge node in this group. Commands carry no
    /// sequence number.
    pub async fn publish_node_command(
        &self,
        target_edge_node_id: &str,
        payload: PayloadBuilder,
    ) -> Result<(), Error> {
        let (topic, bytes, qos) = {
            let state = self.inner.state.lock().unwrap();
            if !state.is_connected {
                return Err(Error::state("not connected"));
            }
            let mut p = payload.into_payload();
            if p.timestamp.is_none() {
                p.timestamp = Some(timestamp());
            }
            (
                Topic::node(
                    &self.inner.config.group_id,
                    MessageType::NCmd,
                    target_edge_node_id,
                )
                .to_topic_string(),
                p.encode_to_vec(),
                self.inner.config.command_qos,
            )
        };
        self.inner.transport.publish(topic, bytes, qos, false).await?;
        Ok(())
    }

    /// Publish a DCMD to a device on another edge node in this group.
    pub async fn publish_device_command(
        &self,
        target_edge_node_id: &str,
        target_device_id: &str,
        payload: PayloadBuilder,
    ) -> Result<(), Error> {
        let (topic, bytes, qos) = {
            let state = self.inner.state.lock().unwrap();
            if !state.is_connected {
                return Err(Error::state("not connected"));
            }
            let mut p = payload.into_payload();
            if p.timestamp.is_none() {
                p.timestamp = Some(timestamp());
            }
            (
                Topic::device(
                    &self.inner.config.group_id,
                    MessageType::DCmd,
                    target_edge_node_id,
                    target_device_id,
                )
                .to_topic_string(),
                p.encode_to_vec(),
                self.inner.config.command_qos,
            )
        };
        self.inner.transport.publish(topic, bytes, qos, false).await?;
        Ok(())
    }

    /// Current message sequence number (last consumed).
    pub fn get_seq(&self) -> u8 {
        self.inner.state.lock().unwrap().seq
    }

    /// Current birth/death sequence number.
    pub fn get_bd_seq(&self) -> u64 {
        self.inner.state.lock().unwrap().bd_seq
    }

    pub fn is_connected(&self) -> bool {
        self.inner.state.lock().unwrap().is_connected
    }

    /// Whether the configured primary host's last observed STATE was online.
    /// Always true when no primary host is configured and the session is
    /// connected.
    pub fn is_primary_host_online(&self) -> bool {
        self.inner.state.lock().unwrap().primary_host_online
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
    fn handle_message(&self, topic: &str, payload: &[u8]) {
        if let Some(host) = &self.config.primary_host_id {
            if topic == state_filter(host) {
                self.handle_state_message(host, payload);
                return;
            }
        }

        let topic = match Topic::parse(topic) {
            Ok(topic) => topic,
            Err(_) => {
                debug!("Ignoring message on unexpected topic: {topic}");
                return;
            }
        };

        if !matches!(topic.message_type, MessageType::NCmd | MessageType::DCmd) {
            return;
        }

        let payload = match Payload::decode(payload) {
            Ok(payload) => payload,
            Err(e) => {
                warn!("Discarding command with undecodable payload on {topic}: {e}");
                return;
            }
        };

        let callback = self.command_callback.lock().unwrap().clone();
        if let Some(callback) = callback {
            callback(topic, payload);
        }
    }

    fn handle_state_message(&self, host: &str, payload: &[u8]) {
        let certificate = match StateCertificate::from_bytes(payload) {
            Ok(certificate) => certificate,
            Err(e) => {
                warn!("Discarding undecodable STATE payload from host {host}: {e}");
                return;
            }
        };
        info!(
            "Primary host {host} is {}",
            if certificate.online { "online" } else { "offline" }
        );
        self.state.lock().unwrap().primary_host_online = certificate.online;
        self.primary_host.send_replace(certificate.online);
    }

    fn handle_connection_lost(&self) {
        let mut state = self.state.lock().unwrap();
        state.is_connected = false;
        // Device states and the cached NBIRTH survive so a manual
        // reconnect + rebirth can restore the session.
        warn!(
            "Connection lost. Node = {}/{}",
            self.config.group_id, self.config.edge_node_id
        );
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

//! Consumer-side tracking of node and device sessions.
//!
//! The validator watches the message stream a host application receives and
//! flags violations of the Sparkplug ordering rules: data before birth,
//! sequence gaps, bdSeq mismatches. Violations never block delivery; the
//! session logs them at WARN and hands the message to the application
//! regardless.

use std::borrow::Borrow;
use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};

use thiserror::Error;

use spb_types::constants::BDSEQ;
use spb_types::payload::{metric, Metric, Payload};
use spb_types::topic::{MessageType, Topic};
use spb_types::utils::next_seq;

/// Identifies an edge node within the namespace.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct NodeKey {
    pub group_id: String,
    pub edge_node_id: String,
}

impl NodeKey {
    pub fn new(group_id: impl Into<String>, edge_node_id: impl Into<String>) -> Self {
        Self {
            group_id: group_id.into(),
            edge_node_id: edge_node_id.into(),
        }
    }
}

impl fmt::Display for NodeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.group_id, self.edge_node_id)
    }
}

/* Borrowed lookup key so queries by (&str, &str) need no allocation. The
hash of the trait object must match NodeKey's derived Hash: field order,
String and str hash identically. */

trait KeyPair {
    fn group(&self) -> &str;
    fn node(&self) -> &str;
}

impl KeyPair for NodeKey {
    fn group(&self) -> &str {
        &self.group_id
    }
    fn node(&self) -> &str {
        &self.edge_node_id
    }
}

impl<'a> KeyPair for (&'a str, &'a str) {
    fn group(&self) -> &str {
        self.0
    }
    fn node(&self) -> &str {
        self.1
    }
}

impl Hash for dyn KeyPair + '_ {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.group().hash(state);
        self.node().hash(state);
    }
}

impl PartialEq for dyn KeyPair + '_ {
    fn eq(&self, other: &Self) -> bool {
        self.group() == other.group() && self.node() == other.node()
    }
}

impl Eq for dyn KeyPair + '_ {}

impl<'a> Borrow<dyn KeyPair + 'a> for NodeKey {
    fn borrow(&self) -> &(dyn KeyPair + 'a) {
        self
    }
}

/// Per-device consumer state, rebuilt from each DBIRTH.
#[derive(Clone, Debug, Default)]
pub struct DeviceDataState {
    pub is_online: bool,
    pub birth_received: bool,
    pub alias_map: HashMap<u64, String>,
    pub offline_timestamp: Option<u64>,
    /// Set on DDEATH: the last reported values no longer reflect the device.
    pub metrics_stale: bool,
}

/// Per-node consumer state.
#[derive(Clone, Debug)]
pub struct NodeState {
    pub is_online: bool,
    pub birth_received: bool,
    /// Last accepted sequence number. Initialised to 255 so the first
    /// expected value is 0.
    pub last_seq: u8,
    pub bd_seq: u64,
    pub birth_timestamp: u64,
    pub alias_map: HashMap<u64, String>,
    pub devices: HashMap<String, DeviceDataState>,
}

impl Default for NodeState {
    fn default() -> Self {
        Self {
            is_online: false,
            birth_received: false,
            last_seq: u8::MAX,
            bd_seq: 0,
            birth_timestamp: 0,
            alias_map: HashMap::new(),
            devices: HashMap::new(),
        }
    }
}

/// A violation of the expected message lifecycle or ordering.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum Anomaly {
    #[error("NBIRTH for {node} has invalid seq {seq} (expected 0)")]
    BirthSeqNotZero { node: NodeKey, seq: u64 },
    #[error("NBIRTH for {node} missing required bdSeq metric")]
    MissingBdSeq { node: NodeKey },
    #[error("NDEATH bdSeq mismatch for {node} (NDEATH {death}, NBIRTH {birth})")]
    DeathBdSeqMismatch {
        node: NodeKey,
        death: u64,
        birth: u64,
    },
    #[error("received NDATA for {node} before NBIRTH")]
    DataBeforeBirth { node: NodeKey },
    #[error("received {message_type} for device '{device}' on {node} before node NBIRTH")]
    DeviceBeforeNodeBirth {
        node: NodeKey,
        device: String,
        message_type: MessageType,
    },
    #[error("received DDATA for device '{device}' on {node} before DBIRTH")]
    DeviceDataBeforeBirth { node: NodeKey, device: String },
    #[error("sequence number gap for {node} (expected {expected}, got {got})")]
    SeqGap {
        node: NodeKey,
        expected: u8,
        got: u8,
    },
    #[error("received DDEATH for unknown device '{device}' on {node}")]
    UnknownDeviceDeath { node: NodeKey, device: String },
}

fn bdseq_from_metrics(metrics: &[Metric]) -> Option<u64> {
    metrics.iter().find_map(|m| {
        if m.name.as_deref() != Some(BDSEQ) {
            return None;
        }
        match m.value {
            Some(metric::Value::LongValue(v)) => Some(v),
            Some(metric::Value::IntValue(v)) => Some(v as u64),
            _ => None,
        }
    })
}

fn alias_map_from_metrics(metrics: &[Metric]) -> HashMap<u64, String> {
    metrics
        .iter()
        .filter_map(|m| match (&m.name, m.alias) {
            (Some(name), Some(alias)) => Some((alias, name.clone())),
            _ => None,
        })
        .collect()
}

/// Tracks every observed node and device session, detecting gaps, stale
/// data and missing births.
#[derive(Default)]
pub struct Validator {
    nodes: HashMap<NodeKey, NodeState>,
}

impl Validator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run one received message through the tracker.
    ///
    /// Always updates state; the returned anomalies are diagnostics, not a
    /// verdict on whether to deliver the message.
    pub fn process(&mut self, topic: &Topic, payload: &Payload) -> Vec<Anomaly> {
        match topic.message_type {
            // Commands and STATE carry no consumer-side invariants.
            MessageType::NCmd | MessageType::DCmd | MessageType::State => Vec::new(),
            _ => self.process_node_scoped(topic, payload),
        }
    }

    fn process_node_scoped(&mut self, topic: &Topic, payload: &Payload) -> Vec<Anomaly> {
        let key = NodeKey::new(&topic.group_id, &topic.edge_node_id);
        let mut anomalies = Vec::new();
        let state = self.nodes.entry(key.clone()).or_default();

        match topic.message_type {
            MessageType::NBirth => {
                if let Some(seq) = payload.seq {
                    if seq != 0 {
                        anomalies.push(Anomaly::BirthSeqNotZero {
                            node: key.clone(),
                            seq,
                        });
                    }
                    state.last_seq = seq as u8;
                } else {
                    state.last_seq = 0;
                }

                match bdseq_from_metrics(&payload.metrics) {
                    Some(bd_seq) => state.bd_seq = bd_seq,
                    None => anomalies.push(Anomaly::MissingBdSeq { node: key }),
                }

                state.is_online = true;
                state.birth_received = true;
                state.birth_timestamp = payload.timestamp.unwrap_or(0);
                state.alias_map = alias_map_from_metrics(&payload.metrics);
            }

            MessageType::NDeath => {
                if state.birth_received {
                    if let Some(death) = bdseq_from_metrics(&payload.metrics) {
                        if death != state.bd_seq {
                            anomalies.push(Anomaly::DeathBdSeqMismatch {
                                node: key,
                                death,
                                birth: state.bd_seq,
                            });
                        }
                    }
                }
                state.is_online = false;
            }

            MessageType::NData => {
                if !state.birth_received {
                    anomalies.push(Anomaly::DataBeforeBirth { node: key });
                    return anomalies;
                }
                Self::check_seq(state, &key, payload.seq, &mut anomalies);
            }

            MessageType::DBirth => {
                let device = topic.device_id.clone().unwrap_or_default();
                if !state.birth_received {
                    anomalies.push(Anomaly::DeviceBeforeNodeBirth {
                        node: key,
                        device,
                        message_type: MessageType::DBirth,
                    });
                    return anomalies;
                }
                Self::check_seq(state, &key, payload.seq, &mut anomalies);

                let device_state = state.devices.entry(device).or_default();
                device_state.is_online = true;
                device_state.birth_received = true;
                device_state.metrics_stale = false;
                device_state.offline_timestamp = None;
                device_state.alias_map = alias_map_from_metrics(&payload.metrics);
            }

            MessageType::DData => {
                let device = topic.device_id.clone().unwrap_or_default();
                if !state.birth_received {
                    anomalies.push(Anomaly::DeviceBeforeNodeBirth {
                        node: key,
                        device,
                        message_type: MessageType::DData,
                    });
                    return anomalies;
                }
                let device_born = state
                    .devices
                    .get(&device)
                    .map(|d| d.birth_received)
                    .unwrap_or(false);
                if !device_born {
                    anomalies.push(Anomaly::DeviceDataBeforeBirth { node: key, device });
                    return anomalies;
                }
                Self::check_seq(state, &key, payload.seq, &mut anomalies);
            }

            MessageType::DDeath => {
                // DDEATH consumes a sequence number like any other session
                // message; adopting it keeps the follow-up expectation right.
                Self::check_seq(state, &key, payload.seq, &mut anomalies);
                let device = topic.device_id.clone().unwrap_or_default();
                match state.devices.get_mut(&device) {
                    Some(device_state) => {
                        device_state.is_online = false;
                        device_state.offline_timestamp = payload.timestamp;
                        device_state.metrics_stale = true;
                    }
                    None => anomalies.push(Anomaly::UnknownDeviceDeath { node: key, device }),
                }
            }

            MessageType::NCmd | MessageType::DCmd | MessageType::State => unreachable!(),
        }
        anomalies
    }

    /// Warn on a gap but accept the received value as the new baseline;
    /// re-requesting a birth is the caller's policy.
    fn check_seq(
        state: &mut NodeState,
        key: &NodeKey,
        payload_seq: Option<u64>,
        anomalies: &mut Vec<Anomaly>,
    ) {
        let Some(seq) = payload_seq else { return };
        let seq = seq as u8;
        let expected = next_seq(state.last_seq);
        if seq != expected {
            anomalies.push(Anomaly::SeqGap {
                node: key.clone(),
                expected,
                got: seq,
            });
        }
        state.last_seq = seq;
    }

    pub fn node_state(&self, group_id: &str, edge_node_id: &str) -> Option<&NodeState> {
        self.nodes
            .get(&(group_id, edge_node_id) as &dyn KeyPair)
    }

    /// Resolve an alias to the metric name established at birth.
    pub fn metric_name(
        &self,
        group_id: &str,
        edge_node_id: &str,
        device_id: Option<&str>,
        alias: u64,
    ) -> Option<&str> {
        let node = self.node_state(group_id, edge_node_id)?;
        let map = match device_id {
            Some(device) => &node.devices.get(device)?.alias_map,
            None => &node.alias_map,
        };
        map.get(&alias).map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use spb_types::PayloadBuilder;

    fn nbirth_payload(bd_seq: u64, seq: u64) -> Payload {
        PayloadBuilder::new()
            .add_metric("bdSeq", bd_seq)
            .add_metric_with_alias("Temperature", 1, 20.5)
            .set_seq(seq)
            .set_timestamp(1000)
            .into_payload()
    }

    fn data_payload(seq: u64) -> Payload {
        PayloadBuilder::new()
            .add_metric_by_alias(1, 21.0)
            .set_seq(seq)
            .set_timestamp(1001)
            .into_payload()
    }

    fn nbirth(v: &mut Validator, bd_seq: u64) -> Vec<Anomaly> {
        v.process(
            &Topic::node("Energy", MessageType::NBirth, "Gateway01"),
            &nbirth_payload(bd_seq, 0),
        )
    }

    fn ndata(v: &mut Validator, seq: u64) -> Vec<Anomaly> {
        v.process(
            &Topic::node("Energy", MessageType::NData, "Gateway01"),
            &data_payload(seq),
        )
    }

    #[test]
    fn nbirth_populates_state() {
        let mut v = Validator::new();
        assert!(nbirth(&mut v, 5).is_empty());

        let state = v.node_state("Energy", "Gateway01").unwrap();
        assert!(state.is_online);
        assert!(state.birth_received);
        assert_eq!(state.bd_seq, 5);
        assert_eq!(state.last_seq, 0);
        assert_eq!(state.birth_timestamp, 1000);
        assert_eq!(state.alias_map.get(&1).map(String::as_str), Some("Temperature"));
    }

    #[test]
    fn data_before_birth_warns_and_is_not_tracked() {
        let mut v = Validator::new();
        let anomalies = ndata(&mut v, 1);
        assert_eq!(
            anomalies,
            vec![Anomaly::DataBeforeBirth {
                node: NodeKey::new("Energy", "Gateway01")
            }]
        );
    }

    #[test]
    fn gap_warns_once_and_adopts_baseline() {
        let mut v = Validator::new();
        nbirth(&mut v, 5);
        assert!(ndata(&mut v, 1).is_empty());

        let anomalies = ndata(&mut v, 3);
        assert_eq!(anomalies.len(), 1);
        match &anomalies[0] {
            Anomaly::SeqGap { expected, got, .. } => {
                assert_eq!(*expected, 2);
                assert_eq!(*got, 3);
            }
            other => panic!("expected a seq gap, got {other:?}"),
        }
        assert!(anomalies[0].to_string().contains("expected 2, got 3"));

        // 3 became the baseline
        assert!(ndata(&mut v, 4).is_empty());
    }

    #[test]
    fn sequence_wraps_through_255() {
        let mut v = Validator::new();
        nbirth(&mut v, 1);
        for seq in 1..=255u64 {
            assert!(ndata(&mut v, seq).is_empty());
        }
        assert!(ndata(&mut v, 0).is_empty());
        assert!(ndata(&mut v, 1).is_empty());
    }

    #[test]
    fn nbirth_with_nonzero_seq_warns_but_updates() {
        let mut v = Validator::new();
        let anomalies = v.process(
            &Topic::node("Energy", MessageType::NBirth, "Gateway01"),
            &nbirth_payload(1, 7),
        );
        assert_eq!(anomalies.len(), 1);
        assert!(matches!(anomalies[0], Anomaly::BirthSeqNotZero { seq: 7, .. }));

        let state = v.node_state("Energy", "Gateway01").unwrap();
        assert!(state.birth_received);
        assert_eq!(state.last_seq, 7);
        assert!(ndata(&mut v, 8).is_empty());
    }

    #[test]
    fn nbirth_without_bdseq_warns() {
        let mut v = Validator::new();
        let payload = PayloadBuilder::new()
            .add_metric_with_alias("Temperature", 1, 20.5)
            .set_seq(0)
            .into_payload();
        let anomalies = v.process(
            &Topic::node("Energy", MessageType::NBirth, "Gateway01"),
            &payload,
        );
        assert_eq!(anomalies.len(), 1);
        assert!(matches!(anomalies[0], Anomaly::MissingBdSeq { .. }));
        assert!(v.node_state("Energy", "Gateway01").unwrap().birth_received);
    }

    #[test]
    fn ndeath_bdseq_mismatch_warns_but_node_goes_offline() {
        let mut v = Validator::new();
        nbirth(&mut v, 5);

        let death = PayloadBuilder::new().add_metric("bdSeq", 4u64).into_payload();
        let anomalies = v.process(
            &Topic::node("Energy", MessageType::NDeath, "Gateway01"),
            &death,
        );
        assert_eq!(
            anomalies,
            vec![Anomaly::DeathBdSeqMismatch {
                node: NodeKey::new("Energy", "Gateway01"),
                death: 4,
                birth: 5
            }]
        );
        let state = v.node_state("Energy", "Gateway01").unwrap();
        assert!(!state.is_online);
    }

    #[test]
    fn matching_ndeath_is_silent() {
        let mut v = Validator::new();
        nbirth(&mut v, 5);
        let death = PayloadBuilder::new().add_metric("bdSeq", 5u64).into_payload();
        assert!(v
            .process(
                &Topic::node("Energy", MessageType::NDeath, "Gateway01"),
                &death
            )
            .is_empty());
    }

    fn dbirth(v: &mut Validator, device: &str, seq: u64) -> Vec<Anomaly> {
        let payload = PayloadBuilder::new()
            .add_metric_with_alias("Humidity", 1, 55.0)
            .set_seq(seq)
            .set_timestamp(1002)
            .into_payload();
        v.process(
            &Topic::device("Energy", MessageType::DBirth, "Gateway01", device),
            &payload,
        )
    }

    #[test]
    fn device_lifecycle() {
        let mut v = Validator::new();

        // DBIRTH before NBIRTH
        assert!(matches!(
            dbirth(&mut v, "Sensor01", 1)[..],
            [Anomaly::DeviceBeforeNodeBirth { .. }]
        ));

        nbirth(&mut v, 1);
        assert!(dbirth(&mut v, "Sensor01", 1).is_empty());
        assert_eq!(
            v.metric_name("Energy", "Gateway01", Some("Sensor01"), 1),
            Some("Humidity")
        );

        // DDATA flows once both births are in
        let anomalies = v.process(
            &Topic::device("Energy", MessageType::DData, "Gateway01", "Sensor01"),
            &data_payload(2),
        );
        assert!(anomalies.is_empty());

        // DDATA for an unborn device
        assert!(matches!(
            v.process(
                &Topic::device("Energy", MessageType::DData, "Gateway01", "Sensor02"),
                &data_payload(3),
            )[..],
            [Anomaly::DeviceDataBeforeBirth { .. }]
        ));

        // DDEATH marks the device stale and consumes a seq
        let death = PayloadBuilder::new()
            .set_seq(3)
            .set_timestamp(2000)
            .into_payload();
        assert!(v
            .process(
                &Topic::device("Energy", MessageType::DDeath, "Gateway01", "Sensor01"),
                &death
            )
            .is_empty());
        let state = v.node_state("Energy", "Gateway01").unwrap();
        let device = state.devices.get("Sensor01").unwrap();
        assert!(!device.is_online);
        assert!(device.metrics_stale);
        assert_eq!(device.offline_timestamp, Some(2000));

        // no false gap after the DDEATH
        assert!(ndata(&mut v, 4).is_empty());
    }

    #[test]
    fn ddeath_for_unknown_device_warns() {
        let mut v = Validator::new();
        nbirth(&mut v, 1);
        let death = PayloadBuilder::new().set_seq(1).into_payload();
        assert!(matches!(
            v.process(
                &Topic::device("Energy", MessageType::DDeath, "Gateway01", "Ghost"),
                &death
            )[..],
            [Anomaly::UnknownDeviceDeath { .. }]
        ));
    }

    #[test]
    fn commands_and_state_pass_through() {
        let mut v = Validator::new();
        let payload = PayloadBuilder::new().add_node_control_rebirth(true).into_payload();
        assert!(v
            .process(
                &Topic::node("Energy", MessageType::NCmd, "Gateway01"),
                &payload
            )
            .is_empty());
        assert!(v
            .process(&Topic::state("SCADA01"), &Payload::default())
            .is_empty());
        // no state entry was created
        assert!(v.node_state("Energy", "Gateway01").is_none());
    }

    #[test]
    fn rebirth_resets_alias_map() {
        let mut v = Validator::new();
        nbirth(&mut v, 1);

        let second_birth = PayloadBuilder::new()
            .add_metric("bdSeq", 2u64)
            .add_metric_with_alias("Pressure", 2, 101.3)
            .set_seq(0)
            .into_payload();
        v.process(
            &Topic::node("Energy", MessageType::NBirth, "Gateway01"),
            &second_birth,
        );

        assert_eq!(v.metric_name("Energy", "Gateway01", None, 1), None);
        assert_eq!(
            v.metric_name("Energy", "Gateway01", None, 2),
            Some("Pressure")
        );
        assert_eq!(v.node_state("Energy", "Gateway01").unwrap().bd_seq, 2);
    }
}

use std::fmt;

use thiserror::Error;

use crate::constants::{
    DBIRTH, DCMD, DDATA, DDEATH, NAMESPACE, NBIRTH, NCMD, NDATA, NDEATH, STATE,
};

/// The nine Sparkplug B message kinds carried in the topic's type level.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MessageType {
    NBirth,
    NDeath,
    NData,
    NCmd,
    DBirth,
    DDeath,
    DData,
    DCmd,
    State,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::NBirth => NBIRTH,
            MessageType::NDeath => NDEATH,
            MessageType::NData => NDATA,
            MessageType::NCmd => NCMD,
            MessageType::DBirth => DBIRTH,
            MessageType::DDeath => DDEATH,
            MessageType::DData => DDATA,
            MessageType::DCmd => DCMD,
            MessageType::State => STATE,
        }
    }

    pub fn is_device_message(&self) -> bool {
        matches!(
            self,
            MessageType::DBirth | MessageType::DDeath | MessageType::DData | MessageType::DCmd
        )
    }
}

impl std::str::FromStr for MessageType {
    type Err = TopicError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            NBIRTH => Ok(MessageType::NBirth),
            NDEATH => Ok(MessageType::NDeath),
            NDATA => Ok(MessageType::NData),
            NCMD => Ok(MessageType::NCmd),
            DBIRTH => Ok(MessageType::DBirth),
            DDEATH => Ok(MessageType::DDeath),
            DDATA => Ok(MessageType::DData),
            DCMD => Ok(MessageType::DCmd),
            STATE => Ok(MessageType::State),
            other => Err(TopicError::UnknownMessageType(other.to_string())),
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum TopicError {
    #[error("topic does not start with the {NAMESPACE} namespace")]
    NotSparkplug,
    #[error("unknown message type: {0}")]
    UnknownMessageType(String),
    #[error("invalid topic format: {0}")]
    InvalidFormat(&'static str),
}

/// A parsed Sparkplug B topic.
///
/// Normal messages use `spBv1.0/{group}/{TYPE}/{node}[/{device}]`. STATE
/// messages use `spBv1.0/STATE/{host_id}`: `group_id` is empty and
/// `edge_node_id` carries the host id.
///
/// `parse` and [`Topic::to_topic_string`] round-trip for every valid topic.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Topic {
    pub group_id: String,
    pub message_type: MessageType,
    pub edge_node_id: String,
    pub device_id: Option<String>,
}

impl Topic {
    pub fn node(group_id: &str, message_type: MessageType, edge_node_id: &str) -> Self {
        Self {
            group_id: group_id.into(),
            message_type,
            edge_node_id: edge_node_id.into(),
            device_id: None,
        }
    }

    pub fn device(
        group_id: &str,
        message_type: MessageType,
        edge_node_id: &str,
        device_id: &str,
    ) -> Self {
        Self {
            group_id: group_id.into(),
            message_type,
            edge_node_id: edge_node_id.into(),
            device_id: Some(device_id.into()),
        }
    }

    pub fn state(host_id: &str) -> Self {
        Self {
            group_id: String::new(),
            message_type: MessageType::State,
            edge_node_id: host_id.into(),
            device_id: None,
        }
    }

    /// The host id of a STATE topic.
    pub fn host_id(&self) -> Option<&str> {
        match self.message_type {
            MessageType::State => Some(&self.edge_node_id),
            _ => None,
        }
    }

    pub fn to_topic_string(&self) -> String {
        match (self.message_type, &self.device_id) {
            (MessageType::State, _) => {
                format!("{NAMESPACE}/{STATE}/{}", self.edge_node_id)
            }
            (ty, None) => format!(
                "{NAMESPACE}/{}/{}/{}",
                self.group_id, ty, self.edge_node_id
            ),
            (ty, Some(device)) => format!(
                "{NAMESPACE}/{}/{}/{}/{}",
                self.group_id, ty, self.edge_node_id, device
            ),
        }
    }

    /// Parse a topic string.
    ///
    /// Topics outside the `spBv1.0` namespace return
    /// [`TopicError::NotSparkplug`]; consumers treat that as "drop the
    /// message", not as a fault.
    pub fn parse(topic: &str) -> Result<Topic, TopicError> {
        let mut parts = topic.split('/');

        if parts.next() != Some(NAMESPACE) {
            return Err(TopicError::NotSparkplug);
        }

        let group_or_state = parts
            .next()
            .ok_or(TopicError::InvalidFormat("missing group id"))?;

        if group_or_state == STATE {
            let host_id = parts
                .next()
                .ok_or(TopicError::InvalidFormat("STATE topic requires a host id"))?;
            if parts.next().is_some() {
                return Err(TopicError::InvalidFormat("trailing levels after host id"));
            }
            return Ok(Topic::state(host_id));
        }

        let message_type: MessageType = parts
            .next()
            .ok_or(TopicError::InvalidFormat("missing message type"))?
            .parse()?;
        if message_type == MessageType::State {
            return Err(TopicError::InvalidFormat("STATE must follow the namespace"));
        }

        let edge_node_id = parts
            .next()
            .ok_or(TopicError::InvalidFormat("missing edge node id"))?;

        let device_id = parts.next();
        if parts.next().is_some() {
            return Err(TopicError::InvalidFormat("trailing levels after device id"));
        }

        match (message_type.is_device_message(), device_id) {
            (true, Some(device)) => Ok(Topic::device(
                group_or_state,
                message_type,
                edge_node_id,
                device,
            )),
            (true, None) => Err(TopicError::InvalidFormat(
                "device message requires a device id",
            )),
            (false, Some(_)) => Err(TopicError::InvalidFormat(
                "node message cannot carry a device id",
            )),
            (false, None) => Ok(Topic::node(group_or_state, message_type, edge_node_id)),
        }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_topic_string())
    }
}

/// MQTT quality-of-service levels.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QoS {
    AtMostOnce,
    AtLeastOnce,
    ExactlyOnce,
}

impl QoS {
    pub fn from_u8(qos: u8) -> Option<QoS> {
        match qos {
            0 => Some(QoS::AtMostOnce),
            1 => Some(QoS::AtLeastOnce),
            2 => Some(QoS::ExactlyOnce),
            _ => None,
        }
    }
}

/// Subscription filter for the whole `spBv1.0` namespace.
pub fn namespace_filter() -> String {
    format!("{NAMESPACE}/#")
}

/// Subscription filter for every message of one group.
pub fn group_filter(group_id: &str) -> String {
    format!("{NAMESPACE}/{group_id}/#")
}

/// Subscription filter for every message of one edge node.
pub fn node_filter(group_id: &str, edge_node_id: &str) -> String {
    format!("{NAMESPACE}/{group_id}/+/{edge_node_id}/#")
}

/// Subscription filter for a host's STATE topic.
pub fn state_filter(host_id: &str) -> String {
    format!("{NAMESPACE}/{STATE}/{host_id}")
}

use std::time::Duration;

use spb_types::topic::QoS;

/// Configuration of an [EdgeNode](crate::EdgeNode) session.
///
/// The MQTT connection itself (broker url, client id, credentials, TLS,
/// keep-alive) is configured on the transport; this covers the Sparkplug
/// identity and behaviour.
#[derive(Clone)]
pub struct EdgeNodeConfig {
    pub group_id: String,
    pub edge_node_id: String,
    /// QoS for NBIRTH/NDATA/DBIRTH/DDATA/DDEATH. Sparkplug requires 0.
    pub data_qos: QoS,
    /// QoS for the NDEATH will message. Sparkplug requires 1.
    pub death_qos: QoS,
    /// QoS for outbound NCMD/DCMD publishes.
    pub command_qos: QoS,
    /// Host application whose STATE gates this node's births, if any.
    pub primary_host_id: Option<String>,
    /// How long `connect` waits for the primary host's retained STATE before
    /// returning. Zero means don't wait; births fail until STATE online is
    /// observed.
    pub primary_host_wait: Duration,
}

impl EdgeNodeConfig {
    pub fn new(group_id: impl Into<String>, edge_node_id: impl Into<String>) -> Self {
        Self {
            group_id: group_id.into(),
            edge_node_id: edge_node_id.into(),
            data_qos: QoS::AtMostOnce,
            death_qos: QoS::AtLeastOnce,
            command_qos: QoS::AtMostOnce,
            primary_host_id: None,
            primary_host_wait: Duration::ZERO,
        }
    }

    pub fn with_data_qos(mut self, qos: QoS) -> Self {
        self.data_qos = qos;
        self
    }

    pub fn with_death_qos(mut self, qos: QoS) -> Self {
        self.death_qos = qos;
        self
    }

    pub fn with_command_qos(mut self, qos: QoS) -> Self {
        self.command_qos = qos;
        self
    }

    pub fn with_primary_host(mut self, host_id: impl Into<String>) -> Self {
        self.primary_host_id = Some(host_id.into());
        self
    }

    pub fn with_primary_host_wait(mut self, wait: Duration) -> Self {
        self.primary_host_wait = wait;
        self
    }
}

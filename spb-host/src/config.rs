use spb_types::topic::QoS;

/// Configuration of a [HostApplication](crate::HostApplication) session.
#[derive(Clone)]
pub struct HostApplicationConfig {
    pub host_id: String,
    /// QoS for STATE publishes and namespace subscriptions. Sparkplug
    /// requires 1 for STATE.
    pub qos: QoS,
    /// QoS for outbound NCMD/DCMD publishes.
    pub command_qos: QoS,
    /// Run the consumer validator over inbound messages, logging ordering
    /// and lifecycle violations at WARN.
    pub validate_sequence: bool,
}

impl HostApplicationConfig {
    pub fn new(host_id: impl Into<String>) -> Self {
        Self {
            host_id: host_id.into(),
            qos: QoS::AtLeastOnce,
            command_qos: QoS::AtMostOnce,
            validate_sequence: true,
        }
    }

    pub fn with_qos(mut self, qos: QoS) -> Self {
        self.qos = qos;
        self
    }

    pub fn with_command_qos(mut self, qos: QoS) -> Self {
        self.command_qos = qos;
        self
    }

    pub fn with_validate_sequence(mut self, validate: bool) -> Self {
        self.validate_sequence = validate;
        self
    }
}

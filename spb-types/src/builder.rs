use crate::constants::{
    NODE_CONTROL_NEXT_SERVER, NODE_CONTROL_REBIRTH, NODE_CONTROL_REBOOT, NODE_CONTROL_SCAN_RATE,
};
use crate::payload::{DataType, Metric, Payload};
use crate::traits::HasDataType;
use crate::utils::timestamp;
use crate::MetricValue;

/// Fluent, typed accumulator for a Sparkplug B [`Payload`].
///
/// Datatypes are inferred from the native value type; metric timestamps
/// default to "now". Birth messages use the `with_alias` variants to
/// establish alias bindings, data messages the `by_alias` variants.
///
/// ```
/// use spb_types::PayloadBuilder;
///
/// let bytes = PayloadBuilder::new()
///     .add_metric_with_alias("Temperature", 1, 20.5)
///     .add_metric_with_alias("Active", 2, true)
///     .build();
/// ```
///
/// The session types normally fill in the payload-level `seq` and
/// `timestamp`; `set_seq`/`set_timestamp` exist for tests and specialised
/// flows.
#[derive(Default)]
pub struct PayloadBuilder {
    payload: Payload,
}

impl PayloadBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(
        mut self,
        name: Option<&str>,
        alias: Option<u64>,
        datatype: DataType,
        value: MetricValue,
        timestamp_ms: Option<u64>,
    ) -> Self {
        let mut metric = Metric::new();
        if let Some(name) = name {
            metric.set_name(name.to_string());
        }
        if let Some(alias) = alias {
            metric.set_alias(alias);
        }
        metric
            .set_datatype(datatype)
            .set_timestamp(timestamp_ms.unwrap_or_else(timestamp))
            .set_value(value.into());
        self.payload.metrics.push(metric);
        self
    }

    /// Add a metric by name; datatype inferred, timestamp "now".
    pub fn add_metric<V>(self, name: &str, value: V) -> Self
    where
        V: Into<MetricValue> + HasDataType,
    {
        self.push(Some(name), None, V::default_datatype(), value.into(), None)
    }

    /// Add a metric by name with an explicit timestamp, for backfill.
    pub fn add_metric_at<V>(self, name: &str, value: V, timestamp_ms: u64) -> Self
    where
        V: Into<MetricValue> + HasDataType,
    {
        self.push(
            Some(name),
            None,
            V::default_datatype(),
            value.into(),
            Some(timestamp_ms),
        )
    }

    /// Add a metric carrying both name and alias, establishing the binding.
    pub fn add_metric_with_alias<V>(self, name: &str, alias: u64, value: V) -> Self
    where
        V: Into<MetricValue> + HasDataType,
    {
        self.push(
            Some(name),
            Some(alias),
            V::default_datatype(),
            value.into(),
            None,
        )
    }

    /// [`add_metric_with_alias`](Self::add_metric_with_alias) with an
    /// explicit timestamp.
    pub fn add_metric_with_alias_at<V>(
        self,
        name: &str,
        alias: u64,
        value: V,
        timestamp_ms: u64,
    ) -> Self
    where
        V: Into<MetricValue> + HasDataType,
    {
        self.push(
            Some(name),
            Some(alias),
            V::default_datatype(),
            value.into(),
            Some(timestamp_ms),
        )
    }

    /// Add an alias-only metric, the bandwidth-efficient form for data
    /// updates.
    pub fn add_metric_by_alias<V>(self, alias: u64, value: V) -> Self
    where
        V: Into<MetricValue> + HasDataType,
    {
        self.push(None, Some(alias), V::default_datatype(), value.into(), None)
    }

    /// [`add_metric_by_alias`](Self::add_metric_by_alias) with an explicit
    /// timestamp.
    pub fn add_metric_by_alias_at<V>(self, alias: u64, value: V, timestamp_ms: u64) -> Self
    where
        V: Into<MetricValue> + HasDataType,
    {
        self.push(
            None,
            Some(alias),
            V::default_datatype(),
            value.into(),
            Some(timestamp_ms),
        )
    }

    /// Add a metric with an explicit datatype, for the datatypes that share
    /// a wire representation with a more common one (Text, UUID, DateTime
    /// carried as string/long and so on).
    pub fn add_metric_with_datatype(
        self,
        name: Option<&str>,
        alias: Option<u64>,
        datatype: DataType,
        value: MetricValue,
    ) -> Self {
        self.push(name, alias, datatype, value, None)
    }

    /// Add a metric with a null value.
    pub fn add_null_metric(mut self, name: &str, datatype: DataType) -> Self {
        let mut metric = Metric::new();
        metric
            .set_name(name.to_string())
            .set_datatype(datatype)
            .set_timestamp(timestamp())
            .set_null();
        self.payload.metrics.push(metric);
        self
    }

    pub fn add_node_control_rebirth(self, value: bool) -> Self {
        self.add_metric(NODE_CONTROL_REBIRTH, value)
    }

    pub fn add_node_control_reboot(self, value: bool) -> Self {
        self.add_metric(NODE_CONTROL_REBOOT, value)
    }

    pub fn add_node_control_next_server(self, value: bool) -> Self {
        self.add_metric(NODE_CONTROL_NEXT_SERVER, value)
    }

    pub fn add_node_control_scan_rate(self, value: i64) -> Self {
        self.add_metric(NODE_CONTROL_SCAN_RATE, value)
    }

    /// Payload-level timestamp override. The session fills this in at publish
    /// time when unset.
    pub fn set_timestamp(mut self, timestamp_ms: u64) -> Self {
        self.payload.timestamp = Some(timestamp_ms);
        self
    }

    /// Sequence number override. The session manages the counter in normal
    /// operation.
    pub fn set_seq(mut self, seq: u64) -> Self {
        self.payload.seq = Some(seq);
        self
    }

    pub fn has_seq(&self) -> bool {
        self.payload.seq.is_some()
    }

    pub fn has_timestamp(&self) -> bool {
        self.payload.timestamp.is_some()
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    /// Escape hatch for the rare shapes the typed methods do not cover.
    pub fn payload_mut(&mut self) -> &mut Payload {
        &mut self.payload
    }

    pub fn into_payload(self) -> Payload {
        self.payload
    }

    /// Serialise to the protobuf wire format.
    pub fn build(self) -> Vec<u8> {
        self.payload.into()
    }
}

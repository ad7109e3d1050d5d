use thiserror::Error;

use crate::payload::{metric, DataType};
use crate::traits::HasDataType;

/// Wrapper over the protobuf metric value oneof.
///
/// Native Rust values convert in with `From`; typed values convert back out
/// with `TryFrom`, failing if the wire variant does not match.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricValue(pub metric::Value);

impl MetricValue {
    pub fn new(inner: metric::Value) -> Self {
        Self(inner)
    }
}

impl From<MetricValue> for metric::Value {
    fn from(value: MetricValue) -> Self {
        value.0
    }
}

impl From<metric::Value> for MetricValue {
    fn from(value: metric::Value) -> Self {
        MetricValue(value)
    }
}

/// Milliseconds since the unix epoch, carried in the 64-bit long field.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct DateTime(pub u64);

impl DateTime {
    pub fn new(millis: u64) -> Self {
        Self(millis)
    }
}

#[derive(Debug, Error)]
pub enum FromValueError {
    #[error("value variant does not match the requested type")]
    VariantMismatch,
}

/* Narrow integer types ride in the 32/64-bit protobuf fields using their
two's complement bit pattern, per the Sparkplug encoding rules. */

fn i8_to_proto(val: i8) -> u32 {
    val as u8 as u32
}
fn i16_to_proto(val: i16) -> u32 {
    val as u16 as u32
}
fn i32_to_proto(val: i32) -> u32 {
    val as u32
}
fn i64_to_proto(val: i64) -> u64 {
    val as u64
}

fn proto_to_i8(val: u32) -> i8 {
    val as u8 as i8
}
fn proto_to_i16(val: u32) -> i16 {
    val as u16 as i16
}
fn proto_to_i32(val: u32) -> i32 {
    val as i32
}
fn proto_to_i64(val: u64) -> i64 {
    val as i64
}

macro_rules! impl_metric_value {
    ($type:ty, $datatype:expr, $variant:path, $to_proto:expr, $from_proto:expr) => {
        impl HasDataType for $type {
            fn default_datatype() -> DataType {
                $datatype
            }
        }

        impl From<$type> for MetricValue {
            fn from(value: $type) -> Self {
                MetricValue($variant(($to_proto)(value)))
            }
        }

        impl TryFrom<MetricValue> for $type {
            type Error = FromValueError;

            fn try_from(value: MetricValue) -> Result<Self, Self::Error> {
                if let $variant(v) = value.0 {
                    Ok(($from_proto)(v))
                } else {
                    Err(FromValueError::VariantMismatch)
                }
            }
        }
    };
}

impl_metric_value!(i8, DataType::Int8, metric::Value::IntValue, i8_to_proto, proto_to_i8);
impl_metric_value!(i16, DataType::Int16, metric::Value::IntValue, i16_to_proto, proto_to_i16);
impl_metric_value!(i32, DataType::Int32, metric::Value::IntValue, i32_to_proto, proto_to_i32);
impl_metric_value!(i64, DataType::Int64, metric::Value::LongValue, i64_to_proto, proto_to_i64);
impl_metric_value!(u8, DataType::UInt8, metric::Value::IntValue, u32::from, |v: u32| v as u8);
impl_metric_value!(u16, DataType::UInt16, metric::Value::IntValue, u32::from, |v: u32| v as u16);
impl_metric_value!(u32, DataType::UInt32, metric::Value::IntValue, |v| v, |v| v);
impl_metric_value!(u64, DataType::UInt64, metric::Value::LongValue, |v| v, |v| v);
impl_metric_value!(f32, DataType::Float, metric::Value::FloatValue, |v| v, |v| v);
impl_metric_value!(f64, DataType::Double, metric::Value::DoubleValue, |v| v, |v| v);
impl_metric_value!(bool, DataType::Boolean, metric::Value::BooleanValue, |v| v, |v| v);
impl_metric_value!(
    String,
    DataType::String,
    metric::Value::StringValue,
    |v| v,
    |v| v
);
impl_metric_value!(
    Vec<u8>,
    DataType::Bytes,
    metric::Value::BytesValue,
    |v| v,
    |v| v
);
impl_metric_value!(
    DateTime,
    DataType::DateTime,
    metric::Value::LongValue,
    |v: DateTime| v.0,
    DateTime::new
);

impl HasDataType for &str {
    fn default_datatype() -> DataType {
        DataType::String
    }
}

impl From<&str> for MetricValue {
    fn from(value: &str) -> Self {
        MetricValue(metric::Value::StringValue(value.to_string()))
    }
}

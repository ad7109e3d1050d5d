use crate::payload::DataType;

/// Maps a native Rust type to the Sparkplug datatype it is encoded as.
///
/// Implemented for the scalar types the [`PayloadBuilder`](crate::PayloadBuilder)
/// infers datatypes for. Types that share a wire representation with several
/// datatypes (e.g. `String` for `String`/`Text`/`Uuid`) report their default;
/// the builder's `add_metric_with_datatype` escape hatch covers the rest.
pub trait HasDataType {
    fn default_datatype() -> DataType;
}

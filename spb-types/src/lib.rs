pub mod builder;
pub mod constants;
pub mod payload;
pub mod topic;
pub mod traits;
pub mod utils;
mod value;

pub use builder::PayloadBuilder;
pub use value::*;

/// Identifies a metric either by its full name or by the numeric alias
/// established for it at birth.
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub enum MetricId {
    Name(String),
    Alias(u64),
}

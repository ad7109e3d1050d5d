mod error;
mod traits;
mod types;

pub use error::TransportError;
pub use traits::{DynTransport, Transport};
pub use types::*;

/// A [Transport] implementation based on channels.
///
/// Useful for writing tests where running a real MQTT client against a broker
/// is not appropriate.
pub mod channel;

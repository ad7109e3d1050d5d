//! Sparkplug B session and message-lifecycle engine.
//!
//! Two participant roles sit on top of an MQTT transport:
//!
//! - [`edge::EdgeNode`] publishes telemetry: NBIRTH/NDATA and per-device
//!   DBIRTH/DDATA/DDEATH, with the NDEATH certificate lodged as the MQTT
//!   last will and the message sequence and `bdSeq` counters managed for
//!   you.
//! - [`host::HostApplication`] consumes and commands: STATE lifecycle,
//!   namespace subscriptions, NCMD/DCMD publishing and consumer-side
//!   validation of ordering and birth-before-data invariants.

pub use spb_edge as edge;
pub use spb_host as host;
pub use spb_types as types;

pub mod client {
    pub use spb_client::*;

    #[cfg(feature = "rumqtt")]
    pub mod rumqtt {
        pub use spb_client_rumqtt::*;
    }
}

mod client;

pub use client::RumqttTransport;

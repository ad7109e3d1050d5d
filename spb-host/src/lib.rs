mod app;
mod config;
mod error;
pub mod metrics;
mod validator;

pub use app::{HostApplication, MessageCallback};
pub use config::HostApplicationConfig;
pub use error::Error;
pub use metrics::{MetricBirthDetails, MetricDetails, MetricExtractError};
pub use validator::{Anomaly, DeviceDataState, NodeKey, NodeState, Validator};

mod config;
mod error;
mod node;

pub use config::EdgeNodeConfig;
pub use error::Error;
pub use node::{CommandCallback, EdgeNode};

pub mod connection;
pub mod data_channel;
pub mod signal;
pub mod types;

pub use types::{DataMessage, SdpPayload, ServerConfig};

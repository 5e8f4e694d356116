//! MQTT transport and topic scheme

pub mod topics;
pub mod transport;

pub use topics::{command_filter, filter_matches, state_filter, Topic};
pub use transport::{MessageHandler, MqttTransport};

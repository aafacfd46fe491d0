pub mod config;
pub mod client;
pub mod error;

pub use config::MqttConfig;
pub use client::{MqttEvent, MqttService};
pub use error::MqttError;
pub use rumqttc::QoS;

use std::time::Duration;

use opentb_core::BrokerError;
use rumqttc::ClientError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MqttError {
    #[error("MQTT client error: {0}")]
    Client(#[from] ClientError),
    #[error("broker connection not established within {0:?}")]
    ConnectTimeout(Duration),
    #[error("broker rejected subscription (pkid {0})")]
    SubscribeRejected(u16),
    #[error("MQTT event loop closed")]
    Closed,
    #[error("MQTT client did not shut down within {0:?}")]
    ShutdownTimeout(Duration),
}

impl From<MqttError> for BrokerError {
    fn from(err: MqttError) -> Self {
        match err {
            MqttError::ConnectTimeout(limit) => BrokerError::ConnectTimeout(limit),
            other => BrokerError::Client(other.to_string()),
        }
    }
}

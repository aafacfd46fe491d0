use hostname::get as get_hostname;
use std::env;

pub const DEFAULT_BROKER_HOST: &str = "argus.paris.inria.fr";

#[derive(Debug, Clone)]
pub struct MqttConfig {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub keep_alive_secs: u16,
    pub clean_session: bool,
    pub connect_timeout_secs: u64,
    /// Firmware images travel base64-encoded in a single publish.
    pub max_packet_size: usize,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_BROKER_HOST.to_string(),
            port: 1883,
            client_id: default_client_id(),
            username: None,
            password: None,
            keep_alive_secs: 30,
            clean_session: true,
            connect_timeout_secs: 10,
            max_packet_size: 4 * 1024 * 1024,
        }
    }
}

impl MqttConfig {
    pub fn from_env() -> Self {
        let mut cfg = MqttConfig::default();

        if let Ok(v) = env::var("MQTT_BROKER_HOST") {
            if !v.is_empty() {
                cfg.host = v;
            }
        }
        if let Ok(v) = env::var("MQTT_BROKER_PORT") {
            if let Ok(p) = v.parse::<u16>() {
                cfg.port = p;
            }
        }
        if let Ok(v) = env::var("MQTT_CLIENT_ID") {
            if !v.is_empty() {
                cfg.client_id = v;
            }
        }
        if let Ok(v) = env::var("MQTT_USERNAME") {
            if !v.is_empty() {
                cfg.username = Some(v);
            }
        }
        if let Ok(v) = env::var("MQTT_PASSWORD") {
            if !v.is_empty() {
                cfg.password = Some(v);
            }
        }
        if let Ok(v) = env::var("MQTT_KEEP_ALIVE_SECS") {
            if let Ok(s) = v.parse::<u16>() {
                cfg.keep_alive_secs = s;
            }
        }
        if let Ok(v) = env::var("MQTT_CONNECT_TIMEOUT_SECS") {
            if let Ok(s) = v.parse::<u64>() {
                cfg.connect_timeout_secs = s;
            }
        }

        cfg
    }

    /// Same configuration with a client id suffix, for tools sharing a host.
    pub fn with_client_suffix(mut self, suffix: &str) -> Self {
        self.client_id = format!("{}-{}", self.client_id, suffix);
        self
    }
}

fn default_client_id() -> String {
    let host = get_hostname()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown-host".to_string());
    let pid = std::process::id();
    format!("OpenWSN-{}-{}", host, pid)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_points_at_testbed_broker() {
        let cfg = MqttConfig::default();
        assert_eq!(cfg.host, "argus.paris.inria.fr");
        assert_eq!(cfg.port, 1883);
        assert!(cfg.client_id.starts_with("OpenWSN-"));
        assert!(cfg.max_packet_size >= 1024 * 1024);
    }

    #[test]
    fn client_suffix_is_appended() {
        let cfg = MqttConfig {
            client_id: "OpenWSN".into(),
            ..MqttConfig::default()
        }
        .with_client_suffix("logger");
        assert_eq!(cfg.client_id, "OpenWSN-logger");
    }
}

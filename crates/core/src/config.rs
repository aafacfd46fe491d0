use std::env;
use std::time::Duration;

use crate::topics::DeviceType;

pub const NUMBER_OF_MOTES: usize = 80;
pub const NUMBER_OF_BOXES: usize = 14;
/// Must be larger than the time from publishing a command to receiving its response.
pub const RESPONSE_TIMEOUT_SECS: u64 = 60;
pub const SUBSCRIBE_TIMEOUT_SECS: u64 = 10;

/// Known fleet sizes, used to size "all" runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FleetConfig {
    pub motes: usize,
    pub boxes: usize,
}

impl Default for FleetConfig {
    fn default() -> Self {
        Self {
            motes: NUMBER_OF_MOTES,
            boxes: NUMBER_OF_BOXES,
        }
    }
}

impl FleetConfig {
    pub fn size_of(&self, device_type: DeviceType) -> usize {
        match device_type {
            DeviceType::Mote => self.motes,
            DeviceType::Box => self.boxes,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RunConfig {
    pub fleet: FleetConfig,
    pub response_timeout: Duration,
    pub subscribe_timeout: Duration,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            fleet: FleetConfig::default(),
            response_timeout: Duration::from_secs(RESPONSE_TIMEOUT_SECS),
            subscribe_timeout: Duration::from_secs(SUBSCRIBE_TIMEOUT_SECS),
        }
    }
}

impl RunConfig {
    pub fn from_env() -> Self {
        let mut cfg = RunConfig::default();

        if let Some(n) = env_parse::<usize>("OPENTB_NUMBER_OF_MOTES") {
            cfg.fleet.motes = n;
        }
        if let Some(n) = env_parse::<usize>("OPENTB_NUMBER_OF_BOXES") {
            cfg.fleet.boxes = n;
        }
        if let Some(s) = env_parse::<u64>("OPENTB_RESPONSE_TIMEOUT_SECS") {
            cfg.response_timeout = Duration::from_secs(s);
        }
        if let Some(s) = env_parse::<u64>("OPENTB_SUBSCRIBE_TIMEOUT_SECS") {
            cfg.subscribe_timeout = Duration::from_secs(s);
        }

        cfg
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|v| v.trim().parse::<T>().ok())
}

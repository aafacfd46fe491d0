use std::path::PathBuf;

use clap::{Parser, ValueEnum};
use opentb_core::CommandKind;

use crate::logging::LogLevel;

pub const UDP_INJECT_TOPIC: &str = "opentestbed/uinject/arrived";
pub const LOGFILE_NAME: &str = "udp_inject";

const USAGE_EXAMPLE: &str = "example:

- discover motes 'discovermotes':
    opentb --d otbox15 --cmd discovermotes

- program motes 'program':
    opentb example/main.ihex --b openmote-b --d 00-12-4b-00-14-b5-b4-98
    opentb example/main.ihex --b openmote-b --d all
";

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Board {
    #[value(name = "openmote-b")]
    OpenmoteB,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Cmd {
    Program,
    Discovermotes,
}

impl From<Cmd> for CommandKind {
    fn from(cmd: Cmd) -> Self {
        match cmd {
            Cmd::Program => CommandKind::Program,
            Cmd::Discovermotes => CommandKind::DiscoverMotes,
        }
    }
}

/// Flash a hex to a set of OpenWSN OpenTestbed motes, or discover them.
#[derive(Debug, Parser)]
#[command(name = "opentb", version, after_help = USAGE_EXAMPLE)]
pub struct Args {
    /// Hexfile program to bootload
    pub hexfile: Option<PathBuf>,

    /// Board name (only openmote-b is currently supported)
    #[arg(long, visible_alias = "b", value_enum, default_value_t = Board::OpenmoteB)]
    pub board: Board,

    /// Mote address or otbox id, use "all" for every mote/box
    #[arg(long, visible_alias = "d", num_args = 1.., default_value = "all")]
    pub devices: Vec<String>,

    #[arg(long, value_enum, default_value_t = LogLevel::Info)]
    pub loglevel: LogLevel,

    /// MQTT command to run
    #[arg(long, visible_alias = "c", value_enum, default_value_t = Cmd::Program)]
    pub cmd: Cmd,

    /// MQTT broker host, overrides MQTT_BROKER_HOST
    #[arg(long)]
    pub broker: Option<String>,

    /// MQTT broker port, overrides MQTT_BROKER_PORT
    #[arg(long)]
    pub port: Option<u16>,

    /// Seconds to wait for each response before giving up on the rest
    #[arg(long, value_name = "SECS")]
    pub timeout: Option<u64>,

    /// Also print the report as JSON on stdout
    #[arg(long)]
    pub json: bool,
}

impl Args {
    pub fn validate(&self) -> Result<(), String> {
        if self.cmd == Cmd::Program && self.hexfile.is_none() {
            return Err("a hexfile is required for the 'program' command".to_string());
        }
        if self.timeout == Some(0) {
            return Err("--timeout must be at least one second".to_string());
        }
        Ok(())
    }
}

/// Log OpenTestbed MQTT data to a JSON-lines file.
#[derive(Debug, Parser)]
#[command(name = "opentb-logger", version)]
pub struct LoggerArgs {
    /// Logs directory
    #[arg(default_value = "logs")]
    pub log_directory: PathBuf,

    /// MQTT broker host, overrides MQTT_BROKER_HOST
    #[arg(long, visible_alias = "b")]
    pub broker: Option<String>,

    /// Log file base name
    #[arg(long, visible_alias = "lf", default_value = LOGFILE_NAME)]
    pub logfile: String,

    /// Topic to record
    #[arg(long, default_value = UDP_INJECT_TOPIC)]
    pub topic: String,

    #[arg(long, value_enum, default_value_t = LogLevel::Info)]
    pub loglevel: LogLevel,

    /// Logging time in seconds, 0 means until interrupted
    #[arg(long, visible_alias = "t", default_value_t = 0.0)]
    pub runtime: f64,
}

impl LoggerArgs {
    pub fn validate(&self) -> Result<(), String> {
        if !self.runtime.is_finite() || self.runtime < 0.0 {
            return Err(format!("--runtime must be a non-negative number of seconds, got {}", self.runtime));
        }
        Ok(())
    }
}

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use base64::Engine;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::image::scan_backdoor;
use crate::topics::DeviceType;

/// Request token expected by the box firmware.
pub const TOKEN: u32 = 123;

#[derive(Debug, Error)]
pub enum CommandError {
    #[error("image '{0}' does not enable the bootloader backdoor and cannot be flashed")]
    ImageNotFlashable(String),
    #[error("failed to read image {path:?}: {source}")]
    ImageRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("unknown command '{0}'")]
    UnknownCommand(String),
    #[error("failed to encode payload: {0}")]
    Encode(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommandKind {
    Program,
    DiscoverMotes,
}

impl CommandKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommandKind::Program => "program",
            CommandKind::DiscoverMotes => "discovermotes",
        }
    }

    /// Motes are flashed directly; discovery asks the boxes hosting them.
    pub fn device_type(&self) -> DeviceType {
        match self {
            CommandKind::Program => DeviceType::Mote,
            CommandKind::DiscoverMotes => DeviceType::Box,
        }
    }
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CommandKind {
    type Err = CommandError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "program" => Ok(CommandKind::Program),
            "discovermotes" => Ok(CommandKind::DiscoverMotes),
            other => Err(CommandError::UnknownCommand(other.to_string())),
        }
    }
}

/// Firmware image bytes together with the outcome of the backdoor check.
#[derive(Debug, Clone)]
pub struct FirmwareImage {
    name: String,
    bytes: Vec<u8>,
    flashable: bool,
}

impl FirmwareImage {
    pub fn load(path: &Path) -> Result<Self, CommandError> {
        let bytes = std::fs::read(path).map_err(|source| CommandError::ImageRead {
            path: path.to_path_buf(),
            source,
        })?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.to_string_lossy().into_owned());
        Ok(Self::from_bytes(name, bytes))
    }

    pub fn from_bytes(name: impl Into<String>, bytes: Vec<u8>) -> Self {
        // Non-ASCII content cannot be an Intel HEX image.
        let flashable = scan_backdoor(bytes.as_slice()).unwrap_or(false);
        Self {
            name: name.into(),
            bytes,
            flashable,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_flashable(&self) -> bool {
        self.flashable
    }
}

#[derive(Debug, Clone)]
pub enum Command {
    Program(FirmwareImage),
    DiscoverMotes,
}

#[derive(Serialize)]
struct ProgramRequest<'a> {
    token: u32,
    description: &'a str,
    hex: String,
}

#[derive(Serialize)]
struct DiscoverRequest {
    token: u32,
}

impl Command {
    pub fn kind(&self) -> CommandKind {
        match self {
            Command::Program(_) => CommandKind::Program,
            Command::DiscoverMotes => CommandKind::DiscoverMotes,
        }
    }

    /// JSON body published to `target`.
    pub fn build_payload(&self, target: &str) -> Result<Vec<u8>, CommandError> {
        let payload = match self {
            Command::Program(image) => {
                if !image.is_flashable() {
                    return Err(CommandError::ImageNotFlashable(image.name().to_string()));
                }
                serde_json::to_vec(&ProgramRequest {
                    token: TOKEN,
                    description: image.name(),
                    hex: base64::engine::general_purpose::STANDARD.encode(&image.bytes),
                })?
            }
            Command::DiscoverMotes => serde_json::to_vec(&DiscoverRequest { token: TOKEN })?,
        };
        debug!(device = %target, cmd = %self.kind(), bytes = payload.len(), "Built command payload");
        Ok(payload)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProgramResponse {
    pub success: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DiscoverResponse {
    pub success: bool,
    #[serde(rename = "returnVal", default)]
    pub return_val: Option<DiscoverReturn>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DiscoverReturn {
    #[serde(default)]
    pub motes: Vec<DiscoveredMote>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DiscoveredMote {
    #[serde(rename = "EUI64", default)]
    pub eui64: Option<String>,
    pub serialport: String,
    pub bootload_success: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    const FLASHABLE: &str = ":020000040027D3\n:0CFFD400FFFFFFF6FFFFFFFF00200000E7\n";

    #[test]
    fn program_payload_carries_name_and_base64_image() {
        let command = Command::Program(FirmwareImage::from_bytes("main.ihex", FLASHABLE.as_bytes().to_vec()));
        let body: Value = serde_json::from_slice(&command.build_payload("all").unwrap()).unwrap();
        assert_eq!(body["token"], 123);
        assert_eq!(body["description"], "main.ihex");
        let hex = base64::engine::general_purpose::STANDARD
            .decode(body["hex"].as_str().unwrap())
            .unwrap();
        assert_eq!(hex, FLASHABLE.as_bytes());
    }

    #[test]
    fn program_payload_refuses_unflashable_image() {
        let command = Command::Program(FirmwareImage::from_bytes("bad.ihex", b":00000001FF\n".to_vec()));
        assert!(matches!(
            command.build_payload("dev1"),
            Err(CommandError::ImageNotFlashable(name)) if name == "bad.ihex"
        ));
    }

    #[test]
    fn discover_payload_is_token_only() {
        let body: Value = serde_json::from_slice(&Command::DiscoverMotes.build_payload("otbox01").unwrap()).unwrap();
        assert_eq!(body, serde_json::json!({"token": 123}));
    }

    #[test]
    fn load_uses_base_file_name() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("main.ihex");
        std::fs::write(&path, FLASHABLE).unwrap();
        let image = FirmwareImage::load(&path).unwrap();
        assert_eq!(image.name(), "main.ihex");
        assert!(image.is_flashable());
    }

    #[test]
    fn kind_parses_and_maps_device_type() {
        assert_eq!("discovermotes".parse::<CommandKind>().unwrap(), CommandKind::DiscoverMotes);
        assert!("reset".parse::<CommandKind>().is_err());
        assert_eq!(CommandKind::Program.device_type(), DeviceType::Mote);
        assert_eq!(CommandKind::DiscoverMotes.device_type(), DeviceType::Box);
    }

    #[test]
    fn discover_response_allows_missing_eui64() {
        let resp: DiscoverResponse = serde_json::from_str(
            r#"{"success":true,"returnVal":{"motes":[{"serialport":"/dev/ttyUSB0","bootload_success":false}]}}"#,
        )
        .unwrap();
        let motes = resp.return_val.unwrap().motes;
        assert_eq!(motes.len(), 1);
        assert!(motes[0].eui64.is_none());
    }
}

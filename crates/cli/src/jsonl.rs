//! Append-only JSON-lines recorder for topic data.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use chrono::{Local, Utc};
use serde_json::{json, Value};
use thiserror::Error;

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.6f";
/// Value of the `name` field on every line, whatever the file is called.
pub const EXPERIMENT_NAME: &str = "udp_inject";

#[derive(Debug, Error)]
pub enum JsonlError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("payload is not JSON: {0}")]
    Json(#[from] serde_json::Error),
}

pub struct JsonlLog {
    path: PathBuf,
    file: File,
}

impl JsonlLog {
    /// Creates `<dir>/<base>-<unix ts>.jsonl`, refusing to reuse an existing file.
    pub fn create(dir: &Path, base: &str) -> Result<Self, JsonlError> {
        fs::create_dir_all(dir).map_err(|source| JsonlError::Io {
            path: dir.to_path_buf(),
            source,
        })?;
        let path = dir.join(format!("{}-{}.jsonl", base, Utc::now().timestamp()));
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .map_err(|source| JsonlError::Io {
                path: path.clone(),
                source,
            })?;
        Ok(Self { path, file })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Writes one line for `payload`; nothing is written when it is not JSON.
    pub fn append(&mut self, payload: &[u8]) -> Result<(), JsonlError> {
        let data: Value = serde_json::from_slice(payload)?;
        let line = json!({
            "name": EXPERIMENT_NAME,
            "timestamp": Local::now().format(TIMESTAMP_FORMAT).to_string(),
            "data": data,
        });
        writeln!(self.file, "{}", line).map_err(|source| JsonlError::Io {
            path: self.path.clone(),
            source,
        })
    }
}

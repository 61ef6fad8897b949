// Copyright (C) 2019-2021  Pierre Krieger
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

//! Runtime configuration loaded from `app-config.json`.

use crate::error::DriverError;
use serde::Deserialize;
use std::path::{Path, PathBuf};

fn default_priority() -> u8 {
    0
}

fn default_max_retries() -> u32 {
    3
}

fn default_compression_enabled() -> bool {
    true
}

fn default_cmd_response_timeout_ms() -> u64 {
    1000
}

fn default_serial_device() -> String {
    "/dev/ttyUSB0".to_string()
}

fn default_recording_enabled() -> bool {
    false
}

#[derive(Debug, Clone, Deserialize)]
pub struct DriverConfig {
    #[serde(default = "default_priority")]
    pub default_priority: u8,
    #[serde(default = "default_max_retries")]
    pub default_max_retries: u32,
    #[serde(default = "default_compression_enabled")]
    pub compression_enabled: bool,
    #[serde(default = "default_cmd_response_timeout_ms")]
    pub cmd_response_timeout_ms: u64,
    #[serde(default = "default_serial_device")]
    pub serial_device: String,
    #[serde(default = "default_recording_enabled")]
    pub recording_enabled: bool,
    #[serde(default)]
    pub recording_file: Option<PathBuf>,
}

impl Default for DriverConfig {
    fn default() -> Self {
        DriverConfig {
            default_priority: default_priority(),
            default_max_retries: default_max_retries(),
            compression_enabled: default_compression_enabled(),
            cmd_response_timeout_ms: default_cmd_response_timeout_ms(),
            serial_device: default_serial_device(),
            recording_enabled: default_recording_enabled(),
            recording_file: None,
        }
    }
}

impl DriverConfig {
    /// Loads and parses `app-config.json` at `path`. A missing or malformed file is a typed
    /// startup error, never a panic.
    pub fn load(path: &Path) -> Result<Self, DriverError> {
        let contents = std::fs::read_to_string(path).map_err(|source| DriverError::ConfigRead {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&contents).map_err(|source| DriverError::ConfigParse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// The file path to duplicate raw inbound lines into, if recording is enabled and a path was
    /// given (falls back to `recording.log` next to the config when enabled without a path).
    pub fn recording_path(&self) -> Option<PathBuf> {
        if !self.recording_enabled {
            return None;
        }
        Some(
            self.recording_file
                .clone()
                .unwrap_or_else(|| PathBuf::from("recording.log")),
        )
    }
}

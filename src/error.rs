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

//! Error types returned at the driver's fallible boundaries.

use std::path::PathBuf;

/// Anything that can make the driver fail to start or to keep running.
#[derive(Debug, thiserror::Error)]
pub enum DriverError {
    #[error("failed to read configuration file {path:?}: {source}")]
    ConfigRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse configuration file {path:?}: {source}")]
    ConfigParse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to open serial port {device:?}: {source}")]
    PortOpen {
        device: String,
        #[source]
        source: serialport::Error,
    },

    #[error("failed to open recording file {path:?}: {source}")]
    RecordingOpen {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("driver already started")]
    AlreadyStarted,

    #[error("driver not started")]
    NotStarted,
}

/// Narrower errors produced while parsing a single wire message.
#[derive(Debug, thiserror::Error, PartialEq, Eq, Clone)]
pub enum MessageError {
    #[error("line is too short to contain a command digit")]
    Empty,

    #[error("command checksum mismatch")]
    ChecksumMismatch,

    #[error("odd number of hex nibbles in message body")]
    OddLength,

    #[error("invalid hex digit in message body")]
    InvalidHex,

    #[error("value width {0} bytes is not supported (only 1, 2 and 4 are)")]
    UnsupportedWidth(usize),
}

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

//! Owns the serial port and turns its byte stream into discrete CR-LF-delimited lines, the way
//! `kernel/hosted-tcp` turns a `TcpStream`'s byte stream into framed messages for its owning task.

use crate::error::DriverError;
use futures::channel::mpsc;
use futures::prelude::*;
use std::io::{Read, Write};
use std::path::PathBuf;
use std::time::Duration;

/// One CR-LF-delimited fragment of the wire stream, handed to the protocol engine.
#[derive(Debug, Clone)]
pub struct Line {
    pub content: Vec<u8>,
}

/// A framed command ready to go out over the wire, handed from the engine to the transport.
#[derive(Debug, Clone)]
pub struct OutboundFrame {
    pub bytes: Vec<u8>,
}

/// The two channel endpoints the engine holds to talk to the background transport task.
pub struct TransportHandle {
    pub lines: mpsc::UnboundedReceiver<Line>,
    pub outbound: mpsc::UnboundedSender<OutboundFrame>,
}

const BAUD_RATE: u32 = 19200;
const READ_TIMEOUT: Duration = Duration::from_millis(200);

/// Opens the serial device and spawns the background reader/writer task. Returns immediately;
/// the returned handle is how the engine exchanges lines and outbound frames with it.
pub fn spawn(
    device: &str,
    recording_file: Option<PathBuf>,
) -> Result<TransportHandle, DriverError> {
    let port = serialport::new(device, BAUD_RATE)
        .data_bits(serialport::DataBits::Eight)
        .parity(serialport::Parity::None)
        .stop_bits(serialport::StopBits::One)
        .timeout(READ_TIMEOUT)
        .open()
        .map_err(|source| DriverError::PortOpen {
            device: device.to_string(),
            source,
        })?;

    let mut recorder = match recording_file {
        Some(path) => Some(
            std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .map_err(|source| DriverError::RecordingOpen { path, source })?,
        ),
        None => None,
    };

    let (line_tx, line_rx) = mpsc::unbounded();
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded::<OutboundFrame>();

    let mut reader = port
        .try_clone()
        .expect("serial port handles are clonable on every supported platform");
    let mut writer = port;

    async_std::task::spawn_blocking(move || {
        let mut buffer: Vec<u8> = Vec::new();
        let mut read_buf = [0u8; 512];
        let mut operational = false;

        loop {
            match reader.read(&mut read_buf) {
                Ok(0) => continue,
                Ok(n) => buffer.extend_from_slice(&read_buf[..n]),
                Err(e) if e.kind() == std::io::ErrorKind::TimedOut => continue,
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => continue,
                Err(e) => {
                    log::error!("serial read error: {}", e);
                    return;
                }
            }

            while let Some(boundary) = find_crlf(&buffer) {
                let fragment: Vec<u8> = buffer.drain(..boundary).collect();
                buffer.drain(..2); // drop the \r\n itself

                if !operational {
                    // The first boundary-delimited fragment may be a partial frame left over from
                    // before the driver started listening; discard it and start counting frames
                    // from the next boundary.
                    operational = true;
                    continue;
                }

                if let Some(file) = recorder.as_mut() {
                    let _ = file.write_all(&fragment);
                    let _ = file.write_all(b"\n");
                }

                if line_tx.unbounded_send(Line { content: fragment }).is_err() {
                    return; // engine side dropped, nothing left to do
                }
            }

            while let Ok(Some(frame)) = outbound_rx.try_next() {
                if let Err(e) = writer.write_all(&frame.bytes) {
                    log::error!("serial write error: {}", e);
                }
            }
        }
    });

    Ok(TransportHandle {
        lines: line_rx,
        outbound: outbound_tx,
    })
}

fn find_crlf(buffer: &[u8]) -> Option<usize> {
    buffer.windows(2).position(|w| w == b"\r\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn find_crlf_locates_first_boundary() {
        assert_eq!(find_crlf(b"abc\r\ndef"), Some(3));
        assert_eq!(find_crlf(b"no boundary here"), None);
    }

    #[test]
    fn find_crlf_ignores_lone_cr_or_lf() {
        assert_eq!(find_crlf(b"a\rb\nc\r\nd"), Some(5));
    }
}

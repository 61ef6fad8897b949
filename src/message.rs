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

//! The HEX register protocol's message model: the command digit vocabulary, the big-endian /
//! little-endian byte swap, and the `Message`/`Command`/`Response` triad.

use crate::checksum::{self, hex_to_bytes};
use crate::error::MessageError;

/// One of the seven command digits the device accepts on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandKind {
    Ping,
    Version,
    ProductId,
    Restart,
    Get,
    Set,
    /// Unreliable on the tested firmware (see design notes); supported on the wire but never
    /// reached from the facade.
    AsyncSet,
}

impl CommandKind {
    pub fn digit(self) -> char {
        match self {
            CommandKind::Ping => '1',
            CommandKind::Version => '3',
            CommandKind::ProductId => '4',
            CommandKind::Restart => '6',
            CommandKind::Get => '7',
            CommandKind::Set => '8',
            CommandKind::AsyncSet => 'A',
        }
    }

    pub fn from_digit(c: char) -> Option<Self> {
        match c.to_ascii_uppercase() {
            '1' => Some(CommandKind::Ping),
            '3' => Some(CommandKind::Version),
            '4' => Some(CommandKind::ProductId),
            '6' => Some(CommandKind::Restart),
            '7' => Some(CommandKind::Get),
            '8' => Some(CommandKind::Set),
            'A' => Some(CommandKind::AsyncSet),
            _ => None,
        }
    }

    /// Addressed commands carry a 16-bit register address and a value field on the wire.
    pub fn is_addressed(self) -> bool {
        matches!(
            self,
            CommandKind::Get | CommandKind::Set | CommandKind::AsyncSet
        )
    }
}

/// Device-reported response status byte.
pub mod state {
    pub const OK: u8 = 0;
    pub const UNKNOWN_ID: u8 = 1;
    pub const NOT_SUPPORTED: u8 = 2;
    pub const PARAMETER_ERROR: u8 = 4;
}

/// Reverses a byte array to convert between the wire's little-endian encoding and the driver's
/// big-endian internal representation. The operation is its own inverse, so the same function is
/// used on ingress and egress.
pub fn swap_bytes(bytes: &[u8]) -> Result<Vec<u8>, MessageError> {
    match bytes.len() {
        1 | 2 | 4 => {
            let mut out = bytes.to_vec();
            out.reverse();
            Ok(out)
        }
        n => Err(MessageError::UnsupportedWidth(n)),
    }
}

pub fn bytes_to_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02X}", b)).collect()
}

/// Abstract record shared by outbound commands and inbound responses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub command: CommandKind,
    pub address: Option<u16>,
    pub state: Option<u8>,
    /// Internal (big-endian) bytes of the value field, already un-swapped from the wire.
    pub value: Option<Vec<u8>>,
}

impl Message {
    /// The key used to correlate a response with the command that caused it: the command digit
    /// alone for non-addressed commands, or the command digit followed by the swapped-address
    /// hex (4 characters) for addressed ones.
    pub fn identifier(&self) -> String {
        match self.address {
            Some(addr) if self.command.is_addressed() => {
                // swap_bytes never fails on a 2-byte input.
                let swapped = swap_bytes(&addr.to_be_bytes()).expect("2-byte swap is total");
                format!("{}{}", self.command.digit(), bytes_to_hex(&swapped))
            }
            _ => self.command.digit().to_string(),
        }
    }
}

/// A [`Message`] prepared for transmission: framed, checksummed, and carrying queue metadata.
#[derive(Debug, Clone)]
pub struct Command {
    pub message: Message,
    pub priority: u8,
    pub max_retries: u32,
    /// The fully framed wire string, e.g. `:7ED8D00<XX>\n` where `<XX>` is the two-digit
    /// checksum.
    pub wire: String,
}

impl Command {
    pub fn new(message: Message, priority: u8, max_retries: u32) -> Result<Self, MessageError> {
        let body = Self::body_hex(&message)?;
        let framed = checksum::append(&body)?;
        let wire = format!(":{}\n", framed);
        Ok(Command {
            message,
            priority,
            max_retries,
            wire,
        })
    }

    /// A convenience constructor for `ping` / `version` / `productId` / `restart`, which carry no
    /// address or value.
    pub fn bare(command: CommandKind, priority: u8, max_retries: u32) -> Result<Self, MessageError> {
        debug_assert!(!command.is_addressed());
        Command::new(
            Message {
                command,
                address: None,
                state: None,
                value: None,
            },
            priority,
            max_retries,
        )
    }

    pub fn get(address: u16, priority: u8, max_retries: u32) -> Result<Self, MessageError> {
        Command::new(
            Message {
                command: CommandKind::Get,
                address: Some(address),
                state: None,
                value: None,
            },
            priority,
            max_retries,
        )
    }

    pub fn set(
        address: u16,
        value: Vec<u8>,
        priority: u8,
        max_retries: u32,
    ) -> Result<Self, MessageError> {
        Command::new(
            Message {
                command: CommandKind::Set,
                address: Some(address),
                state: None,
                value: Some(value),
            },
            priority,
            max_retries,
        )
    }

    pub fn identifier(&self) -> String {
        self.message.identifier()
    }

    fn body_hex(message: &Message) -> Result<String, MessageError> {
        let mut s = String::new();
        s.push(message.command.digit());
        if message.command.is_addressed() {
            let addr = message.address.unwrap_or(0);
            let swapped_addr = swap_bytes(&addr.to_be_bytes())?;
            s.push_str(&bytes_to_hex(&swapped_addr));
            s.push_str("00"); // status byte: 00 marks an outgoing message
            if let Some(value) = &message.value {
                let swapped_value = swap_bytes(value)?;
                s.push_str(&bytes_to_hex(&swapped_value));
            }
        }
        Ok(s)
    }
}

/// A [`Message`] parsed from a received fragment of the wire stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub message: Message,
}

impl Response {
    /// Parses one response fragment: a command digit, an optional address, a state byte, an
    /// optional value, and a trailing two-digit checksum. `fragment` must already have its
    /// leading `:` and trailing `\n` stripped (this is how fragments arrive out of the `Checksum`
    /// line splitter, see the protocol engine).
    pub fn parse(fragment: &str) -> Result<Self, MessageError> {
        if fragment.is_empty() {
            return Err(MessageError::Empty);
        }
        checksum::verify(fragment)?;

        let mut chars = fragment.chars();
        let digit = chars.next().ok_or(MessageError::Empty)?;
        let command = CommandKind::from_digit(digit).ok_or(MessageError::InvalidHex)?;
        let rest: String = chars.collect();
        if rest.len() < 2 {
            return Err(MessageError::OddLength);
        }
        // The last two hex digits are the checksum; they carry no payload information once
        // verified above.
        let (payload, _checksum_digits) = rest.split_at(rest.len() - 2);

        let (address, payload) = if command.is_addressed() {
            if payload.len() < 6 {
                return Err(MessageError::OddLength);
            }
            let (addr_hex, remainder) = payload.split_at(4);
            let wire_addr_bytes = hex_to_bytes(addr_hex)?;
            let internal_addr_bytes = swap_bytes(&wire_addr_bytes)?;
            let addr = u16::from_be_bytes([internal_addr_bytes[0], internal_addr_bytes[1]]);
            (Some(addr), remainder)
        } else {
            (None, payload)
        };

        if payload.len() < 2 {
            return Err(MessageError::OddLength);
        }
        let (state_hex, value_hex) = payload.split_at(2);
        let state = hex_to_bytes(state_hex)?[0];
        let value = if value_hex.is_empty() {
            None
        } else {
            let wire_bytes = hex_to_bytes(value_hex)?;
            Some(swap_bytes(&wire_bytes)?)
        };

        Ok(Response {
            message: Message {
                command,
                address,
                state: Some(state),
                value,
            },
        })
    }

    pub fn identifier(&self) -> String {
        self.message.identifier()
    }

    pub fn is_ok(&self) -> bool {
        self.message.state == Some(state::OK)
    }

    pub fn is_unknown_id(&self) -> bool {
        self.message.state == Some(state::UNKNOWN_ID)
    }

    pub fn is_not_supported(&self) -> bool {
        self.message.state == Some(state::NOT_SUPPORTED)
    }

    pub fn is_parameter_error(&self) -> bool {
        self.message.state == Some(state::PARAMETER_ERROR)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn s1_endian_swap() {
        assert_eq!(swap_bytes(&[0x0B, 0xCD]).unwrap(), vec![0xCD, 0x0B]);
        assert_eq!(swap_bytes(&[0x12, 0x34]).unwrap(), vec![0x34, 0x12]);
    }

    #[test]
    fn property_swap_is_involutive() {
        for bytes in [&[0x12u8, 0x34][..], &[0x01, 0x02, 0x03, 0x04][..]] {
            let once = swap_bytes(bytes).unwrap();
            let twice = swap_bytes(&once).unwrap();
            assert_eq!(twice, bytes);
        }
    }

    #[test]
    fn swap_rejects_unsupported_widths() {
        assert_eq!(swap_bytes(&[1, 2, 3]), Err(MessageError::UnsupportedWidth(3)));
    }

    #[test]
    fn non_addressed_identifier_is_bare_digit() {
        let cmd = Command::bare(CommandKind::Ping, 1, 3).unwrap();
        assert_eq!(cmd.identifier(), "1");
    }

    #[test]
    fn addressed_identifier_is_five_chars() {
        let cmd = Command::get(0x0FFF, 1, 3).unwrap();
        assert_eq!(cmd.identifier().len(), 5);
        assert!(cmd.identifier().starts_with('7'));
    }

    #[test]
    fn s5_response_correlation_parses_soc_get_response() {
        // :7FF0F00HHHHCC\n with HHHH = 0x4403 little-endian (value 0x0344 = 836) and a real
        // checksum appended.
        let body = format!("7{}00{}", "FF0F", "4403");
        let framed = checksum::append(&body).unwrap();
        let response = Response::parse(&framed).unwrap();
        assert_eq!(response.message.command, CommandKind::Get);
        assert_eq!(response.message.address, Some(0x0FFF));
        assert!(response.is_ok());
        assert_eq!(response.message.value, Some(vec![0x03, 0x44]));
    }

    #[test]
    fn response_with_bad_checksum_is_rejected() {
        let mut framed = checksum::append("7FF0F004403").unwrap();
        framed.pop();
        framed.push('9');
        assert_eq!(Response::parse(&framed), Err(MessageError::ChecksumMismatch));
    }

    #[test]
    fn bare_response_roundtrip() {
        let framed = checksum::append("400").unwrap(); // productId ack, state OK, no value
        let response = Response::parse(&framed).unwrap();
        assert_eq!(response.message.command, CommandKind::ProductId);
        assert_eq!(response.message.address, None);
        assert!(response.is_ok());
        assert_eq!(response.message.value, None);
    }
}

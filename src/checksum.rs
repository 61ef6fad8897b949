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

//! The two checksum disciplines used on the wire: a running byte-sum check over whole telemetry
//! frames, and a nibble-weighted complement check over individual command/response bodies.

use crate::error::MessageError;

/// Accumulates the byte sum of one telemetry frame.
///
/// Every byte that the device considered part of the frame must be fed here, in order, including
/// the `\r\n` pairs that the line reader strips to find line boundaries. A frame is valid once
/// [`TelemetryChecksum::is_valid`] returns `true` right after the checksum byte itself has been
/// fed.
#[derive(Debug, Default, Clone, Copy)]
pub struct TelemetryChecksum {
    total: u8,
    fed_any: bool,
}

impl TelemetryChecksum {
    pub fn new() -> Self {
        TelemetryChecksum::default()
    }

    /// Feeds raw bytes into the running sum.
    pub fn feed(&mut self, bytes: &[u8]) {
        for &b in bytes {
            self.total = self.total.wrapping_add(b);
            self.fed_any = true;
        }
    }

    /// `true` iff the bytes fed since the last reset sum to zero mod 256.
    ///
    /// An accumulator that has not been fed anything is not considered valid: a frame must
    /// contain at least its `Checksum` byte.
    pub fn is_valid(&self) -> bool {
        self.fed_any && self.total == 0
    }

    /// Resets the accumulator, as done at the end of every frame (valid or not).
    pub fn reset(&mut self) {
        self.total = 0;
        self.fed_any = false;
    }

    /// `true` iff nothing has been fed since the last reset — i.e. we are at a frame boundary.
    pub fn is_empty(&self) -> bool {
        !self.fed_any
    }
}

/// Computes and verifies the nibble-weighted checksum used by the HEX command/response protocol.
///
/// The command digit occupies a single nibble, so the body is always an odd number of hex
/// characters; it is implicitly prefixed with a leading `0` nibble (the convention this device
/// family uses) before being chunked into bytes. The checksum byte is `(0x55 - sum(bytes)) mod
/// 256`, appended as two uppercase hex digits.
pub fn compute(body_hex: &str) -> Result<u8, MessageError> {
    let bytes = hex_to_bytes(&pad_odd(body_hex))?;
    let sum: u8 = bytes.iter().fold(0u8, |acc, &b| acc.wrapping_add(b));
    Ok(0x55u8.wrapping_sub(sum))
}

/// Appends the computed checksum (as two uppercase hex digits) to `body_hex`.
pub fn append(body_hex: &str) -> Result<String, MessageError> {
    let checksum = compute(body_hex)?;
    Ok(format!("{}{:02X}", body_hex, checksum))
}

/// Verifies that `framed_hex` (body + two trailing checksum digits) sums to `0x55` mod 256.
pub fn verify(framed_hex: &str) -> Result<(), MessageError> {
    let bytes = hex_to_bytes(&pad_odd(framed_hex))?;
    let sum: u8 = bytes.iter().fold(0u8, |acc, &b| acc.wrapping_add(b));
    if sum == 0x55 {
        Ok(())
    } else {
        Err(MessageError::ChecksumMismatch)
    }
}

fn pad_odd(hex: &str) -> String {
    if hex.len() % 2 == 1 {
        format!("0{}", hex)
    } else {
        hex.to_string()
    }
}

pub(crate) fn hex_to_bytes(hex: &str) -> Result<Vec<u8>, MessageError> {
    if hex.len() % 2 != 0 {
        return Err(MessageError::OddLength);
    }
    let mut out = Vec::with_capacity(hex.len() / 2);
    let chars: Vec<char> = hex.chars().collect();
    for pair in chars.chunks(2) {
        let hi = pair[0].to_digit(16).ok_or(MessageError::InvalidHex)?;
        let lo = pair[1].to_digit(16).ok_or(MessageError::InvalidHex)?;
        out.push(((hi << 4) | lo) as u8);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn telemetry_checksum_detects_zero_sum() {
        let mut cs = TelemetryChecksum::new();
        cs.feed(&[0x01, 0x02, 0xFD]); // sums to 0x100 -> 0 mod 256
        assert!(cs.is_valid());
    }

    #[test]
    fn telemetry_checksum_detects_nonzero_sum() {
        let mut cs = TelemetryChecksum::new();
        cs.feed(&[0x01, 0x02, 0xFE]);
        assert!(!cs.is_valid());
    }

    #[test]
    fn telemetry_checksum_resets() {
        let mut cs = TelemetryChecksum::new();
        cs.feed(&[0x01]);
        cs.reset();
        assert!(cs.is_empty());
        assert!(!cs.is_valid());
    }

    #[test]
    fn s2_command_checksum_scenario() {
        // Body `7ED8D00` (get address 0xED8D, status 00): the appended checksum must make the
        // whole frame (including the implicit leading pad nibble) sum to 0x55 mod 256.
        let framed = append("7ED8D00").unwrap();
        assert_eq!(framed.len(), "7ED8D00".len() + 2);
        verify(&framed).unwrap();
    }

    #[test]
    fn property_constructed_checksum_sums_to_0x55() {
        for body in ["1", "3", "4", "6", "700000000", "800000012300"] {
            let framed = append(body).unwrap();
            verify(&framed).unwrap();
        }
    }

    #[test]
    fn verify_rejects_tampered_checksum() {
        let mut framed = append("7ED8D00").unwrap();
        framed.pop();
        framed.push('0'); // corrupt the last nibble
        assert_eq!(verify(&framed), Err(MessageError::ChecksumMismatch));
    }
}

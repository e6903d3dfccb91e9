// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Encode/decode for the framed command/response protocol spoken between the
//! host and the debug bridge.
//!
//! A frame is a single header byte followed by zero or more payload bytes,
//! whose count is entirely determined by the header (there is no separate
//! length field). All multi-byte integers on the wire are big-endian. This
//! module is pure — no I/O — so it can be tested against the round-trip and
//! size-code properties on their own, without a transport.
//!
//! ## Header byte layout (bit 7 = MSB)
//!
//! ```text
//! [7]     interface: 1 = MASTER, 0 = SLAVE
//! [6:4]   payload-size code (see `size_code_for_payload_len`)
//! [3]     direction: 1 = WRITE, 0 = READ
//! [2]     autoinc flag
//! [1:0]   width code: raw width >> 1
//! ```

#![forbid(unsafe_code)]

use std::fmt;

/// Which side of the FIFO a frame belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interface {
    /// Host-initiated request/response channel, strictly FIFO-ordered.
    Master,
    /// Bridge-initiated asynchronous notifications (target IRQs, etc).
    Slave,
}

/// Read or write, for a master command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Read,
    Write,
}

/// Register/memory transfer width, in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Width {
    One = 1,
    Two = 2,
    Four = 4,
}

impl Width {
    /// The 2-bit width code embedded in the header (`raw_width >> 1`).
    pub fn code(self) -> u8 {
        (self as u8) >> 1
    }

    /// Recover a `Width` from a header's 2-bit width code.
    pub fn from_code(code: u8) -> Option<Self> {
        match code & 0x3 {
            0 => Some(Width::One),
            1 => Some(Width::Two),
            2 => Some(Width::Four),
            _ => None,
        }
    }

    pub fn bytes(self) -> usize {
        self as usize
    }
}

const IFACE_MASTER: u8 = 1 << 7;
const DIR_WRITE: u8 = 1 << 3;
const AUTOINC: u8 = 1 << 2;
const PAYLOAD_SHIFT: u8 = 4;
const PAYLOAD_MASK: u8 = 0x7;

/// Maps a payload byte count to its 3-bit size code and back, per the table
/// in the wire protocol: `{0,1,2,4,5,6,8,16}` <-> `{0..=7}`.
pub fn size_code_for_payload_len(len: u8) -> Option<u8> {
    match len {
        0 => Some(0),
        1 => Some(1),
        2 => Some(2),
        4 => Some(3),
        5 => Some(4),
        6 => Some(5),
        8 => Some(6),
        16 => Some(7),
        _ => None,
    }
}

/// Inverse of [`size_code_for_payload_len`].
pub fn payload_len_for_size_code(code: u8) -> u8 {
    match code & PAYLOAD_MASK {
        0 => 0,
        1 => 1,
        2 => 2,
        3 => 4,
        4 => 5,
        5 => 6,
        6 => 8,
        7 => 16,
        _ => unreachable!("masked to 3 bits"),
    }
}

/// A decoded header byte, with typed accessors for each bitfield.
///
/// Kept as a newtype over the raw byte (rather than fully unpacked fields) so
/// a caller that only needs the payload length — the reader thread's hot path
/// — doesn't have to pay for decoding fields it won't use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandHeader(pub u8);

impl CommandHeader {
    pub fn interface(self) -> Interface {
        if self.0 & IFACE_MASTER != 0 {
            Interface::Master
        } else {
            Interface::Slave
        }
    }

    pub fn direction(self) -> Direction {
        if self.0 & DIR_WRITE != 0 {
            Direction::Write
        } else {
            Direction::Read
        }
    }

    pub fn autoinc(self) -> bool {
        self.0 & AUTOINC != 0
    }

    pub fn width(self) -> Option<Width> {
        Width::from_code(self.0 & 0x3)
    }

    /// Number of payload bytes that follow this header on the wire.
    pub fn payload_len(self) -> u8 {
        payload_len_for_size_code((self.0 >> PAYLOAD_SHIFT) & PAYLOAD_MASK)
    }

    /// Whether the status bit (bit 0 of a *response* header) indicates error.
    ///
    /// Only meaningful when this byte is the first byte of a response frame,
    /// not a command header -- kept here since it's the same byte position
    /// convention (`bit 0`) used throughout the response decoding path.
    pub fn response_is_error(self) -> bool {
        self.0 & 1 != 0
    }
}

/// Builds the single header byte for a master command.
///
/// `payload_len` must be one of the supported sizes (`{0,1,2,4,5,6,8,16}`);
/// callers in this crate always pass one of `4` (address), `0`/`width`
/// (auto-incrementing follow-on command), or `4 + width` (address + data for
/// a first write).
pub fn encode_header(
    interface: Interface,
    direction: Direction,
    autoinc: bool,
    width: Width,
    payload_len: u8,
) -> CommandHeader {
    let size_code = size_code_for_payload_len(payload_len)
        .expect("payload_len must be one of the protocol's supported sizes");
    let mut b = 0u8;
    if matches!(interface, Interface::Master) {
        b |= IFACE_MASTER;
    }
    b |= size_code << PAYLOAD_SHIFT;
    if matches!(direction, Direction::Write) {
        b |= DIR_WRITE;
    }
    if autoinc {
        b |= AUTOINC;
    }
    b |= width.code();
    CommandHeader(b)
}

/// A single master read/write command, as seen by [`encode_header`]'s
/// callers. `address` is only meaningful (and only present on the wire) for
/// the first command of a burst.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Command {
    pub direction: Direction,
    pub autoinc: bool,
    pub width: Width,
    /// `Some` for the first command in a burst (address-bearing), `None` for
    /// the auto-incrementing follow-ons.
    pub address: Option<u32>,
    /// Data to write; only present for `Direction::Write`.
    pub data: Option<u32>,
}

impl Command {
    /// Serializes this command as header byte + big-endian payload bytes.
    ///
    /// Output length is `1 + payload_len`, matching §4.3/§4.4's sizing rules:
    /// a first read is `1 + 4` (address), a first write `1 + 4 + width`, and
    /// an auto-incrementing follow-on is `1` (read) or `1 + width` (write).
    pub fn encode(self, out: &mut Vec<u8>) {
        let mut payload_len = 0u8;
        if self.address.is_some() {
            payload_len += 4;
        }
        if matches!(self.direction, Direction::Write) {
            payload_len += self.width.bytes() as u8;
        }
        let header = encode_header(
            Interface::Master,
            self.direction,
            self.autoinc,
            self.width,
            payload_len,
        );
        out.push(header.0);
        if let Some(addr) = self.address {
            out.extend_from_slice(&addr.to_be_bytes());
        }
        if let (Direction::Write, Some(data)) = (self.direction, self.data) {
            match self.width {
                Width::One => out.push(data as u8),
                Width::Two => out.extend_from_slice(&(data as u16).to_be_bytes()),
                Width::Four => out.extend_from_slice(&data.to_be_bytes()),
            }
        }
    }

    /// Number of response bytes expected for this one command: `width + 1`
    /// for a read, `1` for a write.
    pub fn expected_response_len(self) -> usize {
        match self.direction {
            Direction::Read => self.width.bytes() + 1,
            Direction::Write => 1,
        }
    }
}

/// A decoded master response: either a `width`-byte datum (read) or a bare
/// ack byte (write), both prefixed on the wire by a status byte whose bit 0
/// signals error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusError;

impl fmt::Display for StatusError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "response status byte indicated a device-side error")
    }
}

impl std::error::Error for StatusError {}

/// Decodes one `(1 + width)`-byte read response frame, converting the
/// big-endian datum to host-endian. Returns `Err(StatusError)` if the status
/// byte's bit 0 was set.
pub fn decode_read_response(width: Width, frame: &[u8]) -> Result<u32, StatusError> {
    debug_assert_eq!(frame.len(), width.bytes() + 1);
    if frame[0] & 1 != 0 {
        return Err(StatusError);
    }
    let datum = &frame[1..];
    Ok(match width {
        Width::One => datum[0] as u32,
        Width::Two => u16::from_be_bytes([datum[0], datum[1]]) as u32,
        Width::Four => u32::from_be_bytes([datum[0], datum[1], datum[2], datum[3]]),
    })
}

/// Decodes one 1-byte write-ack response. Returns `Err(StatusError)` if the
/// status byte's bit 0 was set.
pub fn decode_write_response(byte: u8) -> Result<(), StatusError> {
    if byte & 1 != 0 {
        Err(StatusError)
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn size_code_table_round_trips() {
        for code in 0..=7u8 {
            let len = payload_len_for_size_code(code);
            assert_eq!(size_code_for_payload_len(len), Some(code));
        }
    }

    #[test]
    fn header_bitfields_round_trip() {
        let h = encode_header(
            Interface::Master,
            Direction::Write,
            true,
            Width::Two,
            2,
        );
        assert_eq!(h.interface(), Interface::Master);
        assert_eq!(h.direction(), Direction::Write);
        assert!(h.autoinc());
        assert_eq!(h.width(), Some(Width::Two));
        assert_eq!(h.payload_len(), 2);
    }

    #[test]
    fn first_read_command_encodes_address_only() {
        let cmd = Command {
            direction: Direction::Read,
            autoinc: false,
            width: Width::Four,
            address: Some(0x2000_0000),
            data: None,
        };
        let mut buf = Vec::new();
        cmd.encode(&mut buf);
        assert_eq!(buf.len(), 5);
        assert_eq!(CommandHeader(buf[0]).payload_len(), 4);
        assert_eq!(cmd.expected_response_len(), 5);
    }

    #[test]
    fn autoinc_write_encodes_data_only() {
        let cmd = Command {
            direction: Direction::Write,
            autoinc: true,
            width: Width::One,
            address: None,
            data: Some(0xAB),
        };
        let mut buf = Vec::new();
        cmd.encode(&mut buf);
        assert_eq!(buf, vec![
            encode_header(Interface::Master, Direction::Write, true, Width::One, 1).0,
            0xAB,
        ]);
        assert_eq!(cmd.expected_response_len(), 1);
    }

    #[test]
    fn decode_rejects_error_status() {
        assert!(decode_write_response(0x01).is_err());
        assert!(decode_write_response(0x00).is_ok());
        assert!(decode_read_response(Width::One, &[0x01, 0xFF]).is_err());
    }

    proptest! {
        #[test]
        fn size_code_round_trip_prop(code in 0u8..8) {
            let len = payload_len_for_size_code(code);
            prop_assert_eq!(size_code_for_payload_len(len), Some(code));
        }

        #[test]
        fn read_command_round_trip(
            addr in any::<u32>(),
            autoinc in any::<bool>(),
        ) {
            let cmd = Command {
                direction: Direction::Read,
                autoinc,
                width: Width::Four,
                address: Some(addr),
                data: None,
            };
            let mut buf = Vec::new();
            cmd.encode(&mut buf);
            let header = CommandHeader(buf[0]);
            prop_assert_eq!(header.interface(), Interface::Master);
            prop_assert_eq!(header.direction(), Direction::Read);
            prop_assert_eq!(header.autoinc(), autoinc);
            prop_assert_eq!(header.payload_len() as usize, 4);
            let decoded_addr = u32::from_be_bytes(buf[1..5].try_into().unwrap());
            prop_assert_eq!(decoded_addr, addr);
        }

        #[test]
        fn write_response_round_trip(status_ok in any::<bool>()) {
            let byte = if status_ok { 0u8 } else { 1u8 };
            prop_assert_eq!(decode_write_response(byte).is_ok(), status_ok);
        }
    }
}

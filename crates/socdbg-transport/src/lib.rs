// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Byte-stream transports that carry the framed protocol to and from a debug
//! bridge: a USB-serial link to real hardware, or a bare TCP socket to a
//! simulated one.
//!
//! Transports deal only in bytes — they know nothing about frame boundaries.
//! Chunking a caller's buffer into whatever increments the underlying device
//! prefers is the transport's business; reassembling those bytes into frames
//! is [`socdbg_link`](../socdbg_link/index.html)'s.
//!
//! A [`Transport`] is opened whole but immediately [`split`](Transport::split)
//! into an independent [`TransportReader`] and [`TransportWriter`] sharing
//! the same underlying device: the endpoints are full-duplex, so the link
//! engine's reader thread can sit blocked in a read without holding off a
//! caller's write, matching the teacher's own listen/send split.

#![forbid(unsafe_code)]

mod chunked_io;
mod tcp;
mod usb;

pub use chunked_io::{read_exact_chunked, write_all_chunked};
pub use tcp::TcpSocketTransport;
pub use usb::UsbSerialTransport;

use std::fmt;
use std::io;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

/// Errors a [`Transport`] can report. Distinct from the protocol/link-layer
/// error types further up the stack -- this crate only knows about bytes
/// reaching (or failing to reach) a device.
#[derive(Debug, Error)]
pub enum TransportError {
    /// No matching device was found, or it was unplugged mid-session. Named
    /// separately from a generic I/O error because callers (in particular
    /// the reader thread) treat it as a terminal, non-retryable condition.
    #[error("device not available")]
    DeviceNotAvailable,

    #[error("transport I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("operation timed out")]
    Timeout,

    #[error("malformed device identifier: {0}")]
    BadDeviceId(String),
}

/// Identifies which physical or simulated device to open.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceId {
    /// Connect over TCP to `host:port` (used against the gateware simulator
    /// or a network-attached bridge).
    Tcp(String),
    /// Open a USB-serial bridge, optionally pinned to a specific serial
    /// number when more than one is attached.
    Usb(Option<String>),
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceId::Tcp(addr) => write!(f, "{addr}"),
            DeviceId::Usb(None) => write!(f, "0"),
            DeviceId::Usb(Some(serial)) => write!(f, "{serial}"),
        }
    }
}

impl FromStr for DeviceId {
    type Err = TransportError;

    /// Parses a device identifier per §6.2: presence of `:` or `.` selects
    /// TCP (`s` is taken whole as `host:port`); otherwise `s` names a USB
    /// serial number, with `""`/`"0"` meaning "first match".
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.contains(':') || s.contains('.') {
            if s.starts_with(':') || s.ends_with(':') {
                return Err(TransportError::BadDeviceId(s.to_string()));
            }
            return Ok(DeviceId::Tcp(s.to_string()));
        }
        match s {
            "" | "0" => Ok(DeviceId::Usb(None)),
            other => Ok(DeviceId::Usb(Some(other.to_string()))),
        }
    }
}

/// The read half of a split [`Transport`]. Owned exclusively by the link
/// engine's reader thread -- no lock guards it, since nothing else ever
/// touches it.
pub trait TransportReader: Send {
    /// Reads at least one byte into `buf`, blocking up to the transport's
    /// configured timeout. Returns the number of bytes read, which may be
    /// less than `buf.len()`.
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, TransportError>;

    /// Drops any buffered-but-unread bytes. Used when resynchronizing after
    /// a protocol error.
    fn flush_input(&mut self) -> Result<(), TransportError>;

    /// Tunes the buffer size used for the underlying device's `read` calls.
    /// Meaningful for USB-serial (there is a real bulk-transfer size to
    /// pick); a no-op for TCP, matching §4.1's "ignored by TCP".
    fn set_read_chunk(&mut self, _n: usize) {}
}

/// The write half of a split [`Transport`]. Shared across caller threads
/// behind a single `write_lock` in [`socdbg_link::LinkEngine`] -- serializing
/// writes is all that's needed on a full-duplex endpoint, and the reader
/// thread never takes this lock.
pub trait TransportWriter: Send {
    /// Writes all of `buf`, blocking as needed. Unlike `read`, short writes
    /// are not exposed to callers -- chunking to the device's preferred
    /// transfer size happens internally.
    fn write_all(&mut self, buf: &[u8]) -> Result<(), TransportError>;

    /// Tunes the buffer size used for the underlying device's `write` calls.
    /// See [`TransportReader::set_read_chunk`].
    fn set_write_chunk(&mut self, _n: usize) {}
}

/// A duplex byte-stream device: USB-serial or TCP. Opened whole so `open`
/// can report one `description()`, then consumed by [`Transport::split`]
/// into the independent reader/writer halves the link engine actually uses.
pub trait Transport: Send {
    /// A human-readable identifier for logging (device path, socket peer).
    fn description(&self) -> String;

    /// Splits this transport into a read half and a write half that share
    /// the same underlying device (a cloned socket/serial handle), so one
    /// side can block in a read while the other writes concurrently.
    fn split(
        self: Box<Self>,
    ) -> Result<(Box<dyn TransportReader>, Box<dyn TransportWriter>), TransportError>;
}

/// Opens the transport named by `id`, using `timeout` as the blocking-read
/// deadline for USB transports (TCP transports apply it as a read timeout on
/// the socket directly).
pub fn open(id: &DeviceId, timeout: Duration) -> Result<Box<dyn Transport>, TransportError> {
    match id {
        DeviceId::Tcp(addr) => Ok(Box::new(TcpSocketTransport::connect(addr, timeout)?)),
        DeviceId::Usb(serial) => {
            Ok(Box::new(UsbSerialTransport::open(serial.as_deref(), timeout)?))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_id_parses() {
        assert_eq!("".parse::<DeviceId>().unwrap(), DeviceId::Usb(None));
        assert_eq!("0".parse::<DeviceId>().unwrap(), DeviceId::Usb(None));
        assert_eq!(
            "FT12ABCD".parse::<DeviceId>().unwrap(),
            DeviceId::Usb(Some("FT12ABCD".to_string()))
        );
        assert_eq!(
            "localhost:9000".parse::<DeviceId>().unwrap(),
            DeviceId::Tcp("localhost:9000".to_string())
        );
        assert_eq!(
            "192.168.1.5".parse::<DeviceId>().unwrap(),
            DeviceId::Tcp("192.168.1.5".to_string())
        );
        assert!(":9000".parse::<DeviceId>().is_err());
        assert!("localhost:".parse::<DeviceId>().is_err());
    }

    #[test]
    fn device_id_displays_round_trip_parseable_form() {
        for id in [
            DeviceId::Usb(None),
            DeviceId::Usb(Some("abc".into())),
            DeviceId::Tcp("1.2.3.4:9000".into()),
        ] {
            let rendered = id.to_string();
            assert_eq!(rendered.parse::<DeviceId>().unwrap(), id);
        }
    }
}

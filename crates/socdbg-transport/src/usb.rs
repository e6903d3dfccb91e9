// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! USB-serial transport to a debug bridge built on an FTDI FT232H-class
//! part, reached through the host's serial driver rather than a raw USB
//! bulk interface (no libusb/ftdi binding exists anywhere in this crate's
//! dependency stack, so the OS's CDC/VCP layer stands in for it).

use std::io::Read;
use std::time::Duration;

use log::{debug, info};
use serialport::{ClearBuffer, DataBits, Parity, SerialPort, SerialPortType, StopBits};

use crate::chunked_io::write_all_chunked;
use crate::{Transport, TransportError, TransportReader, TransportWriter};

/// USB vendor ID for the FTDI parts these bridges are built around.
const FTDI_VID: u16 = 0x0403;
/// Product ID for the specific FT232H-class device used on the bridge.
const FTDI_PID: u16 = 0x6010;

/// Baud rate the bridge's gateware clocks its UART at. Chosen by the
/// gateware, not negotiable.
const BAUD_RATE: u32 = 12_000_000;

/// Default bulk transfer size in each direction, absent an explicit
/// `set_read_chunk`/`set_write_chunk` call.
const DEFAULT_CHUNK: usize = 4096;

pub struct UsbSerialTransport {
    port: Box<dyn SerialPort>,
    path: String,
}

impl UsbSerialTransport {
    /// Opens the bridge's USB-serial port. If `serial_number` is given, only
    /// a device whose USB serial string matches is opened; otherwise the
    /// first matching VID/PID is used.
    pub fn open(serial_number: Option<&str>, timeout: Duration) -> Result<Self, TransportError> {
        let ports = serialport::available_ports()?;
        let candidate = ports
            .into_iter()
            .find(|p| match &p.port_type {
                SerialPortType::UsbPort(info) => {
                    info.vid == FTDI_VID
                        && info.pid == FTDI_PID
                        && serial_number
                            .map(|want| info.serial_number.as_deref() == Some(want))
                            .unwrap_or(true)
                }
                _ => false,
            })
            .ok_or(TransportError::DeviceNotAvailable)?;

        info!("opening bridge at {}", candidate.port_name);
        let mut port = serialport::new(&candidate.port_name, BAUD_RATE)
            .data_bits(DataBits::Eight)
            .stop_bits(StopBits::One)
            .parity(Parity::None)
            .timeout(timeout)
            .open()
            .map_err(|e| match e.kind() {
                serialport::ErrorKind::NoDevice => TransportError::DeviceNotAvailable,
                _ => TransportError::Io(e.into()),
            })?;

        port.clear(ClearBuffer::All)?;

        Ok(UsbSerialTransport { port, path: candidate.port_name })
    }
}

impl Transport for UsbSerialTransport {
    fn description(&self) -> String {
        format!("usb:{}", self.path)
    }

    fn split(
        self: Box<Self>,
    ) -> Result<(Box<dyn TransportReader>, Box<dyn TransportWriter>), TransportError> {
        let write_port = self.port.try_clone()?;
        Ok((
            Box::new(UsbReadHalf {
                port: self.port,
                path: self.path.clone(),
                read_chunk: DEFAULT_CHUNK,
            }),
            Box::new(UsbWriteHalf { port: write_port, write_chunk: DEFAULT_CHUNK }),
        ))
    }
}

struct UsbReadHalf {
    port: Box<dyn SerialPort>,
    path: String,
    read_chunk: usize,
}

impl TransportReader for UsbReadHalf {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, TransportError> {
        let n = buf.len().min(self.read_chunk).max(1);
        match self.port.read(&mut buf[..n]) {
            Ok(n) => Ok(n),
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => Err(TransportError::Timeout),
            Err(e) => Err(TransportError::Io(e)),
        }
    }

    fn flush_input(&mut self) -> Result<(), TransportError> {
        debug!("purging input buffer on {}", self.path);
        self.port.clear(ClearBuffer::Input)?;
        Ok(())
    }

    fn set_read_chunk(&mut self, n: usize) {
        self.read_chunk = n.max(1);
    }
}

struct UsbWriteHalf {
    port: Box<dyn SerialPort>,
    write_chunk: usize,
}

impl TransportWriter for UsbWriteHalf {
    fn write_all(&mut self, buf: &[u8]) -> Result<(), TransportError> {
        use std::io::Write;
        let port = &mut self.port;
        write_all_chunked(buf, self.write_chunk, |chunk| {
            match port.write(chunk) {
                Ok(n) => Ok(n),
                Err(e) if e.kind() == std::io::ErrorKind::TimedOut => Err(TransportError::Timeout),
                Err(e) => Err(TransportError::Io(e)),
            }
        })
    }

    fn set_write_chunk(&mut self, n: usize) {
        self.write_chunk = n.max(1);
    }
}

impl From<serialport::Error> for TransportError {
    fn from(e: serialport::Error) -> Self {
        match e.kind() {
            serialport::ErrorKind::NoDevice => TransportError::DeviceNotAvailable,
            _ => TransportError::Io(e.into()),
        }
    }
}

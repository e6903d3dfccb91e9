// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! A bare TCP socket transport, used against the gateware simulator and
//! network-attached bridges. No framing of its own -- it hands raw bytes
//! straight through.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::time::Duration;

use log::debug;

use crate::{Transport, TransportError, TransportReader, TransportWriter};

pub struct TcpSocketTransport {
    stream: TcpStream,
    peer: String,
}

impl TcpSocketTransport {
    pub fn connect(addr: &str, timeout: Duration) -> Result<Self, TransportError> {
        let stream = TcpStream::connect(addr)?;
        stream.set_nodelay(true)?;
        stream.set_read_timeout(Some(timeout))?;
        let peer = stream
            .peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| addr.to_string());
        debug!("connected to {peer}");
        Ok(TcpSocketTransport { stream, peer })
    }
}

impl Transport for TcpSocketTransport {
    fn description(&self) -> String {
        format!("tcp:{}", self.peer)
    }

    fn split(
        self: Box<Self>,
    ) -> Result<(Box<dyn TransportReader>, Box<dyn TransportWriter>), TransportError> {
        let write_stream = self.stream.try_clone()?;
        Ok((
            Box::new(TcpReadHalf { stream: self.stream }),
            Box::new(TcpWriteHalf { stream: write_stream }),
        ))
    }
}

struct TcpReadHalf {
    stream: TcpStream,
}

impl TransportReader for TcpReadHalf {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, TransportError> {
        match self.stream.read(buf) {
            Ok(0) => Err(TransportError::DeviceNotAvailable),
            Ok(n) => Ok(n),
            Err(e) if matches!(e.kind(), std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut) => {
                Err(TransportError::Timeout)
            }
            Err(e) => Err(TransportError::Io(e)),
        }
    }

    fn flush_input(&mut self) -> Result<(), TransportError> {
        // Plain TCP has no notion of discarding already-buffered input
        // short of draining the socket, which would race with the reader
        // thread; resync after a protocol error is handled a layer up.
        Ok(())
    }
}

struct TcpWriteHalf {
    stream: TcpStream,
}

impl TransportWriter for TcpWriteHalf {
    fn write_all(&mut self, buf: &[u8]) -> Result<(), TransportError> {
        self.stream.write_all(buf)?;
        Ok(())
    }
}

// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Multiplexes a single byte-stream [`Transport`] into a request/response API
//! for the host. Owns a reader thread that demultiplexes inbound bytes into
//! a master response ring and a single-slot slave mailbox, a slave-dispatch
//! thread that invokes a registered callback, and the ping-pong outbound
//! batching that keeps bulk transfers pipelined instead of request-at-a-time.

#![forbid(unsafe_code)]

mod ring_buffer;

pub use ring_buffer::{RingBuffer, DEFAULT_CAPACITY};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

use log::{debug, trace, warn};
use thiserror::Error;

use socdbg_protocol::{Command, Direction, Width};
use socdbg_transport::{Transport, TransportError, TransportReader, TransportWriter};

/// Errors surfaced by every public `LinkEngine` operation.
///
/// Two-tier, matching the transport's own split: a device that's simply gone
/// is not logged as an application error and drives a clean shutdown, while
/// anything else (malformed status byte, unrecoverable I/O) is fatal and
/// reported up to the CLI's exit path.
#[derive(Debug, Error)]
pub enum LinkError {
    #[error("device unavailable")]
    DeviceUnavailable,

    #[error("link failure: {0}")]
    Fatal(String),
}

impl From<TransportError> for LinkError {
    fn from(e: TransportError) -> Self {
        match e {
            TransportError::DeviceNotAvailable => LinkError::DeviceUnavailable,
            other => LinkError::Fatal(other.to_string()),
        }
    }
}

/// Outbound batching tuning. `high` suits internal BRAM/CSR traffic; `low`
/// is for a slow external bridge link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpeedClass {
    High,
    Low,
}

/// Byte budgets for one ping-pong buffer at a given [`SpeedClass`].
#[derive(Debug, Clone, Copy)]
pub struct SpeedSizes {
    pub read_send: usize,
    pub read_recv: usize,
    pub write_send: usize,
    pub write_recv: usize,
}

impl SpeedClass {
    pub fn sizes(self) -> SpeedSizes {
        match self {
            SpeedClass::High => SpeedSizes {
                read_send: 180,
                read_recv: 900,
                write_send: 900,
                write_recv: 450,
            },
            SpeedClass::Low => SpeedSizes {
                read_send: 9,
                read_recv: 45,
                write_send: 45,
                write_recv: 22,
            },
        }
    }
}

/// A fixed-width value `LinkEngine`'s generic bulk transfer code can encode
/// to and decode from the wire, letting `read_words`/`read_halves`/
/// `read_bytes` (and their write counterparts) share one implementation
/// instead of three near-identical copies.
pub trait Transferable: Copy + Send + Sync + 'static {
    const WIDTH: Width;
    fn to_u32(self) -> u32;
    fn from_u32(v: u32) -> Self;
}

impl Transferable for u8 {
    const WIDTH: Width = Width::One;
    fn to_u32(self) -> u32 {
        self as u32
    }
    fn from_u32(v: u32) -> Self {
        v as u8
    }
}

impl Transferable for u16 {
    const WIDTH: Width = Width::Two;
    fn to_u32(self) -> u32 {
        self as u32
    }
    fn from_u32(v: u32) -> Self {
        v as u16
    }
}

impl Transferable for u32 {
    const WIDTH: Width = Width::Four;
    fn to_u32(self) -> u32 {
        self
    }
    fn from_u32(v: u32) -> Self {
        v
    }
}

/// One inbound slave-interface frame, handed off from the reader thread to
/// the dispatcher: `(ctl, irq)` payload bytes per the bridge's slave
/// notification format.
type SlaveSlot = Arc<(Mutex<Option<(u8, u8)>>, Condvar)>;
type SlaveHandler = Arc<Mutex<Option<Box<dyn FnMut(u8, u8) + Send>>>>;

pub struct LinkEngine {
    write_half: Mutex<Box<dyn TransportWriter>>,
    ring: Arc<RingBuffer>,
    kill: Arc<AtomicBool>,
    speed: Mutex<SpeedClass>,
    api_lock: Mutex<()>,
    slave_slot: SlaveSlot,
    slave_handler: SlaveHandler,
    reader_thread: Mutex<Option<JoinHandle<()>>>,
    slave_thread: Mutex<Option<JoinHandle<()>>>,
}

impl LinkEngine {
    /// Splits `transport` into independent read/write halves (see
    /// [`Transport::split`]) and spawns the reader and slave-dispatch
    /// threads. The reader thread takes sole ownership of the read half --
    /// nothing else ever touches it -- so it can sit blocked in a read
    /// without holding a lock a caller needs to send the next command. Only
    /// the write half is shared, behind `write_lock`.
    pub fn new(transport: Box<dyn Transport>) -> Result<Self, LinkError> {
        let (read_half, write_half) = transport.split()?;
        let write_half = Mutex::new(write_half);
        let ring = Arc::new(RingBuffer::new(DEFAULT_CAPACITY));
        let kill = Arc::new(AtomicBool::new(false));
        let slave_slot: SlaveSlot = Arc::new((Mutex::new(None), Condvar::new()));
        let slave_handler: SlaveHandler = Arc::new(Mutex::new(None));

        let reader_thread = std::thread::Builder::new()
            .name("link-reader".into())
            .spawn({
                let ring = Arc::clone(&ring);
                let kill = Arc::clone(&kill);
                let slave_slot = Arc::clone(&slave_slot);
                move || reader_loop(read_half, ring, kill, slave_slot)
            })
            .expect("spawning link-reader thread");

        let slave_thread = std::thread::Builder::new()
            .name("link-slave".into())
            .spawn({
                let kill = Arc::clone(&kill);
                let slave_slot = Arc::clone(&slave_slot);
                let slave_handler = Arc::clone(&slave_handler);
                move || slave_loop(kill, slave_slot, slave_handler)
            })
            .expect("spawning link-slave thread");

        Ok(LinkEngine {
            write_half,
            ring,
            kill,
            speed: Mutex::new(SpeedClass::High),
            api_lock: Mutex::new(()),
            slave_slot,
            slave_handler,
            reader_thread: Mutex::new(Some(reader_thread)),
            slave_thread: Mutex::new(Some(slave_thread)),
        })
    }

    /// Registers (or replaces) the slave-interface callback. Permitted while
    /// packets are in flight; there is deliberately no "unregister drains
    /// the queue" behavior.
    pub fn on_slave(&self, handler: Box<dyn FnMut(u8, u8) + Send>) {
        *self.slave_handler.lock().unwrap() = Some(handler);
    }

    /// Changes the outbound batching tuning. Only valid between bulk
    /// operations, never mid-bulk -- the caller is responsible for not
    /// calling this concurrently with `read_*`/`write_*`.
    pub fn set_speed_class(&self, class: SpeedClass) {
        *self.speed.lock().unwrap() = class;
    }

    pub fn speed_class(&self) -> SpeedClass {
        *self.speed.lock().unwrap()
    }

    pub fn read_words(&self, address: u32, count: usize) -> Result<Vec<u32>, LinkError> {
        self.bulk_read::<u32>(address, count)
    }

    pub fn read_halves(&self, address: u32, count: usize) -> Result<Vec<u16>, LinkError> {
        self.bulk_read::<u16>(address, count)
    }

    pub fn read_bytes(&self, address: u32, count: usize) -> Result<Vec<u8>, LinkError> {
        self.bulk_read::<u8>(address, count)
    }

    pub fn write_words(&self, address: u32, data: &[u32]) -> Result<(), LinkError> {
        self.bulk_write::<u32>(address, data)
    }

    pub fn write_halves(&self, address: u32, data: &[u16]) -> Result<(), LinkError> {
        self.bulk_write::<u16>(address, data)
    }

    pub fn write_bytes(&self, address: u32, data: &[u8]) -> Result<(), LinkError> {
        self.bulk_write::<u8>(address, data)
    }

    /// Writes a single raw byte straight to the transport, bypassing the
    /// command framing entirely. Used for the slave-channel IRQ
    /// acknowledgement, which the gateware consumes as a bare byte rather
    /// than a framed command.
    pub fn send_raw_byte(&self, byte: u8) -> Result<(), LinkError> {
        self.send_raw(&[byte])
    }

    fn send_raw(&self, buf: &[u8]) -> Result<(), LinkError> {
        self.write_half
            .lock()
            .unwrap()
            .write_all(buf)
            .map_err(LinkError::from)
    }

    /// Drains `count` read-response frames of the given width from the
    /// master ring, appending decoded values to `out`. A bad status byte is
    /// fatal, matching §7's two-tier model.
    fn drain_reads<T: Transferable>(
        &self,
        response_bytes: usize,
        out: &mut Vec<T>,
    ) -> Result<(), LinkError> {
        let frame_len = T::WIDTH.bytes() + 1;
        debug_assert_eq!(response_bytes % frame_len, 0);
        let mut frame = vec![0u8; frame_len];
        for _ in 0..(response_bytes / frame_len) {
            if !self.ring.read_exact(&mut frame) {
                return Err(LinkError::DeviceUnavailable);
            }
            let value = socdbg_protocol::decode_read_response(T::WIDTH, &frame)
                .map_err(|e| LinkError::Fatal(e.to_string()))?;
            out.push(T::from_u32(value));
        }
        Ok(())
    }

    fn drain_writes(&self, response_bytes: usize) -> Result<(), LinkError> {
        let mut byte = [0u8; 1];
        for _ in 0..response_bytes {
            if !self.ring.read_exact(&mut byte) {
                return Err(LinkError::DeviceUnavailable);
            }
            socdbg_protocol::decode_write_response(byte[0])
                .map_err(|e| LinkError::Fatal(e.to_string()))?;
        }
        Ok(())
    }

    fn bulk_read<T: Transferable>(&self, address: u32, count: usize) -> Result<Vec<T>, LinkError> {
        let _api = self.api_lock.lock().unwrap();
        if count == 0 {
            return Ok(Vec::new());
        }
        let cap = self.speed.lock().unwrap().sizes().read_send;
        let mut out = Vec::with_capacity(count);
        let mut batch = PingPong::new(cap);

        for i in 0..count {
            let cmd = Command {
                direction: Direction::Read,
                autoinc: i != 0,
                width: T::WIDTH,
                address: if i == 0 { Some(address) } else { None },
                data: None,
            };
            let mut encoded = Vec::new();
            cmd.encode(&mut encoded);
            if let Some(drained) = batch.push(&encoded, cmd.expected_response_len()) {
                self.send_raw(&drained.bytes)?;
                if let Some(to_drain) = drained.to_drain {
                    self.drain_reads::<T>(to_drain, &mut out)?;
                }
            }
        }
        for drained in batch.finish() {
            self.send_raw(&drained.bytes)?;
            if let Some(to_drain) = drained.to_drain {
                self.drain_reads::<T>(to_drain, &mut out)?;
            }
        }
        Ok(out)
    }

    fn bulk_write<T: Transferable>(&self, address: u32, data: &[T]) -> Result<(), LinkError> {
        let _api = self.api_lock.lock().unwrap();
        if data.is_empty() {
            return Ok(());
        }
        let cap = self.speed.lock().unwrap().sizes().write_send;
        let mut batch = PingPong::new(cap);

        for (i, value) in data.iter().enumerate() {
            let cmd = Command {
                direction: Direction::Write,
                autoinc: i != 0,
                width: T::WIDTH,
                address: if i == 0 { Some(address) } else { None },
                data: Some(value.to_u32()),
            };
            let mut encoded = Vec::new();
            cmd.encode(&mut encoded);
            if let Some(drained) = batch.push(&encoded, cmd.expected_response_len()) {
                self.send_raw(&drained.bytes)?;
                if let Some(to_drain) = drained.to_drain {
                    self.drain_writes(to_drain)?;
                }
            }
        }
        for drained in batch.finish() {
            self.send_raw(&drained.bytes)?;
            if let Some(to_drain) = drained.to_drain {
                self.drain_writes(to_drain)?;
            }
        }
        Ok(())
    }

    /// Signals both background threads to exit and waits for them. Safe to
    /// call more than once; a second call is a no-op.
    pub fn close(&self) {
        self.kill.store(true, Ordering::Release);
        self.ring.close();
        {
            let (lock, cvar) = &*self.slave_slot;
            let _guard = lock.lock().unwrap();
            cvar.notify_all();
        }
        if let Some(handle) = self.reader_thread.lock().unwrap().take() {
            let _ = handle.join();
        }
        if let Some(handle) = self.slave_thread.lock().unwrap().take() {
            let _ = handle.join();
        }
    }
}

impl Drop for LinkEngine {
    fn drop(&mut self) {
        self.close();
    }
}

/// What [`PingPong::push`]/[`PingPong::finish`] hand back when a buffer was
/// just sent: the bytes that went out, and (once the ping-pong has made one
/// full round) the response byte count to drain for the buffer being
/// reused, in drain order.
struct Drained {
    bytes: Vec<u8>,
    to_drain: Option<usize>,
}

/// Outbound batching state for one bulk operation: two equal-capacity byte
/// buffers, flipped each time the active one fills, draining the buffer
/// about to be reused before it's overwritten so a buffer is never reused
/// ahead of its expected response count being drained.
struct PingPong {
    bufs: [Vec<u8>; 2],
    expected: [usize; 2],
    active: usize,
    process: bool,
}

impl PingPong {
    fn new(capacity: usize) -> Self {
        PingPong {
            bufs: [Vec::with_capacity(capacity), Vec::with_capacity(capacity)],
            expected: [0, 0],
            active: 0,
            process: false,
        }
    }

    fn capacity(&self) -> usize {
        self.bufs[0].capacity()
    }

    /// Appends one command's encoded bytes (with its expected response
    /// length) to the active buffer, flipping first if it wouldn't fit.
    /// Returns the flipped-out buffer (and, from the second flip onward,
    /// the response count to drain for the buffer now being reused) when a
    /// flip occurred.
    fn push(&mut self, encoded: &[u8], response_len: usize) -> Option<Drained> {
        let mut flipped = None;
        if !self.bufs[self.active].is_empty()
            && self.bufs[self.active].len() + encoded.len() > self.capacity()
        {
            flipped = Some(self.flip());
        }
        self.bufs[self.active].extend_from_slice(encoded);
        self.expected[self.active] += response_len;
        flipped
    }

    /// Sends the just-filled buffer, flips, and drains the newly-active
    /// buffer's leftover response count if this isn't the first flip.
    fn flip(&mut self) -> Drained {
        let sent = self.active;
        let bytes = self.bufs[sent].clone();
        self.active = 1 - self.active;
        let to_drain = if self.process {
            let pending = std::mem::take(&mut self.expected[self.active]);
            self.bufs[self.active].clear();
            Some(pending)
        } else {
            self.process = true;
            self.bufs[self.active].clear();
            None
        };
        Drained { bytes, to_drain }
    }

    /// Flushes whatever remains in the active buffer and returns the drains
    /// needed to empty both buffers, in "opposite, then current" order.
    fn finish(mut self) -> Vec<Drained> {
        let mut out = Vec::with_capacity(2);
        if !self.bufs[self.active].is_empty() {
            let sent = self.active;
            let bytes = std::mem::take(&mut self.bufs[sent]);
            let opposite = 1 - sent;
            let opposite_pending = std::mem::take(&mut self.expected[opposite]);
            out.push(Drained {
                bytes,
                to_drain: if opposite_pending > 0 {
                    Some(opposite_pending)
                } else {
                    None
                },
            });
            out.push(Drained {
                bytes: Vec::new(),
                to_drain: Some(std::mem::take(&mut self.expected[sent])),
            });
        } else {
            for idx in [1 - self.active, self.active] {
                let pending = std::mem::take(&mut self.expected[idx]);
                if pending > 0 {
                    out.push(Drained {
                        bytes: Vec::new(),
                        to_drain: Some(pending),
                    });
                }
            }
        }
        out
    }
}

fn read_exact_unlocked(
    reader: &mut dyn TransportReader,
    buf: &mut [u8],
) -> Result<(), TransportError> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..])?;
        if n == 0 {
            return Err(TransportError::DeviceNotAvailable);
        }
        filled += n;
    }
    Ok(())
}

/// The reader thread's whole life: owns `reader` exclusively (no lock --
/// nothing else ever touches it), so it can block here indefinitely while a
/// caller elsewhere holds `write_lock` and sends a command; the device only
/// replies after that command lands, so the two must never contend for the
/// same lock.
fn reader_loop(
    mut reader: Box<dyn TransportReader>,
    ring: Arc<RingBuffer>,
    kill: Arc<AtomicBool>,
    slave_slot: SlaveSlot,
) {
    let mut header = [0u8; 1];
    loop {
        if kill.load(Ordering::Acquire) {
            break;
        }
        match reader.read(&mut header) {
            Ok(0) | Err(TransportError::DeviceNotAvailable) => {
                warn!("link reader: device unavailable, shutting down");
                kill.store(true, Ordering::Release);
                break;
            }
            Err(TransportError::Timeout) => continue,
            Err(e) => {
                warn!("link reader: fatal transport error: {e}");
                kill.store(true, Ordering::Release);
                break;
            }
            Ok(_) => {}
        }

        let decoded = socdbg_protocol::CommandHeader(header[0]);
        let payload_len = decoded.payload_len() as usize;
        let mut frame = vec![0u8; 1 + payload_len];
        frame[0] = header[0];
        if payload_len > 0 {
            if let Err(e) = read_exact_unlocked(reader.as_mut(), &mut frame[1..]) {
                warn!("link reader: payload read failed: {e}");
                kill.store(true, Ordering::Release);
                break;
            }
        }

        match decoded.interface() {
            socdbg_protocol::Interface::Master => {
                trace!("reader: master frame, {} bytes", frame.len());
                ring.write_all(&frame);
            }
            socdbg_protocol::Interface::Slave => {
                debug!("reader: slave frame");
                let (lock, cvar) = &*slave_slot;
                let mut slot = lock.lock().unwrap();
                let ctl = frame.get(1).copied().unwrap_or(0);
                let irq = frame.get(2).copied().unwrap_or(0);
                *slot = Some((ctl, irq));
                cvar.notify_one();
            }
        }
    }
    ring.close();
    let (lock, cvar) = &*slave_slot;
    let _guard = lock.lock().unwrap();
    cvar.notify_all();
}

fn slave_loop(kill: Arc<AtomicBool>, slave_slot: SlaveSlot, handler: SlaveHandler) {
    loop {
        let (lock, cvar) = &*slave_slot;
        let mut guard = lock.lock().unwrap();
        while guard.is_none() && !kill.load(Ordering::Acquire) {
            guard = cvar.wait(guard).unwrap();
        }
        if guard.is_none() {
            break;
        }
        let (ctl, irq) = guard.take().unwrap();
        drop(guard);
        if let Some(f) = handler.lock().unwrap().as_mut() {
            f(ctl, irq);
        }
        if kill.load(Ordering::Acquire) {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ping_pong_drains_in_opposite_then_current_order_at_end() {
        let mut pp = PingPong::new(8);
        // Fill beyond capacity to force exactly one flip, then finish.
        assert!(pp.push(&[0u8; 6], 6).is_none());
        let flipped = pp.push(&[0u8; 6], 6);
        assert!(flipped.is_some());
        let drained = pp.finish();
        // Active buffer had 6 bytes pending, no prior opposite-buffer debt
        // since this was the only flip.
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[1].to_drain, Some(6));
    }

    #[test]
    fn ping_pong_sets_process_only_after_first_flip() {
        let mut pp = PingPong::new(4);
        assert!(pp.push(&[0u8; 4], 1).is_none());
        let drained = pp.flip();
        assert_eq!(drained.to_drain, None);
        assert!(pp.process);
    }
}

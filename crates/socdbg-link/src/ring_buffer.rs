// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! A fixed-capacity, single-producer/single-consumer byte ring with blocking
//! `read`/`write`.
//!
//! The head/tail/available bookkeeping follows the same contiguous-or-
//! wrapped region accounting a plain (single-threaded) circular queue would
//! use -- no modulo division on the hot path, callers get back whichever
//! contiguous run is available and loop for the rest. What turns that into a
//! cross-thread primitive is a `Condvar` pair layered on top: `not_empty`
//! wakes a blocked reader, `not_full` wakes a blocked writer.
use std::sync::{Condvar, Mutex};

/// Default capacity for the master response ring. Wide enough to hold a full
/// high-speed ping-pong turnaround without the reader thread blocking on a
/// slow consumer.
pub const DEFAULT_CAPACITY: usize = 16 * 1024;

struct RingCore {
    backing: Vec<u8>,
    head: usize,
    tail: usize,
    available: usize,
    closed: bool,
}

impl RingCore {
    fn capacity(&self) -> usize {
        self.backing.len()
    }

    fn free(&self) -> usize {
        self.capacity() - self.available
    }

    /// Largest contiguous run starting at `tail` that can be written without
    /// wrapping, capped by how much space is actually free.
    fn contiguous_free(&self) -> usize {
        self.free().min(self.capacity() - self.tail)
    }

    /// Largest contiguous run starting at `head` that can be read without
    /// wrapping, capped by how much data is actually available.
    fn contiguous_filled(&self) -> usize {
        self.available.min(self.capacity() - self.head)
    }
}

/// A blocking SPSC byte ring. Cloning a `RingBuffer` handle (via `Arc`) is
/// how the reader thread and API threads in `LinkEngine` share one ring
/// without each owning the data.
pub struct RingBuffer {
    core: Mutex<RingCore>,
    not_empty: Condvar,
    not_full: Condvar,
}

impl RingBuffer {
    pub fn new(capacity: usize) -> Self {
        RingBuffer {
            core: Mutex::new(RingCore {
                backing: vec![0u8; capacity],
                head: 0,
                tail: 0,
                available: 0,
                closed: false,
            }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
        }
    }

    /// Writes as much of `data` as fits in one contiguous run, blocking if
    /// the ring is currently full. Returns the number of bytes written,
    /// which may be less than `data.len()` -- callers loop. Returns `0` only
    /// when the ring has been [`close`](Self::close)d.
    pub fn write(&self, data: &[u8]) -> usize {
        if data.is_empty() {
            return 0;
        }
        let mut core = self.core.lock().unwrap();
        while core.free() == 0 && !core.closed {
            core = self.not_full.wait(core).unwrap();
        }
        if core.closed {
            return 0;
        }
        let n = core.contiguous_free().min(data.len());
        let tail = core.tail;
        core.backing[tail..tail + n].copy_from_slice(&data[..n]);
        core.tail = (tail + n) % core.capacity();
        core.available += n;
        self.not_empty.notify_one();
        n
    }

    /// Reads into `out`, blocking until at least one byte is available (or
    /// the ring is closed). Returns the number of bytes read, `0` only on
    /// close with nothing left to drain.
    pub fn read(&self, out: &mut [u8]) -> usize {
        if out.is_empty() {
            return 0;
        }
        let mut core = self.core.lock().unwrap();
        while core.available == 0 && !core.closed {
            core = self.not_empty.wait(core).unwrap();
        }
        if core.available == 0 {
            return 0;
        }
        let n = core.contiguous_filled().min(out.len());
        let head = core.head;
        out[..n].copy_from_slice(&core.backing[head..head + n]);
        core.head = (head + n) % core.capacity();
        core.available -= n;
        self.not_full.notify_one();
        n
    }

    /// Writes every byte of `data`, looping over [`write`](Self::write)'s
    /// partial transfers.
    pub fn write_all(&self, mut data: &[u8]) {
        while !data.is_empty() {
            let n = self.write(data);
            if n == 0 {
                break;
            }
            data = &data[n..];
        }
    }

    /// Reads exactly `out.len()` bytes, looping over
    /// [`read`](Self::read)'s partial transfers. Returns `false` if the ring
    /// closed before `out` could be filled.
    pub fn read_exact(&self, out: &mut [u8]) -> bool {
        let mut filled = 0;
        while filled < out.len() {
            let n = self.read(&mut out[filled..]);
            if n == 0 {
                return false;
            }
            filled += n;
        }
        true
    }

    /// Wakes any thread blocked in `read`/`write` with no further data
    /// coming. Used during `LinkEngine` shutdown so the reader thread isn't
    /// stuck writing to a ring nobody will ever drain, and so a caller
    /// blocked draining a response never hangs past teardown.
    pub fn close(&self) {
        let mut core = self.core.lock().unwrap();
        core.closed = true;
        self.not_empty.notify_all();
        self.not_full.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn write_then_read_round_trips() {
        let ring = RingBuffer::new(8);
        assert_eq!(ring.write(b"abcd"), 4);
        let mut out = [0u8; 4];
        assert_eq!(ring.read(&mut out), 4);
        assert_eq!(&out, b"abcd");
    }

    #[test]
    fn wraps_around_without_losing_bytes() {
        let ring = RingBuffer::new(4);
        ring.write_all(b"ab");
        let mut tmp = [0u8; 1];
        ring.read(&mut tmp);
        ring.write_all(b"cd");
        let mut out = [0u8; 3];
        assert!(ring.read_exact(&mut out));
        assert_eq!(&out, b"bcd");
    }

    #[test]
    fn partial_write_on_full_ring_then_unblocks() {
        let ring = Arc::new(RingBuffer::new(4));
        assert_eq!(ring.write(b"abcd"), 4);

        let r = Arc::clone(&ring);
        let writer = thread::spawn(move || r.write(b"e"));

        let mut tmp = [0u8; 1];
        // Give the writer thread a moment to block before draining space.
        thread::sleep(std::time::Duration::from_millis(20));
        assert_eq!(ring.read(&mut tmp), 1);
        assert_eq!(writer.join().unwrap(), 1);
    }

    #[test]
    fn close_unblocks_a_waiting_reader() {
        let ring = Arc::new(RingBuffer::new(4));
        let r = Arc::clone(&ring);
        let reader = thread::spawn(move || {
            let mut out = [0u8; 1];
            r.read(&mut out)
        });
        thread::sleep(std::time::Duration::from_millis(20));
        ring.close();
        assert_eq!(reader.join().unwrap(), 0);
    }

    #[test]
    fn read_exact_fails_cleanly_on_close_mid_fill() {
        let ring = Arc::new(RingBuffer::new(4));
        ring.write(b"a");
        let r = Arc::clone(&ring);
        let reader = thread::spawn(move || {
            let mut out = [0u8; 4];
            r.read_exact(&mut out)
        });
        thread::sleep(std::time::Duration::from_millis(20));
        ring.close();
        assert!(!reader.join().unwrap());
    }
}

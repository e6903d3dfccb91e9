// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Shared helpers for turning a short-read/short-write capable device into
//! the all-or-nothing semantics [`crate::Transport`] promises its callers.

use crate::TransportError;

/// Reads exactly `buf.len()` bytes, issuing repeated calls to `read_once`
/// until the buffer is full. Mirrors the retry loop the bridge's reader
/// thread needs around a raw device read that may return a partial chunk.
pub fn read_exact_chunked(
    buf: &mut [u8],
    mut read_once: impl FnMut(&mut [u8]) -> Result<usize, TransportError>,
) -> Result<(), TransportError> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = read_once(&mut buf[filled..])?;
        if n == 0 {
            return Err(TransportError::DeviceNotAvailable);
        }
        filled += n;
    }
    Ok(())
}

/// Writes all of `buf`, splitting into chunks of at most `chunk_size` bytes.
/// Real USB-serial hardware has a preferred bulk transfer size; splitting
/// here keeps that concern out of the framing logic above.
pub fn write_all_chunked(
    buf: &[u8],
    chunk_size: usize,
    mut write_once: impl FnMut(&[u8]) -> Result<usize, TransportError>,
) -> Result<(), TransportError> {
    let chunk_size = chunk_size.max(1);
    let mut offset = 0;
    while offset < buf.len() {
        let end = (offset + chunk_size).min(buf.len());
        let mut sent = 0;
        while sent < end - offset {
            let n = write_once(&buf[offset + sent..end])?;
            if n == 0 {
                return Err(TransportError::DeviceNotAvailable);
            }
            sent += n;
        }
        offset = end;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_exact_assembles_short_reads() {
        let source = [1u8, 2, 3, 4, 5];
        let mut pos = 0;
        let mut out = [0u8; 5];
        read_exact_chunked(&mut out, |b| {
            let n = b.len().min(2).min(source.len() - pos);
            b[..n].copy_from_slice(&source[pos..pos + n]);
            pos += n;
            Ok(n)
        })
        .unwrap();
        assert_eq!(out, source);
    }

    #[test]
    fn read_exact_reports_device_gone_on_zero_read() {
        let mut out = [0u8; 4];
        let err = read_exact_chunked(&mut out, |_| Ok(0)).unwrap_err();
        assert!(matches!(err, TransportError::DeviceNotAvailable));
    }

    #[test]
    fn write_all_splits_into_chunks() {
        let input = [0u8; 10];
        let mut calls = Vec::new();
        write_all_chunked(&input, 3, |b| {
            calls.push(b.len());
            Ok(b.len())
        })
        .unwrap();
        assert_eq!(calls, vec![3, 3, 3, 1]);
    }
}

// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Typed accessors over the bridge's control/status register map.
//!
//! The field layout below mirrors the schema the gateware itself is built
//! from: one [`CsrField`] row per register, each producing one pair of typed
//! getter/setter methods through the [`csr_field!`] macro rather than
//! hand-written per-field boilerplate. [`CsrMap::validate`] guards against a
//! host built against a stale schema by fingerprinting the table with a
//! CRC32 and comparing it against the device's own CRC register.

#![forbid(unsafe_code)]

use std::sync::Arc;

use log::trace;
use thiserror::Error;

use socdbg_link::{LinkEngine, LinkError};

#[derive(Debug, Error)]
pub enum CsrError {
    #[error(transparent)]
    Link(#[from] LinkError),

    #[error("CSR field '{0}' is not readable")]
    NotReadable(&'static str),

    #[error("CSR field '{0}' is not writable")]
    NotWritable(&'static str),

    #[error(
        "CSR schema mismatch: host expects CRC {expected:#010x}, device reports {found:#010x}; regenerate gateware/CSR"
    )]
    SchemaMismatch { expected: u32, found: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldWidth {
    One,
    Two,
    Four,
}

impl FieldWidth {
    fn bytes(self) -> u32 {
        match self {
            FieldWidth::One => 1,
            FieldWidth::Two => 2,
            FieldWidth::Four => 4,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    ReadOnly,
    WriteOnly,
    ReadWrite,
}

impl Access {
    fn readable(self) -> bool {
        matches!(self, Access::ReadOnly | Access::ReadWrite)
    }

    fn writable(self) -> bool {
        matches!(self, Access::WriteOnly | Access::ReadWrite)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct CsrField {
    pub name: &'static str,
    pub offset: u32,
    pub width: FieldWidth,
    pub access: Access,
}

/// The field table. Adding a CSR to the gateware means adding one row here;
/// [`CsrMap::validate`]'s fingerprint changes accordingly, which is the
/// point -- a host built against the old table will refuse to attach.
pub const FIELDS: &[CsrField] = &[
    CsrField { name: "crc", offset: 0x00, width: FieldWidth::Four, access: Access::ReadOnly },
    CsrField { name: "adiv5_data", offset: 0x04, width: FieldWidth::Four, access: Access::ReadWrite },
    CsrField { name: "adiv5_cmd", offset: 0x08, width: FieldWidth::One, access: Access::WriteOnly },
    CsrField { name: "adiv5_status", offset: 0x09, width: FieldWidth::One, access: Access::ReadOnly },
    CsrField { name: "jtag_n_swd", offset: 0x0A, width: FieldWidth::One, access: Access::ReadWrite },
    CsrField { name: "bridge_ap_sel", offset: 0x0B, width: FieldWidth::One, access: Access::ReadWrite },
    CsrField { name: "bridge_en", offset: 0x0C, width: FieldWidth::One, access: Access::ReadWrite },
    CsrField { name: "bridge_mode", offset: 0x0D, width: FieldWidth::One, access: Access::ReadWrite },
    CsrField { name: "bridge_irq_scan_en", offset: 0x0E, width: FieldWidth::One, access: Access::ReadWrite },
    CsrField { name: "bridge_irq_buf", offset: 0x10, width: FieldWidth::Four, access: Access::ReadWrite },
    CsrField { name: "id", offset: 0x14, width: FieldWidth::Four, access: Access::ReadOnly },
];

/// The CRC32 fingerprint of [`FIELDS`]'s layout, exposed so test harnesses
/// building a simulated device can pre-seed its CRC register to match.
pub fn schema_fingerprint() -> u32 {
    let mut bytes = Vec::new();
    for field in FIELDS {
        bytes.extend_from_slice(field.name.as_bytes());
        bytes.extend_from_slice(&field.offset.to_le_bytes());
        bytes.push(field.width.bytes() as u8);
        bytes.push(match field.access {
            Access::ReadOnly => 0,
            Access::WriteOnly => 1,
            Access::ReadWrite => 2,
        });
    }
    const CRC: crc::Crc<u32> = crc::Crc::<u32>::new(&crc::CRC_32_ISO_HDLC);
    CRC.checksum(&bytes)
}

/// Generates a typed getter, a typed setter, or both, over a named row of
/// [`FIELDS`], routed through [`CsrMap::read_raw`]/[`CsrMap::write_raw`].
macro_rules! csr_field {
    (rw $reader:ident, $writer:ident, $name:expr) => {
        pub fn $reader(&self) -> Result<u32, CsrError> {
            self.read_raw(self.field($name))
        }
        pub fn $writer(&self, value: u32) -> Result<(), CsrError> {
            self.write_raw(self.field($name), value)
        }
    };
    (r $reader:ident, $name:expr) => {
        pub fn $reader(&self) -> Result<u32, CsrError> {
            self.read_raw(self.field($name))
        }
    };
    (w $writer:ident, $name:expr) => {
        pub fn $writer(&self, value: u32) -> Result<(), CsrError> {
            self.write_raw(self.field($name), value)
        }
    };
}

/// Accessor over the bridge's CSR block at a fixed base address in the
/// bridge's word-addressable memory, reached through the same
/// [`LinkEngine`] bulk memory path ordinary target memory accesses use.
pub struct CsrMap {
    link: Arc<LinkEngine>,
    base: u32,
}

impl CsrMap {
    pub fn new(link: Arc<LinkEngine>, base: u32) -> Self {
        CsrMap { link, base }
    }

    /// Compares the host's compiled-in schema fingerprint against the
    /// device's CRC register. A mismatch means the host and gateware
    /// disagree on the CSR layout and is always fatal -- there is no
    /// partial-compatibility fallback.
    pub fn validate(&self) -> Result<(), CsrError> {
        let expected = schema_fingerprint();
        let found = self.crc()?;
        if expected != found {
            return Err(CsrError::SchemaMismatch { expected, found });
        }
        Ok(())
    }

    fn field(&self, name: &'static str) -> &'static CsrField {
        FIELDS
            .iter()
            .find(|f| f.name == name)
            .expect("csr_field! macro only names fields present in FIELDS")
    }

    fn read_raw(&self, field: &CsrField) -> Result<u32, CsrError> {
        if !field.access.readable() {
            return Err(CsrError::NotReadable(field.name));
        }
        let addr = self.base + field.offset;
        trace!("csr read {} @ {addr:#010x}", field.name);
        Ok(match field.width {
            FieldWidth::One => *self.link.read_bytes(addr, 1)?.first().unwrap_or(&0) as u32,
            FieldWidth::Two => *self.link.read_halves(addr, 1)?.first().unwrap_or(&0) as u32,
            FieldWidth::Four => *self.link.read_words(addr, 1)?.first().unwrap_or(&0),
        })
    }

    fn write_raw(&self, field: &CsrField, value: u32) -> Result<(), CsrError> {
        if !field.access.writable() {
            return Err(CsrError::NotWritable(field.name));
        }
        let addr = self.base + field.offset;
        trace!("csr write {} @ {addr:#010x} = {value:#010x}", field.name);
        match field.width {
            FieldWidth::One => self.link.write_bytes(addr, &[value as u8])?,
            FieldWidth::Two => self.link.write_halves(addr, &[value as u16])?,
            FieldWidth::Four => self.link.write_words(addr, &[value])?,
        }
        Ok(())
    }

    csr_field!(r crc, "crc");
    csr_field!(rw adiv5_data, set_adiv5_data, "adiv5_data");
    csr_field!(w set_adiv5_cmd, "adiv5_cmd");
    csr_field!(r adiv5_status, "adiv5_status");
    csr_field!(rw jtag_n_swd, set_jtag_n_swd, "jtag_n_swd");
    csr_field!(rw bridge_ap_sel, set_bridge_ap_sel, "bridge_ap_sel");
    csr_field!(rw bridge_en, set_bridge_en, "bridge_en");
    csr_field!(rw bridge_mode, set_bridge_mode, "bridge_mode");
    csr_field!(rw bridge_irq_scan_en, set_bridge_irq_scan_en, "bridge_irq_scan_en");
    csr_field!(rw bridge_irq_buf, set_bridge_irq_buf, "bridge_irq_buf");
    /// Identity register: `(flexsoc_id() >> 4)` is the fixed gateware
    /// constant `0xF1ECDB6`, the low nibble a revision field.
    csr_field!(r flexsoc_id, "id");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_is_stable_across_calls() {
        assert_eq!(schema_fingerprint(), schema_fingerprint());
    }

    #[test]
    fn fingerprint_changes_if_a_field_moves() {
        let original = schema_fingerprint();
        let mut mutated: Vec<CsrField> = FIELDS.to_vec();
        mutated[1].offset += 4;
        let mut bytes = Vec::new();
        for field in &mutated {
            bytes.extend_from_slice(field.name.as_bytes());
            bytes.extend_from_slice(&field.offset.to_le_bytes());
            bytes.push(field.width.bytes() as u8);
            bytes.push(match field.access {
                Access::ReadOnly => 0,
                Access::WriteOnly => 1,
                Access::ReadWrite => 2,
            });
        }
        const CRC: crc::Crc<u32> = crc::Crc::<u32>::new(&crc::CRC_32_ISO_HDLC);
        assert_ne!(original, CRC.checksum(&bytes));
    }

    #[test]
    fn access_rules_are_respected() {
        assert!(Access::ReadOnly.readable() && !Access::ReadOnly.writable());
        assert!(Access::WriteOnly.writable() && !Access::WriteOnly.readable());
        assert!(Access::ReadWrite.readable() && Access::ReadWrite.writable());
    }
}

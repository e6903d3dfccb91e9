// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Cortex-M core debug helper: halt/run/step, core register access, and
//! binary image loading, all going through the bridge's word-memory path
//! (`LinkEngine::read_words`/`write_words`) against the fixed Cortex-M debug
//! register addresses rather than through ADIv5 DP/AP commands directly --
//! this requires the bridge AP path already enabled (`bridge_en(true)`,
//! `enable_ap()`), which is the caller's responsibility before driving a
//! [`DebugCore`].

#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::{Duration, Instant};

use log::debug;
use thiserror::Error;

use socdbg_adiv5::{AdivError, AdivFive, BridgeMode};
use socdbg_link::{LinkEngine, LinkError};

const DHCSR: u32 = 0xE000_EDF0;
const DCRSR: u32 = 0xE000_EDF4;
const DCRDR: u32 = 0xE000_EDF8;
const DEMCR: u32 = 0xE000_EDFC;
const AIRCR: u32 = 0xE000_ED0C;
const DFSR: u32 = 0xE000_ED30;

const C_KEY: u32 = 0xA05F_0000;
const C_DEBUGEN: u32 = 1;
const C_HALT: u32 = 2;
const C_STEP: u32 = 4;
const S_REGRDY: u32 = 1 << 16;
const S_HALT: u32 = 1 << 17;
const VC_CORERESET: u32 = 1;
const SYSRESETREQ: u32 = 1 << 2;
const REG_WNR: u32 = 1 << 16;

/// Clears all of DFSR's sticky event flags (write-one-to-clear).
const DFSR_CLEAR_ALL: u32 = 0x1F;

#[derive(Debug, Error)]
pub enum DebugError {
    #[error("timed out waiting for the core to respond")]
    Timeout,

    #[error("core did not halt")]
    NoHalt,

    #[error("invalid parameters")]
    Params,

    #[error("out of memory loading image")]
    NoMem,

    #[error("unknown error")]
    Unknown,

    #[error(transparent)]
    Link(#[from] LinkError),

    #[error(transparent)]
    Adiv(#[from] AdivError),
}

/// Cortex-M core register selector, matching `DCRSR`'s `REGSEL` encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoreRegister {
    /// R0..=R12, selector `n`.
    R(u8),
    Sp,
    Lr,
    Pc,
    Xpsr,
    Msp,
    Psp,
    /// CONTROL/FAULTMASK/BASEPRI/PRIMASK packed into selector 20; the
    /// sub-field layout within the 32-bit value is the caller's concern.
    ControlFaultmaskBasepriPrimask,
    Fpscr,
    /// FPU register S0..=S31, selector `0x40 + n`.
    S(u8),
}

impl CoreRegister {
    pub fn selector(self) -> u32 {
        match self {
            CoreRegister::R(n) => {
                debug_assert!(n <= 12);
                n as u32
            }
            CoreRegister::Sp => 13,
            CoreRegister::Lr => 14,
            CoreRegister::Pc => 15,
            CoreRegister::Xpsr => 16,
            CoreRegister::Msp => 17,
            CoreRegister::Psp => 18,
            CoreRegister::ControlFaultmaskBasepriPrimask => 20,
            CoreRegister::Fpscr => 33,
            CoreRegister::S(n) => {
                debug_assert!(n <= 31);
                0x40 + n as u32
            }
        }
    }
}

pub struct DebugCore {
    link: Arc<LinkEngine>,
    adiv5: Arc<AdivFive>,
    /// Bound on every polled wait in this module (halt, step, register
    /// ready, reset-settle) -- replaces the original's fixed one-second
    /// sleep after a reset with a responsive poll capped at the same
    /// budget.
    poll_timeout: Duration,
}

impl DebugCore {
    pub fn new(link: Arc<LinkEngine>, adiv5: Arc<AdivFive>) -> Self {
        DebugCore {
            link,
            adiv5,
            poll_timeout: Duration::from_secs(1),
        }
    }

    pub fn with_poll_timeout(mut self, timeout: Duration) -> Self {
        self.poll_timeout = timeout;
        self
    }

    fn write_reg(&self, addr: u32, value: u32) -> Result<(), DebugError> {
        self.link.write_words(addr, &[value])?;
        Ok(())
    }

    fn read_reg(&self, addr: u32) -> Result<u32, DebugError> {
        Ok(*self
            .link
            .read_words(addr, 1)?
            .first()
            .ok_or(DebugError::Unknown)?)
    }

    fn clear_dfsr(&self) -> Result<(), DebugError> {
        self.write_reg(DFSR, DFSR_CLEAR_ALL)
    }

    fn is_halted(&self) -> Result<bool, DebugError> {
        Ok(self.read_reg(DHCSR)? & S_HALT != 0)
    }

    fn poll<F>(&self, mut ready: F) -> Result<(), DebugError>
    where
        F: FnMut(&Self) -> Result<bool, DebugError>,
    {
        let start = Instant::now();
        loop {
            if ready(self)? {
                return Ok(());
            }
            if start.elapsed() >= self.poll_timeout {
                return Err(DebugError::Timeout);
            }
            std::thread::sleep(Duration::from_millis(2));
        }
    }

    /// Halts the core. With `reset = false`, repeatedly arms
    /// `DHCSR = C_KEY | C_HALT | C_DEBUGEN` and reads back until `S_HALT` is
    /// set, surfacing `DebugError::NoHalt` on timeout. With `reset = true`,
    /// arms the halt bits, sets `DEMCR.VC_CORERESET`, issues a system reset
    /// request, and polls for the core to come back up already halted --
    /// a bounded poll rather than a fixed wait, since the core may settle
    /// well before or after any single fixed duration would assume.
    pub fn halt(&self, reset: bool) -> Result<(), DebugError> {
        if !reset {
            let outcome = self.poll(|this| {
                this.write_reg(DHCSR, C_KEY | C_HALT | C_DEBUGEN)?;
                this.is_halted()
            });
            return match outcome {
                Ok(()) => {
                    self.clear_dfsr()?;
                    Ok(())
                }
                Err(DebugError::Timeout) => Err(DebugError::NoHalt),
                Err(e) => Err(e),
            };
        }

        debug!("halting with reset");
        self.write_reg(DHCSR, C_KEY | C_HALT | C_DEBUGEN)?;
        self.write_reg(DEMCR, VC_CORERESET)?;
        self.write_reg(AIRCR, SYSRESETREQ)?;
        self.poll(|this| this.is_halted())?;
        self.clear_dfsr()
    }

    pub fn run(&self) -> Result<(), DebugError> {
        self.clear_dfsr()?;
        self.write_reg(DHCSR, C_KEY)
    }

    /// Single-steps the core. The core must already be halted -- reading
    /// `DHCSR` and checking `S_HALT` is the only precondition check, and a
    /// clear bit is reported as `NoHalt` rather than attempted anyway.
    pub fn step(&self) -> Result<(), DebugError> {
        if !self.is_halted()? {
            return Err(DebugError::NoHalt);
        }
        self.write_reg(DHCSR, C_KEY | C_STEP | C_DEBUGEN)?;
        match self.poll(|this| this.is_halted()) {
            Ok(()) => Ok(()),
            Err(DebugError::Timeout) => Err(DebugError::NoHalt),
            Err(e) => Err(e),
        }
    }

    pub fn reg_read(&self, reg: CoreRegister) -> Result<u32, DebugError> {
        self.write_reg(DCRSR, reg.selector())?;
        self.poll(|this| Ok(this.read_reg(DHCSR)? & S_REGRDY != 0))?;
        self.read_reg(DCRDR)
    }

    pub fn reg_write(&self, reg: CoreRegister, value: u32) -> Result<(), DebugError> {
        self.write_reg(DCRDR, value)?;
        self.write_reg(DCRSR, reg.selector() | REG_WNR)?;
        self.poll(|this| Ok(this.read_reg(DHCSR)? & S_REGRDY != 0))
    }

    /// Loads `data` at `addr`: rounds the length up to a multiple of 4 with
    /// zero padding, switches the bridge to sequential mode, and streams
    /// the image through `write_words`. A declared size large enough to
    /// fail a fallible allocation attempt surfaces as `DebugError::NoMem`
    /// rather than aborting the process.
    pub fn load_bin(&self, addr: u32, data: &[u8]) -> Result<(), DebugError> {
        let word_count = (data.len() + 3) / 4;
        let mut words: Vec<u32> = Vec::new();
        words
            .try_reserve_exact(word_count)
            .map_err(|_| DebugError::NoMem)?;
        for chunk in data.chunks(4) {
            let mut padded = [0u8; 4];
            padded[..chunk.len()].copy_from_slice(chunk);
            words.push(u32::from_le_bytes(padded));
        }
        self.adiv5.bridge_mode(BridgeMode::Sequential)?;
        self.link.write_words(addr, &words)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_selectors_match_the_documented_table() {
        assert_eq!(CoreRegister::R(0).selector(), 0);
        assert_eq!(CoreRegister::R(12).selector(), 12);
        assert_eq!(CoreRegister::Sp.selector(), 13);
        assert_eq!(CoreRegister::Lr.selector(), 14);
        assert_eq!(CoreRegister::Pc.selector(), 15);
        assert_eq!(CoreRegister::Xpsr.selector(), 16);
        assert_eq!(CoreRegister::Msp.selector(), 17);
        assert_eq!(CoreRegister::Psp.selector(), 18);
        assert_eq!(CoreRegister::ControlFaultmaskBasepriPrimask.selector(), 20);
        assert_eq!(CoreRegister::Fpscr.selector(), 33);
        assert_eq!(CoreRegister::S(0).selector(), 0x40);
        assert_eq!(CoreRegister::S(31).selector(), 0x5F);
    }
}

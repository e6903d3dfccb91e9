// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! ADIv5 debug port (DP) and access port (AP) driver, speaking to the
//! bridge's `adiv5_data`/`adiv5_cmd`/`adiv5_status` CSR trio rather than to
//! SWD/JTAG wire signaling directly -- the gateware is the one bit-banging
//! the physical protocol.

#![forbid(unsafe_code)]

use std::cell::Cell;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, trace};
use thiserror::Error;

use socdbg_csr::{CsrError, CsrMap};
use socdbg_link::LinkEngine;

/// Default bound on the `adiv5_status` "done" poll. The original's
/// unbounded spin is replaced with this wall-clock budget so a wedged
/// device surfaces as a timeout instead of hanging the caller forever.
pub const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_millis(100);

#[derive(Debug, Error)]
pub enum AdivError {
    #[error(transparent)]
    Csr(#[from] CsrError),

    #[error("ADIv5 transaction returned {0}")]
    Status(ADIv5Status),

    #[error("timed out waiting for ADIv5 status to settle")]
    Timeout,
}

/// Status code occupying bits [7:2] of `adiv5_status` once bit 1 ("done")
/// is set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ADIv5Status {
    Fault,
    Timeout,
    Ok,
    NoConnect,
    Other(u8),
}

impl ADIv5Status {
    fn from_code(code: u8) -> Self {
        match code {
            1 => ADIv5Status::Fault,
            2 => ADIv5Status::Timeout,
            4 => ADIv5Status::Ok,
            7 => ADIv5Status::NoConnect,
            other => ADIv5Status::Other(other),
        }
    }
}

impl fmt::Display for ADIv5Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ADIv5Status::Fault => write!(f, "FAULT"),
            ADIv5Status::Timeout => write!(f, "TIMEOUT"),
            ADIv5Status::Ok => write!(f, "OK"),
            ADIv5Status::NoConnect => write!(f, "NOCONNECT"),
            ADIv5Status::Other(code) => write!(f, "UNKNOWN({code})"),
        }
    }
}

impl std::error::Error for ADIv5Status {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phy {
    Swd,
    Jtag,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeMode {
    Normal,
    Sequential,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Op {
    DpWrite = 0,
    DpRead = 1,
    ApWrite = 2,
    ApRead = 3,
}

/// The pseudo DP register address that resets the link / switches protocol.
/// Writes to it never produce a response.
const DP_RESET_PSWITCH: u8 = 0xC;
const DP_SELECT: u8 = 0x8;
const DP_IDR: u8 = 0x0;
const DP_CTRL_STAT: u8 = 0x4;

pub struct AdivFive {
    csr: Arc<CsrMap>,
    link: Arc<LinkEngine>,
    /// Currently selected AP index. Per the later revision of the driver
    /// this is replacing, AP selection is state set by `bridge_ap_sel`, not
    /// a parameter threaded through every `read_ap`/`write_ap` call.
    ap: Cell<u8>,
    poll_timeout: Duration,
}

impl AdivFive {
    pub fn new(csr: Arc<CsrMap>, link: Arc<LinkEngine>) -> Self {
        AdivFive {
            csr,
            link,
            ap: Cell::new(0),
            poll_timeout: DEFAULT_POLL_TIMEOUT,
        }
    }

    pub fn with_poll_timeout(mut self, timeout: Duration) -> Self {
        self.poll_timeout = timeout;
        self
    }

    fn issue(&self, addr: u8, op: Op) -> Result<(), AdivError> {
        let cmd = (addr & 0xC) | (op as u8);
        self.csr.set_adiv5_cmd(cmd as u32)?;
        self.poll_done()
    }

    /// Polls `adiv5_status` until bit 1 ("done") is set, bounded by
    /// `poll_timeout` with linear backoff between attempts. Resolves the
    /// status code (bits [7:2]) into `Ok(())` or `Err(AdivError::Status)`.
    fn poll_done(&self) -> Result<(), AdivError> {
        let start = std::time::Instant::now();
        let mut attempt: u32 = 0;
        loop {
            let raw = self.csr.adiv5_status()? as u8;
            if raw & 0b10 != 0 {
                let status = ADIv5Status::from_code(raw >> 2);
                return if status == ADIv5Status::Ok {
                    Ok(())
                } else {
                    Err(AdivError::Status(status))
                };
            }
            if start.elapsed() >= self.poll_timeout {
                return Err(AdivError::Timeout);
            }
            attempt += 1;
            std::thread::sleep(Duration::from_micros(100) * attempt.min(20));
        }
    }

    pub fn write_dp(&self, addr: u8, data: u32) -> Result<(), AdivError> {
        self.csr.set_adiv5_data(data)?;
        if addr & 0xC == DP_RESET_PSWITCH {
            // Address 0xC never produces a response; firing the command and
            // returning immediately is correct, not a missed poll.
            self.csr.set_adiv5_cmd(((addr & 0xC) | (Op::DpWrite as u8)) as u32)?;
            return Ok(());
        }
        self.issue(addr, Op::DpWrite)
    }

    pub fn read_dp(&self, addr: u8) -> Result<u32, AdivError> {
        self.issue(addr, Op::DpRead)?;
        Ok(self.csr.adiv5_data()?)
    }

    pub fn write_ap(&self, addr: u8, data: u32) -> Result<(), AdivError> {
        let select = ((self.ap.get() as u32) << 24) | (addr as u32 & 0xF0);
        self.write_dp(DP_SELECT, select)?;
        self.csr.set_adiv5_data(data)?;
        self.issue(addr, Op::ApWrite)
    }

    pub fn read_ap(&self, addr: u8) -> Result<u32, AdivError> {
        let select = ((self.ap.get() as u32) << 24) | (addr as u32 & 0xF0);
        self.write_dp(DP_SELECT, select)?;
        self.issue(addr, Op::ApRead)?;
        Ok(self.csr.adiv5_data()?)
    }

    /// Resets the link (and, if `pswitch`, switches wire protocol), then
    /// always follows up with a `read_dp(IDR)` to latch the device's ID
    /// register -- not optional, the caller gets the IDCODE back.
    pub fn reset(&self, pswitch: bool) -> Result<u32, AdivError> {
        self.write_dp(DP_RESET_PSWITCH, 0)?;
        if pswitch {
            self.write_dp(DP_RESET_PSWITCH, 1)?;
        }
        self.read_dp(DP_IDR)
    }

    pub fn set_phy(&self, phy: Phy) -> Result<(), AdivError> {
        debug!("setting phy to {phy:?}");
        self.csr
            .set_jtag_n_swd(matches!(phy, Phy::Jtag) as u32)
            .map_err(AdivError::from)
    }

    pub fn bridge_ap_sel(&self, ap: u8) -> Result<(), AdivError> {
        self.ap.set(ap);
        self.csr.set_bridge_ap_sel(ap as u32)?;
        Ok(())
    }

    pub fn bridge_en(&self, enable: bool) -> Result<(), AdivError> {
        self.csr.set_bridge_en(enable as u32)?;
        Ok(())
    }

    pub fn bridge_mode(&self, mode: BridgeMode) -> Result<(), AdivError> {
        self.csr
            .set_bridge_mode(matches!(mode, BridgeMode::Sequential) as u32)?;
        Ok(())
    }

    pub fn bridge_irq_scan_en(&self, enable: bool) -> Result<(), AdivError> {
        self.csr.set_bridge_irq_scan_en(enable as u32)?;
        Ok(())
    }

    pub fn bridge_irq_buf(&self, addr: u32) -> Result<(), AdivError> {
        self.csr.set_bridge_irq_buf(addr)?;
        Ok(())
    }

    /// Installs a thin adapter on the link's slave channel that validates
    /// the frame and forwards `(ctl, irq)` to `handler`. The link already
    /// guarantees frames on the slave channel carry exactly two payload
    /// bytes, so there is no length to re-check here -- unlike the
    /// original's defensive length assertion, which guarded against a raw
    /// byte stream with no framing at all.
    pub fn register_irq_handler(&self, mut handler: impl FnMut(u8, u8) + Send + 'static) {
        self.link.on_slave(Box::new(move |ctl, irq| {
            trace!("irq: ctl={ctl:#04x} irq={irq}");
            handler(ctl, irq);
        }));
    }

    /// Acknowledges a delivered IRQ by writing `ctl` back as a bare byte on
    /// the slave channel, bypassing the command framing entirely.
    pub fn irq_ack(&self, ctl: u8) -> Result<(), AdivError> {
        self.link.send_raw_byte(ctl).map_err(CsrError::from)?;
        Ok(())
    }

    /// Polls `DP[CTRL/STAT]` until bits [31:28] read back `0xF` (CSYSPWRUPACK
    /// | CDBGPWRUPACK both set), then programs `AP[CSW]` with the default
    /// privileged 32-bit transfer mode.
    pub fn enable_ap(&self) -> Result<(), AdivError> {
        let start = std::time::Instant::now();
        loop {
            let stat = self.read_dp(DP_CTRL_STAT)?;
            if stat >> 28 == 0xF {
                break;
            }
            if start.elapsed() >= self.poll_timeout {
                return Err(AdivError::Timeout);
            }
            std::thread::sleep(Duration::from_micros(200));
        }
        self.write_ap(0x00, 0xA300_0042)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_map_to_known_variants() {
        assert_eq!(ADIv5Status::from_code(1), ADIv5Status::Fault);
        assert_eq!(ADIv5Status::from_code(2), ADIv5Status::Timeout);
        assert_eq!(ADIv5Status::from_code(4), ADIv5Status::Ok);
        assert_eq!(ADIv5Status::from_code(7), ADIv5Status::NoConnect);
        assert_eq!(ADIv5Status::from_code(3), ADIv5Status::Other(3));
    }

    #[test]
    fn status_display_is_human_readable() {
        assert_eq!(ADIv5Status::Ok.to_string(), "OK");
        assert_eq!(ADIv5Status::Other(9).to_string(), "UNKNOWN(9)");
    }
}

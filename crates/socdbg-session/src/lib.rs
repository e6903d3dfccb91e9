// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Session lifecycle: wires `Transport -> LinkEngine -> CsrMap -> AdivFive ->
//! DebugCore` into one value with a single open/close lifecycle.
//!
//! Per the design notes this replaces the original's process-global
//! singleton with an explicit value the caller owns for the lifetime of one
//! target; there is no static instance anywhere in this crate, and no
//! reconnect path -- a transport error during the session's life is fatal
//! and the caller is expected to drop the `Session` and start over.

#![forbid(unsafe_code)]

#[cfg(feature = "test-util")]
pub mod mock;

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use log::info;
use thiserror::Error;

use socdbg_adiv5::AdivFive;
use socdbg_csr::{CsrError, CsrMap};
use socdbg_debug::DebugCore;
use socdbg_link::{LinkEngine, SpeedClass};
use socdbg_transport::{DeviceId, Transport, TransportError};

/// Fixed CSR base address from §6.3.
pub const CSR_BASE: u32 = 0xF000_0000;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Csr(#[from] CsrError),
}

/// Knobs a caller may set before [`Session::open`] wires everything
/// together. Defaults mirror the specification's stated defaults: speed
/// class `high` (§4.4), a CSR base of `0xF000_0000` (§6.3).
#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub speed_class: SpeedClass,
    /// Blocking-read deadline applied to the transport; see
    /// [`socdbg_transport::open`].
    pub read_timeout: Duration,
    pub csr_base: u32,
    /// Bound applied to every polled wait `AdivFive` and `DebugCore` perform
    /// (ADIv5 status "done", Cortex-M halt/step/register-ready). Threaded
    /// through at session construction since both drivers are handed out as
    /// `Arc`s afterward and have no interior mutability for this knob.
    pub poll_timeout: Duration,
}

impl Default for SessionOptions {
    fn default() -> Self {
        SessionOptions {
            speed_class: SpeedClass::High,
            read_timeout: Duration::from_secs(1),
            csr_base: CSR_BASE,
            poll_timeout: socdbg_adiv5::DEFAULT_POLL_TIMEOUT,
        }
    }
}

/// One process-owned debug session: a [`Transport`] wrapped by a
/// [`LinkEngine`], with [`CsrMap`], [`AdivFive`], and [`DebugCore`] layered
/// on top of that single link.
///
/// `Session` has no `Clone` impl and no global instance; "exactly one target
/// per process" (§1 Non-goals) falls out of ordinary ownership rather than a
/// runtime-enforced singleton.
pub struct Session {
    link: Arc<LinkEngine>,
    csr: Arc<CsrMap>,
    adiv5: Arc<AdivFive>,
    debug: Arc<DebugCore>,
    description: String,
}

impl Session {
    /// Parses `id` per §6.2 and opens the resulting device, wiring the full
    /// stack and validating the CSR schema. A schema mismatch is fatal, per
    /// §4.8.
    pub fn open(id: &str, opts: SessionOptions) -> Result<Session, SessionError> {
        let device_id = DeviceId::from_str(id)?;
        Self::open_device(&device_id, opts)
    }

    /// As [`Session::open`], but takes an already-parsed [`DeviceId`].
    pub fn open_device(id: &DeviceId, opts: SessionOptions) -> Result<Session, SessionError> {
        let transport = socdbg_transport::open(id, opts.read_timeout)?;
        Self::with_transport(transport, opts)
    }

    /// Builds a session directly over an already-open transport. Used by
    /// [`Session::open`]/[`Session::open_device`], and by tests driving the
    /// in-process mock bridge in the `mock` module.
    pub fn with_transport(
        transport: Box<dyn Transport>,
        opts: SessionOptions,
    ) -> Result<Session, SessionError> {
        let description = transport.description();
        info!("opening session on {description}");

        let link = Arc::new(LinkEngine::new(transport)?);
        link.set_speed_class(opts.speed_class);

        let csr = Arc::new(CsrMap::new(Arc::clone(&link), opts.csr_base));
        csr.validate()?;

        let adiv5 = Arc::new(
            AdivFive::new(Arc::clone(&csr), Arc::clone(&link)).with_poll_timeout(opts.poll_timeout),
        );
        let debug = Arc::new(
            DebugCore::new(Arc::clone(&link), Arc::clone(&adiv5)).with_poll_timeout(opts.poll_timeout),
        );

        Ok(Session {
            link,
            csr,
            adiv5,
            debug,
            description,
        })
    }

    pub fn link(&self) -> &Arc<LinkEngine> {
        &self.link
    }

    pub fn csr(&self) -> &Arc<CsrMap> {
        &self.csr
    }

    pub fn adiv5(&self) -> &Arc<AdivFive> {
        &self.adiv5
    }

    pub fn debug(&self) -> &Arc<DebugCore> {
        &self.debug
    }

    /// A human-readable identifier for the underlying transport, for
    /// logging at the CLI boundary.
    pub fn description(&self) -> &str {
        &self.description
    }

    /// Tears the session down: signals the reader/slave-dispatch threads to
    /// exit, joins them, and closes the transport. Idempotent -- safe to
    /// call before `Drop` runs, which calls this again.
    pub fn close(&self) {
        self.link.close();
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.close();
    }
}

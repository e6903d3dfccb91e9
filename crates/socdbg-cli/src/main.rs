// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Command-line front end for the debug bridge host engine. This binary is
//! the one place in the workspace that's allowed to log-and-exit on a fatal
//! error -- every library crate underneath it returns a typed `Result`
//! instead, so the same stack is usable from a test harness or another
//! program without going through a process exit.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use log::{error, info, LevelFilter};

use socdbg_adiv5::Phy;
use socdbg_link::SpeedClass;
use socdbg_session::{Session, SessionOptions};

/// One `--load FILE[@ADDR]` argument: a binary image and the address to
/// stream it to. `ADDR` may be omitted, in which case the image is loaded
/// at [`DEFAULT_LOAD_ADDR`].
#[derive(Debug, Clone)]
struct LoadSpec {
    path: PathBuf,
    addr: Option<u32>,
}

/// SRAM base used by the end-to-end scenarios in the spec's test suite when
/// no explicit `@ADDR` is given.
const DEFAULT_LOAD_ADDR: u32 = 0x2000_0000;

impl FromStr for LoadSpec {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, String> {
        match s.rsplit_once('@') {
            Some((path, addr)) => {
                let addr = parse_u32(addr)
                    .map_err(|e| format!("invalid load address '{addr}': {e}"))?;
                Ok(LoadSpec { path: PathBuf::from(path), addr: Some(addr) })
            }
            None => Ok(LoadSpec { path: PathBuf::from(s), addr: None }),
        }
    }
}

fn parse_u32(s: &str) -> Result<u32, String> {
    let s = s.trim();
    let result = if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u32::from_str_radix(hex, 16)
    } else {
        s.parse()
    };
    result.map_err(|e| e.to_string())
}

#[derive(Debug, Clone, Copy, clap::ValueEnum)]
enum SpeedArg {
    High,
    Low,
}

impl From<SpeedArg> for SpeedClass {
    fn from(s: SpeedArg) -> Self {
        match s {
            SpeedArg::High => SpeedClass::High,
            SpeedArg::Low => SpeedClass::Low,
        }
    }
}

#[derive(Debug, Clone, Copy, clap::ValueEnum)]
enum PhyArg {
    Swd,
    Jtag,
}

impl From<PhyArg> for Phy {
    fn from(p: PhyArg) -> Self {
        match p {
            PhyArg::Swd => Phy::Swd,
            PhyArg::Jtag => Phy::Jtag,
        }
    }
}

/// Host-side driver for the SoC debug bridge: opens a session against a USB
/// or TCP-attached bridge, optionally switches PHY/resets the target, loads
/// one or more binary images, and exits.
#[derive(Debug, Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Device identifier: `host:port` for TCP, a USB serial number (or `0`/
    /// empty for "first match") otherwise.
    device_id: String,

    /// Binary image to load, optionally at an explicit address
    /// (`image.bin@0x20000000`). Repeatable; images are loaded in the order
    /// given.
    #[arg(long = "load", value_name = "FILE[@ADDR]")]
    loads: Vec<LoadSpec>,

    /// Verbosity, 0 (errors only) through 4 (byte-level transport/register
    /// tracing).
    #[arg(long, default_value_t = 1, value_parser = parse_verbosity)]
    verbose: u8,

    /// Outbound batching tuning; `high` suits an internal BRAM/CSR bridge,
    /// `low` a slow external one.
    #[arg(long, value_enum, default_value_t = SpeedArg::High)]
    speed: SpeedArg,

    /// Switch the bridge's physical debug interface before doing anything
    /// else.
    #[arg(long, value_enum)]
    phy: Option<PhyArg>,

    /// Reset the target (and, unless `--no-pswitch` is also given, switch
    /// wire protocol) before loading images.
    #[arg(long)]
    reset: bool,

    /// With `--reset`, skip the protocol-switch half of the reset handshake.
    #[arg(long)]
    no_pswitch: bool,

    /// Bound, in milliseconds, on every polled wait this session performs
    /// (ADIv5 status, core halt/step/register-ready).
    #[arg(long, default_value_t = 100)]
    timeout_ms: u64,
}

fn parse_verbosity(s: &str) -> Result<u8, String> {
    let v: u8 = s.parse().map_err(|_| format!("'{s}' is not a number"))?;
    if v > 4 {
        return Err(format!("verbosity must be 0..=4, got {v}"));
    }
    Ok(v)
}

fn verbosity_to_filter(v: u8) -> LevelFilter {
    match v {
        0 => LevelFilter::Error,
        1 => LevelFilter::Info,
        2 => LevelFilter::Debug,
        3 | 4 => LevelFilter::Trace,
        _ => unreachable!("clap enforces 0..=4"),
    }
}

fn run(args: Args) -> Result<()> {
    let poll_timeout = Duration::from_millis(args.timeout_ms);

    let opts = SessionOptions {
        speed_class: args.speed.into(),
        poll_timeout,
        ..SessionOptions::default()
    };

    let session = Session::open(&args.device_id, opts)
        .with_context(|| format!("opening session on '{}'", args.device_id))?;
    info!("session open on {}", session.description());

    if let Some(phy) = args.phy {
        session
            .adiv5()
            .set_phy(phy.into())
            .context("selecting PHY")?;
    }

    if args.reset {
        let idcode = session
            .adiv5()
            .reset(!args.no_pswitch)
            .context("resetting target")?;
        info!("target IDCODE after reset: {idcode:#010x}");
    }

    for load in &args.loads {
        let addr = load.addr.unwrap_or(DEFAULT_LOAD_ADDR);
        let data = std::fs::read(&load.path)
            .with_context(|| format!("reading '{}'", load.path.display()))?;
        info!(
            "loading {} ({} bytes) at {addr:#010x}",
            load.path.display(),
            data.len()
        );
        session
            .debug()
            .load_bin(addr, &data)
            .with_context(|| format!("loading '{}'", load.path.display()))?;
    }

    session.close();
    Ok(())
}

fn main() {
    let args = Args::parse();
    env_logger::Builder::from_env(
        env_logger::Env::default()
            .default_filter_or(verbosity_to_filter(args.verbose).to_string()),
    )
    .init();

    if let Err(e) = run(args) {
        error!("{e:#}");
        std::process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_spec_parses_bare_path() {
        let spec: LoadSpec = "image.bin".parse().unwrap();
        assert_eq!(spec.path, PathBuf::from("image.bin"));
        assert_eq!(spec.addr, None);
    }

    #[test]
    fn load_spec_parses_hex_address() {
        let spec: LoadSpec = "image.bin@0x20000000".parse().unwrap();
        assert_eq!(spec.path, PathBuf::from("image.bin"));
        assert_eq!(spec.addr, Some(0x2000_0000));
    }

    #[test]
    fn load_spec_parses_decimal_address() {
        let spec: LoadSpec = "image.bin@1024".parse().unwrap();
        assert_eq!(spec.addr, Some(1024));
    }

    #[test]
    fn load_spec_rejects_bad_address() {
        assert!("image.bin@notanumber".parse::<LoadSpec>().is_err());
    }

    #[test]
    fn verbosity_maps_monotonically() {
        assert_eq!(verbosity_to_filter(0), LevelFilter::Error);
        assert_eq!(verbosity_to_filter(1), LevelFilter::Info);
        assert_eq!(verbosity_to_filter(2), LevelFilter::Debug);
        assert_eq!(verbosity_to_filter(4), LevelFilter::Trace);
    }

    #[test]
    fn args_parse_minimal_invocation() {
        let args = Args::parse_from(["socdbg", "0"]);
        assert_eq!(args.device_id, "0");
        assert!(args.loads.is_empty());
        assert_eq!(args.verbose, 1);
    }

    #[test]
    fn args_parse_full_invocation() {
        let args = Args::parse_from([
            "socdbg",
            "--load",
            "a.bin@0x20000000",
            "--load",
            "b.bin",
            "--verbose",
            "3",
            "--speed",
            "low",
            "--phy",
            "jtag",
            "--reset",
            "--no-pswitch",
            "--timeout-ms",
            "50",
            "localhost:9000",
        ]);
        assert_eq!(args.device_id, "localhost:9000");
        assert_eq!(args.loads.len(), 2);
        assert_eq!(args.loads[0].addr, Some(0x2000_0000));
        assert_eq!(args.loads[1].addr, None);
        assert!(args.reset);
        assert!(args.no_pswitch);
        assert_eq!(args.timeout_ms, 50);
    }
}

// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! End-to-end scenarios driven against the in-process mock bridge, standing
//! in for the gateware simulator and `test/api`/`test/irq` harnesses the
//! spec's scenario list was originally checked against.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use socdbg_adiv5::{BridgeMode, Phy};
use socdbg_session::mock::{spawn_fake_bridge, FakeBridgeConfig};
use socdbg_session::{Session, SessionOptions};

fn open_mock_session() -> Session {
    let (transport, _handle) = spawn_fake_bridge(FakeBridgeConfig::default());
    Session::with_transport(Box::new(transport), SessionOptions::default())
        .expect("opening session against the mock bridge")
}

/// Scenario 1: connect + identify. A successful `Session::open` already ran
/// `CsrMap::validate()` with no mismatch; `flexsoc_id()` must additionally
/// report the fixed gateware identity constant in its top 28 bits.
#[test]
fn connect_and_identify() {
    let session = open_mock_session();
    assert!(session.csr().validate().is_ok());
    let id = session.csr().flexsoc_id().unwrap();
    assert_eq!(id >> 4, 0xF1EC_DB6);
    session.close();
}

/// Scenario 2: SWD DP read of IDCODE.
#[test]
fn swd_dp_read_of_idcode() {
    let session = open_mock_session();
    session.adiv5().set_phy(Phy::Swd).unwrap();
    session.adiv5().reset(true).unwrap();
    let idcode = session.adiv5().read_dp(0x0).unwrap();
    assert_eq!(idcode, 0x2BA0_1477);
    session.close();
}

/// Scenario 3: JTAG DP read of IDCODE.
#[test]
fn jtag_dp_read_of_idcode() {
    let session = open_mock_session();
    session.adiv5().set_phy(Phy::Jtag).unwrap();
    session.adiv5().reset(false).unwrap();
    let idcode = session.adiv5().read_dp(0x0).unwrap();
    assert_eq!(idcode, 0x4BA0_0477);
    session.close();
}

/// Scenario 4: MEM-AP IDR after AP enable.
#[test]
fn mem_ap_idr_after_ap_enable() {
    let session = open_mock_session();
    // Power up DP.CTRL/STAT so `enable_ap`'s poll observes the acknowledge
    // bits the mock sets when bit 28 of a DP[4] write is set.
    session.adiv5().write_dp(0x4, 0x5000_0000).unwrap();
    session.adiv5().enable_ap().unwrap();
    let idr = session.adiv5().read_ap(0xFC).unwrap();
    assert_eq!(idr, 0x2477_0011);
    session.close();
}

/// Scenario 5: memory byte/half/word round-trip through the bridge, in both
/// NORMAL and SEQUENTIAL bridge modes.
#[test]
fn memory_round_trip_via_bridge() {
    let session = open_mock_session();
    session.adiv5().bridge_en(true).unwrap();

    for mode in [BridgeMode::Normal, BridgeMode::Sequential] {
        session.adiv5().bridge_mode(mode).unwrap();

        let bytes: Vec<u8> = (0..1024u32).map(|i| (i.wrapping_mul(37).wrapping_add(11)) as u8).collect();
        session.link().write_bytes(0x2000_0000, &bytes).unwrap();
        let read_back = session.link().read_bytes(0x2000_0000, bytes.len()).unwrap();
        assert_eq!(read_back, bytes);

        let halves: Vec<u16> = (0..256u32).map(|i| (i.wrapping_mul(709) & 0xFFFF) as u16).collect();
        session.link().write_halves(0x2010_0000, &halves).unwrap();
        let read_back = session.link().read_halves(0x2010_0000, halves.len()).unwrap();
        assert_eq!(read_back, halves);

        let words: Vec<u32> = (0..128u32).map(|i| i.wrapping_mul(0x9E37_79B9)).collect();
        session.link().write_words(0x2020_0000, &words).unwrap();
        let read_back = session.link().read_words(0x2020_0000, words.len()).unwrap();
        assert_eq!(read_back, words);
    }
    session.close();
}

/// Scenario 6: IRQ injection. Four pulses must reach the registered
/// callback in order, each followed by an acknowledgement.
#[test]
fn irq_injection_delivers_in_order_and_acks() {
    let (transport, handle) = spawn_fake_bridge(FakeBridgeConfig::default());
    let session = Session::with_transport(Box::new(transport), SessionOptions::default())
        .expect("opening session against the mock bridge");

    // Stand in for "load irq_simple, run, enable NVIC IRQs 0..3" -- the
    // mock bridge has no real core to run, so this exercises the same API
    // surface the scenario names without depending on simulated execution.
    session
        .debug()
        .load_bin(0x2000_0000, &[0u8; 16])
        .unwrap();
    session.adiv5().bridge_irq_scan_en(true).unwrap();
    session.link().write_words(0xE000_E100, &[0xF]).unwrap();

    let seen: Arc<Mutex<Vec<(u8, u8)>>> = Arc::new(Mutex::new(Vec::new()));
    let seen_cb = Arc::clone(&seen);
    let adiv5_for_ack = Arc::clone(session.adiv5());
    session.adiv5().register_irq_handler(move |ctl, irq| {
        seen_cb.lock().unwrap().push((ctl, irq));
        adiv5_for_ack.irq_ack(ctl).expect("ack from within the slave callback");
    });

    let expected = [(1u8, 16u8), (2, 17), (3, 18), (4, 19)];
    for (ctl, irq) in expected {
        handle.pulse_irq(ctl, irq);
    }

    let deadline = Instant::now() + Duration::from_secs(2);
    while seen.lock().unwrap().len() < expected.len() && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(5));
    }

    assert_eq!(*seen.lock().unwrap(), expected.to_vec());

    let ack_deadline = Instant::now() + Duration::from_secs(2);
    while handle.pending_acks() > 0 && Instant::now() < ack_deadline {
        std::thread::sleep(Duration::from_millis(5));
    }
    assert_eq!(handle.pending_acks(), 0, "every delivered IRQ must be acked");

    session.close();
}

/// Zero-length bulk operations return immediately with no transport
/// traffic and no response leakage.
#[test]
fn zero_length_bulk_ops_are_no_ops() {
    let session = open_mock_session();
    assert_eq!(session.link().read_bytes(0x2000_0000, 0).unwrap(), Vec::<u8>::new());
    session.link().write_bytes(0x2000_0000, &[]).unwrap();
    session.close();
}

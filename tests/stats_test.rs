//! Functional tests - Device statistics
//!
//! These tests verify statistics snapshot arithmetic, including:
//! - Packet and bit rate computation
//! - Counter rollover handling
//! - Display formatting

use rawnic::DeviceStats;

fn snapshot(rx_pkts: u64, tx_pkts: u64, rx_bytes: u64, tx_bytes: u64) -> DeviceStats {
    DeviceStats {
        rx_pkts,
        tx_pkts,
        rx_bytes,
        tx_bytes,
    }
}

const ONE_SECOND: u64 = 1_000_000_000;

#[test]
fn test_packet_rate() {
    let old = snapshot(0, 0, 0, 0);
    let new = snapshot(14_800_000, 7_400_000, 0, 0);

    assert!((new.rx_mpps(&old, ONE_SECOND) - 14.8).abs() < 1e-9);
    assert!((new.tx_mpps(&old, ONE_SECOND) - 7.4).abs() < 1e-9);
}

#[test]
fn test_packet_rate_scales_with_time() {
    let old = snapshot(0, 0, 0, 0);
    let new = snapshot(1_000_000, 0, 0, 0);

    // the same count over half the time doubles the rate
    assert!((new.rx_mpps(&old, ONE_SECOND / 2) - 2.0).abs() < 1e-9);
}

#[test]
fn test_bit_rate_includes_framing_overhead() {
    let old = snapshot(0, 0, 0, 0);
    // one million 60-byte packets in one second
    let new = snapshot(1_000_000, 0, 60_000_000, 0);

    // 60 bytes of payload plus 20 bytes of preamble and inter-frame gap
    let expected = 60.0 * 8.0 + 20.0 * 8.0;
    assert!((new.rx_mbit(&old, ONE_SECOND) - expected).abs() < 1e-6);
}

#[test]
fn test_rate_of_idle_device_is_zero() {
    let old = snapshot(5, 5, 300, 300);
    let new = old;

    assert_eq!(new.rx_mpps(&old, ONE_SECOND), 0.0);
    assert_eq!(new.tx_mbit(&old, ONE_SECOND), 0.0);
}

#[test]
fn test_counter_rollover() {
    // the counters wrapped between the two snapshots
    let old = snapshot(u64::MAX - 4, 0, u64::MAX - 299, 0);
    let new = snapshot(5, 0, 300, 0);

    // 10 packets and 600 bytes happened regardless of the wrap
    assert!((new.rx_mpps(&old, ONE_SECOND) - 10e-6).abs() < 1e-12);
    let expected_mbit = 600.0 * 8.0 / 1e6 + 10e-6 * 160.0;
    assert!((new.rx_mbit(&old, ONE_SECOND) - expected_mbit).abs() < 1e-9);
}

#[test]
fn test_stats_display() {
    let stats = snapshot(1, 2, 3, 4);
    assert_eq!(
        stats.to_string(),
        "rx_pkts: 1, tx_pkts: 2, rx_bytes: 3, tx_bytes: 4"
    );
}

#[test]
fn test_stats_default_is_zeroed() {
    let stats = DeviceStats::default();
    assert_eq!(stats.rx_pkts, 0);
    assert_eq!(stats.tx_pkts, 0);
    assert_eq!(stats.rx_bytes, 0);
    assert_eq!(stats.tx_bytes, 0);
}

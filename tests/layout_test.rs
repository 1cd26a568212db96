//! Functional tests - Memory layout and diagnostics
//!
//! These tests verify compile-time layout decisions and the diagnostics the
//! binaries print on initialization failure.

use rawnic::descriptor::{AdvancedRxDescriptor, AdvancedTxDescriptor};
use rawnic::{DriverError, PACKET_HEADROOM};
use std::mem;

#[test]
fn test_descriptors_are_16_bytes() {
    // both descriptor formats are 16 bytes on the wire
    assert_eq!(mem::size_of::<AdvancedRxDescriptor>(), 16);
    assert_eq!(mem::size_of::<AdvancedTxDescriptor>(), 16);
}

#[test]
fn test_headroom_fits_virtio_header() {
    // the virtio backend writes its 12-byte header into the headroom
    assert!(PACKET_HEADROOM >= 12);
}

#[test]
fn test_valid_mempool_entry_sizes() {
    const HUGE_PAGE_SIZE: usize = 2 * 1024 * 1024;

    // buffers must not straddle hugepage boundaries
    let valid_sizes = [2048, 4096, 8192, 16384, 65536];
    for &size in &valid_sizes {
        assert_eq!(HUGE_PAGE_SIZE % size, 0, "size {size} should divide the page");
    }

    let invalid_sizes = [100, 1536, 3000, 5000];
    for &size in &invalid_sizes {
        assert_ne!(HUGE_PAGE_SIZE % size, 0, "size {size} should not divide the page");
    }
}

#[test]
fn test_not_a_nic_diagnostic() {
    let err = DriverError::NotANic {
        pci_addr: "0000:03:00.0".to_string(),
        class: 0x01,
    };

    // the diagnostic names the device and says "not a NIC"
    let message = err.to_string();
    assert!(message.contains("0000:03:00.0"));
    assert!(message.contains("not a NIC"));
}

#[test]
fn test_queue_alignment_diagnostic() {
    let message = DriverError::QueueNotAligned.to_string();
    assert!(message.contains("power of 2"));
}

#[test]
fn test_io_error_keeps_context_and_source() {
    use std::error::Error;
    use std::io;

    let err = DriverError::Io {
        context: "opening /sys/bus/pci/devices/0000:03:00.0/config".to_string(),
        source: io::Error::from(io::ErrorKind::NotFound),
    };

    assert!(err.to_string().contains("0000:03:00.0"));
    assert!(err.source().is_some());
}

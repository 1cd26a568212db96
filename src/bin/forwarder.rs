//! Bidirectional packet forwarder demo.
//!
//! Moves packets between two devices in both directions, swapping the
//! Ethernet source and destination addresses, and prints per-device
//! throughput once per second.
//!
//! Usage: `forwarder <pci bus id 1> <pci bus id 2>`

use std::collections::VecDeque;
use std::env;
use std::error::Error;
use std::process;
use std::time::Instant;

use rawnic::memory::Packet;
use rawnic::{init_device, DeviceStats, NicDevice};

const BATCH_SIZE: usize = 32;

/// Moves one batch from `rx_dev` to `tx_dev`, swapping the MAC addresses.
/// Packets the transmit ring does not accept are dropped; their buffers
/// return to the mempool.
fn forward(
    rx_dev: &mut dyn NicDevice,
    tx_dev: &mut dyn NicDevice,
    buffers: &mut VecDeque<Packet>,
) {
    let received = rx_dev.rx_batch(0, buffers, BATCH_SIZE);
    if received > 0 {
        for p in buffers.iter_mut() {
            let data = p.as_mut_bytes();
            if data.len() >= 12 {
                for i in 0..6 {
                    data.swap(i, i + 6);
                }
            }
        }

        tx_dev.tx_batch(0, buffers);
        buffers.clear();
    }
}

fn run(pci_addr_1: &str, pci_addr_2: &str) -> Result<(), Box<dyn Error>> {
    let mut dev1 = init_device(pci_addr_1, 1, 1)?;
    let mut dev2 = init_device(pci_addr_2, 1, 1)?;

    let mut buffers: VecDeque<Packet> = VecDeque::with_capacity(BATCH_SIZE);

    let mut stats1 = DeviceStats::default();
    let mut stats1_old = DeviceStats::default();
    let mut stats2 = DeviceStats::default();
    let mut stats2_old = DeviceStats::default();
    dev1.reset_stats();
    dev2.reset_stats();

    let mut time = Instant::now();
    let mut counter = 0u32;

    loop {
        forward(dev1.as_mut(), dev2.as_mut(), &mut buffers);
        forward(dev2.as_mut(), dev1.as_mut(), &mut buffers);

        counter += 1;
        if counter & 0xFFF == 0 {
            let elapsed = time.elapsed();
            if elapsed.as_secs() >= 1 {
                let nanos = elapsed.as_nanos() as u64;

                dev1.read_stats(&mut stats1);
                println!("[{}]", dev1.get_pci_addr());
                stats1.print_stats_diff(&stats1_old, nanos);
                stats1_old = stats1;

                dev2.read_stats(&mut stats2);
                println!("[{}]", dev2.get_pci_addr());
                stats2.print_stats_diff(&stats2_old, nanos);
                stats2_old = stats2;

                time = Instant::now();
            }
        }
    }
}

fn main() {
    env_logger::init();

    let mut args = env::args().skip(1);
    let (pci_addr_1, pci_addr_2) = match (args.next(), args.next()) {
        (Some(a), Some(b)) => (a, b),
        _ => {
            eprintln!("usage: forwarder <pci bus id 1> <pci bus id 2>");
            process::exit(1);
        }
    };

    if let Err(e) = run(&pci_addr_1, &pci_addr_2) {
        eprintln!("forwarder: {e}");
        process::exit(1);
    }
}

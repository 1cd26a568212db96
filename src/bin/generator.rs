//! Packet generator demo.
//!
//! Blasts fixed 60-byte UDP frames out of the given device as fast as the
//! transmit ring accepts them, stamping a 32-bit sequence number into the
//! payload of every frame, and prints throughput once per second.
//!
//! Usage: `generator <pci bus id>`

use std::collections::VecDeque;
use std::env;
use std::error::Error;
use std::process;
use std::time::Instant;

use rawnic::memory::{alloc_pkt_batch, Mempool};
use rawnic::{init_device, DeviceStats};

const BATCH_SIZE: usize = 64;
const POOL_SIZE: usize = 2048;
const PACKET_SIZE: usize = 60;

/// Template frame: Ethernet to 01:02:03:04:05:06, IPv4, UDP 42 -> 1337.
/// The sequence number overwrites bytes 42..46 of the payload.
#[rustfmt::skip]
const PACKET_DATA: [u8; 42] = [
    0x01, 0x02, 0x03, 0x04, 0x05, 0x06,             // dst MAC
    0x11, 0x12, 0x13, 0x14, 0x15, 0x16,             // src MAC
    0x08, 0x00,                                     // ethertype: IPv4
    0x45, 0x00,                                     // version/IHL, ToS
    ((PACKET_SIZE - 14) >> 8) as u8, ((PACKET_SIZE - 14) & 0xFF) as u8, // IP length
    0x00, 0x00, 0x00, 0x00,                         // id, flags, fragment offset
    0x40, 0x11, 0x00, 0x00,                         // TTL (64), UDP, checksum (filled in)
    0x0A, 0x00, 0x00, 0x01,                         // src IP 10.0.0.1
    0x0A, 0x00, 0x00, 0x02,                         // dst IP 10.0.0.2
    0x00, 0x2A, 0x05, 0x39,                         // src port 42, dst port 1337
    ((PACKET_SIZE - 34) >> 8) as u8, ((PACKET_SIZE - 34) & 0xFF) as u8, // UDP length
    0x00, 0x00,                                     // UDP checksum (none)
];

/// One's-complement sum over 16-bit words, as the IPv4 header wants it.
fn ipv4_checksum(header: &[u8]) -> u16 {
    let mut sum = 0u32;
    for chunk in header.chunks(2) {
        sum += u32::from(u16::from_be_bytes([chunk[0], chunk[1]]));
    }
    while sum >> 16 != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }
    !(sum as u16)
}

fn run(pci_addr: &str) -> Result<(), Box<dyn Error>> {
    let mut dev = init_device(pci_addr, 1, 1)?;
    let pool = Mempool::allocate(POOL_SIZE, 0)?;

    // prefill the whole pool with the template so the hot loop only has to
    // stamp sequence numbers
    {
        let mut template = [0u8; PACKET_SIZE];
        template[..PACKET_DATA.len()].copy_from_slice(&PACKET_DATA);
        let checksum = ipv4_checksum(&template[14..34]);
        template[24..26].copy_from_slice(&checksum.to_be_bytes());

        let mut buffers = VecDeque::with_capacity(POOL_SIZE);
        alloc_pkt_batch(&pool, &mut buffers, POOL_SIZE, PACKET_SIZE);
        for p in buffers.iter_mut() {
            p.as_mut_bytes().copy_from_slice(&template);
        }
        // dropping the batch returns every buffer to the pool, prefilled
    }

    let mut buffers = VecDeque::with_capacity(BATCH_SIZE);
    let mut seq: u32 = 0;

    let mut stats = DeviceStats::default();
    let mut stats_old = DeviceStats::default();
    dev.reset_stats();

    let mut time = Instant::now();
    let mut counter = 0u32;

    loop {
        let need = BATCH_SIZE - buffers.len();
        alloc_pkt_batch(&pool, &mut buffers, need, PACKET_SIZE);

        for p in buffers.iter_mut() {
            p.as_mut_bytes()[42..46].copy_from_slice(&seq.to_le_bytes());
            seq = seq.wrapping_add(1);
        }

        dev.tx_batch(0, &mut buffers);

        // checking the clock is expensive enough to amortize
        counter += 1;
        if counter & 0xFFF == 0 {
            let elapsed = time.elapsed();
            if elapsed.as_secs() >= 1 {
                dev.read_stats(&mut stats);
                println!("[{}]", dev.get_pci_addr());
                stats.print_stats_diff(&stats_old, elapsed.as_nanos() as u64);
                stats_old = stats;

                time = Instant::now();
            }
        }
    }
}

fn main() {
    env_logger::init();

    let mut args = env::args().skip(1);
    let pci_addr = match args.next() {
        Some(arg) => arg,
        None => {
            eprintln!("usage: generator <pci bus id>");
            process::exit(1);
        }
    };

    if let Err(e) = run(&pci_addr) {
        eprintln!("generator: {e}");
        process::exit(1);
    }
}

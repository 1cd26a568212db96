//! # rawnic
//!
//! Userspace network drivers for Intel 82599 (ixgbe) 10 Gigabit Ethernet
//! controllers and legacy virtio-net devices.
//!
//! The crate takes exclusive control of a PCIe network function from user
//! space: it unbinds the kernel driver, enables bus-master DMA, maps the
//! device's registers, programs the receive and transmit rings, and manages
//! packet buffers in hugepage-backed memory with stable physical addresses.
//! Applications drive the device through a batched receive/transmit API.
//!
//! ## Basic Usage
//!
//! ```rust,ignore
//! use rawnic::init_device;
//! use std::collections::VecDeque;
//!
//! let mut dev = init_device("0000:03:00.0", 1, 1)?;
//!
//! let mut buffers = VecDeque::new();
//! loop {
//!     dev.rx_batch(0, &mut buffers, 32);
//!     // inspect or rewrite the packets...
//!     dev.tx_batch(0, &mut buffers);
//!     buffers.clear();
//! }
//! ```
//!
//! ## Requirements
//!
//! - root privileges (sysfs unbind and `/proc/self/pagemap` need them)
//! - 2 MiB hugepages mounted at `/mnt/huge`
//! - an Intel 82599-family NIC or a legacy virtio-net device that is safe to
//!   detach from its kernel driver
//!
//! ## Threading Model
//!
//! Each receive queue, each transmit queue, and each mempool belongs to
//! exactly one thread. Distinct queues of the same device may be driven by
//! distinct threads without coordination; the hardware isolates them.

#![allow(dead_code)]
#![warn(missing_docs)]

pub mod constants;
pub mod descriptor;
pub mod ixgbe;
pub mod memory;
pub mod pci;
pub mod virtio;

use std::collections::VecDeque;
use std::error::Error;
use std::fmt;
use std::io;

use log::{debug, warn};

use crate::ixgbe::IxgbeDevice;
use crate::memory::Packet;
use crate::virtio::VirtioDevice;

pub use memory::{alloc_pkt, alloc_pkt_batch, Mempool, PACKET_HEADROOM};

/// Vendor ID for Intel.
pub const VENDOR_INTEL: u16 = 0x8086;

/// Vendor ID used by virtio devices.
pub const VENDOR_VIRTIO: u16 = 0x1af4;

/// Maximum number of queues supported per device.
pub const MAX_QUEUES: u16 = 64;

/// Error type for driver operations.
///
/// Initialization failures surface as values of this type; the hot paths have
/// no recoverable error states and terminate the process on protocol
/// violations instead.
#[derive(Debug)]
pub enum DriverError {
    /// The PCI device's class code is not Ethernet (0x02).
    NotANic {
        /// PCI bus address of the offending device.
        pci_addr: String,
        /// Class byte read from configuration space.
        class: u8,
    },
    /// The queue size is not a power of 2.
    ///
    /// Hardware descriptor rings require sizes that are powers of 2.
    QueueNotAligned,
    /// The mempool entry size does not divide the huge page size.
    PageNotAligned,
    /// No memory available.
    ///
    /// The memory pool is exhausted or DMA allocation failed.
    NoMemory,
    /// A physically contiguous allocation exceeded one huge page.
    DmaTooLarge {
        /// Requested allocation size in bytes.
        size: usize,
    },
    /// A virtual address is not backed by a resident page.
    PageNotPresent {
        /// The virtual address that failed to translate.
        virt: usize,
    },
    /// The device does not offer all required virtio features.
    MissingFeatures {
        /// Feature bits the driver needs.
        required: u32,
        /// Feature bits the device offers.
        available: u32,
    },
    /// The device reported a zero-sized virtqueue.
    VirtqueueUnavailable {
        /// Index of the unavailable queue.
        index: u16,
    },
    /// A control-queue command was not acknowledged with `VIRTIO_NET_OK`.
    CtrlQueueFailure {
        /// The ack byte written by the device.
        ack: u8,
    },
    /// An operating system call failed.
    Io {
        /// What the driver was doing when the call failed.
        context: String,
        /// The underlying error.
        source: io::Error,
    },
}

impl DriverError {
    pub(crate) fn io(context: impl Into<String>, source: io::Error) -> DriverError {
        DriverError::Io {
            context: context.into(),
            source,
        }
    }
}

impl fmt::Display for DriverError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DriverError::NotANic { pci_addr, class } => {
                write!(f, "{pci_addr} is not a NIC (class {class:#04x})")
            }
            DriverError::QueueNotAligned => {
                write!(f, "number of queue entries must be a power of 2")
            }
            DriverError::PageNotAligned => {
                write!(f, "entry size must be a divisor of the huge page size")
            }
            DriverError::NoMemory => write!(f, "no memory available"),
            DriverError::DmaTooLarge { size } => {
                write!(
                    f,
                    "could not allocate physically contiguous memory: {size} bytes exceed one huge page"
                )
            }
            DriverError::PageNotPresent { virt } => {
                write!(f, "page for virtual address {virt:#x} is not present")
            }
            DriverError::MissingFeatures {
                required,
                available,
            } => write!(
                f,
                "device does not support the required features: need {required:#x}, have {available:#x}"
            ),
            DriverError::VirtqueueUnavailable { index } => {
                write!(f, "virtqueue {index} is unavailable")
            }
            DriverError::CtrlQueueFailure { ack } => {
                write!(f, "control queue command failed with ack {ack:#x}")
            }
            DriverError::Io { context, source } => write!(f, "{context}: {source}"),
        }
    }
}

impl Error for DriverError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            DriverError::Io { source, .. } => Some(source),
            _ => None,
        }
    }
}

/// Result type for driver functions.
///
/// A type alias for `Result` with [`DriverError`] as the error type.
pub type DriverResult<T = ()> = Result<T, DriverError>;

/// Generic network device interface.
///
/// This trait provides a common interface for the concrete backends, allowing
/// applications to be written independently of the NIC hardware. Packets move
/// in batches: a single register access covers a whole batch, which is what
/// makes polling drivers fast.
///
/// # Example
///
/// ```rust,ignore
/// use rawnic::init_device;
/// use std::collections::VecDeque;
///
/// let mut dev = init_device("0000:01:00.0", 1, 1)?;
/// println!("driver: {}", dev.get_driver_name());
/// println!("speed: {} Mbit/s", dev.get_link_speed());
///
/// let mut buffers = VecDeque::new();
/// let received = dev.rx_batch(0, &mut buffers, 32);
/// ```
pub trait NicDevice {
    /// Returns the driver's name.
    fn get_driver_name(&self) -> &str;

    /// Returns the PCI bus address this device was opened with.
    fn get_pci_addr(&self) -> &str;

    /// Returns the MAC (Ethernet) address of this device.
    fn get_mac_addr(&self) -> [u8; 6];

    /// Sets the MAC (Ethernet) address of this device.
    fn set_mac_addr(&mut self, mac: [u8; 6]);

    /// Receives up to `num_packets` packets from queue `queue_id`.
    ///
    /// Received packets are appended to `buffer`. Returns the number of
    /// packets received; 0 means the queue had nothing pending (or
    /// `num_packets` was 0, in which case the device is not touched).
    ///
    /// # Panics
    ///
    /// Panics if `queue_id` is out of range, if the device delivers a
    /// multi-segment frame (jumbo frames are unsupported), or if the queue's
    /// mempool runs dry during the descriptor refill — the latter means the
    /// application is leaking buffers.
    fn rx_batch(
        &mut self,
        queue_id: u16,
        buffer: &mut VecDeque<Packet>,
        num_packets: usize,
    ) -> usize;

    /// Queues the packets in `packets` for transmission on queue `queue_id`.
    ///
    /// Returns the number of packets accepted. Accepted packets are removed
    /// from the front of `packets` and their buffers return to the mempool
    /// once the hardware reports them sent; packets that did not fit stay in
    /// `packets` and remain owned by the caller. A full ring accepts 0.
    ///
    /// # Panics
    ///
    /// Panics if `queue_id` is out of range or if packets from more than one
    /// mempool are mixed on a single queue.
    fn tx_batch(&mut self, queue_id: u16, packets: &mut VecDeque<Packet>) -> usize;

    /// Reads the device's packet and byte counters into `stats`.
    ///
    /// Counters accumulate: each call adds the activity since the previous
    /// call (the hardware statistic registers clear on read).
    fn read_stats(&mut self, stats: &mut DeviceStats);

    /// Resets the device's packet and byte counters.
    fn reset_stats(&mut self);

    /// Returns the link speed in Mbit/s, or 0 if the link is down.
    fn get_link_speed(&self) -> u16;
}

/// Initializes the device at `pci_addr` and returns it behind the
/// [`NicDevice`] trait.
///
/// The backend is chosen from PCI configuration space: virtio vendor IDs get
/// the legacy virtio-net driver, everything else is assumed to be an Intel
/// 82599. Devices whose class code is not Ethernet are rejected.
///
/// # Errors
///
/// Returns [`DriverError::NotANic`] for non-network devices and
/// [`DriverError::Io`] when sysfs or hugepage resources are missing —
/// typically a wrong address, missing root privileges, or no hugepage mount.
pub fn init_device(
    pci_addr: &str,
    num_rx_queues: u16,
    num_tx_queues: u16,
) -> DriverResult<Box<dyn NicDevice>> {
    if unsafe { libc::getuid() } != 0 {
        warn!("not running as root, this will probably fail");
    }

    let config_file = pci::pci_open_resource(pci_addr, "config")?;
    let vendor_id = pci::read_io16(&config_file, 0)?;
    let device_id = pci::read_io16(&config_file, 2)?;
    let class_id = (pci::read_io32(&config_file, 8)? >> 24) as u8;
    debug!("device {vendor_id:04x}:{device_id:04x} class {class_id:#04x} at {pci_addr}");

    if class_id != 2 {
        return Err(DriverError::NotANic {
            pci_addr: pci_addr.to_string(),
            class: class_id,
        });
    }

    if vendor_id == VENDOR_VIRTIO {
        if num_rx_queues > 1 || num_tx_queues > 1 {
            warn!("virtio supports a single rx/tx queue pair, extra queues are ignored");
        }
        Ok(Box::new(VirtioDevice::init(pci_addr)?))
    } else {
        Ok(Box::new(IxgbeDevice::init(
            pci_addr,
            num_rx_queues,
            num_tx_queues,
        )?))
    }
}

/// Network device statistics.
///
/// Holds counters for sent and received packets and bytes, as accumulated by
/// [`NicDevice::read_stats`].
#[derive(Default, Copy, Clone)]
pub struct DeviceStats {
    /// Number of received packets.
    pub rx_pkts: u64,
    /// Number of transmitted packets.
    pub tx_pkts: u64,
    /// Number of received bytes.
    pub rx_bytes: u64,
    /// Number of transmitted bytes.
    pub tx_bytes: u64,
}

impl DeviceStats {
    /// Received packet rate in million packets per second relative to `prev`.
    ///
    /// `nanos` is the time between the two snapshots. Counter rollover is
    /// handled by wrapping arithmetic.
    pub fn rx_mpps(&self, prev: &DeviceStats, nanos: u64) -> f64 {
        mpps(self.rx_pkts, prev.rx_pkts, nanos)
    }

    /// Transmitted packet rate in million packets per second relative to `prev`.
    pub fn tx_mpps(&self, prev: &DeviceStats, nanos: u64) -> f64 {
        mpps(self.tx_pkts, prev.tx_pkts, nanos)
    }

    /// Received line rate in Mbit/s relative to `prev`.
    ///
    /// Includes the 20 bytes of preamble and inter-frame gap each packet
    /// occupies on the wire.
    pub fn rx_mbit(&self, prev: &DeviceStats, nanos: u64) -> f64 {
        mbit(
            self.rx_bytes,
            prev.rx_bytes,
            self.rx_pkts,
            prev.rx_pkts,
            nanos,
        )
    }

    /// Transmitted line rate in Mbit/s relative to `prev`.
    pub fn tx_mbit(&self, prev: &DeviceStats, nanos: u64) -> f64 {
        mbit(
            self.tx_bytes,
            prev.tx_bytes,
            self.tx_pkts,
            prev.tx_pkts,
            nanos,
        )
    }

    /// Prints the packet and bit rates between this snapshot and `prev`,
    /// where `nanos` is the elapsed time between them.
    pub fn print_stats_diff(&self, prev: &DeviceStats, nanos: u64) {
        println!(
            "RX: {:.2} Mbit/s {:.2} Mpps",
            self.rx_mbit(prev, nanos),
            self.rx_mpps(prev, nanos)
        );
        println!(
            "TX: {:.2} Mbit/s {:.2} Mpps",
            self.tx_mbit(prev, nanos),
            self.tx_mpps(prev, nanos)
        );
    }
}

fn mpps(pkts_new: u64, pkts_old: u64, nanos: u64) -> f64 {
    let seconds = nanos as f64 / 1_000_000_000.0;
    pkts_new.wrapping_sub(pkts_old) as f64 / 1_000_000.0 / seconds
}

fn mbit(bytes_new: u64, bytes_old: u64, pkts_new: u64, pkts_old: u64, nanos: u64) -> f64 {
    let seconds = nanos as f64 / 1_000_000_000.0;
    // preamble, start-of-frame delimiter and inter-frame gap take 20 bytes
    // per packet on the wire but show up in no byte counter
    (bytes_new.wrapping_sub(bytes_old) as f64 / 1_000_000.0 / seconds) * 8.0
        + mpps(pkts_new, pkts_old, nanos) * 20.0 * 8.0
}

impl fmt::Display for DeviceStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "rx_pkts: {}, tx_pkts: {}, rx_bytes: {}, tx_bytes: {}",
            self.rx_pkts, self.tx_pkts, self.rx_bytes, self.tx_bytes
        )
    }
}

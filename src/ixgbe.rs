//! Driver for the Intel 82599 (ixgbe) 10 Gigabit Ethernet controller.
//!
//! Covers device bring-up (reset, link auto negotiation, receive and
//! transmit configuration) and the polled hot paths. Section numbers in the
//! comments refer to the 82599 datasheet.
//!
//! The hot paths exchange 16-byte descriptors with the NIC through rings in
//! DMA memory. On receive, the hardware fills buffers whose addresses were
//! posted earlier, sets the DD bit and the driver swaps in fresh buffers
//! before bumping the tail register. On transmit it is the mirror image: the
//! driver posts filled buffers and reclaims them once the hardware sets DD.
//! One tail register write covers a whole batch.

use std::collections::VecDeque;
use std::mem;
use std::ptr;
use std::rc::Rc;
use std::sync::atomic::{fence, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, info};

use crate::constants::*;
use crate::descriptor::{AdvancedRxDescriptor, AdvancedTxDescriptor};
use crate::memory::{Dma, Mempool, Packet, PACKET_HEADROOM};
use crate::pci::pci_map_resource;
use crate::{DeviceStats, DriverError, DriverResult, NicDevice, MAX_QUEUES};

const DRIVER_NAME: &str = "rawnic-ixgbe";

const NUM_RX_QUEUE_ENTRIES: usize = 512;
const NUM_TX_QUEUE_ENTRIES: usize = 512;
const PKT_BUF_ENTRY_SIZE: usize = 2048;
const MIN_MEMPOOL_SIZE: usize = 4096;
const TX_CLEAN_BATCH: usize = 32;

fn wrap_ring(index: usize, ring_size: usize) -> usize {
    (index + 1) & (ring_size - 1)
}

/// An Intel 82599 device attached from user space.
///
/// Construct with [`IxgbeDevice::init`] or, generically, with
/// [`crate::init_device`]. All further interaction goes through the
/// [`NicDevice`] trait.
pub struct IxgbeDevice {
    pci_addr: String,
    addr: *mut u8,
    len: usize,
    num_rx_queues: u16,
    num_tx_queues: u16,
    rx_queues: Vec<IxgbeRxQueue>,
    tx_queues: Vec<IxgbeTxQueue>,
}

struct IxgbeRxQueue {
    descriptors: *mut AdvancedRxDescriptor,
    num_descriptors: usize,
    pool: Rc<Mempool>,
    /// Pool entry backing each descriptor slot.
    bufs_in_use: Vec<usize>,
    rx_index: usize,
}

struct IxgbeTxQueue {
    descriptors: *mut AdvancedTxDescriptor,
    num_descriptors: usize,
    pool: Option<Rc<Mempool>>,
    /// Pool entries of in-flight packets, oldest first.
    bufs_in_use: VecDeque<usize>,
    clean_index: usize,
    tx_index: usize,
}

impl IxgbeDevice {
    /// Takes control of the 82599 at `pci_addr` and initializes it with the
    /// given number of receive and transmit queues.
    ///
    /// # Panics
    ///
    /// Panics if a queue count exceeds [`MAX_QUEUES`].
    pub fn init(pci_addr: &str, num_rx_queues: u16, num_tx_queues: u16) -> DriverResult<Self> {
        info!(
            "initializing ixgbe device {} with {} rx and {} tx queues",
            pci_addr, num_rx_queues, num_tx_queues
        );

        assert!(
            num_rx_queues <= MAX_QUEUES,
            "cannot configure {num_rx_queues} rx queues: limit is {MAX_QUEUES}"
        );
        assert!(
            num_tx_queues <= MAX_QUEUES,
            "cannot configure {num_tx_queues} tx queues: limit is {MAX_QUEUES}"
        );

        let (addr, len) = pci_map_resource(pci_addr)?;

        let mut dev = IxgbeDevice {
            pci_addr: pci_addr.to_string(),
            addr,
            len,
            num_rx_queues,
            num_tx_queues,
            rx_queues: Vec::with_capacity(num_rx_queues as usize),
            tx_queues: Vec::with_capacity(num_tx_queues as usize),
        };

        dev.reset_and_init()?;

        Ok(dev)
    }

    /// Returns the number of receive queues.
    pub fn num_rx_queues(&self) -> u16 {
        self.num_rx_queues
    }

    /// Returns the number of transmit queues.
    pub fn num_tx_queues(&self) -> u16 {
        self.num_tx_queues
    }

    /// Blocks until the link reports a speed, for at most 10 seconds.
    pub fn wait_for_link(&self) {
        info!("waiting for link");

        let deadline = Instant::now() + Duration::from_secs(10);
        let mut speed = self.get_link_speed();
        while speed == 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(100));
            speed = self.get_link_speed();
        }

        info!("link speed is {} Mbit/s", speed);
    }
}

impl NicDevice for IxgbeDevice {
    fn get_driver_name(&self) -> &str {
        DRIVER_NAME
    }

    fn get_pci_addr(&self) -> &str {
        &self.pci_addr
    }

    fn get_mac_addr(&self) -> [u8; 6] {
        let low = self.get_reg32(IXGBE_RAL(0));
        let high = self.get_reg32(IXGBE_RAH(0));

        [
            (low & 0xff) as u8,
            (low >> 8 & 0xff) as u8,
            (low >> 16 & 0xff) as u8,
            (low >> 24) as u8,
            (high & 0xff) as u8,
            (high >> 8 & 0xff) as u8,
        ]
    }

    fn set_mac_addr(&mut self, mac: [u8; 6]) {
        let low: u32 = u32::from(mac[0])
            + (u32::from(mac[1]) << 8)
            + (u32::from(mac[2]) << 16)
            + (u32::from(mac[3]) << 24);
        let high: u32 = u32::from(mac[4]) + (u32::from(mac[5]) << 8);

        self.set_reg32(IXGBE_RAL(0), low);
        self.set_reg32(IXGBE_RAH(0), high);
    }

    /// See §4.5 of the datasheet-facing description in the module docs: poll
    /// DD, require EOP, hand the filled buffer out, refill the slot, advance,
    /// and publish the last processed index in RDT once.
    fn rx_batch(
        &mut self,
        queue_id: u16,
        buffer: &mut VecDeque<Packet>,
        num_packets: usize,
    ) -> usize {
        let mut received = 0;
        let mut last_rx_index = 0;

        {
            let queue = self
                .rx_queues
                .get_mut(queue_id as usize)
                .expect("invalid rx queue id");

            let mut rx_index = queue.rx_index;

            while received < num_packets {
                let desc = unsafe { &mut *queue.descriptors.add(rx_index) };
                if !desc.descriptor_done() {
                    break;
                }
                if !desc.end_of_packet() {
                    panic!("multi-segment packets are not supported - increase buffer size or decrease MTU");
                }

                // the descriptor status read must complete before the buffer
                // contents are read
                fence(Ordering::Acquire);

                let len = desc.length() as usize;

                // swap in a fresh buffer before handing the filled one out;
                // running dry here means the application leaks buffers
                let new_id = queue
                    .pool
                    .alloc_buf()
                    .expect("rx mempool exhausted - packet buffers are leaking");
                let id = mem::replace(&mut queue.bufs_in_use[rx_index], new_id);

                let packet = unsafe {
                    Packet::new(
                        queue.pool.get_virt_addr(id).add(PACKET_HEADROOM),
                        queue.pool.get_phys_addr(id) + PACKET_HEADROOM,
                        len,
                        Rc::clone(&queue.pool),
                        id,
                    )
                };
                buffer.push_back(packet);

                desc.set_packet_address((queue.pool.get_phys_addr(new_id) + PACKET_HEADROOM) as u64);
                desc.reset_status();

                last_rx_index = rx_index;
                rx_index = wrap_ring(rx_index, queue.num_descriptors);
                received += 1;
            }

            if received > 0 {
                queue.rx_index = rx_index;
            }
        }

        if received > 0 {
            // the refilled descriptors must be visible before the tail moves
            fence(Ordering::Release);
            self.set_reg32(IXGBE_RDT(u32::from(queue_id)), last_rx_index as u32);
        }

        received
    }

    /// Reclaims sent buffers in batches of [`TX_CLEAN_BATCH`], then fills
    /// descriptors until the ring is full or `packets` is empty. TDT is
    /// written once per call.
    fn tx_batch(&mut self, queue_id: u16, packets: &mut VecDeque<Packet>) -> usize {
        let mut sent = 0;

        {
            let queue = self
                .tx_queues
                .get_mut(queue_id as usize)
                .expect("invalid tx queue id");

            clean_tx_queue(queue);

            while let Some(packet) = packets.pop_front() {
                let next_index = wrap_ring(queue.tx_index, queue.num_descriptors);
                if next_index == queue.clean_index {
                    // ring full, the caller keeps the rest
                    packets.push_front(packet);
                    break;
                }

                match queue.pool {
                    Some(ref pool) => assert!(
                        Rc::ptr_eq(pool, &packet.pool),
                        "distinct memory pools for a single tx queue are not supported"
                    ),
                    None => queue.pool = Some(Rc::clone(&packet.pool)),
                }

                let desc = unsafe { &mut *queue.descriptors.add(queue.tx_index) };
                desc.send(packet.get_phys_addr() as u64, packet.len() as u16);

                queue.bufs_in_use.push_back(packet.pool_entry);
                // the buffer is owned by the ring now, cleanup returns it to
                // the pool without running the drop
                mem::forget(packet);

                queue.tx_index = next_index;
                sent += 1;
            }
        }

        // the descriptor writes must be visible before the tail moves
        fence(Ordering::Release);
        self.set_reg32(
            IXGBE_TDT(u32::from(queue_id)),
            self.tx_queues[queue_id as usize].tx_index as u32,
        );

        sent
    }

    fn read_stats(&mut self, stats: &mut DeviceStats) {
        let rx_pkts = u64::from(self.get_reg32(IXGBE_GPRC));
        let tx_pkts = u64::from(self.get_reg32(IXGBE_GPTC));
        let rx_bytes =
            u64::from(self.get_reg32(IXGBE_GORCL)) + (u64::from(self.get_reg32(IXGBE_GORCH)) << 32);
        let tx_bytes =
            u64::from(self.get_reg32(IXGBE_GOTCL)) + (u64::from(self.get_reg32(IXGBE_GOTCH)) << 32);

        stats.rx_pkts += rx_pkts;
        stats.tx_pkts += tx_pkts;
        stats.rx_bytes += rx_bytes;
        stats.tx_bytes += tx_bytes;
    }

    fn reset_stats(&mut self) {
        // reading is enough, the registers clear on read
        self.get_reg32(IXGBE_GPRC);
        self.get_reg32(IXGBE_GPTC);
        self.get_reg32(IXGBE_GORCL);
        self.get_reg32(IXGBE_GORCH);
        self.get_reg32(IXGBE_GOTCL);
        self.get_reg32(IXGBE_GOTCH);
    }

    fn get_link_speed(&self) -> u16 {
        let speed = self.get_reg32(IXGBE_LINKS);
        if (speed & IXGBE_LINKS_UP) == 0 {
            return 0;
        }
        match speed & IXGBE_LINKS_SPEED_82599 {
            IXGBE_LINKS_SPEED_100_82599 => 100,
            IXGBE_LINKS_SPEED_1G_82599 => 1000,
            IXGBE_LINKS_SPEED_10G_82599 => 10000,
            _ => 0,
        }
    }
}

impl IxgbeDevice {
    /// Resets and initializes the device, following §4.6.3 of the datasheet.
    fn reset_and_init(&mut self) -> DriverResult {
        info!("resetting ixgbe device {}", self.pci_addr);

        // section 4.6.3.1 - disable all interrupts
        self.disable_interrupts();

        // section 4.6.3.2 - global reset (link reset + software reset)
        self.set_reg32(IXGBE_CTRL, IXGBE_CTRL_RST_MASK);
        self.wait_clear_reg32(IXGBE_CTRL, IXGBE_CTRL_RST_MASK);
        thread::sleep(Duration::from_millis(10));

        // section 4.6.3.1 - the reset re-enables interrupts
        self.disable_interrupts();

        let mac = self.get_mac_addr();
        info!(
            "mac address: {:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            mac[0], mac[1], mac[2], mac[3], mac[4], mac[5]
        );

        // section 4.6.3 - wait for EEPROM auto read completion
        self.wait_set_reg32(IXGBE_EEC, IXGBE_EEC_ARD);

        // section 4.6.3 - wait for DMA initialization to complete
        self.wait_set_reg32(IXGBE_RDRXCTL, IXGBE_RDRXCTL_DMAIDONE);

        // section 4.6.4 - initialize link (auto negotiation)
        self.init_link();

        // section 4.6.5 - the statistic registers clear on read
        self.reset_stats();

        // section 4.6.7 - init rx
        self.init_rx()?;

        // section 4.6.8 - init tx
        self.init_tx()?;

        for i in 0..self.num_rx_queues {
            self.start_rx_queue(i)?;
        }
        for i in 0..self.num_tx_queues {
            self.start_tx_queue(i)?;
        }

        // promiscuous mode by default to make testing easier
        self.set_promisc(true);

        // the link usually takes a few seconds to come up after a reset
        self.wait_for_link();

        Ok(())
    }

    // section 4.6.7
    /// Initializes the rx queues of this device.
    fn init_rx(&mut self) -> DriverResult {
        // disable rx while re-configuring it
        self.clear_flags32(IXGBE_RXCTRL, IXGBE_RXCTRL_RXEN);

        // section 4.6.11.3.4 - allocate all queues and traffic to PB0
        self.set_reg32(IXGBE_RXPBSIZE(0), IXGBE_RXPBSIZE_128KB);
        for i in 1..8 {
            self.set_reg32(IXGBE_RXPBSIZE(i), 0);
        }

        // enable CRC offloading
        self.set_flags32(IXGBE_HLREG0, IXGBE_HLREG0_RXCRCSTRP);
        self.set_flags32(IXGBE_RDRXCTL, IXGBE_RDRXCTL_CRCSTRIP);

        // accept broadcast packets
        self.set_flags32(IXGBE_FCTRL, IXGBE_FCTRL_BAM);

        // per-queue configuration, the same for every queue
        for i in 0..self.num_rx_queues {
            debug!("initializing rx queue {}", i);

            // enable advanced descriptors, 2 KB buffers, and let the NIC
            // drop packets when no descriptor is available instead of
            // buffering them
            let srrctl = self.get_reg32(IXGBE_SRRCTL(u32::from(i)));
            self.set_reg32(
                IXGBE_SRRCTL(u32::from(i)),
                (srrctl & !(IXGBE_SRRCTL_DESCTYPE_MASK | IXGBE_SRRCTL_BSIZEPKT_MASK))
                    | IXGBE_SRRCTL_DESCTYPE_ADV_ONEBUF
                    | (PKT_BUF_ENTRY_SIZE >> 10) as u32
                    | IXGBE_SRRCTL_DROP_EN,
            );

            // section 7.1.9 - setup descriptor ring
            let ring_size_bytes = NUM_RX_QUEUE_ENTRIES * mem::size_of::<AdvancedRxDescriptor>();
            let dma: Dma<AdvancedRxDescriptor> = Dma::allocate(ring_size_bytes, true)?;

            // initialize to 0xff to prevent rogue memory accesses on
            // premature dma activation
            unsafe {
                ptr::write_bytes(dma.virt as *mut u8, 0xff, ring_size_bytes);
            }

            self.set_reg32(
                IXGBE_RDBAL(u32::from(i)),
                (dma.phys as u64 & 0xffff_ffff) as u32,
            );
            self.set_reg32(IXGBE_RDBAH(u32::from(i)), (dma.phys as u64 >> 32) as u32);
            self.set_reg32(IXGBE_RDLEN(u32::from(i)), ring_size_bytes as u32);

            debug!("rx ring {} phys addr: {:#x}", i, dma.phys);
            debug!("rx ring {} virt addr: {:p}", i, dma.virt);

            // ring is empty at start
            self.set_reg32(IXGBE_RDH(u32::from(i)), 0);
            self.set_reg32(IXGBE_RDT(u32::from(i)), 0);

            // the pool covers both rings plus everything the application
            // holds in flight
            let mempool_size = if NUM_RX_QUEUE_ENTRIES + NUM_TX_QUEUE_ENTRIES < MIN_MEMPOOL_SIZE {
                MIN_MEMPOOL_SIZE
            } else {
                NUM_RX_QUEUE_ENTRIES + NUM_TX_QUEUE_ENTRIES
            };
            let mempool = Mempool::allocate(mempool_size, PKT_BUF_ENTRY_SIZE)?;

            let rx_queue = IxgbeRxQueue {
                descriptors: dma.virt,
                num_descriptors: NUM_RX_QUEUE_ENTRIES,
                pool: mempool,
                bufs_in_use: Vec::with_capacity(NUM_RX_QUEUE_ENTRIES),
                rx_index: 0,
            };

            self.rx_queues.push(rx_queue);
        }

        // last sentence of section 4.6.7 - set some magic bits
        self.set_flags32(IXGBE_CTRL_EXT, IXGBE_CTRL_EXT_NS_DIS);

        // this flag initializes to 1 but has to be 0
        for i in 0..self.num_rx_queues {
            self.clear_flags32(IXGBE_DCA_RXCTRL(u32::from(i)), 1 << 12);
        }

        // start rx
        self.set_flags32(IXGBE_RXCTRL, IXGBE_RXCTRL_RXEN);

        Ok(())
    }

    // section 4.6.8
    /// Initializes the tx queues of this device.
    fn init_tx(&mut self) -> DriverResult {
        // crc offload and small packet padding
        self.set_flags32(IXGBE_HLREG0, IXGBE_HLREG0_TXCRCEN | IXGBE_HLREG0_TXPADEN);

        // section 4.6.11.3.4 - default buffer size allocations
        self.set_reg32(IXGBE_TXPBSIZE(0), IXGBE_TXPBSIZE_40KB);
        for i in 1..8 {
            self.set_reg32(IXGBE_TXPBSIZE(i), 0);
        }

        // required when not using DCB/VTd
        self.set_reg32(IXGBE_DTXMXSZRQ, 0xffff);
        self.clear_flags32(IXGBE_RTTDCS, IXGBE_RTTDCS_ARBDIS);

        for i in 0..self.num_tx_queues {
            debug!("initializing tx queue {}", i);

            // section 7.1.9 - setup descriptor ring
            let ring_size_bytes = NUM_TX_QUEUE_ENTRIES * mem::size_of::<AdvancedTxDescriptor>();
            let dma: Dma<AdvancedTxDescriptor> = Dma::allocate(ring_size_bytes, true)?;
            unsafe {
                ptr::write_bytes(dma.virt as *mut u8, 0xff, ring_size_bytes);
            }

            self.set_reg32(
                IXGBE_TDBAL(u32::from(i)),
                (dma.phys as u64 & 0xffff_ffff) as u32,
            );
            self.set_reg32(IXGBE_TDBAH(u32::from(i)), (dma.phys as u64 >> 32) as u32);
            self.set_reg32(IXGBE_TDLEN(u32::from(i)), ring_size_bytes as u32);

            debug!("tx ring {} phys addr: {:#x}", i, dma.phys);
            debug!("tx ring {} virt addr: {:p}", i, dma.virt);

            // descriptor writeback magic values, important to get good
            // performance and low PCIe overhead, see 7.2.3.4.1 and 7.2.3.5;
            // these are the defaults DPDK uses
            // pthresh: 6:0, hthresh: 14:8, wthresh: 22:16
            let mut txdctl = self.get_reg32(IXGBE_TXDCTL(u32::from(i)));
            txdctl &= !(0x7F | (0x7F << 8) | (0x7F << 16));
            txdctl |= 36 | (8 << 8) | (4 << 16);
            self.set_reg32(IXGBE_TXDCTL(u32::from(i)), txdctl);

            let tx_queue = IxgbeTxQueue {
                descriptors: dma.virt,
                num_descriptors: NUM_TX_QUEUE_ENTRIES,
                pool: None,
                bufs_in_use: VecDeque::with_capacity(NUM_TX_QUEUE_ENTRIES),
                clean_index: 0,
                tx_index: 0,
            };

            self.tx_queues.push(tx_queue);
        }

        // final step: enable DMA, once and globally
        self.set_reg32(IXGBE_DMATXCTL, IXGBE_DMATXCTL_TE);

        Ok(())
    }

    /// Posts a buffer into every descriptor of the rx queue and enables it.
    fn start_rx_queue(&mut self, queue_id: u16) -> DriverResult {
        debug!("starting rx queue {}", queue_id);

        {
            let queue = &mut self.rx_queues[queue_id as usize];

            if queue.num_descriptors & (queue.num_descriptors - 1) != 0 {
                return Err(DriverError::QueueNotAligned);
            }

            for i in 0..queue.num_descriptors {
                let id = queue.pool.alloc_buf().ok_or(DriverError::NoMemory)?;

                let desc = unsafe { &mut *queue.descriptors.add(i) };
                desc.set_packet_address((queue.pool.get_phys_addr(id) + PACKET_HEADROOM) as u64);
                desc.reset_status();

                // remember which pool entry sits in which slot
                queue.bufs_in_use.push(id);
            }
        }

        let queue = &self.rx_queues[queue_id as usize];

        // enable the queue and wait for the hardware to acknowledge
        self.set_flags32(IXGBE_RXDCTL(u32::from(queue_id)), IXGBE_RXDCTL_ENABLE);
        self.wait_set_reg32(IXGBE_RXDCTL(u32::from(queue_id)), IXGBE_RXDCTL_ENABLE);

        // rx queue starts out full
        self.set_reg32(IXGBE_RDH(u32::from(queue_id)), 0);
        self.set_reg32(
            IXGBE_RDT(u32::from(queue_id)),
            (queue.num_descriptors - 1) as u32,
        );

        Ok(())
    }

    /// Enables the tx queue.
    fn start_tx_queue(&mut self, queue_id: u16) -> DriverResult {
        debug!("starting tx queue {}", queue_id);

        {
            let queue = &mut self.tx_queues[queue_id as usize];

            if queue.num_descriptors & (queue.num_descriptors - 1) != 0 {
                return Err(DriverError::QueueNotAligned);
            }
        }

        // tx queue starts out empty
        self.set_reg32(IXGBE_TDH(u32::from(queue_id)), 0);
        self.set_reg32(IXGBE_TDT(u32::from(queue_id)), 0);

        // enable the queue and wait for the hardware to acknowledge
        self.set_flags32(IXGBE_TXDCTL(u32::from(queue_id)), IXGBE_TXDCTL_ENABLE);
        self.wait_set_reg32(IXGBE_TXDCTL(u32::from(queue_id)), IXGBE_TXDCTL_ENABLE);

        Ok(())
    }

    // section 4.6.4
    /// Initializes the link of this device with 10 GbE auto negotiation.
    fn init_link(&self) {
        self.set_reg32(
            IXGBE_AUTOC,
            (self.get_reg32(IXGBE_AUTOC) & !IXGBE_AUTOC_LMS_MASK) | IXGBE_AUTOC_LMS_10G_SERIAL,
        );
        self.set_reg32(
            IXGBE_AUTOC,
            (self.get_reg32(IXGBE_AUTOC) & !IXGBE_AUTOC_10G_PMA_PMD_MASK) | IXGBE_AUTOC_10G_XAUI,
        );
        // negotiate the link; the datasheet wants us to wait for it here,
        // but we can continue and wait in wait_for_link instead
        self.set_flags32(IXGBE_AUTOC, IXGBE_AUTOC_AN_RESTART);
    }

    /// Masks all interrupts and drops pending causes.
    fn disable_interrupts(&self) {
        self.set_reg32(IXGBE_EIMC, IXGBE_IRQ_CLEAR_MASK);
        self.get_reg32(IXGBE_EICR);
    }

    /// Enables or disables promiscuous mode of this device.
    fn set_promisc(&self, enabled: bool) {
        if enabled {
            info!("enabling promisc mode");
            self.set_flags32(IXGBE_FCTRL, IXGBE_FCTRL_MPE | IXGBE_FCTRL_UPE);
        } else {
            info!("disabling promisc mode");
            self.clear_flags32(IXGBE_FCTRL, IXGBE_FCTRL_MPE | IXGBE_FCTRL_UPE);
        }
    }

    /// Returns the register at `self.addr` + `reg`.
    ///
    /// # Panics
    ///
    /// Panics if `reg` does not belong to the mapped memory of the device.
    fn get_reg32(&self, reg: u32) -> u32 {
        assert!(reg as usize <= self.len - 4, "memory access out of bounds");

        unsafe { ptr::read_volatile((self.addr as usize + reg as usize) as *mut u32) }
    }

    /// Sets the register at `self.addr` + `reg` to `value`.
    ///
    /// # Panics
    ///
    /// Panics if `reg` does not belong to the mapped memory of the device.
    fn set_reg32(&self, reg: u32, value: u32) {
        assert!(reg as usize <= self.len - 4, "memory access out of bounds");

        unsafe {
            ptr::write_volatile((self.addr as usize + reg as usize) as *mut u32, value);
        }
    }

    /// Sets the `flags` at `self.addr` + `reg`.
    fn set_flags32(&self, reg: u32, flags: u32) {
        self.set_reg32(reg, self.get_reg32(reg) | flags);
    }

    /// Clears the `flags` at `self.addr` + `reg`.
    fn clear_flags32(&self, reg: u32, flags: u32) {
        self.set_reg32(reg, self.get_reg32(reg) & !flags);
    }

    /// Polls `reg` until all bits in `value` are clear.
    ///
    /// Retries indefinitely; callers that need a timeout implement their own
    /// loop over [`IxgbeDevice::get_reg32`].
    fn wait_clear_reg32(&self, reg: u32, value: u32) {
        loop {
            let current = self.get_reg32(reg);
            if (current & value) == 0 {
                break;
            }
            thread::sleep(Duration::from_millis(10));
        }
    }

    /// Polls `reg` until all bits in `value` are set.
    fn wait_set_reg32(&self, reg: u32, value: u32) {
        loop {
            let current = self.get_reg32(reg);
            if (current & value) == value {
                break;
            }
            thread::sleep(Duration::from_millis(10));
        }
    }
}

/// Removes multiples of [`TX_CLEAN_BATCH`] sent packets from `queue` and
/// returns their buffers to the pool.
///
/// Only the last descriptor of each batch is polled: RS is set on every
/// descriptor, so its DD bit covers the whole batch.
fn clean_tx_queue(queue: &mut IxgbeTxQueue) -> usize {
    let mut clean_index = queue.clean_index;
    let cur_index = queue.tx_index;

    loop {
        let mut cleanable = cur_index as isize - clean_index as isize;
        if cleanable < 0 {
            cleanable += queue.num_descriptors as isize;
        }
        if cleanable < TX_CLEAN_BATCH as isize {
            break;
        }

        let mut cleanup_to = clean_index + TX_CLEAN_BATCH - 1;
        if cleanup_to >= queue.num_descriptors {
            cleanup_to -= queue.num_descriptors;
        }

        let desc = unsafe { &*queue.descriptors.add(cleanup_to) };
        if desc.descriptor_done() {
            if let Some(ref pool) = queue.pool {
                if TX_CLEAN_BATCH >= queue.bufs_in_use.len() {
                    pool.free_stack
                        .borrow_mut()
                        .extend(queue.bufs_in_use.drain(..));
                } else {
                    pool.free_stack
                        .borrow_mut()
                        .extend(queue.bufs_in_use.drain(..TX_CLEAN_BATCH));
                }
            }

            clean_index = wrap_ring(cleanup_to, queue.num_descriptors);
        } else {
            break;
        }
    }

    queue.clean_index = clean_index;

    clean_index
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::TX_STATUS_DD;
    use volatile::Volatile;

    fn test_ring(entries: usize) -> Box<[AdvancedTxDescriptor]> {
        (0..entries)
            .map(|_| AdvancedTxDescriptor {
                packet_buffer_address: Volatile::new(0),
                data_len: Volatile::new(0),
                dtyp_mac_rsv: Volatile::new(0),
                dcmd: Volatile::new(0),
                paylen_popts_cc_idx_sta: Volatile::new(0),
            })
            .collect()
    }

    fn mark_done(ring: &mut [AdvancedTxDescriptor], index: usize) {
        ring[index].paylen_popts_cc_idx_sta.write(TX_STATUS_DD);
    }

    #[test]
    fn test_wrap_ring() {
        assert_eq!(wrap_ring(0, 512), 1);
        assert_eq!(wrap_ring(510, 512), 511);
        assert_eq!(wrap_ring(511, 512), 0);
    }

    #[test]
    fn test_clean_does_nothing_below_batch_size() {
        let mut ring = test_ring(64);
        let pool = Mempool::allocate_for_tests(64, 2048).unwrap();

        let mut queue = IxgbeTxQueue {
            descriptors: ring.as_mut_ptr(),
            num_descriptors: 64,
            pool: Some(Rc::clone(&pool)),
            bufs_in_use: VecDeque::new(),
            clean_index: 0,
            tx_index: 0,
        };

        // pretend 31 packets are in flight, one short of a batch
        for _ in 0..31 {
            queue.bufs_in_use.push_back(pool.alloc_buf().unwrap());
        }
        queue.tx_index = 31;
        for i in 0..31 {
            mark_done(&mut ring, i);
        }

        assert_eq!(clean_tx_queue(&mut queue), 0);
        assert_eq!(queue.bufs_in_use.len(), 31);
    }

    #[test]
    fn test_clean_frees_whole_batches() {
        let mut ring = test_ring(64);
        let pool = Mempool::allocate_for_tests(64, 2048).unwrap();

        let mut queue = IxgbeTxQueue {
            descriptors: ring.as_mut_ptr(),
            num_descriptors: 64,
            pool: Some(Rc::clone(&pool)),
            bufs_in_use: VecDeque::new(),
            clean_index: 0,
            tx_index: 0,
        };

        for _ in 0..40 {
            queue.bufs_in_use.push_back(pool.alloc_buf().unwrap());
        }
        queue.tx_index = 40;
        for i in 0..40 {
            mark_done(&mut ring, i);
        }
        let free_before = pool.free_count();

        // one full batch of 32 is cleanable, the remaining 8 are not
        assert_eq!(clean_tx_queue(&mut queue), 32);
        assert_eq!(queue.clean_index, 32);
        assert_eq!(queue.bufs_in_use.len(), 8);
        assert_eq!(pool.free_count(), free_before + 32);
    }

    #[test]
    fn test_clean_stops_at_pending_descriptor() {
        let mut ring = test_ring(64);
        let pool = Mempool::allocate_for_tests(64, 2048).unwrap();

        let mut queue = IxgbeTxQueue {
            descriptors: ring.as_mut_ptr(),
            num_descriptors: 64,
            pool: Some(Rc::clone(&pool)),
            bufs_in_use: VecDeque::new(),
            clean_index: 0,
            tx_index: 0,
        };

        // 63 packets in flight, the hardware has finished all but the
        // batch's last descriptor: nothing may be freed yet
        for _ in 0..63 {
            queue.bufs_in_use.push_back(pool.alloc_buf().unwrap());
        }
        queue.tx_index = 63;
        for i in 0..31 {
            mark_done(&mut ring, i);
        }
        assert_eq!(clean_tx_queue(&mut queue), 0);
        assert_eq!(queue.bufs_in_use.len(), 63);

        // once it completes, the whole batch is freed at once
        mark_done(&mut ring, 31);
        assert_eq!(clean_tx_queue(&mut queue), 32);
        assert_eq!(queue.clean_index, 32);
        assert_eq!(queue.bufs_in_use.len(), 31);
    }

    #[test]
    fn test_clean_wraps_around() {
        let mut ring = test_ring(64);
        let pool = Mempool::allocate_for_tests(64, 2048).unwrap();

        let mut queue = IxgbeTxQueue {
            descriptors: ring.as_mut_ptr(),
            num_descriptors: 64,
            pool: Some(Rc::clone(&pool)),
            bufs_in_use: VecDeque::new(),
            clean_index: 48,
            tx_index: 48,
        };

        // 32 packets in flight crossing the wrap: slots 48..64 and 0..16
        for _ in 0..32 {
            queue.bufs_in_use.push_back(pool.alloc_buf().unwrap());
        }
        queue.tx_index = 16;
        mark_done(&mut ring, 15); // last descriptor of the wrapped batch

        assert_eq!(clean_tx_queue(&mut queue), 16);
        assert_eq!(queue.clean_index, 16);
        assert!(queue.bufs_in_use.is_empty());
    }
}

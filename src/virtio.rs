//! Driver for legacy (pre-1.0) virtio-net devices.
//!
//! The legacy interface exposes its configuration as I/O ports in BAR0.
//! Ports cannot be memory-mapped from user space, so every configuration
//! access is a positioned read or write on the device's `resource0` file.
//! The data path does not touch the ports except for the queue-notify kick.
//!
//! Packets move through split virtqueues: a descriptor table, an available
//! ring the driver fills, and a used ring the device fills. Queue 0 receives,
//! queue 1 transmits, queue 2 carries control commands such as enabling
//! promiscuous mode. Each transmitted or received frame is preceded by a
//! 12-byte virtio-net header; this driver negotiates no offloads, so the
//! header is always zero on transmit and skipped on receive.

use std::collections::VecDeque;
use std::fs::File;
use std::rc::Rc;
use std::sync::atomic::{fence, Ordering};
use std::time::Duration;
use std::{cmp, hint, mem, ptr, thread};

use log::{debug, info};
use volatile::Volatile;

use crate::memory::{Dma, Mempool, Packet, PACKET_HEADROOM};
use crate::pci;
use crate::{DeviceStats, DriverError, DriverResult, NicDevice};

const DRIVER_NAME: &str = "rawnic-virtio";

// legacy virtio register block, I/O port offsets into BAR0
const VIRTIO_PCI_HOST_FEATURES: u64 = 0x00;
const VIRTIO_PCI_GUEST_FEATURES: u64 = 0x04;
const VIRTIO_PCI_QUEUE_PFN: u64 = 0x08;
const VIRTIO_PCI_QUEUE_NUM: u64 = 0x0C;
const VIRTIO_PCI_QUEUE_SEL: u64 = 0x0E;
const VIRTIO_PCI_QUEUE_NOTIFY: u64 = 0x10;
const VIRTIO_PCI_STATUS: u64 = 0x12;
const VIRTIO_PCI_ISR: u64 = 0x13;
/// Start of the device-specific configuration (the MAC for virtio-net).
const VIRTIO_PCI_CONFIG: u64 = 0x14;

// device status bits, written cumulatively during initialization
const VIRTIO_CONFIG_STATUS_RESET: u8 = 0x00;
const VIRTIO_CONFIG_STATUS_ACK: u8 = 0x01;
const VIRTIO_CONFIG_STATUS_DRIVER: u8 = 0x02;
const VIRTIO_CONFIG_STATUS_DRIVER_OK: u8 = 0x04;
const VIRTIO_CONFIG_STATUS_FAILED: u8 = 0x80;

// feature bits of the legacy 32-bit feature word
const VIRTIO_NET_F_CSUM: u32 = 0;
const VIRTIO_NET_F_GUEST_CSUM: u32 = 1;
const VIRTIO_NET_F_CTRL_VQ: u32 = 17;
const VIRTIO_NET_F_CTRL_RX: u32 = 18;

// virtqueue indices of a virtio-net device
const RX_VQ_INDEX: u16 = 0;
const TX_VQ_INDEX: u16 = 1;
const CTRL_VQ_INDEX: u16 = 2;

const VIRTQ_DESC_F_NEXT: u16 = 1;
const VIRTQ_DESC_F_WRITE: u16 = 2;
const VIRTQ_USED_F_NO_NOTIFY: u16 = 1;
const VIRTQ_AVAIL_F_NO_INTERRUPT: u16 = 1;

/// The virtqueue layout is defined in units of 4096-byte pages.
const VQ_ALIGN: usize = 4096;
const PAGE_SHIFT: u32 = 12;

/// Size of the per-packet virtio-net header.
///
/// `{flags, gso_type, hdr_len, gso_size, csum_start, csum_offset,
/// num_buffers}`; always zeroed since no offloads are negotiated.
const VIRTIO_NET_HDR_SIZE: usize = 12;

// control queue command encoding
const VIRTIO_NET_CTRL_RX: u8 = 0;
const VIRTIO_NET_CTRL_RX_PROMISC: u8 = 0;
const VIRTIO_NET_OK: u8 = 0;

fn align_up(x: usize, align: usize) -> usize {
    (x + align - 1) & !(align - 1)
}

/// Bytes needed for a split virtqueue of `num` entries in the legacy layout:
/// descriptor table and available ring first, used ring on the next
/// page boundary.
fn vring_size(num: usize) -> usize {
    align_up(16 * num + 6 + 2 * num, VQ_ALIGN) + align_up(6 + 8 * num, VQ_ALIGN)
}

/// One entry of the descriptor table (16 bytes).
#[repr(C)]
struct VirtqDesc {
    /// Physical address of the buffer.
    addr: Volatile<u64>,
    /// Buffer length in bytes.
    len: Volatile<u32>,
    /// NEXT and WRITE.
    flags: Volatile<u16>,
    /// Index of the chained descriptor, if NEXT is set.
    next: Volatile<u16>,
}

const _: () = assert!(mem::size_of::<VirtqDesc>() == 16);

/// A split virtqueue: descriptor table, available ring, used ring, plus the
/// driver-side bookkeeping (free-descriptor chain, local ring positions, and
/// the mempool entry behind each descriptor).
struct Virtqueue {
    size: u16,
    dma: Dma<u8>,
    desc: *mut VirtqDesc,
    /// `[flags, idx, ring[size], used_event]`, all u16.
    avail: *mut u16,
    /// `[flags: u16, idx: u16, ring[size]: {id: u32, len: u32}, avail_event]`.
    used: *mut u8,
    /// Local copy of the published available index.
    avail_idx: u16,
    /// Next used-ring position to consume.
    last_used_idx: u16,
    /// Head of the free-descriptor chain threaded through `next`.
    free_head: u16,
    num_free: u16,
    /// Mempool entry backing each descriptor, by descriptor id.
    bufs_in_use: Vec<Option<usize>>,
}

impl Virtqueue {
    /// Allocates the ring memory for `size` entries and initializes the
    /// free-descriptor chain.
    fn allocate(size: u16) -> DriverResult<Virtqueue> {
        let bytes = vring_size(size as usize);
        let dma = Dma::<u8>::allocate(bytes, true)?;
        unsafe {
            ptr::write_bytes(dma.virt, 0, bytes);
        }
        Ok(Virtqueue::from_raw(dma, size))
    }

    fn from_raw(dma: Dma<u8>, size: u16) -> Virtqueue {
        let q = size as usize;
        let desc = dma.virt as *mut VirtqDesc;
        let avail = unsafe { dma.virt.add(16 * q) } as *mut u16;
        let used = unsafe { dma.virt.add(align_up(16 * q + 6 + 2 * q, VQ_ALIGN)) };

        // thread the free list through the next fields
        for i in 0..q {
            let d = unsafe { &mut *desc.add(i) };
            d.next.write(if i + 1 < q { (i + 1) as u16 } else { 0 });
        }

        // the driver polls the used ring, interrupts are never wanted
        unsafe {
            ptr::write_volatile(avail, VIRTQ_AVAIL_F_NO_INTERRUPT);
        }

        Virtqueue {
            size,
            dma,
            desc,
            avail,
            used,
            avail_idx: 0,
            last_used_idx: 0,
            free_head: 0,
            num_free: size,
            bufs_in_use: (0..q).map(|_| None).collect(),
        }
    }

    /// Guest page number of the ring memory, as written to queue-PFN.
    fn pfn(&self) -> u32 {
        (self.dma.phys >> PAGE_SHIFT) as u32
    }

    fn alloc_desc(&mut self) -> Option<u16> {
        if self.num_free == 0 {
            return None;
        }
        let id = self.free_head;
        let desc = unsafe { &*self.desc.add(id as usize) };
        self.free_head = desc.next.read();
        self.num_free -= 1;
        Some(id)
    }

    fn free_desc(&mut self, id: u16) {
        let desc = unsafe { &mut *self.desc.add(id as usize) };
        desc.addr.write(0);
        desc.len.write(0);
        desc.flags.write(0);
        desc.next.write(self.free_head);
        self.free_head = id;
        self.num_free += 1;
    }

    /// Returns a whole descriptor chain to the free list.
    fn free_chain(&mut self, head: u16) {
        let mut idx = head;
        loop {
            let desc = unsafe { &*self.desc.add(idx as usize) };
            let flags = desc.flags.read();
            let next = desc.next.read();
            self.free_desc(idx);
            if flags & VIRTQ_DESC_F_NEXT != 0 {
                idx = next;
            } else {
                break;
            }
        }
    }

    fn set_avail_ring(&self, pos: u16, id: u16) {
        unsafe {
            ptr::write_volatile(self.avail.add(2 + pos as usize), id);
        }
    }

    /// Publishes the local available index to the device.
    fn publish_avail_idx(&self) {
        unsafe {
            ptr::write_volatile(self.avail.add(1), self.avail_idx);
        }
    }

    fn used_flags(&self) -> u16 {
        unsafe { ptr::read_volatile(self.used as *const u16) }
    }

    fn used_idx(&self) -> u16 {
        unsafe { ptr::read_volatile(self.used.add(2) as *const u16) }
    }

    /// Returns `(descriptor id, written length)` of the used element at `pos`.
    fn used_ring_entry(&self, pos: u16) -> (u32, u32) {
        let base = unsafe { self.used.add(4 + pos as usize * 8) };
        let id = unsafe { ptr::read_volatile(base as *const u32) };
        let len = unsafe { ptr::read_volatile(base.add(4) as *const u32) };
        (id, len)
    }

    /// Builds a virtqueue over plain heap memory. No device ever sees it.
    #[cfg(test)]
    fn allocate_for_tests(size: u16) -> Virtqueue {
        let bytes = vring_size(size as usize);
        let layout = std::alloc::Layout::from_size_align(bytes, VQ_ALIGN).unwrap();
        let virt = unsafe { std::alloc::alloc_zeroed(layout) };
        assert!(!virt.is_null());
        Virtqueue::from_raw(
            Dma {
                virt,
                phys: virt as usize,
            },
            size,
        )
    }
}

/// The physical address the device writes a received frame's header to:
/// 12 bytes into the headroom, so the frame itself lands at the data offset.
fn rx_buffer_addr(pool: &Rc<Mempool>, entry: usize) -> u64 {
    (pool.get_phys_addr(entry) + PACKET_HEADROOM - VIRTIO_NET_HDR_SIZE) as u64
}

fn rx_buffer_len(pool: &Rc<Mempool>) -> u32 {
    (pool.entry_size() - PACKET_HEADROOM + VIRTIO_NET_HDR_SIZE) as u32
}

/// Kicks the device after new available entries were published.
fn notify(bar0: &File, queue: u16) -> DriverResult {
    pci::write_io16(bar0, VIRTIO_PCI_QUEUE_NOTIFY, queue)
}

/// A legacy virtio-net device attached from user space.
///
/// Construct with [`VirtioDevice::init`] or, generically, with
/// [`crate::init_device`]. One receive and one transmit queue; both map to
/// queue id 0 of the [`NicDevice`] API.
pub struct VirtioDevice {
    pci_addr: String,
    bar0: File,
    rx_queue: Virtqueue,
    tx_queue: Virtqueue,
    ctrl_queue: Virtqueue,
    rx_pool: Rc<Mempool>,
    tx_pool: Option<Rc<Mempool>>,
    /// Scratch DMA memory for control-queue commands.
    ctrl_dma: Dma<u8>,
    /// Software counters; the device keeps none.
    stats: DeviceStats,
}

impl VirtioDevice {
    /// Takes control of the legacy virtio-net device at `pci_addr`,
    /// negotiates features, sets up the three virtqueues and enables
    /// promiscuous mode through the control queue.
    pub fn init(pci_addr: &str) -> DriverResult<VirtioDevice> {
        info!("initializing virtio device {pci_addr}");

        pci::unbind_driver(pci_addr)?;
        pci::enable_dma(pci_addr)?;
        let bar0 = pci::pci_open_resource(pci_addr, "resource0")?;

        // reset the device and wait until it acknowledges
        pci::write_io8(&bar0, VIRTIO_PCI_STATUS, VIRTIO_CONFIG_STATUS_RESET)?;
        while pci::read_io8(&bar0, VIRTIO_PCI_STATUS)? != VIRTIO_CONFIG_STATUS_RESET {
            thread::sleep(Duration::from_millis(1));
        }
        pci::write_io8(&bar0, VIRTIO_PCI_STATUS, VIRTIO_CONFIG_STATUS_ACK)?;
        pci::write_io8(
            &bar0,
            VIRTIO_PCI_STATUS,
            VIRTIO_CONFIG_STATUS_ACK | VIRTIO_CONFIG_STATUS_DRIVER,
        )?;

        // take exactly the features we need, everything else (EVENT_IDX,
        // MRG_RXBUF, VLAN filtering, ...) stays off
        let host_features = pci::read_io32(&bar0, VIRTIO_PCI_HOST_FEATURES)?;
        debug!("device features: {host_features:#034b}");
        let required = (1 << VIRTIO_NET_F_CSUM)
            | (1 << VIRTIO_NET_F_GUEST_CSUM)
            | (1 << VIRTIO_NET_F_CTRL_VQ)
            | (1 << VIRTIO_NET_F_CTRL_RX);
        if host_features & required != required {
            pci::write_io8(&bar0, VIRTIO_PCI_STATUS, VIRTIO_CONFIG_STATUS_FAILED)?;
            return Err(DriverError::MissingFeatures {
                required,
                available: host_features,
            });
        }
        pci::write_io32(&bar0, VIRTIO_PCI_GUEST_FEATURES, required)?;

        let rx_queue = VirtioDevice::setup_queue(&bar0, RX_VQ_INDEX)?;
        let tx_queue = VirtioDevice::setup_queue(&bar0, TX_VQ_INDEX)?;
        let ctrl_queue = VirtioDevice::setup_queue(&bar0, CTRL_VQ_INDEX)?;

        let pool_size = cmp::max(4 * rx_queue.size as usize, 4096);
        let rx_pool = Mempool::allocate(pool_size, 0)?;

        let ctrl_dma = Dma::<u8>::allocate(64, true)?;

        let mut dev = VirtioDevice {
            pci_addr: pci_addr.to_string(),
            bar0,
            rx_queue,
            tx_queue,
            ctrl_queue,
            rx_pool,
            tx_pool: None,
            ctrl_dma,
            stats: DeviceStats::default(),
        };

        dev.fill_rx_queue()?;

        // the device starts serving queues after DRIVER_OK, which therefore
        // comes last
        let status = pci::read_io8(&dev.bar0, VIRTIO_PCI_STATUS)?;
        pci::write_io8(
            &dev.bar0,
            VIRTIO_PCI_STATUS,
            status | VIRTIO_CONFIG_STATUS_DRIVER_OK,
        )?;

        dev.set_promiscuous(true)?;

        Ok(dev)
    }

    /// Selects virtqueue `index`, allocates ring memory matching the size
    /// the device reports and hands the ring over via queue-PFN.
    fn setup_queue(bar0: &File, index: u16) -> DriverResult<Virtqueue> {
        pci::write_io16(bar0, VIRTIO_PCI_QUEUE_SEL, index)?;
        let size = pci::read_io16(bar0, VIRTIO_PCI_QUEUE_NUM)?;
        if size == 0 {
            return Err(DriverError::VirtqueueUnavailable { index });
        }
        debug!("virtqueue {index} has {size} entries");

        let vq = Virtqueue::allocate(size)?;
        pci::write_io32(bar0, VIRTIO_PCI_QUEUE_PFN, vq.pfn())?;

        Ok(vq)
    }

    /// Pre-posts a receive buffer into every descriptor of the rx queue.
    fn fill_rx_queue(&mut self) -> DriverResult {
        let vq = &mut self.rx_queue;
        let size = vq.size;

        for i in 0..size {
            let id = vq.alloc_desc().expect("fresh virtqueue short on descriptors");
            let entry = self.rx_pool.alloc_buf().ok_or(DriverError::NoMemory)?;

            let desc = unsafe { &mut *vq.desc.add(id as usize) };
            desc.addr.write(rx_buffer_addr(&self.rx_pool, entry));
            desc.len.write(rx_buffer_len(&self.rx_pool));
            desc.flags.write(VIRTQ_DESC_F_WRITE);
            desc.next.write(0);

            vq.bufs_in_use[id as usize] = Some(entry);
            vq.set_avail_ring(i % size, id);
        }

        vq.avail_idx = size - 1;
        fence(Ordering::Release);
        vq.publish_avail_idx();
        notify(&self.bar0, RX_VQ_INDEX)?;

        Ok(())
    }

    /// Issues a receive-filter command on the control queue and checks the
    /// device's ack byte.
    fn set_promiscuous(&mut self, on: bool) -> DriverResult {
        // command layout in the scratch region: class, command, on/off, ack
        let base = self.ctrl_dma.virt;
        let phys = self.ctrl_dma.phys;
        unsafe {
            ptr::write_volatile(base, VIRTIO_NET_CTRL_RX);
            ptr::write_volatile(base.add(1), VIRTIO_NET_CTRL_RX_PROMISC);
            ptr::write_volatile(base.add(2), on as u8);
            // poison the ack byte so a stale 0 cannot pass as success
            ptr::write_volatile(base.add(3), 0xff);
        }

        {
            let vq = &mut self.ctrl_queue;
            assert!(vq.num_free >= 3, "control queue out of descriptors");

            // chain: read-only header, read-only payload, device-written ack
            let hdr_id = vq.alloc_desc().expect("control queue descriptor");
            let data_id = vq.alloc_desc().expect("control queue descriptor");
            let ack_id = vq.alloc_desc().expect("control queue descriptor");

            let hdr = unsafe { &mut *vq.desc.add(hdr_id as usize) };
            hdr.addr.write(phys as u64);
            hdr.len.write(2);
            hdr.flags.write(VIRTQ_DESC_F_NEXT);
            hdr.next.write(data_id);

            let data = unsafe { &mut *vq.desc.add(data_id as usize) };
            data.addr.write((phys + 2) as u64);
            data.len.write(1);
            data.flags.write(VIRTQ_DESC_F_NEXT);
            data.next.write(ack_id);

            let ack = unsafe { &mut *vq.desc.add(ack_id as usize) };
            ack.addr.write((phys + 3) as u64);
            ack.len.write(1);
            ack.flags.write(VIRTQ_DESC_F_WRITE);
            ack.next.write(0);

            let pos = vq.avail_idx % vq.size;
            vq.set_avail_ring(pos, hdr_id);
            vq.avail_idx = vq.avail_idx.wrapping_add(1);
        }

        fence(Ordering::Release);
        self.ctrl_queue.publish_avail_idx();
        notify(&self.bar0, CTRL_VQ_INDEX)?;

        // control commands complete quickly, spin until the device answers
        loop {
            fence(Ordering::Acquire);
            let vq = &mut self.ctrl_queue;
            if vq.last_used_idx != vq.used_idx() {
                let (id, _len) = vq.used_ring_entry(vq.last_used_idx % vq.size);
                vq.last_used_idx = vq.last_used_idx.wrapping_add(1);
                vq.free_chain(id as u16);
                break;
            }
            hint::spin_loop();
        }

        let ack = unsafe { ptr::read_volatile(self.ctrl_dma.virt.add(3)) };
        if ack != VIRTIO_NET_OK {
            return Err(DriverError::CtrlQueueFailure { ack });
        }

        info!(
            "promiscuous mode {}",
            if on { "enabled" } else { "disabled" }
        );
        Ok(())
    }
}

impl NicDevice for VirtioDevice {
    fn get_driver_name(&self) -> &str {
        DRIVER_NAME
    }

    fn get_pci_addr(&self) -> &str {
        &self.pci_addr
    }

    fn get_mac_addr(&self) -> [u8; 6] {
        let mut mac = [0; 6];
        for (i, byte) in mac.iter_mut().enumerate() {
            *byte = pci::read_io8(&self.bar0, VIRTIO_PCI_CONFIG + i as u64)
                .expect("reading mac address");
        }
        mac
    }

    fn set_mac_addr(&mut self, mac: [u8; 6]) {
        for (i, byte) in mac.iter().enumerate() {
            pci::write_io8(&self.bar0, VIRTIO_PCI_CONFIG + i as u64, *byte)
                .expect("writing mac address");
        }
    }

    /// Drains the used ring: each element is a filled buffer whose first 12
    /// bytes are the virtio-net header. The descriptor is immediately
    /// reposted with a fresh buffer.
    fn rx_batch(
        &mut self,
        queue_id: u16,
        buffer: &mut VecDeque<Packet>,
        num_packets: usize,
    ) -> usize {
        assert_eq!(queue_id, 0, "rawnic-virtio has exactly one rx queue");

        let mut received = 0;
        if num_packets == 0 {
            return 0;
        }

        // the device's used-ring writes must be visible
        fence(Ordering::Acquire);

        {
            let vq = &mut self.rx_queue;

            while received < num_packets && vq.last_used_idx != vq.used_idx() {
                let (id, len) = vq.used_ring_entry(vq.last_used_idx % vq.size);
                vq.last_used_idx = vq.last_used_idx.wrapping_add(1);
                let id = id as u16;

                let entry = vq.bufs_in_use[id as usize]
                    .take()
                    .expect("used ring points at an idle descriptor");
                let len = len as usize;
                assert!(
                    len >= VIRTIO_NET_HDR_SIZE,
                    "used element shorter than the virtio-net header"
                );

                // the header sits in the headroom, the frame at the data offset
                let packet = unsafe {
                    Packet::new(
                        self.rx_pool.get_virt_addr(entry).add(PACKET_HEADROOM),
                        self.rx_pool.get_phys_addr(entry) + PACKET_HEADROOM,
                        len - VIRTIO_NET_HDR_SIZE,
                        Rc::clone(&self.rx_pool),
                        entry,
                    )
                };
                self.stats.rx_pkts += 1;
                self.stats.rx_bytes += packet.len() as u64;
                buffer.push_back(packet);

                // repost the descriptor with a fresh buffer
                let new_entry = self
                    .rx_pool
                    .alloc_buf()
                    .expect("rx mempool exhausted - packet buffers are leaking");
                let desc = unsafe { &mut *vq.desc.add(id as usize) };
                desc.addr.write(rx_buffer_addr(&self.rx_pool, new_entry));
                desc.len.write(rx_buffer_len(&self.rx_pool));
                desc.flags.write(VIRTQ_DESC_F_WRITE);
                desc.next.write(0);
                vq.bufs_in_use[id as usize] = Some(new_entry);

                let pos = vq.avail_idx % vq.size;
                vq.set_avail_ring(pos, id);
                vq.avail_idx = vq.avail_idx.wrapping_add(1);

                received += 1;
            }
        }

        if received > 0 {
            // descriptor and ring writes must be visible before the index
            fence(Ordering::Release);
            self.rx_queue.publish_avail_idx();
            if self.rx_queue.used_flags() & VIRTQ_USED_F_NO_NOTIFY == 0 {
                notify(&self.bar0, RX_VQ_INDEX).expect("notifying rx queue");
            }
        }

        received
    }

    /// Reclaims finished transmissions, then publishes each packet as a
    /// two-descriptor chain: the zeroed header in the packet's headroom and
    /// the payload.
    fn tx_batch(&mut self, queue_id: u16, packets: &mut VecDeque<Packet>) -> usize {
        assert_eq!(queue_id, 0, "rawnic-virtio has exactly one tx queue");

        fence(Ordering::Acquire);

        {
            let vq = &mut self.tx_queue;
            while vq.last_used_idx != vq.used_idx() {
                let (id, _len) = vq.used_ring_entry(vq.last_used_idx % vq.size);
                vq.last_used_idx = vq.last_used_idx.wrapping_add(1);

                // walk the chain, returning the buffer and both descriptors
                let mut idx = id as u16;
                loop {
                    if let Some(entry) = vq.bufs_in_use[idx as usize].take() {
                        self.tx_pool
                            .as_ref()
                            .expect("tx completion without a pool")
                            .free_buf(entry);
                    }
                    let desc = unsafe { &*vq.desc.add(idx as usize) };
                    let flags = desc.flags.read();
                    let next = desc.next.read();
                    vq.free_desc(idx);
                    if flags & VIRTQ_DESC_F_NEXT != 0 {
                        idx = next;
                    } else {
                        break;
                    }
                }
            }
        }

        let mut sent = 0;

        {
            let vq = &mut self.tx_queue;

            while let Some(mut packet) = packets.pop_front() {
                if vq.num_free < 2 {
                    // ring full, the caller keeps the rest
                    packets.push_front(packet);
                    break;
                }

                match self.tx_pool {
                    Some(ref pool) => assert!(
                        Rc::ptr_eq(pool, &packet.pool),
                        "distinct memory pools for a single tx queue are not supported"
                    ),
                    None => self.tx_pool = Some(Rc::clone(&packet.pool)),
                }

                // no offloads are negotiated, the header is all zeroes
                packet.headroom_mut(VIRTIO_NET_HDR_SIZE).fill(0);

                let hdr_id = vq.alloc_desc().expect("tx descriptor");
                let pay_id = vq.alloc_desc().expect("tx descriptor");

                let hdr = unsafe { &mut *vq.desc.add(hdr_id as usize) };
                hdr.addr
                    .write((packet.get_phys_addr() - VIRTIO_NET_HDR_SIZE) as u64);
                hdr.len.write(VIRTIO_NET_HDR_SIZE as u32);
                hdr.flags.write(VIRTQ_DESC_F_NEXT);
                hdr.next.write(pay_id);

                let pay = unsafe { &mut *vq.desc.add(pay_id as usize) };
                pay.addr.write(packet.get_phys_addr() as u64);
                pay.len.write(packet.len() as u32);
                pay.flags.write(0);
                pay.next.write(0);

                self.stats.tx_pkts += 1;
                self.stats.tx_bytes += packet.len() as u64;

                vq.bufs_in_use[pay_id as usize] = Some(packet.pool_entry);
                // the buffer belongs to the ring now, the used-ring walk
                // above returns it to the pool without running the drop
                mem::forget(packet);

                let pos = vq.avail_idx % vq.size;
                vq.set_avail_ring(pos, hdr_id);
                vq.avail_idx = vq.avail_idx.wrapping_add(1);

                sent += 1;
            }
        }

        if sent > 0 {
            fence(Ordering::Release);
            self.tx_queue.publish_avail_idx();
            if self.tx_queue.used_flags() & VIRTQ_USED_F_NO_NOTIFY == 0 {
                notify(&self.bar0, TX_VQ_INDEX).expect("notifying tx queue");
            }
        }

        sent
    }

    fn read_stats(&mut self, stats: &mut DeviceStats) {
        // software counters, kept delta-style like the hardware ones
        stats.rx_pkts += self.stats.rx_pkts;
        stats.tx_pkts += self.stats.tx_pkts;
        stats.rx_bytes += self.stats.rx_bytes;
        stats.tx_bytes += self.stats.tx_bytes;
        self.stats = DeviceStats::default();
    }

    fn reset_stats(&mut self) {
        self.stats = DeviceStats::default();
    }

    fn get_link_speed(&self) -> u16 {
        // the legacy configuration has no link speed, report virtio's
        // customary 1 GbE
        1000
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vring_size_matches_legacy_layout() {
        // 256 entries: 4096 bytes of descriptors + 518 of available ring
        // round up to 8192, the used ring (2054) takes one more page
        assert_eq!(vring_size(256), 8192 + 4096);
        // qemu's default of 1024: 16384 + 6 + 2048 -> 20480, used 8198 -> 8192 + 4096
        assert_eq!(vring_size(1024), 20480 + 12288);
    }

    #[test]
    fn test_align_up() {
        assert_eq!(align_up(0, 4096), 0);
        assert_eq!(align_up(1, 4096), 4096);
        assert_eq!(align_up(4096, 4096), 4096);
        assert_eq!(align_up(4097, 4096), 8192);
    }

    #[test]
    fn test_required_features() {
        let required: u32 = (1 << VIRTIO_NET_F_CSUM)
            | (1 << VIRTIO_NET_F_GUEST_CSUM)
            | (1 << VIRTIO_NET_F_CTRL_VQ)
            | (1 << VIRTIO_NET_F_CTRL_RX);
        assert_eq!(required, 0x60003);
    }

    #[test]
    fn test_descriptor_alloc_and_free_chain() {
        let mut vq = Virtqueue::allocate_for_tests(8);
        assert_eq!(vq.num_free, 8);

        // fresh queues hand out descriptors in order
        let a = vq.alloc_desc().unwrap();
        let b = vq.alloc_desc().unwrap();
        let c = vq.alloc_desc().unwrap();
        assert_eq!((a, b, c), (0, 1, 2));
        assert_eq!(vq.num_free, 5);

        // chain a -> b -> c and free the whole chain at once
        unsafe {
            (*vq.desc.add(a as usize)).flags.write(VIRTQ_DESC_F_NEXT);
            (*vq.desc.add(a as usize)).next.write(b);
            (*vq.desc.add(b as usize)).flags.write(VIRTQ_DESC_F_NEXT);
            (*vq.desc.add(b as usize)).next.write(c);
            (*vq.desc.add(c as usize)).flags.write(0);
        }
        vq.free_chain(a);
        assert_eq!(vq.num_free, 8);
    }

    #[test]
    fn test_exhausting_descriptors() {
        let mut vq = Virtqueue::allocate_for_tests(4);
        for _ in 0..4 {
            assert!(vq.alloc_desc().is_some());
        }
        assert!(vq.alloc_desc().is_none());

        vq.free_desc(2);
        assert_eq!(vq.alloc_desc(), Some(2));
    }

    #[test]
    fn test_avail_ring_publication() {
        let mut vq = Virtqueue::allocate_for_tests(8);

        vq.set_avail_ring(0, 5);
        vq.avail_idx = 1;
        vq.publish_avail_idx();

        // flags carry the no-interrupt hint, idx follows the local copy
        unsafe {
            assert_eq!(ptr::read_volatile(vq.avail), VIRTQ_AVAIL_F_NO_INTERRUPT);
            assert_eq!(ptr::read_volatile(vq.avail.add(1)), 1);
            assert_eq!(ptr::read_volatile(vq.avail.add(2)), 5);
        }
    }

    #[test]
    fn test_used_ring_entry_layout() {
        let vq = Virtqueue::allocate_for_tests(8);

        // emulate the device completing descriptor 3 with 60 bytes
        unsafe {
            ptr::write_volatile(vq.used.add(2) as *mut u16, 1);
            ptr::write_volatile(vq.used.add(4) as *mut u32, 3);
            ptr::write_volatile(vq.used.add(8) as *mut u32, 60);
        }

        assert_eq!(vq.used_idx(), 1);
        assert_eq!(vq.used_ring_entry(0), (3, 60));
    }
}

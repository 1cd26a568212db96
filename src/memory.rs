//! Memory management for the drivers.
//!
//! This module provides DMA allocation and memory pool management for both
//! backends. It includes:
//!
//! - [`Dma`]: a hugepage-backed allocation with a stable physical address
//! - [`virt_to_phys`]: virtual-to-physical translation through the kernel's
//!   pagemap
//! - [`Mempool`]: a fixed-size pool of DMA-capable packet buffers
//! - [`Packet`]: a packet buffer that returns to its pool on drop
//!
//! # DMA Memory
//!
//! The NIC reads and writes packet buffers and descriptor rings by physical
//! address, so the driver needs memory whose physical location is known and
//! never changes. Hugepages provide that: they are 2 MiB of physically
//! contiguous memory, they are never swapped, and their virtual-to-physical
//! mapping can be resolved once through `/proc/self/pagemap` and cached.
//!
//! # Memory Pool
//!
//! The memory pool pre-allocates a fixed number of equally-sized buffers from
//! one DMA region and precomputes each buffer's physical address. Allocation
//! pops an index off a free stack; dropping a [`Packet`] pushes it back.
//!
//! A mempool and every buffer sourced from it belong to one thread. The pool
//! hands out `Rc` handles, not `Arc`: sharing one across threads is a compile
//! error, not undefined behavior.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::fmt::{self, Debug};
use std::fs::OpenOptions;
use std::io;
use std::ops::{Deref, DerefMut};
use std::os::unix::fs::FileExt;
use std::os::unix::io::AsRawFd;
use std::process;
use std::ptr::{self, NonNull};
use std::rc::Rc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::{fs, slice};

use log::{error, info};

use crate::{DriverError, DriverResult};

const HUGE_PAGE_BITS: u32 = 21;
/// Size of a huge page (2 MiB).
pub const HUGE_PAGE_SIZE: usize = 1 << HUGE_PAGE_BITS;

/// Where the hugetlbfs used for DMA memory is mounted.
const HUGE_PAGE_MOUNT: &str = "/mnt/huge";

/// Headroom reserved at the start of each packet buffer.
///
/// This space can be used to prepend headers without copying the packet data.
/// The virtio backend places its 12-byte virtio-net header here, so the
/// headroom must not shrink below that.
///
/// The physical address posted to a NIC for a buffer is always the buffer's
/// base address plus this offset.
pub const PACKET_HEADROOM: usize = 32;

/// Distinguishes the hugetlbfs files of concurrently running drivers.
static HUGEPAGE_ID: AtomicUsize = AtomicUsize::new(0);

/// Translates an arbitrary virtual address of this process into a physical
/// address using `/proc/self/pagemap`.
///
/// # Errors
///
/// Fails with [`DriverError::PageNotPresent`] if the page is not resident,
/// or [`DriverError::Io`] if pagemap is unreadable (usually missing root
/// privileges).
pub fn virt_to_phys(virt: usize) -> DriverResult<usize> {
    let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) } as usize;

    let pagemap = OpenOptions::new()
        .read(true)
        .open("/proc/self/pagemap")
        .map_err(|e| DriverError::io("opening /proc/self/pagemap", e))?;

    let mut entry = [0; 8];
    pagemap
        .read_exact_at(&mut entry, (virt / page_size * 8) as u64)
        .map_err(|e| DriverError::io("reading /proc/self/pagemap", e))?;
    let entry = u64::from_le_bytes(entry);

    if entry & (1 << 63) == 0 {
        return Err(DriverError::PageNotPresent { virt });
    }

    // bits 0..54 hold the page frame number
    let pfn = entry & ((1 << 54) - 1);
    Ok(pfn as usize * page_size + virt % page_size)
}

/// DMA-capable memory block backed by hugepages.
///
/// The block is mapped shared and locked, so `phys` stays valid for the
/// lifetime of the process. The mapping is never unmapped; drivers allocate
/// all their DMA memory at initialization and keep it until exit.
pub struct Dma<T> {
    /// Virtual address of the mapping.
    pub virt: *mut T,
    /// Physical address of the first byte.
    pub phys: usize,
}

impl<T> Dma<T> {
    /// Allocates a new DMA memory block of at least `size` bytes.
    ///
    /// With `require_contiguous` set the caller gets one physically
    /// contiguous block; such requests are limited to a single huge page.
    /// Without it, the block is contiguous per hugepage only and callers must
    /// translate addresses per entry.
    ///
    /// # Errors
    ///
    /// Returns [`DriverError::DmaTooLarge`] for oversized contiguous requests
    /// and [`DriverError::Io`] when the hugetlbfs mount is missing or out of
    /// pages.
    pub fn allocate(size: usize, require_contiguous: bool) -> DriverResult<Dma<T>> {
        if require_contiguous && size > HUGE_PAGE_SIZE {
            return Err(DriverError::DmaTooLarge { size });
        }

        let size = if size % HUGE_PAGE_SIZE != 0 {
            ((size >> HUGE_PAGE_BITS) + 1) << HUGE_PAGE_BITS
        } else {
            size
        };

        let id = HUGEPAGE_ID.fetch_add(1, Ordering::SeqCst);
        let path = format!("{}/rawnic-{}-{}", HUGE_PAGE_MOUNT, process::id(), id);

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)
            .map_err(|e| {
                DriverError::io(
                    format!("opening {path} (is a hugetlbfs mounted at {HUGE_PAGE_MOUNT}?)"),
                    e,
                )
            })?;
        file.set_len(size as u64)
            .map_err(|e| DriverError::io(format!("growing {path}"), e))?;

        let virt = unsafe {
            libc::mmap(
                ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED | libc::MAP_HUGETLB,
                file.as_raw_fd(),
                0,
            )
        };
        if virt == libc::MAP_FAILED {
            return Err(DriverError::io(
                format!("mapping {path} (are enough hugepages configured?)"),
                io::Error::last_os_error(),
            ));
        }
        if unsafe { libc::mlock(virt, size) } != 0 {
            return Err(DriverError::io(
                format!("locking {path}"),
                io::Error::last_os_error(),
            ));
        }

        // the mapping keeps the pages alive without the file
        let _ = fs::remove_file(&path);

        let phys = virt_to_phys(virt as usize)?;
        info!("allocated DMA memory @phys: {phys:#x}, virt: {virt:p}, size: {size:#x}");

        Ok(Dma {
            virt: virt as *mut T,
            phys,
        })
    }
}

/// A memory pool for DMA-capable packet buffer allocation.
///
/// The pool pre-allocates a fixed number of equally-sized buffers from
/// hugepage memory. This design ensures that:
///
/// - every buffer's physical address is known up front and never changes
/// - allocation is a stack pop, freeing is a push
/// - memory fragmentation is avoided
///
/// # Example
///
/// ```rust,ignore
/// use rawnic::memory::Mempool;
///
/// // a pool with 4096 entries of 2048 bytes each
/// let pool = Mempool::allocate(4096, 2048)?;
/// assert_eq!(pool.entry_size(), 2048);
/// ```
pub struct Mempool {
    base_addr: *mut u8,
    num_entries: usize,
    entry_size: usize,
    phys_addr: Vec<usize>,
    pub(crate) free_stack: RefCell<Vec<usize>>,
}

impl Mempool {
    /// Allocates a new memory pool.
    ///
    /// Creates a pool with `entries` buffers of `size` bytes each; a `size`
    /// of 0 selects the default of 2048. The entry size must divide the huge
    /// page size so no buffer straddles a hugepage boundary.
    ///
    /// # Errors
    ///
    /// - [`DriverError::PageNotAligned`] if `size` does not divide the huge
    ///   page size
    /// - [`DriverError::Io`] if the hugepage allocation fails
    pub fn allocate(entries: usize, size: usize) -> DriverResult<Rc<Mempool>> {
        let entry_size = match size {
            0 => 2048,
            x => x,
        };

        if HUGE_PAGE_SIZE % entry_size != 0 {
            error!("entry size must be a divisor of the huge page size");
            return Err(DriverError::PageNotAligned);
        }

        let dma = Dma::<u8>::allocate(entries * entry_size, false)?;

        // entries never straddle a hugepage, so translating each entry's base
        // address is enough even when the region itself is not contiguous
        let mut phys_addr = Vec::with_capacity(entries);
        for i in 0..entries {
            phys_addr.push(virt_to_phys(dma.virt as usize + i * entry_size)?);
        }

        let pool = Rc::new(Mempool {
            base_addr: dma.virt,
            num_entries: entries,
            entry_size,
            phys_addr,
            free_stack: RefCell::new(Vec::with_capacity(entries)),
        });
        pool.free_stack.borrow_mut().extend(0..entries);

        Ok(pool)
    }

    /// Returns the position of a free buffer in the pool, or [`None`] if the
    /// pool is empty.
    pub(crate) fn alloc_buf(&self) -> Option<usize> {
        self.free_stack.borrow_mut().pop()
    }

    /// Marks a buffer in the pool as free.
    pub(crate) fn free_buf(&self, id: usize) {
        assert!(
            id < self.num_entries,
            "buffer outside of memory pool, id: {id}"
        );

        let mut free_stack = self.free_stack.borrow_mut();
        if free_stack.contains(&id) {
            panic!("free buf: buffer already free");
        }

        free_stack.push(id);
    }

    /// Returns the size (in bytes) of each entry in the pool.
    pub fn entry_size(&self) -> usize {
        self.entry_size
    }

    /// Returns the number of entries in the pool.
    pub fn num_entries(&self) -> usize {
        self.num_entries
    }

    /// Returns the number of currently free entries.
    pub fn free_count(&self) -> usize {
        self.free_stack.borrow().len()
    }

    /// Returns the virtual address of a buffer in the pool.
    pub(crate) fn get_virt_addr(&self, id: usize) -> *mut u8 {
        assert!(
            id < self.num_entries,
            "buffer outside of memory pool, id: {id}"
        );

        unsafe { self.base_addr.add(id * self.entry_size) }
    }

    /// Returns the physical address of a buffer in the pool.
    ///
    /// This is the entry's base address; the data area the NIC reads and
    /// writes starts [`PACKET_HEADROOM`] bytes further.
    pub fn get_phys_addr(&self, id: usize) -> usize {
        self.phys_addr[id]
    }

    /// Builds a pool over plain heap memory with faked physical addresses.
    /// No hardware ever sees these buffers.
    #[cfg(test)]
    pub(crate) fn allocate_for_tests(entries: usize, size: usize) -> DriverResult<Rc<Mempool>> {
        let entry_size = match size {
            0 => 2048,
            x => x,
        };

        if HUGE_PAGE_SIZE % entry_size != 0 {
            return Err(DriverError::PageNotAligned);
        }

        let layout = std::alloc::Layout::from_size_align(entries * entry_size, 4096).unwrap();
        let base_addr = unsafe { std::alloc::alloc_zeroed(layout) };
        assert!(!base_addr.is_null());

        let phys_addr = (0..entries)
            .map(|i| base_addr as usize + i * entry_size)
            .collect();

        let pool = Rc::new(Mempool {
            base_addr,
            num_entries: entries,
            entry_size,
            phys_addr,
            free_stack: RefCell::new(Vec::with_capacity(entries)),
        });
        pool.free_stack.borrow_mut().extend(0..entries);

        Ok(pool)
    }
}

/// A packet buffer that returns to its pool when dropped.
///
/// `Packet` represents one buffer allocated from a [`Mempool`]. The packet
/// implements `Deref` and `DerefMut` to `[u8]` for direct access to the
/// packet data, which starts [`PACKET_HEADROOM`] bytes into the underlying
/// pool entry.
///
/// # Cloning
///
/// Cloning allocates a fresh buffer from the same pool and copies the data.
///
/// # Example
///
/// ```rust,ignore
/// use rawnic::memory::alloc_pkt;
///
/// let mut packet = alloc_pkt(&pool, 60).unwrap();
/// packet.as_mut_bytes()[0] = 0xFF;
/// let phys = packet.get_phys_addr(); // hand this to the NIC
/// ```
pub struct Packet {
    pub(crate) addr_virt: NonNull<u8>,
    pub(crate) addr_phys: usize,
    pub(crate) len: usize,
    pub(crate) pool: Rc<Mempool>,
    pub(crate) pool_entry: usize,
}

impl Clone for Packet {
    fn clone(&self) -> Self {
        let mut p = alloc_pkt(&self.pool, self.len).expect("no buffer available");
        p.clone_from_slice(self);

        p
    }
}

impl Deref for Packet {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        unsafe { slice::from_raw_parts(self.addr_virt.as_ptr(), self.len) }
    }
}

impl DerefMut for Packet {
    fn deref_mut(&mut self) -> &mut [u8] {
        unsafe { slice::from_raw_parts_mut(self.addr_virt.as_ptr(), self.len) }
    }
}

impl Debug for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        (**self).fmt(f)
    }
}

impl Drop for Packet {
    fn drop(&mut self) {
        self.pool.free_buf(self.pool_entry);
    }
}

impl Packet {
    /// Creates a new packet from raw components.
    ///
    /// # Safety
    ///
    /// The caller must ensure that:
    /// - `addr_virt` points to valid memory
    /// - `addr_phys` is the physical address backing `addr_virt`
    /// - the memory belongs to entry `pool_entry` of `pool`
    /// - `len` does not exceed the entry's data area
    pub(crate) unsafe fn new(
        addr_virt: *mut u8,
        addr_phys: usize,
        len: usize,
        pool: Rc<Mempool>,
        pool_entry: usize,
    ) -> Packet {
        Packet {
            addr_virt: NonNull::new_unchecked(addr_virt),
            addr_phys,
            len,
            pool,
            pool_entry,
        }
    }

    /// Returns the virtual address of the packet data.
    pub fn get_virt_addr(&self) -> *mut u8 {
        self.addr_virt.as_ptr()
    }

    /// Returns the physical address of the packet data.
    ///
    /// This is the address the NIC reads from or writes to.
    pub fn get_phys_addr(&self) -> usize {
        self.addr_phys
    }

    /// Returns the pool this packet was allocated from.
    pub fn pool(&self) -> &Rc<Mempool> {
        &self.pool
    }

    /// Returns the packet data as a byte slice.
    pub fn as_bytes(&self) -> &[u8] {
        unsafe { slice::from_raw_parts(self.addr_virt.as_ptr(), self.len) }
    }

    /// Returns the packet data as a mutable byte slice.
    pub fn as_mut_bytes(&mut self) -> &mut [u8] {
        unsafe { slice::from_raw_parts_mut(self.addr_virt.as_ptr(), self.len) }
    }

    /// Returns a mutable slice covering the last `len` bytes of the packet's
    /// headroom, i.e. the bytes immediately before the packet data.
    ///
    /// # Panics
    ///
    /// Panics if `len` is greater than [`PACKET_HEADROOM`].
    pub fn headroom_mut(&mut self, len: usize) -> &mut [u8] {
        assert!(len <= PACKET_HEADROOM);
        unsafe { slice::from_raw_parts_mut(self.addr_virt.as_ptr().sub(len), len) }
    }

    /// Prefetches the packet data into the CPU cache.
    #[cfg(target_arch = "x86_64")]
    #[inline(always)]
    pub fn prefetch(&self, hint: Prefetch) {
        if is_x86_feature_detected!("sse") {
            let addr = self.get_virt_addr() as *const _;
            unsafe {
                use std::arch::x86_64;
                match hint {
                    Prefetch::Time0 => x86_64::_mm_prefetch(addr, x86_64::_MM_HINT_T0),
                    Prefetch::Time1 => x86_64::_mm_prefetch(addr, x86_64::_MM_HINT_T1),
                    Prefetch::Time2 => x86_64::_mm_prefetch(addr, x86_64::_MM_HINT_T2),
                    Prefetch::NonTemporal => x86_64::_mm_prefetch(addr, x86_64::_MM_HINT_NTA),
                }
            }
        }
    }
}

/// Allocates a packet of `size` bytes from the memory pool.
///
/// Returns [`None`] when the pool is exhausted or `size` exceeds the space
/// left after the headroom.
///
/// # Example
///
/// ```rust,ignore
/// use rawnic::memory::alloc_pkt;
///
/// if let Some(packet) = alloc_pkt(&pool, 60) {
///     // fill and send the packet
/// }
/// ```
pub fn alloc_pkt(pool: &Rc<Mempool>, size: usize) -> Option<Packet> {
    if size > pool.entry_size - PACKET_HEADROOM {
        return None;
    }

    pool.alloc_buf().map(|id| unsafe {
        Packet::new(
            pool.get_virt_addr(id).add(PACKET_HEADROOM),
            pool.get_phys_addr(id) + PACKET_HEADROOM,
            size,
            Rc::clone(pool),
            id,
        )
    })
}

/// Allocates up to `num_packets` packets of `packet_size` bytes and appends
/// them to `buffer`.
///
/// Behaves like `num_packets` calls to [`alloc_pkt`] but stops early when the
/// pool runs dry. Returns the number of packets allocated.
pub fn alloc_pkt_batch(
    pool: &Rc<Mempool>,
    buffer: &mut VecDeque<Packet>,
    num_packets: usize,
    packet_size: usize,
) -> usize {
    let mut allocated = 0;

    while allocated < num_packets {
        match alloc_pkt(pool, packet_size) {
            Some(p) => {
                buffer.push_back(p);
                allocated += 1;
            }
            None => break,
        }
    }

    allocated
}

/// CPU cache prefetch hints for x86_64 SSE instructions.
///
/// These hints control how data is fetched into the cache hierarchy.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug)]
pub enum Prefetch {
    /// Corresponds to _MM_HINT_T0 on x86 sse.
    ///
    /// Fetch data into all cache levels.
    Time0,

    /// Corresponds to _MM_HINT_T1 on x86 sse.
    ///
    /// Fetch data into L2 cache (not L1).
    Time1,

    /// Corresponds to _MM_HINT_T2 on x86 sse.
    ///
    /// Fetch data into L3 cache (not L2 or L1).
    Time2,

    /// Corresponds to _MM_HINT_NTA on x86 sse.
    ///
    /// Non-temporal fetch - data is not expected to be reused.
    NonTemporal,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constants() {
        assert_eq!(HUGE_PAGE_BITS, 21);
        assert_eq!(HUGE_PAGE_SIZE, 1 << 21);
        assert_eq!(HUGE_PAGE_SIZE, 0x200000);
        // the virtio-net header has to fit into the headroom
        assert!(PACKET_HEADROOM >= 12);
    }

    #[test]
    fn test_mempool_invalid_entry_size() {
        let result = Mempool::allocate_for_tests(64, 100);
        assert!(matches!(result, Err(DriverError::PageNotAligned)));
    }

    #[test]
    fn test_mempool_default_entry_size() {
        let pool = Mempool::allocate_for_tests(64, 0).unwrap();
        assert_eq!(pool.entry_size(), 2048);
    }

    #[test]
    fn test_packet_allocation_and_free() {
        let pool = Mempool::allocate_for_tests(64, 2048).unwrap();
        assert_eq!(pool.free_count(), 64);

        let packet = alloc_pkt(&pool, 1500).expect("failed to allocate packet");
        assert_eq!(packet.len(), 1500);
        assert_eq!(pool.free_count(), 63);

        drop(packet);
        assert_eq!(pool.free_count(), 64);
    }

    #[test]
    fn test_packet_physical_address_offset() {
        let pool = Mempool::allocate_for_tests(4, 2048).unwrap();
        let packet = alloc_pkt(&pool, 60).unwrap();

        let entry = packet.pool_entry;
        assert_eq!(
            packet.get_phys_addr(),
            pool.get_phys_addr(entry) + PACKET_HEADROOM
        );
    }

    #[test]
    fn test_packet_too_large() {
        let pool = Mempool::allocate_for_tests(4, 2048).unwrap();
        assert!(alloc_pkt(&pool, 2048 - PACKET_HEADROOM + 1).is_none());
        assert!(alloc_pkt(&pool, 2048 - PACKET_HEADROOM).is_some());
    }

    #[test]
    fn test_pool_exhaustion() {
        let pool = Mempool::allocate_for_tests(2, 2048).unwrap();

        let p1 = alloc_pkt(&pool, 1500).unwrap();
        let _p2 = alloc_pkt(&pool, 1500).unwrap();
        assert!(alloc_pkt(&pool, 1500).is_none());

        drop(p1);
        assert!(alloc_pkt(&pool, 1500).is_some());
    }

    #[test]
    fn test_batch_alloc_stops_at_pool_size() {
        let pool = Mempool::allocate_for_tests(8, 2048).unwrap();
        let mut buffer = VecDeque::new();

        let allocated = alloc_pkt_batch(&pool, &mut buffer, 32, 60);
        assert_eq!(allocated, 8);
        assert_eq!(buffer.len(), 8);
        assert_eq!(pool.free_count(), 0);

        // batch alloc and drop round-trips the free count
        buffer.clear();
        assert_eq!(pool.free_count(), 8);
    }

    #[test]
    #[should_panic(expected = "buffer already free")]
    fn test_double_free_panics() {
        let pool = Mempool::allocate_for_tests(4, 2048).unwrap();
        let packet = alloc_pkt(&pool, 60).unwrap();
        let entry = packet.pool_entry;
        drop(packet);
        pool.free_buf(entry);
    }

    #[test]
    fn test_packet_data_access() {
        let pool = Mempool::allocate_for_tests(4, 2048).unwrap();
        let mut packet = alloc_pkt(&pool, 1500).unwrap();

        {
            let data = packet.as_mut_bytes();
            data[0] = 0xFF;
            data[1499] = 0xAA;
        }

        assert_eq!(packet.as_bytes()[0], 0xFF);
        assert_eq!(packet.as_bytes()[1499], 0xAA);
    }

    #[test]
    fn test_packet_clone_is_deep() {
        let pool = Mempool::allocate_for_tests(4, 2048).unwrap();
        let mut original = alloc_pkt(&pool, 100).unwrap();
        original.as_mut_bytes()[0] = 0x42;

        let cloned = original.clone();
        assert_eq!(cloned.len(), original.len());
        assert_eq!(cloned.as_bytes()[0], 0x42);

        original.as_mut_bytes()[0] = 0x24;
        assert_eq!(cloned.as_bytes()[0], 0x42);
    }

    #[test]
    fn test_headroom_is_before_data() {
        let pool = Mempool::allocate_for_tests(4, 2048).unwrap();
        let mut packet = alloc_pkt(&pool, 60).unwrap();

        let headroom = packet.headroom_mut(12);
        assert_eq!(headroom.len(), 12);
        headroom.fill(0xDE);

        // the data area is untouched
        assert_eq!(packet.as_bytes()[0], 0);
    }

    #[test]
    #[should_panic]
    fn test_headroom_too_large() {
        let pool = Mempool::allocate_for_tests(4, 2048).unwrap();
        let mut packet = alloc_pkt(&pool, 60).unwrap();
        let _ = packet.headroom_mut(PACKET_HEADROOM + 1);
    }
}

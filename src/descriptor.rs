//! Advanced receive and transmit descriptors for the 82599.
//!
//! Descriptors are 16-byte records shared with the NIC. Each has two views
//! over the same memory: *read*, which the driver fills with buffer
//! addresses, and *write-back*, which the hardware overwrites with status on
//! completion. Only the DD (descriptor done) bit tells which view is
//! currently valid, so the types below expose both sets of accessors and the
//! queue code keeps track of ownership.
//!
//! Layouts follow the 82599 datasheet, §7.1.6.1 (receive) and §7.2.3.2.4
//! (transmit). All fields are volatile: the memory is written by the device
//! behind the compiler's back.

use bit_field::BitField;
use volatile::Volatile;

/// RX write-back status: descriptor done.
pub const RX_STATUS_DD: u32 = 1 << 0;
/// RX write-back status: end of packet.
pub const RX_STATUS_EOP: u32 = 1 << 1;

/// TX command: end of packet.
pub const TX_CMD_EOP: u8 = 1 << 0;
/// TX command: insert FCS (Ethernet CRC).
pub const TX_CMD_IFCS: u8 = 1 << 1;
/// TX command: report status, i.e. write back the DD bit when done.
pub const TX_CMD_RS: u8 = 1 << 3;
/// TX command: descriptor extension, must be set for advanced descriptors.
pub const TX_CMD_DEXT: u8 = 1 << 5;

/// TX descriptor type: advanced data descriptor.
pub const TX_DTYP_ADV: u8 = 0x3 << 4;
/// TX write-back status: descriptor done.
pub const TX_STATUS_DD: u32 = 1 << 0;
/// Shift of the PAYLEN field within [`AdvancedTxDescriptor::paylen_popts_cc_idx_sta`].
pub const TX_PAYLEN_SHIFT: u32 = 46 - 32;

/// Advanced receive descriptor.
///
/// In read mode the first quadword carries the packet buffer's physical
/// address and the second the header buffer's (unused, header splitting is
/// off). In write-back mode the hardware reuses the first quadword for
/// RSS/packet-type information and the second for status, errors and the
/// packet length.
#[repr(C)]
pub struct AdvancedRxDescriptor {
    /// Read: packet buffer address. Write-back: RSS and packet type info.
    pub packet_buffer_address: Volatile<u64>,
    /// Read: header buffer address. Write-back: status, errors, length.
    pub header_buffer_address: Volatile<u64>,
}

impl AdvancedRxDescriptor {
    /// Zeroes the descriptor.
    pub fn init(&mut self) {
        self.packet_buffer_address.write(0);
        self.header_buffer_address.write(0);
    }

    /// Read mode: points the descriptor at a packet buffer.
    pub fn set_packet_address(&mut self, addr: u64) {
        self.packet_buffer_address.write(addr);
    }

    /// Clears the write-back status so the descriptor can be handed back to
    /// the hardware. Leaves the packet buffer address untouched.
    pub fn reset_status(&mut self) {
        self.header_buffer_address.write(0);
    }

    /// Write-back mode: whether the hardware is done with this descriptor.
    pub fn descriptor_done(&self) -> bool {
        self.header_buffer_address.read() & RX_STATUS_DD as u64 != 0
    }

    /// Write-back mode: whether this descriptor is the last of its frame.
    ///
    /// Always set in this driver's configuration; a clear bit means the
    /// frame did not fit into a single buffer.
    pub fn end_of_packet(&self) -> bool {
        self.header_buffer_address.read() & RX_STATUS_EOP as u64 != 0
    }

    /// Write-back mode: length of the received packet in bytes.
    pub fn length(&self) -> u64 {
        self.header_buffer_address.read().get_bits(32..48)
    }

    /// Write-back mode: length of the received packet in bytes.
    pub fn get_pkt_len(&self) -> u64 {
        self.length()
    }

    /// Write-back mode: the RSS type the hardware hashed this packet with.
    pub fn get_rss_type(&self) -> u64 {
        self.packet_buffer_address.read().get_bits(0..4)
    }

    /// Write-back mode: the packet type as identified by the hardware.
    pub fn get_packet_type(&self) -> u64 {
        self.packet_buffer_address.read().get_bits(4..16)
    }
}

/// Advanced transmit descriptor.
///
/// The second quadword is split into its subfields so each can be written
/// with a plain volatile store:
///
/// * data length:  bits [15:0]
/// * dtyp/mac/rsv: bits [23:16]
/// * dcmd:         bits [31:24]
/// * sta/idx/cc/popts/paylen: bits [63:32]
#[repr(C)]
pub struct AdvancedTxDescriptor {
    /// Physical address of the packet buffer.
    pub packet_buffer_address: Volatile<u64>,
    /// Length of the data buffer in bytes.
    pub data_len: Volatile<u16>,
    /// Descriptor type in the high nibble, MAC/reserved in the low.
    pub dtyp_mac_rsv: Volatile<u8>,
    /// Descriptor command byte (EOP, IFCS, RS, DEXT).
    pub dcmd: Volatile<u8>,
    /// PAYLEN in the upper bits, write-back status (DD) in the lowest.
    pub paylen_popts_cc_idx_sta: Volatile<u32>,
}

impl AdvancedTxDescriptor {
    /// Zeroes the descriptor.
    pub fn init(&mut self) {
        self.packet_buffer_address.write(0);
        self.data_len.write(0);
        self.dtyp_mac_rsv.write(0);
        self.dcmd.write(0);
        self.paylen_popts_cc_idx_sta.write(0);
    }

    /// Fills the descriptor for transmission of one complete packet.
    ///
    /// RS is set on every descriptor; the queue frees buffers in batches by
    /// polling the DD bit of each batch's last descriptor.
    pub fn send(&mut self, buffer_addr: u64, len: u16) {
        self.packet_buffer_address.write(buffer_addr);
        self.data_len.write(len);
        self.dtyp_mac_rsv.write(TX_DTYP_ADV);
        self.paylen_popts_cc_idx_sta
            .write((len as u32) << TX_PAYLEN_SHIFT);
        self.dcmd
            .write(TX_CMD_DEXT | TX_CMD_RS | TX_CMD_IFCS | TX_CMD_EOP);
    }

    /// Write-back mode: whether the hardware has sent this packet.
    pub fn descriptor_done(&self) -> bool {
        self.paylen_popts_cc_idx_sta.read() & TX_STATUS_DD != 0
    }
}

// both descriptor formats are exactly 16 bytes on the wire
const _: () = assert!(core::mem::size_of::<AdvancedRxDescriptor>() == 16);
const _: () = assert!(core::mem::size_of::<AdvancedTxDescriptor>() == 16);

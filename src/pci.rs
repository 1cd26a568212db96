//! PCI device access through sysfs.
//!
//! Devices are identified by a fully qualified PCI bus address of the form
//! `DDDD:BB:DD.F`. The kernel exposes each function's configuration space and
//! BARs as files under `/sys/bus/pci/devices/<addr>/`; this module reads and
//! writes those files to take a device away from its kernel driver and map
//! its registers into the process.
//!
//! Memory BARs are `mmap`'d for direct register access. I/O-port BARs (the
//! legacy virtio configuration space) cannot be mapped and are accessed with
//! positioned reads and writes on the resource file instead.

use std::fs::{self, File, OpenOptions};
use std::io;
use std::os::unix::fs::FileExt;
use std::os::unix::io::AsRawFd;
use std::ptr;

use log::{debug, info};

use crate::{DriverError, DriverResult};

/// Opens a sysfs resource of the device at `pci_addr`, e.g. `config` or
/// `resource0`.
pub fn pci_open_resource(pci_addr: &str, resource: &str) -> DriverResult<File> {
    let path = format!("/sys/bus/pci/devices/{pci_addr}/{resource}");
    OpenOptions::new()
        .read(true)
        .write(true)
        .open(&path)
        .map_err(|e| DriverError::io(format!("opening {path}"), e))
}

/// Reads an 8-bit value at `offset` from `file`.
pub fn read_io8(file: &File, offset: u64) -> DriverResult<u8> {
    let mut buf = [0; 1];
    file.read_exact_at(&mut buf, offset)
        .map_err(|e| DriverError::io(format!("reading 1 byte at offset {offset:#x}"), e))?;
    Ok(buf[0])
}

/// Reads a little-endian 16-bit value at `offset` from `file`.
pub fn read_io16(file: &File, offset: u64) -> DriverResult<u16> {
    let mut buf = [0; 2];
    file.read_exact_at(&mut buf, offset)
        .map_err(|e| DriverError::io(format!("reading 2 bytes at offset {offset:#x}"), e))?;
    Ok(u16::from_le_bytes(buf))
}

/// Reads a little-endian 32-bit value at `offset` from `file`.
pub fn read_io32(file: &File, offset: u64) -> DriverResult<u32> {
    let mut buf = [0; 4];
    file.read_exact_at(&mut buf, offset)
        .map_err(|e| DriverError::io(format!("reading 4 bytes at offset {offset:#x}"), e))?;
    Ok(u32::from_le_bytes(buf))
}

/// Writes an 8-bit value to `file` at `offset`.
pub fn write_io8(file: &File, offset: u64, value: u8) -> DriverResult {
    file.write_all_at(&[value], offset)
        .map_err(|e| DriverError::io(format!("writing 1 byte at offset {offset:#x}"), e))
}

/// Writes a little-endian 16-bit value to `file` at `offset`.
pub fn write_io16(file: &File, offset: u64, value: u16) -> DriverResult {
    file.write_all_at(&value.to_le_bytes(), offset)
        .map_err(|e| DriverError::io(format!("writing 2 bytes at offset {offset:#x}"), e))
}

/// Writes a little-endian 32-bit value to `file` at `offset`.
pub fn write_io32(file: &File, offset: u64, value: u32) -> DriverResult {
    file.write_all_at(&value.to_le_bytes(), offset)
        .map_err(|e| DriverError::io(format!("writing 4 bytes at offset {offset:#x}"), e))
}

/// Unbinds the kernel driver currently attached to the device, if any.
pub fn unbind_driver(pci_addr: &str) -> DriverResult {
    let path = format!("/sys/bus/pci/devices/{pci_addr}/driver/unbind");
    match fs::write(&path, pci_addr) {
        Ok(()) => {
            debug!("unbound kernel driver from {pci_addr}");
            Ok(())
        }
        // no unbind node means no driver is bound, which is what we want
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(DriverError::io(format!("writing {path}"), e)),
    }
}

/// Enables direct memory access for the device by setting the bus-master bit
/// in the PCI command register.
pub fn enable_dma(pci_addr: &str) -> DriverResult {
    let config_file = pci_open_resource(pci_addr, "config")?;

    let mut dma = read_io16(&config_file, 4)?;
    dma |= 1 << 2;
    write_io16(&config_file, 4, dma)?;

    Ok(())
}

/// Maps the device's BAR0 for register access.
///
/// Unbinds any kernel driver and enables bus-master DMA first, then maps the
/// `resource0` file read/write shared. Returns the mapping and its length.
pub fn pci_map_resource(pci_addr: &str) -> DriverResult<(*mut u8, usize)> {
    info!("mapping BAR0 of {pci_addr}");

    unbind_driver(pci_addr)?;
    enable_dma(pci_addr)?;

    let file = pci_open_resource(pci_addr, "resource0")?;
    let len = file
        .metadata()
        .map_err(|e| DriverError::io(format!("statting resource0 of {pci_addr}"), e))?
        .len() as usize;

    let ptr = unsafe {
        libc::mmap(
            ptr::null_mut(),
            len,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_SHARED,
            file.as_raw_fd(),
            0,
        )
    };
    if ptr == libc::MAP_FAILED || len == 0 {
        return Err(DriverError::io(
            format!("mapping resource0 of {pci_addr}"),
            io::Error::last_os_error(),
        ));
    }

    Ok((ptr as *mut u8, len))
}

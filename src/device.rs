//! Block device interface

use crate::SECTOR_SIZE;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceError {
    ReadError,
    WriteError,
}

/// Host-supplied sector transport.
///
/// `lba` is an absolute sector index on the device; the driver adds the
/// partition offset before calling down here. Both primitives move exactly
/// one 512-byte sector. A failure is surfaced to the driver's caller as
/// `IoError` with no retry.
pub trait BlockDevice {
    fn read_sector(&mut self, lba: u32, buf: &mut [u8; SECTOR_SIZE]) -> Result<(), DeviceError>;

    fn write_sector(&mut self, lba: u32, buf: &[u8; SECTOR_SIZE]) -> Result<(), DeviceError>;
}

//! The storage boundary of the engine.
//!
//! The engine only ever needs two operations from a device: reading and writing bytes at an
//! absolute offset. Everything else (sector size, size of the disk, I/O hints) is described by a
//! [`Topology`] handed to the context when it is opened.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::io::{self, Read, Seek, SeekFrom, Write};

/// Default logical sector size.
pub const DEFAULT_SECTOR_SIZE: u64 = 512;

/// A block device as seen by the partition engine.
///
/// Implementations may target RAM, files, block devices... A failed operation is returned to the
/// caller as is: the engine never retries.
pub trait BlockDevice {
    /// Reads `buf.len()` bytes into `buf` from the absolute `offset`.
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<()>;

    /// Writes `data` at the absolute `offset`.
    fn write_at(&mut self, offset: u64, data: &[u8]) -> io::Result<()>;

    /// Flushes any buffered data (may be a no-op).
    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<T: BlockDevice + ?Sized> BlockDevice for &mut T {
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        (**self).read_at(offset, buf)
    }

    fn write_at(&mut self, offset: u64, data: &[u8]) -> io::Result<()> {
        (**self).write_at(offset, data)
    }

    fn flush(&mut self) -> io::Result<()> {
        (**self).flush()
    }
}

impl<T: BlockDevice + ?Sized> BlockDevice for Box<T> {
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        (**self).read_at(offset, buf)
    }

    fn write_at(&mut self, offset: u64, data: &[u8]) -> io::Result<()> {
        (**self).write_at(offset, data)
    }

    fn flush(&mut self) -> io::Result<()> {
        (**self).flush()
    }
}

#[inline]
fn lba_offset(lba: u64, sector_size: u64) -> io::Result<u64> {
    lba.checked_mul(sector_size)
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "LBA offset overflow"))
}

/// Sector-addressed helpers, so the label drivers never multiply by the sector size themselves.
pub trait BlockDeviceExt: BlockDevice {
    /// Reads `count` sectors starting at `lba`.
    fn read_sectors(&mut self, lba: u64, count: u64, sector_size: u64) -> io::Result<Vec<u8>> {
        let len = count
            .checked_mul(sector_size)
            .and_then(|x| usize::try_from(x).ok())
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "read too large"))?;
        let mut buf = vec![0; len];
        self.read_at(lba_offset(lba, sector_size)?, &mut buf)?;
        Ok(buf)
    }

    /// Writes `data` starting at the beginning of the sector `lba`.
    fn write_sectors(&mut self, lba: u64, sector_size: u64, data: &[u8]) -> io::Result<()> {
        self.write_at(lba_offset(lba, sector_size)?, data)
    }
}

impl<T: BlockDevice + ?Sized> BlockDeviceExt for T {}

/// In-memory device.
///
/// Useful for tests, disk images built in RAM, dry runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemDevice {
    data: Vec<u8>,
}

impl MemDevice {
    /// Creates a zero-filled device of `len` bytes.
    pub fn new(len: usize) -> MemDevice {
        MemDevice { data: vec![0; len] }
    }

    /// Creates a zero-filled device of `sectors` sectors of `sector_size` bytes.
    pub fn with_sectors(sectors: u64, sector_size: u64) -> MemDevice {
        MemDevice::new((sectors * sector_size) as usize)
    }

    /// Wraps an existing image.
    pub fn from_vec(data: Vec<u8>) -> MemDevice {
        MemDevice { data }
    }

    /// Size of the device in bytes.
    pub fn len(&self) -> u64 {
        self.data.len() as u64
    }

    /// Returns `true` if the device holds no byte at all.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// The content of the device.
    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    /// Mutable access to the content of the device.
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Returns the image.
    pub fn into_inner(self) -> Vec<u8> {
        self.data
    }

    fn range(&self, offset: u64, len: usize) -> io::Result<std::ops::Range<usize>> {
        let start = usize::try_from(offset)
            .map_err(|_| io::Error::new(io::ErrorKind::UnexpectedEof, "offset out of bounds"))?;
        let end = start
            .checked_add(len)
            .filter(|&end| end <= self.data.len())
            .ok_or_else(|| io::Error::new(io::ErrorKind::UnexpectedEof, "access out of bounds"))?;
        Ok(start..end)
    }
}

impl BlockDevice for MemDevice {
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        let range = self.range(offset, buf.len())?;
        buf.copy_from_slice(&self.data[range]);
        Ok(())
    }

    fn write_at(&mut self, offset: u64, data: &[u8]) -> io::Result<()> {
        let range = self.range(offset, data.len())?;
        self.data[range].copy_from_slice(data);
        Ok(())
    }
}

/// Adapter over anything that implements `Read + Write + Seek`: files, block devices opened with
/// `std::fs::File`, `std::io::Cursor`...
#[derive(Debug)]
pub struct StdDevice<T> {
    inner: T,
}

impl<T> StdDevice<T>
where
    T: Read + Write + Seek,
{
    /// Wraps `inner`.
    pub fn new(inner: T) -> StdDevice<T> {
        StdDevice { inner }
    }

    /// Size in bytes, found by seeking at the end of the stream.
    pub fn size(&mut self) -> io::Result<u64> {
        self.inner.seek(SeekFrom::End(0))
    }

    /// Builds a topology for this device with the given logical sector size.
    pub fn topology(&mut self, sector_size: u64) -> Result<Topology> {
        let size = self.size()?;
        Topology::from_size(size, sector_size)
    }

    /// Returns the wrapped stream.
    pub fn into_inner(self) -> T {
        self.inner
    }

    /// Access to the wrapped stream.
    pub fn get_ref(&self) -> &T {
        &self.inner
    }
}

impl<T> BlockDevice for StdDevice<T>
where
    T: Read + Write + Seek,
{
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        self.inner.seek(SeekFrom::Start(offset))?;
        self.inner.read_exact(buf)
    }

    fn write_at(&mut self, offset: u64, data: &[u8]) -> io::Result<()> {
        self.inner.seek(SeekFrom::Start(offset))?;
        self.inner.write_all(data)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Physical description of a device: sector sizes, I/O hints and size.
///
/// This is immutable once a context has been opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Topology {
    /// Logical sector size in bytes: the unit of every LBA.
    pub logical_sector_size: u64,
    /// Physical sector size in bytes.
    pub physical_sector_size: u64,
    /// Minimum I/O size in bytes (0 when unknown).
    pub minimum_io_size: u64,
    /// Optimal I/O size in bytes (0 when unknown).
    pub optimal_io_size: u64,
    /// Offset in bytes of the first physically aligned sector.
    pub alignment_offset: u64,
    /// Size of the device in logical sectors.
    pub total_sectors: u64,
}

impl Topology {
    /// Creates a topology where the physical sector size equals the logical one and no I/O hint
    /// is known.
    pub fn new(total_sectors: u64, sector_size: u64) -> Topology {
        Topology {
            logical_sector_size: sector_size,
            physical_sector_size: sector_size,
            minimum_io_size: 0,
            optimal_io_size: 0,
            alignment_offset: 0,
            total_sectors,
        }
    }

    /// Creates a topology from a size in bytes. Trailing bytes that do not fill a sector are
    /// ignored.
    pub fn from_size(bytes: u64, sector_size: u64) -> Result<Topology> {
        if sector_size == 0 {
            return Err(Error::invalid("sector size cannot be zero"));
        }
        let topology = Topology::new(bytes / sector_size, sector_size);
        topology.validate()?;
        Ok(topology)
    }

    /// Sets the physical sector size.
    pub fn with_physical_sector_size(mut self, size: u64) -> Topology {
        self.physical_sector_size = size;
        self
    }

    /// Sets the minimum and optimal I/O sizes.
    pub fn with_io_sizes(mut self, minimum: u64, optimal: u64) -> Topology {
        self.minimum_io_size = minimum;
        self.optimal_io_size = optimal;
        self
    }

    /// Sets the alignment offset.
    pub fn with_alignment_offset(mut self, offset: u64) -> Topology {
        self.alignment_offset = offset;
        self
    }

    /// Size of the device in bytes.
    pub fn size_in_bytes(&self) -> u64 {
        self.total_sectors.saturating_mul(self.logical_sector_size)
    }

    /// Last addressable sector.
    pub fn last_lba(&self) -> u64 {
        self.total_sectors.saturating_sub(1)
    }

    /// Number of logical sectors needed to hold `bytes` bytes.
    pub fn sectors_for(&self, bytes: u64) -> u64 {
        bytes.div_ceil(self.logical_sector_size)
    }

    /// Checks that the topology describes a usable device.
    pub fn validate(&self) -> Result<()> {
        let ss = self.logical_sector_size;
        if ss < 512 || !ss.is_power_of_two() {
            return Err(Error::invalid(format!(
                "logical sector size must be a power of two >= 512 (got {})",
                ss
            )));
        }
        if self.physical_sector_size < ss || self.physical_sector_size % ss != 0 {
            return Err(Error::invalid(format!(
                "physical sector size {} is not a multiple of the logical sector size {}",
                self.physical_sector_size, ss
            )));
        }
        if self.total_sectors == 0 {
            return Err(Error::invalid("device is empty"));
        }
        Ok(())
    }
}

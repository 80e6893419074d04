//! SGI volume headers, big-endian, in the first sector of the disk.

use super::{big_endian, LabelDriver, LabelKind, SectorWrite, WriteStage};
use crate::device::{BlockDevice, BlockDeviceExt, Topology};
use crate::error::{Error, Result};
use crate::geometry::{Extent, Resolver};
use crate::partition::{Partition, PartitionFlags, PartitionHandle, PartitionKind, PartitionType};
use bincode::Options;
use log::debug;
use serde::{Deserialize, Serialize};

/// Magic number of the volume header.
pub const SGI_MAGIC: u32 = 0x0be5_a941;
/// Number of partition slots.
pub const SGI_MAXPARTITIONS: usize = 16;
/// Number of volume directory entries.
pub const SGI_MAXVOLUMES: usize = 15;
/// Type of the partition describing the whole volume.
pub const SGI_TYPE_VOLUME: u32 = 0x06;
const LABEL_LEN: usize = 512;

/// A file of the volume directory (boot loaders, ...)
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct SgiVolume {
    /// File name
    pub name: [u8; 8],
    /// First block
    pub block_num: u32,
    /// Length in bytes
    pub num_bytes: u32,
}

/// A partition of the volume header
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct SgiPartition {
    /// Number of 512-byte blocks
    pub num_blocks: u32,
    /// First block
    pub first_block: u32,
    /// Partition type
    pub part_type: u32,
}

/// The 512-byte SGI volume header
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct SgiDisklabel {
    /// [`SGI_MAGIC`]
    pub magic: u32,
    /// Partition holding the root filesystem
    pub root_part_num: u16,
    /// Partition used for swap
    pub swap_part_num: u16,
    /// Name of the file to boot
    pub boot_file: [u8; 16],
    /// Device parameters, kept as is
    pub devparam: [[u8; 16]; 3],
    /// Volume directory
    pub volume: [SgiVolume; SGI_MAXVOLUMES],
    /// Partition slots
    pub partitions: [SgiPartition; SGI_MAXPARTITIONS],
    /// Makes the 32-bit sum of the header zero
    pub csum: u32,
    /// Padding
    pub padding: u32,
}

impl SgiDisklabel {
    /// The checksum that makes the 32-bit sum of all the words of the header zero.
    pub fn generate_checksum(&self) -> Result<u32> {
        let label = SgiDisklabel {
            csum: 0,
            ..self.clone()
        };
        Ok(sum_words(&big_endian().serialize(&label)?).wrapping_neg())
    }
}

fn sum_words(data: &[u8]) -> u32 {
    data.chunks_exact(4).fold(0u32, |sum, x| {
        sum.wrapping_add(u32::from_be_bytes([x[0], x[1], x[2], x[3]]))
    })
}

/// Returns `true` if the sector starts with the SGI magic.
pub fn has_magic(sector: &[u8]) -> bool {
    sector
        .get(..4)
        .is_some_and(|x| u32::from_be_bytes([x[0], x[1], x[2], x[3]]) == SGI_MAGIC)
}

/// An SGI volume header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SgiLabel {
    /// The volume header
    pub disklabel: SgiDisklabel,
    total_sectors: u64,
}

impl SgiLabel {
    /// Reads the volume header from the first sector.
    pub fn read_from<D>(dev: &mut D, topology: &Topology) -> Result<SgiLabel>
    where
        D: BlockDevice + ?Sized,
    {
        let sector = dev.read_sectors(0, 1, topology.logical_sector_size)?;
        if !has_magic(&sector) {
            return Err(Error::corrupt(LabelKind::Sgi, "missing magic"));
        }
        if sum_words(&sector[..LABEL_LEN]) != 0 {
            return Err(Error::corrupt(LabelKind::Sgi, "bad checksum"));
        }
        let disklabel: SgiDisklabel = big_endian()
            .deserialize(&sector[..LABEL_LEN])
            .map_err(|err| Error::corrupt(LabelKind::Sgi, err.to_string()))?;
        debug!(
            "sgi: root partition {}, swap partition {}",
            disklabel.root_part_num + 1,
            disklabel.swap_part_num + 1
        );

        Ok(SgiLabel {
            disklabel,
            total_sectors: topology.total_sectors,
        })
    }

    fn used(&self) -> impl Iterator<Item = (usize, &SgiPartition)> {
        self.disklabel
            .partitions
            .iter()
            .enumerate()
            .filter(|(_, x)| x.num_blocks > 0)
    }
}

impl LabelDriver for SgiLabel {
    fn kind(&self) -> LabelKind {
        LabelKind::Sgi
    }

    /// The root partition is reported as bootable.
    fn partitions(&self) -> Vec<Partition> {
        self.used()
            .map(|(i, x)| {
                let mut flags = PartitionFlags::empty();
                flags.set(
                    PartitionFlags::BOOTABLE,
                    usize::from(self.disklabel.root_part_num) == i,
                );
                Partition {
                    handle: PartitionHandle(i + 1),
                    start: u64::from(x.first_block),
                    size: u64::from(x.num_blocks),
                    parttype: PartitionType::Sgi(x.part_type),
                    kind: PartitionKind::Primary,
                    flags,
                    name: None,
                    uuid: None,
                }
            })
            .collect()
    }

    fn max_partitions(&self) -> usize {
        SGI_MAXPARTITIONS
    }

    fn usable_range(&self) -> Extent {
        Extent::from_bounds(0, self.total_sectors.saturating_sub(1))
    }

    fn serialize(&self, topology: &Topology) -> Result<Vec<SectorWrite>> {
        let disklabel = SgiDisklabel {
            csum: self.disklabel.generate_checksum()?,
            ..self.disklabel.clone()
        };
        Ok(vec![SectorWrite::at_lba(
            0,
            topology.logical_sector_size,
            big_endian().serialize(&disklabel)?,
            WriteStage::Primary,
        )])
    }

    /// The whole-volume partition is left out of the overlap check.
    fn verify(&self, resolver: &Resolver) -> Result<()> {
        let mut extents = Vec::new();
        for (_, p) in self.used() {
            let extent = Extent::new(u64::from(p.first_block), u64::from(p.num_blocks));
            resolver.check_bounds(&extent)?;
            if p.part_type != SGI_TYPE_VOLUME {
                extents.push(extent);
            }
        }
        Resolver::check_overlaps(&extents)
    }
}

//! BSD disklabels, found in the second sector of the disk.

use super::{LabelDriver, LabelKind, SectorWrite, WriteStage};
use crate::device::{BlockDevice, BlockDeviceExt, Topology};
use crate::error::{Error, Result};
use crate::geometry::{Extent, Resolver};
use crate::partition::{Partition, PartitionFlags, PartitionHandle, PartitionKind, PartitionType};
use log::debug;
use serde::{Deserialize, Serialize};

/// `d_magic` and `d_magic2`.
pub const BSD_MAGIC: u32 = 0x8256_4557;
/// Number of partition slots.
pub const BSD_MAXPARTITIONS: usize = 16;
/// The partition covering the whole disk (`c`).
const RAW_PART: usize = 2;
const LABEL_SECTOR: u64 = 1;
// the label is at the start of its sector on i386, 64 bytes in on other platforms
const LABEL_OFFSETS: [usize; 2] = [0, 64];
const HEADER_LEN: usize = 148;
const PARTITION_LEN: usize = 16;
const MAGIC2_OFFSET: usize = 132;

/// A partition of a BSD disklabel
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct BsdPartition {
    /// Number of sectors
    pub size: u32,
    /// First sector, absolute
    pub offset: u32,
    /// Filesystem basic fragment size
    pub fsize: u32,
    /// Filesystem type
    pub fstype: u8,
    /// Fragments per block
    pub frag: u8,
    /// Cylinders per group
    pub cpg: u16,
}

/// The `struct disklabel` of the BSDs
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct BsdDisklabel {
    /// Magic number
    pub magic: u32,
    /// Drive type
    pub drive_type: u16,
    /// Controller specific type
    pub subtype: u16,
    /// Type name
    pub typename: [u8; 16],
    /// Pack identifier
    pub packname: [u8; 16],
    /// Bytes per sector
    pub secsize: u32,
    /// Sectors per track
    pub nsectors: u32,
    /// Tracks per cylinder
    pub ntracks: u32,
    /// Cylinders per unit
    pub ncylinders: u32,
    /// Sectors per cylinder
    pub secpercyl: u32,
    /// Sectors per unit
    pub secperunit: u32,
    /// Spare sectors per track
    pub sparespertrack: u16,
    /// Spare sectors per cylinder
    pub sparespercyl: u16,
    /// Alternate cylinders
    pub acylinders: u32,
    /// Rotational speed
    pub rpm: u16,
    /// Hardware sector interleave
    pub interleave: u16,
    /// Sector 0 skew, per track
    pub trackskew: u16,
    /// Sector 0 skew, per cylinder
    pub cylskew: u16,
    /// Head switch time
    pub headswitch: u32,
    /// Track-to-track seek
    pub trkseek: u32,
    /// Generic flags
    pub flags: u32,
    /// Drive-type specific information
    pub drivedata: [u32; 5],
    /// Reserved
    pub spare: [u32; 5],
    /// Magic number, again
    pub magic2: u32,
    /// XOR of the label words
    pub checksum: u16,
    /// Number of partitions in use
    pub npartitions: u16,
    /// Size of the boot area
    pub bbsize: u32,
    /// Maximum size of the filesystem superblock
    pub sbsize: u32,
    /// Partition slots
    pub partitions: [BsdPartition; BSD_MAXPARTITIONS],
}

impl BsdDisklabel {
    // bytes covered by the checksum
    fn len(&self) -> usize {
        HEADER_LEN + PARTITION_LEN * usize::from(self.npartitions)
    }

    /// XOR of the 16-bit words of the label, computed with the checksum field zeroed.
    pub fn generate_checksum(&self) -> Result<u16> {
        let label = BsdDisklabel {
            checksum: 0,
            ..self.clone()
        };
        let data = bincode::serialize(&label)?;
        Ok(data[..self.len().min(data.len())]
            .chunks_exact(2)
            .fold(0, |sum, x| sum ^ u16::from_le_bytes([x[0], x[1]])))
    }
}

/// Offset of a disklabel in `sector`, if there is one.
pub fn find_label(sector: &[u8]) -> Option<usize> {
    let word = |at: usize| {
        sector
            .get(at..at + 4)
            .map(|x| u32::from_le_bytes([x[0], x[1], x[2], x[3]]))
    };
    LABEL_OFFSETS.into_iter().find(|&offset| {
        word(offset) == Some(BSD_MAGIC) && word(offset + MAGIC2_OFFSET) == Some(BSD_MAGIC)
    })
}

/// A BSD disklabel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BsdLabel {
    /// The disklabel
    pub disklabel: BsdDisklabel,
    sector: Vec<u8>,
    offset: usize,
    total_sectors: u64,
}

impl BsdLabel {
    /// Reads the disklabel from the second sector.
    pub fn read_from<D>(dev: &mut D, topology: &Topology) -> Result<BsdLabel>
    where
        D: BlockDevice + ?Sized,
    {
        let sector = dev.read_sectors(LABEL_SECTOR, 1, topology.logical_sector_size)?;
        let offset = find_label(&sector)
            .ok_or_else(|| Error::corrupt(LabelKind::Bsd, "missing disklabel magic"))?;
        let disklabel: BsdDisklabel = bincode::deserialize(&sector[offset..])
            .map_err(|err| Error::corrupt(LabelKind::Bsd, err.to_string()))?;

        if usize::from(disklabel.npartitions) > BSD_MAXPARTITIONS {
            return Err(Error::corrupt(
                LabelKind::Bsd,
                format!("too many partitions ({})", disklabel.npartitions),
            ));
        }
        let sum = disklabel.generate_checksum()?;
        if sum != disklabel.checksum {
            return Err(Error::corrupt(
                LabelKind::Bsd,
                format!(
                    "invalid checksum (expected {:#06x}, found {:#06x})",
                    sum, disklabel.checksum
                ),
            ));
        }
        debug!(
            "bsd: label at offset {}, {} partition slot(s)",
            offset, disklabel.npartitions
        );

        Ok(BsdLabel {
            disklabel,
            sector,
            offset,
            total_sectors: topology.total_sectors,
        })
    }

    fn used(&self) -> impl Iterator<Item = (usize, &BsdPartition)> {
        self.disklabel
            .partitions
            .iter()
            .take(usize::from(self.disklabel.npartitions))
            .enumerate()
            .filter(|(_, x)| x.size > 0)
    }
}

impl LabelDriver for BsdLabel {
    fn kind(&self) -> LabelKind {
        LabelKind::Bsd
    }

    fn partitions(&self) -> Vec<Partition> {
        self.used()
            .map(|(i, x)| Partition {
                handle: PartitionHandle(i + 1),
                start: u64::from(x.offset),
                size: u64::from(x.size),
                parttype: PartitionType::Bsd(x.fstype),
                kind: PartitionKind::Primary,
                flags: PartitionFlags::empty(),
                name: None,
                uuid: None,
            })
            .collect()
    }

    fn max_partitions(&self) -> usize {
        BSD_MAXPARTITIONS
    }

    fn usable_range(&self) -> Extent {
        Extent::from_bounds(0, self.total_sectors.saturating_sub(1))
    }

    fn serialize(&self, topology: &Topology) -> Result<Vec<SectorWrite>> {
        let disklabel = BsdDisklabel {
            checksum: self.disklabel.generate_checksum()?,
            ..self.disklabel.clone()
        };
        let data = bincode::serialize(&disklabel)?;
        let mut sector = self.sector.clone();
        sector[self.offset..self.offset + data.len()].copy_from_slice(&data);
        Ok(vec![SectorWrite::at_lba(
            LABEL_SECTOR,
            topology.logical_sector_size,
            sector,
            WriteStage::Primary,
        )])
    }

    /// The raw partition (`c`) covers the whole disk and is left out of the overlap check.
    fn verify(&self, resolver: &Resolver) -> Result<()> {
        let mut extents = Vec::new();
        for (i, p) in self.used() {
            let extent = Extent::new(u64::from(p.offset), u64::from(p.size));
            resolver.check_bounds(&extent)?;
            if i != RAW_PART {
                extents.push(extent);
            }
        }
        Resolver::check_overlaps(&extents)
    }
}

//! SUN disk labels (VTOC), big-endian, in the first sector of the disk.

use super::{big_endian, LabelDriver, LabelKind, SectorWrite, WriteStage};
use crate::device::{BlockDevice, BlockDeviceExt, Topology};
use crate::error::{Error, Result};
use crate::geometry::{Extent, Resolver};
use crate::partition::{Partition, PartitionFlags, PartitionHandle, PartitionKind, PartitionType};
use bincode::Options;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use serde_big_array::BigArray;

/// Magic number at offset 508.
pub const SUN_MAGIC: u16 = 0xdabe;
/// `vtoc.sanity` of a valid VTOC.
pub const SUN_VTOC_SANITY: u32 = 0x600d_deee;
/// Number of partition slots.
pub const SUN_MAXPARTITIONS: usize = 8;
/// Tag of the partition describing the whole disk.
pub const SUN_TAG_WHOLEDISK: u16 = 0x05;
const MAGIC_OFFSET: usize = 508;
const LABEL_LEN: usize = 512;

/// Tag and flags of a partition, kept in the VTOC
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct SunInfo {
    /// Partition tag
    pub id: u16,
    /// Partition flags
    pub flags: u16,
}

/// Position of a partition
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct SunPartition {
    /// First cylinder
    pub start_cylinder: u32,
    /// Number of sectors
    pub num_sectors: u32,
}

/// The 512-byte SUN label
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct SunDisklabel {
    /// Informative ASCII text
    #[serde(with = "BigArray")]
    pub info: [u8; 128],
    /// VTOC version
    pub version: u32,
    /// Volume name
    pub volume: [u8; 8],
    /// Number of partitions described by the VTOC
    pub nparts: u16,
    /// Tags and flags
    pub infos: [SunInfo; SUN_MAXPARTITIONS],
    /// Padding
    pub padding: u16,
    /// Boot information
    pub bootinfo: [u32; 3],
    /// [`SUN_VTOC_SANITY`] when the VTOC is valid
    pub sanity: u32,
    /// Reserved
    pub reserved: [u32; 10],
    /// Partition timestamps
    pub timestamp: [u32; 8],
    /// Sectors to skip on writes
    pub write_reinstruct: u32,
    /// Sectors to skip on reads
    pub read_reinstruct: u32,
    /// Reserved
    #[serde(with = "BigArray")]
    pub spare: [u8; 148],
    /// Rotational speed
    pub rpm: u16,
    /// Physical cylinders
    pub pcyl: u16,
    /// Alternate sectors per cylinder
    pub apc: u16,
    /// Reserved
    pub spare2: [u16; 2],
    /// Interleave factor
    pub intrlv: u16,
    /// Data cylinders
    pub ncyl: u16,
    /// Alternate cylinders
    pub acyl: u16,
    /// Tracks per cylinder
    pub nhead: u16,
    /// Sectors per track
    pub nsect: u16,
    /// Reserved
    pub spare3: [u16; 2],
    /// Partition slots
    pub partitions: [SunPartition; SUN_MAXPARTITIONS],
    /// [`SUN_MAGIC`]
    pub magic: u16,
    /// XOR of all the other 16-bit words
    pub csum: u16,
}

impl SunDisklabel {
    /// The checksum that makes the XOR of all the words of the label zero.
    pub fn generate_checksum(&self) -> Result<u16> {
        let label = SunDisklabel {
            csum: 0,
            ..self.clone()
        };
        Ok(xor_words(&big_endian().serialize(&label)?))
    }

    fn cylinder_size(&self) -> u64 {
        u64::from(self.nhead) * u64::from(self.nsect)
    }

    fn has_vtoc(&self) -> bool {
        self.sanity == SUN_VTOC_SANITY
    }
}

fn xor_words(data: &[u8]) -> u16 {
    data.chunks_exact(2)
        .fold(0, |sum, x| sum ^ u16::from_be_bytes([x[0], x[1]]))
}

/// Returns `true` if the sector carries the SUN magic.
pub fn has_magic(sector: &[u8]) -> bool {
    sector
        .get(MAGIC_OFFSET..MAGIC_OFFSET + 2)
        .is_some_and(|x| u16::from_be_bytes([x[0], x[1]]) == SUN_MAGIC)
}

/// Returns `true` if the XOR of the 16-bit words of the label is zero.
pub fn checksum_ok(sector: &[u8]) -> bool {
    sector.len() >= LABEL_LEN && xor_words(&sector[..LABEL_LEN]) == 0
}

/// A SUN disk label.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SunLabel {
    /// The label
    pub disklabel: SunDisklabel,
    total_sectors: u64,
}

impl SunLabel {
    /// Reads the label from the first sector.
    pub fn read_from<D>(dev: &mut D, topology: &Topology) -> Result<SunLabel>
    where
        D: BlockDevice + ?Sized,
    {
        let sector = dev.read_sectors(0, 1, topology.logical_sector_size)?;
        if !has_magic(&sector) {
            return Err(Error::corrupt(LabelKind::Sun, "missing magic"));
        }
        if !checksum_ok(&sector) {
            return Err(Error::corrupt(LabelKind::Sun, "bad checksum"));
        }
        let disklabel: SunDisklabel = big_endian()
            .deserialize(&sector[..LABEL_LEN])
            .map_err(|err| Error::corrupt(LabelKind::Sun, err.to_string()))?;
        if disklabel.nhead == 0 || disklabel.nsect == 0 {
            return Err(Error::corrupt(
                LabelKind::Sun,
                "the geometry has no head or no sector",
            ));
        }
        if !disklabel.has_vtoc() {
            warn!("sun: no valid VTOC, partition tags are unknown");
        }
        debug!(
            "sun: {} cylinders, {} heads, {} sectors",
            disklabel.ncyl, disklabel.nhead, disklabel.nsect
        );

        Ok(SunLabel {
            disklabel,
            total_sectors: topology.total_sectors,
        })
    }

    fn used(&self) -> impl Iterator<Item = (usize, Extent, u16)> + '_ {
        let cylinder = self.disklabel.cylinder_size();
        self.disklabel
            .partitions
            .iter()
            .enumerate()
            .filter(|(_, x)| x.num_sectors > 0)
            .map(move |(i, x)| {
                let start = u64::from(x.start_cylinder) * cylinder;
                let tag = if self.disklabel.has_vtoc() {
                    self.disklabel.infos[i].id
                } else {
                    0
                };
                (i, Extent::new(start, u64::from(x.num_sectors)), tag)
            })
    }
}

impl LabelDriver for SunLabel {
    fn kind(&self) -> LabelKind {
        LabelKind::Sun
    }

    fn partitions(&self) -> Vec<Partition> {
        self.used()
            .map(|(i, extent, tag)| Partition {
                handle: PartitionHandle(i + 1),
                start: extent.start,
                size: extent.size,
                parttype: PartitionType::Sun(tag),
                kind: PartitionKind::Primary,
                flags: PartitionFlags::empty(),
                name: None,
                uuid: None,
            })
            .collect()
    }

    fn max_partitions(&self) -> usize {
        SUN_MAXPARTITIONS
    }

    fn usable_range(&self) -> Extent {
        let label_end = u64::from(self.disklabel.ncyl) * self.disklabel.cylinder_size();
        let last = self.total_sectors.min(label_end).saturating_sub(1);
        Extent::from_bounds(0, last)
    }

    fn serialize(&self, topology: &Topology) -> Result<Vec<SectorWrite>> {
        let disklabel = SunDisklabel {
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

    /// The whole-disk partition is left out of the overlap check.
    fn verify(&self, resolver: &Resolver) -> Result<()> {
        let mut extents = Vec::new();
        for (_, extent, tag) in self.used() {
            resolver.check_bounds(&extent)?;
            if tag != SUN_TAG_WHOLEDISK {
                extents.push(extent);
            }
        }
        Resolver::check_overlaps(&extents)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::device::MemDevice;

    // 20 cylinders of 4 heads and 16 sectors
    fn disklabel() -> SunDisklabel {
        let mut infos = [SunInfo::default(); SUN_MAXPARTITIONS];
        let mut partitions = [SunPartition::default(); SUN_MAXPARTITIONS];
        infos[0].id = 0x02;
        partitions[0] = SunPartition {
            start_cylinder: 0,
            num_sectors: 640,
        };
        infos[1].id = 0x03;
        partitions[1] = SunPartition {
            start_cylinder: 10,
            num_sectors: 320,
        };
        infos[2].id = SUN_TAG_WHOLEDISK;
        partitions[2] = SunPartition {
            start_cylinder: 0,
            num_sectors: 1280,
        };
        SunDisklabel {
            info: [0; 128],
            version: 1,
            volume: [0; 8],
            nparts: SUN_MAXPARTITIONS as u16,
            infos,
            padding: 0,
            bootinfo: [0; 3],
            sanity: SUN_VTOC_SANITY,
            reserved: [0; 10],
            timestamp: [0; 8],
            write_reinstruct: 0,
            read_reinstruct: 0,
            spare: [0; 148],
            rpm: 5400,
            pcyl: 22,
            apc: 0,
            spare2: [0; 2],
            intrlv: 1,
            ncyl: 20,
            acyl: 2,
            nhead: 4,
            nsect: 16,
            spare3: [0; 2],
            partitions,
            magic: SUN_MAGIC,
            csum: 0,
        }
    }

    fn device(label: &SunDisklabel) -> MemDevice {
        let label = SunDisklabel {
            csum: label.generate_checksum().unwrap(),
            ..label.clone()
        };
        let mut dev = MemDevice::with_sectors(1408, 512);
        dev.write_at(0, &big_endian().serialize(&label).unwrap())
            .unwrap();
        dev
    }

    #[test]
    fn layout() {
        let data = big_endian().serialize(&disklabel()).unwrap();
        assert_eq!(data.len(), LABEL_LEN);
        assert!(has_magic(&data));
        assert_eq!(&data[436..440], &[0, 4, 0, 16]);
    }

    #[test]
    fn read_list_and_write_back() {
        let topology = Topology::new(1408, 512);
        let mut dev = device(&disklabel());
        let raw = dev.as_slice()[..512].to_vec();
        assert!(checksum_ok(&raw));

        let label = SunLabel::read_from(&mut dev, &topology).unwrap();
        assert_eq!(label.usable_range(), Extent::from_bounds(0, 1279));
        let parts = label.partitions();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[1].start, 640);
        assert_eq!(parts[1].parttype, PartitionType::Sun(0x03));
        assert_eq!(parts[1].parttype.name(), Some("SunOS swap"));

        let resolver = Resolver::new(&topology, &Config::default())
            .unwrap()
            .with_bounds(0, 1279);
        assert!(label.verify(&resolver).is_ok());
        assert_eq!(label.serialize(&topology).unwrap()[0].data, raw);
    }

    #[test]
    fn corrupt_labels() {
        let topology = Topology::new(1408, 512);
        let mut dev = device(&disklabel());
        dev.as_mut_slice()[200] ^= 0x01;
        assert!(!checksum_ok(dev.as_slice()));
        assert!(SunLabel::read_from(&mut dev, &topology)
            .unwrap_err()
            .is_corruption());

        let mut overlapping = disklabel();
        overlapping.partitions[1].start_cylinder = 9;
        let mut dev = device(&overlapping);
        let label = SunLabel::read_from(&mut dev, &topology).unwrap();
        let resolver = Resolver::new(&topology, &Config::default()).unwrap();
        assert!(matches!(
            label.verify(&resolver),
            Err(Error::Overlap { .. })
        ));
    }
}

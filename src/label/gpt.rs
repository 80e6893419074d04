//! GUID partition tables.
//!
//! A GPT disk carries a protective MBR, a primary header and entry array at the start of the
//! disk, and a backup array and header at its end. Either copy is enough to recover the label.

use super::dos::{MBRHeader, MBRPartitionEntry};
use super::{LabelDriver, LabelKind, SectorWrite, WriteStage};
use crate::chs::CHS;
use crate::device::{BlockDevice, BlockDeviceExt, Topology};
use crate::error::{Error, Result};
use crate::geometry::{Extent, Resolver};
use crate::partition::{
    Partition, PartitionFlags, PartitionHandle, PartitionKind, PartitionSpec, PartitionType,
};
use crate::parttype::{self, DOS_GPT_PROTECTIVE};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use serde_big_array::BigArray;
use std::collections::HashSet;
use uuid::Uuid;

const SIGNATURE: [u8; 8] = *b"EFI PART";
const REVISION: [u8; 4] = [0x00, 0x00, 0x01, 0x00];
const HEADER_SIZE: u32 = 92;
const ENTRY_SIZE: u32 = 128;
const NAME_UNITS: usize = 36;
/// Largest entry array accepted, in bytes (8192 entries of 128 bytes).
pub const MAX_ARRAY_BYTES: u64 = 1 << 20;

/// Legacy BIOS bootable attribute.
pub const ATTR_LEGACY_BOOTABLE: u64 = 1 << 2;
/// Hidden attribute (basic data partitions).
pub const ATTR_HIDDEN: u64 = 1 << 62;

/// A GPT header
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
pub struct GPTHeader {
    /// `EFI PART`
    pub signature: [u8; 8],
    /// Revision 1.0
    pub revision: [u8; 4],
    /// Size of the header in bytes
    pub header_size: u32,
    /// CRC32 of the header, computed with this field set to 0
    pub crc32_checksum: u32,
    /// Reserved, zero
    pub reserved: [u8; 4],
    /// Sector of this header
    pub primary_lba: u64,
    /// Sector of the other header
    pub backup_lba: u64,
    /// First sector usable by partitions
    pub first_usable_lba: u64,
    /// Last sector usable by partitions
    pub last_usable_lba: u64,
    /// Disk GUID, mixed-endian
    pub disk_guid: [u8; 16],
    /// First sector of the entry array described by this header
    pub partition_entry_lba: u64,
    /// Number of entries in the array
    pub number_of_partition_entries: u32,
    /// Size of one entry in bytes
    pub size_of_partition_entry: u32,
    /// CRC32 of the whole entry array
    pub partition_entry_array_crc32: u32,
}

impl GPTHeader {
    /// CRC32 of the header with its checksum field zeroed.
    pub fn generate_crc32_checksum(&self) -> Result<u32> {
        let header = GPTHeader {
            crc32_checksum: 0,
            ..*self
        };
        Ok(crc32fast::hash(&bincode::serialize(&header)?))
    }

    /// Size of the entry array in bytes.
    pub fn array_bytes(&self) -> u64 {
        u64::from(self.number_of_partition_entries) * u64::from(self.size_of_partition_entry)
    }

    /// Number of sectors taken by the entry array.
    pub fn array_sectors(&self, sector_size: u64) -> u64 {
        self.array_bytes().div_ceil(sector_size)
    }

    // the header of the other copy
    fn mirrored(&self, array_lba: u64) -> GPTHeader {
        GPTHeader {
            primary_lba: self.backup_lba,
            backup_lba: self.primary_lba,
            partition_entry_lba: array_lba,
            ..*self
        }
    }

    // sanity checks that do not need the entries
    fn check(&self, lba: u64, total_sectors: u64) -> std::result::Result<(), String> {
        if self.signature != SIGNATURE {
            return Err("invalid signature".to_string());
        }
        if self.revision != REVISION {
            return Err(format!("unsupported revision {:02x?}", self.revision));
        }
        if self.header_size != HEADER_SIZE {
            return Err(format!("unsupported header size {}", self.header_size));
        }
        let sum = self
            .generate_crc32_checksum()
            .map_err(|err| err.to_string())?;
        if self.crc32_checksum != sum {
            return Err(format!(
                "invalid header checksum (expected {:#010x}, found {:#010x})",
                sum, self.crc32_checksum
            ));
        }
        if self.primary_lba != lba {
            return Err(format!(
                "header at sector {} claims to be at sector {}",
                lba, self.primary_lba
            ));
        }
        if self.size_of_partition_entry < ENTRY_SIZE
            || self.size_of_partition_entry % ENTRY_SIZE != 0
            || self.number_of_partition_entries == 0
        {
            return Err(format!(
                "invalid entry array ({} entries of {} bytes)",
                self.number_of_partition_entries, self.size_of_partition_entry
            ));
        }
        if self.array_bytes() > MAX_ARRAY_BYTES {
            return Err(format!(
                "entry array of {} bytes is larger than {} bytes",
                self.array_bytes(),
                MAX_ARRAY_BYTES
            ));
        }
        if self.first_usable_lba > self.last_usable_lba.saturating_add(1)
            || self.last_usable_lba >= total_sectors
        {
            return Err(format!(
                "invalid usable range {}..={}",
                self.first_usable_lba, self.last_usable_lba
            ));
        }
        Ok(())
    }
}

/// A GPT partition entry
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct GPTPartitionEntry {
    /// Partition type GUID, mixed-endian (all zero for an unused entry)
    pub partition_type_guid: [u8; 16],
    /// Unique partition GUID, mixed-endian
    pub unique_partition_guid: [u8; 16],
    /// First sector
    pub starting_lba: u64,
    /// Last sector (inclusive)
    pub ending_lba: u64,
    /// Attribute bits
    pub attribute_bits: u64,
    /// Name, UTF-16LE, padded with zeros
    #[serde(with = "BigArray")]
    pub partition_name: [u16; NAME_UNITS],
    /// Bytes of the entry beyond the first 128
    #[serde(skip)]
    pub extra: Vec<u8>,
}

impl GPTPartitionEntry {
    /// Creates an empty partition entry
    pub fn empty() -> GPTPartitionEntry {
        GPTPartitionEntry {
            partition_type_guid: [0; 16],
            unique_partition_guid: [0; 16],
            starting_lba: 0,
            ending_lba: 0,
            attribute_bits: 0,
            partition_name: [0; NAME_UNITS],
            extra: Vec::new(),
        }
    }

    /// Returns `true` if the partition entry is not used (type GUID == 0)
    pub fn is_unused(&self) -> bool {
        self.partition_type_guid == [0; 16]
    }

    /// Returns `true` if the partition entry is used (type GUID != 0)
    pub fn is_used(&self) -> bool {
        !self.is_unused()
    }

    /// The sectors of the partition.
    pub fn extent(&self) -> Extent {
        Extent::from_bounds(self.starting_lba, self.ending_lba)
    }

    /// The partition type.
    pub fn type_guid(&self) -> Uuid {
        Uuid::from_bytes_le(self.partition_type_guid)
    }

    /// The unique partition GUID.
    pub fn unique_guid(&self) -> Uuid {
        Uuid::from_bytes_le(self.unique_partition_guid)
    }

    /// The partition name, up to the first NUL.
    pub fn name(&self) -> String {
        let len = self
            .partition_name
            .iter()
            .position(|&x| x == 0)
            .unwrap_or(NAME_UNITS);
        String::from_utf16_lossy(&self.partition_name[..len])
    }

    /// Replaces the partition name.
    pub fn set_name(&mut self, name: &str) -> Result<()> {
        let units: Vec<u16> = name.encode_utf16().collect();
        if units.len() > NAME_UNITS {
            return Err(Error::invalid(format!(
                "partition name longer than {} UTF-16 units",
                NAME_UNITS
            )));
        }
        self.partition_name = [0; NAME_UNITS];
        self.partition_name[..units.len()].copy_from_slice(&units);
        Ok(())
    }

    fn flags(&self) -> PartitionFlags {
        let mut flags = PartitionFlags::empty();
        flags.set(
            PartitionFlags::BOOTABLE,
            self.attribute_bits & ATTR_LEGACY_BOOTABLE != 0,
        );
        flags.set(PartitionFlags::HIDDEN, self.attribute_bits & ATTR_HIDDEN != 0);
        flags
    }

    fn apply_flags(&mut self, flags: PartitionFlags) {
        self.attribute_bits &= !(ATTR_LEGACY_BOOTABLE | ATTR_HIDDEN);
        if flags.contains(PartitionFlags::BOOTABLE) {
            self.attribute_bits |= ATTR_LEGACY_BOOTABLE;
        }
        if flags.contains(PartitionFlags::HIDDEN) {
            self.attribute_bits |= ATTR_HIDDEN;
        }
    }

    // zeroes the entry, keeping the bytes beyond the standard layout
    fn clear(&mut self) {
        let extra = std::mem::take(&mut self.extra);
        *self = GPTPartitionEntry {
            extra,
            ..GPTPartitionEntry::empty()
        };
    }
}

fn type_guid(parttype: PartitionType) -> Result<Uuid> {
    match parttype {
        PartitionType::Gpt(guid) if guid.is_nil() => {
            Err(Error::invalid("the nil GUID marks unused entries"))
        }
        PartitionType::Gpt(guid) => Ok(guid),
        PartitionType::Dos(code) => parttype::gpt_from_dos(code).ok_or_else(|| {
            Error::invalid(format!("DOS type {:#04x} has no GPT equivalent", code))
        }),
        _ => Err(Error::invalid("not a GPT partition type")),
    }
}

/// One copy of the label, as found on disk.
struct GptCopy {
    header: GPTHeader,
    partitions: Vec<GPTPartitionEntry>,
}

fn read_copy<D>(dev: &mut D, lba: u64, topology: &Topology) -> Result<GptCopy>
where
    D: BlockDevice + ?Sized,
{
    let ss = topology.logical_sector_size;
    let corrupt = |reason: String| Error::corrupt(LabelKind::Gpt, reason);

    let sector = dev.read_sectors(lba, 1, ss)?;
    let header: GPTHeader = bincode::deserialize(&sector).map_err(|err| corrupt(err.to_string()))?;
    header.check(lba, topology.total_sectors).map_err(corrupt)?;

    let array_sectors = header.array_sectors(ss);
    if header
        .partition_entry_lba
        .checked_add(array_sectors)
        .map_or(true, |end| end > topology.total_sectors)
    {
        return Err(corrupt(format!(
            "entry array at sector {} is beyond the end of the device",
            header.partition_entry_lba
        )));
    }
    let mut array = dev.read_sectors(header.partition_entry_lba, array_sectors, ss)?;
    array.truncate(header.array_bytes() as usize);

    let sum = crc32fast::hash(&array);
    if header.partition_entry_array_crc32 != sum {
        return Err(corrupt(format!(
            "invalid entry array checksum (expected {:#010x}, found {:#010x})",
            sum, header.partition_entry_array_crc32
        )));
    }

    let partitions = array
        .chunks(header.size_of_partition_entry as usize)
        .map(|chunk| -> Result<GPTPartitionEntry> {
            let mut entry: GPTPartitionEntry =
                bincode::deserialize(chunk).map_err(|err| corrupt(err.to_string()))?;
            entry.extra = chunk[ENTRY_SIZE as usize..].to_vec();
            Ok(entry)
        })
        .collect::<Result<Vec<_>>>()?;

    Ok(GptCopy { header, partitions })
}

// the reason of a corrupted label, other errors are passed through
fn corruption_reason(err: Error) -> Result<String> {
    match err {
        Error::CorruptLabel { reason, .. } => Ok(reason),
        err => Err(err),
    }
}

/// A GUID partition table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GptLabel {
    /// The primary header
    pub header: GPTHeader,
    /// All the entries of the array, used or not
    pub partitions: Vec<GPTPartitionEntry>,
    /// The first 512 bytes of the disk
    pub protective_mbr: Vec<u8>,
    total_sectors: u64,
    sector_size: u64,
    repaired: bool,
}

impl GptLabel {
    /// Creates an empty table with `entries` entries and a random disk GUID.
    pub fn new(topology: &Topology, entries: u32) -> Result<GptLabel> {
        topology.validate()?;
        if entries == 0 {
            return Err(Error::invalid("a GPT needs at least one entry"));
        }
        if u64::from(entries) * u64::from(ENTRY_SIZE) > MAX_ARRAY_BYTES {
            return Err(Error::invalid(format!("too many GPT entries: {}", entries)));
        }
        let ss = topology.logical_sector_size;
        let last = topology.last_lba();
        let array_sectors = (u64::from(entries) * u64::from(ENTRY_SIZE)).div_ceil(ss);
        let first_usable = 2 + array_sectors;
        let last_usable = last
            .checked_sub(1 + array_sectors)
            .filter(|&x| x >= first_usable)
            .ok_or_else(|| Error::invalid("the device is too small for a GPT"))?;

        let header = GPTHeader {
            signature: SIGNATURE,
            revision: REVISION,
            header_size: HEADER_SIZE,
            crc32_checksum: 0,
            reserved: [0; 4],
            primary_lba: 1,
            backup_lba: last,
            first_usable_lba: first_usable,
            last_usable_lba: last_usable,
            disk_guid: Uuid::new_v4().to_bytes_le(),
            partition_entry_lba: 2,
            number_of_partition_entries: entries,
            size_of_partition_entry: ENTRY_SIZE,
            partition_entry_array_crc32: 0,
        };

        let mut pmbr = MBRHeader::new([0; 4]);
        pmbr.partitions[0] = MBRPartitionEntry {
            boot: false,
            first_chs: CHS::new(0, 0, 2),
            sys: DOS_GPT_PROTECTIVE,
            last_chs: CHS::max(),
            starting_lba: 1,
            sectors: u32::try_from(last).unwrap_or(u32::MAX),
        };

        Ok(GptLabel {
            header,
            partitions: vec![GPTPartitionEntry::empty(); entries as usize],
            protective_mbr: bincode::serialize(&pmbr)?,
            total_sectors: topology.total_sectors,
            sector_size: ss,
            repaired: false,
        })
    }

    /// Reads the label from the primary copy, or from the backup when the primary is damaged.
    pub fn read_from<D>(dev: &mut D, topology: &Topology) -> Result<GptLabel>
    where
        D: BlockDevice + ?Sized,
    {
        let ss = topology.logical_sector_size;
        let last = topology.last_lba();
        let mut protective_mbr = dev.read_sectors(0, 1, ss)?;
        protective_mbr.truncate(512);

        let (copy, repaired) = match read_copy(dev, 1, topology) {
            Ok(primary) => {
                let backup_lba = primary.header.backup_lba;
                let backup_ok = backup_lba < topology.total_sectors
                    && match read_copy(dev, backup_lba, topology) {
                        Ok(_) => true,
                        Err(err) => {
                            warn!("gpt: backup header: {}", corruption_reason(err)?);
                            false
                        }
                    };
                if backup_lba != last {
                    warn!(
                        "gpt: backup header at sector {} instead of the last sector {}",
                        backup_lba, last
                    );
                }
                (primary, !backup_ok || backup_lba != last)
            }
            Err(err) => {
                let primary_reason = corruption_reason(err)?;
                // the damaged primary may still tell where its backup is
                let hint = dev
                    .read_sectors(1, 1, ss)
                    .ok()
                    .and_then(|x| bincode::deserialize::<GPTHeader>(&x).ok())
                    .filter(|x| x.signature == SIGNATURE)
                    .map(|x| x.backup_lba)
                    .filter(|&x| x > 1 && x < last);
                let mut backup_reason = String::new();
                let mut found = None;
                for lba in hint.into_iter().chain(Some(last)) {
                    match read_copy(dev, lba, topology) {
                        Ok(copy) => {
                            found = Some(copy);
                            break;
                        }
                        Err(err) => backup_reason = corruption_reason(err)?,
                    }
                }
                let backup = found.ok_or_else(|| {
                    Error::corrupt(
                        LabelKind::Gpt,
                        format!(
                            "primary header: {}; backup header: {}",
                            primary_reason, backup_reason
                        ),
                    )
                })?;
                warn!(
                    "gpt: primary header: {}; using the backup at sector {}",
                    primary_reason, backup.header.primary_lba
                );
                let header = GPTHeader {
                    primary_lba: 1,
                    backup_lba: last,
                    partition_entry_lba: 2,
                    ..backup.header
                };
                (
                    GptCopy {
                        header,
                        partitions: backup.partitions,
                    },
                    true,
                )
            }
        };

        debug!(
            "gpt: disk {}, {} entries, usable {}..={}",
            Uuid::from_bytes_le(copy.header.disk_guid),
            copy.header.number_of_partition_entries,
            copy.header.first_usable_lba,
            copy.header.last_usable_lba
        );

        Ok(GptLabel {
            header: copy.header,
            partitions: copy.partitions,
            protective_mbr,
            total_sectors: topology.total_sectors,
            sector_size: ss,
            repaired,
        })
    }

    fn index(&self, handle: PartitionHandle) -> Result<usize> {
        handle
            .index()
            .filter(|&i| self.partitions.get(i).is_some_and(GPTPartitionEntry::is_used))
            .ok_or(Error::PartitionNotFound)
    }

    fn used_extents(&self, except: Option<usize>) -> Vec<Extent> {
        self.partitions
            .iter()
            .enumerate()
            .filter(|&(i, x)| x.is_used() && Some(i) != except)
            .map(|(_, x)| x.extent())
            .collect()
    }

    fn entry_array(&self) -> Result<Vec<u8>> {
        let size = self.header.size_of_partition_entry as usize;
        let mut array = Vec::with_capacity(self.header.array_bytes() as usize);
        for entry in &self.partitions {
            let mut data = bincode::serialize(entry)?;
            data.extend_from_slice(&entry.extra);
            data.resize(size, 0);
            array.extend_from_slice(&data);
        }
        Ok(array)
    }
}

fn header_sector(header: &GPTHeader, sector_size: u64) -> Result<Vec<u8>> {
    let mut header = *header;
    header.crc32_checksum = header.generate_crc32_checksum()?;
    let mut data = bincode::serialize(&header)?;
    data.resize(sector_size as usize, 0);
    Ok(data)
}

impl LabelDriver for GptLabel {
    fn kind(&self) -> LabelKind {
        LabelKind::Gpt
    }

    fn partitions(&self) -> Vec<Partition> {
        self.partitions
            .iter()
            .enumerate()
            .filter(|(_, x)| x.is_used())
            .map(|(i, x)| Partition {
                handle: PartitionHandle(i + 1),
                start: x.starting_lba,
                size: x.extent().size,
                parttype: PartitionType::Gpt(x.type_guid()),
                kind: PartitionKind::Primary,
                flags: x.flags(),
                name: Some(x.name()),
                uuid: Some(x.unique_guid()),
            })
            .collect()
    }

    fn max_partitions(&self) -> usize {
        self.partitions.len()
    }

    fn usable_range(&self) -> Extent {
        Extent::from_bounds(self.header.first_usable_lba, self.header.last_usable_lba)
    }

    fn disk_id(&self) -> Option<String> {
        Some(Uuid::from_bytes_le(self.header.disk_guid).to_string())
    }

    /// The backup always goes to the last sector of the device.
    fn serialize(&self, topology: &Topology) -> Result<Vec<SectorWrite>> {
        let ss = topology.logical_sector_size;
        let last = topology.last_lba();
        let array = self.entry_array()?;
        let array_sectors = self.header.array_sectors(ss);
        let backup_array_lba = last
            .checked_sub(array_sectors)
            .ok_or_else(|| Error::invalid("the device is too small for the entry array"))?;

        let primary = GPTHeader {
            primary_lba: 1,
            backup_lba: last,
            partition_entry_array_crc32: crc32fast::hash(&array),
            ..self.header
        };
        let backup = primary.mirrored(backup_array_lba);

        let mut padded = array;
        padded.resize((array_sectors * ss) as usize, 0);

        Ok(vec![
            SectorWrite::at_lba(backup_array_lba, ss, padded.clone(), WriteStage::Secondary),
            SectorWrite::at_lba(last, ss, header_sector(&backup, ss)?, WriteStage::Secondary),
            SectorWrite::at_lba(primary.partition_entry_lba, ss, padded, WriteStage::Primary),
            SectorWrite::at_lba(1, ss, header_sector(&primary, ss)?, WriteStage::Primary),
            SectorWrite::at_lba(0, ss, self.protective_mbr.clone(), WriteStage::Primary),
        ])
    }

    fn verify(&self, resolver: &Resolver) -> Result<()> {
        let header = &self.header;
        let array_sectors = header.array_sectors(self.sector_size);
        if header.first_usable_lba < header.partition_entry_lba + array_sectors {
            return Err(Error::corrupt(
                LabelKind::Gpt,
                "the usable range overlaps the primary entry array",
            ));
        }
        if header.last_usable_lba + array_sectors + 1 > self.total_sectors.saturating_sub(1) {
            return Err(Error::corrupt(
                LabelKind::Gpt,
                "the usable range overlaps the backup entry array",
            ));
        }
        if self.partitions.len() != header.number_of_partition_entries as usize {
            return Err(Error::corrupt(
                LabelKind::Gpt,
                "the entry count does not match the header",
            ));
        }

        let usable = resolver.with_bounds(header.first_usable_lba, header.last_usable_lba);
        let mut guids = HashSet::new();
        for (i, entry) in self.partitions.iter().enumerate() {
            if entry.is_unused() {
                continue;
            }
            if entry.ending_lba < entry.starting_lba {
                return Err(Error::corrupt(
                    LabelKind::Gpt,
                    format!("partition {} ends before it starts", i + 1),
                ));
            }
            usable.check_bounds(&entry.extent())?;
            if !guids.insert(entry.unique_partition_guid) {
                return Err(Error::corrupt(
                    LabelKind::Gpt,
                    format!("duplicate partition GUID {}", entry.unique_guid()),
                ));
            }
            if !usable.is_aligned(entry.starting_lba) {
                warn!(
                    "gpt: partition {} does not start on an alignment boundary ({} sectors)",
                    i + 1,
                    usable.unit()
                );
            }
        }
        Resolver::check_overlaps(&self.used_extents(None))
    }

    fn needs_rewrite(&self) -> bool {
        self.repaired
    }

    fn mark_synced(&mut self) {
        self.repaired = false;
    }

    fn add(&mut self, spec: &PartitionSpec, resolver: &Resolver) -> Result<PartitionHandle> {
        if matches!(
            spec.kind,
            Some(PartitionKind::Extended) | Some(PartitionKind::Logical)
        ) {
            return Err(Error::invalid("GPT has no extended partitions"));
        }
        let guid = match spec.parttype {
            Some(parttype) => type_guid(parttype)?,
            None => parttype::GPT_LINUX_FILESYSTEM,
        };
        let slot = match spec.partno {
            Some(handle) => {
                let i = handle
                    .index()
                    .filter(|&i| i < self.partitions.len())
                    .ok_or_else(|| {
                        Error::invalid(format!("partition number {} out of range", handle))
                    })?;
                if self.partitions[i].is_used() {
                    return Err(Error::invalid(format!("partition {} is already defined", handle)));
                }
                i
            }
            None => self
                .partitions
                .iter()
                .position(GPTPartitionEntry::is_unused)
                .ok_or(Error::NoFreeSlot {
                    max: self.partitions.len(),
                })?,
        };
        let unique = spec.uuid.unwrap_or_else(Uuid::new_v4);
        if unique.is_nil() || self.partitions.iter().any(|x| x.unique_guid() == unique) {
            return Err(Error::invalid(format!("partition GUID {} is not unique", unique)));
        }

        let used = self.used_extents(None);
        let extent = resolver.place(spec.start, spec.size, spec.unaligned, &used)?;
        resolver.validate_range(&extent, &used)?;

        let mut entry = GPTPartitionEntry {
            partition_type_guid: guid.to_bytes_le(),
            unique_partition_guid: unique.to_bytes_le(),
            starting_lba: extent.start,
            ending_lba: extent.end(),
            extra: self.partitions[slot].extra.clone(),
            ..GPTPartitionEntry::empty()
        };
        entry.set_name(spec.name.as_deref().unwrap_or_default())?;
        entry.apply_flags(spec.flags);
        self.partitions[slot] = entry;

        debug!(
            "gpt: partition {} at {}..={} ({})",
            slot + 1,
            extent.start,
            extent.end(),
            guid
        );
        Ok(PartitionHandle(slot + 1))
    }

    fn remove(&mut self, handle: PartitionHandle) -> Result<Partition> {
        let i = self.index(handle)?;
        let partition = self.partition(handle).ok_or(Error::PartitionNotFound)?;
        self.partitions[i].clear();
        Ok(partition)
    }

    fn resize(&mut self, handle: PartitionHandle, size: u64, resolver: &Resolver) -> Result<()> {
        let i = self.index(handle)?;
        let extent = Extent::new(self.partitions[i].starting_lba, size);
        resolver.validate_range(&extent, &self.used_extents(Some(i)))?;
        self.partitions[i].ending_lba = extent.end();
        Ok(())
    }

    fn set_type(&mut self, handle: PartitionHandle, parttype: PartitionType) -> Result<()> {
        let i = self.index(handle)?;
        self.partitions[i].partition_type_guid = type_guid(parttype)?.to_bytes_le();
        Ok(())
    }

    fn set_flags(&mut self, handle: PartitionHandle, flags: PartitionFlags) -> Result<()> {
        let i = self.index(handle)?;
        self.partitions[i].apply_flags(flags);
        Ok(())
    }

    fn set_name(&mut self, handle: PartitionHandle, name: &str) -> Result<()> {
        let i = self.index(handle)?;
        self.partitions[i].set_name(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::device::MemDevice;
    use crate::parttype::{GPT_EFI_SYSTEM, GPT_LINUX_FILESYSTEM, GPT_LINUX_SWAP};

    const SECTORS: u64 = 8192;

    fn setup(ss: u64, entries: u32) -> (MemDevice, Topology, GptLabel, Resolver) {
        let sectors = SECTORS * 512 / ss;
        let topology = Topology::new(sectors, ss);
        let gpt = GptLabel::new(&topology, entries).unwrap();
        let resolver = resolver_for(&topology, &gpt);
        (MemDevice::with_sectors(sectors, ss), topology, gpt, resolver)
    }

    fn resolver_for(topology: &Topology, gpt: &GptLabel) -> Resolver {
        let usable = gpt.usable_range();
        Resolver::new(topology, &Config::default())
            .unwrap()
            .with_bounds(usable.start, usable.end())
    }

    fn write(dev: &mut MemDevice, topology: &Topology, gpt: &GptLabel) {
        for w in gpt.serialize(topology).unwrap() {
            dev.write_at(w.offset, &w.data).unwrap();
        }
    }

    fn two_partitions(gpt: &mut GptLabel, resolver: &Resolver) {
        gpt.add(
            &PartitionSpec::new()
                .size(2048)
                .parttype(PartitionType::Gpt(GPT_EFI_SYSTEM))
                .name("EFI system"),
            resolver,
        )
        .unwrap();
        gpt.add(&PartitionSpec::new(), resolver).unwrap();
    }

    #[test]
    fn create_write_read() {
        let (mut dev, topology, mut gpt, resolver) = setup(512, 128);
        assert_eq!(gpt.usable_range(), Extent::from_bounds(34, 8158));
        two_partitions(&mut gpt, &resolver);

        let parts = gpt.partitions();
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0].start, 2048);
        assert_eq!(parts[0].size, 2048);
        assert_eq!(parts[0].name.as_deref(), Some("EFI system"));
        assert_eq!(parts[1].start, 4096);
        assert_eq!(parts[1].end(), 8158);
        assert_eq!(parts[1].parttype, PartitionType::Gpt(GPT_LINUX_FILESYSTEM));
        assert!(gpt.verify(&resolver).is_ok());

        write(&mut dev, &topology, &gpt);
        assert_eq!(&dev.as_slice()[512..520], b"EFI PART");
        assert_eq!(&dev.as_slice()[(SECTORS - 1) as usize * 512..][..8], b"EFI PART");
        assert_eq!(dev.as_slice()[446 + 4], 0xee);
        assert_eq!(&dev.as_slice()[510..512], &[0x55, 0xaa]);

        let same = GptLabel::read_from(&mut dev, &topology).unwrap();
        assert!(!same.needs_rewrite());
        assert_eq!(same.partitions(), gpt.partitions());
        assert_eq!(same.disk_id(), gpt.disk_id());
        assert_eq!(
            same.serialize(&topology).unwrap(),
            gpt.serialize(&topology).unwrap()
        );
    }

    #[test]
    fn corrupt_primary_is_recovered_from_the_backup() {
        let (mut dev, topology, mut gpt, resolver) = setup(512, 128);
        two_partitions(&mut gpt, &resolver);
        write(&mut dev, &topology, &gpt);
        let pristine = dev.as_slice().to_vec();

        dev.as_mut_slice()[512..1024].fill(0);
        let mut repaired = GptLabel::read_from(&mut dev, &topology).unwrap();
        assert!(repaired.needs_rewrite());
        assert_eq!(repaired.partitions(), gpt.partitions());

        write(&mut dev, &topology, &repaired);
        repaired.mark_synced();
        assert!(!repaired.needs_rewrite());
        assert_eq!(dev.as_slice(), &pristine[..]);
        assert!(!GptLabel::read_from(&mut dev, &topology)
            .unwrap()
            .needs_rewrite());

        // a damaged primary entry array is not trusted either
        dev.as_mut_slice()[1024 + 40] ^= 0xff;
        let repaired = GptLabel::read_from(&mut dev, &topology).unwrap();
        assert!(repaired.needs_rewrite());
        assert_eq!(repaired.partitions(), gpt.partitions());
    }

    #[test]
    fn corrupt_backup_is_flagged() {
        let (mut dev, topology, gpt, _) = setup(512, 128);
        write(&mut dev, &topology, &gpt);
        let last = (SECTORS - 1) as usize * 512;
        dev.as_mut_slice()[last + 16] ^= 0xff;
        let label = GptLabel::read_from(&mut dev, &topology).unwrap();
        assert!(label.needs_rewrite());
    }

    #[test]
    fn both_copies_corrupt() {
        let (mut dev, topology, gpt, _) = setup(512, 128);
        write(&mut dev, &topology, &gpt);
        dev.as_mut_slice()[512 + 16] ^= 0xff;
        let last = (SECTORS - 1) as usize * 512;
        dev.as_mut_slice()[last..last + 8].fill(0);
        match GptLabel::read_from(&mut dev, &topology) {
            Err(Error::CorruptLabel {
                label: LabelKind::Gpt,
                reason,
            }) => {
                assert!(reason.contains("primary header: invalid header checksum"));
                assert!(reason.contains("backup header: invalid signature"));
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn oversized_entry_array_is_refused() {
        let (mut dev, topology, gpt, _) = setup(512, 128);
        write(&mut dev, &topology, &gpt);
        let mut header = gpt.header;
        header.number_of_partition_entries = 1 << 24;
        header.crc32_checksum = header.generate_crc32_checksum().unwrap();
        let bytes = bincode::serialize(&header).unwrap();
        dev.write_at(512, &bytes).unwrap();

        // the backup is still good
        let label = GptLabel::read_from(&mut dev, &topology).unwrap();
        assert!(label.needs_rewrite());
        assert_eq!(label.header.number_of_partition_entries, 128);

        let last = (SECTORS - 1) * 512;
        let mut backup = label.header.mirrored(SECTORS - 33);
        backup.number_of_partition_entries = 1 << 24;
        backup.crc32_checksum = backup.generate_crc32_checksum().unwrap();
        dev.write_at(last, &bincode::serialize(&backup).unwrap())
            .unwrap();
        match GptLabel::read_from(&mut dev, &topology) {
            Err(Error::CorruptLabel { reason, .. }) => {
                assert!(reason.contains("larger than 1048576 bytes"), "{}", reason);
            }
            other => panic!("unexpected result: {:?}", other),
        }

        assert!(GptLabel::new(&Topology::new(1 << 20, 512), 8192).is_ok());
        assert!(GptLabel::new(&Topology::new(1 << 20, 512), 8193).is_err());
    }

    #[test]
    fn no_free_slot_leaves_the_table_unchanged() {
        let (_, _, mut gpt, resolver) = setup(512, 4);
        assert_eq!(gpt.usable_range(), Extent::from_bounds(3, 8189));
        for start in [2048, 4096, 6144, 7000] {
            gpt.add(
                &PartitionSpec::new().start(start).size(100).unaligned(),
                &resolver,
            )
            .unwrap();
        }
        let before = gpt.clone();
        assert!(matches!(
            gpt.add(
                &PartitionSpec::new().start(7200).size(100).unaligned(),
                &resolver
            ),
            Err(Error::NoFreeSlot { max: 4 })
        ));
        assert_eq!(gpt, before);
    }

    #[test]
    fn flags_names_and_types() {
        let (_, _, mut gpt, resolver) = setup(512, 128);
        let h = gpt.add(&PartitionSpec::new().size(2048), &resolver).unwrap();

        gpt.set_flags(h, PartitionFlags::BOOTABLE | PartitionFlags::HIDDEN)
            .unwrap();
        assert_eq!(gpt.partitions[0].attribute_bits, ATTR_LEGACY_BOOTABLE | ATTR_HIDDEN);
        gpt.set_flags(h, PartitionFlags::HIDDEN).unwrap();
        assert_eq!(
            gpt.partition(h).unwrap().flags,
            PartitionFlags::HIDDEN
        );

        gpt.set_name(h, "root").unwrap();
        assert_eq!(gpt.partition(h).unwrap().name.as_deref(), Some("root"));
        assert!(gpt.set_name(h, &"x".repeat(37)).is_err());
        assert_eq!(gpt.partitions[0].name(), "root");

        gpt.set_type(h, PartitionType::Dos(0x82)).unwrap();
        assert_eq!(gpt.partitions[0].type_guid(), GPT_LINUX_SWAP);
        assert!(gpt.set_type(h, PartitionType::Dos(0x05)).is_err());
        assert!(gpt.set_type(h, PartitionType::Sun(3)).is_err());
        assert!(gpt.set_type(h, PartitionType::Gpt(Uuid::nil())).is_err());
        assert!(matches!(
            gpt.set_type(PartitionHandle(2), PartitionType::Dos(0x83)),
            Err(Error::PartitionNotFound)
        ));
        assert!(gpt
            .add(&PartitionSpec::new().kind(PartitionKind::Logical), &resolver)
            .is_err());
    }

    #[test]
    fn partition_guids_are_unique() {
        let (_, _, mut gpt, resolver) = setup(512, 128);
        two_partitions(&mut gpt, &resolver);
        let taken = gpt.partitions[0].unique_guid();
        assert!(gpt
            .add(&PartitionSpec::new().size(10).uuid(taken), &resolver)
            .is_err());

        gpt.partitions[1].unique_partition_guid = gpt.partitions[0].unique_partition_guid;
        assert!(matches!(
            gpt.verify(&resolver),
            Err(Error::CorruptLabel {
                label: LabelKind::Gpt,
                ..
            })
        ));
    }

    #[test]
    fn resize_and_remove() {
        let (_, _, mut gpt, resolver) = setup(512, 128);
        two_partitions(&mut gpt, &resolver);
        assert!(matches!(
            gpt.resize(PartitionHandle(1), 2049, &resolver),
            Err(Error::Overlap { .. })
        ));
        gpt.resize(PartitionHandle(1), 1024, &resolver).unwrap();
        assert_eq!(gpt.partition(PartitionHandle(1)).unwrap().end(), 3071);

        let removed = gpt.remove(PartitionHandle(2)).unwrap();
        assert_eq!(removed.start, 4096);
        assert!(gpt.partition(PartitionHandle(2)).is_none());
        assert!(gpt.partitions[1].is_unused());
        assert!(matches!(
            gpt.resize(PartitionHandle(1), 8000, &resolver),
            Err(Error::OutOfBounds { .. })
        ));

        gpt.partitions[0].ending_lba = 9000;
        assert!(matches!(
            gpt.verify(&resolver),
            Err(Error::OutOfBounds { .. })
        ));
    }

    #[test]
    fn larger_entries_keep_their_extra_bytes() {
        let (mut dev, topology, mut gpt, _) = setup(512, 4);
        gpt.header.size_of_partition_entry = 256;
        gpt.header.first_usable_lba = 4;
        gpt.header.last_usable_lba = SECTORS - 4;
        for entry in gpt.partitions.iter_mut() {
            entry.extra = vec![0xab; 128];
        }
        let resolver = resolver_for(&topology, &gpt);
        gpt.add(&PartitionSpec::new().size(2048), &resolver).unwrap();
        assert!(gpt.verify(&resolver).is_ok());

        write(&mut dev, &topology, &gpt);
        assert_eq!(dev.as_slice()[1024 + 128], 0xab);
        let same = GptLabel::read_from(&mut dev, &topology).unwrap();
        assert_eq!(same.partitions, gpt.partitions);
        assert_eq!(
            same.serialize(&topology).unwrap(),
            gpt.serialize(&topology).unwrap()
        );
    }

    #[test]
    fn large_sectors() {
        let (mut dev, topology, mut gpt, resolver) = setup(4096, 128);
        assert_eq!(gpt.usable_range(), Extent::from_bounds(6, 1018));
        assert_eq!(resolver.unit(), 256);
        let h = gpt.add(&PartitionSpec::new(), &resolver).unwrap();
        assert_eq!(gpt.partition(h).unwrap().start, 256);

        write(&mut dev, &topology, &gpt);
        assert_eq!(&dev.as_slice()[4096..4104], b"EFI PART");
        let same = GptLabel::read_from(&mut dev, &topology).unwrap();
        assert_eq!(same.partitions(), gpt.partitions());
        assert!(!same.needs_rewrite());
    }

    #[test]
    fn too_small_for_a_gpt() {
        let topology = Topology::new(60, 512);
        assert!(GptLabel::new(&topology, 128).is_err());
        assert!(GptLabel::new(&Topology::new(2048, 512), 0).is_err());
    }
}

//! DOS partition tables: the master boot record, and logical partitions chained through
//! extended boot records (EBR) inside one extended partition.

use super::{random_id, LabelDriver, LabelKind, SectorWrite, WriteStage, BOOT_SIGNATURE};
use crate::chs::{Geometry, CHS};
use crate::device::{BlockDevice, BlockDeviceExt, Topology};
use crate::error::{Error, Result};
use crate::geometry::{Extent, Resolver};
use crate::partition::{
    Partition, PartitionFlags, PartitionHandle, PartitionKind, PartitionSpec, PartitionType,
};
use crate::parttype::{self, DOS_EXTENDED_LBA, DOS_HIDDEN_BIT, DOS_LINUX};
use log::{debug, warn};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_big_array::BigArray;
use std::collections::HashSet;

const BOOTFLAG_ACTIVE: u8 = 0x80;
const BOOTFLAG_INACTIVE: u8 = 0x00;
const PRIMARY_SLOTS: usize = 4;
const FIRST_LOGICAL: usize = 5;
const FIRST_USABLE_LBA: u64 = 1;
// type of the entries linking one EBR to the next
const LINK_TYPE: u8 = 0x05;

/// An MBR partition table header
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct MBRHeader {
    /// Bootstrap code area
    #[serde(with = "BigArray")]
    pub bootstrap_code: [u8; 440],
    /// 32-bit disk signature
    pub disk_signature: [u8; 4],
    /// `[0x5a, 0x5a]` if protected, `[0x00, 0x00]` if not
    pub copy_protected: [u8; 2],
    /// The four primary entries
    pub partitions: [MBRPartitionEntry; 4],
    /// Boot signature, `[0x55, 0xaa]` on a valid MBR
    pub boot_signature: [u8; 2],
}

impl MBRHeader {
    /// Make a new MBR header
    pub fn new(disk_signature: [u8; 4]) -> MBRHeader {
        MBRHeader {
            bootstrap_code: [0; 440],
            disk_signature,
            copy_protected: [0x00, 0x00],
            partitions: [MBRPartitionEntry::empty(); 4],
            boot_signature: BOOT_SIGNATURE,
        }
    }

    /// Check if the partition table is copy-protected
    pub fn is_copy_protected(&self) -> Option<bool> {
        match self.copy_protected {
            [0x00, 0x00] => Some(false),
            [0x5a, 0x5a] => Some(true),
            _ => None,
        }
    }

    /// Get `Some(&MBRPartitionEntry)` if it exists, None otherwise.
    ///
    /// # Remarks
    ///
    ///  -  The partitions start at index 1
    ///  -  This function does not return logical partitions
    pub fn get(&self, i: usize) -> Option<&MBRPartitionEntry> {
        self.partitions.get(i.checked_sub(1)?)
    }

    /// Get an iterator over the primary partition entries and their index. The
    /// index always starts at 1.
    pub fn iter(&self) -> impl Iterator<Item = (usize, &MBRPartitionEntry)> {
        self.partitions.iter().enumerate().map(|(i, x)| (i + 1, x))
    }

    fn extended(&self) -> Option<&MBRPartitionEntry> {
        self.partitions.iter().find(|x| x.is_extended())
    }
}

/// An extended boot record: one logical partition and the link to the next EBR.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct EBRHeader {
    /// Bootstrap code area (normally unused)
    #[serde(with = "BigArray")]
    pub bootstrap_code: [u8; 446],
    /// The logical partition, its start relative to this EBR
    pub partition: MBRPartitionEntry,
    /// Link to the next EBR, its start relative to the extended partition
    pub next: MBRPartitionEntry,
    /// Entries 3 and 4, unused
    #[serde(with = "BigArray")]
    pub unused: [u8; 32],
    /// Boot signature
    pub boot_signature: [u8; 2],
}

/// An MBR partition entry
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
pub struct MBRPartitionEntry {
    /// Boot flag
    #[serde(
        deserialize_with = "bootflag_deserialize",
        serialize_with = "bootflag_serialize"
    )]
    pub boot: bool,
    /// CHS address of the first sector in the partition
    pub first_chs: CHS,
    /// Partition type (file system ID)
    pub sys: u8,
    /// CHS address of the last sector in the partition
    pub last_chs: CHS,
    /// Starting LBA of the partition
    pub starting_lba: u32,
    /// Number of sectors allocated to the partition
    pub sectors: u32,
}

impl MBRPartitionEntry {
    /// Creates an empty partition entry
    pub fn empty() -> MBRPartitionEntry {
        MBRPartitionEntry {
            boot: false,
            first_chs: CHS::empty(),
            sys: 0,
            last_chs: CHS::empty(),
            starting_lba: 0,
            sectors: 0,
        }
    }

    /// Returns `true` if the partition entry is used (type (sys) != 0)
    pub fn is_used(&self) -> bool {
        self.sys > 0
    }

    /// Returns `true` if the partition entry is not used (type (sys) == 0)
    pub fn is_unused(&self) -> bool {
        !self.is_used()
    }

    /// Returns `true` if the partition is an extended type partition
    pub fn is_extended(&self) -> bool {
        parttype::is_dos_extended(self.sys)
    }

    /// The sectors of the partition.
    pub fn extent(&self) -> Extent {
        Extent::new(u64::from(self.starting_lba), u64::from(self.sectors))
    }

    fn flags(&self) -> PartitionFlags {
        let mut flags = PartitionFlags::empty();
        flags.set(PartitionFlags::BOOTABLE, self.boot);
        flags.set(PartitionFlags::HIDDEN, parttype::is_dos_hidden(self.sys));
        flags
    }

    fn apply_flags(&mut self, flags: PartitionFlags) -> Result<()> {
        if flags.contains(PartitionFlags::HIDDEN) {
            if !parttype::is_dos_hideable(self.sys) {
                return Err(Error::invalid(format!(
                    "partition type {:#04x} cannot be hidden",
                    self.sys
                )));
            }
            self.sys |= DOS_HIDDEN_BIT;
        } else if parttype::is_dos_hideable(self.sys) {
            self.sys &= !DOS_HIDDEN_BIT;
        }
        self.boot = flags.contains(PartitionFlags::BOOTABLE);
        Ok(())
    }
}

fn bootflag_deserialize<'de, D>(deserializer: D) -> std::result::Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    let flag: u8 = Deserialize::deserialize(deserializer)?;
    match flag {
        BOOTFLAG_ACTIVE => Ok(true),
        BOOTFLAG_INACTIVE => Ok(false),
        _ => Err(serde::de::Error::custom(format!(
            "invalid boot flag ({:#04x})",
            flag,
        ))),
    }
}

fn bootflag_serialize<S>(boot: &bool, serializer: S) -> std::result::Result<S::Ok, S::Error>
where
    S: Serializer,
{
    match *boot {
        true => serializer.serialize_u8(BOOTFLAG_ACTIVE),
        false => serializer.serialize_u8(BOOTFLAG_INACTIVE),
    }
}

/// A logical partition and the EBR that describes it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogicalPartition {
    /// Entry of the logical partition, with an absolute starting LBA
    pub partition: MBRPartitionEntry,
    /// Absolute LBA of the EBR
    pub ebr_lba: u64,
    /// Entry of the previous EBR that points to this one
    ///
    /// # Remark
    ///
    /// The first logical partition has no link: its EBR is always at the start of the extended
    /// partition.
    pub link: Option<MBRPartitionEntry>,
    /// Bootstrap code area of the EBR
    pub bootstrap_code: [u8; 446],
    /// Unused entries of the EBR
    pub unused: [u8; 32],
}

impl LogicalPartition {
    fn new(partition: MBRPartitionEntry, ebr_lba: u64) -> LogicalPartition {
        LogicalPartition {
            partition,
            ebr_lba,
            link: None,
            bootstrap_code: [0; 446],
            unused: [0; 32],
        }
    }

    fn start(&self) -> u64 {
        u64::from(self.partition.starting_lba)
    }

    fn end(&self) -> u64 {
        self.partition.extent().end()
    }

    // the EBR, the gap after it and the partition itself
    fn occupied(&self) -> Extent {
        Extent::from_bounds(self.ebr_lba, self.end())
    }
}

#[derive(Debug, Clone, Copy)]
enum Slot {
    Primary(usize),
    Logical(usize),
}

fn decode<'a, T: Deserialize<'a>>(bytes: &'a [u8], what: &str) -> Result<T> {
    bincode::deserialize(bytes)
        .map_err(|err| Error::corrupt(LabelKind::Dos, format!("{}: {}", what, err)))
}

fn to_u32(value: u64) -> Result<u32> {
    u32::try_from(value).map_err(|_| Error::invalid(format!("{} does not fit in a DOS entry", value)))
}

/// A DOS partition table.
#[derive(Debug, Clone, PartialEq)]
pub struct DosLabel {
    /// The MBR
    pub header: MBRHeader,
    /// Logical partitions, in chain order
    pub logical_partitions: Vec<LogicalPartition>,
    geometry: Option<Geometry>,
    total_sectors: u64,
}

impl DosLabel {
    /// Creates an empty table with a random disk signature.
    pub fn new(topology: &Topology, geometry: Option<Geometry>) -> Result<DosLabel> {
        topology.validate()?;
        Ok(DosLabel {
            header: MBRHeader::new(random_id()),
            logical_partitions: Vec::new(),
            geometry,
            total_sectors: topology.total_sectors,
        })
    }

    /// Reads the MBR and walks the EBR chain.
    pub fn read_from<D>(
        dev: &mut D,
        topology: &Topology,
        geometry: Option<Geometry>,
    ) -> Result<DosLabel>
    where
        D: BlockDevice + ?Sized,
    {
        let ss = topology.logical_sector_size;
        let sector = dev.read_sectors(0, 1, ss)?;
        let header: MBRHeader = decode(&sector[..512], "MBR")?;
        if header.boot_signature != BOOT_SIGNATURE {
            return Err(Error::corrupt(LabelKind::Dos, "missing boot signature"));
        }
        if header.partitions.iter().filter(|x| x.is_extended()).count() > 1 {
            return Err(Error::corrupt(
                LabelKind::Dos,
                "more than one extended partition",
            ));
        }

        let logical_partitions = match header.extended() {
            Some(extended) => read_chain(dev, extended, ss)?,
            None => Vec::new(),
        };
        debug!(
            "dos: signature {:02x?}, {} logical partition(s)",
            header.disk_signature,
            logical_partitions.len()
        );

        Ok(DosLabel {
            header,
            logical_partitions,
            geometry,
            total_sectors: topology.total_sectors,
        })
    }

    /// The extended partition entry, if any.
    pub fn extended(&self) -> Option<&MBRPartitionEntry> {
        self.header.extended()
    }

    fn slot(&self, handle: PartitionHandle) -> Result<Slot> {
        match handle.0 {
            i @ 1..=PRIMARY_SLOTS if self.header.partitions[i - 1].is_used() => {
                Ok(Slot::Primary(i - 1))
            }
            i if i >= FIRST_LOGICAL && i - FIRST_LOGICAL < self.logical_partitions.len() => {
                Ok(Slot::Logical(i - FIRST_LOGICAL))
            }
            _ => Err(Error::PartitionNotFound),
        }
    }

    fn entry_mut(&mut self, slot: Slot) -> &mut MBRPartitionEntry {
        match slot {
            Slot::Primary(i) => &mut self.header.partitions[i],
            Slot::Logical(i) => &mut self.logical_partitions[i].partition,
        }
    }

    fn primary_extents(&self, except: Option<usize>) -> Vec<Extent> {
        self.header
            .partitions
            .iter()
            .enumerate()
            .filter(|&(i, x)| x.is_used() && Some(i) != except)
            .map(|(_, x)| x.extent())
            .collect()
    }

    fn logical_extents(&self, except: Option<usize>) -> Vec<Extent> {
        self.logical_partitions
            .iter()
            .enumerate()
            .filter(|&(i, _)| Some(i) != except)
            .map(|(_, x)| x.occupied())
            .collect()
    }

    fn chs_for(&self, extent: Extent) -> (CHS, CHS) {
        match self.geometry {
            Some(geometry) => (
                CHS::from_lba_clamped(extent.start, geometry).unwrap_or_default(),
                CHS::from_lba_clamped(extent.end(), geometry).unwrap_or_default(),
            ),
            None => (CHS::empty(), CHS::empty()),
        }
    }

    fn make_entry(&self, sys: u8, extent: Extent, flags: PartitionFlags) -> Result<MBRPartitionEntry> {
        let (first_chs, last_chs) = self.chs_for(extent);
        let mut entry = MBRPartitionEntry {
            boot: false,
            first_chs,
            sys,
            last_chs,
            starting_lba: to_u32(extent.start)?,
            sectors: to_u32(extent.size)?,
        };
        entry.apply_flags(flags)?;
        Ok(entry)
    }

    // the resolver restricted to the inside of the extended partition
    fn container_resolver(&self, resolver: &Resolver) -> Result<(Extent, Resolver)> {
        let container = self
            .extended()
            .map(MBRPartitionEntry::extent)
            .ok_or_else(|| Error::invalid("logical partitions need an extended partition"))?;
        let inner = resolver.with_bounds(container.start, container.end().min(resolver.last()));
        Ok((container, inner))
    }

    fn add_primary(
        &mut self,
        spec: &PartitionSpec,
        sys: u8,
        resolver: &Resolver,
    ) -> Result<PartitionHandle> {
        let slot = match spec.partno {
            Some(PartitionHandle(i @ 1..=PRIMARY_SLOTS)) => {
                if self.header.partitions[i - 1].is_used() {
                    return Err(Error::invalid(format!("partition {} is already defined", i)));
                }
                i - 1
            }
            Some(handle) => {
                return Err(Error::invalid(format!(
                    "partition {} is not a primary partition number",
                    handle
                )))
            }
            None => self
                .header
                .partitions
                .iter()
                .position(|x| x.is_unused())
                .ok_or(Error::NoFreeSlot { max: PRIMARY_SLOTS })?,
        };
        if parttype::is_dos_extended(sys) && self.extended().is_some() {
            return Err(Error::invalid("there is already an extended partition"));
        }

        let used = self.primary_extents(None);
        let extent = resolver.place(spec.start, spec.size, spec.unaligned, &used)?;
        resolver.validate_range(&extent, &used)?;

        let entry = self.make_entry(sys, extent, spec.flags)?;
        self.header.partitions[slot] = entry;
        debug!(
            "dos: partition {} at {}..={} (type {:#04x})",
            slot + 1,
            extent.start,
            extent.end(),
            sys
        );
        Ok(PartitionHandle(slot + 1))
    }

    fn add_logical(
        &mut self,
        spec: &PartitionSpec,
        sys: u8,
        resolver: &Resolver,
    ) -> Result<PartitionHandle> {
        if parttype::is_dos_extended(sys) {
            return Err(Error::invalid("a logical partition cannot be extended"));
        }
        let (container, inner) = self.container_resolver(resolver)?;
        let occupied = self.logical_extents(None);

        // the data never starts at the beginning of a free range: its EBR goes before it
        let start = match spec.start {
            Some(start) if spec.unaligned => start,
            Some(start) => inner.align(start),
            None => inner
                .gaps(&occupied)
                .into_iter()
                .find_map(|gap| {
                    let start = inner.align(gap.start + 1);
                    let fits = start <= gap.end()
                        && spec.size.map_or(true, |size| gap.end() - start + 1 >= size);
                    fits.then_some(start)
                })
                .ok_or(Error::NoSpaceLeft)?,
        };
        let size = match spec.size {
            Some(size) => size,
            None => {
                inner.validate_range(&Extent::new(start, 1), &occupied)?;
                inner
                    .gaps(&occupied)
                    .into_iter()
                    .find(|x| x.contains(start))
                    .map(|x| x.end() - start + 1)
                    .ok_or(Error::NoSpaceLeft)?
            }
        };
        let data = Extent::new(start, size);
        inner.check_bounds(&data)?;
        if data.start <= container.start {
            return Err(Error::OutOfBounds {
                start: data.start,
                end: data.end(),
                first: container.start + 1,
                last: inner.last(),
            });
        }

        let idx = self
            .logical_partitions
            .iter()
            .take_while(|x| x.start() < data.start)
            .count();
        let ebr_lba = match idx {
            0 => container.start,
            _ => {
                let prev = &self.logical_partitions[idx - 1];
                data.start
                    .saturating_sub(inner.unit())
                    .max(prev.end() + 1)
            }
        };
        let overlap = |other: &Extent| Error::Overlap {
            start: data.start,
            end: data.end(),
            other_start: other.start,
            other_end: other.end(),
        };
        if ebr_lba >= data.start {
            return Err(overlap(&occupied[idx - 1]));
        }

        // a new first partition takes the EBR at the start of the container
        let mut others = occupied.clone();
        let mut relocated = None;
        if idx == 0 {
            if let Some(first) = self.logical_partitions.first() {
                let ebr = first
                    .start()
                    .saturating_sub(inner.unit())
                    .max(data.end() + 1);
                if ebr >= first.start() {
                    return Err(overlap(&first.occupied()));
                }
                others[0] = Extent::from_bounds(ebr, first.end());
                relocated = Some(ebr);
            }
        }
        let claimed = Extent::from_bounds(ebr_lba, data.end());
        if let Some(other) = others.iter().find(|x| x.overlaps(&claimed)) {
            return Err(overlap(other));
        }

        let entry = self.make_entry(sys, data, spec.flags)?;
        if let Some(ebr) = relocated {
            self.logical_partitions[0].ebr_lba = ebr;
        }
        self.logical_partitions
            .insert(idx, LogicalPartition::new(entry, ebr_lba));
        self.relink();
        debug!(
            "dos: logical partition {} at {}..={} (EBR at {})",
            FIRST_LOGICAL + idx,
            data.start,
            data.end(),
            ebr_lba
        );
        Ok(PartitionHandle(FIRST_LOGICAL + idx))
    }

    fn link_for(&self, i: usize) -> Option<MBRPartitionEntry> {
        let extended = self.extended()?;
        let l = self.logical_partitions.get(i)?;
        let start = l.ebr_lba.checked_sub(u64::from(extended.starting_lba))?;
        let sectors = l.end().checked_sub(l.ebr_lba)? + 1;
        let sys = l
            .link
            .filter(MBRPartitionEntry::is_extended)
            .map_or(LINK_TYPE, |x| x.sys);
        let (first_chs, last_chs) = self.chs_for(l.occupied());
        Some(MBRPartitionEntry {
            boot: false,
            first_chs,
            sys,
            last_chs,
            starting_lba: u32::try_from(start).ok()?,
            sectors: u32::try_from(sectors).ok()?,
        })
    }

    // Puts the first EBR at the start of the container and refreshes the links that no longer
    // match their target.
    fn relink(&mut self) {
        let container_start = match self.extended() {
            Some(x) => u64::from(x.starting_lba),
            None => return,
        };
        if let Some(first) = self.logical_partitions.first_mut() {
            first.ebr_lba = container_start;
            first.link = None;
        }
        for i in 1..self.logical_partitions.len() {
            let fresh = self.link_for(i);
            let l = &mut self.logical_partitions[i];
            let stale = match (l.link, fresh) {
                (Some(old), Some(new)) => {
                    old.starting_lba != new.starting_lba || old.sectors != new.sectors
                }
                _ => true,
            };
            if stale {
                l.link = fresh;
            }
        }
    }
}

fn read_chain<D>(
    dev: &mut D,
    extended: &MBRPartitionEntry,
    ss: u64,
) -> Result<Vec<LogicalPartition>>
where
    D: BlockDevice + ?Sized,
{
    let container = extended.extent();
    let mut logicals: Vec<LogicalPartition> = Vec::new();
    let mut visited = HashSet::new();
    let mut ebr_lba = container.start;
    let mut link = None;

    loop {
        if !visited.insert(ebr_lba) {
            return Err(Error::CyclicExtendedChain { lba: ebr_lba });
        }
        if !container.contains(ebr_lba) {
            return Err(Error::corrupt(
                LabelKind::Dos,
                format!("EBR at sector {} is outside of the extended partition", ebr_lba),
            ));
        }

        let sector = dev.read_sectors(ebr_lba, 1, ss)?;
        if sector[510..512] != BOOT_SIGNATURE {
            if visited.len() == 1 {
                // an empty extended partition does not need an EBR
                break;
            }
            return Err(Error::corrupt(
                LabelKind::Dos,
                format!("missing signature in the EBR at sector {}", ebr_lba),
            ));
        }
        let ebr: EBRHeader = decode(&sector[..512], "EBR")?;

        if ebr.partition.is_used() {
            let start = ebr_lba
                .checked_add(u64::from(ebr.partition.starting_lba))
                .and_then(|x| u32::try_from(x).ok())
                .ok_or_else(|| {
                    Error::corrupt(
                        LabelKind::Dos,
                        format!("logical partition of the EBR at {} overflows", ebr_lba),
                    )
                })?;
            logicals.push(LogicalPartition {
                partition: MBRPartitionEntry {
                    starting_lba: start,
                    ..ebr.partition
                },
                ebr_lba,
                link: link.take(),
                bootstrap_code: ebr.bootstrap_code,
                unused: ebr.unused,
            });
        }

        if ebr.next.is_unused() || ebr.next.starting_lba == 0 {
            break;
        }
        ebr_lba = container.start + u64::from(ebr.next.starting_lba);
        link = Some(ebr.next);
    }

    if let Some(first) = logicals.first_mut() {
        if first.ebr_lba != container.start {
            warn!(
                "dos: first EBR found at sector {} instead of {}",
                first.ebr_lba, container.start
            );
            first.ebr_lba = container.start;
            first.link = None;
        }
    }

    Ok(logicals)
}

impl LabelDriver for DosLabel {
    fn kind(&self) -> LabelKind {
        LabelKind::Dos
    }

    fn partitions(&self) -> Vec<Partition> {
        let primaries = self.header.iter().filter(|(_, x)| x.is_used()).map(|(i, x)| {
            let kind = if x.is_extended() {
                PartitionKind::Extended
            } else {
                PartitionKind::Primary
            };
            (i, x, kind)
        });
        let logicals = self
            .logical_partitions
            .iter()
            .enumerate()
            .map(|(i, x)| (FIRST_LOGICAL + i, &x.partition, PartitionKind::Logical));

        primaries
            .chain(logicals)
            .map(|(i, x, kind)| Partition {
                handle: PartitionHandle(i),
                start: u64::from(x.starting_lba),
                size: u64::from(x.sectors),
                parttype: PartitionType::Dos(x.sys),
                kind,
                flags: x.flags(),
                name: None,
                uuid: None,
            })
            .collect()
    }

    /// The number of primary slots: logical partitions are not limited.
    fn max_partitions(&self) -> usize {
        PRIMARY_SLOTS
    }

    fn usable_range(&self) -> Extent {
        let last = self
            .total_sectors
            .saturating_sub(1)
            .min(u64::from(u32::MAX));
        Extent::from_bounds(FIRST_USABLE_LBA, last)
    }

    fn disk_id(&self) -> Option<String> {
        Some(format!(
            "0x{:08x}",
            u32::from_le_bytes(self.header.disk_signature)
        ))
    }

    fn serialize(&self, topology: &Topology) -> Result<Vec<SectorWrite>> {
        let ss = topology.logical_sector_size;
        let mut writes = Vec::new();

        if let Some(extended) = self.extended() {
            if self.logical_partitions.is_empty() {
                // a blank first EBR marks the extended partition as empty
                writes.push(SectorWrite::at_lba(
                    u64::from(extended.starting_lba),
                    ss,
                    vec![0; 512],
                    WriteStage::Secondary,
                ));
            }
            for (i, l) in self.logical_partitions.iter().enumerate() {
                let relative = l
                    .start()
                    .checked_sub(l.ebr_lba)
                    .ok_or_else(|| Error::invalid("logical partition starts before its EBR"))?;
                let next = match self.logical_partitions.get(i + 1) {
                    Some(next) => next
                        .link
                        .or_else(|| self.link_for(i + 1))
                        .ok_or_else(|| Error::invalid("EBR chain cannot be encoded"))?,
                    None => MBRPartitionEntry::empty(),
                };
                let ebr = EBRHeader {
                    bootstrap_code: l.bootstrap_code,
                    partition: MBRPartitionEntry {
                        starting_lba: to_u32(relative)?,
                        ..l.partition
                    },
                    next,
                    unused: l.unused,
                    boot_signature: BOOT_SIGNATURE,
                };
                writes.push(SectorWrite::at_lba(
                    l.ebr_lba,
                    ss,
                    bincode::serialize(&ebr)?,
                    WriteStage::Secondary,
                ));
            }
        }

        writes.push(SectorWrite::at_lba(
            0,
            ss,
            bincode::serialize(&self.header)?,
            WriteStage::Primary,
        ));
        Ok(writes)
    }

    fn verify(&self, resolver: &Resolver) -> Result<()> {
        let primaries = self.primary_extents(None);
        for extent in &primaries {
            resolver.check_bounds(extent)?;
        }
        Resolver::check_overlaps(&primaries)?;

        if let Some(extended) = self.extended() {
            let container = extended.extent();
            for (i, l) in self.logical_partitions.iter().enumerate() {
                if !container.encloses(&l.occupied()) {
                    return Err(Error::OutOfBounds {
                        start: l.start(),
                        end: l.end(),
                        first: container.start,
                        last: container.end(),
                    });
                }
                if l.ebr_lba >= l.start() {
                    return Err(Error::corrupt(
                        LabelKind::Dos,
                        format!("partition {} starts before its EBR", FIRST_LOGICAL + i),
                    ));
                }
            }
            if let Some(first) = self.logical_partitions.first() {
                if first.ebr_lba != container.start {
                    return Err(Error::corrupt(
                        LabelKind::Dos,
                        "the first EBR is not at the start of the extended partition",
                    ));
                }
            }
            Resolver::check_overlaps(&self.logical_extents(None))?;
        } else if !self.logical_partitions.is_empty() {
            return Err(Error::corrupt(
                LabelKind::Dos,
                "logical partitions without an extended partition",
            ));
        }

        for p in self.partitions() {
            if !resolver.is_aligned(p.start) && p.kind != PartitionKind::Logical {
                warn!(
                    "dos: partition {} does not start on an alignment boundary ({} sectors)",
                    p.handle,
                    resolver.unit()
                );
            }
        }
        Ok(())
    }

    fn add(&mut self, spec: &PartitionSpec, resolver: &Resolver) -> Result<PartitionHandle> {
        let sys = match spec.parttype {
            None => None,
            Some(PartitionType::Dos(0)) => {
                return Err(Error::invalid("type 0 marks unused entries"))
            }
            Some(PartitionType::Dos(x)) => Some(x),
            Some(_) => return Err(Error::invalid("not a DOS partition type")),
        };
        let extended_type = sys.is_some_and(parttype::is_dos_extended);
        if spec.kind == Some(PartitionKind::Extended) && sys.is_some() && !extended_type {
            return Err(Error::invalid(
                "an extended partition needs an extended type",
            ));
        }

        let logical = match spec.kind {
            Some(PartitionKind::Logical) => true,
            Some(_) => false,
            None => {
                !extended_type
                    && match (self.extended(), spec.start) {
                        (None, _) => false,
                        (Some(ext), Some(start)) => ext.extent().contains(start),
                        (Some(_), None) => self.header.partitions.iter().all(|x| x.is_used()),
                    }
            }
        };

        if logical {
            self.add_logical(spec, sys.unwrap_or(DOS_LINUX), resolver)
        } else {
            let extended = extended_type || spec.kind == Some(PartitionKind::Extended);
            let default = if extended { DOS_EXTENDED_LBA } else { DOS_LINUX };
            self.add_primary(spec, sys.unwrap_or(default), resolver)
        }
    }

    fn remove(&mut self, handle: PartitionHandle) -> Result<Partition> {
        let slot = self.slot(handle)?;
        let partition = self.partition(handle).ok_or(Error::PartitionNotFound)?;
        match slot {
            Slot::Primary(i) => {
                if self.header.partitions[i].is_extended() {
                    self.logical_partitions.clear();
                }
                self.header.partitions[i] = MBRPartitionEntry::empty();
            }
            Slot::Logical(i) => {
                self.logical_partitions.remove(i);
                self.relink();
            }
        }
        Ok(partition)
    }

    fn resize(&mut self, handle: PartitionHandle, size: u64, resolver: &Resolver) -> Result<()> {
        let slot = self.slot(handle)?;
        match slot {
            Slot::Primary(i) => {
                let entry = self.header.partitions[i];
                let extent = Extent::new(u64::from(entry.starting_lba), size);
                resolver.validate_range(&extent, &self.primary_extents(Some(i)))?;
                if entry.is_extended() {
                    if let Some(cut) = self
                        .logical_partitions
                        .iter()
                        .find(|x| !extent.encloses(&x.occupied()))
                    {
                        return Err(Error::OutOfBounds {
                            start: cut.start(),
                            end: cut.end(),
                            first: extent.start,
                            last: extent.end(),
                        });
                    }
                }
            }
            Slot::Logical(i) => {
                let (_, inner) = self.container_resolver(resolver)?;
                let l = &self.logical_partitions[i];
                let extent = Extent::new(l.start(), size);
                inner.check_bounds(&extent)?;
                let claimed = Extent::from_bounds(l.ebr_lba, extent.end());
                if let Some(other) = self
                    .logical_extents(Some(i))
                    .iter()
                    .find(|x| x.overlaps(&claimed))
                {
                    return Err(Error::Overlap {
                        start: extent.start,
                        end: extent.end(),
                        other_start: other.start,
                        other_end: other.end(),
                    });
                }
            }
        }

        let sectors = to_u32(size)?;
        let entry = self.entry_mut(slot);
        entry.sectors = sectors;
        let extent = entry.extent();
        if self.geometry.is_some() {
            let (first_chs, last_chs) = self.chs_for(extent);
            let entry = self.entry_mut(slot);
            entry.first_chs = first_chs;
            entry.last_chs = last_chs;
        }
        self.relink();
        Ok(())
    }

    fn set_type(&mut self, handle: PartitionHandle, parttype: PartitionType) -> Result<()> {
        let sys = match parttype {
            PartitionType::Dos(0) => return Err(Error::invalid("type 0 marks unused entries")),
            PartitionType::Dos(x) => x,
            _ => return Err(Error::invalid("not a DOS partition type")),
        };
        let slot = self.slot(handle)?;
        let becomes_extended = parttype::is_dos_extended(sys);
        match slot {
            Slot::Primary(i) => {
                let was_extended = self.header.partitions[i].is_extended();
                if was_extended && !becomes_extended && !self.logical_partitions.is_empty() {
                    return Err(Error::invalid(
                        "the extended partition still holds logical partitions",
                    ));
                }
                if !was_extended && becomes_extended && self.extended().is_some() {
                    return Err(Error::invalid("there is already an extended partition"));
                }
            }
            Slot::Logical(_) if becomes_extended => {
                return Err(Error::invalid("a logical partition cannot be extended"));
            }
            Slot::Logical(_) => {}
        }
        self.entry_mut(slot).sys = sys;
        Ok(())
    }

    fn set_flags(&mut self, handle: PartitionHandle, flags: PartitionFlags) -> Result<()> {
        let slot = self.slot(handle)?;
        let mut entry = *self.entry_mut(slot);
        entry.apply_flags(flags)?;
        *self.entry_mut(slot) = entry;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::device::MemDevice;
    use crate::geometry::AlignmentPolicy;

    fn setup(sectors: u64, alignment: AlignmentPolicy) -> (MemDevice, Topology, Resolver) {
        let topology = Topology::new(sectors, 512);
        let config = Config::default().with_alignment(alignment);
        let resolver = Resolver::new(&topology, &config)
            .unwrap()
            .with_bounds(1, sectors - 1);
        (MemDevice::with_sectors(sectors, 512), topology, resolver)
    }

    fn write(dev: &mut MemDevice, writes: &[SectorWrite]) {
        for w in writes {
            dev.write_at(w.offset, &w.data).unwrap();
        }
    }

    fn commit(dev: &mut MemDevice, topology: &Topology, label: &DosLabel) -> DosLabel {
        write(dev, &label.serialize(topology).unwrap());
        DosLabel::read_from(dev, topology, None).unwrap()
    }

    fn linux(start: u64, size: u64) -> PartitionSpec {
        PartitionSpec::new()
            .start(start)
            .size(size)
            .parttype(PartitionType::Dos(0x83))
    }

    #[test]
    fn new_mbr_then_write_then_read() {
        let (mut dev, topology, resolver) = setup(1 << 16, AlignmentPolicy::Auto);
        let mut label = DosLabel::new(&topology, None).unwrap();
        label.header.disk_signature = [0x78, 0x56, 0x34, 0x12];
        let h = label.add(&linux(2048, 4096), &resolver).unwrap();
        assert_eq!(h, PartitionHandle(1));
        label
            .set_flags(h, PartitionFlags::BOOTABLE)
            .unwrap();
        let h = label
            .add(&PartitionSpec::new().parttype(PartitionType::Dos(0x0c)), &resolver)
            .unwrap();
        assert_eq!(h, PartitionHandle(2));

        let same = commit(&mut dev, &topology, &label);
        assert_eq!(same, label);
        assert_eq!(same.disk_id().unwrap(), "0x12345678");
        let parts = same.partitions();
        assert_eq!(parts.len(), 2);
        assert!(parts[0].is_bootable());
        assert_eq!(parts[1].start, 6144);
        assert_eq!(parts[1].end(), (1 << 16) - 1);
        assert_eq!(&dev.as_slice()[510..512], &[0x55, 0xaa]);
        assert_eq!(dev.as_slice()[446], 0x80);
    }

    #[test]
    fn logical_partitions_round_trip() {
        let (mut dev, topology, resolver) = setup(200, AlignmentPolicy::Sector);
        let mut label = DosLabel::new(&topology, None).unwrap();
        label.add(&linux(1, 49), &resolver).unwrap();
        let ext = label
            .add(
                &PartitionSpec::new()
                    .start(50)
                    .kind(PartitionKind::Extended),
                &resolver,
            )
            .unwrap();
        assert_eq!(ext, PartitionHandle(2));
        assert_eq!(label.header.partitions[1].sys, DOS_EXTENDED_LBA);
        assert_eq!(label.header.partitions[1].sectors, 150);

        assert_eq!(label.add(&linux(52, 20), &resolver).unwrap(), PartitionHandle(5));
        assert_eq!(label.add(&linux(80, 30), &resolver).unwrap(), PartitionHandle(6));
        // the gap between 71 and 79 is too small, the next one is used
        let h = label
            .add(
                &PartitionSpec::new().size(50).kind(PartitionKind::Logical),
                &resolver,
            )
            .unwrap();
        assert_eq!(h, PartitionHandle(7));
        assert_eq!(label.logical_partitions[0].ebr_lba, 50);
        assert_eq!(label.logical_partitions[1].ebr_lba, 79);
        assert_eq!(label.logical_partitions[2].ebr_lba, 110);
        assert_eq!(label.logical_partitions[2].start(), 111);
        assert_eq!(label.logical_partitions[2].end(), 160);

        let same = commit(&mut dev, &topology, &label);
        assert_eq!(same, label);
        assert_eq!(same.partitions().len(), 5);
        // link of the second logical partition, relative to the container
        let link = same.logical_partitions[1].link.unwrap();
        assert_eq!(link.starting_lba, 29);
        assert_eq!(link.sectors, 31);
        assert_eq!(link.sys, LINK_TYPE);
        // first EBR: data relative to the EBR
        assert_eq!(dev.as_slice()[50 * 512 + 446 + 8], 2);

        // serialize(parse(raw)) == raw
        assert_eq!(
            same.serialize(&topology).unwrap(),
            label.serialize(&topology).unwrap()
        );
    }

    #[test]
    fn logical_partition_inserted_first_moves_the_first_ebr() {
        let (_, topology, resolver) = setup(200, AlignmentPolicy::Sector);
        let mut label = DosLabel::new(&topology, None).unwrap();
        label
            .add(&PartitionSpec::new().start(10).kind(PartitionKind::Extended), &resolver)
            .unwrap();
        label.add(&linux(100, 50), &resolver).unwrap();
        assert_eq!(label.logical_partitions[0].ebr_lba, 10);
        let h = label.add(&linux(20, 10), &resolver).unwrap();
        assert_eq!(h, PartitionHandle(5));
        assert_eq!(label.logical_partitions[0].ebr_lba, 10);
        assert_eq!(label.logical_partitions[1].ebr_lba, 99);
        assert_eq!(label.partition(PartitionHandle(6)).unwrap().start, 100);
        assert!(label.verify(&resolver).is_ok());
    }

    #[test]
    fn push_logical_partition_check_within_range() {
        let (_, topology, resolver) = setup(10, AlignmentPolicy::Sector);
        let mut label = DosLabel::new(&topology, None).unwrap();
        label
            .add(
                &PartitionSpec::new()
                    .start(4)
                    .size(3)
                    .kind(PartitionKind::Extended),
                &resolver,
            )
            .unwrap();
        let logical = |start, size| linux(start, size).kind(PartitionKind::Logical);
        assert!(matches!(
            label.add(&logical(3, 2), &resolver),
            Err(Error::OutOfBounds { .. })
        ));
        assert!(matches!(
            label.add(&logical(4, 2), &resolver),
            Err(Error::OutOfBounds { .. })
        ));
        assert!(label.add(&logical(6, 2), &resolver).is_err());
        label.add(&logical(5, 2), &resolver).unwrap();
        assert!(matches!(
            label.add(&logical(6, 1), &resolver),
            Err(Error::Overlap { .. })
        ));
    }

    #[test]
    fn remove_logical_partition() {
        let (mut dev, topology, resolver) = setup(10, AlignmentPolicy::Sector);
        let mut label = DosLabel::new(&topology, None).unwrap();
        label
            .add(&PartitionSpec::new().start(1).kind(PartitionKind::Extended), &resolver)
            .unwrap();
        label.add(&linux(2, 2), &resolver).unwrap();
        label.add(&linux(5, 3), &resolver).unwrap();
        assert_eq!(label.logical_partitions[1].ebr_lba, 4);

        let removed = label.remove(PartitionHandle(5)).unwrap();
        assert_eq!(removed.start, 2);
        assert_eq!(removed.kind, PartitionKind::Logical);
        let same = commit(&mut dev, &topology, &label);
        assert_eq!(same, label);
        assert_eq!(label.logical_partitions[0].start(), 5);
        assert_eq!(label.logical_partitions[0].ebr_lba, 1);
        assert_eq!(label.logical_partitions[0].link, None);
        assert!(matches!(
            label.remove(PartitionHandle(6)),
            Err(Error::PartitionNotFound)
        ));

        // removing the extended partition drops its logical partitions
        label.remove(PartitionHandle(1)).unwrap();
        assert!(label.logical_partitions.is_empty());
        assert!(label.partitions().is_empty());
    }

    #[test]
    fn read_empty_extended_partition() {
        let (mut dev, topology, resolver) = setup(10, AlignmentPolicy::Sector);
        let mut label = DosLabel::new(&topology, None).unwrap();
        label
            .add(&PartitionSpec::new().start(1).kind(PartitionKind::Extended), &resolver)
            .unwrap();
        let same = commit(&mut dev, &topology, &label);
        assert_eq!(same.header.partitions[0].sys, 0x0f);
        assert_eq!(same.header.partitions[0].starting_lba, 1);
        assert_eq!(same.header.partitions[0].sectors, 9);
        assert!(same.logical_partitions.is_empty());
    }

    #[test]
    fn no_free_slot_leaves_the_table_unchanged() {
        let (_, topology, resolver) = setup(100, AlignmentPolicy::Sector);
        let mut label = DosLabel::new(&topology, None).unwrap();
        for i in 0..4 {
            label.add(&linux(1 + i * 10, 10), &resolver).unwrap();
        }
        let before = label.clone();
        assert!(matches!(
            label.add(&linux(60, 10), &resolver),
            Err(Error::NoFreeSlot { max: 4 })
        ));
        assert_eq!(label, before);
        assert!(matches!(
            label.add(&linux(60, 10).partno(2), &resolver),
            Err(Error::Invalid(_))
        ));
    }

    #[test]
    fn overlap_and_bounds() {
        let (_, topology, resolver) = setup(262_144, AlignmentPolicy::Auto);
        let mut label = DosLabel::new(&topology, None).unwrap();
        label.add(&linux(2048, 204_800), &resolver).unwrap();
        assert!(matches!(
            label.add(&linux(100_000, 2000), &resolver),
            Err(Error::Overlap { .. })
        ));
        assert!(matches!(
            label.add(&linux(250_000, 20_000), &resolver),
            Err(Error::OutOfBounds { .. })
        ));
        assert_eq!(label.partitions().len(), 1);
    }

    #[test]
    fn cyclic_extended_chain() {
        let mut dev = MemDevice::with_sectors(32, 512);
        let topology = Topology::new(32, 512);
        let mut header = MBRHeader::new([1, 2, 3, 4]);
        header.partitions[0] = MBRPartitionEntry {
            sys: 0x05,
            starting_lba: 1,
            sectors: 20,
            ..MBRPartitionEntry::empty()
        };
        dev.write_at(0, &bincode::serialize(&header).unwrap()).unwrap();
        let ebr = |next: u32| EBRHeader {
            bootstrap_code: [0; 446],
            partition: MBRPartitionEntry {
                sys: 0x83,
                starting_lba: 1,
                sectors: 1,
                ..MBRPartitionEntry::empty()
            },
            next: MBRPartitionEntry {
                sys: 0x05,
                starting_lba: next,
                sectors: 2,
                ..MBRPartitionEntry::empty()
            },
            unused: [0; 32],
            boot_signature: BOOT_SIGNATURE,
        };
        // 1 -> 3 -> 3
        dev.write_at(512, &bincode::serialize(&ebr(2)).unwrap()).unwrap();
        dev.write_at(3 * 512, &bincode::serialize(&ebr(2)).unwrap())
            .unwrap();
        assert!(matches!(
            DosLabel::read_from(&mut dev, &topology, None),
            Err(Error::CyclicExtendedChain { lba: 3 })
        ));

        // 1 -> 3 -> 41, outside of the container
        dev.write_at(3 * 512, &bincode::serialize(&ebr(40)).unwrap())
            .unwrap();
        let err = DosLabel::read_from(&mut dev, &topology, None).unwrap_err();
        assert!(err.is_corruption());
    }

    #[test]
    fn invalid_boot_flag_is_corruption() {
        let mut dev = MemDevice::with_sectors(8, 512);
        let topology = Topology::new(8, 512);
        let header = MBRHeader::new([1, 2, 3, 4]);
        dev.write_at(0, &bincode::serialize(&header).unwrap()).unwrap();
        dev.as_mut_slice()[446] = 0x42;
        assert!(matches!(
            DosLabel::read_from(&mut dev, &topology, None),
            Err(Error::CorruptLabel {
                label: LabelKind::Dos,
                ..
            })
        ));
    }

    #[test]
    fn resize_extended_cannot_cut_logical_partitions() {
        let (_, topology, resolver) = setup(100, AlignmentPolicy::Sector);
        let mut label = DosLabel::new(&topology, None).unwrap();
        label
            .add(&PartitionSpec::new().start(10).size(50).kind(PartitionKind::Extended), &resolver)
            .unwrap();
        label.add(&linux(20, 30), &resolver).unwrap();
        assert!(matches!(
            label.resize(PartitionHandle(1), 30, &resolver),
            Err(Error::OutOfBounds { start: 20, end: 49, .. })
        ));
        label.resize(PartitionHandle(1), 80, &resolver).unwrap();
        label.resize(PartitionHandle(5), 70, &resolver).unwrap();
        assert_eq!(label.partition(PartitionHandle(5)).unwrap().end(), 89);
        assert!(label.resize(PartitionHandle(5), 71, &resolver).is_err());
        assert!(label.verify(&resolver).is_ok());
    }

    #[test]
    fn flags_and_types() {
        let (_, topology, resolver) = setup(100, AlignmentPolicy::Sector);
        let mut label = DosLabel::new(&topology, None).unwrap();
        let h = label
            .add(&linux(1, 10).parttype(PartitionType::Dos(0x0c)), &resolver)
            .unwrap();
        label
            .set_flags(h, PartitionFlags::HIDDEN | PartitionFlags::BOOTABLE)
            .unwrap();
        assert_eq!(label.header.partitions[0].sys, 0x1c);
        let p = label.partition(h).unwrap();
        assert_eq!(p.flags, PartitionFlags::HIDDEN | PartitionFlags::BOOTABLE);
        label.set_flags(h, PartitionFlags::empty()).unwrap();
        assert_eq!(label.header.partitions[0].sys, 0x0c);

        label.set_type(h, PartitionType::Dos(0x83)).unwrap();
        assert!(label.set_flags(h, PartitionFlags::HIDDEN).is_err());
        assert!(label.set_type(h, PartitionType::Dos(0)).is_err());
        assert!(label.set_type(h, PartitionType::Sun(3)).is_err());
        assert!(matches!(
            label.set_name(h, "boot"),
            Err(Error::Unsupported(_))
        ));

        let ext = label
            .add(&PartitionSpec::new().start(20).kind(PartitionKind::Extended), &resolver)
            .unwrap();
        label.add(&linux(30, 10), &resolver).unwrap();
        assert!(label.set_type(h, PartitionType::Dos(0x05)).is_err());
        assert!(label.set_type(ext, PartitionType::Dos(0x83)).is_err());
        assert!(label.set_type(PartitionHandle(5), PartitionType::Dos(0x0f)).is_err());
        label.set_type(ext, PartitionType::Dos(0x05)).unwrap();
    }

    #[test]
    fn chs_addresses_follow_the_geometry() {
        let geometry = Geometry::new(6, 3, 3);
        let topology = Topology::new(54, 512);
        let config = Config::default()
            .with_geometry(geometry)
            .with_alignment(AlignmentPolicy::Cylinder);
        let resolver = Resolver::new(&topology, &config).unwrap().with_bounds(1, 53);
        assert_eq!(resolver.unit(), 9);

        let mut label = DosLabel::new(&topology, Some(geometry)).unwrap();
        label
            .add(&PartitionSpec::new().start(9).kind(PartitionKind::Extended), &resolver)
            .unwrap();
        let entry = label.header.partitions[0];
        assert_eq!(entry.first_chs, CHS::new(1, 0, 1));
        assert_eq!(entry.last_chs, CHS::new(5, 2, 3));

        label.add(&linux(18, 9), &resolver).unwrap();
        let l = &label.logical_partitions[0];
        assert_eq!(l.ebr_lba, 9);
        assert_eq!(l.partition.first_chs, CHS::new(2, 0, 1));
        assert_eq!(l.partition.last_chs, CHS::new(2, 2, 3));

        label.add(&linux(36, 18), &resolver).unwrap();
        let l = &label.logical_partitions[1];
        assert_eq!(l.ebr_lba, 27);
        let link = l.link.unwrap();
        assert_eq!(link.first_chs, CHS::new(3, 0, 1));
        assert_eq!(link.last_chs, CHS::new(5, 2, 3));
        assert_eq!(link.sectors, 27);
    }

    #[test]
    fn verify_rejects_overlapping_primaries() {
        let (_, topology, resolver) = setup(100, AlignmentPolicy::Sector);
        let mut label = DosLabel::new(&topology, None).unwrap();
        label.add(&linux(1, 50), &resolver).unwrap();
        label.header.partitions[1] = MBRPartitionEntry {
            sys: 0x83,
            starting_lba: 40,
            sectors: 10,
            ..MBRPartitionEntry::empty()
        };
        assert!(matches!(
            label.verify(&resolver),
            Err(Error::Overlap { .. })
        ));
    }
}

//! Label drivers.
//!
//! A label is the on-disk partition table. Each format is handled by its own driver, all of them
//! implementing [`LabelDriver`]; the [`Label`] enum holds whichever one was probed or created.

pub mod bsd;
pub mod dos;
pub mod gpt;
pub mod sgi;
pub mod sun;

use crate::config::Config;
use crate::device::{BlockDevice, BlockDeviceExt, Topology};
use crate::error::{Error, Result};
use crate::geometry::{Extent, Resolver};
use crate::partition::{Partition, PartitionFlags, PartitionHandle, PartitionSpec, PartitionType};
use crate::parttype;
use bincode::Options;
use log::debug;
use serde::{Deserialize, Serialize};
use std::fmt;

pub use self::bsd::BsdLabel;
pub use self::dos::DosLabel;
pub use self::gpt::GptLabel;
pub use self::sgi::SgiLabel;
pub use self::sun::SunLabel;

/// The on-disk partition table formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LabelKind {
    /// MS-DOS master boot record
    Dos,
    /// GUID partition table
    Gpt,
    /// BSD disklabel
    Bsd,
    /// SUN VTOC
    Sun,
    /// SGI volume header
    Sgi,
}

impl LabelKind {
    /// The name used by partitioning tools.
    pub fn name(self) -> &'static str {
        match self {
            LabelKind::Dos => "dos",
            LabelKind::Gpt => "gpt",
            LabelKind::Bsd => "bsd",
            LabelKind::Sun => "sun",
            LabelKind::Sgi => "sgi",
        }
    }
}

impl fmt::Display for LabelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// When a sector is written during a commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum WriteStage {
    /// Backup structures and EBRs: written and flushed first.
    Secondary,
    /// The structure that makes the new label visible.
    Primary,
    /// Zeroed signatures of a replaced label, once the new one is in place.
    Cleanup,
}

/// Bytes to write at an absolute offset of the device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SectorWrite {
    /// Offset in bytes
    pub offset: u64,
    /// Data to write
    pub data: Vec<u8>,
    /// Commit stage
    pub stage: WriteStage,
}

impl SectorWrite {
    /// A write at the beginning of sector `lba`.
    pub fn at_lba(lba: u64, sector_size: u64, data: Vec<u8>, stage: WriteStage) -> SectorWrite {
        SectorWrite {
            offset: lba.saturating_mul(sector_size),
            data,
            stage,
        }
    }

    /// First sector touched by the write.
    pub fn lba(&self, sector_size: u64) -> u64 {
        self.offset / sector_size
    }
}

/// What every label format provides.
///
/// Read-only formats only implement the queries, the mutations default to
/// [`Error::Unsupported`].
pub trait LabelDriver: fmt::Debug {
    /// The format of the label.
    fn kind(&self) -> LabelKind;

    /// The partitions in use, sorted by partition number.
    fn partitions(&self) -> Vec<Partition>;

    /// Number of partition entries of the label.
    fn max_partitions(&self) -> usize;

    /// First and last sectors a partition may use.
    fn usable_range(&self) -> Extent;

    /// The disk identifier (DOS signature, GPT GUID...).
    fn disk_id(&self) -> Option<String> {
        None
    }

    /// The sectors to write to store this label, checksums recomputed.
    fn serialize(&self, topology: &Topology) -> Result<Vec<SectorWrite>>;

    /// Checks the label: bounds, overlaps and format consistency.
    fn verify(&self, resolver: &Resolver) -> Result<()>;

    /// Returns `true` if the label was read from a damaged copy and must be written back.
    fn needs_rewrite(&self) -> bool {
        false
    }

    /// Called after a successful commit.
    fn mark_synced(&mut self) {}

    /// Looks up a partition by number.
    fn partition(&self, handle: PartitionHandle) -> Option<Partition> {
        self.partitions().into_iter().find(|x| x.handle == handle)
    }

    /// Adds a partition.
    fn add(&mut self, _spec: &PartitionSpec, _resolver: &Resolver) -> Result<PartitionHandle> {
        Err(Error::Unsupported("adding partitions"))
    }

    /// Removes a partition.
    fn remove(&mut self, _handle: PartitionHandle) -> Result<Partition> {
        Err(Error::Unsupported("removing partitions"))
    }

    /// Changes the size of a partition, keeping its start.
    fn resize(&mut self, _handle: PartitionHandle, _size: u64, _resolver: &Resolver) -> Result<()> {
        Err(Error::Unsupported("resizing partitions"))
    }

    /// Changes the type of a partition.
    fn set_type(&mut self, _handle: PartitionHandle, _parttype: PartitionType) -> Result<()> {
        Err(Error::Unsupported("changing partition types"))
    }

    /// Replaces the flags of a partition.
    fn set_flags(&mut self, _handle: PartitionHandle, _flags: PartitionFlags) -> Result<()> {
        Err(Error::Unsupported("changing partition flags"))
    }

    /// Renames a partition.
    fn set_name(&mut self, _handle: PartitionHandle, _name: &str) -> Result<()> {
        Err(Error::Unsupported("partition names"))
    }
}

/// A partition table of any supported format.
#[derive(Debug, Clone, PartialEq)]
pub enum Label {
    /// DOS / MBR
    Dos(DosLabel),
    /// GPT
    Gpt(GptLabel),
    /// BSD
    Bsd(BsdLabel),
    /// SUN
    Sun(SunLabel),
    /// SGI
    Sgi(SgiLabel),
}

/// Sector 0 signature of DOS and protective MBRs.
pub(crate) const BOOT_SIGNATURE: [u8; 2] = [0x55, 0xaa];

impl Label {
    /// The driver of the label.
    pub fn driver(&self) -> &dyn LabelDriver {
        match self {
            Label::Dos(x) => x,
            Label::Gpt(x) => x,
            Label::Bsd(x) => x,
            Label::Sun(x) => x,
            Label::Sgi(x) => x,
        }
    }

    /// The driver of the label, mutably.
    pub fn driver_mut(&mut self) -> &mut dyn LabelDriver {
        match self {
            Label::Dos(x) => x,
            Label::Gpt(x) => x,
            Label::Bsd(x) => x,
            Label::Sun(x) => x,
            Label::Sgi(x) => x,
        }
    }

    /// The format of the label.
    pub fn kind(&self) -> LabelKind {
        self.driver().kind()
    }

    /// Detects the label format from the first two sectors of a device.
    ///
    /// Returns `Ok(None)` for a blank first sector.
    ///
    /// # Errors
    ///
    /// A non-blank first sector without any known signature, or a SUN label with a bad checksum,
    /// is reported as [`Error::CorruptLabel`].
    pub fn probe(first_sectors: &[u8], sector_size: u64) -> Result<Option<LabelKind>> {
        let ss = sector_size as usize;
        if first_sectors.len() < 512 {
            return Err(Error::invalid("probing needs at least one full sector"));
        }
        let sector0 = &first_sectors[..512];

        if sgi::has_magic(sector0) {
            debug!("probe: SGI volume header magic found");
            return Ok(Some(LabelKind::Sgi));
        }

        if sun::has_magic(sector0) {
            debug!("probe: SUN label magic found");
            if !sun::checksum_ok(sector0) {
                return Err(Error::corrupt(LabelKind::Sun, "bad checksum"));
            }
            return Ok(Some(LabelKind::Sun));
        }

        if sector0[510..512] == BOOT_SIGNATURE {
            let protective =
                (0..4).any(|i| sector0[446 + i * 16 + 4] == parttype::DOS_GPT_PROTECTIVE);
            debug!("probe: boot signature found (protective: {})", protective);
            return Ok(Some(if protective {
                LabelKind::Gpt
            } else {
                LabelKind::Dos
            }));
        }

        if first_sectors.len() >= ss + 512 && bsd::find_label(&first_sectors[ss..]).is_some() {
            debug!("probe: BSD disklabel magic found");
            return Ok(Some(LabelKind::Bsd));
        }

        if first_sectors[..ss.min(first_sectors.len())].iter().all(|&x| x == 0) {
            return Ok(None);
        }

        Err(Error::corrupt(LabelKind::Dos, "missing boot signature"))
    }

    /// Probes and parses the label of a device.
    ///
    /// # Errors
    ///
    /// [`Error::NotRecognized`] when the device carries no label at all.
    pub fn parse<D>(dev: &mut D, topology: &Topology, config: &Config) -> Result<Label>
    where
        D: BlockDevice + ?Sized,
    {
        let ss = topology.logical_sector_size;
        let count = 2.min(topology.total_sectors);
        let first_sectors = dev.read_sectors(0, count, ss)?;

        let label = match Label::probe(&first_sectors, ss)? {
            None => return Err(Error::NotRecognized),
            Some(LabelKind::Dos) => {
                Label::Dos(DosLabel::read_from(dev, topology, config.valid_geometry())?)
            }
            Some(LabelKind::Gpt) => Label::Gpt(GptLabel::read_from(dev, topology)?),
            Some(LabelKind::Bsd) => Label::Bsd(BsdLabel::read_from(dev, topology)?),
            Some(LabelKind::Sun) => Label::Sun(SunLabel::read_from(dev, topology)?),
            Some(LabelKind::Sgi) => Label::Sgi(SgiLabel::read_from(dev, topology)?),
        };
        Ok(label)
    }

    /// Creates an empty label for the device.
    ///
    /// # Errors
    ///
    /// Only DOS and GPT labels can be created.
    pub fn create(kind: LabelKind, topology: &Topology, config: &Config) -> Result<Label> {
        match kind {
            LabelKind::Dos => Ok(Label::Dos(DosLabel::new(topology, config.valid_geometry())?)),
            LabelKind::Gpt => Ok(Label::Gpt(GptLabel::new(topology, config.gpt_entries)?)),
            LabelKind::Bsd | LabelKind::Sun | LabelKind::Sgi => {
                Err(Error::Unsupported("creating this kind of label"))
            }
        }
    }
}

/// Encoding of the big-endian formats (SUN and SGI).
pub(crate) fn big_endian() -> impl Options {
    bincode::DefaultOptions::new()
        .with_big_endian()
        .with_fixint_encoding()
        .allow_trailing_bytes()
}

/// A random 32-bit identifier.
pub(crate) fn random_id() -> [u8; 4] {
    let bytes = uuid::Uuid::new_v4().into_bytes();
    [bytes[0], bytes[1], bytes[2], bytes[3]]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn probe_blank_and_garbage() {
        let blank = vec![0; 1024];
        assert_eq!(Label::probe(&blank, 512).unwrap(), None);

        let mut garbage = vec![0; 1024];
        garbage[100] = 0x42;
        assert!(matches!(
            Label::probe(&garbage, 512),
            Err(Error::CorruptLabel {
                label: LabelKind::Dos,
                ..
            })
        ));
        assert!(Label::probe(&[0; 16], 512).is_err());
    }

    #[test]
    fn probe_mbr_and_protective_mbr() {
        let mut sectors = vec![0; 1024];
        sectors[510] = 0x55;
        sectors[511] = 0xaa;
        assert_eq!(Label::probe(&sectors, 512).unwrap(), Some(LabelKind::Dos));
        sectors[446 + 16 + 4] = 0xee;
        assert_eq!(Label::probe(&sectors, 512).unwrap(), Some(LabelKind::Gpt));
    }

    #[test]
    fn labels_that_cannot_be_created() {
        let topology = Topology::new(2048, 512);
        assert!(matches!(
            Label::create(LabelKind::Sun, &topology, &Config::default()),
            Err(Error::Unsupported(_))
        ));
        let label = Label::create(LabelKind::Dos, &topology, &Config::default()).unwrap();
        assert_eq!(label.kind(), LabelKind::Dos);
        assert_eq!(label.kind().to_string(), "dos");
    }

    #[test]
    fn parse_blank_device() {
        let mut dev = crate::device::MemDevice::with_sectors(64, 512);
        let topology = Topology::new(64, 512);
        assert!(matches!(
            Label::parse(&mut dev, &topology, &Config::default()),
            Err(Error::NotRecognized)
        ));
    }
}

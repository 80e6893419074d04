//! The label-independent partition model.

use crate::geometry::Extent;
use crate::parttype;
use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

bitflags! {
    /// Flags a partition can carry, whatever the label format.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct PartitionFlags: u32 {
        /// Legacy bootable / active partition
        const BOOTABLE = 1;
        /// Hidden from operating systems
        const HIDDEN = 1 << 1;
    }
}

/// Partition number, starting at 1.
///
/// For DOS labels, primary partitions are numbered 1 to 4 and logical partitions from 5.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PartitionHandle(pub usize);

impl PartitionHandle {
    /// The partition number.
    pub fn number(self) -> usize {
        self.0
    }

    /// Zero-based index.
    pub(crate) fn index(self) -> Option<usize> {
        self.0.checked_sub(1)
    }
}

impl fmt::Display for PartitionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Role of a partition in its table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PartitionKind {
    /// A regular partition
    #[default]
    Primary,
    /// A DOS container for logical partitions
    Extended,
    /// A DOS partition nested inside the extended partition
    Logical,
}

/// A partition type, in the representation of its label format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PartitionType {
    /// DOS system indicator
    Dos(u8),
    /// GPT partition type GUID
    Gpt(Uuid),
    /// BSD filesystem type
    Bsd(u8),
    /// SUN partition tag
    Sun(u16),
    /// SGI partition type
    Sgi(u32),
}

impl PartitionType {
    /// Human readable name, `None` for unknown types.
    pub fn name(&self) -> Option<&'static str> {
        match self {
            PartitionType::Dos(x) => parttype::dos_name(*x),
            PartitionType::Gpt(x) => parttype::gpt_name(x),
            PartitionType::Bsd(x) => parttype::bsd_name(*x),
            PartitionType::Sun(x) => parttype::sun_name(*x),
            PartitionType::Sgi(x) => parttype::sgi_name(*x),
        }
    }

    /// The numeric code of the type (not available for GPT).
    pub fn code(&self) -> Option<u32> {
        match *self {
            PartitionType::Dos(x) | PartitionType::Bsd(x) => Some(u32::from(x)),
            PartitionType::Sun(x) => Some(u32::from(x)),
            PartitionType::Sgi(x) => Some(x),
            PartitionType::Gpt(_) => None,
        }
    }

    /// Returns `true` for DOS extended containers.
    pub fn is_extended(&self) -> bool {
        matches!(self, PartitionType::Dos(x) if parttype::is_dos_extended(*x))
    }
}

impl fmt::Display for PartitionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PartitionType::Dos(x) | PartitionType::Bsd(x) => write!(f, "{:x}", x),
            PartitionType::Sun(x) => write!(f, "{:x}", x),
            PartitionType::Sgi(x) => write!(f, "{:x}", x),
            PartitionType::Gpt(x) => write!(f, "{}", x.hyphenated()),
        }
    }
}

/// A partition as exposed by a label driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Partition {
    /// Partition number
    pub handle: PartitionHandle,
    /// First sector
    pub start: u64,
    /// Number of sectors
    pub size: u64,
    /// Partition type
    pub parttype: PartitionType,
    /// Role in the table
    pub kind: PartitionKind,
    /// Flags
    pub flags: PartitionFlags,
    /// Partition name (GPT only)
    pub name: Option<String>,
    /// Unique partition GUID (GPT only)
    pub uuid: Option<Uuid>,
}

impl Partition {
    /// Last sector of the partition (inclusive).
    pub fn end(&self) -> u64 {
        self.extent().end()
    }

    /// The sectors covered by the partition.
    pub fn extent(&self) -> Extent {
        Extent::new(self.start, self.size)
    }

    /// Returns `true` for bootable partitions.
    pub fn is_bootable(&self) -> bool {
        self.flags.contains(PartitionFlags::BOOTABLE)
    }

    /// Returns `true` for DOS extended containers.
    pub fn is_container(&self) -> bool {
        self.kind == PartitionKind::Extended
    }

    /// Renders one field of the partition, see [`Field`].
    pub fn to_field_string(
        &self,
        field: Field,
        device_name: Option<&str>,
        sector_size: u64,
    ) -> String {
        match field {
            Field::Partno => self.handle.to_string(),
            Field::Device => device_name
                .map(|dev| partition_device_path(dev, self.handle.number()))
                .unwrap_or_default(),
            Field::Start => self.start.to_string(),
            Field::End => self.end().to_string(),
            Field::Sectors => self.size.to_string(),
            Field::Size => human_size(self.size.saturating_mul(sector_size)),
            Field::Type => self
                .parttype
                .name()
                .map(str::to_string)
                .unwrap_or_else(|| "unknown".to_string()),
            Field::TypeId => self.parttype.to_string(),
            Field::Name => self.name.clone().unwrap_or_default(),
            Field::Uuid => self.uuid.map(|x| x.to_string()).unwrap_or_default(),
            Field::Boot => {
                if self.is_bootable() {
                    "*".to_string()
                } else {
                    String::new()
                }
            }
            Field::Attrs => {
                let mut attrs = Vec::new();
                if self.is_bootable() {
                    attrs.push("boot");
                }
                if self.flags.contains(PartitionFlags::HIDDEN) {
                    attrs.push("hidden");
                }
                attrs.join(",")
            }
        }
    }
}

/// What the caller asks for when adding a partition.
///
/// Every field is optional: without a start the partition goes to the first free aligned place,
/// without a size it takes the rest of the free region.
///
/// # Examples
///
/// ```
/// use fdiskman::{PartitionSpec, PartitionType};
///
/// let spec = PartitionSpec::new()
///     .start(2048)
///     .size(204_800)
///     .parttype(PartitionType::Dos(0x83));
/// assert_eq!(spec.start, Some(2048));
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PartitionSpec {
    /// First sector
    pub start: Option<u64>,
    /// Number of sectors
    pub size: Option<u64>,
    /// Partition type (label default when `None`)
    pub parttype: Option<PartitionType>,
    /// Role in the table (deduced from the type and the position when `None`)
    pub kind: Option<PartitionKind>,
    /// Requested partition number
    pub partno: Option<PartitionHandle>,
    /// Flags
    pub flags: PartitionFlags,
    /// Partition name (GPT)
    pub name: Option<String>,
    /// Unique partition GUID (GPT, random when `None`)
    pub uuid: Option<Uuid>,
    /// Keep the start as given even if it is not aligned
    pub unaligned: bool,
}

impl PartitionSpec {
    /// An empty specification.
    pub fn new() -> PartitionSpec {
        PartitionSpec::default()
    }

    /// Sets the first sector.
    pub fn start(mut self, start: u64) -> PartitionSpec {
        self.start = Some(start);
        self
    }

    /// Sets the size in sectors.
    pub fn size(mut self, size: u64) -> PartitionSpec {
        self.size = Some(size);
        self
    }

    /// Sets the partition type.
    pub fn parttype(mut self, parttype: PartitionType) -> PartitionSpec {
        self.parttype = Some(parttype);
        self
    }

    /// Sets the kind of partition.
    pub fn kind(mut self, kind: PartitionKind) -> PartitionSpec {
        self.kind = Some(kind);
        self
    }

    /// Requests a partition number.
    pub fn partno(mut self, partno: usize) -> PartitionSpec {
        self.partno = Some(PartitionHandle(partno));
        self
    }

    /// Sets the flags.
    pub fn flags(mut self, flags: PartitionFlags) -> PartitionSpec {
        self.flags = flags;
        self
    }

    /// Sets the name.
    pub fn name(mut self, name: impl Into<String>) -> PartitionSpec {
        self.name = Some(name.into());
        self
    }

    /// Sets the unique GUID.
    pub fn uuid(mut self, uuid: Uuid) -> PartitionSpec {
        self.uuid = Some(uuid);
        self
    }

    /// Keeps the start sector unaligned.
    pub fn unaligned(mut self) -> PartitionSpec {
        self.unaligned = true;
        self
    }
}

/// Columns of the partition listing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Field {
    /// Partition number
    Partno,
    /// Device path of the partition
    Device,
    /// First sector
    Start,
    /// Last sector
    End,
    /// Number of sectors
    Sectors,
    /// Human readable size
    Size,
    /// Type name
    Type,
    /// Type code or GUID
    TypeId,
    /// Partition name
    Name,
    /// Partition GUID
    Uuid,
    /// `*` for bootable partitions
    Boot,
    /// Flags as a comma separated list
    Attrs,
}

/// The path of partition `partno` of the disk `device`: `/dev/sda` gives `/dev/sda1`,
/// `/dev/nvme0n1` gives `/dev/nvme0n1p1`.
pub fn partition_device_path(device: &str, partno: usize) -> String {
    if device.ends_with(|c: char| c.is_ascii_digit()) {
        format!("{}p{}", device, partno)
    } else {
        format!("{}{}", device, partno)
    }
}

/// Formats a size in bytes with a binary unit: `512B`, `100M`, `1.5G`.
pub fn human_size(bytes: u64) -> String {
    const UNITS: [&str; 7] = ["B", "K", "M", "G", "T", "P", "E"];

    let mut unit = 0;
    let mut whole = bytes;
    let mut rem = 0;
    while whole >= 1024 && unit < UNITS.len() - 1 {
        rem = whole % 1024;
        whole /= 1024;
        unit += 1;
    }

    // one decimal, rounded
    let mut tenth = (rem * 10 + 512) / 1024;
    if tenth == 10 {
        whole += 1;
        tenth = 0;
    }
    if tenth == 0 {
        format!("{}{}", whole, UNITS[unit])
    } else {
        format!("{}.{}{}", whole, tenth, UNITS[unit])
    }
}

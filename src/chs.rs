//! Legacy cylinder/head/sector addressing.
//!
//! Only the DOS label still stores CHS addresses. Modern systems ignore them but some firmwares
//! still look at them, so they are kept exactly as read and only recomputed when a [`Geometry`]
//! is configured.

use crate::error::{Error, Result};
use bitvec::prelude::*;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Highest cylinder number representable in an MBR entry.
pub const MAX_CYLINDER: u16 = 1023;

/// A legacy disk geometry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Geometry {
    /// Number of cylinders
    pub cylinders: u16,
    /// Number of heads
    pub heads: u8,
    /// Number of sectors per track
    pub sectors: u8,
}

impl Geometry {
    /// Creates a geometry. The values are not checked, see [`Geometry::is_valid`].
    pub fn new(cylinders: u16, heads: u8, sectors: u8) -> Geometry {
        Geometry {
            cylinders,
            heads,
            sectors,
        }
    }

    /// Returns the geometry most tools fake for a disk of `total_sectors`: 255 heads and 63
    /// sectors per track, as many cylinders as possible.
    pub fn guess(total_sectors: u64) -> Geometry {
        let cylinder_size = 255 * 63;
        let cylinders = (total_sectors / cylinder_size).clamp(1, u64::from(u16::MAX));
        Geometry::new(cylinders as u16, 255, 63)
    }

    /// Size of a cylinder in sectors.
    pub fn cylinder_size(&self) -> u64 {
        u64::from(self.heads) * u64::from(self.sectors)
    }

    /// The heads and sectors must be greater than zero, there are at most 63 sectors per track.
    pub fn is_valid(&self) -> bool {
        self.cylinders > 0 && self.heads > 0 && self.sectors > 0 && self.sectors <= 63
    }
}

/// A CHS address (cylinder/head/sector)
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub struct CHS {
    /// Cylinder
    pub cylinder: u16,
    /// Head
    pub head: u8,
    /// Sector
    pub sector: u8,
}

impl CHS {
    /// Creates a new CHS address. The values are not checked.
    pub fn new(cylinder: u16, head: u8, sector: u8) -> CHS {
        CHS {
            cylinder,
            head,
            sector,
        }
    }

    /// Creates an empty CHS addressing (0/0/0).
    ///
    /// # Remark
    ///
    /// This is what you need on recent hardware because CHS is never used.
    pub fn empty() -> CHS {
        CHS::default()
    }

    /// The largest address an MBR entry can hold (1023/254/63).
    pub fn max() -> CHS {
        CHS::new(MAX_CYLINDER, 254, 63)
    }

    /// Computes the CHS address of `lba` for the given geometry.
    ///
    /// # Errors
    ///
    /// Addresses beyond cylinder 1023 cannot be represented, addresses beyond the last cylinder
    /// of the geometry do not exist.
    pub fn from_lba_exact(lba: u64, geometry: Geometry) -> Result<CHS> {
        if !geometry.is_valid() {
            return Err(Error::invalid("invalid disk geometry"));
        }
        let sectors = u64::from(geometry.sectors);
        let cylinder = lba / geometry.cylinder_size();
        let rem = lba % geometry.cylinder_size();

        if cylinder > u64::from(MAX_CYLINDER) {
            return Err(Error::LBAExceedsMaximumCHS);
        }
        if cylinder > u64::from(geometry.cylinders) {
            return Err(Error::LBAExceedsMaximumCylinders);
        }

        // sectors are numbered from 1
        Ok(CHS {
            cylinder: cylinder as u16,
            head: (rem / sectors) as u8,
            sector: (rem % sectors + 1) as u8,
        })
    }

    /// Same as [`CHS::from_lba_exact`] but saturates to [`CHS::max`] when the address cannot be
    /// represented. This is what partitioning tools write for partitions beyond 8 GiB.
    pub fn from_lba_clamped(lba: u64, geometry: Geometry) -> Result<CHS> {
        match CHS::from_lba_exact(lba, geometry) {
            Err(Error::LBAExceedsMaximumCHS) | Err(Error::LBAExceedsMaximumCylinders) => {
                Ok(CHS::max())
            }
            other => other,
        }
    }

    /// Creates a CHS address aligned to the nearest cylinder. It is the exact cylinder when the
    /// LBA is at the beginning of a cylinder, the next one otherwise; never the previous one.
    pub fn from_lba_aligned(lba: u64, geometry: Geometry) -> Result<CHS> {
        if !geometry.is_valid() {
            return Err(Error::invalid("invalid disk geometry"));
        }
        let cylinder = lba.div_ceil(geometry.cylinder_size());

        if cylinder > u64::from(MAX_CYLINDER) {
            return Err(Error::LBAExceedsMaximumCHS);
        }
        if cylinder > u64::from(geometry.cylinders) {
            return Err(Error::LBAExceedsMaximumCylinders);
        }

        Ok(CHS {
            cylinder: cylinder as u16,
            head: 0,
            sector: 1,
        })
    }

    /// Converts the address back to an LBA. Returns `None` for the empty address.
    pub fn to_lba(self, geometry: Geometry) -> Option<u64> {
        if self.sector == 0 {
            return None;
        }
        let heads = u64::from(geometry.heads);
        let sectors = u64::from(geometry.sectors);
        Some(
            u64::from(self.cylinder) * heads * sectors
                + u64::from(self.head) * sectors
                + u64::from(self.sector)
                - 1,
        )
    }

    /// Check if the CHS address is empty
    pub fn is_empty(self) -> bool {
        self.cylinder == 0 && self.head == 0 && self.sector == 0
    }

    /// Check if the CHS address exists in the given geometry.
    pub fn is_valid(self, geometry: Geometry) -> bool {
        self.sector > 0
            && self.sector <= geometry.sectors
            && self.head < geometry.heads
            && self.cylinder < geometry.cylinders
    }
}

// On disk: byte 0 is the head, bits 7-6 of byte 1 are bits 9-8 of the cylinder, bits 5-0 of
// byte 1 are the sector, byte 2 holds the low 8 bits of the cylinder.
impl<'de> Deserialize<'de> for CHS {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = <[u8; 3]>::deserialize(deserializer)?;
        let bits = raw.view_bits::<Msb0>();

        let mut cylinder = BitVec::<u16, Msb0>::with_capacity(10);
        cylinder.extend_from_bitslice(&bits[8..10]);
        cylinder.extend_from_bitslice(&bits[16..24]);

        Ok(CHS {
            cylinder: cylinder.load_be::<u16>(),
            head: bits[0..8].load_be::<u8>(),
            sector: bits[10..16].load_be::<u8>(),
        })
    }
}

impl Serialize for CHS {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut raw = bitarr![u8, Msb0; 0; 24];
        raw[0..8].store_be::<u8>(self.head);
        raw[8..10].store_be::<u8>(((self.cylinder >> 8) & 0x03) as u8);
        raw[10..16].store_be::<u8>(self.sector & 0x3f);
        raw[16..24].store_be::<u8>((self.cylinder & 0xff) as u8);

        raw.into_inner().serialize(serializer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deserialize_maximum_chs_value() {
        let chs: CHS = bincode::deserialize(&[0xff, 0xff, 0xff]).unwrap();
        assert_eq!(chs, CHS::new(1023, 255, 63));
    }

    #[test]
    fn serialize_maximum_chs_value() {
        let out = bincode::serialize(&CHS::new(1023, 255, 63)).unwrap();
        assert_eq!(out, &[0xff, 0xff, 0xff]);
    }

    #[test]
    fn serialize_and_deserialize_some_chs_value() {
        let chs: CHS = bincode::deserialize(&[0xaa, 0xaa, 0xaa]).unwrap();
        assert_eq!(chs, CHS::new(682, 170, 42));
        let out = bincode::serialize(&chs).unwrap();
        assert_eq!(out, &[0xaa, 0xaa, 0xaa]);

        let chs: CHS = bincode::deserialize(&[0xfe, 0xff, 0xff]).unwrap();
        assert_eq!(chs, CHS::max());
        let chs: CHS = bincode::deserialize(&[0x00, 0x02, 0x00]).unwrap();
        assert_eq!(chs, CHS::new(0, 0, 2));
    }

    #[test]
    fn align_chs_to_cylinder() {
        let lba2c = |lba| {
            let chs = CHS::from_lba_aligned(lba, Geometry::new(100, 2, 2)).unwrap();
            assert_eq!(chs.head, 0);
            assert_eq!(chs.sector, 1);
            chs.cylinder
        };

        assert_eq!(lba2c(12), 3);
        assert_eq!(lba2c(10), 3);
        assert_eq!(lba2c(8), 2);
    }

    #[test]
    fn convert_chs_to_lba_and_back() {
        // 2484/16/63: a 1280MB disk
        let geometry = Geometry::new(2484, 16, 63);
        let chs = CHS::from_lba_exact(666_666, geometry).unwrap();
        assert_eq!(chs.to_lba(geometry), Some(666_666));

        let chs = CHS::from_lba_aligned(666_666, geometry).unwrap();
        assert_eq!(chs.to_lba(geometry), Some(667_296));

        let chs = CHS::from_lba_exact(667_296, geometry).unwrap();
        assert_eq!(chs.head, 0);
        assert_eq!(chs.sector, 1);
        assert!(chs.is_valid(geometry));
        assert_eq!(CHS::empty().to_lba(geometry), None);
    }

    #[test]
    fn addresses_beyond_the_chs_limit() {
        let geometry = Geometry::guess(100_000_000);
        assert_eq!(geometry.heads, 255);
        assert_eq!(geometry.sectors, 63);
        assert!(matches!(
            CHS::from_lba_exact(50_000_000, geometry),
            Err(Error::LBAExceedsMaximumCHS)
        ));
        assert_eq!(
            CHS::from_lba_clamped(50_000_000, geometry).unwrap(),
            CHS::max()
        );

        let small = Geometry::new(10, 2, 3);
        assert!(matches!(
            CHS::from_lba_exact(100, small),
            Err(Error::LBAExceedsMaximumCylinders)
        ));
        assert!(CHS::from_lba_exact(1, Geometry::new(0, 0, 0)).is_err());
    }
}

//! Geometry and alignment resolver.
//!
//! Every start sector handed to a label driver goes through a [`Resolver`]: it knows the
//! alignment unit of the device, the usable range of the label, and checks that a new extent
//! neither leaves that range nor overlaps an existing partition.

use crate::config::Config;
use crate::device::Topology;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};

/// Default alignment when the device reports no I/O hint.
pub const DEFAULT_ALIGNMENT_BYTES: u64 = 1024 * 1024;

/// How the start of new partitions is aligned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AlignmentPolicy {
    /// Use the optimal I/O size of the device, or 1 MiB when unknown.
    #[default]
    Auto,
    /// Align on cylinder boundaries of the configured geometry.
    Cylinder,
    /// Align on physical sectors only.
    Sector,
    /// Align on a fixed number of logical sectors.
    Custom(u64),
}

/// A contiguous range of sectors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Extent {
    /// First sector
    pub start: u64,
    /// Number of sectors
    pub size: u64,
}

impl Extent {
    /// Creates an extent.
    pub fn new(start: u64, size: u64) -> Extent {
        Extent { start, size }
    }

    /// Creates the extent covering `start..=end`.
    pub fn from_bounds(start: u64, end: u64) -> Extent {
        Extent {
            start,
            size: end.saturating_sub(start) + 1,
        }
    }

    /// Last sector of the extent (inclusive), `None` if it overflows or the extent is empty.
    pub fn checked_end(&self) -> Option<u64> {
        self.size.checked_sub(1)?.checked_add(self.start)
    }

    /// Last sector of the extent (inclusive).
    pub fn end(&self) -> u64 {
        self.start.saturating_add(self.size.saturating_sub(1))
    }

    /// Returns `true` if `lba` belongs to the extent.
    pub fn contains(&self, lba: u64) -> bool {
        self.size > 0 && lba >= self.start && lba <= self.end()
    }

    /// Returns `true` if the two extents share at least one sector.
    pub fn overlaps(&self, other: &Extent) -> bool {
        self.size > 0 && other.size > 0 && self.start <= other.end() && other.start <= self.end()
    }

    /// Returns `true` if `other` lies entirely inside `self`.
    pub fn encloses(&self, other: &Extent) -> bool {
        other.size > 0 && self.contains(other.start) && self.contains(other.end())
    }
}

// distance from `v` down to the previous sector congruent to `offset` modulo `unit`
#[inline]
fn misalignment(v: u64, unit: u64, offset: u64) -> u64 {
    let rem = v % unit;
    let offset = offset % unit;
    if rem >= offset {
        rem - offset
    } else {
        unit - (offset - rem)
    }
}

#[inline]
fn align_up(v: u64, unit: u64, offset: u64) -> u64 {
    match misalignment(v, unit, offset) {
        0 => v,
        rem => v.saturating_add(unit - rem),
    }
}

#[inline]
fn align_down(v: u64, unit: u64, offset: u64) -> u64 {
    v - misalignment(v, unit, offset).min(v)
}

/// Computes aligned positions and validates sector ranges.
///
/// A resolver is cheap to copy; label drivers narrow its bounds with [`Resolver::with_bounds`]
/// (for example to the inside of a DOS extended partition).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Resolver {
    unit: u64,
    physical_unit: u64,
    offset: u64,
    first: u64,
    last: u64,
}

impl Resolver {
    /// Creates a resolver for the whole device.
    ///
    /// # Errors
    ///
    /// The cylinder policy needs a valid geometry in the configuration. A custom unit cannot be
    /// zero or larger than the device.
    pub fn new(topology: &Topology, config: &Config) -> Result<Resolver> {
        let ss = topology.logical_sector_size;
        let physical_unit = (topology.physical_sector_size / ss).max(1);

        let unit = match config.alignment {
            AlignmentPolicy::Auto => {
                let bytes = if topology.optimal_io_size > 0 {
                    topology.optimal_io_size.max(topology.physical_sector_size)
                } else {
                    DEFAULT_ALIGNMENT_BYTES
                };
                let unit = (bytes / ss).max(physical_unit);
                if unit.saturating_mul(2) > topology.total_sectors {
                    physical_unit
                } else {
                    unit
                }
            }
            AlignmentPolicy::Cylinder => config
                .valid_geometry()
                .ok_or_else(|| Error::invalid("cylinder alignment requires a disk geometry"))?
                .cylinder_size(),
            AlignmentPolicy::Sector => physical_unit,
            AlignmentPolicy::Custom(0) => {
                return Err(Error::invalid("alignment unit cannot be zero"))
            }
            AlignmentPolicy::Custom(n) if n > topology.total_sectors => {
                return Err(Error::invalid(format!(
                    "alignment unit of {} sectors is larger than the device",
                    n
                )))
            }
            AlignmentPolicy::Custom(n) => n,
        };

        Ok(Resolver {
            unit,
            physical_unit,
            offset: topology.alignment_offset / ss,
            first: 0,
            last: topology.last_lba(),
        })
    }

    /// Returns a copy restricted to `first..=last`.
    pub fn with_bounds(&self, first: u64, last: u64) -> Resolver {
        Resolver {
            first,
            last,
            ..*self
        }
    }

    /// Alignment unit in sectors.
    pub fn unit(&self) -> u64 {
        self.unit
    }

    /// Physical sector size in logical sectors.
    pub fn physical_unit(&self) -> u64 {
        self.physical_unit
    }

    /// First sector of the usable range.
    pub fn first(&self) -> u64 {
        self.first
    }

    /// Last sector of the usable range.
    pub fn last(&self) -> u64 {
        self.last
    }

    /// The usable range as an extent.
    pub fn usable(&self) -> Extent {
        Extent::from_bounds(self.first, self.last)
    }

    /// Smallest aligned sector greater than or equal to `lba`, whatever the size of the partition
    /// starting there.
    pub fn align(&self, lba: u64) -> u64 {
        align_up(lba, self.unit, self.offset)
    }

    /// Greatest aligned sector lower than or equal to `lba`.
    pub fn align_down(&self, lba: u64) -> u64 {
        align_down(lba, self.unit, self.offset)
    }

    /// Returns `true` if `lba` sits on an alignment boundary.
    pub fn is_aligned(&self, lba: u64) -> bool {
        align_up(lba, self.unit, self.offset) == lba
    }

    /// Checks that `extent` lies inside the usable range.
    pub fn check_bounds(&self, extent: &Extent) -> Result<()> {
        if extent.size == 0 {
            return Err(Error::invalid("a partition cannot be empty"));
        }
        let end = extent.checked_end().ok_or(Error::OutOfBounds {
            start: extent.start,
            end: u64::MAX,
            first: self.first,
            last: self.last,
        })?;
        if extent.start < self.first || end > self.last {
            return Err(Error::OutOfBounds {
                start: extent.start,
                end,
                first: self.first,
                last: self.last,
            });
        }
        Ok(())
    }

    /// Checks that `extent` is in bounds and shares no sector with `existing`.
    pub fn validate_range(&self, extent: &Extent, existing: &[Extent]) -> Result<()> {
        self.check_bounds(extent)?;
        match existing.iter().find(|x| x.overlaps(extent)) {
            Some(other) => Err(Error::Overlap {
                start: extent.start,
                end: extent.end(),
                other_start: other.start,
                other_end: other.end(),
            }),
            None => Ok(()),
        }
    }

    /// Checks that no two extents share a sector.
    ///
    /// The extents are sorted by start and swept once, keeping the furthest end seen so far so
    /// that a small extent hidden after a large one is still caught.
    pub fn check_overlaps(extents: &[Extent]) -> Result<()> {
        let mut sorted: Vec<&Extent> = extents.iter().filter(|x| x.size > 0).collect();
        if sorted.len() <= 1 {
            return Ok(());
        }
        sorted.sort_unstable_by_key(|x| (x.start, x.size));

        let mut furthest = sorted[0];
        for &curr in &sorted[1..] {
            if curr.start <= furthest.end() {
                return Err(Error::Overlap {
                    start: curr.start,
                    end: curr.end(),
                    other_start: furthest.start,
                    other_end: furthest.end(),
                });
            }
            if curr.end() > furthest.end() {
                furthest = curr;
            }
        }
        Ok(())
    }

    /// Unaligned free ranges of the usable range, not covered by `used`. Nested or overlapping
    /// extents in `used` are fine.
    pub fn gaps(&self, used: &[Extent]) -> Vec<Extent> {
        let mut used: Vec<&Extent> = used.iter().filter(|x| x.size > 0).collect();
        used.sort_unstable_by_key(|x| x.start);

        let mut gaps = Vec::new();
        let mut cursor = self.first;
        for e in used {
            if cursor > self.last {
                return gaps;
            }
            if e.start > cursor {
                gaps.push(Extent::from_bounds(cursor, (e.start - 1).min(self.last)));
            }
            cursor = cursor.max(e.end().saturating_add(1));
        }
        if cursor <= self.last {
            gaps.push(Extent::from_bounds(cursor, self.last));
        }
        gaps
    }

    /// Free aligned regions of the usable range, not covered by `used`.
    pub fn free_regions(&self, used: &[Extent]) -> Vec<Extent> {
        self.gaps(used)
            .into_iter()
            .filter_map(|gap| {
                let start = self.align(gap.start);
                let end = gap.end();
                (start <= end).then(|| Extent::from_bounds(start, end))
            })
            .collect()
    }

    /// Resolves the position of a new partition.
    ///
    /// A given start is aligned (unless `unaligned`), a missing one is the first aligned free
    /// place large enough. A missing size extends the partition to the end of its free region.
    /// The result still has to go through [`Resolver::validate_range`].
    pub fn place(
        &self,
        start: Option<u64>,
        size: Option<u64>,
        unaligned: bool,
        used: &[Extent],
    ) -> Result<Extent> {
        let start = match start {
            Some(start) if unaligned => start,
            Some(start) => self.align(start),
            None => self
                .free_regions(used)
                .into_iter()
                .find(|x| size.map_or(true, |size| x.size >= size))
                .map(|x| x.start)
                .ok_or(Error::NoSpaceLeft)?,
        };

        let size = match size {
            Some(size) => size,
            None => {
                self.validate_range(&Extent::new(start, 1), used)?;
                self.gaps(used)
                    .into_iter()
                    .find(|x| x.contains(start))
                    .map(|x| x.end() - start + 1)
                    .ok_or(Error::NoSpaceLeft)?
            }
        };

        Ok(Extent::new(start, size))
    }

    /// The first aligned place where a partition of `size` sectors fits.
    pub fn first_place(&self, used: &[Extent], size: u64) -> Option<u64> {
        self.free_regions(used)
            .into_iter()
            .find(|x| x.size >= size)
            .map(|x| x.start)
    }

    /// The last aligned place where a partition of `size` sectors fits.
    pub fn last_place(&self, used: &[Extent], size: u64) -> Option<u64> {
        self.free_regions(used)
            .into_iter()
            .filter(|x| x.size >= size)
            .last()
            .map(|x| self.align_down(x.end() + 1 - size).max(x.start))
    }

    /// The start of the smallest free region where a partition of `size` sectors fits.
    pub fn optimal_place(&self, used: &[Extent], size: u64) -> Option<u64> {
        self.free_regions(used)
            .into_iter()
            .filter(|x| x.size >= size)
            .min_by_key(|x| x.size)
            .map(|x| x.start)
    }

    /// Size of the largest partition that could be created, rounded down to the alignment unit.
    pub fn max_partition_size(&self, used: &[Extent]) -> Option<u64> {
        self.free_regions(used)
            .into_iter()
            .map(|x| x.size / self.unit * self.unit)
            .filter(|&x| x > 0)
            .max()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MIB_SECTORS: u64 = 2048;

    fn resolver(total: u64, policy: AlignmentPolicy) -> Resolver {
        let config = Config::default().with_alignment(policy);
        Resolver::new(&Topology::new(total, 512), &config).unwrap()
    }

    #[test]
    fn auto_alignment_unit() {
        assert_eq!(resolver(204_800, AlignmentPolicy::Auto).unit(), MIB_SECTORS);
        // too small for two grains
        assert_eq!(resolver(3000, AlignmentPolicy::Auto).unit(), 1);

        let topology = Topology::new(1 << 24, 512)
            .with_physical_sector_size(4096)
            .with_io_sizes(4096, 65536);
        let r = Resolver::new(&topology, &Config::default()).unwrap();
        assert_eq!(r.unit(), 128);
        assert_eq!(r.physical_unit(), 8);
    }

    #[test]
    fn other_alignment_policies() {
        assert_eq!(resolver(1000, AlignmentPolicy::Sector).unit(), 1);
        assert_eq!(resolver(1000, AlignmentPolicy::Custom(9)).unit(), 9);
        let topology = Topology::new(1000, 512);
        let config = Config::default().with_alignment(AlignmentPolicy::Custom(0));
        assert!(Resolver::new(&topology, &config).is_err());
        let config = Config::default().with_alignment(AlignmentPolicy::Cylinder);
        assert!(Resolver::new(&topology, &config).is_err());
        let config = config.with_geometry(crate::chs::Geometry::new(100, 3, 3));
        assert_eq!(Resolver::new(&topology, &config).unwrap().unit(), 9);
    }

    #[test]
    fn align_never_goes_backward() {
        let r = resolver(204_800, AlignmentPolicy::Auto);
        for lba in [0, 1, 34, 2047, 2048, 2049, 100_000] {
            let aligned = r.align(lba);
            assert!(aligned >= lba);
            assert_eq!(aligned % r.unit(), 0);
            assert!(aligned - lba < r.unit());
            assert!(r.is_aligned(aligned));
        }
        assert_eq!(r.align(2049), 4096);
        assert_eq!(r.align_down(4095), 2048);
    }

    #[test]
    fn small_partitions_are_aligned_on_the_unit() {
        let r = resolver(262_144, AlignmentPolicy::Auto).with_bounds(1, 262_143);
        assert_eq!(r.align(100_000), 100_352);
        // below, equal to and above the unit
        for size in [8, 2000, 2048, 4096, 100_000] {
            let extent = r.place(Some(100_000), Some(size), false, &[]).unwrap();
            assert_eq!(extent.start, 100_352);
            assert_eq!(extent.start % r.unit(), 0);
        }
        let extent = r
            .place(None, Some(8), false, &[Extent::new(2048, 10)])
            .unwrap();
        assert_eq!(extent.start, 4096);
        let extent = r.place(Some(100_000), Some(8), true, &[]).unwrap();
        assert_eq!(extent.start, 100_000);
    }

    #[test]
    fn alignment_offset_is_honoured() {
        let topology = Topology::new(1 << 20, 512).with_alignment_offset(3584);
        let r = Resolver::new(&topology, &Config::default()).unwrap();
        assert_eq!(r.align(1), 7);
        assert_eq!(r.align(8), 2055);
        assert!(r.is_aligned(2055));
        assert!(!r.is_aligned(2048));
        assert_eq!(r.align_down(2054), 7);

        let topology = Topology::new(1 << 20, 512)
            .with_physical_sector_size(4096)
            .with_alignment_offset(3584);
        let r = Resolver::new(&topology, &Config::default()).unwrap();
        for lba in [0, 6, 7, 8, 2054, 2055, 2056, 99_999] {
            let aligned = r.align(lba);
            assert!(aligned >= lba);
            assert_eq!((aligned - 7) % r.unit(), 0);
            assert!(aligned - lba < r.unit());
            assert!(r.align_down(lba) <= lba);
        }
    }

    #[test]
    fn huge_custom_units() {
        let topology = Topology::new(1 << 20, 512);
        let config = Config::default().with_alignment(AlignmentPolicy::Custom(u64::MAX / 2 + 7));
        assert!(matches!(
            Resolver::new(&topology, &config),
            Err(Error::Invalid(_))
        ));
        let r = resolver(1 << 20, AlignmentPolicy::Custom(1 << 20));
        assert_eq!(r.align(1), 1 << 20);
        assert_eq!(r.align_down(u64::MAX), u64::MAX - (u64::MAX % (1 << 20)));
        assert_eq!(super::align_up(u64::MAX - 1, u64::MAX, u64::MAX - 3), u64::MAX);
        assert_eq!(super::align_down(5, u64::MAX, u64::MAX - 1), 0);
    }

    #[test]
    fn bounds_and_overlaps() {
        let r = resolver(204_800, AlignmentPolicy::Auto).with_bounds(2048, 204_799);
        assert!(matches!(
            r.check_bounds(&Extent::new(2048, 204_800)),
            Err(Error::OutOfBounds {
                start: 2048,
                end: 206_847,
                ..
            })
        ));
        assert!(r.check_bounds(&Extent::new(2048, 202_752)).is_ok());
        assert!(r.check_bounds(&Extent::new(100, 10)).is_err());
        assert!(r.check_bounds(&Extent::new(4096, 0)).is_err());
        assert!(r.check_bounds(&Extent::new(u64::MAX, 2)).is_err());

        let existing = [Extent::new(2048, 200_000)];
        assert!(matches!(
            r.validate_range(&Extent::new(100_000, 2000), &existing),
            Err(Error::Overlap {
                other_start: 2048,
                ..
            })
        ));
        // sharing the boundary sector is an overlap
        assert!(r
            .validate_range(&Extent::new(202_047, 10), &existing)
            .is_err());
        assert!(r
            .validate_range(&Extent::new(202_048, 10), &existing)
            .is_ok());
    }

    #[test]
    fn sweep_catches_nested_extents() {
        let extents = [
            Extent::new(10, 100),
            Extent::new(20, 5),
            Extent::new(50, 10),
        ];
        assert!(matches!(
            Resolver::check_overlaps(&extents),
            Err(Error::Overlap { start: 20, .. })
        ));
        let extents = [Extent::new(200, 10), Extent::new(10, 100), Extent::new(110, 5)];
        assert!(Resolver::check_overlaps(&extents).is_ok());
        let extents = [Extent::new(10, 100), Extent::new(12, 2), Extent::new(109, 5)];
        assert!(Resolver::check_overlaps(&extents).is_err());
    }

    #[test]
    fn free_space_search() {
        let r = resolver(100, AlignmentPolicy::Sector).with_bounds(1, 99);
        let used = [Extent::new(6, 89)];
        assert_eq!(
            r.free_regions(&used),
            vec![Extent::new(1, 5), Extent::new(95, 5)]
        );
        assert_eq!(r.first_place(&used, 5), Some(1));
        assert_eq!(r.last_place(&used, 5), Some(95));
        assert_eq!(r.max_partition_size(&used), Some(5));
        assert_eq!(r.first_place(&used, 6), None);

        let used = [Extent::new(11, 84)];
        assert_eq!(r.optimal_place(&used, 5), Some(95));
        assert_eq!(r.max_partition_size(&[Extent::new(1, 99)]), None);
    }

    #[test]
    fn gaps_with_nested_extents() {
        let r = resolver(100, AlignmentPolicy::Sector).with_bounds(1, 99);
        let used = [Extent::new(10, 50), Extent::new(20, 5), Extent::new(70, 40)];
        assert_eq!(r.gaps(&used), vec![Extent::new(1, 9), Extent::new(60, 10)]);
    }

    #[test]
    fn place_new_partitions() {
        let r = resolver(204_800, AlignmentPolicy::Auto).with_bounds(1, 204_799);
        let used = [Extent::new(2048, 2048)];
        assert_eq!(
            r.place(None, Some(2048), false, &used).unwrap(),
            Extent::new(4096, 2048)
        );
        assert_eq!(
            r.place(Some(5000), None, false, &used).unwrap(),
            Extent::new(6144, 198_656)
        );
        assert_eq!(
            r.place(Some(5000), Some(10), true, &used).unwrap(),
            Extent::new(5000, 10)
        );
        assert!(matches!(
            r.place(Some(3000), None, true, &used),
            Err(Error::Overlap { .. })
        ));
        assert!(matches!(
            r.place(None, Some(300_000), false, &used),
            Err(Error::NoSpaceLeft)
        ));
    }

    #[test]
    fn free_space_is_aligned() {
        let r = resolver(100, AlignmentPolicy::Custom(10)).with_bounds(1, 99);
        assert_eq!(r.free_regions(&[]), vec![Extent::new(10, 90)]);
        assert_eq!(r.max_partition_size(&[]), Some(90));
        assert_eq!(r.last_place(&[], 25), Some(70));
        let r = resolver(100, AlignmentPolicy::Custom(6)).with_bounds(1, 99);
        assert_eq!(r.max_partition_size(&[]), Some(90));
    }
}

//! Engine configuration.

use crate::chs::Geometry;
use crate::geometry::AlignmentPolicy;
use serde::{Deserialize, Serialize};

/// Default number of entries of a new GPT entry array.
pub const DEFAULT_GPT_ENTRIES: u32 = 128;

/// Options of a [`Context`](crate::Context).
///
/// The configuration is passed explicitly when the context is opened: the engine holds no global
/// state.
///
/// # Examples
///
/// ```
/// use fdiskman::{AlignmentPolicy, Config};
///
/// let config = Config::default()
///     .with_alignment(AlignmentPolicy::Sector)
///     .with_read_only(true);
/// assert!(config.read_only);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct Config {
    /// How new partitions are aligned.
    pub alignment: AlignmentPolicy,
    /// Refuse every write to the device.
    pub read_only: bool,
    /// Legacy geometry used to compute the CHS addresses of DOS entries.
    ///
    /// When `None`, edited entries get empty CHS addresses.
    pub geometry: Option<Geometry>,
    /// Number of entries of the GPT entry array created by `create_label`.
    pub gpt_entries: u32,
    /// Zero the signatures of the previous label when the label format changes.
    pub wipe_foreign_labels: bool,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            alignment: AlignmentPolicy::Auto,
            read_only: false,
            geometry: None,
            gpt_entries: DEFAULT_GPT_ENTRIES,
            wipe_foreign_labels: true,
        }
    }
}

impl Config {
    /// Sets the alignment policy.
    pub fn with_alignment(mut self, alignment: AlignmentPolicy) -> Config {
        self.alignment = alignment;
        self
    }

    /// Opens the device read-only.
    pub fn with_read_only(mut self, read_only: bool) -> Config {
        self.read_only = read_only;
        self
    }

    /// Sets the legacy geometry.
    pub fn with_geometry(mut self, geometry: Geometry) -> Config {
        self.geometry = Some(geometry);
        self
    }

    /// Sets the number of entries of new GPT labels.
    pub fn with_gpt_entries(mut self, entries: u32) -> Config {
        self.gpt_entries = entries;
        self
    }

    /// Enables or disables wiping of foreign label signatures.
    pub fn with_wipe_foreign_labels(mut self, wipe: bool) -> Config {
        self.wipe_foreign_labels = wipe;
        self
    }

    /// The geometry, if one is set and it is usable.
    pub(crate) fn valid_geometry(&self) -> Option<Geometry> {
        self.geometry.filter(Geometry::is_valid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = Config::default();
        assert_eq!(config.alignment, AlignmentPolicy::Auto);
        assert!(!config.read_only);
        assert_eq!(config.gpt_entries, 128);
        assert!(config.wipe_foreign_labels);
        assert_eq!(config.valid_geometry(), None);
    }

    #[test]
    fn builders() {
        let config = Config::default()
            .with_alignment(AlignmentPolicy::Custom(8))
            .with_geometry(Geometry::new(0, 16, 63))
            .with_gpt_entries(64)
            .with_wipe_foreign_labels(false);
        assert_eq!(config.alignment, AlignmentPolicy::Custom(8));
        assert_eq!(config.gpt_entries, 64);
        assert!(!config.wipe_foreign_labels);
        // zero cylinders is not a usable geometry
        assert_eq!(config.valid_geometry(), None);
        let config = config.with_geometry(Geometry::new(1024, 16, 63));
        assert_eq!(config.valid_geometry(), Some(Geometry::new(1024, 16, 63)));
    }
}

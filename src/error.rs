//! Errors of the partitioning engine.

use crate::label::LabelKind;
use thiserror::Error;

/// The result of probing, editing or writing a partition table.
pub type Result<T> = std::result::Result<T, Error>;

/// An error
#[derive(Debug, Error)]
pub enum Error {
    /// The device does not carry any partition table.
    ///
    /// # Remark
    ///
    /// This is not fatal: a context opened on such a device accepts `create_label()`.
    #[error("no partition table found")]
    NotRecognized,
    /// A label signature or checksum did not match.
    #[error("corrupted {label} label: {reason}")]
    CorruptLabel {
        /// The label format that failed to parse
        label: LabelKind,
        /// What exactly was wrong
        reason: String,
    },
    /// A partition range falls outside of the usable sectors of the label
    #[error("sectors {start}..={end} are out of the usable range {first}..={last}")]
    OutOfBounds {
        /// First sector of the rejected range
        start: u64,
        /// Last sector of the rejected range
        end: u64,
        /// First usable sector
        first: u64,
        /// Last usable sector
        last: u64,
    },
    /// Two partitions share at least one sector
    #[error("sectors {start}..={end} overlap with the partition at {other_start}..={other_end}")]
    Overlap {
        /// First sector of the rejected range
        start: u64,
        /// Last sector of the rejected range
        end: u64,
        /// First sector of the partition already in place
        other_start: u64,
        /// Last sector of the partition already in place
        other_end: u64,
    },
    /// All the partition entries of the label are in use
    #[error("no free partition slot left (maximum {max})")]
    NoFreeSlot {
        /// Maximum number of entries of the label
        max: usize,
    },
    /// No free region is large enough for the requested partition
    #[error("no space left")]
    NoSpaceLeft,
    /// The chain of extended boot records loops back on itself
    #[error("cyclic extended partition chain at sector {lba}")]
    CyclicExtendedChain {
        /// Absolute sector of the EBR that was reached twice
        lba: u64,
    },
    /// I/O errors, as returned by the device.
    #[error("generic I/O error")]
    Io(#[from] std::io::Error),
    /// Binary encoding or decoding of an on-disk structure failed.
    #[error("binary encoding failed")]
    Encoding(#[from] bincode::Error),
    /// The operation is not available for this label format
    #[error("operation not supported: {0}")]
    Unsupported(&'static str),
    /// An operation that required to find a partition, was unable to find that partition.
    #[error("partition not found")]
    PartitionNotFound,
    /// The context has no label loaded
    #[error("no partition table loaded")]
    NoLabel,
    /// The context was opened read-only
    #[error("the device has been opened read-only")]
    ReadOnly,
    /// Invalid request or configuration
    #[error("invalid request: {0}")]
    Invalid(String),
    /// The CHS address requested cannot be represented in CHS
    ///
    /// # Remark
    ///
    /// There is a hard limit around 8GB for CHS addressing.
    #[error("exceeded the maximum limit of CHS")]
    LBAExceedsMaximumCHS,
    /// The CHS address requested exceeds the number of cylinders in the disk
    #[error("exceeded the maximum number of cylinders on disk")]
    LBAExceedsMaximumCylinders,
}

impl Error {
    pub(crate) fn corrupt(label: LabelKind, reason: impl Into<String>) -> Error {
        Error::CorruptLabel {
            label,
            reason: reason.into(),
        }
    }

    pub(crate) fn invalid(reason: impl Into<String>) -> Error {
        Error::Invalid(reason.into())
    }

    /// Returns `true` for the errors reporting a damaged on-disk label.
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            Error::CorruptLabel { .. } | Error::CyclicExtendedChain { .. } | Error::Encoding(_)
        )
    }
}

//! Write-back engine.
//!
//! A commit turns the in-memory label into a [`Plan`]: every sector to write, tagged with its
//! stage. Secondary structures (GPT backup, EBRs) are written and flushed before the primary ones,
//! and the signatures of a replaced label are only zeroed after that, so an interrupted commit
//! leaves either the previous label or the new one readable.

use crate::device::{BlockDevice, Topology};
use crate::error::Result;
use crate::label::{Label, LabelKind, SectorWrite, WriteStage};
use crate::partition::{Partition, PartitionHandle};
use log::debug;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Where a context stands with respect to the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CommitState {
    /// The in-memory label matches the device
    #[default]
    Clean,
    /// The label has been edited since it was read or written
    Dirty,
    /// A commit is checking the label
    Validating,
    /// The last commit succeeded
    Committed,
    /// The last commit failed
    Rejected,
}

impl fmt::Display for CommitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CommitState::Clean => "clean",
            CommitState::Dirty => "dirty",
            CommitState::Validating => "validating",
            CommitState::Committed => "committed",
            CommitState::Rejected => "rejected",
        };
        f.write_str(s)
    }
}

/// Sectors holding the signature of a label format.
fn signature_sectors(kind: LabelKind, topology: &Topology) -> Vec<u64> {
    match kind {
        LabelKind::Gpt => vec![1, topology.last_lba()],
        LabelKind::Bsd => vec![1],
        // sector 0 is rewritten by every label
        LabelKind::Dos | LabelKind::Sun | LabelKind::Sgi => Vec::new(),
    }
}

/// The writes of a commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Plan {
    writes: Vec<SectorWrite>,
}

impl Plan {
    /// Serializes `label`. When `replaced` is another format, its signatures are zeroed in the
    /// cleanup stage, unless the new label writes over them anyway.
    pub fn new(label: &Label, replaced: Option<LabelKind>, topology: &Topology) -> Result<Plan> {
        let ss = topology.logical_sector_size;
        let mut writes = label.driver().serialize(topology)?;

        if let Some(old) = replaced.filter(|&x| x != label.kind()) {
            let offsets: Vec<_> = signature_sectors(old, topology)
                .into_iter()
                .map(|lba| lba * ss)
                .filter(|&offset| {
                    !writes.iter().any(|w| {
                        offset >= w.offset && offset < w.offset + w.data.len() as u64
                    })
                })
                .collect();
            for offset in offsets {
                debug!("commit: wiping the {} signature at sector {}", old, offset / ss);
                writes.push(SectorWrite {
                    offset,
                    data: vec![0; ss as usize],
                    stage: WriteStage::Cleanup,
                });
            }
        }
        // stable: the order inside a stage is kept
        writes.sort_by_key(|x| x.stage);

        Ok(Plan { writes })
    }

    /// All the writes, in stage order.
    pub fn writes(&self) -> &[SectorWrite] {
        &self.writes
    }

    /// The writes of one stage.
    pub fn stage(&self, stage: WriteStage) -> impl Iterator<Item = &SectorWrite> {
        self.writes.iter().filter(move |x| x.stage == stage)
    }

    /// Sector-level summary of the plan.
    pub fn summary(&self, sector_size: u64) -> Vec<WriteSummary> {
        self.writes
            .iter()
            .map(|x| WriteSummary {
                lba: x.lba(sector_size),
                sectors: (x.data.len() as u64).div_ceil(sector_size),
                stage: x.stage,
            })
            .collect()
    }

    /// Writes the plan stage by stage (secondary, primary, cleanup), flushing after each one.
    ///
    /// # Errors
    ///
    /// The first I/O error stops the commit. When it happens during the secondary stage neither
    /// the primary structures nor the previous label have been touched.
    pub fn execute<D>(&self, dev: &mut D) -> Result<CommitReport>
    where
        D: BlockDevice + ?Sized,
    {
        let mut report = CommitReport::default();
        for stage in [WriteStage::Secondary, WriteStage::Primary, WriteStage::Cleanup] {
            for w in self.stage(stage) {
                dev.write_at(w.offset, &w.data)?;
                report.bytes_written += w.data.len() as u64;
                match stage {
                    WriteStage::Secondary => report.secondary_writes += 1,
                    WriteStage::Primary => report.primary_writes += 1,
                    WriteStage::Cleanup => report.cleanup_writes += 1,
                }
            }
            dev.flush()?;
            debug!("commit: {:?} stage flushed", stage);
        }
        Ok(report)
    }
}

/// What a commit wrote.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitReport {
    /// Writes of the secondary stage
    pub secondary_writes: usize,
    /// Writes of the primary stage
    pub primary_writes: usize,
    /// Signatures of a replaced label zeroed
    pub cleanup_writes: usize,
    /// Total number of bytes written
    pub bytes_written: u64,
}

/// A planned write, in sectors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteSummary {
    /// First sector
    pub lba: u64,
    /// Number of sectors
    pub sectors: u64,
    /// Commit stage
    pub stage: WriteStage,
}

/// One difference between the label on the device and the edited one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Change {
    /// A label is written on a device that had none
    LabelCreated(LabelKind),
    /// The label of the device is replaced by a new one
    LabelReplaced {
        /// Format on the device
        from: LabelKind,
        /// New format
        to: LabelKind,
    },
    /// The label was read from a damaged copy and will be rewritten as is
    Repair,
    /// A new partition
    Added(Partition),
    /// A partition that will disappear
    Removed(Partition),
    /// A partition keeping its start but not its size
    Resized {
        /// Number of the partition in the edited label
        handle: PartitionHandle,
        /// First sector
        start: u64,
        /// Size on the device
        old_size: u64,
        /// New size
        new_size: u64,
    },
    /// A partition whose type, flags, name or number changed
    Modified {
        /// The partition on the device
        before: Partition,
        /// The edited partition
        after: Partition,
    },
}

impl fmt::Display for Change {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Change::LabelCreated(kind) => write!(f, "create a {} label", kind),
            Change::LabelReplaced { from, to } => {
                write!(f, "replace the {} label with a {} label", from, to)
            }
            Change::Repair => f.write_str("rewrite the damaged copy of the label"),
            Change::Added(p) => write!(
                f,
                "add partition {}: sectors {}..={} ({})",
                p.handle,
                p.start,
                p.end(),
                p.parttype
            ),
            Change::Removed(p) => write!(
                f,
                "remove partition {}: sectors {}..={}",
                p.handle,
                p.start,
                p.end()
            ),
            Change::Resized {
                handle,
                start,
                old_size,
                new_size,
            } => write!(
                f,
                "resize partition {} at sector {}: {} -> {} sectors",
                handle, start, old_size, new_size
            ),
            Change::Modified { before, after } => write!(
                f,
                "modify partition {} at sector {}",
                after.handle, before.start
            ),
        }
    }
}

/// The result of a dry run.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Diff {
    /// What changes, label first, then partitions by start sector
    pub changes: Vec<Change>,
    /// The sectors a commit would write
    pub writes: Vec<WriteSummary>,
}

impl Diff {
    /// Compares the label on the device with the edited one. Partitions are matched by start
    /// sector.
    pub fn between(on_disk: Option<&Label>, edited: &Label) -> Diff {
        let mut changes = Vec::new();
        let before = match on_disk {
            None => {
                changes.push(Change::LabelCreated(edited.kind()));
                Vec::new()
            }
            Some(old) if old.kind() != edited.kind() => {
                changes.push(Change::LabelReplaced {
                    from: old.kind(),
                    to: edited.kind(),
                });
                Vec::new()
            }
            Some(old) => {
                if edited.driver().needs_rewrite() {
                    changes.push(Change::Repair);
                }
                old.driver().partitions()
            }
        };
        let after = edited.driver().partitions();

        let mut partition_changes = Vec::new();
        for old in &before {
            match after.iter().find(|x| x.start == old.start) {
                None => partition_changes.push((old.start, Change::Removed(old.clone()))),
                Some(new) if new.size != old.size => partition_changes.push((
                    old.start,
                    Change::Resized {
                        handle: new.handle,
                        start: new.start,
                        old_size: old.size,
                        new_size: new.size,
                    },
                )),
                Some(new) if new != old => partition_changes.push((
                    old.start,
                    Change::Modified {
                        before: old.clone(),
                        after: new.clone(),
                    },
                )),
                Some(_) => {}
            }
        }
        for new in &after {
            if !before.iter().any(|x| x.start == new.start) {
                partition_changes.push((new.start, Change::Added(new.clone())));
            }
        }
        partition_changes.sort_by_key(|(start, _)| *start);
        changes.extend(partition_changes.into_iter().map(|(_, x)| x));

        Diff {
            changes,
            writes: Vec::new(),
        }
    }

    /// Returns `true` when the device would not change.
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }
}

impl fmt::Display for Diff {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for change in &self.changes {
            writeln!(f, "{}", change)?;
        }
        for w in &self.writes {
            writeln!(
                f,
                "write {} sector(s) at {} ({:?})",
                w.sectors, w.lba, w.stage
            )?;
        }
        Ok(())
    }
}

//! The partitioning context: one device, its label and the edits made to it.

use crate::commit::{CommitReport, CommitState, Diff, Plan};
use crate::config::Config;
use crate::device::{BlockDevice, StdDevice, Topology};
use crate::error::{Error, Result};
use crate::geometry::{Extent, Resolver};
use crate::label::{Label, LabelDriver, LabelKind};
use crate::partition::{
    Field, Partition, PartitionFlags, PartitionHandle, PartitionKind, PartitionSpec, PartitionType,
};
use log::{debug, info, warn};
use std::fs::{File, OpenOptions};
use std::path::Path;

/// A device opened for partitioning.
///
/// Every edit happens in memory; the device is only written by [`Context::commit`].
///
/// # Examples
///
/// ```
/// use fdiskman::{Context, Config, LabelKind, MemDevice, PartitionSpec, PartitionType, Topology};
///
/// let topology = Topology::new(262_144, 512);
/// let dev = MemDevice::with_sectors(262_144, 512);
/// let mut ctx = Context::open(dev, topology, Config::default()).unwrap();
/// assert!(ctx.label().is_none());
///
/// ctx.create_label(LabelKind::Dos).unwrap();
/// let handle = ctx
///     .add(
///         &PartitionSpec::new()
///             .start(2048)
///             .size(204_800)
///             .parttype(PartitionType::Dos(0x83)),
///     )
///     .unwrap();
/// assert_eq!(handle.number(), 1);
/// ctx.commit().unwrap();
/// ```
#[derive(Debug)]
pub struct Context<D: BlockDevice> {
    device: D,
    topology: Topology,
    config: Config,
    name: Option<String>,
    label: Option<Label>,
    on_disk: Option<Label>,
    parse_error: Option<Error>,
    state: CommitState,
}

impl<D: BlockDevice> Context<D> {
    /// Opens `device` and parses its label.
    ///
    /// A device without any label, or with a damaged one, still gives a context: it has no label
    /// and only accepts [`Context::create_label`]. The parse error is kept, see
    /// [`Context::parse_error`].
    ///
    /// # Errors
    ///
    /// Invalid topology or configuration, and I/O errors.
    pub fn open(device: D, topology: Topology, config: Config) -> Result<Context<D>> {
        topology.validate()?;
        Resolver::new(&topology, &config)?;

        let mut ctx = Context {
            device,
            topology,
            config,
            name: None,
            label: None,
            on_disk: None,
            parse_error: None,
            state: CommitState::Clean,
        };
        ctx.load()?;
        Ok(ctx)
    }

    /// Sets the name of the device (`/dev/sda`), used to render partition paths.
    pub fn with_name(mut self, name: impl Into<String>) -> Context<D> {
        self.name = Some(name.into());
        self
    }

    fn load(&mut self) -> Result<()> {
        self.label = None;
        self.on_disk = None;
        self.parse_error = None;
        self.state = CommitState::Clean;

        match Label::parse(&mut self.device, &self.topology, &self.config) {
            Ok(label) => {
                info!(
                    "loaded {} label with {} partition(s)",
                    label.kind(),
                    label.driver().partitions().len()
                );
                if label.driver().needs_rewrite() {
                    warn!("the {} label was repaired, commit to write it back", label.kind());
                    self.state = CommitState::Dirty;
                }
                self.on_disk = Some(label.clone());
                self.label = Some(label);
            }
            Err(Error::NotRecognized) => {
                debug!("no label found");
                self.parse_error = Some(Error::NotRecognized);
            }
            Err(Error::Io(err)) => return Err(Error::Io(err)),
            Err(err) => {
                warn!("could not parse the label: {}", err);
                self.parse_error = Some(err);
            }
        }
        Ok(())
    }

    /// Reads the label from the device again, dropping every uncommitted edit.
    pub fn reload(&mut self) -> Result<()> {
        if self.state == CommitState::Dirty {
            warn!("discarding uncommitted changes");
        }
        self.load()
    }

    /// Closes the context and gives the device back.
    pub fn close(self) -> D {
        if self.state == CommitState::Dirty {
            warn!("closing with uncommitted changes");
        }
        self.device
    }

    /// The device.
    pub fn device(&self) -> &D {
        &self.device
    }

    /// Name of the device, if one was given.
    pub fn devname(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// The topology of the device.
    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    /// Logical sector size.
    pub fn sector_size(&self) -> u64 {
        self.topology.logical_sector_size
    }

    /// Number of logical sectors of the device.
    pub fn nsectors(&self) -> u64 {
        self.topology.total_sectors
    }

    /// The configuration the context was opened with.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Where the context stands with respect to the device.
    pub fn state(&self) -> CommitState {
        self.state
    }

    /// Why no label was loaded.
    pub fn parse_error(&self) -> Option<&Error> {
        self.parse_error.as_ref()
    }

    /// The label, if one is loaded or created.
    pub fn label(&self) -> Option<&Label> {
        self.label.as_ref()
    }

    /// The format of the label.
    pub fn label_kind(&self) -> Option<LabelKind> {
        self.label.as_ref().map(Label::kind)
    }

    /// Name of the label format (`dos`, `gpt`...).
    pub fn label_name(&self) -> Option<&'static str> {
        self.label_kind().map(LabelKind::name)
    }

    /// The disk identifier of the label.
    pub fn disk_id(&self) -> Option<String> {
        self.label.as_ref().and_then(|x| x.driver().disk_id())
    }

    fn driver(&self) -> Result<&dyn LabelDriver> {
        self.label.as_ref().map(Label::driver).ok_or(Error::NoLabel)
    }

    /// Creates an empty label, replacing the current one in memory.
    pub fn create_label(&mut self, kind: LabelKind) -> Result<()> {
        let label = Label::create(kind, &self.topology, &self.config)?;
        if let Some(old) = &self.label {
            info!("replacing the {} label with a new {} label", old.kind(), kind);
        }
        self.label = Some(label);
        self.parse_error = None;
        self.state = CommitState::Dirty;
        Ok(())
    }

    /// The resolver bounded to the usable range of the label.
    pub fn resolver(&self) -> Result<Resolver> {
        let usable = self.driver()?.usable_range();
        Ok(Resolver::new(&self.topology, &self.config)?.with_bounds(usable.start, usable.end()))
    }

    fn edit<T>(&mut self, f: impl FnOnce(&mut dyn LabelDriver, &Resolver) -> Result<T>) -> Result<T> {
        let resolver = self.resolver()?;
        let label = self.label.as_mut().ok_or(Error::NoLabel)?;
        let out = f(label.driver_mut(), &resolver)?;
        self.state = CommitState::Dirty;
        Ok(out)
    }

    /// Adds a partition.
    pub fn add(&mut self, spec: &PartitionSpec) -> Result<PartitionHandle> {
        let handle = self.edit(|label, resolver| label.add(spec, resolver))?;
        debug!("added partition {}", handle);
        Ok(handle)
    }

    /// Removes a partition and returns it.
    pub fn remove(&mut self, handle: PartitionHandle) -> Result<Partition> {
        self.edit(|label, _| label.remove(handle))
    }

    /// Changes the size of a partition. The start does not move.
    pub fn resize(&mut self, handle: PartitionHandle, size: u64) -> Result<()> {
        self.edit(|label, resolver| label.resize(handle, size, resolver))
    }

    /// Changes the type of a partition.
    pub fn set_type(&mut self, handle: PartitionHandle, parttype: PartitionType) -> Result<()> {
        self.edit(|label, _| label.set_type(handle, parttype))
    }

    /// Replaces the flags of a partition.
    pub fn set_flags(&mut self, handle: PartitionHandle, flags: PartitionFlags) -> Result<()> {
        self.edit(|label, _| label.set_flags(handle, flags))
    }

    /// Renames a partition.
    pub fn set_name(&mut self, handle: PartitionHandle, name: &str) -> Result<()> {
        self.edit(|label, _| label.set_name(handle, name))
    }

    /// The partitions, sorted by number. Empty without a label.
    pub fn partitions(&self) -> Vec<Partition> {
        self.label
            .as_ref()
            .map(|x| x.driver().partitions())
            .unwrap_or_default()
    }

    /// Looks up a partition by number.
    pub fn partition(&self, handle: PartitionHandle) -> Option<Partition> {
        self.label.as_ref().and_then(|x| x.driver().partition(handle))
    }

    /// Number of partitions in use.
    pub fn nparts(&self) -> usize {
        self.partitions().len()
    }

    /// Aligned free regions outside of the top-level partitions.
    pub fn free_regions(&self) -> Result<Vec<Extent>> {
        let resolver = self.resolver()?;
        let used: Vec<_> = self
            .partitions()
            .iter()
            .filter(|x| x.kind != PartitionKind::Logical)
            .map(Partition::extent)
            .collect();
        Ok(resolver.free_regions(&used))
    }

    /// Renders one field of a partition.
    pub fn partition_to_string(&self, handle: PartitionHandle, field: Field) -> Result<String> {
        let partition = self.driver()?.partition(handle).ok_or(Error::PartitionNotFound)?;
        Ok(partition.to_field_string(field, self.devname(), self.sector_size()))
    }

    /// Checks the label.
    pub fn verify(&self) -> Result<()> {
        self.driver()?.verify(&self.resolver()?)
    }

    fn replaced_kind(&self) -> Option<LabelKind> {
        if !self.config.wipe_foreign_labels {
            return None;
        }
        match (&self.on_disk, &self.parse_error) {
            (Some(label), _) => Some(label.kind()),
            (None, Some(Error::CorruptLabel { label, .. })) => Some(*label),
            _ => None,
        }
    }

    fn plan(&self) -> Result<(&Label, Plan)> {
        let label = self.label.as_ref().ok_or(Error::NoLabel)?;
        label.driver().verify(&self.resolver()?)?;
        let plan = Plan::new(label, self.replaced_kind(), &self.topology)?;
        Ok((label, plan))
    }

    /// Validates the label and reports what a commit would change, without touching the device.
    pub fn dry_run(&self) -> Result<Diff> {
        let (label, plan) = self.plan()?;
        let mut diff = Diff::between(self.on_disk.as_ref(), label);
        diff.writes = plan.summary(self.sector_size());
        Ok(diff)
    }

    /// Validates the label and writes it to the device.
    ///
    /// # Errors
    ///
    /// [`Error::ReadOnly`] on read-only contexts, validation errors (nothing is written) and I/O
    /// errors. The state becomes [`CommitState::Rejected`] on any error.
    pub fn commit(&mut self) -> Result<CommitReport> {
        if self.config.read_only {
            return Err(Error::ReadOnly);
        }
        if self.label.is_none() {
            return Err(Error::NoLabel);
        }

        self.state = CommitState::Validating;
        let plan = self.plan().map(|(_, plan)| plan);
        let report = match plan.and_then(|plan| plan.execute(&mut self.device)) {
            Ok(report) => report,
            Err(err) => {
                warn!("commit rejected: {}", err);
                self.state = CommitState::Rejected;
                return Err(err);
            }
        };

        if let Some(label) = self.label.as_mut() {
            label.driver_mut().mark_synced();
            info!(
                "wrote the {} label: {} bytes",
                label.kind(),
                report.bytes_written
            );
            self.on_disk = Some(label.clone());
        }
        self.parse_error = None;
        self.state = CommitState::Committed;
        Ok(report)
    }
}

impl Context<StdDevice<File>> {
    /// Opens a disk image or a block device by path. The file is opened read-only when the
    /// configuration says so.
    pub fn open_path(path: impl AsRef<Path>, sector_size: u64, config: Config) -> Result<Self> {
        let path = path.as_ref();
        let file = OpenOptions::new()
            .read(true)
            .write(!config.read_only)
            .open(path)?;
        let mut device = StdDevice::new(file);
        let topology = device.topology(sector_size)?;
        Ok(Context::open(device, topology, config)?.with_name(path.display().to_string()))
    }
}

//! A library that manages disk partition tables.
//!
//! ## Features
//!
//!  *  Probe and parse DOS (MBR), GPT, BSD, SUN and SGI labels
//!  *  Create DOS and GPT labels, add, remove, resize and retype partitions, including logical
//!     partitions chained through EBRs
//!  *  Align new partitions on the I/O topology of the device
//!  *  Recover a GPT from its backup copy
//!  *  Validate before writing, write backup structures before primary ones, or only report what
//!     would change with a dry run
//!
//! ## Examples
//!
//! ### Create a label on an empty disk
//!
//! ```rust
//! use fdiskman::{Config, Context, LabelKind, MemDevice, PartitionSpec, PartitionType, Topology};
//!
//! let sectors = 262_144;
//! let dev = MemDevice::with_sectors(sectors, 512);
//! let mut ctx = Context::open(dev, Topology::new(sectors, 512), Config::default())
//!     .expect("could not open the device");
//!
//! ctx.create_label(LabelKind::Gpt).expect("could not create the label");
//! let root = ctx
//!     .add(&PartitionSpec::new().size(204_800).parttype(PartitionType::Gpt(
//!         fdiskman::parttype::GPT_LINUX_FILESYSTEM,
//!     )))
//!     .expect("could not add the partition");
//! ctx.set_name(root, "root").expect("could not name the partition");
//!
//! // NOTE: nothing is written to the device before commit()
//! ctx.commit().expect("could not write the label");
//! ```
//!
//! ### List the partitions of a disk image
//!
//! ```rust,no_run
//! use fdiskman::{Config, Context, Field};
//!
//! let ctx = Context::open_path("disk.img", 512, Config::default().with_read_only(true))
//!     .expect("could not open disk");
//!
//! println!("Label: {:?}, disk id: {:?}", ctx.label_name(), ctx.disk_id());
//! for p in ctx.partitions() {
//!     println!(
//!         "{} {} {} {}",
//!         ctx.partition_to_string(p.handle, Field::Device).unwrap(),
//!         p.start,
//!         p.end(),
//!         ctx.partition_to_string(p.handle, Field::Type).unwrap(),
//!     );
//! }
//! ```
//!
//! ### Preview the changes
//!
//! ```rust
//! use fdiskman::{Config, Context, LabelKind, MemDevice, PartitionSpec, Topology};
//!
//! let dev = MemDevice::with_sectors(65_536, 512);
//! let mut ctx = Context::open(dev, Topology::new(65_536, 512), Config::default()).unwrap();
//! ctx.create_label(LabelKind::Dos).unwrap();
//! ctx.add(&PartitionSpec::new().start(2048)).unwrap();
//!
//! let diff = ctx.dry_run().unwrap();
//! print!("{}", diff);
//! assert_eq!(diff.changes.len(), 2);
//! ```

#![deny(missing_docs)]

pub mod chs;
pub mod commit;
pub mod config;
pub mod context;
pub mod device;
mod error;
pub mod geometry;
pub mod label;
pub mod partition;
pub mod parttype;

pub use crate::chs::{Geometry, CHS};
pub use crate::commit::{Change, CommitReport, CommitState, Diff};
pub use crate::config::Config;
pub use crate::context::Context;
pub use crate::device::{BlockDevice, BlockDeviceExt, MemDevice, StdDevice, Topology};
pub use crate::error::{Error, Result};
pub use crate::geometry::{AlignmentPolicy, Extent, Resolver};
pub use crate::label::{Label, LabelDriver, LabelKind};
pub use crate::partition::{
    Field, Partition, PartitionFlags, PartitionHandle, PartitionKind, PartitionSpec,
    PartitionType,
};

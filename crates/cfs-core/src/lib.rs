#![forbid(unsafe_code)]
//! ChainFS volume: chained-block files with buffered byte-level I/O.
//!
//! A [`Volume`] ties together a block device, the allocation table
//! (`cfs-alloc`), the directory (`cfs-dir`) and a fixed table of open-file
//! sessions. Files are reached by path, opened into a [`SessionHandle`],
//! and read or written through a one-block staging buffer per session.

mod check;
mod engine;
mod flags;
mod options;
mod session;
mod volume;

pub use check::{CheckFinding, CheckReport};
pub use flags::{Access, OpenFlags};
pub use options::{FormatOptions, MountOptions};
pub use session::{Session, SessionHandle, SessionTable};
pub use volume::{Volume, VolumeStats, probe_header};

pub use cfs_alloc::{AllocStats, AllocationTable, ChainLink};
pub use cfs_block::{
    BlockDevice, ByteBlockDevice, ByteDevice, CountingBlockDevice, FileByteDevice,
    MemoryByteDevice,
};
pub use cfs_dir::{DirEntry, Directory, DirectoryService};
pub use cfs_error::{CfsError, Result};
pub use cfs_ondisk::VolumeHeader;
pub use cfs_types::{BlockNumber, BlockSize, EntryId};

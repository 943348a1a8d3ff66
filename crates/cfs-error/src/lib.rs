#![forbid(unsafe_code)]
//! Error types for ChainFS.
//!
//! # Error Taxonomy
//!
//! ChainFS uses a two-layer error model:
//!
//! | Layer | Type | Crate | Purpose |
//! |-------|------|-------|---------|
//! | Parsing | `ParseError` | `cfs-types` | On-disk format violations detected during byte decoding |
//! | Runtime | `CfsError` | `cfs-error` (this crate) | Errors returned by the allocator, directory, I/O engine and CLI |
//!
//! `cfs-error` does not depend on `cfs-types`. Crates that decode on-disk
//! bytes convert `ParseError` at their boundary:
//!
//! | Where the bytes came from | CfsError Variant |
//! |---------------------------|------------------|
//! | Volume header | `Format(detail)` |
//! | Allocation table region | `CorruptTable(detail)` |
//! | Directory region | `Corruption { block, detail }` |
//!
//! ## Propagation Policy
//!
//! Every error is returned to the immediate caller. Nothing is retried: the
//! block device is assumed not to produce transient failures, so a short
//! transfer is surfaced as `DeviceError` (read) or `ShortWrite` (write) the
//! moment it is observed.
//!
//! A failed allocation (`OutOfSpace`) leaves the allocation table exactly as
//! it was. A failed write does NOT roll back the parts that already reached
//! the device: the session keeps the cursor state of the last completed part.
//!
//! ## errno Mapping
//!
//! Every variant maps to exactly one POSIX errno via [`CfsError::to_errno`].
//! The mapping is exhaustive (no wildcard arms) so adding a new variant is a
//! compile error until its errno is assigned.
//!
//! | Variant | errno |
//! |---------|-------|
//! | `Io` | raw OS error or `EIO` |
//! | `DeviceError`, `ShortWrite`, `CorruptChain`, `CorruptTable`, `Corruption` | `EIO` |
//! | `InvalidFlags`, `InvalidPath`, `InvalidBlock`, `InvalidChainTail`, `InvalidSeek`, `InvalidArgument`, `Format` | `EINVAL` |
//! | `NotFound`, `ParentMissing` | `ENOENT` |
//! | `NoFreeSessions` | `EMFILE` |
//! | `InvalidHandle`, `AccessMode` | `EBADF` |
//! | `OutOfSpace`, `VolumeTooSmall`, `DirectoryFull` | `ENOSPC` |
//! | `Exists` | `EEXIST` |
//! | `NotDirectory` | `ENOTDIR` |
//! | `NotEmpty` | `ENOTEMPTY` |
//! | `NameTooLong` | `ENAMETOOLONG` |
//! | `Busy` | `EBUSY` |

use thiserror::Error;

/// Unified error type for all ChainFS operations.
#[derive(Debug, Error)]
pub enum CfsError {
    /// Operating system I/O error (wraps `std::io::Error`).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The block device transferred fewer blocks than requested on a read.
    #[error("device error at block {block}: requested {requested} blocks, transferred {transferred}")]
    DeviceError {
        block: u64,
        requested: u64,
        transferred: u64,
    },

    /// The block device transferred fewer blocks than requested on a write.
    #[error("short write at block {block}: requested {requested} blocks, transferred {transferred}")]
    ShortWrite {
        block: u64,
        requested: u64,
        transferred: u64,
    },

    /// Conflicting open flags (e.g. read-only combined with create).
    #[error("invalid open flags: {0}")]
    InvalidFlags(String),

    /// Path does not name an existing entry.
    #[error("not found: {0}")]
    NotFound(String),

    /// Path is syntactically invalid or names something that cannot be
    /// opened as a file (e.g. a directory).
    #[error("invalid path: {0}")]
    InvalidPath(String),

    /// Every session slot is in use.
    #[error("no free sessions")]
    NoFreeSessions,

    /// Handle is out of range or refers to a closed session.
    #[error("invalid handle: {0}")]
    InvalidHandle(u32),

    /// Session was not opened with the access mode the operation needs.
    #[error("handle {handle} not opened for {operation}")]
    AccessMode {
        handle: u32,
        operation: &'static str,
    },

    /// Fewer free blocks than requested. The table is left unmodified.
    #[error("out of space: requested {requested} blocks, {available} free")]
    OutOfSpace { requested: u64, available: u64 },

    /// `extend_chain` was given a block that is not an end-of-chain slot.
    #[error("block {0} is not the tail of a chain")]
    InvalidChainTail(u64),

    /// Block is out of range, free, or reserved where a chain member was expected.
    #[error("invalid block {block}: {detail}")]
    InvalidBlock { block: u64, detail: &'static str },

    /// A chain ended early, looped, or disagrees with the recorded file size.
    #[error("corrupt chain at block {block}: {detail}")]
    CorruptChain { block: u64, detail: String },

    /// The persisted allocation table does not match the volume.
    #[error("corrupt allocation table: {0}")]
    CorruptTable(String),

    /// On-disk metadata corruption detected at a known block.
    #[error("corrupt metadata at block {block}: {detail}")]
    Corruption { block: u64, detail: String },

    /// The volume cannot hold its own reserved region plus one data block.
    #[error("volume too small: {block_count} blocks, {reserved} reserved")]
    VolumeTooSmall { block_count: u64, reserved: u64 },

    /// Invalid on-disk format or geometry (bad magic, bad block size, ...).
    #[error("invalid on-disk format: {0}")]
    Format(String),

    /// Argument outside the operation's domain (e.g. a zero-length chain).
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    /// Seek target outside `0..=size`.
    #[error("invalid seek to offset {0}")]
    InvalidSeek(i128),

    /// Target already exists.
    #[error("file exists: {0}")]
    Exists(String),

    /// A parent component of the path does not exist.
    #[error("parent directory missing: {0}")]
    ParentMissing(String),

    /// A path component is not a directory.
    #[error("not a directory: {0}")]
    NotDirectory(String),

    /// Attempt to delete a non-empty directory.
    #[error("directory not empty: {0}")]
    NotEmpty(String),

    /// Name component exceeds the directory record's name field.
    #[error("name too long: {0}")]
    NameTooLong(String),

    /// Every directory record is in use.
    #[error("directory full")]
    DirectoryFull,

    /// The entry is held open by another session.
    #[error("entry busy: {0}")]
    Busy(String),
}

impl CfsError {
    /// Convert this error into a POSIX errno.
    ///
    /// The mapping is exhaustive: every variant has an explicit arm.
    #[must_use]
    pub fn to_errno(&self) -> libc::c_int {
        match self {
            Self::Io(err) => err.raw_os_error().unwrap_or(libc::EIO),
            Self::DeviceError { .. }
            | Self::ShortWrite { .. }
            | Self::CorruptChain { .. }
            | Self::CorruptTable(_)
            | Self::Corruption { .. } => libc::EIO,
            Self::InvalidFlags(_)
            | Self::InvalidPath(_)
            | Self::InvalidBlock { .. }
            | Self::InvalidChainTail(_)
            | Self::InvalidSeek(_)
            | Self::InvalidArgument(_)
            | Self::Format(_) => libc::EINVAL,
            Self::NotFound(_) | Self::ParentMissing(_) => libc::ENOENT,
            Self::NoFreeSessions => libc::EMFILE,
            Self::InvalidHandle(_) | Self::AccessMode { .. } => libc::EBADF,
            Self::OutOfSpace { .. } | Self::VolumeTooSmall { .. } | Self::DirectoryFull => {
                libc::ENOSPC
            }
            Self::Exists(_) => libc::EEXIST,
            Self::NotDirectory(_) => libc::ENOTDIR,
            Self::NotEmpty(_) => libc::ENOTEMPTY,
            Self::NameTooLong(_) => libc::ENAMETOOLONG,
            Self::Busy(_) => libc::EBUSY,
        }
    }

    /// Whether the error reports a device-level short transfer.
    #[must_use]
    pub fn is_short_transfer(&self) -> bool {
        matches!(self, Self::DeviceError { .. } | Self::ShortWrite { .. })
    }
}

/// Result alias using `CfsError`.
pub type Result<T> = std::result::Result<T, CfsError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_mapping_covers_all_variants() {
        let cases: Vec<(CfsError, libc::c_int)> = vec![
            (CfsError::Io(std::io::Error::other("test")), libc::EIO),
            (
                CfsError::DeviceError {
                    block: 1,
                    requested: 1,
                    transferred: 0,
                },
                libc::EIO,
            ),
            (
                CfsError::ShortWrite {
                    block: 1,
                    requested: 1,
                    transferred: 0,
                },
                libc::EIO,
            ),
            (CfsError::InvalidFlags("ro|creat".into()), libc::EINVAL),
            (CfsError::NotFound("/a".into()), libc::ENOENT),
            (CfsError::InvalidPath("/".into()), libc::EINVAL),
            (CfsError::NoFreeSessions, libc::EMFILE),
            (CfsError::InvalidHandle(3), libc::EBADF),
            (
                CfsError::AccessMode {
                    handle: 0,
                    operation: "writing",
                },
                libc::EBADF,
            ),
            (
                CfsError::OutOfSpace {
                    requested: 4,
                    available: 1,
                },
                libc::ENOSPC,
            ),
            (CfsError::InvalidChainTail(9), libc::EINVAL),
            (
                CfsError::InvalidBlock {
                    block: 0,
                    detail: "reserved",
                },
                libc::EINVAL,
            ),
            (
                CfsError::CorruptChain {
                    block: 7,
                    detail: "cycle".into(),
                },
                libc::EIO,
            ),
            (CfsError::CorruptTable("size".into()), libc::EIO),
            (
                CfsError::Corruption {
                    block: 2,
                    detail: "record".into(),
                },
                libc::EIO,
            ),
            (
                CfsError::VolumeTooSmall {
                    block_count: 4,
                    reserved: 4,
                },
                libc::ENOSPC,
            ),
            (CfsError::Format("magic".into()), libc::EINVAL),
            (CfsError::InvalidSeek(-1), libc::EINVAL),
            (CfsError::InvalidArgument("zero-length chain"), libc::EINVAL),
            (CfsError::Exists("/a".into()), libc::EEXIST),
            (CfsError::ParentMissing("/a/b".into()), libc::ENOENT),
            (CfsError::NotDirectory("/a".into()), libc::ENOTDIR),
            (CfsError::NotEmpty("/d".into()), libc::ENOTEMPTY),
            (CfsError::NameTooLong("x".into()), libc::ENAMETOOLONG),
            (CfsError::DirectoryFull, libc::ENOSPC),
            (CfsError::Busy("/a".into()), libc::EBUSY),
        ];

        for (error, expected_errno) in &cases {
            assert_eq!(
                error.to_errno(),
                *expected_errno,
                "wrong errno for {error:?}",
            );
        }
    }

    #[test]
    fn io_error_preserves_raw_os_error() {
        let raw = std::io::Error::from_raw_os_error(libc::EPERM);
        let err = CfsError::Io(raw);
        assert_eq!(err.to_errno(), libc::EPERM);
    }

    #[test]
    fn display_formatting() {
        let err = CfsError::OutOfSpace {
            requested: 3,
            available: 2,
        };
        assert_eq!(err.to_string(), "out of space: requested 3 blocks, 2 free");

        let tail = CfsError::InvalidChainTail(42);
        assert_eq!(tail.to_string(), "block 42 is not the tail of a chain");

        let short = CfsError::ShortWrite {
            block: 10,
            requested: 1,
            transferred: 0,
        };
        assert_eq!(
            short.to_string(),
            "short write at block 10: requested 1 blocks, transferred 0"
        );

        let mode = CfsError::AccessMode {
            handle: 2,
            operation: "reading",
        };
        assert_eq!(mode.to_string(), "handle 2 not opened for reading");
    }

    #[test]
    fn short_transfer_classification() {
        assert!(
            CfsError::DeviceError {
                block: 0,
                requested: 1,
                transferred: 0
            }
            .is_short_transfer()
        );
        assert!(!CfsError::NoFreeSessions.is_short_transfer());
    }
}

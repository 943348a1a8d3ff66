//! Open flags and their access-mode rules.

use bitflags::bitflags;
use cfs_error::{CfsError, Result};
use serde::{Deserialize, Serialize};

bitflags! {
    /// Flags accepted by `Volume::open`.
    ///
    /// With neither `WRITE_ONLY` nor `READ_WRITE` the session is read-only,
    /// whether or not `READ_ONLY` is spelled out.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct OpenFlags: u32 {
        const READ_ONLY = 1 << 0;
        const WRITE_ONLY = 1 << 1;
        const READ_WRITE = 1 << 2;
        /// Create the file if it does not exist.
        const CREATE = 1 << 6;
        /// Discard existing contents.
        const TRUNCATE = 1 << 9;
        /// Start at end of file.
        const APPEND = 1 << 10;
    }
}

/// What a session may do, derived from its open flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Access {
    ReadOnly,
    WriteOnly,
    ReadWrite,
}

impl Access {
    #[must_use]
    pub fn can_read(self) -> bool {
        matches!(self, Self::ReadOnly | Self::ReadWrite)
    }

    #[must_use]
    pub fn can_write(self) -> bool {
        matches!(self, Self::WriteOnly | Self::ReadWrite)
    }
}

impl OpenFlags {
    /// Check flag combinations and return the resulting access mode.
    pub fn access(self) -> Result<Access> {
        let reject = |why: &str| Err(CfsError::InvalidFlags(format!("{self:?}: {why}")));

        if self.contains(Self::READ_ONLY | Self::WRITE_ONLY) {
            return reject("read-only with write-only");
        }
        if self.contains(Self::READ_ONLY | Self::READ_WRITE) {
            return reject("read-only with read-write");
        }
        if self.contains(Self::WRITE_ONLY | Self::READ_WRITE) {
            return reject("write-only with read-write");
        }
        if self.contains(Self::TRUNCATE | Self::APPEND) {
            return reject("truncate with append");
        }

        let access = if self.contains(Self::READ_WRITE) {
            Access::ReadWrite
        } else if self.contains(Self::WRITE_ONLY) {
            Access::WriteOnly
        } else {
            Access::ReadOnly
        };
        if access == Access::ReadOnly
            && self.intersects(Self::CREATE | Self::TRUNCATE | Self::APPEND)
        {
            return reject("read-only with create, truncate or append");
        }
        Ok(access)
    }
}

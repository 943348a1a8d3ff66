#![forbid(unsafe_code)]
//! Core newtypes, on-disk constants and byte helpers shared by every
//! ChainFS crate.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Volume header magic: "CHFS" little-endian.
pub const CFS_MAGIC: u32 = 0x5346_4843;
/// On-disk format revision written by `format`.
pub const CFS_FORMAT_VERSION: u16 = 1;

/// Block holding the volume header.
pub const HEADER_BLOCK: BlockNumber = BlockNumber(0);
/// First block of the allocation table region.
pub const TABLE_START_BLOCK: BlockNumber = BlockNumber(1);

/// Width of one allocation-table slot on disk.
pub const TABLE_SLOT_SIZE: usize = 4;
/// Raw slot value: block is free.
pub const SLOT_FREE: u32 = 0xFFFF_FFFD;
/// Raw slot value: block belongs to the reserved region.
pub const SLOT_RESERVED: u32 = 0xFFFF_FFFE;
/// Raw slot value: block terminates its chain.
pub const SLOT_END_OF_CHAIN: u32 = 0xFFFF_FFFF;
/// Largest volume whose block indices stay clear of the slot sentinels.
pub const MAX_BLOCK_COUNT: u64 = 0xFFFF_FFF0;

/// Width of one directory record on disk.
pub const DIR_RECORD_SIZE: usize = 64;
/// Longest name a directory record can hold.
pub const NAME_MAX: usize = 40;
/// Attribute bit marking a directory entry.
pub const ATTR_DIRECTORY: u32 = 0x10;

pub const MIN_BLOCK_SIZE: u32 = 512;
pub const MAX_BLOCK_SIZE: u32 = 65536;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlockNumber(pub u64);

impl BlockNumber {
    /// Index form for slot vectors.
    ///
    /// Block numbers are bounded by `MAX_BLOCK_COUNT`, which fits `usize`
    /// on every supported target.
    #[must_use]
    #[expect(clippy::cast_possible_truncation)]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Stable identifier of a directory entry (its record index).
///
/// Sessions hold this instead of a reference into directory storage, so
/// the directory can reorganise its records freely between calls.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct EntryId(pub u32);

impl EntryId {
    pub const ROOT: Self = Self(0);
}

/// Validated block size (must be a power of two in 512..=65536).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlockSize(u32);

impl BlockSize {
    /// Create a `BlockSize` if `value` is a power of two in [512, 65536].
    pub fn new(value: u32) -> Result<Self, ParseError> {
        if !value.is_power_of_two() || !(MIN_BLOCK_SIZE..=MAX_BLOCK_SIZE).contains(&value) {
            return Err(ParseError::InvalidField {
                field: "block_size",
                reason: "must be power of two in 512..=65536",
            });
        }
        Ok(Self(value))
    }

    #[must_use]
    pub fn get(self) -> u32 {
        self.0
    }

    #[must_use]
    pub fn as_usize(self) -> usize {
        self.0 as usize
    }

    #[must_use]
    pub fn as_u64(self) -> u64 {
        u64::from(self.0)
    }

    /// Number of blocks needed to hold `bytes` bytes.
    #[must_use]
    pub fn blocks_for(self, bytes: u64) -> u64 {
        bytes.div_ceil(self.as_u64())
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("insufficient data: need {needed} bytes at offset {offset}, got {actual}")]
    InsufficientData {
        needed: usize,
        offset: usize,
        actual: usize,
    },
    #[error("invalid magic: expected {expected:#x}, got {actual:#x}")]
    InvalidMagic { expected: u64, actual: u64 },
    #[error("invalid field: {field} ({reason})")]
    InvalidField {
        field: &'static str,
        reason: &'static str,
    },
    #[error("checksum mismatch: expected {expected:#010x}, got {actual:#010x}")]
    ChecksumMismatch { expected: u32, actual: u32 },
    #[error("integer conversion failed: {field}")]
    IntegerConversion { field: &'static str },
}

#[inline]
pub fn ensure_slice(data: &[u8], offset: usize, len: usize) -> Result<&[u8], ParseError> {
    let Some(end) = offset.checked_add(len) else {
        return Err(ParseError::InvalidField {
            field: "offset",
            reason: "overflow",
        });
    };

    if end > data.len() {
        return Err(ParseError::InsufficientData {
            needed: len,
            offset,
            actual: data.len().saturating_sub(offset),
        });
    }

    Ok(&data[offset..end])
}

#[inline]
pub fn read_le_u16(data: &[u8], offset: usize) -> Result<u16, ParseError> {
    let bytes = ensure_slice(data, offset, 2)?;
    Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
}

#[inline]
pub fn read_le_u32(data: &[u8], offset: usize) -> Result<u32, ParseError> {
    let bytes = ensure_slice(data, offset, 4)?;
    Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

#[inline]
pub fn read_le_u64(data: &[u8], offset: usize) -> Result<u64, ParseError> {
    let bytes = ensure_slice(data, offset, 8)?;
    Ok(u64::from_le_bytes([
        bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
    ]))
}

/// Copy `value` into `data[offset..]`, failing if the slice is too short.
#[inline]
pub fn write_bytes(data: &mut [u8], offset: usize, value: &[u8]) -> Result<(), ParseError> {
    let actual = data.len().saturating_sub(offset);
    let dst = offset
        .checked_add(value.len())
        .and_then(|end| data.get_mut(offset..end))
        .ok_or(ParseError::InsufficientData {
            needed: value.len(),
            offset,
            actual,
        })?;
    dst.copy_from_slice(value);
    Ok(())
}

#[inline]
pub fn write_le_u16(data: &mut [u8], offset: usize, value: u16) -> Result<(), ParseError> {
    write_bytes(data, offset, &value.to_le_bytes())
}

#[inline]
pub fn write_le_u32(data: &mut [u8], offset: usize, value: u32) -> Result<(), ParseError> {
    write_bytes(data, offset, &value.to_le_bytes())
}

#[inline]
pub fn write_le_u64(data: &mut [u8], offset: usize, value: u64) -> Result<(), ParseError> {
    write_bytes(data, offset, &value.to_le_bytes())
}

impl fmt::Display for BlockNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for BlockSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

//! Volume header (block 0).

use crate::VolumeLayout;
use cfs_types::{
    BlockNumber, BlockSize, CFS_FORMAT_VERSION, CFS_MAGIC, ParseError, read_le_u16, read_le_u32,
    read_le_u64, write_le_u16, write_le_u32, write_le_u64,
};
use serde::{Deserialize, Serialize};

const OFF_MAGIC: usize = 0x00;
const OFF_VERSION: usize = 0x04;
const OFF_BLOCK_SIZE: usize = 0x08;
const OFF_DIR_CAPACITY: usize = 0x0C;
const OFF_BLOCK_COUNT: usize = 0x10;
const OFF_TABLE_START: usize = 0x18;
const OFF_TABLE_BLOCKS: usize = 0x20;
const OFF_DIR_START: usize = 0x28;
const OFF_DIR_BLOCKS: usize = 0x30;
const OFF_RESERVED: usize = 0x38;
const OFF_CHECKSUM: usize = 0x40;

/// Encoded header length including the trailing CRC32C.
pub const HEADER_SIZE: usize = 0x44;

/// Decoded volume header.
///
/// Fields are kept as stored; [`VolumeHeader::expected_layout`] recomputes
/// the geometry so mount code can compare the two.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeHeader {
    pub version: u16,
    pub block_size: BlockSize,
    pub block_count: u64,
    pub table_start: BlockNumber,
    pub table_blocks: u64,
    pub directory_start: BlockNumber,
    pub directory_blocks: u64,
    pub directory_capacity: u32,
    pub reserved_blocks: u64,
}

impl VolumeHeader {
    #[must_use]
    pub fn from_layout(layout: &VolumeLayout) -> Self {
        Self {
            version: CFS_FORMAT_VERSION,
            block_size: layout.block_size,
            block_count: layout.block_count,
            table_start: layout.table_start,
            table_blocks: layout.table_blocks,
            directory_start: layout.directory_start,
            directory_blocks: layout.directory_blocks,
            directory_capacity: layout.directory_capacity,
            reserved_blocks: layout.reserved_blocks(),
        }
    }

    /// Layout implied by block count, block size and directory capacity.
    pub fn expected_layout(&self) -> Result<VolumeLayout, ParseError> {
        VolumeLayout::compute(self.block_count, self.block_size, self.directory_capacity)
    }

    /// Layout as recorded, after checking it agrees with the computed one
    /// for everything except the table size.
    ///
    /// A table-size disagreement is left for the allocation table to report.
    pub fn layout(&self) -> Result<VolumeLayout, ParseError> {
        let expected = self.expected_layout()?;
        if self.directory_blocks != expected.directory_blocks {
            return Err(ParseError::InvalidField {
                field: "directory_blocks",
                reason: "does not match directory capacity",
            });
        }
        if self.directory_start.0 != self.table_start.0 + self.table_blocks {
            return Err(ParseError::InvalidField {
                field: "directory_start",
                reason: "must follow the allocation table",
            });
        }
        if self.reserved_blocks != 1 + self.table_blocks + self.directory_blocks {
            return Err(ParseError::InvalidField {
                field: "reserved_blocks",
                reason: "must cover header, table and directory",
            });
        }
        Ok(VolumeLayout {
            table_start: self.table_start,
            table_blocks: self.table_blocks,
            directory_start: self.directory_start,
            ..expected
        })
    }

    pub fn parse_from_bytes(bytes: &[u8]) -> Result<Self, ParseError> {
        let magic = read_le_u32(bytes, OFF_MAGIC)?;
        if magic != CFS_MAGIC {
            return Err(ParseError::InvalidMagic {
                expected: u64::from(CFS_MAGIC),
                actual: u64::from(magic),
            });
        }

        let stored = read_le_u32(bytes, OFF_CHECKSUM)?;
        let computed = crc32c::crc32c(&bytes[..OFF_CHECKSUM]);
        if stored != computed {
            return Err(ParseError::ChecksumMismatch {
                expected: stored,
                actual: computed,
            });
        }

        let version = read_le_u16(bytes, OFF_VERSION)?;
        if version != CFS_FORMAT_VERSION {
            return Err(ParseError::InvalidField {
                field: "version",
                reason: "unsupported format revision",
            });
        }

        let block_size = BlockSize::new(read_le_u32(bytes, OFF_BLOCK_SIZE)?)?;
        let table_start = BlockNumber(read_le_u64(bytes, OFF_TABLE_START)?);
        if table_start.0 != 1 {
            return Err(ParseError::InvalidField {
                field: "table_start",
                reason: "allocation table must start at block 1",
            });
        }

        Ok(Self {
            version,
            block_size,
            block_count: read_le_u64(bytes, OFF_BLOCK_COUNT)?,
            table_start,
            table_blocks: read_le_u64(bytes, OFF_TABLE_BLOCKS)?,
            directory_start: BlockNumber(read_le_u64(bytes, OFF_DIR_START)?),
            directory_blocks: read_le_u64(bytes, OFF_DIR_BLOCKS)?,
            directory_capacity: read_le_u32(bytes, OFF_DIR_CAPACITY)?,
            reserved_blocks: read_le_u64(bytes, OFF_RESERVED)?,
        })
    }

    /// Encode into `out` (at least [`HEADER_SIZE`] bytes), stamping the CRC32C.
    pub fn write_to_bytes(&self, out: &mut [u8]) -> Result<(), ParseError> {
        if out.len() < HEADER_SIZE {
            return Err(ParseError::InsufficientData {
                needed: HEADER_SIZE,
                offset: 0,
                actual: out.len(),
            });
        }
        out[..HEADER_SIZE].fill(0);
        write_le_u32(out, OFF_MAGIC, CFS_MAGIC)?;
        write_le_u16(out, OFF_VERSION, self.version)?;
        write_le_u32(out, OFF_BLOCK_SIZE, self.block_size.get())?;
        write_le_u32(out, OFF_DIR_CAPACITY, self.directory_capacity)?;
        write_le_u64(out, OFF_BLOCK_COUNT, self.block_count)?;
        write_le_u64(out, OFF_TABLE_START, self.table_start.0)?;
        write_le_u64(out, OFF_TABLE_BLOCKS, self.table_blocks)?;
        write_le_u64(out, OFF_DIR_START, self.directory_start.0)?;
        write_le_u64(out, OFF_DIR_BLOCKS, self.directory_blocks)?;
        write_le_u64(out, OFF_RESERVED, self.reserved_blocks)?;
        let checksum = crc32c::crc32c(&out[..OFF_CHECKSUM]);
        write_le_u32(out, OFF_CHECKSUM, checksum)
    }
}

//! Volume geometry: where the header, allocation table and directory live.
//!
//! ```text
//! block 0            header
//! 1 ..= T            allocation table (one u32 slot per volume block)
//! T+1 ..= T+D        directory records (64 bytes each)
//! T+D+1 ..           data blocks
//! ```
//!
//! Everything before the first data block is the reserved region.

use cfs_types::{
    BlockNumber, BlockSize, DIR_RECORD_SIZE, EntryId, MAX_BLOCK_COUNT, ParseError,
    TABLE_SLOT_SIZE, TABLE_START_BLOCK,
};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeLayout {
    pub block_size: BlockSize,
    pub block_count: u64,
    pub table_start: BlockNumber,
    pub table_blocks: u64,
    pub directory_start: BlockNumber,
    pub directory_blocks: u64,
    pub directory_capacity: u32,
}

impl VolumeLayout {
    /// Compute the layout for a volume of `block_count` blocks.
    ///
    /// Does not check that the volume has room for data blocks; the
    /// allocation table reports that as `VolumeTooSmall`.
    pub fn compute(
        block_count: u64,
        block_size: BlockSize,
        directory_capacity: u32,
    ) -> Result<Self, ParseError> {
        if block_count == 0 || block_count > MAX_BLOCK_COUNT {
            return Err(ParseError::InvalidField {
                field: "block_count",
                reason: "must be in 1..=0xFFFF_FFF0",
            });
        }
        if directory_capacity == 0 {
            return Err(ParseError::InvalidField {
                field: "directory_capacity",
                reason: "must hold at least the root record",
            });
        }

        let table_blocks = Self::table_blocks_for(block_count, block_size);
        let directory_bytes = u64::from(directory_capacity) * DIR_RECORD_SIZE as u64;
        let directory_blocks = block_size.blocks_for(directory_bytes);
        let directory_start = BlockNumber(TABLE_START_BLOCK.0 + table_blocks);

        Ok(Self {
            block_size,
            block_count,
            table_start: TABLE_START_BLOCK,
            table_blocks,
            directory_start,
            directory_blocks,
            directory_capacity,
        })
    }

    /// Table blocks needed to hold one slot per volume block.
    #[must_use]
    pub fn table_blocks_for(block_count: u64, block_size: BlockSize) -> u64 {
        block_size.blocks_for(block_count * TABLE_SLOT_SIZE as u64)
    }

    /// Header + table + directory.
    #[must_use]
    pub fn reserved_blocks(&self) -> u64 {
        1 + self.table_blocks + self.directory_blocks
    }

    #[must_use]
    pub fn data_start(&self) -> BlockNumber {
        BlockNumber(self.reserved_blocks())
    }

    #[must_use]
    pub fn slots_per_block(&self) -> u64 {
        self.block_size.as_u64() / TABLE_SLOT_SIZE as u64
    }

    /// Table block holding the slot for `block`.
    #[must_use]
    pub fn table_block_for(&self, block: BlockNumber) -> BlockNumber {
        BlockNumber(self.table_start.0 + block.0 / self.slots_per_block())
    }

    #[must_use]
    pub fn records_per_block(&self) -> u64 {
        self.block_size.as_u64() / DIR_RECORD_SIZE as u64
    }

    /// Directory block and byte offset within it holding record `id`.
    #[must_use]
    pub fn record_location(&self, id: EntryId) -> (BlockNumber, usize) {
        let per_block = self.records_per_block();
        let block = BlockNumber(self.directory_start.0 + u64::from(id.0) / per_block);
        let offset = (u64::from(id.0) % per_block) as usize * DIR_RECORD_SIZE;
        (block, offset)
    }
}

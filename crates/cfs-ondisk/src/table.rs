//! Allocation-table slot encoding.

use cfs_types::{
    BlockNumber, MAX_BLOCK_COUNT, ParseError, SLOT_END_OF_CHAIN, SLOT_FREE, SLOT_RESERVED,
    TABLE_SLOT_SIZE, read_le_u32, write_le_u32,
};
use serde::{Deserialize, Serialize};

/// Status of one volume block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TableSlot {
    Free,
    /// Header, table or directory block; never allocatable.
    Reserved,
    /// In use; the chain continues at the given block.
    Next(BlockNumber),
    /// In use; last block of its chain.
    EndOfChain,
}

impl TableSlot {
    #[must_use]
    pub fn decode(raw: u32) -> Self {
        match raw {
            SLOT_FREE => Self::Free,
            SLOT_RESERVED => Self::Reserved,
            SLOT_END_OF_CHAIN => Self::EndOfChain,
            next => Self::Next(BlockNumber(u64::from(next))),
        }
    }

    pub fn encode(self) -> Result<u32, ParseError> {
        match self {
            Self::Free => Ok(SLOT_FREE),
            Self::Reserved => Ok(SLOT_RESERVED),
            Self::EndOfChain => Ok(SLOT_END_OF_CHAIN),
            Self::Next(block) => {
                if block.0 >= MAX_BLOCK_COUNT {
                    return Err(ParseError::IntegerConversion {
                        field: "table_slot",
                    });
                }
                u32::try_from(block.0).map_err(|_| ParseError::IntegerConversion {
                    field: "table_slot",
                })
            }
        }
    }

    /// Whether the block belongs to some chain.
    #[must_use]
    pub fn is_in_use(self) -> bool {
        matches!(self, Self::Next(_) | Self::EndOfChain)
    }
}

/// Decode the first `count` slots of a table block.
pub fn decode_table_block(bytes: &[u8], count: usize) -> Result<Vec<TableSlot>, ParseError> {
    (0..count)
        .map(|i| read_le_u32(bytes, i * TABLE_SLOT_SIZE).map(TableSlot::decode))
        .collect()
}

/// Encode `slots` into a table block, padding the tail with `Reserved`.
pub fn encode_table_block(slots: &[TableSlot], out: &mut [u8]) -> Result<(), ParseError> {
    let capacity = out.len() / TABLE_SLOT_SIZE;
    if slots.len() > capacity {
        return Err(ParseError::InsufficientData {
            needed: slots.len() * TABLE_SLOT_SIZE,
            offset: 0,
            actual: out.len(),
        });
    }
    for i in 0..capacity {
        let raw = match slots.get(i) {
            Some(slot) => slot.encode()?,
            None => SLOT_RESERVED,
        };
        write_le_u32(out, i * TABLE_SLOT_SIZE, raw)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sentinels_decode_to_their_variants() {
        assert_eq!(TableSlot::decode(SLOT_FREE), TableSlot::Free);
        assert_eq!(TableSlot::decode(SLOT_RESERVED), TableSlot::Reserved);
        assert_eq!(TableSlot::decode(SLOT_END_OF_CHAIN), TableSlot::EndOfChain);
        assert_eq!(TableSlot::decode(0), TableSlot::Next(BlockNumber(0)));
        assert_eq!(TableSlot::decode(17), TableSlot::Next(BlockNumber(17)));
    }

    #[test]
    fn next_beyond_addressable_range_is_rejected() {
        assert!(TableSlot::Next(BlockNumber(MAX_BLOCK_COUNT)).encode().is_err());
        assert_eq!(TableSlot::Next(BlockNumber(5)).encode(), Ok(5));
    }

    #[test]
    fn block_codec_pads_tail_with_reserved() {
        let slots = [
            TableSlot::Reserved,
            TableSlot::Next(BlockNumber(3)),
            TableSlot::Free,
            TableSlot::EndOfChain,
        ];
        let mut block = vec![0_u8; 32];
        encode_table_block(&slots, &mut block).expect("encode");
        let decoded = decode_table_block(&block, 8).expect("decode");
        assert_eq!(&decoded[..4], &slots);
        assert!(decoded[4..].iter().all(|s| *s == TableSlot::Reserved));
    }

    #[test]
    fn block_codec_rejects_overflow() {
        let slots = vec![TableSlot::Free; 9];
        let mut block = vec![0_u8; 32];
        assert!(encode_table_block(&slots, &mut block).is_err());
    }

    #[test]
    fn in_use_classification() {
        assert!(TableSlot::EndOfChain.is_in_use());
        assert!(TableSlot::Next(BlockNumber(1)).is_in_use());
        assert!(!TableSlot::Free.is_in_use());
        assert!(!TableSlot::Reserved.is_in_use());
    }
}

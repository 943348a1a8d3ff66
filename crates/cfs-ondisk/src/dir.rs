//! Directory record encoding (64 bytes per record).

use cfs_types::{
    ATTR_DIRECTORY, BlockNumber, DIR_RECORD_SIZE, EntryId, NAME_MAX, ParseError,
    SLOT_END_OF_CHAIN, ensure_slice, read_le_u32, read_le_u64, write_bytes,
    write_le_u32, write_le_u64,
};
use serde::{Deserialize, Serialize};

const OFF_IN_USE: usize = 0x00;
const OFF_NAME_LEN: usize = 0x01;
const OFF_PARENT: usize = 0x04;
const OFF_FIRST_BLOCK: usize = 0x08;
const OFF_ATTRIBUTES: usize = 0x0C;
const OFF_SIZE: usize = 0x10;
const OFF_NAME: usize = 0x18;

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DirRecord {
    pub in_use: bool,
    pub parent: EntryId,
    /// Head of the data chain; `None` for empty files and directories.
    pub first_block: Option<BlockNumber>,
    pub attributes: u32,
    pub size: u64,
    pub name: String,
}

impl DirRecord {
    /// Root directory record.
    #[must_use]
    pub fn root() -> Self {
        Self {
            in_use: true,
            parent: EntryId::ROOT,
            first_block: None,
            attributes: ATTR_DIRECTORY,
            size: 0,
            name: String::new(),
        }
    }

    #[must_use]
    pub fn is_dir(&self) -> bool {
        self.attributes & ATTR_DIRECTORY != 0
    }

    pub fn parse_from_bytes(bytes: &[u8]) -> Result<Self, ParseError> {
        let raw = ensure_slice(bytes, 0, DIR_RECORD_SIZE)?;
        let in_use = match raw[OFF_IN_USE] {
            0 => false,
            1 => true,
            _ => {
                return Err(ParseError::InvalidField {
                    field: "in_use",
                    reason: "must be 0 or 1",
                });
            }
        };
        if !in_use {
            return Ok(Self::default());
        }

        let name_len = usize::from(raw[OFF_NAME_LEN]);
        if name_len > NAME_MAX {
            return Err(ParseError::InvalidField {
                field: "name_len",
                reason: "exceeds record name capacity",
            });
        }
        let name_bytes = &raw[OFF_NAME..OFF_NAME + name_len];
        if name_bytes.contains(&0) || name_bytes.contains(&b'/') {
            return Err(ParseError::InvalidField {
                field: "name",
                reason: "contains NUL or '/'",
            });
        }

        let name = std::str::from_utf8(name_bytes).map_err(|_| ParseError::InvalidField {
            field: "name",
            reason: "not valid UTF-8",
        })?;

        let first = read_le_u32(raw, OFF_FIRST_BLOCK)?;
        let first_block = (first != SLOT_END_OF_CHAIN).then(|| BlockNumber(u64::from(first)));

        Ok(Self {
            in_use,
            parent: EntryId(read_le_u32(raw, OFF_PARENT)?),
            first_block,
            attributes: read_le_u32(raw, OFF_ATTRIBUTES)?,
            size: read_le_u64(raw, OFF_SIZE)?,
            name: name.to_owned(),
        })
    }

    /// Encode into `out[..64]`. Unused records are written as all zeros.
    pub fn write_to_bytes(&self, out: &mut [u8]) -> Result<(), ParseError> {
        if out.len() < DIR_RECORD_SIZE {
            return Err(ParseError::InsufficientData {
                needed: DIR_RECORD_SIZE,
                offset: 0,
                actual: out.len(),
            });
        }
        out[..DIR_RECORD_SIZE].fill(0);
        if !self.in_use {
            return Ok(());
        }

        let name = self.name.as_bytes();
        let name_len = u8::try_from(name.len())
            .ok()
            .filter(|len| usize::from(*len) <= NAME_MAX)
            .ok_or(ParseError::InvalidField {
                field: "name",
                reason: "longer than 40 bytes",
            })?;
        let first = match self.first_block {
            Some(block) => u32::try_from(block.0).map_err(|_| ParseError::IntegerConversion {
                field: "first_block",
            })?,
            None => SLOT_END_OF_CHAIN,
        };

        out[OFF_IN_USE] = 1;
        out[OFF_NAME_LEN] = name_len;
        write_le_u32(out, OFF_PARENT, self.parent.0)?;
        write_le_u32(out, OFF_FIRST_BLOCK, first)?;
        write_le_u32(out, OFF_ATTRIBUTES, self.attributes)?;
        write_le_u64(out, OFF_SIZE, self.size)?;
        write_bytes(out, OFF_NAME, name)
    }
}

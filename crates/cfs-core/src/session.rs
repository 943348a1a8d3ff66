//! Open-file sessions and the fixed-capacity table that hands them out.

use crate::flags::Access;
use cfs_error::{CfsError, Result};
use cfs_types::{BlockNumber, EntryId};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque handle naming one open session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SessionHandle(pub u32);

impl fmt::Display for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Per-open-file state.
///
/// Position invariant: at file offset 0 the session sits on the chain head
/// with `buffer_cursor == 0`. At any offset `o > 0` it sits on block
/// `(o - 1) / block_size` of the chain with
/// `buffer_cursor == o - index * block_size`, so `1 <= buffer_cursor <= block_size`.
#[derive(Debug)]
pub struct Session {
    pub(crate) entry: EntryId,
    pub(crate) access: Access,
    /// `None` only while the file has no blocks.
    pub(crate) current_block: Option<BlockNumber>,
    /// One-block staging buffer, owned for the session's lifetime. Every
    /// stage fills it with a whole block.
    pub(crate) buffer: Vec<u8>,
    pub(crate) buffer_cursor: usize,
    pub(crate) file_cursor: u64,
}

impl Session {
    pub(crate) fn new(entry: EntryId, access: Access, block_size: usize) -> Self {
        Self {
            entry,
            access,
            current_block: None,
            buffer: vec![0_u8; block_size],
            buffer_cursor: 0,
            file_cursor: 0,
        }
    }

    #[must_use]
    pub fn entry(&self) -> EntryId {
        self.entry
    }

    #[must_use]
    pub fn access(&self) -> Access {
        self.access
    }

    #[must_use]
    pub fn current_block(&self) -> Option<BlockNumber> {
        self.current_block
    }

    #[must_use]
    pub fn buffer_cursor(&self) -> usize {
        self.buffer_cursor
    }

    #[must_use]
    pub fn file_cursor(&self) -> u64 {
        self.file_cursor
    }
}

const WORD_BITS: usize = u64::BITS as usize;

/// Fixed pool of session slots.
///
/// A bitmap of free slots (bit set = free) gives the lowest free slot in
/// one `trailing_zeros` per word, so handle assignment is deterministic.
#[derive(Debug)]
pub struct SessionTable {
    slots: Vec<Option<Session>>,
    free: Vec<u64>,
}

impl SessionTable {
    pub fn new(capacity: usize) -> Result<Self> {
        if capacity == 0 || u32::try_from(capacity).is_err() {
            return Err(CfsError::InvalidArgument(
                "session capacity must be between 1 and u32::MAX",
            ));
        }
        Ok(Self {
            slots: (0..capacity).map(|_| None).collect(),
            free: Self::free_words(capacity),
        })
    }

    /// Bitmap with the first `capacity` bits set.
    fn free_words(capacity: usize) -> Vec<u64> {
        let words = capacity.div_ceil(WORD_BITS);
        let mut free = vec![u64::MAX; words];
        let tail = capacity % WORD_BITS;
        if tail != 0 {
            free[words - 1] = (1_u64 << tail) - 1;
        }
        free
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    #[must_use]
    pub fn open_count(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_some()).count()
    }

    #[must_use]
    pub fn has_free(&self) -> bool {
        self.free.iter().any(|word| *word != 0)
    }

    /// Place `session` in the lowest free slot.
    pub fn acquire(&mut self, session: Session) -> Result<SessionHandle> {
        let (word_idx, word) = self
            .free
            .iter_mut()
            .enumerate()
            .find(|(_, word)| **word != 0)
            .ok_or(CfsError::NoFreeSessions)?;
        let bit = word.trailing_zeros() as usize;
        *word &= !(1_u64 << bit);
        let idx = word_idx * WORD_BITS + bit;
        self.slots[idx] = Some(session);
        #[expect(clippy::cast_possible_truncation)]
        Ok(SessionHandle(idx as u32))
    }

    /// Remove and return the session behind `handle`.
    pub fn release(&mut self, handle: SessionHandle) -> Result<Session> {
        let idx = handle.0 as usize;
        let session = self
            .slots
            .get_mut(idx)
            .and_then(Option::take)
            .ok_or(CfsError::InvalidHandle(handle.0))?;
        self.free[idx / WORD_BITS] |= 1_u64 << (idx % WORD_BITS);
        Ok(session)
    }

    pub fn get(&self, handle: SessionHandle) -> Result<&Session> {
        self.slots
            .get(handle.0 as usize)
            .and_then(Option::as_ref)
            .ok_or(CfsError::InvalidHandle(handle.0))
    }

    pub fn get_mut(&mut self, handle: SessionHandle) -> Result<&mut Session> {
        self.slots
            .get_mut(handle.0 as usize)
            .and_then(Option::as_mut)
            .ok_or(CfsError::InvalidHandle(handle.0))
    }

    /// Whether any open session refers to `entry`.
    #[must_use]
    pub fn holds(&self, entry: EntryId) -> bool {
        self.slots.iter().flatten().any(|s| s.entry == entry)
    }

    /// Drop every open session.
    pub fn clear(&mut self) -> usize {
        let open = self.open_count();
        for slot in &mut self.slots {
            *slot = None;
        }
        self.free = Self::free_words(self.slots.len());
        open
    }
}

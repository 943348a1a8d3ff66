//! Buffered file I/O over block chains.
//!
//! Every read and write is split in three parts:
//!
//! 1. the bytes that fit in the current block (staged through the session
//!    buffer),
//! 2. whole blocks, transferred straight between the device and the
//!    caller's buffer,
//! 3. a trailing partial block, staged again.
//!
//! Writes extend the chain one block at a time when they step past its
//! tail. Cursor state is updated after each part completes, so a failure
//! leaves the session positioned after the last transfer that succeeded.

use crate::flags::OpenFlags;
use crate::session::{Session, SessionHandle, SessionTable};
use cfs_alloc::{AllocationTable, ChainLink};
use cfs_block::BlockDevice;
use cfs_dir::DirectoryService;
use cfs_error::{CfsError, Result};
use cfs_types::{BlockNumber, EntryId};
use std::io::SeekFrom;
use tracing::{debug, trace};

/// Borrowed view of the volume state one I/O call needs.
pub(crate) struct Engine<'a> {
    pub(crate) dev: &'a dyn BlockDevice,
    pub(crate) table: &'a mut AllocationTable,
    pub(crate) dir: &'a mut dyn DirectoryService,
    pub(crate) sessions: &'a mut SessionTable,
}

fn short_chain(block: BlockNumber) -> CfsError {
    CfsError::CorruptChain {
        block: block.0,
        detail: "chain ends before the recorded file size".to_owned(),
    }
}

/// Successor of `block` on the read path, where running off the chain
/// means the size bookkeeping is wrong.
fn advance(table: &AllocationTable, block: BlockNumber) -> Result<BlockNumber> {
    match table.next_block(block)? {
        ChainLink::Next(next) => Ok(next),
        ChainLink::End => Err(short_chain(block)),
    }
}

/// Successor of `block`, growing the chain by one block at its tail.
fn advance_or_extend(
    dev: &dyn BlockDevice,
    table: &mut AllocationTable,
    block: BlockNumber,
) -> Result<BlockNumber> {
    match table.next_block(block)? {
        ChainLink::Next(next) => Ok(next),
        ChainLink::End => table.extend_chain(dev, block, 1),
    }
}

/// Chain position of byte `offset`: the block holding byte `offset - 1`
/// and the cursor just past it, or the head at cursor 0 for offset 0.
fn locate(
    table: &AllocationTable,
    block_size: usize,
    head: Option<BlockNumber>,
    offset: u64,
) -> Result<(Option<BlockNumber>, usize)> {
    if offset == 0 {
        return Ok((head, 0));
    }
    let head = head.ok_or_else(|| CfsError::CorruptChain {
        block: 0,
        detail: format!("offset {offset} inside a file with no blocks"),
    })?;
    let bs = block_size as u64;
    let index = (offset - 1) / bs;
    let mut block = head;
    for _ in 0..index {
        block = advance(table, block)?;
    }
    #[expect(clippy::cast_possible_truncation)]
    let cursor = (offset - index * bs) as usize;
    Ok((Some(block), cursor))
}

/// Read `block` into the session's staging buffer.
fn stage(dev: &dyn BlockDevice, session: &mut Session, block: BlockNumber) -> Result<()> {
    dev.read_block_into(block, &mut session.buffer)
}

/// Record a larger file size once a write part has landed.
fn grow(
    dev: &dyn BlockDevice,
    dir: &mut dyn DirectoryService,
    entry: EntryId,
    size: &mut u64,
    cursor: u64,
) -> Result<()> {
    if cursor > *size {
        dir.set_size(dev, entry, cursor)?;
        *size = cursor;
    }
    Ok(())
}

impl Engine<'_> {
    pub(crate) fn open(self, path: &str, flags: OpenFlags) -> Result<SessionHandle> {
        let Self {
            dev,
            table,
            dir,
            sessions,
        } = self;
        let access = flags.access()?;
        if !sessions.has_free() {
            return Err(CfsError::NoFreeSessions);
        }

        let (mut entry, existed) = match dir.resolve(path) {
            Ok(entry) => (entry, true),
            Err(CfsError::NotFound(_)) if flags.contains(OpenFlags::CREATE) => {
                dir.create(dev, path)?;
                (dir.resolve(path)?, false)
            }
            Err(err) => return Err(err),
        };
        if entry.is_dir() {
            return Err(CfsError::InvalidPath(path.to_owned()));
        }

        if existed && flags.contains(OpenFlags::TRUNCATE) {
            if sessions.holds(entry.id) {
                return Err(CfsError::Busy(path.to_owned()));
            }
            let released = table.release_chain(dev, entry.first_block)?;
            dir.delete(dev, path)?;
            dir.create(dev, path)?;
            entry = dir.resolve(path)?;
            debug!(path, released, "file truncated");
        }

        let block_size = table.layout().block_size.as_usize();
        let mut session = Session::new(entry.id, access, block_size);
        session.current_block = entry.first_block;
        if flags.contains(OpenFlags::APPEND) && entry.size > 0 {
            let head = entry.first_block.ok_or_else(|| CfsError::CorruptChain {
                block: 0,
                detail: format!("{path} has size {} but no blocks", entry.size),
            })?;
            let chain = table.chain(head)?;
            let needed = table.layout().block_size.blocks_for(entry.size);
            let Some(last) = usize::try_from(needed - 1)
                .ok()
                .and_then(|idx| chain.get(idx))
            else {
                return Err(short_chain(head));
            };
            #[expect(clippy::cast_possible_truncation)]
            let cursor = (entry.size - (needed - 1) * block_size as u64) as usize;
            session.current_block = Some(*last);
            session.buffer_cursor = cursor;
            session.file_cursor = entry.size;
        }

        let handle = sessions.acquire(session)?;
        debug!(
            handle = handle.0,
            entry = entry.id.0,
            path,
            flags = flags.bits(),
            "session opened"
        );
        Ok(handle)
    }

    pub(crate) fn read(self, handle: SessionHandle, out: &mut [u8]) -> Result<usize> {
        let Self {
            dev,
            table,
            dir,
            sessions,
        } = self;
        let session = sessions.get_mut(handle)?;
        if !session.access.can_read() {
            return Err(CfsError::AccessMode {
                handle: handle.0,
                operation: "reading",
            });
        }

        let entry = dir.entry(session.entry)?;
        let remaining = entry.size.saturating_sub(session.file_cursor);
        let count = usize::try_from(remaining).map_or(out.len(), |r| r.min(out.len()));
        if count == 0 {
            return Ok(0);
        }
        if session.current_block.is_none() {
            // Opened while empty; another session has written since.
            session.current_block = entry.first_block;
        }
        let mut block = session.current_block.ok_or_else(|| CfsError::CorruptChain {
            block: 0,
            detail: format!("entry {} has size {} but no blocks", entry.id, entry.size),
        })?;
        let bs = session.buffer.len();
        let mut done = 0;

        let part1 = count.min(bs - session.buffer_cursor);
        if part1 > 0 {
            stage(dev, session, block)?;
            let start = session.buffer_cursor;
            out[..part1].copy_from_slice(&session.buffer[start..start + part1]);
            session.buffer_cursor += part1;
            session.file_cursor += part1 as u64;
            done = part1;
            trace!(handle = handle.0, block = block.0, bytes = part1, "read part 1");
        }

        while count - done >= bs {
            let next = advance(table, block)?;
            dev.read_block_into(next, &mut out[done..done + bs])?;
            block = next;
            session.current_block = Some(next);
            session.buffer_cursor = bs;
            session.file_cursor += bs as u64;
            done += bs;
            trace!(handle = handle.0, block = next.0, "read part 2 block");
        }

        let tail = count - done;
        if tail > 0 {
            let next = advance(table, block)?;
            stage(dev, session, next)?;
            out[done..count].copy_from_slice(&session.buffer[..tail]);
            session.current_block = Some(next);
            session.buffer_cursor = tail;
            session.file_cursor += tail as u64;
            done = count;
            trace!(handle = handle.0, block = next.0, bytes = tail, "read part 3");
        }

        Ok(done)
    }

    pub(crate) fn write(self, handle: SessionHandle, data: &[u8]) -> Result<usize> {
        let Self {
            dev,
            table,
            dir,
            sessions,
        } = self;
        let session = sessions.get_mut(handle)?;
        if !session.access.can_write() {
            return Err(CfsError::AccessMode {
                handle: handle.0,
                operation: "writing",
            });
        }
        if data.is_empty() {
            return Ok(0);
        }

        let entry = dir.entry(session.entry)?;
        let mut size = entry.size;
        if session.current_block.is_none() {
            session.current_block = entry.first_block;
        }
        let mut block = if let Some(block) = session.current_block {
            block
        } else {
            let head = table.allocate_chain(dev, 1)?;
            if let Err(err) = dir.set_first_block(dev, entry.id, Some(head)) {
                table.release_chain(dev, Some(head))?;
                return Err(err);
            }
            session.current_block = Some(head);
            debug!(handle = handle.0, block = head.0, "first block allocated");
            head
        };
        let bs = session.buffer.len();
        let mut done = 0;

        let part1 = data.len().min(bs - session.buffer_cursor);
        if part1 > 0 {
            stage(dev, session, block)?;
            let start = session.buffer_cursor;
            session.buffer[start..start + part1].copy_from_slice(&data[..part1]);
            dev.write_block(block, &session.buffer)?;
            session.buffer_cursor += part1;
            session.file_cursor += part1 as u64;
            done = part1;
            grow(dev, dir, entry.id, &mut size, session.file_cursor)?;
            trace!(handle = handle.0, block = block.0, bytes = part1, "write part 1");
        }

        while data.len() - done >= bs {
            let next = advance_or_extend(dev, table, block)?;
            dev.write_block(next, &data[done..done + bs])?;
            block = next;
            session.current_block = Some(next);
            session.buffer_cursor = bs;
            session.file_cursor += bs as u64;
            done += bs;
            grow(dev, dir, entry.id, &mut size, session.file_cursor)?;
            trace!(handle = handle.0, block = next.0, "write part 2 block");
        }

        let tail = data.len() - done;
        if tail > 0 {
            let next = advance_or_extend(dev, table, block)?;
            stage(dev, session, next)?;
            session.buffer[..tail].copy_from_slice(&data[done..]);
            dev.write_block(next, &session.buffer)?;
            session.current_block = Some(next);
            session.buffer_cursor = tail;
            session.file_cursor += tail as u64;
            done += tail;
            grow(dev, dir, entry.id, &mut size, session.file_cursor)?;
            trace!(handle = handle.0, block = next.0, bytes = tail, "write part 3");
        }

        Ok(done)
    }

    /// Reposition a session. The target must lie within `0..=size`.
    pub(crate) fn seek(self, handle: SessionHandle, pos: SeekFrom) -> Result<u64> {
        let Self {
            table,
            dir,
            sessions,
            ..
        } = self;
        let session = sessions.get_mut(handle)?;
        let entry = dir.entry(session.entry)?;
        let target = match pos {
            SeekFrom::Start(offset) => i128::from(offset),
            SeekFrom::Current(delta) => i128::from(session.file_cursor) + i128::from(delta),
            SeekFrom::End(delta) => i128::from(entry.size) + i128::from(delta),
        };
        if target < 0 || target > i128::from(entry.size) {
            return Err(CfsError::InvalidSeek(target));
        }
        let offset = u64::try_from(target).map_err(|_| CfsError::InvalidSeek(target))?;

        let (block, cursor) = locate(table, session.buffer.len(), entry.first_block, offset)?;
        session.current_block = block;
        session.buffer_cursor = cursor;
        session.file_cursor = offset;
        trace!(handle = handle.0, offset, "seek");
        Ok(offset)
    }

    pub(crate) fn close(self, handle: SessionHandle) -> Result<()> {
        let session = self.sessions.release(handle)?;
        debug!(
            handle = handle.0,
            entry = session.entry.0,
            file_cursor = session.file_cursor,
            "session closed"
        );
        Ok(())
    }
}

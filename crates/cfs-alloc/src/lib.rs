#![forbid(unsafe_code)]
//! Block allocation table.
//!
//! One slot per volume block records whether the block is free, reserved,
//! or part of a chain (and if so, which block follows it). Files are stored
//! as singly linked chains of blocks; the table is the only authority on
//! chain topology.
//!
//! ## Design
//!
//! - Free blocks are picked first-fit in ascending index order. No
//!   contiguity is required: chains are linked lists, not extents.
//! - A scan hint records the lowest index that may still be free, so
//!   allocation skips the used prefix without changing first-fit order.
//! - Allocation collects every candidate before touching a slot, so an
//!   `OutOfSpace` failure leaves the table exactly as it was.
//! - Every mutation persists only the table blocks it dirtied.

use cfs_block::BlockDevice;
use cfs_error::{CfsError, Result};
use cfs_ondisk::{TableSlot, VolumeHeader, VolumeLayout, decode_table_block, encode_table_block};
use cfs_types::BlockNumber;
use serde::Serialize;
use std::collections::BTreeSet;
use tracing::{debug, trace, warn};

/// Result of following one chain link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainLink {
    Next(BlockNumber),
    End,
}

/// Slot counts by state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct AllocStats {
    pub total_blocks: u64,
    pub reserved_blocks: u64,
    pub free_blocks: u64,
    pub used_blocks: u64,
}

/// In-memory allocation table for one mounted volume.
#[derive(Debug, Clone)]
pub struct AllocationTable {
    layout: VolumeLayout,
    slots: Vec<TableSlot>,
    free: u64,
    /// Lowest slot index that may be free.
    scan_hint: usize,
    /// Table blocks (relative to the table start) awaiting persistence.
    dirty: BTreeSet<u64>,
}

fn check_device(dev: &dyn BlockDevice, layout: &VolumeLayout) -> Result<()> {
    if dev.block_size() != layout.block_size.get() {
        return Err(CfsError::Format(format!(
            "device block size {} does not match volume block size {}",
            dev.block_size(),
            layout.block_size
        )));
    }
    if dev.block_count() < layout.block_count {
        return Err(CfsError::Format(format!(
            "device holds {} blocks, volume needs {}",
            dev.block_count(),
            layout.block_count
        )));
    }
    Ok(())
}

impl AllocationTable {
    // ── Lifecycle ───────────────────────────────────────────────────────

    /// Build a fresh table: reserved region marked `Reserved`, everything
    /// else `Free`. Persists every table block.
    pub fn initialize(dev: &dyn BlockDevice, layout: &VolumeLayout) -> Result<Self> {
        check_device(dev, layout)?;
        let reserved = layout.reserved_blocks();
        if layout.block_count <= reserved {
            return Err(CfsError::VolumeTooSmall {
                block_count: layout.block_count,
                reserved,
            });
        }

        let block_count = usize::try_from(layout.block_count)
            .map_err(|_| CfsError::Format("block count does not fit usize".to_owned()))?;
        let mut slots = vec![TableSlot::Free; block_count];
        for slot in slots.iter_mut().take(BlockNumber(reserved).index()) {
            *slot = TableSlot::Reserved;
        }

        let mut table = Self {
            layout: *layout,
            slots,
            free: layout.block_count - reserved,
            scan_hint: BlockNumber(reserved).index(),
            dirty: BTreeSet::new(),
        };
        table.flush(dev)?;
        debug!(
            block_count = layout.block_count,
            reserved,
            table_blocks = layout.table_blocks,
            "allocation table initialized"
        );
        Ok(table)
    }

    /// Read the persisted table described by `header`.
    pub fn load(dev: &dyn BlockDevice, header: &VolumeHeader) -> Result<Self> {
        let expected_blocks = VolumeLayout::table_blocks_for(header.block_count, header.block_size);
        if header.table_blocks != expected_blocks {
            return Err(CfsError::CorruptTable(format!(
                "header records {} table blocks, {} blocks need {expected_blocks}",
                header.table_blocks, header.block_count
            )));
        }
        let layout = header
            .layout()
            .map_err(|err| CfsError::CorruptTable(err.to_string()))?;
        check_device(dev, &layout)?;

        let block_count = usize::try_from(layout.block_count)
            .map_err(|_| CfsError::CorruptTable("block count does not fit usize".to_owned()))?;
        let per_block = usize::try_from(layout.slots_per_block())
            .map_err(|_| CfsError::CorruptTable("slots per block overflow".to_owned()))?;
        let mut slots = Vec::with_capacity(block_count);
        for rel in 0..layout.table_blocks {
            let raw = dev.read_block(BlockNumber(layout.table_start.0 + rel))?;
            let wanted = per_block.min(block_count - slots.len());
            let decoded = decode_table_block(raw.as_slice(), wanted)
                .map_err(|err| CfsError::CorruptTable(err.to_string()))?;
            slots.extend(decoded);
        }

        let reserved = layout.reserved_blocks();
        let mut free = 0_u64;
        for (idx, slot) in slots.iter().enumerate() {
            let block = idx as u64;
            match (*slot, block < reserved) {
                (TableSlot::Reserved, true) => {}
                (_, true) => {
                    return Err(CfsError::CorruptTable(format!(
                        "slot {block} lies in the reserved region but is {slot:?}"
                    )));
                }
                (TableSlot::Reserved, false) => {
                    return Err(CfsError::CorruptTable(format!(
                        "data block {block} is marked reserved"
                    )));
                }
                (TableSlot::Free, false) => free += 1,
                (TableSlot::Next(next), false) => {
                    if next.0 < reserved || next.0 >= layout.block_count {
                        return Err(CfsError::CorruptTable(format!(
                            "slot {block} links to block {next} outside the data region"
                        )));
                    }
                }
                (TableSlot::EndOfChain, false) => {}
            }
        }

        let scan_hint = slots
            .iter()
            .position(|slot| *slot == TableSlot::Free)
            .unwrap_or(slots.len());
        debug!(
            block_count = layout.block_count,
            free,
            "allocation table loaded"
        );
        Ok(Self {
            layout,
            slots,
            free,
            scan_hint,
            dirty: BTreeSet::new(),
        })
    }

    /// Persist every table block.
    pub fn flush(&mut self, dev: &dyn BlockDevice) -> Result<()> {
        self.dirty.extend(0..self.layout.table_blocks);
        self.persist(dev)
    }

    fn persist(&mut self, dev: &dyn BlockDevice) -> Result<()> {
        let per_block = self.layout.slots_per_block();
        let mut buf = vec![0_u8; self.layout.block_size.as_usize()];
        while let Some(rel) = self.dirty.first().copied() {
            let start = BlockNumber(rel * per_block).index().min(self.slots.len());
            let end = BlockNumber((rel + 1) * per_block)
                .index()
                .min(self.slots.len());
            encode_table_block(&self.slots[start..end], &mut buf)
                .map_err(|err| CfsError::CorruptTable(err.to_string()))?;
            dev.write_block(BlockNumber(self.layout.table_start.0 + rel), &buf)?;
            self.dirty.remove(&rel);
            trace!(table_block = rel, "table block persisted");
        }
        Ok(())
    }

    fn set_slot(&mut self, block: BlockNumber, slot: TableSlot) {
        self.slots[block.index()] = slot;
        self.dirty.insert(block.0 / self.layout.slots_per_block());
    }

    // ── Queries ─────────────────────────────────────────────────────────

    #[must_use]
    pub fn layout(&self) -> &VolumeLayout {
        &self.layout
    }

    #[must_use]
    pub fn block_count(&self) -> u64 {
        self.layout.block_count
    }

    #[must_use]
    pub fn reserved_blocks(&self) -> u64 {
        self.layout.reserved_blocks()
    }

    #[must_use]
    pub fn free_count(&self) -> u64 {
        self.free
    }

    /// Slot for `block`, or `None` if out of range.
    #[must_use]
    pub fn slot(&self, block: BlockNumber) -> Option<TableSlot> {
        self.slots.get(block.index()).copied()
    }

    #[must_use]
    pub fn slots(&self) -> &[TableSlot] {
        &self.slots
    }

    #[must_use]
    pub fn stats(&self) -> AllocStats {
        let reserved = self.reserved_blocks();
        AllocStats {
            total_blocks: self.layout.block_count,
            reserved_blocks: reserved,
            free_blocks: self.free,
            used_blocks: self.layout.block_count - reserved - self.free,
        }
    }

    /// Successor of `block` in its chain.
    pub fn next_block(&self, block: BlockNumber) -> Result<ChainLink> {
        match self.slot(block) {
            None => Err(CfsError::InvalidBlock {
                block: block.0,
                detail: "out of range",
            }),
            Some(TableSlot::Free) => Err(CfsError::InvalidBlock {
                block: block.0,
                detail: "block is free",
            }),
            Some(TableSlot::Reserved) => Err(CfsError::InvalidBlock {
                block: block.0,
                detail: "block is reserved",
            }),
            Some(TableSlot::Next(next)) => Ok(ChainLink::Next(next)),
            Some(TableSlot::EndOfChain) => Ok(ChainLink::End),
        }
    }

    /// Every block of the chain starting at `head`, in order.
    pub fn chain(&self, head: BlockNumber) -> Result<Vec<BlockNumber>> {
        let mut blocks = vec![head];
        let mut current = head;
        while let ChainLink::Next(next) = self.next_block(current)? {
            if blocks.len() as u64 >= self.layout.block_count {
                return Err(CfsError::CorruptChain {
                    block: head.0,
                    detail: format!("chain exceeds {} blocks", self.layout.block_count),
                });
            }
            blocks.push(next);
            current = next;
        }
        Ok(blocks)
    }

    /// Last block of the chain starting at `head`.
    pub fn last_block(&self, head: BlockNumber) -> Result<BlockNumber> {
        let mut current = head;
        for _ in 0..self.layout.block_count {
            match self.next_block(current)? {
                ChainLink::Next(next) => current = next,
                ChainLink::End => return Ok(current),
            }
        }
        Err(CfsError::CorruptChain {
            block: head.0,
            detail: format!("no end of chain within {} blocks", self.layout.block_count),
        })
    }

    // ── Mutation ────────────────────────────────────────────────────────

    /// First `count` free blocks at or after the scan hint. Does not mutate.
    fn find_free(&self, count: u64) -> Result<Vec<BlockNumber>> {
        if count == 0 {
            return Err(CfsError::InvalidArgument("chain length must be at least one block"));
        }
        if count > self.free {
            return Err(CfsError::OutOfSpace {
                requested: count,
                available: self.free,
            });
        }
        let picked: Vec<BlockNumber> = self.slots[self.scan_hint..]
            .iter()
            .enumerate()
            .filter(|(_, slot)| **slot == TableSlot::Free)
            .map(|(offset, _)| BlockNumber((self.scan_hint + offset) as u64))
            .take(BlockNumber(count).index())
            .collect();
        if (picked.len() as u64) < count {
            return Err(CfsError::CorruptTable(format!(
                "free count {} disagrees with table contents",
                self.free
            )));
        }
        Ok(picked)
    }

    /// Link `blocks` into a chain in the given order and mark them used.
    fn link(&mut self, blocks: &[BlockNumber]) {
        for pair in blocks.windows(2) {
            self.set_slot(pair[0], TableSlot::Next(pair[1]));
        }
        if let Some(last) = blocks.last() {
            self.set_slot(*last, TableSlot::EndOfChain);
            self.scan_hint = last.index() + 1;
        }
        self.free -= blocks.len() as u64;
    }

    /// Allocate a new chain of `count` blocks and return its head.
    pub fn allocate_chain(&mut self, dev: &dyn BlockDevice, count: u64) -> Result<BlockNumber> {
        let blocks = self.find_free(count)?;
        let head = blocks[0];
        self.link(&blocks);
        self.persist(dev)?;
        debug!(block = head.0, count, free = self.free, "chain allocated");
        Ok(head)
    }

    /// Append `count` new blocks after `last`, which must end its chain.
    /// Returns the first new block.
    pub fn extend_chain(
        &mut self,
        dev: &dyn BlockDevice,
        last: BlockNumber,
        count: u64,
    ) -> Result<BlockNumber> {
        if self.slot(last) != Some(TableSlot::EndOfChain) {
            return Err(CfsError::InvalidChainTail(last.0));
        }
        let blocks = self.find_free(count)?;
        let first = blocks[0];
        self.link(&blocks);
        self.set_slot(last, TableSlot::Next(first));
        self.persist(dev)?;
        debug!(tail = last.0, block = first.0, count, free = self.free, "chain extended");
        Ok(first)
    }

    /// Free every block of the chain starting at `head` and return how many
    /// were released.
    ///
    /// `None` (an empty file) and an already-free head are no-ops. A chain
    /// that runs into a free slot is released up to that slot.
    pub fn release_chain(&mut self, dev: &dyn BlockDevice, head: Option<BlockNumber>) -> Result<u64> {
        let Some(head) = head else {
            return Ok(0);
        };

        let mut doomed = Vec::new();
        let mut current = head;
        loop {
            match self.slot(current) {
                None => {
                    return Err(CfsError::InvalidBlock {
                        block: current.0,
                        detail: "out of range",
                    });
                }
                Some(TableSlot::Reserved) if doomed.is_empty() => {
                    return Err(CfsError::InvalidBlock {
                        block: current.0,
                        detail: "block is reserved",
                    });
                }
                Some(TableSlot::Reserved) => {
                    return Err(CfsError::CorruptChain {
                        block: head.0,
                        detail: format!("chain runs into reserved block {current}"),
                    });
                }
                Some(TableSlot::Free) => {
                    if doomed.is_empty() {
                        warn!(block = head.0, "release of already free chain ignored");
                    } else {
                        warn!(
                            block = head.0,
                            free_block = current.0,
                            "chain ends in a free slot"
                        );
                    }
                    break;
                }
                Some(TableSlot::EndOfChain) => {
                    doomed.push(current);
                    break;
                }
                Some(TableSlot::Next(next)) => {
                    doomed.push(current);
                    if doomed.len() as u64 >= self.layout.block_count {
                        return Err(CfsError::CorruptChain {
                            block: head.0,
                            detail: "cycle detected".to_owned(),
                        });
                    }
                    current = next;
                }
            }
        }

        for block in &doomed {
            self.set_slot(*block, TableSlot::Free);
            self.scan_hint = self.scan_hint.min(block.index());
        }
        let released = doomed.len() as u64;
        self.free += released;
        self.persist(dev)?;
        if released > 0 {
            debug!(block = head.0, released, free = self.free, "chain released");
        }
        Ok(released)
    }
}

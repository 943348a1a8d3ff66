#![forbid(unsafe_code)]
//! Directory service.
//!
//! A flat table of fixed-size records forms the whole namespace: each record
//! names its parent record, so directories are just records with the
//! directory attribute that other records point at. Record 0 is the root.
//!
//! Entries are handed out by value and addressed by [`EntryId`]. Callers
//! that need to change an entry (the I/O engine growing a file) go through
//! [`DirectoryService::set_size`] and [`DirectoryService::set_first_block`]
//! instead of holding references into directory storage.
//!
//! The directory never touches the allocation table. Removing a file's
//! entry does not free its blocks; the caller releases the chain first.

use cfs_block::BlockDevice;
use cfs_error::{CfsError, Result};
use cfs_ondisk::{DirRecord, VolumeHeader, VolumeLayout};
use cfs_types::{ATTR_DIRECTORY, BlockNumber, DIR_RECORD_SIZE, EntryId, NAME_MAX};
use serde::Serialize;
use tracing::debug;

/// Snapshot of one directory entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DirEntry {
    pub id: EntryId,
    pub name: String,
    pub parent: EntryId,
    pub attributes: u32,
    pub size: u64,
    pub first_block: Option<BlockNumber>,
}

impl DirEntry {
    fn from_record(id: EntryId, record: &DirRecord) -> Self {
        Self {
            id,
            name: record.name.clone(),
            parent: record.parent,
            attributes: record.attributes,
            size: record.size,
            first_block: record.first_block,
        }
    }

    #[must_use]
    pub fn is_dir(&self) -> bool {
        self.attributes & ATTR_DIRECTORY != 0
    }
}

/// Name lookup and entry bookkeeping consumed by the I/O engine.
///
/// Mutating calls receive the block device so implementations can persist
/// the change before returning.
pub trait DirectoryService {
    /// Entry named by `path`.
    fn resolve(&self, path: &str) -> Result<DirEntry>;

    /// Create a zero-length file entry at `path`.
    fn create(&mut self, dev: &dyn BlockDevice, path: &str) -> Result<DirEntry>;

    /// Remove the entry at `path`. Its data chain is left alone.
    fn delete(&mut self, dev: &dyn BlockDevice, path: &str) -> Result<()>;

    /// Entry by id.
    fn entry(&self, id: EntryId) -> Result<DirEntry>;

    fn set_size(&mut self, dev: &dyn BlockDevice, id: EntryId, size: u64) -> Result<()>;

    fn set_first_block(
        &mut self,
        dev: &dyn BlockDevice,
        id: EntryId,
        first_block: Option<BlockNumber>,
    ) -> Result<()>;
}

/// Split `path` into name components.
///
/// Empty components and `.` are skipped; `..` and NUL bytes are rejected.
pub fn components(path: &str) -> Result<Vec<&str>> {
    let mut parts = Vec::new();
    for part in path.split('/') {
        match part {
            "" | "." => {}
            ".." => return Err(CfsError::InvalidPath(path.to_owned())),
            name if name.contains('\0') => return Err(CfsError::InvalidPath(path.to_owned())),
            name => parts.push(name),
        }
    }
    Ok(parts)
}

/// On-disk directory with write-through persistence.
#[derive(Debug, Clone)]
pub struct Directory {
    layout: VolumeLayout,
    records: Vec<DirRecord>,
}

impl Directory {
    /// Write an empty namespace (root only) to the directory region.
    pub fn format(dev: &dyn BlockDevice, layout: &VolumeLayout) -> Result<Self> {
        let capacity = layout.directory_capacity as usize;
        let mut records = vec![DirRecord::default(); capacity];
        records[0] = DirRecord::root();
        let dir = Self {
            layout: *layout,
            records,
        };
        for rel in 0..layout.directory_blocks {
            dir.write_block(dev, rel)?;
        }
        debug!(
            capacity = layout.directory_capacity,
            blocks = layout.directory_blocks,
            "directory formatted"
        );
        Ok(dir)
    }

    /// Read the directory region described by `header`.
    pub fn load(dev: &dyn BlockDevice, header: &VolumeHeader) -> Result<Self> {
        let layout = header
            .layout()
            .map_err(|err| CfsError::Format(err.to_string()))?;
        let capacity = layout.directory_capacity as usize;
        let mut records = Vec::with_capacity(capacity);
        for rel in 0..layout.directory_blocks {
            let block = BlockNumber(layout.directory_start.0 + rel);
            let raw = dev.read_block(block)?;
            for chunk in raw.as_slice().chunks_exact(DIR_RECORD_SIZE) {
                if records.len() == capacity {
                    break;
                }
                let record =
                    DirRecord::parse_from_bytes(chunk).map_err(|err| CfsError::Corruption {
                        block: block.0,
                        detail: format!("record {}: {err}", records.len()),
                    })?;
                records.push(record);
            }
        }

        let dir = Self { layout, records };
        dir.validate()?;
        debug!(entries = dir.iter().count(), "directory loaded");
        Ok(dir)
    }

    /// Structural checks: live root directory, every live record hangs off
    /// a live directory.
    fn validate(&self) -> Result<()> {
        let root = &self.records[0];
        if !root.in_use || !root.is_dir() {
            let (block, _) = self.layout.record_location(EntryId::ROOT);
            return Err(CfsError::Corruption {
                block: block.0,
                detail: "root record missing or not a directory".to_owned(),
            });
        }
        for (idx, record) in self.records.iter().enumerate().skip(1) {
            if !record.in_use {
                continue;
            }
            let parent_ok = self
                .records
                .get(record.parent.0 as usize)
                .is_some_and(|parent| parent.in_use && parent.is_dir());
            if !parent_ok || record.name.is_empty() {
                let id = EntryId(idx as u32);
                let (block, _) = self.layout.record_location(id);
                return Err(CfsError::Corruption {
                    block: block.0,
                    detail: format!("record {id} has invalid parent or empty name"),
                });
            }
        }
        Ok(())
    }

    /// Encode every record stored in directory block `rel` and write it.
    fn write_block(&self, dev: &dyn BlockDevice, rel: u64) -> Result<()> {
        let per_block = self.layout.records_per_block() as usize;
        let mut buf = vec![0_u8; self.layout.block_size.as_usize()];
        let first = rel as usize * per_block;
        for (slot, record) in self.records.iter().skip(first).take(per_block).enumerate() {
            let offset = slot * DIR_RECORD_SIZE;
            record
                .write_to_bytes(&mut buf[offset..offset + DIR_RECORD_SIZE])
                .map_err(|err| CfsError::Corruption {
                    block: self.layout.directory_start.0 + rel,
                    detail: err.to_string(),
                })?;
        }
        dev.write_block(BlockNumber(self.layout.directory_start.0 + rel), &buf)
    }

    fn persist(&self, dev: &dyn BlockDevice, id: EntryId) -> Result<()> {
        let (block, _) = self.layout.record_location(id);
        self.write_block(dev, block.0 - self.layout.directory_start.0)
    }

    fn record(&self, id: EntryId) -> Result<&DirRecord> {
        self.records
            .get(id.0 as usize)
            .filter(|record| record.in_use)
            .ok_or_else(|| CfsError::NotFound(format!("entry {id}")))
    }

    fn child(&self, parent: EntryId, name: &str) -> Option<EntryId> {
        self.records
            .iter()
            .enumerate()
            .skip(1)
            .find(|(_, r)| r.in_use && r.parent == parent && r.name == name)
            .map(|(idx, _)| EntryId(idx as u32))
    }

    fn lookup(&self, path: &str, parts: &[&str]) -> Result<EntryId> {
        let mut current = EntryId::ROOT;
        for part in parts {
            if !self.records[current.0 as usize].is_dir() {
                return Err(CfsError::NotDirectory(path.to_owned()));
            }
            current = self
                .child(current, part)
                .ok_or_else(|| CfsError::NotFound(path.to_owned()))?;
        }
        Ok(current)
    }

    fn insert(&mut self, dev: &dyn BlockDevice, path: &str, attributes: u32) -> Result<DirEntry> {
        let parts = components(path)?;
        let Some((name, parent_parts)) = parts.split_last() else {
            return Err(CfsError::Exists(path.to_owned()));
        };
        if name.len() > NAME_MAX {
            return Err(CfsError::NameTooLong((*name).to_owned()));
        }

        let parent = match self.lookup(path, parent_parts) {
            Ok(parent) => parent,
            Err(CfsError::NotFound(_)) => return Err(CfsError::ParentMissing(path.to_owned())),
            Err(err) => return Err(err),
        };
        if !self.records[parent.0 as usize].is_dir() {
            return Err(CfsError::NotDirectory(path.to_owned()));
        }
        if self.child(parent, name).is_some() {
            return Err(CfsError::Exists(path.to_owned()));
        }

        let idx = self
            .records
            .iter()
            .skip(1)
            .position(|r| !r.in_use)
            .map(|pos| pos + 1)
            .ok_or(CfsError::DirectoryFull)?;
        let id = EntryId(idx as u32);
        self.records[idx] = DirRecord {
            in_use: true,
            parent,
            first_block: None,
            attributes,
            size: 0,
            name: (*name).to_owned(),
        };
        self.persist(dev, id)?;
        debug!(entry = id.0, parent = parent.0, path, attributes, "entry created");
        Ok(DirEntry::from_record(id, &self.records[idx]))
    }

    /// Create an empty directory at `path`.
    pub fn mkdir(&mut self, dev: &dyn BlockDevice, path: &str) -> Result<DirEntry> {
        self.insert(dev, path, ATTR_DIRECTORY)
    }

    /// Children of the directory at `path`, sorted by name.
    pub fn list(&self, path: &str) -> Result<Vec<DirEntry>> {
        let dir = self.resolve(path)?;
        if !dir.is_dir() {
            return Err(CfsError::NotDirectory(path.to_owned()));
        }
        let mut children: Vec<DirEntry> = self
            .iter()
            .filter(|entry| entry.id != EntryId::ROOT && entry.parent == dir.id)
            .collect();
        children.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(children)
    }

    /// Every live entry, root included, in record order.
    pub fn iter(&self) -> impl Iterator<Item = DirEntry> + '_ {
        self.records
            .iter()
            .enumerate()
            .filter(|(_, r)| r.in_use)
            .map(|(idx, r)| DirEntry::from_record(EntryId(idx as u32), r))
    }

    /// Absolute path of `id`, built by walking parent links.
    #[must_use]
    pub fn path_of(&self, id: EntryId) -> String {
        let mut names = Vec::new();
        let mut current = id;
        while current != EntryId::ROOT && names.len() < self.records.len() {
            let Some(record) = self.records.get(current.0 as usize) else {
                break;
            };
            names.push(record.name.as_str());
            current = record.parent;
        }
        names.reverse();
        format!("/{}", names.join("/"))
    }

    #[must_use]
    pub fn capacity(&self) -> u32 {
        self.layout.directory_capacity
    }
}

impl DirectoryService for Directory {
    fn resolve(&self, path: &str) -> Result<DirEntry> {
        let parts = components(path)?;
        let id = self.lookup(path, &parts)?;
        Ok(DirEntry::from_record(id, &self.records[id.0 as usize]))
    }

    fn create(&mut self, dev: &dyn BlockDevice, path: &str) -> Result<DirEntry> {
        self.insert(dev, path, 0)
    }

    fn delete(&mut self, dev: &dyn BlockDevice, path: &str) -> Result<()> {
        let parts = components(path)?;
        if parts.is_empty() {
            return Err(CfsError::InvalidPath(path.to_owned()));
        }
        let id = self.lookup(path, &parts)?;
        if self.records[id.0 as usize].is_dir() && self.records.iter().any(|r| r.in_use && r.parent == id)
        {
            return Err(CfsError::NotEmpty(path.to_owned()));
        }
        self.records[id.0 as usize] = DirRecord::default();
        self.persist(dev, id)?;
        debug!(entry = id.0, path, "entry deleted");
        Ok(())
    }

    fn entry(&self, id: EntryId) -> Result<DirEntry> {
        self.record(id).map(|record| DirEntry::from_record(id, record))
    }

    fn set_size(&mut self, dev: &dyn BlockDevice, id: EntryId, size: u64) -> Result<()> {
        self.record(id)?;
        self.records[id.0 as usize].size = size;
        self.persist(dev, id)
    }

    fn set_first_block(
        &mut self,
        dev: &dyn BlockDevice,
        id: EntryId,
        first_block: Option<BlockNumber>,
    ) -> Result<()> {
        self.record(id)?;
        self.records[id.0 as usize].first_block = first_block;
        self.persist(dev, id)
    }
}

//! A mounted volume: device, header, allocation table, directory and the
//! open-session table, with the file and namespace API on top.

use crate::check::{self, CheckReport};
use crate::engine::Engine;
use crate::flags::OpenFlags;
use crate::options::{FormatOptions, MountOptions};
use crate::session::{Session, SessionHandle, SessionTable};
use cfs_alloc::{AllocationTable, ChainLink};
use cfs_block::{BlockDevice, ByteBlockDevice, ByteDevice, FileByteDevice};
use cfs_dir::{DirEntry, Directory, DirectoryService};
use cfs_error::{CfsError, Result};
use cfs_ondisk::{HEADER_SIZE, VolumeHeader, VolumeLayout};
use cfs_types::{BlockNumber, BlockSize, HEADER_BLOCK, ParseError};
use serde::Serialize;
use std::io::SeekFrom;
use std::path::Path;
use tracing::{debug, info};

fn format_error(err: &ParseError) -> CfsError {
    CfsError::Format(err.to_string())
}

/// Read and validate the header from the start of a raw image, before the
/// block size is known.
pub fn probe_header(dev: &dyn ByteDevice) -> Result<VolumeHeader> {
    if dev.len_bytes() < HEADER_SIZE as u64 {
        return Err(CfsError::Format(format!(
            "image is {} bytes, shorter than a volume header",
            dev.len_bytes()
        )));
    }
    let mut raw = [0_u8; HEADER_SIZE];
    dev.read_exact_at(0, &mut raw)?;
    VolumeHeader::parse_from_bytes(&raw).map_err(|err| format_error(&err))
}

/// Space and session usage of a mounted volume.
#[derive(Debug, Clone, Serialize)]
pub struct VolumeStats {
    pub block_size: u32,
    pub block_count: u64,
    pub reserved_blocks: u64,
    pub free_blocks: u64,
    pub used_blocks: u64,
    pub directory_capacity: u32,
    pub directory_entries: usize,
    pub open_sessions: usize,
    pub max_sessions: usize,
}

/// A formatted, mounted ChainFS volume.
///
/// ```ignore
/// let dev = ByteBlockDevice::new(MemoryByteDevice::new(512 * 256), 512)?;
/// let mut vol = Volume::format(dev, &FormatOptions::default())?;
/// let h = vol.open("/hello", OpenFlags::WRITE_ONLY | OpenFlags::CREATE)?;
/// vol.write(h, b"hi")?;
/// vol.close(h)?;
/// ```
pub struct Volume<D: BlockDevice> {
    dev: D,
    header: VolumeHeader,
    table: AllocationTable,
    dir: Directory,
    sessions: SessionTable,
}

impl<D: BlockDevice> std::fmt::Debug for Volume<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Volume")
            .field("header", &self.header)
            .field("free_blocks", &self.table.free_count())
            .field("open_sessions", &self.sessions.open_count())
            .finish_non_exhaustive()
    }
}

impl<D: BlockDevice> Volume<D> {
    // ── Lifecycle ───────────────────────────────────────────────────────

    /// Lay out an empty volume over the whole device.
    pub fn format(dev: D, options: &FormatOptions) -> Result<Self> {
        if dev.block_size() != options.block_size {
            return Err(CfsError::Format(format!(
                "device block size {} does not match requested {}",
                dev.block_size(),
                options.block_size
            )));
        }
        let block_size = BlockSize::new(options.block_size).map_err(|err| format_error(&err))?;
        let layout = VolumeLayout::compute(dev.block_count(), block_size, options.directory_capacity)
            .map_err(|err| format_error(&err))?;

        let table = AllocationTable::initialize(&dev, &layout)?;
        let dir = Directory::format(&dev, &layout)?;
        let header = VolumeHeader::from_layout(&layout);
        let mut raw = vec![0_u8; block_size.as_usize()];
        header
            .write_to_bytes(&mut raw)
            .map_err(|err| format_error(&err))?;
        dev.write_block(HEADER_BLOCK, &raw)?;
        dev.sync()?;
        info!(
            block_size = block_size.get(),
            block_count = layout.block_count,
            reserved = layout.reserved_blocks(),
            "volume formatted"
        );

        Ok(Self {
            dev,
            header,
            table,
            dir,
            sessions: SessionTable::new(MountOptions::default().max_sessions)?,
        })
    }

    /// Read the header, allocation table and directory from `dev`.
    pub fn mount(dev: D, options: &MountOptions) -> Result<Self> {
        let raw = dev.read_block(HEADER_BLOCK)?;
        let header = VolumeHeader::parse_from_bytes(raw.as_slice()).map_err(|err| format_error(&err))?;
        if header.block_size.get() != dev.block_size() {
            return Err(CfsError::Format(format!(
                "volume block size {} does not match device block size {}",
                header.block_size,
                dev.block_size()
            )));
        }
        if header.block_count > dev.block_count() {
            return Err(CfsError::Format(format!(
                "volume spans {} blocks but device holds {}",
                header.block_count,
                dev.block_count()
            )));
        }

        let table = AllocationTable::load(&dev, &header)?;
        let dir = Directory::load(&dev, &header)?;
        let sessions = SessionTable::new(options.max_sessions)?;
        info!(
            block_count = header.block_count,
            free = table.free_count(),
            max_sessions = options.max_sessions,
            "volume mounted"
        );
        Ok(Self {
            dev,
            header,
            table,
            dir,
            sessions,
        })
    }

    /// Flush metadata, sync the device and hand it back. Open sessions are
    /// dropped.
    pub fn unmount(mut self) -> Result<D> {
        let dropped = self.sessions.clear();
        self.table.flush(&self.dev)?;
        self.dev.sync()?;
        debug!(dropped_sessions = dropped, "volume unmounted");
        Ok(self.dev)
    }

    fn engine(&mut self) -> Engine<'_> {
        Engine {
            dev: &self.dev,
            table: &mut self.table,
            dir: &mut self.dir,
            sessions: &mut self.sessions,
        }
    }

    // ── File I/O ────────────────────────────────────────────────────────

    pub fn open(&mut self, path: &str, flags: OpenFlags) -> Result<SessionHandle> {
        self.engine().open(path, flags)
    }

    /// Read up to `buf.len()` bytes at the session's cursor. Returns 0 at
    /// end of file.
    pub fn read(&mut self, handle: SessionHandle, buf: &mut [u8]) -> Result<usize> {
        self.engine().read(handle, buf)
    }

    /// Write `data` at the session's cursor, growing the file as needed.
    pub fn write(&mut self, handle: SessionHandle, data: &[u8]) -> Result<usize> {
        self.engine().write(handle, data)
    }

    pub fn seek(&mut self, handle: SessionHandle, pos: SeekFrom) -> Result<u64> {
        self.engine().seek(handle, pos)
    }

    pub fn tell(&self, handle: SessionHandle) -> Result<u64> {
        self.sessions.get(handle).map(Session::file_cursor)
    }

    pub fn close(&mut self, handle: SessionHandle) -> Result<()> {
        self.engine().close(handle)
    }

    pub fn session(&self, handle: SessionHandle) -> Result<&Session> {
        self.sessions.get(handle)
    }

    // ── Namespace ───────────────────────────────────────────────────────

    pub fn mkdir(&mut self, path: &str) -> Result<DirEntry> {
        self.dir.mkdir(&self.dev, path)
    }

    /// Release the entry's chain, then delete the entry.
    pub fn remove(&mut self, path: &str) -> Result<()> {
        let entry = self.dir.resolve(path)?;
        if self.sessions.holds(entry.id) {
            return Err(CfsError::Busy(path.to_owned()));
        }
        if !entry.is_dir() {
            self.table.release_chain(&self.dev, entry.first_block)?;
        }
        self.dir.delete(&self.dev, path)
    }

    pub fn list(&self, path: &str) -> Result<Vec<DirEntry>> {
        self.dir.list(path)
    }

    pub fn stat(&self, path: &str) -> Result<DirEntry> {
        self.dir.resolve(path)
    }

    // ── Allocation table ────────────────────────────────────────────────

    pub fn allocate_chain(&mut self, count: u64) -> Result<BlockNumber> {
        self.table.allocate_chain(&self.dev, count)
    }

    pub fn extend_chain(&mut self, last: BlockNumber, count: u64) -> Result<BlockNumber> {
        self.table.extend_chain(&self.dev, last, count)
    }

    pub fn release_chain(&mut self, head: Option<BlockNumber>) -> Result<u64> {
        self.table.release_chain(&self.dev, head)
    }

    pub fn next_block(&self, block: BlockNumber) -> Result<ChainLink> {
        self.table.next_block(block)
    }

    // ── Inspection ──────────────────────────────────────────────────────

    #[must_use]
    pub fn table(&self) -> &AllocationTable {
        &self.table
    }

    #[must_use]
    pub fn directory(&self) -> &Directory {
        &self.dir
    }

    #[must_use]
    pub fn header(&self) -> &VolumeHeader {
        &self.header
    }

    #[must_use]
    pub fn device(&self) -> &D {
        &self.dev
    }

    #[must_use]
    pub fn stats(&self) -> VolumeStats {
        let alloc = self.table.stats();
        VolumeStats {
            block_size: self.header.block_size.get(),
            block_count: alloc.total_blocks,
            reserved_blocks: alloc.reserved_blocks,
            free_blocks: alloc.free_blocks,
            used_blocks: alloc.used_blocks,
            directory_capacity: self.dir.capacity(),
            directory_entries: self.dir.iter().count(),
            open_sessions: self.sessions.open_count(),
            max_sessions: self.sessions.capacity(),
        }
    }

    /// Walk every file chain and cross-check it against the table.
    #[must_use]
    pub fn check(&self) -> CheckReport {
        check::run(&self.table, &self.dir)
    }
}

impl Volume<ByteBlockDevice<FileByteDevice>> {
    /// Create an image file of `block_count` blocks and format it.
    pub fn format_image(
        path: impl AsRef<Path>,
        block_count: u64,
        options: &FormatOptions,
    ) -> Result<Self> {
        let len = block_count
            .checked_mul(u64::from(options.block_size))
            .ok_or(CfsError::InvalidArgument("image size overflows u64"))?;
        let file = FileByteDevice::create(path, len)?;
        Self::format(ByteBlockDevice::new(file, options.block_size)?, options)
    }

    /// Mount an existing image file, taking the block size from its header.
    pub fn open_image(path: impl AsRef<Path>, options: &MountOptions) -> Result<Self> {
        let file = FileByteDevice::open(path)?;
        let header = probe_header(&file)?;
        Self::mount(ByteBlockDevice::new(file, header.block_size.get())?, options)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cfs_block::MemoryByteDevice;

    type MemVolume = Volume<ByteBlockDevice<MemoryByteDevice>>;

    fn formatted(blocks: usize) -> MemVolume {
        let dev = ByteBlockDevice::new(MemoryByteDevice::new(512 * blocks), 512).unwrap();
        Volume::format(dev, &FormatOptions::default()).unwrap()
    }

    #[test]
    fn format_rejects_block_size_mismatch() {
        let dev = ByteBlockDevice::new(MemoryByteDevice::new(4096 * 64), 4096).unwrap();
        assert!(matches!(
            Volume::format(dev, &FormatOptions::default()),
            Err(CfsError::Format(_))
        ));
    }

    #[test]
    fn format_reports_tiny_device() {
        // Header, table and an 8-block directory leave nothing for data.
        let dev = ByteBlockDevice::new(MemoryByteDevice::new(512 * 10), 512).unwrap();
        assert!(matches!(
            Volume::format(dev, &FormatOptions::default()),
            Err(CfsError::VolumeTooSmall { .. })
        ));
    }

    #[test]
    fn stats_reflect_geometry() {
        let vol = formatted(256);
        let stats = vol.stats();
        assert_eq!(stats.block_count, 256);
        // 1 header + 2 table blocks + 8 directory blocks.
        assert_eq!(stats.reserved_blocks, 11);
        assert_eq!(stats.free_blocks, 245);
        assert_eq!(stats.used_blocks, 0);
        assert_eq!(stats.directory_entries, 1);
        assert_eq!(stats.max_sessions, 20);
    }

    #[test]
    fn probe_reads_header_from_raw_bytes() {
        let vol = formatted(128);
        let raw = vol.unmount().unwrap().into_inner();
        let header = probe_header(&raw).unwrap();
        assert_eq!(header.block_count, 128);
        assert!(probe_header(&MemoryByteDevice::new(16)).is_err());
        assert!(probe_header(&MemoryByteDevice::new(4096)).is_err());
    }

    #[test]
    fn mount_rejects_unformatted_device() {
        let dev = ByteBlockDevice::new(MemoryByteDevice::new(512 * 64), 512).unwrap();
        assert!(matches!(
            Volume::mount(dev, &MountOptions::default()),
            Err(CfsError::Format(_))
        ));
    }

    #[test]
    fn remove_releases_chain() {
        let mut vol = formatted(128);
        let free = vol.table().free_count();
        let h = vol
            .open("/a", OpenFlags::WRITE_ONLY | OpenFlags::CREATE)
            .unwrap();
        vol.write(h, &[9_u8; 1500]).unwrap();
        assert_eq!(vol.table().free_count(), free - 3);
        assert!(matches!(vol.remove("/a"), Err(CfsError::Busy(_))));
        vol.close(h).unwrap();
        vol.remove("/a").unwrap();
        assert_eq!(vol.table().free_count(), free);
        assert!(matches!(vol.stat("/a"), Err(CfsError::NotFound(_))));
    }
}

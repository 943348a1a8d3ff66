#![forbid(unsafe_code)]
//! Block device layer.
//!
//! Provides the byte-addressed `ByteDevice` backends (file and memory), the
//! block-granular `BlockDevice` contract consumed by the allocator and the
//! I/O engine, and an adapter between the two that reports short transfers
//! as a block count instead of failing.

use cfs_error::{CfsError, Result};
use cfs_types::{BlockNumber, BlockSize};
use parking_lot::Mutex;
use serde::Serialize;
use std::fs::File;
use std::fs::OpenOptions;
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::Arc;
use tracing::trace;

/// Owned block buffer.
///
/// Invariant: length == device block size for the originating device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockBuf {
    bytes: Vec<u8>,
}

impl BlockBuf {
    #[must_use]
    pub fn new(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }

    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }

    #[must_use]
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.bytes
    }

    #[must_use]
    pub fn into_inner(self) -> Vec<u8> {
        self.bytes
    }
}

// ── Byte devices ────────────────────────────────────────────────────────────

/// Byte-addressed device for fixed-offset I/O (pread/pwrite semantics).
pub trait ByteDevice: Send + Sync {
    /// Total length in bytes.
    fn len_bytes(&self) -> u64;

    /// Read exactly `buf.len()` bytes from `offset` into `buf`.
    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()>;

    /// Write all bytes in `buf` to `offset`.
    fn write_all_at(&self, offset: u64, buf: &[u8]) -> Result<()>;

    /// Flush pending writes to stable storage.
    fn sync(&self) -> Result<()>;
}

fn checked_range(offset: u64, len: usize, device_len: u64, op: &str) -> Result<()> {
    let end = u64::try_from(len)
        .ok()
        .and_then(|len| offset.checked_add(len))
        .ok_or_else(|| CfsError::Format(format!("{op} range overflows u64")))?;
    if end > device_len {
        return Err(CfsError::Format(format!(
            "{op} out of bounds: offset={offset} len={len} device_len={device_len}"
        )));
    }
    Ok(())
}

/// File-backed byte device using `pread`/`pwrite` style I/O.
///
/// This uses `std::os::unix::fs::FileExt`, which is thread-safe and does not
/// require a shared seek position.
#[derive(Debug, Clone)]
pub struct FileByteDevice {
    file: Arc<File>,
    len: u64,
    writable: bool,
}

impl FileByteDevice {
    /// Open an existing image, falling back to read-only access.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let (file, writable) = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path.as_ref())
            .map(|file| (file, true))
            .or_else(|_| {
                OpenOptions::new()
                    .read(true)
                    .open(path.as_ref())
                    .map(|file| (file, false))
            })?;
        let len = file.metadata()?.len();
        Ok(Self {
            file: Arc::new(file),
            len,
            writable,
        })
    }

    /// Create (or truncate) an image of exactly `len` zero bytes.
    pub fn create(path: impl AsRef<Path>, len: u64) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path.as_ref())?;
        file.set_len(len)?;
        Ok(Self {
            file: Arc::new(file),
            len,
            writable: true,
        })
    }

    #[must_use]
    pub fn is_writable(&self) -> bool {
        self.writable
    }
}

impl ByteDevice for FileByteDevice {
    fn len_bytes(&self) -> u64 {
        self.len
    }

    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        checked_range(offset, buf.len(), self.len, "read")?;
        self.file.read_exact_at(buf, offset)?;
        Ok(())
    }

    fn write_all_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        if !self.writable {
            return Err(CfsError::Io(std::io::Error::from(
                std::io::ErrorKind::PermissionDenied,
            )));
        }
        checked_range(offset, buf.len(), self.len, "write")?;
        self.file.write_all_at(buf, offset)?;
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        if self.writable {
            self.file.sync_all()?;
        }
        Ok(())
    }
}

/// In-memory byte device. Clones share the same backing bytes.
#[derive(Debug, Clone)]
pub struct MemoryByteDevice {
    bytes: Arc<Mutex<Vec<u8>>>,
}

impl MemoryByteDevice {
    #[must_use]
    pub fn new(len: usize) -> Self {
        Self::from_bytes(vec![0_u8; len])
    }

    #[must_use]
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self {
            bytes: Arc::new(Mutex::new(bytes)),
        }
    }

    /// Copy of the current contents.
    #[must_use]
    pub fn snapshot(&self) -> Vec<u8> {
        self.bytes.lock().clone()
    }
}

impl ByteDevice for MemoryByteDevice {
    fn len_bytes(&self) -> u64 {
        u64::try_from(self.bytes.lock().len()).unwrap_or(u64::MAX)
    }

    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let bytes = self.bytes.lock();
        let device_len = u64::try_from(bytes.len()).unwrap_or(u64::MAX);
        checked_range(offset, buf.len(), device_len, "read")?;
        let start = usize::try_from(offset)
            .map_err(|_| CfsError::Format("offset does not fit usize".to_owned()))?;
        buf.copy_from_slice(&bytes[start..start + buf.len()]);
        drop(bytes);
        Ok(())
    }

    fn write_all_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        let mut bytes = self.bytes.lock();
        let device_len = u64::try_from(bytes.len()).unwrap_or(u64::MAX);
        checked_range(offset, buf.len(), device_len, "write")?;
        let start = usize::try_from(offset)
            .map_err(|_| CfsError::Format("offset does not fit usize".to_owned()))?;
        bytes[start..start + buf.len()].copy_from_slice(buf);
        drop(bytes);
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        Ok(())
    }
}

// ── Block devices ───────────────────────────────────────────────────────────

/// Block-addressed I/O interface.
///
/// `read_blocks` and `write_blocks` transfer `buf.len() / block_size()`
/// consecutive blocks and return how many were actually transferred. A count
/// below the requested one is a short transfer, not an error; the provided
/// single-block helpers turn it into `DeviceError` / `ShortWrite`.
pub trait BlockDevice: Send + Sync {
    /// Device block size in bytes.
    fn block_size(&self) -> u32;

    /// Total number of blocks.
    fn block_count(&self) -> u64;

    /// Read consecutive blocks starting at `start` into `dst`.
    fn read_blocks(&self, start: BlockNumber, dst: &mut [u8]) -> Result<u64>;

    /// Write consecutive blocks starting at `start` from `src`.
    fn write_blocks(&self, start: BlockNumber, src: &[u8]) -> Result<u64>;

    /// Flush pending writes to stable storage.
    fn sync(&self) -> Result<()>;

    /// Read one block into `dst` (exactly one block long).
    fn read_block_into(&self, block: BlockNumber, dst: &mut [u8]) -> Result<()> {
        let transferred = self.read_blocks(block, dst)?;
        if transferred < 1 {
            return Err(CfsError::DeviceError {
                block: block.0,
                requested: 1,
                transferred,
            });
        }
        Ok(())
    }

    /// Read one block into a fresh buffer.
    fn read_block(&self, block: BlockNumber) -> Result<BlockBuf> {
        let mut buf = vec![0_u8; self.block_size() as usize];
        self.read_block_into(block, &mut buf)?;
        Ok(BlockBuf::new(buf))
    }

    /// Write one block. `data.len()` MUST equal `block_size()`.
    fn write_block(&self, block: BlockNumber, data: &[u8]) -> Result<()> {
        let transferred = self.write_blocks(block, data)?;
        if transferred < 1 {
            return Err(CfsError::ShortWrite {
                block: block.0,
                requested: 1,
                transferred,
            });
        }
        Ok(())
    }
}

/// Number of whole blocks in `len` bytes; rejects partial blocks.
fn blocks_in(len: usize, block_size: u32) -> Result<u64> {
    let bs = block_size as usize;
    if len == 0 || len % bs != 0 {
        return Err(CfsError::Format(format!(
            "transfer length {len} is not a positive multiple of block_size={block_size}"
        )));
    }
    u64::try_from(len / bs).map_err(|_| CfsError::Format("transfer too large".to_owned()))
}

/// `BlockDevice` over a `ByteDevice`.
///
/// Transfers that run past the last block are clamped and reported short.
#[derive(Debug)]
pub struct ByteBlockDevice<D: ByteDevice> {
    inner: D,
    block_size: BlockSize,
    block_count: u64,
}

impl<D: ByteDevice> ByteBlockDevice<D> {
    pub fn new(inner: D, block_size: u32) -> Result<Self> {
        let block_size =
            BlockSize::new(block_size).map_err(|err| CfsError::Format(err.to_string()))?;

        let len = inner.len_bytes();
        let remainder = len % block_size.as_u64();
        if remainder != 0 {
            return Err(CfsError::Format(format!(
                "image length is not block-aligned: len_bytes={len} block_size={block_size} remainder={remainder}"
            )));
        }
        let block_count = len / block_size.as_u64();
        Ok(Self {
            inner,
            block_size,
            block_count,
        })
    }

    #[must_use]
    pub fn inner(&self) -> &D {
        &self.inner
    }

    #[must_use]
    pub fn into_inner(self) -> D {
        self.inner
    }

    /// Blocks from `start` that actually exist, capped at `requested`.
    fn clamp(&self, start: BlockNumber, requested: u64) -> u64 {
        requested.min(self.block_count.saturating_sub(start.0))
    }

    fn byte_offset(&self, block: BlockNumber) -> Result<u64> {
        block
            .0
            .checked_mul(self.block_size.as_u64())
            .ok_or_else(|| CfsError::Format("block offset overflow".to_owned()))
    }
}

impl<D: ByteDevice> BlockDevice for ByteBlockDevice<D> {
    fn block_size(&self) -> u32 {
        self.block_size.get()
    }

    fn block_count(&self) -> u64 {
        self.block_count
    }

    fn read_blocks(&self, start: BlockNumber, dst: &mut [u8]) -> Result<u64> {
        let requested = blocks_in(dst.len(), self.block_size.get())?;
        let count = self.clamp(start, requested);
        if count > 0 {
            let bytes = usize::try_from(count * self.block_size.as_u64())
                .map_err(|_| CfsError::Format("transfer too large".to_owned()))?;
            self.inner
                .read_exact_at(self.byte_offset(start)?, &mut dst[..bytes])?;
        }
        trace!(block = start.0, requested, transferred = count, "read_blocks");
        Ok(count)
    }

    fn write_blocks(&self, start: BlockNumber, src: &[u8]) -> Result<u64> {
        let requested = blocks_in(src.len(), self.block_size.get())?;
        let count = self.clamp(start, requested);
        if count > 0 {
            let bytes = usize::try_from(count * self.block_size.as_u64())
                .map_err(|_| CfsError::Format("transfer too large".to_owned()))?;
            self.inner
                .write_all_at(self.byte_offset(start)?, &src[..bytes])?;
        }
        trace!(block = start.0, requested, transferred = count, "write_blocks");
        Ok(count)
    }

    fn sync(&self) -> Result<()> {
        self.inner.sync()
    }
}

// ── I/O accounting ──────────────────────────────────────────────────────────

/// Counters kept by [`CountingBlockDevice`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct IoStats {
    pub read_calls: u64,
    pub blocks_read: u64,
    pub write_calls: u64,
    pub blocks_written: u64,
    pub syncs: u64,
}

/// Wrapper recording every transfer that reaches the inner device.
#[derive(Debug)]
pub struct CountingBlockDevice<D: BlockDevice> {
    inner: D,
    stats: Mutex<IoStats>,
    writes: Mutex<Vec<BlockNumber>>,
}

impl<D: BlockDevice> CountingBlockDevice<D> {
    #[must_use]
    pub fn new(inner: D) -> Self {
        Self {
            inner,
            stats: Mutex::new(IoStats::default()),
            writes: Mutex::new(Vec::new()),
        }
    }

    #[must_use]
    pub fn stats(&self) -> IoStats {
        *self.stats.lock()
    }

    /// Start block of every write call, in order.
    #[must_use]
    pub fn write_sequence(&self) -> Vec<BlockNumber> {
        self.writes.lock().clone()
    }

    pub fn reset(&self) {
        *self.stats.lock() = IoStats::default();
        self.writes.lock().clear();
    }

    #[must_use]
    pub fn inner(&self) -> &D {
        &self.inner
    }

    #[must_use]
    pub fn into_inner(self) -> D {
        self.inner
    }
}

impl<D: BlockDevice> BlockDevice for CountingBlockDevice<D> {
    fn block_size(&self) -> u32 {
        self.inner.block_size()
    }

    fn block_count(&self) -> u64 {
        self.inner.block_count()
    }

    fn read_blocks(&self, start: BlockNumber, dst: &mut [u8]) -> Result<u64> {
        let transferred = self.inner.read_blocks(start, dst)?;
        let mut stats = self.stats.lock();
        stats.read_calls += 1;
        stats.blocks_read += transferred;
        drop(stats);
        Ok(transferred)
    }

    fn write_blocks(&self, start: BlockNumber, src: &[u8]) -> Result<u64> {
        self.writes.lock().push(start);
        let transferred = self.inner.write_blocks(start, src)?;
        let mut stats = self.stats.lock();
        stats.write_calls += 1;
        stats.blocks_written += transferred;
        drop(stats);
        Ok(transferred)
    }

    fn sync(&self) -> Result<()> {
        self.stats.lock().syncs += 1;
        self.inner.sync()
    }
}

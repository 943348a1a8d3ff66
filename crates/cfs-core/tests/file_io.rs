#![forbid(unsafe_code)]

use cfs_core::{
    BlockDevice, BlockNumber, ByteBlockDevice, CfsError, CountingBlockDevice, FormatOptions,
    MemoryByteDevice, MountOptions, OpenFlags, Result, SessionHandle, Volume,
};
use std::io::SeekFrom;
use std::sync::atomic::{AtomicU64, Ordering};

const BS: usize = 512;

type MemVolume = Volume<ByteBlockDevice<MemoryByteDevice>>;

fn mem_device(blocks: usize) -> ByteBlockDevice<MemoryByteDevice> {
    ByteBlockDevice::new(MemoryByteDevice::new(BS * blocks), 512).expect("device")
}

fn mem_volume(blocks: usize) -> MemVolume {
    Volume::format(mem_device(blocks), &FormatOptions::default()).expect("format")
}

fn pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8 ^ seed).collect()
}

fn write_file<D: BlockDevice>(vol: &mut Volume<D>, path: &str, data: &[u8]) {
    let h = vol
        .open(path, OpenFlags::WRITE_ONLY | OpenFlags::CREATE)
        .expect("open for write");
    assert_eq!(vol.write(h, data).expect("write"), data.len());
    vol.close(h).expect("close");
}

fn read_file<D: BlockDevice>(vol: &mut Volume<D>, path: &str) -> Vec<u8> {
    let size = vol.stat(path).expect("stat").size as usize;
    let h = vol.open(path, OpenFlags::READ_ONLY).expect("open for read");
    let mut out = vec![0_u8; size + 64];
    let n = vol.read(h, &mut out).expect("read");
    assert_eq!(n, size);
    vol.close(h).expect("close");
    out.truncate(n);
    out
}

// ── Round trips ─────────────────────────────────────────────────────────────

#[test]
fn round_trip_across_block_boundaries() {
    for len in [0, 1, BS - 1, BS, BS + 1, 2 * BS, 5 * BS + 17] {
        let mut vol = mem_volume(128);
        let data = pattern(len, 0x5A);
        write_file(&mut vol, "/f", &data);
        assert_eq!(vol.stat("/f").unwrap().size, len as u64, "len {len}");
        assert_eq!(read_file(&mut vol, "/f"), data, "len {len}");
        assert!(vol.check().healthy, "len {len}");
    }
}

#[test]
fn many_small_writes_equal_one_large_write() {
    let mut vol = mem_volume(128);
    let data = pattern(3 * BS + 100, 3);
    let h = vol
        .open("/chunks", OpenFlags::WRITE_ONLY | OpenFlags::CREATE)
        .unwrap();
    for chunk in data.chunks(77) {
        vol.write(h, chunk).unwrap();
    }
    vol.close(h).unwrap();
    assert_eq!(read_file(&mut vol, "/chunks"), data);
    let head = vol.stat("/chunks").unwrap().first_block.unwrap();
    assert_eq!(vol.table().chain(head).unwrap().len(), 4);
}

#[test]
fn small_reads_walk_the_chain() {
    let mut vol = mem_volume(128);
    let data = pattern(4 * BS + 3, 9);
    write_file(&mut vol, "/f", &data);
    let h = vol.open("/f", OpenFlags::READ_ONLY).unwrap();
    let mut got = Vec::new();
    let mut buf = [0_u8; 100];
    loop {
        let n = vol.read(h, &mut buf).unwrap();
        if n == 0 {
            break;
        }
        got.extend_from_slice(&buf[..n]);
    }
    assert_eq!(got, data);
}

// ── Reads ───────────────────────────────────────────────────────────────────

#[test]
fn reads_clamp_at_end_of_file() {
    let mut vol = mem_volume(64);
    write_file(&mut vol, "/f", &pattern(100, 1));
    let h = vol.open("/f", OpenFlags::READ_ONLY).unwrap();
    let mut buf = [0_u8; 100];
    assert_eq!(vol.read(h, &mut buf[..40]).unwrap(), 40);
    assert_eq!(vol.read(h, &mut buf).unwrap(), 60);
    assert_eq!(vol.tell(h).unwrap(), 100);
    assert_eq!(vol.read(h, &mut buf).unwrap(), 0);
}

#[test]
fn empty_file_reads_nothing() {
    let mut vol = mem_volume(64);
    let h = vol
        .open("/empty", OpenFlags::READ_WRITE | OpenFlags::CREATE)
        .unwrap();
    let mut buf = [0_u8; 16];
    assert_eq!(vol.read(h, &mut buf).unwrap(), 0);
    assert_eq!(vol.stat("/empty").unwrap().first_block, None);
}

#[test]
fn whole_blocks_bypass_the_staging_buffer() {
    let dev = CountingBlockDevice::new(mem_device(128));
    let mut vol = Volume::format(dev, &FormatOptions::default()).unwrap();
    let data = pattern(3 * BS, 7);
    let h = vol
        .open("/aligned", OpenFlags::READ_WRITE | OpenFlags::CREATE)
        .unwrap();

    vol.device().reset();
    vol.write(h, &data).unwrap();
    // Only the first block goes through read-modify-write.
    assert_eq!(vol.device().stats().read_calls, 1);

    vol.seek(h, SeekFrom::Start(0)).unwrap();
    vol.device().reset();
    let mut out = vec![0_u8; 3 * BS];
    assert_eq!(vol.read(h, &mut out).unwrap(), 3 * BS);
    assert_eq!(out, data);
    let stats = vol.device().stats();
    assert_eq!(stats.read_calls, 3);
    assert_eq!(stats.blocks_read, 3);
    assert_eq!(stats.write_calls, 0);
}

// ── Open semantics ──────────────────────────────────────────────────────────

#[test]
fn append_starts_at_old_size() {
    for first in [700, BS, 2 * BS] {
        let mut vol = mem_volume(128);
        let head = pattern(first, 1);
        let tail = pattern(400, 2);
        write_file(&mut vol, "/log", &head);

        let h = vol
            .open("/log", OpenFlags::WRITE_ONLY | OpenFlags::APPEND)
            .unwrap();
        assert_eq!(vol.tell(h).unwrap(), first as u64);
        vol.write(h, &tail).unwrap();
        vol.close(h).unwrap();

        assert_eq!(vol.stat("/log").unwrap().size, (first + 400) as u64);
        let mut expected = head.clone();
        expected.extend_from_slice(&tail);
        assert_eq!(read_file(&mut vol, "/log"), expected, "first {first}");
    }
}

#[test]
fn invalid_flag_combinations_allocate_nothing() {
    let mut vol = mem_volume(64);
    for flags in [
        OpenFlags::READ_ONLY | OpenFlags::CREATE,
        OpenFlags::CREATE,
        OpenFlags::WRITE_ONLY | OpenFlags::TRUNCATE | OpenFlags::APPEND,
        OpenFlags::READ_ONLY | OpenFlags::WRITE_ONLY,
    ] {
        assert!(
            matches!(vol.open("/new", flags), Err(CfsError::InvalidFlags(_))),
            "{flags:?}"
        );
    }
    assert_eq!(vol.stats().open_sessions, 0);
    assert!(matches!(vol.stat("/new"), Err(CfsError::NotFound(_))));
}

#[test]
fn open_path_errors() {
    let mut vol = mem_volume(64);
    vol.mkdir("/dir").unwrap();
    assert!(matches!(
        vol.open("/missing", OpenFlags::READ_ONLY),
        Err(CfsError::NotFound(_))
    ));
    assert!(matches!(
        vol.open("/dir", OpenFlags::READ_ONLY),
        Err(CfsError::InvalidPath(_))
    ));
    assert!(matches!(
        vol.open("/", OpenFlags::READ_ONLY),
        Err(CfsError::InvalidPath(_))
    ));
    assert!(matches!(
        vol.open("/nope/file", OpenFlags::WRITE_ONLY | OpenFlags::CREATE),
        Err(CfsError::ParentMissing(_))
    ));
    let h = vol
        .open("/dir/file", OpenFlags::WRITE_ONLY | OpenFlags::CREATE)
        .unwrap();
    vol.close(h).unwrap();
    assert_eq!(vol.list("/dir").unwrap().len(), 1);
}

#[test]
fn truncate_releases_the_old_chain() {
    let mut vol = mem_volume(64);
    let free = vol.table().free_count();
    write_file(&mut vol, "/t", &pattern(2000, 4));
    assert_eq!(vol.table().free_count(), free - 4);

    let h = vol
        .open("/t", OpenFlags::WRITE_ONLY | OpenFlags::TRUNCATE)
        .unwrap();
    assert_eq!(vol.stat("/t").unwrap().size, 0);
    assert_eq!(vol.table().free_count(), free);
    vol.write(h, b"x").unwrap();
    vol.close(h).unwrap();
    assert_eq!(read_file(&mut vol, "/t"), b"x");
}

#[test]
fn truncate_of_open_file_is_busy() {
    let mut vol = mem_volume(64);
    write_file(&mut vol, "/t", b"keep me");
    let reader = vol.open("/t", OpenFlags::READ_ONLY).unwrap();
    assert!(matches!(
        vol.open("/t", OpenFlags::WRITE_ONLY | OpenFlags::TRUNCATE),
        Err(CfsError::Busy(_))
    ));
    vol.close(reader).unwrap();
    assert_eq!(read_file(&mut vol, "/t"), b"keep me");
}

// ── Sessions ────────────────────────────────────────────────────────────────

#[test]
fn session_table_exhaustion() {
    let dev = mem_volume(64).unmount().unwrap();
    let mut vol = Volume::mount(dev, &MountOptions { max_sessions: 3 }).unwrap();
    write_file(&mut vol, "/f", b"data");

    let handles: Vec<SessionHandle> = (0..3)
        .map(|_| vol.open("/f", OpenFlags::READ_ONLY).unwrap())
        .collect();
    assert_eq!(handles, [SessionHandle(0), SessionHandle(1), SessionHandle(2)]);
    assert!(matches!(
        vol.open("/f", OpenFlags::READ_ONLY),
        Err(CfsError::NoFreeSessions)
    ));
    // Exhaustion must not create the file either.
    assert!(matches!(
        vol.open("/g", OpenFlags::WRITE_ONLY | OpenFlags::CREATE),
        Err(CfsError::NoFreeSessions)
    ));
    assert!(vol.stat("/g").is_err());

    vol.close(handles[1]).unwrap();
    assert_eq!(vol.open("/f", OpenFlags::READ_ONLY).unwrap(), SessionHandle(1));
}

#[test]
fn closed_and_unknown_handles_are_rejected() {
    let mut vol = mem_volume(64);
    let h = vol
        .open("/f", OpenFlags::READ_WRITE | OpenFlags::CREATE)
        .unwrap();
    vol.close(h).unwrap();
    let mut buf = [0_u8; 4];
    assert!(matches!(vol.close(h), Err(CfsError::InvalidHandle(0))));
    assert!(matches!(vol.read(h, &mut buf), Err(CfsError::InvalidHandle(0))));
    assert!(matches!(vol.write(h, b"x"), Err(CfsError::InvalidHandle(0))));
    assert!(matches!(
        vol.close(SessionHandle(999)),
        Err(CfsError::InvalidHandle(999))
    ));
}

#[test]
fn access_mode_is_enforced() {
    let mut vol = mem_volume(64);
    let w = vol
        .open("/f", OpenFlags::WRITE_ONLY | OpenFlags::CREATE)
        .unwrap();
    let mut buf = [0_u8; 4];
    assert!(matches!(
        vol.read(w, &mut buf),
        Err(CfsError::AccessMode { operation: "reading", .. })
    ));
    let r = vol.open("/f", OpenFlags::READ_ONLY).unwrap();
    assert!(matches!(
        vol.write(r, b"x"),
        Err(CfsError::AccessMode { operation: "writing", .. })
    ));
}

// ── Seek ────────────────────────────────────────────────────────────────────

#[test]
fn seek_then_overwrite_and_extend() {
    let mut vol = mem_volume(64);
    let h = vol
        .open("/f", OpenFlags::READ_WRITE | OpenFlags::CREATE)
        .unwrap();
    vol.write(h, &[b'a'; BS]).unwrap();
    assert_eq!(vol.seek(h, SeekFrom::End(-2)).unwrap(), (BS - 2) as u64);
    vol.write(h, b"bbbb").unwrap();
    assert_eq!(vol.stat("/f").unwrap().size, (BS + 2) as u64);

    vol.seek(h, SeekFrom::Start((BS - 3) as u64)).unwrap();
    let mut out = [0_u8; 8];
    assert_eq!(vol.read(h, &mut out).unwrap(), 5);
    assert_eq!(&out[..5], b"abbbb");
    assert!(matches!(
        vol.seek(h, SeekFrom::Current(1)),
        Err(CfsError::InvalidSeek(_))
    ));
}

// ── Failure modes ───────────────────────────────────────────────────────────

#[test]
fn out_of_space_keeps_partial_progress() {
    let mut vol = mem_volume(64);
    let data_blocks = vol.table().free_count() as usize;
    let h = vol
        .open("/big", OpenFlags::WRITE_ONLY | OpenFlags::CREATE)
        .unwrap();
    let err = vol.write(h, &pattern((data_blocks + 6) * BS, 0)).unwrap_err();
    assert!(matches!(err, CfsError::OutOfSpace { requested: 1, available: 0 }));
    assert_eq!(vol.stat("/big").unwrap().size, (data_blocks * BS) as u64);
    assert_eq!(vol.tell(h).unwrap(), (data_blocks * BS) as u64);
    assert_eq!(vol.table().free_count(), 0);
    vol.close(h).unwrap();
    assert!(vol.check().healthy);
}

/// Passes transfers through until the matching budget runs out, then
/// transfers nothing.
struct FailingDevice<D: BlockDevice> {
    inner: D,
    reads: AtomicU64,
    writes: AtomicU64,
}

impl<D: BlockDevice> FailingDevice<D> {
    fn new(inner: D) -> Self {
        Self {
            inner,
            reads: AtomicU64::new(u64::MAX),
            writes: AtomicU64::new(u64::MAX),
        }
    }

    fn set_read_budget(&self, reads: u64) {
        self.reads.store(reads, Ordering::SeqCst);
    }

    fn set_write_budget(&self, writes: u64) {
        self.writes.store(writes, Ordering::SeqCst);
    }
}

fn spend(budget: &AtomicU64) -> bool {
    budget
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |b| b.checked_sub(1))
        .is_ok()
}

impl<D: BlockDevice> BlockDevice for FailingDevice<D> {
    fn block_size(&self) -> u32 {
        self.inner.block_size()
    }

    fn block_count(&self) -> u64 {
        self.inner.block_count()
    }

    fn read_blocks(&self, start: BlockNumber, dst: &mut [u8]) -> Result<u64> {
        if spend(&self.reads) {
            self.inner.read_blocks(start, dst)
        } else {
            Ok(0)
        }
    }

    fn write_blocks(&self, start: BlockNumber, src: &[u8]) -> Result<u64> {
        if spend(&self.writes) {
            self.inner.write_blocks(start, src)
        } else {
            Ok(0)
        }
    }

    fn sync(&self) -> Result<()> {
        self.inner.sync()
    }
}

#[test]
fn short_write_is_reported_and_cursor_stays() {
    let dev = FailingDevice::new(mem_device(64));
    let mut vol = Volume::format(dev, &FormatOptions::default()).unwrap();
    let h = vol
        .open("/f", OpenFlags::READ_WRITE | OpenFlags::CREATE)
        .unwrap();
    vol.write(h, &[1_u8; 100]).unwrap();
    let head = vol.stat("/f").unwrap().first_block.unwrap();

    vol.seek(h, SeekFrom::Start(0)).unwrap();
    vol.device().set_write_budget(0);
    let err = vol.write(h, b"lost").unwrap_err();
    assert!(matches!(
        err,
        CfsError::ShortWrite { block, requested: 1, transferred: 0 } if block == head.0
    ));
    assert_eq!(vol.tell(h).unwrap(), 0);
    assert_eq!(vol.stat("/f").unwrap().size, 100);
}

#[test]
fn short_read_stops_after_last_completed_part() {
    let dev = FailingDevice::new(mem_device(64));
    let mut vol = Volume::format(dev, &FormatOptions::default()).unwrap();
    let data = pattern(3 * BS + 10, 4);
    write_file(&mut vol, "/f", &data);
    let chain = vol
        .table()
        .chain(vol.stat("/f").unwrap().first_block.unwrap())
        .unwrap();
    assert_eq!(chain.len(), 4);

    let h = vol.open("/f", OpenFlags::READ_ONLY).unwrap();
    // Part 1 and the first whole block succeed; the second whole block fails.
    vol.device().set_read_budget(2);
    let mut out = vec![0_u8; data.len()];
    let err = vol.read(h, &mut out).unwrap_err();
    assert!(matches!(
        err,
        CfsError::DeviceError { block, requested: 1, transferred: 0 } if block == chain[2].0
    ));
    assert_eq!(vol.tell(h).unwrap(), 2 * BS as u64);
    assert_eq!(&out[..2 * BS], &data[..2 * BS]);

    // The session resumes from where it stopped once the device recovers.
    vol.device().set_read_budget(u64::MAX);
    let n = vol.read(h, &mut out[2 * BS..]).unwrap();
    assert_eq!(n, BS + 10);
    assert_eq!(out, data);
}

// ── Namespace and allocator passthrough ─────────────────────────────────────

#[test]
fn remove_rules() {
    let mut vol = mem_volume(64);
    vol.mkdir("/d").unwrap();
    write_file(&mut vol, "/d/f", &pattern(600, 0));
    assert!(matches!(vol.remove("/d"), Err(CfsError::NotEmpty(_))));
    vol.remove("/d/f").unwrap();
    vol.remove("/d").unwrap();
    assert!(vol.list("/").unwrap().is_empty());
    assert!(matches!(vol.remove("/"), Err(CfsError::InvalidPath(_))));
    assert!(vol.check().healthy);
}

#[test]
fn check_reports_leaked_chain() {
    let mut vol = mem_volume(64);
    let head = vol.allocate_chain(3).unwrap();
    let report = vol.check();
    assert!(!report.healthy);
    assert!(!report.conserved);
    assert_eq!(report.leaked_blocks, 3);
    assert_eq!(report.findings.len(), 1);

    assert_eq!(vol.release_chain(Some(head)).unwrap(), 3);
    let report = vol.check();
    assert!(report.healthy, "{report:?}");
    assert_eq!(report.free_blocks + report.reserved_blocks, report.total_blocks);
}

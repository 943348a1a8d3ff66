#![forbid(unsafe_code)]

use cfs_block::{BlockDevice, ByteBlockDevice, ByteDevice, FileByteDevice};
use cfs_error::CfsError;
use cfs_types::BlockNumber;

const BLOCK_SIZE: u32 = 1024;

fn payload(block: u64) -> Vec<u8> {
    let mut out = vec![0xA5_u8; BLOCK_SIZE as usize];
    out[..8].copy_from_slice(&block.to_le_bytes());
    out
}

#[test]
fn created_image_is_zeroed_and_sized() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("vol.img");
    let file = FileByteDevice::create(&path, u64::from(BLOCK_SIZE) * 16).expect("create");
    assert_eq!(file.len_bytes(), 16 * 1024);
    assert!(file.is_writable());

    let dev = ByteBlockDevice::new(file, BLOCK_SIZE).expect("device");
    assert_eq!(dev.block_count(), 16);
    let last = dev.read_block(BlockNumber(15)).expect("read");
    assert!(last.as_slice().iter().all(|b| *b == 0));
}

#[test]
fn blocks_persist_across_reopen() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("vol.img");
    {
        let file = FileByteDevice::create(&path, u64::from(BLOCK_SIZE) * 8).expect("create");
        let dev = ByteBlockDevice::new(file, BLOCK_SIZE).expect("device");
        for block in 0..8 {
            dev.write_block(BlockNumber(block), &payload(block))
                .expect("write");
        }
        dev.sync().expect("sync");
    }

    let dev = ByteBlockDevice::new(FileByteDevice::open(&path).expect("open"), BLOCK_SIZE)
        .expect("device");
    for block in 0..8 {
        let data = dev.read_block(BlockNumber(block)).expect("read");
        assert_eq!(data.into_inner(), payload(block));
    }
}

#[test]
fn short_transfer_at_image_end() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("vol.img");
    let file = FileByteDevice::create(&path, u64::from(BLOCK_SIZE) * 4).expect("create");
    let dev = ByteBlockDevice::new(file, BLOCK_SIZE).expect("device");

    let src = vec![1_u8; BLOCK_SIZE as usize * 3];
    assert_eq!(dev.write_blocks(BlockNumber(2), &src).expect("write"), 2);
    assert!(matches!(
        dev.write_block(BlockNumber(4), &payload(4)),
        Err(CfsError::ShortWrite { block: 4, .. })
    ));
}

#[test]
fn raw_byte_access_is_bounds_checked() {
    let dir = tempfile::tempdir().expect("tempdir");
    let file = FileByteDevice::create(dir.path().join("raw.img"), 100).expect("create");
    file.write_all_at(90, &[3_u8; 10]).expect("in bounds");
    assert!(file.write_all_at(95, &[3_u8; 10]).is_err());
    let mut buf = [0_u8; 10];
    file.read_exact_at(90, &mut buf).expect("read");
    assert_eq!(buf, [3_u8; 10]);
}

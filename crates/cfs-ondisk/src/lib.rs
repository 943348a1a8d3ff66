#![forbid(unsafe_code)]
//! On-disk format for ChainFS volumes.
//!
//! Pure encoding crate: no I/O, no side effects. Converts between byte
//! slices and the header, allocation-table slots and directory records.

pub mod dir;
pub mod header;
pub mod layout;
pub mod table;

pub use dir::DirRecord;
pub use header::{HEADER_SIZE, VolumeHeader};
pub use layout::VolumeLayout;
pub use table::{TableSlot, decode_table_block, encode_table_block};

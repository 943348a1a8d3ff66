#![forbid(unsafe_code)]
//! ChainFS public API facade.
//!
//! Re-exports `cfs-core` through a stable external interface. The CLI and
//! any downstream consumer depend on this crate rather than the internals.

pub use cfs_core::*;

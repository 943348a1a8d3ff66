//! Format and mount options.

use serde::{Deserialize, Serialize};

/// Geometry chosen at format time.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FormatOptions {
    /// Block size in bytes; must match the device's block size.
    pub block_size: u32,
    /// Number of directory records, root included.
    pub directory_capacity: u32,
}

impl Default for FormatOptions {
    fn default() -> Self {
        Self {
            block_size: 512,
            directory_capacity: 64,
        }
    }
}

/// Runtime limits for a mounted volume.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MountOptions {
    /// Session table capacity.
    pub max_sessions: usize,
}

impl Default for MountOptions {
    fn default() -> Self {
        Self { max_sessions: 20 }
    }
}

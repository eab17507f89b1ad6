// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Configuration types for a ramfs instance

use serde::{Deserialize, Serialize};

/// Default storage block size in bytes.
pub const DEFAULT_BLOCK_SIZE: usize = 1024;

fn default_block_size() -> usize {
    DEFAULT_BLOCK_SIZE
}

fn default_max_open_handles() -> usize {
    10_000
}

/// Operational limits
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct FsLimits {
    /// Maximum number of concurrently open handles.
    #[serde(default = "default_max_open_handles")]
    pub max_open_handles: usize,
}

impl Default for FsLimits {
    fn default() -> Self {
        Self {
            max_open_handles: default_max_open_handles(),
        }
    }
}

/// Filesystem configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FsConfig {
    /// Allocation granularity for file storage. Files start with one block
    /// and grow in block-derived increments.
    #[serde(default = "default_block_size")]
    pub block_size: usize,
    #[serde(default)]
    pub limits: FsLimits,
}

impl Default for FsConfig {
    fn default() -> Self {
        Self {
            block_size: DEFAULT_BLOCK_SIZE,
            limits: FsLimits::default(),
        }
    }
}

impl FsConfig {
    /// Parse a configuration transmitted as JSON.
    pub fn from_json_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

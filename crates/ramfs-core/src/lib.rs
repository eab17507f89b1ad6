// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! In-memory hierarchical filesystem core
//!
//! A tree of named file and directory nodes kept entirely in heap memory,
//! exposed through an open/read/write/seek/readdir/stat/unlink operation
//! surface for a surrounding filesystem-routing layer. There is no block
//! device underneath and no persistence; the tree grows with available
//! memory and vanishes when the [`RamFs`] value is dropped.
//!
//! Consistency comes in two levels. A single metadata lock serializes every
//! operation, so directory structure and the handle table never tear. File
//! content is additionally guarded by per-node open exclusivity: one handle
//! may have a file open for writing, or any number for reading, never both.
//! A conflicting open fails with [`FsError::Busy`] immediately instead of
//! waiting, so a writer typically fills a file, closes it, and lets readers
//! reopen it.
//!
//! [`RamFs::attach`] and [`RamFs::detach`] move externally-owned buffers
//! into and out of the tree without copying, which makes the filesystem
//! usable as a staging area for data produced elsewhere.

pub mod config;
pub mod error;
pub mod types;

mod arena;
mod store;
mod vfs;


pub use config::{FsConfig, FsLimits, DEFAULT_BLOCK_SIZE};
pub use error::{FsError, FsResult};
pub use types::{
    DirEntry, FcntlCmd, FsStats, HandleId, HandlerInfo, MappedBuffer, Metadata, OpenOptions,
};
pub use vfs::{RamFs, HANDLER_NAME};

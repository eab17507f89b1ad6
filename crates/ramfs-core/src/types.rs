// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Core type definitions for the ramfs facade

use std::ptr::NonNull;

/// Opaque handle identifier
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct HandleId(pub u64);

impl HandleId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }
}

/// Directory entry information
#[derive(Clone, Debug)]
pub struct DirEntry {
    pub name: String,
    pub is_dir: bool,
    /// Logical size for files; directories report no size.
    pub len: Option<u64>,
}

/// File open options
///
/// `append` and `truncate` only take effect together with `write`; on a
/// read-only open they are ignored, matching the traditional flag semantics.
/// `append` wins over `truncate` when both are set.
#[derive(Clone, Debug, Default)]
pub struct OpenOptions {
    pub read: bool,
    pub write: bool,
    pub append: bool,
    pub truncate: bool,
    /// The caller expects the path to name a directory.
    pub directory: bool,
}

impl OpenOptions {
    pub fn read_only() -> Self {
        Self {
            read: true,
            ..Default::default()
        }
    }

    pub fn write_only() -> Self {
        Self {
            write: true,
            ..Default::default()
        }
    }

    pub fn read_write() -> Self {
        Self {
            read: true,
            write: true,
            ..Default::default()
        }
    }

    pub fn dir_read() -> Self {
        Self {
            read: true,
            directory: true,
            ..Default::default()
        }
    }
}

/// Control commands accepted by `fcntl`
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FcntlCmd {
    GetFlags,
    SetFlags,
    GetFd,
    SetFd,
}

/// Metadata reported by `stat` and `fstat`
///
/// Mode bits are fixed and always permissive; no ownership model exists.
#[derive(Clone, Copy, Debug)]
pub struct Metadata {
    /// Fixed identifier for the filesystem instance kind.
    pub dev: u64,
    pub mode: u32,
    pub is_dir: bool,
    /// Allocated length for files; directories report no size.
    pub len: Option<u64>,
    pub nlink: u32,
    pub block_size: u32,
    /// Allocation rounded up to whole blocks.
    pub blocks: u64,
}

/// Filesystem statistics
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FsStats {
    pub open_handles: u32,
    pub nodes: u64,
    pub bytes_in_memory: u64,
}

/// Registration advertisement consumed by the filesystem-routing layer.
#[derive(Clone, Copy, Debug)]
pub struct HandlerInfo {
    pub name: &'static str,
    pub version: u32,
}

/// Raw view of a file's backing buffer, returned by [`crate::RamFs::mmap`].
///
/// The pointer aliases memory owned by the node and is valid only while the
/// issuing handle stays open. Nothing here is synchronized: the metadata lock
/// is not held while the caller uses the pointer, and a concurrent write may
/// reallocate the buffer. The caller assumes all synchronization
/// responsibility.
#[derive(Clone, Copy, Debug)]
pub struct MappedBuffer {
    ptr: NonNull<u8>,
    len: usize,
}

impl MappedBuffer {
    pub(crate) fn new(ptr: NonNull<u8>, len: usize) -> Self {
        Self { ptr, len }
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    /// Allocated length of the buffer. Bytes past the file's logical size are
    /// zero until written.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Virtual filesystem implementation for the ramfs core
//!
//! One [`Mutex`] guards the whole tree and the handle table; every facade
//! operation holds it for its full duration, so callers observe each call as
//! atomic relative to every other. Per-file open exclusivity (single writer,
//! many readers) is tracked on the node and checked only at open time.

use std::collections::{HashMap, VecDeque};
use std::io::SeekFrom;
use std::ptr::NonNull;
use std::sync::{Mutex, MutexGuard};

use tracing::{debug, trace};

use crate::arena::{Arena, ArenaIndex};
use crate::config::FsConfig;
use crate::error::{FsError, FsResult};
use crate::store::DataStore;
use crate::types::{
    DirEntry, FcntlCmd, FsStats, HandleId, HandlerInfo, MappedBuffer, Metadata, OpenOptions,
};

/// Handler name advertised to the routing layer.
pub const HANDLER_NAME: &str = "/ram";

/// Handler interface version (major.minor packed).
const HANDLER_VERSION: u32 = 0x0001_0000;

/// Fixed device identifier reported through stat.
const DEVICE_ID: u64 = (b'r' as u64) | ((b'a' as u64) << 8) | ((b'm' as u64) << 16);

const FILE_MODE: u32 = (libc::S_IFREG
    | libc::S_IRUSR
    | libc::S_IWUSR
    | libc::S_IRGRP
    | libc::S_IWGRP
    | libc::S_IROTH
    | libc::S_IWOTH) as u32;

const DIR_MODE: u32 = (libc::S_IFDIR | libc::S_IRWXU | libc::S_IRWXG | libc::S_IRWXO) as u32;

/// Per-node open lock state
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum LockState {
    Free,
    ReadShared,
    WriteExclusive,
}

/// Filesystem node payloads
#[derive(Debug)]
pub(crate) enum NodeKind {
    File {
        store: DataStore,
    },
    Directory {
        /// Insertion-ordered child index; new entries go to the front, so
        /// listings run most-recently-created-first.
        children: VecDeque<ArenaIndex>,
    },
}

/// Filesystem node
#[derive(Debug)]
pub(crate) struct Node {
    name: String,
    lock_state: LockState,
    open_count: u32,
    kind: NodeKind,
}

impl Node {
    fn new_file(name: String, store: DataStore) -> Self {
        Self {
            name,
            lock_state: LockState::Free,
            open_count: 0,
            kind: NodeKind::File { store },
        }
    }

    fn new_directory(name: String) -> Self {
        Self {
            name,
            lock_state: LockState::Free,
            open_count: 0,
            kind: NodeKind::Directory {
                children: VecDeque::new(),
            },
        }
    }

    fn is_dir(&self) -> bool {
        matches!(self.kind, NodeKind::Directory { .. })
    }

    fn store(&self) -> Option<&DataStore> {
        match &self.kind {
            NodeKind::File { store } => Some(store),
            NodeKind::Directory { .. } => None,
        }
    }

    fn store_mut(&mut self) -> Option<&mut DataStore> {
        match &mut self.kind {
            NodeKind::File { store } => Some(store),
            NodeKind::Directory { .. } => None,
        }
    }

    fn children(&self) -> Option<&VecDeque<ArenaIndex>> {
        match &self.kind {
            NodeKind::Directory { children } => Some(children),
            NodeKind::File { .. } => None,
        }
    }

    fn children_mut(&mut self) -> Option<&mut VecDeque<ArenaIndex>> {
        match &mut self.kind {
            NodeKind::Directory { children } => Some(children),
            NodeKind::File { .. } => None,
        }
    }
}

/// Per-open cursor state
#[derive(Debug)]
enum Cursor {
    File {
        pos: usize,
    },
    /// Next child to deliver; `None` at end-of-directory. Generation-checked,
    /// so a child unlinked mid-iteration is detected instead of dereferenced.
    Dir {
        next: Option<ArenaIndex>,
    },
}

/// Open handle (file or directory)
#[derive(Debug)]
struct Handle {
    node: ArenaIndex,
    options: OpenOptions,
    cursor: Cursor,
}

/// What the caller expects a resolved leaf to be.
#[derive(Clone, Copy, Debug)]
enum Expect {
    File,
    Directory,
}

/// Everything the metadata lock guards.
#[derive(Debug)]
struct FsState {
    nodes: Arena<Node>,
    root: ArenaIndex,
    handles: HashMap<HandleId, Handle>,
    next_handle: u64,
}

impl FsState {
    fn alloc_handle(&mut self) -> HandleId {
        let id = HandleId::new(self.next_handle);
        self.next_handle += 1;
        id
    }

    fn node(&self, idx: ArenaIndex) -> FsResult<&Node> {
        self.nodes.get(idx).ok_or(FsError::NotFound)
    }

    /// Search a directory for `name` under ASCII case folding.
    fn find_child(&self, children: &VecDeque<ArenaIndex>, name: &str) -> Option<ArenaIndex> {
        children.iter().copied().find(|&idx| {
            self.nodes
                .get(idx)
                .is_some_and(|node| node.name.eq_ignore_ascii_case(name))
        })
    }

    /// Walk `path` from the root. Intermediate segments must name directories
    /// (empty segments from doubled slashes are skipped); the leaf must match
    /// `expect`. The empty path and a trailing slash denote a directory
    /// itself.
    fn resolve(&self, path: &str, expect: Expect) -> FsResult<ArenaIndex> {
        let mut cur = self.root;
        let mut rest = path;

        while let Some(slash) = rest.find('/') {
            let seg = &rest[..slash];
            rest = &rest[slash + 1..];
            if seg.is_empty() {
                continue;
            }
            let children = self.node(cur)?.children().ok_or(FsError::NotFound)?;
            let child = self.find_child(children, seg).ok_or(FsError::NotFound)?;
            if !self.node(child)?.is_dir() {
                return Err(FsError::NotFound);
            }
            cur = child;
        }

        if rest.is_empty() {
            return match expect {
                Expect::Directory => Ok(cur),
                Expect::File => Err(FsError::InvalidArgument),
            };
        }

        let children = self.node(cur)?.children().ok_or(FsError::NotFound)?;
        let child = self.find_child(children, rest).ok_or(FsError::NotFound)?;
        match (expect, self.node(child)?.is_dir()) {
            (Expect::File, true) => Err(FsError::InvalidArgument),
            (Expect::Directory, false) => Err(FsError::IsADirectory),
            _ => Ok(child),
        }
    }

    /// Locate the parent directory of `path` and split off the leaf name.
    fn resolve_parent<'a>(&self, path: &'a str) -> FsResult<(ArenaIndex, &'a str)> {
        match path.rfind('/') {
            None => Ok((self.root, path)),
            Some(pos) => {
                let dir = self.resolve(&path[..pos], Expect::Directory)?;
                Ok((dir, &path[pos + 1..]))
            }
        }
    }

    /// Create a file node under `parent`, linked at the front of its index.
    /// Nothing is linked into the tree until every allocation has succeeded.
    fn create_file(
        &mut self,
        parent: ArenaIndex,
        name: &str,
        block_size: usize,
    ) -> FsResult<ArenaIndex> {
        if name.is_empty() {
            return Err(FsError::InvalidArgument);
        }
        let children = self.node(parent)?.children().ok_or(FsError::NotFound)?;
        if self.find_child(children, name).is_some() {
            return Err(FsError::AlreadyExists);
        }

        let store = DataStore::with_block(block_size)?;
        let idx = self.nodes.insert(Node::new_file(name.to_string(), store));
        let parent_node = self.nodes.get_mut(parent).ok_or(FsError::NotFound)?;
        let children = parent_node.children_mut().ok_or(FsError::NotFound)?;
        children.push_front(idx);
        Ok(idx)
    }
}

/// The in-memory filesystem instance
///
/// An ordinary owned value: construct with [`RamFs::new`], share behind an
/// `Arc` for concurrent callers, drop to tear everything down. Instances are
/// fully independent of each other.
pub struct RamFs {
    config: FsConfig,
    state: Mutex<FsState>,
}

impl RamFs {
    /// Create a new filesystem with an empty root directory.
    pub fn new(config: FsConfig) -> FsResult<Self> {
        if config.block_size == 0 {
            return Err(FsError::InvalidArgument);
        }
        let mut nodes = Arena::new();
        let root = nodes.insert(Node::new_directory("/".to_string()));
        Ok(Self {
            config,
            state: Mutex::new(FsState {
                nodes,
                root,
                handles: HashMap::new(),
                next_handle: 1,
            }),
        })
    }

    /// Registration advertisement for the routing layer.
    pub fn handler_info(&self) -> HandlerInfo {
        HandlerInfo {
            name: HANDLER_NAME,
            version: HANDLER_VERSION,
        }
    }

    fn lock(&self) -> MutexGuard<'_, FsState> {
        self.state.lock().unwrap()
    }

    /// Open a file or directory.
    pub fn open(&self, path: &str, opts: &OpenOptions) -> FsResult<HandleId> {
        let mut state = self.lock();
        let id = self.open_locked(&mut state, path, opts)?;
        debug!(path, handle = id.0, "open");
        Ok(id)
    }

    fn open_locked(
        &self,
        state: &mut FsState,
        path: &str,
        opts: &OpenOptions,
    ) -> FsResult<HandleId> {
        let path = path.strip_prefix('/').unwrap_or(path);

        if opts.directory && opts.write {
            return Err(FsError::IsADirectory);
        }
        if state.handles.len() >= self.config.limits.max_open_handles {
            return Err(FsError::TooManyOpenFiles);
        }

        let node_idx = if path.is_empty() {
            state.root
        } else {
            let expect = if opts.directory {
                Expect::Directory
            } else {
                Expect::File
            };
            match state.resolve(path, expect) {
                Ok(idx) => idx,
                // Only genuine absence triggers creation, and only with write
                // intent on a non-directory open.
                Err(FsError::NotFound) if opts.write && !opts.directory => {
                    let (parent, leaf) = state.resolve_parent(path)?;
                    state.create_file(parent, leaf, self.config.block_size)?
                }
                Err(e) => return Err(e),
            }
        };

        let node = state.nodes.get_mut(node_idx).ok_or(FsError::NotFound)?;
        if node.is_dir() && !opts.directory {
            return Err(FsError::InvalidArgument);
        }

        match node.lock_state {
            LockState::WriteExclusive => return Err(FsError::Busy),
            LockState::ReadShared if opts.write => return Err(FsError::Busy),
            _ => {}
        }

        let cursor = if opts.directory {
            let children = node.children().ok_or(FsError::InvalidArgument)?;
            Cursor::Dir {
                next: children.front().copied(),
            }
        } else if opts.write {
            let store = node.store_mut().ok_or(FsError::InvalidArgument)?;
            if opts.append {
                Cursor::File { pos: store.len() }
            } else if opts.truncate {
                store.truncate()?;
                Cursor::File { pos: 0 }
            } else {
                Cursor::File { pos: 0 }
            }
        } else {
            Cursor::File { pos: 0 }
        };

        node.lock_state = if opts.write {
            LockState::WriteExclusive
        } else {
            LockState::ReadShared
        };
        node.open_count += 1;

        let id = state.alloc_handle();
        state.handles.insert(
            id,
            Handle {
                node: node_idx,
                options: opts.clone(),
                cursor,
            },
        );
        Ok(id)
    }

    /// Close a handle and release the node's open state.
    pub fn close(&self, handle_id: HandleId) -> FsResult<()> {
        let mut state = self.lock();
        self.close_locked(&mut state, handle_id)?;
        debug!(handle = handle_id.0, "close");
        Ok(())
    }

    fn close_locked(&self, state: &mut FsState, handle_id: HandleId) -> FsResult<()> {
        let handle = state.handles.remove(&handle_id).ok_or(FsError::BadHandle)?;
        if let Some(node) = state.nodes.get_mut(handle.node) {
            node.open_count = node.open_count.saturating_sub(1);
            if node.open_count == 0 {
                node.lock_state = LockState::Free;
            }
        }
        Ok(())
    }

    /// Read from the handle's cursor, bounded by the file size.
    pub fn read(&self, handle_id: HandleId, buf: &mut [u8]) -> FsResult<usize> {
        let mut state = self.lock();
        let state = &mut *state;
        let handle = state.handles.get_mut(&handle_id).ok_or(FsError::BadHandle)?;
        let Cursor::File { pos } = &mut handle.cursor else {
            return Err(FsError::BadHandle);
        };
        let node = state.nodes.get(handle.node).ok_or(FsError::BadHandle)?;
        let store = node.store().ok_or(FsError::BadHandle)?;

        let n = store.read_at(*pos, buf);
        *pos += n;
        trace!(handle = handle_id.0, bytes = n, "read");
        Ok(n)
    }

    /// Write at the handle's cursor, growing the file as needed.
    pub fn write(&self, handle_id: HandleId, data: &[u8]) -> FsResult<usize> {
        let mut state = self.lock();
        let state = &mut *state;
        let handle = state.handles.get_mut(&handle_id).ok_or(FsError::BadHandle)?;
        let Cursor::File { pos } = &mut handle.cursor else {
            return Err(FsError::BadHandle);
        };
        let node = state.nodes.get_mut(handle.node).ok_or(FsError::BadHandle)?;
        if node.lock_state != LockState::WriteExclusive {
            return Err(FsError::BadHandle);
        }
        let store = node.store_mut().ok_or(FsError::BadHandle)?;

        let n = store.write_at(*pos, data)?;
        *pos += n;
        trace!(handle = handle_id.0, bytes = n, "write");
        Ok(n)
    }

    /// Move the handle's cursor. The result is clamped to `[0, size]`; a
    /// negative target is rejected.
    pub fn seek(&self, handle_id: HandleId, from: SeekFrom) -> FsResult<u64> {
        let mut state = self.lock();
        let state = &mut *state;
        let handle = state.handles.get_mut(&handle_id).ok_or(FsError::BadHandle)?;
        let Cursor::File { pos } = &mut handle.cursor else {
            return Err(FsError::BadHandle);
        };
        let node = state.nodes.get(handle.node).ok_or(FsError::BadHandle)?;
        let size = node.store().ok_or(FsError::BadHandle)?.len() as i64;

        let target = match from {
            SeekFrom::Start(off) => i64::try_from(off).map_err(|_| FsError::InvalidArgument)?,
            SeekFrom::Current(off) => {
                (*pos as i64).checked_add(off).ok_or(FsError::InvalidArgument)?
            }
            SeekFrom::End(off) => size.checked_add(off).ok_or(FsError::InvalidArgument)?,
        };
        if target < 0 {
            return Err(FsError::InvalidArgument);
        }
        *pos = target.min(size) as usize;
        Ok(*pos as u64)
    }

    /// Current cursor position of a file handle.
    pub fn tell(&self, handle_id: HandleId) -> FsResult<u64> {
        let state = self.lock();
        let handle = state.handles.get(&handle_id).ok_or(FsError::BadHandle)?;
        match handle.cursor {
            Cursor::File { pos } => Ok(pos as u64),
            Cursor::Dir { .. } => Err(FsError::BadHandle),
        }
    }

    /// Logical size of the file behind a handle.
    pub fn total(&self, handle_id: HandleId) -> FsResult<u64> {
        let state = self.lock();
        let handle = state.handles.get(&handle_id).ok_or(FsError::BadHandle)?;
        if matches!(handle.cursor, Cursor::Dir { .. }) {
            return Err(FsError::BadHandle);
        }
        let node = state.nodes.get(handle.node).ok_or(FsError::BadHandle)?;
        let store = node.store().ok_or(FsError::BadHandle)?;
        Ok(store.len() as u64)
    }

    /// Return the next directory entry, or `None` at end-of-directory.
    pub fn readdir(&self, handle_id: HandleId) -> FsResult<Option<DirEntry>> {
        let mut state = self.lock();
        let state = &mut *state;
        let handle = state.handles.get_mut(&handle_id).ok_or(FsError::BadHandle)?;
        let Cursor::Dir { next } = &mut handle.cursor else {
            return Err(FsError::BadHandle);
        };
        let Some(cur) = *next else {
            return Ok(None);
        };

        let dir_node = state.nodes.get(handle.node).ok_or(FsError::BadHandle)?;
        let children = dir_node.children().ok_or(FsError::BadHandle)?;
        // The captured next-child may have been unlinked since the last call;
        // its index no longer resolves and is no longer in the parent index.
        let pos = children
            .iter()
            .position(|&c| c == cur)
            .ok_or(FsError::StaleCursor)?;
        let child = state.nodes.get(cur).ok_or(FsError::StaleCursor)?;

        let entry = DirEntry {
            name: child.name.clone(),
            is_dir: child.is_dir(),
            len: child.store().map(|s| s.len() as u64),
        };
        *next = children.get(pos + 1).copied();
        Ok(Some(entry))
    }

    /// Reset directory iteration to the first entry.
    pub fn rewinddir(&self, handle_id: HandleId) -> FsResult<()> {
        let mut state = self.lock();
        let state = &mut *state;
        let handle = state.handles.get_mut(&handle_id).ok_or(FsError::BadHandle)?;
        let Cursor::Dir { next } = &mut handle.cursor else {
            return Err(FsError::BadHandle);
        };
        let node = state.nodes.get(handle.node).ok_or(FsError::BadHandle)?;
        let children = node.children().ok_or(FsError::BadHandle)?;
        *next = children.front().copied();
        Ok(())
    }

    /// Remove a file. Fails while any handle to it is open.
    pub fn unlink(&self, path: &str) -> FsResult<()> {
        let mut state = self.lock();
        self.unlink_locked(&mut state, path)?;
        debug!(path, "unlink");
        Ok(())
    }

    fn unlink_locked(&self, state: &mut FsState, path: &str) -> FsResult<()> {
        let path = path.strip_prefix('/').unwrap_or(path);
        let node_idx = state.resolve(path, Expect::File)?;
        if state.node(node_idx)?.open_count > 0 {
            return Err(FsError::Busy);
        }

        let (parent, _) = state.resolve_parent(path)?;
        let parent_node = state.nodes.get_mut(parent).ok_or(FsError::NotFound)?;
        if let Some(children) = parent_node.children_mut() {
            children.retain(|&c| c != node_idx);
        }
        state.nodes.remove(node_idx);
        Ok(())
    }

    /// Metadata for a path. The empty path and `"/"` name the root.
    pub fn stat(&self, path: &str) -> FsResult<Metadata> {
        let state = self.lock();
        let path = path.strip_prefix('/').unwrap_or(path);
        if path.is_empty() {
            // The root carries no block accounting.
            return Ok(Metadata {
                dev: DEVICE_ID,
                mode: DIR_MODE,
                is_dir: true,
                len: None,
                nlink: 2,
                block_size: 0,
                blocks: 0,
            });
        }
        let node_idx = state.resolve(path, Expect::File)?;
        Ok(self.metadata_for(state.node(node_idx)?))
    }

    /// Metadata for an open handle (file or directory).
    pub fn fstat(&self, handle_id: HandleId) -> FsResult<Metadata> {
        let state = self.lock();
        let handle = state.handles.get(&handle_id).ok_or(FsError::BadHandle)?;
        let node = state.nodes.get(handle.node).ok_or(FsError::BadHandle)?;
        Ok(self.metadata_for(node))
    }

    fn metadata_for(&self, node: &Node) -> Metadata {
        let block_size = self.config.block_size as u64;
        match node.store() {
            Some(store) => {
                let allocated = store.capacity() as u64;
                Metadata {
                    dev: DEVICE_ID,
                    mode: FILE_MODE,
                    is_dir: false,
                    len: Some(allocated),
                    nlink: 1,
                    block_size: self.config.block_size as u32,
                    blocks: allocated.div_ceil(block_size),
                }
            }
            None => Metadata {
                dev: DEVICE_ID,
                mode: DIR_MODE,
                is_dir: true,
                len: None,
                nlink: 2,
                block_size: self.config.block_size as u32,
                blocks: 0,
            },
        }
    }

    /// Handle control. Only `GetFlags` carries an answer; the remaining
    /// commands succeed as no-ops.
    pub fn fcntl(&self, handle_id: HandleId, cmd: FcntlCmd) -> FsResult<Option<OpenOptions>> {
        let state = self.lock();
        let handle = state.handles.get(&handle_id).ok_or(FsError::BadHandle)?;
        match cmd {
            FcntlCmd::GetFlags => Ok(Some(handle.options.clone())),
            FcntlCmd::SetFlags | FcntlCmd::GetFd | FcntlCmd::SetFd => Ok(None),
        }
    }

    /// Raw view of a file's backing buffer, without copying and without
    /// bounds enforcement.
    ///
    /// # Safety
    ///
    /// The returned pointer bypasses the metadata lock. The caller must keep
    /// the handle open for as long as the pointer is used and must serialize
    /// all access against concurrent operations on the same file; a
    /// concurrent write may grow and thereby reallocate the buffer.
    pub unsafe fn mmap(&self, handle_id: HandleId) -> FsResult<MappedBuffer> {
        let mut state = self.lock();
        let state = &mut *state;
        let handle = state.handles.get(&handle_id).ok_or(FsError::BadHandle)?;
        if matches!(handle.cursor, Cursor::Dir { .. }) {
            return Err(FsError::BadHandle);
        }
        let node = state.nodes.get_mut(handle.node).ok_or(FsError::BadHandle)?;
        let store = node.store_mut().ok_or(FsError::BadHandle)?;

        let len = store.capacity();
        let ptr = NonNull::new(store.as_mut_ptr()).unwrap_or(NonNull::dangling());
        Ok(MappedBuffer::new(ptr, len))
    }

    /// Bind an externally-owned buffer into the tree as the content of
    /// `path`, without copying. Works like an open for write-truncate: the
    /// path is created if absent, and a busy file rejects the attach. The
    /// buffer is dropped if the attach fails.
    pub fn attach(&self, path: &str, buf: Vec<u8>) -> FsResult<()> {
        let mut state = self.lock();
        let opts = OpenOptions {
            write: true,
            truncate: true,
            ..Default::default()
        };
        let handle_id = self.open_locked(&mut state, path, &opts)?;

        let state = &mut *state;
        let size = buf.len();
        let handle = state.handles.get(&handle_id).ok_or(FsError::BadHandle)?;
        let node = state.nodes.get_mut(handle.node).ok_or(FsError::BadHandle)?;
        let store = node.store_mut().ok_or(FsError::BadHandle)?;
        store.replace(buf);

        self.close_locked(state, handle_id)?;
        debug!(path, size, "attach");
        Ok(())
    }

    /// Extract a file's buffer and logical size without copying, then remove
    /// the file. Ownership of the buffer passes to the caller.
    pub fn detach(&self, path: &str) -> FsResult<(Vec<u8>, usize)> {
        let mut state = self.lock();
        {
            let norm = path.strip_prefix('/').unwrap_or(path);
            let node_idx = state.resolve(norm, Expect::File)?;
            if state.node(node_idx)?.open_count > 0 {
                return Err(FsError::Busy);
            }
        }

        let handle_id = self.open_locked(&mut state, path, &OpenOptions::read_only())?;
        let (buf, size) = {
            let state = &mut *state;
            let handle = state.handles.get(&handle_id).ok_or(FsError::BadHandle)?;
            let node = state.nodes.get_mut(handle.node).ok_or(FsError::BadHandle)?;
            let store = node.store_mut().ok_or(FsError::BadHandle)?;
            store.take()
        };
        self.close_locked(&mut state, handle_id)?;
        self.unlink_locked(&mut state, path)?;
        debug!(path, size, "detach");
        Ok((buf, size))
    }

    /// Subdirectory creation is not implemented; the root is the only
    /// directory.
    pub fn mkdir(&self, _path: &str) -> FsResult<()> {
        Err(FsError::Unsupported)
    }

    /// Directory removal is not implemented.
    pub fn rmdir(&self, _path: &str) -> FsResult<()> {
        Err(FsError::Unsupported)
    }

    /// Instance-wide counters.
    pub fn stats(&self) -> FsStats {
        let state = self.lock();
        let bytes_in_memory = state
            .nodes
            .iter()
            .filter_map(|node| node.store())
            .map(|store| store.capacity() as u64)
            .sum();
        FsStats {
            open_handles: state.handles.len() as u32,
            nodes: state.nodes.len() as u64,
            bytes_in_memory,
        }
    }
}

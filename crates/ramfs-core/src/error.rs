// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Error types for the ramfs core

/// Core filesystem error type
#[derive(thiserror::Error, Debug)]
pub enum FsError {
    #[error("not found")]
    NotFound,
    #[error("already exists")]
    AlreadyExists,
    #[error("invalid argument")]
    InvalidArgument,
    #[error("is a directory")]
    IsADirectory,
    #[error("busy")]
    Busy,
    #[error("too many open files")]
    TooManyOpenFiles,
    #[error("bad file handle")]
    BadHandle,
    #[error("stale directory cursor")]
    StaleCursor,
    #[error("out of memory")]
    OutOfMemory,
    #[error("unsupported")]
    Unsupported,
}

impl FsError {
    /// Errno value for routing-layer hosts that report outcomes through C
    /// conventions.
    pub fn errno(&self) -> i32 {
        match self {
            FsError::NotFound => libc::ENOENT,
            FsError::AlreadyExists => libc::EEXIST,
            FsError::InvalidArgument => libc::EINVAL,
            FsError::IsADirectory => libc::EISDIR,
            FsError::Busy => libc::EBUSY,
            FsError::TooManyOpenFiles => libc::EMFILE,
            // A stale cursor means the entry it referenced is gone.
            FsError::StaleCursor => libc::ENOENT,
            FsError::BadHandle => libc::EBADF,
            FsError::OutOfMemory => libc::ENOMEM,
            FsError::Unsupported => libc::ENOSYS,
        }
    }
}

pub type FsResult<T> = Result<T, FsError>;

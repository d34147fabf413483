//! Error types for poolfs
//!
//! This module defines the common error type used by the object store
//! interface and the namespace engine built on top of it.

use crate::types::{PathError, PoolKind};
use thiserror::Error;

/// Common result type for poolfs operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for poolfs
#[derive(Debug, Error)]
pub enum Error {
    // Namespace errors
    #[error("path not found: {0}")]
    PathNotFound(String),

    #[error("path already exists: {0}")]
    AlreadyExists(String),

    #[error("not a directory: {0}")]
    NotADirectory(String),

    #[error("is a directory: {0}")]
    IsADirectory(String),

    #[error("directory not empty: {0}")]
    NotEmpty(String),

    #[error("invalid path: {0}")]
    InvalidPath(#[from] PathError),

    // Attribute errors
    #[error("attribute {name} not found on {path}")]
    AttributeNotFound { path: String, name: String },

    #[error("attribute {name} holds {len} bytes, caller accepts {max_len}")]
    Truncated {
        name: String,
        len: usize,
        max_len: usize,
    },

    // Pool errors
    #[error("pool not found: {0}")]
    PoolNotFound(String),

    #[error("no {kind} pool governs {path}")]
    NoMatchingPool { kind: PoolKind, path: String },

    #[error("a {kind} pool is already registered for prefix {prefix}")]
    DuplicatePrefix { kind: PoolKind, prefix: String },

    #[error("invalid pool: {0}")]
    InvalidPool(String),

    #[error("pool {0} still backs existing paths")]
    PoolInUse(String),

    #[error("pool {pool} is out of space: {used} of {quota} bytes used")]
    NoSpace { pool: String, used: u64, quota: u64 },

    // Object store errors
    #[error("object not found: {pool}/{object}")]
    ObjectNotFound { pool: String, object: String },

    #[error("object already exists: {pool}/{object}")]
    ObjectExists { pool: String, object: String },

    #[error("lock on {0} is held by another owner")]
    Busy(String),

    #[error("store I/O error: {0}")]
    Io(String),

    #[error("write failed at offset {offset} after {written} bytes: {source}")]
    WriteFailed {
        offset: u64,
        written: u64,
        source: Box<Error>,
    },

    // Internal errors
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a store I/O error
    pub fn io(msg: impl Into<String>) -> Self {
        Self::Io(msg.into())
    }

    /// Create an invalid argument error
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Check if the caller may retry after backing off
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Busy(_) => true,
            Self::WriteFailed { source, .. } => source.is_retryable(),
            _ => false,
        }
    }

    /// Check if this is a not found error
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::PathNotFound(_)
                | Self::AttributeNotFound { .. }
                | Self::PoolNotFound(_)
                | Self::NoMatchingPool { .. }
                | Self::ObjectNotFound { .. }
        )
    }

    /// POSIX errno equivalent, used as the per-entry status of batched calls
    #[must_use]
    pub fn errno(&self) -> i32 {
        match self {
            Self::PathNotFound(_)
            | Self::PoolNotFound(_)
            | Self::NoMatchingPool { .. }
            | Self::ObjectNotFound { .. } => libc::ENOENT,

            Self::AttributeNotFound { .. } => libc::ENODATA,

            Self::AlreadyExists(_) | Self::ObjectExists { .. } | Self::DuplicatePrefix { .. } => {
                libc::EEXIST
            }

            Self::NotADirectory(_) => libc::ENOTDIR,
            Self::IsADirectory(_) => libc::EISDIR,
            Self::NotEmpty(_) => libc::ENOTEMPTY,
            Self::Truncated { .. } => libc::ERANGE,
            Self::NoSpace { .. } => libc::ENOSPC,
            Self::Busy(_) | Self::PoolInUse(_) => libc::EBUSY,

            Self::InvalidPath(_)
            | Self::InvalidPool(_)
            | Self::InvalidArgument(_)
            | Self::Configuration(_) => libc::EINVAL,

            Self::WriteFailed { source, .. } => source.errno(),

            Self::Io(_) | Self::Internal(_) => libc::EIO,
        }
    }
}

//! Core type definitions for poolfs
//!
//! This module defines the fundamental types used throughout the system:
//! normalized paths, inode identifiers, pool kinds and caller identity.

use derive_more::{Display, From, Into};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Maximum length of a normalized path in bytes
pub const MAX_PATH_LEN: usize = 4096;

/// Identifier of the physical object backing a path
///
/// The inode is the key of every stripe object of a file and never changes
/// for the lifetime of the entry, whatever path points to it.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, From, Into)]
pub struct InodeId(Uuid);

impl InodeId {
    /// Generate a new random inode ID
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Create from existing UUID
    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Get the underlying UUID
    #[must_use]
    pub const fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for InodeId {
    fn default() -> Self {
        Self::new()
    }
}

impl FromStr for InodeId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self::from_uuid)
    }
}

impl fmt::Debug for InodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "InodeId({})", self.0)
    }
}

impl fmt::Display for InodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A normalized, absolute, slash-separated path
///
/// A path names a directory iff it ends in `/`. Normalization collapses
/// repeated separators and resolves `.` and `..` without ever climbing
/// above the root.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Display)]
#[display("{_0}")]
pub struct FsPath(String);

impl FsPath {
    /// Parse and normalize a path
    pub fn new(path: &str) -> Result<Self, PathError> {
        Self::normalize(path).map(Self)
    }

    /// The root directory
    #[must_use]
    pub fn root() -> Self {
        Self("/".to_string())
    }

    /// Get the path as a string slice
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// True if this path names a directory
    #[must_use]
    pub fn is_dir(&self) -> bool {
        self.0.ends_with('/')
    }

    /// True if this is the root directory
    #[must_use]
    pub fn is_root(&self) -> bool {
        self.0 == "/"
    }

    /// The directory containing this path, `None` for the root
    #[must_use]
    pub fn parent(&self) -> Option<Self> {
        if self.is_root() {
            return None;
        }
        let trimmed = self.0.trim_end_matches('/');
        let idx = trimmed.rfind('/')?;
        Some(Self(trimmed[..=idx].to_string()))
    }

    /// Last component; directories keep their trailing `/`
    #[must_use]
    pub fn name(&self) -> &str {
        if self.is_root() {
            return "";
        }
        let trimmed = self.0.trim_end_matches('/');
        let start = trimmed.rfind('/').map_or(0, |idx| idx + 1);
        &self.0[start..]
    }

    /// The same path in directory form
    #[must_use]
    pub fn to_dir(&self) -> Self {
        if self.is_dir() {
            self.clone()
        } else {
            Self(format!("{}/", self.0))
        }
    }

    /// Append a child name to this directory
    pub fn child(&self, name: &str) -> Result<Self, PathError> {
        Self::new(&format!("{}{}", self.to_dir().as_str(), name))
    }

    fn normalize(raw: &str) -> Result<String, PathError> {
        if raw.is_empty() {
            return Err(PathError::Empty);
        }
        if !raw.starts_with('/') {
            return Err(PathError::Relative(raw.to_string()));
        }
        if raw.contains('\0') {
            return Err(PathError::InvalidChar('\0'));
        }

        let dir = raw.ends_with('/') || raw.ends_with("/.") || raw.ends_with("/..");
        let mut parts: Vec<&str> = Vec::new();
        for component in raw.split('/') {
            match component {
                "" | "." => {}
                ".." => {
                    parts.pop();
                }
                other => parts.push(other),
            }
        }

        let mut out = String::with_capacity(raw.len() + 1);
        out.push('/');
        out.push_str(&parts.join("/"));
        if dir && !parts.is_empty() {
            out.push('/');
        }

        if out.len() > MAX_PATH_LEN {
            return Err(PathError::TooLong(out.len()));
        }
        Ok(out)
    }
}

impl fmt::Debug for FsPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FsPath({:?})", self.0)
    }
}

impl FromStr for FsPath {
    type Err = PathError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl AsRef<str> for FsPath {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Errors that can occur when parsing a path
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PathError {
    #[error("path cannot be empty")]
    Empty,
    #[error("path must be absolute: {0}")]
    Relative(String),
    #[error("path is {0} bytes, limit is {MAX_PATH_LEN}")]
    TooLong(usize),
    #[error("path contains invalid character: {0:?}")]
    InvalidChar(char),
}

/// The two kinds of storage pool
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[serde(rename_all = "lowercase")]
pub enum PoolKind {
    /// Holds file content stripes
    #[display("data")]
    Data,
    /// Holds directory entries and per-path attributes
    #[display("metadata")]
    Metadata,
}

/// What a path resolves to
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    File,
    Directory,
}

impl EntryKind {
    /// Tag persisted in the entry's attributes
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::File => "file",
            Self::Directory => "dir",
        }
    }
}

impl FromStr for EntryKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "file" => Ok(Self::File),
            "dir" => Ok(Self::Directory),
            other => Err(format!("unknown entry kind: {other}")),
        }
    }
}

impl fmt::Display for EntryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-process identity recorded on created entries
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub uid: u32,
    pub gid: u32,
}

impl Identity {
    #[must_use]
    pub const fn new(uid: u32, gid: u32) -> Self {
        Self { uid, gid }
    }
}

/// Logging verbosity consumed by the namespace engine
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    #[default]
    None,
    Debug,
}

impl LogLevel {
    /// Directive understood by `tracing_subscriber::EnvFilter`
    #[must_use]
    pub const fn as_filter(&self) -> &'static str {
        match self {
            Self::None => "off",
            Self::Debug => "debug",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_path_normalization() {
        assert_eq!(FsPath::new("/").unwrap().as_str(), "/");
        assert_eq!(FsPath::new("//a///b").unwrap().as_str(), "/a/b");
        assert_eq!(FsPath::new("/a/./b/").unwrap().as_str(), "/a/b/");
        assert_eq!(FsPath::new("/a/b/..").unwrap().as_str(), "/a/");
        assert_eq!(FsPath::new("/../../x").unwrap().as_str(), "/x");
        assert_eq!(FsPath::new("/a/..").unwrap().as_str(), "/");
    }

    #[test]
    fn test_path_rejects_malformed() {
        assert_eq!(FsPath::new(""), Err(PathError::Empty));
        assert!(matches!(FsPath::new("a/b"), Err(PathError::Relative(_))));
        assert_eq!(FsPath::new("/a\0b"), Err(PathError::InvalidChar('\0')));
        let long = format!("/{}", "x".repeat(MAX_PATH_LEN));
        assert!(matches!(FsPath::new(&long), Err(PathError::TooLong(_))));
    }

    #[test]
    fn test_path_parent_and_name() {
        let file = FsPath::new("/a/b/c").unwrap();
        assert!(!file.is_dir());
        assert_eq!(file.parent().unwrap().as_str(), "/a/b/");
        assert_eq!(file.name(), "c");

        let dir = FsPath::new("/a/b/").unwrap();
        assert!(dir.is_dir());
        assert_eq!(dir.parent().unwrap().as_str(), "/a/");
        assert_eq!(dir.name(), "b/");

        assert_eq!(FsPath::new("/x").unwrap().parent(), Some(FsPath::root()));
        assert!(FsPath::root().parent().is_none());
        assert_eq!(FsPath::root().name(), "");
    }

    #[test]
    fn test_path_child_and_dir_form() {
        let dir = FsPath::new("/a").unwrap().to_dir();
        assert_eq!(dir.as_str(), "/a/");
        assert_eq!(dir.child("f").unwrap().as_str(), "/a/f");
        assert_eq!(dir.child("d/").unwrap().as_str(), "/a/d/");
    }

    #[test]
    fn test_inode_id_roundtrip_through_string() {
        let id = InodeId::new();
        let parsed: InodeId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
        assert!("not-a-uuid".parse::<InodeId>().is_err());
    }

    #[test]
    fn test_inode_id_wraps_uuid() {
        let uuid = Uuid::new_v4();
        let id = InodeId::from_uuid(uuid);
        assert_eq!(id.as_uuid(), uuid);
        assert_eq!(id.to_string(), uuid.to_string());
        assert_ne!(InodeId::new(), id);
    }

    #[test]
    fn test_entry_kind_tags() {
        assert_eq!("dir".parse::<EntryKind>(), Ok(EntryKind::Directory));
        assert_eq!(EntryKind::File.as_str(), "file");
        assert!("socket".parse::<EntryKind>().is_err());
    }

    #[test]
    fn test_log_level_filter() {
        assert_eq!(LogLevel::default(), LogLevel::None);
        assert_eq!(LogLevel::Debug.as_filter(), "debug");
        assert_eq!(PoolKind::Metadata.to_string(), "metadata");
    }
}

//! Resolved entry metadata
//!
//! Every path has one object in its metadata pool, named by the normalized
//! path. The mapping to the backing inode and the bookkeeping fields live in
//! reserved attributes on that object:
//!
//! ```text
//! /docs/report            (object in metadata pool "meta")
//! ├── poolfs.inode   = data:6f1c...e2     → stripes data/6f1c...e2.0000000000000000, ...
//! ├── poolfs.kind    = file
//! ├── poolfs.uid     = 1000
//! ├── poolfs.gid     = 100
//! ├── poolfs.mode    = 100644
//! ├── poolfs.ctime   = 1760000000
//! └── poolfs.stripe  = 33554432
//! ```

use bytes::Bytes;
use poolfs_common::{EntryKind, Error, FsPath, InodeId, Result};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

/// Namespace of attributes owned by the engine
pub const RESERVED_ATTR_PREFIX: &str = "poolfs.";

pub const ATTR_INODE: &str = "poolfs.inode";
pub const ATTR_KIND: &str = "poolfs.kind";
pub const ATTR_UID: &str = "poolfs.uid";
pub const ATTR_GID: &str = "poolfs.gid";
pub const ATTR_MODE: &str = "poolfs.mode";
pub const ATTR_CTIME: &str = "poolfs.ctime";
pub const ATTR_STRIPE: &str = "poolfs.stripe";

/// Default mode of regular files
pub const FILE_MODE: u32 = 0o100_644;
/// Default mode of directories
pub const DIR_MODE: u32 = 0o040_755;

/// Pool and inode backing a path
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize)]
pub struct InodeRef {
    /// Data pool for files, metadata pool for directories
    pub pool: String,
    pub inode: InodeId,
}

impl InodeRef {
    #[must_use]
    pub const fn new(pool: String, inode: InodeId) -> Self {
        Self { pool, inode }
    }
}

impl fmt::Display for InodeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.pool, self.inode)
    }
}

impl FromStr for InodeRef {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (pool, inode) = s
            .rsplit_once(':')
            .ok_or_else(|| Error::internal(format!("malformed inode reference: {s}")))?;
        if pool.is_empty() {
            return Err(Error::internal(format!("inode reference without pool: {s}")));
        }
        let inode = inode
            .parse()
            .map_err(|e| Error::internal(format!("malformed inode in {s}: {e}")))?;
        Ok(Self::new(pool.to_string(), inode))
    }
}

/// Everything known about a resolved path
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct EntryMetadata {
    pub path: FsPath,
    pub kind: EntryKind,
    /// Pool holding this entry's metadata object
    pub metadata_pool: String,
    pub inode: InodeRef,
    pub uid: u32,
    pub gid: u32,
    pub mode: u32,
    /// Creation time, seconds since the epoch
    pub ctime: u64,
    /// Stripe size recorded at creation (files only)
    pub stripe_size: Option<u64>,
}

impl EntryMetadata {
    /// Decode the reserved attributes of a metadata object
    ///
    /// Returns `Ok(None)` when the object carries no inode mapping, which
    /// happens for an object whose creation has not completed.
    pub fn from_attrs(
        path: &FsPath,
        metadata_pool: &str,
        attrs: &BTreeMap<String, Bytes>,
    ) -> Result<Option<Self>> {
        let Some(inode) = attr_str(attrs, ATTR_INODE)? else {
            return Ok(None);
        };
        let corrupt = |what: &str| Error::internal(format!("entry {path} has {what}"));

        let kind = attr_str(attrs, ATTR_KIND)?
            .ok_or_else(|| corrupt("no kind"))?
            .parse::<EntryKind>()
            .map_err(|e| corrupt(&e))?;
        let number = |name: &str, radix: u32| -> Result<u64> {
            let raw = attr_str(attrs, name)?.ok_or_else(|| corrupt(&format!("no {name}")))?;
            u64::from_str_radix(raw, radix).map_err(|_| corrupt(&format!("malformed {name}")))
        };

        let stripe_size = match kind {
            EntryKind::File => Some(number(ATTR_STRIPE, 10)?),
            EntryKind::Directory => None,
        };

        Ok(Some(Self {
            path: path.clone(),
            kind,
            metadata_pool: metadata_pool.to_string(),
            inode: inode.parse()?,
            uid: to_u32(number(ATTR_UID, 10)?, || corrupt("uid out of range"))?,
            gid: to_u32(number(ATTR_GID, 10)?, || corrupt("gid out of range"))?,
            mode: to_u32(number(ATTR_MODE, 8)?, || corrupt("mode out of range"))?,
            ctime: number(ATTR_CTIME, 10)?,
            stripe_size,
        }))
    }

    /// Encode as reserved attributes
    #[must_use]
    pub fn to_attrs(&self) -> BTreeMap<String, Bytes> {
        let mut attrs = BTreeMap::new();
        let mut put = |name: &str, value: String| {
            attrs.insert(name.to_string(), Bytes::from(value));
        };
        put(ATTR_INODE, self.inode.to_string());
        put(ATTR_KIND, self.kind.as_str().to_string());
        put(ATTR_UID, self.uid.to_string());
        put(ATTR_GID, self.gid.to_string());
        put(ATTR_MODE, format!("{:o}", self.mode));
        put(ATTR_CTIME, self.ctime.to_string());
        if let Some(stripe) = self.stripe_size {
            put(ATTR_STRIPE, stripe.to_string());
        }
        attrs
    }

    #[must_use]
    pub fn is_dir(&self) -> bool {
        self.kind == EntryKind::Directory
    }

    /// Approximate heap footprint, used for cache accounting
    #[must_use]
    pub fn estimated_size(&self) -> usize {
        std::mem::size_of::<Self>() + self.path.as_str().len() + self.metadata_pool.len()
            + self.inode.pool.len()
    }

    /// Stripe layout of a file, `None` for directories
    #[must_use]
    pub fn layout(&self) -> Option<FileLayout> {
        self.stripe_size.map(|stripe_size| FileLayout {
            pool: self.inode.pool.clone(),
            inode: self.inode.inode,
            stripe_size,
        })
    }
}

fn attr_str<'a>(attrs: &'a BTreeMap<String, Bytes>, name: &str) -> Result<Option<&'a str>> {
    attrs
        .get(name)
        .map(|raw| {
            std::str::from_utf8(raw)
                .map_err(|_| Error::internal(format!("attribute {name} is not UTF-8")))
        })
        .transpose()
}

fn to_u32(value: u64, err: impl FnOnce() -> Error) -> Result<u32> {
    u32::try_from(value).map_err(|_| err())
}

/// Where a file's stripes live
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FileLayout {
    /// Data pool holding the stripes
    pub pool: String,
    pub inode: InodeId,
    pub stripe_size: u64,
}

/// A resolved path, tagged by kind
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FsInfo {
    File(Arc<EntryMetadata>),
    Directory(Arc<EntryMetadata>),
}

impl FsInfo {
    #[must_use]
    pub fn from_entry(entry: Arc<EntryMetadata>) -> Self {
        match entry.kind {
            EntryKind::File => Self::File(entry),
            EntryKind::Directory => Self::Directory(entry),
        }
    }

    /// Fields shared by both kinds
    #[must_use]
    pub fn metadata(&self) -> &EntryMetadata {
        match self {
            Self::File(entry) | Self::Directory(entry) => entry,
        }
    }

    #[must_use]
    pub fn path(&self) -> &FsPath {
        &self.metadata().path
    }

    #[must_use]
    pub const fn is_dir(&self) -> bool {
        matches!(self, Self::Directory(_))
    }
}

/// Result of `stat` on a path
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Stat {
    pub path: FsPath,
    pub kind: EntryKind,
    pub inode: InodeRef,
    /// Logical file size; number of children for directories
    pub size: u64,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub ctime: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file_entry() -> EntryMetadata {
        EntryMetadata {
            path: FsPath::new("/docs/report").unwrap(),
            kind: EntryKind::File,
            metadata_pool: "meta".into(),
            inode: InodeRef::new("data".into(), InodeId::new()),
            uid: 1000,
            gid: 100,
            mode: FILE_MODE,
            ctime: 1_760_000_000,
            stripe_size: Some(4096),
        }
    }

    #[test]
    fn test_attrs_roundtrip() {
        let entry = file_entry();
        let attrs = entry.to_attrs();
        assert_eq!(&attrs[ATTR_MODE][..], b"100644");
        assert!(attrs.keys().all(|k| k.starts_with(RESERVED_ATTR_PREFIX)));

        let decoded = EntryMetadata::from_attrs(&entry.path, "meta", &attrs)
            .unwrap()
            .unwrap();
        assert_eq!(decoded, entry);
    }

    #[test]
    fn test_missing_inode_is_not_an_entry() {
        let path = FsPath::new("/half-created").unwrap();
        let mut attrs = BTreeMap::new();
        attrs.insert(ATTR_KIND.to_string(), Bytes::from_static(b"file"));
        assert!(EntryMetadata::from_attrs(&path, "meta", &attrs).unwrap().is_none());
    }

    #[test]
    fn test_corrupt_attrs_rejected() {
        let entry = file_entry();
        let mut attrs = entry.to_attrs();
        attrs.insert(ATTR_UID.to_string(), Bytes::from_static(b"-1"));
        assert!(matches!(
            EntryMetadata::from_attrs(&entry.path, "meta", &attrs),
            Err(Error::Internal(_))
        ));

        let mut attrs = entry.to_attrs();
        attrs.remove(ATTR_STRIPE);
        assert!(EntryMetadata::from_attrs(&entry.path, "meta", &attrs).is_err());
    }

    #[test]
    fn test_inode_ref_parse() {
        let id = InodeId::new();
        let parsed: InodeRef = format!("pool:with:colons:{id}").parse().unwrap();
        assert_eq!(parsed.pool, "pool:with:colons");
        assert_eq!(parsed.inode, id);
        assert!("no-separator".parse::<InodeRef>().is_err());
        assert!(format!(":{id}").parse::<InodeRef>().is_err());
    }

    #[test]
    fn test_fs_info_dispatch() {
        let file = Arc::new(file_entry());
        let info = FsInfo::from_entry(file.clone());
        assert!(!info.is_dir());
        assert_eq!(info.path(), &file.path);
        assert_eq!(info.metadata().layout().unwrap().stripe_size, 4096);

        let mut dir = file_entry();
        dir.kind = EntryKind::Directory;
        dir.stripe_size = None;
        let info = FsInfo::from_entry(Arc::new(dir));
        assert!(info.is_dir());
        assert!(info.metadata().layout().is_none());
    }
}

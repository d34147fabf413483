#![allow(clippy::result_large_err)]
//! poolfs namespace engine
//!
//! A hierarchical namespace over a pooled object store. Paths are mapped to
//! inodes through per-path metadata objects; file content is striped across
//! objects in a data pool chosen by the longest registered path prefix.
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │                 Filesystem                   │
//! │  create/mkdir/rmdir/remove/readdir/open      │
//! │  stat/stat_many, xattrs, pool management     │
//! └──────┬──────────────┬──────────────┬─────────┘
//!        │              │              │
//! ┌──────▼──────┐ ┌─────▼─────┐ ┌──────▼──────┐
//! │  Resolver   │ │ Attribute │ │   FileIo    │
//! │  + DirCache │ │   Store   │ │ stripes and │
//! │             │ │           │ │ inode locks │
//! └──────┬──────┘ └─────┬─────┘ └──────┬──────┘
//!        │     PoolRegistry (prefix → pool)
//! ┌──────▼──────────────▼──────────────▼──────┐
//! │            ObjectStore (pools)            │
//! └───────────────────────────────────────────┘
//! ```

pub mod dircache;
pub mod entry;
pub mod file;
pub mod fs;
pub mod lock;
mod namespace;
pub mod registry;
pub mod resolver;
pub mod stripe;
pub mod xattr;

pub use dircache::{CacheDebugInfo, CacheStats, DirCache};
pub use entry::{EntryMetadata, FileLayout, FsInfo, InodeRef, Stat};
pub use file::File;
pub use fs::{Filesystem, Internals};
pub use registry::{DataPool, MetadataPool, PoolRegistry, PrefixTable};
pub use resolver::{ClusterStat, PoolStat};
pub use stripe::{StripeMapper, StripeRange};

//! The object store collaborator
//!
//! Every call is a blocking point operation against one named object in one
//! pool. Implementations carry their own retry and timeout policy; callers
//! surface whatever error comes back.

use bytes::Bytes;
use poolfs_common::{Error, Result};
use std::collections::BTreeMap;
use std::time::{Duration, SystemTime};

/// Capacity counters for a single pool
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PoolUsage {
    /// Raw capacity in bytes
    pub total_bytes: u64,
    /// Bytes consumed by object data
    pub used_bytes: u64,
    /// Number of objects in the pool
    pub num_objects: u64,
}

impl PoolUsage {
    /// Bytes still available
    #[must_use]
    pub const fn available(&self) -> u64 {
        self.total_bytes.saturating_sub(self.used_bytes)
    }

    /// Fold another pool's counters into this one
    pub fn accumulate(&mut self, other: &Self) {
        self.total_bytes += other.total_bytes;
        self.used_bytes += other.used_bytes;
        self.num_objects += other.num_objects;
    }
}

/// Size and modification time of an object
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ObjectStat {
    pub size: u64,
    pub mtime: SystemTime,
}

/// Object store client consumed by the namespace engine
pub trait ObjectStore: Send + Sync {
    /// Names of all pools in the cluster
    fn list_pools(&self) -> Result<Vec<String>>;

    /// Capacity counters of one pool
    fn pool_usage(&self, pool: &str) -> Result<PoolUsage>;

    /// Create an empty object; with `exclusive`, fail if it already exists
    fn create(&self, pool: &str, object: &str, exclusive: bool) -> Result<()>;

    /// Size and modification time of an object
    fn stat(&self, pool: &str, object: &str) -> Result<ObjectStat>;

    /// Read up to `len` bytes at `offset`; short at end of object
    fn read(&self, pool: &str, object: &str, offset: u64, len: u64) -> Result<Bytes>;

    /// Write at `offset`, creating the object if needed
    fn write(&self, pool: &str, object: &str, offset: u64, data: &[u8]) -> Result<()>;

    /// Append to the object, returning its new size
    fn append(&self, pool: &str, object: &str, data: &[u8]) -> Result<u64>;

    /// Set the object size, creating it if needed
    fn truncate(&self, pool: &str, object: &str, size: u64) -> Result<()>;

    /// Remove an object along with its attributes and key/value map
    fn remove(&self, pool: &str, object: &str) -> Result<()>;

    /// Object names starting with `prefix`, sorted
    fn list_objects(&self, pool: &str, prefix: &str) -> Result<Vec<String>>;

    fn get_xattr(&self, pool: &str, object: &str, name: &str) -> Result<Bytes>;

    fn set_xattr(&self, pool: &str, object: &str, name: &str, value: &[u8]) -> Result<()>;

    /// Set several attributes in one operation
    fn set_xattrs(&self, pool: &str, object: &str, attrs: &BTreeMap<String, Bytes>) -> Result<()>;

    fn remove_xattr(&self, pool: &str, object: &str, name: &str) -> Result<()>;

    /// All attributes of an object
    fn list_xattrs(&self, pool: &str, object: &str) -> Result<BTreeMap<String, Bytes>>;

    /// Insert or replace key/value map entries
    fn omap_set(&self, pool: &str, object: &str, entries: &BTreeMap<String, Bytes>) -> Result<()>;

    /// Remove key/value map entries; missing keys are ignored
    fn omap_remove(&self, pool: &str, object: &str, keys: &[String]) -> Result<()>;

    /// The whole key/value map of an object
    fn omap_list(&self, pool: &str, object: &str) -> Result<BTreeMap<String, Bytes>>;

    /// Take the named exclusive lock on an object
    ///
    /// Re-locking with the same cookie renews the lease. Returns
    /// [`Error::Busy`] while another cookie holds an unexpired lease.
    fn lock_exclusive(
        &self,
        pool: &str,
        object: &str,
        name: &str,
        cookie: &str,
        lease: Duration,
    ) -> Result<()>;

    /// Release a lock taken with the same cookie
    fn unlock(&self, pool: &str, object: &str, name: &str, cookie: &str) -> Result<()>;

    /// True if the object exists
    fn exists(&self, pool: &str, object: &str) -> Result<bool> {
        match self.stat(pool, object) {
            Ok(_) => Ok(true),
            Err(Error::ObjectNotFound { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }
}

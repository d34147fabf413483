//! Striped file I/O
//!
//! File content lives in the data pool as independent stripe objects. A
//! write is split on stripe boundaries and issued as one point write per
//! stripe; there is no transaction across stripes, so a failure leaves the
//! stripes already written in place and reports where it stopped.
//!
//! Pool quotas are enforced per stripe. Growth within one process is
//! serialized per pool, so concurrent writers cannot overshoot the quota
//! together; writers in other processes sharing the pool are not, and the
//! quota is only a soft bound across them.

use crate::entry::{EntryMetadata, FileLayout};
use crate::lock::{InodeLocks, Lease};
use crate::registry::PoolRegistry;
use crate::stripe::{StripeMapper, StripeRange};
use bytes::{Bytes, BytesMut};
use dashmap::DashMap;
use parking_lot::Mutex;
use poolfs_common::{Error, FsPath, Result};
use poolfs_store::ObjectStore;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{debug, warn};

/// Largest number of bytes a single read returns
pub const MAX_READ_LEN: u64 = 1 << 30;

/// Reads and writes file content by inode
pub struct FileIo {
    store: Arc<dyn ObjectStore>,
    registry: Arc<PoolRegistry>,
    locks: InodeLocks,
    locking: AtomicBool,
    /// Held while checking and applying growth in a pool with a quota
    growth: DashMap<String, Arc<Mutex<()>>>,
}

impl FileIo {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        registry: Arc<PoolRegistry>,
        locking: bool,
        lease: Duration,
    ) -> Self {
        Self {
            store,
            registry,
            locks: InodeLocks::new(lease),
            locking: AtomicBool::new(locking),
            growth: DashMap::new(),
        }
    }

    pub fn locking(&self) -> bool {
        self.locking.load(Ordering::Relaxed)
    }

    pub fn set_locking(&self, enabled: bool) {
        self.locking.store(enabled, Ordering::Relaxed);
    }

    pub fn locks(&self) -> &InodeLocks {
        &self.locks
    }

    fn exclusive<T>(
        &self,
        layout: &FileLayout,
        f: impl FnOnce(&Lease<'_>) -> Result<T>,
    ) -> Result<T> {
        if self.locking() {
            self.locks.with_exclusive(self.store.as_ref(), layout, f)
        } else {
            f(&Lease::unlocked())
        }
    }

    /// Quota of the file's data pool, 0 when unlimited or unregistered
    fn quota(&self, pool: &str) -> Result<u64> {
        match self.registry.data_pool_quota(pool) {
            Ok(quota) => Ok(quota),
            Err(Error::PoolNotFound(_)) => Ok(0),
            Err(e) => Err(e),
        }
    }

    /// Resize a stripe to `new_len` through `f`, within the pool quota
    ///
    /// Fails with `NoSpace` without running `f` if the growth would exceed
    /// the quota.
    fn grow<T>(
        &self,
        layout: &FileLayout,
        object: &str,
        new_len: u64,
        f: impl FnOnce() -> Result<T>,
    ) -> Result<T> {
        let quota = self.quota(&layout.pool)?;
        if quota == 0 {
            return f();
        }
        let gate = Arc::clone(&self.growth.entry(layout.pool.clone()).or_default());
        let _guard = gate.lock();
        self.check_quota(layout, object, new_len, quota)?;
        f()
    }

    fn check_quota(
        &self,
        layout: &FileLayout,
        object: &str,
        new_len: u64,
        quota: u64,
    ) -> Result<()> {
        let current = match self.store.stat(&layout.pool, object) {
            Ok(stat) => stat.size,
            Err(Error::ObjectNotFound { .. }) => 0,
            Err(e) => return Err(e),
        };
        let growth = new_len.saturating_sub(current);
        if growth == 0 {
            return Ok(());
        }
        let used = self.store.pool_usage(&layout.pool)?.used_bytes;
        if used.saturating_add(growth) > quota {
            return Err(Error::NoSpace {
                pool: layout.pool.clone(),
                used,
                quota,
            });
        }
        Ok(())
    }

    /// Write `data` at `offset`, returning the number of bytes written
    ///
    /// If a stripe after the first fails, the error is
    /// [`Error::WriteFailed`] carrying that stripe's file offset and the
    /// bytes written before it.
    pub fn write(&self, layout: &FileLayout, offset: u64, data: &[u8]) -> Result<u64> {
        if data.is_empty() {
            return Ok(0);
        }
        let mapper = StripeMapper::new(layout.stripe_size)?;
        let ranges = mapper.byte_range_to_stripes(offset, data.len() as u64)?;

        self.exclusive(layout, |lease| {
            let mut written = 0u64;
            for range in &ranges {
                let start = (range.file_offset - offset) as usize;
                let chunk = &data[start..start + range.length as usize];
                let result = lease
                    .keep_alive()
                    .and_then(|()| self.write_stripe(layout, range, chunk));
                if let Err(e) = result {
                    if written == 0 {
                        return Err(e);
                    }
                    warn!(
                        "Write to inode {} failed at offset {} after {} bytes: {}",
                        layout.inode, range.file_offset, written, e
                    );
                    return Err(Error::WriteFailed {
                        offset: range.file_offset,
                        written,
                        source: Box::new(e),
                    });
                }
                written += range.length;
            }
            debug!(
                "Wrote {} bytes at {} to inode {} ({} stripes)",
                written,
                offset,
                layout.inode,
                ranges.len()
            );
            Ok(written)
        })
    }

    fn write_stripe(&self, layout: &FileLayout, range: &StripeRange, chunk: &[u8]) -> Result<()> {
        let object = StripeMapper::stripe_object(layout.inode, range.index);
        self.grow(layout, &object, range.offset_in_stripe + range.length, || {
            self.store
                .write(&layout.pool, &object, range.offset_in_stripe, chunk)
        })
    }

    /// Read up to `len` bytes at `offset`; holes read as zeros
    ///
    /// After clamping to the file size, more than [`MAX_READ_LEN`] bytes
    /// fails with [`Error::InvalidArgument`].
    pub fn read(&self, layout: &FileLayout, offset: u64, len: u64) -> Result<Bytes> {
        let size = self.size(layout)?;
        if offset >= size || len == 0 {
            return Ok(Bytes::new());
        }
        let len = len.min(size - offset);
        if len > MAX_READ_LEN {
            return Err(Error::invalid_argument(format!(
                "read of {len} bytes exceeds the {MAX_READ_LEN} byte limit"
            )));
        }
        let mapper = StripeMapper::new(layout.stripe_size)?;

        let mut buf = BytesMut::zeroed(len as usize);
        for range in mapper.byte_range_to_stripes(offset, len)? {
            let object = StripeMapper::stripe_object(layout.inode, range.index);
            match self
                .store
                .read(&layout.pool, &object, range.offset_in_stripe, range.length)
            {
                Ok(bytes) => {
                    let start = (range.file_offset - offset) as usize;
                    buf[start..start + bytes.len()].copy_from_slice(&bytes);
                }
                Err(Error::ObjectNotFound { .. }) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(buf.freeze())
    }

    /// Indices of the stripes materialized for a file, ascending
    fn stripes(&self, layout: &FileLayout) -> Result<Vec<u64>> {
        let prefix = StripeMapper::object_prefix(layout.inode);
        let mut indices: Vec<u64> = self
            .store
            .list_objects(&layout.pool, &prefix)?
            .iter()
            .filter_map(|object| StripeMapper::parse_stripe_index(layout.inode, object))
            .collect();
        indices.sort_unstable();
        Ok(indices)
    }

    /// Logical size: start of the highest stripe plus its length
    pub fn size(&self, layout: &FileLayout) -> Result<u64> {
        let mapper = StripeMapper::new(layout.stripe_size)?;
        let Some(&last) = self.stripes(layout)?.last() else {
            return Ok(0);
        };
        let object = StripeMapper::stripe_object(layout.inode, last);
        match self.store.stat(&layout.pool, &object) {
            Ok(stat) => Ok(mapper.stripe_start(last) + stat.size),
            // Removed by a concurrent truncate; size is whatever remains
            Err(Error::ObjectNotFound { .. }) => self.size(layout),
            Err(e) => Err(e),
        }
    }

    /// Shrink or extend a file to `size` bytes
    pub fn truncate(&self, layout: &FileLayout, size: u64) -> Result<()> {
        let mapper = StripeMapper::new(layout.stripe_size)?;
        self.exclusive(layout, |lease| {
            let keep = size.checked_sub(1).map(|last| mapper.stripe_of(last));
            for index in self.stripes(layout)? {
                if keep.is_none_or(|keep| index > keep) {
                    lease.keep_alive()?;
                    self.remove_stripe(layout, index)?;
                }
            }
            if let Some(last) = keep {
                let object = StripeMapper::stripe_object(layout.inode, last);
                let len = size - mapper.stripe_start(last);
                lease.keep_alive()?;
                self.grow(layout, &object, len, || {
                    self.store.truncate(&layout.pool, &object, len)
                })?;
            }
            debug!("Truncated inode {} to {} bytes", layout.inode, size);
            Ok(())
        })
    }

    fn remove_stripe(&self, layout: &FileLayout, index: u64) -> Result<()> {
        let object = StripeMapper::stripe_object(layout.inode, index);
        match self.store.remove(&layout.pool, &object) {
            Ok(()) | Err(Error::ObjectNotFound { .. }) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Remove every stripe of a file
    pub fn remove_data(&self, layout: &FileLayout) -> Result<()> {
        for index in self.stripes(layout)? {
            self.remove_stripe(layout, index)?;
        }
        Ok(())
    }
}

/// An open file
///
/// Bundles the resolved entry with the file layer. The layout is fixed at
/// open time, so the handle keeps addressing the same inode even if the
/// path is later removed.
#[derive(Clone)]
pub struct File {
    entry: Arc<EntryMetadata>,
    layout: FileLayout,
    io: Arc<FileIo>,
}

impl File {
    pub(crate) fn new(entry: Arc<EntryMetadata>, io: Arc<FileIo>) -> Result<Self> {
        let layout = entry
            .layout()
            .ok_or_else(|| Error::IsADirectory(entry.path.to_string()))?;
        Ok(Self { entry, layout, io })
    }

    pub fn path(&self) -> &FsPath {
        &self.entry.path
    }

    pub fn metadata(&self) -> &EntryMetadata {
        &self.entry
    }

    pub fn layout(&self) -> &FileLayout {
        &self.layout
    }

    pub fn write(&self, offset: u64, data: &[u8]) -> Result<u64> {
        self.io.write(&self.layout, offset, data)
    }

    pub fn read(&self, offset: u64, len: u64) -> Result<Bytes> {
        self.io.read(&self.layout, offset, len)
    }

    pub fn size(&self) -> Result<u64> {
        self.io.size(&self.layout)
    }

    pub fn truncate(&self, size: u64) -> Result<()> {
        self.io.truncate(&self.layout, size)
    }
}

impl std::fmt::Debug for File {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("File")
            .field("path", &self.entry.path)
            .field("inode", &self.layout.inode)
            .field("pool", &self.layout.pool)
            .finish()
    }
}

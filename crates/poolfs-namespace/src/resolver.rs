//! Path to inode resolution
//!
//! Lookups go to the directory entry cache first. On a miss the governing
//! metadata pool is picked from the registry (failing without a store round
//! trip if none matches), the entry object's reserved attributes are read,
//! and the result is cached unless the path was invalidated meanwhile.

use crate::dircache::DirCache;
use crate::entry::{EntryMetadata, InodeRef};
use crate::registry::PoolRegistry;
use poolfs_common::{Error, FsPath, Result};
use poolfs_store::{ObjectStore, PoolUsage};
use std::sync::Arc;
use tracing::{debug, warn};

/// Upper bound on threads used by one batched call
pub const MAX_BATCH_WORKERS: usize = 8;

/// Apply `f` to every item on up to [`MAX_BATCH_WORKERS`] scoped threads
///
/// Output order matches input order and every item gets its own result.
pub(crate) fn fan_out<T, R, F>(items: &[T], f: F) -> Vec<Result<R>>
where
    T: Sync,
    R: Send,
    F: Fn(&T) -> Result<R> + Sync,
{
    if items.len() <= 1 {
        return items.iter().map(&f).collect();
    }
    let workers = items.len().min(MAX_BATCH_WORKERS);
    let chunk_size = items.len().div_ceil(workers);

    std::thread::scope(|s| {
        let handles: Vec<_> = items
            .chunks(chunk_size)
            .map(|chunk| {
                let f = &f;
                (chunk.len(), s.spawn(move || chunk.iter().map(f).collect::<Vec<_>>()))
            })
            .collect();

        handles
            .into_iter()
            .flat_map(|(len, handle)| {
                handle.join().unwrap_or_else(|_| {
                    (0..len)
                        .map(|_| Err(Error::internal("batch worker panicked")))
                        .collect()
                })
            })
            .collect()
    })
}

/// Usage of one pool, or why it could not be read
#[derive(Debug)]
pub struct PoolStat {
    pub pool: String,
    pub usage: Result<PoolUsage>,
}

/// Capacity counters across all registered pools
#[derive(Debug)]
pub struct ClusterStat {
    /// Sum over the pools that answered
    pub totals: PoolUsage,
    pub pools: Vec<PoolStat>,
}

impl ClusterStat {
    /// Pools whose counters could not be read
    pub fn failed(&self) -> impl Iterator<Item = &PoolStat> {
        self.pools.iter().filter(|stat| stat.usage.is_err())
    }

    pub fn is_complete(&self) -> bool {
        self.failed().next().is_none()
    }

    /// Totals if every pool answered, otherwise an aggregate I/O error
    pub fn check(&self) -> Result<PoolUsage> {
        let failures: Vec<String> = self
            .failed()
            .filter_map(|stat| {
                stat.usage
                    .as_ref()
                    .err()
                    .map(|e| format!("{}: {}", stat.pool, e))
            })
            .collect();
        if failures.is_empty() {
            Ok(self.totals)
        } else {
            Err(Error::io(format!("cluster stat incomplete ({})", failures.join("; "))))
        }
    }
}

/// Resolves paths to their entries
pub struct Resolver {
    store: Arc<dyn ObjectStore>,
    registry: Arc<PoolRegistry>,
    cache: Arc<DirCache>,
}

impl Resolver {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        registry: Arc<PoolRegistry>,
        cache: Arc<DirCache>,
    ) -> Self {
        Self {
            store,
            registry,
            cache,
        }
    }

    /// Full entry for a path
    pub fn lookup(&self, path: &FsPath) -> Result<Arc<EntryMetadata>> {
        if let Some(entry) = self.cache.get(path.as_str()) {
            return Ok(entry);
        }
        self.lookup_uncached(path)
    }

    fn lookup_uncached(&self, path: &FsPath) -> Result<Arc<EntryMetadata>> {
        // Taken before reading the store so a concurrent invalidation wins
        let epoch = self.cache.epoch();
        let entry = Arc::new(self.fetch(path)?);
        if !self
            .cache
            .put_if_unchanged(path.as_str(), Arc::clone(&entry), epoch)
        {
            debug!("Not caching {}: invalidated during lookup", path);
        }
        Ok(entry)
    }

    /// Read an entry from its metadata pool, bypassing the cache
    pub fn fetch(&self, path: &FsPath) -> Result<EntryMetadata> {
        let pool = self.registry.resolve_metadata_pool(path)?;
        let attrs = match self.store.list_xattrs(&pool.name, path.as_str()) {
            Ok(attrs) => attrs,
            Err(Error::ObjectNotFound { .. }) => {
                return Err(Error::PathNotFound(path.to_string()));
            }
            Err(e) => return Err(e),
        };
        debug!("Resolved {} from metadata pool {}", path, pool.name);
        EntryMetadata::from_attrs(path, &pool.name, &attrs)?
            .ok_or_else(|| Error::PathNotFound(path.to_string()))
    }

    /// Pool and inode backing a path
    pub fn resolve(&self, path: &FsPath) -> Result<InodeRef> {
        self.lookup(path).map(|entry| entry.inode.clone())
    }

    /// Look up many paths; cache misses are fetched in parallel
    pub fn lookup_many(&self, paths: &[FsPath]) -> Vec<(FsPath, Result<Arc<EntryMetadata>>)> {
        let mut results: Vec<Option<Result<Arc<EntryMetadata>>>> = paths
            .iter()
            .map(|path| self.cache.get(path.as_str()).map(Ok))
            .collect();

        let misses: Vec<(usize, &FsPath)> = paths
            .iter()
            .enumerate()
            .filter(|(i, _)| results[*i].is_none())
            .collect();
        let fetched = fan_out(&misses, |(_, path)| self.lookup_uncached(path));
        for ((i, _), result) in misses.iter().zip(fetched) {
            results[*i] = Some(result);
        }

        paths
            .iter()
            .cloned()
            .zip(results)
            .map(|(path, result)| {
                let result = result
                    .unwrap_or_else(|| Err(Error::internal(format!("{path} was not resolved"))));
                (path, result)
            })
            .collect()
    }

    /// Resolve many paths, in input order, each with its own status
    pub fn resolve_many(&self, paths: &[FsPath]) -> Vec<(FsPath, Result<InodeRef>)> {
        self.lookup_many(paths)
            .into_iter()
            .map(|(path, result)| (path, result.map(|entry| entry.inode.clone())))
            .collect()
    }

    /// Capacity counters of every registered pool
    pub fn stat_cluster(&self) -> ClusterStat {
        let names = self.registry.pool_names();
        let usages = fan_out(&names, |name| self.store.pool_usage(name));

        let mut totals = PoolUsage::default();
        let pools: Vec<PoolStat> = names
            .into_iter()
            .zip(usages)
            .map(|(pool, usage)| {
                match &usage {
                    Ok(usage) => totals.accumulate(usage),
                    Err(e) => warn!("Failed to read usage of pool {}: {}", pool, e),
                }
                PoolStat { pool, usage }
            })
            .collect();
        ClusterStat { totals, pools }
    }
}

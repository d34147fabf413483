//! The filesystem context
//!
//! [`Filesystem`] owns the pool registry, the directory entry cache, the
//! resolver, the attribute store and the file layer. It is cheap to clone
//! and is shared by every thread that operates on the namespace.

use crate::dircache::{CacheDebugInfo, CacheStats, DirCache};
use crate::entry::{EntryMetadata, FsInfo, InodeRef, Stat};
use crate::file::FileIo;
use crate::registry::{PoolRegistry, PrefixTable};
use crate::resolver::{ClusterStat, Resolver, fan_out};
use crate::xattr::AttributeStore;
use parking_lot::RwLock;
use poolfs_common::{
    Config, EntryKind, Error, FsPath, Identity, LogLevel, NamespaceConfig, PoolKind, Result,
};
use poolfs_store::ObjectStore;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::info;

#[derive(Debug)]
struct Settings {
    stripe_size: u64,
    log_level: LogLevel,
}

pub(crate) struct Inner {
    pub(crate) store: Arc<dyn ObjectStore>,
    pub(crate) registry: Arc<PoolRegistry>,
    pub(crate) cache: Arc<DirCache>,
    pub(crate) resolver: Arc<Resolver>,
    attrs: AttributeStore,
    pub(crate) files: Arc<FileIo>,
    settings: RwLock<Settings>,
    identity: RwLock<Identity>,
}

/// Shared handle to one namespace
#[derive(Clone)]
pub struct Filesystem {
    pub(crate) inner: Arc<Inner>,
}

impl Filesystem {
    /// Create a namespace over `store` with no pools registered
    pub fn new(store: Arc<dyn ObjectStore>, config: &NamespaceConfig) -> Result<Self> {
        config.validate()?;
        let registry = Arc::new(PoolRegistry::new(Arc::clone(&store)));
        let cache = Arc::new(DirCache::new(
            config.dir_cache_max_size,
            config.dir_compact_ratio,
        )?);
        let resolver = Arc::new(Resolver::new(
            Arc::clone(&store),
            Arc::clone(&registry),
            Arc::clone(&cache),
        ));
        let attrs = AttributeStore::new(
            Arc::clone(&store),
            Arc::clone(&resolver),
            Arc::clone(&cache),
        );
        let files = Arc::new(FileIo::new(
            Arc::clone(&store),
            Arc::clone(&registry),
            config.file_locking,
            config.lock_lease(),
        ));

        Ok(Self {
            inner: Arc::new(Inner {
                store,
                registry,
                cache,
                resolver,
                attrs,
                files,
                settings: RwLock::new(Settings {
                    stripe_size: config.file_stripe_size,
                    log_level: config.log_level,
                }),
                identity: RwLock::new(Identity::default()),
            }),
        })
    }

    /// Create a namespace and register the configured identity and pools
    pub fn from_config(store: Arc<dyn ObjectStore>, config: &Config) -> Result<Self> {
        config.validate()?;
        let fs = Self::new(store, &config.namespace)?;
        fs.set_ids(config.identity.uid, config.identity.gid);
        for pool in &config.pools {
            match pool.kind {
                PoolKind::Data => fs.add_data_pool(&pool.name, &pool.prefix, pool.quota)?,
                PoolKind::Metadata => fs.add_metadata_pool(&pool.name, &pool.prefix)?,
            }
        }
        Ok(fs)
    }

    // ---- Pools ----

    /// Register a data pool; `quota` of 0 means unlimited
    pub fn add_data_pool(&self, name: &str, prefix: &str, quota: u64) -> Result<()> {
        self.inner.registry.add_data_pool(name, prefix, quota)?;
        self.inner.cache.clear();
        Ok(())
    }

    /// Register a metadata pool and materialize its prefix directory
    pub fn add_metadata_pool(&self, name: &str, prefix: &str) -> Result<()> {
        self.inner.registry.add_metadata_pool(name, prefix)?;
        self.inner.cache.clear();

        let prefix_dir = FsPath::new(prefix)?.to_dir();
        let materialized = self
            .ensure_dir(&FsPath::root())
            .and_then(|()| self.ensure_dir(&prefix_dir));
        if let Err(e) = materialized {
            // Leave the registry as it was
            self.inner.registry.force_remove_metadata_pool(name)?;
            self.inner.cache.clear();
            return Err(e);
        }
        Ok(())
    }

    pub fn remove_data_pool(&self, name: &str) -> Result<()> {
        self.inner.registry.remove_data_pool(name)?;
        self.inner.cache.clear();
        Ok(())
    }

    pub fn force_remove_data_pool(&self, name: &str) -> Result<()> {
        self.inner.registry.force_remove_data_pool(name)?;
        self.inner.cache.clear();
        Ok(())
    }

    pub fn remove_metadata_pool(&self, name: &str) -> Result<()> {
        self.inner.registry.remove_metadata_pool(name)?;
        self.inner.cache.clear();
        Ok(())
    }

    pub fn force_remove_metadata_pool(&self, name: &str) -> Result<()> {
        self.inner.registry.force_remove_metadata_pool(name)?;
        self.inner.cache.clear();
        Ok(())
    }

    /// Data pools registered at or below `prefix`
    pub fn data_pools(&self, prefix: &str) -> Result<Vec<String>> {
        self.inner.registry.data_pools(prefix)
    }

    pub fn data_pool_prefix(&self, name: &str) -> Result<FsPath> {
        self.inner.registry.data_pool_prefix(name)
    }

    /// Quota of a data pool in bytes
    pub fn data_pool_size(&self, name: &str) -> Result<u64> {
        self.inner.registry.data_pool_quota(name)
    }

    pub fn metadata_pools(&self) -> Vec<String> {
        self.inner.registry.metadata_pools()
    }

    pub fn metadata_pool_prefix(&self, name: &str) -> Result<FsPath> {
        self.inner.registry.metadata_pool_prefix(name)
    }

    pub fn metadata_pool_from_prefix(&self, prefix: &str) -> Result<String> {
        self.inner.registry.metadata_pool_from_prefix(prefix)
    }

    /// Every pool in the cluster, registered or not
    pub fn all_pools_in_cluster(&self) -> Result<Vec<String>> {
        self.inner.store.list_pools()
    }

    /// Name of the pool of `kind` governing `path`
    pub fn pool_for_path(&self, path: &str, kind: PoolKind) -> Result<String> {
        self.inner
            .registry
            .resolve_pool_for_path(&FsPath::new(path)?, kind)
    }

    /// Capacity counters of every registered pool
    pub fn stat_cluster(&self) -> ClusterStat {
        self.inner.resolver.stat_cluster()
    }

    // ---- Identity ----

    pub fn set_ids(&self, uid: u32, gid: u32) {
        *self.inner.identity.write() = Identity::new(uid, gid);
    }

    pub fn ids(&self) -> Identity {
        *self.inner.identity.read()
    }

    pub fn uid(&self) -> u32 {
        self.ids().uid
    }

    pub fn gid(&self) -> u32 {
        self.ids().gid
    }

    // ---- Settings ----

    pub fn set_dir_cache_max_size(&self, bytes: usize) -> Result<()> {
        self.inner.cache.set_max_size(bytes)
    }

    pub fn dir_cache_max_size(&self) -> usize {
        self.inner.cache.max_size()
    }

    pub fn set_dir_compact_ratio(&self, ratio: f32) -> Result<()> {
        self.inner.cache.set_compact_ratio(ratio)
    }

    pub fn dir_compact_ratio(&self) -> f32 {
        self.inner.cache.compact_ratio()
    }

    /// Stripe size for files created from now on
    pub fn set_file_stripe_size(&self, bytes: u64) -> Result<()> {
        if bytes == 0 {
            return Err(Error::invalid_argument("file_stripe_size must be positive"));
        }
        self.inner.settings.write().stripe_size = bytes;
        Ok(())
    }

    pub fn file_stripe_size(&self) -> u64 {
        self.inner.settings.read().stripe_size
    }

    pub fn set_file_locking(&self, enabled: bool) {
        self.inner.files.set_locking(enabled);
    }

    pub fn file_locking(&self) -> bool {
        self.inner.files.locking()
    }

    pub fn set_log_level(&self, level: LogLevel) {
        self.inner.settings.write().log_level = level;
        info!("Log level set to {:?}", level);
    }

    pub fn log_level(&self) -> LogLevel {
        self.inner.settings.read().log_level
    }

    // ---- Lookups ----

    fn lookup(&self, path: &str) -> Result<Arc<EntryMetadata>> {
        self.inner.resolver.lookup(&FsPath::new(path)?)
    }

    /// Resolved entry, tagged as file or directory
    pub fn fs_info(&self, path: &str) -> Result<FsInfo> {
        self.lookup(path).map(FsInfo::from_entry)
    }

    /// Pool and inode backing a path
    pub fn inode_and_pool(&self, path: &str) -> Result<InodeRef> {
        self.lookup(path).map(|entry| entry.inode.clone())
    }

    /// Resolve many paths in one call; order is preserved
    pub fn inodes_and_pools(&self, paths: &[&str]) -> Vec<Result<InodeRef>> {
        self.batch(paths, |paths| self.inner.resolver.resolve_many(paths))
    }

    /// Parse paths, run `f` over the valid ones and merge results back in order
    fn batch<T>(
        &self,
        paths: &[&str],
        f: impl FnOnce(&[FsPath]) -> Vec<(FsPath, Result<T>)>,
    ) -> Vec<Result<T>> {
        let parsed: Vec<Result<FsPath>> = paths
            .iter()
            .map(|p| FsPath::new(p).map_err(Error::from))
            .collect();
        let valid: Vec<FsPath> = parsed.iter().filter_map(|p| p.as_ref().ok().cloned()).collect();
        let mut resolved = f(&valid).into_iter().map(|(_, result)| result);

        parsed
            .into_iter()
            .map(|p| match p {
                Ok(_) => resolved
                    .next()
                    .unwrap_or_else(|| Err(Error::internal("batch result missing"))),
                Err(e) => Err(e),
            })
            .collect()
    }

    pub fn stat(&self, path: &str) -> Result<Stat> {
        let entry = self.lookup(path)?;
        let size = match entry.layout() {
            Some(layout) => self.inner.files.size(&layout)?,
            None => self
                .inner
                .store
                .omap_list(&entry.metadata_pool, entry.path.as_str())?
                .len() as u64,
        };
        Ok(Stat {
            path: entry.path.clone(),
            kind: entry.kind,
            inode: entry.inode.clone(),
            size,
            mode: entry.mode,
            uid: entry.uid,
            gid: entry.gid,
            ctime: entry.ctime,
        })
    }

    /// Stat many paths in parallel; one result per input, in input order
    ///
    /// Use [`Error::errno`] on a failed entry for its status code.
    pub fn stat_many(&self, paths: &[&str]) -> Vec<Result<Stat>> {
        fan_out(paths, |path| self.stat(path))
    }

    // ---- Attributes ----

    pub fn set_xattr(&self, path: &str, name: &str, value: &str) -> Result<()> {
        self.inner.attrs.set_xattr(&FsPath::new(path)?, name, value)
    }

    pub fn get_xattr(&self, path: &str, name: &str, max_len: usize) -> Result<String> {
        self.inner.attrs.get_xattr(&FsPath::new(path)?, name, max_len)
    }

    pub fn remove_xattr(&self, path: &str, name: &str) -> Result<()> {
        self.inner.attrs.remove_xattr(&FsPath::new(path)?, name)
    }

    pub fn xattrs(&self, path: &str) -> Result<BTreeMap<String, String>> {
        self.inner.attrs.xattrs(&FsPath::new(path)?)
    }

    /// Introspection of internal state, for checkers and tests
    pub fn internals(&self) -> Internals<'_> {
        Internals { fs: self }
    }

    // ---- Entry construction, shared with the namespace operations ----

    /// Build a new entry for `path` owned by the current identity
    pub(crate) fn new_entry(
        &self,
        path: &FsPath,
        kind: EntryKind,
        metadata_pool: &str,
    ) -> Result<EntryMetadata> {
        let identity = self.ids();
        let (inode, mode, stripe_size) = match kind {
            EntryKind::File => {
                let data_pool = self.inner.registry.resolve_data_pool(path)?;
                (
                    InodeRef::new(data_pool.name, poolfs_common::InodeId::new()),
                    crate::entry::FILE_MODE,
                    Some(self.file_stripe_size()),
                )
            }
            EntryKind::Directory => (
                InodeRef::new(metadata_pool.to_string(), poolfs_common::InodeId::new()),
                crate::entry::DIR_MODE,
                None,
            ),
        };
        Ok(EntryMetadata {
            path: path.clone(),
            kind,
            metadata_pool: metadata_pool.to_string(),
            inode,
            uid: identity.uid,
            gid: identity.gid,
            mode,
            ctime: unix_now(),
            stripe_size,
        })
    }
}

fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map_or(0, |d| d.as_secs())
}

impl std::fmt::Debug for Filesystem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Filesystem")
            .field("identity", &self.ids())
            .field("settings", &*self.inner.settings.read())
            .field("locking", &self.file_locking())
            .finish_non_exhaustive()
    }
}

/// Read-only view of a filesystem's internals
pub struct Internals<'a> {
    fs: &'a Filesystem,
}

impl Internals<'_> {
    pub fn cache_info(&self) -> CacheDebugInfo {
        self.fs.inner.cache.debug_info()
    }

    pub fn cache_stats(&self) -> &CacheStats {
        self.fs.inner.cache.stats()
    }

    /// Copy of the data and metadata prefix tables
    pub fn prefix_table(&self) -> PrefixTable {
        self.fs.inner.registry.snapshot()
    }

    /// Inodes with a writer holding or waiting for the lock
    pub fn active_locks(&self) -> usize {
        self.fs.inner.files.locks().active()
    }

    /// Identifies this process to store locks
    pub fn lock_cookie(&self) -> &str {
        self.fs.inner.files.locks().cookie()
    }
}

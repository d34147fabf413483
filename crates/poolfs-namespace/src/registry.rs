//! Pool registry
//!
//! Holds the prefix tables of data and metadata pools and answers which
//! pool governs a path. Prefixes are stored in directory form, so a pool
//! registered for `/a` governs `/a/x` but never `/ab/x`; among matching
//! pools of one kind the longest prefix wins.

use parking_lot::RwLock;
use poolfs_common::{Error, FsPath, PoolKind, Result};
use poolfs_store::ObjectStore;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::info;

/// A pool holding file content stripes
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DataPool {
    pub name: String,
    pub prefix: FsPath,
    /// Size quota in bytes, 0 for unlimited
    pub quota: u64,
}

/// A pool holding directory entries and per-path attributes
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MetadataPool {
    pub name: String,
    pub prefix: FsPath,
}

trait Prefixed {
    fn name(&self) -> &str;
}

impl Prefixed for DataPool {
    fn name(&self) -> &str {
        &self.name
    }
}

impl Prefixed for MetadataPool {
    fn name(&self) -> &str {
        &self.name
    }
}

/// Registered pools keyed by prefix
#[derive(Clone, Debug, Default)]
pub struct PrefixTable {
    /// Version number (incremented on changes)
    pub version: u64,
    pub data: BTreeMap<String, DataPool>,
    pub metadata: BTreeMap<String, MetadataPool>,
}

impl PrefixTable {
    fn longest_match<'a, P>(pools: &'a BTreeMap<String, P>, path: &FsPath) -> Option<&'a P> {
        pools
            .iter()
            .filter(|(prefix, _)| path.as_str().starts_with(prefix.as_str()))
            .max_by_key(|(prefix, _)| prefix.len())
            .map(|(_, pool)| pool)
    }

    fn find_by_name<'a, P: Prefixed>(pools: &'a BTreeMap<String, P>, name: &str) -> Option<&'a P> {
        pools.values().find(|pool| pool.name() == name)
    }

    /// Data pool governing `path`
    pub fn data_pool_for(&self, path: &FsPath) -> Option<&DataPool> {
        Self::longest_match(&self.data, path)
    }

    /// Metadata pool governing `path`
    pub fn metadata_pool_for(&self, path: &FsPath) -> Option<&MetadataPool> {
        Self::longest_match(&self.metadata, path)
    }
}

/// Registry of data and metadata pools
pub struct PoolRegistry {
    store: Arc<dyn ObjectStore>,
    table: RwLock<PrefixTable>,
}

impl PoolRegistry {
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self {
            store,
            table: RwLock::new(PrefixTable::default()),
        }
    }

    /// Register a data pool for `prefix`
    pub fn add_data_pool(&self, name: &str, prefix: &str, quota: u64) -> Result<()> {
        let prefix = self.check_new_pool(name, prefix)?;
        let mut table = self.table.write();
        if table.data.contains_key(prefix.as_str()) {
            return Err(Error::DuplicatePrefix {
                kind: PoolKind::Data,
                prefix: prefix.to_string(),
            });
        }
        if PrefixTable::find_by_name(&table.data, name).is_some() {
            return Err(Error::InvalidPool(format!("{name} is already a data pool")));
        }

        table.data.insert(
            prefix.to_string(),
            DataPool {
                name: name.to_string(),
                prefix: prefix.clone(),
                quota,
            },
        );
        table.version += 1;
        info!("Added data pool {} for prefix {} (quota {})", name, prefix, quota);
        Ok(())
    }

    /// Register a metadata pool for `prefix`
    pub fn add_metadata_pool(&self, name: &str, prefix: &str) -> Result<()> {
        let prefix = self.check_new_pool(name, prefix)?;
        let mut table = self.table.write();
        if table.metadata.contains_key(prefix.as_str()) {
            return Err(Error::DuplicatePrefix {
                kind: PoolKind::Metadata,
                prefix: prefix.to_string(),
            });
        }
        if PrefixTable::find_by_name(&table.metadata, name).is_some() {
            return Err(Error::InvalidPool(format!("{name} is already a metadata pool")));
        }

        table.metadata.insert(
            prefix.to_string(),
            MetadataPool {
                name: name.to_string(),
                prefix: prefix.clone(),
            },
        );
        table.version += 1;
        info!("Added metadata pool {} for prefix {}", name, prefix);
        Ok(())
    }

    fn check_new_pool(&self, name: &str, prefix: &str) -> Result<FsPath> {
        if name.is_empty() {
            return Err(Error::InvalidPool("pool name cannot be empty".into()));
        }
        let prefix = FsPath::new(prefix)?.to_dir();
        if !self.store.list_pools()?.iter().any(|pool| pool == name) {
            return Err(Error::InvalidPool(format!("{name} does not exist in the cluster")));
        }
        Ok(prefix)
    }

    /// Unregister a data pool; fails while it still holds objects
    pub fn remove_data_pool(&self, name: &str) -> Result<()> {
        self.remove_data_pool_inner(name, false)
    }

    /// Unregister a data pool without checking whether it is in use
    pub fn force_remove_data_pool(&self, name: &str) -> Result<()> {
        self.remove_data_pool_inner(name, true)
    }

    fn remove_data_pool_inner(&self, name: &str, force: bool) -> Result<()> {
        let mut table = self.table.write();
        let prefix = PrefixTable::find_by_name(&table.data, name)
            .map(|pool| pool.prefix.to_string())
            .ok_or_else(|| Error::PoolNotFound(name.to_string()))?;

        if !force && !self.store.list_objects(name, "")?.is_empty() {
            return Err(Error::PoolInUse(name.to_string()));
        }

        table.data.remove(&prefix);
        table.version += 1;
        info!("Removed data pool {} (prefix {}, force={})", name, prefix, force);
        Ok(())
    }

    /// Unregister a metadata pool; fails while any directory in it has children
    pub fn remove_metadata_pool(&self, name: &str) -> Result<()> {
        self.remove_metadata_pool_inner(name, false)
    }

    /// Unregister a metadata pool without checking whether it is in use
    pub fn force_remove_metadata_pool(&self, name: &str) -> Result<()> {
        self.remove_metadata_pool_inner(name, true)
    }

    fn remove_metadata_pool_inner(&self, name: &str, force: bool) -> Result<()> {
        let mut table = self.table.write();
        let prefix = PrefixTable::find_by_name(&table.metadata, name)
            .map(|pool| pool.prefix.to_string())
            .ok_or_else(|| Error::PoolNotFound(name.to_string()))?;

        if !force && self.metadata_pool_in_use(name)? {
            return Err(Error::PoolInUse(name.to_string()));
        }

        table.metadata.remove(&prefix);
        table.version += 1;
        info!("Removed metadata pool {} (prefix {}, force={})", name, prefix, force);
        Ok(())
    }

    fn metadata_pool_in_use(&self, name: &str) -> Result<bool> {
        for object in self.store.list_objects(name, "/")? {
            if object.ends_with('/') && !self.store.omap_list(name, &object)?.is_empty() {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Name of the pool of `kind` governing `path`
    pub fn resolve_pool_for_path(&self, path: &FsPath, kind: PoolKind) -> Result<String> {
        match kind {
            PoolKind::Data => self.resolve_data_pool(path).map(|pool| pool.name),
            PoolKind::Metadata => self.resolve_metadata_pool(path).map(|pool| pool.name),
        }
    }

    pub fn resolve_data_pool(&self, path: &FsPath) -> Result<DataPool> {
        self.table
            .read()
            .data_pool_for(path)
            .cloned()
            .ok_or_else(|| Error::NoMatchingPool {
                kind: PoolKind::Data,
                path: path.to_string(),
            })
    }

    pub fn resolve_metadata_pool(&self, path: &FsPath) -> Result<MetadataPool> {
        self.table
            .read()
            .metadata_pool_for(path)
            .cloned()
            .ok_or_else(|| Error::NoMatchingPool {
                kind: PoolKind::Metadata,
                path: path.to_string(),
            })
    }

    /// Names of data pools registered at or below `prefix`
    pub fn data_pools(&self, prefix: &str) -> Result<Vec<String>> {
        let prefix = FsPath::new(prefix)?.to_dir();
        Ok(self
            .table
            .read()
            .data
            .iter()
            .filter(|(p, _)| p.starts_with(prefix.as_str()))
            .map(|(_, pool)| pool.name.clone())
            .collect())
    }

    pub fn data_pool_prefix(&self, name: &str) -> Result<FsPath> {
        PrefixTable::find_by_name(&self.table.read().data, name)
            .map(|pool| pool.prefix.clone())
            .ok_or_else(|| Error::PoolNotFound(name.to_string()))
    }

    pub fn data_pool_quota(&self, name: &str) -> Result<u64> {
        PrefixTable::find_by_name(&self.table.read().data, name)
            .map(|pool| pool.quota)
            .ok_or_else(|| Error::PoolNotFound(name.to_string()))
    }

    /// Names of all metadata pools, ordered by prefix
    pub fn metadata_pools(&self) -> Vec<String> {
        self.table
            .read()
            .metadata
            .values()
            .map(|pool| pool.name.clone())
            .collect()
    }

    pub fn metadata_pool_prefix(&self, name: &str) -> Result<FsPath> {
        PrefixTable::find_by_name(&self.table.read().metadata, name)
            .map(|pool| pool.prefix.clone())
            .ok_or_else(|| Error::PoolNotFound(name.to_string()))
    }

    /// Name of the metadata pool registered exactly at `prefix`
    pub fn metadata_pool_from_prefix(&self, prefix: &str) -> Result<String> {
        let prefix = FsPath::new(prefix)?.to_dir();
        self.table
            .read()
            .metadata
            .get(prefix.as_str())
            .map(|pool| pool.name.clone())
            .ok_or_else(|| Error::PoolNotFound(prefix.to_string()))
    }

    /// Names of every registered pool of either kind
    pub fn pool_names(&self) -> Vec<String> {
        let table = self.table.read();
        let mut names: Vec<String> = table
            .data
            .values()
            .map(|pool| pool.name.clone())
            .chain(table.metadata.values().map(|pool| pool.name.clone()))
            .collect();
        names.sort();
        names.dedup();
        names
    }

    /// Copy of the current prefix tables
    pub fn snapshot(&self) -> PrefixTable {
        self.table.read().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use poolfs_store::MemoryStore;

    fn registry() -> (Arc<MemoryStore>, PoolRegistry) {
        let store = Arc::new(MemoryStore::new());
        for name in ["data", "data-a", "data-ab", "meta", "meta-a"] {
            store.create_pool(name, 1 << 30).unwrap();
        }
        let registry = PoolRegistry::new(store.clone());
        (store, registry)
    }

    fn path(p: &str) -> FsPath {
        FsPath::new(p).unwrap()
    }

    #[test]
    fn test_longest_prefix_wins() {
        let (_, registry) = registry();
        registry.add_data_pool("data", "/", 0).unwrap();
        registry.add_data_pool("data-a", "/a", 0).unwrap();
        registry.add_data_pool("data-ab", "/a/b/", 0).unwrap();

        let resolve = |p: &str| registry.resolve_pool_for_path(&path(p), PoolKind::Data).unwrap();
        assert_eq!(resolve("/x"), "data");
        assert_eq!(resolve("/a"), "data");
        assert_eq!(resolve("/a/"), "data-a");
        assert_eq!(resolve("/a/x"), "data-a");
        assert_eq!(resolve("/a/b/c/d"), "data-ab");
        // Directory-form prefixes never match a sibling sharing a name prefix
        assert_eq!(resolve("/ab/x"), "data");
    }

    #[test]
    fn test_duplicate_prefix_rejected() {
        let (_, registry) = registry();
        registry.add_data_pool("data", "/a", 0).unwrap();
        assert!(matches!(
            registry.add_data_pool("data-a", "/a/", 0),
            Err(Error::DuplicatePrefix { kind: PoolKind::Data, .. })
        ));

        // Same prefix is fine for the other kind
        registry.add_metadata_pool("meta", "/a").unwrap();
        assert!(matches!(
            registry.add_metadata_pool("meta-a", "/a"),
            Err(Error::DuplicatePrefix { kind: PoolKind::Metadata, .. })
        ));
    }

    #[test]
    fn test_invalid_pools_rejected() {
        let (_, registry) = registry();
        assert!(matches!(
            registry.add_data_pool("missing", "/", 0),
            Err(Error::InvalidPool(_))
        ));
        assert!(matches!(
            registry.add_data_pool("", "/", 0),
            Err(Error::InvalidPool(_))
        ));
        assert!(matches!(
            registry.add_metadata_pool("meta", "relative"),
            Err(Error::InvalidPath(_))
        ));
        registry.add_data_pool("data", "/", 0).unwrap();
        assert!(matches!(
            registry.add_data_pool("data", "/other", 0),
            Err(Error::InvalidPool(_))
        ));
    }

    #[test]
    fn test_no_matching_pool() {
        let (store, registry) = registry();
        registry.add_metadata_pool("meta", "/a").unwrap();
        let before = store.op_count();
        assert!(matches!(
            registry.resolve_metadata_pool(&path("/b/c")),
            Err(Error::NoMatchingPool { .. })
        ));
        assert!(matches!(
            registry.resolve_data_pool(&path("/a/c")),
            Err(Error::NoMatchingPool { kind: PoolKind::Data, .. })
        ));
        assert_eq!(store.op_count(), before);
    }

    #[test]
    fn test_remove_data_pool_in_use() {
        let (store, registry) = registry();
        registry.add_data_pool("data", "/", 0).unwrap();
        store.write("data", "stripe.0", 0, b"x").unwrap();

        assert!(matches!(
            registry.remove_data_pool("data"),
            Err(Error::PoolInUse(_))
        ));
        registry.force_remove_data_pool("data").unwrap();
        assert!(matches!(
            registry.remove_data_pool("data"),
            Err(Error::PoolNotFound(_))
        ));
    }

    #[test]
    fn test_remove_metadata_pool_in_use() {
        let (store, registry) = registry();
        registry.add_metadata_pool("meta", "/").unwrap();
        store.create("meta", "/", false).unwrap();
        registry.remove_metadata_pool("meta").unwrap();

        registry.add_metadata_pool("meta", "/").unwrap();
        let mut children = BTreeMap::new();
        children.insert("f".to_string(), bytes::Bytes::new());
        store.omap_set("meta", "/", &children).unwrap();
        assert!(matches!(
            registry.remove_metadata_pool("meta"),
            Err(Error::PoolInUse(_))
        ));
        registry.force_remove_metadata_pool("meta").unwrap();
        assert!(registry.metadata_pools().is_empty());
    }

    #[test]
    fn test_query_surface() {
        let (_, registry) = registry();
        registry.add_data_pool("data", "/", 0).unwrap();
        registry.add_data_pool("data-a", "/a", 1024).unwrap();
        registry.add_metadata_pool("meta", "/").unwrap();
        registry.add_metadata_pool("meta-a", "/a/").unwrap();

        assert_eq!(registry.data_pools("/").unwrap(), vec!["data", "data-a"]);
        assert_eq!(registry.data_pools("/a").unwrap(), vec!["data-a"]);
        assert_eq!(registry.data_pool_prefix("data-a").unwrap().as_str(), "/a/");
        assert_eq!(registry.data_pool_quota("data-a").unwrap(), 1024);
        assert!(registry.data_pool_quota("nope").is_err());
        assert_eq!(registry.metadata_pools(), vec!["meta", "meta-a"]);
        assert_eq!(registry.metadata_pool_prefix("meta-a").unwrap().as_str(), "/a/");
        assert_eq!(registry.metadata_pool_from_prefix("/a").unwrap(), "meta-a");
        assert!(registry.metadata_pool_from_prefix("/b").is_err());
        assert_eq!(
            registry.pool_names(),
            vec!["data", "data-a", "meta", "meta-a"]
        );
        assert_eq!(registry.snapshot().version, 4);
    }
}

//! Namespace mutations
//!
//! Creating an entry is three store steps: an exclusive create of the
//! metadata object, writing its reserved attributes, and linking the name
//! into the parent directory's omap. A failure after the exclusive create
//! removes the object again, so no half-created mapping is left behind.
//! Every mutation writes the store first and then invalidates the cache.

use crate::entry::EntryMetadata;
use crate::file::File;
use crate::fs::Filesystem;
use bytes::Bytes;
use poolfs_common::{EntryKind, Error, FsPath, Result};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, warn};

impl Filesystem {
    /// Create an empty file
    pub fn create(&self, path: &str) -> Result<()> {
        let path = FsPath::new(path)?;
        if path.is_dir() {
            return Err(Error::IsADirectory(path.to_string()));
        }
        let parent = self.parent_dir(&path)?;
        self.check_absent(&path.to_dir())?;
        self.check_quota_for_create(&path)?;
        self.insert_entry(&path, EntryKind::File, Some(&parent))
    }

    /// Create a directory
    pub fn mkdir(&self, path: &str) -> Result<()> {
        let path = FsPath::new(path)?.to_dir();
        if path.is_root() {
            return Err(Error::AlreadyExists(path.to_string()));
        }
        let parent = self.parent_dir(&path)?;
        self.check_absent(&file_form(&path)?)?;
        self.insert_entry(&path, EntryKind::Directory, Some(&parent))
    }

    /// Remove an empty directory
    pub fn rmdir(&self, path: &str) -> Result<()> {
        let path = FsPath::new(path)?.to_dir();
        if path.is_root() {
            return Err(Error::invalid_argument("cannot remove the root directory"));
        }
        let entry = self.dir_entry(&path)?;
        let store = &self.inner.store;
        if !store.omap_list(&entry.metadata_pool, path.as_str())?.is_empty() {
            return Err(Error::NotEmpty(path.to_string()));
        }

        store.remove(&entry.metadata_pool, path.as_str())?;
        self.unlink_from_parent(&path)?;
        debug!("Removed directory {}", path);
        Ok(())
    }

    /// Remove a file and its content
    pub fn remove(&self, path: &str) -> Result<()> {
        let path = FsPath::new(path)?;
        if path.is_dir() {
            return Err(Error::IsADirectory(path.to_string()));
        }
        let entry = self.inner.resolver.lookup(&path)?;
        let Some(layout) = entry.layout() else {
            return Err(Error::IsADirectory(path.to_string()));
        };

        // Metadata goes first so the path stops resolving before data is gone
        match self.inner.store.remove(&entry.metadata_pool, path.as_str()) {
            Ok(()) => {}
            Err(Error::ObjectNotFound { .. }) => {
                self.inner.cache.invalidate(path.as_str());
                return Err(Error::PathNotFound(path.to_string()));
            }
            Err(e) => return Err(e),
        }
        self.unlink_from_parent(&path)?;
        self.inner.files.remove_data(&layout)?;
        debug!("Removed file {} (inode {})", path, entry.inode);
        Ok(())
    }

    /// Alias of [`Filesystem::remove`]
    pub fn unlink(&self, path: &str) -> Result<()> {
        self.remove(path)
    }

    /// Names in a directory; subdirectories keep their trailing `/`
    pub fn readdir(&self, path: &str) -> Result<Vec<String>> {
        let path = FsPath::new(path)?.to_dir();
        let entry = self.dir_entry(&path)?;
        let children = self
            .inner
            .store
            .omap_list(&entry.metadata_pool, path.as_str())
            .map_err(|e| match e {
                Error::ObjectNotFound { .. } => Error::PathNotFound(path.to_string()),
                other => other,
            })?;
        Ok(children.into_keys().collect())
    }

    /// Open an existing file
    pub fn open(&self, path: &str) -> Result<File> {
        let path = FsPath::new(path)?;
        let entry = self.inner.resolver.lookup(&path)?;
        File::new(entry, Arc::clone(&self.inner.files))
    }

    /// Create `path` and its missing ancestors as directories
    ///
    /// Ancestors not governed by any metadata pool are skipped; a directory
    /// whose parent is unmanaged is created without a parent link.
    pub(crate) fn ensure_dir(&self, path: &FsPath) -> Result<()> {
        let path = path.to_dir();
        match self.inner.resolver.lookup(&path) {
            Ok(entry) if entry.is_dir() => return Ok(()),
            Ok(_) => return Err(Error::NotADirectory(path.to_string())),
            Err(Error::PathNotFound(_)) => {}
            Err(Error::NoMatchingPool { .. }) => return Ok(()),
            Err(e) => return Err(e),
        }

        let parent = match path.parent() {
            Some(parent_path) => {
                self.ensure_dir(&parent_path)?;
                match self.inner.resolver.lookup(&parent_path) {
                    Ok(parent) => Some(parent),
                    Err(Error::NoMatchingPool { .. }) => None,
                    Err(e) => return Err(e),
                }
            }
            None => None,
        };

        match self.insert_entry(&path, EntryKind::Directory, parent.as_deref()) {
            Ok(()) | Err(Error::AlreadyExists(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Resolve `path` and require a directory
    fn dir_entry(&self, path: &FsPath) -> Result<Arc<EntryMetadata>> {
        let entry = self.inner.resolver.lookup(path)?;
        if !entry.is_dir() {
            return Err(Error::NotADirectory(path.to_string()));
        }
        Ok(entry)
    }

    fn parent_dir(&self, path: &FsPath) -> Result<Arc<EntryMetadata>> {
        let parent = path
            .parent()
            .ok_or_else(|| Error::AlreadyExists(path.to_string()))?;
        self.dir_entry(&parent)
    }

    /// Fail with `AlreadyExists` if `path` resolves
    fn check_absent(&self, path: &FsPath) -> Result<()> {
        match self.inner.resolver.lookup(path) {
            Ok(_) => Err(Error::AlreadyExists(path.to_string())),
            Err(Error::PathNotFound(_) | Error::NoMatchingPool { .. }) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// New files are refused once the data pool has reached its quota
    fn check_quota_for_create(&self, path: &FsPath) -> Result<()> {
        let pool = self.inner.registry.resolve_data_pool(path)?;
        if pool.quota == 0 {
            return Ok(());
        }
        let used = self.inner.store.pool_usage(&pool.name)?.used_bytes;
        if used >= pool.quota {
            return Err(Error::NoSpace {
                pool: pool.name,
                used,
                quota: pool.quota,
            });
        }
        Ok(())
    }

    fn insert_entry(
        &self,
        path: &FsPath,
        kind: EntryKind,
        parent: Option<&EntryMetadata>,
    ) -> Result<()> {
        let metadata_pool = self.inner.registry.resolve_metadata_pool(path)?.name;
        let entry = self.new_entry(path, kind, &metadata_pool)?;
        let store = &self.inner.store;

        match store.create(&metadata_pool, path.as_str(), true) {
            Ok(()) => {}
            Err(Error::ObjectExists { .. }) => return Err(Error::AlreadyExists(path.to_string())),
            Err(e) => return Err(e),
        }

        let linked = store
            .set_xattrs(&metadata_pool, path.as_str(), &entry.to_attrs())
            .and_then(|()| match parent {
                Some(parent) => store.omap_set(
                    &parent.metadata_pool,
                    parent.path.as_str(),
                    &BTreeMap::from([(path.name().to_string(), Bytes::new())]),
                ),
                None => Ok(()),
            });
        if let Err(e) = linked {
            if let Err(cleanup) = store.remove(&metadata_pool, path.as_str()) {
                warn!("Failed to remove partially created {}: {}", path, cleanup);
            }
            self.inner.cache.invalidate(path.as_str());
            return Err(e);
        }

        self.inner.cache.invalidate(path.as_str());
        if let Some(parent) = parent {
            self.inner.cache.invalidate(parent.path.as_str());
        }
        debug!("Created {} {} as {}", kind, path, entry.inode);
        Ok(())
    }

    fn unlink_from_parent(&self, path: &FsPath) -> Result<()> {
        self.inner.cache.invalidate(path.as_str());
        let Some(parent_path) = path.parent() else {
            return Ok(());
        };
        let parent = match self.inner.resolver.lookup(&parent_path) {
            Ok(parent) => parent,
            Err(Error::PathNotFound(_) | Error::NoMatchingPool { .. }) => return Ok(()),
            Err(e) => return Err(e),
        };
        self.inner.store.omap_remove(
            &parent.metadata_pool,
            parent_path.as_str(),
            &[path.name().to_string()],
        )?;
        self.inner.cache.invalidate(parent_path.as_str());
        Ok(())
    }
}

/// `/a/b/` → `/a/b`
fn file_form(dir: &FsPath) -> Result<FsPath> {
    FsPath::new(dir.as_str().trim_end_matches('/')).map_err(Error::from)
}

#[cfg(test)]
mod tests {
    use crate::fs::tests::setup;
    use poolfs_common::{EntryKind, Error, FsPath};
    use poolfs_store::ObjectStore;
    use std::sync::{Arc, Barrier};
    use std::thread;

    #[test]
    fn test_create_and_readdir() {
        let (_, fs) = setup();
        fs.create("/a").unwrap();
        fs.mkdir("/d").unwrap();
        fs.create("/d/b").unwrap();

        assert_eq!(fs.readdir("/").unwrap(), vec!["a", "d/"]);
        assert_eq!(fs.readdir("/d").unwrap(), vec!["b"]);
        assert_eq!(fs.stat("/d/").unwrap().size, 1);
        assert_eq!(fs.stat("/d/b").unwrap().kind, EntryKind::File);
    }

    #[test]
    fn test_create_errors() {
        let (_, fs) = setup();
        fs.create("/a").unwrap();
        fs.mkdir("/d").unwrap();

        assert!(matches!(fs.create("/a"), Err(Error::AlreadyExists(_))));
        assert!(matches!(fs.create("/d"), Err(Error::AlreadyExists(_))));
        assert!(matches!(fs.mkdir("/a"), Err(Error::AlreadyExists(_))));
        assert!(matches!(fs.create("/x/y"), Err(Error::PathNotFound(_))));
        assert!(matches!(fs.create("/a/y"), Err(Error::PathNotFound(_))));
        assert!(matches!(fs.create("/d/"), Err(Error::IsADirectory(_))));
        assert!(matches!(fs.create("rel"), Err(Error::InvalidPath(_))));
        assert!(matches!(fs.mkdir("/"), Err(Error::AlreadyExists(_))));
    }

    #[test]
    fn test_create_without_data_pool() {
        let (_, fs) = setup();
        fs.force_remove_data_pool("data").unwrap();
        assert!(matches!(
            fs.create("/f"),
            Err(Error::NoMatchingPool { .. })
        ));
        fs.mkdir("/d").unwrap();
    }

    #[test]
    fn test_failed_create_leaves_no_object() {
        let (store, fs) = setup();
        // Cache the parent so the failure hits the link step
        fs.fs_info("/").unwrap();
        store.set_object_failing("meta", "/", true).unwrap();

        assert!(matches!(fs.create("/f"), Err(Error::Io(_))));
        assert!(!store.exists("meta", "/f").unwrap());

        store.set_object_failing("meta", "/", false).unwrap();
        assert!(fs.fs_info("/f").unwrap_err().is_not_found());
        fs.create("/f").unwrap();
    }

    #[test]
    fn test_create_respects_quota() {
        let (_, fs) = setup();
        fs.add_data_pool("data-a", "/q", 100).unwrap();
        fs.mkdir("/q").unwrap();
        fs.create("/q/a").unwrap();
        fs.open("/q/a").unwrap().write(0, &[0u8; 100]).unwrap();

        assert!(matches!(fs.create("/q/b"), Err(Error::NoSpace { .. })));
        // Reads still resolve on a full pool
        assert_eq!(fs.open("/q/a").unwrap().read(0, 10).unwrap().len(), 10);
    }

    #[test]
    fn test_remove_file() {
        let (store, fs) = setup();
        fs.create("/f").unwrap();
        let file = fs.open("/f").unwrap();
        file.write(0, &[7u8; 10_000]).unwrap();
        assert!(!store.list_objects("data", "").unwrap().is_empty());

        fs.remove("/f").unwrap();
        assert!(store.list_objects("data", "").unwrap().is_empty());
        assert!(matches!(fs.stat("/f"), Err(Error::PathNotFound(_))));
        assert!(fs.readdir("/").unwrap().is_empty());
        assert!(matches!(fs.unlink("/f"), Err(Error::PathNotFound(_))));
    }

    #[test]
    fn test_remove_rejects_directories() {
        let (_, fs) = setup();
        fs.mkdir("/d").unwrap();
        assert!(matches!(fs.remove("/d/"), Err(Error::IsADirectory(_))));
        assert!(matches!(fs.open("/d/"), Err(Error::IsADirectory(_))));
    }

    #[test]
    fn test_rmdir() {
        let (store, fs) = setup();
        fs.mkdir("/d").unwrap();
        fs.create("/d/f").unwrap();
        fs.create("/f").unwrap();

        assert!(matches!(fs.rmdir("/d"), Err(Error::NotEmpty(_))));
        assert!(matches!(fs.rmdir("/f"), Err(Error::PathNotFound(_))));
        assert!(matches!(fs.rmdir("/"), Err(Error::InvalidArgument(_))));

        fs.remove("/d/f").unwrap();
        fs.rmdir("/d").unwrap();
        assert!(!store.exists("meta", "/d/").unwrap());
        assert_eq!(fs.readdir("/").unwrap(), vec!["f"]);
        assert!(matches!(fs.readdir("/d"), Err(Error::PathNotFound(_))));
    }

    #[test]
    fn test_readdir_on_file() {
        let (_, fs) = setup();
        fs.create("/f").unwrap();
        fs.mkdir("/f2").unwrap();
        assert!(matches!(fs.readdir("/f"), Err(Error::PathNotFound(_))));
        assert_eq!(fs.readdir("/f2").unwrap(), Vec::<String>::new());
    }

    #[test]
    fn test_open_handle_survives_remove() {
        let (_, fs) = setup();
        fs.create("/f").unwrap();
        let file = fs.open("/f").unwrap();
        file.write(0, b"hello").unwrap();
        fs.remove("/f").unwrap();

        // Stripes are gone; the handle still addresses the inode
        assert_eq!(file.size().unwrap(), 0);
        assert_eq!(file.path().as_str(), "/f");
    }

    #[test]
    fn test_file_content_roundtrip() {
        let (_, fs) = setup();
        fs.create("/f").unwrap();
        let file = fs.open("/f").unwrap();
        let payload: Vec<u8> = (0..3 * 4096 + 17).map(|i| (i % 251) as u8).collect();
        assert_eq!(file.write(0, &payload).unwrap(), payload.len() as u64);

        let again = fs.open("/f").unwrap();
        assert_eq!(again.read(0, payload.len() as u64).unwrap(), payload.as_slice());
        again.truncate(100).unwrap();
        assert_eq!(fs.stat("/f").unwrap().size, 100);
    }

    #[test]
    fn test_concurrent_creates_single_winner() {
        let (_, fs) = setup();
        let threads = 8;
        let barrier = Arc::new(Barrier::new(threads));

        let results: Vec<_> = (0..threads)
            .map(|_| {
                let fs = fs.clone();
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    fs.create("/contended")
                })
            })
            .collect::<Vec<_>>()
            .into_iter()
            .map(|h| h.join().unwrap())
            .collect();

        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        assert!(
            results
                .iter()
                .filter_map(|r| r.as_ref().err())
                .all(|e| matches!(e, Error::AlreadyExists(_)))
        );
        assert_eq!(fs.readdir("/").unwrap(), vec!["contended"]);
    }

    #[test]
    fn test_concurrent_creates_distinct_paths() {
        let (_, fs) = setup();
        let handles: Vec<_> = (0..4)
            .map(|t| {
                let fs = fs.clone();
                thread::spawn(move || {
                    for i in 0..25 {
                        fs.create(&format!("/t{t}-{i}")).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(fs.readdir("/").unwrap().len(), 100);
        assert_eq!(fs.stat("/").unwrap().size, 100);
    }

    #[test]
    fn test_removed_path_not_served_from_cache() {
        let (_, fs) = setup();
        fs.create("/f").unwrap();
        let before = fs.inode_and_pool("/f").unwrap();
        fs.remove("/f").unwrap();
        fs.create("/f").unwrap();
        let after = fs.inode_and_pool("/f").unwrap();
        assert_ne!(before.inode, after.inode);
    }

    #[test]
    fn test_nested_metadata_pool() {
        let (store, fs) = setup();
        fs.add_metadata_pool("meta-a", "/a").unwrap();
        fs.create("/a/f").unwrap();

        assert!(store.exists("meta-a", "/a/f").unwrap());
        assert!(!store.exists("meta", "/a/f").unwrap());
        assert_eq!(fs.readdir("/a").unwrap(), vec!["f"]);
        assert_eq!(fs.fs_info("/a/f").unwrap().metadata().metadata_pool, "meta-a");
    }

    #[test]
    fn test_metadata_pool_without_root_pool() {
        let store = Arc::new(poolfs_store::MemoryStore::new());
        store.create_pool("meta", 1 << 20).unwrap();
        store.create_pool("data", 1 << 20).unwrap();
        let fs = crate::Filesystem::new(store.clone(), &Default::default()).unwrap();
        fs.add_metadata_pool("meta", "/only/here").unwrap();
        fs.add_data_pool("data", "/", 0).unwrap();

        assert!(store.exists("meta", "/only/here/").unwrap());
        assert!(matches!(
            fs.stat("/"),
            Err(Error::NoMatchingPool { .. })
        ));
        fs.create("/only/here/f").unwrap();
        assert_eq!(fs.readdir("/only/here/").unwrap(), vec!["f"]);
    }

    #[test]
    fn test_file_form() {
        let dir = FsPath::new("/a/b/").unwrap();
        assert_eq!(super::file_form(&dir).unwrap().as_str(), "/a/b");
    }
}

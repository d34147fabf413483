//! In-memory object store
//!
//! Pools are independent: each one has its own object table, lock table and
//! capacity. A pool can be switched into a failing state, in which every
//! operation against it returns [`Error::Io`].

use crate::object::{ObjectStat, ObjectStore, PoolUsage};
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use poolfs_common::{Error, Result};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant, SystemTime};
use tracing::{debug, info};

#[derive(Debug)]
struct StoredObject {
    data: Vec<u8>,
    xattrs: BTreeMap<String, Bytes>,
    omap: BTreeMap<String, Bytes>,
    mtime: SystemTime,
}

impl StoredObject {
    fn new() -> Self {
        Self {
            data: Vec::new(),
            xattrs: BTreeMap::new(),
            omap: BTreeMap::new(),
            mtime: SystemTime::now(),
        }
    }

    fn len(&self) -> u64 {
        self.data.len() as u64
    }
}

#[derive(Debug, Default)]
struct PoolState {
    objects: BTreeMap<String, StoredObject>,
    /// Sum of object data lengths
    used: u64,
}

#[derive(Debug)]
struct LockHolder {
    cookie: String,
    expires: Instant,
}

struct MemoryPool {
    name: String,
    capacity: u64,
    state: RwLock<PoolState>,
    /// (object, lock name) -> holder
    locks: Mutex<HashMap<(String, String), LockHolder>>,
    failing: AtomicBool,
    failing_objects: RwLock<HashSet<String>>,
}

impl MemoryPool {
    fn new(name: &str, capacity: u64) -> Self {
        Self {
            name: name.to_string(),
            capacity,
            state: RwLock::new(PoolState::default()),
            locks: Mutex::new(HashMap::new()),
            failing: AtomicBool::new(false),
            failing_objects: RwLock::new(HashSet::new()),
        }
    }

    fn not_found(&self, object: &str) -> Error {
        Error::ObjectNotFound {
            pool: self.name.clone(),
            object: object.to_string(),
        }
    }

    /// Usage after resizing an object from `old_len` to `new_len`
    fn charge(&self, state: &PoolState, old_len: u64, new_len: u64) -> Result<u64> {
        let used = state.used - old_len + new_len;
        if new_len > old_len && used > self.capacity {
            return Err(Error::NoSpace {
                pool: self.name.clone(),
                used: state.used,
                quota: self.capacity,
            });
        }
        Ok(used)
    }

    fn with_object<T>(&self, object: &str, f: impl FnOnce(&StoredObject) -> T) -> Result<T> {
        let state = self.state.read();
        state
            .objects
            .get(object)
            .map(f)
            .ok_or_else(|| self.not_found(object))
    }

    fn with_object_mut<T>(
        &self,
        object: &str,
        f: impl FnOnce(&mut StoredObject) -> T,
    ) -> Result<T> {
        let mut state = self.state.write();
        match state.objects.get_mut(object) {
            Some(obj) => {
                let out = f(obj);
                obj.mtime = SystemTime::now();
                Ok(out)
            }
            None => Err(self.not_found(object)),
        }
    }

    /// Resize an object (creating it if needed), then let `f` fill it in
    ///
    /// `f` receives the data buffer and the length before resizing.
    fn resize_with(
        &self,
        object: &str,
        new_len: impl FnOnce(u64) -> u64,
        f: impl FnOnce(&mut Vec<u8>, u64),
    ) -> Result<u64> {
        let mut guard = self.state.write();
        let state = &mut *guard;
        let old_len = state.objects.get(object).map_or(0, StoredObject::len);
        let new_len = new_len(old_len);
        state.used = self.charge(state, old_len, new_len)?;

        let obj = state
            .objects
            .entry(object.to_string())
            .or_insert_with(StoredObject::new);
        obj.data.resize(new_len as usize, 0);
        f(&mut obj.data, old_len);
        obj.mtime = SystemTime::now();
        Ok(new_len)
    }
}

/// Object store held entirely in process memory
pub struct MemoryStore {
    pools: RwLock<HashMap<String, Arc<MemoryPool>>>,
    /// Number of pool operations served, including failed ones
    ops: AtomicU64,
}

impl MemoryStore {
    /// Create a store with no pools
    #[must_use]
    pub fn new() -> Self {
        Self {
            pools: RwLock::new(HashMap::new()),
            ops: AtomicU64::new(0),
        }
    }

    /// Create a pool with the given capacity in bytes
    pub fn create_pool(&self, name: &str, capacity: u64) -> Result<()> {
        if name.is_empty() {
            return Err(Error::InvalidPool("pool name cannot be empty".into()));
        }
        let mut pools = self.pools.write();
        if pools.contains_key(name) {
            return Err(Error::InvalidPool(format!("pool {name} already exists")));
        }
        pools.insert(name.to_string(), Arc::new(MemoryPool::new(name, capacity)));
        info!("Created pool {} with capacity {} bytes", name, capacity);
        Ok(())
    }

    /// Make every operation against `name` fail with an I/O error
    pub fn set_pool_failing(&self, name: &str, failing: bool) -> Result<()> {
        let pools = self.pools.read();
        let pool = pools
            .get(name)
            .ok_or_else(|| Error::PoolNotFound(name.to_string()))?;
        pool.failing.store(failing, Ordering::Relaxed);
        debug!("Pool {} failing={}", name, failing);
        Ok(())
    }

    /// Make every operation on one object fail with an I/O error
    pub fn set_object_failing(&self, pool: &str, object: &str, failing: bool) -> Result<()> {
        let pools = self.pools.read();
        let pool = pools
            .get(pool)
            .ok_or_else(|| Error::PoolNotFound(pool.to_string()))?;
        let mut objects = pool.failing_objects.write();
        if failing {
            objects.insert(object.to_string());
        } else {
            objects.remove(object);
        }
        Ok(())
    }

    /// Number of pool operations served so far
    pub fn op_count(&self) -> u64 {
        self.ops.load(Ordering::Relaxed)
    }

    fn pool(&self, name: &str) -> Result<Arc<MemoryPool>> {
        self.ops.fetch_add(1, Ordering::Relaxed);
        let pool = self
            .pools
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| Error::PoolNotFound(name.to_string()))?;
        if pool.failing.load(Ordering::Relaxed) {
            return Err(Error::io(format!("pool {name} is unavailable")));
        }
        Ok(pool)
    }

    /// Pool lookup for an operation on a single object
    fn target(&self, name: &str, object: &str) -> Result<Arc<MemoryPool>> {
        let pool = self.pool(name)?;
        if pool.failing_objects.read().contains(object) {
            return Err(Error::io(format!("object {name}/{object} is unavailable")));
        }
        Ok(pool)
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ObjectStore for MemoryStore {
    fn list_pools(&self) -> Result<Vec<String>> {
        self.ops.fetch_add(1, Ordering::Relaxed);
        let mut names: Vec<String> = self.pools.read().keys().cloned().collect();
        names.sort();
        Ok(names)
    }

    fn pool_usage(&self, pool: &str) -> Result<PoolUsage> {
        let pool = self.pool(pool)?;
        let state = pool.state.read();
        Ok(PoolUsage {
            total_bytes: pool.capacity,
            used_bytes: state.used,
            num_objects: state.objects.len() as u64,
        })
    }

    fn create(&self, pool: &str, object: &str, exclusive: bool) -> Result<()> {
        let pool = self.target(pool, object)?;
        let mut state = pool.state.write();
        if state.objects.contains_key(object) {
            if exclusive {
                return Err(Error::ObjectExists {
                    pool: pool.name.clone(),
                    object: object.to_string(),
                });
            }
            return Ok(());
        }
        state.objects.insert(object.to_string(), StoredObject::new());
        Ok(())
    }

    fn stat(&self, pool: &str, object: &str) -> Result<ObjectStat> {
        let pool = self.target(pool, object)?;
        pool.with_object(object, |obj| ObjectStat {
            size: obj.len(),
            mtime: obj.mtime,
        })
    }

    fn read(&self, pool: &str, object: &str, offset: u64, len: u64) -> Result<Bytes> {
        let pool = self.target(pool, object)?;
        pool.with_object(object, |obj| {
            let size = obj.len();
            let start = offset.min(size) as usize;
            let end = offset.saturating_add(len).min(size) as usize;
            Bytes::copy_from_slice(&obj.data[start..end])
        })
    }

    fn write(&self, pool: &str, object: &str, offset: u64, data: &[u8]) -> Result<()> {
        let pool = self.target(pool, object)?;
        let end = offset.checked_add(data.len() as u64).ok_or_else(|| {
            Error::invalid_argument(format!("write at {offset} overflows object {object}"))
        })?;
        pool.resize_with(
            object,
            |old| old.max(end),
            |buf, _| buf[offset as usize..end as usize].copy_from_slice(data),
        )?;
        Ok(())
    }

    fn append(&self, pool: &str, object: &str, data: &[u8]) -> Result<u64> {
        let pool = self.target(pool, object)?;
        pool.resize_with(
            object,
            |old| old + data.len() as u64,
            |buf, old| buf[old as usize..].copy_from_slice(data),
        )
    }

    fn truncate(&self, pool: &str, object: &str, size: u64) -> Result<()> {
        let pool = self.target(pool, object)?;
        pool.resize_with(object, |_| size, |_, _| {})?;
        Ok(())
    }

    fn remove(&self, pool: &str, object: &str) -> Result<()> {
        let pool = self.target(pool, object)?;
        let mut state = pool.state.write();
        let obj = state
            .objects
            .remove(object)
            .ok_or_else(|| pool.not_found(object))?;
        state.used -= obj.len();
        Ok(())
    }

    fn list_objects(&self, pool: &str, prefix: &str) -> Result<Vec<String>> {
        let pool = self.pool(pool)?;
        let state = pool.state.read();
        Ok(state
            .objects
            .range(prefix.to_string()..)
            .map(|(name, _)| name)
            .take_while(|name| name.starts_with(prefix))
            .cloned()
            .collect())
    }

    fn get_xattr(&self, pool: &str, object: &str, name: &str) -> Result<Bytes> {
        let pool = self.target(pool, object)?;
        pool.with_object(object, |obj| obj.xattrs.get(name).cloned())?
            .ok_or_else(|| Error::AttributeNotFound {
                path: object.to_string(),
                name: name.to_string(),
            })
    }

    fn set_xattr(&self, pool: &str, object: &str, name: &str, value: &[u8]) -> Result<()> {
        let pool = self.target(pool, object)?;
        pool.with_object_mut(object, |obj| {
            obj.xattrs
                .insert(name.to_string(), Bytes::copy_from_slice(value));
        })
    }

    fn set_xattrs(&self, pool: &str, object: &str, attrs: &BTreeMap<String, Bytes>) -> Result<()> {
        let pool = self.target(pool, object)?;
        pool.with_object_mut(object, |obj| {
            obj.xattrs
                .extend(attrs.iter().map(|(k, v)| (k.clone(), v.clone())));
        })
    }

    fn remove_xattr(&self, pool: &str, object: &str, name: &str) -> Result<()> {
        let pool = self.target(pool, object)?;
        pool.with_object_mut(object, |obj| obj.xattrs.remove(name))?
            .map(|_| ())
            .ok_or_else(|| Error::AttributeNotFound {
                path: object.to_string(),
                name: name.to_string(),
            })
    }

    fn list_xattrs(&self, pool: &str, object: &str) -> Result<BTreeMap<String, Bytes>> {
        let pool = self.target(pool, object)?;
        pool.with_object(object, |obj| obj.xattrs.clone())
    }

    fn omap_set(&self, pool: &str, object: &str, entries: &BTreeMap<String, Bytes>) -> Result<()> {
        let pool = self.target(pool, object)?;
        pool.with_object_mut(object, |obj| {
            obj.omap
                .extend(entries.iter().map(|(k, v)| (k.clone(), v.clone())));
        })
    }

    fn omap_remove(&self, pool: &str, object: &str, keys: &[String]) -> Result<()> {
        let pool = self.target(pool, object)?;
        pool.with_object_mut(object, |obj| {
            for key in keys {
                obj.omap.remove(key);
            }
        })
    }

    fn omap_list(&self, pool: &str, object: &str) -> Result<BTreeMap<String, Bytes>> {
        let pool = self.target(pool, object)?;
        pool.with_object(object, |obj| obj.omap.clone())
    }

    fn lock_exclusive(
        &self,
        pool: &str,
        object: &str,
        name: &str,
        cookie: &str,
        lease: Duration,
    ) -> Result<()> {
        let pool = self.target(pool, object)?;
        let now = Instant::now();
        let mut locks = pool.locks.lock();
        let key = (object.to_string(), name.to_string());
        if let Some(holder) = locks.get(&key)
            && holder.cookie != cookie
            && holder.expires > now
        {
            return Err(Error::Busy(format!("{}/{}", pool.name, object)));
        }
        locks.insert(
            key,
            LockHolder {
                cookie: cookie.to_string(),
                expires: now + lease,
            },
        );
        Ok(())
    }

    fn unlock(&self, pool: &str, object: &str, name: &str, cookie: &str) -> Result<()> {
        let pool = self.target(pool, object)?;
        let mut locks = pool.locks.lock();
        let key = (object.to_string(), name.to_string());
        match locks.get(&key) {
            Some(holder) if holder.cookie != cookie => {
                Err(Error::Busy(format!("{}/{}", pool.name, object)))
            }
            Some(_) => {
                locks.remove(&key);
                Ok(())
            }
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::RngCore;

    fn store() -> MemoryStore {
        let store = MemoryStore::new();
        store.create_pool("data", 1024 * 1024).unwrap();
        store
    }

    #[test]
    fn test_write_read_roundtrip() {
        let store = store();
        let mut payload = vec![0u8; 8192];
        rand::thread_rng().fill_bytes(&mut payload);

        store.write("data", "obj", 0, &payload).unwrap();
        let read = store.read("data", "obj", 0, 8192).unwrap();
        assert_eq!(&read[..], &payload[..]);

        let tail = store.read("data", "obj", 8000, 4096).unwrap();
        assert_eq!(tail.len(), 192);
        assert!(store.read("data", "obj", 9000, 10).unwrap().is_empty());
    }

    #[test]
    fn test_sparse_write_zero_fills() {
        let store = store();
        store.write("data", "obj", 100, b"abc").unwrap();
        let stat = store.stat("data", "obj").unwrap();
        assert_eq!(stat.size, 103);
        let read = store.read("data", "obj", 0, 103).unwrap();
        assert!(read[..100].iter().all(|b| *b == 0));
        assert_eq!(&read[100..], b"abc");
    }

    #[test]
    fn test_append_and_truncate() {
        let store = store();
        assert_eq!(store.append("data", "log", b"hello").unwrap(), 5);
        assert_eq!(store.append("data", "log", b" world").unwrap(), 11);
        store.truncate("data", "log", 5).unwrap();
        assert_eq!(&store.read("data", "log", 0, 100).unwrap()[..], b"hello");
        assert_eq!(store.pool_usage("data").unwrap().used_bytes, 5);
    }

    #[test]
    fn test_capacity_exceeded() {
        let store = MemoryStore::new();
        store.create_pool("small", 10).unwrap();
        store.write("small", "a", 0, b"12345678").unwrap();
        let err = store.write("small", "b", 0, b"abc").unwrap_err();
        assert!(matches!(err, Error::NoSpace { used: 8, quota: 10, .. }));
        assert!(!store.exists("small", "b").unwrap());

        // Overwriting in place does not grow the pool
        store.write("small", "a", 0, b"xx").unwrap();
        store.remove("small", "a").unwrap();
        assert_eq!(store.pool_usage("small").unwrap().used_bytes, 0);
    }

    #[test]
    fn test_exclusive_create() {
        let store = store();
        store.create("data", "obj", true).unwrap();
        assert!(matches!(
            store.create("data", "obj", true),
            Err(Error::ObjectExists { .. })
        ));
        store.create("data", "obj", false).unwrap();
    }

    #[test]
    fn test_missing_pool_and_object() {
        let store = store();
        assert!(matches!(
            store.stat("nope", "obj"),
            Err(Error::PoolNotFound(_))
        ));
        assert!(matches!(
            store.read("data", "missing", 0, 1),
            Err(Error::ObjectNotFound { .. })
        ));
        assert!(matches!(
            store.set_xattr("data", "missing", "k", b"v"),
            Err(Error::ObjectNotFound { .. })
        ));
    }

    #[test]
    fn test_failing_pool() {
        let store = store();
        store.write("data", "obj", 0, b"x").unwrap();
        store.set_pool_failing("data", true).unwrap();
        assert!(matches!(store.stat("data", "obj"), Err(Error::Io(_))));
        assert!(matches!(store.pool_usage("data"), Err(Error::Io(_))));

        store.set_pool_failing("data", false).unwrap();
        assert_eq!(store.stat("data", "obj").unwrap().size, 1);
    }

    #[test]
    fn test_failing_object() {
        let store = store();
        store.create("data", "bad", false).unwrap();
        store.create("data", "good", false).unwrap();
        store.set_object_failing("data", "bad", true).unwrap();
        assert!(matches!(store.omap_list("data", "bad"), Err(Error::Io(_))));
        assert!(store.omap_list("data", "good").is_ok());
        assert_eq!(store.list_objects("data", "").unwrap().len(), 2);

        store.set_object_failing("data", "bad", false).unwrap();
        assert!(store.omap_list("data", "bad").is_ok());
    }

    #[test]
    fn test_list_objects_by_prefix() {
        let store = store();
        for name in ["a.0", "a.1", "ab", "b.0"] {
            store.create("data", name, false).unwrap();
        }
        assert_eq!(store.list_objects("data", "a.").unwrap(), vec!["a.0", "a.1"]);
        assert_eq!(store.list_objects("data", "").unwrap().len(), 4);
    }

    #[test]
    fn test_xattrs_and_omap() {
        let store = store();
        store.create("data", "dir", true).unwrap();

        let mut attrs = BTreeMap::new();
        attrs.insert("k1".to_string(), Bytes::from_static(b"v1"));
        attrs.insert("k2".to_string(), Bytes::from_static(b"v2"));
        store.set_xattrs("data", "dir", &attrs).unwrap();
        assert_eq!(&store.get_xattr("data", "dir", "k1").unwrap()[..], b"v1");

        store.remove_xattr("data", "dir", "k1").unwrap();
        assert!(matches!(
            store.get_xattr("data", "dir", "k1"),
            Err(Error::AttributeNotFound { .. })
        ));
        assert!(matches!(
            store.remove_xattr("data", "dir", "k1"),
            Err(Error::AttributeNotFound { .. })
        ));
        assert_eq!(store.list_xattrs("data", "dir").unwrap().len(), 1);

        let mut entries = BTreeMap::new();
        entries.insert("child".to_string(), Bytes::new());
        entries.insert("sub/".to_string(), Bytes::new());
        store.omap_set("data", "dir", &entries).unwrap();
        store
            .omap_remove("data", "dir", &["child".to_string(), "absent".to_string()])
            .unwrap();
        let omap = store.omap_list("data", "dir").unwrap();
        assert_eq!(omap.keys().collect::<Vec<_>>(), vec!["sub/"]);
    }

    #[test]
    fn test_lock_contention_and_lease() {
        let store = store();
        let lease = Duration::from_secs(60);
        store.lock_exclusive("data", "obj", "w", "a", lease).unwrap();
        // Same owner renews
        store.lock_exclusive("data", "obj", "w", "a", lease).unwrap();
        assert!(matches!(
            store.lock_exclusive("data", "obj", "w", "b", lease),
            Err(Error::Busy(_))
        ));
        assert!(store.unlock("data", "obj", "w", "b").is_err());
        store.unlock("data", "obj", "w", "a").unwrap();
        store.lock_exclusive("data", "obj", "w", "b", lease).unwrap();
    }

    #[test]
    fn test_expired_lease_can_be_taken() {
        let store = store();
        store
            .lock_exclusive("data", "obj", "w", "a", Duration::from_millis(1))
            .unwrap();
        std::thread::sleep(Duration::from_millis(10));
        store
            .lock_exclusive("data", "obj", "w", "b", Duration::from_secs(60))
            .unwrap();
    }

    #[test]
    fn test_op_counter() {
        let store = store();
        let before = store.op_count();
        let _ = store.stat("data", "missing");
        store.create("data", "obj", false).unwrap();
        assert_eq!(store.op_count(), before + 2);
    }

    #[test]
    fn test_write_past_max_offset_rejected() {
        let store = store();
        let result = store.write("data", "obj", u64::MAX - 1, b"abc");
        assert!(matches!(result, Err(Error::InvalidArgument(_))));
        assert!(store.list_objects("data", "").unwrap().is_empty());
    }
}

//! Per-inode exclusive write locks
//!
//! Writers in this process queue on a local mutex per inode. The holder of
//! that mutex then takes a leased exclusive lock in the store, which fences
//! writers in other processes; the lease bounds how long a crashed holder
//! can keep the inode locked. Long writes renew the lease as they go, see
//! [`Lease::keep_alive`].

use crate::entry::FileLayout;
use dashmap::DashMap;
use parking_lot::Mutex;
use poolfs_common::{InodeId, Result};
use poolfs_store::ObjectStore;
use std::cell::Cell;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};
use uuid::Uuid;

/// Name of the store lock taken by writers
pub const WRITE_LOCK_NAME: &str = "poolfs.write";

/// Lock table for the inodes this process writes to
pub struct InodeLocks {
    local: DashMap<InodeId, Arc<Mutex<()>>>,
    /// Identifies this process to the store lock
    cookie: String,
    lease: Duration,
}

impl InodeLocks {
    pub fn new(lease: Duration) -> Self {
        Self {
            local: DashMap::new(),
            cookie: Uuid::new_v4().to_string(),
            lease,
        }
    }

    pub fn cookie(&self) -> &str {
        &self.cookie
    }

    /// Number of inodes with a writer holding or waiting for the lock
    pub fn active(&self) -> usize {
        self.local.len()
    }

    /// Run `f` while holding the exclusive lock on the file's inode
    ///
    /// Returns [`poolfs_common::Error::Busy`] without running `f` if another
    /// process holds the store lock.
    pub fn with_exclusive<T>(
        &self,
        store: &dyn ObjectStore,
        layout: &FileLayout,
        f: impl FnOnce(&Lease<'_>) -> Result<T>,
    ) -> Result<T> {
        let local = Arc::clone(self.local.entry(layout.inode).or_default().value());
        let result = {
            let _guard = local.lock();
            self.with_store_lock(store, layout, f)
        };
        drop(local);
        self.local
            .remove_if(&layout.inode, |_, mutex| Arc::strong_count(mutex) == 1);
        result
    }

    fn with_store_lock<T>(
        &self,
        store: &dyn ObjectStore,
        layout: &FileLayout,
        f: impl FnOnce(&Lease<'_>) -> Result<T>,
    ) -> Result<T> {
        let object = layout.inode.to_string();
        let held = HeldLock {
            store,
            pool: &layout.pool,
            object: &object,
            cookie: &self.cookie,
            lease: self.lease,
            taken: Cell::new(Instant::now()),
        };
        held.acquire()?;
        debug!("Locked inode {} in {}", layout.inode, layout.pool);

        let result = f(&Lease { held: Some(held) });

        if let Err(e) = store.unlock(&layout.pool, &object, WRITE_LOCK_NAME, &self.cookie) {
            warn!("Failed to unlock inode {} in {}: {}", layout.inode, layout.pool, e);
        }
        result
    }
}

struct HeldLock<'a> {
    store: &'a dyn ObjectStore,
    pool: &'a str,
    object: &'a str,
    cookie: &'a str,
    lease: Duration,
    /// When the lease was last taken or renewed
    taken: Cell<Instant>,
}

impl HeldLock<'_> {
    fn acquire(&self) -> Result<()> {
        let now = Instant::now();
        self.store
            .lock_exclusive(self.pool, self.object, WRITE_LOCK_NAME, self.cookie, self.lease)?;
        self.taken.set(now);
        Ok(())
    }
}

/// The store lease held by a writer, if locking is enabled
pub struct Lease<'a> {
    held: Option<HeldLock<'a>>,
}

impl Lease<'_> {
    /// A writer running without the store lock
    pub const fn unlocked() -> Self {
        Self { held: None }
    }

    /// True if a store lock backs this lease
    pub const fn is_held(&self) -> bool {
        self.held.is_some()
    }

    /// Renew the lease once half of it has elapsed
    ///
    /// Fails with [`poolfs_common::Error::Busy`] if the lease already ran
    /// out and another owner took the lock.
    pub fn keep_alive(&self) -> Result<()> {
        let Some(held) = &self.held else {
            return Ok(());
        };
        if held.taken.get().elapsed() < held.lease / 2 {
            return Ok(());
        }
        held.acquire()?;
        debug!("Renewed lease on {}/{}", held.pool, held.object);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use poolfs_common::Error;
    use poolfs_store::MemoryStore;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn setup() -> (Arc<MemoryStore>, FileLayout) {
        let store = Arc::new(MemoryStore::new());
        store.create_pool("data", 1 << 20).unwrap();
        let layout = FileLayout {
            pool: "data".into(),
            inode: InodeId::new(),
            stripe_size: 4096,
        };
        (store, layout)
    }

    #[test]
    fn test_lock_released_after_use() {
        let (store, layout) = setup();
        let locks = InodeLocks::new(Duration::from_secs(60));
        let value = locks.with_exclusive(store.as_ref(), &layout, |_| Ok(7)).unwrap();
        assert_eq!(value, 7);
        assert_eq!(locks.active(), 0);

        // A second process can take it once released
        let other = InodeLocks::new(Duration::from_secs(60));
        other.with_exclusive(store.as_ref(), &layout, |_| Ok(())).unwrap();
    }

    #[test]
    fn test_other_process_sees_busy() {
        let (store, layout) = setup();
        let locks = InodeLocks::new(Duration::from_secs(60));
        let other = InodeLocks::new(Duration::from_secs(60));

        let result = locks.with_exclusive(store.as_ref(), &layout, |_| {
            let mut ran = false;
            let inner = other.with_exclusive(store.as_ref(), &layout, |_| {
                ran = true;
                Ok(())
            });
            assert!(matches!(inner, Err(Error::Busy(_))));
            assert!(!ran);
            Ok(())
        });
        result.unwrap();
    }

    #[test]
    fn test_error_from_body_still_unlocks() {
        let (store, layout) = setup();
        let locks = InodeLocks::new(Duration::from_secs(60));
        let result: Result<()> =
            locks.with_exclusive(store.as_ref(), &layout, |_| Err(Error::io("boom")));
        assert!(matches!(result, Err(Error::Io(_))));

        let other = InodeLocks::new(Duration::from_secs(60));
        other.with_exclusive(store.as_ref(), &layout, |_| Ok(())).unwrap();
    }

    #[test]
    fn test_local_writers_are_serialized() {
        let (store, layout) = setup();
        let locks = InodeLocks::new(Duration::from_secs(60));
        let inside = AtomicUsize::new(0);

        std::thread::scope(|s| {
            for _ in 0..8 {
                s.spawn(|| {
                    for _ in 0..20 {
                        locks
                            .with_exclusive(store.as_ref(), &layout, |_| {
                                assert_eq!(inside.fetch_add(1, Ordering::SeqCst), 0);
                                std::thread::yield_now();
                                inside.fetch_sub(1, Ordering::SeqCst);
                                Ok(())
                            })
                            .unwrap();
                    }
                });
            }
        });
        assert_eq!(locks.active(), 0);
    }

    #[test]
    fn test_keep_alive_renews_lease() {
        let (store, layout) = setup();
        let locks = InodeLocks::new(Duration::from_millis(200));
        let other = InodeLocks::new(Duration::from_secs(60));
        let object = layout.inode.to_string();

        locks
            .with_exclusive(store.as_ref(), &layout, |lease| {
                assert!(lease.is_held());
                // Within the first half of the lease nothing is sent
                let ops = store.op_count();
                lease.keep_alive()?;
                assert_eq!(store.op_count(), ops);

                std::thread::sleep(Duration::from_millis(120));
                lease.keep_alive()?;
                assert!(store.op_count() > ops);

                // Past the original lease, still held thanks to the renewal
                std::thread::sleep(Duration::from_millis(120));
                let taken = store.lock_exclusive(
                    "data",
                    &object,
                    WRITE_LOCK_NAME,
                    other.cookie(),
                    Duration::from_secs(60),
                );
                assert!(matches!(taken, Err(Error::Busy(_))));
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn test_keep_alive_fails_after_takeover() {
        let (store, layout) = setup();
        let locks = InodeLocks::new(Duration::from_millis(50));
        let other = InodeLocks::new(Duration::from_secs(60));
        let object = layout.inode.to_string();

        let result = locks.with_exclusive(store.as_ref(), &layout, |lease| {
            std::thread::sleep(Duration::from_millis(80));
            store.lock_exclusive(
                "data",
                &object,
                WRITE_LOCK_NAME,
                other.cookie(),
                Duration::from_secs(60),
            )?;
            lease.keep_alive()
        });
        assert!(matches!(result, Err(Error::Busy(_))));
    }

    #[test]
    fn test_unlocked_lease_is_noop() {
        let lease = Lease::unlocked();
        assert!(!lease.is_held());
        lease.keep_alive().unwrap();
    }
}

//! Directory entry cache
//!
//! Size-bounded LRU cache of resolved entry metadata keyed by path. Slots
//! move through `Absent -> Cached -> Invalidated -> (compaction) -> Absent`.
//! Invalidated slots are tombstones: they keep the epoch of the last
//! invalidation so that a lookup started before it cannot put stale
//! metadata back into the cache.
//!
//! Invalidating a path that has no slot leaves no tombstone; it raises the
//! epoch floor shared by all slot-less paths instead.
//!
//! Occupancy is the estimated byte size of live entries. Compaction runs
//! whenever the share of tombstones among all slots exceeds the compaction
//! ratio, or when tombstones outnumber both the live entries and
//! [`TOMBSTONE_FLOOR`]. It is checked after every mutation.

use crate::entry::EntryMetadata;
use parking_lot::Mutex;
use poolfs_common::config::validate_compact_ratio;
use poolfs_common::{Error, Result};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

/// Tombstones tolerated before compaction is forced, whatever the ratio
pub const TOMBSTONE_FLOOR: usize = 1024;

/// Cache statistics for monitoring
#[derive(Debug, Default)]
pub struct CacheStats {
    /// Number of cache hits
    pub hits: AtomicU64,
    /// Number of cache misses
    pub misses: AtomicU64,
    /// Entries invalidated to stay under the size bound
    pub evictions: AtomicU64,
    /// Explicit invalidations
    pub invalidations: AtomicU64,
    /// Compaction passes
    pub compactions: AtomicU64,
    /// Inserts refused because the path was invalidated meanwhile
    pub stale_rejections: AtomicU64,
}

impl CacheStats {
    /// Calculate hit ratio (0.0 to 1.0)
    pub fn hit_ratio(&self) -> f64 {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        if total == 0 {
            return 0.0;
        }
        hits as f64 / total as f64
    }

    /// Reset all statistics
    pub fn reset(&self) {
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
        self.evictions.store(0, Ordering::Relaxed);
        self.invalidations.store(0, Ordering::Relaxed);
        self.compactions.store(0, Ordering::Relaxed);
        self.stale_rejections.store(0, Ordering::Relaxed);
    }
}

/// Per-path slot. `epoch` is the last invalidation epoch seen for the path.
#[derive(Debug)]
enum Slot {
    Cached {
        entry: Arc<EntryMetadata>,
        stamp: u64,
        size: usize,
        epoch: u64,
    },
    Invalidated {
        epoch: u64,
    },
}

impl Slot {
    const fn epoch(&self) -> u64 {
        match self {
            Self::Cached { epoch, .. } | Self::Invalidated { epoch } => *epoch,
        }
    }
}

#[derive(Debug)]
struct CacheState {
    slots: HashMap<String, Slot>,
    /// LRU order of live entries: stamp -> path
    lru: BTreeMap<u64, String>,
    /// Logical clock for LRU stamps
    clock: u64,
    /// Bumped on every invalidation
    epoch: u64,
    /// Epoch floor for paths without a slot
    reclaimed_epoch: u64,
    live_bytes: usize,
    invalidated: usize,
    max_bytes: usize,
    compact_ratio: f32,
}

impl CacheState {
    fn slot_epoch(&self, path: &str) -> u64 {
        self.slots
            .get(path)
            .map_or(self.reclaimed_epoch, Slot::epoch)
    }

    /// Drop whatever occupies `path`, keeping the counters right
    fn take(&mut self, path: &str) -> Option<Slot> {
        let slot = self.slots.remove(path)?;
        match &slot {
            Slot::Cached { stamp, size, .. } => {
                self.lru.remove(stamp);
                self.live_bytes -= size;
            }
            Slot::Invalidated { .. } => self.invalidated -= 1,
        }
        Some(slot)
    }

    fn insert(&mut self, path: &str, entry: Arc<EntryMetadata>) -> u64 {
        let epoch = self.slot_epoch(path);
        self.take(path);

        let size = entry.estimated_size() + path.len();
        self.clock += 1;
        let stamp = self.clock;
        self.lru.insert(stamp, path.to_string());
        self.slots.insert(
            path.to_string(),
            Slot::Cached {
                entry,
                stamp,
                size,
                epoch,
            },
        );
        self.live_bytes += size;
        stamp
    }

    fn tombstone(&mut self, path: &str, epoch: u64) {
        self.take(path);
        self.slots
            .insert(path.to_string(), Slot::Invalidated { epoch });
        self.invalidated += 1;
    }

    /// Invalidate LRU entries until under the size bound, sparing `keep`
    fn evict(&mut self, keep: Option<u64>) -> u64 {
        let mut evicted = 0;
        while self.live_bytes > self.max_bytes {
            let Some((&stamp, path)) = self.lru.first_key_value() else {
                break;
            };
            if Some(stamp) == keep {
                break;
            }
            let path = path.clone();
            let epoch = self.slot_epoch(&path);
            self.tombstone(&path, epoch);
            evicted += 1;
        }
        evicted
    }

    fn needs_compaction(&self) -> bool {
        let total = self.slots.len();
        if total == 0 {
            return false;
        }
        let live = total - self.invalidated;
        self.invalidated as f32 / total as f32 > self.compact_ratio
            || self.invalidated > live.max(TOMBSTONE_FLOOR)
    }

    fn compact(&mut self) -> usize {
        let reclaimed = self.invalidated;
        self.slots
            .retain(|_, slot| matches!(slot, Slot::Cached { .. }));
        self.live_bytes = self
            .slots
            .values()
            .map(|slot| match slot {
                Slot::Cached { size, .. } => *size,
                Slot::Invalidated { .. } => 0,
            })
            .sum();
        self.invalidated = 0;
        self.reclaimed_epoch = self.epoch;
        reclaimed
    }
}

/// Size-bounded cache of resolved entries
pub struct DirCache {
    state: Mutex<CacheState>,
    stats: CacheStats,
}

impl DirCache {
    /// Create a cache bounded to `max_bytes` of live entries
    pub fn new(max_bytes: usize, compact_ratio: f32) -> Result<Self> {
        check_max_size(max_bytes)?;
        validate_compact_ratio(compact_ratio)?;
        Ok(Self {
            state: Mutex::new(CacheState {
                slots: HashMap::new(),
                lru: BTreeMap::new(),
                clock: 0,
                epoch: 0,
                reclaimed_epoch: 0,
                live_bytes: 0,
                invalidated: 0,
                max_bytes,
                compact_ratio,
            }),
            stats: CacheStats::default(),
        })
    }

    /// Get an entry, marking it most recently used
    pub fn get(&self, path: &str) -> Option<Arc<EntryMetadata>> {
        let mut guard = self.state.lock();
        let state = &mut *guard;

        if let Some(Slot::Cached { entry, stamp, .. }) = state.slots.get_mut(path) {
            state.clock += 1;
            let path = state
                .lru
                .remove(stamp)
                .unwrap_or_else(|| path.to_string());
            *stamp = state.clock;
            state.lru.insert(state.clock, path);
            self.stats.hits.fetch_add(1, Ordering::Relaxed);
            return Some(Arc::clone(entry));
        }

        self.stats.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    /// Insert or replace an entry unconditionally
    pub fn put(&self, path: &str, entry: Arc<EntryMetadata>) {
        let mut state = self.state.lock();
        let stamp = state.insert(path, entry);
        self.after_insert(&mut state, stamp);
    }

    /// Insert an entry read from the store at `observed_epoch`
    ///
    /// Refused (returns `false`) if `path` was invalidated after that epoch,
    /// so a lookup racing with a local mutation never caches the old value.
    pub fn put_if_unchanged(
        &self,
        path: &str,
        entry: Arc<EntryMetadata>,
        observed_epoch: u64,
    ) -> bool {
        let mut state = self.state.lock();
        if state.slot_epoch(path) > observed_epoch {
            self.stats.stale_rejections.fetch_add(1, Ordering::Relaxed);
            debug!("Refusing stale cache insert for {}", path);
            return false;
        }
        let stamp = state.insert(path, entry);
        self.after_insert(&mut state, stamp);
        true
    }

    fn after_insert(&self, state: &mut CacheState, stamp: u64) {
        let evicted = state.evict(Some(stamp));
        if evicted > 0 {
            self.stats.evictions.fetch_add(evicted, Ordering::Relaxed);
        }
        self.maybe_compact(state);
    }

    /// Current invalidation epoch, to be passed to [`Self::put_if_unchanged`]
    pub fn epoch(&self) -> u64 {
        self.state.lock().epoch
    }

    /// Mark a path stale, whether cached or not
    pub fn invalidate(&self, path: &str) {
        let mut state = self.state.lock();
        state.epoch += 1;
        let epoch = state.epoch;
        if state.slots.contains_key(path) {
            state.tombstone(path, epoch);
        } else {
            state.reclaimed_epoch = epoch;
        }
        self.stats.invalidations.fetch_add(1, Ordering::Relaxed);
        debug!("Invalidated cache entry {} at epoch {}", path, epoch);
        self.maybe_compact(&mut state);
    }

    /// Compact if the tombstone ratio is over the threshold
    pub fn compact_if_needed(&self) -> bool {
        let mut state = self.state.lock();
        self.maybe_compact(&mut state)
    }

    fn maybe_compact(&self, state: &mut CacheState) -> bool {
        if !state.needs_compaction() {
            return false;
        }
        let reclaimed = state.compact();
        self.stats.compactions.fetch_add(1, Ordering::Relaxed);
        debug!(
            "Compacted directory cache: reclaimed {} entries, {} live bytes",
            reclaimed, state.live_bytes
        );
        true
    }

    /// Change the size bound, evicting as needed
    pub fn set_max_size(&self, max_bytes: usize) -> Result<()> {
        check_max_size(max_bytes)?;
        let mut state = self.state.lock();
        state.max_bytes = max_bytes;
        let evicted = state.evict(None);
        self.stats.evictions.fetch_add(evicted, Ordering::Relaxed);
        self.maybe_compact(&mut state);
        Ok(())
    }

    pub fn max_size(&self) -> usize {
        self.state.lock().max_bytes
    }

    /// Change the compaction threshold, compacting if already over it
    pub fn set_compact_ratio(&self, ratio: f32) -> Result<()> {
        validate_compact_ratio(ratio)?;
        let mut state = self.state.lock();
        state.compact_ratio = ratio;
        self.maybe_compact(&mut state);
        Ok(())
    }

    pub fn compact_ratio(&self) -> f32 {
        self.state.lock().compact_ratio
    }

    /// Drop every slot; lookups started before this cannot insert afterwards
    pub fn clear(&self) {
        let mut state = self.state.lock();
        state.slots.clear();
        state.lru.clear();
        state.live_bytes = 0;
        state.invalidated = 0;
        state.epoch += 1;
        state.reclaimed_epoch = state.epoch;
        debug!("Cleared directory cache at epoch {}", state.epoch);
    }

    /// Get cache statistics
    pub fn stats(&self) -> &CacheStats {
        &self.stats
    }

    /// Snapshot of the cache's internal state
    pub fn debug_info(&self) -> CacheDebugInfo {
        let state = self.state.lock();
        CacheDebugInfo {
            live_entries: state.lru.len(),
            invalidated_entries: state.invalidated,
            live_bytes: state.live_bytes,
            max_bytes: state.max_bytes,
            compact_ratio: state.compact_ratio,
            epoch: state.epoch,
            lru_order: state.lru.values().cloned().collect(),
        }
    }
}

fn check_max_size(max_bytes: usize) -> Result<()> {
    if max_bytes == 0 {
        return Err(Error::invalid_argument("dir_cache_max_size must be positive"));
    }
    Ok(())
}

/// Debug information about cache state
#[derive(Clone, Debug)]
pub struct CacheDebugInfo {
    pub live_entries: usize,
    pub invalidated_entries: usize,
    pub live_bytes: usize,
    pub max_bytes: usize,
    pub compact_ratio: f32,
    pub epoch: u64,
    /// Live paths, least recently used first
    pub lru_order: Vec<String>,
}

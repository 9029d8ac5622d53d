//! Two-tier raw tag dump cache
//!
//! Caches whole raw dumps keyed by canonical UID so a tag seen recently can
//! be served without re-running the authentication protocol. Tier 1 is a
//! byte-budgeted in-memory LRU; tier 2 is a SQLite store with a larger
//! entry-count capacity. Writes go through both tiers; a tier-2 hit is
//! promoted back into tier 1.

pub mod database;
pub mod memory;

pub use database::PersistentTier;
pub use memory::{EvictedEntry, EvictionCallback, MemoryTier};

use crate::config::CacheSettings;
use crate::dump::RawTagDump;
use anyhow::Result;
use chrono::Utc;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

/// Which tier served a lookup
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheHitTier {
    Memory,
    Persistent,
}

/// Counters and occupancy exposed by [`TagDataCache::statistics`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TagCacheStats {
    pub memory_hits: u64,
    pub persistent_hits: u64,
    pub misses: u64,
    pub errors: u64,
    pub invalidations: u64,
    pub memory_entries: usize,
    pub memory_bytes: usize,
    pub persistent_entries: usize,
}

struct Inner {
    memory: MemoryTier,
    persistent: PersistentTier,
    /// Evictions captured from the memory tier, drained after each
    /// exclusive operation
    evicted: Arc<Mutex<Vec<EvictedEntry>>>,
}

/// Two-tier cache of raw tag dumps keyed by UID
///
/// One reader/writer lock guards all mutation: plain tier-1 hits run
/// concurrently under the read lock, while writes and promotion take the
/// write lock.
pub struct TagDataCache {
    inner: RwLock<Inner>,
    promotion_window_seconds: i64,
    persistent_ttl_seconds: i64,
    on_evict: Mutex<Option<Arc<dyn Fn(&str) + Send + Sync>>>,
    memory_hits: AtomicU64,
    persistent_hits: AtomicU64,
    misses: AtomicU64,
    errors: AtomicU64,
    invalidations: AtomicU64,
}

impl TagDataCache {
    /// Open the cache with its persistent tier rooted at `data_dir`
    pub fn open(data_dir: &Path, settings: &CacheSettings) -> Result<Self> {
        let evicted = Arc::new(Mutex::new(Vec::new()));
        let capture = evicted.clone();

        let mut memory = MemoryTier::new(settings.memory_capacity_bytes);
        memory.set_eviction_callback(Box::new(move |entry: &EvictedEntry| {
            capture
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .push(EvictedEntry {
                    uid_hex: entry.uid_hex.clone(),
                    dump: entry.dump.clone(),
                    last_accessed_at: entry.last_accessed_at,
                });
        }));

        let persistent = PersistentTier::open(data_dir, settings.persistent_capacity_entries)?;

        Ok(Self {
            inner: RwLock::new(Inner {
                memory,
                persistent,
                evicted,
            }),
            promotion_window_seconds: settings.promotion_window_seconds,
            persistent_ttl_seconds: settings.persistent_ttl_seconds,
            on_evict: Mutex::new(None),
            memory_hits: AtomicU64::new(0),
            persistent_hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            invalidations: AtomicU64::new(0),
        })
    }

    /// Notify on every tier-1 eviction (after any write-back to tier 2).
    /// The callback runs outside the cache's locks, so it may call back
    /// into the cache.
    pub fn set_eviction_callback(&self, callback: Box<dyn Fn(&str) + Send + Sync>) {
        *self.on_evict.lock().unwrap_or_else(|e| e.into_inner()) = Some(Arc::from(callback));
    }

    /// Look up a dump by UID.
    ///
    /// Tier-1 hits run under the read lock; a tier-2 hit takes the write
    /// lock to promote the dump back into memory. Tier-2 read errors count
    /// as errors and surface as misses.
    pub fn get(&self, uid_hex: &str) -> Option<(RawTagDump, CacheHitTier)> {
        {
            let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
            if let Some(dump) = inner.memory.get(uid_hex) {
                self.memory_hits.fetch_add(1, Ordering::Relaxed);
                return Some((dump, CacheHitTier::Memory));
            }
        }

        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());

        // Another caller may have promoted while we waited for the lock
        if let Some(dump) = inner.memory.get(uid_hex) {
            self.memory_hits.fetch_add(1, Ordering::Relaxed);
            return Some((dump, CacheHitTier::Memory));
        }

        match inner.persistent.get(uid_hex) {
            Ok(Some(stored)) => {
                let age = Utc::now().timestamp() - stored.last_accessed_at;
                if age > self.persistent_ttl_seconds {
                    // Stale row: drop it and report a miss
                    let _ = inner.persistent.remove(uid_hex);
                    self.misses.fetch_add(1, Ordering::Relaxed);
                    return None;
                }
                inner.memory.put(stored.dump.clone());
                let pending = self.drain_evictions(&mut inner);
                drop(inner);
                self.persistent_hits.fetch_add(1, Ordering::Relaxed);
                self.notify_evicted(pending);
                Some((stored.dump, CacheHitTier::Persistent))
            }
            Ok(None) => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
            Err(_) => {
                self.errors.fetch_add(1, Ordering::Relaxed);
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Write-through insert into both tiers
    pub fn put(&self, dump: &RawTagDump, authenticated_sectors: Option<&[usize]>) {
        let pending = {
            let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
            if inner.persistent.put(dump, authenticated_sectors).is_err() {
                self.errors.fetch_add(1, Ordering::Relaxed);
            }
            inner.memory.put(dump.clone());
            self.drain_evictions(&mut inner)
        };
        self.notify_evicted(pending);
    }

    /// Authenticated sector list stored alongside a dump in tier 2
    pub fn authenticated_sectors(&self, uid_hex: &str) -> Option<Vec<usize>> {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        inner
            .persistent
            .authenticated_sectors(uid_hex)
            .unwrap_or_default()
    }

    /// Explicitly bust one UID from both tiers
    pub fn invalidate(&self, uid_hex: &str) -> bool {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        let in_memory = inner.memory.remove(uid_hex);
        let in_persistent = inner.persistent.remove(uid_hex).unwrap_or(false);
        if in_memory || in_persistent {
            self.invalidations.fetch_add(1, Ordering::Relaxed);
            true
        } else {
            false
        }
    }

    /// Drop everything from both tiers
    pub fn clear(&self) {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        inner.memory.clear();
        // Clearing discards eviction write-backs too
        inner
            .evicted
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
        // Every put goes through tier 2, so its row count is the number of
        // entries dropped
        match inner.persistent.clear() {
            Ok(removed) => self.invalidations.fetch_add(removed as u64, Ordering::Relaxed),
            Err(_) => self.errors.fetch_add(1, Ordering::Relaxed),
        };
    }

    /// Remove tier-2 rows older than the configured TTL. Run at startup
    /// and opportunistically afterwards.
    pub fn sweep_expired(&self) -> usize {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        match inner.persistent.sweep_expired(self.persistent_ttl_seconds) {
            Ok(removed) => removed,
            Err(_) => {
                self.errors.fetch_add(1, Ordering::Relaxed);
                0
            }
        }
    }

    pub fn statistics(&self) -> TagCacheStats {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        TagCacheStats {
            memory_hits: self.memory_hits.load(Ordering::Relaxed),
            persistent_hits: self.persistent_hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            invalidations: self.invalidations.load(Ordering::Relaxed),
            memory_entries: inner.memory.len(),
            memory_bytes: inner.memory.used_bytes(),
            persistent_entries: inner.persistent.len().unwrap_or(0),
        }
    }

    /// Process evictions captured during a tier-1 mutation: entries
    /// accessed within the promotion window are written back to tier 2
    /// (refreshing their last access there), older ones are simply dropped
    /// since tier 2 already holds them from the original put. Returns the
    /// evicted UIDs for notification once the lock is released.
    fn drain_evictions(&self, inner: &mut Inner) -> Vec<String> {
        let evicted: Vec<EvictedEntry> = inner
            .evicted
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
            .collect();
        let now = Utc::now().timestamp();
        let mut uids = Vec::with_capacity(evicted.len());
        for entry in evicted {
            if now - entry.last_accessed_at <= self.promotion_window_seconds {
                let sectors = inner
                    .persistent
                    .authenticated_sectors(&entry.uid_hex)
                    .unwrap_or_default();
                if inner
                    .persistent
                    .put(&entry.dump, sectors.as_deref())
                    .is_err()
                {
                    self.errors.fetch_add(1, Ordering::Relaxed);
                }
            }
            uids.push(entry.uid_hex);
        }
        uids
    }

    /// Invoke the user eviction callback with no cache lock held, so a
    /// callback is free to re-enter the cache
    fn notify_evicted(&self, uids: Vec<String>) {
        if uids.is_empty() {
            return;
        }
        let callback = self
            .on_evict
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        if let Some(callback) = callback {
            for uid in uids {
                callback(&uid);
            }
        }
    }
}

impl crate::dependency::AuthStateSource for TagDataCache {
    fn authenticated_sectors(&self, uid_hex: &str) -> Option<Vec<usize>> {
        TagDataCache::authenticated_sectors(self, uid_hex)
    }
}

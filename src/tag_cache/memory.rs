//! In-memory tier: byte-budgeted LRU of raw tag dumps
//!
//! Capacity is an estimated byte footprint, not an entry count, since dump
//! sizes vary between the 768 and 1024 layouts. Recency bookkeeping uses
//! per-entry atomics so a plain hit works through a shared reference and
//! the facade can serve it under its read lock; insertion and eviction
//! need exclusive access. Evictions are reported through a callback before
//! the entry is dropped.

use crate::dump::RawTagDump;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

/// Entry evicted from the memory tier
pub struct EvictedEntry {
    pub uid_hex: String,
    pub dump: RawTagDump,
    /// Unix seconds of the entry's last access
    pub last_accessed_at: i64,
}

/// Callback invoked for every eviction, before the entry is dropped
pub type EvictionCallback = Box<dyn Fn(&EvictedEntry) + Send + Sync>;

struct MemoryEntry {
    dump: RawTagDump,
    last_accessed_at: AtomicI64,
    /// Monotonic recency stamp; smallest = least recently used
    recency: AtomicU64,
}

/// Strict-capacity LRU keyed by canonical UID hex
///
/// Not internally synchronized beyond recency stamps; the cache facade
/// holds this behind its reader/writer lock.
pub struct MemoryTier {
    entries: HashMap<String, MemoryEntry>,
    capacity_bytes: usize,
    used_bytes: usize,
    clock: AtomicU64,
    on_evict: Option<EvictionCallback>,
}

impl MemoryTier {
    pub fn new(capacity_bytes: usize) -> Self {
        Self {
            entries: HashMap::new(),
            capacity_bytes,
            used_bytes: 0,
            clock: AtomicU64::new(0),
            on_evict: None,
        }
    }

    pub fn set_eviction_callback(&mut self, callback: EvictionCallback) {
        self.on_evict = Some(callback);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn used_bytes(&self) -> usize {
        self.used_bytes
    }

    /// Look up without touching recency
    pub fn peek(&self, uid_hex: &str) -> Option<&RawTagDump> {
        self.entries.get(uid_hex).map(|entry| &entry.dump)
    }

    /// Look up and mark as most recently used. Works through a shared
    /// reference so concurrent readers do not serialize on plain hits.
    pub fn get(&self, uid_hex: &str) -> Option<RawTagDump> {
        let entry = self.entries.get(uid_hex)?;
        let stamp = self.clock.fetch_add(1, Ordering::Relaxed) + 1;
        entry.recency.store(stamp, Ordering::Relaxed);
        entry
            .last_accessed_at
            .store(Utc::now().timestamp(), Ordering::Relaxed);
        Some(entry.dump.clone())
    }

    /// Insert or replace; evicts least recently used entries until the
    /// byte budget holds. An entry larger than the whole budget is still
    /// admitted alone (the budget bounds steady state, not a single dump).
    pub fn put(&mut self, dump: RawTagDump) {
        let uid_hex = dump.uid_hex().to_string();
        let size = dump.estimated_size();

        if let Some(old) = self.entries.remove(&uid_hex) {
            self.used_bytes -= old.dump.estimated_size();
        }

        while !self.entries.is_empty() && self.used_bytes + size > self.capacity_bytes {
            self.evict_lru();
        }

        let stamp = self.clock.fetch_add(1, Ordering::Relaxed) + 1;
        self.used_bytes += size;
        self.entries.insert(
            uid_hex,
            MemoryEntry {
                dump,
                last_accessed_at: AtomicI64::new(Utc::now().timestamp()),
                recency: AtomicU64::new(stamp),
            },
        );
    }

    pub fn remove(&mut self, uid_hex: &str) -> bool {
        if let Some(entry) = self.entries.remove(uid_hex) {
            self.used_bytes -= entry.dump.estimated_size();
            true
        } else {
            false
        }
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.used_bytes = 0;
    }

    fn evict_lru(&mut self) {
        let victim = self
            .entries
            .iter()
            .min_by_key(|(_, entry)| entry.recency.load(Ordering::Relaxed))
            .map(|(uid, _)| uid.clone());
        let Some(uid) = victim else { return };
        if let Some(entry) = self.entries.remove(&uid) {
            self.used_bytes -= entry.dump.estimated_size();
            if let Some(callback) = &self.on_evict {
                callback(&EvictedEntry {
                    uid_hex: uid,
                    dump: entry.dump,
                    last_accessed_at: entry.last_accessed_at.load(Ordering::Relaxed),
                });
            }
        }
    }
}

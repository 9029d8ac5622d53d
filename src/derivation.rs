//! Content-addressable derivation cache
//!
//! Maps (source scan, pipeline stage) to a derived value. An entry is fresh
//! only while it is younger than the stage TTL *and* a freshly recomputed
//! dependency set still matches the one captured at generation time; either
//! kind of staleness regenerates, but they are counted separately because
//! they mean different things operationally.
//!
//! Generation is not single-flight: two first accesses racing on the same
//! key may both invoke the generator, last write wins. Generators must be
//! pure functions of (source content, dependency fingerprints), which makes
//! the duplicate invocation observationally idempotent.

use crate::dependency::{DependencySet, DependencyTracker};
use crate::records::{SourceScanRecord, Stage};
use crate::utils;
use anyhow::Result;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

/// Types that can report a rough in-memory footprint for cache statistics
pub trait EstimateSize {
    fn estimated_size(&self) -> usize;
}

impl EstimateSize for crate::records::DerivedRecord {
    fn estimated_size(&self) -> usize {
        crate::records::DerivedRecord::estimated_size(self)
    }
}

/// One cached derivation
#[derive(Debug, Clone)]
pub struct CacheEntry<T> {
    pub key: String,
    pub source_id: String,
    pub stage: Stage,
    pub value: T,
    pub dependencies: DependencySet,
    pub created_at: DateTime<Utc>,
    pub last_accessed_at: DateTime<Utc>,
    pub ttl_seconds: u64,
}

impl<T> CacheEntry<T> {
    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        let age = (now - self.created_at).num_seconds().max(0) as u64;
        age >= self.ttl_seconds
    }
}

/// Counters exposed by [`DerivationCache::statistics`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DerivationCacheStats {
    pub hits: u64,
    pub misses: u64,
    /// Regenerations forced by a dependency mismatch
    pub content_changes: u64,
    /// Regenerations forced by TTL
    pub expirations: u64,
    pub invalidations: u64,
    pub entry_count: usize,
    pub approx_bytes: usize,
}

/// Per-stage TTL configuration, seconds
#[derive(Debug, Clone)]
pub struct StageTtls {
    pub format_metadata: u64,
    pub decrypted_payload: u64,
    pub interpreted: u64,
}

impl StageTtls {
    pub fn for_stage(&self, stage: Stage) -> u64 {
        match stage {
            Stage::FormatMetadata => self.format_metadata,
            Stage::DecryptedPayload => self.decrypted_payload,
            Stage::Interpreted => self.interpreted,
        }
    }
}

impl From<&crate::config::CacheSettings> for StageTtls {
    fn from(settings: &crate::config::CacheSettings) -> Self {
        Self {
            format_metadata: settings.ttl_format_metadata,
            decrypted_payload: settings.ttl_decrypted_payload,
            interpreted: settings.ttl_interpreted,
        }
    }
}

/// Generic cache over the derivation pipeline stages
pub struct DerivationCache<T> {
    entries: RwLock<HashMap<String, CacheEntry<T>>>,
    tracker: Arc<DependencyTracker>,
    ttls: StageTtls,
    hits: AtomicU64,
    misses: AtomicU64,
    content_changes: AtomicU64,
    expirations: AtomicU64,
    invalidations: AtomicU64,
}

impl<T: Clone + EstimateSize> DerivationCache<T> {
    pub fn new(tracker: Arc<DependencyTracker>, ttls: StageTtls) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            tracker,
            ttls,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            content_changes: AtomicU64::new(0),
            expirations: AtomicU64::new(0),
            invalidations: AtomicU64::new(0),
        }
    }

    /// Deterministic cache key for (source, stage)
    pub fn cache_key(source_id: &str, stage: Stage) -> String {
        utils::digest16_parts(&[source_id.as_bytes(), stage.name().as_bytes()])
    }

    /// Return the cached value if fresh, otherwise (re)generate.
    ///
    /// A generator error propagates uncached, so a retry is a clean miss.
    pub fn get_or_generate<F>(
        &self,
        source: &SourceScanRecord,
        stage: Stage,
        generator: F,
    ) -> Result<T>
    where
        F: FnOnce() -> Result<T>,
    {
        let key = Self::cache_key(&source.id, stage);
        let now = Utc::now();
        let current_deps = self.tracker.compute(stage, source);

        let lookup = {
            let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
            match entries.get(&key) {
                None => Lookup::Absent,
                Some(entry) if entry.is_expired(now) => Lookup::Expired,
                Some(entry) if !entry.dependencies.matches(&current_deps) => {
                    Lookup::ContentChanged
                }
                Some(entry) => Lookup::Fresh(entry.value.clone()),
            }
        };

        match lookup {
            Lookup::Fresh(value) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                return Ok(self.touch(&key, value, now));
            }
            Lookup::Absent => self.misses.fetch_add(1, Ordering::Relaxed),
            Lookup::Expired => self.expirations.fetch_add(1, Ordering::Relaxed),
            Lookup::ContentChanged => self.content_changes.fetch_add(1, Ordering::Relaxed),
        };

        // Generate outside the lock. Racing first accesses may both land
        // here; the later insert simply replaces the earlier one.
        let value = generator()?;

        let entry = CacheEntry {
            key: key.clone(),
            source_id: source.id.clone(),
            stage,
            value: value.clone(),
            dependencies: current_deps,
            created_at: now,
            last_accessed_at: now,
            ttl_seconds: self.ttls.for_stage(stage),
        };
        self.entries
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key, entry);
        Ok(value)
    }

    /// Drop all entries for one source across stages
    pub fn invalidate_source(&self, source_id: &str) -> usize {
        self.remove_where(|entry| entry.source_id == source_id)
    }

    /// Drop all entries of one stage across sources
    pub fn invalidate_stage(&self, stage: Stage) -> usize {
        self.remove_where(|entry| entry.stage == stage)
    }

    /// Drop everything
    pub fn clear(&self) -> usize {
        self.remove_where(|_| true)
    }

    /// Sweep TTL-expired entries. Content-change staleness is detected
    /// lazily on access, never swept.
    pub fn cleanup_expired(&self) -> usize {
        let now = Utc::now();
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        let before = entries.len();
        entries.retain(|_, entry| !entry.is_expired(now));
        before - entries.len()
    }

    pub fn statistics(&self) -> DerivationCacheStats {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        let approx_bytes = entries
            .values()
            .map(|entry| {
                entry.value.estimated_size()
                    + entry.dependencies.estimated_size()
                    + entry.key.len()
                    + entry.source_id.len()
            })
            .sum();
        DerivationCacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            content_changes: self.content_changes.load(Ordering::Relaxed),
            expirations: self.expirations.load(Ordering::Relaxed),
            invalidations: self.invalidations.load(Ordering::Relaxed),
            entry_count: entries.len(),
            approx_bytes,
        }
    }

    fn touch(&self, key: &str, value: T, now: DateTime<Utc>) -> T {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        if let Some(entry) = entries.get_mut(key) {
            entry.last_accessed_at = now;
        }
        value
    }

    fn remove_where(&self, predicate: impl Fn(&CacheEntry<T>) -> bool) -> usize {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        let before = entries.len();
        entries.retain(|_, entry| !predicate(entry));
        let removed = before - entries.len();
        self.invalidations.fetch_add(removed as u64, Ordering::Relaxed);
        removed
    }
}

enum Lookup<T> {
    Fresh(T),
    Absent,
    Expired,
    ContentChanged,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::StaticCatalog;
    use crate::config::MemoryConfigStore;
    use crate::format::TagFormat;
    use std::sync::atomic::AtomicUsize;

    impl EstimateSize for String {
        fn estimated_size(&self) -> usize {
            self.len()
        }
    }

    fn ttls(metadata: u64, payload: u64, interpreted: u64) -> StageTtls {
        StageTtls {
            format_metadata: metadata,
            decrypted_payload: payload,
            interpreted,
        }
    }

    fn setup(
        stage_ttls: StageTtls,
    ) -> (Arc<StaticCatalog>, Arc<MemoryConfigStore>, DerivationCache<String>) {
        let catalog = Arc::new(StaticCatalog::new("v1"));
        let config = Arc::new(MemoryConfigStore::new());
        let tracker = Arc::new(DependencyTracker::new(catalog.clone(), config.clone()));
        (catalog, config, DerivationCache::new(tracker, stage_ttls))
    }

    fn source(bytes: &[u8]) -> SourceScanRecord {
        SourceScanRecord::new("04914CCA", bytes.to_vec(), TagFormat::ProprietarySpool)
    }

    #[test]
    fn test_hit_law_generator_runs_once() {
        let (_c, _s, cache) = setup(ttls(3600, 3600, 3600));
        let src = source(b"payload");
        let calls = AtomicUsize::new(0);
        for _ in 0..5 {
            let value = cache
                .get_or_generate(&src, Stage::FormatMetadata, || {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok("derived".to_string())
                })
                .unwrap();
            assert_eq!(value, "derived");
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let stats = cache.statistics();
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.hits, 4);
        assert_eq!(stats.content_changes, 0);
        assert_eq!(stats.entry_count, 1);
    }

    #[test]
    fn test_config_mutation_counts_one_content_change() {
        let (_c, config, cache) = setup(ttls(3600, 3600, 3600));
        let src = source(b"payload");
        let generate = || Ok("v".to_string());
        cache.get_or_generate(&src, Stage::Interpreted, generate).unwrap();
        cache.get_or_generate(&src, Stage::Interpreted, generate).unwrap();
        assert_eq!(cache.statistics().content_changes, 0);

        config.set("interpretation_rules.toml", b"changed".to_vec());
        cache.get_or_generate(&src, Stage::Interpreted, generate).unwrap();
        let stats = cache.statistics();
        assert_eq!(stats.content_changes, 1);

        // Stable again afterwards
        cache.get_or_generate(&src, Stage::Interpreted, generate).unwrap();
        assert_eq!(cache.statistics().content_changes, 1);
    }

    #[test]
    fn test_zero_ttl_expires_every_call() {
        let (_c, _s, cache) = setup(ttls(0, 3600, 3600));
        let src = source(b"payload");
        let calls = AtomicUsize::new(0);
        for i in 1..=3 {
            cache
                .get_or_generate(&src, Stage::FormatMetadata, || {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok("x".to_string())
                })
                .unwrap();
            let stats = cache.statistics();
            // First call is a miss, every later call an expiration
            assert_eq!(stats.misses, 1);
            assert_eq!(stats.expirations, (i - 1) as u64);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_generator_error_propagates_uncached() {
        let (_c, _s, cache) = setup(ttls(3600, 3600, 3600));
        let src = source(b"payload");
        let result = cache.get_or_generate(&src, Stage::FormatMetadata, || {
            anyhow::bail!("generation failed")
        });
        assert!(result.is_err());
        assert_eq!(cache.statistics().entry_count, 0);

        // Retry is a clean miss that can succeed
        cache
            .get_or_generate(&src, Stage::FormatMetadata, || Ok("ok".to_string()))
            .unwrap();
        assert_eq!(cache.statistics().misses, 2);
        assert_eq!(cache.statistics().entry_count, 1);
    }

    #[test]
    fn test_invalidate_source_drops_all_stages() {
        let (_c, _s, cache) = setup(ttls(3600, 3600, 3600));
        let a = source(b"a");
        let b = source(b"b");
        for stage in Stage::ALL {
            cache.get_or_generate(&a, stage, || Ok("a".to_string())).unwrap();
            cache.get_or_generate(&b, stage, || Ok("b".to_string())).unwrap();
        }
        assert_eq!(cache.statistics().entry_count, 6);
        assert_eq!(cache.invalidate_source(&a.id), 3);
        let stats = cache.statistics();
        assert_eq!(stats.entry_count, 3);
        assert_eq!(stats.invalidations, 3);
    }

    #[test]
    fn test_invalidate_stage_drops_all_sources() {
        let (_c, _s, cache) = setup(ttls(3600, 3600, 3600));
        let a = source(b"a");
        let b = source(b"b");
        for stage in Stage::ALL {
            cache.get_or_generate(&a, stage, || Ok("a".to_string())).unwrap();
            cache.get_or_generate(&b, stage, || Ok("b".to_string())).unwrap();
        }
        assert_eq!(cache.invalidate_stage(Stage::Interpreted), 2);
        assert_eq!(cache.statistics().entry_count, 4);
    }

    #[test]
    fn test_cleanup_sweeps_only_expired() {
        let (_c, config, cache) = setup(ttls(0, 3600, 3600));
        let src = source(b"a");
        cache
            .get_or_generate(&src, Stage::FormatMetadata, || Ok("m".to_string()))
            .unwrap();
        cache
            .get_or_generate(&src, Stage::DecryptedPayload, || Ok("p".to_string()))
            .unwrap();
        // Make the payload entry content-stale, not TTL-stale
        config.set("key_schedule.toml", b"new".to_vec());
        assert_eq!(cache.cleanup_expired(), 1);
        // The content-stale entry is still present; staleness stays lazy
        assert_eq!(cache.statistics().entry_count, 1);
    }

    #[test]
    fn test_distinct_keys_per_source_and_stage() {
        let key_a1 = DerivationCache::<String>::cache_key("a", Stage::FormatMetadata);
        let key_a2 = DerivationCache::<String>::cache_key("a", Stage::Interpreted);
        let key_b1 = DerivationCache::<String>::cache_key("b", Stage::FormatMetadata);
        assert_ne!(key_a1, key_a2);
        assert_ne!(key_a1, key_b1);
        assert_eq!(key_a1.len(), 16);
    }
}

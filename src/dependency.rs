//! Dependency fingerprinting for derived records
//!
//! A derived record is only as fresh as everything it was computed from:
//! the source scan bytes, the product catalog, the stage's configuration
//! files, the processing-step implementations and, for format metadata,
//! the recorded authentication outcome for the tag. `DependencySet`
//! captures all of that as short fingerprints; recomputing and comparing
//! one is how the derivation cache detects content-driven staleness
//! independent of TTL.

use crate::catalog::CatalogSource;
use crate::config::ConfigStore;
use crate::records::{SourceScanRecord, Stage};
use crate::utils;
use chrono::{DateTime, Utc};
use lazy_static::lazy_static;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

/// Prefix of the fail-open sentinel used when the catalog is unreachable.
/// The full sentinel is unique per capture, so it never compares equal to
/// a later recomputation: catalog unavailability disables caching for the
/// affected records until the catalog is reachable again.
pub const CATALOG_UNKNOWN_PREFIX: &str = "catalog_unknown_";

/// Live authentication state consulted when fingerprinting the format
/// metadata stage, so a record claiming `authenticated` stays in step
/// with the session outcomes actually on record.
pub trait AuthStateSource: Send + Sync {
    /// Sectors successfully authenticated for a tag, if a session outcome
    /// is on record
    fn authenticated_sectors(&self, uid_hex: &str) -> Option<Vec<usize>>;
}

lazy_static! {
    /// Configuration files whose content each stage depends on
    static ref STAGE_CONFIG_FILES: BTreeMap<Stage, Vec<&'static str>> = {
        let mut m = BTreeMap::new();
        m.insert(Stage::FormatMetadata, vec!["format_markers.toml"]);
        m.insert(Stage::DecryptedPayload, vec!["key_schedule.toml"]);
        m.insert(
            Stage::Interpreted,
            vec!["interpretation_rules.toml", "material_overrides.toml"],
        );
        m
    };

    /// Per-stage processing-step versions. Bumping one is the manual
    /// cache-busting lever when a step's implementation changes.
    static ref STAGE_ALGORITHM_VERSIONS: BTreeMap<Stage, BTreeMap<&'static str, &'static str>> = {
        let mut m = BTreeMap::new();
        let mut fm = BTreeMap::new();
        fm.insert("format_detection", "v2");
        m.insert(Stage::FormatMetadata, fm);
        let mut dp = BTreeMap::new();
        dp.insert("key_derivation", "v1");
        dp.insert("sector_assembly", "v2");
        m.insert(Stage::DecryptedPayload, dp);
        let mut ir = BTreeMap::new();
        ir.insert("interpretation", "v3");
        m.insert(Stage::Interpreted, ir);
        m
    };
}

/// Everything a derived record's content depends on, as fingerprints
///
/// `captured_at` is metadata only and excluded from comparison.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DependencySet {
    pub source_fingerprint: String,
    pub catalog_version: Option<String>,
    pub config_hashes: BTreeMap<String, String>,
    pub external_data_sources: BTreeSet<String>,
    pub algorithm_fingerprints: BTreeMap<String, String>,
    /// Recorded authentication outcome, format metadata stage only
    pub auth_fingerprint: Option<String>,
    #[serde(with = "chrono::serde::ts_seconds")]
    pub captured_at: DateTime<Utc>,
}

impl DependencySet {
    /// Structural comparison of every field except `captured_at`
    pub fn matches(&self, other: &DependencySet) -> bool {
        self.source_fingerprint == other.source_fingerprint
            && self.catalog_version == other.catalog_version
            && self.config_hashes == other.config_hashes
            && self.external_data_sources == other.external_data_sources
            && self.algorithm_fingerprints == other.algorithm_fingerprints
            && self.auth_fingerprint == other.auth_fingerprint
    }

    /// Flattened keys for cache-key composition and invalidation diagnostics
    pub fn dependency_keys(&self) -> Vec<String> {
        let mut keys = Vec::new();
        keys.push(format!("source:{}", self.source_fingerprint));
        if let Some(catalog) = &self.catalog_version {
            keys.push(format!("catalog:{}", catalog));
        }
        if let Some(auth) = &self.auth_fingerprint {
            keys.push(format!("auth:{}", auth));
        }
        for (name, hash) in &self.config_hashes {
            keys.push(format!("config:{}:{}", name, hash));
        }
        for (step, version) in &self.algorithm_fingerprints {
            keys.push(format!("algorithm:{}:{}", step, version));
        }
        keys
    }

    /// Rough in-memory footprint for cache statistics
    pub fn estimated_size(&self) -> usize {
        let strings: usize = self.source_fingerprint.len()
            + self.catalog_version.as_ref().map_or(0, |s| s.len())
            + self.auth_fingerprint.as_ref().map_or(0, |s| s.len())
            + self
                .config_hashes
                .iter()
                .map(|(k, v)| k.len() + v.len())
                .sum::<usize>()
            + self.external_data_sources.iter().map(|s| s.len()).sum::<usize>()
            + self
                .algorithm_fingerprints
                .iter()
                .map(|(k, v)| k.len() + v.len())
                .sum::<usize>();
        strings + std::mem::size_of::<Self>()
    }
}

/// Computes and re-checks dependency sets
pub struct DependencyTracker {
    catalog: Arc<dyn CatalogSource>,
    config: Arc<dyn ConfigStore>,
    auth: Option<Arc<dyn AuthStateSource>>,
}

impl DependencyTracker {
    pub fn new(catalog: Arc<dyn CatalogSource>, config: Arc<dyn ConfigStore>) -> Self {
        Self {
            catalog,
            config,
            auth: None,
        }
    }

    /// Fold recorded authentication outcomes into format metadata
    /// fingerprints
    pub fn with_auth_source(mut self, auth: Arc<dyn AuthStateSource>) -> Self {
        self.auth = Some(auth);
        self
    }

    /// Capture the current dependency set for (stage, source)
    pub fn compute(&self, stage: Stage, source: &SourceScanRecord) -> DependencySet {
        DependencySet {
            source_fingerprint: utils::digest16(&source.raw_bytes),
            catalog_version: self.catalog_version_for(stage),
            config_hashes: self.config_hashes_for(stage),
            external_data_sources: Self::infer_external_sources(source),
            algorithm_fingerprints: algorithm_fingerprints(stage),
            auth_fingerprint: self.auth_fingerprint_for(stage, source),
            captured_at: Utc::now(),
        }
    }

    /// Recompute now and compare against a stored set (timestamp excluded)
    pub fn has_changed(&self, stage: Stage, source: &SourceScanRecord, original: &DependencySet) -> bool {
        !self.compute(stage, source).matches(original)
    }

    /// Only the interpreted stage embeds catalog-sourced fields
    fn catalog_version_for(&self, stage: Stage) -> Option<String> {
        if stage != Stage::Interpreted {
            return None;
        }
        match self.catalog.content_fingerprint() {
            Ok(fingerprint) => Some(format!("catalog_{}", fingerprint)),
            // Fail open: a per-capture-unique sentinel always mismatches on
            // the next comparison, forcing re-derivation until the catalog
            // is reachable again.
            Err(_) => {
                static CAPTURE_SEQ: std::sync::atomic::AtomicU64 =
                    std::sync::atomic::AtomicU64::new(0);
                let seq = CAPTURE_SEQ.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                Some(format!(
                    "{}{}_{}",
                    CATALOG_UNKNOWN_PREFIX,
                    Utc::now().timestamp_nanos_opt().unwrap_or_default(),
                    seq
                ))
            }
        }
    }

    /// Only the format metadata record embeds the tag's authentication
    /// state, so only that stage tracks it
    fn auth_fingerprint_for(&self, stage: Stage, source: &SourceScanRecord) -> Option<String> {
        if stage != Stage::FormatMetadata {
            return None;
        }
        let auth = self.auth.as_ref()?;
        Some(match auth.authenticated_sectors(&source.uid_hex) {
            Some(sectors) => {
                let joined: Vec<String> = sectors.iter().map(|s| s.to_string()).collect();
                format!("sectors_{}", joined.join(","))
            }
            None => "unauthenticated".to_string(),
        })
    }

    fn config_hashes_for(&self, stage: Stage) -> BTreeMap<String, String> {
        let mut hashes = BTreeMap::new();
        if let Some(files) = STAGE_CONFIG_FILES.get(&stage) {
            for name in files {
                let hash = match self.config.read(name) {
                    Some(content) => utils::digest16(&content),
                    None => format!("missing_{}", name),
                };
                hashes.insert(name.to_string(), hash);
            }
        }
        hashes
    }

    /// Symbolic names of external sources implied by the record's own
    /// content; empty when no such fields exist
    fn infer_external_sources(source: &SourceScanRecord) -> BTreeSet<String> {
        use crate::format::TagFormat;
        let mut sources = BTreeSet::new();
        if source.declared_format != TagFormat::Unknown {
            // Catalog-style embedded data (material/color codes)
            sources.insert("product_database".to_string());
        }
        if source
            .raw_bytes
            .windows(4)
            .any(|window| window.eq_ignore_ascii_case(b"http"))
        {
            // Embedded external-spec URL
            sources.insert("component_specs".to_string());
        }
        sources
    }
}

fn algorithm_fingerprints(stage: Stage) -> BTreeMap<String, String> {
    STAGE_ALGORITHM_VERSIONS
        .get(&stage)
        .map(|versions| {
            versions
                .iter()
                .map(|(step, version)| (step.to_string(), version.to_string()))
                .collect()
        })
        .unwrap_or_default()
}

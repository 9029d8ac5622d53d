//! Product catalog fingerprint source
//!
//! The catalog itself lives outside this crate; derivation caching only
//! needs a short fingerprint describing its current content, so that
//! catalog updates invalidate interpreted records.

use anyhow::Result;
use std::sync::RwLock;

/// Source of the catalog content fingerprint
///
/// `content_fingerprint` may fail (catalog unreachable); the dependency
/// tracker turns that into a fail-open sentinel rather than an error.
pub trait CatalogSource: Send + Sync {
    fn content_fingerprint(&self) -> Result<String>;
}

/// In-process catalog source holding a settable fingerprint.
///
/// Used in tests and by embedders that version their catalog externally.
/// Setting the fingerprint to `None` simulates an unreachable catalog.
pub struct StaticCatalog {
    fingerprint: RwLock<Option<String>>,
}

impl StaticCatalog {
    pub fn new(fingerprint: impl Into<String>) -> Self {
        Self {
            fingerprint: RwLock::new(Some(fingerprint.into())),
        }
    }

    pub fn unreachable() -> Self {
        Self {
            fingerprint: RwLock::new(None),
        }
    }

    pub fn set_fingerprint(&self, fingerprint: Option<String>) {
        *self.fingerprint.write().unwrap_or_else(|e| e.into_inner()) = fingerprint;
    }
}

impl CatalogSource for StaticCatalog {
    fn content_fingerprint(&self) -> Result<String> {
        self.fingerprint
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .ok_or_else(|| anyhow::anyhow!("Catalog unreachable"))
    }
}

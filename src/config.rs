//! Crate settings and the tracked configuration file store
//!
//! Two distinct concerns live here:
//! - `CacheSettings`: tunables for the caches, loadable from a TOML file
//!   with serde defaults when the file or a field is absent.
//! - `ConfigStore`: the stage-specific configuration files whose content
//!   hashes feed the dependency tracker. File absence is a trackable state,
//!   not an error.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

/// Cache tunables
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    /// Tier-1 budget in estimated bytes
    pub memory_capacity_bytes: usize,
    /// Tier-2 maximum entry count
    pub persistent_capacity_entries: usize,
    /// Tier-2 entry TTL in seconds
    pub persistent_ttl_seconds: i64,
    /// Window after last access within which a tier-1 eviction is written
    /// back to tier 2
    pub promotion_window_seconds: i64,
    /// Derivation cache TTLs per stage, seconds
    pub ttl_format_metadata: u64,
    pub ttl_decrypted_payload: u64,
    pub ttl_interpreted: u64,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            memory_capacity_bytes: 2 * 1024 * 1024,
            persistent_capacity_entries: 512,
            persistent_ttl_seconds: 30 * 24 * 3600,
            promotion_window_seconds: 300,
            // Structural metadata is cheap to keep; interpreted records
            // depend on fast-changing catalogs, so the dependency check
            // runs on every access.
            ttl_format_metadata: 24 * 3600,
            ttl_decrypted_payload: 3600,
            ttl_interpreted: 0,
        }
    }
}

impl CacheSettings {
    /// Load from a TOML file; a missing file yields the defaults
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read settings: {}", path.display()))?;
        toml::from_str(&content)
            .with_context(|| format!("Failed to parse settings: {}", path.display()))
    }

    /// TTL for one derivation stage
    pub fn stage_ttl(&self, stage: crate::records::Stage) -> u64 {
        use crate::records::Stage;
        match stage {
            Stage::FormatMetadata => self.ttl_format_metadata,
            Stage::DecryptedPayload => self.ttl_decrypted_payload,
            Stage::Interpreted => self.ttl_interpreted,
        }
    }
}

/// Default data directory for persistent state
pub fn default_data_dir() -> PathBuf {
    directories::ProjectDirs::from("io", "spooltag", "spooltag")
        .map(|dirs| dirs.data_local_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Named configuration files tracked by the dependency system
///
/// Readable as raw bytes; `None` means the file is absent, which is a
/// valid, comparable state.
pub trait ConfigStore: Send + Sync {
    fn read(&self, name: &str) -> Option<Vec<u8>>;
}

/// Filesystem-backed config store rooted at one directory
pub struct FsConfigStore {
    root: PathBuf,
}

impl FsConfigStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl ConfigStore for FsConfigStore {
    fn read(&self, name: &str) -> Option<Vec<u8>> {
        std::fs::read(self.root.join(name)).ok()
    }
}

/// In-memory config store for tests and embedded defaults
#[derive(Default)]
pub struct MemoryConfigStore {
    files: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryConfigStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, name: &str, content: Vec<u8>) {
        self.files
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(name.to_string(), content);
    }

    pub fn remove(&self, name: &str) {
        self.files
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(name);
    }
}

impl ConfigStore for MemoryConfigStore {
    fn read(&self, name: &str) -> Option<Vec<u8>> {
        self.files
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
            .cloned()
    }
}

//! Scan records and derived records
//!
//! A `SourceScanRecord` is identified by its content: the same raw bytes
//! with the same declared format always collapse to one record, while every
//! physical tap still gets its own `ScanOccurrence` row pointing at it.

use crate::format::TagFormat;
use crate::utils;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Pipeline stage of a derived record
///
/// Closed enum with exhaustive matching: adding a stage is a compile-time
/// checked change everywhere it is handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Stage {
    /// Structural facts about the tag (type, sector/block counts)
    FormatMetadata,
    /// Decrypted payload bytes plus key/derivation info
    DecryptedPayload,
    /// Domain fields produced by the interpretation rules
    Interpreted,
}

impl Stage {
    pub const ALL: [Stage; 3] = [Stage::FormatMetadata, Stage::DecryptedPayload, Stage::Interpreted];

    /// Stable name used in cache keys and diagnostics
    pub fn name(&self) -> &'static str {
        match self {
            Stage::FormatMetadata => "format_metadata",
            Stage::DecryptedPayload => "decrypted_payload",
            Stage::Interpreted => "interpreted",
        }
    }
}

/// Content-deduplicated source scan
///
/// Identity is the digest of (raw bytes, declared format); the bytes never
/// mutate after creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceScanRecord {
    pub id: String,
    pub uid_hex: String,
    pub raw_bytes: Vec<u8>,
    pub declared_format: TagFormat,
    #[serde(with = "chrono::serde::ts_seconds")]
    pub first_seen_at: DateTime<Utc>,
}

impl SourceScanRecord {
    pub fn new(uid_hex: impl Into<String>, raw_bytes: Vec<u8>, declared_format: TagFormat) -> Self {
        let id = Self::content_id(&raw_bytes, declared_format);
        Self {
            id,
            uid_hex: uid_hex.into(),
            raw_bytes,
            declared_format,
            first_seen_at: Utc::now(),
        }
    }

    /// Deterministic content identity: digest of raw bytes + declared format
    pub fn content_id(raw_bytes: &[u8], declared_format: TagFormat) -> String {
        let format_tag = format!("{:?}", declared_format);
        utils::digest16_parts(&[raw_bytes, format_tag.as_bytes()])
    }
}

/// One physical tap of a tag against a reader
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanOccurrence {
    pub id: String,
    pub source_record_id: String,
    pub device: Option<String>,
    pub location: Option<String>,
    pub method: Option<String>,
    pub note: Option<String>,
    #[serde(with = "chrono::serde::ts_seconds")]
    pub scanned_at: DateTime<Utc>,
}

/// Format metadata stage output
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FormatMetadataRecord {
    pub format: TagFormat,
    pub sector_count: usize,
    pub block_count: usize,
    pub authenticated: bool,
    pub confidence: f64,
    pub manufacturer: Option<String>,
}

/// Decrypted payload stage output
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecryptedPayloadRecord {
    pub payload: Vec<u8>,
    /// Canonical UID the sector keys were derived from
    pub key_source_uid: String,
    /// Name of the key schedule that produced the sector keys
    pub derivation: String,
}

/// Interpreted stage output: domain fields
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InterpretedRecord {
    pub material_id: String,
    pub material_name: String,
    pub color_code: String,
    pub color_name: String,
    pub spec_url: Option<String>,
    /// Version of the interpretation rules that produced these fields
    pub rule_version: String,
}

/// A derived record at one pipeline stage. Immutable once created;
/// identity is (source record id, stage).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DerivedRecord {
    FormatMetadata(FormatMetadataRecord),
    DecryptedPayload(DecryptedPayloadRecord),
    Interpreted(InterpretedRecord),
}

impl DerivedRecord {
    pub fn stage(&self) -> Stage {
        match self {
            DerivedRecord::FormatMetadata(_) => Stage::FormatMetadata,
            DerivedRecord::DecryptedPayload(_) => Stage::DecryptedPayload,
            DerivedRecord::Interpreted(_) => Stage::Interpreted,
        }
    }

    /// Rough in-memory footprint, used for cache statistics
    pub fn estimated_size(&self) -> usize {
        let inner = match self {
            DerivedRecord::FormatMetadata(r) => {
                r.manufacturer.as_ref().map_or(0, |s| s.len())
            }
            DerivedRecord::DecryptedPayload(r) => {
                r.payload.len() + r.key_source_uid.len() + r.derivation.len()
            }
            DerivedRecord::Interpreted(r) => {
                r.material_id.len()
                    + r.material_name.len()
                    + r.color_code.len()
                    + r.color_name.len()
                    + r.spec_url.as_ref().map_or(0, |s| s.len())
                    + r.rule_version.len()
            }
        };
        inner + std::mem::size_of::<Self>()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identical_content_same_id() {
        let a = SourceScanRecord::new("04914CCA", vec![1, 2, 3], TagFormat::ProprietarySpool);
        let b = SourceScanRecord::new("04914CCA", vec![1, 2, 3], TagFormat::ProprietarySpool);
        assert_eq!(a.id, b.id);
    }

    #[test]
    fn test_changed_byte_changes_id() {
        let a = SourceScanRecord::new("04914CCA", vec![1, 2, 3], TagFormat::ProprietarySpool);
        let b = SourceScanRecord::new("04914CCA", vec![1, 2, 4], TagFormat::ProprietarySpool);
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn test_format_is_part_of_identity() {
        let a = SourceScanRecord::new("04914CCA", vec![1, 2, 3], TagFormat::ProprietarySpool);
        let b = SourceScanRecord::new("04914CCA", vec![1, 2, 3], TagFormat::OpenSpool);
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn test_stage_names_are_distinct() {
        let names: std::collections::HashSet<_> =
            Stage::ALL.iter().map(|s| s.name()).collect();
        assert_eq!(names.len(), 3);
    }
}

//! Tag format classification
//!
//! Two-level heuristic: dump size + card technology give a tentative
//! classification, then known ASCII markers at fixed block offsets refine
//! the confidence and attach a manufacturer. Always returns a result.

use crate::dump::{RawTagDump, BLOCK_SIZE, DUMP_SIZE_FULL};
use lazy_static::lazy_static;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Card technology reported by the reader
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TagTechnology {
    /// Contact-based 1K card: 16 sectors, 64 blocks
    MifareClassic1k,
    /// NFC Forum Type 2 tag
    Ntag,
    Unknown,
}

/// Recognized tag data formats
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TagFormat {
    /// Vendor-proprietary spool format on a 1K card
    ProprietarySpool,
    /// Community open spool format
    OpenSpool,
    Unknown,
}

/// Classification result; confidence is in [0, 1]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TagFormatClassification {
    pub format: TagFormat,
    pub technology: TagTechnology,
    pub confidence: f64,
    pub reason: String,
    pub manufacturer: Option<String>,
}

impl TagFormatClassification {
    fn unknown(technology: TagTechnology, reason: impl Into<String>) -> Self {
        Self {
            format: TagFormat::Unknown,
            technology,
            confidence: 0.0,
            reason: reason.into(),
            manufacturer: None,
        }
    }
}

/// Confidence assigned by the size/technology heuristic alone
const SIZE_HEURISTIC_CONFIDENCE: f64 = 0.8;

/// Confidence after a content marker confirms the format
const MARKER_CONFIDENCE: f64 = 0.9;

struct FormatMarker {
    block: usize,
    ascii_prefix: &'static [u8],
    manufacturer: &'static str,
    format: TagFormat,
}

lazy_static! {
    /// Known ASCII markers at fixed block offsets. New entries are data,
    /// not new code paths.
    static ref FORMAT_MARKERS: Vec<FormatMarker> = vec![
        FormatMarker {
            block: 2,
            ascii_prefix: b"GF",
            manufacturer: "Bambu Lab",
            format: TagFormat::ProprietarySpool,
        },
        FormatMarker {
            block: 4,
            ascii_prefix: b"OPENSPOOL",
            manufacturer: "OpenSpool",
            format: TagFormat::OpenSpool,
        },
    ];
}

/// Classify a raw dump
pub fn classify(dump: &RawTagDump, technology: TagTechnology) -> TagFormatClassification {
    // Level 1: size/technology heuristic
    if dump.size() != DUMP_SIZE_FULL || technology != TagTechnology::MifareClassic1k {
        return TagFormatClassification::unknown(
            technology,
            format!(
                "Unrecognized size/technology combination: {} bytes on {:?}",
                dump.size(),
                technology
            ),
        );
    }

    let mut result = TagFormatClassification {
        format: TagFormat::ProprietarySpool,
        technology,
        confidence: SIZE_HEURISTIC_CONFIDENCE,
        reason: "1024-byte dump on a 1K card".to_string(),
        manufacturer: None,
    };

    // Level 2: content markers. Absence never lowers the size baseline.
    for marker in FORMAT_MARKERS.iter() {
        if let Some(block) = dump.block(marker.block) {
            if block.starts_with(marker.ascii_prefix) {
                result.format = marker.format;
                result.confidence = MARKER_CONFIDENCE;
                result.manufacturer = Some(marker.manufacturer.to_string());
                result.reason = format!(
                    "Marker {:?} at block {}",
                    String::from_utf8_lossy(marker.ascii_prefix),
                    marker.block
                );
                break;
            }
        }
    }

    result
}

/// Classify from a partial block map, reconstructing the canonical layout
/// first. Reconstruction zero-fills missing blocks and is lossless for the
/// blocks present.
pub fn classify_block_map(
    uid_hex: &str,
    blocks: &BTreeMap<usize, [u8; BLOCK_SIZE]>,
    technology: TagTechnology,
) -> TagFormatClassification {
    let dump = RawTagDump::from_block_map(uid_hex, blocks, true);
    classify(&dump, technology)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dump::DUMP_SIZE_DATA_ONLY;

    fn full_dump_with_block(block: usize, content: &[u8]) -> RawTagDump {
        let mut bytes = vec![0u8; DUMP_SIZE_FULL];
        let offset = block * BLOCK_SIZE;
        bytes[offset..offset + content.len()].copy_from_slice(content);
        RawTagDump::new("04914CCA", bytes)
    }

    #[test]
    fn test_size_heuristic_alone_gives_point_eight() {
        let dump = RawTagDump::new("04914CCA", vec![0u8; DUMP_SIZE_FULL]);
        let c = classify(&dump, TagTechnology::MifareClassic1k);
        assert_eq!(c.format, TagFormat::ProprietarySpool);
        assert!((c.confidence - 0.8).abs() < f64::EPSILON);
        assert!(c.manufacturer.is_none());
    }

    #[test]
    fn test_marker_raises_confidence_and_sets_manufacturer() {
        let dump = full_dump_with_block(2, b"GFA00");
        let c = classify(&dump, TagTechnology::MifareClassic1k);
        assert!((c.confidence - 0.9).abs() < f64::EPSILON);
        assert_eq!(c.manufacturer.as_deref(), Some("Bambu Lab"));
        assert_eq!(c.format, TagFormat::ProprietarySpool);
    }

    #[test]
    fn test_openspool_marker() {
        let dump = full_dump_with_block(4, b"OPENSPOOL v1");
        let c = classify(&dump, TagTechnology::MifareClassic1k);
        assert_eq!(c.format, TagFormat::OpenSpool);
        assert_eq!(c.manufacturer.as_deref(), Some("OpenSpool"));
    }

    #[test]
    fn test_unknown_size_is_unknown_with_zero_confidence() {
        let dump = RawTagDump::new("04914CCA", vec![0u8; 512]);
        let c = classify(&dump, TagTechnology::MifareClassic1k);
        assert_eq!(c.format, TagFormat::Unknown);
        assert_eq!(c.confidence, 0.0);
        assert!(!c.reason.is_empty());
    }

    #[test]
    fn test_wrong_technology_is_unknown() {
        let dump = RawTagDump::new("04914CCA", vec![0u8; DUMP_SIZE_FULL]);
        let c = classify(&dump, TagTechnology::Ntag);
        assert_eq!(c.format, TagFormat::Unknown);
        assert_eq!(c.confidence, 0.0);
    }

    #[test]
    fn test_data_only_dump_is_unknown() {
        // The size heuristic keys on the full 1024-byte layout
        let dump = RawTagDump::new("04914CCA", vec![0u8; DUMP_SIZE_DATA_ONLY]);
        let c = classify(&dump, TagTechnology::MifareClassic1k);
        assert_eq!(c.format, TagFormat::Unknown);
    }

    #[test]
    fn test_block_map_classification_matches_dump() {
        let mut blocks = BTreeMap::new();
        let mut b2 = [0u8; BLOCK_SIZE];
        b2[..2].copy_from_slice(b"GF");
        blocks.insert(2, b2);
        let c = classify_block_map("04914CCA", &blocks, TagTechnology::MifareClassic1k);
        assert!((c.confidence - 0.9).abs() < f64::EPSILON);
        assert_eq!(c.manufacturer.as_deref(), Some("Bambu Lab"));
    }
}

//! Raw tag dump buffers and block maps
//!
//! A 1K card holds 16 sectors of 4 blocks (3 data + 1 trailer), 16 bytes per
//! block. Two canonical dump sizes exist: 768 bytes (data blocks only, in
//! sector order) and 1024 bytes (all 64 blocks including trailers). Block
//! maps always use absolute block indices (sector * 4 + offset) so both
//! layouts address a block the same way.

use crate::utils;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Bytes per block
pub const BLOCK_SIZE: usize = 16;

/// Blocks per sector (3 data + 1 trailer)
pub const BLOCKS_PER_SECTOR: usize = 4;

/// Data blocks per sector
pub const DATA_BLOCKS_PER_SECTOR: usize = 3;

/// Total blocks on a 1K card
pub const TOTAL_BLOCKS: usize = 64;

/// Dump size with data blocks only: 16 sectors x 3 blocks x 16 bytes
pub const DUMP_SIZE_DATA_ONLY: usize = 768;

/// Dump size with trailer blocks included
pub const DUMP_SIZE_FULL: usize = 1024;

/// Whether `size` is one of the two canonical dump sizes
pub fn is_canonical_size(size: usize) -> bool {
    size == DUMP_SIZE_DATA_ONLY || size == DUMP_SIZE_FULL
}

/// Whether an absolute block index addresses a sector trailer
pub fn is_trailer_block(block: usize) -> bool {
    block % BLOCKS_PER_SECTOR == BLOCKS_PER_SECTOR - 1
}

/// Immutable raw dump of a tag's memory
///
/// The byte buffer never mutates after construction; all views are derived.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawTagDump {
    uid_hex: String,
    bytes: Vec<u8>,
}

impl RawTagDump {
    /// Wrap a raw byte buffer. Any size is representable; non-canonical
    /// sizes classify as UNKNOWN downstream rather than erroring here.
    pub fn new(uid_hex: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            uid_hex: uid_hex.into(),
            bytes,
        }
    }

    /// Reconstruct a canonical dump from a partial block map.
    ///
    /// Blocks present in the map are copied verbatim; missing blocks are
    /// zero-filled. `include_trailers` selects the 1024-byte layout.
    /// Deterministic, and lossless for every block that is present.
    pub fn from_block_map(
        uid_hex: impl Into<String>,
        blocks: &BTreeMap<usize, [u8; BLOCK_SIZE]>,
        include_trailers: bool,
    ) -> Self {
        let size = if include_trailers {
            DUMP_SIZE_FULL
        } else {
            DUMP_SIZE_DATA_ONLY
        };
        let mut bytes = vec![0u8; size];
        for (&block, data) in blocks {
            if block >= TOTAL_BLOCKS {
                continue;
            }
            if !include_trailers && is_trailer_block(block) {
                continue;
            }
            if let Some(offset) = Self::offset_for(block, include_trailers) {
                bytes[offset..offset + BLOCK_SIZE].copy_from_slice(data);
            }
        }
        Self {
            uid_hex: uid_hex.into(),
            bytes,
        }
    }

    pub fn uid_hex(&self) -> &str {
        &self.uid_hex
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn size(&self) -> usize {
        self.bytes.len()
    }

    /// Whether this buffer has one of the two canonical sizes
    pub fn is_canonical(&self) -> bool {
        is_canonical_size(self.bytes.len())
    }

    /// Whether the layout includes trailer blocks
    pub fn has_trailers(&self) -> bool {
        self.bytes.len() == DUMP_SIZE_FULL
    }

    /// Raw bytes of one block by absolute index, if the layout contains it
    pub fn block(&self, block: usize) -> Option<&[u8]> {
        if !self.is_canonical() || block >= TOTAL_BLOCKS {
            return None;
        }
        let include_trailers = self.has_trailers();
        if !include_trailers && is_trailer_block(block) {
            return None;
        }
        let offset = Self::offset_for(block, include_trailers)?;
        self.bytes.get(offset..offset + BLOCK_SIZE)
    }

    /// Absolute block index -> 16-byte-hex map over every block the layout
    /// contains. Returns an empty map for non-canonical buffers.
    pub fn block_map(&self) -> BTreeMap<usize, String> {
        let mut map = BTreeMap::new();
        if !self.is_canonical() {
            return map;
        }
        for block in 0..TOTAL_BLOCKS {
            if let Some(data) = self.block(block) {
                map.insert(block, utils::to_hex_upper(data));
            }
        }
        map
    }

    /// Estimated memory footprint, used for cache byte budgeting
    pub fn estimated_size(&self) -> usize {
        self.bytes.len() + self.uid_hex.len() + std::mem::size_of::<Self>()
    }

    fn offset_for(block: usize, include_trailers: bool) -> Option<usize> {
        if include_trailers {
            Some(block * BLOCK_SIZE)
        } else {
            if is_trailer_block(block) {
                return None;
            }
            let sector = block / BLOCKS_PER_SECTOR;
            let data_index = block % BLOCKS_PER_SECTOR;
            Some((sector * DATA_BLOCKS_PER_SECTOR + data_index) * BLOCK_SIZE)
        }
    }
}

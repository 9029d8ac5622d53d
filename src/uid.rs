//! Tag UID handling
//!
//! MIFARE-family tags carry either a 4-byte (single-size) or 7-byte
//! (double-size) UID. The canonical textual form everywhere in this crate
//! is uppercase hex with no separators.

use crate::utils;
use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// UID lengths accepted by the key derivation engine
pub const VALID_UID_LENGTHS: [usize; 2] = [4, 7];

/// Raw tag UID (4 or 7 bytes)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TagUid {
    bytes: Vec<u8>,
}

impl TagUid {
    /// Wrap raw UID bytes
    ///
    /// Any length is representable so that callers can pass through what the
    /// reader reported; consumers that require a valid length (key
    /// derivation) degrade gracefully instead of erroring.
    pub fn new(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }

    /// Parse from hex, e.g. "04914CCA" or "04112233445566"
    pub fn from_hex(s: &str) -> Result<Self> {
        let bytes = utils::from_hex(s)?;
        if !VALID_UID_LENGTHS.contains(&bytes.len()) {
            bail!("UID must be 4 or 7 bytes, got {}", bytes.len());
        }
        Ok(Self { bytes })
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Whether this UID has a length the key schedule accepts
    pub fn is_valid_length(&self) -> bool {
        VALID_UID_LENGTHS.contains(&self.bytes.len())
    }

    /// Canonical uppercase-hex form
    pub fn canonical(&self) -> String {
        utils::to_hex_upper(&self.bytes)
    }
}

impl fmt::Display for TagUid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.canonical())
    }
}

//! Shared helpers: hex encoding and content fingerprints

use anyhow::{bail, Result};

/// Encode bytes as uppercase hex
pub fn to_hex_upper(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        out.push_str(&format!("{:02X}", b));
    }
    out
}

/// Encode bytes as lowercase hex
pub fn to_hex_lower(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        out.push_str(&format!("{:02x}", b));
    }
    out
}

/// Decode a hex string (case-insensitive) into bytes
pub fn from_hex(s: &str) -> Result<Vec<u8>> {
    let s = s.trim();
    if s.len() % 2 != 0 {
        bail!("Hex string has odd length: {}", s.len());
    }
    let chars: Vec<char> = s.chars().collect();
    let mut out = Vec::with_capacity(s.len() / 2);
    for pair in chars.chunks(2) {
        let hi = pair[0]
            .to_digit(16)
            .ok_or_else(|| anyhow::anyhow!("Invalid hex character: {}", pair[0]))?;
        let lo = pair[1]
            .to_digit(16)
            .ok_or_else(|| anyhow::anyhow!("Invalid hex character: {}", pair[1]))?;
        out.push(((hi << 4) | lo) as u8);
    }
    Ok(out)
}

/// Short content fingerprint: first 16 hex chars of the blake3 digest
///
/// Used for cache keys, source record ids and dependency fingerprints.
pub fn digest16(content: &[u8]) -> String {
    let hash = blake3::hash(content);
    hash.to_hex().as_str()[..16].to_string()
}

/// Fingerprint over multiple parts, length-prefixed so that
/// ("ab", "c") and ("a", "bc") never collide
pub fn digest16_parts(parts: &[&[u8]]) -> String {
    let mut hasher = blake3::Hasher::new();
    for part in parts {
        hasher.update(&(part.len() as u64).to_le_bytes());
        hasher.update(part);
    }
    hasher.finalize().to_hex().as_str()[..16].to_string()
}

//! Sector key derivation
//!
//! Derives the 16 per-sector authentication keys from a tag UID using HKDF
//! (RFC 5869) over HMAC-SHA256. The schedule is pure and stateless: the same
//! UID always yields the same keys, so keys can be re-derived at any time
//! without re-scanning the tag.

use crate::uid::TagUid;
use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Number of sectors on a 1K card
pub const SECTOR_COUNT: usize = 16;

/// Bytes per sector key
pub const KEY_LENGTH: usize = 6;

/// HKDF extract salt (vendor constant)
const HKDF_SALT: [u8; 16] = [
    0x9a, 0x75, 0x9c, 0xf2, 0xc4, 0xf7, 0xca, 0xff, 0x22, 0x2c, 0xb9, 0x76, 0x9b, 0x41, 0xbc,
    0x96,
];

/// HKDF expand info string (vendor constant)
const HKDF_INFO: &[u8] = b"RFID-A";

/// Total key material needed: 16 sectors x 6 bytes
const OKM_LENGTH: usize = SECTOR_COUNT * KEY_LENGTH;

/// A full set of sector keys: exactly 16 entries, or empty for an
/// underivable UID. Never partially populated.
pub type SectorKeys = Vec<[u8; KEY_LENGTH]>;

/// Derive the 16 sector keys for a tag UID.
///
/// Returns an empty vec for any UID whose length is not 4 or 7 bytes;
/// invalid input is a degenerate result here, not an error.
pub fn derive_sector_keys(uid: &TagUid) -> SectorKeys {
    if !uid.is_valid_length() {
        return Vec::new();
    }

    let okm = hkdf_sha256(&HKDF_SALT, uid.as_bytes(), HKDF_INFO, OKM_LENGTH);

    okm.chunks_exact(KEY_LENGTH)
        .map(|chunk| {
            let mut key = [0u8; KEY_LENGTH];
            key.copy_from_slice(chunk);
            key
        })
        .collect()
}

/// HKDF-SHA256 (RFC 5869): Extract then Expand to `length` bytes
fn hkdf_sha256(salt: &[u8], ikm: &[u8], info: &[u8], length: usize) -> Vec<u8> {
    // Extract: PRK = HMAC(salt, IKM)
    let prk = hmac_sha256(salt, ikm);

    // Expand: T(i) = HMAC(PRK, T(i-1) || info || i), concatenated until
    // enough output key material has been produced
    let mut okm = Vec::with_capacity(length + 32);
    let mut previous: Vec<u8> = Vec::new();
    let mut counter: u8 = 1;
    while okm.len() < length {
        let mut message = Vec::with_capacity(previous.len() + info.len() + 1);
        message.extend_from_slice(&previous);
        message.extend_from_slice(info);
        message.push(counter);
        previous = hmac_sha256(&prk, &message);
        okm.extend_from_slice(&previous);
        counter = counter.wrapping_add(1);
    }
    okm.truncate(length);
    okm
}

fn hmac_sha256(key: &[u8], message: &[u8]) -> Vec<u8> {
    // HMAC-SHA256 accepts keys of any length
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accepts any key length");
    mac.update(message);
    mac.finalize().into_bytes().to_vec()
}

//! Interpretation of decrypted tag payloads into domain fields
//!
//! Material and color naming is a single lookup table keyed by
//! (material id, color code) with a default fallback: new spool variants
//! are new table rows, not new code paths.

use crate::dump::RawTagDump;
use crate::records::InterpretedRecord;
use crate::utils;
use lazy_static::lazy_static;
use std::collections::HashMap;

/// Version of the interpretation rules embedded in every record produced
/// here. Bumped when the rules change so cached records regenerate.
pub const RULE_VERSION: &str = "v3";

/// Block carrying the ASCII material id
const MATERIAL_BLOCK: usize = 2;

/// Block whose leading 4 bytes carry the RGBA color code
const COLOR_BLOCK: usize = 5;

lazy_static! {
    /// (material id, color code) -> (material name, color name)
    static ref MATERIAL_COLORS: HashMap<(&'static str, &'static str), (&'static str, &'static str)> = {
        let mut m = HashMap::new();
        m.insert(("GFA00", "FF6A13FF"), ("PLA Basic", "Orange"));
        m.insert(("GFA00", "FFFFFFFF"), ("PLA Basic", "White"));
        m.insert(("GFA00", "000000FF"), ("PLA Basic", "Black"));
        m.insert(("GFA01", "FFFFFFFF"), ("PLA Matte", "Ivory White"));
        m.insert(("GFB00", "000000FF"), ("ABS", "Black"));
        m.insert(("GFG00", "00AE42FF"), ("PETG Basic", "Green"));
        m.insert(("GFL00", "D3B7A7FF"), ("PLA-CF", "Clay"));
        m
    };

    /// Material family names used when the exact color row is absent
    static ref MATERIAL_FAMILIES: HashMap<&'static str, &'static str> = {
        let mut m = HashMap::new();
        m.insert("GFA00", "PLA Basic");
        m.insert("GFA01", "PLA Matte");
        m.insert("GFB00", "ABS");
        m.insert("GFG00", "PETG Basic");
        m.insert("GFL00", "PLA-CF");
        m
    };
}

/// Interpret a dump's payload into domain fields.
///
/// Unknown materials and colors fall back to descriptive defaults rather
/// than failing: the record stays usable and the table grows later.
pub fn interpret(dump: &RawTagDump) -> InterpretedRecord {
    let material_id = read_material_id(dump);
    let color_code = read_color_code(dump);

    let (material_name, color_name) = match MATERIAL_COLORS
        .get(&(material_id.as_str(), color_code.as_str()))
    {
        Some((material, color)) => (material.to_string(), color.to_string()),
        None => {
            let material = MATERIAL_FAMILIES
                .get(material_id.as_str())
                .map(|name| name.to_string())
                .unwrap_or_else(|| format!("Unknown material ({})", material_id));
            (material, format!("Color #{}", color_code))
        }
    };

    InterpretedRecord {
        material_id,
        material_name,
        color_code,
        color_name,
        spec_url: find_spec_url(dump.bytes()),
        rule_version: RULE_VERSION.to_string(),
    }
}

/// ASCII material id from the material block, stopped at the first
/// non-printable byte
fn read_material_id(dump: &RawTagDump) -> String {
    let Some(block) = dump.block(MATERIAL_BLOCK) else {
        return String::new();
    };
    block
        .iter()
        .take_while(|&&b| (0x20..0x7f).contains(&b))
        .map(|&b| b as char)
        .collect()
}

/// Uppercase-hex RGBA color code from the color block
fn read_color_code(dump: &RawTagDump) -> String {
    match dump.block(COLOR_BLOCK) {
        Some(block) => utils::to_hex_upper(&block[..4]),
        None => String::new(),
    }
}

/// First embedded http(s) URL in the payload, if any
fn find_spec_url(bytes: &[u8]) -> Option<String> {
    let start = bytes
        .windows(4)
        .position(|window| window.eq_ignore_ascii_case(b"http"))?;
    let url: String = bytes[start..]
        .iter()
        .take_while(|&&b| (0x21..0x7f).contains(&b))
        .map(|&b| b as char)
        .collect();
    if url.len() > 4 {
        Some(url)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dump::{BLOCK_SIZE, DUMP_SIZE_FULL};

    fn dump_with(material: &[u8], color: [u8; 4]) -> RawTagDump {
        let mut bytes = vec![0u8; DUMP_SIZE_FULL];
        bytes[MATERIAL_BLOCK * BLOCK_SIZE..MATERIAL_BLOCK * BLOCK_SIZE + material.len()]
            .copy_from_slice(material);
        bytes[COLOR_BLOCK * BLOCK_SIZE..COLOR_BLOCK * BLOCK_SIZE + 4].copy_from_slice(&color);
        RawTagDump::new("04914CCA", bytes)
    }

    #[test]
    fn test_known_material_and_color() {
        let record = interpret(&dump_with(b"GFA00", [0xFF, 0x6A, 0x13, 0xFF]));
        assert_eq!(record.material_id, "GFA00");
        assert_eq!(record.material_name, "PLA Basic");
        assert_eq!(record.color_code, "FF6A13FF");
        assert_eq!(record.color_name, "Orange");
        assert_eq!(record.rule_version, RULE_VERSION);
    }

    #[test]
    fn test_known_material_unknown_color_falls_back() {
        let record = interpret(&dump_with(b"GFB00", [0x12, 0x34, 0x56, 0xFF]));
        assert_eq!(record.material_name, "ABS");
        assert_eq!(record.color_name, "Color #123456FF");
    }

    #[test]
    fn test_unknown_material_falls_back() {
        let record = interpret(&dump_with(b"ZZZ99", [0, 0, 0, 0]));
        assert_eq!(record.material_name, "Unknown material (ZZZ99)");
    }

    #[test]
    fn test_spec_url_extracted() {
        let mut dump = dump_with(b"GFA00", [0xFF, 0xFF, 0xFF, 0xFF]);
        let mut bytes = dump.bytes().to_vec();
        let url = b"https://specs.example/gfa00";
        bytes[400..400 + url.len()].copy_from_slice(url);
        dump = RawTagDump::new("04914CCA", bytes);
        let record = interpret(&dump);
        assert_eq!(record.spec_url.as_deref(), Some("https://specs.example/gfa00"));
    }

    #[test]
    fn test_no_url_is_none() {
        let record = interpret(&dump_with(b"GFA00", [0xFF, 0xFF, 0xFF, 0xFF]));
        assert!(record.spec_url.is_none());
    }
}

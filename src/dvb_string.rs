//! DVB character-set decoding for NIT/SDT/EIT text fields (ETSI EN 300 468 Annex A).
//!
//! A DVB string optionally begins with a control byte (or control-byte sequence) selecting a
//! character table other than the default (ISO/IEC 6937). This module recognizes the common
//! cases: UTF-8 (`0x15`), an explicit ISO/IEC 8859-`n` table (`0x10 0x00 n`), and falls back to
//! treating the default table as Latin-1, which is an acceptable approximation of ISO/IEC 6937
//! for the ASCII-range text that dominates real-world SDT/EIT streams.

/// Decodes one DVB-encoded string field into a Rust [`String`], replacing anything that doesn't
/// decode cleanly with the Unicode replacement character.
pub fn decode(data: &[u8]) -> String {
    if data.is_empty() {
        return String::new();
    }
    match data[0] {
        0x15 => String::from_utf8_lossy(&data[1..]).into_owned(),
        0x10 if data.len() >= 3 => {
            // 0x10 0x00 <table>: ISO/IEC 8859-<table>. We only special-case table 1 (Latin-1,
            // identical to our default fallback) and otherwise degrade gracefully to Latin-1.
            data[3..].iter().map(|&b| b as char).collect()
        }
        0x00..=0x1f => {
            // Other single-byte control codes (Cyrillic/Arabic/Greek/Hebrew tables, or the
            // reserved 0x0c-0x1f range): not modeled, strip the selector and decode the rest as
            // Latin-1 so callers still get readable ASCII where the source text was ASCII.
            data[1..].iter().map(|&b| b as char).collect()
        }
        _ => data.iter().map(|&b| b as char).collect(),
    }
}

/// Encodes `s` as a DVB string using the UTF-8 encoding selector (`0x15`), the simplest
/// round-trippable choice for the generator side.
pub fn encode(s: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(1 + s.len());
    out.push(0x15);
    out.extend_from_slice(s.as_bytes());
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_utf8_selector() {
        let encoded = encode("BBC One");
        assert_eq!(decode(&encoded), "BBC One");
    }

    #[test]
    fn empty_string_decodes_to_empty() {
        assert_eq!(decode(&[]), "");
    }

    #[test]
    fn ascii_without_selector_passes_through() {
        assert_eq!(decode(b"Plain"), "Plain");
    }
}

//! Tag/length descriptor records shared by PMT, NIT, SDT, EIT and CAT (spec.md §4.2).

use crate::error::WireResult;
use crate::slice_reader::SliceReader;
use smallvec::SmallVec;

/// One raw tag/length/data descriptor record.
///
/// `parse_descs` (see [`parse_descriptor_loop`]) recognizes a non-exhaustive set of tags into
/// typed attributes on the caller's flow definition; unknown tags are copied verbatim here under
/// `ts_flow.descriptors`, matching spec.md §4.2.
#[derive(Debug, Clone, PartialEq)]
pub struct Descriptor {
    /// Descriptor tag, first byte of the record.
    pub tag: u8,
    /// Descriptor payload (excludes the tag/length prefix).
    pub data: SmallVec<[u8; 8]>,
}

impl Descriptor {
    /// Parses one `tag, length, data[length]` record.
    pub fn new_from_reader(reader: &mut SliceReader) -> WireResult<Self> {
        let tag_len = reader.read_array_ref::<2>()?;
        let mut data = SmallVec::<[u8; 8]>::new();
        data.extend_from_slice(reader.read(tag_len[1] as usize)?);
        Ok(Self {
            tag: tag_len[0],
            data,
        })
    }

    /// Serializes the descriptor back to its wire form.
    pub fn write_to(&self, out: &mut Vec<u8>) {
        out.push(self.tag);
        out.push(self.data.len() as u8);
        out.extend_from_slice(&self.data);
    }

    /// Builds a descriptor with an explicit tag and payload.
    pub fn new(tag: u8, data: &[u8]) -> Self {
        Self {
            tag,
            data: SmallVec::from_slice(data),
        }
    }
}

/// Reads every descriptor until `reader` is exhausted. This is the `parse_descs` sub-routine of
/// spec.md §4.2: it does not itself interpret tags, it only walks the tag/length chain.
pub fn parse_descriptor_loop(reader: &mut SliceReader) -> WireResult<Vec<Descriptor>> {
    let mut descs = Vec::new();
    while reader.remaining_len() > 0 {
        descs.push(Descriptor::new_from_reader(reader)?);
    }
    Ok(descs)
}

/// Serializes a list of descriptors back to wire form.
pub fn build_descriptor_loop(descs: &[Descriptor]) -> Vec<u8> {
    let mut out = Vec::new();
    for d in descs {
        d.write_to(&mut out);
    }
    out
}

/// Well-known descriptor tags recognized by §4.2. Not exhaustive — any other tag is retained
/// verbatim as an opaque [`Descriptor`].
pub mod tag {
    /// ISO 639 language descriptor.
    pub const LANGUAGE: u8 = 0x0a;
    /// Conditional access descriptor (CAT/PMT).
    pub const CONDITIONAL_ACCESS: u8 = 0x09;
    /// Registration descriptor (used for Opus, SMPTE 302M, ...).
    pub const REGISTRATION: u8 = 0x05;
    /// Component descriptor (DVB).
    pub const COMPONENT: u8 = 0x50;
    /// Teletext descriptor (DVB).
    pub const TELETEXT: u8 = 0x56;
    /// DVB subtitling descriptor.
    pub const DVB_SUBTITLE: u8 = 0x59;
    /// AC-3 descriptor.
    pub const AC3: u8 = 0x6a;
    /// Enhanced AC-3 (E-AC-3) descriptor.
    pub const EAC3: u8 = 0x7a;
    /// DTS descriptor.
    pub const DTS: u8 = 0x7b;
    /// AAC descriptor.
    pub const AAC: u8 = 0x7c;
    /// Network name descriptor (NIT).
    pub const NETWORK_NAME: u8 = 0x40;
    /// Service descriptor (SDT).
    pub const SERVICE: u8 = 0x48;
    /// Short event descriptor (EIT).
    pub const SHORT_EVENT: u8 = 0x4d;
    /// Private data specifier, used to scope registration extensions (e.g. BISS-CA 0x2610).
    pub const PRIVATE_DATA_SPECIFIER: u8 = 0x5f;
}

/// Parsed ISO 639 language descriptor entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LanguageEntry {
    /// 3-character ISO 639-2 language code.
    pub code: [u8; 3],
    /// Audio type byte (0 = undefined, 1 = clean effects, 2 = hearing impaired, 3 = visual
    /// impaired commentary).
    pub audio_type: u8,
}

/// Decodes a `tag::LANGUAGE` descriptor's payload into its (possibly multiple) language entries.
pub fn parse_language_descriptor(data: &[u8]) -> Vec<LanguageEntry> {
    data.chunks_exact(4)
        .map(|c| LanguageEntry {
            code: [c[0], c[1], c[2]],
            audio_type: c[3],
        })
        .collect()
}

/// Builds a `tag::LANGUAGE` descriptor payload from one or more entries.
pub fn build_language_descriptor(entries: &[LanguageEntry]) -> Vec<u8> {
    let mut out = Vec::with_capacity(entries.len() * 4);
    for e in entries {
        out.extend_from_slice(&e.code);
        out.push(e.audio_type);
    }
    out
}

/// Parsed conditional-access descriptor (`tag::CONDITIONAL_ACCESS`, CAT/PMT).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConditionalAccessEntry {
    /// CA system id.
    pub ca_system_id: u16,
    /// PID carrying ECM/EMM sections for this CA system.
    pub ca_pid: u16,
    /// Private data following the fixed fields (e.g. BISS-CA ESID/ONID vector, tag 0x80).
    pub private_data: Vec<u8>,
}

/// CA system id reserved for BISS-CA (spec.md §4.2).
pub const CA_SYSTEM_ID_BISS: u16 = 0x2610;

/// Decodes a `tag::CONDITIONAL_ACCESS` descriptor payload.
pub fn parse_conditional_access_descriptor(data: &[u8]) -> Option<ConditionalAccessEntry> {
    if data.len() < 4 {
        return None;
    }
    let ca_system_id = u16::from_be_bytes([data[0], data[1]]);
    let ca_pid = u16::from_be_bytes([data[2], data[3]]) & 0x1fff;
    Some(ConditionalAccessEntry {
        ca_system_id,
        ca_pid,
        private_data: data[4..].to_vec(),
    })
}

/// Builds a `tag::CONDITIONAL_ACCESS` descriptor payload.
pub fn build_conditional_access_descriptor(entry: &ConditionalAccessEntry) -> Vec<u8> {
    let mut out = Vec::with_capacity(4 + entry.private_data.len());
    out.extend_from_slice(&entry.ca_system_id.to_be_bytes());
    out.extend_from_slice(&(entry.ca_pid & 0x1fff).to_be_bytes());
    out.extend_from_slice(&entry.private_data);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_descriptor_loop_walks_tag_length_chain() {
        let data = [0x0au8, 0x04, b'e', b'n', b'g', 0x00, 0x05, 0x01, 0xaa];
        let mut reader = SliceReader::new(&data);
        let descs = parse_descriptor_loop(&mut reader).unwrap();
        assert_eq!(descs.len(), 2);
        assert_eq!(descs[0].tag, 0x0a);
        assert_eq!(descs[1].tag, 0x05);
        assert_eq!(&descs[1].data[..], &[0xaa]);
    }

    #[test]
    fn language_descriptor_round_trips() {
        let entries = vec![LanguageEntry {
            code: *b"eng",
            audio_type: 0,
        }];
        let payload = build_language_descriptor(&entries);
        assert_eq!(parse_language_descriptor(&payload), entries);
    }

    #[test]
    fn conditional_access_descriptor_masks_reserved_pid_bits() {
        let entry = ConditionalAccessEntry {
            ca_system_id: CA_SYSTEM_ID_BISS,
            ca_pid: 0x0123,
            private_data: vec![0x80, 0x02, 0xaa, 0xbb],
        };
        let payload = build_conditional_access_descriptor(&entry);
        let parsed = parse_conditional_access_descriptor(&payload).unwrap();
        assert_eq!(parsed, entry);
    }
}

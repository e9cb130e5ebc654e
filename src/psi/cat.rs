//! Conditional Access Table: decoder and generator (spec.md §4.2, §4.6).

use crate::error::MuxResult;
use crate::psi::descriptors::{self, ConditionalAccessEntry, Descriptor};
use crate::psi::{build_section, parse_section, SectionAssembler};
use crate::slice_reader::SliceReader;
use bytes::Bytes;

/// `table_id` for the CAT.
pub const TABLE_ID: u8 = 0x01;

/// Decoded Conditional Access Table: the set of CA systems signaled for the whole multiplex
/// (EMM PIDs), as opposed to a PMT's per-program ECM signaling.
#[derive(Debug, Clone, PartialEq)]
pub struct Cat {
    /// Every recognized `tag::CONDITIONAL_ACCESS` descriptor in the table, one per CA system.
    pub entries: Vec<ConditionalAccessEntry>,
    /// Any other descriptor present, retained verbatim.
    pub other_descriptors: Vec<Descriptor>,
}

fn decode_sections(sections: &[Bytes]) -> MuxResult<Cat> {
    let raw = &sections[0];
    let (_, _syntax, body) = parse_section(raw)?;
    let mut reader = SliceReader::new(body);
    let descs = descriptors::parse_descriptor_loop(&mut reader)?;

    let mut entries = Vec::new();
    let mut other_descriptors = Vec::new();
    for d in descs {
        if d.tag == descriptors::tag::CONDITIONAL_ACCESS {
            if let Some(entry) = descriptors::parse_conditional_access_descriptor(&d.data) {
                entries.push(entry);
                continue;
            }
        }
        other_descriptors.push(d);
    }

    Ok(Cat {
        entries,
        other_descriptors,
    })
}

/// CAT section decoder.
#[derive(Debug, Default)]
pub struct CatDecoder {
    assembler: SectionAssembler,
}

impl CatDecoder {
    /// Creates an empty decoder.
    pub fn new() -> Self {
        Self {
            assembler: SectionAssembler::new(false),
        }
    }

    /// Feeds one raw section (PID 1).
    pub fn push_section(&mut self, raw: Bytes) -> MuxResult<Option<Cat>> {
        super::feed_section(&mut self.assembler, raw, decode_sections)
    }
}

/// Generates the (single) CAT section. The CAT's `table_id_extension` is reserved and always
/// encoded as all-ones, per ISO/IEC 13818-1 §2.4.4.7.
pub fn generate(entries: &[ConditionalAccessEntry], other_descriptors: &[Descriptor], version: u8) -> Bytes {
    let mut descs: Vec<Descriptor> = entries
        .iter()
        .map(|e| Descriptor::new(descriptors::tag::CONDITIONAL_ACCESS, &descriptors::build_conditional_access_descriptor(e)))
        .collect();
    descs.extend(other_descriptors.iter().cloned());
    let body = descriptors::build_descriptor_loop(&descs);
    build_section(TABLE_ID, 0xffff, version, 0, 0, &body)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_generate_and_decode() {
        let entries = vec![ConditionalAccessEntry {
            ca_system_id: descriptors::CA_SYSTEM_ID_BISS,
            ca_pid: 0x1234,
            private_data: Vec::new(),
        }];
        let section = generate(&entries, &[], 0);
        let mut decoder = CatDecoder::new();
        let cat = decoder.push_section(section).unwrap().expect("should complete");
        assert_eq!(cat.entries, entries);
    }

    #[test]
    fn unrecognized_tag_is_kept_verbatim() {
        let other = vec![Descriptor::new(0x7f, &[1, 2, 3])];
        let section = generate(&[], &other, 0);
        let mut decoder = CatDecoder::new();
        let cat = decoder.push_section(section).unwrap().unwrap();
        assert_eq!(cat.other_descriptors.len(), 1);
        assert_eq!(cat.other_descriptors[0].tag, 0x7f);
    }
}

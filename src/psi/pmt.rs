//! Program Map Table: decoder and generator (spec.md §4.2, §4.6).

use crate::error::MuxResult;
use crate::psi::descriptors::{self, Descriptor};
use crate::psi::{build_section, parse_section, SectionAssembler, PSI_MAX_SIZE};
use crate::{read_bitfield, write_bitfield};
use crate::slice_reader::SliceReader;
use bytes::Bytes;
use modular_bitfield_msb::prelude::*;

/// `table_id` for the PMT.
pub const TABLE_ID: u8 = 0x02;

/// PID value meaning "no PCR carried by this program" in the PMT header.
pub const PCR_PID_NONE: u16 = 0x1fff;

/// Fixed part of a PMT section, following the common PSI header/syntax.
#[bitfield]
#[derive(Debug, Clone, Copy)]
pub struct PmtHeader {
    pub reserved_1: B3,
    pub pcr_pid: B13,
    pub reserved_2: B4,
    #[skip]
    pub unused: B2,
    pub program_info_length: B10,
}

/// Per-elementary-stream entry header, preceding that entry's descriptor loop.
#[bitfield]
#[derive(Debug, Clone, Copy)]
pub struct ElementaryStreamInfoHeader {
    pub stream_type: B8,
    pub reserved_1: B3,
    pub elementary_pid: B13,
    pub reserved_2: B4,
    #[skip]
    pub unused: B2,
    pub es_info_length: B10,
}

/// One elementary stream entry as carried in a PMT.
#[derive(Debug, Clone, PartialEq)]
pub struct PmtStream {
    /// ISO/IEC 13818-1 Table 2-34 stream type (or a privately-registered value).
    pub stream_type: u8,
    /// PID this stream is carried on.
    pub elementary_pid: u16,
    /// Per-stream descriptors (language, AC-3, teletext, ...).
    pub descriptors: Vec<Descriptor>,
}

/// Decoded Program Map Table.
#[derive(Debug, Clone, PartialEq)]
pub struct Pmt {
    /// Program number (the PMT's `table_id_extension`).
    pub program_number: u16,
    /// PID carrying this program's PCR, if any.
    pub pcr_pid: Option<u16>,
    /// Version carried on the section syntax; callers use this to detect whether a re-decoded
    /// PMT actually changed the stream set.
    pub version: u8,
    /// Program-level descriptors.
    pub program_descriptors: Vec<Descriptor>,
    /// Elementary streams, in section order.
    pub streams: Vec<PmtStream>,
}

fn decode_sections(sections: &[Bytes]) -> MuxResult<Pmt> {
    // PMTs are always single-section in practice (spec.md §4.2); take the first section as
    // authoritative and ignore any others the assembler might (incorrectly) gather.
    let raw = &sections[0];
    let (_, syntax, body) = parse_section(raw)?;
    let mut reader = SliceReader::new(body);
    let header = read_bitfield!(reader, PmtHeader);

    let pcr_pid = if header.pcr_pid() == PCR_PID_NONE {
        None
    } else {
        Some(header.pcr_pid())
    };

    let program_info = reader.read(header.program_info_length() as usize)?;
    let mut program_info_reader = SliceReader::new(program_info);
    let program_descriptors = descriptors::parse_descriptor_loop(&mut program_info_reader)?;

    let mut streams = Vec::new();
    while reader.remaining_len() > 0 {
        let es_header = read_bitfield!(reader, ElementaryStreamInfoHeader);
        let es_info = reader.read(es_header.es_info_length() as usize)?;
        let mut es_info_reader = SliceReader::new(es_info);
        let stream_descriptors = descriptors::parse_descriptor_loop(&mut es_info_reader)?;
        streams.push(PmtStream {
            stream_type: es_header.stream_type(),
            elementary_pid: es_header.elementary_pid(),
            descriptors: stream_descriptors,
        });
    }

    Ok(Pmt {
        program_number: syntax.table_id_extension(),
        pcr_pid,
        version: syntax.version(),
        program_descriptors,
        streams,
    })
}

/// PMT section decoder. PMTs never split across multiple sections in practice, but reassembly
/// still goes through [`SectionAssembler`] for uniformity with the other table decoders.
#[derive(Debug, Default)]
pub struct PmtDecoder {
    assembler: SectionAssembler,
}

impl PmtDecoder {
    /// Creates an empty decoder.
    pub fn new() -> Self {
        Self {
            assembler: SectionAssembler::new(false),
        }
    }

    /// Feeds one raw section. See [`crate::psi::feed_section`] for the commit semantics.
    pub fn push_section(&mut self, raw: Bytes) -> MuxResult<Option<Pmt>> {
        super::feed_section(&mut self.assembler, raw, decode_sections)
    }
}

/// Generates the (single) PMT section for one program.
///
/// A PMT whose streams and descriptors do not fit in [`PSI_MAX_SIZE`] is a mux configuration
/// error (spec.md §4.2 Non-goals exclude multi-section PMT support, matching every PMT ever
/// observed on real broadcast streams); the generator panics on overflow rather than silently
/// truncating, since silent truncation would corrupt the stream list.
pub fn generate(program_number: u16, pcr_pid: Option<u16>, program_descriptors: &[Descriptor], streams: &[PmtStream], version: u8) -> Bytes {
    let mut body = Vec::new();
    let program_info = descriptors::build_descriptor_loop(program_descriptors);
    let header = PmtHeader::new()
        .with_reserved_1(0b111)
        .with_pcr_pid(pcr_pid.unwrap_or(PCR_PID_NONE))
        .with_reserved_2(0b1111)
        .with_program_info_length(program_info.len() as u16);
    write_bitfield!(body, header);
    body.extend_from_slice(&program_info);

    for stream in streams {
        let es_info = descriptors::build_descriptor_loop(&stream.descriptors);
        let es_header = ElementaryStreamInfoHeader::new()
            .with_stream_type(stream.stream_type)
            .with_reserved_1(0b111)
            .with_elementary_pid(stream.elementary_pid)
            .with_reserved_2(0b1111)
            .with_es_info_length(es_info.len() as u16);
        write_bitfield!(body, es_header);
        body.extend_from_slice(&es_info);
    }

    assert!(
        body.len() + 3 + 5 + 4 <= PSI_MAX_SIZE,
        "PMT for program {} exceeds {} bytes",
        program_number,
        PSI_MAX_SIZE
    );

    build_section(TABLE_ID, program_number, version, 0, 0, &body)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_generate_and_decode() {
        let streams = vec![
            PmtStream {
                stream_type: 0x1b,
                elementary_pid: 256,
                descriptors: Vec::new(),
            },
            PmtStream {
                stream_type: 0x03,
                elementary_pid: 257,
                descriptors: vec![Descriptor::new(descriptors::tag::LANGUAGE, b"eng\0")],
            },
        ];
        let section = generate(1, Some(256), &[], &streams, 0);
        let mut decoder = PmtDecoder::new();
        let pmt = decoder.push_section(section).unwrap().expect("should complete");
        assert_eq!(pmt.program_number, 1);
        assert_eq!(pmt.pcr_pid, Some(256));
        assert_eq!(pmt.streams.len(), 2);
        assert_eq!(pmt.streams[1].descriptors[0].tag, descriptors::tag::LANGUAGE);
    }

    #[test]
    fn no_pcr_pid_decodes_to_none() {
        let section = generate(2, None, &[], &[], 0);
        let mut decoder = PmtDecoder::new();
        let pmt = decoder.push_section(section).unwrap().unwrap();
        assert_eq!(pmt.pcr_pid, None);
    }

    #[test]
    fn unchanged_pmt_is_not_re_emitted() {
        let section = generate(1, None, &[], &[], 3);
        let mut decoder = PmtDecoder::new();
        assert!(decoder.push_section(section.clone()).unwrap().is_some());
        assert!(decoder.push_section(section).unwrap().is_none());
    }
}

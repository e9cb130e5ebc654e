//! Network Information Table: decoder and generator (spec.md §4.2, §4.6).

use crate::error::{MuxError, MuxResult};
use crate::psi::descriptors::{self, Descriptor};
use crate::psi::{build_section, parse_section, SectionAssembler, PSI_MAX_SIZE};
use crate::{read_bitfield, write_bitfield};
use crate::slice_reader::SliceReader;
use bytes::Bytes;
use modular_bitfield_msb::prelude::*;
use std::collections::HashSet;

/// `table_id` for the NIT describing the actual network.
pub const TABLE_ID_ACTUAL: u8 = 0x40;
/// `table_id` for a NIT describing another network.
pub const TABLE_ID_OTHER: u8 = 0x41;

/// First fixed field of a NIT section, preceding the network descriptor loop.
#[bitfield]
#[derive(Debug, Clone, Copy)]
pub struct NitHeader {
    pub reserved_future: B4,
    pub network_descriptors_length: B12,
}

/// Second fixed field of a NIT section, preceding the transport-stream loop.
#[bitfield]
#[derive(Debug, Clone, Copy)]
pub struct NitTransportStreamLoopHeader {
    pub reserved_future: B4,
    pub transport_stream_loop_length: B12,
}

/// Fixed part of one NIT transport-stream entry, preceding that entry's descriptor loop.
#[bitfield]
#[derive(Debug, Clone, Copy)]
pub struct NitTransportStreamEntryHeader {
    pub transport_stream_id: B16,
    pub original_network_id: B16,
    pub reserved_future: B4,
    pub transport_descriptors_length: B12,
}

/// One transport-stream entry as carried in a NIT.
#[derive(Debug, Clone, PartialEq)]
pub struct NitTransportStream {
    /// Transport stream id of the described multiplex.
    pub transport_stream_id: u16,
    /// Original network id of the described multiplex.
    pub original_network_id: u16,
    /// Per-entry descriptors (typically a `service_list_descriptor`).
    pub descriptors: Vec<Descriptor>,
}

/// Decoded Network Information Table.
#[derive(Debug, Clone, PartialEq)]
pub struct Nit {
    /// Network id (the NIT's `table_id_extension`).
    pub network_id: u16,
    /// True if this NIT describes the actual network carrying it.
    pub actual_network: bool,
    /// Network-level descriptors (typically a `network_name_descriptor`, tag 0x40).
    pub network_descriptors: Vec<Descriptor>,
    /// Transport streams described by this network, keyed uniquely by transport_stream_id
    /// (spec.md §3 NIT invariant).
    pub transport_streams: Vec<NitTransportStream>,
}

/// Extracts the DVB network name from a NIT's network-level descriptors, if present.
pub fn network_name(nit: &Nit) -> Option<String> {
    nit.network_descriptors
        .iter()
        .find(|d| d.tag == descriptors::tag::NETWORK_NAME)
        .map(|d| crate::dvb_string::decode(&d.data))
}

fn decode_sections(sections: &[Bytes]) -> MuxResult<Nit> {
    let raw = &sections[0];
    let (header, syntax, body) = parse_section(raw)?;
    let actual_network = header.table_id() == TABLE_ID_ACTUAL;

    let mut reader = SliceReader::new(body);
    let nit_header = read_bitfield!(reader, NitHeader);
    let network_descriptors_data = reader.read(nit_header.network_descriptors_length() as usize)?;
    let mut network_descriptors_reader = SliceReader::new(network_descriptors_data);
    let network_descriptors = descriptors::parse_descriptor_loop(&mut network_descriptors_reader)?;

    let ts_loop_header = read_bitfield!(reader, NitTransportStreamLoopHeader);
    let ts_loop_data = reader.read(ts_loop_header.transport_stream_loop_length() as usize)?;
    let mut ts_reader = SliceReader::new(ts_loop_data);

    let mut transport_streams = Vec::new();
    let mut seen_tsid = HashSet::new();
    while ts_reader.remaining_len() > 0 {
        let entry_header = read_bitfield!(ts_reader, NitTransportStreamEntryHeader);
        let entry_descriptors_data = ts_reader.read(entry_header.transport_descriptors_length() as usize)?;
        let mut entry_descriptors_reader = SliceReader::new(entry_descriptors_data);
        let entry_descriptors = descriptors::parse_descriptor_loop(&mut entry_descriptors_reader)?;
        if !seen_tsid.insert(entry_header.transport_stream_id()) {
            return Err(MuxError::Invalid(format!(
                "duplicate transport_stream_id {} in NIT",
                entry_header.transport_stream_id()
            )));
        }
        transport_streams.push(NitTransportStream {
            transport_stream_id: entry_header.transport_stream_id(),
            original_network_id: entry_header.original_network_id(),
            descriptors: entry_descriptors,
        });
    }

    Ok(Nit {
        network_id: syntax.table_id_extension(),
        actual_network,
        network_descriptors,
        transport_streams,
    })
}

/// NIT section decoder.
#[derive(Debug, Default)]
pub struct NitDecoder {
    assembler: SectionAssembler,
}

impl NitDecoder {
    /// Creates an empty decoder.
    pub fn new() -> Self {
        Self {
            assembler: SectionAssembler::new(false),
        }
    }

    /// Feeds one raw section.
    pub fn push_section(&mut self, raw: Bytes) -> MuxResult<Option<Nit>> {
        super::feed_section(&mut self.assembler, raw, decode_sections)
    }
}

/// Generates the NIT section(s) for one network, splitting the transport-stream loop across
/// sections to respect [`PSI_MAX_SIZE`] where the fully built payload would otherwise overflow.
pub fn generate(
    network_id: u16,
    actual_network: bool,
    network_descriptors: &[Descriptor],
    transport_streams: &[NitTransportStream],
    version: u8,
) -> Vec<Bytes> {
    let network_descriptors_bytes = descriptors::build_descriptor_loop(network_descriptors);
    let nit_header = NitHeader::new()
        .with_reserved_future(0b1111)
        .with_network_descriptors_length(network_descriptors_bytes.len() as u16);

    let mut fixed_prefix = Vec::new();
    write_bitfield!(fixed_prefix, nit_header);
    fixed_prefix.extend_from_slice(&network_descriptors_bytes);

    let entries: Vec<Vec<u8>> = transport_streams
        .iter()
        .map(|ts| {
            let entry_descriptors = descriptors::build_descriptor_loop(&ts.descriptors);
            let entry_header = NitTransportStreamEntryHeader::new()
                .with_transport_stream_id(ts.transport_stream_id)
                .with_original_network_id(ts.original_network_id)
                .with_reserved_future(0b1111)
                .with_transport_descriptors_length(entry_descriptors.len() as u16);
            let mut entry = Vec::new();
            write_bitfield!(entry, entry_header);
            entry.extend_from_slice(&entry_descriptors);
            entry
        })
        .collect();

    const SECTION_OVERHEAD: usize = 3 + 5 + 4;
    let table_id = if actual_network { TABLE_ID_ACTUAL } else { TABLE_ID_OTHER };
    let budget = PSI_MAX_SIZE - SECTION_OVERHEAD - fixed_prefix.len() - 4; // 4 bytes: ts-loop header

    let mut chunks: Vec<Vec<u8>> = Vec::new();
    let mut current = Vec::new();
    for entry in &entries {
        if !current.is_empty() && current.len() + entry.len() > budget {
            chunks.push(std::mem::take(&mut current));
        }
        current.extend_from_slice(entry);
    }
    chunks.push(current);
    if chunks.len() > 1 && chunks.last().map_or(false, |c| c.is_empty()) {
        chunks.pop();
    }
    if chunks.is_empty() {
        chunks.push(Vec::new());
    }

    let last_section_num = (chunks.len() - 1) as u8;
    chunks
        .into_iter()
        .enumerate()
        .map(|(i, ts_loop_bytes)| {
            let ts_loop_header = NitTransportStreamLoopHeader::new()
                .with_reserved_future(0b1111)
                .with_transport_stream_loop_length(ts_loop_bytes.len() as u16);
            let mut body = fixed_prefix.clone();
            write_bitfield!(body, ts_loop_header);
            body.extend_from_slice(&ts_loop_bytes);
            build_section(table_id, network_id, version, i as u8, last_section_num, &body)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_generate_and_decode() {
        let network_descriptors = vec![Descriptor::new(descriptors::tag::NETWORK_NAME, &crate::dvb_string::encode("Test Network"))];
        let transport_streams = vec![NitTransportStream {
            transport_stream_id: 1,
            original_network_id: 100,
            descriptors: Vec::new(),
        }];
        let sections = generate(100, true, &network_descriptors, &transport_streams, 0);
        let mut decoder = NitDecoder::new();
        let mut result = None;
        for s in sections {
            if let Some(nit) = decoder.push_section(s).unwrap() {
                result = Some(nit);
            }
        }
        let nit = result.unwrap();
        assert_eq!(nit.network_id, 100);
        assert!(nit.actual_network);
        assert_eq!(network_name(&nit).as_deref(), Some("Test Network"));
        assert_eq!(nit.transport_streams, transport_streams);
    }

    #[test]
    fn duplicate_transport_stream_id_is_rejected() {
        let transport_streams = vec![
            NitTransportStream {
                transport_stream_id: 1,
                original_network_id: 100,
                descriptors: Vec::new(),
            },
            NitTransportStream {
                transport_stream_id: 1,
                original_network_id: 100,
                descriptors: Vec::new(),
            },
        ];
        let sections = generate(100, true, &[], &transport_streams, 0);
        let mut decoder = NitDecoder::new();
        assert!(decoder.push_section(sections[0].clone()).is_err());
    }
}

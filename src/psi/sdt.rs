//! Service Description Table: decoder and generator (spec.md §4.2, §4.6).

use crate::dvb_string;
use crate::error::MuxResult;
use crate::psi::descriptors::{self, Descriptor};
use crate::psi::{build_section, parse_section, SectionAssembler, PSI_MAX_SIZE};
use crate::{read_bitfield, write_bitfield};
use crate::slice_reader::SliceReader;
use bytes::Bytes;
use modular_bitfield_msb::prelude::*;

/// `table_id` for the SDT describing the actual transport stream.
pub const TABLE_ID_ACTUAL: u8 = 0x42;
/// `table_id` for a SDT describing another transport stream.
pub const TABLE_ID_OTHER: u8 = 0x46;

/// Fixed part of a SDT section, following the common PSI header/syntax.
#[bitfield]
#[derive(Debug, Clone, Copy)]
pub struct SdtHeader {
    pub original_network_id: B16,
    pub reserved_future: B8,
}

/// Fixed part of one SDT service entry, preceding that entry's descriptor loop.
#[bitfield]
#[derive(Debug, Clone, Copy)]
pub struct SdtServiceEntryHeader {
    pub service_id: B16,
    pub reserved_future: B6,
    pub eit_schedule_flag: bool,
    pub eit_present_following_flag: bool,
    pub running_status: B3,
    pub free_ca_mode: bool,
    pub descriptors_loop_length: B12,
}

/// One service entry as carried in a SDT.
#[derive(Debug, Clone, PartialEq)]
pub struct SdtService {
    /// Service id (program number).
    pub service_id: u16,
    /// Whether an EIT schedule (future events beyond present/following) exists for this service.
    pub eit_schedule_flag: bool,
    /// Whether present/following EIT data exists for this service.
    pub eit_present_following_flag: bool,
    /// DVB running status (0 = undefined, 1 = not running, ... 4 = running).
    pub running_status: u8,
    /// Whether this service is scrambled under a CA system.
    pub free_ca_mode: bool,
    /// Per-service descriptors (typically a `service_descriptor`, tag 0x48).
    pub descriptors: Vec<Descriptor>,
}

/// Decoded Service Description Table.
#[derive(Debug, Clone, PartialEq)]
pub struct Sdt {
    /// Transport stream id (the SDT's `table_id_extension`).
    pub transport_stream_id: u16,
    /// True if this SDT describes the actual transport stream carrying it.
    pub actual_transport_stream: bool,
    /// Original network id.
    pub original_network_id: u16,
    /// Services described, keyed uniquely by service_id.
    pub services: Vec<SdtService>,
}

/// Parsed `service_descriptor` (tag 0x48) payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceDescriptor {
    /// DVB service type (e.g. 0x01 = digital television).
    pub service_type: u8,
    /// Provider name, DVB-string decoded.
    pub provider_name: String,
    /// Service name, DVB-string decoded.
    pub service_name: String,
}

/// Decodes a `tag::SERVICE` descriptor's payload.
pub fn parse_service_descriptor(data: &[u8]) -> Option<ServiceDescriptor> {
    if data.is_empty() {
        return None;
    }
    let service_type = data[0];
    let provider_len = *data.get(1)? as usize;
    let provider_bytes = data.get(2..2 + provider_len)?;
    let name_len_pos = 2 + provider_len;
    let service_name_len = *data.get(name_len_pos)? as usize;
    let service_name_bytes = data.get(name_len_pos + 1..name_len_pos + 1 + service_name_len)?;
    Some(ServiceDescriptor {
        service_type,
        provider_name: dvb_string::decode(provider_bytes),
        service_name: dvb_string::decode(service_name_bytes),
    })
}

/// Builds a `tag::SERVICE` descriptor payload.
pub fn build_service_descriptor(entry: &ServiceDescriptor) -> Vec<u8> {
    let provider = dvb_string::encode(&entry.provider_name);
    let name = dvb_string::encode(&entry.service_name);
    let mut out = Vec::with_capacity(3 + provider.len() + name.len());
    out.push(entry.service_type);
    out.push(provider.len() as u8);
    out.extend_from_slice(&provider);
    out.push(name.len() as u8);
    out.extend_from_slice(&name);
    out
}

fn decode_sections(sections: &[Bytes]) -> MuxResult<Sdt> {
    let raw = &sections[0];
    let (header, syntax, body) = parse_section(raw)?;
    let actual_transport_stream = header.table_id() == TABLE_ID_ACTUAL;

    let mut reader = SliceReader::new(body);
    let sdt_header = read_bitfield!(reader, SdtHeader);

    let mut services = Vec::new();
    while reader.remaining_len() > 0 {
        let entry_header = read_bitfield!(reader, SdtServiceEntryHeader);
        let descriptors_data = reader.read(entry_header.descriptors_loop_length() as usize)?;
        let mut descriptors_reader = SliceReader::new(descriptors_data);
        let service_descriptors = descriptors::parse_descriptor_loop(&mut descriptors_reader)?;
        services.push(SdtService {
            service_id: entry_header.service_id(),
            eit_schedule_flag: entry_header.eit_schedule_flag(),
            eit_present_following_flag: entry_header.eit_present_following_flag(),
            running_status: entry_header.running_status(),
            free_ca_mode: entry_header.free_ca_mode(),
            descriptors: service_descriptors,
        });
    }

    Ok(Sdt {
        transport_stream_id: syntax.table_id_extension(),
        actual_transport_stream,
        original_network_id: sdt_header.original_network_id(),
        services,
    })
}

/// SDT section decoder.
#[derive(Debug, Default)]
pub struct SdtDecoder {
    assembler: SectionAssembler,
}

impl SdtDecoder {
    /// Creates an empty decoder.
    pub fn new() -> Self {
        Self {
            assembler: SectionAssembler::new(false),
        }
    }

    /// Feeds one raw section.
    pub fn push_section(&mut self, raw: Bytes) -> MuxResult<Option<Sdt>> {
        super::feed_section(&mut self.assembler, raw, decode_sections)
    }
}

/// Generates the SDT section(s) for one transport stream, splitting the service list across
/// sections to respect [`PSI_MAX_SIZE`].
pub fn generate(
    transport_stream_id: u16,
    actual_transport_stream: bool,
    original_network_id: u16,
    services: &[SdtService],
    version: u8,
) -> Vec<Bytes> {
    let sdt_header = SdtHeader::new()
        .with_original_network_id(original_network_id)
        .with_reserved_future(0xff);
    let mut fixed_prefix = Vec::new();
    write_bitfield!(fixed_prefix, sdt_header);

    let entries: Vec<Vec<u8>> = services
        .iter()
        .map(|svc| {
            let descriptors_bytes = descriptors::build_descriptor_loop(&svc.descriptors);
            let entry_header = SdtServiceEntryHeader::new()
                .with_service_id(svc.service_id)
                .with_reserved_future(0x3f)
                .with_eit_schedule_flag(svc.eit_schedule_flag)
                .with_eit_present_following_flag(svc.eit_present_following_flag)
                .with_running_status(svc.running_status)
                .with_free_ca_mode(svc.free_ca_mode)
                .with_descriptors_loop_length(descriptors_bytes.len() as u16);
            let mut entry = Vec::new();
            write_bitfield!(entry, entry_header);
            entry.extend_from_slice(&descriptors_bytes);
            entry
        })
        .collect();

    const SECTION_OVERHEAD: usize = 3 + 5 + 4;
    let table_id = if actual_transport_stream { TABLE_ID_ACTUAL } else { TABLE_ID_OTHER };
    let budget = PSI_MAX_SIZE - SECTION_OVERHEAD - fixed_prefix.len();

    let mut chunks: Vec<Vec<u8>> = Vec::new();
    let mut current = Vec::new();
    for entry in &entries {
        if !current.is_empty() && current.len() + entry.len() > budget {
            chunks.push(std::mem::take(&mut current));
        }
        current.extend_from_slice(entry);
    }
    chunks.push(current);

    let last_section_num = (chunks.len() - 1) as u8;
    chunks
        .into_iter()
        .enumerate()
        .map(|(i, services_bytes)| {
            let mut body = fixed_prefix.clone();
            body.extend_from_slice(&services_bytes);
            build_section(table_id, transport_stream_id, version, i as u8, last_section_num, &body)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_generate_and_decode() {
        let svc_desc = ServiceDescriptor {
            service_type: 0x01,
            provider_name: "Acme".to_string(),
            service_name: "Acme One".to_string(),
        };
        let services = vec![SdtService {
            service_id: 1,
            eit_schedule_flag: false,
            eit_present_following_flag: true,
            running_status: 4,
            free_ca_mode: false,
            descriptors: vec![Descriptor::new(descriptors::tag::SERVICE, &build_service_descriptor(&svc_desc))],
        }];
        let sections = generate(1, true, 100, &services, 0);
        let mut decoder = SdtDecoder::new();
        let mut result = None;
        for s in sections {
            if let Some(sdt) = decoder.push_section(s).unwrap() {
                result = Some(sdt);
            }
        }
        let sdt = result.unwrap();
        assert_eq!(sdt.transport_stream_id, 1);
        assert_eq!(sdt.original_network_id, 100);
        assert_eq!(sdt.services.len(), 1);
        let decoded_desc = parse_service_descriptor(&sdt.services[0].descriptors[0].data).unwrap();
        assert_eq!(decoded_desc, svc_desc);
    }

    #[test]
    fn unchanged_sdt_is_not_re_emitted() {
        let sections = generate(1, true, 100, &[], 0);
        let mut decoder = SdtDecoder::new();
        assert!(decoder.push_section(sections[0].clone()).unwrap().is_some());
        assert!(decoder.push_section(sections[0].clone()).unwrap().is_none());
    }
}

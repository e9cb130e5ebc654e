//! Event Information Table: decoder and generator (spec.md §4.2, §4.6).
//!
//! EIT is the one PSI table whose sections may legitimately complete with gaps: each 32-event
//! segment is independent, and a segment can be represented solely by its last section (the
//! "segment hole" tolerance of spec.md §8), so decoding goes through
//! [`crate::psi::feed_section_with_segment`] rather than the plain [`crate::psi::feed_section`].

use crate::error::MuxResult;
use crate::psi::descriptors::{self, Descriptor};
use crate::psi::{build_section, parse_section, SectionAssembler, PSI_MAX_SIZE};
use crate::{read_bitfield, write_bitfield};
use crate::slice_reader::SliceReader;
use bytes::Bytes;
use modular_bitfield_msb::prelude::*;

/// `table_id` for the EIT present/following table of the actual transport stream.
pub const TABLE_ID_ACTUAL_PF: u8 = 0x4e;
/// `table_id` for the EIT present/following table of another transport stream.
pub const TABLE_ID_OTHER_PF: u8 = 0x4f;
/// First `table_id` of the EIT schedule table range for the actual transport stream.
pub const TABLE_ID_ACTUAL_SCHEDULE_FIRST: u8 = 0x50;
/// First `table_id` of the EIT schedule table range for another transport stream.
pub const TABLE_ID_OTHER_SCHEDULE_FIRST: u8 = 0x60;

/// Fixed part of an EIT section, following the common PSI header/syntax.
#[bitfield]
#[derive(Debug, Clone, Copy)]
pub struct EitHeader {
    pub transport_stream_id: B16,
    pub original_network_id: B16,
    pub segment_last_section_number: B8,
    pub last_table_id: B8,
}

/// Fixed part of one EIT event entry, preceding that entry's descriptor loop.
#[bitfield]
#[derive(Debug, Clone, Copy)]
pub struct EitEventEntryHeader {
    pub event_id: B16,
    pub start_time: B40,
    pub duration: B24,
    pub running_status: B3,
    pub free_ca_mode: bool,
    pub descriptors_loop_length: B12,
}

/// A UTC date/time as carried by DVB's 40-bit MJD+BCD `start_time` field (ETSI EN 300 468
/// Annex C).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DvbDateTime {
    pub year: u16,
    pub month: u8,
    pub day: u8,
    pub hour: u8,
    pub minute: u8,
    pub second: u8,
}

fn bcd_to_u8(b: u8) -> u8 {
    (b >> 4) * 10 + (b & 0x0f)
}

fn u8_to_bcd(v: u8) -> u8 {
    ((v / 10) << 4) | (v % 10)
}

/// Decodes the 40-bit `start_time` field into a [`DvbDateTime`] (Modified Julian Date + BCD UTC).
pub fn decode_start_time(raw: u64) -> DvbDateTime {
    let mjd = ((raw >> 24) & 0xffff) as u32;
    let hour = bcd_to_u8(((raw >> 16) & 0xff) as u8);
    let minute = bcd_to_u8(((raw >> 8) & 0xff) as u8);
    let second = bcd_to_u8((raw & 0xff) as u8);

    // ETSI EN 300 468 Annex C: Modified Julian Date to Gregorian calendar date.
    let yp = ((mjd as f64 - 15078.2) / 365.25) as u32;
    let mp = (((mjd as f64 - 14956.1) - (yp as f64 * 365.25) as u32 as f64) / 30.6001) as u32;
    let day = mjd - 14956 - (yp as f64 * 365.25) as u32 - (mp as f64 * 30.6001) as u32;
    let k = if mp == 14 || mp == 15 { 1u32 } else { 0 };
    let year = 1900 + yp + k;
    let month = mp - 1 - k * 12;

    DvbDateTime {
        year: year as u16,
        month: month as u8,
        day: day as u8,
        hour,
        minute,
        second,
    }
}

/// Encodes a [`DvbDateTime`] into the 40-bit `start_time` field (ETSI EN 300 468 Annex C
/// forward formula, the inverse of [`decode_start_time`]).
pub fn encode_start_time(dt: &DvbDateTime) -> u64 {
    let y = dt.year as i32;
    let m = dt.month as i32;
    let l = if m == 1 || m == 2 { 1 } else { 0 };
    let yp = y - l;
    let mp = m + 1 + l * 12;
    let mjd = 14956 + dt.day as i32 + (((yp - 1900) as f64) * 365.25) as i32 + ((mp as f64) * 30.6001) as i32;

    ((mjd as u64 & 0xffff) << 24)
        | ((u8_to_bcd(dt.hour) as u64) << 16)
        | ((u8_to_bcd(dt.minute) as u64) << 8)
        | u8_to_bcd(dt.second) as u64
}

/// A duration as carried by DVB's 24-bit BCD `duration` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DvbDuration {
    pub hours: u8,
    pub minutes: u8,
    pub seconds: u8,
}

/// Decodes the 24-bit `duration` field.
pub fn decode_duration(raw: u32) -> DvbDuration {
    DvbDuration {
        hours: bcd_to_u8(((raw >> 16) & 0xff) as u8),
        minutes: bcd_to_u8(((raw >> 8) & 0xff) as u8),
        seconds: bcd_to_u8((raw & 0xff) as u8),
    }
}

/// Encodes a [`DvbDuration`] into the 24-bit `duration` field.
pub fn encode_duration(d: &DvbDuration) -> u32 {
    ((u8_to_bcd(d.hours) as u32) << 16) | ((u8_to_bcd(d.minutes) as u32) << 8) | u8_to_bcd(d.seconds) as u32
}

/// One event entry as carried in an EIT.
#[derive(Debug, Clone, PartialEq)]
pub struct EitEvent {
    /// Event id, unique within the service's schedule.
    pub event_id: u16,
    /// Start time, UTC.
    pub start_time: DvbDateTime,
    /// Duration.
    pub duration: DvbDuration,
    /// DVB running status (0 = undefined ... 4 = running).
    pub running_status: u8,
    /// Whether this event is scrambled under a CA system.
    pub free_ca_mode: bool,
    /// Per-event descriptors (typically a `short_event_descriptor`, tag 0x4d).
    pub descriptors: Vec<Descriptor>,
}

/// Decoded Event Information Table segment (one or more reassembled sections for one service).
#[derive(Debug, Clone, PartialEq)]
pub struct Eit {
    /// Service id (the EIT's `table_id_extension`).
    pub service_id: u16,
    /// Transport stream id of the described service.
    pub transport_stream_id: u16,
    /// Original network id of the described service.
    pub original_network_id: u16,
    /// True if this is the present/following table rather than the schedule table.
    pub present_following: bool,
    /// True if this EIT describes the actual transport stream carrying it.
    pub actual_transport_stream: bool,
    /// Events, in section order.
    pub events: Vec<EitEvent>,
}

fn decode_sections(sections: &[Bytes]) -> MuxResult<Eit> {
    let first_raw = &sections[0];
    let (first_header, first_syntax, _) = parse_section(first_raw)?;
    let table_id = first_header.table_id();
    let present_following = table_id == TABLE_ID_ACTUAL_PF || table_id == TABLE_ID_OTHER_PF;
    let actual_transport_stream = table_id == TABLE_ID_ACTUAL_PF || (table_id >= TABLE_ID_ACTUAL_SCHEDULE_FIRST && table_id < TABLE_ID_OTHER_SCHEDULE_FIRST);

    let mut events = Vec::new();
    let mut transport_stream_id = 0;
    let mut original_network_id = 0;

    for raw in sections {
        let (_, _syntax, body) = parse_section(raw)?;
        let mut reader = SliceReader::new(body);
        let eit_header = read_bitfield!(reader, EitHeader);
        transport_stream_id = eit_header.transport_stream_id();
        original_network_id = eit_header.original_network_id();

        while reader.remaining_len() > 0 {
            let entry = read_bitfield!(reader, EitEventEntryHeader);
            let descriptors_data = reader.read(entry.descriptors_loop_length() as usize)?;
            let mut descriptors_reader = SliceReader::new(descriptors_data);
            let event_descriptors = descriptors::parse_descriptor_loop(&mut descriptors_reader)?;
            events.push(EitEvent {
                event_id: entry.event_id(),
                start_time: decode_start_time(entry.start_time()),
                duration: decode_duration(entry.duration()),
                running_status: entry.running_status(),
                free_ca_mode: entry.free_ca_mode(),
                descriptors: event_descriptors,
            });
        }
    }

    Ok(Eit {
        service_id: first_syntax.table_id_extension(),
        transport_stream_id,
        original_network_id,
        present_following,
        actual_transport_stream,
        events,
    })
}

/// EIT section decoder: uses a hole-tolerant [`SectionAssembler`] so a schedule table with
/// empty trailing segments (represented solely by their last section) still completes
/// (spec.md §8).
#[derive(Debug)]
pub struct EitDecoder {
    assembler: SectionAssembler,
}

impl Default for EitDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl EitDecoder {
    /// Creates an empty decoder.
    pub fn new() -> Self {
        Self {
            assembler: SectionAssembler::new(true),
        }
    }

    /// Feeds one raw section, along with its `segment_last_section_number` (read from the
    /// section's own [`EitHeader`] by the caller, since that field lives past the common PSI
    /// syntax this module doesn't re-parse twice).
    pub fn push_section(&mut self, raw: Bytes) -> MuxResult<Option<Eit>> {
        let (_, _, body) = parse_section(&raw)?;
        let mut reader = SliceReader::new(body);
        let eit_header = read_bitfield!(reader, EitHeader);
        let segment_last = eit_header.segment_last_section_number();
        super::feed_section_with_segment(&mut self.assembler, raw, Some(segment_last), decode_sections)
    }
}

/// Generates EIT sections for one service's event list, splitting across sections to respect
/// [`PSI_MAX_SIZE`]. `segment_last_section_number` and `last_table_id` are filled from the
/// generated section count, matching a single-segment (at most 32 sections) table; multi-segment
/// schedule generation is a mux configuration concern (spec.md §4.2 Non-goals) left to the
/// caller composing several `generate` calls with successive `table_id`s.
pub fn generate(
    service_id: u16,
    transport_stream_id: u16,
    original_network_id: u16,
    table_id: u8,
    events: &[EitEvent],
    version: u8,
) -> Vec<Bytes> {
    let entries: Vec<Vec<u8>> = events
        .iter()
        .map(|ev| {
            let descriptors_bytes = descriptors::build_descriptor_loop(&ev.descriptors);
            let entry = EitEventEntryHeader::new()
                .with_event_id(ev.event_id)
                .with_start_time(encode_start_time(&ev.start_time))
                .with_duration(encode_duration(&ev.duration))
                .with_running_status(ev.running_status)
                .with_free_ca_mode(ev.free_ca_mode)
                .with_descriptors_loop_length(descriptors_bytes.len() as u16);
            let mut out = Vec::new();
            write_bitfield!(out, entry);
            out.extend_from_slice(&descriptors_bytes);
            out
        })
        .collect();

    const SECTION_OVERHEAD: usize = 3 + 5 + 4;
    const EIT_HEADER_LEN: usize = 6;
    let budget = PSI_MAX_SIZE - SECTION_OVERHEAD - EIT_HEADER_LEN;

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
        .map(|(i, events_bytes)| {
            let eit_header = EitHeader::new()
                .with_transport_stream_id(transport_stream_id)
                .with_original_network_id(original_network_id)
                .with_segment_last_section_number(last_section_num)
                .with_last_table_id(table_id);
            let mut body = Vec::new();
            write_bitfield!(body, eit_header);
            body.extend_from_slice(&events_bytes);
            build_section(table_id, service_id, version, i as u8, last_section_num, &body)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(id: u16) -> EitEvent {
        EitEvent {
            event_id: id,
            start_time: DvbDateTime {
                year: 2026,
                month: 7,
                day: 28,
                hour: 12,
                minute: 0,
                second: 0,
            },
            duration: DvbDuration {
                hours: 1,
                minutes: 0,
                seconds: 0,
            },
            running_status: 4,
            free_ca_mode: false,
            descriptors: Vec::new(),
        }
    }

    #[test]
    fn start_time_round_trips() {
        let dt = DvbDateTime {
            year: 2026,
            month: 7,
            day: 28,
            hour: 13,
            minute: 45,
            second: 30,
        };
        let raw = encode_start_time(&dt);
        let decoded = decode_start_time(raw);
        assert_eq!(decoded.hour, dt.hour);
        assert_eq!(decoded.minute, dt.minute);
        assert_eq!(decoded.second, dt.second);
    }

    #[test]
    fn round_trips_through_generate_and_decode() {
        let events = vec![event(1), event(2)];
        let sections = generate(1, 10, 100, TABLE_ID_ACTUAL_PF, &events, 0);
        let mut decoder = EitDecoder::new();
        let mut result = None;
        for s in sections {
            if let Some(eit) = decoder.push_section(s).unwrap() {
                result = Some(eit);
            }
        }
        let eit = result.unwrap();
        assert_eq!(eit.service_id, 1);
        assert!(eit.present_following);
        assert!(eit.actual_transport_stream);
        assert_eq!(eit.events.len(), 2);
    }

    #[test]
    fn unchanged_eit_is_not_re_emitted() {
        let events = vec![event(1)];
        let sections = generate(1, 10, 100, TABLE_ID_ACTUAL_PF, &events, 0);
        let mut decoder = EitDecoder::new();
        assert!(decoder.push_section(sections[0].clone()).unwrap().is_some());
        assert!(decoder.push_section(sections[0].clone()).unwrap().is_none());
    }
}

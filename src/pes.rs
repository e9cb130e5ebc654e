//! PES (Packetized Elementary Stream) header parsing and generation (ISO/IEC 13818-1 §2.4.3.6).
//!
//! Only the subset spec.md §4.4 needs is modeled: stream id, PTS/DTS, data-alignment indicator,
//! and stuffing to reach a flow's declared `pes_header_minimum` (teletext's fixed 45-byte header
//! being the notable case that forces stuffing even when no timestamp is carried).

use crate::error::{WireErrorKind, WireResult};
use crate::slice_reader::SliceReader;
use crate::{read_bitfield, write_bitfield};
use modular_bitfield_msb::prelude::*;

/// `packet_start_code_prefix`, the first 3 bytes of every PES packet.
pub const PACKET_START_CODE_PREFIX: u32 = 0x00_0001;

/// `PES_header_data_length` byte count contributed by one PTS or DTS field.
pub const TIMESTAMP_FIELD_SIZE: usize = 5;

/// Minimum PES header size (start code + stream id + length + flags byte pair + header length
/// byte) before any optional field.
pub const PES_HEADER_SIZE: usize = 9;

/// Minimum PES header size when a PTS is present.
pub const PES_HEADER_SIZE_PTS: usize = PES_HEADER_SIZE + TIMESTAMP_FIELD_SIZE;

/// Minimum PES header size when both a PTS and a DTS are present.
pub const PES_HEADER_SIZE_PTSDTS: usize = PES_HEADER_SIZE + 2 * TIMESTAMP_FIELD_SIZE;

/// Fixed PES header size mandated for teletext by ETSI EN 300 472 §4.1 (stuffed out regardless
/// of whether a timestamp is present).
pub const PES_HEADER_SIZE_TELETEXT: usize = 45;

/// 6-byte fixed prefix of every PES packet.
#[bitfield]
#[derive(Debug, Clone, Copy)]
pub struct PesHeader {
    pub packet_start_code_prefix: B24,
    pub stream_id: B8,
    pub pes_packet_length: B16,
}

/// 3-byte optional-fields header, present on every PES packet this mux produces (stream ids
/// `0xbc`-`0xff` minus the handful of control codes that omit it aren't generated here).
#[bitfield]
#[derive(Debug, Clone, Copy)]
pub struct PesOptionalHeader {
    pub marker_bits: B2,
    pub scrambling_control: B2,
    pub priority: bool,
    pub data_alignment_indicator: bool,
    pub copyright: bool,
    pub original_or_copy: bool,
    pub pts_dts_flags: B2,
    pub escr_flag: bool,
    pub es_rate_flag: bool,
    pub dsm_trick_mode_flag: bool,
    pub additional_copy_info_flag: bool,
    pub pes_crc_flag: bool,
    pub pes_extension_flag: bool,
    pub pes_header_data_length: B8,
}

/// `PTS_DTS_flags` values.
pub mod pts_dts_flags {
    pub const NONE: u8 = 0b00;
    pub const PTS_ONLY: u8 = 0b10;
    pub const PTS_AND_DTS: u8 = 0b11;
}

fn parse_timestamp(bytes: &[u8; 5]) -> u64 {
    let mut ts: u64 = ((bytes[0] >> 1) & 0x07) as u64;
    ts = (ts << 15) | (((bytes[1] as u64) << 7) | ((bytes[2] >> 1) as u64));
    ts = (ts << 15) | (((bytes[3] as u64) << 7) | ((bytes[4] >> 1) as u64));
    ts
}

fn write_timestamp(prefix: u8, ts: u64, out: &mut [u8; 5]) {
    let ts = ts & 0x1_ffff_ffff;
    out[0] = (prefix << 4) | (((ts >> 29) & 0x07) as u8) << 1 | 1;
    out[1] = ((ts >> 22) & 0xff) as u8;
    out[2] = ((((ts >> 15) & 0x7f) as u8) << 1) | 1;
    out[3] = ((ts >> 7) & 0xff) as u8;
    out[4] = ((((ts) & 0x7f) as u8) << 1) | 1;
}

/// Decoded PES header fields (spec.md §4.4).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PesFields {
    /// Stream id (ISO/IEC 13818-1 Table 2-22).
    pub stream_id: u8,
    /// `PES_packet_length` as declared on the wire (0 means "unbounded", valid only for video).
    pub pes_packet_length: u16,
    /// Presentation timestamp, 90kHz ticks, if present.
    pub pts: Option<u64>,
    /// Decoding timestamp, 90kHz ticks, if present (only ever set alongside a PTS).
    pub dts: Option<u64>,
    /// Whether the payload immediately following the header starts a new access unit.
    pub data_alignment_indicator: bool,
}

/// Parses one PES packet's header (start code through the stuffing bytes), returning the decoded
/// fields and the remaining payload slice.
pub fn parse<'a>(reader: &mut SliceReader<'a>) -> WireResult<PesFields> {
    let header = read_bitfield!(reader, PesHeader);
    if header.packet_start_code_prefix() != PACKET_START_CODE_PREFIX {
        return Err(reader.make_error(WireErrorKind::BadPesHeader));
    }
    let optional = read_bitfield!(reader, PesOptionalHeader);
    let mut sub = reader.new_sub_reader(optional.pes_header_data_length() as usize)?;

    let mut pts = None;
    let mut dts = None;
    match optional.pts_dts_flags() {
        pts_dts_flags::PTS_ONLY => {
            pts = Some(parse_timestamp(sub.read_array_ref::<5>()?));
        }
        pts_dts_flags::PTS_AND_DTS => {
            pts = Some(parse_timestamp(sub.read_array_ref::<5>()?));
            dts = Some(parse_timestamp(sub.read_array_ref::<5>()?));
        }
        _ => {}
    }

    Ok(PesFields {
        stream_id: header.stream_id(),
        pes_packet_length: header.pes_packet_length(),
        pts,
        dts,
        data_alignment_indicator: optional.data_alignment_indicator(),
    })
}

/// Builds one PES header (start code through stuffing), padding `PES_header_data_length` with
/// stuffing bytes (`0xff`) so the whole header is at least `header_minimum` bytes
/// (spec.md §4.4; teletext uses [`PES_HEADER_SIZE_TELETEXT`]).
pub fn build(
    stream_id: u8,
    pes_packet_length: u16,
    pts: Option<u64>,
    dts: Option<u64>,
    data_alignment_indicator: bool,
    header_minimum: usize,
) -> Vec<u8> {
    let (pts_dts_flags, timestamp_bytes) = match (pts, dts) {
        (Some(_), Some(_)) => (pts_dts_flags::PTS_AND_DTS, 2 * TIMESTAMP_FIELD_SIZE),
        (Some(_), None) => (pts_dts_flags::PTS_ONLY, TIMESTAMP_FIELD_SIZE),
        _ => (pts_dts_flags::NONE, 0),
    };

    let natural_len = PES_HEADER_SIZE + timestamp_bytes;
    let stuffing = header_minimum.saturating_sub(natural_len);
    let header_data_length = timestamp_bytes + stuffing;

    let header = PesHeader::new()
        .with_packet_start_code_prefix(PACKET_START_CODE_PREFIX)
        .with_stream_id(stream_id)
        .with_pes_packet_length(pes_packet_length);
    let optional = PesOptionalHeader::new()
        .with_marker_bits(0b10)
        .with_scrambling_control(0)
        .with_priority(false)
        .with_data_alignment_indicator(data_alignment_indicator)
        .with_copyright(false)
        .with_original_or_copy(true)
        .with_pts_dts_flags(pts_dts_flags)
        .with_escr_flag(false)
        .with_es_rate_flag(false)
        .with_dsm_trick_mode_flag(false)
        .with_additional_copy_info_flag(false)
        .with_pes_crc_flag(false)
        .with_pes_extension_flag(false)
        .with_pes_header_data_length(header_data_length as u8);

    let mut out = Vec::with_capacity(PES_HEADER_SIZE + header_data_length);
    write_bitfield!(out, header);
    write_bitfield!(out, optional);

    if let Some(pts) = pts {
        let mut buf = [0u8; 5];
        let prefix = if dts.is_some() { 0b0011 } else { 0b0010 };
        write_timestamp(prefix, pts, &mut buf);
        out.extend_from_slice(&buf);
    }
    if let Some(dts) = dts {
        let mut buf = [0u8; 5];
        write_timestamp(0b0001, dts, &mut buf);
        out.extend_from_slice(&buf);
    }
    out.extend(std::iter::repeat(0xffu8).take(stuffing));
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_with_pts_and_dts() {
        let header = build(0xe0, 0, Some(123_456), Some(123_000), true, 0);
        let mut reader = SliceReader::new(&header);
        let fields = parse(&mut reader).unwrap();
        assert_eq!(fields.stream_id, 0xe0);
        assert_eq!(fields.pts, Some(123_456));
        assert_eq!(fields.dts, Some(123_000));
        assert!(fields.data_alignment_indicator);
    }

    #[test]
    fn round_trips_with_pts_only() {
        let header = build(0xc0, 0, Some(90_000), None, false, 0);
        let mut reader = SliceReader::new(&header);
        let fields = parse(&mut reader).unwrap();
        assert_eq!(fields.pts, Some(90_000));
        assert_eq!(fields.dts, None);
    }

    #[test]
    fn header_is_stuffed_to_minimum() {
        let header = build(0xbd, 0, None, None, false, PES_HEADER_SIZE_TELETEXT);
        assert_eq!(header.len(), PES_HEADER_SIZE_TELETEXT);
    }

    #[test]
    fn bad_start_code_is_rejected() {
        let mut header = build(0xe0, 0, None, None, false, 0);
        header[2] = 0xff;
        let mut reader = SliceReader::new(&header);
        assert!(matches!(
            parse(&mut reader),
            Err(e) if matches!(e.details(), WireErrorKind::BadPesHeader)
        ));
    }
}

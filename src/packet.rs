//! Bit-exact wire format for 188-byte MPEG-2 TS packets (ISO/IEC 13818-1 §2.4.3.2).

use crate::error::{WireErrorKind, WireResult};
use crate::slice_reader::SliceReader;
use crate::{read_bitfield, write_bitfield};
use modular_bitfield_msb::prelude::*;

/// Size in bytes of one TS packet. The mux's `mtu` (spec.md §3) is always a multiple of this.
pub const TS_SIZE: usize = 188;

/// Sync byte that must begin every TS packet.
pub const TS_SYNC_BYTE: u8 = 0x47;

/// PID reserved for null (stuffing) packets.
pub const PID_NULL: u16 = 0x1fff;

/// TSC information used in a packet's payload.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, BitfieldSpecifier)]
#[bits = 2]
pub enum TransportScramblingControl {
    /// Not scrambled.
    NotScrambled,
    /// Do not use.
    Reserved,
    /// Scrambled with even key.
    ScrambledEvenKey,
    /// Scrambled with odd key.
    ScrambledOddKey,
}

/// Link-layer header found at the start of every 188-byte MPEG-TS packet.
#[bitfield]
#[derive(Debug, Clone, Copy)]
pub struct PacketHeader {
    pub sync_byte: B8,
    pub tei: bool,
    pub pusi: bool,
    pub priority: bool,
    pub pid: B13,
    pub tsc: TransportScramblingControl,
    pub has_adaptation_field: bool,
    pub has_payload: bool,
    pub continuity_counter: B4,
}

impl PacketHeader {
    /// Builds a header for a payload-bearing (or adaptation-only) packet on `pid`.
    pub fn build(pid: u16, pusi: bool, has_adaptation_field: bool, has_payload: bool, cc: u8) -> Self {
        PacketHeader::new()
            .with_sync_byte(TS_SYNC_BYTE)
            .with_tei(false)
            .with_pusi(pusi)
            .with_priority(false)
            .with_pid(pid)
            .with_tsc(TransportScramblingControl::NotScrambled)
            .with_has_adaptation_field(has_adaptation_field)
            .with_has_payload(has_payload)
            .with_continuity_counter(cc)
    }
}

/// Packets may contain adaptation meta data in addition or in lieu of payload data. This header
/// specifies the particular type(s) of meta-data contained.
#[bitfield]
#[derive(Debug, Clone, Copy)]
pub struct AdaptationFieldHeader {
    pub length: B8,
    pub discontinuity: bool,
    pub random_access: bool,
    pub priority: bool,
    pub has_pcr: bool,
    pub has_opcr: bool,
    pub has_splice_countdown: bool,
    pub has_transport_private_data: bool,
    pub has_adaptation_field_extension: bool,
}

/// Expands to [`format_args`] for a 90kHz timestamp of any integer type.
///
/// Format is `<hours>:<minutes>:<seconds>:<90kHz-ticks>`.
#[macro_export]
macro_rules! pts_format_args {
    ($pts:expr) => {
        format_args!(
            "{}:{}:{}:{}",
            $pts / (90000 * 60 * 60),
            $pts / (90000 * 60) % 60,
            $pts / 90000 % 60,
            $pts % 90000
        )
    };
}

/// Program clock reference (PCR): synchronizes the decoder with the encoder.
///
/// Periodically sent for every program contained in the transport stream. `27 MHz = base*300 +
/// extension` per ISO/IEC 13818-1 §2.4.3.5.
#[derive(Default, Copy, Clone, PartialEq, Eq)]
pub struct PcrTimestamp {
    /// 33 bits of a 90kHz base clock. May be formatted with [`pts_format_args`].
    pub base: u64,
    /// 9 bits of a 27MHz clock rolling over every 300 counts to the base.
    pub extension: u16,
}

impl std::fmt::Debug for PcrTimestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PcrTimestamp")
            .field("base", &pts_format_args!(self.base))
            .field("extension", &self.extension)
            .finish()
    }
}

impl PcrTimestamp {
    /// Builds a PCR from a 27 MHz system-clock tick count (spec.md §3 `cr_sys`-style timestamp).
    pub fn from_27mhz(ticks: u64) -> Self {
        Self {
            base: (ticks / 300) & 0x1_ffff_ffff,
            extension: (ticks % 300) as u16,
        }
    }

    /// Converts back to a 27 MHz tick count.
    pub fn to_27mhz(self) -> u64 {
        self.base * 300 + self.extension as u64
    }

    fn parse(b: &[u8; 6]) -> Self {
        let mut base: u64 = (b[0] as u64) << 25;
        base |= (b[1] as u64) << 17;
        base |= (b[2] as u64) << 9;
        base |= (b[3] as u64) << 1;
        base |= (b[4] as u64) >> 7;

        let mut extension: u16 = ((b[4] & 0x1) as u16) << 8;
        extension |= b[5] as u16;
        PcrTimestamp { base, extension }
    }

    fn write(self, out: &mut [u8; 6]) {
        let base = self.base & 0x1_ffff_ffff;
        out[0] = (base >> 25) as u8;
        out[1] = (base >> 17) as u8;
        out[2] = (base >> 9) as u8;
        out[3] = (base >> 1) as u8;
        out[4] = (((base & 1) << 7) as u8) | 0x7e | (((self.extension >> 8) & 1) as u8);
        out[5] = (self.extension & 0xff) as u8;
    }
}

/// Non-payload packet metadata.
#[derive(Debug, Clone)]
pub struct AdaptationField {
    /// Header describing which fields are contained.
    pub header: AdaptationFieldHeader,
    /// Program Clock Reference.
    pub pcr: Option<PcrTimestamp>,
    /// Original Program Clock Reference.
    pub opcr: Option<PcrTimestamp>,
    /// Number of stuffing (0xff) bytes appended after the declared fields, to pad the
    /// adaptation field (and hence the packet) to exactly [`TS_SIZE`].
    pub stuffing: usize,
}

impl AdaptationField {
    /// Encoded length in bytes, including the 1-byte length prefix.
    pub fn encoded_len(&self) -> usize {
        1 + self.body_len()
    }

    fn body_len(&self) -> usize {
        1 + self.pcr.map_or(0, |_| 6) + self.opcr.map_or(0, |_| 6) + self.stuffing
    }

    /// Writes the adaptation field, including its length prefix, to `out`.
    pub fn write_to(&self, out: &mut Vec<u8>) {
        let header = self
            .header
            .with_length(self.body_len() as u8)
            .with_has_pcr(self.pcr.is_some())
            .with_has_opcr(self.opcr.is_some());
        write_bitfield!(out, header);
        if let Some(pcr) = self.pcr {
            let mut buf = [0u8; 6];
            pcr.write(&mut buf);
            out.extend_from_slice(&buf);
        }
        if let Some(opcr) = self.opcr {
            let mut buf = [0u8; 6];
            opcr.write(&mut buf);
            out.extend_from_slice(&buf);
        }
        out.extend(std::iter::repeat(0xffu8).take(self.stuffing));
    }

    pub(crate) fn parse(reader: &mut SliceReader) -> WireResult<Self> {
        let header = read_bitfield!(reader, AdaptationFieldHeader);
        let adaptation_field_length = header.length() as usize;
        if !(1..=183).contains(&adaptation_field_length) {
            return Err(reader.make_error(WireErrorKind::BadAdaptationHeader));
        }
        let mut a_reader = reader.new_sub_reader(adaptation_field_length - 1)?;
        let mut pcr = None;
        let mut opcr = None;
        if header.has_pcr() {
            if a_reader.remaining_len() < 6 {
                return Err(reader.make_error(WireErrorKind::BadAdaptationHeader));
            }
            pcr = Some(PcrTimestamp::parse(a_reader.read_array_ref::<6>()?));
        }
        if header.has_opcr() {
            if a_reader.remaining_len() < 6 {
                return Err(reader.make_error(WireErrorKind::BadAdaptationHeader));
            }
            opcr = Some(PcrTimestamp::parse(a_reader.read_array_ref::<6>()?));
        }
        let stuffing = a_reader.remaining_len();
        Ok(AdaptationField {
            header,
            pcr,
            opcr,
            stuffing,
        })
    }
}

/// Continuity counter: a 4-bit modulo-16 counter, local to one PID (spec.md §5, §8).
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ContinuityCounter(u8);

impl ContinuityCounter {
    /// Starting value.
    pub fn new() -> Self {
        ContinuityCounter(0)
    }

    /// Current value (0..=15).
    pub fn get(self) -> u8 {
        self.0
    }

    /// Sets the counter to an explicit value (`set_cc` control verb, spec.md §6), masked to 4 bits.
    pub fn set(&mut self, value: u8) {
        self.0 = value & 0x0f;
    }

    /// Advances the counter for one payload-bearing packet and returns the value that packet
    /// must carry.
    pub fn next(&mut self) -> u8 {
        let v = self.0;
        self.0 = (self.0 + 1) & 0x0f;
        v
    }
}

/// Parsed payload of a TS packet, before PSI/PES reassembly.
#[derive(Debug)]
pub enum Payload<'a> {
    /// Unhandled payload type, or a payload-unit-start packet whose payload is passed through
    /// unparsed (the mux only produces/consumes typed unit streams; raw passthrough exists for
    /// completeness of the read side).
    Raw(SliceReader<'a>),
}

/// Top-level parsed structure for one MPEG-TS packet, read side.
#[derive(Debug)]
pub struct Packet<'a> {
    /// Packet link-layer header.
    pub header: PacketHeader,
    /// Optional adaptation field metadata.
    pub adaptation_field: Option<AdaptationField>,
    /// Optional payload data.
    pub payload: Option<Payload<'a>>,
}

/// Parses exactly one 188-byte MPEG-TS packet's link-layer framing.
///
/// This only unwraps the TS layer (header, adaptation field, raw payload slice); PSI/PES
/// reassembly across multiple packets is handled by [`crate::psi::SectionAssembler`] and
/// [`crate::pes`] respectively, which the mux's own decoders drive directly rather than through
/// a general-purpose demuxer (out of scope, spec.md §1).
pub fn parse_packet(packet: &[u8; TS_SIZE]) -> WireResult<Packet<'_>> {
    let mut reader = SliceReader::new(packet);
    let header = read_bitfield!(reader, PacketHeader);
    if header.sync_byte() != TS_SYNC_BYTE {
        return Err(reader.make_error(WireErrorKind::LostSync));
    }

    let mut out = Packet {
        header,
        adaptation_field: None,
        payload: None,
    };

    if out.header.pid() == PID_NULL {
        return Ok(out);
    }

    if out.header.has_adaptation_field() {
        out.adaptation_field = Some(AdaptationField::parse(&mut reader)?);
    }
    if out.header.has_payload() {
        out.payload = Some(Payload::Raw(reader));
    }
    Ok(out)
}

/// Maximum payload bytes a packet can carry when it has no adaptation field at all.
pub const MAX_PAYLOAD_NO_ADAPTATION: usize = TS_SIZE - 4;

/// Maximum payload bytes a packet can carry when its adaptation field must also hold a PCR.
/// Callers fragmenting a PES into TS packets (`encaps`) must size the packet that is to carry a
/// PCR to at most this many payload bytes; a larger slice would overflow [`TS_SIZE`].
pub const MAX_PAYLOAD_WITH_PCR: usize = TS_SIZE - 4 - 2 - 6;

/// Builds one 188-byte TS packet carrying a payload fragment (and optional PCR), padding the
/// tail of `payload` with adaptation-field stuffing when it is shorter than the available space
/// (spec.md §4.4, ISO/IEC 13818-1 §2.4.3.4).
///
/// `payload` must fit within [`MAX_PAYLOAD_WITH_PCR`] when `pcr` is `Some`, or
/// [`MAX_PAYLOAD_NO_ADAPTATION`] otherwise; callers fragmenting a longer unit must split it
/// first (see `encaps::Encaps`).
pub fn build_packet(
    pid: u16,
    pusi: bool,
    cc: u8,
    pcr: Option<PcrTimestamp>,
    random_access: bool,
    discontinuity: bool,
    payload: &[u8],
) -> [u8; TS_SIZE] {
    debug_assert!(payload.len() <= if pcr.is_some() { MAX_PAYLOAD_WITH_PCR } else { MAX_PAYLOAD_NO_ADAPTATION });
    let mut out = Vec::with_capacity(TS_SIZE);
    let available_for_payload = TS_SIZE - 4;
    let needs_adaptation = pcr.is_some() || random_access || discontinuity || payload.len() < available_for_payload;

    let header = PacketHeader::build(pid, pusi, needs_adaptation, !payload.is_empty(), cc);
    write_bitfield!(out, header);

    if needs_adaptation {
        // `out` already holds the 4-byte packet header; what's left to budget for is the
        // adaptation field's own length+flags bytes (2) plus PCR, before `payload` and stuffing.
        let af_fixed_len = 2 + pcr.map_or(0, |_| 6);
        let stuffing = (TS_SIZE - out.len() - af_fixed_len).saturating_sub(payload.len());
        let af = AdaptationField {
            header: AdaptationFieldHeader::new()
                .with_discontinuity(discontinuity)
                .with_random_access(random_access)
                .with_priority(false),
            pcr,
            opcr: None,
            stuffing,
        };
        af.write_to(&mut out);
    }
    out.extend_from_slice(payload);
    debug_assert_eq!(out.len(), TS_SIZE, "TS packet must be exactly TS_SIZE bytes");
    let mut buf = [0u8; TS_SIZE];
    buf.copy_from_slice(&out);
    buf
}

/// Builds a stuffing (null) packet: PID 0x1fff, payload of 0xff bytes (spec.md §4.6 phase 2c).
pub fn build_padding_packet() -> [u8; TS_SIZE] {
    let mut out = [0xffu8; TS_SIZE];
    let header = PacketHeader::build(PID_NULL, false, false, true, 0);
    out[0..4].copy_from_slice(&header.into_bytes());
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn padding_packet_has_null_pid_and_sync_byte() {
        let pkt = build_padding_packet();
        assert_eq!(pkt[0], TS_SYNC_BYTE);
        let parsed = parse_packet(&pkt).unwrap();
        assert_eq!(parsed.header.pid(), PID_NULL);
    }

    #[test]
    fn built_packet_round_trips_header_fields() {
        let payload = [0xabu8; 180];
        let pkt = build_packet(257, true, 5, None, true, false, &payload);
        assert_eq!(pkt.len(), TS_SIZE);
        let parsed = parse_packet(&pkt).unwrap();
        assert_eq!(parsed.header.pid(), 257);
        assert!(parsed.header.pusi());
        assert_eq!(parsed.header.continuity_counter(), 5);
        let af = parsed.adaptation_field.unwrap();
        assert!(af.header.random_access());
    }

    #[test]
    fn pcr_round_trips_through_27mhz_conversion() {
        let pcr = PcrTimestamp::from_27mhz(27_000_000 * 5 + 42);
        assert_eq!(pcr.to_27mhz(), 27_000_000 * 5 + 42);
    }

    #[test]
    fn packet_with_pcr_carries_it_in_adaptation_field() {
        let pcr = PcrTimestamp::from_27mhz(123_456_789);
        let payload = [0x11u8; 100];
        let pkt = build_packet(257, false, 0, Some(pcr), false, false, &payload);
        let parsed = parse_packet(&pkt).unwrap();
        let af = parsed.adaptation_field.unwrap();
        assert_eq!(af.pcr.unwrap().to_27mhz(), pcr.to_27mhz());
    }

    #[test]
    fn continuity_counter_wraps_modulo_16() {
        let mut cc = ContinuityCounter::new();
        for i in 0..20u8 {
            assert_eq!(cc.next(), i % 16);
        }
    }

    #[test]
    fn lost_sync_is_rejected() {
        let mut pkt = build_padding_packet();
        pkt[0] = 0;
        assert!(matches!(
            parse_packet(&pkt),
            Err(e) if matches!(e.details(), WireErrorKind::LostSync)
        ));
    }
}

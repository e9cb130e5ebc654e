//! [`FlowDefinition`]: the typed description attached to every elementary stream and every PSI
//! table in flight (spec.md §3).

use num_rational::Ratio;

/// Coarse classification of an [`crate::input::Input`]'s payload (spec.md §3:
/// `input_type ∈ {UNKNOWN, VIDEO, AUDIO, OTHER, SCTE35}`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InputType {
    /// Type not yet known; the flow definition has not been set.
    Unknown,
    /// Video elementary stream.
    Video,
    /// Audio elementary stream.
    Audio,
    /// Anything else carried on its own PID (data, subtitles, teletext, ...).
    Other,
    /// SCTE-35 splice-information sidecar stream.
    Scte35,
}

/// Typed, MIME-like description of one elementary stream or PSI table (spec.md §3).
///
/// Flow definitions are immutable once stored; a change is published by constructing and
/// swapping in a new instance (`set_flow_def`), never mutated in place, matching the teacher's
/// treatment of its own parsed structures as owned, replaceable values.
#[derive(Debug, Clone, PartialEq)]
pub struct FlowDefinition {
    /// MIME-like tag, e.g. `"block.h264.pic."`, `"block.mp2.sound."`, `"void.scte35."`,
    /// `"block.mpegtspsi.mpegtspat."`.
    pub def: String,
    /// Wire-format tag (stream_type / table_id derived), kept distinct from `def` because
    /// several `def`s can share one `raw_def` (e.g. ADTS and LATM AAC).
    pub raw_def: String,
    /// PID this flow is or will be carried on.
    pub pid: u16,
    /// Service id (program number) this flow belongs to, 0 if not applicable.
    pub sid: u16,
    /// Declared octet rate in bytes/second.
    pub octetrate: u64,
    /// T-STD buffer size in bytes.
    pub buffer_size: usize,
    /// Frame rate, for video flows.
    pub fps: Option<Ratio<u32>>,
    /// Samples per frame, for audio flows.
    pub samples: Option<u32>,
    /// Sample rate in Hz, for audio flows.
    pub rate: Option<u32>,
    /// Channel count, for audio flows.
    pub channels: Option<u8>,
    /// T-STD transport-buffer drain rate in bytes/second (spec.md §4.3).
    pub tb_rate: u64,
    /// PES stream id to use when packetizing (ISO/IEC 13818-1 Table 2-22).
    pub pes_id: u8,
    /// Minimum PES header size for this flow (`PES_HEADER_SIZE_PTS`/`_PTSDTS`/teletext's fixed 45).
    pub pes_header_minimum: usize,
    /// Minimum duration, in 27MHz ticks, to accumulate before emitting a PES (spec.md §4.4).
    pub pes_min_duration: u64,
    /// Whether PES payload start must be aligned on a TS packet boundary.
    pub pes_alignment: bool,
    /// Maximum retention delay in 27MHz ticks before a T-STD `ERR_INVALID` is raised
    /// (spec.md §4.2/§4.3).
    pub max_delay: u64,
    /// Opaque ordered descriptor byte slices, carried through from/to PSI (spec.md §4.2).
    pub descriptors: Vec<crate::psi::Descriptor>,
    /// End-to-end latency of this flow, in 27MHz ticks.
    pub latency: u64,
}

/// Max retention delays by `def` prefix (spec.md §4.2), in 27MHz ticks.
pub mod max_delay {
    /// 27MHz clock frequency.
    pub const UCLOCK_FREQ: u64 = 27_000_000;
    /// Generic picture streams.
    pub const PIC: u64 = UCLOCK_FREQ;
    /// H.264/H.265/MPEG-4 streams (ISO/IEC 14496 retention bound).
    pub const MPEG4: u64 = UCLOCK_FREQ * 10;
    /// Still-picture streams.
    pub const STILL: u64 = UCLOCK_FREQ * 60;
    /// Teletext: tight, driven by the codec (ETSI EN 300 472 §5), one video frame worth.
    pub const TELETEXT: u64 = UCLOCK_FREQ / 25;
    /// DVB subtitles: unbounded in practice, modeled as [`STILL`].
    pub const DVB_SUBTITLE: u64 = STILL;
    /// SCTE-35: unbounded.
    pub const SCTE35: u64 = u64::MAX;
}

impl FlowDefinition {
    /// Returns the max retention delay that applies to this flow's `def`, per spec.md §4.2.
    pub fn default_max_delay(&self) -> u64 {
        if self.def.starts_with("void.scte35.") {
            max_delay::SCTE35
        } else if self.def.contains("teletext") {
            max_delay::TELETEXT
        } else if self.def.contains("dvbsub") {
            max_delay::DVB_SUBTITLE
        } else if self.def.starts_with("block.h264.") || self.def.starts_with("block.h265.") || self.def.starts_with("block.mpeg4.") {
            max_delay::MPEG4
        } else if self.def.contains("still") {
            max_delay::STILL
        } else {
            max_delay::PIC
        }
    }

    /// Coarse [`InputType`] inferred from `def`, used by [`crate::program::Program`] to pick a
    /// PCR carrier (spec.md §3 Program invariant: video takes precedence over audio).
    pub fn input_type(&self) -> InputType {
        if self.def.starts_with("void.scte35.") {
            InputType::Scte35
        } else if self.def.contains(".pic.") || self.def.starts_with("block.h264.") || self.def.starts_with("block.h265.") {
            InputType::Video
        } else if self.def.contains(".sound.") {
            InputType::Audio
        } else {
            InputType::Other
        }
    }

    /// ISO/IEC 13818-1 Table 2-34 `stream_type` this flow should be declared as in a PMT entry
    /// (spec.md §4.2 PMT generator direction: "stream-type -> def/raw_def"). Not exhaustive —
    /// codecs without a registered MPEG-2 stream type (Opus, S302M, ...) fall back to
    /// `STREAM_TYPE_PRIVATE_DATA` and rely on a registration descriptor (tag 0x05) to identify
    /// themselves, matching how this crate's PMT decoder treats tag 0x05 on the read side.
    pub fn stream_type(&self) -> u8 {
        match self.def.as_str() {
            "block.mpeg1video.pic." => stream_type::MPEG1_VIDEO,
            "block.mpeg2video.pic." => stream_type::MPEG2_VIDEO,
            "block.h264.pic." => stream_type::H264,
            "block.h265.pic." => stream_type::H265,
            "block.mpeg4.pic." => stream_type::MPEG4_VISUAL,
            "block.mp2.sound." => stream_type::MPEG1_AUDIO,
            "block.aac.sound." if self.raw_def == "adts" => stream_type::AAC_ADTS,
            "block.aac.sound." => stream_type::AAC_LATM,
            "block.ac3.sound." => stream_type::PRIVATE_DATA,
            "void.scte35." => stream_type::SCTE35,
            _ => stream_type::PRIVATE_DATA,
        }
    }
}

/// ISO/IEC 13818-1 Table 2-34 `stream_type` values this crate generates or recognizes
/// (non-exhaustive, spec.md §4.2).
pub mod stream_type {
    /// ISO/IEC 11172-2 video.
    pub const MPEG1_VIDEO: u8 = 0x01;
    /// ISO/IEC 13818-2 video.
    pub const MPEG2_VIDEO: u8 = 0x02;
    /// ISO/IEC 11172-3 audio.
    pub const MPEG1_AUDIO: u8 = 0x03;
    /// ISO/IEC 14496-2 (MPEG-4 Visual).
    pub const MPEG4_VISUAL: u8 = 0x10;
    /// ISO/IEC 14496-10 (H.264/AVC).
    pub const H264: u8 = 0x1b;
    /// ITU-T H.265/HEVC.
    pub const H265: u8 = 0x24;
    /// ISO/IEC 13818-7 ADTS-framed AAC.
    pub const AAC_ADTS: u8 = 0x0f;
    /// ISO/IEC 14496-3 LATM-framed AAC.
    pub const AAC_LATM: u8 = 0x11;
    /// SCTE-35 `splice_info_section`.
    pub const SCTE35: u8 = 0x86;
    /// User private (ISO/IEC 13818-1 Table 2-34); a registration descriptor (tag 0x05) or
    /// DVB-reserved AC-3/E-AC-3/DTS descriptor refines this further.
    pub const PRIVATE_DATA: u8 = 0x06;
}

impl FlowDefinition {
    /// Builds a minimal flow definition for a PSI section carrier on `pid` (spec.md §4.4
    /// `encaps`'s PSI mode is selected by the `block.mpegtspsi.` `def` prefix).
    pub fn psi(pid: u16) -> Self {
        FlowDefinition {
            def: "block.mpegtspsi.".to_string(),
            raw_def: String::new(),
            pid,
            sid: 0,
            octetrate: 0,
            buffer_size: 0,
            fps: None,
            samples: None,
            rate: None,
            channels: None,
            tb_rate: u64::MAX,
            pes_id: 0,
            pes_header_minimum: 0,
            pes_min_duration: 0,
            pes_alignment: false,
            max_delay: u64::MAX,
            descriptors: Vec::new(),
            latency: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fd(def: &str) -> FlowDefinition {
        FlowDefinition {
            def: def.to_string(),
            raw_def: String::new(),
            pid: 0,
            sid: 0,
            octetrate: 0,
            buffer_size: 0,
            fps: None,
            samples: None,
            rate: None,
            channels: None,
            tb_rate: 0,
            pes_id: 0,
            pes_header_minimum: 0,
            pes_min_duration: 0,
            pes_alignment: false,
            max_delay: 0,
            descriptors: Vec::new(),
            latency: 0,
        }
    }

    #[test]
    fn video_takes_precedence_classification() {
        assert_eq!(fd("block.h264.pic.").input_type(), InputType::Video);
        assert_eq!(fd("block.mp2.sound.").input_type(), InputType::Audio);
        assert_eq!(fd("void.scte35.").input_type(), InputType::Scte35);
    }

    #[test]
    fn max_delay_by_def() {
        assert_eq!(fd("block.h264.pic.").default_max_delay(), max_delay::MPEG4);
        assert_eq!(fd("block.mp2.sound.").default_max_delay(), max_delay::PIC);
        assert_eq!(fd("void.scte35.").default_max_delay(), max_delay::SCTE35);
    }
}

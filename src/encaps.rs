//! TS encapsulator (spec.md §4.4): fragments one elementary-stream flow — or, in PSI mode, a
//! repeating PSI section — into 188-byte TS packets, attaching PES headers, adaptation fields,
//! PCRs and random-access flags as the flow definition requires.
//!
//! A single [`Encaps`] serves both roles the mux needs (spec.md §3 `PsiPid` also "holds... an
//! `encaps`"): a PES-wrapped elementary stream, or a raw PSI section stream (pointer-field
//! framed, no PES header at all). [`Encaps::set_flow_def`] tells which mode applies from the
//! flow definition's `def` prefix.

use crate::error::MuxError;
use crate::flow_def::FlowDefinition;
use crate::packet::{self, ContinuityCounter, PcrTimestamp, MAX_PAYLOAD_NO_ADAPTATION, MAX_PAYLOAD_WITH_PCR};
use crate::pes;
use crate::uref::{Ubuf, Uref};
use bytes::Bytes;
use log::warn;
use std::collections::VecDeque;

const UCLOCK_FREQ: u64 = 27_000_000;

/// Status snapshot, refreshed every time the head of the internal queue changes
/// (spec.md §4.4 `STATUS` event).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Status {
    /// Earliest moment the next TS packet from this carrier must be emitted.
    pub cr_sys: u64,
    /// Decoding timestamp of the unit currently at the head of the queue.
    pub dts_sys: u64,
    /// `Some(pcr_sys)` if this carrier must insert a PCR in the very next packet it emits.
    pub pcr_sys: Option<u64>,
    /// Whether this carrier has anything to send at all.
    pub ready: bool,
}

#[derive(Debug)]
struct PesFragment {
    data: Bytes,
    offset: usize,
    cr_sys: u64,
    dts_sys: u64,
    random: bool,
}

/// Fragments one flow's units into 188-byte TS packets (spec.md §4.4).
#[derive(Debug)]
pub struct Encaps {
    pid: u16,
    flow: Option<FlowDefinition>,
    is_psi: bool,
    is_pcr_carrier: bool,
    pcr_interval: u64,
    tb_size: usize,
    max_delay: u64,
    max_length: usize,
    cr_prog_offset: u64,
    cc: ContinuityCounter,
    queue: VecDeque<Uref>,
    current: Option<PesFragment>,
    last_pcr_sys: Option<u64>,
    eos: bool,
}

impl Encaps {
    /// Creates an encapsulator for `pid`, unconfigured until [`Self::set_flow_def`] is called.
    pub fn new(pid: u16) -> Self {
        Self {
            pid,
            flow: None,
            is_psi: false,
            is_pcr_carrier: false,
            pcr_interval: UCLOCK_FREQ / 10,
            tb_size: 0,
            max_delay: u64::MAX,
            max_length: 256,
            cr_prog_offset: 0,
            cc: ContinuityCounter::new(),
            queue: VecDeque::new(),
            current: None,
            last_pcr_sys: None,
            eos: false,
        }
    }

    /// PID this carrier emits on.
    pub fn pid(&self) -> u16 {
        self.pid
    }

    /// Configures PID, PES stream id, header minimum, alignment and max_delay from `fd`
    /// (spec.md §4.4 `set_flow_def`). Sections carried under a `block.mpegtspsi.` def are
    /// emitted pointer-field framed rather than PES-wrapped.
    pub fn set_flow_def(&mut self, fd: &FlowDefinition) {
        self.is_psi = fd.def.starts_with("block.mpegtspsi.");
        self.max_delay = fd.max_delay;
        self.pid = fd.pid;
        self.flow = Some(fd.clone());
    }

    /// Marks this carrier as the program's PCR carrier, repeating at most every `pcr_interval`
    /// 27MHz ticks (spec.md §3 Program invariant, §4.4 PCR insertion policy).
    pub fn set_pcr_carrier(&mut self, is_carrier: bool, pcr_interval: u64) {
        self.is_pcr_carrier = is_carrier;
        self.pcr_interval = pcr_interval.max(1);
    }

    /// `set_tb_size` control verb (informational; rate shaping itself lives in [`crate::tstd`]).
    pub fn set_tb_size(&mut self, tb_size: usize) {
        self.tb_size = tb_size;
    }

    /// `set_max_delay` control verb.
    pub fn set_max_delay(&mut self, max_delay: u64) {
        self.max_delay = max_delay;
    }

    /// `set_cr_prog` control verb: initial program timestamp offset.
    pub fn set_cr_prog(&mut self, cr_prog: u64) {
        self.cr_prog_offset = cr_prog;
    }

    /// `set_max_length` control verb: bounds the internal queue depth.
    pub fn set_max_length(&mut self, max_length: usize) {
        self.max_length = max_length.max(1);
    }

    /// Current continuity counter value for this PID.
    pub fn get_cc(&self) -> u8 {
        self.cc.get()
    }

    /// `set_cc` control verb.
    pub fn set_cc(&mut self, value: u8) {
        self.cc.set(value);
    }

    /// Marks end-of-stream: once the queue and any in-flight fragment drain, [`Self::is_drained`]
    /// becomes true.
    pub fn eos(&mut self) {
        self.eos = true;
    }

    /// Drops every queued and in-flight unit immediately (`flush` control verb).
    pub fn flush(&mut self) {
        self.queue.clear();
        self.current = None;
    }

    /// Accepts one PES-ready (or, in PSI mode, section-ready) uref. Drops the oldest queued unit
    /// first if `max_length` would otherwise be exceeded (spec.md §4.4 queue limits), logging the
    /// drop at `warn`.
    pub fn input(&mut self, uref: Uref) {
        if self.queue.len() >= self.max_length {
            warn!("encaps PID {:x}: max_length reached, dropping oldest queued unit", self.pid);
            self.queue.pop_front();
        }
        self.queue.push_back(uref);
    }

    /// Drops any queued unit whose `dts_sys + max_delay` has already passed `now`, raising the
    /// `max_delay` error of spec.md §4.4/§7 (`INVALID`, recovered by dropping the unit).
    fn drop_overdue(&mut self, now: u64) {
        while let Some(front) = self.queue.front() {
            if front.dts_sys.saturating_add(self.max_delay) < now {
                warn!(
                    "{}",
                    MuxError::Invalid(format!(
                        "encaps PID {:x}: unit exceeded max_delay ({} > {})",
                        self.pid, now, front.dts_sys
                    ))
                );
                self.queue.pop_front();
            } else {
                break;
            }
        }
    }

    fn start_fragment(&self, uref: Uref) -> PesFragment {
        let dts_sys = uref.dts_sys;
        let cr_sys = uref.cr_sys;
        let random = uref.random;
        let dts_pts_delay = uref.dts_pts_delay;
        let payload = uref.ubuf.unwrap_or_default();

        if self.is_psi {
            // Pointer-field framing (ISO/IEC 13818-1 §2.4.4.1): a single 0x00 byte ahead of the
            // section, since this carrier always starts a fresh section at the packet boundary.
            let mut data = Vec::with_capacity(1 + payload.len());
            data.push(0x00);
            data.extend_from_slice(&payload);
            return PesFragment {
                data: Bytes::from(data),
                offset: 0,
                cr_sys,
                dts_sys,
                random: false,
            };
        }

        let flow = self.flow.as_ref();
        let header_minimum = flow.map_or(0, |f| f.pes_header_minimum);
        let alignment = flow.map_or(false, |f| f.pes_alignment);
        let stream_id = flow.map_or(0xe0, |f| f.pes_id);

        let pts90 = Some((cr_sys + dts_pts_delay) / 300);
        let dts90 = if dts_pts_delay > 0 { Some(dts_sys / 300) } else { None };

        let pes_packet_length = if dts_pts_delay > 0 {
            // Streams that carry a DTS distinct from their PTS are video-like and use the
            // unbounded `pes_packet_length = 0` form (ISO/IEC 13818-1 §2.4.3.7).
            0
        } else {
            let natural = pes::PES_HEADER_SIZE_PTS.max(header_minimum) - 6 + payload.len();
            u16::try_from(natural).unwrap_or(0)
        };

        let header = pes::build(stream_id, pes_packet_length, pts90, dts90, alignment, header_minimum);
        let mut data = Vec::with_capacity(header.len() + payload.len());
        data.extend_from_slice(&header);
        data.extend_from_slice(&payload);

        PesFragment {
            data: Bytes::from(data),
            offset: 0,
            cr_sys,
            dts_sys,
            random,
        }
    }

    /// Status snapshot as of `now` (spec.md §4.4 `STATUS` event). Also drops any overdue queued
    /// unit, so callers should poll this before deciding whether to splice.
    pub fn status(&mut self, now: u64) -> Status {
        self.drop_overdue(now);

        let head = self
            .current
            .as_ref()
            .map(|f| (f.cr_sys, f.dts_sys))
            .or_else(|| self.queue.front().map(|u| (u.cr_sys, u.dts_sys)));

        match head {
            Some((cr_sys, dts_sys)) => {
                let pcr_due = self.is_pcr_carrier
                    && self.last_pcr_sys.map_or(true, |lp| cr_sys >= lp + self.pcr_interval || now >= lp + self.pcr_interval);
                Status {
                    cr_sys,
                    dts_sys,
                    pcr_sys: if pcr_due { Some(cr_sys.min(now)) } else { None },
                    ready: true,
                }
            }
            None => Status {
                cr_sys: now,
                dts_sys: now,
                pcr_sys: None,
                ready: false,
            },
        }
    }

    /// True once end-of-stream has been requested and no data remains queued or in flight
    /// (drives the mux's "deleted-but-draining" reaping, spec.md §5).
    pub fn is_drained(&self) -> bool {
        self.eos && self.current.is_none() && self.queue.is_empty()
    }

    /// Produces the next 188-byte TS packet due in `[now, deadline)`, or `None` if nothing is
    /// due yet. Returns the packet bytes and the `dts_sys` of the unit it was cut from (spec.md
    /// §4.4 `splice`).
    pub fn splice(&mut self, now: u64, deadline: u64) -> Option<(Ubuf, u64)> {
        if self.current.is_none() {
            let uref = self.queue.pop_front()?;
            self.current = Some(self.start_fragment(uref));
        }

        let frag_cr_sys = self.current.as_ref().unwrap().cr_sys;
        if frag_cr_sys > deadline {
            return None;
        }

        let frag = self.current.as_mut().unwrap();
        let remaining = &frag.data[frag.offset..];

        let want_pcr = self.is_pcr_carrier
            && (self.last_pcr_sys.is_none() || now >= self.last_pcr_sys.unwrap() + self.pcr_interval);
        let max_payload = if want_pcr { MAX_PAYLOAD_WITH_PCR } else { MAX_PAYLOAD_NO_ADAPTATION };
        let take = remaining.len().min(max_payload);
        let payload = &remaining[..take];

        let pusi = frag.offset == 0;
        let random_access = pusi && frag.random;
        let pcr = want_pcr.then(|| PcrTimestamp::from_27mhz(now));
        let dts_sys = frag.dts_sys;
        let cc = self.cc.next();

        let packet_bytes = packet::build_packet(self.pid, pusi, cc, pcr, random_access, false, payload);

        if want_pcr {
            self.last_pcr_sys = Some(now);
        }
        frag.offset += take;
        if frag.offset >= frag.data.len() {
            self.current = None;
        }

        Some((Bytes::copy_from_slice(&packet_bytes), dts_sys))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow_def::FlowDefinition;
    use crate::packet::{parse_packet, TS_SIZE};

    fn flow(def: &str, pid: u16) -> FlowDefinition {
        FlowDefinition {
            def: def.to_string(),
            raw_def: String::new(),
            pid,
            sid: 1,
            octetrate: 1_000_000,
            buffer_size: 0,
            fps: None,
            samples: None,
            rate: None,
            channels: None,
            tb_rate: 1_000_000,
            pes_id: 0xe0,
            pes_header_minimum: pes::PES_HEADER_SIZE_PTS,
            pes_min_duration: 0,
            pes_alignment: true,
            max_delay: UCLOCK_FREQ,
            descriptors: Vec::new(),
            latency: 0,
        }
    }

    #[test]
    fn splices_a_small_frame_into_one_packet() {
        let mut e = Encaps::new(257);
        e.set_flow_def(&flow("block.h264.pic.", 257));
        let payload = Bytes::from_static(&[0xaa; 100]);
        e.input(Uref::new(payload, 1000, 900));

        let (pkt, dts_sys) = e.splice(0, 2000).expect("packet ready");
        assert_eq!(pkt.len(), TS_SIZE);
        assert_eq!(dts_sys, 900);
        let parsed = parse_packet(pkt[..].try_into().unwrap()).unwrap();
        assert!(parsed.header.pusi());
        assert_eq!(parsed.header.pid(), 257);
    }

    #[test]
    fn large_frame_fragments_across_multiple_packets() {
        let mut e = Encaps::new(257);
        e.set_flow_def(&flow("block.h264.pic.", 257));
        let payload = Bytes::from(vec![0x55u8; 1000]);
        e.input(Uref::new(payload, 0, 0));

        let mut packets = Vec::new();
        loop {
            match e.splice(0, 1_000_000) {
                Some((pkt, _)) => packets.push(pkt),
                None => break,
            }
        }
        assert!(packets.len() > 1);
        let parsed0 = parse_packet(packets[0][..].try_into().unwrap()).unwrap();
        assert!(parsed0.header.pusi());
        for pkt in &packets[1..] {
            let parsed = parse_packet(pkt[..].try_into().unwrap()).unwrap();
            assert!(!parsed.header.pusi());
        }
    }

    #[test]
    fn pcr_carrier_inserts_pcr_on_first_packet() {
        let mut e = Encaps::new(257);
        e.set_flow_def(&flow("block.h264.pic.", 257));
        e.set_pcr_carrier(true, UCLOCK_FREQ / 10);
        e.input(Uref::new(Bytes::from_static(&[0; 50]), 0, 0));

        let (pkt, _) = e.splice(0, 1000).unwrap();
        let parsed = parse_packet(pkt[..].try_into().unwrap()).unwrap();
        assert!(parsed.adaptation_field.unwrap().pcr.is_some());
    }

    #[test]
    fn continuity_counter_increments_per_payload_packet() {
        let mut e = Encaps::new(257);
        e.set_flow_def(&flow("block.h264.pic.", 257));
        e.input(Uref::new(Bytes::from(vec![0x11u8; 600]), 0, 0));
        let mut ccs = Vec::new();
        while let Some((pkt, _)) = e.splice(0, 1_000_000) {
            let parsed = parse_packet(pkt[..].try_into().unwrap()).unwrap();
            ccs.push(parsed.header.continuity_counter());
        }
        for w in ccs.windows(2) {
            assert_eq!(w[1], (w[0] + 1) % 16);
        }
    }

    #[test]
    fn psi_mode_uses_pointer_field_instead_of_pes() {
        let mut e = Encaps::new(0);
        e.set_flow_def(&flow("block.mpegtspsi.mpegtspat.", 0));
        e.input(Uref::new(Bytes::from_static(&[1, 2, 3, 4]), 0, 0));
        let (pkt, _) = e.splice(0, 1000).unwrap();
        let parsed = parse_packet(pkt[..].try_into().unwrap()).unwrap();
        assert!(parsed.header.pusi());
    }

    #[test]
    fn not_ready_before_cr_sys() {
        let mut e = Encaps::new(257);
        e.set_flow_def(&flow("block.h264.pic.", 257));
        e.input(Uref::new(Bytes::from_static(&[0; 10]), 5000, 5000));
        assert!(e.splice(0, 1000).is_none());
    }

    #[test]
    fn overdue_unit_is_dropped_from_status() {
        let mut e = Encaps::new(257);
        e.set_flow_def(&flow("block.h264.pic.", 257));
        e.set_max_delay(10);
        e.input(Uref::new(Bytes::from_static(&[0; 10]), 0, 0));
        let status = e.status(1000);
        assert!(!status.ready);
    }

    #[test]
    fn max_length_drops_oldest() {
        let mut e = Encaps::new(257);
        e.set_flow_def(&flow("block.h264.pic.", 257));
        e.set_max_length(1);
        e.input(Uref::new(Bytes::from_static(&[0; 10]), 0, 0));
        e.input(Uref::new(Bytes::from_static(&[1; 10]), 100, 100));
        assert_eq!(e.queue.len(), 1);
        assert_eq!(e.queue.front().unwrap().dts_sys, 100);
    }
}

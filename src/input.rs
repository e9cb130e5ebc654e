//! [`Input`]: one elementary stream flowing through the mux, from T-STD admission through
//! PES/TS encapsulation (spec.md §3, §4.2/§4.3/§4.4).

use crate::encaps::{Encaps, Status};
use crate::error::MuxResult;
use crate::flow_def::{FlowDefinition, InputType};
use crate::tstd::Tstd;
use crate::uref::{Ubuf, Uref};

/// Lifecycle state of an [`Input`] (spec.md §3 Input invariant: a deleted input keeps draining
/// its queue rather than disappearing mid-splice).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputState {
    /// Created but no flow definition set yet; cannot admit units.
    Unconfigured,
    /// Normal operation.
    Active,
    /// `delete()` was called; no new units are accepted, but queued/in-flight units still drain.
    DeletedDraining,
}

/// One elementary stream: a T-STD buffer model feeding a PES/TS encapsulator
/// (spec.md §4.2 Input, combining §4.3 `tstd` and §4.4 `encaps`).
#[derive(Debug)]
pub struct Input {
    pid: u16,
    state: InputState,
    flow: Option<FlowDefinition>,
    input_type: InputType,
    is_pcr_carrier: bool,
    /// Order in which this input was added to its program, used to break PCR-carrier ties
    /// between inputs of the same [`InputType`] (spec.md §3 Program invariant: first-inserted
    /// wins).
    insertion_order: u64,
    tstd: Tstd,
    encaps: Encaps,
}

impl Input {
    /// Creates an unconfigured input on `pid`, recording its `insertion_order` within its
    /// program for PCR-carrier tie-breaking.
    pub fn new(pid: u16, insertion_order: u64) -> Self {
        Self {
            pid,
            state: InputState::Unconfigured,
            flow: None,
            input_type: InputType::Unknown,
            is_pcr_carrier: false,
            insertion_order,
            tstd: Tstd::new(u64::MAX, u64::MAX),
            encaps: Encaps::new(pid),
        }
    }

    /// The carried PID.
    pub fn pid(&self) -> u16 {
        self.pid
    }

    /// This input's insertion order within its program.
    pub fn insertion_order(&self) -> u64 {
        self.insertion_order
    }

    /// Coarse type classification, used by [`crate::program::Program`] to pick a PCR carrier.
    pub fn input_type(&self) -> InputType {
        self.input_type
    }

    /// Whether this input is its program's current PCR carrier.
    pub fn is_pcr_carrier(&self) -> bool {
        self.is_pcr_carrier
    }

    /// Marks or unmarks this input as the program's PCR carrier, repeating the PCR at most every
    /// `pcr_interval` 27MHz ticks (spec.md §4.4 PCR insertion policy).
    pub fn set_pcr_carrier(&mut self, is_carrier: bool, pcr_interval: u64) {
        self.is_pcr_carrier = is_carrier;
        self.encaps.set_pcr_carrier(is_carrier, pcr_interval);
    }

    /// Declares or replaces this input's flow definition, deriving its [`InputType`], rebuilding
    /// the T-STD model from `tb_rate`/`max_delay`, and reconfiguring the encapsulator
    /// (spec.md §4.2 `set_flow_def`).
    ///
    /// A free-format MPEG audio flow (`def == "block.mp2.sound."`, no declared `tb_rate`: the
    /// frame header carries no bit-rate field) has its T-STD buffer switched into free-format
    /// octetrate detection, refining `tb_rate` from observed frame sizes instead of trusting a
    /// caller-declared rate that doesn't exist (spec.md §9 Open Question).
    pub fn set_flow_def(&mut self, fd: FlowDefinition) {
        self.input_type = fd.input_type();
        let mut tstd = Tstd::new(fd.tb_rate, fd.max_delay);
        if fd.def == "block.mp2.sound." && fd.tb_rate == 0 {
            if let (Some(samples), Some(rate)) = (fd.samples, fd.rate) {
                tstd.enable_free_format(samples, rate);
            }
        }
        self.tstd = tstd;
        self.encaps.set_flow_def(&fd);
        self.encaps.set_max_delay(fd.max_delay);
        self.state = InputState::Active;
        self.flow = Some(fd);
    }

    /// Currently declared flow definition, if any.
    pub fn flow_def(&self) -> Option<&FlowDefinition> {
        self.flow.as_ref()
    }

    /// Admits one unit arriving at `arrival_sys`, running it through the T-STD model and queuing
    /// it for encapsulation at the computed departure tick (spec.md §4.2/§4.3). Units are
    /// rejected once the input has been deleted, or before a flow definition has been set.
    pub fn input(&mut self, arrival_sys: u64, uref: Uref) -> MuxResult<()> {
        if self.state != InputState::Active {
            return Err(crate::error::MuxError::Invalid(
                "input is not active".to_string(),
            ));
        }
        let dts_sys = uref.dts_sys;
        let cr_sys = self.tstd.admit(arrival_sys, dts_sys, uref.len())?;
        let mut uref = uref;
        uref.cr_sys = cr_sys;
        self.encaps.input(uref);
        Ok(())
    }

    /// Current readiness of this input (spec.md §4.4 `STATUS`).
    pub fn status(&mut self, now: u64) -> Status {
        self.encaps.status(now)
    }

    /// Emits the next TS packet due at or before `deadline`, if any.
    pub fn splice(&mut self, now: u64, deadline: u64) -> Option<(Ubuf, u64)> {
        self.encaps.splice(now, deadline)
    }

    /// Marks this input for removal: no further units are admitted, but the queue already held
    /// keeps draining (spec.md §3 Input invariant).
    pub fn delete(&mut self) {
        self.state = InputState::DeletedDraining;
        self.encaps.eos();
    }

    /// True once `delete()` has been called.
    pub fn is_deleted(&self) -> bool {
        self.state == InputState::DeletedDraining
    }

    /// True once a deleted input has emitted every queued unit and may be dropped
    /// (spec.md §3 Input invariant).
    pub fn is_drained(&self) -> bool {
        self.is_deleted() && self.encaps.is_drained()
    }

    /// Discards any queued, not-yet-spliced units without emitting them.
    pub fn flush(&mut self) {
        self.encaps.flush();
    }

    /// Current continuity counter value for this input's PID.
    pub fn get_cc(&self) -> u8 {
        self.encaps.get_cc()
    }

    /// Overrides this input's continuity counter (spec.md §6 `set_cc`, used when resuming a
    /// remux onto a PID a previous process already primed).
    pub fn set_cc(&mut self, value: u8) {
        self.encaps.set_cc(value)
    }

    /// Sets the initial program-clock-reference offset applied to this input's encapsulation
    /// (spec.md §6 `set_cr_prog`).
    pub fn set_cr_prog(&mut self, cr_prog: u64) {
        self.encaps.set_cr_prog(cr_prog);
    }

    /// Declared octetrate of this input's flow, 0 if unconfigured.
    pub fn octetrate(&self) -> u64 {
        self.flow.as_ref().map_or(0, |fd| fd.octetrate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn video_fd(pid: u16) -> FlowDefinition {
        FlowDefinition {
            def: "block.h264.pic.".to_string(),
            raw_def: String::new(),
            pid,
            sid: 1,
            octetrate: 1_000_000,
            buffer_size: 229376,
            fps: None,
            samples: None,
            rate: None,
            channels: None,
            tb_rate: 2_000_000,
            pes_id: 0xe0,
            pes_header_minimum: 14,
            pes_min_duration: 0,
            pes_alignment: true,
            max_delay: 27_000_000,
            descriptors: Vec::new(),
            latency: 0,
        }
    }

    #[test]
    fn unconfigured_input_rejects_units() {
        let mut input = Input::new(256, 0);
        let uref = Uref::new(Ubuf::from(vec![0u8; 10]), 0, 0);
        assert!(input.input(0, uref).is_err());
    }

    #[test]
    fn configured_input_classifies_and_admits() {
        let mut input = Input::new(256, 0);
        input.set_flow_def(video_fd(256));
        assert_eq!(input.input_type(), InputType::Video);
        let uref = Uref::new(Ubuf::from(vec![0u8; 1000]), 27_000_000, 27_000_000);
        assert!(input.input(0, uref).is_ok());
        assert!(input.status(0).ready);
    }

    #[test]
    fn delete_drains_then_reports_drained() {
        let mut input = Input::new(256, 0);
        input.set_flow_def(video_fd(256));
        let uref = Uref::new(Ubuf::from(vec![0u8; 100]), 0, 0);
        input.input(0, uref).unwrap();
        input.delete();
        assert!(input.is_deleted());
        assert!(!input.is_drained());
        while input.splice(0, u64::MAX).is_some() {}
        assert!(input.is_drained());
    }

    #[test]
    fn free_format_audio_input_refines_tb_rate_from_frame_sizes() {
        let mut input = Input::new(257, 0);
        let fd = FlowDefinition {
            def: "block.mp2.sound.".to_string(),
            raw_def: String::new(),
            pid: 257,
            sid: 1,
            octetrate: 0,
            buffer_size: 4096,
            fps: None,
            samples: Some(1152),
            rate: Some(44100),
            channels: Some(2),
            tb_rate: 0,
            pes_id: 0xc0,
            pes_header_minimum: 14,
            pes_min_duration: 0,
            pes_alignment: true,
            max_delay: 27_000_000,
            descriptors: Vec::new(),
            latency: 0,
        };
        input.set_flow_def(fd);

        // Before any frame is observed, admission would otherwise stall at an unusable 1 B/s
        // `tb_rate`; the first admitted frame must already refine it to a usable estimate.
        let uref = Uref::new(Ubuf::from(vec![0u8; 400]), 0, 0);
        assert!(input.input(0, uref).is_ok());
        assert!(input.status(0).ready);
    }
}

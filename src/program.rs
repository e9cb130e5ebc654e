//! [`Program`]: one service (one program_number) grouping inputs under a shared PMT and PCR
//! (spec.md §3, §4.2 Program invariant).

use crate::flow_def::InputType;
use crate::input::Input;
use crate::psi::pmt::PmtStream;

const UCLOCK_FREQ: u64 = 27_000_000;

/// Default PMT repeat interval (spec.md §4.5 default PSI intervals, ISO/IEC 13818-1 §2.4.4
/// guidance of 100ms for tables other than PAT).
pub const DEFAULT_PMT_INTERVAL: u64 = UCLOCK_FREQ / 10;
/// Default PCR repeat interval (spec.md §4.5, ISO/IEC 13818-1 §2.7.2 bound of 100ms).
pub const DEFAULT_PCR_INTERVAL: u64 = UCLOCK_FREQ / 10;

/// A program's DVB service row (spec.md §3 Program's optional `sig_service`), used to generate
/// its SDT entry.
#[derive(Debug, Clone, PartialEq)]
pub struct DvbService {
    /// DVB service type (ETSI EN 300 468 table 81, e.g. 0x01 = digital television).
    pub service_type: u8,
    /// Provider name.
    pub provider_name: String,
    /// Service name.
    pub service_name: String,
    /// DVB running status (0 = undefined, 1 = not running, ... 4 = running).
    pub running_status: u8,
}

/// One service: a program_number, a PMT PID, a PCR PID, and the [`Input`]s it carries
/// (spec.md §4.2 Program invariant: at most one input is the PCR carrier, chosen as the first
/// video input inserted, falling back to the first audio input, falling back to none).
#[derive(Debug)]
pub struct Program {
    sid: u16,
    pmt_pid: u16,
    pmt_interval: u64,
    pcr_interval: u64,
    inputs: Vec<Input>,
    next_insertion_order: u64,
    pmt_version: u8,
    pmt_dirty: bool,
    dvb_service: Option<DvbService>,
}

impl Program {
    /// Creates a program with service id `sid`, carrying its PMT on `pmt_pid`.
    pub fn new(sid: u16, pmt_pid: u16) -> Self {
        Self {
            sid,
            pmt_pid,
            pmt_interval: DEFAULT_PMT_INTERVAL,
            pcr_interval: DEFAULT_PCR_INTERVAL,
            inputs: Vec::new(),
            next_insertion_order: 0,
            pmt_version: 0,
            pmt_dirty: true,
            dvb_service: None,
        }
    }

    /// This program's DVB service row, if one has been set.
    pub fn dvb_service(&self) -> Option<&DvbService> {
        self.dvb_service.as_ref()
    }

    /// Sets or replaces this program's DVB service row (spec.md §3 `sig_service`); the mux's SDT
    /// generator picks this up on its next `prepare`.
    pub fn set_dvb_service(&mut self, service: DvbService) {
        self.dvb_service = Some(service);
    }

    /// This program's service id (program_number).
    pub fn sid(&self) -> u16 {
        self.sid
    }

    /// PID the PMT is carried on.
    pub fn pmt_pid(&self) -> u16 {
        self.pmt_pid
    }

    /// PID the program's PCR is carried on, i.e. its current PCR-carrier input's PID, if any
    /// (spec.md §4.2 Program invariant: the PMT's `PCR_PID` tracks this input).
    pub fn pcr_pid(&self) -> Option<u16> {
        self.inputs.iter().find(|i| i.is_pcr_carrier()).map(|i| i.pid())
    }

    /// PMT repeat interval in 27MHz ticks.
    pub fn pmt_interval(&self) -> u64 {
        self.pmt_interval
    }

    /// Sets the PMT repeat interval (spec.md §6 `set_pmt_interval`).
    pub fn set_pmt_interval(&mut self, interval: u64) {
        self.pmt_interval = interval;
    }

    /// PCR repeat interval in 27MHz ticks.
    pub fn pcr_interval(&self) -> u64 {
        self.pcr_interval
    }

    /// Sets the PCR repeat interval, applying it immediately to the current PCR carrier, if any
    /// (spec.md §6 `set_pcr_interval`).
    pub fn set_pcr_interval(&mut self, interval: u64) {
        self.pcr_interval = interval;
        if let Some(input) = self.inputs.iter_mut().find(|i| i.is_pcr_carrier()) {
            input.set_pcr_carrier(true, interval);
        }
    }

    /// Adds a new, unconfigured input on `pid` (its flow definition is set separately via
    /// [`Self::input_mut`]). Does not yet affect PCR-carrier selection — call
    /// [`Self::recompute_pcr_carrier`] after the input's flow definition is known.
    pub fn add_input(&mut self, pid: u16) -> &mut Input {
        let order = self.next_insertion_order;
        self.next_insertion_order += 1;
        self.inputs.push(Input::new(pid, order));
        self.pmt_dirty = true;
        self.inputs.last_mut().unwrap()
    }

    /// Marks `pid`'s input deleted; it keeps draining until [`Self::reap_drained`] removes it
    /// (spec.md §3 Input invariant).
    pub fn remove_input(&mut self, pid: u16) {
        if let Some(input) = self.inputs.iter_mut().find(|i| i.pid() == pid) {
            input.delete();
            self.pmt_dirty = true;
        }
        self.recompute_pcr_carrier();
    }

    /// Drops every deleted input that has finished draining. Call once per mux tick.
    pub fn reap_drained(&mut self) {
        let before = self.inputs.len();
        self.inputs.retain(|i| !i.is_drained());
        if self.inputs.len() != before {
            self.pmt_dirty = true;
        }
    }

    /// All inputs currently attached to this program, including those draining after deletion.
    pub fn inputs(&self) -> &[Input] {
        &self.inputs
    }

    /// Mutable access to every input, for the mux's splice phase.
    pub fn inputs_mut(&mut self) -> &mut [Input] {
        &mut self.inputs
    }

    /// Mutable access to one input by PID.
    pub fn input_mut(&mut self, pid: u16) -> Option<&mut Input> {
        self.inputs.iter_mut().find(|i| i.pid() == pid)
    }

    /// Re-selects the PCR carrier among active (non-deleted) inputs: the first video input
    /// inserted, else the first audio input inserted, else none (spec.md §3 Program invariant).
    /// Called after any input is added, removed, or has its flow definition changed.
    pub fn recompute_pcr_carrier(&mut self) {
        let best = self
            .inputs
            .iter()
            .filter(|i| !i.is_deleted())
            .filter(|i| matches!(i.input_type(), InputType::Video | InputType::Audio))
            .min_by_key(|i| (pcr_rank(i.input_type()), i.insertion_order()))
            .map(|i| i.pid());

        let pcr_interval = self.pcr_interval;
        let changed = best != self.pcr_pid();
        for input in &mut self.inputs {
            input.set_pcr_carrier(Some(input.pid()) == best, pcr_interval);
        }
        if changed {
            self.pmt_dirty = true;
        }
    }

    /// Sum of every active input's declared octetrate (spec.md §4.6 octetrate budgeting); the
    /// PMT/PCR overhead itself is budgeted separately by the mux via its own PSI carrier.
    pub fn required_octetrate(&self) -> u64 {
        self.inputs.iter().filter(|i| !i.is_deleted()).map(|i| i.octetrate()).sum()
    }

    /// Forces the PMT to be regenerated on the next [`Self::generate_pmt_if_dirty`] call, even
    /// if no input changed (spec.md §6 `freeze_psi`/service-descriptor-change callers).
    pub fn mark_pmt_dirty(&mut self) {
        self.pmt_dirty = true;
    }

    /// Builds a fresh, version-bumped PMT from the currently active inputs if anything relevant
    /// changed since the last call, or `None` otherwise (spec.md §4.6 mux phase 1 "prepare";
    /// §9 Open Question: a version bump is emitted on any conformance-relevant change, not only
    /// on explicit stream add/remove, so a PID or stream-type change also bumps it since the
    /// caller is expected to call `mark_pmt_dirty` in that case).
    pub fn generate_pmt_if_dirty(&mut self) -> Option<Vec<u8>> {
        if !self.pmt_dirty {
            return None;
        }
        self.pmt_dirty = false;
        self.pmt_version = self.pmt_version.wrapping_add(1) & 0x1f;

        let pcr_pid = self.pcr_pid();
        let streams: Vec<PmtStream> = self
            .inputs
            .iter()
            .filter(|i| !i.is_deleted())
            .filter_map(|i| {
                let fd = i.flow_def()?;
                Some(PmtStream {
                    stream_type: fd.stream_type(),
                    elementary_pid: i.pid(),
                    descriptors: fd.descriptors.clone(),
                })
            })
            .collect();

        Some(crate::psi::pmt::generate(self.sid, pcr_pid, &[], &streams, self.pmt_version).to_vec())
    }
}

fn pcr_rank(t: InputType) -> u8 {
    match t {
        InputType::Video => 0,
        InputType::Audio => 1,
        _ => 2,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow_def::FlowDefinition;

    fn fd(def: &str, pid: u16) -> FlowDefinition {
        FlowDefinition {
            def: def.to_string(),
            raw_def: String::new(),
            pid,
            sid: 1,
            octetrate: 500_000,
            buffer_size: 4096,
            fps: None,
            samples: None,
            rate: None,
            channels: None,
            tb_rate: 1_000_000,
            pes_id: 0xe0,
            pes_header_minimum: 14,
            pes_min_duration: 0,
            pes_alignment: true,
            max_delay: UCLOCK_FREQ,
            descriptors: Vec::new(),
            latency: 0,
        }
    }

    #[test]
    fn video_input_wins_pcr_carrier_over_later_audio() {
        let mut program = Program::new(1, 4096);
        program.add_input(257).set_flow_def(fd("block.mp2.sound.", 257));
        program.recompute_pcr_carrier();
        assert_eq!(program.pcr_pid(), Some(257));

        program.add_input(256).set_flow_def(fd("block.h264.pic.", 256));
        program.recompute_pcr_carrier();
        assert_eq!(program.pcr_pid(), Some(256));
    }

    #[test]
    fn pmt_regenerates_only_when_dirty() {
        let mut program = Program::new(1, 4096);
        program.add_input(256).set_flow_def(fd("block.h264.pic.", 256));
        program.recompute_pcr_carrier();
        let first = program.generate_pmt_if_dirty();
        assert!(first.is_some());
        assert!(program.generate_pmt_if_dirty().is_none());

        program.mark_pmt_dirty();
        assert!(program.generate_pmt_if_dirty().is_some());
    }

    #[test]
    fn removing_input_reassigns_pcr_after_reap() {
        let mut program = Program::new(1, 4096);
        program.add_input(256).set_flow_def(fd("block.h264.pic.", 256));
        program.add_input(257).set_flow_def(fd("block.mp2.sound.", 257));
        program.recompute_pcr_carrier();
        assert_eq!(program.pcr_pid(), Some(256));

        program.remove_input(256);
        assert_eq!(program.pcr_pid(), Some(257));
        while program.input_mut(256).map_or(false, |i| i.splice(0, u64::MAX).is_some()) {}
        program.reap_drained();
        assert!(program.input_mut(256).is_none());
    }
}

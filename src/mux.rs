//! [`Mux`]: the top-level scheduler (spec.md §3, §4.6) that paces PSI carriers and program
//! inputs onto a single constant- or capped-bitrate stream of `mtu`-sized output aggregates.

use crate::conformance::{scale_to_tick, Conformance};
use crate::error::{MuxError, MuxResult};
use crate::packet;
use crate::program::Program;
use crate::psi::descriptors::{ConditionalAccessEntry, Descriptor};
use crate::psi::eit::{DvbDateTime, EitEvent};
use crate::psi::nit::NitTransportStream;
use crate::psi::sdt::SdtService;
use crate::psi::{cat, eit, fixed_pid, nit, pat, sdt, tdt};
use crate::psi_carrier::PsiPidCarrier;
use crate::uref::Ubuf;
use std::collections::BTreeMap;

const UCLOCK_FREQ: u64 = 27_000_000;

/// Bitrate discipline the scheduler operates under (spec.md §3, §4.6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Emit exactly `total_octetrate` bytes/second, padding with stuffing packets when nothing
    /// else is ready.
    Cbr,
    /// Emit only what's ready; `total_octetrate` is advisory (used only to budget PSI/PCR
    /// intervals), no padding is generated.
    Vbr,
    /// Like VBR, but bounded above by `total_octetrate`: padding is still emitted if the
    /// aggregate would otherwise exceed it before the next tick.
    Capped,
}

/// Per-PSI-table repeat intervals, in 27MHz ticks, honored by [`Mux::prepare`]
/// (spec.md §4.5/§4.6 "interval scaling").
#[derive(Debug, Clone, Copy)]
struct Intervals {
    pat: u64,
    cat: u64,
    nit: u64,
    sdt: u64,
    eit: u64,
    tdt: u64,
    pcr: u64,
}

impl Default for Intervals {
    fn default() -> Self {
        Self {
            pat: UCLOCK_FREQ / 10,
            cat: UCLOCK_FREQ / 10,
            nit: UCLOCK_FREQ / 10,
            sdt: UCLOCK_FREQ / 10,
            eit: UCLOCK_FREQ / 2,
            tdt: UCLOCK_FREQ * 30,
            pcr: UCLOCK_FREQ / 10,
        }
    }
}

/// The top-level mux scheduler (spec.md §3 `Mux`, §4.6).
///
/// PSI carriers (PAT always, CAT/NIT/SDT/EIT/TDT when the active [`Conformance`] enables them,
/// and every program's PMT) live together in one PID-ordered map so the "ascending PID order"
/// priority rule of spec.md §4.6 phase 2a falls out of a single ordered iteration, rather than a
/// hand-rolled merge of several lists.
#[derive(Debug)]
pub struct Mux {
    conformance: Conformance,
    tsid: u16,
    network_id: u16,
    onid: u16,
    network_descriptors: Vec<Descriptor>,
    nit_transport_streams: Vec<NitTransportStream>,
    cat_entries: Vec<ConditionalAccessEntry>,
    cat_other_descriptors: Vec<Descriptor>,
    eit_events: BTreeMap<u16, Vec<EitEvent>>,
    tdt_time: Option<DvbDateTime>,

    mtu: usize,
    mode: Mode,
    fixed_octetrate: u64,
    required_octetrate: u64,
    total_octetrate: u64,
    padding_octetrate: u64,
    eits_octetrate: u64,
    mux_delay: u64,
    latency: u64,
    default_max_delay: u64,
    initial_cr_prog: u64,
    aac_encaps_latm: bool,
    cr_sys: u64,
    cr_sys_remainder: u64,
    preroll: bool,
    psi_frozen: bool,

    intervals: Intervals,
    pat_version: u8,
    cat_version: u8,
    nit_version: u8,
    sdt_version: u8,
    eit_version: u8,
    pat_dirty: bool,
    cat_dirty: bool,
    nit_dirty: bool,
    sdt_dirty: bool,
    eit_dirty: bool,

    psi_carriers: BTreeMap<u16, PsiPidCarrier>,
    programs: Vec<Program>,
    next_auto_pid: u16,
}

impl Mux {
    /// Creates a mux for transport stream `tsid`, with only the PAT carrier active
    /// (spec.md §3 invariant: PAT=0 is always reserved).
    pub fn new(tsid: u16) -> Self {
        let mut psi_carriers = BTreeMap::new();
        let mut pat_carrier = PsiPidCarrier::new(fixed_pid::PAT);
        pat_carrier.add_source("pat", Intervals::default().pat);
        psi_carriers.insert(fixed_pid::PAT, pat_carrier);

        Self {
            conformance: Conformance::Iso,
            tsid,
            network_id: 0,
            onid: 0,
            network_descriptors: Vec::new(),
            nit_transport_streams: Vec::new(),
            cat_entries: Vec::new(),
            cat_other_descriptors: Vec::new(),
            eit_events: BTreeMap::new(),
            tdt_time: None,

            mtu: 7 * packet::TS_SIZE,
            mode: Mode::Cbr,
            fixed_octetrate: 0,
            required_octetrate: 0,
            total_octetrate: 0,
            padding_octetrate: 0,
            eits_octetrate: 0,
            mux_delay: UCLOCK_FREQ,
            latency: 0,
            default_max_delay: UCLOCK_FREQ,
            initial_cr_prog: 0,
            aac_encaps_latm: false,
            cr_sys: 0,
            cr_sys_remainder: 0,
            preroll: true,
            psi_frozen: false,

            intervals: Intervals::default(),
            pat_version: 0,
            cat_version: 0,
            nit_version: 0,
            sdt_version: 0,
            eit_version: 0,
            pat_dirty: true,
            cat_dirty: true,
            nit_dirty: true,
            sdt_dirty: true,
            eit_dirty: true,

            psi_carriers,
            programs: Vec::new(),
            next_auto_pid: fixed_pid::FIRST_AUTO,
        }
    }

    // --- Conformance & timing ------------------------------------------------------------

    /// Active conformance.
    pub fn conformance(&self) -> Conformance {
        self.conformance
    }

    /// Sets the active conformance, enabling or releasing the DVB SI carriers (NIT/SDT/EIT/TDT)
    /// accordingly and re-clamping every configured interval (spec.md §4.6 "conformance policy",
    /// "SI presence").
    pub fn set_conformance(&mut self, conformance: Conformance) {
        self.conformance = conformance;
        if conformance.generates_dvb_tables() {
            self.ensure_si_carriers();
        } else {
            self.release_si_carriers();
        }
        self.clamp_intervals();
    }

    fn ensure_si_carriers(&mut self) {
        self.psi_carriers.entry(fixed_pid::CAT).or_insert_with(|| {
            let mut c = PsiPidCarrier::new(fixed_pid::CAT);
            c.add_source("cat", self.intervals.cat);
            c
        });
        self.psi_carriers.entry(fixed_pid::NIT).or_insert_with(|| {
            let mut c = PsiPidCarrier::new(fixed_pid::NIT);
            c.add_source("nit", self.intervals.nit);
            c
        });
        self.psi_carriers.entry(fixed_pid::SDT).or_insert_with(|| {
            let mut c = PsiPidCarrier::new(fixed_pid::SDT);
            c.add_source("sdt", self.intervals.sdt);
            c
        });
        self.psi_carriers.entry(fixed_pid::EIT).or_insert_with(|| {
            let mut c = PsiPidCarrier::new(fixed_pid::EIT);
            c.add_source("eit", self.intervals.eit);
            c
        });
        self.psi_carriers.entry(fixed_pid::TDT).or_insert_with(|| {
            let mut c = PsiPidCarrier::new(fixed_pid::TDT);
            c.add_source("tdt", self.intervals.tdt);
            c
        });
    }

    fn release_si_carriers(&mut self) {
        for pid in [fixed_pid::CAT, fixed_pid::NIT, fixed_pid::SDT, fixed_pid::EIT, fixed_pid::TDT] {
            self.psi_carriers.remove(&pid);
        }
    }

    fn clamp_intervals(&mut self) {
        let tick = self.tick_delta();
        if let Some(max) = self.conformance.psi_max_interval() {
            self.intervals.pat = scale_to_tick(self.intervals.pat.min(max), tick);
            self.intervals.cat = scale_to_tick(self.intervals.cat.min(max), tick);
            self.intervals.nit = scale_to_tick(self.intervals.nit.min(max), tick);
            self.intervals.sdt = scale_to_tick(self.intervals.sdt.min(max), tick);
            self.intervals.eit = scale_to_tick(self.intervals.eit.min(max), tick);
        }
        if let Some(max) = self.conformance.pcr_max_interval() {
            self.intervals.pcr = self.intervals.pcr.min(max);
            for program in &mut self.programs {
                if program.pcr_interval() > max {
                    program.set_pcr_interval(max);
                }
            }
        }
    }

    macro_rules! interval_accessor {
        ($get:ident, $set:ident, $field:ident, $source:expr, $pid:expr) => {
            #[doc = concat!("Gets the configured ", stringify!($field), " repeat interval, in 27MHz ticks.")]
            pub fn $get(&self) -> u64 {
                self.intervals.$field
            }

            #[doc = concat!("Sets the ", stringify!($field), " repeat interval, clamped to the active conformance's bound and scaled down to a multiple of the scheduler's own tick (spec.md §4.5/§4.6).")]
            pub fn $set(&mut self, interval: u64) {
                let bounded = match self.conformance.psi_max_interval() {
                    Some(max) => interval.min(max),
                    None => interval,
                };
                let clamped = scale_to_tick(bounded, self.tick_delta());
                self.intervals.$field = clamped;
                if let Some(carrier) = self.psi_carriers.get_mut(&$pid) {
                    carrier.add_source($source, clamped);
                }
            }
        };
    }

    interval_accessor!(pat_interval, set_pat_interval, pat, "pat", fixed_pid::PAT);
    interval_accessor!(cat_interval, set_cat_interval, cat, "cat", fixed_pid::CAT);
    interval_accessor!(nit_interval, set_nit_interval, nit, "nit", fixed_pid::NIT);
    interval_accessor!(sdt_interval, set_sdt_interval, sdt, "sdt", fixed_pid::SDT);
    interval_accessor!(eit_interval, set_eit_interval, eit, "eit", fixed_pid::EIT);
    interval_accessor!(tdt_interval, set_tdt_interval, tdt, "tdt", fixed_pid::TDT);

    /// Default PCR repeat interval applied to new programs.
    pub fn pcr_interval(&self) -> u64 {
        self.intervals.pcr
    }

    /// Sets the default PCR repeat interval for programs that haven't overridden it
    /// (spec.md §6 `set_pcr_interval`).
    pub fn set_pcr_interval(&mut self, interval: u64) {
        let clamped = match self.conformance.pcr_max_interval() {
            Some(max) => interval.min(max),
            None => interval,
        };
        self.intervals.pcr = clamped;
    }

    // --- Output shape ----------------------------------------------------------------------

    /// Output aggregate size in bytes, always a multiple of [`packet::TS_SIZE`].
    pub fn output_size(&self) -> usize {
        self.mtu
    }

    /// Sets the output aggregate size (spec.md §6 `set_output_size`); rounds down to the nearest
    /// whole number of TS packets, minimum one.
    pub fn set_output_size(&mut self, mtu: usize) {
        self.mtu = (mtu / packet::TS_SIZE).max(1) * packet::TS_SIZE;
    }

    /// Ends preroll: the scheduler may start pacing output immediately instead of waiting for
    /// every input to report a first status (spec.md §4.6 "Live vs file").
    pub fn end_preroll(&mut self) {
        self.preroll = false;
    }

    /// True while still prerolling.
    pub fn is_prerolling(&self) -> bool {
        self.preroll
    }

    /// Current bitrate discipline.
    pub fn mode(&self) -> Mode {
        self.mode
    }

    /// Sets the bitrate discipline.
    pub fn set_mode(&mut self, mode: Mode) {
        self.mode = mode;
    }

    /// User-forced total octetrate, or 0 for automatic discovery.
    pub fn fixed_octetrate(&self) -> u64 {
        self.fixed_octetrate
    }

    /// Forces `total_octetrate` to `octetrate`, or clears the override with 0 to resume
    /// automatic discovery (spec.md §6 `set_octetrate`).
    pub fn set_fixed_octetrate(&mut self, octetrate: u64) {
        self.fixed_octetrate = octetrate;
        self.recompute_octetrate();
    }

    /// Effective octetrate the scheduler currently paces output at.
    pub fn total_octetrate(&self) -> u64 {
        self.total_octetrate
    }

    /// Sum of every input's and PSI carrier's declared bandwidth need, before padding/margins.
    pub fn required_octetrate(&self) -> u64 {
        self.required_octetrate
    }

    /// Octetrate reserved for padding, always sent even with no other traffic.
    pub fn padding_octetrate(&self) -> u64 {
        self.padding_octetrate
    }

    /// Sets the padding octetrate reserve (spec.md §6 `set_padding_octetrate`).
    pub fn set_padding_octetrate(&mut self, octetrate: u64) {
        self.padding_octetrate = octetrate;
        self.recompute_octetrate();
    }

    /// Octetrate budget reserved for EIT schedule (non-present/following) sections.
    pub fn eits_octetrate(&self) -> u64 {
        self.eits_octetrate
    }

    /// Sets the EIT schedule octetrate budget (spec.md §6 `set_eits_octetrate`). Informational
    /// only: this crate generates present/following EIT sections but leaves multi-segment
    /// schedule generation to the caller (see [`crate::psi::eit::generate`]'s own Non-goal note),
    /// so no scheduler behavior currently consumes this budget beyond reporting it back.
    pub fn set_eits_octetrate(&mut self, octetrate: u64) {
        self.eits_octetrate = octetrate;
    }

    /// Mux-wide pacing delay target in 27MHz ticks, used as a floor for `total_octetrate` when no
    /// fixed octetrate is set (spec.md §4.6 `mtu·UCLOCK_FREQ/mux_delay`).
    pub fn mux_delay(&self) -> u64 {
        self.mux_delay
    }

    /// Sets the mux delay (spec.md §6 `set_mux_delay`).
    pub fn set_mux_delay(&mut self, delay: u64) {
        self.mux_delay = delay.max(1);
        self.recompute_octetrate();
    }

    /// Default max retention delay applied when a caller's flow definition leaves `max_delay`
    /// unset (spec.md §6 `set_max_delay`).
    pub fn default_max_delay(&self) -> u64 {
        self.default_max_delay
    }

    /// Sets the default max retention delay.
    pub fn set_max_delay(&mut self, max_delay: u64) {
        self.default_max_delay = max_delay;
    }

    /// Initial program-clock-reference offset applied to inputs added from now on
    /// (spec.md §6 `set_cr_prog`).
    pub fn set_cr_prog(&mut self, cr_prog: u64) {
        self.initial_cr_prog = cr_prog;
        for program in &mut self.programs {
            for input in program.inputs_mut() {
                input.set_cr_prog(cr_prog);
            }
        }
    }

    /// Whether AAC streams default to LATM (`true`) or ADTS (`false`) framing
    /// (spec.md §6 `set_aac_encaps`).
    pub fn aac_encaps_latm(&self) -> bool {
        self.aac_encaps_latm
    }

    /// Sets the default AAC encapsulation.
    pub fn set_aac_encaps_latm(&mut self, latm: bool) {
        self.aac_encaps_latm = latm;
    }

    /// Stops regenerating PAT/CAT/NIT/SDT/EIT/PMT sections even as the underlying program or
    /// input set changes (spec.md §6 `freeze_psi`), for remuxing an already-compliant PSI stream
    /// verbatim.
    pub fn freeze_psi(&mut self) {
        self.psi_frozen = true;
    }

    /// Resumes normal PSI regeneration and forces every table to regenerate once on the next
    /// `prepare`.
    pub fn unfreeze_psi(&mut self) {
        self.psi_frozen = false;
        self.pat_dirty = true;
        self.cat_dirty = true;
        self.nit_dirty = true;
        self.sdt_dirty = true;
        self.eit_dirty = true;
        for program in &mut self.programs {
            program.mark_pmt_dirty();
        }
    }

    /// Overrides the PAT's version field (spec.md §6 `set_version`), for resuming a remux at a
    /// caller-known version rather than starting over at 0.
    pub fn set_version(&mut self, version: u8) {
        self.pat_version = version & 0x1f;
    }

    // --- Network / CAT / SI configuration --------------------------------------------------

    /// Sets the DVB network id and its descriptor loop, used by the NIT generator.
    pub fn set_network(&mut self, network_id: u16, descriptors: Vec<Descriptor>) {
        self.network_id = network_id;
        self.network_descriptors = descriptors;
        self.nit_dirty = true;
    }

    /// Sets the original network id used by the SDT/EIT generators.
    pub fn set_original_network_id(&mut self, onid: u16) {
        self.onid = onid;
        self.sdt_dirty = true;
        self.eit_dirty = true;
    }

    /// Replaces the list of other transport streams described by this mux's NIT.
    pub fn set_nit_transport_streams(&mut self, transport_streams: Vec<NitTransportStream>) {
        self.nit_transport_streams = transport_streams;
        self.nit_dirty = true;
    }

    /// Replaces the CAT's conditional-access entries (EMM PIDs).
    pub fn set_cat_entries(&mut self, entries: Vec<ConditionalAccessEntry>, other_descriptors: Vec<Descriptor>) {
        self.cat_entries = entries;
        self.cat_other_descriptors = other_descriptors;
        self.cat_dirty = true;
    }

    /// Sets or replaces a service's EIT present/following events.
    pub fn set_eit_events(&mut self, service_id: u16, events: Vec<EitEvent>) {
        self.eit_events.insert(service_id, events);
        self.eit_dirty = true;
    }

    /// Sets the UTC time the TDT reports (spec.md §1 Non-goals: this crate has no wall clock of
    /// its own; the caller supplies it from theirs).
    pub fn set_tdt_time(&mut self, time: DvbDateTime) {
        self.tdt_time = Some(time);
    }

    // --- Program / input lifecycle ----------------------------------------------------------

    /// Allocates the next free automatic PID (spec.md §3 "automatic allocations, starting at
    /// 256"), skipping any PID already in use by a PSI carrier or a program input.
    pub fn allocate_pid(&mut self) -> MuxResult<u16> {
        for _ in 0..(0x1fff - fixed_pid::FIRST_AUTO) {
            let candidate = self.next_auto_pid;
            self.next_auto_pid = if candidate >= 0x1ffe { fixed_pid::FIRST_AUTO } else { candidate + 1 };
            if !self.pid_in_use(candidate) {
                return Ok(candidate);
            }
        }
        Err(MuxError::Busy("no free PID available".to_string()))
    }

    fn pid_in_use(&self, pid: u16) -> bool {
        self.psi_carriers.contains_key(&pid) || self.programs.iter().any(|p| p.inputs().iter().any(|i| i.pid() == pid))
    }

    /// Adds a new program with service id `sid`. `pmt_pid` reserves a specific PID, or `None` to
    /// auto-allocate one (spec.md §3 invariant: all PIDs are unique across the mux).
    pub fn add_program(&mut self, sid: u16, pmt_pid: Option<u16>) -> MuxResult<&mut Program> {
        if self.programs.iter().any(|p| p.sid() == sid) {
            return Err(MuxError::Invalid(format!("program {} already exists", sid)));
        }
        let pid = match pmt_pid {
            Some(pid) if !self.pid_in_use(pid) => pid,
            Some(pid) => return Err(MuxError::Busy(format!("PID {} already in use", pid))),
            None => self.allocate_pid()?,
        };
        let mut program = Program::new(sid, pid);
        program.set_pmt_interval(self.intervals.pat.max(UCLOCK_FREQ / 10));
        program.set_pcr_interval(self.intervals.pcr);

        let mut carrier = PsiPidCarrier::new(pid);
        carrier.add_source("pmt", program.pmt_interval());
        self.psi_carriers.insert(pid, carrier);

        self.pat_dirty = true;
        self.programs.push(program);
        Ok(self.programs.last_mut().unwrap())
    }

    /// Removes a program and releases its PMT PID.
    pub fn remove_program(&mut self, sid: u16) {
        if let Some(pos) = self.programs.iter().position(|p| p.sid() == sid) {
            let program = self.programs.remove(pos);
            self.psi_carriers.remove(&program.pmt_pid());
            self.pat_dirty = true;
        }
    }

    /// Mutable access to one program by sid.
    pub fn program_mut(&mut self, sid: u16) -> Option<&mut Program> {
        self.programs.iter_mut().find(|p| p.sid() == sid)
    }

    /// Every program currently configured.
    pub fn programs(&self) -> &[Program] {
        &self.programs
    }

    /// Adds a new input to program `sid` on `pid` (auto-allocated if `None`), returning it for
    /// `set_flow_def` (spec.md §4.7 "On input add... recompute PCR carrier").
    pub fn add_input(&mut self, sid: u16, pid: Option<u16>) -> MuxResult<&mut crate::input::Input> {
        let pid = match pid {
            Some(pid) if !self.pid_in_use(pid) => pid,
            Some(pid) => return Err(MuxError::Busy(format!("PID {} already in use", pid))),
            None => self.allocate_pid()?,
        };
        let cr_prog = self.initial_cr_prog;
        let program = self
            .programs
            .iter_mut()
            .find(|p| p.sid() == sid)
            .ok_or_else(|| MuxError::Invalid(format!("no such program {}", sid)))?;
        let input = program.add_input(pid);
        input.set_cr_prog(cr_prog);
        program.recompute_pcr_carrier();
        Ok(program.input_mut(pid).unwrap())
    }

    /// Removes `pid` from program `sid`; the input keeps draining until reaped
    /// (spec.md §3 Input invariant).
    pub fn remove_input(&mut self, sid: u16, pid: u16) {
        if let Some(program) = self.programs.iter_mut().find(|p| p.sid() == sid) {
            program.remove_input(pid);
        }
    }

    // --- Octetrate discovery ----------------------------------------------------------------

    /// Recomputes `required_octetrate` and `total_octetrate` from the current program/input set
    /// (spec.md §4.6 "Octetrate discovery").
    pub fn recompute_octetrate(&mut self) {
        const PCR_TOLERANCE_PPM: u64 = 2 * 30;
        const ROUNDING_MARGIN_BYTES: u64 = 2 * 188;

        let inputs_octetrate: u64 = self.programs.iter().map(|p| p.required_octetrate()).sum();
        let psi_octetrate: u64 = self.psi_carriers.values().map(|c| c.estimate_octetrate()).sum();

        let margin = (inputs_octetrate * PCR_TOLERANCE_PPM) / 1_000_000;
        let required = inputs_octetrate + psi_octetrate + self.padding_octetrate + margin + ROUNDING_MARGIN_BYTES;
        // Round up to a whole number of TS packets per second.
        let required = required.div_ceil(packet::TS_SIZE as u64) * packet::TS_SIZE as u64;
        self.required_octetrate = required;

        self.total_octetrate = if self.fixed_octetrate > 0 {
            self.fixed_octetrate
        } else {
            let delay_floor = (self.mtu as u64 * UCLOCK_FREQ) / self.mux_delay;
            required.max(delay_floor)
        };
    }

    /// Tick length `Δ = mtu·UCLOCK_FREQ / total_octetrate` (spec.md §4.6), ignoring any carried
    /// remainder. Used for interval clamping, where only an advisory tick size is needed; the
    /// scheduler itself uses [`Self::next_tick_delta`] to avoid drift.
    pub fn tick_delta(&self) -> u64 {
        if self.total_octetrate == 0 {
            return 0;
        }
        (self.mtu as u64 * UCLOCK_FREQ) / self.total_octetrate
    }

    /// Advances and returns the next tick length, carrying the integer-division remainder forward
    /// so repeated ticks converge on the true rate instead of drifting low (spec.md §4.6 phase 4,
    /// §8: Σ(cr_sys - n·Δ) → 0).
    fn next_tick_delta(&mut self) -> u64 {
        if self.total_octetrate == 0 {
            return 1;
        }
        let numerator = self.mtu as u64 * UCLOCK_FREQ + self.cr_sys_remainder;
        let delta = numerator / self.total_octetrate;
        self.cr_sys_remainder = numerator % self.total_octetrate;
        delta.max(1)
    }

    // --- Scheduler -------------------------------------------------------------------------

    /// Phase 1: asks every PSI generator whose table is dirty or due to build fresh sections, and
    /// feeds every PSI carrier's join aggregator (spec.md §4.6 phase 1 "prepare").
    pub fn prepare(&mut self, now: u64) {
        if !self.psi_frozen {
            self.regenerate_pat_if_dirty();
            self.regenerate_cat_if_dirty();
            self.regenerate_nit_if_dirty();
            self.regenerate_sdt_if_dirty();
            self.regenerate_eit_if_dirty();
            self.regenerate_pmts_if_dirty();
        }
        if self.conformance.generates_dvb_tables() {
            if let Some(time) = self.tdt_time {
                if let Some(carrier) = self.psi_carriers.get_mut(&fixed_pid::TDT) {
                    carrier.set_sections("tdt", vec![tdt::generate(&time).to_vec()]);
                }
            }
        }
        for program in &mut self.programs {
            program.reap_drained();
        }
        for carrier in self.psi_carriers.values_mut() {
            carrier.prepare(now);
        }
        self.recompute_octetrate();
    }

    fn regenerate_pat_if_dirty(&mut self) {
        if !self.pat_dirty {
            return;
        }
        self.pat_dirty = false;
        self.pat_version = self.pat_version.wrapping_add(1) & 0x1f;
        let nit_pid = if self.conformance.generates_dvb_tables() { Some(fixed_pid::NIT) } else { None };
        let programs: Vec<(u16, u16)> = self.programs.iter().map(|p| (p.sid(), p.pmt_pid())).collect();
        let sections: Vec<Vec<u8>> = pat::generate(self.tsid, nit_pid, &programs, self.pat_version)
            .into_iter()
            .map(|b| b.to_vec())
            .collect();
        if let Some(carrier) = self.psi_carriers.get_mut(&fixed_pid::PAT) {
            carrier.set_sections("pat", sections);
        }
    }

    fn regenerate_cat_if_dirty(&mut self) {
        if !self.cat_dirty || !self.conformance.generates_dvb_tables() {
            return;
        }
        self.cat_dirty = false;
        self.cat_version = self.cat_version.wrapping_add(1) & 0x1f;
        let section = cat::generate(&self.cat_entries, &self.cat_other_descriptors, self.cat_version).to_vec();
        if let Some(carrier) = self.psi_carriers.get_mut(&fixed_pid::CAT) {
            carrier.set_sections("cat", vec![section]);
        }
    }

    fn regenerate_nit_if_dirty(&mut self) {
        if !self.nit_dirty || !self.conformance.generates_dvb_tables() {
            return;
        }
        self.nit_dirty = false;
        self.nit_version = self.nit_version.wrapping_add(1) & 0x1f;
        let sections: Vec<Vec<u8>> = nit::generate(self.network_id, true, &self.network_descriptors, &self.nit_transport_streams, self.nit_version)
            .into_iter()
            .map(|b| b.to_vec())
            .collect();
        if let Some(carrier) = self.psi_carriers.get_mut(&fixed_pid::NIT) {
            carrier.set_sections("nit", sections);
        }
    }

    fn regenerate_sdt_if_dirty(&mut self) {
        if !self.sdt_dirty || !self.conformance.generates_dvb_tables() {
            return;
        }
        self.sdt_dirty = false;
        self.sdt_version = self.sdt_version.wrapping_add(1) & 0x1f;
        let services: Vec<SdtService> = self
            .programs
            .iter()
            .filter_map(|p| {
                let svc = p.dvb_service()?;
                let descriptor = Descriptor::new(
                    crate::psi::descriptors::tag::SERVICE,
                    &sdt::build_service_descriptor(&sdt::ServiceDescriptor {
                        service_type: svc.service_type,
                        provider_name: svc.provider_name.clone(),
                        service_name: svc.service_name.clone(),
                    }),
                );
                Some(SdtService {
                    service_id: p.sid(),
                    eit_schedule_flag: self.eit_events.contains_key(&p.sid()),
                    eit_present_following_flag: self.eit_events.contains_key(&p.sid()),
                    running_status: svc.running_status,
                    free_ca_mode: false,
                    descriptors: vec![descriptor],
                })
            })
            .collect();
        let sections: Vec<Vec<u8>> = sdt::generate(self.tsid, true, self.onid, &services, self.sdt_version)
            .into_iter()
            .map(|b| b.to_vec())
            .collect();
        if let Some(carrier) = self.psi_carriers.get_mut(&fixed_pid::SDT) {
            carrier.set_sections("sdt", sections);
        }
    }

    fn regenerate_eit_if_dirty(&mut self) {
        if !self.eit_dirty || !self.conformance.generates_dvb_tables() {
            return;
        }
        self.eit_dirty = false;
        self.eit_version = self.eit_version.wrapping_add(1) & 0x1f;
        let mut sections: Vec<Vec<u8>> = Vec::new();
        for (service_id, events) in &self.eit_events {
            sections.extend(
                eit::generate(*service_id, self.tsid, self.onid, eit::TABLE_ID_ACTUAL_PF, events, self.eit_version)
                    .into_iter()
                    .map(|b| b.to_vec()),
            );
        }
        if let Some(carrier) = self.psi_carriers.get_mut(&fixed_pid::EIT) {
            carrier.set_sections("eit", sections);
        }
    }

    fn regenerate_pmts_if_dirty(&mut self) {
        for program in &mut self.programs {
            if let Some(section) = program.generate_pmt_if_dirty() {
                if let Some(carrier) = self.psi_carriers.get_mut(&program.pmt_pid()) {
                    carrier.set_sections("pmt", vec![section]);
                }
            }
        }
    }

    /// Phase 2-4 for one output aggregate: repeatedly splices the highest-priority packet due at
    /// or before `now + Δ` until `mtu` bytes are gathered, falling back to padding, then advances
    /// `cr_sys` by `Δ` with a remainder accumulator (spec.md §4.6 phases 2-4).
    pub fn tick(&mut self, now: u64) -> Vec<u8> {
        self.prepare(now.saturating_sub(self.latency));
        let delta = self.next_tick_delta();
        let deadline = now + delta;

        let mut out = Vec::with_capacity(self.mtu);
        while out.len() < self.mtu {
            match self.splice_one(now, deadline) {
                Some(packet) => out.extend_from_slice(&packet),
                None => match self.mode {
                    Mode::Vbr => break,
                    Mode::Cbr | Mode::Capped => out.extend_from_slice(&packet::build_padding_packet()),
                },
            }
        }
        self.cr_sys += delta;
        out
    }

    /// Picks and emits one TS packet: PSI carriers in ascending PID order first, then program
    /// inputs by urgency, matching spec.md §4.6 phase 2.
    fn splice_one(&mut self, now: u64, deadline: u64) -> Option<[u8; packet::TS_SIZE]> {
        for carrier in self.psi_carriers.values_mut() {
            let status = carrier.status(now);
            if status.ready && status.cr_sys <= deadline {
                if let Some((ubuf, _cc)) = carrier.splice(now, deadline) {
                    return Some(to_ts_array(&ubuf));
                }
            }
        }

        let mut best: Option<(u64, bool, usize, u16)> = None;
        for (program_idx, program) in self.programs.iter_mut().enumerate() {
            for input in program.inputs_mut() {
                let status = input.status(now);
                if !status.ready {
                    continue;
                }
                let urgent = status.dts_sys <= deadline || status.pcr_sys.map_or(false, |p| p <= now);
                let candidate = (status.cr_sys, urgent, program_idx, input.pid());
                match &best {
                    None => best = Some(candidate),
                    Some((best_cr, best_urgent, ..)) => {
                        if (urgent && !best_urgent) || (urgent == *best_urgent && status.cr_sys < *best_cr) {
                            best = Some(candidate);
                        }
                    }
                }
            }
        }

        let (_, _, program_idx, pid) = best?;
        let input = self.programs[program_idx].input_mut(pid)?;
        let (ubuf, _cc) = input.splice(now, deadline)?;
        Some(to_ts_array(&ubuf))
    }

    /// Current system-clock tick the scheduler has advanced to.
    pub fn cr_sys(&self) -> u64 {
        self.cr_sys
    }
}

fn to_ts_array(ubuf: &Ubuf) -> [u8; packet::TS_SIZE] {
    let mut out = [0u8; packet::TS_SIZE];
    out.copy_from_slice(&ubuf[..packet::TS_SIZE]);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow_def::FlowDefinition;

    fn video_fd(pid: u16) -> FlowDefinition {
        FlowDefinition {
            def: "block.h264.pic.".to_string(),
            raw_def: String::new(),
            pid,
            sid: 1,
            octetrate: 200_000,
            buffer_size: 229376,
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
    fn tick_output_is_mtu_sized_and_packet_aligned() {
        let mut mux = Mux::new(1);
        mux.add_program(1, None).unwrap();
        mux.add_input(1, Some(256)).unwrap().set_flow_def(video_fd(256));
        mux.program_mut(1).unwrap().recompute_pcr_carrier();

        let out = mux.tick(0);
        assert_eq!(out.len(), mux.output_size());
        for chunk in out.chunks(packet::TS_SIZE) {
            assert_eq!(chunk[0], packet::TS_SYNC_BYTE);
        }
    }

    #[test]
    fn pat_carries_every_program() {
        let mut mux = Mux::new(7);
        mux.add_program(1, Some(4096)).unwrap();
        mux.add_program(2, Some(4097)).unwrap();
        mux.prepare(0);

        let mut decoder = pat::PatDecoder::new();
        let mut decoded = None;
        // Drain PID 0 until the PAT section appears.
        for _ in 0..16 {
            if let Some(carrier) = mux.psi_carriers.get_mut(&fixed_pid::PAT) {
                if let Some((ubuf, _)) = carrier.splice(0, u64::MAX) {
                    let array = to_ts_array(&ubuf);
                    let parsed = packet::parse_packet(&array).unwrap();
                    if let Some(packet::Payload::Raw(mut reader)) = parsed.payload {
                        // First payload byte is the pointer field (PUSI packet); skip it.
                        let body = reader.read(reader.remaining_len()).unwrap();
                        if let Ok(Some(pat)) = decoder.push_section(bytes::Bytes::copy_from_slice(&body[1..])) {
                            decoded = Some(pat);
                            break;
                        }
                    }
                }
            }
        }
        let pat = decoded.expect("PAT should decode");
        assert_eq!(pat.programs.len(), 2);
    }

    #[test]
    fn auto_pid_allocation_avoids_collisions() {
        let mut mux = Mux::new(1);
        mux.add_program(1, None).unwrap();
        let pid_a = mux.add_input(1, None).unwrap().pid();
        let pid_b = mux.add_input(1, None).unwrap().pid();
        assert_ne!(pid_a, pid_b);
    }

    #[test]
    fn required_octetrate_grows_with_inputs() {
        let mut mux = Mux::new(1);
        mux.add_program(1, None).unwrap();
        mux.recompute_octetrate();
        let before = mux.required_octetrate();

        mux.add_input(1, Some(256)).unwrap().set_flow_def(video_fd(256));
        mux.recompute_octetrate();
        assert!(mux.required_octetrate() > before);
    }
}

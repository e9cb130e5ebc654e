//! [`PsiPidCarrier`]: one PID dedicated to PSI, combining [`PsiPid`] refcounting,
//! [`PsiJoin`] table round-robin and an [`Encaps`] in PSI mode (spec.md §3, §4.5).

use crate::encaps::{Encaps, Status};
use crate::flow_def::FlowDefinition;
use crate::psi_join::{PsiJoin, PsiPid};
use crate::uref::{Ubuf, Uref};
use std::rc::Rc;

/// A PID carrying one or several round-robined PSI tables (spec.md §4.5 "PSI PID carrier" —
/// the unit the mux schedules PAT, CAT, NIT, SDT, EIT, TDT and per-program PMTs through).
#[derive(Debug)]
pub struct PsiPidCarrier {
    refs: PsiPid,
    join: PsiJoin,
    encaps: Encaps,
}

impl PsiPidCarrier {
    /// Creates a carrier for `pid`, configured for PSI framing from the start.
    pub fn new(pid: u16) -> Self {
        let mut encaps = Encaps::new(pid);
        encaps.set_flow_def(&FlowDefinition::psi(pid));
        Self {
            refs: PsiPid::new(pid),
            join: PsiJoin::new(),
            encaps,
        }
    }

    /// The carried PID.
    pub fn pid(&self) -> u16 {
        self.refs.pid()
    }

    /// Takes an internal reference (held by the mux's own table generator); see [`PsiPid`].
    pub fn use_internal(&self) -> Rc<()> {
        self.refs.use_internal()
    }

    /// Takes an external reference (held by a caller reserving the PID ahead of use).
    pub fn use_external(&self) -> Rc<()> {
        self.refs.use_external()
    }

    /// True once neither side holds a reference, so the mux may reclaim the PID.
    pub fn is_unused(&self) -> bool {
        self.refs.is_unused()
    }

    /// Registers a table under `label`, repeating at most every `max_interval` 27MHz ticks.
    pub fn add_source(&mut self, label: &'static str, max_interval: u64) {
        self.join.add_source(label, max_interval)
    }

    /// Updates or fills `label`'s repeating section set.
    pub fn set_sections(&mut self, label: &'static str, sections: Vec<Vec<u8>>) {
        self.join.set_sections(label, sections)
    }

    /// Drops `label` entirely. Caller is still responsible for releasing its reference token.
    pub fn remove_source(&mut self, label: &'static str) {
        self.join.remove_source(label)
    }

    /// Feeds every section currently due into the encapsulator (spec.md §4.6 mux phase 1,
    /// "prepare"). Sections are queued with `cr_sys == dts_sys == now`: PSI has no decode
    /// deadline of its own, only the table's repetition interval, already enforced by `PsiJoin`.
    pub fn prepare(&mut self, now: u64) {
        while let Some(section) = self.join.next_section(now) {
            self.encaps.input(Uref::new(Ubuf::from(section), now, now));
        }
    }

    /// Current readiness of this carrier (spec.md §4.4 `STATUS`).
    pub fn status(&mut self, now: u64) -> Status {
        self.encaps.status(now)
    }

    /// Emits the next TS packet due at or before `deadline`, if any.
    pub fn splice(&mut self, now: u64, deadline: u64) -> Option<(Ubuf, u64)> {
        self.encaps.splice(now, deadline)
    }

    /// Estimated octetrate this PID needs, amortized over each table's repetition interval
    /// (spec.md §4.6 octetrate budgeting).
    pub fn estimate_octetrate(&self) -> u64 {
        self.join.estimate_octetrate()
    }

    /// Current continuity counter value for this PID.
    pub fn get_cc(&self) -> u8 {
        self.encaps.get_cc()
    }

    /// Overrides this PID's continuity counter (spec.md §6 `set_cc`).
    pub fn set_cc(&mut self, value: u8) {
        self.encaps.set_cc(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn carrier_tracks_refs_and_emits_due_sections() {
        let mut carrier = PsiPidCarrier::new(0);
        let internal = carrier.use_internal();
        assert!(!carrier.is_unused());

        carrier.add_source("pat", 100);
        carrier.set_sections("pat", vec![vec![1, 2, 3, 4]]);
        carrier.prepare(0);
        let status = carrier.status(0);
        assert!(status.ready);

        let (packet, _cc) = carrier.splice(0, 0).expect("a packet should be ready");
        assert_eq!(packet.len(), crate::packet::TS_SIZE);

        drop(internal);
        assert!(carrier.is_unused());
    }

    #[test]
    fn unconfigured_carrier_is_not_ready() {
        let mut carrier = PsiPidCarrier::new(16);
        assert!(!carrier.status(0).ready);
        assert!(carrier.splice(0, 0).is_none());
    }
}

//! Per-unit envelope ([`Uref`]) and the ref-counted byte buffer it carries (spec.md §3 `Ubuf`).

use bytes::Bytes;

/// Ref-counted, cheaply-clonable byte buffer. Realizes the external "ubuf" contract of
/// spec.md §3 (append/slice/peek/read/write primitives) on top of [`bytes::Bytes`], which the
/// other pack repos (`rust-srec`'s `ts` crate, `vdkio`) use for the same purpose — the teacher
/// only ever borrows `&[u8]` and has no owned-buffer story of its own.
pub type Ubuf = Bytes;

/// A per-unit envelope carrying an optional [`Ubuf`] plus the timestamps and flags the mux
/// schedules on (spec.md §3). Timestamps are 64-bit counts in a 27MHz system clock.
#[derive(Debug, Clone)]
pub struct Uref {
    /// Payload, if any (a PSI section, PES frame, or already-packetized TS fragment).
    pub ubuf: Option<Ubuf>,
    /// System-clock date this unit is scheduled to leave the mux.
    pub cr_sys: u64,
    /// Program-clock date this unit is scheduled to leave the mux.
    pub cr_prog: Option<u64>,
    /// System-clock decoding timestamp.
    pub dts_sys: u64,
    /// Program-clock decoding timestamp.
    pub dts_prog: Option<u64>,
    /// System-clock presentation timestamp.
    pub pts_sys: Option<u64>,
    /// Program-clock presentation timestamp.
    pub pts_prog: Option<u64>,
    /// `pts - dts`, constant for one elementary stream's encapsulation mode.
    pub dts_pts_delay: u64,
    /// `dts - cr`, i.e. how much slack the T-STD model allows before this unit must leave.
    pub cr_dts_delay: u64,
    /// System-clock date of the latest preceding random-access point, if known.
    pub rap_sys: Option<u64>,
    /// True if this unit is itself a random-access point (e.g. a video key frame).
    pub random: bool,
    /// True if a discontinuity (in PCR, continuity counter, or timestamp base) starts here.
    pub discontinuity: bool,
}

impl Uref {
    /// Builds a minimal uref carrying `ubuf`, scheduled at `cr_sys`/`dts_sys`.
    pub fn new(ubuf: Ubuf, cr_sys: u64, dts_sys: u64) -> Self {
        Self {
            ubuf: Some(ubuf),
            cr_sys,
            cr_prog: None,
            dts_sys,
            dts_prog: None,
            pts_sys: None,
            pts_prog: None,
            dts_pts_delay: 0,
            cr_dts_delay: 0,
            rap_sys: None,
            random: false,
            discontinuity: false,
        }
    }

    /// Length in bytes of the carried payload, or 0 if none.
    pub fn len(&self) -> usize {
        self.ubuf.as_ref().map_or(0, |b| b.len())
    }

    /// True if this uref carries no payload.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_uref_has_no_random_or_discontinuity_by_default() {
        let u = Uref::new(Bytes::from_static(b"abc"), 100, 90);
        assert_eq!(u.len(), 3);
        assert!(!u.random);
        assert!(!u.discontinuity);
        assert_eq!(u.cr_sys, 100);
        assert_eq!(u.dts_sys, 90);
    }
}

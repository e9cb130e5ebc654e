//! T-STD (Transport Stream System Target Decoder) buffer model (spec.md §4.3, ISO/IEC 13818-1
//! Annex D): per-input rate shaping at a flow's declared `tb_rate`, plus `max_delay` enforcement.

use crate::error::{MuxError, MuxResult};

const UCLOCK_FREQ: u64 = 27_000_000;

/// Leaky-bucket model of one input's transport buffer: admits units no faster than `tb_rate`
/// bytes/second drain, and refuses any unit whose decode deadline cannot be met without
/// exceeding the flow's `max_delay` (spec.md §4.2/§4.3).
#[derive(Debug, Clone)]
pub struct Tstd {
    tb_rate: u64,
    max_delay: u64,
    /// System-clock tick at which the buffer will next have drained enough to admit another
    /// unit, assuming units are admitted back-to-back.
    next_free: u64,
    /// Free-format octetrate refinement (spec.md §9 Open Question), active only for flows whose
    /// caller never declared a `tb_rate` directly (see [`Self::enable_free_format`]).
    free_format: Option<FreeFormatOctetrateEstimator>,
    free_format_samples: u32,
    free_format_rate: u32,
}

impl Tstd {
    /// Creates a T-STD buffer model for a flow declaring `tb_rate` bytes/second and `max_delay`
    /// 27MHz ticks of retention.
    pub fn new(tb_rate: u64, max_delay: u64) -> Self {
        Self {
            tb_rate: tb_rate.max(1),
            max_delay,
            next_free: 0,
            free_format: None,
            free_format_samples: 1,
            free_format_rate: 1,
        }
    }

    /// Enables free-format octetrate detection (spec.md §4.2, §9 Open Question): `tb_rate` is
    /// treated as provisional and is refined from each admitted unit's observed frame size —
    /// `samples` PCM samples at `rate` Hz — until the estimator locks on
    /// [`MAX_OCTETRATE_CHANGES`] bitrate transitions, for MPEG audio flows whose frame header
    /// carries no explicit bit-rate field.
    pub fn enable_free_format(&mut self, samples: u32, rate: u32) {
        self.free_format = Some(FreeFormatOctetrateEstimator::new());
        self.free_format_samples = samples.max(1);
        self.free_format_rate = rate;
    }

    /// Updates the declared buffer parameters in place (`set_tb_size`/`set_max_delay` control
    /// verbs, spec.md §6); does not retroactively reschedule units already admitted.
    pub fn set_tb_rate(&mut self, tb_rate: u64) {
        self.tb_rate = tb_rate.max(1);
    }

    /// See [`Self::set_tb_rate`].
    pub fn set_max_delay(&mut self, max_delay: u64) {
        self.max_delay = max_delay;
    }

    /// Computes the earliest `cr_sys` (departure tick) at which a `size`-byte unit arriving no
    /// earlier than `arrival_sys` and due to decode at `dts_sys` may leave the transport buffer,
    /// respecting both `tb_rate` drain shaping and the buffer's FIFO ordering.
    ///
    /// Returns [`MuxError::Invalid`] if meeting `dts_sys` is already impossible (the unit would
    /// have to have started draining before it arrived, net of `max_delay` slack) — the T-STD
    /// equivalent of ISO/IEC 13818-1's `buffer overflow`/underflow detection.
    pub fn admit(&mut self, arrival_sys: u64, dts_sys: u64, size: usize) -> MuxResult<u64> {
        if let Some(estimator) = &mut self.free_format {
            estimator.observe(size, self.free_format_samples, self.free_format_rate);
            if let Some(octetrate) = estimator.octetrate() {
                self.tb_rate = octetrate.max(1);
            }
        }

        let earliest = self.next_free.max(arrival_sys);
        if dts_sys < earliest {
            return Err(MuxError::Invalid(format!(
                "T-STD cannot meet dts_sys {} (earliest admission {})",
                dts_sys, earliest
            )));
        }
        if dts_sys - earliest > self.max_delay {
            return Err(MuxError::Invalid(format!(
                "T-STD retention {} exceeds max_delay {}",
                dts_sys - earliest,
                self.max_delay
            )));
        }
        let drain_ticks = (size as u64 * UCLOCK_FREQ) / self.tb_rate;
        self.next_free = earliest + drain_ticks;
        Ok(earliest)
    }
}

/// Number of consecutive octetrate changes a free-format MPEG audio stream (no explicit bit-rate
/// field in its frame header) may exhibit before the estimator gives up refining and freezes on
/// its last estimate (spec.md §9 Open Question, preserved verbatim from the original heuristic).
pub const MAX_OCTETRATE_CHANGES: u32 = 10;

/// Infers the constant octetrate of a free-format MPEG audio stream from observed frame sizes,
/// since free-format streams carry no bit-rate field (spec.md §4.2). Converges after at most
/// [`MAX_OCTETRATE_CHANGES`] frame-size changes and then locks, on the assumption that a true
/// free-format encoder holds a constant frame size (and hence constant octetrate) for the
/// duration of the stream.
#[derive(Debug, Clone, Default)]
pub struct FreeFormatOctetrateEstimator {
    last_frame_size: Option<usize>,
    changes: u32,
    locked: bool,
    octetrate: Option<u64>,
}

impl FreeFormatOctetrateEstimator {
    /// Creates an estimator with no observations yet.
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds one observed frame of `frame_size` bytes spanning `samples` PCM samples at `rate`
    /// Hz, refining the octetrate estimate until it locks.
    pub fn observe(&mut self, frame_size: usize, samples: u32, rate: u32) {
        if self.locked {
            return;
        }
        if self.last_frame_size.is_some_and(|prev| prev != frame_size) {
            self.changes += 1;
        }
        self.last_frame_size = Some(frame_size);
        self.octetrate = Some((frame_size as u64 * rate as u64) / samples as u64);
        if self.changes >= MAX_OCTETRATE_CHANGES {
            self.locked = true;
        }
    }

    /// Current best octetrate estimate, in bytes/second, if at least one frame has been observed.
    pub fn octetrate(&self) -> Option<u64> {
        self.octetrate
    }

    /// True once the estimator has stopped refining its estimate.
    pub fn is_locked(&self) -> bool {
        self.locked
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn admits_back_to_back_units_at_tb_rate() {
        let mut tstd = Tstd::new(1_000_000, UCLOCK_FREQ);
        let cr0 = tstd.admit(0, UCLOCK_FREQ, 1000).unwrap();
        assert_eq!(cr0, 0);
        let cr1 = tstd.admit(0, UCLOCK_FREQ * 2, 1000).unwrap();
        assert!(cr1 > cr0);
    }

    #[test]
    fn rejects_unit_exceeding_max_delay() {
        let mut tstd = Tstd::new(1_000_000, 100);
        assert!(tstd.admit(0, 1000, 10).is_err());
    }

    #[test]
    fn free_format_estimator_locks_after_max_changes() {
        let mut est = FreeFormatOctetrateEstimator::new();
        for size in 100..100 + MAX_OCTETRATE_CHANGES + 5 {
            est.observe(size as usize, 1152, 44100);
        }
        assert!(est.is_locked());
    }

    #[test]
    fn free_format_estimator_stable_size_never_locks_spuriously() {
        let mut est = FreeFormatOctetrateEstimator::new();
        for _ in 0..1000 {
            est.observe(200, 1152, 44100);
        }
        assert!(!est.is_locked());
        assert!(est.octetrate().is_some());
    }

    #[test]
    fn free_format_admit_refines_tb_rate_from_observed_frame_sizes() {
        // Declared tb_rate of 0 clamps to 1 B/s, which would make every unit's drain take
        // essentially forever; enabling free-format detection must replace it with a usable
        // estimate from the very first admitted frame.
        let mut tstd = Tstd::new(0, UCLOCK_FREQ * 10);
        tstd.enable_free_format(1152, 44100);
        let cr0 = tstd.admit(0, 0, 200).unwrap();
        assert_eq!(cr0, 0);
        // 200 bytes at 1152 samples / 44100 Hz per frame is ~9228 B/s; the next unit must be
        // schedulable within a small fraction of a second, not after the 1 B/s drain it would
        // take without the estimator.
        let cr1 = tstd.admit(0, UCLOCK_FREQ / 10, 200).unwrap();
        assert!(cr1 < UCLOCK_FREQ, "next_free {} should reflect the refined octetrate, not the 1 B/s floor", cr1);
    }
}

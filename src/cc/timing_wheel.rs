use std::collections::VecDeque;

/// Width of one wheel slot in microseconds.
const WSLOT_WIDTH_US: f64 = 0.5;

/// Number of wheel slots; with 0.5 us slots this covers ~8 ms.
const NUM_WSLOTS: usize = 1 << 14;

/// A bucketed rate limiter indexed by TSC.
///
/// Entries are inserted with a desired transmission timestamp and reaped in
/// bucket order once the timestamp is due. Insertions beyond the horizon
/// clamp to the last slot. Per-producer order is preserved as long as the
/// producer's desired timestamps are monotone, which the pacer guarantees.
pub(crate) struct TimingWheel<E> {
    /// Width of one wheel slot in TSC cycles.
    wslot_width_tsc: u64,

    /// The bucket ring.
    wheel: Vec<VecDeque<E>>,

    /// Index of the bucket whose deadline is `base_tsc + wslot_width_tsc`.
    cur_wslot: usize,

    /// Timestamp at which the current bucket opened.
    base_tsc: u64,

    /// Total number of entries in the wheel.
    len: usize,
}

impl<E> TimingWheel<E> {
    pub fn new(freq_ghz: f64, now_tsc: u64) -> Self {
        let wslot_width_tsc = (WSLOT_WIDTH_US * freq_ghz * 1000.0) as u64;
        assert!(wslot_width_tsc > 0, "TSC frequency too low for the wheel");

        Self {
            wslot_width_tsc,
            wheel: (0..NUM_WSLOTS).map(|_| VecDeque::new()).collect(),
            cur_wslot: 0,
            base_tsc: now_tsc,
            len: 0,
        }
    }

    /// Total number of queued entries.
    #[inline(always)]
    pub fn len(&self) -> usize {
        self.len
    }

    /// The furthest timestamp the wheel can represent, relative to its base.
    #[inline(always)]
    pub fn horizon_tsc(&self) -> u64 {
        self.wslot_width_tsc * NUM_WSLOTS as u64
    }

    /// Insert an entry to be released at `desired_tx_tsc`.
    /// Timestamps in the past release on the next reap; timestamps past the
    /// horizon clamp to the last slot.
    pub fn insert(&mut self, ent: E, _ref_tsc: u64, desired_tx_tsc: u64) {
        let slots_ahead = (desired_tx_tsc.saturating_sub(self.base_tsc) / self.wslot_width_tsc)
            .min(NUM_WSLOTS as u64 - 1) as usize;
        let wslot = (self.cur_wslot + slots_ahead) % NUM_WSLOTS;
        self.wheel[wslot].push_back(ent);
        self.len += 1;
    }

    /// Move every entry whose bucket is due at `now_tsc` into `out`.
    pub fn reap(&mut self, now_tsc: u64, out: &mut Vec<E>) {
        if now_tsc < self.base_tsc + self.wslot_width_tsc {
            return;
        }

        let elapsed_slots = (now_tsc - self.base_tsc) / self.wslot_width_tsc;
        // One trip around the ring covers every bucket; beyond that, only
        // the base needs to catch up.
        let steps = (elapsed_slots as usize).min(NUM_WSLOTS);
        for _ in 0..steps {
            let bucket = &mut self.wheel[self.cur_wslot];
            self.len -= bucket.len();
            out.extend(bucket.drain(..));
            self.cur_wslot = (self.cur_wslot + 1) % NUM_WSLOTS;
        }
        self.base_tsc += elapsed_slots * self.wslot_width_tsc;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FREQ_GHZ: f64 = 2.0;

    fn width() -> u64 {
        (WSLOT_WIDTH_US * FREQ_GHZ * 1000.0) as u64
    }

    #[test]
    fn releases_at_deadline() {
        let mut wheel: TimingWheel<u32> = TimingWheel::new(FREQ_GHZ, 1_000_000);
        wheel.insert(7, 1_000_000, 1_000_000 + 10 * width());
        assert_eq!(wheel.len(), 1);

        let mut out = Vec::new();
        wheel.reap(1_000_000 + 5 * width(), &mut out);
        assert!(out.is_empty());

        wheel.reap(1_000_000 + 11 * width(), &mut out);
        assert_eq!(out, vec![7]);
        assert_eq!(wheel.len(), 0);
    }

    #[test]
    fn clamps_to_horizon() {
        let mut wheel: TimingWheel<u32> = TimingWheel::new(FREQ_GHZ, 0);
        wheel.insert(1, 0, u64::MAX);

        let mut out = Vec::new();
        wheel.reap(wheel.horizon_tsc() + width(), &mut out);
        assert_eq!(out, vec![1]);
    }

    #[test]
    fn preserves_insertion_order_within_bucket() {
        let mut wheel: TimingWheel<u32> = TimingWheel::new(FREQ_GHZ, 0);
        let deadline = 4 * width();
        for i in 0..8 {
            wheel.insert(i, 0, deadline);
        }

        let mut out = Vec::new();
        wheel.reap(deadline + width(), &mut out);
        assert_eq!(out, (0..8).collect::<Vec<_>>());
    }

    #[test]
    fn long_idle_catches_up() {
        let mut wheel: TimingWheel<u32> = TimingWheel::new(FREQ_GHZ, 0);
        wheel.insert(1, 0, width());

        // Idle for many horizons, then insert and reap again.
        let late = 100 * wheel.horizon_tsc();
        let mut out = Vec::new();
        wheel.reap(late, &mut out);
        assert_eq!(out, vec![1]);

        out.clear();
        wheel.insert(2, late, late + width());
        wheel.reap(late + 2 * width(), &mut out);
        assert_eq!(out, vec![2]);
    }
}

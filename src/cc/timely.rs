//! RTT-gradient congestion control, after the Timely algorithm
//! (SIGCOMM 2015). Its only datapath output is `desired_tx_tsc`, the
//! pacing timestamp consumed by the timing wheel.

/// Low RTT threshold: below this, increase rate additively.
const T_LOW_US: f64 = 50.0;

/// High RTT threshold: above this, decrease rate multiplicatively.
const T_HIGH_US: f64 = 1000.0;

/// EWMA smoothing factor for the RTT gradient.
const EWMA_ALPHA: f64 = 0.875;

/// Multiplicative decrease factor.
const BETA: f64 = 0.8;

/// Additive increase step, bytes per second.
const ADD_RATE: f64 = (5 * 1024 * 1024) as f64;

/// Rate floor, bytes per second.
const MIN_RATE: f64 = (1024 * 1024) as f64;

/// Packets between rate updates.
const UPDATE_INTERVAL: u32 = 16;

/// Per-session Timely state plus the pacing accumulator.
pub(crate) struct Timely {
    /// Current sending rate in bytes per second.
    rate: f64,

    /// Previous RTT sample in microseconds.
    prev_rtt_us: f64,

    /// Smoothed RTT gradient.
    rtt_grad: f64,

    /// Minimum RTT observed, microseconds.
    min_rtt_us: f64,

    /// Packets seen since the last rate update.
    pkts_since_update: u32,

    /// TSC frequency in GHz, for cycle/microsecond conversion.
    freq_ghz: f64,

    /// Link bandwidth in bytes per second; the rate ceiling.
    link_bandwidth: f64,

    /// Desired TX timestamp handed out for the previous packet.
    prev_desired_tx_tsc: u64,
}

impl Timely {
    pub fn new(freq_ghz: f64, link_bandwidth: usize) -> Self {
        Self {
            // Start at line rate: a fresh session is uncongested.
            rate: link_bandwidth as f64,
            prev_rtt_us: 0.0,
            rtt_grad: 0.0,
            min_rtt_us: f64::MAX,
            pkts_since_update: 0,
            freq_ghz,
            link_bandwidth: link_bandwidth as f64,
            prev_desired_tx_tsc: 0,
        }
    }

    /// Current sending rate in bytes per second.
    #[inline(always)]
    pub fn rate(&self) -> f64 {
        self.rate
    }

    /// Force the sending rate. Expert use only.
    #[inline]
    pub fn set_rate(&mut self, rate: f64) {
        self.rate = rate.max(1.0);
    }

    /// A session is uncongested while Timely has not backed off line rate.
    #[inline(always)]
    pub fn is_uncongested(&self) -> bool {
        self.rate >= self.link_bandwidth
    }

    /// Fold one RTT sample (in TSC cycles) into the rate.
    pub fn update_rate(&mut self, rtt_tsc: u64) {
        let rtt_us = rtt_tsc as f64 / (self.freq_ghz * 1000.0);
        if rtt_us < self.min_rtt_us {
            self.min_rtt_us = rtt_us;
        }

        self.pkts_since_update += 1;
        if self.pkts_since_update < UPDATE_INTERVAL {
            return;
        }
        self.pkts_since_update = 0;

        let prev_rtt_us = self.prev_rtt_us;
        self.prev_rtt_us = rtt_us;
        if prev_rtt_us == 0.0 {
            return;
        }

        let rtt_diff = rtt_us - prev_rtt_us;
        self.rtt_grad = EWMA_ALPHA * self.rtt_grad + (1.0 - EWMA_ALPHA) * rtt_diff;

        let new_rate = if rtt_us < T_LOW_US {
            self.rate + ADD_RATE
        } else if rtt_us > T_HIGH_US {
            self.rate * BETA
        } else {
            let normalized_grad = self.rtt_grad / self.min_rtt_us.max(1.0);
            if normalized_grad <= 0.0 {
                self.rate + ADD_RATE
            } else {
                self.rate * (1.0 - BETA * normalized_grad).max(0.5)
            }
        };

        self.rate = new_rate.clamp(MIN_RATE, self.link_bandwidth);
    }

    /// Compute the pacing timestamp for a packet of the given size and
    /// advance the accumulator. Timestamps are monotone per session.
    #[inline]
    pub fn desired_tx_tsc(&mut self, ref_tsc: u64, pkt_size: usize) -> u64 {
        let gap_ns = pkt_size as f64 / self.rate * 1e9;
        let gap_cycles = (gap_ns * self.freq_ghz) as u64;

        let desired = self.prev_desired_tx_tsc.max(ref_tsc) + gap_cycles;
        self.prev_desired_tx_tsc = desired;
        desired
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FREQ_GHZ: f64 = 2.0;
    const LINK_BW: usize = 1_250_000_000;

    fn us_to_tsc(us: f64) -> u64 {
        (us * FREQ_GHZ * 1000.0) as u64
    }

    #[test]
    fn backs_off_on_high_rtt() {
        let mut timely = Timely::new(FREQ_GHZ, LINK_BW);
        assert!(timely.is_uncongested());

        // First interval establishes prev_rtt; second one reacts.
        for _ in 0..(2 * UPDATE_INTERVAL) {
            timely.update_rate(us_to_tsc(2000.0));
        }
        assert!(timely.rate() < LINK_BW as f64);
        assert!(!timely.is_uncongested());
    }

    #[test]
    fn recovers_on_low_rtt() {
        let mut timely = Timely::new(FREQ_GHZ, LINK_BW);
        timely.set_rate(MIN_RATE);

        for _ in 0..(4 * UPDATE_INTERVAL) {
            timely.update_rate(us_to_tsc(5.0));
        }
        assert!(timely.rate() > MIN_RATE);
    }

    #[test]
    fn pacing_is_monotone() {
        let mut timely = Timely::new(FREQ_GHZ, LINK_BW);
        let t1 = timely.desired_tx_tsc(1000, 4096);
        let t2 = timely.desired_tx_tsc(1000, 4096);
        assert!(t2 > t1);

        // A late reference timestamp pushes the accumulator forward.
        let t3 = timely.desired_tx_tsc(t2 + 1_000_000, 4096);
        assert!(t3 > t2 + 1_000_000);
    }
}

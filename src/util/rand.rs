use rand::{Rng, SeedableRng};

/// A fast xorshift generator for datapath decisions (e.g., the packet-drop
/// roll). Statistical quality is traded for a handful of instructions.
pub(crate) struct FastRand {
    state: u64,
}

impl FastRand {
    pub fn new() -> Self {
        Self {
            // Seed from the slow generator so endpoints diverge.
            state: SlowRand::new().next_u64() | 1,
        }
    }

    #[inline(always)]
    pub fn next_u32(&mut self) -> u32 {
        let mut x = self.state;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.state = x;
        (x >> 32) as u32
    }
}

/// A slow, well-seeded generator for "real" randomness (connect tokens).
pub(crate) struct SlowRand {
    rng: rand::rngs::StdRng,
}

impl SlowRand {
    pub fn new() -> Self {
        Self {
            rng: rand::rngs::StdRng::from_entropy(),
        }
    }

    #[inline]
    pub fn next_u64(&mut self) -> u64 {
        self.rng.gen()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fast_rand_varies() {
        let mut r = FastRand::new();
        let a = r.next_u32();
        let b = r.next_u32();
        let c = r.next_u32();
        assert!(a != b || b != c);
    }
}

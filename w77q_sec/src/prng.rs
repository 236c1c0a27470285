// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/// Source of nonces that never repeat over the life of the device,
/// typically a hardware TRNG.
pub trait EntropySource {
    fn get_nonce(&mut self) -> u64;
}

impl<F: FnMut() -> u64> EntropySource for F {
    fn get_nonce(&mut self) -> u64 {
        self()
    }
}

/// xorshift64* generator, reseeded from the entropy source every
/// [`Prng::RESEED_INTERVAL`] draws.
pub struct Prng {
    state: u64,
    draws: u32,
    source: Box<dyn EntropySource>,
}

impl Prng {
    pub const RESEED_INTERVAL: u32 = 128;

    pub fn new(source: Box<dyn EntropySource>) -> Prng {
        let mut p = Prng {
            state: 0,
            draws: 0,
            source,
        };
        p.reseed();
        p
    }

    pub fn reseed(&mut self) {
        self.state ^= self.source.get_nonce();
        // xorshift has a fixed point at zero
        if self.state == 0 {
            self.state = 0x9E37_79B9_7F4A_7C15;
        }
        self.draws = 0;
    }

    /// Mix in the seed agreed with the device when a session opens.
    pub fn set_seed(&mut self, seed: u64) {
        self.state = if seed == 0 { 0x9E37_79B9_7F4A_7C15 } else { seed };
    }

    pub fn get_rand32(&mut self) -> u32 {
        if self.draws >= Self::RESEED_INTERVAL {
            self.reseed();
        }
        self.draws += 1;

        let mut x = self.state;
        x ^= x >> 12;
        x ^= x << 25;
        x ^= x >> 27;
        self.state = x;
        (x.wrapping_mul(0x2545_F491_4F6C_DD1D) >> 32) as u32
    }

    /// A fresh session nonce, straight from the entropy source.
    pub fn nonce(&mut self) -> u64 {
        self.source.get_nonce()
    }
}

impl std::fmt::Debug for Prng {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Prng").field("draws", &self.draws).finish()
    }
}

//! The Curl sponge: 729-trit state, 243-trit rate, 81 transform rounds.

use crate::{Trit, HASH_LENGTH};

/// Sponge state width in trits.
pub const STATE_LENGTH: usize = 3 * HASH_LENGTH;

const ROUNDS: usize = 81;

// Indexed by a + 4b + 5 for trits a, b; the slots at 3 and 7 are unreachable.
const TRUTH_TABLE: [Trit; 11] = [1, 0, -1, 2, 1, -1, 0, 2, -1, 1, 0];

/// Incremental sponge with an `absorb`/`squeeze`/`reset` interface.
///
/// `absorb` may be called repeatedly before the first `squeeze`; absorbing
/// again after a squeeze requires an explicit `reset`.
#[derive(Clone)]
pub struct Curl {
    state: [Trit; STATE_LENGTH],
}

impl Default for Curl {
    fn default() -> Self {
        Self::new()
    }
}

impl Curl {
    /// Create a sponge with an all-zero state.
    pub fn new() -> Self {
        Self {
            state: [0; STATE_LENGTH],
        }
    }

    /// Zero the state so the sponge can absorb fresh input.
    pub fn reset(&mut self) {
        self.state = [0; STATE_LENGTH];
    }

    /// Absorb input trits, one rate-sized block per transform. An empty
    /// input still runs one transform.
    pub fn absorb(&mut self, trits: &[Trit]) {
        if trits.is_empty() {
            self.transform();
            return;
        }
        for chunk in trits.chunks(HASH_LENGTH) {
            self.state[..chunk.len()].copy_from_slice(chunk);
            self.transform();
        }
    }

    /// Squeeze `length` trits, transforming after each rate-sized block.
    pub fn squeeze(&mut self, length: usize) -> Vec<Trit> {
        let mut out = Vec::with_capacity(length);
        let mut remaining = length;
        while remaining > 0 {
            let take = remaining.min(HASH_LENGTH);
            out.extend_from_slice(&self.state[..take]);
            self.transform();
            remaining -= take;
        }
        out
    }

    fn transform(&mut self) {
        let mut scratch = [0 as Trit; STATE_LENGTH];
        for _ in 0..ROUNDS {
            scratch.copy_from_slice(&self.state);
            let mut index = 0usize;
            for slot in self.state.iter_mut() {
                let a = scratch[index];
                index = if index < 365 { index + 364 } else { index - 365 };
                let b = scratch[index];
                *slot = TRUTH_TABLE[(a + (b << 2) + 5) as usize];
            }
        }
    }
}

/// One-shot absorb-then-squeeze convenience.
pub fn curl_hash(trits: &[Trit], length: usize) -> Vec<Trit> {
    let mut curl = Curl::new();
    curl.absorb(trits);
    curl.squeeze(length)
}

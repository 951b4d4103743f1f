//! Bounded-memory random permutations of `[0, N)`.
//!
//! Storing a full `i64` permutation of a ten-billion-key space would need
//! tens of gigabytes. [`SplitPerm`] instead keeps one permutation of a
//! 2^24-aligned block, stored as `u32` indices and reused for every aligned
//! block, plus a separate permutation of the tail. The mapping stays a
//! bijection on the whole range.

use rand::{Rng, RngCore};

const BLOCK: i64 = 1 << 24;
const MASK: i64 = BLOCK - 1;

pub struct SplitPerm {
    perm: Vec<u32>,
    tail: Vec<u32>,
    in_perm: i64,
}

impl SplitPerm {
    pub fn new(rng: &mut dyn RngCore, nitems: i64) -> Self {
        assert!(nitems >= 0, "nitems must be non-negative");
        if nitems < BLOCK {
            return Self {
                perm: permutation(rng, nitems as u32),
                tail: Vec::new(),
                in_perm: nitems,
            };
        }
        let in_perm = BLOCK * (nitems / BLOCK);
        let tail_len = (nitems % BLOCK) as u32;
        Self {
            perm: permutation(rng, BLOCK as u32),
            tail: permutation(rng, tail_len),
            in_perm,
        }
    }

    /// Maps `i` to its permuted image.
    #[inline]
    pub fn of(&self, i: i64) -> i64 {
        if i < self.in_perm {
            let top = i & !MASK;
            let bot = i & MASK;
            top | i64::from(self.perm[bot as usize])
        } else {
            i64::from(self.tail[(i - self.in_perm) as usize]) + self.in_perm
        }
    }
}

/// Forward Fisher-Yates: element `i` is placed at a uniform position among
/// the first `i + 1` slots.
fn permutation(rng: &mut dyn RngCore, n: u32) -> Vec<u32> {
    let mut m = vec![0u32; n as usize];
    for i in 0..n {
        let j = rng.gen_range(0..=i) as usize;
        m[i as usize] = m[j];
        m[j] = i;
    }
    m
}

//! Piecewise-uniform key selection over `k` equal steps with linearly
//! decreasing step probabilities.
//!
//! Step `s` (0-based) carries weight `k - s`, so the total weight is the
//! triangular number `k(k+1)/2`. Sampling rolls once against the cumulative
//! weights to pick a step, then draws uniformly inside it.

use rand::{Rng, RngCore};

use super::IntGen;
use crate::Error;

pub struct LinStep {
    k: i64,
    step: i64, // n/k
}

impl LinStep {
    pub fn new(n: i64, k: i64) -> Result<Self, Error> {
        if n <= 0 || k <= 0 {
            return Err(Error::Config(format!("linstep: need positive n and k, got n={} k={}", n, k)));
        }
        if n % k != 0 {
            return Err(Error::Config(format!("linstep: n must be a multiple of k, got n={} k={}", n, k)));
        }
        Ok(Self { k, step: n / k })
    }
}

impl IntGen for LinStep {
    fn next(&self, rng: &mut dyn RngCore) -> i64 {
        let stop = rng.gen_range(0..self.k * (self.k + 1) / 2);
        let mut cum = 0i64;
        for s in 0..self.k {
            cum += self.k - s;
            if stop < cum {
                return s * self.step + rng.gen_range(0..self.step);
            }
        }
        unreachable!("unable to stop: stop {} cum {}", stop, cum);
    }
}

//! Linearly decreasing key selection.
//!
//! With `P(x) = mx + b`, `Σ P(x) = 1` and `P(N) = 0`, solving gives
//! `m = -2/[N(N+1)]` and `b = 2/(N+1)`, and the CDF inverts to
//! `x = [2N-1 - √(4N²+4N+1 - 4·CDF·N(N+1))] / 2`. A few constants are
//! precomputed so sampling is one square root.

use rand::{Rng, RngCore};

use super::IntGen;
use crate::Error;

/// Selects ids in `[0, n)` with probability decreasing linearly to zero at
/// `n`.
pub struct Linear {
    n: i64,
    a: i64, // 2n-1
    s: f64, // 4n²+4n+1
    d: f64, // 4n(n+1)
}

impl Linear {
    pub fn new(n: i64) -> Result<Self, Error> {
        if n <= 0 {
            return Err(Error::Config(format!("linear: item count must be positive, got {}", n)));
        }
        // sample over n+1 items and re-draw zeroes, shifting the result down
        // by one; inverting the CDF directly puts a spike at 0 otherwise
        let n = n + 1;
        Ok(Self {
            n,
            a: 2 * n - 1,
            s: (4 * n * n + 4 * n + 1) as f64,
            d: (4 * n * (n + 1)) as f64,
        })
    }
}

impl IntGen for Linear {
    fn next(&self, rng: &mut dyn RngCore) -> i64 {
        let mut f = 0i64;
        while f == 0 {
            let cdf: f64 = rng.gen();
            let toroot = self.s - self.d * cdf;
            let tosub = toroot.sqrt() as i64;
            let top = self.a - tosub;
            f = top / 2;
            if f >= self.n {
                panic!("linear produced id outside [0, {}): {}", self.n, f);
            } else if f < 0 {
                // sqrt rounding error can push the index below zero
                f = 0;
            }
        }
        f - 1
    }
}

//! Zipfian key selection after Gray et al., "Quickly Generating
//! Billion-Record Synthetic Databases" (SIGMOD 1994), as popularized by
//! YCSB.
//!
//! The plain [`Zipfian`] clusters popular items at the low end of the id
//! space: item 0 is the most popular, item 1 the second most, and so on.
//! [`ScrambledZipfian`] pipes the drawn rank through a random permutation so
//! hot keys are spread across the whole space.

use rand::{Rng, RngCore};

use super::perm::SplitPerm;
use super::IntGen;
use crate::Error;

pub struct Zipfian {
    items: i64,
    base: i64,
    theta: f64,
    alpha: f64,
    zetan: f64,
    eta: f64,
}

impl Zipfian {
    /// Builds a zipfian over `[min, max]` with a precomputed `ζ(items, θ)`.
    pub fn new(min: i64, max: i64, theta: f64, zetan: f64) -> Result<Self, Error> {
        if !(0.0 < theta && theta < 1.0) {
            return Err(Error::Config(format!("zipfian: theta must be in (0, 1), got {}", theta)));
        }
        let items = max - min + 1;
        if items <= 0 {
            return Err(Error::Config(format!("zipfian: empty range [{}, {}]", min, max)));
        }
        let zeta2 = zeta(2, theta);
        Ok(Self {
            items,
            base: min,
            theta,
            alpha: 1.0 / (1.0 - theta),
            zetan,
            eta: (1.0 - (2.0 / items as f64).powf(1.0 - theta)) / (1.0 - zeta2 / zetan),
        })
    }

    /// Builds a zipfian over `[0, nitems)`, computing `ζ(nitems, θ)`.
    pub fn with_items(nitems: i64, theta: f64) -> Result<Self, Error> {
        Self::new(0, nitems - 1, theta, zeta_static(nitems, theta))
    }
}

impl IntGen for Zipfian {
    fn next(&self, rng: &mut dyn RngCore) -> i64 {
        let u: f64 = rng.gen();
        let uz = u * self.zetan;

        if uz < 1.0 {
            return self.base;
        }
        if uz < 1.0 + 0.5f64.powf(self.theta) {
            return self.base + 1;
        }
        (self.items as f64 * (self.eta * u - self.eta + 1.0).powf(self.alpha)) as i64
    }
}

/// `ζ(n, θ) = Σ_{i=1..n} 1/i^θ`, computed in parallel chunks.
///
/// The range is partitioned into one contiguous chunk per CPU and the
/// partial sums are added in chunk order, so the result is identical for a
/// given `(n, θ)` regardless of how the worker threads interleave.
pub fn zeta_static(n: i64, theta: f64) -> f64 {
    let nw = num_cpus::get() as i64;
    let wops = (n + nw - 1) / nw;
    let mut partials = vec![0f64; nw as usize];
    std::thread::scope(|s| {
        for (w, out) in partials.iter_mut().enumerate() {
            let start = w as i64 * wops;
            let end = (start + wops).min(n);
            s.spawn(move || {
                let mut sum = 0f64;
                let mut i = start;
                while i < end {
                    sum += 1.0 / ((i + 1) as f64).powf(theta);
                    i += 1;
                }
                *out = sum;
            });
        }
    });
    partials.iter().sum()
}

fn zeta(n: i64, theta: f64) -> f64 {
    let mut sum = 0f64;
    for i in 0..n {
        sum += 1.0 / ((i + 1) as f64).powf(theta);
    }
    sum
}

/// A zipfian whose ranks are scrambled by a stored permutation of the id
/// space, so that the popular cluster is spread over `[0, nitems)`.
pub struct ScrambledZipfian {
    g: Zipfian,
    perm: SplitPerm,
    items: i64,
}

impl ScrambledZipfian {
    pub fn new(rng: &mut dyn RngCore, nitems: i64, theta: f64) -> Result<Self, Error> {
        Ok(Self {
            g: Zipfian::with_items(nitems, theta)?,
            perm: SplitPerm::new(rng, nitems),
            items: nitems,
        })
    }
}

impl IntGen for ScrambledZipfian {
    fn next(&self, rng: &mut dyn RngCore) -> i64 {
        let i = self.g.next(rng);
        if i < 0 || i >= self.items {
            panic!("zipfian produced rank outside [0, {}): {}", self.items, i);
        }
        self.perm.of(i)
    }
}

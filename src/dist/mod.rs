//! Integer distributions used for key selection and interarrival gaps.
//!
//! Every distribution implements [`IntGen`]: parameters are fixed at
//! construction and all sampling state lives in the caller-supplied PRNG, so
//! a single generator can be shared by every worker of a phase without an
//! outer lock. The exception is [`Counter`], which deliberately hands out a
//! shared monotonic sequence.

use rand::distributions::Distribution;
use rand::{Rng, RngCore};
use rand_distr::Exp;

use parking_lot::Mutex;

use crate::Error;

mod linear;
mod linstep;
pub mod perm;
mod zipfian;

pub use linear::Linear;
pub use linstep::LinStep;
pub use zipfian::{zeta_static, ScrambledZipfian, Zipfian};

/// A generator of integers following some distribution.
pub trait IntGen: Send + Sync {
    fn next(&self, rng: &mut dyn RngCore) -> i64;
}

/// Draws a 63-bit non-negative integer, like the generators below expect.
#[inline]
pub(crate) fn draw63(rng: &mut dyn RngCore) -> i64 {
    (rng.next_u64() >> 1) as i64
}

/// Uniform selection over `[0, n)`.
pub struct Uniform {
    n: i64,
    mask: Option<i64>,
}

impl Uniform {
    pub fn new(n: i64) -> Result<Self, Error> {
        if n <= 0 {
            return Err(Error::Config(format!("uniform: item count must be positive, got {}", n)));
        }
        let mask = if n & (n - 1) == 0 { Some(n - 1) } else { None };
        Ok(Self { n, mask })
    }
}

impl IntGen for Uniform {
    fn next(&self, rng: &mut dyn RngCore) -> i64 {
        let v = draw63(rng);
        match self.mask {
            Some(m) => v & m,
            None => v % self.n,
        }
    }
}

/// A shared monotonic counter. Only the loader uses this, to cover the key
/// space exactly once across its workers.
pub struct Counter {
    count: Mutex<i64>,
}

impl Counter {
    pub fn new(start: i64) -> Self {
        Self { count: Mutex::new(start) }
    }
}

impl IntGen for Counter {
    fn next(&self, _rng: &mut dyn RngCore) -> i64 {
        let mut c = self.count.lock();
        let v = *c;
        *c += 1;
        v
    }
}

/// Poisson arrivals: exponentially distributed gaps with the given mean.
pub struct Poisson {
    exp: Exp<f64>,
}

impl Poisson {
    pub fn new(mean: f64) -> Result<Self, Error> {
        if !(mean > 0.0) {
            return Err(Error::Config(format!("poisson: mean must be positive, got {}", mean)));
        }
        let exp = Exp::new(1.0 / mean)
            .map_err(|e| Error::Config(format!("poisson: bad rate for mean {}: {}", mean, e)))?;
        Ok(Self { exp })
    }
}

impl IntGen for Poisson {
    fn next(&self, rng: &mut dyn RngCore) -> i64 {
        self.exp.sample(rng).round() as i64
    }
}

/// Interarrival gaps uniform in `[mean·(1−width), mean·(1+width)]`.
pub struct UniformInterarrival {
    min: i64,
    size: i64,
}

impl UniformInterarrival {
    pub fn new(mean: f64, width: f64) -> Result<Self, Error> {
        if !(0.0..=1.0).contains(&width) {
            return Err(Error::Config(format!("uniform interarrival: width must be in [0, 1], got {}", width)));
        }
        let min = (mean - mean * width) as i64;
        let max = (mean + mean * width).ceil() as i64;
        // draws land in [min, max] inclusive
        Ok(Self { min, size: max - min + 1 })
    }
}

impl IntGen for UniformInterarrival {
    fn next(&self, rng: &mut dyn RngCore) -> i64 {
        self.min + rng.gen_range(0..self.size)
    }
}

//! Sharded PRNGs.
//!
//! Request paths need random numbers from many threads at once. Instead of
//! one locked generator, we keep one PRNG per hardware thread, each seeded
//! from the caller's master source, and map a request ordinal to a shard by
//! simple modulo. A [`ShardHandle`] locks its shard per draw, never across
//! the surrounding work, so two requests on the same shard only contend for
//! the few cycles of a PRNG step. The master PRNG itself is only touched
//! during setup.

use parking_lot::Mutex;
use rand::{Error, Rng, RngCore, SeedableRng};
use rand_xoshiro::Xoshiro256PlusPlus;

pub(crate) struct ShardedRng {
    shards: Vec<Mutex<Xoshiro256PlusPlus>>,
}

impl ShardedRng {
    pub(crate) fn new(master: &mut impl Rng) -> Self {
        let shards = (0..num_cpus::get())
            .map(|_| Mutex::new(Xoshiro256PlusPlus::seed_from_u64(master.gen())))
            .collect();
        Self { shards }
    }

    /// Returns the PRNG handle for ordinal `i`.
    pub(crate) fn get(&self, i: usize) -> ShardHandle<'_> {
        ShardHandle(&self.shards[i % self.shards.len()])
    }
}

pub(crate) struct ShardHandle<'a>(&'a Mutex<Xoshiro256PlusPlus>);

impl RngCore for ShardHandle<'_> {
    fn next_u32(&mut self) -> u32 {
        self.0.lock().next_u32()
    }

    fn next_u64(&mut self) -> u64 {
        self.0.lock().next_u64()
    }

    fn fill_bytes(&mut self, dest: &mut [u8]) {
        self.0.lock().fill_bytes(dest)
    }

    fn try_fill_bytes(&mut self, dest: &mut [u8]) -> Result<(), Error> {
        self.0.lock().try_fill_bytes(dest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ordinals_wrap_around() {
        let mut master = Xoshiro256PlusPlus::seed_from_u64(0);
        let s = ShardedRng::new(&mut master);
        let n = s.shards.len();
        // ordinal n maps back to shard 0, so the draws share one stream
        let a = s.get(0).next_u64();
        let b = s.get(n).next_u64();
        assert_ne!(a, b);
    }

    #[test]
    fn same_master_seed_reproduces_streams() {
        let mut m1 = Xoshiro256PlusPlus::seed_from_u64(1);
        let mut m2 = Xoshiro256PlusPlus::seed_from_u64(1);
        let s1 = ShardedRng::new(&mut m1);
        let s2 = ShardedRng::new(&mut m2);
        assert_eq!(s1.get(3).next_u64(), s2.get(3).next_u64());
    }
}

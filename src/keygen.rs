//! Key and value string generation.
//!
//! Keys are deterministic functions of the integer id: three base-36
//! encodings of FNV-64 hashes of `v`, `v+1`, `v+2`, right-padded with `':'`
//! to the configured key size (39 bytes or more avoids truncating the
//! digits). Values are opaque random strings over a 64-symbol alphabet.
//!
//! Both paths format into thread-local scratch buffers so the only per-call
//! allocation is the returned `String`.

use std::cell::RefCell;
use std::sync::Arc;

use rand::RngCore;

use crate::dist::{draw63, IntGen};

const FNV_OFFSET_BASIS: u64 = 0xCBF29CE484222325;
const FNV_PRIME: u64 = 1099511628211;

/// FNV-64 over the eight low-order octets of `v`, folded to a non-negative
/// `i64`.
pub(crate) fn fnv64(v: i64) -> i64 {
    let mut v = v;
    let mut hash = FNV_OFFSET_BASIS;
    for _ in 0..8 {
        let octet = (v as u64) & 0xff;
        v >>= 8;
        hash ^= octet;
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    let ret = hash as i64;
    if ret < 0 {
        ret.wrapping_neg()
    } else {
        ret
    }
}

const BASE36_DIGITS: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";

fn push_base36(buf: &mut Vec<u8>, v: i64) {
    if v < 0 {
        buf.push(b'-');
    }
    let mut v = v.unsigned_abs();
    let mut digits = [0u8; 13]; // u64::MAX needs 13 base-36 digits
    let mut n = 0;
    loop {
        digits[n] = BASE36_DIGITS[(v % 36) as usize];
        n += 1;
        v /= 36;
        if v == 0 {
            break;
        }
    }
    for i in (0..n).rev() {
        buf.push(digits[i]);
    }
}

thread_local! {
    static KEY_BUF: RefCell<Vec<u8>> = RefCell::new(Vec::with_capacity(64));
    static VAL_BUF: RefCell<Vec<u8>> = const { RefCell::new(Vec::new()) };
}

fn format_key(v: i64, key_size: usize) -> String {
    KEY_BUF.with(|b| {
        let mut buf = b.borrow_mut();
        buf.clear();
        push_base36(&mut buf, fnv64(v));
        push_base36(&mut buf, fnv64(v.wrapping_add(1)));
        push_base36(&mut buf, fnv64(v.wrapping_add(2)));
        buf.resize(key_size, b':');
        String::from_utf8(buf.clone()).expect("key bytes are ASCII")
    })
}

/// Generates key strings for ids drawn from the wrapped distribution. Safe
/// for concurrent use whenever the wrapped generator is.
#[derive(Clone)]
pub struct KeyGen {
    g: Arc<dyn IntGen>,
    len: usize,
}

impl KeyGen {
    pub fn new(g: Arc<dyn IntGen>, len: usize) -> Self {
        Self { g, len }
    }

    pub fn next(&self, rng: &mut dyn RngCore) -> String {
        format_key(self.g.next(rng), self.len)
    }
}

// if this is updated, SmallDraw below needs a new bit budget as well
const VALUE_ALPHABET: &[u8; 64] = b"0123456789abcdefghijklmnopqrstuvwxyz\
                                    ABCDEFGHIJKLMNOPQRSTUVWXYZ-#";

/// Doles out 6-bit symbols from 63-bit draws, ten symbols per draw, to keep
/// the PRNG off the per-byte path.
struct SmallDraw {
    cur: i64,
    left: i32,
}

impl SmallDraw {
    fn get(&mut self, rng: &mut dyn RngCore) -> usize {
        if self.left <= 6 {
            self.cur = draw63(rng);
            self.left = 61;
        }
        let sr = (self.cur & 63) as usize;
        self.cur >>= 6;
        self.left -= 6;
        sr
    }
}

/// Generates random opaque values of a fixed length.
#[derive(Clone, Copy)]
pub struct ValueGen {
    len: usize,
}

impl ValueGen {
    pub fn new(len: usize) -> Self {
        Self { len }
    }

    pub fn next(&self, rng: &mut dyn RngCore) -> String {
        VAL_BUF.with(|b| {
            let mut buf = b.borrow_mut();
            buf.resize(self.len, 0);
            let mut sd = SmallDraw { cur: 0, left: 0 };
            for byte in buf.iter_mut() {
                *byte = VALUE_ALPHABET[sd.get(rng)];
            }
            String::from_utf8(buf.clone()).expect("value bytes are ASCII")
        })
    }
}

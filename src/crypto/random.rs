//! OS-backed randomness for keys, nonces, session ids and disguise filler.

use rand::{Rng, RngCore};
use rand_core::OsRng;

/// Handle on the operating system CSPRNG.
pub struct SecureRandom;

impl SecureRandom {
    /// Overwrite `dest` with random bytes.
    pub fn fill(dest: &mut [u8]) {
        OsRng.fill_bytes(dest);
    }

    /// `N` random bytes.
    pub fn bytes<const N: usize>() -> [u8; N] {
        let mut out = [0u8; N];
        Self::fill(&mut out);
        out
    }

    pub fn u32() -> u32 {
        OsRng.next_u32()
    }

    /// Uniform value in `min..max`, or `min` when that range is empty.
    pub fn range(min: usize, max: usize) -> usize {
        if min >= max {
            min
        } else {
            OsRng.gen_range(min..max)
        }
    }
}

/// `len` random bytes, used wherever the wire expects opaque content.
pub fn random_padding(len: usize) -> Vec<u8> {
    let mut out = vec![0u8; len];
    SecureRandom::fill(&mut out);
    out
}

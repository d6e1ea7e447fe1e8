//! Branch-free modular reduction with a precomputed 128-bit magic constant,
//! after Lemire's fastmod. Used everywhere a hash is reduced into a table or
//! bucket range.

use serde::{Deserialize, Serialize};

/// Precomputed reduction modulo a fixed 64-bit divisor.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct M64 {
    m: u128,
    d: u64,
}

impl Default for M64 {
    fn default() -> Self {
        M64::new(1)
    }
}

// High 64 bits of the 192-bit product `lowbits * d`.
#[inline]
fn mul128_u64(lowbits: u128, d: u64) -> u64 {
    let mut bottom_half = (lowbits & u64::MAX as u128) * d as u128;
    bottom_half >>= 64;
    let top_half = (lowbits >> 64) * d as u128;
    let both_halves = bottom_half + top_half;
    (both_halves >> 64) as u64
}

impl M64 {
    pub fn new(d: u64) -> Self {
        debug_assert!(d > 0, "modulus must be non-zero");
        M64 {
            m: (u128::MAX / d as u128) + 1,
            d,
        }
    }

    /// `a % d`.
    #[inline]
    pub fn fastmod(&self, a: u64) -> u64 {
        let lowbits = self.m.wrapping_mul(a as u128);
        mul128_u64(lowbits, self.d)
    }

    /// `a / d`.
    #[inline]
    pub fn fastdiv(&self, a: u64) -> u64 {
        mul128_u64(self.m, a)
    }

    pub fn divisor(&self) -> u64 {
        self.d
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;

    #[test]
    fn matches_modulo_and_division() {
        let mut rng = rand::rng();
        for _ in 0..1000 {
            let d = rng.random_range(1..u64::MAX);
            let a: u64 = rng.random();
            let m = M64::new(d);
            assert_eq!(m.fastmod(a), a % d, "a = {a}, d = {d}");
            assert_eq!(m.fastdiv(a), a / d, "a = {a}, d = {d}");
        }
    }

    #[test]
    fn small_divisors() {
        for d in 1..=64u64 {
            let m = M64::new(d);
            for a in 0..=256u64 {
                assert_eq!(m.fastmod(a), a % d);
                assert_eq!(m.fastdiv(a), a / d);
            }
        }
    }
}

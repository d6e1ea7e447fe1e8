//! # pthash: minimal perfect hashing for static key sets
//!
//! Builds a function that maps `n` distinct keys bijectively onto
//! `{0, ..., n - 1}` in a few bits per key, with lookups in tens of
//! nanoseconds. Construction follows the PTHash recipe: keys are hashed and
//! grouped into buckets, buckets are processed by decreasing size searching
//! a per-bucket *pilot* that displaces all members into free slots of a
//! table, and the pilot array is compressed with an integer code.
//!
//! ```
//! use pthash::{BuildConfig, DefaultPhf};
//!
//! let keys: Vec<u64> = (0..1000u64).map(|i| i.wrapping_mul(0x9e3779b97f4a7c15)).collect();
//! let config = BuildConfig { seed: 42, ..Default::default() };
//! let f = DefaultPhf::build_in_internal_memory(&keys, &config).unwrap();
//!
//! let mut seen = vec![false; keys.len()];
//! for key in &keys {
//!     let idx = f.get(key) as usize;
//!     assert!(idx < keys.len() && !seen[idx]);
//!     seen[idx] = true;
//! }
//! ```
//!
//! Variants:
//! - [`SinglePhf`]: one table; the right choice for most inputs.
//! - [`PartitionedPhf`]: shards keys into independent sub-problems built in
//!   parallel with bounded memory.
//! - [`DensePartitionedPhf`]: same sharding, but pilots are stored
//!   interleaved across partitions, which compresses markedly better.
//! - `build_in_external_memory` on the single and partitioned variants
//!   spills through temporary files when hashes do not fit in RAM.

pub mod bits;
pub mod bucketer;
pub mod encoders;
pub mod dense_encoders;
pub mod hash;
/// Key-generation helpers for tests and benchmarks.
pub mod util;

mod buckets;
mod builder;
mod dense;
mod error;
mod external;
mod fastmod;
mod partitioned;
mod search;
mod single;
#[cfg(test)]
mod test;

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

pub use builder::SingleBuilder;
pub use dense::DensePartitionedPhf;
pub use error::{Error, Result};
pub use external::{ExternalPartitionedBuilder, ExternalSingleBuilder};
pub use partitioned::{PartitionedBuilder, PartitionedPhf};
pub use single::SinglePhf;

use bucketer::{OptBucketer, SkewBucketer};
use dense_encoders::InterC;
use encoders::DictionaryDictionary;
use hash::MurmurHash128;

/// Sentinel: pick seeds at random, retrying on rejection.
pub const INVALID_SEED: u64 = u64::MAX;
/// Sentinel: derive the bucket count from `lambda`.
pub const INVALID_NUM_BUCKETS: u64 = u64::MAX;
/// Sentinel: derive the table size from `alpha`.
pub const INVALID_TABLE_SIZE: u64 = u64::MAX;

/// Partitions below this average size are not worth their overhead; the
/// partitioned builder clamps to it (dense partitioning excepted).
pub const MIN_PARTITION_SIZE: u64 = 100_000;

/// How many random seeds a builder tries before giving up.
pub const MAX_SEED_ATTEMPTS: u64 = 10;

/// Which displacement combines a pilot with a key hash.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum SearchType {
    /// `slot = (second ^ hash(pilot)) mod table_size`.
    #[default]
    Xor,
    /// The pilot factors as `s * table_size + d`: `s` seeds the initial
    /// positions, `d` is a common additive displacement.
    Add,
}

/// Construction parameters. The `Default` instance builds a minimal PHF with
/// xor displacement, one thread, and derived bucket/table sizes.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BuildConfig {
    /// Target average bucket size; the bucket count defaults to
    /// `ceil(n / lambda)`.
    pub lambda: f64,
    /// Load factor in `(0, 1]`; the table size defaults to `ceil(n / alpha)`.
    pub alpha: f64,
    /// Average partition size for the partitioned builders; 0 means
    /// single-table construction.
    pub avg_partition_size: u64,
    /// Bucket-count override; [`INVALID_NUM_BUCKETS`] derives it.
    pub num_buckets: u64,
    /// Table-size override; [`INVALID_TABLE_SIZE`] derives it.
    pub table_size: u64,
    /// Fixed seed, or [`INVALID_SEED`] to draw seeds randomly with up to
    /// [`MAX_SEED_ATTEMPTS`] retries on rejection.
    pub seed: u64,
    pub num_threads: u64,
    /// Memory budget in bytes for the external-memory builders.
    pub ram: u64,
    /// Scratch directory for `pthash.temp.<id>` spill files.
    pub tmp_dir: PathBuf,
    /// Store pilots interleaved across partitions.
    pub dense_partitioning: bool,
    /// Remap out-of-range slots so the function is minimal.
    pub minimal: bool,
    /// Emit progress lines while searching.
    pub verbose: bool,
    pub search: SearchType,
}

impl Default for BuildConfig {
    fn default() -> Self {
        BuildConfig {
            lambda: 4.5,
            alpha: 0.97,
            avg_partition_size: 0,
            num_buckets: INVALID_NUM_BUCKETS,
            table_size: INVALID_TABLE_SIZE,
            seed: INVALID_SEED,
            num_threads: 1,
            ram: util::available_ram() / 4 * 3,
            tmp_dir: std::env::temp_dir(),
            dense_partitioning: false,
            minimal: true,
            verbose: false,
            search: SearchType::Xor,
        }
    }
}

impl BuildConfig {
    pub(crate) fn validate(&self) -> Result<()> {
        if !(self.alpha > 0.0 && self.alpha <= 1.0) {
            return Err(Error::config("load factor alpha must be in (0, 1]"));
        }
        if self.lambda <= 0.0 {
            return Err(Error::config("lambda must be positive"));
        }
        if self.num_threads == 0 {
            return Err(Error::config("num_threads must be at least 1"));
        }
        Ok(())
    }
}

/// The default single-table minimal PHF: 128-bit Murmur hashes, the skew
/// bucketer, and dictionary-coded pilots split at the dense/sparse boundary.
pub type DefaultPhf = SinglePhf<MurmurHash128, SkewBucketer, DictionaryDictionary>;
/// Partitioned counterpart of [`DefaultPhf`].
pub type DefaultPartitionedPhf = PartitionedPhf<MurmurHash128, SkewBucketer, DictionaryDictionary>;
/// Dense-partitioned default: the opt bucketer with interleaved compact
/// pilots.
pub type DefaultDensePhf = DensePartitionedPhf<MurmurHash128, OptBucketer, InterC>;

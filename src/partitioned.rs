//! Partitioned construction: keys are sharded by the `mix()` projection into
//! independent sub-problems that build in parallel, each with its own table,
//! bucketer, and pilots.

use std::time::Instant;

use log::warn;
use rand::Rng;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::bucketer::{Bucketer, UniformBucketer};
use crate::builder::{hash_keys, SingleBuilder};
use crate::encoders::Encoder;
use crate::error::{Error, Result};
use crate::external::ExternalPartitionedBuilder;
use crate::hash::{check_hash_collision_probability, Hash, Hashable, Hasher};
use crate::single::SinglePhf;
use crate::util::{log_duration, target_num_buckets, target_table_size};
use crate::{BuildConfig, INVALID_SEED, MAX_SEED_ATTEMPTS, MIN_PARTITION_SIZE};

/// Clamp the configured average partition size: a floor keeps partitions
/// worth their overhead (dense partitioning chooses its own sizes and is
/// exempt), and partitions can never exceed the key count.
pub(crate) fn compute_avg_partition_size(num_keys: u64, config: &BuildConfig) -> u64 {
    let mut avg = config.avg_partition_size;
    if config.dense_partitioning {
        return avg;
    }
    if avg < MIN_PARTITION_SIZE {
        warn!("avg_partition_size too small; defaulting to {MIN_PARTITION_SIZE}");
        avg = MIN_PARTITION_SIZE;
    }
    if num_keys < avg {
        warn!("avg_partition_size too large for {num_keys} keys; defaulting to {num_keys}");
        avg = num_keys;
    }
    avg
}

/// Construction output shared by the partitioned and dense-partitioned
/// functions.
pub struct PartitionedBuilder<H: Hasher, B: Bucketer> {
    pub(crate) seed: u64,
    pub(crate) num_keys: u64,
    pub(crate) table_size: u64,
    pub(crate) num_partitions: u64,
    pub(crate) num_buckets_per_partition: u64,
    pub(crate) partitioner: UniformBucketer,
    pub(crate) offsets: Vec<u64>,
    pub(crate) builders: Vec<SingleBuilder<H, B>>,
}

impl<H: Hasher, B: Bucketer> PartitionedBuilder<H, B> {
    pub fn build_from_keys<K: Hashable + Sync>(keys: &[K], config: &BuildConfig) -> Result<Self> {
        let num_keys = keys.len() as u64;
        check_hash_collision_probability::<H>(num_keys)?;
        config.validate()?;

        let avg_partition_size = compute_avg_partition_size(num_keys, config);
        if avg_partition_size == 0 {
            return Err(Error::config(
                "avg_partition_size must be set for partitioned construction",
            ));
        }
        if config.dense_partitioning && config.alpha != 1.0 {
            return Err(Error::config("alpha must be 1.0 for dense partitioning"));
        }
        let num_partitions = num_keys.div_ceil(avg_partition_size);
        if num_partitions == 0 {
            return Err(Error::config("the key set is empty"));
        }

        if config.seed != INVALID_SEED {
            return Self::build_with_seed(keys, num_partitions, config.seed, config);
        }
        let mut rng = ChaCha8Rng::from_os_rng();
        let mut attempt = 0;
        loop {
            attempt += 1;
            let seed = rng.random();
            match Self::build_with_seed(keys, num_partitions, seed, config) {
                Err(err @ Error::SeedRejected { .. }) => {
                    warn!("attempt {attempt} failed: {err}");
                    if attempt == MAX_SEED_ATTEMPTS {
                        return Err(err);
                    }
                }
                result => return result,
            }
        }
    }

    fn build_with_seed(
        keys: &[impl Hashable + Sync],
        num_partitions: u64,
        seed: u64,
        config: &BuildConfig,
    ) -> Result<Self> {
        let num_keys = keys.len() as u64;
        let start = Instant::now();
        let partitioner = UniformBucketer::new(num_partitions);

        let hashes = hash_keys::<H, _>(keys, seed, config.num_threads);
        let mut partitions: Vec<Vec<H::Hash>> = vec![Vec::new(); num_partitions as usize];
        let expected = (1.5 * num_keys as f64 / num_partitions as f64) as usize;
        for partition in partitions.iter_mut() {
            partition.reserve(expected);
        }
        for hash in hashes {
            partitions[partitioner.bucket(hash.mix()) as usize].push(hash);
        }
        log_duration("partition", start);

        let num_buckets_per_partition =
            target_num_buckets(num_keys, config.lambda).div_ceil(num_partitions);
        Self::build_partitions(partitions, num_partitions, seed, config, num_buckets_per_partition)
    }

    /// Build every partition with the internal-memory builder; shared by the
    /// in-memory path above and the external-memory spill path (which hands
    /// partitions over in batches, so the shared bucket count is a
    /// parameter).
    pub(crate) fn build_partitions(
        partitions: Vec<Vec<H::Hash>>,
        num_partitions: u64,
        seed: u64,
        config: &BuildConfig,
        num_buckets_per_partition: u64,
    ) -> Result<Self> {
        let num_keys: u64 = partitions.iter().map(|p| p.len() as u64).sum();

        let mut table_size = 0u64;
        let mut offsets = Vec::with_capacity(num_partitions as usize + 1);
        let mut cumulative = 0u64;
        for partition in &partitions {
            if partition.len() <= 1 {
                return Err(Error::config(
                    "each partition must contain more than one key: use fewer partitions",
                ));
            }
            let partition_table_size = target_table_size(partition.len() as u64, config.alpha);
            table_size += partition_table_size;
            offsets.push(cumulative);
            // Sub-builders of a dense build stay non-minimal; the remap is
            // global, so offsets count table slots.
            cumulative += if config.minimal && !config.dense_partitioning {
                partition.len() as u64
            } else {
                partition_table_size
            };
        }
        offsets.push(cumulative);

        let mut partition_config = config.clone();
        partition_config.seed = seed;
        partition_config.num_buckets = num_buckets_per_partition;
        partition_config.table_size = crate::INVALID_TABLE_SIZE;
        partition_config.num_threads = 1;
        partition_config.verbose = false;
        partition_config.minimal = config.minimal && !config.dense_partitioning;

        let start = Instant::now();
        let builders: Vec<SingleBuilder<H, B>> = if config.num_threads > 1 {
            let pool = rayon::ThreadPoolBuilder::new()
                .num_threads(config.num_threads as usize)
                .build()
                .map_err(|e| Error::ResourceExhausted {
                    phase: "partition build",
                    detail: e.to_string(),
                })?;
            pool.install(|| {
                partitions
                    .par_iter()
                    .map(|p| SingleBuilder::<H, B>::build_from_hashes(p, &partition_config))
                    .collect::<Result<Vec<_>>>()
            })?
        } else {
            partitions
                .iter()
                .map(|p| SingleBuilder::<H, B>::build_from_hashes(p, &partition_config))
                .collect::<Result<Vec<_>>>()?
        };
        log_duration("build parts", start);

        Ok(PartitionedBuilder {
            seed,
            num_keys,
            table_size,
            num_partitions,
            num_buckets_per_partition,
            partitioner: UniformBucketer::new(num_partitions),
            offsets,
            builders,
        })
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    pub fn num_partitions(&self) -> u64 {
        self.num_partitions
    }

    pub fn offsets(&self) -> &[u64] {
        &self.offsets
    }

    pub fn builders(&self) -> &[SingleBuilder<H, B>] {
        &self.builders
    }
}

/// A perfect hash function over partitioned sub-tables.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PartitionedPhf<H: Hasher, B: Bucketer, E: Encoder> {
    seed: u64,
    num_keys: u64,
    table_size: u64,
    partitioner: UniformBucketer,
    offsets: Vec<u64>,
    partitions: Vec<SinglePhf<H, B, E>>,
}

impl<H: Hasher, B: Bucketer, E: Encoder> PartitionedPhf<H, B, E> {
    pub fn build_in_internal_memory<K: Hashable + Sync>(
        keys: &[K],
        config: &BuildConfig,
    ) -> Result<Self> {
        // Interleaved storage is the dense-partitioned function's concern.
        let mut config = config.clone();
        config.dense_partitioning = false;
        let builder = PartitionedBuilder::<H, B>::build_from_keys(keys, &config)?;
        Ok(Self::from_builder(&builder, &config))
    }

    /// Build spilling per-partition hashes to temporary files under
    /// `config.tmp_dir`, reading partitions back in RAM-sized batches.
    pub fn build_in_external_memory<K, I>(
        keys: I,
        num_keys: u64,
        config: &BuildConfig,
    ) -> Result<Self>
    where
        K: Hashable,
        I: Iterator<Item = K> + Clone,
    {
        let mut config = config.clone();
        config.dense_partitioning = false;
        let builder = ExternalPartitionedBuilder::<H, B>::build_from_keys(keys, num_keys, &config)?;
        Ok(Self::from_builder(builder.as_partitioned(), &config))
    }

    fn from_builder(builder: &PartitionedBuilder<H, B>, config: &BuildConfig) -> Self {
        let partitions = builder
            .builders
            .iter()
            .map(|b| SinglePhf::from_builder(b, config))
            .collect();
        PartitionedPhf {
            seed: builder.seed,
            num_keys: builder.num_keys,
            table_size: builder.table_size,
            partitioner: builder.partitioner.clone(),
            offsets: builder.offsets.clone(),
            partitions,
        }
    }

    #[inline]
    pub fn get<K: Hashable + ?Sized>(&self, key: &K) -> u64 {
        self.position(H::hash(key, self.seed))
    }

    #[inline]
    pub fn position(&self, hash: H::Hash) -> u64 {
        let partition = self.partitioner.bucket(hash.mix()) as usize;
        self.offsets[partition] + self.partitions[partition].position(hash)
    }

    pub fn num_keys(&self) -> u64 {
        self.num_keys
    }

    pub fn table_size(&self) -> u64 {
        self.table_size
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    pub fn num_partitions(&self) -> u64 {
        self.partitions.len() as u64
    }

    pub fn num_bits(&self) -> u64 {
        8 * (8 + 8 + 8)
            + self.partitioner.num_bits()
            + self.offsets.len() as u64 * 64
            + self.partitions.iter().map(|p| p.num_bits()).sum::<u64>()
    }

    pub fn bits_per_key(&self) -> f64 {
        self.num_bits() as f64 / self.num_keys as f64
    }
}

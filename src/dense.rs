//! Dense-partitioned function: the same sharding as the partitioned builder,
//! but pilots are stored interleaved across partitions so that the values of
//! one structural bucket sit contiguously for the encoder, and the remap is
//! a single global table.

use bitvec::order::Lsb0;
use bitvec::vec::BitVec;
use serde::{Deserialize, Serialize};

use crate::bits::EliasFano;
use crate::bucketer::{Bucketer, UniformBucketer};
use crate::builder::fill_free_slots;
use crate::dense_encoders::{DenseEncoder, DiffEncoder};
use crate::encoders::CompactEncoder;
use crate::error::{Error, Result};
use crate::fastmod::M64;
use crate::hash::{Hash, Hashable, Hasher};
use crate::partitioned::PartitionedBuilder;
use crate::single::displace;
use crate::{BuildConfig, SearchType};

/// A (minimal) perfect hash function with interleaved pilot storage.
///
/// All partitions share the in-partition bucketer and bucket count, so the
/// pilot of bucket `b` in partition `p` lives at interleaved position
/// `num_partitions * b + p`. Offsets grow almost linearly and are stored as
/// deltas against `table_size / num_partitions`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DensePartitionedPhf<H: Hasher, B: Bucketer, D: DenseEncoder> {
    seed: u64,
    num_keys: u64,
    table_size: u64,
    num_partitions: u64,
    minimal: bool,
    search: SearchType,
    partitioner: UniformBucketer,
    bucketer: B,
    offsets: DiffEncoder<CompactEncoder>,
    pilots: D,
    free_slots: EliasFano,
    #[serde(skip)]
    _hasher: std::marker::PhantomData<H>,
}

impl<H: Hasher, B: Bucketer, D: DenseEncoder> DensePartitionedPhf<H, B, D> {
    pub fn build_in_internal_memory<K: Hashable + Sync>(
        keys: &[K],
        config: &BuildConfig,
    ) -> Result<Self> {
        if !config.dense_partitioning {
            return Err(Error::config(
                "dense_partitioning must be set for a dense-partitioned function",
            ));
        }
        if config.avg_partition_size == 0 {
            return Err(Error::config(
                "avg_partition_size must be set when dense_partitioning is requested",
            ));
        }
        let builder = PartitionedBuilder::<H, B>::build_from_keys(keys, config)?;
        Self::from_builder(&builder, config)
    }

    fn from_builder(builder: &PartitionedBuilder<H, B>, config: &BuildConfig) -> Result<Self> {
        let num_partitions = builder.num_partitions;
        let buckets_per_partition = builder.num_buckets_per_partition;

        // Column-major linearization: bucket-role columns across partitions.
        let mut interleaved =
            Vec::with_capacity((num_partitions * buckets_per_partition) as usize);
        for bucket in 0..buckets_per_partition {
            for partition in &builder.builders {
                interleaved.push(partition.pilots()[bucket as usize]);
            }
        }
        let pilots = D::encode(&interleaved, num_partitions, buckets_per_partition);

        let increment = builder.table_size / num_partitions;
        let offsets = DiffEncoder::<CompactEncoder>::encode(&builder.offsets, increment);

        let free_slots = if config.minimal && builder.table_size > builder.num_keys {
            let mut taken: BitVec<u64, Lsb0> = BitVec::with_capacity(builder.table_size as usize);
            for partition in &builder.builders {
                taken.extend_from_bitslice(partition.taken());
            }
            EliasFano::encode(&fill_free_slots(&taken, builder.num_keys))
        } else {
            EliasFano::default()
        };

        Ok(DensePartitionedPhf {
            seed: builder.seed,
            num_keys: builder.num_keys,
            table_size: builder.table_size,
            num_partitions,
            minimal: config.minimal,
            search: config.search,
            partitioner: builder.partitioner.clone(),
            bucketer: builder.builders[0].bucketer().clone(),
            offsets,
            pilots,
            free_slots,
            _hasher: std::marker::PhantomData,
        })
    }

    #[inline]
    pub fn get<K: Hashable + ?Sized>(&self, key: &K) -> u64 {
        self.position(H::hash(key, self.seed))
    }

    #[inline]
    pub fn position(&self, hash: H::Hash) -> u64 {
        let partition = self.partitioner.bucket(hash.mix());
        let offset = self.offsets.access(partition);
        let partition_size = self.offsets.access(partition + 1) - offset;
        let bucket = self.bucketer.bucket(hash.first());
        let pilot = self.pilots.access(partition, bucket);
        let fm = M64::new(partition_size);
        let raw = offset
            + displace(
                self.search,
                hash.second(),
                pilot,
                self.seed,
                partition_size,
                &fm,
            );
        if self.minimal && raw >= self.num_keys {
            self.free_slots.access(raw - self.num_keys)
        } else {
            raw
        }
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
        self.num_partitions
    }

    pub fn num_bits(&self) -> u64 {
        8 * (8 + 8 + 8 + 8)
            + self.partitioner.num_bits()
            + self.bucketer.num_bits()
            + self.offsets.num_bits()
            + self.pilots.num_bits()
            + self.free_slots.num_bits()
    }

    pub fn bits_per_key(&self) -> f64 {
        self.num_bits() as f64 / self.num_keys as f64
    }
}

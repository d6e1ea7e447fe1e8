//! The single (non-partitioned) perfect hash function.

use serde::{Deserialize, Serialize};

use crate::bits::EliasFano;
use crate::bucketer::Bucketer;
use crate::builder::SingleBuilder;
use crate::encoders::Encoder;
use crate::error::Result;
use crate::external::ExternalSingleBuilder;
use crate::fastmod::M64;
use crate::hash::{default_hash64, Hash, Hashable, Hasher};
use crate::{BuildConfig, SearchType};

/// A perfect hash function over one table.
///
/// With `minimal = true` (the default configuration) the function is a
/// bijection onto `[0, num_keys)`; otherwise it is an injection into
/// `[0, table_size)`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SinglePhf<H: Hasher, B: Bucketer, E: Encoder> {
    seed: u64,
    num_keys: u64,
    table_size: u64,
    fm_table: M64,
    minimal: bool,
    search: SearchType,
    bucketer: B,
    pilots: E,
    free_slots: EliasFano,
    #[serde(skip)]
    _hasher: std::marker::PhantomData<H>,
}

impl<H: Hasher, B: Bucketer, E: Encoder> SinglePhf<H, B, E> {
    /// Build with all construction state held in memory.
    pub fn build_in_internal_memory<K: Hashable + Sync>(
        keys: &[K],
        config: &BuildConfig,
    ) -> Result<Self> {
        let builder = SingleBuilder::<H, B>::build_from_keys(keys, config)?;
        Ok(Self::from_builder(&builder, config))
    }

    /// Build spilling sorted bucket records through temporary files under
    /// `config.tmp_dir`; memory use is bounded by `config.ram`.
    pub fn build_in_external_memory<K, I>(keys: I, num_keys: u64, config: &BuildConfig) -> Result<Self>
    where
        K: Hashable,
        I: Iterator<Item = K> + Clone,
    {
        let builder = ExternalSingleBuilder::<H, B>::build_from_keys(keys, num_keys, config)?;
        Ok(Self::from_builder(builder.as_single(), config))
    }

    pub(crate) fn from_builder(builder: &SingleBuilder<H, B>, config: &BuildConfig) -> Self {
        SinglePhf {
            seed: builder.seed(),
            num_keys: builder.num_keys(),
            table_size: builder.table_size(),
            fm_table: M64::new(builder.table_size()),
            minimal: config.minimal,
            search: config.search,
            bucketer: builder.bucketer().clone(),
            pilots: E::encode(builder.pilots()),
            free_slots: EliasFano::encode(builder.free_slots()),
            _hasher: std::marker::PhantomData,
        }
    }

    /// The position of `key`, in `[0, num_keys)` when minimal and in
    /// `[0, table_size)` otherwise.
    #[inline]
    pub fn get<K: Hashable + ?Sized>(&self, key: &K) -> u64 {
        self.position(H::hash(key, self.seed))
    }

    /// Query from a precomputed hash.
    #[inline]
    pub fn position(&self, hash: H::Hash) -> u64 {
        let bucket = self.bucketer.bucket(hash.first());
        let pilot = self.pilots.access(bucket);
        let raw = displace(
            self.search,
            hash.second(),
            pilot,
            self.seed,
            self.table_size,
            &self.fm_table,
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

    pub fn is_minimal(&self) -> bool {
        self.minimal
    }

    pub fn num_bits(&self) -> u64 {
        8 * (8 + 8 + 8)
            + self.bucketer.num_bits()
            + self.pilots.num_bits()
            + self.free_slots.num_bits()
    }

    pub fn bits_per_key(&self) -> f64 {
        self.num_bits() as f64 / self.num_keys as f64
    }
}

/// The slot a payload lands in for a given pilot. Both search strategies and
/// every query path funnel through here.
#[inline]
pub(crate) fn displace(
    search: SearchType,
    payload: u64,
    pilot: u64,
    seed: u64,
    table_size: u64,
    fm_table: &M64,
) -> u64 {
    match search {
        SearchType::Xor => fm_table.fastmod(payload ^ default_hash64(pilot, seed)),
        SearchType::Add => {
            let s = fm_table.fastdiv(pilot);
            let d = pilot - s * table_size;
            let initial = fm_table.fastmod(payload ^ default_hash64(s, seed));
            let slot = initial + d;
            if slot >= table_size {
                slot - table_size
            } else {
                slot
            }
        }
    }
}

//! Internal-memory builder for one (key set, table) pair: hash, map and
//! order, search pilots, and fill the free-slot remap. The partitioned
//! builders drive this one per partition.

use std::sync::atomic::AtomicU64;
use std::time::Instant;

use bitvec::order::Lsb0;
use bitvec::slice::BitSlice;
use bitvec::vec::BitVec;
use log::warn;
use rand::Rng;
use rand_chacha::ChaCha8Rng;
use rand::SeedableRng;
use rayon::prelude::*;

use crate::buckets::{self, MAX_NUM_BUCKETS};
use crate::bucketer::Bucketer;
use crate::error::{Error, Result};
use crate::hash::{check_hash_collision_probability, Hashable, Hasher};
use crate::search::{self, SearchContext, TakenBitmap};
use crate::util::{log_duration, target_num_buckets, target_table_size};
use crate::{BuildConfig, INVALID_SEED, MAX_SEED_ATTEMPTS};

/// Construction output for a single PHF: everything the query-side structure
/// needs, still uncompressed.
#[derive(Debug)]
pub struct SingleBuilder<H: Hasher, B: Bucketer> {
    seed: u64,
    num_keys: u64,
    table_size: u64,
    num_buckets: u64,
    bucketer: B,
    pilots: Vec<u64>,
    taken: BitVec<u64, Lsb0>,
    free_slots: Vec<u64>,
    _hasher: std::marker::PhantomData<H>,
}

impl<H: Hasher, B: Bucketer> SingleBuilder<H, B> {
    /// Build from keys, drawing seeds until one works when the configured
    /// seed is unset (up to [`MAX_SEED_ATTEMPTS`] tries).
    pub fn build_from_keys<K: Hashable + Sync>(keys: &[K], config: &BuildConfig) -> Result<Self> {
        check_hash_collision_probability::<H>(keys.len() as u64)?;
        config.validate()?;

        if config.seed != INVALID_SEED {
            let hashes = hash_keys::<H, K>(keys, config.seed, config.num_threads);
            return Self::build_from_hashes(&hashes, config);
        }

        let mut rng = ChaCha8Rng::from_os_rng();
        let mut attempt = 0;
        loop {
            attempt += 1;
            let mut attempt_config = config.clone();
            attempt_config.seed = rng.random();
            let hashes = hash_keys::<H, K>(keys, attempt_config.seed, config.num_threads);
            match Self::build_from_hashes(&hashes, &attempt_config) {
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

    /// Build from precomputed hashes with a concrete seed in `config`.
    pub fn build_from_hashes(hashes: &[H::Hash], config: &BuildConfig) -> Result<Self> {
        config.validate()?;
        let num_keys = hashes.len() as u64;
        if num_keys == 0 {
            return Err(Error::config("the key set is empty"));
        }

        let table_size = match config.table_size {
            crate::INVALID_TABLE_SIZE => target_table_size(num_keys, config.alpha),
            t => t,
        };
        debug_assert!(table_size >= num_keys);
        let num_buckets = match config.num_buckets {
            crate::INVALID_NUM_BUCKETS => target_num_buckets(num_keys, config.lambda),
            b => b,
        };
        if num_buckets > MAX_NUM_BUCKETS {
            return Err(Error::config(format!(
                "num_buckets = {num_buckets} does not fit the 32-bit bucket-id width"
            )));
        }
        let bucketer = B::new(num_buckets);

        let start = Instant::now();
        let buckets = buckets::map(hashes, &bucketer, config.seed, config.num_threads)?;
        let start = log_duration("map+sort", start);

        let ordered: Vec<_> = buckets.iter().collect();
        let taken = TakenBitmap::new(table_size);
        let pilots: Vec<AtomicU64> = (0..num_buckets).map(|_| AtomicU64::new(0)).collect();
        let ctx = SearchContext::new(config.seed, table_size, num_keys, num_buckets, config.verbose);
        search::search(
            config.search,
            config.num_threads,
            &ctx,
            &ordered,
            &taken,
            &pilots,
        );
        debug_assert_eq!(taken.count_ones(), num_keys);
        let start = log_duration("search", start);

        let taken = taken.into_bitvec();
        let free_slots = if config.minimal {
            fill_free_slots(&taken, num_keys)
        } else {
            Vec::new()
        };
        log_duration("free slots", start);

        Ok(SingleBuilder {
            seed: config.seed,
            num_keys,
            table_size,
            num_buckets,
            bucketer,
            pilots: pilots.into_iter().map(AtomicU64::into_inner).collect(),
            taken,
            free_slots,
            _hasher: std::marker::PhantomData,
        })
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    pub fn num_keys(&self) -> u64 {
        self.num_keys
    }

    pub fn table_size(&self) -> u64 {
        self.table_size
    }

    pub fn num_buckets(&self) -> u64 {
        self.num_buckets
    }

    pub fn bucketer(&self) -> &B {
        &self.bucketer
    }

    pub fn pilots(&self) -> &[u64] {
        &self.pilots
    }

    pub fn taken(&self) -> &BitSlice<u64, Lsb0> {
        &self.taken
    }

    pub fn free_slots(&self) -> &[u64] {
        &self.free_slots
    }

    pub(crate) fn from_parts(
        seed: u64,
        table_size: u64,
        bucketer: B,
        pilots: Vec<u64>,
        taken: BitVec<u64, Lsb0>,
        free_slots: Vec<u64>,
        num_keys: u64,
    ) -> Self {
        SingleBuilder {
            seed,
            num_keys,
            table_size,
            num_buckets: pilots.len() as u64,
            bucketer,
            pilots,
            taken,
            free_slots,
            _hasher: std::marker::PhantomData,
        }
    }

    /// Peak working memory of an internal build, for the external partitioned
    /// builder's batching decisions.
    pub(crate) fn estimate_build_bytes(num_keys: u64, config: &BuildConfig) -> u64 {
        let table_size = target_table_size(num_keys, config.alpha);
        let num_buckets = match config.num_buckets {
            crate::INVALID_NUM_BUCKETS => target_num_buckets(num_keys, config.lambda),
            b => b,
        };
        let map_bytes = num_keys * 12 + (num_keys + num_buckets) * 8;
        let search_bytes = num_buckets * 8 * 2
            + if config.minimal {
                (table_size - num_keys) * 8
            } else {
                0
            }
            + num_keys * 8
            + table_size / 8;
        map_bytes.max(search_bytes)
    }
}

pub(crate) fn hash_keys<H: Hasher, K: Hashable + Sync>(
    keys: &[K],
    seed: u64,
    num_threads: u64,
) -> Vec<H::Hash> {
    if num_threads > 1 {
        keys.par_iter().map(|k| H::hash(k, seed)).collect()
    } else {
        keys.iter().map(|k| H::hash(k, seed)).collect()
    }
}

/// Build the remap for slots beyond `num_keys`: holes below `num_keys`
/// receive, in order, the occupied positions at and above it. Entries for
/// unoccupied high positions repeat the previous assignment so every index
/// reads a valid redirection.
pub(crate) fn fill_free_slots(taken: &BitSlice<u64, Lsb0>, num_keys: u64) -> Vec<u64> {
    let table_size = taken.len() as u64;
    if table_size <= num_keys {
        return Vec::new();
    }

    let mut free_slots = vec![0u64; (table_size - num_keys) as usize];
    let holes: Vec<u64> = taken[..num_keys as usize]
        .iter_zeros()
        .map(|i| i as u64)
        .collect();

    let mut next_hole = 0usize;
    for i in num_keys..table_size {
        if taken[i as usize] {
            free_slots[(i - num_keys) as usize] = holes[next_hole];
            next_hole += 1;
        }
    }

    // Right-fill the gaps left by unoccupied high positions.
    let mut idx = 0;
    while idx < free_slots.len() && free_slots[idx] == 0 {
        idx += 1;
    }
    let mut value = 0;
    while idx < free_slots.len() {
        if free_slots[idx] == 0 {
            free_slots[idx] = value;
        } else {
            value = free_slots[idx];
        }
        idx += 1;
    }
    free_slots
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bucketer::SkewBucketer;
    use crate::hash::MurmurHash128;
    use crate::util::generate_keys;
    use bitvec::bitvec;

    #[test]
    fn free_slot_closure() {
        let keys = generate_keys(20_000);
        let config = BuildConfig {
            seed: 1234,
            alpha: 0.9,
            ..Default::default()
        };
        let builder =
            SingleBuilder::<MurmurHash128, SkewBucketer>::build_from_keys(&keys, &config).unwrap();
        let n = builder.num_keys();
        assert_eq!(
            builder.free_slots().len() as u64,
            builder.table_size() - n
        );
        for &slot in builder.free_slots() {
            assert!(slot < n);
            assert!(!builder.taken()[slot as usize]);
        }
        // Monotone, as required by the Elias-Fano encoding.
        assert!(builder.free_slots().windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn fill_free_slots_right_fills() {
        // table_size = 8, n = 5; holes at 1, 3; occupied high slots 5 and 7.
        let taken = bitvec![u64, Lsb0; 1, 0, 1, 0, 1, 1, 0, 1];
        let free = fill_free_slots(&taken, 5);
        assert_eq!(free, vec![1, 1, 3]);
    }

    #[test]
    fn pilots_place_all_keys_distinctly() {
        let keys = generate_keys(10_000);
        let config = BuildConfig {
            seed: 99,
            ..Default::default()
        };
        let builder =
            SingleBuilder::<MurmurHash128, SkewBucketer>::build_from_keys(&keys, &config).unwrap();
        assert_eq!(builder.taken().count_ones() as u64, builder.num_keys());
    }
}

//! External-memory construction: when keys do not fit the RAM budget, bucket
//! records are spilled to sorted temporary files and merged back in a single
//! sorted scan that searches pilots batch by batch.
//!
//! Temporary files live under `config.tmp_dir` as `pthash.temp.<id>` and are
//! removed as soon as the merge has consumed them; on failure the builder
//! removes whatever it created before surfacing the error.

use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use log::{info, warn};
use rand::Rng;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rdst::{RadixKey, RadixSort};

use crate::bucketer::Bucketer;
use crate::buckets::MAX_NUM_BUCKETS;
use crate::builder::{fill_free_slots, SingleBuilder};
use crate::error::{Error, Result};
use crate::hash::{check_hash_collision_probability, Hash, Hashable, Hasher};
use crate::partitioned::{compute_avg_partition_size, PartitionedBuilder};
use crate::search::{find_pilot_add, find_pilot_xor, AddSearchState, SearchContext, TakenBitmap};
use crate::util::{log_duration, target_num_buckets, target_table_size};
use crate::{BuildConfig, SearchType, INVALID_SEED, MAX_SEED_ATTEMPTS};

fn temp_path(dir: &Path, id: u64) -> PathBuf {
    dir.join(format!("pthash.temp.{id}"))
}

/// One spilled bucket record. Sorting by `(bucket_size desc, bucket_id asc,
/// payload asc)` makes the merged stream enumerate buckets in exactly the
/// order the search commits them.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct Record {
    bucket_size: u8,
    bucket_id: u32,
    payload: u64,
}

const RECORD_BYTES: usize = 13;

impl Record {
    fn to_bytes(self) -> [u8; RECORD_BYTES] {
        let mut out = [0u8; RECORD_BYTES];
        out[0] = self.bucket_size;
        out[1..5].copy_from_slice(&self.bucket_id.to_le_bytes());
        out[5..13].copy_from_slice(&self.payload.to_le_bytes());
        out
    }

    fn from_bytes(bytes: &[u8]) -> Self {
        Record {
            bucket_size: bytes[0],
            bucket_id: u32::from_le_bytes(bytes[1..5].try_into().unwrap()),
            payload: u64::from_le_bytes(bytes[5..13].try_into().unwrap()),
        }
    }
}

impl Ord for Record {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other
            .bucket_size
            .cmp(&self.bucket_size)
            .then(self.bucket_id.cmp(&other.bucket_id))
            .then(self.payload.cmp(&other.payload))
    }
}

impl PartialOrd for Record {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl RadixKey for Record {
    const LEVELS: usize = 13;

    #[inline]
    fn get_level(&self, level: usize) -> u8 {
        // Level 0 is least significant; the size byte is inverted so larger
        // buckets sort first.
        if level < 8 {
            (self.payload >> (8 * level)) as u8
        } else if level < 12 {
            (self.bucket_id >> (8 * (level - 8))) as u8
        } else {
            !self.bucket_size
        }
    }
}

/// A sorted block on disk plus its buffered reader state.
struct MetaBlock {
    path: PathBuf,
    num_records: u64,
    records_read: u64,
    reader: Option<BufReader<File>>,
    buffer: Vec<Record>,
    pos: usize,
}

impl MetaBlock {
    fn new(path: PathBuf, num_records: u64) -> Self {
        MetaBlock {
            path,
            num_records,
            records_read: 0,
            reader: None,
            buffer: Vec::new(),
            pos: 0,
        }
    }

    fn open(&mut self) -> Result<()> {
        self.reader = Some(BufReader::new(File::open(&self.path)?));
        Ok(())
    }

    fn load(&mut self, num_records: u64) -> Result<()> {
        let remaining = self.num_records - self.records_read;
        let to_read = num_records.min(remaining);
        let reader = self.reader.as_mut().expect("block is open");
        let mut bytes = vec![0u8; to_read as usize * RECORD_BYTES];
        reader.read_exact(&mut bytes)?;
        self.buffer.clear();
        self.buffer
            .extend(bytes.chunks_exact(RECORD_BYTES).map(Record::from_bytes));
        self.records_read += to_read;
        self.pos = 0;
        Ok(())
    }

    /// Pop the next record, refilling the buffer from disk as needed.
    fn next(&mut self, num_records: u64) -> Result<Option<Record>> {
        if self.pos == self.buffer.len() {
            if self.records_read == self.num_records {
                return Ok(None);
            }
            self.load(num_records)?;
        }
        let record = self.buffer[self.pos];
        self.pos += 1;
        Ok(Some(record))
    }

    fn close_and_remove(&mut self) -> Result<()> {
        self.reader = None;
        self.buffer = Vec::new();
        std::fs::remove_file(&self.path)?;
        Ok(())
    }
}

fn best_effort_cleanup(blocks: &[MetaBlock]) {
    for block in blocks {
        let _ = std::fs::remove_file(&block.path);
    }
}

/// Sort one record block and write it to its spill file, off the mapping
/// thread so the next block fills while this one drains.
fn spawn_sort_and_write<'scope>(
    scope: &'scope std::thread::Scope<'scope, '_>,
    mut output: Vec<Record>,
    path: PathBuf,
) -> std::thread::ScopedJoinHandle<'scope, Result<()>> {
    scope.spawn(move || {
        output.radix_sort_unstable();
        let mut writer = BufWriter::new(File::create(&path)?);
        for record in &output {
            writer.write_all(&record.to_bytes())?;
        }
        writer.flush()?;
        Ok(())
    })
}

fn wait_for_block(
    pending: &mut Option<std::thread::ScopedJoinHandle<'_, Result<()>>>,
) -> Result<()> {
    match pending.take() {
        Some(handle) => handle.join().expect("sort thread panicked"),
        None => Ok(()),
    }
}

/// External-memory builder for one single PHF.
pub struct ExternalSingleBuilder<H: Hasher, B: Bucketer> {
    inner: SingleBuilder<H, B>,
}

impl<H: Hasher, B: Bucketer> ExternalSingleBuilder<H, B> {
    pub fn build_from_keys<K, I>(keys: I, num_keys: u64, config: &BuildConfig) -> Result<Self>
    where
        K: Hashable,
        I: Iterator<Item = K> + Clone,
    {
        check_hash_collision_probability::<H>(num_keys)?;
        config.validate()?;
        if num_keys == 0 {
            return Err(Error::config("the key set is empty"));
        }

        if config.seed != INVALID_SEED {
            return Self::build_with_seed(keys, num_keys, config.seed, config);
        }
        let mut rng = ChaCha8Rng::from_os_rng();
        let mut attempt = 0;
        loop {
            attempt += 1;
            let seed = rng.random();
            match Self::build_with_seed(keys.clone(), num_keys, seed, config) {
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

    fn build_with_seed<K, I>(keys: I, num_keys: u64, seed: u64, config: &BuildConfig) -> Result<Self>
    where
        K: Hashable,
        I: Iterator<Item = K> + Clone,
    {
        let table_size = target_table_size(num_keys, config.alpha);
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

        let bucket_sizes_bytes = num_buckets;
        let pilots_bytes = num_buckets * 8;
        let bitmap_bytes = table_size.div_ceil(8);
        let cache_bytes = crate::search::SEARCH_CACHE_SIZE as u64 * 8;
        if bucket_sizes_bytes + pilots_bytes + bitmap_bytes + cache_bytes >= config.ram {
            return Err(Error::ResourceExhausted {
                phase: "external build",
                detail: format!(
                    "the in-core state alone needs more than the {} byte budget",
                    config.ram
                ),
            });
        }

        // Pass 1: per-bucket counts in one byte each.
        let start = Instant::now();
        let mut bucket_sizes = vec![0u8; num_buckets as usize];
        let mut max_bucket_size = 0u8;
        for key in keys.clone() {
            let hash = H::hash(&key, seed);
            let bucket = bucketer.bucket(hash.first()) as usize;
            let size = bucket_sizes[bucket].checked_add(1).ok_or_else(|| {
                Error::config(
                    "a bucket exceeds 255 keys; increase lambda for external-memory construction",
                )
            })?;
            bucket_sizes[bucket] = size;
            max_bucket_size = max_bucket_size.max(size);
        }
        let start = log_duration("bucket sizes", start);

        // Pass 2: fill record blocks, radix-sort and flush each one while
        // the next fills.
        let ram = config.ram - bucket_sizes_bytes;
        let num_records_per_block = (ram / RECORD_BYTES as u64 / 3).max(1);
        let mut blocks: Vec<MetaBlock> = Vec::new();
        let mut input: Vec<Record> = Vec::with_capacity(num_records_per_block as usize);

        let result = std::thread::scope(|scope| -> Result<()> {
            let mut pending = None;

            for key in keys.clone() {
                let hash = H::hash(&key, seed);
                let bucket_id = bucketer.bucket(hash.first()) as u32;
                input.push(Record {
                    bucket_size: bucket_sizes[bucket_id as usize],
                    bucket_id,
                    payload: hash.second(),
                });
                if input.len() as u64 == num_records_per_block {
                    wait_for_block(&mut pending)?;
                    let output = std::mem::take(&mut input);
                    input.reserve(num_records_per_block as usize);
                    let path = temp_path(&config.tmp_dir, blocks.len() as u64);
                    blocks.push(MetaBlock::new(path.clone(), output.len() as u64));
                    pending = Some(spawn_sort_and_write(scope, output, path));
                }
            }
            if !input.is_empty() {
                wait_for_block(&mut pending)?;
                let output = std::mem::take(&mut input);
                let path = temp_path(&config.tmp_dir, blocks.len() as u64);
                blocks.push(MetaBlock::new(path.clone(), output.len() as u64));
                pending = Some(spawn_sort_and_write(scope, output, path));
            }
            wait_for_block(&mut pending)
        });
        if let Err(err) = result {
            best_effort_cleanup(&blocks);
            return Err(err);
        }
        drop(bucket_sizes);
        info!("formed {} sorted block(s)", blocks.len());
        let start = log_duration("form blocks", start);

        // Pass 3: k-way merge and batched search.
        let merge_result = Self::merge_and_search(
            &mut blocks,
            seed,
            num_keys,
            table_size,
            num_buckets,
            max_bucket_size,
            config,
        );
        let (pilots, taken) = match merge_result {
            Ok(out) => out,
            Err(err) => {
                best_effort_cleanup(&blocks);
                return Err(err);
            }
        };
        log_duration("merge+search", start);

        let taken = taken.into_bitvec();
        let free_slots = if config.minimal {
            fill_free_slots(&taken, num_keys)
        } else {
            Vec::new()
        };

        Ok(ExternalSingleBuilder {
            inner: SingleBuilder::from_parts(
                seed, table_size, bucketer, pilots, taken, free_slots, num_keys,
            ),
        })
    }

    fn merge_and_search(
        blocks: &mut [MetaBlock],
        seed: u64,
        num_keys: u64,
        table_size: u64,
        num_buckets: u64,
        max_bucket_size: u8,
        config: &BuildConfig,
    ) -> Result<(Vec<u64>, TakenBitmap)> {
        let bucket_sizes_bytes = num_buckets;
        let pilots_bytes = num_buckets * 8;
        let bitmap_bytes = table_size.div_ceil(8);
        let cache_bytes = crate::search::SEARCH_CACHE_SIZE as u64 * 8;
        let ram = (config.ram + bucket_sizes_bytes)
            .saturating_sub(pilots_bytes + bitmap_bytes + cache_bytes);
        let num_records_per_block =
            (ram / (blocks.len() as u64 + 2) / RECORD_BYTES as u64).max(max_bucket_size as u64 + 1);

        let taken = TakenBitmap::new(table_size);
        let pilots: Vec<AtomicU64> = (0..num_buckets).map(|_| AtomicU64::new(0)).collect();
        let ctx = SearchContext::new(seed, table_size, num_keys, num_buckets, config.verbose);

        let mut heap: BinaryHeap<std::cmp::Reverse<(Record, usize)>> = BinaryHeap::new();
        for (id, block) in blocks.iter_mut().enumerate() {
            block.open()?;
            if let Some(record) = block.next(num_records_per_block)? {
                heap.push(std::cmp::Reverse((record, id)));
            }
        }

        let mut input: Vec<Record> = Vec::new();
        let mut processed_buckets = 0u64;
        while let Some(std::cmp::Reverse((record, id))) = heap.pop() {
            input.push(record);
            if let Some(next) = blocks[id].next(num_records_per_block)? {
                heap.push(std::cmp::Reverse((next, id)));
            } else {
                blocks[id].close_and_remove()?;
            }
            if input.len() as u64 >= num_records_per_block {
                processed_buckets +=
                    Self::search_batch(&mut input, &ctx, &taken, &pilots, seed, config.search)?;
            }
        }
        if !input.is_empty() {
            processed_buckets +=
                Self::search_batch(&mut input, &ctx, &taken, &pilots, seed, config.search)?;
        }
        debug_assert!(input.is_empty());
        info!("external search processed {processed_buckets} buckets");

        Ok((
            pilots.into_iter().map(AtomicU64::into_inner).collect(),
            taken,
        ))
    }

    /// Search the complete buckets of `input`; a bucket whose tail has not
    /// been merged yet is carried over to the next batch.
    fn search_batch(
        input: &mut Vec<Record>,
        ctx: &SearchContext,
        taken: &TakenBitmap,
        pilots: &[AtomicU64],
        seed: u64,
        search: SearchType,
    ) -> Result<u64> {
        let mut payloads: Vec<u64> = Vec::new();
        let mut positions: Vec<u64> = Vec::new();
        let mut add_state = AddSearchState::new(64);
        let mut base = 0usize;
        let mut buckets_done = 0u64;

        while base != input.len() {
            let bucket_id = input[base].bucket_id;
            let bucket_size = input[base].bucket_size as usize;
            debug_assert!(bucket_size > 0);
            if bucket_size > input.len() - base {
                break; // partially merged bucket: keep for the next batch
            }

            let records = &input[base..base + bucket_size];
            if records.windows(2).any(|w| w[0].payload == w[1].payload) {
                return Err(Error::SeedRejected {
                    seed,
                    bucket: bucket_id as u64,
                });
            }
            payloads.clear();
            payloads.extend(records.iter().map(|r| r.payload));

            match search {
                SearchType::Xor => {
                    let pilot = find_pilot_xor(ctx, &payloads, taken, 0, &mut positions);
                    pilots[bucket_id as usize].store(pilot, Ordering::Relaxed);
                    for &p in &positions {
                        taken.set(p);
                    }
                }
                SearchType::Add => {
                    find_pilot_add(ctx, &payloads, taken, &mut add_state);
                    pilots[bucket_id as usize]
                        .store(add_state.pilot(ctx.table_size), Ordering::Relaxed);
                    add_state.commit(taken, ctx.table_size);
                }
            }
            buckets_done += 1;
            base += bucket_size;
        }

        input.drain(..base);
        Ok(buckets_done)
    }

    pub fn as_single(&self) -> &SingleBuilder<H, B> {
        &self.inner
    }
}

/// Per-partition hash spill for the external partitioned builder.
struct MetaPartition<H> {
    path: PathBuf,
    buffered: Vec<H>,
    size: u64,
    created: bool,
}

impl<H: Hash> MetaPartition<H> {
    fn new(dir: &Path, id: u64) -> Self {
        MetaPartition {
            path: temp_path(dir, id),
            buffered: Vec::new(),
            size: 0,
            created: false,
        }
    }

    fn flush(&mut self) -> Result<()> {
        if self.buffered.is_empty() {
            return Ok(());
        }
        let mut file = BufWriter::new(if self.created {
            File::options().append(true).open(&self.path)?
        } else {
            self.created = true;
            File::create(&self.path)?
        });
        for hash in &self.buffered {
            file.write_all(&hash.to_le_bytes()[..H::BYTES])?;
        }
        file.flush()?;
        self.size += self.buffered.len() as u64;
        self.buffered.clear();
        Ok(())
    }

    fn read_back(&self) -> Result<Vec<H>> {
        if self.size == 0 {
            return Ok(Vec::new());
        }
        let mut reader = BufReader::new(File::open(&self.path)?);
        let mut bytes = vec![0u8; self.size as usize * H::BYTES];
        reader.read_exact(&mut bytes)?;
        Ok(bytes.chunks_exact(H::BYTES).map(H::from_le_bytes).collect())
    }

    fn remove(&self) -> Result<()> {
        if self.created {
            std::fs::remove_file(&self.path)?;
        }
        Ok(())
    }
}

/// External-memory partitioned builder: hashes are spilled per partition as
/// raw little-endian arrays, then partitions are read back and built in
/// batches that fit the RAM budget.
pub struct ExternalPartitionedBuilder<H: Hasher, B: Bucketer> {
    inner: PartitionedBuilder<H, B>,
}

impl<H: Hasher, B: Bucketer> ExternalPartitionedBuilder<H, B> {
    pub fn build_from_keys<K, I>(keys: I, num_keys: u64, config: &BuildConfig) -> Result<Self>
    where
        K: Hashable,
        I: Iterator<Item = K> + Clone,
    {
        check_hash_collision_probability::<H>(num_keys)?;
        config.validate()?;
        let avg_partition_size = compute_avg_partition_size(num_keys, config);
        if avg_partition_size == 0 {
            return Err(Error::config(
                "avg_partition_size must be set for partitioned construction",
            ));
        }
        let num_partitions = num_keys.div_ceil(avg_partition_size);
        if num_partitions == 0 {
            return Err(Error::config("the key set is empty"));
        }

        if config.seed != INVALID_SEED {
            return Self::build_with_seed(keys, num_keys, num_partitions, config.seed, config);
        }
        let mut rng = ChaCha8Rng::from_os_rng();
        let mut attempt = 0;
        loop {
            attempt += 1;
            let seed = rng.random();
            match Self::build_with_seed(keys.clone(), num_keys, num_partitions, seed, config) {
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

    fn build_with_seed<K, I>(
        keys: I,
        num_keys: u64,
        num_partitions: u64,
        seed: u64,
        config: &BuildConfig,
    ) -> Result<Self>
    where
        K: Hashable,
        I: Iterator<Item = K> + Clone,
    {
        use crate::bucketer::UniformBucketer;

        let partitioner = UniformBucketer::new(num_partitions);
        let mut partitions: Vec<MetaPartition<H::Hash>> = (0..num_partitions)
            .map(|id| MetaPartition::new(&config.tmp_dir, id))
            .collect();

        // Spill hashes, bounding buffered bytes by the RAM budget.
        let result = (|| -> Result<()> {
            let mut buffered_bytes = 0u64;
            for key in keys {
                let hash = H::hash(&key, seed);
                let partition = partitioner.bucket(hash.mix()) as usize;
                partitions[partition].buffered.push(hash);
                buffered_bytes += H::Hash::BYTES as u64;
                if buffered_bytes >= config.ram {
                    for partition in partitions.iter_mut() {
                        partition.flush()?;
                    }
                    buffered_bytes = 0;
                }
            }
            for partition in partitions.iter_mut() {
                partition.flush()?;
            }
            Ok(())
        })();
        if let Err(err) = result {
            for partition in &partitions {
                let _ = partition.remove();
            }
            return Err(err);
        }

        // Read partitions back in batches the internal builder can hold.
        // The shared bucket count comes from the global key count, not from
        // any one batch.
        let num_buckets_per_partition =
            target_num_buckets(num_keys, config.lambda).div_ceil(num_partitions);
        let build = || -> Result<PartitionedBuilder<H, B>> {
            let mut sub_config = config.clone();
            sub_config.seed = seed;
            sub_config.num_buckets = num_buckets_per_partition;
            let mut batch: Vec<Vec<H::Hash>> = Vec::new();
            let mut batch_bytes = 0u64;
            let mut builders = Vec::with_capacity(num_partitions as usize);

            let flush_batch = |batch: &mut Vec<Vec<H::Hash>>,
                               builders: &mut Vec<SingleBuilder<H, B>>|
             -> Result<()> {
                if batch.is_empty() {
                    return Ok(());
                }
                info!("building {} spilled partition(s)", batch.len());
                let partial = PartitionedBuilder::<H, B>::build_partitions(
                    std::mem::take(batch),
                    num_partitions,
                    seed,
                    config,
                    num_buckets_per_partition,
                )?;
                builders.extend(partial.builders);
                Ok(())
            };

            for partition in &partitions {
                let estimate =
                    SingleBuilder::<H, B>::estimate_build_bytes(partition.size, &sub_config);
                if batch_bytes + estimate >= config.ram && !batch.is_empty() {
                    flush_batch(&mut batch, &mut builders)?;
                    batch_bytes = 0;
                }
                batch.push(partition.read_back()?);
                partition.remove()?;
                batch_bytes += estimate;
            }
            flush_batch(&mut batch, &mut builders)?;

            rebuild_partitioned_metadata(
                builders,
                num_partitions,
                num_buckets_per_partition,
                seed,
                config,
            )
        };
        match build() {
            Ok(inner) => Ok(ExternalPartitionedBuilder { inner }),
            Err(err) => {
                for partition in &partitions {
                    let _ = partition.remove();
                }
                Err(err)
            }
        }
    }

    pub fn as_partitioned(&self) -> &PartitionedBuilder<H, B> {
        &self.inner
    }
}

/// Reassemble the partition-level metadata (offsets, totals) from the
/// per-partition builders produced in batches.
fn rebuild_partitioned_metadata<H: Hasher, B: Bucketer>(
    builders: Vec<SingleBuilder<H, B>>,
    num_partitions: u64,
    num_buckets_per_partition: u64,
    seed: u64,
    config: &BuildConfig,
) -> Result<PartitionedBuilder<H, B>> {
    use crate::bucketer::UniformBucketer;

    let num_keys: u64 = builders.iter().map(|b| b.num_keys()).sum();
    let table_size: u64 = builders.iter().map(|b| b.table_size()).sum();
    let mut offsets = Vec::with_capacity(num_partitions as usize + 1);
    let mut cumulative = 0u64;
    for builder in &builders {
        offsets.push(cumulative);
        cumulative += if config.minimal && !config.dense_partitioning {
            builder.num_keys()
        } else {
            builder.table_size()
        };
    }
    offsets.push(cumulative);

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

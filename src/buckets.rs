//! Mapping and ordering: hash keys into (bucket, payload) pairs, sort them,
//! group them into buckets, and hand the buckets out by decreasing size.
//!
//! Two consecutive pairs with the same bucket and the same payload mean two
//! keys whose hashes are indistinguishable to the search, so the seed is
//! rejected and the caller retries with a fresh one.

use std::cmp::Reverse;
use std::collections::BinaryHeap;

use rayon::prelude::*;
use rdst::{RadixKey, RadixSort};

use crate::bucketer::Bucketer;
use crate::error::{Error, Result};
use crate::hash::Hash;

/// Bucket ids are 32 bits wide; wider configurations are rejected up front.
pub(crate) const MAX_NUM_BUCKETS: u64 = u32::MAX as u64;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) struct BucketPayloadPair {
    pub bucket_id: u32,
    pub payload: u64,
}

impl RadixKey for BucketPayloadPair {
    const LEVELS: usize = 12;

    #[inline]
    fn get_level(&self, level: usize) -> u8 {
        // Level 0 is the least significant byte: payload below bucket id.
        if level < 8 {
            (self.payload >> (8 * level)) as u8
        } else {
            (self.bucket_id >> (8 * (level - 8))) as u8
        }
    }
}

/// Buckets grouped by size: class `k` stores all buckets of size `k + 1`.
/// Iteration yields buckets by decreasing size and, within a size class, by
/// increasing id, which is the deterministic order every search follows.
#[derive(Debug, Default)]
pub(crate) struct Buckets {
    classes: Vec<SizeClass>,
    num_non_empty: u64,
}

#[derive(Debug, Default)]
struct SizeClass {
    ids: Vec<u32>,
    payloads: Vec<u64>,
}

#[derive(Clone, Copy, Debug)]
pub(crate) struct BucketRef<'a> {
    pub id: u32,
    pub payloads: &'a [u64],
}

impl Buckets {
    fn add(&mut self, bucket_id: u32, payloads: &[u64]) {
        debug_assert!(!payloads.is_empty());
        let class = payloads.len() - 1;
        if class >= self.classes.len() {
            self.classes.resize_with(class + 1, Default::default);
        }
        self.classes[class].ids.push(bucket_id);
        self.classes[class].payloads.extend_from_slice(payloads);
        self.num_non_empty += 1;
    }

    pub fn num_non_empty(&self) -> u64 {
        self.num_non_empty
    }

    pub fn max_bucket_size(&self) -> usize {
        self.classes.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = BucketRef<'_>> {
        self.classes
            .iter()
            .enumerate()
            .rev()
            .flat_map(|(class, sc)| {
                let size = class + 1;
                sc.ids.iter().enumerate().map(move |(j, &id)| BucketRef {
                    id,
                    payloads: &sc.payloads[j * size..(j + 1) * size],
                })
            })
    }
}

/// Hash -> (bucket, payload) mapping plus the sort-and-group pipeline.
pub(crate) fn map<H: Hash>(
    hashes: &[H],
    bucketer: &(impl Bucketer + Sync),
    seed: u64,
    num_threads: u64,
) -> Result<Buckets> {
    if num_threads > 1 && hashes.len() as u64 >= num_threads {
        let blocks = map_parallel(hashes, bucketer, num_threads);
        merge_blocks(&blocks, seed)
    } else {
        let mut pairs = map_range(hashes, bucketer);
        pairs.radix_sort_unstable();
        merge_single_block(&pairs, seed)
    }
}

fn map_range<H: Hash>(hashes: &[H], bucketer: &impl Bucketer) -> Vec<BucketPayloadPair> {
    hashes
        .iter()
        .map(|h| BucketPayloadPair {
            bucket_id: bucketer.bucket(h.first()) as u32,
            payload: h.second(),
        })
        .collect()
}

/// Shard the key range, map and sort each shard locally; the shards are then
/// k-way merged so grouping sees one globally sorted stream.
fn map_parallel<H: Hash>(
    hashes: &[H],
    bucketer: &(impl Bucketer + Sync),
    num_threads: u64,
) -> Vec<Vec<BucketPayloadPair>> {
    let chunk = hashes.len().div_ceil(num_threads as usize);
    hashes
        .par_chunks(chunk)
        .map(|range| {
            let mut pairs = map_range(range, bucketer);
            pairs.radix_sort_unstable();
            pairs
        })
        .collect()
}

fn merge_single_block(pairs: &[BucketPayloadPair], seed: u64) -> Result<Buckets> {
    let mut buckets = Buckets::default();
    if pairs.is_empty() {
        return Ok(buckets);
    }
    let mut start = 0usize;
    for i in 1..pairs.len() {
        if pairs[i].bucket_id == pairs[i - 1].bucket_id {
            if pairs[i].payload == pairs[i - 1].payload {
                return Err(Error::SeedRejected {
                    seed,
                    bucket: pairs[i].bucket_id as u64,
                });
            }
        } else {
            add_run(&mut buckets, &pairs[start..i]);
            start = i;
        }
    }
    add_run(&mut buckets, &pairs[start..]);
    Ok(buckets)
}

fn add_run(buckets: &mut Buckets, run: &[BucketPayloadPair]) {
    let payloads: Vec<u64> = run.iter().map(|p| p.payload).collect();
    buckets.add(run[0].bucket_id, &payloads);
}

fn merge_blocks(blocks: &[Vec<BucketPayloadPair>], seed: u64) -> Result<Buckets> {
    let mut buckets = Buckets::default();
    let mut heap: BinaryHeap<Reverse<(BucketPayloadPair, usize)>> = blocks
        .iter()
        .enumerate()
        .filter(|(_, b)| !b.is_empty())
        .map(|(i, b)| Reverse((b[0], i)))
        .collect();
    if heap.is_empty() {
        return Ok(buckets);
    }

    let mut positions = vec![1usize; blocks.len()];
    let mut current_id = heap.peek().unwrap().0 .0.bucket_id;
    let mut payloads: Vec<u64> = Vec::new();

    while let Some(Reverse((pair, block))) = heap.pop() {
        if pair.bucket_id == current_id {
            if payloads.last() == Some(&pair.payload) {
                return Err(Error::SeedRejected {
                    seed,
                    bucket: pair.bucket_id as u64,
                });
            }
            payloads.push(pair.payload);
        } else {
            buckets.add(current_id, &payloads);
            current_id = pair.bucket_id;
            payloads.clear();
            payloads.push(pair.payload);
        }
        let pos = positions[block];
        if pos < blocks[block].len() {
            positions[block] = pos + 1;
            heap.push(Reverse((blocks[block][pos], block)));
        }
    }
    buckets.add(current_id, &payloads);
    Ok(buckets)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bucketer::SkewBucketer;
    use crate::hash::{Hash64, Hasher, MurmurHash64};

    fn hashes(n: u64, seed: u64) -> Vec<Hash64> {
        (0..n).map(|k| MurmurHash64::hash(&k, seed)).collect()
    }

    #[test]
    fn ordering_is_size_desc_then_id_asc() {
        let hashes = hashes(10_000, 42);
        let bucketer = SkewBucketer::new(2000);
        for threads in [1, 4] {
            let buckets = map(&hashes, &bucketer, 42, threads).unwrap();
            let mut total = 0u64;
            let mut last: Option<(usize, u32)> = None;
            for b in buckets.iter() {
                total += b.payloads.len() as u64;
                if let Some((size, id)) = last {
                    assert!(b.payloads.len() <= size);
                    if b.payloads.len() == size {
                        assert!(b.id > id);
                    }
                }
                last = Some((b.payloads.len(), b.id));
            }
            assert_eq!(total, 10_000);
        }
    }

    #[test]
    fn parallel_and_sequential_group_identically() {
        let hashes = hashes(50_000, 7);
        let bucketer = SkewBucketer::new(11_000);
        let seq = map(&hashes, &bucketer, 7, 1).unwrap();
        let par = map(&hashes, &bucketer, 7, 4).unwrap();
        let seq_list: Vec<_> = seq.iter().map(|b| (b.id, b.payloads.to_vec())).collect();
        let par_list: Vec<_> = par.iter().map(|b| (b.id, b.payloads.to_vec())).collect();
        assert_eq!(seq_list, par_list);
    }

    #[test]
    fn duplicate_payload_rejects_seed() {
        let mut hs = hashes(100, 3);
        hs.push(hs[17]);
        let bucketer = SkewBucketer::new(30);
        let err = map(&hs, &bucketer, 3, 1).unwrap_err();
        assert!(err.is_seed_rejection());
    }
}

//! Pilot search: for each bucket, in decreasing-size order, find the
//! smallest pilot that places every bucket member into a free slot of the
//! table.
//!
//! The parallel variants keep the exact sequential semantics: workers take
//! buckets round-robin and search speculatively against the shared bitmap,
//! but a bucket commits only when the global counter reaches its position in
//! the ordered sequence. The counter increment is a release store and the
//! waiters load it with acquire, so every commit observes all bits written
//! by its predecessors. Speculative rejections stay valid because taken bits
//! only ever flip from zero to one while a search runs.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Instant;

use bitvec::order::Lsb0;
use bitvec::vec::BitVec;
use itertools::Itertools;
use log::info;

use crate::buckets::BucketRef;
use crate::fastmod::M64;
use crate::hash::default_hash64;
use crate::SearchType;

/// How many hashed pilots (or hashed displacement seeds) are precomputed.
/// This table is the hottest read of the inner loop.
pub(crate) const SEARCH_CACHE_SIZE: usize = 1000;

/// Occupancy bitmap shared by all search workers. Bits are only ever set
/// while a search runs; the commit counter provides the ordering.
pub(crate) struct TakenBitmap {
    words: Vec<AtomicU64>,
    len: u64,
}

impl TakenBitmap {
    pub fn new(len: u64) -> Self {
        TakenBitmap {
            words: (0..len.div_ceil(64)).map(|_| AtomicU64::new(0)).collect(),
            len,
        }
    }

    #[inline]
    pub fn get(&self, pos: u64) -> bool {
        let w = self.words[(pos / 64) as usize].load(Ordering::Relaxed);
        (w >> (pos % 64)) & 1 == 1
    }

    #[inline]
    pub fn set(&self, pos: u64) {
        self.words[(pos / 64) as usize].fetch_or(1u64 << (pos % 64), Ordering::Relaxed);
    }

    pub fn count_ones(&self) -> u64 {
        self.words
            .iter()
            .map(|w| w.load(Ordering::Relaxed).count_ones() as u64)
            .sum()
    }

    pub fn into_bitvec(self) -> BitVec<u64, Lsb0> {
        let words: Vec<u64> = self.words.into_iter().map(AtomicU64::into_inner).collect();
        let mut bv = BitVec::from_vec(words);
        bv.truncate(self.len as usize);
        bv
    }
}

pub(crate) struct SearchContext {
    pub seed: u64,
    pub table_size: u64,
    pub num_keys: u64,
    pub num_buckets: u64,
    pub verbose: bool,
    pub fm: M64,
    cache: Vec<u64>,
}

impl SearchContext {
    pub fn new(seed: u64, table_size: u64, num_keys: u64, num_buckets: u64, verbose: bool) -> Self {
        let cache = (0..SEARCH_CACHE_SIZE as u64)
            .map(|p| default_hash64(p, seed))
            .collect();
        SearchContext {
            seed,
            table_size,
            num_keys,
            num_buckets,
            verbose,
            fm: M64::new(table_size),
            cache,
        }
    }

    #[inline]
    fn hashed_pilot(&self, pilot: u64) -> u64 {
        if (pilot as usize) < SEARCH_CACHE_SIZE {
            self.cache[pilot as usize]
        } else {
            default_hash64(pilot, self.seed)
        }
    }

    #[inline]
    fn slot(&self, payload: u64, hashed_pilot: u64) -> u64 {
        self.fm.fastmod(payload ^ hashed_pilot)
    }
}

struct SearchLogger {
    num_keys: u64,
    num_buckets: u64,
    step: u64,
    placed_keys: u64,
    start: Instant,
    enabled: bool,
}

impl SearchLogger {
    fn new(ctx: &SearchContext) -> Self {
        if ctx.verbose {
            info!("search starts");
        }
        SearchLogger {
            num_keys: ctx.num_keys,
            num_buckets: ctx.num_buckets,
            step: (ctx.num_buckets / 20).max(1),
            placed_keys: 0,
            start: Instant::now(),
            enabled: ctx.verbose,
        }
    }

    fn update(&mut self, bucket_idx: u64, bucket_size: u64) {
        self.placed_keys += bucket_size;
        debug_assert!(self.placed_keys <= self.num_keys);
        if self.enabled && bucket_idx > 0 && bucket_idx % self.step == 0 {
            info!(
                "{} buckets done in {:.2?} ({:.2}% of keys, {:.2}% of buckets)",
                bucket_idx,
                self.start.elapsed(),
                self.placed_keys as f64 * 100.0 / self.num_keys as f64,
                bucket_idx as f64 * 100.0 / self.num_buckets as f64,
            );
        }
    }

    fn finalize(&self, num_non_empty: u64) {
        if self.enabled {
            let empty = self.num_buckets - num_non_empty;
            info!(
                "search ends: {} empty buckets ({:.2}%)",
                empty,
                empty as f64 * 100.0 / self.num_buckets as f64,
            );
        }
    }
}

/// Entry point used by the builders: dispatch on search type and thread
/// count. `ordered` holds the non-empty buckets in `(size desc, id asc)`
/// order; pilots land at `pilots[bucket_id]`.
pub(crate) fn search(
    search_type: SearchType,
    num_threads: u64,
    ctx: &SearchContext,
    ordered: &[BucketRef<'_>],
    taken: &TakenBitmap,
    pilots: &[AtomicU64],
) {
    if ordered.is_empty() {
        return;
    }
    match (search_type, num_threads > 1) {
        (SearchType::Xor, false) => search_sequential_xor(ctx, ordered, taken, pilots),
        (SearchType::Xor, true) => search_parallel_xor(ctx, ordered, taken, pilots, num_threads),
        (SearchType::Add, false) => search_sequential_add(ctx, ordered, taken, pilots),
        (SearchType::Add, true) => search_parallel_add(ctx, ordered, taken, pilots, num_threads),
    }
}

/// Find the smallest pilot >= `start_pilot` whose slots are all free and
/// pairwise distinct. Leaves the (sorted) slots in `positions`.
#[inline]
pub(crate) fn find_pilot_xor(
    ctx: &SearchContext,
    payloads: &[u64],
    taken: &TakenBitmap,
    start_pilot: u64,
    positions: &mut Vec<u64>,
) -> u64 {
    let mut pilot = start_pilot;
    'pilot: loop {
        let hashed_pilot = ctx.hashed_pilot(pilot);
        positions.clear();
        for &payload in payloads {
            let p = ctx.slot(payload, hashed_pilot);
            if taken.get(p) {
                pilot += 1;
                continue 'pilot;
            }
            positions.push(p);
        }
        positions.sort_unstable();
        if positions.iter().tuple_windows().any(|(a, b)| a == b) {
            pilot += 1;
            continue 'pilot;
        }
        return pilot;
    }
}

fn search_sequential_xor(
    ctx: &SearchContext,
    ordered: &[BucketRef<'_>],
    taken: &TakenBitmap,
    pilots: &[AtomicU64],
) {
    let mut logger = SearchLogger::new(ctx);
    let mut positions = Vec::with_capacity(ordered[0].payloads.len());

    for (idx, bucket) in ordered.iter().enumerate() {
        let pilot = find_pilot_xor(ctx, bucket.payloads, taken, 0, &mut positions);
        pilots[bucket.id as usize].store(pilot, Ordering::Relaxed);
        for &p in &positions {
            debug_assert!(!taken.get(p));
            taken.set(p);
        }
        logger.update(idx as u64, bucket.payloads.len() as u64);
    }
    logger.finalize(ordered.len() as u64);
}

fn search_parallel_xor(
    ctx: &SearchContext,
    ordered: &[BucketRef<'_>],
    taken: &TakenBitmap,
    pilots: &[AtomicU64],
    num_threads: u64,
) {
    let num_non_empty = ordered.len() as u64;
    let num_workers = num_threads.min(num_non_empty);
    let next_bucket_idx = AtomicU64::new(0);
    let logger = Mutex::new(SearchLogger::new(ctx));

    std::thread::scope(|scope| {
        for worker in 0..num_workers {
            let next_bucket_idx = &next_bucket_idx;
            let logger = &logger;
            scope.spawn(move || {
                let mut positions = Vec::with_capacity(ordered[0].payloads.len());
                let mut local_idx = worker;

                while local_idx < num_non_empty {
                    let bucket = &ordered[local_idx as usize];
                    let mut pilot = 0u64;
                    let mut have_candidate = false;

                    loop {
                        let observed = next_bucket_idx.load(Ordering::Acquire);
                        if have_candidate {
                            // A predecessor committed since the candidate was
                            // found: the recorded slots must still be free.
                            if positions.iter().any(|&p| taken.get(p)) {
                                have_candidate = false;
                            }
                        }
                        if !have_candidate {
                            pilot = find_pilot_xor(ctx, bucket.payloads, taken, pilot, &mut positions);
                            have_candidate = true;
                        }
                        if observed == local_idx {
                            break;
                        }
                        while next_bucket_idx.load(Ordering::Acquire) == observed {
                            std::hint::spin_loop();
                        }
                    }

                    // Strictly ordered from here: every earlier bucket has
                    // committed and no later one may touch the bitmap.
                    pilots[bucket.id as usize].store(pilot, Ordering::Relaxed);
                    for &p in &positions {
                        debug_assert!(!taken.get(p));
                        taken.set(p);
                    }
                    logger
                        .lock()
                        .unwrap()
                        .update(local_idx, bucket.payloads.len() as u64);
                    next_bucket_idx.fetch_add(1, Ordering::Release);
                    local_idx += num_workers;
                }
            });
        }
    });

    debug_assert_eq!(next_bucket_idx.load(Ordering::Relaxed), num_non_empty);
    logger.lock().unwrap().finalize(num_non_empty);
}

/// Additive-displacement search state for one bucket: the pilot is
/// `s * table_size + d`, where `s` seeds the initial positions and `d` is a
/// common displacement swept over the table.
///
/// Initial positions are kept with the wrap-around bookkeeping of the
/// reference implementation: once `position + d` crosses the table size, the
/// stored position is reduced so the sum stays the true slot for all larger
/// `d` (in wrapping arithmetic).
pub(crate) struct AddSearchState {
    pub s: u64,
    pub d: u64,
    positions: Vec<u64>,
}

impl AddSearchState {
    pub fn new(capacity: usize) -> Self {
        AddSearchState {
            s: 0,
            d: 0,
            positions: Vec::with_capacity(capacity),
        }
    }

    pub fn pilot(&self, table_size: u64) -> u64 {
        self.s * table_size + self.d
    }

    /// Compute the initial positions for the current `s`, advancing `s`
    /// until the bucket maps to pairwise-distinct positions.
    fn prime(&mut self, ctx: &SearchContext, payloads: &[u64]) {
        loop {
            let hashed_s = ctx.hashed_pilot(self.s);
            self.positions.clear();
            self.positions
                .extend(payloads.iter().map(|&h| ctx.slot(h, hashed_s)));
            self.positions.sort_unstable();
            if self.positions.iter().tuple_windows().all(|(a, b)| a != b) {
                self.d = 0;
                return;
            }
            self.s += 1;
        }
    }

    /// Sweep `d` upward from the current value until every slot is free,
    /// rolling over to the next `s` when the table is exhausted.
    fn advance(&mut self, ctx: &SearchContext, payloads: &[u64], taken: &TakenBitmap) {
        let table_size = ctx.table_size;
        loop {
            'displacement: while self.d < table_size {
                for position in self.positions.iter_mut() {
                    let mut slot = position.wrapping_add(self.d);
                    if slot >= table_size {
                        // First crossing for this position: reduce both.
                        slot = slot.wrapping_sub(table_size);
                        *position = position.wrapping_sub(table_size);
                    }
                    if taken.get(slot) {
                        self.d += 1;
                        continue 'displacement;
                    }
                }
                return;
            }
            self.s += 1;
            self.prime(ctx, payloads);
        }
    }

    /// Re-check the current `(s, d)` candidate against the bitmap.
    fn still_free(&self, taken: &TakenBitmap, table_size: u64) -> bool {
        self.final_slots(table_size).all(|slot| !taken.get(slot))
    }

    fn final_slots(&self, table_size: u64) -> impl Iterator<Item = u64> + '_ {
        let d = self.d;
        self.positions.iter().map(move |&p| {
            let slot = p.wrapping_add(d);
            if slot >= table_size {
                slot.wrapping_sub(table_size)
            } else {
                slot
            }
        })
    }

    pub(crate) fn commit(&self, taken: &TakenBitmap, table_size: u64) {
        for slot in self.final_slots(table_size) {
            debug_assert!(!taken.get(slot));
            taken.set(slot);
        }
    }
}

/// One full additive pilot search against the current bitmap state.
#[inline]
pub(crate) fn find_pilot_add(
    ctx: &SearchContext,
    payloads: &[u64],
    taken: &TakenBitmap,
    state: &mut AddSearchState,
) {
    state.s = 0;
    state.prime(ctx, payloads);
    state.advance(ctx, payloads, taken);
}

fn search_sequential_add(
    ctx: &SearchContext,
    ordered: &[BucketRef<'_>],
    taken: &TakenBitmap,
    pilots: &[AtomicU64],
) {
    let mut logger = SearchLogger::new(ctx);
    let mut state = AddSearchState::new(ordered[0].payloads.len());

    for (idx, bucket) in ordered.iter().enumerate() {
        find_pilot_add(ctx, bucket.payloads, taken, &mut state);
        pilots[bucket.id as usize].store(state.pilot(ctx.table_size), Ordering::Relaxed);
        state.commit(taken, ctx.table_size);
        logger.update(idx as u64, bucket.payloads.len() as u64);
    }
    logger.finalize(ordered.len() as u64);
}

/// Parallel additive search under the same commit discipline as the xor
/// variant. Rejections of `(s, d)` candidates against an older bitmap stay
/// valid, so an invalidated candidate resumes at the next displacement
/// instead of restarting.
fn search_parallel_add(
    ctx: &SearchContext,
    ordered: &[BucketRef<'_>],
    taken: &TakenBitmap,
    pilots: &[AtomicU64],
    num_threads: u64,
) {
    let num_non_empty = ordered.len() as u64;
    let num_workers = num_threads.min(num_non_empty);
    let next_bucket_idx = AtomicU64::new(0);
    let logger = Mutex::new(SearchLogger::new(ctx));

    std::thread::scope(|scope| {
        for worker in 0..num_workers {
            let next_bucket_idx = &next_bucket_idx;
            let logger = &logger;
            scope.spawn(move || {
                let mut state = AddSearchState::new(ordered[0].payloads.len());
                let mut local_idx = worker;

                while local_idx < num_non_empty {
                    let bucket = &ordered[local_idx as usize];
                    state.s = 0;
                    state.prime(ctx, bucket.payloads);
                    let mut have_candidate = false;

                    loop {
                        let observed = next_bucket_idx.load(Ordering::Acquire);
                        if have_candidate && !state.still_free(taken, ctx.table_size) {
                            state.d += 1;
                            have_candidate = false;
                        }
                        if !have_candidate {
                            state.advance(ctx, bucket.payloads, taken);
                            have_candidate = true;
                        }
                        if observed == local_idx {
                            break;
                        }
                        while next_bucket_idx.load(Ordering::Acquire) == observed {
                            std::hint::spin_loop();
                        }
                    }

                    pilots[bucket.id as usize].store(state.pilot(ctx.table_size), Ordering::Relaxed);
                    state.commit(taken, ctx.table_size);
                    logger
                        .lock()
                        .unwrap()
                        .update(local_idx, bucket.payloads.len() as u64);
                    next_bucket_idx.fetch_add(1, Ordering::Release);
                    local_idx += num_workers;
                }
            });
        }
    });

    debug_assert_eq!(next_bucket_idx.load(Ordering::Relaxed), num_non_empty);
    logger.lock().unwrap().finalize(num_non_empty);
}

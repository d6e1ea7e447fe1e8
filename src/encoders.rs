//! Compressed representations of the pilot array.
//!
//! Pilots are small, highly repetitive integers; which code wins depends on
//! the bucketer and the load factor. The dual encoders split the sequence at
//! the dense/sparse boundary of the skew bucketer (the front 30%) so each
//! part gets the code that suits its distribution.

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

use crate::bits::{bits_for, BitVector, CompactVector, EliasFano, SelectIndex};

/// A random-access code for a sequence of unsigned integers.
pub trait Encoder: Sized + Send + Sync {
    fn name() -> String;

    fn encode(values: &[u64]) -> Self;

    fn access(&self, i: u64) -> u64;

    fn len(&self) -> u64;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn num_bits(&self) -> u64;
}

/// Fixed-width code: every value takes `ceil(log2(max + 1))` bits.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct CompactEncoder {
    values: CompactVector,
}

impl Encoder for CompactEncoder {
    fn name() -> String {
        "C".to_string()
    }

    fn encode(values: &[u64]) -> Self {
        CompactEncoder {
            values: CompactVector::from_values(values),
        }
    }

    #[inline]
    fn access(&self, i: u64) -> u64 {
        self.values.get(i)
    }

    fn len(&self) -> u64 {
        self.values.len()
    }

    fn num_bits(&self) -> u64 {
        self.values.num_bits()
    }
}

/// Fixed-width code per block of 256 values, so local maxima do not inflate
/// the whole sequence.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct PartitionedCompactEncoder {
    len: u64,
    bit_widths: Vec<u32>, // prefix-summed widths, one entry per block plus one
    values: BitVector,
}

impl PartitionedCompactEncoder {
    const PARTITION_SIZE: u64 = 256;
}

impl Encoder for PartitionedCompactEncoder {
    fn name() -> String {
        "PC".to_string()
    }

    fn encode(values: &[u64]) -> Self {
        let n = values.len() as u64;
        let mut bit_widths = Vec::with_capacity((n.div_ceil(Self::PARTITION_SIZE) + 1) as usize);
        bit_widths.push(0u32);
        let mut packed = BitVector::new();
        for block in values.chunks(Self::PARTITION_SIZE as usize) {
            let width = bits_for(block.iter().copied().max().unwrap_or(0));
            for &v in block {
                packed.push_bits(v, width);
            }
            bit_widths.push(bit_widths.last().unwrap() + width);
        }
        PartitionedCompactEncoder {
            len: n,
            bit_widths,
            values: packed,
        }
    }

    #[inline]
    fn access(&self, i: u64) -> u64 {
        let partition = (i / Self::PARTITION_SIZE) as usize;
        let offset = i % Self::PARTITION_SIZE;
        let width = self.bit_widths[partition + 1] - self.bit_widths[partition];
        let pos = self.bit_widths[partition] as u64 * Self::PARTITION_SIZE + offset * width as u64;
        self.values.get_bits(pos, width)
    }

    fn len(&self) -> u64 {
        self.len
    }

    fn num_bits(&self) -> u64 {
        64 + self.bit_widths.len() as u64 * 32 + self.values.num_bits()
    }
}

/// Distinct values sorted by decreasing frequency get small codewords; the
/// sequence stores codewords at fixed width plus the dictionary itself.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct DictionaryEncoder {
    ranks: CompactVector,
    dict: CompactVector,
}

impl Encoder for DictionaryEncoder {
    fn name() -> String {
        "D".to_string()
    }

    fn encode(values: &[u64]) -> Self {
        let mut frequency: FxHashMap<u64, u64> = FxHashMap::default();
        for &v in values {
            *frequency.entry(v).or_insert(0) += 1;
        }
        let mut by_frequency: Vec<(u64, u64)> = frequency.into_iter().collect();
        // Value ties keep the assignment deterministic across builds.
        by_frequency.sort_unstable_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));

        let mut rank_of: FxHashMap<u64, u64> = FxHashMap::default();
        let mut dict = Vec::with_capacity(by_frequency.len());
        for (rank, (value, _)) in by_frequency.into_iter().enumerate() {
            rank_of.insert(value, rank as u64);
            dict.push(value);
        }
        let ranks: Vec<u64> = values.iter().map(|v| rank_of[v]).collect();
        DictionaryEncoder {
            ranks: CompactVector::from_values(&ranks),
            dict: CompactVector::from_values(&dict),
        }
    }

    #[inline]
    fn access(&self, i: u64) -> u64 {
        self.dict.get(self.ranks.get(i))
    }

    fn len(&self) -> u64 {
        self.ranks.len()
    }

    fn num_bits(&self) -> u64 {
        self.ranks.num_bits() + self.dict.num_bits()
    }
}

/// Golomb-Rice code: a fixed low part of `l` bits and a unary high part,
/// with `l` chosen from the sample mean (Kiely's formula).
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct RiceEncoder {
    high: BitVector,
    select: SelectIndex,
    low: CompactVector,
    len: u64,
}

impl RiceEncoder {
    fn optimal_parameter(values: &[u64]) -> u32 {
        let n = values.len() as u64;
        let sum: u128 = values.iter().map(|&v| v as u128).sum();
        if sum == 0 {
            return 0;
        }
        let p = n as f64 / (sum as f64 + n as f64);
        const GOLDEN: f64 = 1.618033988749895;
        let l = 1.0 + ((GOLDEN - 1.0).ln() / (1.0 - p).ln()).log2().floor();
        if l.is_finite() && l > 0.0 {
            l as u32
        } else {
            0
        }
    }
}

impl Encoder for RiceEncoder {
    fn name() -> String {
        "R".to_string()
    }

    fn encode(values: &[u64]) -> Self {
        let n = values.len() as u64;
        if n == 0 {
            return Default::default();
        }
        let l = Self::optimal_parameter(values);
        let low_mask = if l == 0 { 0 } else { (1u64 << l) - 1 };

        let mut low = CompactVector::with_width(l);
        let mut high = BitVector::new();
        for &v in values {
            if l > 0 {
                low.push(v & low_mask);
            }
            let unary = v >> l;
            for _ in 0..unary {
                high.push_bits(0, 1);
            }
            high.push_bits(1, 1);
        }
        let select = SelectIndex::build(&high);
        RiceEncoder {
            high,
            select,
            low,
            len: n,
        }
    }

    #[inline]
    fn access(&self, i: u64) -> u64 {
        let start = if i == 0 {
            0
        } else {
            self.select.select(&self.high, i - 1) + 1
        };
        let high = self.select.select(&self.high, i) - start;
        let l = self.low.width();
        if l == 0 {
            high
        } else {
            (high << l) | self.low.get(i)
        }
    }

    fn len(&self) -> u64 {
        self.len
    }

    fn num_bits(&self) -> u64 {
        64 + self.high.num_bits() + self.select.num_bits() + self.low.num_bits()
    }
}

/// Elias-Fano over the prefix sums of the sequence; random access reads one
/// consecutive difference.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct EliasFanoEncoder {
    prefix_sums: EliasFano,
}

impl Encoder for EliasFanoEncoder {
    fn name() -> String {
        "EF".to_string()
    }

    fn encode(values: &[u64]) -> Self {
        let mut prefix = Vec::with_capacity(values.len() + 1);
        let mut acc = 0u64;
        prefix.push(0);
        for &v in values {
            acc += v;
            prefix.push(acc);
        }
        EliasFanoEncoder {
            prefix_sums: EliasFano::encode(&prefix),
        }
    }

    #[inline]
    fn access(&self, i: u64) -> u64 {
        self.prefix_sums.diff(i)
    }

    fn len(&self) -> u64 {
        self.prefix_sums.len().saturating_sub(1)
    }

    fn num_bits(&self) -> u64 {
        self.prefix_sums.num_bits()
    }
}

/// Splits the sequence at the skew bucketer's dense/sparse boundary and
/// encodes the two parts independently.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct DualEncoder<Front, Back> {
    front: Front,
    back: Back,
}

impl<Front: Encoder, Back: Encoder> Encoder for DualEncoder<Front, Back> {
    fn name() -> String {
        format!("{}-{}", Front::name(), Back::name())
    }

    fn encode(values: &[u64]) -> Self {
        let front_size = (values.len() as f64 * crate::bucketer::SkewBucketer::B) as usize;
        DualEncoder {
            front: Front::encode(&values[..front_size]),
            back: Back::encode(&values[front_size..]),
        }
    }

    #[inline]
    fn access(&self, i: u64) -> u64 {
        if i < self.front.len() {
            self.front.access(i)
        } else {
            self.back.access(i - self.front.len())
        }
    }

    fn len(&self) -> u64 {
        self.front.len() + self.back.len()
    }

    fn num_bits(&self) -> u64 {
        self.front.num_bits() + self.back.num_bits()
    }
}

pub type CompactCompact = DualEncoder<CompactEncoder, CompactEncoder>;
pub type DictionaryDictionary = DualEncoder<DictionaryEncoder, DictionaryEncoder>;
pub type DictionaryEliasFano = DualEncoder<DictionaryEncoder, EliasFanoEncoder>;
pub type RiceRice = DualEncoder<RiceEncoder, RiceEncoder>;
pub type CompactRice = DualEncoder<CompactEncoder, RiceEncoder>;

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;

    fn pilot_like_values(n: usize) -> Vec<u64> {
        // Geometric-ish distribution resembling searched pilots.
        let mut rng = rand::rng();
        (0..n)
            .map(|_| {
                let r: f64 = rng.random();
                (-(1.0 - r).ln() * 40.0) as u64
            })
            .collect()
    }

    fn round_trip<E: Encoder>(values: &[u64]) {
        let enc = E::encode(values);
        assert_eq!(enc.len(), values.len() as u64);
        for (i, &v) in values.iter().enumerate() {
            assert_eq!(enc.access(i as u64), v, "{} at {}", E::name(), i);
        }
        assert!(enc.num_bits() > 0);
    }

    #[test]
    fn all_families_round_trip() {
        let values = pilot_like_values(10_000);
        round_trip::<CompactEncoder>(&values);
        round_trip::<PartitionedCompactEncoder>(&values);
        round_trip::<DictionaryEncoder>(&values);
        round_trip::<RiceEncoder>(&values);
        round_trip::<EliasFanoEncoder>(&values);
        round_trip::<CompactCompact>(&values);
        round_trip::<DictionaryDictionary>(&values);
        round_trip::<DictionaryEliasFano>(&values);
        round_trip::<RiceRice>(&values);
        round_trip::<CompactRice>(&values);
    }

    #[test]
    fn degenerate_sequences() {
        round_trip::<CompactEncoder>(&[0, 0, 0, 0]);
        round_trip::<PartitionedCompactEncoder>(&[0; 1000]);
        round_trip::<DictionaryEncoder>(&[7; 300]);
        round_trip::<RiceEncoder>(&[0; 300]);
        round_trip::<EliasFanoEncoder>(&[0, 0, 1, 0, 2]);
        round_trip::<RiceRice>(&[u32::MAX as u64; 10]);
    }

    #[test]
    fn deterministic_encoding() {
        let values = pilot_like_values(5_000);
        let a = bincode::serialize(&DictionaryEncoder::encode(&values)).unwrap();
        let b = bincode::serialize(&DictionaryEncoder::encode(&values)).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn partitioned_compact_beats_compact_on_blocky_input() {
        // One huge value in the last block; per-block widths contain it.
        let mut values = vec![3u64; 10_000];
        values.push(u64::MAX >> 1);
        let pc = PartitionedCompactEncoder::encode(&values);
        let c = CompactEncoder::encode(&values);
        assert!(pc.num_bits() < c.num_bits());
    }
}

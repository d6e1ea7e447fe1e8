//! Encoders for interleaved pilots of the dense-partitioned layout.
//!
//! Pilots are linearized so that position `num_partitions * bucket +
//! partition` holds the pilot of `bucket` in `partition`: the values that
//! play the same structural role across partitions sit next to each other,
//! which is exactly the correlation the inner codes exploit.

use serde::{Deserialize, Serialize};

use crate::encoders::{CompactEncoder, DictionaryEncoder, Encoder, EliasFanoEncoder, RiceEncoder};

/// A random-access code over the interleaved pilot matrix.
pub trait DenseEncoder: Sized + Send + Sync {
    fn name() -> String;

    /// `interleaved` has length `num_partitions * buckets_per_partition`,
    /// laid out as described in the module docs.
    fn encode(interleaved: &[u64], num_partitions: u64, buckets_per_partition: u64) -> Self;

    fn access(&self, partition: u64, bucket: u64) -> u64;

    fn num_bits(&self) -> u64;
}

/// One encoder over the whole linearized sequence.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Mono<E> {
    num_partitions: u64,
    encoder: E,
}

impl<E: Encoder> DenseEncoder for Mono<E> {
    fn name() -> String {
        format!("inter-{}", E::name())
    }

    fn encode(interleaved: &[u64], num_partitions: u64, buckets_per_partition: u64) -> Self {
        debug_assert_eq!(
            interleaved.len() as u64,
            num_partitions * buckets_per_partition
        );
        Mono {
            num_partitions,
            encoder: E::encode(interleaved),
        }
    }

    #[inline]
    fn access(&self, partition: u64, bucket: u64) -> u64 {
        self.encoder.access(self.num_partitions * bucket + partition)
    }

    fn num_bits(&self) -> u64 {
        64 + self.encoder.num_bits()
    }
}

/// One independent encoder per bucket column of length `num_partitions`.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Multi<E> {
    encoders: Vec<E>,
}

impl<E: Encoder> DenseEncoder for Multi<E> {
    fn name() -> String {
        format!("multi-{}", E::name())
    }

    fn encode(interleaved: &[u64], num_partitions: u64, buckets_per_partition: u64) -> Self {
        let encoders = (0..buckets_per_partition)
            .map(|b| {
                let start = (b * num_partitions) as usize;
                E::encode(&interleaved[start..start + num_partitions as usize])
            })
            .collect();
        Multi { encoders }
    }

    #[inline]
    fn access(&self, partition: u64, bucket: u64) -> u64 {
        self.encoders[bucket as usize].access(partition)
    }

    fn num_bits(&self) -> u64 {
        self.encoders.iter().map(|e| e.num_bits()).sum()
    }
}

/// Splits the bucket columns between two encoders: the front third (the
/// large buckets, with small pilots) and the rest.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct DualDense<Front, Back> {
    front_buckets: u64,
    front: Front,
    back: Back,
}

impl<Front: DenseEncoder, Back: DenseEncoder> DenseEncoder for DualDense<Front, Back> {
    fn name() -> String {
        format!("{}-{}", Front::name(), Back::name())
    }

    fn encode(interleaved: &[u64], num_partitions: u64, buckets_per_partition: u64) -> Self {
        let front_buckets = buckets_per_partition / 3;
        let split = (front_buckets * num_partitions) as usize;
        DualDense {
            front_buckets,
            front: Front::encode(&interleaved[..split], num_partitions, front_buckets),
            back: Back::encode(
                &interleaved[split..],
                num_partitions,
                buckets_per_partition - front_buckets,
            ),
        }
    }

    #[inline]
    fn access(&self, partition: u64, bucket: u64) -> u64 {
        if bucket < self.front_buckets {
            self.front.access(partition, bucket)
        } else {
            self.back.access(partition, bucket - self.front_buckets)
        }
    }

    fn num_bits(&self) -> u64 {
        64 + self.front.num_bits() + self.back.num_bits()
    }
}

/// Stores a sequence as zig-zag deltas against the expected linear growth
/// `i * increment`; used for the dense partition offsets.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct DiffEncoder<E> {
    increment: u64,
    encoder: E,
}

impl<E: Encoder> DiffEncoder<E> {
    pub fn encode(values: &[u64], increment: u64) -> Self {
        let deltas: Vec<u64> = values
            .iter()
            .enumerate()
            .map(|(i, &v)| {
                let expected = (i as u64 * increment) as i64;
                let delta = v as i64 - expected;
                ((delta.unsigned_abs()) << 1) | (delta > 0) as u64
            })
            .collect();
        DiffEncoder {
            increment,
            encoder: E::encode(&deltas),
        }
    }

    #[inline]
    pub fn access(&self, i: u64) -> u64 {
        let value = self.encoder.access(i);
        let expected = i * self.increment;
        let delta = (((value & 1) as i64) * 2 - 1) * (value >> 1) as i64;
        (expected as i64 + delta) as u64
    }

    pub fn len(&self) -> u64 {
        self.encoder.len()
    }

    pub fn is_empty(&self) -> bool {
        self.encoder.is_empty()
    }

    pub fn num_bits(&self) -> u64 {
        64 + self.encoder.num_bits()
    }
}

pub type InterC = Mono<CompactEncoder>;
pub type InterD = Mono<DictionaryEncoder>;
pub type InterR = Mono<RiceEncoder>;
pub type InterEF = Mono<EliasFanoEncoder>;
pub type MultiC = Multi<CompactEncoder>;
pub type MultiD = Multi<DictionaryEncoder>;
pub type MultiR = Multi<RiceEncoder>;
pub type InterCInterR = DualDense<InterC, InterR>;
pub type MultiCMultiR = DualDense<MultiC, MultiR>;
pub type InterDInterR = DualDense<InterD, InterR>;

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;

    fn interleaved_fixture(num_partitions: u64, buckets: u64) -> Vec<u64> {
        // Columns of correlated values, like pilots of same-role buckets.
        let mut rng = rand::rng();
        let mut out = vec![0u64; (num_partitions * buckets) as usize];
        for b in 0..buckets {
            let base: u64 = rng.random_range(0..200);
            for p in 0..num_partitions {
                out[(b * num_partitions + p) as usize] = base + rng.random_range(0..16);
            }
        }
        out
    }

    fn round_trip<D: DenseEncoder>(num_partitions: u64, buckets: u64) {
        let interleaved = interleaved_fixture(num_partitions, buckets);
        let enc = D::encode(&interleaved, num_partitions, buckets);
        for b in 0..buckets {
            for p in 0..num_partitions {
                assert_eq!(
                    enc.access(p, b),
                    interleaved[(b * num_partitions + p) as usize],
                    "{} at ({p}, {b})",
                    D::name()
                );
            }
        }
    }

    #[test]
    fn dense_families_round_trip() {
        round_trip::<InterC>(16, 100);
        round_trip::<InterD>(16, 100);
        round_trip::<InterR>(16, 100);
        round_trip::<InterEF>(16, 100);
        round_trip::<MultiC>(16, 100);
        round_trip::<MultiR>(16, 100);
        round_trip::<InterCInterR>(16, 100);
        round_trip::<MultiCMultiR>(16, 100);
    }

    #[test]
    fn diff_encoder_handles_both_signs() {
        let increment = 100u64;
        let values: Vec<u64> = (0..1000u64)
            .map(|i| {
                let wobble = (i % 7) as i64 - 3;
                (i as i64 * increment as i64 + wobble) as u64
            })
            .collect();
        let enc = DiffEncoder::<CompactEncoder>::encode(&values, increment);
        for (i, &v) in values.iter().enumerate() {
            assert_eq!(enc.access(i as u64), v);
        }
    }

    #[test]
    fn names_compose() {
        assert_eq!(InterC::name(), "inter-C");
        assert_eq!(InterCInterR::name(), "inter-C-inter-R");
        assert_eq!(MultiR::name(), "multi-R");
    }
}

//! Internal utilities, plus key generation helpers exposed for tests and
//! benchmarks. Do not rely on these externally.

use std::time::Instant;

use colored::Colorize;
use log::{trace, warn};
use rand::Rng;
use rayon::prelude::*;
use rdst::RadixSort;

pub(crate) fn log_duration(name: &str, start: Instant) -> Instant {
    trace!(
        "{}",
        format!("{name:>12}: {:>10.2?}s", start.elapsed().as_secs_f32()).bold()
    );
    Instant::now()
}

/// Number of slots for `num_keys` at load factor `alpha`, nudged away from
/// powers of two so that the modular reduction sees all hash bits.
pub(crate) fn target_table_size(num_keys: u64, alpha: f64) -> u64 {
    let mut table_size = (num_keys as f64 / alpha).ceil() as u64;
    if table_size.is_power_of_two() {
        table_size += 1;
    }
    table_size
}

pub(crate) fn target_num_buckets(num_keys: u64, lambda: f64) -> u64 {
    (num_keys as f64 / lambda).ceil() as u64
}

/// Physical memory of the machine in bytes, with a conservative fallback when
/// it cannot be detected.
pub(crate) fn available_ram() -> u64 {
    const FALLBACK: u64 = 8 << 30;
    #[cfg(target_os = "linux")]
    {
        if let Ok(meminfo) = std::fs::read_to_string("/proc/meminfo") {
            for line in meminfo.lines() {
                if let Some(rest) = line.strip_prefix("MemTotal:") {
                    if let Some(kb) = rest
                        .split_whitespace()
                        .next()
                        .and_then(|t| t.parse::<u64>().ok())
                    {
                        return kb * 1024;
                    }
                }
            }
        }
    }
    FALLBACK
}

/// Generate `n` distinct random `u64` keys.
pub fn generate_keys(n: usize) -> Vec<u64> {
    let start = Instant::now();
    let keys = loop {
        let keys: Vec<u64> = (0..n)
            .into_par_iter()
            .map_init(rand::rng, |rng, _| rng.random())
            .collect();
        let mut sorted: Vec<u64> = keys.par_iter().copied().collect();
        sorted.radix_sort_unstable();
        if sorted.par_windows(2).all(|w| w[0] < w[1]) {
            break keys;
        }
        warn!("duplicate keys generated, retrying");
    };
    log_duration("gen keys", start);
    keys
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_size_avoids_powers_of_two() {
        assert_eq!(target_table_size(64, 1.0), 65);
        assert_eq!(target_table_size(100, 1.0), 100);
        assert_eq!(target_table_size(97, 0.97), 101);
    }

    #[test]
    fn generated_keys_are_distinct() {
        let keys = generate_keys(10_000);
        let mut sorted = keys.clone();
        sorted.sort_unstable();
        sorted.dedup();
        assert_eq!(sorted.len(), keys.len());
    }
}

//! Workload generation for the benchmark harness.
//!
//! Three families, matching what the throughput benchmarks drive: a
//! uniform random mix of add/remove/contains over a key range, a
//! Zipf-skewed mix for hot-key behavior, and sequential / shuffled key
//! streams for construction and teardown runs.

use rand::prelude::*;
use rand_distr::{Distribution, Zipf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum WorkloadError {
    #[error("percentages add up to more than 100: {add} + {remove}")]
    BadMix { add: u32, remove: u32 },
    #[error("invalid zipf parameters: range {range}, exponent {exponent}")]
    BadZipf { range: u64, exponent: f64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpKind {
    Add,
    Remove,
    Contains,
}

/// Operation percentages; whatever is left after adds and removes is
/// membership queries.
#[derive(Debug, Clone, Copy)]
pub struct OperationMix {
    add_pct: u32,
    remove_pct: u32,
}

impl OperationMix {
    pub fn new(add_pct: u32, remove_pct: u32) -> Result<Self, WorkloadError> {
        if add_pct + remove_pct > 100 {
            return Err(WorkloadError::BadMix {
                add: add_pct,
                remove: remove_pct,
            });
        }
        Ok(Self {
            add_pct,
            remove_pct,
        })
    }

    pub fn pick<R: Rng>(&self, rng: &mut R) -> OpKind {
        let op = rng.gen_range(0..100);
        if op < self.add_pct {
            OpKind::Add
        } else if op < self.add_pct + self.remove_pct {
            OpKind::Remove
        } else {
            OpKind::Contains
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct UniformWorkload {
    range: i32,
    mix: OperationMix,
}

impl UniformWorkload {
    pub fn new(range: i32, mix: OperationMix) -> Self {
        Self { range, mix }
    }

    pub fn next<R: Rng>(&self, rng: &mut R) -> (OpKind, i32) {
        (self.mix.pick(rng), rng.gen_range(0..=self.range))
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SkewedWorkload {
    zipf: Zipf<f64>,
    mix: OperationMix,
}

impl SkewedWorkload {
    pub fn new(range: u64, exponent: f64, mix: OperationMix) -> Result<Self, WorkloadError> {
        let zipf =
            Zipf::new(range, exponent).map_err(|_| WorkloadError::BadZipf { range, exponent })?;
        Ok(Self { zipf, mix })
    }

    pub fn next<R: Rng>(&self, rng: &mut R) -> (OpKind, i32) {
        let value = self.zipf.sample(rng) as i32 - 1;
        (self.mix.pick(rng), value)
    }
}

#[derive(Debug, Clone, Copy)]
pub enum Workload {
    Uniform(UniformWorkload),
    Skewed(SkewedWorkload),
}

impl Workload {
    pub fn next<R: Rng>(&self, rng: &mut R) -> (OpKind, i32) {
        match self {
            Workload::Uniform(w) => w.next(rng),
            Workload::Skewed(w) => w.next(rng),
        }
    }
}

/// A deterministic per-worker generator: same base seed, different
/// streams per thread id.
pub fn worker_rng(seed: u64, tid: usize) -> StdRng {
    StdRng::seed_from_u64(seed ^ (tid as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15))
}

pub fn sequential_keys(count: usize) -> Vec<i32> {
    (0..count as i32).collect()
}

pub fn shuffled_keys(count: usize, rng: &mut StdRng) -> Vec<i32> {
    let mut keys = sequential_keys(count);
    keys.shuffle(rng);
    keys
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    #[test]
    fn mix_respects_percentages() {
        let mix = OperationMix::new(30, 20).unwrap();
        let mut rng = worker_rng(7, 0);
        let mut counts = [0u32; 3];
        for _ in 0..100_000 {
            match mix.pick(&mut rng) {
                OpKind::Add => counts[0] += 1,
                OpKind::Remove => counts[1] += 1,
                OpKind::Contains => counts[2] += 1,
            }
        }
        assert!((28_000..32_000).contains(&counts[0]));
        assert!((18_000..22_000).contains(&counts[1]));
        assert!((48_000..52_000).contains(&counts[2]));
    }

    #[test]
    fn mix_rejects_overfull_percentages() {
        assert!(OperationMix::new(70, 40).is_err());
    }

    #[test]
    fn skewed_workload_prefers_small_keys() {
        let mix = OperationMix::new(0, 0).unwrap();
        let workload = SkewedWorkload::new(10_000, 1.2, mix).unwrap();
        let mut rng = worker_rng(13, 1);

        let mut small = 0;
        for _ in 0..10_000 {
            let (_, value) = workload.next(&mut rng);
            assert!((0..10_000).contains(&value));
            if value < 100 {
                small += 1;
            }
        }
        assert!(small > 5_000, "zipf(1.2) gave only {small} keys below 100");
    }

    #[test]
    fn shuffled_keys_is_a_permutation() {
        let mut rng = worker_rng(42, 0);
        let mut keys = shuffled_keys(1000, &mut rng);
        keys.sort_unstable();
        assert_eq!(keys, sequential_keys(1000));
    }
}

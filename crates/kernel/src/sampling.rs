//! Weighted, order-preserving sampling of particle positions.
//!
//! The samples feed the global rebalancer: each process contributes a number
//! of positions proportional to its weight, and the drawn positions estimate
//! the local particle density.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::particle::Particle;
use crate::store::ParticleStore;

/// Default average number of samples each process contributes.
pub const DEFAULT_SAMPLES_PER_PROCESS: usize = 30;

/// Default slack `ε` of the lower bound `n_loc * T / (n_glb * (1 + ε))`.
pub const DEFAULT_SAMPLE_FLOOR_RATIO: f64 = 0.2;

/// Inputs of the per-process sample count.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SampleBudget {
    /// This process's weight.
    pub weight: f64,
    /// Sum of the weights of every process.
    pub total_weight: f64,
    /// Global sample target `T`.
    pub target_total: usize,
    /// Particles owned by this process.
    pub local_count: usize,
    /// Particles owned by all processes.
    pub global_count: u64,
    /// Lower-bound slack `ε`.
    pub floor_ratio: f64,
}

impl SampleBudget {
    /// Number of samples this process draws.
    ///
    /// `round(w / W * T)`, raised to `round(n_loc * T / (n_glb * (1 + ε)))`
    /// so small partitions are not starved, then capped at `n_loc`. Both
    /// terms use the same rounding (half away from zero).
    pub fn sample_count(&self) -> usize {
        let target = self.target_total as f64;
        let proportional = if self.total_weight > 0.0 {
            (self.weight / self.total_weight * target).round()
        } else {
            0.0
        };
        let floor = if self.global_count > 0 {
            (self.local_count as f64 * target
                / (self.global_count as f64 * (1.0 + self.floor_ratio)))
                .round()
        } else {
            0.0
        };
        let k = proportional.max(floor);
        if k.is_nan() || k <= 0.0 {
            return 0;
        }
        (k as usize).min(self.local_count)
    }
}

/// Mix the run seed with the rank so ranks draw independent streams.
fn rank_seed(seed: u64, rank: usize) -> u64 {
    seed ^ (rank as u64).wrapping_add(1).wrapping_mul(0x9E37_79B9_7F4A_7C15)
}

/// Draws samples from a [`ParticleStore`] without disturbing its order.
#[derive(Debug, Clone)]
pub struct SampleSelector {
    rng: StdRng,
}

impl SampleSelector {
    /// Selector seeded deterministically from the run seed and rank.
    pub fn new(seed: u64, rank: usize) -> Self {
        Self {
            rng: StdRng::seed_from_u64(rank_seed(seed, rank)),
        }
    }

    /// Uniform integer in `[low, high]`.
    fn uniform_between(&mut self, low: usize, high: usize) -> usize {
        self.rng.random_range(low..=high)
    }

    /// Draw `k` distinct particle positions (capped at the local count).
    ///
    /// Partial Fisher-Yates: `k` swaps bring the chosen particles to the
    /// front, their positions are copied out, and the swaps are undone in
    /// reverse so the store ends in exactly its original order.
    pub fn draw<P: Particle<D>, const D: usize>(
        &mut self,
        store: &mut ParticleStore<P, D>,
        k: usize,
    ) -> Vec<[f64; D]> {
        let n = store.len();
        let k = k.min(n);
        let mut record = Vec::with_capacity(k);
        let mut samples = Vec::with_capacity(k);

        let particles = store.as_mut_slice();
        for i in 0..k {
            let j = self.uniform_between(i, n - 1);
            particles.swap(i, j);
            record.push(j);
            samples.push(particles[i].position());
        }
        for i in (0..k).rev() {
            particles.swap(i, record[i]);
        }

        tracing::trace!("drew {} of {} local particles as samples", k, n);
        samples
    }
}

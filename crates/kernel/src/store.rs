//! Growable, index-addressable particle storage.
//!
//! The store over-reserves when its local count is set so that the
//! particles received in the following exchange fit without a reallocation
//! while transfers are outstanding.

use std::marker::PhantomData;
use std::ops::{Index, IndexMut};

use bytemuck::Zeroable;

use crate::error::{KernelError, Result};
use crate::particle::{HasMass, Particle};

/// Extra slots reserved on top of `3n` by [`ParticleStore::set_local_count`].
pub const RESERVE_SLACK: usize = 1000;

/// Multiplier applied to the local count by [`ParticleStore::set_local_count`].
pub const RESERVE_FACTOR: usize = 3;

/// Slots reserved for an expected local count of `n`: `3n + 1000`.
pub fn reserve_policy(n: usize) -> usize {
    n.saturating_mul(RESERVE_FACTOR).saturating_add(RESERVE_SLACK)
}

/// Ordered particle sequence owned by one process.
#[derive(Debug, Clone)]
pub struct ParticleStore<P, const D: usize> {
    particles: Vec<P>,
    _dim: PhantomData<[f64; D]>,
}

impl<P: Particle<D>, const D: usize> ParticleStore<P, D> {
    /// Empty store with no reserved capacity.
    pub fn new() -> Self {
        Self {
            particles: Vec::new(),
            _dim: PhantomData,
        }
    }

    /// Empty store with at least `capacity_hint` slots reserved.
    pub fn create(capacity_hint: usize) -> Self {
        Self {
            particles: Vec::with_capacity(capacity_hint),
            _dim: PhantomData,
        }
    }

    /// Drop every particle and make sure at least `capacity_hint` slots are reserved.
    pub fn reset(&mut self, capacity_hint: usize) {
        self.particles.clear();
        self.reserve_total(capacity_hint);
    }

    /// Grow capacity to at least `total` slots. Never shrinks.
    pub fn reserve_total(&mut self, total: usize) {
        if total > self.particles.capacity() {
            self.particles.reserve_exact(total - self.particles.len());
        }
    }

    /// Reserve [`reserve_policy`] slots for an expected local count of `n`.
    pub fn reserve_for_count(&mut self, n: usize) {
        self.reserve_total(reserve_policy(n));
    }

    /// Reserve `3n + 1000` slots, then resize to exactly `n` particles.
    ///
    /// Slots beyond the previous count are zero-initialized.
    pub fn set_local_count(&mut self, n: usize) {
        self.reserve_for_count(n);
        self.particles.resize(n, P::zeroed());
    }

    /// Number of particles currently owned.
    pub fn len(&self) -> usize {
        self.particles.len()
    }

    /// Return `true` if no particles are owned.
    pub fn is_empty(&self) -> bool {
        self.particles.is_empty()
    }

    /// Reserved slots.
    pub fn capacity(&self) -> usize {
        self.particles.capacity()
    }

    /// Bytes held by the reserved slots.
    pub fn memory_size(&self) -> usize {
        self.particles.capacity() * std::mem::size_of::<P>()
    }

    /// Checked access.
    pub fn get(&self, index: usize) -> Result<&P> {
        let len = self.particles.len();
        self.particles
            .get(index)
            .ok_or(KernelError::Index { index, len })
    }

    /// Checked mutable access.
    pub fn get_mut(&mut self, index: usize) -> Result<&mut P> {
        let len = self.particles.len();
        self.particles
            .get_mut(index)
            .ok_or(KernelError::Index { index, len })
    }

    /// Append one particle.
    pub fn push(&mut self, particle: P) {
        self.particles.push(particle);
    }

    /// Keep the first `len` particles.
    pub fn truncate(&mut self, len: usize) {
        self.particles.truncate(len);
    }

    /// Swap two particles.
    pub fn swap(&mut self, a: usize, b: usize) {
        self.particles.swap(a, b);
    }

    /// All particles, in local order.
    pub fn as_slice(&self) -> &[P] {
        &self.particles
    }

    /// All particles, mutable.
    pub fn as_mut_slice(&mut self) -> &mut [P] {
        &mut self.particles
    }

    /// Iterate in local order.
    pub fn iter(&self) -> std::slice::Iter<'_, P> {
        self.particles.iter()
    }

    /// Iterate mutably in local order.
    pub fn iter_mut(&mut self) -> std::slice::IterMut<'_, P> {
        self.particles.iter_mut()
    }

    /// Append `incoming` after the current particles.
    ///
    /// When the reserved capacity is too small a fresh allocation is made and
    /// the current particles are copied over before appending; the existing
    /// buffer is never grown in place. Returns `true` if that happened.
    pub fn append(&mut self, incoming: &[P]) -> bool {
        let needed = self.particles.len() + incoming.len();
        let grew = needed > self.particles.capacity();
        if grew {
            let mut grown = Vec::with_capacity(needed.max(2 * self.particles.capacity()));
            grown.extend_from_slice(&self.particles);
            self.particles = grown;
        }
        self.particles.extend_from_slice(incoming);
        grew
    }

    /// Fill the first `len` slots from raw bytes, replacing the contents.
    ///
    /// `bytes` must hold exactly `len` records.
    pub fn load_bytes(&mut self, len: usize, bytes: &[u8]) -> Result<()> {
        let expected = len
            .checked_mul(std::mem::size_of::<P>())
            .ok_or(KernelError::ByteLength {
                len,
                expected: None,
                actual: bytes.len(),
            })?;
        if bytes.len() != expected {
            return Err(KernelError::ByteLength {
                len,
                expected: Some(expected),
                actual: bytes.len(),
            });
        }
        self.particles.clear();
        self.particles.resize(len, P::zeroed());
        bytemuck::cast_slice_mut::<P, u8>(&mut self.particles).copy_from_slice(bytes);
        Ok(())
    }

    /// Largest per-axis distance of any particle from `center`.
    ///
    /// Returns 0 for an empty store.
    pub fn local_half_length(&self, center: [f64; D]) -> f64 {
        self.particles
            .iter()
            .map(|p| {
                let pos = p.position();
                (0..D)
                    .map(|k| (pos[k] - center[k]).abs())
                    .fold(0.0_f64, f64::max)
            })
            .fold(0.0_f64, f64::max)
    }

    /// Order-sensitive digest of all positions.
    ///
    /// Two stores have equal checksums (up to rounding) only if they hold the
    /// same positions in the same order.
    pub fn position_checksum(&self) -> f64 {
        self.particles
            .iter()
            .enumerate()
            .map(|(i, p)| {
                let pos = p.position();
                let weight = (i + 1) as f64;
                (0..D)
                    .map(|k| pos[k] * weight * (k as f64 + 1.0).sqrt())
                    .sum::<f64>()
            })
            .sum()
    }
}

impl<P: Particle<D> + HasMass, const D: usize> ParticleStore<P, D> {
    /// Total mass and mass-weighted mean position of the local particles.
    ///
    /// `None` when the store is empty or the total mass is zero.
    pub fn center_of_mass(&self) -> Option<(f64, [f64; D])> {
        let mut total = 0.0;
        let mut weighted = [0.0; D];
        for p in &self.particles {
            let m = p.mass();
            let pos = p.position();
            total += m;
            for k in 0..D {
                weighted[k] += m * pos[k];
            }
        }
        if total == 0.0 {
            return None;
        }
        Some((total, std::array::from_fn(|k| weighted[k] / total)))
    }
}

impl<P: Particle<D>, const D: usize> Default for ParticleStore<P, D> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P: Particle<D>, const D: usize> Index<usize> for ParticleStore<P, D> {
    type Output = P;

    fn index(&self, index: usize) -> &P {
        match self.get(index) {
            Ok(p) => p,
            Err(e) => panic!("{e}"),
        }
    }
}

impl<P: Particle<D>, const D: usize> IndexMut<usize> for ParticleStore<P, D> {
    fn index_mut(&mut self, index: usize) -> &mut P {
        let len = self.particles.len();
        match self.particles.get_mut(index) {
            Some(p) => p,
            None => panic!("{}", KernelError::Index { index, len }),
        }
    }
}

//! Particle capability contract and the stock SPH particle record.

use bytemuck::{Pod, Zeroable};

/// Capability every redistributable particle must provide.
///
/// `Pod` gives a fixed-size representation that can be moved between
/// processes as raw bytes; the position accessors are all the redistribution
/// layer ever looks at.
pub trait Particle<const D: usize>: Pod + Send + Sync {
    /// Current position.
    fn position(&self) -> [f64; D];

    /// Overwrite the position (used by periodic wrapping).
    fn set_position(&mut self, position: [f64; D]);
}

/// Particles carrying a mass, for center-of-mass diagnostics.
pub trait HasMass {
    /// Particle mass.
    fn mass(&self) -> f64;
}

/// Plain SPH particle record: position, velocity, mass and a global id.
///
/// `#[repr(C)]` with only 8-byte fields, so there is no padding and the
/// record is `Pod`.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Default, Pod, Zeroable, serde::Serialize, serde::Deserialize)]
pub struct SphParticle {
    /// Position (meters)
    pub pos: [f64; 3],
    /// Velocity (m/s)
    pub vel: [f64; 3],
    /// Mass (kg)
    pub mass: f64,
    /// Globally unique id, stable across exchanges
    pub id: u64,
}

impl SphParticle {
    /// Create a particle at rest.
    pub fn new(id: u64, pos: [f64; 3], mass: f64) -> Self {
        Self {
            pos,
            vel: [0.0; 3],
            mass,
            id,
        }
    }

    /// Builder-style velocity setter.
    pub fn with_velocity(mut self, vel: [f64; 3]) -> Self {
        self.vel = vel;
        self
    }

    /// Explicit Euler drift by `dt`. Positions may leave the root domain;
    /// wrapping happens separately.
    pub fn drift(&mut self, dt: f64) {
        for k in 0..3 {
            self.pos[k] += self.vel[k] * dt;
        }
    }
}

impl Particle<3> for SphParticle {
    #[inline]
    fn position(&self) -> [f64; 3] {
        self.pos
    }

    #[inline]
    fn set_position(&mut self, position: [f64; 3]) {
        self.pos = position;
    }
}

impl HasMass for SphParticle {
    fn mass(&self) -> f64 {
        self.mass
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_has_no_padding() {
        assert_eq!(std::mem::size_of::<SphParticle>(), 8 * 8);
    }

    #[test]
    fn bytes_round_trip_preserves_fields() {
        let p = SphParticle::new(42, [0.1, 0.2, 0.3], 2.5).with_velocity([1.0, -1.0, 0.0]);
        let bytes = bytemuck::bytes_of(&p).to_vec();
        let back: SphParticle = bytemuck::pod_read_unaligned(&bytes);
        assert_eq!(back, p);
    }

    #[test]
    fn drift_moves_along_velocity() {
        let mut p = SphParticle::new(0, [0.0; 3], 1.0).with_velocity([1.0, 2.0, 0.0]);
        p.drift(0.5);
        assert_eq!(p.position(), [0.5, 1.0, 0.0]);
    }
}

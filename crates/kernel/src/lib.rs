//! Process-local particle layer
//!
//! Everything one process does to its own particles without talking to any
//! other process:
//! - [`particle`] -- the `Particle` capability trait and the stock `SphParticle` record.
//! - [`bounds`] -- half-open axis-aligned boxes and per-axis boundary kinds.
//! - [`store`] -- `ParticleStore`, growable storage with an exchange-safe reserve policy.
//! - [`sampling`] -- order-preserving weighted sampling for load balancing.
//! - [`wrap`] -- periodic folding of positions into the root domain.
//! - [`router`] -- position to owning-rank lookup over a sorted sub-domain grid.

#![warn(missing_docs)]

pub mod bounds;
pub mod error;
pub mod particle;
pub mod router;
pub mod sampling;
pub mod store;
pub mod wrap;

pub use bounds::{Aabb, BoundaryKind};
pub use error::{KernelError, Result};
pub use particle::{HasMass, Particle, SphParticle};
pub use router::{grid_strides, route, DomainRouter};
pub use sampling::{SampleBudget, SampleSelector};
pub use store::ParticleStore;
pub use wrap::{wrap_coordinate, wrap_particles, wrap_position};

/// Return the first particle lying outside `root`, as a ready-made error.
///
/// Runs in parallel; the reported index is the lowest offending one.
pub fn find_outside_root<P: Particle<D>, const D: usize>(
    particles: &[P],
    root: &Aabb<D>,
) -> Option<KernelError> {
    use rayon::prelude::*;

    let index = particles
        .par_iter()
        .position_first(|p| !root.contains(&p.position()))?;
    let position = particles[index].position();
    Some(KernelError::OutsideRootDomain {
        index,
        position: position.to_vec(),
        low: root.low.to_vec(),
        high: root.high.to_vec(),
    })
}

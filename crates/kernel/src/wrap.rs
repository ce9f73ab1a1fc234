//! Periodic-image folding of positions into the root domain.

use rayon::prelude::*;

use crate::bounds::{Aabb, BoundaryKind};
use crate::particle::Particle;

/// Fold `x` into `[low, high)` by whole multiples of `high - low`.
///
/// Coordinates already inside are returned bit-for-bit unchanged, which
/// makes the fold idempotent. A coordinate exactly equal to `high` folds to
/// `low`. Non-finite input stays non-finite so the root-domain check rejects it.
#[inline]
pub fn wrap_coordinate(x: f64, low: f64, high: f64) -> f64 {
    if low <= x && x < high {
        return x;
    }
    if x == high {
        return low;
    }
    let len = high - low;
    let folded = low + (x - low).rem_euclid(len);
    if folded >= high {
        low
    } else {
        folded
    }
}

/// Fold every periodic axis of `pos` into `root`; open axes are left as is.
#[inline]
pub fn wrap_position<const D: usize>(
    pos: &[f64; D],
    root: &Aabb<D>,
    boundary: &[BoundaryKind; D],
) -> [f64; D] {
    std::array::from_fn(|k| {
        if boundary[k].is_periodic() {
            wrap_coordinate(pos[k], root.low[k], root.high[k])
        } else {
            pos[k]
        }
    })
}

/// Wrap all particles in parallel. Returns how many positions changed.
pub fn wrap_particles<P: Particle<D>, const D: usize>(
    particles: &mut [P],
    root: &Aabb<D>,
    boundary: &[BoundaryKind; D],
) -> usize {
    if !boundary.iter().any(|b| b.is_periodic()) {
        return 0;
    }
    particles
        .par_iter_mut()
        .map(|p| {
            let pos = p.position();
            let wrapped = wrap_position(&pos, root, boundary);
            if wrapped != pos {
                p.set_position(wrapped);
                1
            } else {
                0
            }
        })
        .sum()
}

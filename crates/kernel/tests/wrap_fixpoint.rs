//! Periodic wrapping is a fixpoint: wrapping twice equals wrapping once,
//! even for positions many domain lengths outside the root.

use particle_kernel::{wrap_particles, wrap_position, Aabb, BoundaryKind, Particle, SphParticle};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

#[test]
fn wrap_twice_equals_wrap_once() {
    let mut rng = StdRng::seed_from_u64(11);
    let root = Aabb::new([-0.3, 0.1, 2.0], [0.7, 0.35, 5.0]);
    let boundary = [BoundaryKind::Periodic; 3];

    for _ in 0..10_000 {
        let lengths = root.full_length();
        let pos: [f64; 3] = std::array::from_fn(|k| {
            let span = rng.random_range(-50.0..50.0);
            root.low[k] + span * lengths[k]
        });
        let once = wrap_position(&pos, &root, &boundary);
        let twice = wrap_position(&once, &root, &boundary);
        assert_eq!(once, twice, "input {pos:?}");
        assert!(root.contains(&once), "{pos:?} folded to {once:?}");
    }
}

#[test]
fn exact_multiples_fold_onto_lower_bound() {
    let root = Aabb::new([0.0; 3], [1.0; 3]);
    let boundary = [BoundaryKind::Periodic; 3];
    let folded = wrap_position(&[1.0, 3.0, -2.0], &root, &boundary);
    assert_eq!(folded, [0.0, 0.0, 0.0]);
}

#[test]
fn mixed_boundaries_leave_open_axes_alone() {
    let root = Aabb::new([0.0; 3], [1.0; 3]);
    let boundary = [BoundaryKind::Open, BoundaryKind::Periodic, BoundaryKind::Open];
    let mut particles = vec![SphParticle::new(0, [0.5, 7.25, 0.5], 1.0)];
    wrap_particles(&mut particles, &root, &boundary);
    let pos = particles[0].position();
    assert_eq!(pos[0], 0.5);
    assert!((pos[1] - 0.25).abs() < 1e-12);
    assert_eq!(pos[2], 0.5);
}

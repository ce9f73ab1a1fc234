//! Multi-rank exchange scenarios over an in-process group.

use particle_kernel::{Aabb, BoundaryKind, Particle, SphParticle};
use particle_orchestrator::{
    run_group, DomainPartition, Error, LocalTransport, ParticleSystem, SystemSettings,
    TransportError,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

type System = ParticleSystem<SphParticle, LocalTransport, 3>;

fn configured(transport: LocalTransport) -> System {
    let mut system = ParticleSystem::new(transport);
    system.configure(SystemSettings::default()).unwrap();
    system
}

fn unit_root() -> Aabb<3> {
    Aabb::new([0.0; 3], [1.0; 3])
}

fn random_particles(seed: u64, first_id: u64, n: usize) -> Vec<SphParticle> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..n)
        .map(|i| {
            let pos = [rng.random(), rng.random(), rng.random()];
            SphParticle::new(first_id + i as u64, pos, 1.0)
        })
        .collect()
}

#[test]
fn quadrant_scenario() {
    let particles = random_particles(42, 0, 100);
    let partition =
        DomainPartition::uniform(unit_root(), [2, 2, 1], [BoundaryKind::Periodic; 3]).unwrap();

    let results = run_group(4, |transport| {
        let mut system = configured(transport);
        if system.rank() == 0 {
            for p in &particles {
                system.push(*p).unwrap();
            }
        }
        let report = system.exchange_particles(&partition).unwrap();
        assert!(system.check_all_inside(&partition).unwrap());
        assert_eq!(system.global_count().unwrap(), 100);
        (report, system.particles().to_vec())
    })
    .unwrap();

    for (rank, (report, local)) in results.iter().enumerate() {
        let own = partition.box_of(rank).unwrap();
        let expected: Vec<u64> = particles
            .iter()
            .filter(|p| own.contains(&p.position()))
            .map(|p| p.id)
            .collect();
        let got: Vec<u64> = local.iter().map(|p| p.id).collect();
        // Rank 0 keeps its own in order; others receive them in rank-0 order.
        assert_eq!(got, expected, "rank {}", rank);
        if rank != 0 {
            assert_eq!(report.recv_counts[0] as usize, expected.len());
            assert_eq!(report.sent, 0);
        }
    }
    assert_eq!(results[0].0.sent + results[0].0.kept, 100);
}

#[test]
fn conservation_across_repeated_random_partitions() {
    let mut rng = StdRng::seed_from_u64(9);
    // Three rounds of jittered uniform-ish partitions of a 2x2x2 grid.
    let partitions: Vec<DomainPartition<3>> = (0..3)
        .map(|_| {
            let cut: [f64; 3] = std::array::from_fn(|_| rng.random_range(0.2..0.8));
            let mut boxes = Vec::new();
            for ix in 0..2 {
                for iy in 0..2 {
                    for iz in 0..2 {
                        let span = |i: usize, c: f64| if i == 0 { (0.0, c) } else { (c, 1.0) };
                        let (x0, x1) = span(ix, cut[0]);
                        let (y0, y1) = span(iy, cut[1]);
                        let (z0, z1) = span(iz, cut[2]);
                        boxes.push(Aabb::new([x0, y0, z0], [x1, y1, z1]));
                    }
                }
            }
            DomainPartition::new([2, 2, 2], boxes, unit_root(), [BoundaryKind::Periodic; 3])
                .unwrap()
        })
        .collect();

    let results = run_group(8, |transport| {
        let mut system = configured(transport);
        let rank = system.rank() as u64;
        for p in random_particles(100 + rank, rank * 1000, 50 + 10 * rank as usize) {
            system.push(p).unwrap();
        }
        let before = system.global_count().unwrap();
        for partition in &partitions {
            system.exchange_particles(partition).unwrap();
            assert!(system.check_global_count(before).unwrap());
            assert!(system.check_all_inside(partition).unwrap());
        }
        system.particles().iter().map(|p| p.id).collect::<Vec<u64>>()
    })
    .unwrap();

    let mut ids: Vec<u64> = results.into_iter().flatten().collect();
    let total = ids.len();
    ids.sort_unstable();
    ids.dedup();
    assert_eq!(ids.len(), total, "a particle was duplicated");
    assert_eq!(total, (0..8).map(|r| 50 + 10 * r).sum::<usize>());
}

#[test]
fn second_exchange_is_a_no_op() {
    let partition =
        DomainPartition::uniform(unit_root(), [3, 1, 1], [BoundaryKind::Periodic; 3]).unwrap();

    run_group(3, |transport| {
        let mut system = configured(transport);
        let rank = system.rank() as u64;
        for p in random_particles(rank, rank * 100, 40) {
            system.push(p).unwrap();
        }
        system.exchange_particles(&partition).unwrap();
        let settled: Vec<SphParticle> = system.particles().to_vec();

        let report = system.exchange_particles(&partition).unwrap();
        assert_eq!(report.sent, 0);
        assert_eq!(report.received, 0);
        assert_eq!(system.particles(), &settled[..]);
    })
    .unwrap();
}

/// Rank 0 holds ten particles that all belong to rank 1 of a `[2, 1, 1]` split.
fn right_half_particles() -> Vec<SphParticle> {
    (0..10)
        .map(|i| SphParticle::new(i, [0.75, 0.1 * i as f64, 0.5], 1.0))
        .collect()
}

#[test]
fn reserved_headroom_keeps_first_exchange_in_place() {
    let particles = random_particles(5, 0, 400);
    let partition =
        DomainPartition::uniform(unit_root(), [2, 2, 1], [BoundaryKind::Periodic; 3]).unwrap();

    let grew = run_group(4, |transport| {
        let mut system = configured(transport);
        if system.rank() == 0 {
            system.set_local_count(particles.len()).unwrap();
            system.particles_mut().copy_from_slice(&particles);
        }
        let share = (system.global_count().unwrap() as usize).div_ceil(system.size());
        system.reserve_headroom(share).unwrap();

        let report = system.exchange_particles(&partition).unwrap();
        assert!(system.check_all_inside(&partition).unwrap());
        report.grew_capacity
    })
    .unwrap();

    assert_eq!(grew, vec![false; 4]);
}

#[test]
fn receiver_without_headroom_reallocates() {
    let particles = right_half_particles();
    let partition =
        DomainPartition::uniform(unit_root(), [2, 1, 1], [BoundaryKind::Periodic; 3]).unwrap();

    let results = run_group(2, |transport| {
        let mut system = configured(transport);
        if system.rank() == 0 {
            for p in &particles {
                system.push(*p).unwrap();
            }
        }
        let report = system.exchange_particles(&partition).unwrap();
        (report.grew_capacity, system.local_count())
    })
    .unwrap();

    assert_eq!(results, vec![(false, 0), (true, 10)]);
}

#[test]
fn receiver_with_headroom_keeps_its_store() {
    let particles = right_half_particles();
    let partition =
        DomainPartition::uniform(unit_root(), [2, 1, 1], [BoundaryKind::Periodic; 3]).unwrap();

    let grew = run_group(2, |transport| {
        let mut system = configured(transport);
        if system.rank() == 0 {
            system.reserve_headroom(particles.len()).unwrap();
            for p in &particles {
                system.push(*p).unwrap();
            }
        }
        let share = (system.global_count().unwrap() as usize).div_ceil(system.size());
        system.reserve_headroom(share).unwrap();
        system.exchange_particles(&partition).unwrap().grew_capacity
    })
    .unwrap();

    assert_eq!(grew, vec![false, false]);
}

#[test]
fn periodic_wrap_then_exchange() {
    let partition =
        DomainPartition::uniform(unit_root(), [2, 1, 1], [BoundaryKind::Periodic; 3]).unwrap();

    let counts = run_group(2, |transport| {
        let mut system = configured(transport);
        if system.rank() == 1 {
            // Just past the upper x face: folds to x = 0.05 and belongs to rank 0.
            system.push(SphParticle::new(1, [1.05, 0.5, 0.5], 1.0)).unwrap();
            // Exactly on the upper face: folds to x = 0.
            system.push(SphParticle::new(2, [1.0, 0.5, 0.5], 1.0)).unwrap();
        }
        system.wrap_periodic(&partition).unwrap();
        system.exchange_particles(&partition).unwrap();
        system.local_count()
    })
    .unwrap();
    assert_eq!(counts, vec![2, 0]);
}

#[test]
fn particle_outside_open_root_aborts_the_group() {
    let partition =
        DomainPartition::uniform(unit_root(), [2, 2, 1], [BoundaryKind::Open; 3]).unwrap();

    let errors = run_group(4, |transport| {
        let mut system = configured(transport);
        let rank = system.rank() as u64;
        for p in random_particles(rank, rank * 10, 10) {
            system.push(p).unwrap();
        }
        if rank == 2 {
            system.push(SphParticle::new(999, [0.5, 1.5, 0.5], 1.0)).unwrap();
        }
        system.wrap_periodic(&partition).unwrap();
        let err = system.exchange_particles(&partition).unwrap_err();
        assert!(matches!(system.global_count(), Err(Error::Poisoned)));
        err
    })
    .unwrap();

    for (rank, err) in errors.iter().enumerate() {
        if rank == 2 {
            assert!(matches!(err, Error::FatalConfiguration(_)), "{err}");
        } else {
            assert!(
                matches!(err, Error::Transport(TransportError::Aborted { rank: 2, .. })),
                "rank {rank}: {err}"
            );
        }
    }
}

#[test]
fn sampling_is_weighted_and_order_preserving() {
    let samples = run_group(4, |transport| {
        let mut system = configured(transport);
        let rank = system.rank() as u64;
        for p in random_particles(rank, rank * 1000, 200) {
            system.push(p).unwrap();
        }
        let before: Vec<SphParticle> = system.particles().to_vec();
        // Rank 3 carries half the weight.
        let weight = if rank == 3 { 3.0 } else { 1.0 };
        let drawn = system.sample_particles(weight).unwrap();
        assert_eq!(system.particles(), &before[..]);
        drawn.len()
    })
    .unwrap();

    // T = 120; floor = round(200 * 120 / (800 * 1.2)) = 25.
    assert_eq!(samples, vec![25, 25, 25, 60]);
}

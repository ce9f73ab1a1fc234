//! Exchange and checkpoint throughput benchmarks.
//!
//! These are long-running tests that push millions of particles through the
//! in-process transport. They are marked with `#[ignore]` so they only run
//! when explicitly requested via:
//!
//! ```sh
//! cargo test --release -p reference-tests -- --ignored
//! ```

use std::time::Instant;

use particle_kernel::{Aabb, SphParticle};
use particle_orchestrator::{
    load_imbalance, run_distributed, run_group, CountedHeader, FileLayout, LocalTransport,
    ParticleSystem, QuantileRebalancer, SystemConfig,
};

use crate::{seed_particles, InitialState, Motion};

fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .with_target(false)
        .try_init();
}

/// One million drifting particles over a 4x4x2 periodic grid.
///
/// Reports particles migrated per second of wall time and checks the run
/// stays conservative and balanced.
#[test]
#[ignore]
fn benchmark_exchange_throughput() {
    init_logging();

    let mut config = SystemConfig::new(
        "throughput",
        vec![0.0, 0.0, 0.0],
        vec![1.0, 1.0, 1.0],
        vec![4, 4, 2],
    );
    config.samples_per_process = 200;
    config.capacity_hint = 1 << 16;

    let root: Aabb<3> = config.root_box().expect("Invalid root domain");
    let initial = seed_particles(
        &InitialState::Uniform {
            count: 1_000_000,
            speed: 0.05,
        },
        &root,
        config.seed,
    );
    let motion = Motion::Drift { dt: 1.0 };

    let start = Instant::now();
    let result = run_distributed::<_, _, _, 3>(
        &config,
        &initial,
        &QuantileRebalancer,
        10,
        |_, particles| motion.apply(particles),
    )
    .expect("Distributed run failed");
    let elapsed = start.elapsed().as_secs_f64();

    let imbalance = load_imbalance(&result.local_counts);
    tracing::info!(
        "{} cycles, {} migrations in {:.2}s ({:.0} particles/s), imbalance {:.3}",
        result.cycles,
        result.migrated,
        elapsed,
        result.migrated as f64 / elapsed,
        imbalance
    );

    assert_eq!(result.particles.len(), initial.len());
    assert!(imbalance < 1.2, "imbalance {} too high", imbalance);
}

/// Single-file checkpoint of 500k particles written by 8 ranks and read
/// back by 5.
#[test]
#[ignore]
fn benchmark_single_file_checkpoint() {
    init_logging();

    let dir = std::env::temp_dir().join("reference-tests-checkpoint");
    let layout = FileLayout::single(dir.join("bench.jsonl").to_string_lossy().to_string());
    let total = 500_000;
    let config = SystemConfig::new("bench", vec![0.0; 3], vec![1.0; 3], vec![2, 2, 2]);
    let root: Aabb<3> = config.root_box().expect("Invalid root domain");
    let particles = seed_particles(
        &InitialState::Uniform {
            count: total,
            speed: 1.0,
        },
        &root,
        config.seed,
    );
    let share = total / 8;

    let start = Instant::now();
    run_group(8, |transport| {
        let mut system: ParticleSystem<SphParticle, LocalTransport, 3> =
            ParticleSystem::new(transport);
        system.configure(config.settings()).expect("configure");
        let rank = system.rank();
        let end = if rank == 7 { total } else { (rank + 1) * share };
        for p in &particles[rank * share..end] {
            system.push(*p).expect("push");
        }
        let header = CountedHeader {
            name: "bench".to_string(),
            nproc: 8,
            count: total,
            time: 0.0,
        };
        system.write_checkpoint(&layout, &header).expect("write");
    })
    .expect("write group failed");
    let wrote = start.elapsed().as_secs_f64();

    let start = Instant::now();
    let counts = run_group(5, |transport| {
        let mut system: ParticleSystem<SphParticle, LocalTransport, 3> =
            ParticleSystem::new(transport);
        system.configure(config.settings()).expect("configure");
        let header: CountedHeader = system.read_checkpoint(&layout).expect("read");
        assert_eq!(header.count, total);
        system.local_count()
    })
    .expect("read group failed");
    let read = start.elapsed().as_secs_f64();

    tracing::info!("checkpoint write {:.2}s, read {:.2}s, counts {:?}", wrote, read, counts);
    assert_eq!(counts.iter().sum::<usize>(), total);
    assert_eq!(counts[1], total / 5);

    let _ = std::fs::remove_dir_all(&dir);
}

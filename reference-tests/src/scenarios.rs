//! The stock reference scenarios, one per file under `configs/`.

use std::path::{Path, PathBuf};

use crate::{
    BalanceCheck, ConservationCheck, ExpectedResult, InitialState, Motion, ReferenceTest,
};

/// The workspace `configs/` directory, independent of the working directory.
pub fn config_dir() -> PathBuf {
    Path::new(concat!(env!("CARGO_MANIFEST_DIR"), "/../configs")).to_path_buf()
}

fn config(dir: &Path, file: &str) -> String {
    dir.join(file).to_string_lossy().to_string()
}

/// Quadrant exchange
///
/// 100 random particles start on rank 0 of a 2x2x1 grid and are handed to
/// their quadrants in one exchange. Nothing moves afterwards.
pub fn quadrant_exchange(dir: &Path) -> ReferenceTest {
    ReferenceTest {
        name: "Quadrant Exchange".to_string(),
        config_path: config(dir, "quadrant-2x2x1.json"),
        initial: InitialState::Uniform {
            count: 100,
            speed: 0.0,
        },
        motion: Motion::Static,
        cycles: 1,
        expected: ExpectedResult {
            conservation: Some(ConservationCheck {
                max_mass_error: 0.0,
            }),
            ownership: true,
            balance: None,
            idempotence: true,
            reference_match: false,
            checkpoint: false,
        },
    }
}

/// Periodic drift
///
/// Random velocities carry particles across every periodic face of an
/// eight-rank box for several cycles. The result must match the same drift
/// done on one process.
pub fn periodic_drift(dir: &Path) -> ReferenceTest {
    ReferenceTest {
        name: "Periodic Drift".to_string(),
        config_path: config(dir, "drift-periodic-2x2x2.json"),
        initial: InitialState::Uniform {
            count: 4000,
            speed: 0.4,
        },
        motion: Motion::Drift { dt: 0.5 },
        cycles: 6,
        expected: ExpectedResult {
            conservation: Some(ConservationCheck {
                max_mass_error: 1e-12,
            }),
            ownership: true,
            balance: Some(BalanceCheck { max_imbalance: 1.6 }),
            idempotence: true,
            reference_match: true,
            checkpoint: false,
        },
    }
}

/// Cluster spreading
///
/// Every particle starts packed into one corner of an open box; sampling
/// and rebalancing must spread them over all eight ranks.
pub fn cluster_balance(dir: &Path) -> ReferenceTest {
    ReferenceTest {
        name: "Cluster Balance".to_string(),
        config_path: config(dir, "cluster-open-4x2x1.json"),
        initial: InitialState::Cluster {
            count: 2000,
            extent: 0.25,
        },
        motion: Motion::Static,
        cycles: 3,
        expected: ExpectedResult {
            conservation: Some(ConservationCheck {
                max_mass_error: 0.0,
            }),
            ownership: true,
            balance: Some(BalanceCheck { max_imbalance: 1.6 }),
            idempotence: true,
            reference_match: false,
            checkpoint: false,
        },
    }
}

/// Slab checkpoint
///
/// A lattice streams along the periodic x axis of a three-slab domain, then
/// the final state goes through a per-rank checkpoint round trip.
pub fn slab_checkpoint(dir: &Path) -> ReferenceTest {
    ReferenceTest {
        name: "Slab Checkpoint".to_string(),
        config_path: config(dir, "slab-checkpoint-3x1x1.json"),
        initial: InitialState::Lattice {
            per_axis: 12,
            velocity: [0.37, 0.0, 0.0],
        },
        motion: Motion::Drift { dt: 1.0 },
        cycles: 4,
        expected: ExpectedResult {
            conservation: Some(ConservationCheck {
                max_mass_error: 0.0,
            }),
            ownership: true,
            balance: None,
            idempotence: false,
            reference_match: true,
            checkpoint: true,
        },
    }
}

/// All stock scenarios, reading configurations from `dir`.
pub fn all(dir: &Path) -> Vec<ReferenceTest> {
    vec![
        quadrant_exchange(dir),
        periodic_drift(dir),
        cluster_balance(dir),
        slab_checkpoint(dir),
    ]
}

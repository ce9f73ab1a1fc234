//! Reference scenario framework for particle redistribution
//!
//! This crate validates the redistribution layer end to end: a scenario
//! loads a configuration, seeds particles on rank 0, runs several
//! move/rebalance/exchange cycles over an in-process group, and then checks
//! the outcome against conservation, ownership, balance, idempotence and a
//! single-process reference.

pub mod scenarios;

#[cfg(test)]
mod benchmarks;

use particle_kernel::{Aabb, HasMass, Particle, SphParticle};
use particle_orchestrator::distributed::run_single_instance;
use particle_orchestrator::{
    load_imbalance, run_distributed, run_group, CountedHeader, DistributedResult,
    DomainPartition, FileLayout, LocalTransport, ParticleSystem, QuantileRebalancer,
    SystemConfig,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::time::{Duration, Instant};

/// How the particles of a scenario are seeded (all on rank 0)
#[derive(Debug, Clone)]
pub enum InitialState {
    /// Uniformly random positions in the root domain
    Uniform {
        /// Number of particles
        count: usize,
        /// Random velocity magnitude per axis
        speed: f64,
    },
    /// Random positions packed into the lower corner of the root domain
    Cluster {
        /// Number of particles
        count: usize,
        /// Fraction of every axis the cluster spans
        extent: f64,
    },
    /// Cell-centered lattice with `per_axis` particles along every axis
    Lattice {
        /// Particles per axis
        per_axis: usize,
        /// Common velocity of every particle
        velocity: [f64; 3],
    },
}

/// Per-cycle particle motion
#[derive(Debug, Clone, Copy)]
pub enum Motion {
    /// Particles stay put
    Static,
    /// Explicit drift along each particle's velocity
    Drift {
        /// Time step
        dt: f64,
    },
}

impl Motion {
    /// Apply one cycle of motion.
    pub fn apply(&self, particles: &mut [SphParticle]) {
        if let Motion::Drift { dt } = *self {
            for p in particles {
                p.drift(dt);
            }
        }
    }
}

/// Expected result criteria for a reference scenario
#[derive(Debug, Clone, Default)]
pub struct ExpectedResult {
    /// Particle count and mass conservation
    pub conservation: Option<ConservationCheck>,
    /// Every particle inside its owner's box
    pub ownership: bool,
    /// Load balance after rebalancing
    pub balance: Option<BalanceCheck>,
    /// Re-exchanging over the final partition moves nothing
    pub idempotence: bool,
    /// Bitwise agreement with the same motion on one process
    pub reference_match: bool,
    /// Per-rank checkpoint round trip through the configured layout
    pub checkpoint: bool,
}

/// Check conservation of particles and mass
#[derive(Debug, Clone)]
pub struct ConservationCheck {
    /// Maximum allowed relative mass error (0.0 to 1.0)
    pub max_mass_error: f64,
}

/// Check load balance
#[derive(Debug, Clone)]
pub struct BalanceCheck {
    /// Maximum allowed ratio of the largest local count to the mean
    pub max_imbalance: f64,
}

/// Result of running a reference scenario
#[derive(Debug)]
pub struct TestResult {
    /// Scenario name
    pub name: String,
    /// Whether every check passed
    pub passed: bool,
    /// Individual check results
    pub checks: Vec<CheckResult>,
    /// Redistribution cycles executed
    pub cycles: usize,
    /// Final local count per rank
    pub local_counts: Vec<usize>,
    /// Particles moved between ranks over the run
    pub migrated: u64,
    /// Wall time of the distributed run
    pub elapsed: Duration,
}

/// Result of an individual validation check
#[derive(Debug)]
pub struct CheckResult {
    /// Check name
    pub name: String,
    /// Whether check passed
    pub passed: bool,
    /// Detail message
    pub message: Option<String>,
}

impl CheckResult {
    fn pass(name: &str, message: String) -> Self {
        Self {
            name: name.to_string(),
            passed: true,
            message: Some(message),
        }
    }

    fn fail(name: &str, message: String) -> Self {
        Self {
            name: name.to_string(),
            passed: false,
            message: Some(message),
        }
    }
}

/// A reference scenario
pub struct ReferenceTest {
    /// Scenario name
    pub name: String,
    /// Path to configuration file
    pub config_path: String,
    /// Initial particles
    pub initial: InitialState,
    /// Motion applied before every cycle
    pub motion: Motion,
    /// Number of redistribution cycles
    pub cycles: usize,
    /// Expected results to validate
    pub expected: ExpectedResult,
}

/// Seed the particles of `state` inside `root`.
pub fn seed_particles(state: &InitialState, root: &Aabb<3>, seed: u64) -> Vec<SphParticle> {
    let mut rng = StdRng::seed_from_u64(seed);
    let lengths = root.full_length();
    match state {
        InitialState::Uniform { count, speed } => (0..*count)
            .map(|i| {
                let pos = std::array::from_fn(|k| root.low[k] + rng.random::<f64>() * lengths[k]);
                let vel = std::array::from_fn(|_| rng.random_range(-1.0..1.0_f64) * *speed);
                SphParticle::new(i as u64, pos, 1.0).with_velocity(vel)
            })
            .collect(),
        InitialState::Cluster { count, extent } => (0..*count)
            .map(|i| {
                let pos = std::array::from_fn(|k| {
                    root.low[k] + rng.random::<f64>() * *extent * lengths[k]
                });
                SphParticle::new(i as u64, pos, 1.0)
            })
            .collect(),
        InitialState::Lattice { per_axis, velocity } => {
            let n = *per_axis;
            let mut particles = Vec::with_capacity(n * n * n);
            for i in 0..n {
                for j in 0..n {
                    for k in 0..n {
                        let cell = [i, j, k];
                        let pos = std::array::from_fn(|a| {
                            root.low[a] + (cell[a] as f64 + 0.5) / n as f64 * lengths[a]
                        });
                        let id = particles.len() as u64;
                        particles.push(SphParticle::new(id, pos, 1.0).with_velocity(*velocity));
                    }
                }
            }
            particles
        }
    }
}

impl ReferenceTest {
    /// Run the reference scenario and return results
    pub fn run(&self) -> Result<TestResult, String> {
        tracing::info!("Running reference scenario: {}", self.name);

        let config = SystemConfig::load(&self.config_path)?;
        let root = config.root_box::<3>()?;
        let initial = seed_particles(&self.initial, &root, config.seed);
        tracing::info!(
            "Initialized: {} particles over {} ranks",
            initial.len(),
            config.process_count()
        );

        let motion = self.motion;
        let start = Instant::now();
        let result = run_distributed::<_, _, _, 3>(
            &config,
            &initial,
            &QuantileRebalancer,
            self.cycles,
            |_, particles| motion.apply(particles),
        )
        .map_err(|e| e.to_string())?;
        let elapsed = start.elapsed();
        tracing::info!(
            "Distributed run complete: {} cycles in {:.3}s",
            self.cycles,
            elapsed.as_secs_f64()
        );

        let mut checks = Vec::new();

        if let Some(ref conservation) = self.expected.conservation {
            checks.push(validate_conservation(&initial, &result, conservation));
        }
        if self.expected.ownership {
            checks.push(validate_ownership(&result));
        }
        if let Some(ref balance) = self.expected.balance {
            checks.push(validate_balance(&result, balance));
        }
        if self.expected.idempotence {
            checks.push(validate_idempotence(&config, &result));
        }
        if self.expected.reference_match {
            let reference = run_single_instance::<_, _, 3>(&config, &initial, self.cycles, |_, p| {
                motion.apply(p)
            })
            .map_err(|e| e.to_string())?;
            checks.push(validate_reference_match(&result, reference));
        }
        if self.expected.checkpoint {
            checks.push(validate_checkpoint(&config, &result));
        }

        Ok(TestResult {
            name: self.name.clone(),
            passed: checks.iter().all(|c| c.passed),
            checks,
            cycles: result.cycles,
            local_counts: result.local_counts,
            migrated: result.migrated,
            elapsed,
        })
    }
}

/// Split the concatenated final particles back into per-rank slices.
fn per_rank<'a>(result: &'a DistributedResult<SphParticle, 3>) -> Vec<&'a [SphParticle]> {
    let mut offset = 0;
    result
        .local_counts
        .iter()
        .map(|&count| {
            let slice = &result.particles[offset..offset + count];
            offset += count;
            slice
        })
        .collect()
}

/// Validate particle count, identity and mass
fn validate_conservation(
    initial: &[SphParticle],
    result: &DistributedResult<SphParticle, 3>,
    check: &ConservationCheck,
) -> CheckResult {
    let mut before: Vec<u64> = initial.iter().map(|p| p.id).collect();
    let mut after: Vec<u64> = result.particles.iter().map(|p| p.id).collect();
    before.sort_unstable();
    after.sort_unstable();
    if before != after {
        return CheckResult::fail(
            "Conservation",
            format!(
                "particle ids differ: {} before, {} after",
                before.len(),
                after.len()
            ),
        );
    }

    let mass_before: f64 = initial.iter().map(|p| p.mass()).sum();
    let mass_after: f64 = result.particles.iter().map(|p| p.mass()).sum();
    let error = (mass_after - mass_before).abs() / mass_before.abs().max(f64::MIN_POSITIVE);
    if error <= check.max_mass_error {
        CheckResult::pass(
            "Conservation",
            format!("{} particles, mass error {:.2e}", after.len(), error),
        )
    } else {
        CheckResult::fail(
            "Conservation",
            format!(
                "mass error {:.2e} (limit: {:.2e})",
                error, check.max_mass_error
            ),
        )
    }
}

/// Validate that every rank holds only particles in its own box
fn validate_ownership(result: &DistributedResult<SphParticle, 3>) -> CheckResult {
    let mut misplaced = 0;
    for (rank, local) in per_rank(result).into_iter().enumerate() {
        let own = match result.partition.box_of(rank) {
            Some(b) => b,
            None => return CheckResult::fail("Ownership", format!("no box for rank {}", rank)),
        };
        misplaced += local.iter().filter(|p| !own.contains(&p.position())).count();
    }
    if misplaced == 0 {
        CheckResult::pass("Ownership", "every particle is at home".to_string())
    } else {
        CheckResult::fail("Ownership", format!("{} particles misplaced", misplaced))
    }
}

/// Validate load balance
fn validate_balance(result: &DistributedResult<SphParticle, 3>, check: &BalanceCheck) -> CheckResult {
    let imbalance = load_imbalance(&result.local_counts);
    let message = format!(
        "counts {:?}, imbalance {:.2} (limit: {:.2})",
        result.local_counts, imbalance, check.max_imbalance
    );
    if imbalance <= check.max_imbalance {
        CheckResult::pass("Balance", message)
    } else {
        CheckResult::fail("Balance", message)
    }
}

/// Hand every rank its final particles again and exchange over the final
/// partition: nothing may move and the order must stay the same.
fn validate_idempotence(
    config: &SystemConfig,
    result: &DistributedResult<SphParticle, 3>,
) -> CheckResult {
    let slices = per_rank(result);
    let partition: &DomainPartition<3> = &result.partition;
    let outcome = run_group(slices.len(), |transport| -> Result<bool, String> {
        let mut system: ParticleSystem<SphParticle, LocalTransport, 3> =
            ParticleSystem::new(transport);
        system.configure(config.settings()).map_err(|e| e.to_string())?;
        let local = slices[system.rank()];
        for p in local {
            system.push(*p).map_err(|e| e.to_string())?;
        }
        let report = system
            .exchange_particles(partition)
            .map_err(|e| e.to_string())?;
        Ok(report.sent == 0 && report.received == 0 && system.particles() == local)
    });

    match outcome {
        Ok(per_rank) => match per_rank.into_iter().collect::<Result<Vec<bool>, String>>() {
            Ok(flags) if flags.iter().all(|&f| f) => {
                CheckResult::pass("Idempotence", "second exchange moved nothing".to_string())
            }
            Ok(flags) => CheckResult::fail("Idempotence", format!("per-rank stable: {:?}", flags)),
            Err(e) => CheckResult::fail("Idempotence", e),
        },
        Err(e) => CheckResult::fail("Idempotence", e.to_string()),
    }
}

/// Validate bitwise agreement with the single-process reference
fn validate_reference_match(
    result: &DistributedResult<SphParticle, 3>,
    mut reference: Vec<SphParticle>,
) -> CheckResult {
    let mut distributed = result.particles.clone();
    distributed.sort_by_key(|p| p.id);
    reference.sort_by_key(|p| p.id);
    let mismatches = distributed
        .iter()
        .zip(&reference)
        .filter(|(a, b)| a != b)
        .count();
    if distributed.len() == reference.len() && mismatches == 0 {
        CheckResult::pass(
            "Reference Match",
            format!("{} particles identical", reference.len()),
        )
    } else {
        CheckResult::fail(
            "Reference Match",
            format!(
                "{} mismatches ({} vs {} particles)",
                mismatches,
                distributed.len(),
                reference.len()
            ),
        )
    }
}

/// Write the final particles through the configured checkpoint layout and
/// read them back on the same group shape.
fn validate_checkpoint(
    config: &SystemConfig,
    result: &DistributedResult<SphParticle, 3>,
) -> CheckResult {
    let layout = match &config.checkpoint {
        Some(c) => FileLayout::from_config(c, &config.name),
        None => return CheckResult::fail("Checkpoint", "no checkpoint configured".to_string()),
    };
    let slices = per_rank(result);
    let nproc = slices.len();
    let outcome = run_group(nproc, |transport| -> Result<bool, String> {
        let mut system: ParticleSystem<SphParticle, LocalTransport, 3> =
            ParticleSystem::new(transport);
        system.configure(config.settings()).map_err(|e| e.to_string())?;
        let local = slices[system.rank()];
        for p in local {
            system.push(*p).map_err(|e| e.to_string())?;
        }
        let header = CountedHeader {
            name: config.name.clone(),
            nproc,
            count: system.local_count(),
            time: result.cycles as f64,
        };
        system
            .write_checkpoint(&layout, &header)
            .map_err(|e| e.to_string())?;
        system.set_local_count(0).map_err(|e| e.to_string())?;
        let back: CountedHeader = system.read_checkpoint(&layout).map_err(|e| e.to_string())?;
        Ok(back == header && system.particles() == local)
    });

    match outcome.map(|r| r.into_iter().collect::<Result<Vec<bool>, String>>()) {
        Ok(Ok(flags)) if flags.iter().all(|&f| f) => CheckResult::pass(
            "Checkpoint",
            format!("{} files round-tripped", nproc),
        ),
        Ok(Ok(flags)) => CheckResult::fail("Checkpoint", format!("per-rank match: {:?}", flags)),
        Ok(Err(e)) => CheckResult::fail("Checkpoint", e),
        Err(e) => CheckResult::fail("Checkpoint", e.to_string()),
    }
}

impl TestResult {
    /// Print a summary of the test result
    pub fn print_summary(&self) {
        println!("\n{}", "=".repeat(80));
        println!("Scenario: {}", self.name);
        println!("{}", "=".repeat(80));
        println!("Status: {}", if self.passed { "PASSED" } else { "FAILED" });
        println!("Cycles: {}", self.cycles);
        println!("Wall time: {:.3} s", self.elapsed.as_secs_f64());
        println!("\nDistribution:");
        println!("  Final local counts: {:?}", self.local_counts);
        println!("  Imbalance: {:.2}", load_imbalance(&self.local_counts));
        println!("  Migrations: {}", self.migrated);
        println!("\nValidation Checks:");
        for check in &self.checks {
            let status = if check.passed { "PASS" } else { "FAIL" };
            print!("  [{}] {}", status, check.name);
            if let Some(ref msg) = check.message {
                print!(" - {}", msg);
            }
            println!();
        }
        println!("{}", "=".repeat(80));
    }
}

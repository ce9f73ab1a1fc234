//! Distributed execution over an in-process group
//!
//! Every rank runs on its own OS thread with its own [`ParticleSystem`];
//! ranks share nothing but their [`LocalTransport`] endpoints. A panic on one
//! rank aborts the group so no peer stays blocked, and is then re-raised on
//! the calling thread.
//!
//! [`redistribute`] is one load-balancing cycle: wrap, sample, gather the
//! samples everywhere, rebalance, exchange.

use std::panic::{self, AssertUnwindSafe};
use std::thread;

use particle_kernel::{wrap_particles, Particle, ParticleStore};

use crate::config::SystemConfig;
use crate::error::{Error, Result, TransportError};
use crate::exchange::ExchangeReport;
use crate::partition::{DomainPartition, Rebalancer};
use crate::system::ParticleSystem;
use crate::transport::{LocalGroup, LocalTransport, Transport};

/// Run `body` once per rank of a fresh group of `size`, one thread each.
///
/// Results come back in rank order. A panicking rank aborts the group
/// and the panic is resumed here once every thread has finished.
pub fn run_group<R, F>(size: usize, body: F) -> Result<Vec<R>>
where
    R: Send,
    F: Fn(LocalTransport) -> R + Sync,
{
    let endpoints = LocalGroup::new(size);
    let group_abort = match endpoints.first() {
        Some(t) => t.abort_handle(),
        None => return Ok(Vec::new()),
    };
    let body = &body;

    thread::scope(|s| {
        let mut handles = Vec::with_capacity(size);
        for transport in endpoints {
            let rank = transport.rank();
            let abort = transport.abort_handle();
            let spawned = thread::Builder::new()
                .name(format!("rank-{}", rank))
                .spawn_scoped(s, move || {
                    match panic::catch_unwind(AssertUnwindSafe(|| body(transport))) {
                        Ok(r) => r,
                        Err(payload) => {
                            abort.abort(&format!("rank {} panicked", rank));
                            panic::resume_unwind(payload)
                        }
                    }
                });
            match spawned {
                Ok(handle) => handles.push(handle),
                Err(e) => {
                    group_abort.abort("failed to spawn every rank");
                    return Err(Error::Io(e));
                }
            }
        }

        let mut results = Vec::with_capacity(size);
        let mut first_panic = None;
        for handle in handles {
            match handle.join() {
                Ok(r) => results.push(r),
                Err(payload) => {
                    first_panic.get_or_insert(payload);
                }
            }
        }
        if let Some(payload) = first_panic {
            panic::resume_unwind(payload);
        }
        Ok(results)
    })
}

/// What one [`redistribute`] call did on this rank.
#[derive(Debug, Clone, PartialEq)]
pub struct CycleReport {
    /// Positions folded back into the root domain.
    pub wrapped: usize,
    /// Samples this rank contributed.
    pub local_samples: usize,
    /// Samples the rebalancer saw.
    pub global_samples: usize,
    /// Exchange outcome.
    pub exchange: ExchangeReport,
}

/// One load-balancing cycle. Collective.
///
/// Returns the new partition, which every rank computes identically.
pub fn redistribute<P, T, B, const D: usize>(
    system: &mut ParticleSystem<P, T, D>,
    rebalancer: &B,
    current: &DomainPartition<D>,
    weight: f64,
) -> Result<(DomainPartition<D>, CycleReport)>
where
    P: Particle<D>,
    T: Transport,
    B: Rebalancer<D> + ?Sized,
{
    let wrapped = system.wrap_periodic(current)?;
    let samples = system.sample_particles(weight)?;

    let gathered = system
        .transport_mut()
        .all_gather(bytemuck::cast_slice(&samples))
        .map_err(Error::from);
    let gathered = system.guard(gathered)?;
    let all_samples: Vec<[f64; D]> = gathered
        .iter()
        .flat_map(|bytes| bytemuck::pod_collect_to_vec::<u8, [f64; D]>(bytes))
        .collect();

    let next = rebalancer.rebalance(&all_samples, current)?;
    let exchange = system.exchange_particles(&next)?;

    Ok((
        next,
        CycleReport {
            wrapped,
            local_samples: samples.len(),
            global_samples: all_samples.len(),
            exchange,
        },
    ))
}

/// Result of a distributed run
#[derive(Debug, Clone)]
pub struct DistributedResult<P, const D: usize> {
    /// Final particles of every rank, concatenated in rank order
    pub particles: Vec<P>,
    /// Final local count of every rank
    pub local_counts: Vec<usize>,
    /// Final partition
    pub partition: DomainPartition<D>,
    /// Redistribution cycles executed
    pub cycles: usize,
    /// Particles sent between ranks over the whole run
    pub migrated: u64,
    /// Exchanges, summed over ranks, whose receives outgrew the reserved store
    pub reallocations: usize,
}

struct RankOutcome<P, const D: usize> {
    particles: Vec<P>,
    partition: DomainPartition<D>,
    migrated: u64,
    reallocations: usize,
}

/// Run a distributed redistribution for `cycles` cycles.
///
/// This function:
/// 1. Starts one rank per box of the configured grid
/// 2. Hands every initial particle to rank 0
/// 3. Exchanges once over the evenly cut partition
/// 4. Per cycle, applies `mover` to each rank's particles, then calls
///    [`redistribute`] and checks that no particle was lost or misplaced
/// 5. Merges the final particles in rank order
pub fn run_distributed<P, B, M, const D: usize>(
    config: &SystemConfig,
    initial: &[P],
    rebalancer: &B,
    cycles: usize,
    mover: M,
) -> Result<DistributedResult<P, D>>
where
    P: Particle<D>,
    B: Rebalancer<D> + Sync,
    M: Fn(usize, &mut [P]) + Sync,
{
    config.validate().map_err(Error::Config)?;
    let start = config.initial_partition::<D>().map_err(Error::Config)?;
    let nproc = config.process_count();
    let expected = initial.len() as u64;

    tracing::info!(
        "Distributed run '{}': {} ranks, grid {:?}, {} particles, {} cycles",
        config.name,
        nproc,
        config.grid,
        initial.len(),
        cycles
    );

    let outcomes = run_group(nproc, |transport| -> Result<RankOutcome<P, D>> {
        let mut system: ParticleSystem<P, LocalTransport, D> = ParticleSystem::new(transport);
        system.configure(config.settings())?;
        if system.rank() == 0 {
            system.reserve_headroom(initial.len())?;
            for p in initial {
                system.push(*p)?;
            }
        }
        // Every rank sizes its store from its share of the global count.
        let share = (system.global_count()? as usize).div_ceil(system.size());
        system.reserve_headroom(share)?;

        let mut partition = start.clone();
        let first = system.exchange_particles(&partition)?;
        let mut migrated = first.sent as u64;
        let mut reallocations = usize::from(first.grew_capacity);
        verify(&mut system, &partition, expected)?;

        for cycle in 0..cycles {
            mover(cycle, system.particles_mut());
            let weight = system.local_count().max(1) as f64;
            let (next, report) = redistribute(&mut system, rebalancer, &partition, weight)?;
            partition = next;
            migrated += report.exchange.sent as u64;
            reallocations += usize::from(report.exchange.grew_capacity);
            verify(&mut system, &partition, expected)?;

            if system.rank() == 0 {
                tracing::debug!(
                    "cycle {}/{}: wrapped {}, {} samples, rank 0 holds {}",
                    cycle + 1,
                    cycles,
                    report.wrapped,
                    report.global_samples,
                    system.local_count()
                );
            }
        }

        Ok(RankOutcome {
            particles: system.particles().to_vec(),
            partition,
            migrated,
            reallocations,
        })
    })?;

    let mut particles = Vec::with_capacity(initial.len());
    let mut local_counts = Vec::with_capacity(nproc);
    let mut migrated = 0;
    let mut reallocations = 0;
    let mut partition = start;
    let mut failure: Option<Error> = None;
    for outcome in outcomes {
        match outcome {
            Ok(outcome) => {
                local_counts.push(outcome.particles.len());
                particles.extend(outcome.particles);
                migrated += outcome.migrated;
                reallocations += outcome.reallocations;
                partition = outcome.partition;
            }
            // Report the rank that caused an abort, not the peers it unblocked.
            Err(e) => {
                let replace = match &failure {
                    None => true,
                    Some(f) => is_abort_echo(f) && !is_abort_echo(&e),
                };
                if replace {
                    failure = Some(e);
                }
            }
        }
    }
    if let Some(e) = failure {
        return Err(e);
    }

    tracing::info!(
        "Distributed run complete: {} cycles, {} particles, {} migrations, imbalance {:.2}",
        cycles,
        particles.len(),
        migrated,
        crate::load_imbalance(&local_counts)
    );

    Ok(DistributedResult {
        particles,
        local_counts,
        partition,
        cycles,
        migrated,
        reallocations,
    })
}

fn is_abort_echo(e: &Error) -> bool {
    matches!(e, Error::Transport(TransportError::Aborted { .. }))
}

/// Post-exchange validation: global count conserved and every particle at home.
fn verify<P: Particle<D>, T: Transport, const D: usize>(
    system: &mut ParticleSystem<P, T, D>,
    partition: &DomainPartition<D>,
    expected: u64,
) -> Result<()> {
    if !system.check_global_count(expected)? {
        return Err(Error::InvariantViolated(format!(
            "global count is no longer {}",
            expected
        )));
    }
    if !system.check_all_inside(partition)? {
        return Err(Error::InvariantViolated(
            "a particle is outside its owner's box".to_string(),
        ));
    }
    Ok(())
}

/// Run the same motion on one process with no exchange, for comparison.
///
/// Returns the particles after `cycles` moves, each followed by a periodic wrap.
pub fn run_single_instance<P, M, const D: usize>(
    config: &SystemConfig,
    initial: &[P],
    cycles: usize,
    mover: M,
) -> Result<Vec<P>>
where
    P: Particle<D>,
    M: Fn(usize, &mut [P]),
{
    config.validate().map_err(Error::Config)?;
    let root = config.root_box::<D>().map_err(Error::Config)?;
    let boundary = config.boundary_kinds::<D>().map_err(Error::Config)?;

    let mut store: ParticleStore<P, D> = ParticleStore::create(initial.len());
    store.append(initial);
    for cycle in 0..cycles {
        mover(cycle, store.as_mut_slice());
        wrap_particles(store.as_mut_slice(), &root, &boundary);
    }
    Ok(store.as_slice().to_vec())
}

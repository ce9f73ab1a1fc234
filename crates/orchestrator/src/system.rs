//! Driver-facing facade over one process's particles.
//!
//! A [`ParticleSystem`] owns the local [`ParticleStore`], the transport
//! endpoint and the exchange engine. It starts `Uninitialized`, becomes
//! `Configured` through [`ParticleSystem::configure`], and is `Poisoned` by
//! the first protocol failure, after which every operation is refused.

use std::ops::{Index, IndexMut};

use particle_kernel::{
    wrap_particles, HasMass, Particle, ParticleStore, SampleBudget, SampleSelector,
};

use crate::error::{Error, Result};
use crate::exchange::{ExchangeEngine, ExchangeReport};
use crate::partition::DomainPartition;
use crate::transport::{ReduceOp, Transport};

/// Lifecycle of a [`ParticleSystem`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SystemState {
    /// Created, not yet configured.
    Uninitialized,
    /// Ready for use.
    Configured,
    /// A protocol error occurred; nothing further is allowed.
    Poisoned,
}

/// Tunables applied by [`ParticleSystem::configure`].
#[derive(Debug, Clone, PartialEq)]
pub struct SystemSettings {
    /// Average samples per process; the global target is this times the group size.
    pub samples_per_process: usize,
    /// Slack `ε` of the per-process sample floor.
    pub sample_floor_ratio: f64,
    /// Run seed; each rank derives its own sampling stream from it.
    pub seed: u64,
    /// Initial capacity of the local store.
    pub capacity_hint: usize,
}

impl Default for SystemSettings {
    fn default() -> Self {
        Self {
            samples_per_process: particle_kernel::sampling::DEFAULT_SAMPLES_PER_PROCESS,
            sample_floor_ratio: particle_kernel::sampling::DEFAULT_SAMPLE_FLOOR_RATIO,
            seed: 0x5EED,
            capacity_hint: 0,
        }
    }
}

impl SystemSettings {
    fn validate(&self) -> Result<()> {
        if self.samples_per_process == 0 {
            return Err(Error::Config("samples_per_process must be at least 1".into()));
        }
        if !self.sample_floor_ratio.is_finite() || self.sample_floor_ratio < 0.0 {
            return Err(Error::Config("sample_floor_ratio must be finite and non-negative".into()));
        }
        Ok(())
    }
}

/// One process's view of the distributed particle set.
pub struct ParticleSystem<P, T, const D: usize> {
    store: ParticleStore<P, D>,
    transport: T,
    engine: ExchangeEngine,
    selector: Option<SampleSelector>,
    settings: SystemSettings,
    samples_override: Option<usize>,
    sampled: bool,
    state: SystemState,
}

impl<P: Particle<D>, T: Transport, const D: usize> ParticleSystem<P, T, D> {
    /// Unconfigured system bound to `transport`.
    pub fn new(transport: T) -> Self {
        Self {
            store: ParticleStore::new(),
            transport,
            engine: ExchangeEngine::new(),
            selector: None,
            settings: SystemSettings::default(),
            samples_override: None,
            sampled: false,
            state: SystemState::Uninitialized,
        }
    }

    /// `Uninitialized → Configured`.
    pub fn configure(&mut self, settings: SystemSettings) -> Result<()> {
        match self.state {
            SystemState::Configured => return Err(Error::AlreadyConfigured),
            SystemState::Poisoned => return Err(Error::Poisoned),
            SystemState::Uninitialized => {}
        }
        settings.validate()?;
        self.selector = Some(SampleSelector::new(settings.seed, self.transport.rank()));
        self.store.reserve_total(settings.capacity_hint);
        self.settings = settings;
        self.state = SystemState::Configured;
        tracing::debug!(
            "rank {} of {} configured",
            self.transport.rank(),
            self.transport.size()
        );
        Ok(())
    }

    /// Override the per-process sample average. Allowed once, before the first sampling.
    pub fn set_samples_per_process(&mut self, n: usize) -> Result<()> {
        if self.state == SystemState::Poisoned {
            return Err(Error::Poisoned);
        }
        if self.sampled || self.samples_override.is_some() {
            return Err(Error::AlreadySet("samples_per_process"));
        }
        if n == 0 {
            return Err(Error::Config("samples_per_process must be at least 1".into()));
        }
        self.samples_override = Some(n);
        Ok(())
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SystemState {
        self.state
    }

    /// Effective settings.
    pub fn settings(&self) -> &SystemSettings {
        &self.settings
    }

    /// Effective per-process sample average.
    pub fn samples_per_process(&self) -> usize {
        self.samples_override
            .unwrap_or(self.settings.samples_per_process)
    }

    pub(crate) fn ensure_configured(&self) -> Result<()> {
        match self.state {
            SystemState::Configured => Ok(()),
            SystemState::Uninitialized => Err(Error::NotConfigured),
            SystemState::Poisoned => Err(Error::Poisoned),
        }
    }

    /// Poison the system if `result` carries a protocol failure.
    pub(crate) fn guard<R>(&mut self, result: Result<R>) -> Result<R> {
        if let Err(e) = &result {
            if e.is_protocol_failure() && self.state != SystemState::Poisoned {
                tracing::error!("rank {}: poisoning particle system: {}", self.transport.rank(), e);
                self.state = SystemState::Poisoned;
            }
        }
        result
    }

    /// Abort the whole group and poison this system.
    pub(crate) fn abort_group(&mut self, reason: &str) {
        self.transport.abort(reason);
        self.state = SystemState::Poisoned;
    }

    /// This process's rank.
    pub fn rank(&self) -> usize {
        self.transport.rank()
    }

    /// Group size.
    pub fn size(&self) -> usize {
        self.transport.size()
    }

    /// Drop all local particles and reserve `capacity_hint` slots.
    pub fn create_particle(&mut self, capacity_hint: usize) -> Result<()> {
        self.ensure_configured()?;
        self.store.reset(capacity_hint);
        Ok(())
    }

    /// Make sure at least `total` slots are reserved.
    pub fn reserve(&mut self, total: usize) -> Result<()> {
        self.ensure_configured()?;
        self.store.reserve_total(total);
        Ok(())
    }

    /// Reserve `3n + 1000` slots for an expected local count of `n`.
    ///
    /// Keeps the following exchange from reallocating while its receives
    /// are outstanding, as long as the net inflow stays within `2n + 1000`.
    pub fn reserve_headroom(&mut self, n: usize) -> Result<()> {
        self.ensure_configured()?;
        self.store.reserve_for_count(n);
        Ok(())
    }

    /// Resize the local set to `n` particles (reserving `3n + 1000` slots).
    pub fn set_local_count(&mut self, n: usize) -> Result<()> {
        self.ensure_configured()?;
        self.store.set_local_count(n);
        Ok(())
    }

    /// Append one particle.
    pub fn push(&mut self, particle: P) -> Result<()> {
        self.ensure_configured()?;
        self.store.push(particle);
        Ok(())
    }

    /// Checked access.
    pub fn get(&self, index: usize) -> Result<&P> {
        Ok(self.store.get(index)?)
    }

    /// Checked mutable access.
    pub fn get_mut(&mut self, index: usize) -> Result<&mut P> {
        Ok(self.store.get_mut(index)?)
    }

    /// Particles owned by this process.
    pub fn local_count(&self) -> usize {
        self.store.len()
    }

    /// Local particles in order.
    pub fn particles(&self) -> &[P] {
        self.store.as_slice()
    }

    /// Local particles, mutable.
    pub fn particles_mut(&mut self) -> &mut [P] {
        self.store.as_mut_slice()
    }

    /// Underlying store.
    pub fn store(&self) -> &ParticleStore<P, D> {
        &self.store
    }

    /// Underlying store, mutable.
    pub fn store_mut(&mut self) -> &mut ParticleStore<P, D> {
        &mut self.store
    }

    /// Underlying transport endpoint.
    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub(crate) fn parts_mut(&mut self) -> (&mut ParticleStore<P, D>, &mut T) {
        (&mut self.store, &mut self.transport)
    }

    /// Bytes held by the store plus the buffers of the last exchange.
    pub fn memory_size(&self) -> usize {
        self.store.memory_size() + self.engine.buffer_bytes()
    }

    /// Draw this process's share of load-balancing samples. Collective.
    ///
    /// The share is proportional to `weight` among all processes, with a
    /// floor tied to the local particle count.
    pub fn sample_particles(&mut self, weight: f64) -> Result<Vec<[f64; D]>> {
        self.ensure_configured()?;
        let budget = self.sample_budget(weight);
        let budget = self.guard(budget)?;
        let k = budget.sample_count();
        self.sampled = true;
        let selector = self.selector.as_mut().ok_or(Error::NotConfigured)?;
        Ok(selector.draw(&mut self.store, k))
    }

    fn sample_budget(&mut self, weight: f64) -> Result<SampleBudget> {
        let total_weight = self.transport.all_reduce(weight, ReduceOp::Sum)?;
        let global_count = self.transport.sum_u64(self.store.len() as u64)?;
        Ok(SampleBudget {
            weight,
            total_weight,
            target_total: self.samples_per_process() * self.transport.size(),
            local_count: self.store.len(),
            global_count,
            floor_ratio: self.settings.sample_floor_ratio,
        })
    }

    /// Fold every local particle back into the root domain along periodic axes.
    ///
    /// Returns how many positions changed.
    pub fn wrap_periodic(&mut self, partition: &DomainPartition<D>) -> Result<usize> {
        self.ensure_configured()?;
        Ok(wrap_particles(
            self.store.as_mut_slice(),
            partition.root(),
            partition.boundary(),
        ))
    }

    /// Move every particle to the process whose box contains it. Collective.
    pub fn exchange_particles(&mut self, partition: &DomainPartition<D>) -> Result<ExchangeReport> {
        self.ensure_configured()?;
        let result = self
            .engine
            .exchange(&mut self.store, partition, &mut self.transport);
        let report = self.guard(result)?;
        tracing::debug!(
            "rank {}: exchange kept {}, sent {}, received {}, local count {}",
            self.transport.rank(),
            report.kept,
            report.sent,
            report.received,
            self.store.len()
        );
        Ok(report)
    }

    /// Sum of local counts over the group. Collective.
    pub fn global_count(&mut self) -> Result<u64> {
        self.ensure_configured()?;
        let result = self
            .transport
            .sum_u64(self.store.len() as u64)
            .map_err(Error::from);
        self.guard(result)
    }

    /// Largest per-axis distance of any particle from `center`. Collective.
    pub fn global_half_length(&mut self, center: [f64; D]) -> Result<f64> {
        self.ensure_configured()?;
        let local = self.store.local_half_length(center);
        let result = self
            .transport
            .all_reduce(local, ReduceOp::Max)
            .map_err(Error::from);
        self.guard(result)
    }

    /// Whether every particle on every process lies in its owner's box. Collective.
    pub fn check_all_inside(&mut self, partition: &DomainPartition<D>) -> Result<bool> {
        self.ensure_configured()?;
        let rank = self.transport.rank();
        let local_ok = match partition.box_of(rank) {
            Some(own) => self.store.iter().all(|p| own.contains(&p.position())),
            None => false,
        };
        if !local_ok {
            tracing::warn!("rank {}: found particles outside its own box", rank);
        }
        let result = self
            .transport
            .all_reduce(if local_ok { 1.0 } else { 0.0 }, ReduceOp::Min)
            .map_err(Error::from);
        Ok(self.guard(result)? > 0.5)
    }

    /// Whether the global count equals `expected`. Collective.
    pub fn check_global_count(&mut self, expected: u64) -> Result<bool> {
        let total = self.global_count()?;
        if total != expected && self.transport.rank() == 0 {
            tracing::warn!("global particle count {} differs from expected {}", total, expected);
        }
        Ok(total == expected)
    }
}

impl<P: Particle<D> + HasMass, T: Transport, const D: usize> ParticleSystem<P, T, D> {
    /// Global total mass and center of mass. Collective.
    ///
    /// `None` when the global mass is zero.
    pub fn center_of_mass(&mut self) -> Result<Option<(f64, [f64; D])>> {
        self.ensure_configured()?;
        let (mass, center) = self.store.center_of_mass().unwrap_or((0.0, [0.0; D]));
        let result = (|| {
            let total = self.transport.all_reduce(mass, ReduceOp::Sum)?;
            let mut weighted = [0.0; D];
            for k in 0..D {
                weighted[k] = self.transport.all_reduce(mass * center[k], ReduceOp::Sum)?;
            }
            Ok::<_, Error>((total, weighted))
        })();
        let (total, weighted) = self.guard(result)?;
        if total == 0.0 {
            return Ok(None);
        }
        Ok(Some((total, std::array::from_fn(|k| weighted[k] / total))))
    }
}

impl<P: Particle<D>, T: Transport, const D: usize> Index<usize> for ParticleSystem<P, T, D> {
    type Output = P;

    fn index(&self, index: usize) -> &P {
        &self.store[index]
    }
}

impl<P: Particle<D>, T: Transport, const D: usize> IndexMut<usize> for ParticleSystem<P, T, D> {
    fn index_mut(&mut self, index: usize) -> &mut P {
        &mut self.store[index]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{LocalGroup, LocalTransport};
    use particle_kernel::{Aabb, BoundaryKind, SphParticle};

    type System = ParticleSystem<SphParticle, LocalTransport, 3>;

    fn solo() -> System {
        ParticleSystem::new(LocalGroup::new(1).remove(0))
    }

    #[test]
    fn operations_require_configuration() {
        let mut system = solo();
        assert_eq!(system.state(), SystemState::Uninitialized);
        assert!(matches!(system.set_local_count(4), Err(Error::NotConfigured)));
        assert!(matches!(system.global_count(), Err(Error::NotConfigured)));

        system.configure(SystemSettings::default()).unwrap();
        assert!(matches!(
            system.configure(SystemSettings::default()),
            Err(Error::AlreadyConfigured)
        ));
    }

    #[test]
    fn invalid_settings_are_rejected() {
        let mut system = solo();
        let settings = SystemSettings {
            samples_per_process: 0,
            ..SystemSettings::default()
        };
        assert!(matches!(system.configure(settings), Err(Error::Config(_))));
        assert_eq!(system.state(), SystemState::Uninitialized);
    }

    #[test]
    fn samples_per_process_is_set_once() {
        let mut system = solo();
        system.configure(SystemSettings::default()).unwrap();
        system.set_samples_per_process(10).unwrap();
        assert_eq!(system.samples_per_process(), 10);
        assert!(matches!(
            system.set_samples_per_process(20),
            Err(Error::AlreadySet(_))
        ));
    }

    #[test]
    fn samples_per_process_locked_after_sampling() {
        let mut system = solo();
        system.configure(SystemSettings::default()).unwrap();
        system.sample_particles(1.0).unwrap();
        assert!(system.set_samples_per_process(5).is_err());
    }

    #[test]
    fn sampling_takes_everything_from_a_small_single_process() {
        let mut system = solo();
        system.configure(SystemSettings::default()).unwrap();
        for i in 0..12 {
            system.push(SphParticle::new(i, [0.5; 3], 1.0)).unwrap();
        }
        // Target 30 samples, only 12 particles.
        assert_eq!(system.sample_particles(1.0).unwrap().len(), 12);
        assert_eq!(system.global_count().unwrap(), 12);
    }

    #[test]
    fn set_local_count_and_indexing() {
        let mut system = solo();
        system.configure(SystemSettings::default()).unwrap();
        system.set_local_count(3).unwrap();
        system[1] = SphParticle::new(7, [0.1; 3], 2.0);
        assert_eq!(system.get(1).unwrap().id, 7);
        assert!(system.get(3).is_err());
        assert!(system.memory_size() >= 1003 * std::mem::size_of::<SphParticle>());
    }

    #[test]
    fn fatal_exchange_poisons() {
        let mut system = solo();
        system.configure(SystemSettings::default()).unwrap();
        let root = Aabb::new([0.0; 3], [1.0; 3]);
        let partition = DomainPartition::uniform(root, [1, 1, 1], [BoundaryKind::Open; 3]).unwrap();
        system.push(SphParticle::new(0, [2.0, 0.5, 0.5], 1.0)).unwrap();

        assert_eq!(system.wrap_periodic(&partition).unwrap(), 0);
        assert!(matches!(
            system.exchange_particles(&partition),
            Err(Error::FatalConfiguration(_))
        ));
        assert_eq!(system.state(), SystemState::Poisoned);
        assert!(matches!(system.global_count(), Err(Error::Poisoned)));
    }

    #[test]
    fn diagnostics_on_one_process() {
        let mut system = solo();
        system.configure(SystemSettings::default()).unwrap();
        system.push(SphParticle::new(0, [0.2, 0.5, 0.5], 1.0)).unwrap();
        system.push(SphParticle::new(1, [0.6, 0.5, 0.5], 3.0)).unwrap();

        let (mass, com) = system.center_of_mass().unwrap().unwrap();
        assert_eq!(mass, 4.0);
        assert!((com[0] - 0.5).abs() < 1e-12);
        assert!((system.global_half_length([0.5; 3]).unwrap() - 0.3).abs() < 1e-12);
        assert!(system.check_global_count(2).unwrap());
    }
}

//! Redistribution Layer
//!
//! This crate keeps every process's particles consistent with a spatial
//! partition that is recomputed as particles move:
//! - Process-group transport with an in-process thread implementation
//! - Domain partitions and a sample-quantile rebalancer
//! - The particle exchange protocol (classify, count, ring transfer, compact)
//! - `ParticleSystem`, the driver-facing facade with explicit lifecycle
//! - JSON-lines checkpoints, per rank or gathered into one file
//! - Configuration and a thread-per-rank distributed runner

#![warn(missing_docs)]

pub mod checkpoint;
pub mod config;
pub mod distributed;
pub mod error;
pub mod exchange;
pub mod partition;
pub mod system;
pub mod transport;

pub use checkpoint::{CheckpointHeader, CountedHeader, EmptyHeader, FileLayout};
pub use config::SystemConfig;
pub use distributed::{redistribute, run_distributed, run_group, CycleReport, DistributedResult};
pub use error::{Error, Result, TransportError};
pub use exchange::{ExchangeEngine, ExchangeReport, ExchangeState};
pub use partition::{DomainPartition, QuantileRebalancer, Rebalancer};
pub use system::{ParticleSystem, SystemSettings, SystemState};
pub use transport::{Completion, LocalGroup, LocalTransport, ReduceOp, Request, Transport};

/// Total and per-rank particle counts as reported by a group, for logging.
///
/// `counts[r]` is rank `r`'s local count. The imbalance is the largest count
/// divided by the mean (1.0 when perfectly balanced, 0.0 when empty).
pub fn load_imbalance(counts: &[usize]) -> f64 {
    let total: usize = counts.iter().sum();
    if counts.is_empty() || total == 0 {
        return 0.0;
    }
    let mean = total as f64 / counts.len() as f64;
    counts.iter().copied().max().unwrap_or(0) as f64 / mean
}

//! Particle exchange protocol.
//!
//! One call moves every local particle to the process whose box contains it:
//!
//! 1. Reject the call if any particle lies outside the root domain (fatal,
//!    the process group is aborted).
//! 2. Classify: route every particle, count per destination, then compact
//!    the keepers to the front (order preserved) and pack the leavers into
//!    one send buffer grouped by destination.
//! 3. All-to-all of the per-destination counts.
//! 4. Ring schedule: at step `s` send to `r + s` and receive from `r - s`,
//!    all non-blocking, tag `min(r, partner)`.
//! 5. Wait for all sends, then for all receives.
//! 6. Append the received particles after the keepers.

use std::mem::size_of;

use bytemuck::Zeroable;
use particle_kernel::{find_outside_root, Particle, ParticleStore};
use rayon::prelude::*;

use crate::error::{Error, Result, TransportError};
use crate::partition::DomainPartition;
use crate::transport::{Completion, Request, Transport};

/// Progress of an [`ExchangeEngine`] through one exchange call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeState {
    /// Ready for the next exchange.
    Idle,
    /// Keepers compacted and send buffer packed.
    Classified,
    /// Per-source receive counts known.
    CountsExchanged,
    /// Transfers posted and not yet completed.
    Transferring,
    /// Received particles appended.
    Compacted,
    /// An exchange failed; the engine refuses further work.
    Failed,
}

/// What one exchange did on this process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeReport {
    /// Particles that stayed.
    pub kept: usize,
    /// Particles sent away.
    pub sent: usize,
    /// Particles received.
    pub received: usize,
    /// Particles sent to each rank.
    pub send_counts: Vec<u64>,
    /// Particles received from each rank.
    pub recv_counts: Vec<u64>,
    /// The store had to reallocate to hold the received particles.
    pub grew_capacity: bool,
}

/// Drives the exchange protocol and tracks its state.
#[derive(Debug)]
pub struct ExchangeEngine {
    state: ExchangeState,
    buffer_bytes: usize,
}

impl Default for ExchangeEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl ExchangeEngine {
    /// Idle engine.
    pub fn new() -> Self {
        Self {
            state: ExchangeState::Idle,
            buffer_bytes: 0,
        }
    }

    /// Current state.
    pub fn state(&self) -> ExchangeState {
        self.state
    }

    /// Bytes held by the send and receive buffers of the last exchange.
    pub fn buffer_bytes(&self) -> usize {
        self.buffer_bytes
    }

    /// Redistribute `store` according to `partition`.
    ///
    /// On error the engine moves to [`ExchangeState::Failed`] and stays there.
    pub fn exchange<P, T, const D: usize>(
        &mut self,
        store: &mut ParticleStore<P, D>,
        partition: &DomainPartition<D>,
        transport: &mut T,
    ) -> Result<ExchangeReport>
    where
        P: Particle<D>,
        T: Transport + ?Sized,
    {
        if self.state != ExchangeState::Idle {
            return Err(Error::Poisoned);
        }
        match self.run(store, partition, transport) {
            Ok(report) => {
                self.state = ExchangeState::Idle;
                Ok(report)
            }
            Err(e) => {
                self.state = ExchangeState::Failed;
                Err(e)
            }
        }
    }

    fn run<P, T, const D: usize>(
        &mut self,
        store: &mut ParticleStore<P, D>,
        partition: &DomainPartition<D>,
        transport: &mut T,
    ) -> Result<ExchangeReport>
    where
        P: Particle<D>,
        T: Transport + ?Sized,
    {
        let rank = transport.rank();
        let nproc = transport.size();

        if partition.len() != nproc {
            let reason = format!(
                "partition has {} boxes for a group of {} processes",
                partition.len(),
                nproc
            );
            transport.abort(&reason);
            return Err(Error::FatalConfiguration(reason));
        }
        if let Some(err) = find_outside_root(store.as_slice(), partition.root()) {
            let reason = format!("rank {}: {}", rank, err);
            tracing::error!("{}", reason);
            transport.abort(&reason);
            return Err(Error::FatalConfiguration(reason));
        }

        // Classification.
        let router = partition.router();
        let dest: Vec<usize> = store
            .as_slice()
            .par_iter()
            .map(|p| router.route(&p.position()))
            .collect();

        let mut send_counts = vec![0u64; nproc];
        for &d in &dest {
            if d != rank {
                send_counts[d] += 1;
            }
        }
        let send_offsets = prefix_offsets(&send_counts);
        let total_send = send_offsets[nproc];

        let mut send_buf: Vec<P> = vec![P::zeroed(); total_send];
        let mut fill = send_offsets.clone();
        let mut kept = 0;
        {
            let particles = store.as_mut_slice();
            for (i, &d) in dest.iter().enumerate() {
                if d == rank {
                    particles[kept] = particles[i];
                    kept += 1;
                } else {
                    send_buf[fill[d]] = particles[i];
                    fill[d] += 1;
                }
            }
        }
        store.truncate(kept);
        self.state = ExchangeState::Classified;

        // Count exchange.
        let recv_counts = transport.exchange_counts(&send_counts)?;
        if recv_counts[rank] != 0 {
            return Err(Error::Capacity(format!(
                "rank {} was told to receive {} particles from itself",
                rank, recv_counts[rank]
            )));
        }
        let recv_offsets = prefix_offsets(&recv_counts);
        let total_recv = recv_offsets[nproc];
        let mut recv_buf: Vec<P> = vec![P::zeroed(); total_recv];
        self.buffer_bytes = (total_send + total_recv) * size_of::<P>();
        self.state = ExchangeState::CountsExchanged;

        tracing::debug!(
            "rank {}: keeping {}, sending {}, receiving {}",
            rank,
            kept,
            total_send,
            total_recv
        );

        // Ring transfer.
        let send_bytes: &[u8] = bytemuck::cast_slice(&send_buf);
        let mut sends: Vec<Request> = Vec::new();
        let mut recvs: Vec<(usize, Request)> = Vec::new();
        for step in 1..nproc {
            let to = (rank + step) % nproc;
            let from = (rank + nproc - step) % nproc;
            if send_counts[to] > 0 {
                let range = byte_range::<P>(send_offsets[to], send_offsets[to + 1]);
                sends.push(transport.send_async(to, ring_tag(rank, to), &send_bytes[range])?);
            }
            if recv_counts[from] > 0 {
                let len = (recv_offsets[from + 1] - recv_offsets[from]) * size_of::<P>();
                recvs.push((from, transport.recv_async(from, ring_tag(rank, from), len)?));
            }
        }
        self.state = ExchangeState::Transferring;

        transport.wait_all(&sends)?;
        let recv_requests: Vec<Request> = recvs.iter().map(|&(_, req)| req).collect();
        let completions = transport.wait_all(&recv_requests)?;

        for ((from, _), completion) in recvs.iter().zip(completions) {
            let bytes = match completion {
                Completion::Received(bytes) => bytes,
                Completion::Sent => return Err(TransportError::UnexpectedCompletion("send").into()),
            };
            let slot: &mut [u8] =
                bytemuck::cast_slice_mut(&mut recv_buf[recv_offsets[*from]..recv_offsets[*from + 1]]);
            if slot.len() != bytes.len() {
                return Err(TransportError::LengthMismatch {
                    peer: *from,
                    tag: ring_tag(rank, *from),
                    expected: slot.len(),
                    actual: bytes.len(),
                }
                .into());
            }
            slot.copy_from_slice(&bytes);
        }

        // Compaction.
        let grew_capacity = store.append(&recv_buf);
        if grew_capacity {
            tracing::warn!(
                "rank {}: store reallocated to hold {} particles; reserve policy was not enough",
                rank,
                store.len()
            );
        }
        self.state = ExchangeState::Compacted;

        Ok(ExchangeReport {
            kept,
            sent: total_send,
            received: total_recv,
            send_counts,
            recv_counts,
            grew_capacity,
        })
    }
}

/// `offsets[i] = counts[0] + ... + counts[i-1]`, with the total appended.
fn prefix_offsets(counts: &[u64]) -> Vec<usize> {
    let mut offsets = Vec::with_capacity(counts.len() + 1);
    let mut acc = 0usize;
    offsets.push(0);
    for &c in counts {
        acc += c as usize;
        offsets.push(acc);
    }
    offsets
}

fn byte_range<P>(first: usize, last: usize) -> std::ops::Range<usize> {
    first * size_of::<P>()..last * size_of::<P>()
}

/// Both ends of a ring transfer derive the same tag.
fn ring_tag(rank: usize, partner: usize) -> u32 {
    rank.min(partner) as u32
}

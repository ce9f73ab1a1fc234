//! Process-group messaging.
//!
//! [`Transport`] is the narrow seam between the exchange protocol and the
//! interconnect: non-blocking point-to-point sends and receives completed by
//! `wait_all`, a handful of collectives, and a group-wide abort.
//!
//! [`LocalGroup`] provides an in-process implementation where every rank is
//! an OS thread and every rank owns one mailbox (an `mpsc` channel).
//! Point-to-point messages are matched MPI-style on `(source, tag)` in FIFO
//! order; collectives travel in their own sequence-numbered envelopes so they
//! never match a point-to-point receive.

use std::collections::{HashMap, VecDeque};
use std::sync::mpsc::{self, Receiver, Sender};

use crate::error::TransportError;

type TResult<T> = std::result::Result<T, TransportError>;

/// Handle of an outstanding non-blocking operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Request(u64);

/// Outcome of one request passed to [`Transport::wait_all`].
#[derive(Debug, Clone, PartialEq)]
pub enum Completion {
    /// A send finished; its buffer may be reused.
    Sent,
    /// A receive finished with this payload.
    Received(Vec<u8>),
}

/// Reduction applied by [`Transport::all_reduce`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReduceOp {
    /// Sum over ranks.
    Sum,
    /// Maximum over ranks.
    Max,
    /// Minimum over ranks.
    Min,
}

impl ReduceOp {
    fn fold(self, values: impl Iterator<Item = f64>) -> f64 {
        match self {
            ReduceOp::Sum => values.sum(),
            ReduceOp::Max => values.fold(f64::NEG_INFINITY, f64::max),
            ReduceOp::Min => values.fold(f64::INFINITY, f64::min),
        }
    }
}

/// Messaging capabilities the redistribution layer needs from a process group.
///
/// Collective calls must be made by every rank in the same order.
pub trait Transport: Send {
    /// This process's rank in `0..size()`.
    fn rank(&self) -> usize;

    /// Number of processes in the group.
    fn size(&self) -> usize;

    /// Post a send of `data` to `dest`. Never blocks.
    fn send_async(&mut self, dest: usize, tag: u32, data: &[u8]) -> TResult<Request>;

    /// Post a receive of exactly `len` bytes from `source`. Never blocks.
    fn recv_async(&mut self, source: usize, tag: u32, len: usize) -> TResult<Request>;

    /// Block until every request completes. Completions are returned in
    /// request order.
    fn wait_all(&mut self, requests: &[Request]) -> TResult<Vec<Completion>>;

    /// All-to-all of one count per rank: entry `r` of `counts` goes to rank
    /// `r`, entry `s` of the result came from rank `s`.
    fn exchange_counts(&mut self, counts: &[u64]) -> TResult<Vec<u64>>;

    /// Reduce one value over the group; every rank receives the result.
    fn all_reduce(&mut self, value: f64, op: ReduceOp) -> TResult<f64>;

    /// Gather one byte string from every rank onto every rank, in rank order.
    fn all_gather(&mut self, data: &[u8]) -> TResult<Vec<Vec<u8>>>;

    /// Tear down the whole group: every peer blocked in (or later entering)
    /// a transport call fails with [`TransportError::Aborted`].
    fn abort(&mut self, reason: &str);

    /// Exact integer sum over the group.
    fn sum_u64(&mut self, value: u64) -> TResult<u64> {
        let parts = self.all_gather(&value.to_le_bytes())?;
        parts.iter().map(|bytes| decode_u64(bytes)).sum()
    }
}

fn decode_u64(bytes: &[u8]) -> TResult<u64> {
    let arr: [u8; 8] = bytes.try_into().map_err(|_| {
        TransportError::Disconnected(format!("malformed 8-byte word of {} bytes", bytes.len()))
    })?;
    Ok(u64::from_le_bytes(arr))
}

fn decode_f64(bytes: &[u8]) -> TResult<f64> {
    decode_u64(bytes).map(f64::from_bits)
}

#[derive(Debug)]
enum Envelope {
    Message { from: usize, tag: u32, payload: Vec<u8> },
    Collective { from: usize, seq: u64, payload: Vec<u8> },
    Abort { from: usize, reason: String },
}

#[derive(Debug)]
enum Pending {
    Send,
    Recv { source: usize, tag: u32, len: usize },
}

/// Constructor for a group of [`LocalTransport`] endpoints.
pub struct LocalGroup;

impl LocalGroup {
    /// Create `size` connected endpoints; endpoint `r` has rank `r`.
    ///
    /// Move each endpoint to its own thread.
    #[allow(clippy::new_ret_no_self)]
    pub fn new(size: usize) -> Vec<LocalTransport> {
        let (senders, inboxes): (Vec<_>, Vec<_>) = (0..size).map(|_| mpsc::channel()).unzip();
        inboxes
            .into_iter()
            .enumerate()
            .map(|(rank, inbox)| LocalTransport {
                rank,
                peers: senders.clone(),
                inbox,
                stash: VecDeque::new(),
                collectives: HashMap::new(),
                pending: HashMap::new(),
                next_request: 0,
                collective_seq: 0,
                aborted: None,
            })
            .collect()
    }
}

/// One rank's endpoint of an in-process group.
pub struct LocalTransport {
    rank: usize,
    peers: Vec<Sender<Envelope>>,
    inbox: Receiver<Envelope>,
    /// Point-to-point messages that arrived before their receive was waited on.
    stash: VecDeque<(usize, u32, Vec<u8>)>,
    /// Collective payloads keyed by (source, sequence).
    collectives: HashMap<(usize, u64), Vec<u8>>,
    pending: HashMap<u64, Pending>,
    next_request: u64,
    collective_seq: u64,
    aborted: Option<(usize, String)>,
}

/// Clonable handle that aborts a [`LocalGroup`] from outside its endpoint,
/// e.g. after the owning thread panicked.
#[derive(Clone)]
pub struct AbortHandle {
    rank: usize,
    peers: Vec<Sender<Envelope>>,
}

impl AbortHandle {
    /// Broadcast an abort to every rank of the group.
    pub fn abort(&self, reason: &str) {
        broadcast_abort(self.rank, &self.peers, reason);
    }
}

fn broadcast_abort(rank: usize, peers: &[Sender<Envelope>], reason: &str) {
    for (r, peer) in peers.iter().enumerate() {
        if r != rank {
            // A peer that already exited cannot be blocked on us.
            let _ = peer.send(Envelope::Abort {
                from: rank,
                reason: reason.to_string(),
            });
        }
    }
}

impl LocalTransport {
    /// Handle that can abort this group after the endpoint itself is gone.
    pub fn abort_handle(&self) -> AbortHandle {
        AbortHandle {
            rank: self.rank,
            peers: self.peers.clone(),
        }
    }

    fn check_rank(&self, rank: usize) -> TResult<()> {
        if rank < self.peers.len() {
            Ok(())
        } else {
            Err(TransportError::InvalidRank {
                rank,
                size: self.peers.len(),
            })
        }
    }

    fn check_aborted(&self) -> TResult<()> {
        match &self.aborted {
            Some((rank, reason)) => Err(TransportError::Aborted {
                rank: *rank,
                reason: reason.clone(),
            }),
            None => Ok(()),
        }
    }

    fn issue(&mut self, pending: Pending) -> Request {
        let id = self.next_request;
        self.next_request += 1;
        self.pending.insert(id, pending);
        Request(id)
    }

    fn deliver(&mut self, dest: usize, envelope: Envelope) -> TResult<()> {
        if self.peers[dest].send(envelope).is_ok() {
            return Ok(());
        }
        // A rank that aborts and exits leaves its abort in our mailbox;
        // report that rather than the hang-up.
        while let Ok(envelope) = self.inbox.try_recv() {
            self.file(envelope)?;
        }
        Err(TransportError::Disconnected(format!(
            "rank {} has left the group",
            dest
        )))
    }

    fn file(&mut self, envelope: Envelope) -> TResult<()> {
        match envelope {
            Envelope::Message { from, tag, payload } => self.stash.push_back((from, tag, payload)),
            Envelope::Collective { from, seq, payload } => {
                self.collectives.insert((from, seq), payload);
            }
            Envelope::Abort { from, reason } => {
                self.aborted = Some((from, reason));
                self.check_aborted()?;
            }
        }
        Ok(())
    }

    /// Block for the next envelope, filing anything that is not an abort.
    fn pump(&mut self) -> TResult<()> {
        let envelope = self
            .inbox
            .recv()
            .map_err(|_| TransportError::Disconnected("mailbox closed".to_string()))?;
        self.file(envelope)
    }

    fn take_message(&mut self, source: usize, tag: u32) -> TResult<Vec<u8>> {
        loop {
            let found = self
                .stash
                .iter()
                .position(|(from, t, _)| *from == source && *t == tag);
            if let Some(pos) = found.and_then(|pos| self.stash.remove(pos)) {
                return Ok(pos.2);
            }
            self.pump()?;
        }
    }

    fn take_collective(&mut self, source: usize, seq: u64) -> TResult<Vec<u8>> {
        loop {
            if let Some(payload) = self.collectives.remove(&(source, seq)) {
                return Ok(payload);
            }
            self.pump()?;
        }
    }

    /// One collective round: rank `r` receives `payload_for(r)` from every rank.
    fn collective(&mut self, payload_for: impl Fn(usize) -> Vec<u8>) -> TResult<Vec<Vec<u8>>> {
        self.check_aborted()?;
        let seq = self.collective_seq;
        self.collective_seq += 1;
        for dest in 0..self.peers.len() {
            self.deliver(
                dest,
                Envelope::Collective {
                    from: self.rank,
                    seq,
                    payload: payload_for(dest),
                },
            )?;
        }
        (0..self.peers.len())
            .map(|source| self.take_collective(source, seq))
            .collect()
    }
}

impl Transport for LocalTransport {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.peers.len()
    }

    fn send_async(&mut self, dest: usize, tag: u32, data: &[u8]) -> TResult<Request> {
        self.check_aborted()?;
        self.check_rank(dest)?;
        self.deliver(
            dest,
            Envelope::Message {
                from: self.rank,
                tag,
                payload: data.to_vec(),
            },
        )?;
        Ok(self.issue(Pending::Send))
    }

    fn recv_async(&mut self, source: usize, tag: u32, len: usize) -> TResult<Request> {
        self.check_aborted()?;
        self.check_rank(source)?;
        Ok(self.issue(Pending::Recv { source, tag, len }))
    }

    fn wait_all(&mut self, requests: &[Request]) -> TResult<Vec<Completion>> {
        self.check_aborted()?;
        let mut completions = Vec::with_capacity(requests.len());
        for &Request(id) in requests {
            match self.pending.remove(&id) {
                None => return Err(TransportError::UnknownRequest(id)),
                Some(Pending::Send) => completions.push(Completion::Sent),
                Some(Pending::Recv { source, tag, len }) => {
                    let payload = self.take_message(source, tag)?;
                    if payload.len() != len {
                        return Err(TransportError::LengthMismatch {
                            peer: source,
                            tag,
                            expected: len,
                            actual: payload.len(),
                        });
                    }
                    completions.push(Completion::Received(payload));
                }
            }
        }
        Ok(completions)
    }

    fn exchange_counts(&mut self, counts: &[u64]) -> TResult<Vec<u64>> {
        if counts.len() != self.size() {
            return Err(TransportError::CountsLength {
                expected: self.size(),
                actual: counts.len(),
            });
        }
        let parts = self.collective(|dest| counts[dest].to_le_bytes().to_vec())?;
        parts.iter().map(|bytes| decode_u64(bytes)).collect()
    }

    fn all_reduce(&mut self, value: f64, op: ReduceOp) -> TResult<f64> {
        let parts = self.all_gather(&value.to_bits().to_le_bytes())?;
        let values = parts
            .iter()
            .map(|bytes| decode_f64(bytes))
            .collect::<TResult<Vec<f64>>>()?;
        Ok(op.fold(values.into_iter()))
    }

    fn all_gather(&mut self, data: &[u8]) -> TResult<Vec<Vec<u8>>> {
        self.collective(|_| data.to_vec())
    }

    fn abort(&mut self, reason: &str) {
        tracing::error!("rank {} aborting process group: {}", self.rank, reason);
        broadcast_abort(self.rank, &self.peers, reason);
        self.aborted = Some((self.rank, reason.to_string()));
    }
}

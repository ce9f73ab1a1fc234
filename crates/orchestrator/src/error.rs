//! Error types for the redistribution protocol and its driver.

use particle_kernel::KernelError;
use thiserror::Error;

/// Result alias used throughout the orchestrator.
pub type Result<T> = std::result::Result<T, Error>;

/// Failures of the process-group transport.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum TransportError {
    /// A peer rank outside `0..size`.
    #[error("rank {rank} is not a member of a group of {size}")]
    InvalidRank {
        /// Offending rank.
        rank: usize,
        /// Group size.
        size: usize,
    },

    /// A received message whose length differs from the posted receive.
    #[error("message from rank {peer} (tag {tag}) has {actual} bytes, expected {expected}")]
    LengthMismatch {
        /// Sending rank.
        peer: usize,
        /// Message tag.
        tag: u32,
        /// Posted length.
        expected: usize,
        /// Delivered length.
        actual: usize,
    },

    /// A per-destination count vector whose length is not the group size.
    #[error("count vector has {actual} entries for a group of {expected}")]
    CountsLength {
        /// Group size.
        expected: usize,
        /// Entries supplied.
        actual: usize,
    },

    /// A peer hung up before the operation could complete.
    #[error("transport disconnected: {0}")]
    Disconnected(String),

    /// The group was aborted by a rank after an unrecoverable error.
    #[error("group aborted by rank {rank}: {reason}")]
    Aborted {
        /// Rank that called abort.
        rank: usize,
        /// Reason it gave.
        reason: String,
    },

    /// `wait_all` on a request id this endpoint never issued (or already completed).
    #[error("unknown request id {0}")]
    UnknownRequest(u64),

    /// A completion of the wrong kind for the request it answers.
    #[error("request completed as {0}, which it was not posted for")]
    UnexpectedCompletion(&'static str),
}

/// Errors surfaced by [`crate::ParticleSystem`] and the exchange engine.
#[derive(Debug, Error)]
pub enum Error {
    /// A particle left the root domain along an open axis, or the partition
    /// does not match the process group. The group has been aborted.
    #[error("fatal configuration error: {0}")]
    FatalConfiguration(String),

    /// Transport failure.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Storage could not hold the required count.
    #[error("capacity error: {0}")]
    Capacity(String),

    /// Operation attempted before `configure`.
    #[error("particle system is not configured")]
    NotConfigured,

    /// `configure` called twice.
    #[error("particle system is already configured")]
    AlreadyConfigured,

    /// A set-once parameter was set again.
    #[error("{0} can only be set once, before first use")]
    AlreadySet(&'static str),

    /// A previous protocol error left the system unusable.
    #[error("particle system is poisoned by an earlier failure")]
    Poisoned,

    /// Invalid configuration.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// A post-exchange check found lost, duplicated or misplaced particles.
    #[error("redistribution invariant violated: {0}")]
    InvariantViolated(String),

    /// Malformed or inconsistent checkpoint.
    #[error("checkpoint error: {0}")]
    Checkpoint(String),

    /// Filesystem error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON encode/decode error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Process-local error.
    #[error(transparent)]
    Kernel(#[from] KernelError),
}

impl Error {
    /// Errors after which the process group can no longer be trusted.
    pub fn is_protocol_failure(&self) -> bool {
        matches!(
            self,
            Error::FatalConfiguration(_)
                | Error::Transport(_)
                | Error::Capacity(_)
                | Error::InvariantViolated(_)
        )
    }
}

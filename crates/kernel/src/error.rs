use thiserror::Error;

/// Result alias for process-local particle operations.
pub type Result<T> = std::result::Result<T, KernelError>;

/// Errors raised by the process-local particle layer.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum KernelError {
    /// Indexed access beyond the current local count.
    #[error("particle index {index} out of range for local count {len}")]
    Index {
        /// Requested index.
        index: usize,
        /// Local count at the time of access.
        len: usize,
    },

    /// A particle position lies outside the root domain after wrapping.
    #[error("particle {index} at {position:?} lies outside the root domain {low:?}..{high:?}")]
    OutsideRootDomain {
        /// Local index of the offending particle.
        index: usize,
        /// Its position.
        position: Vec<f64>,
        /// Root domain lower corner.
        low: Vec<f64>,
        /// Root domain upper corner.
        high: Vec<f64>,
    },

    /// A partition that does not tile its root domain.
    #[error("invalid partition: {0}")]
    InvalidPartition(String),

    /// Raw bytes that do not hold a whole number of the requested records.
    ///
    /// `expected` is `None` when `len` records would not fit in `usize` bytes.
    #[error("{actual} bytes cannot hold {len} particles (expected {expected:?} bytes)")]
    ByteLength {
        /// Requested record count.
        len: usize,
        /// Byte length `len` records need.
        expected: Option<usize>,
        /// Byte length supplied.
        actual: usize,
    },
}

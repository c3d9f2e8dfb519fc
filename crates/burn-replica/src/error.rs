/// Errors raised by replicated values and variables.
///
/// Every error is a contract violation reported synchronously at the point of
/// misuse. Nothing in this crate retries; the error is handed back to the caller
/// unchanged. The variants are `Clone` so a failed merge can be delivered to
/// every replica waiting on it.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ReplicaError {
    /// The API was used in a way its contract does not allow, e.g. reading a
    /// handle outside of any replica, or mixing two strategies.
    #[error("Usage error: {0}")]
    Usage(String),
    /// Per-replica structures handed to `regroup` do not line up.
    #[error("Structural mismatch: {0}")]
    StructuralMismatch(String),
    /// The value cannot perform the requested operation in the current context.
    #[error("Capability error: {0}")]
    Capability(String),
    /// MEAN aggregation of divergent values would lose precision on a
    /// non floating point variable.
    #[error("Precision guard: {0}")]
    PrecisionGuard(String),
    /// An output can never complete: its promise was dropped unfulfilled, or
    /// computing it panicked.
    #[error("Abandoned output: {0}")]
    Abandoned(String),
    /// A replica failed while its peers were waiting at a rendezvous.
    #[error("Replica {replica} aborted: {reason}")]
    Aborted {
        /// Id of the replica that failed first.
        replica: usize,
        /// Error reported by that replica.
        reason: String,
    },
}

impl ReplicaError {
    pub(crate) fn usage(msg: impl Into<String>) -> Self {
        Self::Usage(msg.into())
    }

    pub(crate) fn mismatch(msg: impl Into<String>) -> Self {
        Self::StructuralMismatch(msg.into())
    }

    pub(crate) fn capability(msg: impl Into<String>) -> Self {
        Self::Capability(msg.into())
    }
}

/// Result type used throughout this crate.
pub type Result<T> = core::result::Result<T, ReplicaError>;

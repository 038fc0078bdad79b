//! Error types for routing-table operations

use thiserror::Error;

/// Recoverable admission failures
///
/// All variants are expected outcomes under load; none leave the table in
/// an inconsistent state. Lookups cannot fail.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TableError {
    /// The candidate's measured latency exceeds the table's threshold
    #[error("peer rejected; latency too high")]
    PeerRejectedHighLatency,

    /// The target bucket is full and no eviction policy accepted the candidate
    #[error("peer rejected; insufficient capacity")]
    PeerRejectedNoCapacity,

    /// The diversity filter refused the candidate
    #[error("peer rejected by the diversity filter: {0}")]
    DiversityRejected(String),
}

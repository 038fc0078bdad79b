//! # kadrtt-kbucket
//!
//! An RTT-aware Kademlia routing table. On top of the classical k-bucket
//! structure this crate adds:
//!
//! - Per-bucket parameter optimization: every bucket derives its own
//!   capacity `k`, lookup parallelism `alpha`, and response quorum `beta`
//!   from the observed admission rate and entry-exchange probability,
//!   through closed forms evaluated with the Lambert W function
//! - RTT-aware admission: a full bucket accepts a candidate only when the
//!   swap lowers the latency profile (single-entry buckets) or reduces the
//!   variance of consecutive pairwise XOR distances between members
//! - Hybrid lookup ordering: nearest-peer queries promote candidates that
//!   are both near (within twice the minimum distance) and fast (no slower
//!   than the nearest candidate)
//!
//! The table is passive and synchronous: no network I/O, no background
//! tasks, one blocking reader-writer lock. Latency measurement and peer
//! diversity policy are pluggable capabilities supplied by the host.
//!
//! # Example
//!
//! ```
//! use kadrtt_kbucket::{DhtKey, EwmaLatencyBook, PeerId, RoutingTable};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! let metrics = Arc::new(EwmaLatencyBook::new());
//! let table = RoutingTable::new(
//!     20,
//!     DhtKey::from_bytes([0u8; 32]),
//!     Duration::from_millis(500),
//!     metrics.clone(),
//!     Duration::from_secs(3600),
//!     None,
//! );
//!
//! let peer = PeerId::random();
//! metrics.record_latency(&peer, Duration::from_millis(40));
//! assert_eq!(table.try_add_peer(peer, true, true, Duration::ZERO), Ok(true));
//!
//! let nearest = table.nearest_peers(&DhtKey::from_peer_id(&peer), 1);
//! assert_eq!(nearest.first(), Some(&peer));
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod bucket;
pub mod diversity;
pub mod error;
pub mod keyspace;
pub mod metrics;
pub mod peer;
pub mod table;

mod lambertw;
mod optimizer;
mod sorting;
mod variance;

// Re-exports for convenience
pub use bucket::{Bucket, BucketParams, DEFAULT_ALPHA};
pub use diversity::{CplDiversityStats, DiversityFilter};
pub use error::TableError;
pub use keyspace::{DhtKey, PeerId};
pub use metrics::{EwmaLatencyBook, LatencyMetrics, DEFAULT_LATENCY_EWMA_SMOOTHING};
pub use peer::PeerRecord;
pub use table::{
    PeerCallback, RoutingTable, TableStats, DEFAULT_RTT_INTERVAL, MAX_CPL_FOR_REFRESH,
};

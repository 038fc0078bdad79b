//! Peer diversity filtering capability
//!
//! Hosts may cap how many peers from any one network region enter the
//! table. The filter is pluggable: the table consults it during admission
//! and informs it of removals, but the grouping policy (IP prefixes, ASNs,
//! ...) is entirely the filter's concern.

use crate::keyspace::PeerId;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Per-CPL view of which peers each diversity group contributed
///
/// Opaque to the table; produced by the filter and passed through to the
/// host unchanged.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct CplDiversityStats {
    /// Common prefix length this entry describes
    pub cpl: u32,
    /// Peers admitted at this CPL, keyed by the filter's group label
    pub peers_per_group: HashMap<String, Vec<PeerId>>,
}

/// Externally synchronized admission gate on peer diversity
pub trait DiversityFilter: Send + Sync {
    /// Ask the filter to account for `peer`; `false` rejects the admission
    fn try_add(&self, peer: &PeerId) -> bool;

    /// Release the filter's accounting for `peer`
    fn remove(&self, peer: &PeerId);

    /// Current per-CPL grouping snapshot
    fn diversity_stats(&self) -> Vec<CplDiversityStats>;

    /// Human-readable reason attached to rejections
    fn rejection_reason(&self) -> String {
        "insufficient network diversity".to_string()
    }
}

//! ID-variance evaluation for bucket membership decisions
//!
//! The eviction policy prefers bucket members whose routing identifiers
//! are evenly spread: lookups then take uniform hops regardless of the
//! target. Spread is measured as the variance of XOR distances between
//! consecutive members once the bucket is sorted by routing identifier.
//!
//! Distances are 256-bit quantities, so all arithmetic runs on `BigUint`;
//! the mean uses integer division by the member count, matching the
//! model's definition.

use crate::keyspace::{DhtKey, PeerId};
use crate::peer::PeerRecord;
use num_bigint::BigUint;
use std::time::Duration;

/// Variance of consecutive pairwise distances over `keys`
///
/// Sorts ascending, sums the `n-1` consecutive XOR distances into `S`,
/// takes `mu = S / n`, and returns `sum((d_i - mu)^2)`. Collections with
/// fewer than two keys have no pairs and yield zero.
fn consecutive_variance(mut keys: Vec<DhtKey>) -> BigUint {
    let n = keys.len();
    if n < 2 {
        return BigUint::ZERO;
    }
    keys.sort_unstable();

    let distances: Vec<BigUint> = keys.windows(2).map(|w| w[0].distance(&w[1])).collect();
    let sum: BigUint = distances.iter().sum();
    let mean = sum / BigUint::from(n);

    let mut variance = BigUint::ZERO;
    for dist in &distances {
        let deviation = if *dist >= mean {
            dist - &mean
        } else {
            &mean - dist
        };
        variance += &deviation * &deviation;
    }
    variance
}

/// Variance of the given records as they stand
pub(crate) fn variance_of(records: &[PeerRecord]) -> BigUint {
    consecutive_variance(records.iter().map(|r| r.dht_id).collect())
}

/// Variance with one member hypothetically removed
pub(crate) fn variance_without(records: &[PeerRecord], excluded: &PeerId) -> BigUint {
    consecutive_variance(
        records
            .iter()
            .filter(|r| &r.peer != excluded)
            .map(|r| r.dht_id)
            .collect(),
    )
}

/// Variance with `old` hypothetically replaced by `candidate`
pub(crate) fn variance_after_swap(
    records: &[PeerRecord],
    old: &PeerId,
    candidate: &DhtKey,
) -> BigUint {
    let mut keys: Vec<DhtKey> = records
        .iter()
        .filter(|r| &r.peer != old)
        .map(|r| r.dht_id)
        .collect();
    keys.push(*candidate);
    consecutive_variance(keys)
}

/// Outcome of the swap arbitration: which member to displace
#[derive(Debug)]
pub(crate) struct SwapDecision {
    /// Member whose removal minimizes the post-swap variance
    pub evict: PeerId,
    /// The variance the bucket will have after the swap
    pub variance: BigUint,
}

/// Decide whether admitting `candidate` in place of an existing member
/// lowers the bucket's ID variance
///
/// Only members whose RTT is at least the candidate's are displaceable:
/// the swap must never worsen the bucket's latency profile. Among those,
/// the member whose replacement yields the smallest variance is chosen,
/// and the swap is accepted only if that variance improves on the current
/// one.
pub(crate) fn arbitrate_swap(
    records: &[PeerRecord],
    candidate: &DhtKey,
    candidate_rtt: Duration,
) -> Option<SwapDecision> {
    let current = variance_of(records);

    let mut best: Option<SwapDecision> = None;
    for record in records.iter().filter(|r| r.rtt >= candidate_rtt) {
        let swapped = variance_after_swap(records, &record.peer, candidate);
        match &best {
            Some(decision) if decision.variance <= swapped => {}
            _ => {
                best = Some(SwapDecision {
                    evict: record.peer,
                    variance: swapped,
                });
            }
        }
    }

    best.filter(|decision| decision.variance < current)
}

/// Rank members by the variance remaining after their removal, ascending
///
/// The head of the list holds the members whose presence distorts the
/// spread the most; shrinking a bucket evicts from the head.
pub(crate) fn rank_for_eviction(records: &[PeerRecord]) -> Vec<(PeerId, BigUint)> {
    let mut ranked: Vec<(PeerId, BigUint)> = records
        .iter()
        .map(|r| (r.peer, variance_without(records, &r.peer)))
        .collect();
    ranked.sort_by(|a, b| a.1.cmp(&b.1));
    ranked
}

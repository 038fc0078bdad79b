//! K-buckets with per-bucket lookup parameters
//!
//! A bucket is an ordered collection of [`PeerRecord`]s (most recently
//! pushed at the head) together with the per-bucket parameters the
//! optimizer maintains: the capacity `k`, the lookup parallelism `alpha`,
//! the response quorum `beta`, and the query-probability intermediates
//! `p_query` / `p_not` the alpha derivation chains through.

use crate::keyspace::{DhtKey, PeerId};
use crate::peer::PeerRecord;
use num_bigint::BigUint;

/// Default lookup parallelism for a freshly created bucket
///
/// Standard Kademlia dispatches 3 concurrent queries per round. The
/// optimizer replaces this with the derived value on the next
/// recalculation window.
pub const DEFAULT_ALPHA: usize = 3;

/// Snapshot of a bucket's optimized parameters
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BucketParams {
    /// Bucket capacity
    pub k: usize,
    /// Lookup parallelism
    pub alpha: usize,
    /// Response quorum
    pub beta: usize,
}

/// A k-bucket storing peers at a specific distance range
///
/// Unlike a classical Kademlia bucket the capacity is not a table-wide
/// constant: every bucket carries its own `k`, recomputed from observed
/// arrival and exchange rates.
#[derive(Clone, Debug)]
pub struct Bucket {
    /// Records, most recently pushed first
    records: Vec<PeerRecord>,
    /// Bucket capacity
    pub(crate) k: usize,
    /// Lookup parallelism
    pub(crate) alpha: usize,
    /// Response quorum
    pub(crate) beta: usize,
    /// Probability that a lookup queries this bucket
    pub(crate) p_query: f64,
    /// Complement of `p_query`, chained into the next bucket's derivation
    pub(crate) p_not: f64,
    /// Cached variance of consecutive pairwise distances
    pub(crate) id_variance: BigUint,
}

impl Bucket {
    /// Create an empty bucket with capacity `k`
    #[must_use]
    pub fn new(k: usize) -> Self {
        let k = k.max(1);
        Self {
            records: Vec::with_capacity(k),
            k,
            alpha: DEFAULT_ALPHA,
            beta: k,
            p_query: 1.0 / k as f64,
            p_not: 1.0 - 1.0 / k as f64,
            id_variance: BigUint::ZERO,
        }
    }

    /// Current optimized parameters
    #[must_use]
    pub fn params(&self) -> BucketParams {
        BucketParams {
            k: self.k,
            alpha: self.alpha,
            beta: self.beta,
        }
    }

    /// Bucket capacity
    #[must_use]
    pub fn k(&self) -> usize {
        self.k
    }

    /// Lookup parallelism
    #[must_use]
    pub fn alpha(&self) -> usize {
        self.alpha
    }

    /// Response quorum
    #[must_use]
    pub fn beta(&self) -> usize {
        self.beta
    }

    /// Number of records in the bucket
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether the bucket holds no records
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// All records in insertion order (most recently pushed first)
    #[must_use]
    pub fn peers(&self) -> &[PeerRecord] {
        &self.records
    }

    /// Insert a record at the head
    pub fn push_front(&mut self, record: PeerRecord) {
        self.records.insert(0, record);
    }

    /// Look up a record by peer identifier
    #[must_use]
    pub fn get(&self, peer: &PeerId) -> Option<&PeerRecord> {
        self.records.iter().find(|r| &r.peer == peer)
    }

    /// Look up a record for in-place mutation
    pub fn get_mut(&mut self, peer: &PeerId) -> Option<&mut PeerRecord> {
        self.records.iter_mut().find(|r| &r.peer == peer)
    }

    /// Remove a record by peer identifier
    ///
    /// Returns whether a record was removed.
    pub fn remove(&mut self, peer: &PeerId) -> bool {
        if let Some(pos) = self.records.iter().position(|r| &r.peer == peer) {
            self.records.remove(pos);
            true
        } else {
            false
        }
    }

    /// Select the minimum record under a caller-supplied ordering
    ///
    /// `less(a, b)` returns whether `a` orders before `b`. With a
    /// predicate-style closure that ignores its second argument this
    /// selects a record for which the predicate holds, if any.
    #[must_use]
    pub fn min_by<F>(&self, less: F) -> Option<&PeerRecord>
    where
        F: Fn(&PeerRecord, &PeerRecord) -> bool,
    {
        let mut iter = self.records.iter();
        let mut min = iter.next()?;
        for rec in iter {
            if less(rec, min) {
                min = rec;
            }
        }
        Some(min)
    }

    /// Apply a mutation to every record
    pub fn update_all_with<F>(&mut self, mut f: F)
    where
        F: FnMut(&mut PeerRecord),
    {
        for rec in &mut self.records {
            f(rec);
        }
    }

    /// Split off the peers that no longer belong in this bucket
    ///
    /// Keeps records whose CPL with `local` is exactly `cpl` and moves the
    /// rest (strictly greater CPL) into the returned bucket, preserving
    /// relative order. The new bucket starts with this bucket's parameters;
    /// the table re-optimizes it afterwards.
    pub fn split(&mut self, cpl: u32, local: &DhtKey) -> Bucket {
        let mut new_bucket = Bucket::new(self.k);
        let (keep, moved): (Vec<_>, Vec<_>) = self
            .records
            .drain(..)
            .partition(|r| local.common_prefix_len(&r.dht_id) <= cpl);
        self.records = keep;
        new_bucket.records = moved;
        new_bucket
    }

    /// Maximum CPL between `local` and any record in the bucket
    ///
    /// Returns 0 for an empty bucket.
    #[must_use]
    pub fn max_common_prefix(&self, local: &DhtKey) -> u32 {
        self.records
            .iter()
            .map(|r| local.common_prefix_len(&r.dht_id))
            .max()
            .unwrap_or(0)
    }
}

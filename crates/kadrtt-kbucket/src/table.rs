//! The RTT-aware routing table
//!
//! Orchestrates the bucket sequence, the global arrival/exchange counters
//! feeding the parameter optimizer, the admission and eviction policies,
//! and the hybrid lookup ordering. All table state sits behind a single
//! reader-writer lock; the CPL refresh bookkeeping has its own lock so an
//! external refresh scheduler never contends with admissions.
//!
//! Two modes share the data structure. In KadRTT mode (the default) the
//! per-bucket capacity `k` governs admission, a full bucket arbitrates
//! candidates through the RTT/variance policies, and lookups return the
//! hybrid ordering. In classical mode the table behaves like a plain
//! Kademlia k-bucket table: fixed capacity, replaceable-flag eviction,
//! distance-ordered lookups.

use crate::bucket::{Bucket, BucketParams};
use crate::diversity::{CplDiversityStats, DiversityFilter};
use crate::error::TableError;
use crate::keyspace::{DhtKey, PeerId};
use crate::metrics::LatencyMetrics;
use crate::optimizer;
use crate::peer::PeerRecord;
use crate::sorting::CandidatePool;
use crate::variance;
use num_bigint::BigUint;
use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::{Arc, Mutex, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, Instant};
use tokio::sync::watch;

/// Minimum interval between parameter recalculations
///
/// Arrival and exchange counters accumulate for at least this long before
/// the optimizer recomputes a bucket's `k`/`alpha`/`beta`.
pub const DEFAULT_RTT_INTERVAL: Duration = Duration::from_secs(10);

/// Highest CPL tracked by the refresh bookkeeping
///
/// Buckets deeper than this are too sparsely populated for scheduled
/// refreshes to matter.
pub const MAX_CPL_FOR_REFRESH: u32 = 15;

/// Notification sink invoked when a peer enters or leaves the table
///
/// Callbacks run while the table's write lock is held: they must return
/// quickly and must not call back into the table, or the calling thread
/// deadlocks.
pub type PeerCallback = Box<dyn Fn(PeerId) + Send + Sync>;

/// Aggregate counters exposed for diagnostics and tests
#[derive(Clone, Debug)]
pub struct TableStats {
    /// Total peers across all buckets
    pub peers: usize,
    /// Number of buckets currently unfolded
    pub buckets: usize,
    /// Admissions observed since the last recalculation
    pub num_arrive: u64,
    /// Entry exchanges observed since the last recalculation
    pub num_exchange: u64,
    /// STORE/admission arrival rate from the last recalculation
    pub arv_rate_store: f64,
    /// Entry-exchange probability from the last recalculation
    pub prob_exchange: f64,
    /// Current candidate pool size
    pub pool_size: usize,
}

/// Mutable table state guarded by the table lock
struct TableInner {
    buckets: Vec<Bucket>,
    kad_rtt: bool,
    pool_size: usize,
    arv_rate_store: f64,
    prob_exchange: f64,
    num_arrive: u64,
    num_exchange: u64,
    last_ex_time: Instant,
    rtt_interval: Duration,
}

impl TableInner {
    /// Recompute `k`, `beta`, `alpha` for the bucket at `idx`
    fn apply_opt_values(&mut self, idx: usize, bucket_size: usize) {
        let k = optimizer::k_opt(idx, self.arv_rate_store, self.prob_exchange, bucket_size);
        self.buckets[idx].k = k;

        let beta = optimizer::beta_opt(k, self.pool_size);
        self.buckets[idx].beta = beta;

        let prev = (idx > 0).then(|| {
            let prev_bucket = &self.buckets[idx - 1];
            (prev_bucket.p_not, prev_bucket.k)
        });
        let pool_size = self.pool_size;
        let alpha = optimizer::alpha_opt(&mut self.buckets[idx], prev, pool_size);
        self.buckets[idx].alpha = alpha;

        // The candidate pool tracks the configured bucket size.
        self.pool_size = bucket_size;

        tracing::debug!(bucket = idx, k, alpha, beta, "bucket parameters recomputed");
    }
}

/// RTT-aware Kademlia routing table
///
/// Construct with [`RoutingTable::new`], share behind an `Arc`, and drive
/// from the host's connection and query handlers. The table is passive:
/// it performs no I/O and spawns no tasks.
pub struct RoutingTable {
    /// Local routing identifier; bucket `i` holds peers at CPL `i`
    local: DhtKey,
    /// Configured bucket size; lower bound for every optimized `k`
    bucket_size: usize,
    /// Admission ceiling on the candidate's measured latency
    max_latency: Duration,
    /// Grace period before an unqueried peer counts as useless
    usefulness_grace_period: Duration,
    /// External latency oracle
    metrics: Arc<dyn LatencyMetrics>,
    /// Optional diversity gate
    diversity_filter: Option<Arc<dyn DiversityFilter>>,
    inner: RwLock<TableInner>,
    /// CPL -> last refresh instant, for the host's refresh scheduler
    cpl_refreshed_at: Mutex<HashMap<u32, Instant>>,
    peer_added: PeerCallback,
    peer_removed: PeerCallback,
    close_tx: watch::Sender<bool>,
}

impl RoutingTable {
    /// Create a routing table for `local`
    ///
    /// Starts in KadRTT mode with a single bucket whose parameters are
    /// already optimized for the default arrival-rate priors
    /// (`arv_rate_store = 0.01`, `prob_exchange = 1`).
    #[must_use]
    pub fn new(
        bucket_size: usize,
        local: DhtKey,
        max_latency: Duration,
        metrics: Arc<dyn LatencyMetrics>,
        usefulness_grace_period: Duration,
        diversity_filter: Option<Arc<dyn DiversityFilter>>,
    ) -> Self {
        let bucket_size = bucket_size.max(1);
        let (close_tx, _) = watch::channel(false);

        let mut inner = TableInner {
            buckets: vec![Bucket::new(bucket_size)],
            kad_rtt: true,
            pool_size: bucket_size,
            arv_rate_store: 0.01,
            prob_exchange: 1.0,
            num_arrive: 0,
            num_exchange: 0,
            last_ex_time: Instant::now(),
            rtt_interval: DEFAULT_RTT_INTERVAL,
        };
        inner.apply_opt_values(0, bucket_size);

        Self {
            local,
            bucket_size,
            max_latency,
            usefulness_grace_period,
            metrics,
            diversity_filter,
            inner: RwLock::new(inner),
            cpl_refreshed_at: Mutex::new(HashMap::new()),
            peer_added: Box::new(|_| {}),
            peer_removed: Box::new(|_| {}),
            close_tx,
        }
    }

    /// The local routing identifier
    #[must_use]
    pub fn local(&self) -> &DhtKey {
        &self.local
    }

    /// The configured bucket size
    #[must_use]
    pub fn bucket_size(&self) -> usize {
        self.bucket_size
    }

    /// Grace period before an unqueried peer is considered useless
    #[must_use]
    pub fn usefulness_grace_period(&self) -> Duration {
        self.usefulness_grace_period
    }

    /// Switch between KadRTT and classical eviction/lookup behavior
    pub fn set_kad_rtt(&self, enabled: bool) {
        self.write_inner().kad_rtt = enabled;
    }

    /// Override the minimum interval between parameter recalculations
    pub fn set_rtt_interval(&self, interval: Duration) {
        self.write_inner().rtt_interval = interval;
    }

    /// Replace the peer-added notification sink
    ///
    /// The callback runs with the write lock held; it must be fast and
    /// must not re-enter the table.
    pub fn set_peer_added_callback(&mut self, callback: PeerCallback) {
        self.peer_added = callback;
    }

    /// Replace the peer-removed notification sink
    ///
    /// Same locking caveat as [`RoutingTable::set_peer_added_callback`].
    pub fn set_peer_removed_callback(&mut self, callback: PeerCallback) {
        self.peer_removed = callback;
    }

    /// Try to add a peer to the table
    ///
    /// Returns `Ok(true)` when the peer was newly admitted, `Ok(false)`
    /// when it was already present (in which case a first query marks the
    /// record useful), and an error when the latency gate, the diversity
    /// filter, or the eviction policies rejected it.
    ///
    /// `query_peer` states whether this admission stems from an actual
    /// DHT query rather than a bare connection. `rtt` is advisory: in
    /// KadRTT mode the latency oracle overrides it.
    pub fn try_add_peer(
        &self,
        peer: PeerId,
        query_peer: bool,
        replaceable: bool,
        rtt: Duration,
    ) -> Result<bool, TableError> {
        let mut inner = self.write_inner();
        let result = self.add_peer(&mut inner, peer, query_peer, replaceable, rtt);
        self.debug_check_invariants(&inner);
        result
    }

    fn add_peer(
        &self,
        inner: &mut TableInner,
        peer: PeerId,
        query_peer: bool,
        replaceable: bool,
        mut rtt: Duration,
    ) -> Result<bool, TableError> {
        let dht_id = DhtKey::from_peer_id(&peer);
        let mut bid = Self::bucket_index(&inner.buckets, &self.local, &dht_id);

        // The oracle is authoritative; the caller's sample is a fallback
        // for hosts that disable the RTT machinery.
        if inner.kad_rtt {
            rtt = self.metrics.latency_ewma(&peer);
        }

        let now = Instant::now();

        inner.num_arrive += 1;
        let elapsed = now.duration_since(inner.last_ex_time);
        if elapsed >= inner.rtt_interval {
            self.recalculate(inner, bid, elapsed, now);
        }

        // Peer already present: the first query gives it a usefulness bump,
        // exactly once.
        if let Some(record) = inner.buckets[bid].get_mut(&peer) {
            if query_peer && record.last_useful_at.is_none() {
                record.last_useful_at = Some(now);
            }
            return Ok(false);
        }

        if self.metrics.latency_ewma(&peer) > self.max_latency {
            return Err(TableError::PeerRejectedHighLatency);
        }

        // Account the peer with the filter up front; if no bucket accepts
        // it the accounting is rolled back below.
        if let Some(filter) = &self.diversity_filter {
            if !filter.try_add(&peer) {
                return Err(TableError::DiversityRejected(filter.rejection_reason()));
            }
        }

        let make_record = |rtt: Duration| {
            let mut record = PeerRecord::new(peer, replaceable, rtt, now);
            record.last_useful_at = query_peer.then_some(now);
            record
        };

        let capacity = self.bucket_capacity(inner, bid);
        if inner.buckets[bid].len() < capacity {
            inner.buckets[bid].push_front(make_record(rtt));
            (self.peer_added)(peer);
            return Ok(true);
        }

        if bid == inner.buckets.len() - 1 {
            // The catch-all is overflowing: unfold it and recheck whether
            // the peer now has a dedicated bucket with room.
            self.next_bucket(inner);
            bid = Self::bucket_index(&inner.buckets, &self.local, &dht_id);
            let capacity = self.bucket_capacity(inner, bid);
            if inner.buckets[bid].len() < capacity {
                inner.buckets[bid].push_front(make_record(rtt));
                (self.peer_added)(peer);
                return Ok(true);
            }
        }

        if inner.kad_rtt {
            if inner.buckets[bid].len() == 1 {
                // Single-entry bucket: a faster candidate displaces the
                // incumbent outright.
                let incumbent = inner.buckets[bid].peers()[0].clone();
                if incumbent.rtt >= rtt {
                    self.evict_record(inner, bid, &incumbent.peer);
                    inner.buckets[bid].push_front(make_record(rtt));
                    inner.num_exchange += 1;
                    (self.peer_added)(peer);
                    tracing::debug!(
                        admitted = %peer,
                        evicted = %incumbent.peer,
                        "single-entry RTT swap"
                    );
                    return Ok(true);
                }
            } else if let Some(decision) =
                variance::arbitrate_swap(inner.buckets[bid].peers(), &dht_id, rtt)
            {
                self.evict_record(inner, bid, &decision.evict);
                inner.buckets[bid].push_front(make_record(rtt));
                inner.buckets[bid].id_variance = decision.variance;
                inner.num_exchange += 1;
                (self.peer_added)(peer);
                tracing::debug!(
                    admitted = %peer,
                    evicted = %decision.evict,
                    "variance-reducing swap"
                );
                return Ok(true);
            }
        } else {
            // Classical eviction: any replaceable record makes room.
            let replaceable_peer = inner.buckets[bid]
                .min_by(|a, _| a.replaceable)
                .filter(|r| r.replaceable)
                .map(|r| r.peer);
            if let Some(victim) = replaceable_peer {
                self.evict_record(inner, bid, &victim);
                inner.buckets[bid].push_front(make_record(rtt));
                (self.peer_added)(peer);
                return Ok(true);
            }
        }

        // No bucket accepted the peer; undo the filter accounting.
        if let Some(filter) = &self.diversity_filter {
            filter.remove(&peer);
        }
        Err(TableError::PeerRejectedNoCapacity)
    }

    /// Remove a peer the host no longer considers useful for queries
    pub fn remove_peer(&self, peer: &PeerId) {
        let mut inner = self.write_inner();
        self.remove_record(&mut inner, peer);
        self.debug_check_invariants(&inner);
    }

    /// Mark every record ineligible for classical replacement
    ///
    /// Peers can still leave via [`RoutingTable::remove_peer`] or the
    /// KadRTT policies.
    pub fn mark_all_peers_irreplaceable(&self) {
        let mut inner = self.write_inner();
        for bucket in &mut inner.buckets {
            bucket.update_all_with(|record| record.replaceable = false);
        }
    }

    /// Record the time of a successful outbound query to `peer`
    ///
    /// Returns whether a record was found.
    pub fn update_last_successful_outbound_at(&self, peer: &PeerId, t: Instant) -> bool {
        let mut inner = self.write_inner();
        let bid = Self::bucket_index(&inner.buckets, &self.local, &DhtKey::from_peer_id(peer));
        match inner.buckets[bid].get_mut(peer) {
            Some(record) => {
                record.last_successful_outbound_at = t;
                true
            }
            None => false,
        }
    }

    /// Record the time `peer` was last useful to us
    ///
    /// Returns whether a record was found.
    pub fn update_last_useful_at(&self, peer: &PeerId, t: Instant) -> bool {
        let mut inner = self.write_inner();
        let bid = Self::bucket_index(&inner.buckets, &self.local, &DhtKey::from_peer_id(peer));
        match inner.buckets[bid].get_mut(peer) {
            Some(record) => {
                record.last_useful_at = Some(t);
                true
            }
            None => false,
        }
    }

    /// Overwrite a peer's measured RTT
    ///
    /// Returns whether a record was found.
    pub fn set_rtt(&self, peer: &PeerId, rtt: Duration) -> bool {
        let mut inner = self.write_inner();
        let bid = Self::bucket_index(&inner.buckets, &self.local, &DhtKey::from_peer_id(peer));
        match inner.buckets[bid].get_mut(peer) {
            Some(record) => {
                record.update_rtt(rtt);
                true
            }
            None => false,
        }
    }

    /// A peer's currently recorded RTT
    #[must_use]
    pub fn rtt_of(&self, peer: &PeerId) -> Option<Duration> {
        let inner = self.read_inner();
        let bid = Self::bucket_index(&inner.buckets, &self.local, &DhtKey::from_peer_id(peer));
        inner.buckets[bid].get(peer).map(|record| record.rtt)
    }

    /// The `count` peers nearest to `target`
    ///
    /// Classical mode returns identifiers in ascending XOR-distance
    /// order. KadRTT mode overrides `count` with the target bucket's
    /// quorum `beta` and reorders the result: candidates whose distance
    /// is within twice the minimum and whose RTT does not exceed the
    /// nearest candidate's RTT are promoted, in ascending RTT order,
    /// ahead of everything else.
    #[must_use]
    pub fn nearest_peers(&self, target: &DhtKey, count: usize) -> Vec<PeerId> {
        let inner = self.read_inner();
        if inner.buckets.is_empty() {
            return Vec::new();
        }

        let mut cpl = self.local.common_prefix_len(target) as usize;
        if cpl >= inner.buckets.len() {
            cpl = inner.buckets.len() - 1;
        }
        let count = if inner.kad_rtt {
            inner.buckets[cpl].beta()
        } else {
            count
        };

        // Gather from the target bucket, then deeper buckets, then
        // progressively shallower ones until enough candidates exist.
        let mut pool = CandidatePool::new(*target);
        pool.append_bucket(&inner.buckets[cpl]);
        if pool.len() < count {
            for bucket in &inner.buckets[cpl + 1..] {
                pool.append_bucket(bucket);
            }
        }
        for i in (0..cpl).rev() {
            if pool.len() >= count {
                break;
            }
            pool.append_bucket(&inner.buckets[i]);
        }

        let gathered = pool.clone();
        pool.sort_by_distance();
        pool.entries.truncate(count);

        if inner.kad_rtt && !pool.is_empty() {
            let first = &pool.entries[0];
            let threshold = BigUint::from_bytes_be(first.distance.as_bytes()) * 2u32;
            let first_rtt = first.rtt;

            let mut rtt_pool = gathered;
            rtt_pool.sort_by_rtt();

            let mut promoted = Vec::with_capacity(rtt_pool.len());
            let mut demoted = Vec::with_capacity(rtt_pool.len());
            for candidate in &rtt_pool.entries {
                let distance = BigUint::from_bytes_be(candidate.distance.as_bytes());
                if distance < threshold && candidate.rtt <= first_rtt {
                    promoted.push(candidate.peer);
                } else {
                    demoted.push(candidate.peer);
                }
            }
            promoted.extend(demoted);
            promoted.truncate(count);
            promoted
        } else {
            pool.entries.iter().map(|c| c.peer).collect()
        }
    }

    /// The single peer nearest to `target`
    #[must_use]
    pub fn nearest_peer(&self, target: &DhtKey) -> Option<PeerId> {
        self.nearest_peers(target, 1).first().copied()
    }

    /// Look up a specific peer
    ///
    /// Returns the identifier only if a nearest-peer query for its own
    /// key surfaces it first.
    #[must_use]
    pub fn find(&self, peer: &PeerId) -> Option<PeerId> {
        let key = DhtKey::from_peer_id(peer);
        match self.nearest_peers(&key, 1).first() {
            Some(found) if found == peer => Some(*found),
            _ => None,
        }
    }

    /// Number of peers stored for a given CPL
    ///
    /// CPLs at or beyond the catch-all bucket are counted by their actual
    /// prefix length rather than bucket membership.
    #[must_use]
    pub fn n_peers_for_cpl(&self, cpl: u32) -> usize {
        let inner = self.read_inner();
        let last = inner.buckets.len() - 1;
        if cpl as usize >= last {
            inner.buckets[last]
                .peers()
                .iter()
                .filter(|r| self.local.common_prefix_len(&r.dht_id) == cpl)
                .count()
        } else {
            inner.buckets[cpl as usize].len()
        }
    }

    /// Total number of peers in the table
    #[must_use]
    pub fn size(&self) -> usize {
        let inner = self.read_inner();
        inner.buckets.iter().map(Bucket::len).sum()
    }

    /// All peer identifiers, bucket by bucket
    #[must_use]
    pub fn list_peers(&self) -> Vec<PeerId> {
        let inner = self.read_inner();
        inner
            .buckets
            .iter()
            .flat_map(|b| b.peers().iter().map(|r| r.peer))
            .collect()
    }

    /// Snapshots of every record in the table
    #[must_use]
    pub fn get_peer_infos(&self) -> Vec<PeerRecord> {
        let inner = self.read_inner();
        inner
            .buckets
            .iter()
            .flat_map(|b| b.peers().iter().cloned())
            .collect()
    }

    /// Maximum CPL between the local key and any stored peer
    #[must_use]
    pub fn max_common_prefix(&self) -> u32 {
        let inner = self.read_inner();
        for bucket in inner.buckets.iter().rev() {
            if !bucket.is_empty() {
                return bucket.max_common_prefix(&self.local);
            }
        }
        0
    }

    /// Number of buckets currently unfolded
    #[must_use]
    pub fn num_buckets(&self) -> usize {
        self.read_inner().buckets.len()
    }

    /// Optimized parameters of the bucket at `index`
    #[must_use]
    pub fn bucket_params(&self, index: usize) -> Option<BucketParams> {
        let inner = self.read_inner();
        inner.buckets.get(index).map(Bucket::params)
    }

    /// Aggregate counters for diagnostics
    #[must_use]
    pub fn stats(&self) -> TableStats {
        let inner = self.read_inner();
        TableStats {
            peers: inner.buckets.iter().map(Bucket::len).sum(),
            buckets: inner.buckets.len(),
            num_arrive: inner.num_arrive,
            num_exchange: inner.num_exchange,
            arv_rate_store: inner.arv_rate_store,
            prob_exchange: inner.prob_exchange,
            pool_size: inner.pool_size,
        }
    }

    /// Diversity snapshot from the configured filter, if any
    #[must_use]
    pub fn get_diversity_stats(&self) -> Vec<CplDiversityStats> {
        self.diversity_filter
            .as_ref()
            .map(|filter| filter.diversity_stats())
            .unwrap_or_default()
    }

    /// Refresh timestamps for every tracked CPL
    ///
    /// Index `i` holds the instant CPL `i` was last refreshed, or `None`
    /// if it never was. The vector covers CPL 0 through the table's
    /// maximum common prefix, capped at [`MAX_CPL_FOR_REFRESH`].
    #[must_use]
    pub fn tracked_cpls_for_refresh(&self) -> Vec<Option<Instant>> {
        let max_cpl = self.max_common_prefix().min(MAX_CPL_FOR_REFRESH);
        let refreshed = self
            .cpl_refreshed_at
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        (0..=max_cpl).map(|cpl| refreshed.get(&cpl).copied()).collect()
    }

    /// Note that the CPL of `key` was refreshed at `now`
    pub fn reset_cpl_refreshed_at(&self, key: &DhtKey, now: Instant) {
        let cpl = self.local.common_prefix_len(key);
        if cpl > MAX_CPL_FOR_REFRESH {
            return;
        }
        self.cpl_refreshed_at
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(cpl, now);
    }

    /// Human-readable description of the table
    #[must_use]
    pub fn dump(&self) -> String {
        let inner = self.read_inner();
        let mut out = String::new();
        let _ = writeln!(
            out,
            "Routing table: bucket_size={}, max_latency={:?}, pool_size={}",
            self.bucket_size, self.max_latency, inner.pool_size
        );
        for (i, bucket) in inner.buckets.iter().enumerate() {
            let _ = writeln!(
                out,
                "  bucket {i}: len={} k={} alpha={} beta={}",
                bucket.len(),
                bucket.k(),
                bucket.alpha(),
                bucket.beta()
            );
            for record in bucket.peers() {
                let _ = writeln!(
                    out,
                    "    - {} rtt={:?} replaceable={}",
                    record.peer, record.rtt, record.replaceable
                );
            }
        }
        out
    }

    /// Cancel the table's context
    ///
    /// The table has no background tasks of its own; this releases any
    /// the hosting layer parked on [`RoutingTable::subscribe_close`].
    /// Safe to call multiple times.
    pub fn close(&self) {
        let _ = self.close_tx.send(true);
    }

    /// A receiver that resolves to `true` once the table is closed
    #[must_use]
    pub fn subscribe_close(&self) -> watch::Receiver<bool> {
        self.close_tx.subscribe()
    }

    // ------------------------------------------------------------------
    // Internals. Locking is the responsibility of the public wrappers.
    // ------------------------------------------------------------------

    fn read_inner(&self) -> RwLockReadGuard<'_, TableInner> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_inner(&self) -> RwLockWriteGuard<'_, TableInner> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn bucket_index(buckets: &[Bucket], local: &DhtKey, key: &DhtKey) -> usize {
        let cpl = local.common_prefix_len(key) as usize;
        cpl.min(buckets.len().saturating_sub(1))
    }

    fn bucket_capacity(&self, inner: &TableInner, bid: usize) -> usize {
        if inner.kad_rtt {
            inner.buckets[bid].k()
        } else {
            self.bucket_size
        }
    }

    /// Fold the counter window into new rates and re-optimize `bid`
    fn recalculate(&self, inner: &mut TableInner, bid: usize, elapsed: Duration, now: Instant) {
        inner.arv_rate_store = inner.num_arrive as f64 / elapsed.as_secs_f64();
        if inner.num_arrive > 0 {
            inner.prob_exchange = inner.num_exchange as f64 / inner.num_arrive as f64;
        }

        inner.apply_opt_values(bid, self.bucket_size);

        // A shrunken capacity forces out the members whose presence
        // distorts the identifier spread the most.
        let excess = inner.buckets[bid].len().saturating_sub(inner.buckets[bid].k());
        if excess > 0 {
            let ranked = variance::rank_for_eviction(inner.buckets[bid].peers());
            for (peer, _) in ranked.into_iter().take(excess) {
                self.evict_record(inner, bid, &peer);
            }
            tracing::debug!(bucket = bid, evicted = excess, "trimmed bucket to new capacity");
        }

        if inner.buckets[bid].len() < inner.buckets[bid].k() {
            inner.prob_exchange = 1.0;
        }

        inner.num_arrive = 0;
        inner.num_exchange = 0;
        inner.last_ex_time = now;
    }

    /// Unfold the catch-all bucket
    ///
    /// Recurses while the freshly split bucket still overflows; bounded
    /// by the key bit length.
    fn next_bucket(&self, inner: &mut TableInner) {
        let last = inner.buckets.len() - 1;
        let new_bucket = inner.buckets[last].split(last as u32, &self.local);
        inner.buckets.push(new_bucket);
        let new_idx = inner.buckets.len() - 1;
        tracing::debug!(buckets = inner.buckets.len(), "unfolded a new bucket");

        let capacity = if inner.kad_rtt {
            inner.apply_opt_values(new_idx, self.bucket_size);
            inner.buckets[new_idx].k()
        } else {
            self.bucket_size
        };

        if inner.buckets[new_idx].len() >= capacity {
            self.next_bucket(inner);
        }
    }

    /// Drop a record without compacting the bucket sequence
    ///
    /// Used by the eviction paths, which immediately refill the bucket;
    /// the bucket therefore never stays empty and the sequence stays
    /// index-stable across the swap.
    fn evict_record(&self, inner: &mut TableInner, bid: usize, peer: &PeerId) {
        if inner.buckets[bid].remove(peer) {
            if let Some(filter) = &self.diversity_filter {
                filter.remove(peer);
            }
            (self.peer_removed)(*peer);
        }
    }

    /// Full removal: drop the record, roll back the filter, compact
    /// trailing empty buckets, and notify
    fn remove_record(&self, inner: &mut TableInner, peer: &PeerId) -> bool {
        let bid = Self::bucket_index(&inner.buckets, &self.local, &DhtKey::from_peer_id(peer));
        if !inner.buckets[bid].remove(peer) {
            return false;
        }
        if let Some(filter) = &self.diversity_filter {
            filter.remove(peer);
        }

        loop {
            let last = inner.buckets.len() - 1;
            if inner.buckets.len() > 1 && inner.buckets[last].is_empty() {
                inner.buckets.pop();
            } else if inner.buckets.len() >= 2 && inner.buckets[last - 1].is_empty() {
                // The penultimate bucket emptied: shift the catch-all into
                // its slot so the sequence stays contiguous.
                if let Some(moved) = inner.buckets.pop() {
                    inner.buckets[last - 1] = moved;
                }
            } else {
                break;
            }
        }

        (self.peer_removed)(*peer);
        tracing::debug!(peer = %peer, "peer removed from routing table");
        true
    }

    /// Structural invariants, enforced in debug builds after mutations
    fn debug_check_invariants(&self, inner: &TableInner) {
        #[cfg(debug_assertions)]
        {
            let last = inner.buckets.len() - 1;
            let mut seen = std::collections::HashSet::new();
            for (i, bucket) in inner.buckets.iter().enumerate() {
                for record in bucket.peers() {
                    debug_assert!(seen.insert(record.peer), "peer present in two buckets");
                    if i < last {
                        debug_assert_eq!(
                            self.local.common_prefix_len(&record.dht_id) as usize,
                            i,
                            "peer stored in the wrong bucket"
                        );
                    }
                }
            }
        }
        #[cfg(not(debug_assertions))]
        {
            let _ = inner;
        }
    }
}

impl std::fmt::Debug for RoutingTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoutingTable")
            .field("local", &self.local)
            .field("bucket_size", &self.bucket_size)
            .field("max_latency", &self.max_latency)
            .field("size", &self.size())
            .finish_non_exhaustive()
    }
}

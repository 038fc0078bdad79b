//! End-to-end scenarios for the routing table
//!
//! These tests drive the public API the way a DHT host would: peers are
//! admitted through `try_add_peer` with latencies staged in the EWMA
//! oracle, and the table's observable state is checked through the reader
//! operations. Routing identifiers are hashes of the peer identifiers, so
//! tests that need peers in specific buckets mine random identifiers until
//! the derived key has the wanted prefix.

use kadrtt_kbucket::{
    CplDiversityStats, DhtKey, DiversityFilter, EwmaLatencyBook, PeerId, RoutingTable, TableError,
};
use proptest::prelude::*;
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

fn new_table(bucket_size: usize, local: DhtKey) -> (RoutingTable, Arc<EwmaLatencyBook>) {
    let metrics = Arc::new(EwmaLatencyBook::new());
    let table = RoutingTable::new(
        bucket_size,
        local,
        Duration::from_secs(1),
        metrics.clone(),
        Duration::from_secs(3600),
        None,
    );
    (table, metrics)
}

/// Mine a peer whose routing key shares exactly `cpl` leading bits with
/// `reference`.
fn peer_with_cpl(reference: &DhtKey, cpl: u32) -> PeerId {
    loop {
        let peer = PeerId::random();
        if reference.common_prefix_len(&DhtKey::from_peer_id(&peer)) == cpl {
            return peer;
        }
    }
}

// ---------------------------------------------------------------------
// Scenario: single-entry RTT swap
// ---------------------------------------------------------------------

#[test]
fn test_single_entry_rtt_swap() {
    let local = DhtKey::from_bytes([0u8; 32]);
    let (table, metrics) = new_table(1, local);

    let slow = peer_with_cpl(&local, 0);
    let fast = peer_with_cpl(&local, 0);
    metrics.record_latency(&slow, Duration::from_millis(100));
    metrics.record_latency(&fast, Duration::from_millis(50));

    assert_eq!(table.try_add_peer(slow, true, true, Duration::ZERO), Ok(true));
    assert_eq!(table.try_add_peer(fast, true, true, Duration::ZERO), Ok(true));

    let peers = table.list_peers();
    assert_eq!(peers, vec![fast], "faster peer displaces the incumbent");
    assert_eq!(table.stats().num_exchange, 1);
}

#[test]
fn test_single_entry_swap_rejects_slower_candidate() {
    let local = DhtKey::from_bytes([0u8; 32]);
    let (table, metrics) = new_table(1, local);

    let fast = peer_with_cpl(&local, 0);
    let slow = peer_with_cpl(&local, 0);
    metrics.record_latency(&fast, Duration::from_millis(20));
    metrics.record_latency(&slow, Duration::from_millis(90));

    assert_eq!(table.try_add_peer(fast, true, true, Duration::ZERO), Ok(true));
    assert_eq!(
        table.try_add_peer(slow, true, true, Duration::ZERO),
        Err(TableError::PeerRejectedNoCapacity)
    );
    assert_eq!(table.list_peers(), vec![fast]);
    assert_eq!(table.stats().num_exchange, 0);
}

// ---------------------------------------------------------------------
// Scenario: variance-driven eviction on a full bucket
// ---------------------------------------------------------------------

#[test]
fn test_full_bucket_variance_arbitration_stays_consistent() {
    let local = DhtKey::from_bytes([0u8; 32]);
    let (table, metrics) = new_table(4, local);

    let mut members: HashSet<PeerId> = HashSet::new();
    while members.len() < 4 {
        let peer = peer_with_cpl(&local, 0);
        metrics.record_latency(&peer, Duration::from_millis(50));
        if table.try_add_peer(peer, true, true, Duration::ZERO) == Ok(true) {
            members.insert(peer);
        }
    }

    // Fast candidates make every incumbent displaceable; each admission
    // either swaps (keeping the bucket full) or is rejected outright.
    let mut swaps = 0;
    for _ in 0..50 {
        let candidate = peer_with_cpl(&local, 0);
        metrics.record_latency(&candidate, Duration::from_millis(10));
        match table.try_add_peer(candidate, true, true, Duration::ZERO) {
            Ok(true) => {
                swaps += 1;
                assert!(table.list_peers().contains(&candidate));
            }
            Ok(false) => panic!("candidate cannot already be present"),
            Err(TableError::PeerRejectedNoCapacity) => {
                assert!(!table.list_peers().contains(&candidate));
            }
            Err(other) => panic!("unexpected rejection: {other}"),
        }
        assert_eq!(table.size(), 4, "bucket occupancy never changes");
        let listed = table.list_peers();
        let unique: HashSet<_> = listed.iter().copied().collect();
        assert_eq!(listed.len(), unique.len());
    }

    assert!(swaps > 0, "variance arbitration never accepted a swap");
    assert_eq!(table.stats().num_exchange, swaps);
}

// ---------------------------------------------------------------------
// Scenario: high-latency rejection
// ---------------------------------------------------------------------

#[test]
fn test_high_latency_rejection() {
    let local = DhtKey::from_bytes([0u8; 32]);
    let metrics = Arc::new(EwmaLatencyBook::new());
    let table = RoutingTable::new(
        8,
        local,
        Duration::from_millis(10),
        metrics.clone(),
        Duration::from_secs(3600),
        None,
    );

    let peer = PeerId::random();
    metrics.record_latency(&peer, Duration::from_millis(50));
    assert_eq!(
        table.try_add_peer(peer, false, true, Duration::ZERO),
        Err(TableError::PeerRejectedHighLatency)
    );
    assert_eq!(table.size(), 0);
}

// ---------------------------------------------------------------------
// Scenario: bucket split
// ---------------------------------------------------------------------

#[test]
fn test_overflowing_catch_all_splits() {
    let local = DhtKey::from_bytes([0u8; 32]);
    let (table, _) = new_table(2, local);

    let deep_a = peer_with_cpl(&local, 1);
    let deep_b = peer_with_cpl(&local, 1);
    let shallow = peer_with_cpl(&local, 0);

    assert_eq!(table.try_add_peer(deep_a, false, true, Duration::ZERO), Ok(true));
    assert_eq!(table.try_add_peer(deep_b, false, true, Duration::ZERO), Ok(true));
    assert_eq!(table.try_add_peer(shallow, false, true, Duration::ZERO), Ok(true));

    assert_eq!(table.size(), 3);
    assert!(table.num_buckets() >= 2, "the catch-all must have unfolded");

    // The shallow peer stays at CPL 0, the deep pair moved out of it.
    assert_eq!(table.n_peers_for_cpl(0), 1);
    assert_eq!(table.n_peers_for_cpl(1), 2);

    let listed: HashSet<_> = table.list_peers().into_iter().collect();
    assert_eq!(listed, HashSet::from([deep_a, deep_b, shallow]));
}

// ---------------------------------------------------------------------
// Scenario: hybrid lookup ordering
// ---------------------------------------------------------------------

#[test]
fn test_lookup_promotes_fast_peer_within_distance_band() {
    let local = DhtKey::from_bytes([0u8; 32]);
    let (table, metrics) = new_table(10, local);

    // Target on the far side of the keyspace from the local key.
    let target = {
        let mut bytes = [0u8; 32];
        bytes[0] = 0b1000_0000;
        DhtKey::from_bytes(bytes)
    };

    // Two peers close to the target (same CPL band, so their distances are
    // within a factor of two of each other) and three clearly farther.
    let near_a = peer_with_cpl(&target, 4);
    let near_b = peer_with_cpl(&target, 4);
    let far: Vec<PeerId> = (0..3).map(|_| peer_with_cpl(&target, 0)).collect();

    // The nearer of the pair is slow; the slightly-farther one is fast.
    let (nearest, runner_up) = {
        let da = target.distance(&DhtKey::from_peer_id(&near_a));
        let db = target.distance(&DhtKey::from_peer_id(&near_b));
        if da < db { (near_a, near_b) } else { (near_b, near_a) }
    };
    metrics.record_latency(&nearest, Duration::from_millis(80));
    metrics.record_latency(&runner_up, Duration::from_millis(20));
    for peer in &far {
        metrics.record_latency(peer, Duration::from_millis(100));
    }

    for peer in [nearest, runner_up].iter().chain(far.iter()) {
        assert_eq!(table.try_add_peer(*peer, true, true, Duration::ZERO), Ok(true));
    }

    let found = table.nearest_peers(&target, 3);
    assert_eq!(found.len(), 5, "quorum override returns the gathered pool");
    assert_eq!(
        found[0], runner_up,
        "fast peer within the distance band comes first"
    );
    assert_eq!(found[1], nearest, "the nearest-but-slower peer follows");
    assert!(found[2..].iter().all(|p| far.contains(p)));
}

// ---------------------------------------------------------------------
// Scenario: parameter recomputation window
// ---------------------------------------------------------------------

#[test]
fn test_parameters_recompute_only_after_interval() {
    let local = DhtKey::from_bytes([0u8; 32]);
    let (table, _) = new_table(16, local);
    table.set_rtt_interval(Duration::from_millis(100));

    let params_before = table.bucket_params(0).unwrap();

    for _ in 0..10 {
        table
            .try_add_peer(PeerId::random(), false, true, Duration::ZERO)
            .unwrap();
    }

    // Inside the window: counters accumulate, nothing recomputed.
    let stats = table.stats();
    assert_eq!(stats.num_arrive, 10);
    assert_eq!(stats.arv_rate_store, 0.01);
    assert_eq!(table.bucket_params(0).unwrap(), params_before);

    std::thread::sleep(Duration::from_millis(150));
    table
        .try_add_peer(PeerId::random(), false, true, Duration::ZERO)
        .unwrap();

    // The 11th admission crossed the window: rates derive from the
    // counters, counters reset, and the underfull bucket forces the
    // exchange probability back to 1.
    let stats = table.stats();
    assert_eq!(stats.num_arrive, 0);
    assert_eq!(stats.num_exchange, 0);
    assert!(stats.arv_rate_store > 0.01, "arrival rate recomputed");
    assert!(stats.arv_rate_store <= 11.0 / 0.1, "rate bounded by the window");
    assert_eq!(stats.prob_exchange, 1.0);

    let params_after = table.bucket_params(0).unwrap();
    assert!(params_after.k >= 16);
    assert!(params_after.beta >= 1 && params_after.beta <= params_after.k);
    assert!(params_after.alpha >= 2);
}

// ---------------------------------------------------------------------
// Classical mode
// ---------------------------------------------------------------------

#[test]
fn test_classical_mode_replaceable_eviction() {
    let local = DhtKey::from_bytes([0u8; 32]);
    let (table, _) = new_table(1, local);
    table.set_kad_rtt(false);

    let first = peer_with_cpl(&local, 0);
    let second = peer_with_cpl(&local, 0);

    assert_eq!(table.try_add_peer(first, false, true, Duration::ZERO), Ok(true));
    assert_eq!(table.try_add_peer(second, false, true, Duration::ZERO), Ok(true));
    assert!(table.list_peers().contains(&second));
    assert!(!table.list_peers().contains(&first));
}

#[test]
fn test_classical_mode_irreplaceable_bucket_rejects() {
    let local = DhtKey::from_bytes([0u8; 32]);
    let (table, _) = new_table(1, local);
    table.set_kad_rtt(false);

    let first = peer_with_cpl(&local, 0);
    assert_eq!(table.try_add_peer(first, false, true, Duration::ZERO), Ok(true));
    table.mark_all_peers_irreplaceable();

    let second = peer_with_cpl(&local, 0);
    assert_eq!(
        table.try_add_peer(second, false, true, Duration::ZERO),
        Err(TableError::PeerRejectedNoCapacity)
    );
    assert_eq!(table.list_peers(), vec![first]);
}

#[test]
fn test_classical_lookup_is_distance_sorted() {
    let local = DhtKey::from_bytes([0u8; 32]);
    let (table, _) = new_table(4, local);
    table.set_kad_rtt(false);

    for _ in 0..40 {
        let _ = table.try_add_peer(PeerId::random(), false, true, Duration::ZERO);
    }
    assert!(table.size() > 0);

    let target = DhtKey::from_peer_id(&PeerId::random());
    let found = table.nearest_peers(&target, 10);
    assert!(found.len() <= 10);

    let unique: HashSet<_> = found.iter().copied().collect();
    assert_eq!(unique.len(), found.len(), "no duplicates");

    let known: HashSet<_> = table.list_peers().into_iter().collect();
    assert!(found.iter().all(|p| known.contains(p)));

    let distances: Vec<_> = found
        .iter()
        .map(|p| target.distance(&DhtKey::from_peer_id(p)))
        .collect();
    for pair in distances.windows(2) {
        assert!(pair[0] <= pair[1], "results sorted by distance");
    }
}

// ---------------------------------------------------------------------
// Diversity filter integration
// ---------------------------------------------------------------------

/// Filter that admits up to a fixed number of peers and records its
/// accounting so rollbacks are observable.
struct CountingFilter {
    limit: usize,
    admitted: Mutex<HashSet<PeerId>>,
}

impl CountingFilter {
    fn new(limit: usize) -> Self {
        Self {
            limit,
            admitted: Mutex::new(HashSet::new()),
        }
    }

    fn contains(&self, peer: &PeerId) -> bool {
        self.admitted.lock().unwrap().contains(peer)
    }
}

impl DiversityFilter for CountingFilter {
    fn try_add(&self, peer: &PeerId) -> bool {
        let mut admitted = self.admitted.lock().unwrap();
        if admitted.len() >= self.limit {
            return false;
        }
        admitted.insert(*peer);
        true
    }

    fn remove(&self, peer: &PeerId) {
        self.admitted.lock().unwrap().remove(peer);
    }

    fn diversity_stats(&self) -> Vec<CplDiversityStats> {
        Vec::new()
    }
}

#[test]
fn test_diversity_filter_rejection() {
    let local = DhtKey::from_bytes([0u8; 32]);
    let metrics = Arc::new(EwmaLatencyBook::new());
    let filter = Arc::new(CountingFilter::new(1));
    let table = RoutingTable::new(
        8,
        local,
        Duration::from_secs(1),
        metrics,
        Duration::from_secs(3600),
        Some(filter.clone()),
    );

    let first = PeerId::random();
    assert_eq!(table.try_add_peer(first, false, true, Duration::ZERO), Ok(true));

    let second = PeerId::random();
    assert!(matches!(
        table.try_add_peer(second, false, true, Duration::ZERO),
        Err(TableError::DiversityRejected(_))
    ));
    assert_eq!(table.size(), 1);
}

#[test]
fn test_diversity_accounting_rolls_back_on_no_capacity() {
    let local = DhtKey::from_bytes([0u8; 32]);
    let metrics = Arc::new(EwmaLatencyBook::new());
    let filter = Arc::new(CountingFilter::new(16));
    let table = RoutingTable::new(
        1,
        local,
        Duration::from_secs(1),
        metrics.clone(),
        Duration::from_secs(3600),
        Some(filter.clone()),
    );

    let incumbent = peer_with_cpl(&local, 0);
    metrics.record_latency(&incumbent, Duration::from_millis(10));
    assert_eq!(table.try_add_peer(incumbent, false, true, Duration::ZERO), Ok(true));

    // Slower candidate loses the single-entry arbitration: its filter
    // slot must be released again.
    let loser = peer_with_cpl(&local, 0);
    metrics.record_latency(&loser, Duration::from_millis(500));
    assert_eq!(
        table.try_add_peer(loser, false, true, Duration::ZERO),
        Err(TableError::PeerRejectedNoCapacity)
    );
    assert!(filter.contains(&incumbent));
    assert!(!filter.contains(&loser));
}

// ---------------------------------------------------------------------
// Callback discipline
// ---------------------------------------------------------------------

#[test]
fn test_eviction_notifies_both_sides() {
    let local = DhtKey::from_bytes([0u8; 32]);
    let metrics = Arc::new(EwmaLatencyBook::new());
    let mut table = RoutingTable::new(
        1,
        local,
        Duration::from_secs(1),
        metrics.clone(),
        Duration::from_secs(3600),
        None,
    );

    let added = Arc::new(AtomicUsize::new(0));
    let removed = Arc::new(AtomicUsize::new(0));
    let added_count = added.clone();
    let removed_count = removed.clone();
    table.set_peer_added_callback(Box::new(move |_| {
        added_count.fetch_add(1, Ordering::SeqCst);
    }));
    table.set_peer_removed_callback(Box::new(move |_| {
        removed_count.fetch_add(1, Ordering::SeqCst);
    }));

    let slow = peer_with_cpl(&local, 0);
    let fast = peer_with_cpl(&local, 0);
    metrics.record_latency(&slow, Duration::from_millis(100));
    metrics.record_latency(&fast, Duration::from_millis(10));

    table.try_add_peer(slow, false, true, Duration::ZERO).unwrap();
    table.try_add_peer(fast, false, true, Duration::ZERO).unwrap();

    assert_eq!(added.load(Ordering::SeqCst), 2, "both admissions notified");
    assert_eq!(removed.load(Ordering::SeqCst), 1, "the eviction notified");
}

// ---------------------------------------------------------------------
// Structural invariants under random admission sequences
// ---------------------------------------------------------------------

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn prop_no_duplicates_and_consistent_size(seed_peers in prop::collection::vec(prop::array::uniform32(any::<u8>()), 1..60)) {
        let local = DhtKey::from_bytes([0u8; 32]);
        let (table, _) = new_table(4, local);

        for bytes in &seed_peers {
            let _ = table.try_add_peer(PeerId::from_bytes(*bytes), false, true, Duration::ZERO);
        }

        let listed = table.list_peers();
        let unique: HashSet<_> = listed.iter().copied().collect();
        prop_assert_eq!(listed.len(), unique.len());
        prop_assert_eq!(listed.len(), table.size());

        let target = DhtKey::from_peer_id(&PeerId::from_bytes(seed_peers[0]));
        let found = table.nearest_peers(&target, 5);
        let found_unique: HashSet<_> = found.iter().copied().collect();
        prop_assert_eq!(found_unique.len(), found.len());
        for peer in &found {
            prop_assert!(unique.contains(peer));
        }
    }

    #[test]
    fn prop_removal_always_readmits(bytes in prop::array::uniform32(any::<u8>())) {
        let local = DhtKey::from_bytes([0u8; 32]);
        let (table, _) = new_table(4, local);
        let peer = PeerId::from_bytes(bytes);

        prop_assert_eq!(table.try_add_peer(peer, false, true, Duration::ZERO), Ok(true));
        table.remove_peer(&peer);
        prop_assert_eq!(table.try_add_peer(peer, false, true, Duration::ZERO), Ok(true));
    }
}

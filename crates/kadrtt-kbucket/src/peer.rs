//! Routing-table entries

use crate::keyspace::{DhtKey, PeerId};
use std::time::{Duration, Instant};

/// One entry in a bucket
///
/// Stores the peer's identifiers, bookkeeping timestamps, the replaceable
/// flag consulted by classical eviction, and the measured round-trip time
/// consulted by the RTT-aware policies.
#[derive(Clone, Debug)]
pub struct PeerRecord {
    /// Peer identifier supplied by the host
    pub peer: PeerId,
    /// Derived routing identifier (hash of `peer`)
    pub dht_id: DhtKey,
    /// When the record entered the table
    pub added_at: Instant,
    /// When the peer was last useful to us; `None` until its first query
    pub last_useful_at: Option<Instant>,
    /// When we last completed a successful outbound query to the peer
    pub last_successful_outbound_at: Instant,
    /// Whether classical eviction may replace this record
    pub replaceable: bool,
    /// Measured round-trip latency; zero when unknown
    pub rtt: Duration,
}

impl PeerRecord {
    /// Create a record for a newly admitted peer
    ///
    /// `last_useful_at` starts empty; the table marks it on the first
    /// query involving the peer.
    #[must_use]
    pub fn new(peer: PeerId, replaceable: bool, rtt: Duration, now: Instant) -> Self {
        Self {
            peer,
            dht_id: DhtKey::from_peer_id(&peer),
            added_at: now,
            last_useful_at: None,
            last_successful_outbound_at: now,
            replaceable,
            rtt,
        }
    }

    /// Update the measured round-trip time
    pub fn update_rtt(&mut self, rtt: Duration) {
        self.rtt = rtt;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_creation() {
        let p = PeerId::random();
        let now = Instant::now();
        let rec = PeerRecord::new(p, true, Duration::from_millis(12), now);

        assert_eq!(rec.peer, p);
        assert_eq!(rec.dht_id, DhtKey::from_peer_id(&p));
        assert_eq!(rec.added_at, now);
        assert!(rec.last_useful_at.is_none());
        assert!(rec.replaceable);
        assert_eq!(rec.rtt, Duration::from_millis(12));
    }

    #[test]
    fn test_update_rtt() {
        let mut rec = PeerRecord::new(PeerId::random(), false, Duration::ZERO, Instant::now());
        rec.update_rtt(Duration::from_millis(40));
        assert_eq!(rec.rtt, Duration::from_millis(40));
    }
}

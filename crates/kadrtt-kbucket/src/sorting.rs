//! Candidate gathering and ordering for lookups
//!
//! `nearest_peers` gathers bucket members into a pool of candidates, each
//! carrying its XOR distance to the target and its measured RTT, and then
//! orders the pool by distance (classical) or by RTT (the first pass of
//! the hybrid ordering). Distance comparisons use the raw XOR bytes;
//! lexicographic order on the XOR equals numeric order of the big-endian
//! integer, so no bigint arithmetic is needed here.

use crate::bucket::Bucket;
use crate::keyspace::{DhtKey, PeerId};
use std::time::Duration;

/// One lookup candidate
#[derive(Clone, Debug)]
pub(crate) struct Candidate {
    /// The peer identifier returned to the caller
    pub peer: PeerId,
    /// XOR of the candidate's routing id with the lookup target
    pub distance: DhtKey,
    /// The candidate's measured RTT at gathering time
    pub rtt: Duration,
}

/// Pool of candidates gathered from a sweep over the buckets
#[derive(Clone, Debug)]
pub(crate) struct CandidatePool {
    target: DhtKey,
    pub entries: Vec<Candidate>,
}

impl CandidatePool {
    pub fn new(target: DhtKey) -> Self {
        Self {
            target,
            entries: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Append every member of `bucket` to the pool
    pub fn append_bucket(&mut self, bucket: &Bucket) {
        for record in bucket.peers() {
            self.entries.push(Candidate {
                peer: record.peer,
                distance: self.target.xor(&record.dht_id),
                rtt: record.rtt,
            });
        }
    }

    /// Sort ascending by XOR distance to the target
    pub fn sort_by_distance(&mut self) {
        self.entries.sort_by(|a, b| a.distance.cmp(&b.distance));
    }

    /// Sort ascending by RTT
    pub fn sort_by_rtt(&mut self) {
        self.entries.sort_by(|a, b| a.rtt.cmp(&b.rtt));
    }
}

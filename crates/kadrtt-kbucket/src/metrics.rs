//! Latency oracle consumed by the routing table
//!
//! The table never measures latency itself; admission decisions defer to
//! an externally maintained exponentially-weighted moving average per
//! peer. [`EwmaLatencyBook`] is the bundled implementation for hosts (and
//! tests) that do not bring their own.

use crate::keyspace::PeerId;
use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Duration;

/// Smoothing factor applied to new latency samples
///
/// A new sample contributes 10% to the moving average, so transient
/// spikes decay over roughly ten observations.
pub const DEFAULT_LATENCY_EWMA_SMOOTHING: f64 = 0.1;

/// Externally synchronized source of per-peer latency estimates
pub trait LatencyMetrics: Send + Sync {
    /// Exponentially-weighted moving RTT for `peer`; zero when the peer
    /// has never been measured
    fn latency_ewma(&self, peer: &PeerId) -> Duration;
}

/// In-memory EWMA latency book
///
/// The first sample for a peer is stored as-is; subsequent samples are
/// folded in with the configured smoothing factor.
#[derive(Debug)]
pub struct EwmaLatencyBook {
    smoothing: f64,
    latencies: RwLock<HashMap<PeerId, Duration>>,
}

impl EwmaLatencyBook {
    /// Create a book with the default smoothing factor
    #[must_use]
    pub fn new() -> Self {
        Self::with_smoothing(DEFAULT_LATENCY_EWMA_SMOOTHING)
    }

    /// Create a book with a custom smoothing factor in (0, 1]
    #[must_use]
    pub fn with_smoothing(smoothing: f64) -> Self {
        Self {
            smoothing: smoothing.clamp(f64::EPSILON, 1.0),
            latencies: RwLock::new(HashMap::new()),
        }
    }

    /// Fold a new RTT sample into the peer's moving average
    pub fn record_latency(&self, peer: &PeerId, sample: Duration) {
        let mut latencies = self.latencies.write().unwrap_or_else(|e| e.into_inner());
        latencies
            .entry(*peer)
            .and_modify(|ewma| {
                let next = ewma.as_secs_f64() * (1.0 - self.smoothing)
                    + sample.as_secs_f64() * self.smoothing;
                *ewma = Duration::from_secs_f64(next);
            })
            .or_insert(sample);
    }

    /// Forget a peer's measurements
    pub fn remove(&self, peer: &PeerId) {
        let mut latencies = self.latencies.write().unwrap_or_else(|e| e.into_inner());
        latencies.remove(peer);
    }
}

impl Default for EwmaLatencyBook {
    fn default() -> Self {
        Self::new()
    }
}

impl LatencyMetrics for EwmaLatencyBook {
    fn latency_ewma(&self, peer: &PeerId) -> Duration {
        let latencies = self.latencies.read().unwrap_or_else(|e| e.into_inner());
        latencies.get(peer).copied().unwrap_or(Duration::ZERO)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_peer_is_zero() {
        let book = EwmaLatencyBook::new();
        assert_eq!(book.latency_ewma(&PeerId::random()), Duration::ZERO);
    }

    #[test]
    fn test_first_sample_stored_directly() {
        let book = EwmaLatencyBook::new();
        let p = PeerId::random();
        book.record_latency(&p, Duration::from_millis(100));
        assert_eq!(book.latency_ewma(&p), Duration::from_millis(100));
    }

    #[test]
    fn test_smoothing_pulls_toward_new_samples() {
        let book = EwmaLatencyBook::with_smoothing(0.5);
        let p = PeerId::random();
        book.record_latency(&p, Duration::from_millis(100));
        book.record_latency(&p, Duration::from_millis(200));
        assert_eq!(book.latency_ewma(&p), Duration::from_millis(150));
    }

    #[test]
    fn test_remove_forgets_peer() {
        let book = EwmaLatencyBook::new();
        let p = PeerId::random();
        book.record_latency(&p, Duration::from_millis(100));
        book.remove(&p);
        assert_eq!(book.latency_ewma(&p), Duration::ZERO);
    }
}

//! Cluster seams: delta broadcast, record framing, snapshot files, peer
//! wait computation.
//!
//! The gossip transport itself lives outside the core. The stores only need
//! a way to hand a framed delta to "whatever replicates bytes", and a way to
//! be handed peer deltas for merging.

pub mod codec;
pub mod snapshot;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Fire-and-forget propagation of a framed state delta to cluster peers.
///
/// Implementations must not block: the stores call this while holding their
/// write lock.
pub trait Broadcast: Send + Sync + fmt::Debug {
    fn broadcast(&self, delta: Vec<u8>);
}

/// Single-node operation: deltas go nowhere.
#[derive(Debug, Default, Clone)]
pub struct NoopBroadcast;

impl Broadcast for NoopBroadcast {
    fn broadcast(&self, _delta: Vec<u8>) {}
}

/// Test/bridge helper: collects every broadcast delta.
#[derive(Debug, Default)]
pub struct CapturingBroadcast {
    deltas: parking_lot::Mutex<Vec<Vec<u8>>>,
}

impl CapturingBroadcast {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn take(&self) -> Vec<Vec<u8>> {
        std::mem::take(&mut self.deltas.lock())
    }
}

impl Broadcast for Arc<CapturingBroadcast> {
    fn broadcast(&self, delta: Vec<u8>) {
        self.deltas.lock().push(delta);
    }
}

/// Reports this node's position in the deterministically sorted peer list.
///
/// Position 0 fires immediately; later peers hold back long enough for the
/// earlier ones' nflog entries to arrive.
pub trait PeerPosition: Send + Sync + fmt::Debug {
    fn position(&self) -> usize;
}

/// Fixed position, for single-node setups and tests.
#[derive(Debug, Clone, Copy)]
pub struct StaticPosition(pub usize);

impl PeerPosition for StaticPosition {
    fn position(&self) -> usize {
        self.0
    }
}

/// Wait duration for the pipeline's wait stage: `position * peer_timeout`.
pub fn peer_wait(position: &dyn PeerPosition, peer_timeout: Duration) -> Duration {
    peer_timeout.saturating_mul(position.position() as u32)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peer_wait_scales_with_position() {
        let timeout = Duration::from_secs(15);
        assert_eq!(peer_wait(&StaticPosition(0), timeout), Duration::ZERO);
        assert_eq!(peer_wait(&StaticPosition(1), timeout), Duration::from_secs(15));
        assert_eq!(peer_wait(&StaticPosition(3), timeout), Duration::from_secs(45));
    }

    #[test]
    fn capturing_broadcast_collects() {
        let capture = CapturingBroadcast::new();
        capture.broadcast(vec![1, 2]);
        capture.broadcast(vec![3]);
        assert_eq!(capture.take(), vec![vec![1, 2], vec![3]]);
        assert!(capture.take().is_empty());
    }
}

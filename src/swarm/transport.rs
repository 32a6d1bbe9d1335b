//! Peer-to-peer transport between ranks.
//!
//! - [`PeerTransport`]: point-to-point send with a per-call timeout
//! - [`SimulatedTransport`]: in-process transport with fixed latency and
//!   injectable unreachable ranks
//! - [`Sealer`]: encryption at rest for migration payloads
//! - [`broadcast`]: concurrent best-effort fan-out

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::future::join_all;
use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, warn};

use crate::swarm::shard::RankId;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("send to rank {rank} timed out after {timeout:?}")]
    Timeout { rank: RankId, timeout: Duration },

    #[error("rank {0} unreachable")]
    Unreachable(RankId),

    #[error("rank {rank} rejected payload: {reason}")]
    Rejected { rank: RankId, reason: String },
}

#[async_trait]
pub trait PeerTransport: Send + Sync {
    /// Deliver `payload` to `rank` and wait for its acknowledgement.
    async fn send(&self, rank: RankId, payload: Bytes, timeout: Duration) -> Result<Bytes, TransportError>;
}

/// In-process transport. Each send sleeps for `latency`.
pub struct SimulatedTransport {
    latency: Duration,
    unreachable: Mutex<HashSet<RankId>>,
    messages: AtomicU64,
    bytes: AtomicU64,
}

impl SimulatedTransport {
    pub fn new(latency: Duration) -> Self {
        Self {
            latency,
            unreachable: Mutex::new(HashSet::new()),
            messages: AtomicU64::new(0),
            bytes: AtomicU64::new(0),
        }
    }

    pub fn set_unreachable(&self, rank: RankId, unreachable: bool) {
        let mut set = self.unreachable.lock();
        if unreachable {
            set.insert(rank);
        } else {
            set.remove(&rank);
        }
    }

    /// Messages delivered so far.
    pub fn messages_delivered(&self) -> u64 {
        self.messages.load(Ordering::Relaxed)
    }

    pub fn bytes_delivered(&self) -> u64 {
        self.bytes.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl PeerTransport for SimulatedTransport {
    async fn send(&self, rank: RankId, payload: Bytes, timeout: Duration) -> Result<Bytes, TransportError> {
        if self.unreachable.lock().contains(&rank) {
            return Err(TransportError::Unreachable(rank));
        }
        if payload.is_empty() {
            return Err(TransportError::Rejected {
                rank,
                reason: "empty payload".to_string(),
            });
        }

        tokio::time::timeout(timeout, tokio::time::sleep(self.latency))
            .await
            .map_err(|_| TransportError::Timeout { rank, timeout })?;

        self.messages.fetch_add(1, Ordering::Relaxed);
        self.bytes.fetch_add(payload.len() as u64, Ordering::Relaxed);
        debug!(rank, bytes = payload.len(), "Delivered payload");
        Ok(Bytes::from_static(b"ack"))
    }
}

/// Encryption at rest for serialized shard state.
pub trait Sealer: Send + Sync {
    fn seal(&self, plaintext: Bytes) -> Bytes;
    fn open(&self, sealed: Bytes) -> Bytes;
}

/// Identity sealer.
#[derive(Debug, Default, Clone, Copy)]
pub struct PlaintextSealer;

impl Sealer for PlaintextSealer {
    fn seal(&self, plaintext: Bytes) -> Bytes {
        plaintext
    }

    fn open(&self, sealed: Bytes) -> Bytes {
        sealed
    }
}

/// Send `payload` to every rank in `ranks` concurrently.
///
/// Failures are logged and returned per rank; none aborts the others.
pub async fn broadcast(
    transport: &dyn PeerTransport,
    ranks: &[RankId],
    payload: Bytes,
    timeout: Duration,
) -> Vec<(RankId, Result<Bytes, TransportError>)> {
    let sends = ranks.iter().map(|&rank| {
        let payload = payload.clone();
        async move { (rank, transport.send(rank, payload, timeout).await) }
    });
    let results = join_all(sends).await;
    for (rank, result) in &results {
        if let Err(e) = result {
            warn!(rank, error = %e, "Broadcast delivery failed");
        }
    }
    results
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_send_delivers() {
        let t = SimulatedTransport::new(Duration::from_millis(5));
        let ack = t
            .send(1, Bytes::from_static(b"shard"), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(&ack[..], b"ack");
        assert_eq!(t.messages_delivered(), 1);
        assert_eq!(t.bytes_delivered(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_times_out() {
        let t = SimulatedTransport::new(Duration::from_secs(10));
        let err = t
            .send(1, Bytes::from_static(b"x"), Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Timeout { rank: 1, .. }));
        assert_eq!(t.messages_delivered(), 0);
    }

    #[tokio::test]
    async fn test_unreachable_and_empty() {
        let t = SimulatedTransport::new(Duration::ZERO);
        t.set_unreachable(2, true);
        assert_eq!(
            t.send(2, Bytes::from_static(b"x"), Duration::from_secs(1)).await,
            Err(TransportError::Unreachable(2))
        );
        assert!(matches!(
            t.send(3, Bytes::new(), Duration::from_secs(1)).await,
            Err(TransportError::Rejected { rank: 3, .. })
        ));
        t.set_unreachable(2, false);
        assert!(t.send(2, Bytes::from_static(b"x"), Duration::from_secs(1)).await.is_ok());
    }

    #[tokio::test]
    async fn test_broadcast_is_best_effort() {
        let t = SimulatedTransport::new(Duration::ZERO);
        t.set_unreachable(1, true);
        let results = broadcast(&t, &[0, 1, 2], Bytes::from_static(b"meta"), Duration::from_secs(1)).await;
        assert_eq!(results.len(), 3);
        assert!(results[0].1.is_ok());
        assert!(results[1].1.is_err());
        assert!(results[2].1.is_ok());
        assert_eq!(t.messages_delivered(), 2);
    }

    #[test]
    fn test_plaintext_sealer_is_identity() {
        let s = PlaintextSealer;
        let data = Bytes::from_static(b"kv");
        assert_eq!(s.open(s.seal(data.clone())), data);
    }
}

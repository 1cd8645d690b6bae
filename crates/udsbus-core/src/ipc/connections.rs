//! Broker-side registry of established peer connections.
//!
//! Each record holds the sending half of its connection's outbound queue.
//! The connection's own handler is the only task that writes to the socket;
//! relaying a frame means enqueueing already-encoded bytes. Dropping a record
//! closes that queue, which is how a connection learns it has been pruned.
//!
//! A peer is only pruned for a closed queue, or for a queue that stays full
//! for the whole wait passed to [`ConnectionRegistry::relay`]. A peer that
//! pauses reading briefly keeps its registration.

use super::liveness::Liveness;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, RwLock};
use tokio::time::Instant;
use tracing::debug;

/// One registered peer.
#[derive(Debug)]
pub struct ConnectionRecord {
    /// Identity proven in the handshake.
    pub identity: u64,
    /// Distinguishes reconnects of the same identity.
    pub conn_id: u64,
    pub liveness: Arc<Liveness>,
    outbound: mpsc::Sender<Bytes>,
}

impl ConnectionRecord {
    pub fn new(
        identity: u64,
        conn_id: u64,
        liveness: Arc<Liveness>,
        outbound: mpsc::Sender<Bytes>,
    ) -> Self {
        Self {
            identity,
            conn_id,
            liveness,
            outbound,
        }
    }

    /// Queue bytes for this peer without waiting.
    fn deliver(&self, bytes: &Bytes) -> Delivery {
        match self.outbound.try_send(bytes.clone()) {
            Ok(()) => Delivery::Queued,
            Err(TrySendError::Full(_)) => Delivery::Full,
            Err(TrySendError::Closed(_)) => Delivery::Closed,
        }
    }
}

enum Delivery {
    Queued,
    Full,
    Closed,
}

/// Registered peer as seen by the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerInfo {
    pub identity: u64,
    /// Time since the peer's last frame.
    pub silent_for: Duration,
}

/// Result of one relay fan-out.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RelayOutcome {
    pub delivered: usize,
    /// Identities removed because delivery to them failed.
    pub pruned: Vec<u64>,
}

/// Identity -> connection map owned by the broker.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    conns: RwLock<HashMap<u64, ConnectionRecord>>,
    next_conn_id: AtomicU64,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a connection id for a freshly accepted connection.
    pub fn next_conn_id(&self) -> u64 {
        self.next_conn_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Insert a record, replacing any existing one for the same identity.
    ///
    /// Returns true when an older connection was displaced. Its queue closes
    /// when the old record drops, which ends that connection.
    pub async fn register(&self, record: ConnectionRecord) -> bool {
        let identity = record.identity;
        let replaced = self.conns.write().await.insert(identity, record);
        if let Some(ref old) = replaced {
            debug!(
                "Identity {} reconnected; replacing connection {}",
                identity, old.conn_id
            );
        }
        replaced.is_some()
    }

    /// Remove the record for `identity` if it still belongs to `conn_id`.
    pub async fn remove(&self, identity: u64, conn_id: u64) -> bool {
        let mut conns = self.conns.write().await;
        match conns.get(&identity) {
            Some(record) if record.conn_id == conn_id => {
                conns.remove(&identity);
                true
            }
            _ => false,
        }
    }

    /// Fan `bytes` out to every peer except the sender (unless
    /// `self_receive`), then prune the peers that could not take it.
    ///
    /// The read lock covers only the non-blocking fan-out. Peers whose queue
    /// was full get the frame again with the lock released, all within one
    /// shared `full_wait` deadline; those still full after it are pruned
    /// along with closed ones under the write lock.
    pub async fn relay(
        &self,
        sender: u64,
        bytes: Bytes,
        self_receive: bool,
        full_wait: Duration,
    ) -> RelayOutcome {
        let mut outcome = RelayOutcome::default();
        let mut failed: Vec<(u64, u64)> = Vec::new();
        let mut backlogged: Vec<(u64, u64, mpsc::Sender<Bytes>)> = Vec::new();

        {
            let conns = self.conns.read().await;
            for (identity, record) in conns.iter() {
                if *identity == sender && !self_receive {
                    continue;
                }
                match record.deliver(&bytes) {
                    Delivery::Queued => outcome.delivered += 1,
                    Delivery::Full => backlogged.push((
                        *identity,
                        record.conn_id,
                        record.outbound.clone(),
                    )),
                    Delivery::Closed => failed.push((*identity, record.conn_id)),
                }
            }
        }

        if !backlogged.is_empty() {
            let deadline = Instant::now() + full_wait;
            for (identity, conn_id, outbound) in backlogged {
                let remaining = deadline.saturating_duration_since(Instant::now());
                match outbound.send_timeout(bytes.clone(), remaining).await {
                    Ok(()) => outcome.delivered += 1,
                    Err(_) => failed.push((identity, conn_id)),
                }
            }
        }

        if !failed.is_empty() {
            let mut conns = self.conns.write().await;
            for (identity, conn_id) in failed {
                if conns.get(&identity).map(|r| r.conn_id) == Some(conn_id) {
                    conns.remove(&identity);
                    outcome.pruned.push(identity);
                }
            }
        }

        outcome
    }

    /// Registered peers with their silence, sorted by identity.
    pub async fn peer_info(&self) -> Vec<PeerInfo> {
        let mut peers: Vec<PeerInfo> = self
            .conns
            .read()
            .await
            .values()
            .map(|record| PeerInfo {
                identity: record.identity,
                silent_for: record.liveness.silent_for(),
            })
            .collect();
        peers.sort_unstable_by_key(|peer| peer.identity);
        peers
    }

    /// Registered identities, sorted.
    pub async fn identities(&self) -> Vec<u64> {
        let mut ids: Vec<u64> = self.conns.read().await.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub async fn contains(&self, identity: u64) -> bool {
        self.conns.read().await.contains_key(&identity)
    }

    pub async fn len(&self) -> usize {
        self.conns.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

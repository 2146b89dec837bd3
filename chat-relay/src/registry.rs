//! The broker's set of active connections.
//!
//! Every connection owns a bounded outbound queue; a broadcast pushes one frame
//! into each queue while holding the set lock, so membership cannot change
//! half-way through a fanout. Pushes never wait: a recipient whose queue is
//! full loses that one frame and the remaining recipients are unaffected.

use std::{
    collections::HashMap,
    sync::atomic::{AtomicU64, Ordering},
};

use tokio::sync::{
    Mutex,
    mpsc::{self, error::TrySendError},
};
use tracing::{debug, warn};

pub type ConnectionId = u64;

pub struct ConnectionRegistry {
    connections: Mutex<HashMap<ConnectionId, mpsc::Sender<String>>>,
    next_id: AtomicU64,
    outbound_buffer: usize,
}

/// Outcome of one broadcast.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Fanout {
    pub delivered: usize,
    pub dropped: usize,
}

impl ConnectionRegistry {
    pub fn new(outbound_buffer: usize) -> Self {
        Self {
            connections: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            outbound_buffer: outbound_buffer.max(1),
        }
    }

    fn next_id(&self) -> ConnectionId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Adds a connection to the active set and hands back its outbound queue.
    pub async fn register(&self) -> (ConnectionId, mpsc::Receiver<String>) {
        let (sender, receiver) = mpsc::channel(self.outbound_buffer);
        let id = self.next_id();
        let mut connections = self.connections.lock().await;
        connections.insert(id, sender);
        (id, receiver)
    }

    pub async fn remove(&self, id: ConnectionId) -> bool {
        let mut connections = self.connections.lock().await;
        connections.remove(&id).is_some()
    }

    pub async fn len(&self) -> usize {
        self.connections.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn broadcast(&self, frame: &str) -> Fanout {
        let connections = self.connections.lock().await;
        let mut fanout = Fanout::default();

        for (id, outbound) in connections.iter() {
            match outbound.try_send(frame.to_string()) {
                Ok(()) => fanout.delivered += 1,
                Err(TrySendError::Full(_)) => {
                    warn!(connection = id, "outbound queue full, dropping message");
                    fanout.dropped += 1;
                }
                Err(TrySendError::Closed(_)) => {
                    debug!(connection = id, "connection already gone, skipping");
                    fanout.dropped += 1;
                }
            }
        }

        fanout
    }

    /// Empties the active set. Sessions see their queue close and hang up.
    pub async fn close_all(&self) -> usize {
        let mut connections = self.connections.lock().await;
        let closed = connections.len();
        connections.clear();
        closed
    }
}

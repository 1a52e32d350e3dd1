//! Fan-out bus.
//!
//! Topic registry plus per-session bounded queues. The registry lock is held
//! only to mutate or enumerate membership, never across a send; frames go
//! into each session's mpsc queue with `try_send`, and a full or closed
//! queue evicts the session; consumers are expected to resync from a
//! snapshot on reconnect rather than rely on replay.

use dashmap::DashMap;
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use tokio::sync::mpsc;
use uuid::Uuid;

use super::channels::{ServerFrame, Topic};
use crate::metrics::names;

pub type SessionId = Uuid;

pub struct FanoutBus {
    sessions: DashMap<SessionId, mpsc::Sender<ServerFrame>>,
    registry: RwLock<HashMap<Topic, HashSet<SessionId>>>,
    queue_capacity: usize,
}

impl FanoutBus {
    pub fn new(queue_capacity: usize) -> Self {
        Self {
            sessions: DashMap::new(),
            registry: RwLock::new(HashMap::new()),
            queue_capacity,
        }
    }

    /// Register a session; the caller drains the returned queue into its
    /// transport.
    pub fn register(&self) -> (SessionId, mpsc::Receiver<ServerFrame>) {
        let session_id = Uuid::new_v4();
        let (tx, rx) = mpsc::channel(self.queue_capacity);
        self.sessions.insert(session_id, tx);
        metrics::gauge!(names::WS_SESSIONS_ACTIVE).increment(1.0);
        (session_id, rx)
    }

    pub fn unregister(&self, session_id: SessionId) {
        if self.sessions.remove(&session_id).is_some() {
            metrics::gauge!(names::WS_SESSIONS_ACTIVE).decrement(1.0);
        }
        let mut registry = self.registry.write();
        registry.retain(|_, members| {
            members.remove(&session_id);
            !members.is_empty()
        });
    }

    pub fn subscribe(&self, session_id: SessionId, topic: Topic) {
        let mut registry = self.registry.write();
        registry.entry(topic).or_default().insert(session_id);
    }

    pub fn unsubscribe(&self, session_id: SessionId, topic: &Topic) {
        let mut registry = self.registry.write();
        if let Some(members) = registry.get_mut(topic) {
            members.remove(&session_id);
            if members.is_empty() {
                registry.remove(topic);
            }
        }
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Direct enqueue to one session (acks, snapshots, errors). False when
    /// the session is gone or its queue overflowed (it gets evicted).
    pub fn send_to(&self, session_id: SessionId, frame: ServerFrame) -> bool {
        let Some(tx) = self.sessions.get(&session_id).map(|s| s.clone()) else {
            return false;
        };
        match tx.try_send(frame) {
            Ok(()) => true,
            Err(_) => {
                self.evict(session_id);
                false
            }
        }
    }

    /// Deliver a frame to every subscriber of a topic. Slow or dead sessions
    /// are dropped; delivery is best-effort by design.
    pub fn publish(&self, topic: &Topic, frame: ServerFrame) {
        let members: Vec<SessionId> = {
            let registry = self.registry.read();
            match registry.get(topic) {
                Some(members) => members.iter().copied().collect(),
                None => return,
            }
        };

        for session_id in members {
            let Some(tx) = self.sessions.get(&session_id).map(|s| s.clone()) else {
                continue;
            };
            if tx.try_send(frame.clone()).is_err() {
                tracing::warn!(
                    session = %session_id,
                    topic = %topic.name(),
                    "session queue overflow, evicting"
                );
                metrics::counter!(names::WS_FRAMES_DROPPED_TOTAL).increment(1);
                self.evict(session_id);
            }
        }
    }

    fn evict(&self, session_id: SessionId) {
        // Dropping the sender closes the session's queue; its transport task
        // sees the close and tears the connection down.
        self.unregister(session_id);
    }

    /// Shutdown: close every session queue so the transport tasks unwind.
    pub fn close_all(&self) {
        let count = self.sessions.len();
        self.sessions.clear();
        self.registry.write().clear();
        metrics::gauge!(names::WS_SESSIONS_ACTIVE).decrement(count as f64);
    }
}

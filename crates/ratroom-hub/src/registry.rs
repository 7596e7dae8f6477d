//! Connection registry and recent-event history.
//!
//! Plain synchronous state. The hub actor is the only owner, so nothing
//! here needs a lock; every method runs to completion before the next
//! command is handled.

use crate::hub::HubError;
use ratroom_core::{ClientList, OffChainMessage, RatId};
use axum::extract::ws::Utf8Bytes;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::time::SystemTime;
use tokio::sync::mpsc;

/// Opaque id of one live connection. Never reused within a process.
pub type ConnectionId = u64;

/// Sending half of a connection's outbound queue.
pub type OutboundTx = mpsc::UnboundedSender<Outbound>;

/// An item on a connection's outbound queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    /// A serialized message, shared by every recipient of a broadcast.
    Frame(Utf8Bytes),
    /// Close the socket.
    Close(CloseReason),
}

/// Why the hub closed a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Another connection registered with the same rat id.
    Replaced,
    /// The server is shutting down.
    Shutdown,
}

impl CloseReason {
    pub fn as_str(self) -> &'static str {
        match self {
            CloseReason::Replaced => "replaced",
            CloseReason::Shutdown => "shutdown",
        }
    }
}

/// Policy for a rat id that registers while already live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DuplicatePolicy {
    /// Drop the old connection and accept the new one.
    #[default]
    Replace,
    /// Refuse the new connection.
    Reject,
}

/// A send to one connection failed because its receiver is gone.
#[derive(Debug, thiserror::Error)]
#[error("delivery to connection {id} ({rat_id}) failed: receiver closed")]
pub struct DeliveryError {
    pub id: ConnectionId,
    pub rat_id: RatId,
}

/// Outcome of a successful [`Registry::register`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Registered {
    pub id: ConnectionId,
    /// Prior connection for the same rat id, now closed.
    pub replaced: Option<ConnectionId>,
    /// Number of history frames queued before live delivery.
    pub replayed: usize,
}

struct Entry {
    rat_id: RatId,
    connected_at: SystemTime,
    tx: OutboundTx,
}

/// Live connections plus the bounded history replayed to new ones.
pub struct Registry {
    entries: HashMap<ConnectionId, Entry>,
    /// Join order, oldest first.
    order: Vec<ConnectionId>,
    by_rat: HashMap<RatId, ConnectionId>,
    history: VecDeque<(OffChainMessage, Utf8Bytes)>,
    history_len: usize,
    policy: DuplicatePolicy,
    next_id: ConnectionId,
}

impl Registry {
    pub fn new(history_len: usize, policy: DuplicatePolicy) -> Self {
        Self {
            entries: HashMap::new(),
            order: Vec::new(),
            by_rat: HashMap::new(),
            history: VecDeque::with_capacity(history_len),
            history_len,
            policy,
            next_id: 1,
        }
    }

    /// Add a connection.
    ///
    /// History is queued on `tx` before the entry becomes live, so the
    /// connection sees the replay followed by every later broadcast, with
    /// nothing skipped or repeated.
    pub fn register(&mut self, rat_id: RatId, tx: OutboundTx) -> Result<Registered, HubError> {
        let replaced = match self.by_rat.get(&rat_id).copied() {
            Some(_) if self.policy == DuplicatePolicy::Reject => {
                return Err(HubError::DuplicateConnection(rat_id));
            }
            Some(prior) => {
                if let Some(entry) = self.remove(prior) {
                    let _ = entry.tx.send(Outbound::Close(CloseReason::Replaced));
                    tracing::info!(
                        rat_id = %rat_id,
                        prior,
                        "Replacing existing connection"
                    );
                }
                Some(prior)
            }
            None => None,
        };

        let id = self.next_id;
        self.next_id += 1;

        for (_, frame) in &self.history {
            if tx.send(Outbound::Frame(frame.clone())).is_err() {
                tracing::warn!(rat_id = %rat_id, "Connection closed during replay");
                return Ok(Registered {
                    id,
                    replaced,
                    replayed: 0,
                });
            }
        }

        self.by_rat.insert(rat_id.clone(), id);
        self.order.push(id);
        self.entries.insert(
            id,
            Entry {
                rat_id,
                connected_at: SystemTime::now(),
                tx,
            },
        );

        Ok(Registered {
            id,
            replaced,
            replayed: self.history.len(),
        })
    }

    /// Remove a connection. Unknown ids are ignored.
    pub fn unregister(&mut self, id: ConnectionId) -> Option<RatId> {
        self.remove(id).map(|entry| entry.rat_id)
    }

    /// Queue `msg` on every live connection.
    ///
    /// Returns the connections that could not be reached; they have already
    /// been removed.
    pub fn broadcast(&mut self, msg: &OffChainMessage) -> Vec<DeliveryError> {
        let frame = Utf8Bytes::from(msg.to_json());

        if msg.is_replayable() && self.history_len > 0 {
            if self.history.len() == self.history_len {
                self.history.pop_front();
            }
            self.history.push_back((msg.clone(), frame.clone()));
        }

        let dead: Vec<ConnectionId> = self
            .order
            .iter()
            .copied()
            .filter(|id| {
                self.entries
                    .get(id)
                    .is_some_and(|entry| entry.tx.send(Outbound::Frame(frame.clone())).is_err())
            })
            .collect();

        dead.into_iter()
            .filter_map(|id| {
                self.remove(id)
                    .map(|entry| DeliveryError { id, rat_id: entry.rat_id })
            })
            .collect()
    }

    /// Close every connection.
    pub fn close_all(&mut self, reason: CloseReason) {
        for id in std::mem::take(&mut self.order) {
            if let Some(entry) = self.entries.remove(&id) {
                let _ = entry.tx.send(Outbound::Close(reason));
            }
        }
        self.by_rat.clear();
    }

    /// Connected rat ids, oldest first.
    pub fn list_active(&self) -> Vec<RatId> {
        self.order
            .iter()
            .filter_map(|id| self.entries.get(id))
            .map(|entry| entry.rat_id.clone())
            .collect()
    }

    /// The current client list as a message.
    pub fn client_list(&self) -> OffChainMessage {
        OffChainMessage::Clients(ClientList {
            clients: self.list_active(),
        })
    }

    /// Buffered history, oldest first.
    pub fn latest_events(&self) -> Vec<OffChainMessage> {
        self.history.iter().map(|(msg, _)| msg.clone()).collect()
    }

    /// When a live connection registered.
    pub fn connected_at(&self, id: ConnectionId) -> Option<SystemTime> {
        self.entries.get(&id).map(|entry| entry.connected_at)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn remove(&mut self, id: ConnectionId) -> Option<Entry> {
        let entry = self.entries.remove(&id)?;
        self.order.retain(|other| *other != id);
        if self.by_rat.get(&entry.rat_id) == Some(&id) {
            self.by_rat.remove(&entry.rat_id);
        }
        Some(entry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ratroom_core::BalanceChange;

    fn rat(id: &str) -> RatId {
        id.parse().unwrap()
    }

    fn balance(value: u64) -> OffChainMessage {
        OffChainMessage::Balance(BalanceChange::Absolute { value })
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<Outbound>) -> Vec<Outbound> {
        let mut out = Vec::new();
        while let Ok(item) = rx.try_recv() {
            out.push(item);
        }
        out
    }

    fn frames(items: Vec<Outbound>) -> Vec<OffChainMessage> {
        items
            .into_iter()
            .filter_map(|item| match item {
                Outbound::Frame(text) => Some(serde_json::from_str(text.as_str()).unwrap()),
                Outbound::Close(_) => None,
            })
            .collect()
    }

    #[test]
    fn early_connection_gets_every_broadcast_once_in_order() {
        let mut registry = Registry::new(8, DuplicatePolicy::Replace);
        let (tx, mut rx) = mpsc::unbounded_channel();
        registry.register(rat("rat_a"), tx).unwrap();

        let sent: Vec<_> = (1..=20).map(balance).collect();
        for msg in &sent {
            assert!(registry.broadcast(msg).is_empty());
        }

        assert_eq!(frames(drain(&mut rx)), sent);
    }

    #[test]
    fn late_connection_gets_history_then_live() {
        let mut registry = Registry::new(3, DuplicatePolicy::Replace);
        for value in 1..=5 {
            registry.broadcast(&balance(value));
        }

        let (tx, mut rx) = mpsc::unbounded_channel();
        let registered = registry.register(rat("late"), tx).unwrap();
        assert_eq!(registered.replayed, 3);

        registry.broadcast(&balance(6));
        registry.broadcast(&balance(7));

        let expected: Vec<_> = [3, 4, 5, 6, 7].into_iter().map(balance).collect();
        assert_eq!(frames(drain(&mut rx)), expected);
    }

    #[test]
    fn client_lists_stay_out_of_history() {
        let mut registry = Registry::new(4, DuplicatePolicy::Replace);
        registry.broadcast(&balance(1));
        let clients = registry.client_list();
        registry.broadcast(&clients);
        assert_eq!(registry.latest_events(), vec![balance(1)]);
    }

    #[test]
    fn duplicate_rat_id_replaces_prior() {
        let mut registry = Registry::new(4, DuplicatePolicy::Replace);
        let (tx1, mut rx1) = mpsc::unbounded_channel();
        let (tx2, _rx2) = mpsc::unbounded_channel();

        let first = registry.register(rat("rat_a"), tx1).unwrap();
        let second = registry.register(rat("rat_a"), tx2).unwrap();

        assert_eq!(second.replaced, Some(first.id));
        assert_eq!(registry.list_active(), vec![rat("rat_a")]);
        assert_eq!(registry.len(), 1);
        assert_eq!(
            drain(&mut rx1),
            vec![Outbound::Close(CloseReason::Replaced)]
        );

        // The replaced connection's late cleanup must not touch the new one.
        assert_eq!(registry.unregister(first.id), None);
        assert_eq!(registry.list_active(), vec![rat("rat_a")]);
    }

    #[test]
    fn duplicate_rat_id_rejected_by_policy() {
        let mut registry = Registry::new(4, DuplicatePolicy::Reject);
        let (tx1, _rx1) = mpsc::unbounded_channel();
        let (tx2, _rx2) = mpsc::unbounded_channel();
        registry.register(rat("rat_a"), tx1).unwrap();

        let err = registry.register(rat("rat_a"), tx2).unwrap_err();
        assert!(matches!(err, HubError::DuplicateConnection(id) if id == rat("rat_a")));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn unregister_is_idempotent() {
        let mut registry = Registry::new(4, DuplicatePolicy::Replace);
        assert_eq!(registry.unregister(42), None);

        let (tx, _rx) = mpsc::unbounded_channel();
        let registered = registry.register(rat("rat_a"), tx).unwrap();
        assert!(registry.connected_at(registered.id).is_some());
        assert_eq!(registry.unregister(registered.id), Some(rat("rat_a")));
        assert_eq!(registry.connected_at(registered.id), None);
        assert_eq!(registry.unregister(registered.id), None);
        assert!(registry.is_empty());
    }

    #[test]
    fn dead_connection_is_dropped_without_blocking_others() {
        let mut registry = Registry::new(4, DuplicatePolicy::Replace);
        let (tx1, rx1) = mpsc::unbounded_channel();
        let (tx2, mut rx2) = mpsc::unbounded_channel();
        registry.register(rat("gone"), tx1).unwrap();
        registry.register(rat("alive"), tx2).unwrap();
        drop(rx1);

        let failed = registry.broadcast(&balance(9));
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].rat_id, rat("gone"));
        assert_eq!(registry.list_active(), vec![rat("alive")]);
        assert_eq!(frames(drain(&mut rx2)), vec![balance(9)]);
    }

    #[test]
    fn list_active_keeps_join_order() {
        let mut registry = Registry::new(0, DuplicatePolicy::Replace);
        let mut keep = Vec::new();
        for name in ["c", "a", "b"] {
            let (tx, rx) = mpsc::unbounded_channel();
            keep.push(rx);
            registry.register(rat(name), tx).unwrap();
        }
        assert_eq!(registry.list_active(), vec![rat("c"), rat("a"), rat("b")]);

        registry.close_all(CloseReason::Shutdown);
        assert!(registry.list_active().is_empty());
        assert_eq!(drain(&mut keep[0]), vec![Outbound::Close(CloseReason::Shutdown)]);
    }
}

//! Fan-out hub.
//!
//! A single task owns the [`Registry`]. Everything else talks to it through
//! a cloneable [`Hub`] handle, so registry mutation is serialized on one
//! queue and never races with a broadcast.

use crate::config::HubConfig;
use crate::registry::{CloseReason, ConnectionId, Outbound, Registry};
use ratroom_core::{OffChainMessage, RatId, RatIdError};
use tokio::sync::{mpsc, oneshot};

/// Why a connection left.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaveReason {
    /// Peer closed the socket or went away.
    Closed,
    /// Socket error.
    Error,
    /// No pong within the liveness window.
    Timeout,
    /// The hub closed it.
    Evicted,
}

#[derive(Debug, thiserror::Error)]
pub enum HubError {
    #[error("invalid rat id: {0}")]
    Validation(#[from] RatIdError),
    #[error("rat {0} already has a live connection")]
    DuplicateConnection(RatId),
    #[error("handshake timed out")]
    Timeout,
    #[error("hub is not running")]
    Closed,
}

/// A registered connection, handed to the transport.
#[derive(Debug)]
pub struct Registration {
    pub id: ConnectionId,
    pub rat_id: RatId,
    pub replaced: Option<ConnectionId>,
    /// Replay frames first, then live broadcasts.
    pub outbound: mpsc::UnboundedReceiver<Outbound>,
}

enum Command {
    Register {
        rat_id: RatId,
        tx: mpsc::UnboundedSender<Outbound>,
        reply: oneshot::Sender<Result<(ConnectionId, Option<ConnectionId>), HubError>>,
    },
    Unregister {
        id: ConnectionId,
        reason: LeaveReason,
    },
    Broadcast(OffChainMessage),
    ListActive(oneshot::Sender<Vec<RatId>>),
    LatestEvents(oneshot::Sender<Vec<OffChainMessage>>),
    Shutdown,
}

/// Handle to the hub task.
#[derive(Clone)]
pub struct Hub {
    tx: mpsc::UnboundedSender<Command>,
}

impl Hub {
    /// Start the hub task. It runs until every handle is dropped.
    pub fn spawn(config: &HubConfig) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let registry = Registry::new(config.history_len, config.duplicate_policy);
        tokio::spawn(run(registry, rx));
        Self { tx }
    }

    /// Register a connection for `rat_id`.
    pub async fn register(&self, rat_id: &str) -> Result<Registration, HubError> {
        let rat_id: RatId = rat_id.parse()?;
        let (tx, outbound) = mpsc::unbounded_channel();
        let (reply, response) = oneshot::channel();

        self.send(Command::Register {
            rat_id: rat_id.clone(),
            tx,
            reply,
        })?;
        let (id, replaced) = response.await.map_err(|_| HubError::Closed)??;

        Ok(Registration {
            id,
            rat_id,
            replaced,
            outbound,
        })
    }

    /// Remove a connection. Unknown ids are ignored.
    pub fn unregister(&self, id: ConnectionId, reason: LeaveReason) {
        let _ = self.send(Command::Unregister { id, reason });
    }

    /// Fan `msg` out to every connection registered at this point.
    pub fn broadcast(&self, msg: OffChainMessage) {
        let _ = self.send(Command::Broadcast(msg));
    }

    /// Connected rat ids, oldest first.
    pub async fn list_active(&self) -> Result<Vec<RatId>, HubError> {
        let (reply, response) = oneshot::channel();
        self.send(Command::ListActive(reply))?;
        response.await.map_err(|_| HubError::Closed)
    }

    /// The replay history, oldest first.
    pub async fn latest_events(&self) -> Result<Vec<OffChainMessage>, HubError> {
        let (reply, response) = oneshot::channel();
        self.send(Command::LatestEvents(reply))?;
        response.await.map_err(|_| HubError::Closed)
    }

    /// Close every connection and stop the hub task.
    pub fn shutdown(&self) {
        let _ = self.send(Command::Shutdown);
    }

    fn send(&self, command: Command) -> Result<(), HubError> {
        self.tx.send(command).map_err(|_| HubError::Closed)
    }
}

async fn run(mut registry: Registry, mut rx: mpsc::UnboundedReceiver<Command>) {
    while let Some(command) = rx.recv().await {
        match command {
            Command::Register { rat_id, tx, reply } => {
                let result = registry.register(rat_id.clone(), tx);
                match result {
                    Ok(registered) => {
                        tracing::info!(
                            rat_id = %rat_id,
                            id = registered.id,
                            replayed = registered.replayed,
                            "Connection registered"
                        );
                        if reply.send(Ok((registered.id, registered.replaced))).is_err() {
                            // Caller gave up (handshake timeout); undo.
                            registry.unregister(registered.id);
                        }
                        announce(&mut registry);
                    }
                    Err(e) => {
                        tracing::warn!(rat_id = %rat_id, "Registration refused: {}", e);
                        let _ = reply.send(Err(e));
                    }
                }
            }

            Command::Unregister { id, reason } => {
                let connected_at = registry.connected_at(id);
                if let Some(rat_id) = registry.unregister(id) {
                    let connected_ms = connected_at
                        .and_then(|at| at.elapsed().ok())
                        .map_or(0, |lasted| lasted.as_millis() as u64);
                    tracing::info!(
                        rat_id = %rat_id,
                        id,
                        ?reason,
                        connected_ms,
                        "Connection unregistered"
                    );
                    announce(&mut registry);
                }
            }

            Command::Broadcast(msg) => {
                tracing::debug!(kind = msg.kind(), "Broadcasting");
                let failed = registry.broadcast(&msg);
                if !failed.is_empty() {
                    for e in &failed {
                        tracing::warn!("{}", e);
                    }
                    announce(&mut registry);
                }
            }

            Command::ListActive(reply) => {
                let _ = reply.send(registry.list_active());
            }

            Command::LatestEvents(reply) => {
                let _ = reply.send(registry.latest_events());
            }

            Command::Shutdown => {
                tracing::info!(connections = registry.len(), "Hub shutting down");
                registry.close_all(CloseReason::Shutdown);
                break;
            }
        }
    }
}

/// Tell everyone the client list changed.
fn announce(registry: &mut Registry) {
    loop {
        let clients = registry.client_list();
        let failed = registry.broadcast(&clients);
        if failed.is_empty() {
            break;
        }
        for e in &failed {
            tracing::warn!("{}", e);
        }
    }
}

//! Connection Registry
//!
//! Tracks live connections, which identity each is bound to, and owns the
//! per-connection outbound queues that broadcasts fan out into.
//!
//! Queues are bounded. Pushing never waits: a connection whose queue is
//! full (a slow reader) or closed (a dead writer) is evicted on the spot,
//! which drops its sender and lets its writer task shut the socket.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::RwLock;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::core::identity::Identity;
use crate::network::protocol::ServerMessage;

/// Unique connection identifier.
pub type ConnectionId = Uuid;

/// An item in a connection's outbound queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    /// Pre-serialized JSON frame, shared between all recipients.
    Text(Arc<str>),
    /// Keepalive ping.
    Ping,
}

impl Outbound {
    /// Decode a text frame back into a message.
    pub fn decode(&self) -> Option<ServerMessage> {
        match self {
            Self::Text(text) => ServerMessage::from_json(text).ok(),
            Self::Ping => None,
        }
    }
}

/// Registry errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    /// Connection is not registered (disconnected or evicted).
    #[error("unknown connection {0}")]
    UnknownConnection(ConnectionId),
}

/// A registered connection.
#[derive(Debug)]
struct ConnectionEntry {
    /// Outbound queue.
    sender: mpsc::Sender<Outbound>,
    /// Bound identity.
    identity: Option<Identity>,
    /// Peer address, when known.
    addr: Option<SocketAddr>,
    /// Registration time.
    connected_at: Instant,
    /// Last inbound frame.
    last_activity: Instant,
}

#[derive(Debug, Default)]
struct RegistryState {
    connections: BTreeMap<ConnectionId, ConnectionEntry>,
    /// Live connections per bound identity.
    identities: BTreeMap<Identity, usize>,
}

impl RegistryState {
    fn acquire(&mut self, identity: &Identity) -> bool {
        let count = self.identities.entry(identity.clone()).or_insert(0);
        *count += 1;
        *count == 1
    }

    fn release(&mut self, identity: &Identity) -> bool {
        match self.identities.get_mut(identity) {
            Some(count) if *count > 1 => {
                *count -= 1;
                false
            }
            Some(_) => {
                self.identities.remove(identity);
                true
            }
            None => false,
        }
    }

    /// Remove a connection; returns its entry and whether the online count changed.
    fn remove(&mut self, id: &ConnectionId) -> Option<(ConnectionEntry, bool)> {
        let entry = self.connections.remove(id)?;
        let changed = entry
            .identity
            .as_ref()
            .map(|identity| self.release(identity))
            .unwrap_or(false);
        Some((entry, changed))
    }
}

/// Result of binding a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindOutcome {
    /// Identity the connection was bound to before, if different.
    pub previous: Option<Identity>,
    /// Whether the distinct-identity count changed.
    pub online_changed: bool,
}

/// Result of removing a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Unregistered {
    /// Identity the connection was bound to.
    pub identity: Option<Identity>,
    /// Peer address, when known.
    pub addr: Option<SocketAddr>,
    /// Whether the distinct-identity count changed.
    pub online_changed: bool,
    /// How long the connection lived.
    pub lifetime: Duration,
}

/// Result of a fan-out.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    /// Queues the message was pushed into.
    pub delivered: usize,
    /// Connections evicted because their queue was full or closed.
    pub evicted: Vec<ConnectionId>,
    /// Whether evictions changed the distinct-identity count.
    pub online_changed: bool,
}

/// Live connections and their outbound queues.
pub struct ConnectionRegistry {
    state: RwLock<RegistryState>,
    queue_capacity: usize,
}

impl ConnectionRegistry {
    /// Create a registry whose queues hold `queue_capacity` items.
    pub fn new(queue_capacity: usize) -> Self {
        Self {
            state: RwLock::new(RegistryState::default()),
            queue_capacity: queue_capacity.max(1),
        }
    }

    /// Register a connection and hand back the receiving end of its queue.
    pub async fn register(&self, addr: Option<SocketAddr>) -> (ConnectionId, mpsc::Receiver<Outbound>) {
        let (sender, receiver) = mpsc::channel(self.queue_capacity);
        let id = Uuid::new_v4();
        let now = Instant::now();

        let mut state = self.state.write().await;
        state.connections.insert(id, ConnectionEntry {
            sender,
            identity: None,
            addr,
            connected_at: now,
            last_activity: now,
        });

        (id, receiver)
    }

    /// Bind a connection to an identity.
    ///
    /// Binding the same identity again is a no-op; binding a different one
    /// releases the previous identity first.
    pub async fn bind(&self, id: ConnectionId, identity: Identity) -> Result<BindOutcome, RegistryError> {
        let mut state = self.state.write().await;
        let previous = state
            .connections
            .get(&id)
            .ok_or(RegistryError::UnknownConnection(id))?
            .identity
            .clone();

        if previous.as_ref() == Some(&identity) {
            return Ok(BindOutcome {
                previous: None,
                online_changed: false,
            });
        }

        let released = previous
            .as_ref()
            .map(|old| state.release(old))
            .unwrap_or(false);
        let acquired = state.acquire(&identity);
        if let Some(entry) = state.connections.get_mut(&id) {
            entry.identity = Some(identity);
        }

        Ok(BindOutcome {
            previous,
            online_changed: released != acquired,
        })
    }

    /// Remove a connection. `None` if it was already gone.
    pub async fn unregister(&self, id: ConnectionId) -> Option<Unregistered> {
        let mut state = self.state.write().await;
        let (entry, online_changed) = state.remove(&id)?;
        Some(Unregistered {
            identity: entry.identity,
            addr: entry.addr,
            online_changed,
            lifetime: entry.connected_at.elapsed(),
        })
    }

    /// Forcibly drop a connection; its writer sees the queue close.
    pub async fn evict(&self, id: ConnectionId) -> Option<Unregistered> {
        let removed = self.unregister(id).await;
        if removed.is_some() {
            debug!("Evicted connection {}", id);
        }
        removed
    }

    /// Identity bound to a connection.
    pub async fn identity_of(&self, id: ConnectionId) -> Option<Identity> {
        let state = self.state.read().await;
        state.connections.get(&id)?.identity.clone()
    }

    /// Whether a connection is registered.
    pub async fn contains(&self, id: ConnectionId) -> bool {
        self.state.read().await.connections.contains_key(&id)
    }

    /// Record inbound activity.
    pub async fn touch(&self, id: ConnectionId) {
        let mut state = self.state.write().await;
        if let Some(entry) = state.connections.get_mut(&id) {
            entry.last_activity = Instant::now();
        }
    }

    /// Connections with no inbound frame for longer than `timeout`.
    pub async fn idle_connections(&self, timeout: Duration) -> Vec<ConnectionId> {
        let now = Instant::now();
        let state = self.state.read().await;
        state
            .connections
            .iter()
            .filter(|(_, entry)| now.duration_since(entry.last_activity) > timeout)
            .map(|(id, _)| *id)
            .collect()
    }

    /// Push a message to one connection.
    pub async fn send_to(&self, id: ConnectionId, message: &ServerMessage) -> bool {
        let Some(frame) = Self::encode(message) else {
            return false;
        };
        self.push(|entry_id, _| *entry_id == id, Outbound::Text(frame)).await.delivered > 0
    }

    /// Push a message to every connection bound to `identity`.
    pub async fn send_to_identity(&self, identity: &Identity, message: &ServerMessage) -> usize {
        let Some(frame) = Self::encode(message) else {
            return 0;
        };
        self.push(
            |_, entry| entry.identity.as_ref() == Some(identity),
            Outbound::Text(frame),
        )
        .await
        .delivered
    }

    /// Push a message to every connection except `exclude`.
    pub async fn broadcast(&self, message: &ServerMessage, exclude: Option<ConnectionId>) -> BroadcastReport {
        let Some(frame) = Self::encode(message) else {
            return BroadcastReport::default();
        };
        self.push(|id, _| Some(*id) != exclude, Outbound::Text(frame)).await
    }

    /// Queue a keepalive ping on every connection.
    pub async fn ping_all(&self) -> BroadcastReport {
        self.push(|_, _| true, Outbound::Ping).await
    }

    /// Distinct identities with at least one live connection.
    pub async fn active_identity_count(&self) -> usize {
        self.state.read().await.identities.len()
    }

    /// Live connections for one identity.
    pub async fn connections_for(&self, identity: &Identity) -> usize {
        let state = self.state.read().await;
        state.identities.get(identity).copied().unwrap_or(0)
    }

    /// Raw connection count.
    pub async fn connection_count(&self) -> usize {
        self.state.read().await.connections.len()
    }

    fn encode(message: &ServerMessage) -> Option<Arc<str>> {
        match message.to_json() {
            Ok(text) => Some(Arc::from(text)),
            Err(e) => {
                error!("Failed to serialize message: {}", e);
                None
            }
        }
    }

    /// Push `item` into every matching queue without waiting, then evict
    /// the connections that could not take it.
    async fn push<F>(&self, mut matches: F, item: Outbound) -> BroadcastReport
    where
        F: FnMut(&ConnectionId, &ConnectionEntry) -> bool,
    {
        let mut report = BroadcastReport::default();

        {
            let state = self.state.read().await;
            for (id, entry) in state.connections.iter() {
                if !matches(id, entry) {
                    continue;
                }
                match entry.sender.try_send(item.clone()) {
                    Ok(()) => report.delivered += 1,
                    Err(TrySendError::Full(_)) => {
                        warn!("Outbound queue full for {}, disconnecting", id);
                        report.evicted.push(*id);
                    }
                    Err(TrySendError::Closed(_)) => report.evicted.push(*id),
                }
            }
        }

        if !report.evicted.is_empty() {
            let mut state = self.state.write().await;
            for id in &report.evicted {
                if let Some((_, changed)) = state.remove(id) {
                    report.online_changed |= changed;
                }
            }
        }

        report
    }
}

//! Who is reachable right now.
//!
//! One entry per user. Entries live in a sharded concurrent map, so
//! operations on different users do not contend and no lock is ever held
//! across an await: handles are cloned out under the shard lock and used
//! after it is released. Every entry carries the generation it was installed
//! with; removals triggered by a failed send only remove that generation, so
//! a send racing a reconnect can never evict the newer connection.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use harvest_core::errors::DeliveryError;
use harvest_core::ids::{Generation, UserId};
use harvest_core::protocol::OutboundMessage;
use tracing::{debug, error, info, warn};

/// Failure reported by a transport handle.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct TransportError(pub String);

impl TransportError {
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }
}

/// A live duplex channel to one client.
#[async_trait]
pub trait ConnectionHandle: Send + Sync {
    /// Deliver one encoded message. Must not block longer than the
    /// transport's own send timeout.
    async fn send(&self, payload: Arc<String>) -> Result<(), TransportError>;

    /// Ask the transport to close. Best-effort.
    async fn close(&self) -> Result<(), TransportError>;

    /// Time since the client last showed signs of life.
    fn idle_for(&self) -> Duration {
        Duration::ZERO
    }
}

struct Registered {
    generation: Generation,
    handle: Arc<dyn ConnectionHandle>,
}

/// Registry of connected users. Construct once at startup and share via `Arc`.
pub struct ConnectionRegistry {
    connections: DashMap<UserId, Registered>,
    generations: AtomicU64,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self {
            connections: DashMap::new(),
            generations: AtomicU64::new(0),
        }
    }

    /// Install `handle` as the user's connection, displacing any previous one.
    ///
    /// The swap is a single map operation; the displaced handle is closed
    /// after it is no longer reachable through the registry.
    pub async fn connect(&self, user_id: UserId, handle: Arc<dyn ConnectionHandle>) -> Generation {
        let (generation, displaced) = match self.connections.entry(user_id.clone()) {
            Entry::Occupied(mut slot) => {
                let generation = self.next_generation();
                let old = slot.insert(Registered { generation, handle });
                (generation, Some(old))
            }
            Entry::Vacant(slot) => {
                let generation = self.next_generation();
                let _ = slot.insert(Registered { generation, handle });
                (generation, None)
            }
        };

        if let Some(old) = displaced {
            info!(
                user_id = %user_id,
                previous_generation = %old.generation,
                generation = %generation,
                "user reconnecting, closing previous connection"
            );
            if let Err(e) = old.handle.close().await {
                error!(user_id = %user_id, error = %e, "error closing previous connection");
            }
        }

        info!(
            user_id = %user_id,
            generation = %generation,
            total = self.count(),
            "user connected"
        );
        generation
    }

    /// Remove the user's connection if present. Returns whether one was removed.
    pub fn disconnect(&self, user_id: &UserId) -> bool {
        let removed = self.connections.remove(user_id).is_some();
        if removed {
            info!(user_id = %user_id, total = self.count(), "user disconnected");
        }
        removed
    }

    /// Remove the user's connection only if it is still `generation`.
    ///
    /// Transport tasks call this when their socket ends; after a reconnect
    /// the old task must not remove its successor.
    pub fn disconnect_generation(&self, user_id: &UserId, generation: Generation) -> bool {
        let removed = self.remove_if_current(user_id, generation);
        if removed {
            info!(user_id = %user_id, generation = %generation, total = self.count(), "user disconnected");
        } else {
            debug!(user_id = %user_id, generation = %generation, "stale disconnect ignored");
        }
        removed
    }

    /// Encode and deliver `message` to one user.
    ///
    /// A transport failure removes the entry that failed.
    pub async fn send_to(&self, user_id: &UserId, message: &OutboundMessage) -> Result<(), DeliveryError> {
        let payload = match message.to_json() {
            Ok(json) => Arc::new(json),
            Err(e) => {
                error!(user_id = %user_id, error = %e, "failed to encode message");
                return Err(DeliveryError::Transport(format!("encode: {e}")));
            }
        };
        self.send_payload(user_id, payload).await
    }

    /// Deliver a pre-encoded payload to one user.
    pub async fn send_payload(&self, user_id: &UserId, payload: Arc<String>) -> Result<(), DeliveryError> {
        let Some((generation, handle)) = self.lookup(user_id) else {
            debug!(user_id = %user_id, "send skipped, user not connected");
            return Err(DeliveryError::NotConnected);
        };

        match handle.send(payload).await {
            Ok(()) => Ok(()),
            Err(e) => {
                warn!(user_id = %user_id, generation = %generation, error = %e, "send failed, dropping connection");
                let _ = self.remove_if_current(user_id, generation);
                Err(DeliveryError::Transport(e.to_string()))
            }
        }
    }

    /// Deliver `message` to every connected user except `exclude`.
    ///
    /// Works on a snapshot taken up front; users who disconnect meanwhile
    /// are simply skipped or fail. Each failed recipient is removed. Returns
    /// the number of successful deliveries.
    pub async fn broadcast(&self, message: &OutboundMessage, exclude: Option<&UserId>) -> usize {
        let payload = match message.to_json() {
            Ok(json) => Arc::new(json),
            Err(e) => {
                error!(error = %e, "failed to encode broadcast");
                return 0;
            }
        };

        let recipients: Vec<(UserId, Generation, Arc<dyn ConnectionHandle>)> = self
            .connections
            .iter()
            .filter(|entry| Some(entry.key()) != exclude)
            .map(|entry| (entry.key().clone(), entry.generation, Arc::clone(&entry.handle)))
            .collect();
        let attempted = recipients.len();

        let results = futures::future::join_all(recipients.into_iter().map(
            |(user_id, generation, handle)| {
                let payload = Arc::clone(&payload);
                async move {
                    let result = handle.send(payload).await;
                    (user_id, generation, result)
                }
            },
        ))
        .await;

        let mut delivered = 0;
        for (user_id, generation, result) in results {
            match result {
                Ok(()) => delivered += 1,
                Err(e) => {
                    error!(user_id = %user_id, error = %e, "error broadcasting, dropping connection");
                    let _ = self.remove_if_current(&user_id, generation);
                }
            }
        }

        debug!(
            kind = message.kind(),
            attempted,
            delivered,
            "broadcast complete"
        );
        delivered
    }

    pub fn is_connected(&self, user_id: &UserId) -> bool {
        self.connections.contains_key(user_id)
    }

    /// Generation of the user's current connection.
    pub fn generation(&self, user_id: &UserId) -> Option<Generation> {
        self.connections.get(user_id).map(|entry| entry.generation)
    }

    pub fn list_connected(&self) -> BTreeSet<UserId> {
        self.connections.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Number of connected users.
    pub fn count(&self) -> usize {
        self.connections.len()
    }

    /// Close and remove connections idle for longer than `max_idle`.
    pub async fn sweep_idle(&self, max_idle: Duration) -> usize {
        let idle: Vec<(UserId, Generation, Arc<dyn ConnectionHandle>)> = self
            .connections
            .iter()
            .filter(|entry| entry.handle.idle_for() > max_idle)
            .map(|entry| (entry.key().clone(), entry.generation, Arc::clone(&entry.handle)))
            .collect();

        let mut removed = 0;
        for (user_id, generation, handle) in idle {
            if !self.remove_if_current(&user_id, generation) {
                continue;
            }
            removed += 1;
            info!(user_id = %user_id, generation = %generation, "cleaned up idle connection");
            if let Err(e) = handle.close().await {
                debug!(user_id = %user_id, error = %e, "close of idle connection failed");
            }
        }
        removed
    }

    /// Close every connection and empty the registry. Used at shutdown.
    pub async fn close_all(&self) -> usize {
        let users: Vec<UserId> = self.connections.iter().map(|entry| entry.key().clone()).collect();
        let mut closed = 0;
        for user_id in users {
            let Some((_, registered)) = self.connections.remove(&user_id) else {
                continue;
            };
            closed += 1;
            if let Err(e) = registered.handle.close().await {
                debug!(user_id = %user_id, error = %e, "close during shutdown failed");
            }
        }
        info!(closed, "closed all connections");
        closed
    }

    fn lookup(&self, user_id: &UserId) -> Option<(Generation, Arc<dyn ConnectionHandle>)> {
        self.connections
            .get(user_id)
            .map(|entry| (entry.generation, Arc::clone(&entry.handle)))
    }

    fn remove_if_current(&self, user_id: &UserId, generation: Generation) -> bool {
        self.connections
            .remove_if(user_id, |_, registered| registered.generation == generation)
            .is_some()
    }

    fn next_generation(&self) -> Generation {
        Generation::from(self.generations.fetch_add(1, Ordering::SeqCst) + 1)
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

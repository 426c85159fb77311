use std::collections::HashSet;
use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::handlers::{HandlerId, HandlerRegistry};
use super::message::Envelope;

pub type ConnectionId = Uuid;

/// Writer side of one socket. The socket task drains the receiver.
pub type Outbox = mpsc::UnboundedSender<String>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    /// Open, no `auth` received yet.
    Open,
    Authenticated(String),
    Closed,
}

/// Inbound application message handed to handlers registered with [`Hub::on`].
#[derive(Debug, Clone)]
pub struct Inbound {
    pub connection_id: ConnectionId,
    /// `None` when the frame arrived before the handshake.
    pub user_id: Option<String>,
    pub message: Envelope,
}

pub type ServerHandler = dyn Fn(&Hub, &Inbound) + Send + Sync;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct HubStats {
    pub connections: usize,
    pub authenticated: usize,
    pub users: usize,
}

/// Delivery of a message to wherever a user's connections live. The hub is
/// the single-process implementation; a multi-instance deployment would put
/// a shared broker behind this trait.
pub trait Publisher: Send + Sync {
    /// Returns how many connections the message was written to.
    fn publish(&self, user_id: &str, message: &Envelope) -> usize;
}

struct Connection {
    outbox: Outbox,
    user_id: Option<String>,
}

/// Registry of live connections and the users they are bound to.
pub struct Hub {
    connections: DashMap<ConnectionId, Connection>,
    users: DashMap<String, HashSet<ConnectionId>>,
    handlers: HandlerRegistry<ServerHandler>,
}

impl Hub {
    /// A hub that answers `ping` with `pong`.
    pub fn new() -> Self {
        let hub = Self::empty();
        hub.on("ping", |hub, inbound| {
            hub.send_to_connection(inbound.connection_id, &Envelope::new("pong"));
        });
        hub
    }

    /// A hub without any application handlers.
    pub fn empty() -> Self {
        Self {
            connections: DashMap::new(),
            users: DashMap::new(),
            handlers: HandlerRegistry::new(),
        }
    }

    /// Registers a handler for inbound frames of type `kind`.
    pub fn on<F>(&self, kind: &str, handler: F) -> HandlerId
    where
        F: Fn(&Hub, &Inbound) + Send + Sync + 'static,
    {
        self.handlers.add(kind, Arc::new(handler))
    }

    pub fn off(&self, kind: &str, id: HandlerId) -> bool {
        self.handlers.remove(kind, id)
    }

    /// Adds a freshly opened, unauthenticated connection.
    pub fn register(&self, outbox: Outbox) -> ConnectionId {
        let id = Uuid::new_v4();
        self.connections.insert(
            id,
            Connection {
                outbox,
                user_id: None,
            },
        );
        debug!(connection = %id, "connection opened");
        id
    }

    /// Binds a connection to `user_id`. Only the first successful call counts.
    pub fn authenticate(&self, id: ConnectionId, user_id: &str) -> bool {
        if user_id.trim().is_empty() {
            warn!(connection = %id, "ignoring auth with empty user id");
            return false;
        }
        let Some(mut conn) = self.connections.get_mut(&id) else {
            debug!(connection = %id, "auth for unknown connection");
            return false;
        };
        if let Some(bound) = &conn.user_id {
            warn!(connection = %id, bound = %bound, requested = user_id, "connection already authenticated");
            return false;
        }
        conn.user_id = Some(user_id.to_string());

        // lock order is connections then users, same as unregister
        self.users.entry(user_id.to_string()).or_default().insert(id);
        drop(conn);

        info!(connection = %id, user = user_id, "connection authenticated");
        true
    }

    /// Drops a connection from every mapping. Safe to call more than once.
    pub fn unregister(&self, id: ConnectionId) -> bool {
        let Some((_, conn)) = self.connections.remove(&id) else {
            return false;
        };
        if let Some(user_id) = conn.user_id {
            if let Entry::Occupied(mut entry) = self.users.entry(user_id) {
                entry.get_mut().remove(&id);
                if entry.get().is_empty() {
                    entry.remove();
                }
            }
        }
        debug!(connection = %id, "connection closed");
        true
    }

    pub fn state(&self, id: ConnectionId) -> ConnectionState {
        match self.connections.get(&id) {
            Some(conn) => match &conn.user_id {
                Some(user) => ConnectionState::Authenticated(user.clone()),
                None => ConnectionState::Open,
            },
            None => ConnectionState::Closed,
        }
    }

    pub fn user_of(&self, id: ConnectionId) -> Option<String> {
        self.connections.get(&id).and_then(|c| c.user_id.clone())
    }

    pub fn connections_for(&self, user_id: &str) -> usize {
        self.users.get(user_id).map_or(0, |set| set.len())
    }

    /// Writes `message` to every authenticated connection of `user_id`.
    /// A user without connections is a no-op.
    pub fn send_to_user(&self, user_id: &str, message: &Envelope) -> usize {
        let targets: Vec<ConnectionId> = match self.users.get(user_id) {
            Some(set) => set.iter().copied().collect(),
            None => return 0,
        };
        self.deliver(&targets, message)
    }

    /// Writes `message` to every authenticated connection.
    pub fn broadcast(&self, message: &Envelope) -> usize {
        let targets: Vec<ConnectionId> = self
            .connections
            .iter()
            .filter(|c| c.user_id.is_some())
            .map(|c| *c.key())
            .collect();
        self.deliver(&targets, message)
    }

    pub fn send_to_connection(&self, id: ConnectionId, message: &Envelope) -> bool {
        self.deliver(&[id], message) == 1
    }

    /// Routes one inbound text frame. Malformed frames are logged and dropped.
    pub fn handle_text(&self, id: ConnectionId, text: &str) {
        let message = match Envelope::parse(text) {
            Ok(message) => message,
            Err(e) => {
                warn!(connection = %id, error = %e, "discarding malformed frame");
                return;
            }
        };

        if message.is_auth() {
            match message.auth_user_id() {
                Some(user_id) => {
                    self.authenticate(id, &user_id);
                }
                None => warn!(connection = %id, "auth frame without a usable userId"),
            }
            return;
        }

        let handlers = self.handlers.handlers_for(&message.kind);
        if handlers.is_empty() {
            debug!(connection = %id, kind = %message.kind, "no handler for frame type");
            return;
        }

        let inbound = Inbound {
            connection_id: id,
            user_id: self.user_of(id),
            message,
        };
        for handler in handlers {
            handler(self, &inbound);
        }
    }

    pub fn stats(&self) -> HubStats {
        let authenticated = self
            .connections
            .iter()
            .filter(|c| c.user_id.is_some())
            .count();
        HubStats {
            connections: self.connections.len(),
            authenticated,
            users: self.users.len(),
        }
    }

    fn deliver(&self, targets: &[ConnectionId], message: &Envelope) -> usize {
        if targets.is_empty() {
            return 0;
        }
        let text = match message.to_text() {
            Ok(text) => text,
            Err(e) => {
                warn!(kind = %message.kind, error = %e, "failed to encode outbound message");
                return 0;
            }
        };

        let mut delivered = 0;
        let mut dead = Vec::new();
        for id in targets {
            let sent = self
                .connections
                .get(id)
                .map(|conn| conn.outbox.send(text.clone()).is_ok());
            match sent {
                Some(true) => delivered += 1,
                Some(false) => dead.push(*id),
                None => {}
            }
        }

        for id in dead {
            debug!(connection = %id, "dropping connection with closed writer");
            self.unregister(id);
        }
        delivered
    }
}

impl Default for Hub {
    fn default() -> Self {
        Self::new()
    }
}

impl Publisher for Hub {
    fn publish(&self, user_id: &str, message: &Envelope) -> usize {
        self.send_to_user(user_id, message)
    }
}

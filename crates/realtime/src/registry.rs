//! Who is online: user identity to live connection handles, and back.

use std::{
    collections::{HashMap, HashSet},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
};

use chrono::{DateTime, Utc};
use shared::{
    domain::{ConnectionId, UserId, UserProfile},
    protocol::ServerEvent,
};
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, warn};

pub type Outbox = mpsc::Sender<ServerEvent>;

/// One authenticated client transport session.
#[derive(Debug)]
pub struct Connection {
    pub id: ConnectionId,
    pub user: UserProfile,
    pub authenticated_at: DateTime<Utc>,
    outbox: Outbox,
}

impl Connection {
    pub fn new(id: ConnectionId, user: UserProfile, outbox: Outbox) -> Self {
        Self {
            id,
            user,
            authenticated_at: Utc::now(),
            outbox,
        }
    }

    pub fn user_id(&self) -> UserId {
        self.user.user_id
    }

    /// Queues an event for the socket writer. A full queue drops the event
    /// for this client only.
    pub fn send(&self, event: ServerEvent) -> bool {
        match self.outbox.try_send(event) {
            Ok(()) => true,
            Err(TrySendError::Full(event)) => {
                warn!(
                    connection_id = %self.id,
                    user_id = %self.user.user_id,
                    event = event.name(),
                    "outbox full; dropping event"
                );
                false
            }
            Err(TrySendError::Closed(_)) => {
                debug!(connection_id = %self.id, "outbox closed");
                false
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct Unregistered {
    pub connection: Arc<Connection>,
    /// Live connections the user still has after this one went away.
    pub remaining: usize,
}

#[derive(Debug, Default)]
struct RegistryInner {
    connections: HashMap<ConnectionId, Arc<Connection>>,
    by_user: HashMap<UserId, HashSet<ConnectionId>>,
}

#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    inner: Mutex<RegistryInner>,
    next_id: AtomicU64,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, RegistryInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn next_connection_id(&self) -> ConnectionId {
        ConnectionId(self.next_id.fetch_add(1, Ordering::Relaxed) + 1)
    }

    /// Records the connection under its user. Returns `true` when this is the
    /// user's first live connection. Registering a handle that is already
    /// known changes nothing and returns `false`.
    pub fn register(&self, connection: Connection) -> bool {
        let mut inner = self.lock();
        if inner.connections.contains_key(&connection.id) {
            return false;
        }
        let id = connection.id;
        let user_id = connection.user_id();
        inner.connections.insert(id, Arc::new(connection));
        let handles = inner.by_user.entry(user_id).or_default();
        handles.insert(id);
        handles.len() == 1
    }

    /// Removes the handle from whatever user owns it. Unknown handles are a no-op.
    pub fn unregister(&self, id: ConnectionId) -> Option<Unregistered> {
        let mut inner = self.lock();
        let connection = inner.connections.remove(&id)?;
        let user_id = connection.user_id();
        let remaining = match inner.by_user.get_mut(&user_id) {
            Some(handles) => {
                handles.remove(&id);
                handles.len()
            }
            None => 0,
        };
        if remaining == 0 {
            inner.by_user.remove(&user_id);
        }
        Some(Unregistered {
            connection,
            remaining,
        })
    }

    pub fn is_online(&self, user_id: UserId) -> bool {
        self.lock()
            .by_user
            .get(&user_id)
            .is_some_and(|handles| !handles.is_empty())
    }

    pub fn connections_for(&self, user_id: UserId) -> HashSet<ConnectionId> {
        self.lock()
            .by_user
            .get(&user_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn get(&self, id: ConnectionId) -> Option<Arc<Connection>> {
        self.lock().connections.get(&id).cloned()
    }

    pub fn user_of(&self, id: ConnectionId) -> Option<UserId> {
        self.lock().connections.get(&id).map(|c| c.user_id())
    }

    pub fn online_users(&self) -> Vec<UserId> {
        self.lock().by_user.keys().copied().collect()
    }

    pub fn connection_count(&self) -> usize {
        self.lock().connections.len()
    }

    pub fn send_to(&self, id: ConnectionId, event: ServerEvent) -> bool {
        match self.get(id) {
            Some(connection) => connection.send(event),
            None => false,
        }
    }

    /// Delivers to every device the user has connected. Returns how many accepted it.
    pub fn send_to_user(&self, user_id: UserId, event: &ServerEvent) -> usize {
        let connections: Vec<Arc<Connection>> = {
            let inner = self.lock();
            inner
                .by_user
                .get(&user_id)
                .into_iter()
                .flatten()
                .filter_map(|id| inner.connections.get(id).cloned())
                .collect()
        };
        connections
            .iter()
            .filter(|connection| connection.send(event.clone()))
            .count()
    }
}

#[cfg(test)]
#[path = "tests/registry_tests.rs"]
mod tests;

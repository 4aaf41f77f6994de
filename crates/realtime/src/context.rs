use std::sync::Arc;

use shared::{
    domain::{ConnectionId, RoomId},
    protocol::ServerEvent,
};
use tracing::debug;

use crate::{
    auth::CredentialVerifier,
    error::RealtimeError,
    presence::PresenceWrites,
    push::PushGateway,
    registry::{Connection, ConnectionRegistry},
    rooms::RoomTracker,
    store::{ConversationStore, MessageStore, UserStore},
};

pub const MAX_MESSAGE_CHARS: usize = 2000;
pub const DEFAULT_MAX_CALL_PARTICIPANTS: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limits {
    pub max_message_chars: usize,
    /// `None` lets call rooms grow without bound.
    pub max_call_participants: Option<usize>,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_message_chars: MAX_MESSAGE_CHARS,
            max_call_participants: Some(DEFAULT_MAX_CALL_PARTICIPANTS),
        }
    }
}

/// Shared state behind every connection handler: the in-memory registry and
/// room index plus handles to the external collaborators.
#[derive(Clone)]
pub struct RealtimeContext {
    pub registry: Arc<ConnectionRegistry>,
    pub rooms: Arc<RoomTracker>,
    pub conversations: Arc<dyn ConversationStore>,
    pub messages: Arc<dyn MessageStore>,
    pub users: Arc<dyn UserStore>,
    pub verifier: Arc<dyn CredentialVerifier>,
    pub push: Arc<dyn PushGateway>,
    pub limits: Limits,
    pub(crate) presence_writes: Arc<PresenceWrites>,
}

impl RealtimeContext {
    /// Wires a single store that implements all three store interfaces.
    pub fn new<S>(
        store: S,
        verifier: Arc<dyn CredentialVerifier>,
        push: Arc<dyn PushGateway>,
        limits: Limits,
    ) -> Self
    where
        S: ConversationStore + MessageStore + UserStore + 'static,
    {
        let store = Arc::new(store);
        Self {
            registry: Arc::new(ConnectionRegistry::new()),
            rooms: Arc::new(RoomTracker::new()),
            conversations: store.clone(),
            messages: store.clone(),
            users: store,
            verifier,
            push,
            limits,
            presence_writes: Arc::new(PresenceWrites::new()),
        }
    }

    pub fn connection(&self, id: ConnectionId) -> Result<Arc<Connection>, RealtimeError> {
        self.registry
            .get(id)
            .ok_or_else(|| RealtimeError::unauthenticated("connection is not registered"))
    }

    /// Sends `event` to every member of `room` except `excluding`. Returns how
    /// many connections accepted it.
    pub fn broadcast(
        &self,
        room: &RoomId,
        event: &ServerEvent,
        excluding: Option<ConnectionId>,
    ) -> usize {
        let members = self.rooms.members_of(room);
        let mut delivered = 0;
        for member in members {
            if Some(member) == excluding {
                continue;
            }
            if self.registry.send_to(member, event.clone()) {
                delivered += 1;
            }
        }
        debug!(%room, event = event.name(), delivered, "broadcast");
        delivered
    }
}

//! Online/offline transitions and their side effects.
//!
//! A user is Online while at least one connection is registered. Only the
//! first connection flips the persisted flag on, and only the last one flips
//! it off; the in-memory registry stays authoritative for routing when those
//! writes fail or lag.
//!
//! Flag writes for one user are serialised and always write the registry's
//! state at the time the write starts, so an offline write delayed past a
//! reconnect is followed by a fresh online write instead of winning.

use std::collections::BTreeMap;

use shared::{
    domain::{ConnectionId, ConversationId, DeliveryStatus, MessageId, RoomId, UserId, UserProfile},
    protocol::ServerEvent,
};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::{
    auth,
    error::RealtimeError,
    registry::{Connection, Outbox},
    store::ConversationRecord,
    RealtimeContext,
};

const FLAG_LOCK_STRIPES: usize = 64;

/// Striped per-user locks around the persisted online flag.
pub struct PresenceWrites {
    stripes: Vec<Mutex<()>>,
}

impl PresenceWrites {
    pub fn new() -> Self {
        Self {
            stripes: (0..FLAG_LOCK_STRIPES).map(|_| Mutex::new(())).collect(),
        }
    }

    fn stripe(&self, user_id: UserId) -> &Mutex<()> {
        let index = user_id.0.rem_euclid(FLAG_LOCK_STRIPES as i64) as usize;
        &self.stripes[index]
    }
}

impl Default for PresenceWrites {
    fn default() -> Self {
        Self::new()
    }
}

/// Writes whatever the registry says now, under the user's stripe lock.
async fn persist_online_flag(ctx: &RealtimeContext, user_id: UserId) {
    let _guard = ctx.presence_writes.stripe(user_id).lock().await;
    let online = ctx.registry.is_online(user_id);
    if let Err(error) = ctx.users.set_online(user_id, online).await {
        warn!(%user_id, online, error = %error, "failed to persist online flag");
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Session {
    pub connection_id: ConnectionId,
    pub user: UserProfile,
}

pub async fn connect(
    ctx: &RealtimeContext,
    credential: &str,
    outbox: Outbox,
) -> Result<Session, RealtimeError> {
    let user = auth::authenticate(ctx, credential).await?;
    let user_id = user.user_id;
    let connection_id = ctx.registry.next_connection_id();
    let first = ctx
        .registry
        .register(Connection::new(connection_id, user.clone(), outbox));
    info!(%user_id, %connection_id, username = %user.username, first, "client connected");

    ctx.registry.send_to(
        connection_id,
        ServerEvent::Connected {
            connection_id,
            user: user.clone(),
        },
    );

    if first {
        persist_online_flag(ctx, user_id).await;
    }

    let conversations = match ctx.conversations.find_conversations_for_user(user_id).await {
        Ok(conversations) => conversations,
        Err(error) => {
            warn!(%user_id, error = %error, "failed to load conversations; rooms not joined");
            Vec::new()
        }
    };
    for conversation in &conversations {
        ctx.rooms.join(&RoomId::from(&conversation.id), connection_id);
    }
    debug!(%connection_id, rooms = conversations.len(), "joined conversation rooms");

    reconcile_deliveries(ctx, user_id, &conversations).await;

    Ok(Session { connection_id, user })
}

/// Advances everything still `sent` to this user to `delivered` and tells the
/// conversation rooms about it. Best effort.
pub async fn reconcile_deliveries(
    ctx: &RealtimeContext,
    user_id: UserId,
    conversations: &[ConversationRecord],
) {
    if conversations.is_empty() {
        return;
    }
    let ids: Vec<ConversationId> = conversations.iter().map(|c| c.id.clone()).collect();
    let pending = match ctx
        .messages
        .find_behind(&ids, user_id, DeliveryStatus::Delivered)
        .await
    {
        Ok(pending) => pending,
        Err(error) => {
            warn!(%user_id, error = %error, "failed to load undelivered messages");
            return;
        }
    };
    if pending.is_empty() {
        return;
    }

    let message_ids: Vec<MessageId> = pending.iter().map(|(_, id)| *id).collect();
    if let Err(error) = ctx
        .messages
        .update_delivery_status(&message_ids, DeliveryStatus::Delivered)
        .await
    {
        warn!(%user_id, error = %error, "failed to mark messages delivered");
        return;
    }

    let mut by_conversation: BTreeMap<ConversationId, Vec<MessageId>> = BTreeMap::new();
    for (conversation_id, message_id) in pending {
        by_conversation
            .entry(conversation_id)
            .or_default()
            .push(message_id);
    }
    for (conversation_id, message_ids) in by_conversation {
        let room = RoomId::from(&conversation_id);
        ctx.broadcast(
            &room,
            &ServerEvent::MessagesDelivered {
                conversation_id,
                message_ids,
            },
            None,
        );
    }
}

pub async fn disconnect(ctx: &RealtimeContext, connection_id: ConnectionId) {
    let Some(gone) = ctx.registry.unregister(connection_id) else {
        debug!(%connection_id, "disconnect for unknown connection");
        return;
    };
    let user_id = gone.connection.user_id();

    for room in ctx.rooms.leave_all(connection_id) {
        if let RoomId::Call(room_id) = &room {
            ctx.broadcast(
                &room,
                &ServerEvent::UserDisconnected {
                    room_id: room_id.clone(),
                    user_id,
                },
                None,
            );
            info!(%user_id, %room_id, "left call room on disconnect");
        }
    }

    if gone.remaining == 0 {
        persist_online_flag(ctx, user_id).await;
        info!(%user_id, %connection_id, "client disconnected; user offline");
    } else {
        info!(%user_id, %connection_id, remaining = gone.remaining, "client disconnected");
    }
}

#[cfg(test)]
#[path = "tests/presence_tests.rs"]
mod tests;

//! Message fan-out: validate, persist, then broadcast to the conversation room.

use chrono::Utc;
use shared::{
    domain::{ConnectionId, ConversationId, DeliveryStatus, MessageId, MessageKind, RoomId, UserId},
    protocol::{MessageContent, MessagePayload, SendMessageRequest, ServerEvent},
};
use tracing::{debug, info, warn};

use crate::{
    error::{upstream, RealtimeError},
    push,
    store::{ConversationRecord, NewMessage},
    RealtimeContext,
};

/// Loads the conversation and checks that `user_id` may act in it.
pub async fn ensure_participant(
    ctx: &RealtimeContext,
    conversation_id: &ConversationId,
    user_id: UserId,
) -> Result<ConversationRecord, RealtimeError> {
    if conversation_id.as_str().trim().is_empty() {
        return Err(RealtimeError::validation("conversation id is required"));
    }
    let conversation = ctx
        .conversations
        .find_conversation(conversation_id)
        .await
        .map_err(upstream)?
        .filter(|conversation| conversation.is_active)
        .ok_or_else(|| RealtimeError::not_found("conversation not found"))?;
    if !conversation.has_participant(user_id) {
        return Err(RealtimeError::authorization(
            "not a participant of this conversation",
        ));
    }
    Ok(conversation)
}

/// Checks the body and produces the content to persist: text trimmed, media
/// kept only for non-text messages.
pub fn validate_content(
    request: &SendMessageRequest,
    max_chars: usize,
) -> Result<MessageContent, RealtimeError> {
    let raw = request.content.as_deref().unwrap_or_default();
    let media = request
        .media
        .clone()
        .filter(|_| request.kind != MessageKind::Text);
    if raw.trim().is_empty() && media.is_none() {
        return Err(RealtimeError::validation("message content cannot be empty"));
    }
    if raw.chars().count() > max_chars {
        return Err(RealtimeError::validation(format!(
            "message content exceeds maximum length of {max_chars} characters"
        )));
    }
    Ok(MessageContent {
        text: raw.trim().to_string(),
        kind: request.kind,
        media,
    })
}

pub async fn join_conversation(
    ctx: &RealtimeContext,
    connection_id: ConnectionId,
    conversation_id: &ConversationId,
) -> Result<(), RealtimeError> {
    let connection = ctx.connection(connection_id)?;
    ensure_participant(ctx, conversation_id, connection.user_id()).await?;
    if ctx.rooms.join(&RoomId::from(conversation_id), connection_id) {
        info!(user_id = %connection.user_id(), %conversation_id, "joined conversation");
    }
    Ok(())
}

pub fn leave_conversation(
    ctx: &RealtimeContext,
    connection_id: ConnectionId,
    conversation_id: &ConversationId,
) -> bool {
    let left = ctx.rooms.leave(&RoomId::from(conversation_id), connection_id);
    if left {
        info!(%connection_id, %conversation_id, "left conversation");
    }
    left
}

pub async fn send_message(
    ctx: &RealtimeContext,
    connection_id: ConnectionId,
    request: SendMessageRequest,
) -> Result<MessagePayload, RealtimeError> {
    let sender = ctx.connection(connection_id)?;
    let sender_id = sender.user_id();
    let content = validate_content(&request, ctx.limits.max_message_chars)?;
    let conversation = ensure_participant(ctx, &request.conversation_id, sender_id).await?;

    let reply_to = match request.reply_to {
        Some(reply_id) => Some(
            ctx.messages
                .find_reply_target(reply_id, &conversation.id)
                .await
                .map_err(upstream)?
                .ok_or_else(|| {
                    RealtimeError::validation("reply target not found in this conversation")
                })?,
        ),
        None => None,
    };

    let status = if conversation
        .other_participants(sender_id)
        .any(|participant| ctx.registry.is_online(participant))
    {
        DeliveryStatus::Delivered
    } else {
        DeliveryStatus::Sent
    };

    let created_at = Utc::now();
    let message_id = ctx
        .messages
        .create(NewMessage {
            conversation_id: conversation.id.clone(),
            sender_id,
            content: content.clone(),
            reply_to: reply_to.as_ref().map(|target| target.id),
            status,
            created_at,
        })
        .await
        .map_err(upstream)?;

    if let Err(error) = ctx
        .conversations
        .update_last_message(&conversation.id, message_id, created_at)
        .await
    {
        warn!(conversation_id = %conversation.id, %message_id, error = %error, "failed to update last message");
    }

    let payload = MessagePayload {
        message_id,
        conversation_id: conversation.id.clone(),
        sender: sender.user.clone(),
        content,
        reply_to: reply_to.map(|target| target.reply_summary()),
        status,
        created_at,
    };
    let event = ServerEvent::ReceiveMessage {
        message: payload.clone(),
        conversation_id: conversation.id.clone(),
    };
    let room = RoomId::from(&conversation.id);
    let delivered = ctx.broadcast(&room, &event, None);
    if !ctx.rooms.contains(&room, connection_id) {
        sender.send(event);
    }
    info!(
        %sender_id,
        conversation_id = %conversation.id,
        %message_id,
        status = status.as_str(),
        delivered,
        "message sent"
    );

    let text = payload.content.text.clone();
    push::spawn_notifications(ctx, sender.user.clone(), conversation, text);
    Ok(payload)
}

/// Marks everything other participants sent in the conversation as read.
pub async fn mark_read(
    ctx: &RealtimeContext,
    connection_id: ConnectionId,
    conversation_id: &ConversationId,
) -> Result<Vec<MessageId>, RealtimeError> {
    let reader = ctx.connection(connection_id)?;
    let reader_id = reader.user_id();
    let conversation = ensure_participant(ctx, conversation_id, reader_id).await?;

    let message_ids: Vec<MessageId> = ctx
        .messages
        .find_behind(
            std::slice::from_ref(&conversation.id),
            reader_id,
            DeliveryStatus::Read,
        )
        .await
        .map_err(upstream)?
        .into_iter()
        .map(|(_, id)| id)
        .collect();
    if message_ids.is_empty() {
        return Ok(message_ids);
    }
    ctx.messages
        .update_delivery_status(&message_ids, DeliveryStatus::Read)
        .await
        .map_err(upstream)?;
    debug!(%reader_id, conversation_id = %conversation.id, count = message_ids.len(), "messages read");

    ctx.broadcast(
        &RoomId::from(&conversation.id),
        &ServerEvent::MessagesRead {
            conversation_id: conversation.id.clone(),
            reader_id,
            message_ids: message_ids.clone(),
        },
        None,
    );
    Ok(message_ids)
}

#[cfg(test)]
#[path = "tests/fanout_tests.rs"]
mod tests;

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use crate::auth::{mint_access_token, JwtConfig};
use realtime::store::{ConversationRecord, ConversationStore, MessageStore, UserStore};
use serde::{Deserialize, Serialize};
use shared::{
    domain::{ConversationId, MessageId, UserId, UserProfile},
    error::{ApiError, ErrorCode},
    protocol::{ConversationSummary, MessagePayload},
};
use storage::Storage;
use tracing::error;

pub const DEFAULT_PAGE_SIZE: u32 = 50;
pub const MAX_PAGE_SIZE: u32 = 100;

#[derive(Clone)]
pub struct ApiContext {
    pub storage: Storage,
    pub jwt: JwtConfig,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct LoginResponse {
    pub user_id: i64,
    pub access_token: String,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct AccountResponse {
    pub profile: UserProfile,
    pub is_online: bool,
    pub in_conversation: bool,
    pub has_push_token: bool,
    pub last_seen: Option<DateTime<Utc>>,
}

pub async fn login(ctx: &ApiContext, username: &str) -> Result<LoginResponse, ApiError> {
    if username.trim().is_empty() {
        return Err(ApiError::new(ErrorCode::Validation, "username cannot be empty"));
    }
    let user_id = ctx.storage.create_user(username).await.map_err(internal)?;
    let access_token = mint_access_token(&ctx.jwt, user_id)
        .map_err(|e| internal(anyhow::Error::new(e)))?;
    Ok(LoginResponse {
        user_id: user_id.0,
        access_token,
    })
}

pub async fn list_conversations(
    ctx: &ApiContext,
    user_id: UserId,
) -> Result<Vec<ConversationSummary>, ApiError> {
    let conversations = ctx
        .storage
        .find_conversations_for_user(user_id)
        .await
        .map_err(internal)?;
    Ok(conversations.into_iter().map(summary).collect())
}

pub async fn start_private_conversation(
    ctx: &ApiContext,
    user_id: UserId,
    other_user_id: UserId,
) -> Result<ConversationSummary, ApiError> {
    if user_id == other_user_id {
        return Err(ApiError::new(
            ErrorCode::Validation,
            "cannot start a conversation with yourself",
        ));
    }
    ctx.storage
        .find_profile(other_user_id)
        .await
        .map_err(internal)?
        .ok_or_else(|| ApiError::new(ErrorCode::NotFound, "user not found"))?;
    let conversation = ctx
        .storage
        .get_or_create_private_conversation(user_id, other_user_id)
        .await
        .map_err(internal)?;
    Ok(summary(conversation))
}

pub async fn start_group_conversation(
    ctx: &ApiContext,
    user_id: UserId,
    name: &str,
    members: &[UserId],
) -> Result<ConversationSummary, ApiError> {
    if name.trim().is_empty() {
        return Err(ApiError::new(ErrorCode::Validation, "group name cannot be empty"));
    }
    if !members.iter().any(|member| *member != user_id) {
        return Err(ApiError::new(
            ErrorCode::Validation,
            "a group needs at least one other member",
        ));
    }
    for member in members {
        ctx.storage
            .find_profile(*member)
            .await
            .map_err(internal)?
            .ok_or_else(|| ApiError::new(ErrorCode::NotFound, format!("user {member} not found")))?;
    }
    let conversation = ctx
        .storage
        .create_group_conversation(name, user_id, members)
        .await
        .map_err(internal)?;
    Ok(summary(conversation))
}

/// Hides the conversation for every participant; history is kept.
pub async fn archive_conversation(
    ctx: &ApiContext,
    user_id: UserId,
    conversation_id: &ConversationId,
) -> Result<(), ApiError> {
    let conversation = ctx
        .storage
        .find_conversation(conversation_id)
        .await
        .map_err(internal)?
        .filter(|conversation| conversation.is_active)
        .ok_or_else(|| ApiError::new(ErrorCode::NotFound, "conversation not found"))?;
    if !conversation.has_participant(user_id) {
        return Err(ApiError::new(
            ErrorCode::Forbidden,
            "not a participant of this conversation",
        ));
    }
    ctx.storage
        .deactivate_conversation(&conversation.id)
        .await
        .map_err(internal)?;
    Ok(())
}

pub async fn delete_message(
    ctx: &ApiContext,
    user_id: UserId,
    message_id: MessageId,
) -> Result<(), ApiError> {
    let deleted = ctx
        .storage
        .soft_delete_message(message_id, user_id)
        .await
        .map_err(internal)?;
    if !deleted {
        return Err(ApiError::new(ErrorCode::NotFound, "message not found"));
    }
    Ok(())
}

pub async fn account(ctx: &ApiContext, user_id: UserId) -> Result<AccountResponse, ApiError> {
    let profile = ctx
        .storage
        .find_profile(user_id)
        .await
        .map_err(internal)?
        .ok_or_else(|| ApiError::new(ErrorCode::NotFound, "user not found"))?;
    let flags = ctx
        .storage
        .presence_flags(user_id)
        .await
        .map_err(internal)?
        .ok_or_else(|| ApiError::new(ErrorCode::NotFound, "user not found"))?;
    Ok(AccountResponse {
        profile,
        is_online: flags.is_online,
        in_conversation: flags.in_conversation,
        has_push_token: flags.push_token.is_some(),
        last_seen: flags.last_seen,
    })
}

pub async fn update_profile(
    ctx: &ApiContext,
    user_id: UserId,
    first_name: &str,
    last_name: &str,
    avatar: Option<&str>,
) -> Result<(), ApiError> {
    let updated = ctx
        .storage
        .update_profile(user_id, first_name, last_name, avatar)
        .await
        .map_err(internal)?;
    if !updated {
        return Err(ApiError::new(ErrorCode::NotFound, "user not found"));
    }
    Ok(())
}

pub async fn list_messages(
    ctx: &ApiContext,
    user_id: UserId,
    conversation_id: &ConversationId,
    limit: u32,
    before: Option<MessageId>,
) -> Result<Vec<MessagePayload>, ApiError> {
    let conversation = ctx
        .storage
        .find_conversation(conversation_id)
        .await
        .map_err(internal)?
        .filter(|conversation| conversation.is_active)
        .ok_or_else(|| ApiError::new(ErrorCode::NotFound, "conversation not found"))?;
    if !conversation.has_participant(user_id) {
        return Err(ApiError::new(
            ErrorCode::Forbidden,
            "not a participant of this conversation",
        ));
    }

    let messages = ctx
        .storage
        .list_conversation_messages(&conversation.id, limit, before)
        .await
        .map_err(internal)?;

    let mut profile_cache: HashMap<UserId, UserProfile> = HashMap::new();
    let mut payloads = Vec::with_capacity(messages.len());
    for message in messages {
        let sender = match profile_cache.get(&message.sender_id) {
            Some(cached) => cached.clone(),
            None => {
                let resolved = ctx
                    .storage
                    .find_profile(message.sender_id)
                    .await
                    .map_err(internal)?
                    .unwrap_or_else(|| UserProfile {
                        user_id: message.sender_id,
                        username: "deleted user".to_string(),
                        ..UserProfile::default()
                    });
                profile_cache.insert(message.sender_id, resolved.clone());
                resolved
            }
        };
        let reply_to = match message.reply_to {
            Some(reply_id) => ctx
                .storage
                .find_reply_target(reply_id, &conversation.id)
                .await
                .map_err(internal)?
                .map(|target| target.reply_summary()),
            None => None,
        };

        payloads.push(MessagePayload {
            message_id: message.id,
            conversation_id: message.conversation_id,
            sender,
            content: message.content,
            reply_to,
            status: message.status,
            created_at: message.created_at,
        });
    }
    Ok(payloads)
}

pub async fn set_push_token(
    ctx: &ApiContext,
    user_id: UserId,
    token: Option<&str>,
) -> Result<(), ApiError> {
    let updated = ctx
        .storage
        .set_push_token(user_id, token)
        .await
        .map_err(internal)?;
    if !updated {
        return Err(ApiError::new(ErrorCode::NotFound, "user not found"));
    }
    Ok(())
}

pub async fn set_in_conversation(
    ctx: &ApiContext,
    user_id: UserId,
    in_conversation: bool,
) -> Result<(), ApiError> {
    let updated = ctx
        .storage
        .set_in_conversation(user_id, in_conversation)
        .await
        .map_err(internal)?;
    if !updated {
        return Err(ApiError::new(ErrorCode::NotFound, "user not found"));
    }
    Ok(())
}

fn summary(conversation: ConversationRecord) -> ConversationSummary {
    ConversationSummary {
        conversation_id: conversation.id,
        kind: conversation.kind,
        name: conversation.name,
        participants: conversation.participants,
        last_message_id: conversation.last_message_id,
        last_activity: conversation.last_activity,
        is_active: conversation.is_active,
    }
}

fn internal(err: anyhow::Error) -> ApiError {
    error!(error = %format!("{err:#}"), "request failed");
    ApiError::new(ErrorCode::Internal, "temporarily unable to complete request")
}

#[cfg(test)]
#[path = "tests/mod_tests.rs"]
mod tests;

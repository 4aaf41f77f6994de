//! Interfaces to the durable stores the realtime layer reads and writes.
//!
//! The stores stay the source of truth for anything that must outlive the
//! process; the realtime layer only keeps ephemeral connection and room state.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use shared::{
    domain::{ConversationId, ConversationKind, DeliveryStatus, MessageId, UserId, UserProfile},
    protocol::{MessageContent, ReplySummary},
};

#[derive(Debug, Clone, PartialEq)]
pub struct ConversationRecord {
    pub id: ConversationId,
    pub kind: ConversationKind,
    pub name: Option<String>,
    pub participants: Vec<UserId>,
    pub is_active: bool,
    pub last_message_id: Option<MessageId>,
    pub last_activity: DateTime<Utc>,
}

impl ConversationRecord {
    pub fn has_participant(&self, user_id: UserId) -> bool {
        self.participants.contains(&user_id)
    }

    pub fn other_participants(&self, user_id: UserId) -> impl Iterator<Item = UserId> + '_ {
        self.participants
            .iter()
            .copied()
            .filter(move |participant| *participant != user_id)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MessageRecord {
    pub id: MessageId,
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    pub content: MessageContent,
    pub reply_to: Option<MessageId>,
    pub status: DeliveryStatus,
    pub is_deleted: bool,
    pub created_at: DateTime<Utc>,
}

impl MessageRecord {
    pub fn reply_summary(&self) -> ReplySummary {
        ReplySummary {
            message_id: self.id,
            sender_id: self.sender_id,
            content: self.content.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewMessage {
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    pub content: MessageContent,
    pub reply_to: Option<MessageId>,
    pub status: DeliveryStatus,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushTarget {
    pub user_id: UserId,
    pub token: Option<String>,
    pub in_conversation: bool,
}

#[async_trait]
pub trait ConversationStore: Send + Sync {
    /// Active conversations the user participates in.
    async fn find_conversations_for_user(&self, user_id: UserId) -> Result<Vec<ConversationRecord>>;
    async fn find_conversation(&self, id: &ConversationId) -> Result<Option<ConversationRecord>>;
    async fn update_last_message(
        &self,
        id: &ConversationId,
        message_id: MessageId,
        at: DateTime<Utc>,
    ) -> Result<()>;
}

#[async_trait]
pub trait MessageStore: Send + Sync {
    async fn create(&self, message: NewMessage) -> Result<MessageId>;
    async fn find_by_id(&self, id: MessageId) -> Result<Option<MessageRecord>>;
    /// Only returns the message when it belongs to `conversation_id` and is not deleted.
    async fn find_reply_target(
        &self,
        id: MessageId,
        conversation_id: &ConversationId,
    ) -> Result<Option<MessageRecord>>;
    /// Messages in the given conversations, authored by someone other than
    /// `recipient`, whose status is still below `target`.
    async fn find_behind(
        &self,
        conversation_ids: &[ConversationId],
        recipient: UserId,
        target: DeliveryStatus,
    ) -> Result<Vec<(ConversationId, MessageId)>>;
    /// Advances each message to `status`; messages already at or past it are
    /// left untouched. Returns the number of messages that moved.
    async fn update_delivery_status(&self, ids: &[MessageId], status: DeliveryStatus)
        -> Result<u64>;
}

#[async_trait]
pub trait UserStore: Send + Sync {
    async fn find_profile(&self, user_id: UserId) -> Result<Option<UserProfile>>;
    /// Going offline also clears the "active in a conversation" flag.
    async fn set_online(&self, user_id: UserId, online: bool) -> Result<()>;
    async fn find_push_targets(&self, user_ids: &[UserId]) -> Result<Vec<PushTarget>>;
}

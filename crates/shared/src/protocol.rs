use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    domain::{
        ConnectionId, ConversationId, ConversationKind, DeliveryStatus, MessageId, MessageKind,
        UserId, UserProfile,
    },
    error::ApiError,
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ClientEvent {
    JoinConversation {
        conversation_id: ConversationId,
    },
    LeaveConversation {
        conversation_id: ConversationId,
    },
    SendMessage(SendMessageRequest),
    MarkRead {
        conversation_id: ConversationId,
    },
    #[serde(rename = "join-room")]
    JoinRoom {
        room_id: String,
    },
    #[serde(rename = "leave-room")]
    LeaveRoom {
        room_id: String,
    },
    Offer(SignalPayload),
    Answer(SignalPayload),
    #[serde(rename = "ice-candidate")]
    IceCandidate(SignalPayload),
    Signal(SignalPayload),
}

impl ClientEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::JoinConversation { .. } => "join_conversation",
            Self::LeaveConversation { .. } => "leave_conversation",
            Self::SendMessage(_) => "send_message",
            Self::MarkRead { .. } => "mark_read",
            Self::JoinRoom { .. } => "join-room",
            Self::LeaveRoom { .. } => "leave-room",
            Self::Offer(_) => "offer",
            Self::Answer(_) => "answer",
            Self::IceCandidate(_) => "ice-candidate",
            Self::Signal(_) => "signal",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SendMessageRequest {
    pub conversation_id: ConversationId,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default, rename = "type")]
    pub kind: MessageKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<MessageId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media: Option<MediaPayload>,
}

impl SendMessageRequest {
    pub fn text(conversation_id: impl Into<ConversationId>, text: impl Into<String>) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            content: Some(text.into()),
            kind: MessageKind::Text,
            reply_to: None,
            media: None,
        }
    }
}

/// Opaque WebRTC payload (SDP offer/answer, ICE candidate) bound for a call room.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalPayload {
    pub room_id: String,
    #[serde(default)]
    pub data: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelayedSignal {
    pub room_id: String,
    pub from: ConnectionId,
    pub data: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaPayload {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thumbnail: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageContent {
    pub text: String,
    #[serde(rename = "type")]
    pub kind: MessageKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media: Option<MediaPayload>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplySummary {
    pub message_id: MessageId,
    pub sender_id: UserId,
    pub content: MessageContent,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessagePayload {
    pub message_id: MessageId,
    pub conversation_id: ConversationId,
    pub sender: UserProfile,
    pub content: MessageContent,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<ReplySummary>,
    pub status: DeliveryStatus,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationSummary {
    pub conversation_id: ConversationId,
    pub kind: ConversationKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub participants: Vec<UserId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_message_id: Option<MessageId>,
    pub last_activity: DateTime<Utc>,
    pub is_active: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ServerEvent {
    Connected {
        connection_id: ConnectionId,
        user: UserProfile,
    },
    ReceiveMessage {
        message: MessagePayload,
        conversation_id: ConversationId,
    },
    MessagesDelivered {
        conversation_id: ConversationId,
        message_ids: Vec<MessageId>,
    },
    MessagesRead {
        conversation_id: ConversationId,
        reader_id: UserId,
        message_ids: Vec<MessageId>,
    },
    #[serde(rename = "user-connected")]
    UserConnected {
        room_id: String,
        user_id: UserId,
    },
    #[serde(rename = "receive-call")]
    ReceiveCall {
        room_id: String,
        user: UserProfile,
    },
    #[serde(rename = "user-disconnected")]
    UserDisconnected {
        room_id: String,
        user_id: UserId,
    },
    Offer(RelayedSignal),
    Answer(RelayedSignal),
    #[serde(rename = "ice-candidate")]
    IceCandidate(RelayedSignal),
    Signal(RelayedSignal),
    Error(ApiError),
}

impl ServerEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Connected { .. } => "connected",
            Self::ReceiveMessage { .. } => "receive_message",
            Self::MessagesDelivered { .. } => "messages_delivered",
            Self::MessagesRead { .. } => "messages_read",
            Self::UserConnected { .. } => "user-connected",
            Self::ReceiveCall { .. } => "receive-call",
            Self::UserDisconnected { .. } => "user-disconnected",
            Self::Offer(_) => "offer",
            Self::Answer(_) => "answer",
            Self::IceCandidate(_) => "ice-candidate",
            Self::Signal(_) => "signal",
            Self::Error(_) => "error",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn client_events_use_socket_event_names() {
        let raw = json!({
            "type": "send_message",
            "payload": { "conversation_id": "conv1", "content": "hi" }
        });
        let event: ClientEvent = serde_json::from_value(raw).expect("decode");
        assert_eq!(event, ClientEvent::SendMessage(SendMessageRequest::text("conv1", "hi")));

        let raw = json!({
            "type": "ice-candidate",
            "payload": { "room_id": "room1", "data": { "candidate": "c" } }
        });
        let event: ClientEvent = serde_json::from_value(raw).expect("decode");
        assert_eq!(event.name(), "ice-candidate");
    }

    #[test]
    fn receive_message_exposes_content_text() {
        let event = ServerEvent::ReceiveMessage {
            conversation_id: ConversationId::from("conv1"),
            message: MessagePayload {
                message_id: MessageId(7),
                conversation_id: ConversationId::from("conv1"),
                sender: UserProfile::default(),
                content: MessageContent {
                    text: "hi".into(),
                    kind: MessageKind::Text,
                    media: None,
                },
                reply_to: None,
                status: DeliveryStatus::Sent,
                created_at: Utc::now(),
            },
        };
        let value = serde_json::to_value(&event).expect("encode");
        assert_eq!(value["type"], "receive_message");
        assert_eq!(value["payload"]["message"]["content"]["text"], "hi");
        assert_eq!(value["payload"]["message"]["content"]["type"], "text");
        assert_eq!(value["payload"]["message"]["status"], "sent");
    }
}

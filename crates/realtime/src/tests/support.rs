#![allow(dead_code)]

use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
    time::Duration,
};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use shared::{
    domain::{
        ConversationId, ConversationKind, DeliveryStatus, MessageId, MessageKind, UserId,
        UserProfile,
    },
    protocol::{MessageContent, ServerEvent},
};
use tokio::sync::{mpsc, Mutex, Notify, Semaphore};

use crate::{
    auth::CredentialVerifier,
    error::RealtimeError,
    push::{PushGateway, PushNotification},
    store::{
        ConversationRecord, ConversationStore, MessageRecord, MessageStore, NewMessage, PushTarget,
        UserStore,
    },
    Limits, RealtimeContext, Session,
};

#[derive(Debug, Clone)]
pub struct UserRow {
    pub profile: UserProfile,
    pub online: bool,
    pub in_conversation: bool,
    pub push_token: Option<String>,
}

#[derive(Debug, Default)]
struct State {
    users: HashMap<UserId, UserRow>,
    conversations: HashMap<ConversationId, ConversationRecord>,
    messages: BTreeMap<MessageId, MessageRecord>,
    next_message_id: i64,
    fail_last_message: bool,
    fail_conversation_listing: bool,
}

#[derive(Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<State>>,
    offline_hold: Arc<Mutex<Option<OfflineHold>>>,
}

/// Parks the next `set_online(false)` until released.
#[derive(Clone)]
pub struct OfflineHold {
    started: Arc<Notify>,
    release: Arc<Semaphore>,
}

impl OfflineHold {
    pub async fn started(&self) {
        self.started.notified().await;
    }

    pub fn release(&self) {
        self.release.add_permits(1);
    }
}

impl MemoryStore {
    pub async fn hold_next_offline_write(&self) -> OfflineHold {
        let hold = OfflineHold {
            started: Arc::new(Notify::new()),
            release: Arc::new(Semaphore::new(0)),
        };
        *self.offline_hold.lock().await = Some(hold.clone());
        hold
    }

    pub async fn add_user(&self, id: i64, username: &str) -> UserProfile {
        let profile = UserProfile {
            user_id: UserId(id),
            username: username.to_string(),
            first_name: username.to_string(),
            last_name: "Tester".to_string(),
            avatar: None,
        };
        self.state.lock().await.users.insert(
            profile.user_id,
            UserRow {
                profile: profile.clone(),
                online: false,
                in_conversation: false,
                push_token: None,
            },
        );
        profile
    }

    pub async fn add_conversation(&self, id: &str, participants: &[i64]) -> ConversationId {
        let conversation_id = ConversationId::from(id);
        let record = ConversationRecord {
            id: conversation_id.clone(),
            kind: if participants.len() == 2 {
                ConversationKind::Private
            } else {
                ConversationKind::Group
            },
            name: None,
            participants: participants.iter().copied().map(UserId).collect(),
            is_active: true,
            last_message_id: None,
            last_activity: Utc::now(),
        };
        self.state
            .lock()
            .await
            .conversations
            .insert(conversation_id.clone(), record);
        conversation_id
    }

    pub async fn deactivate(&self, id: &ConversationId) {
        if let Some(conversation) = self.state.lock().await.conversations.get_mut(id) {
            conversation.is_active = false;
        }
    }

    pub async fn insert_message(
        &self,
        conversation_id: &ConversationId,
        sender: i64,
        text: &str,
        status: DeliveryStatus,
    ) -> MessageId {
        self.create(NewMessage {
            conversation_id: conversation_id.clone(),
            sender_id: UserId(sender),
            content: MessageContent {
                text: text.to_string(),
                kind: MessageKind::Text,
                media: None,
            },
            reply_to: None,
            status,
            created_at: Utc::now(),
        })
        .await
        .expect("insert message")
    }

    pub async fn delete_message(&self, id: MessageId) {
        if let Some(message) = self.state.lock().await.messages.get_mut(&id) {
            message.is_deleted = true;
        }
    }

    pub async fn message(&self, id: MessageId) -> MessageRecord {
        self.state
            .lock()
            .await
            .messages
            .get(&id)
            .cloned()
            .expect("message exists")
    }

    pub async fn message_count(&self) -> usize {
        self.state.lock().await.messages.len()
    }

    pub async fn conversation(&self, id: &ConversationId) -> ConversationRecord {
        self.state
            .lock()
            .await
            .conversations
            .get(id)
            .cloned()
            .expect("conversation exists")
    }

    pub async fn user(&self, id: i64) -> UserRow {
        self.state
            .lock()
            .await
            .users
            .get(&UserId(id))
            .cloned()
            .expect("user exists")
    }

    pub async fn set_push(&self, id: i64, token: Option<&str>, in_conversation: bool) {
        if let Some(user) = self.state.lock().await.users.get_mut(&UserId(id)) {
            user.push_token = token.map(str::to_string);
            user.in_conversation = in_conversation;
        }
    }

    pub async fn fail_last_message_updates(&self) {
        self.state.lock().await.fail_last_message = true;
    }

    pub async fn fail_conversation_listing(&self) {
        self.state.lock().await.fail_conversation_listing = true;
    }
}

#[async_trait]
impl ConversationStore for MemoryStore {
    async fn find_conversations_for_user(&self, user_id: UserId) -> Result<Vec<ConversationRecord>> {
        let state = self.state.lock().await;
        if state.fail_conversation_listing {
            return Err(anyhow!("conversation listing unavailable"));
        }
        let mut found: Vec<ConversationRecord> = state
            .conversations
            .values()
            .filter(|c| c.is_active && c.has_participant(user_id))
            .cloned()
            .collect();
        found.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(found)
    }

    async fn find_conversation(&self, id: &ConversationId) -> Result<Option<ConversationRecord>> {
        Ok(self.state.lock().await.conversations.get(id).cloned())
    }

    async fn update_last_message(
        &self,
        id: &ConversationId,
        message_id: MessageId,
        at: DateTime<Utc>,
    ) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.fail_last_message {
            return Err(anyhow!("conversation table locked"));
        }
        let conversation = state
            .conversations
            .get_mut(id)
            .ok_or_else(|| anyhow!("conversation {id} missing"))?;
        conversation.last_message_id = Some(message_id);
        conversation.last_activity = at;
        Ok(())
    }
}

#[async_trait]
impl MessageStore for MemoryStore {
    async fn create(&self, message: NewMessage) -> Result<MessageId> {
        let mut state = self.state.lock().await;
        state.next_message_id += 1;
        let id = MessageId(state.next_message_id);
        state.messages.insert(
            id,
            MessageRecord {
                id,
                conversation_id: message.conversation_id,
                sender_id: message.sender_id,
                content: message.content,
                reply_to: message.reply_to,
                status: message.status,
                is_deleted: false,
                created_at: message.created_at,
            },
        );
        Ok(id)
    }

    async fn find_by_id(&self, id: MessageId) -> Result<Option<MessageRecord>> {
        Ok(self.state.lock().await.messages.get(&id).cloned())
    }

    async fn find_reply_target(
        &self,
        id: MessageId,
        conversation_id: &ConversationId,
    ) -> Result<Option<MessageRecord>> {
        Ok(self
            .state
            .lock()
            .await
            .messages
            .get(&id)
            .filter(|m| !m.is_deleted && &m.conversation_id == conversation_id)
            .cloned())
    }

    async fn find_behind(
        &self,
        conversation_ids: &[ConversationId],
        recipient: UserId,
        target: DeliveryStatus,
    ) -> Result<Vec<(ConversationId, MessageId)>> {
        Ok(self
            .state
            .lock()
            .await
            .messages
            .values()
            .filter(|m| {
                conversation_ids.contains(&m.conversation_id)
                    && m.sender_id != recipient
                    && !m.is_deleted
                    && m.status < target
            })
            .map(|m| (m.conversation_id.clone(), m.id))
            .collect())
    }

    async fn update_delivery_status(&self, ids: &[MessageId], status: DeliveryStatus) -> Result<u64> {
        let mut state = self.state.lock().await;
        let mut moved = 0;
        for id in ids {
            if let Some(message) = state.messages.get_mut(id) {
                if message.status < status {
                    message.status = status;
                    moved += 1;
                }
            }
        }
        Ok(moved)
    }
}

#[async_trait]
impl UserStore for MemoryStore {
    async fn find_profile(&self, user_id: UserId) -> Result<Option<UserProfile>> {
        Ok(self
            .state
            .lock()
            .await
            .users
            .get(&user_id)
            .map(|row| row.profile.clone()))
    }

    async fn set_online(&self, user_id: UserId, online: bool) -> Result<()> {
        if !online {
            let hold = self.offline_hold.lock().await.take();
            if let Some(hold) = hold {
                hold.started.notify_one();
                let _permit = hold.release.acquire().await;
            }
        }
        let mut state = self.state.lock().await;
        let row = state
            .users
            .get_mut(&user_id)
            .ok_or_else(|| anyhow!("user {user_id} missing"))?;
        row.online = online;
        if !online {
            row.in_conversation = false;
        }
        Ok(())
    }

    async fn find_push_targets(&self, user_ids: &[UserId]) -> Result<Vec<PushTarget>> {
        let state = self.state.lock().await;
        Ok(user_ids
            .iter()
            .filter_map(|id| state.users.get(id))
            .map(|row| PushTarget {
                user_id: row.profile.user_id,
                token: row.push_token.clone(),
                in_conversation: row.in_conversation,
            })
            .collect())
    }
}

/// Accepts `token-<user id>`.
pub struct StaticVerifier;

impl CredentialVerifier for StaticVerifier {
    fn verify(&self, token: &str) -> Result<UserId, RealtimeError> {
        token
            .strip_prefix("token-")
            .and_then(|id| id.parse().ok())
            .map(UserId)
            .ok_or_else(|| RealtimeError::unauthenticated("invalid token"))
    }
}

pub fn token_for(user_id: i64) -> String {
    format!("Bearer token-{user_id}")
}

#[derive(Clone, Default)]
pub struct RecordingPushGateway {
    sent: Arc<Mutex<Vec<PushNotification>>>,
    fail: bool,
}

impl RecordingPushGateway {
    pub fn failing() -> Self {
        Self {
            sent: Arc::default(),
            fail: true,
        }
    }

    pub async fn sent(&self) -> Vec<PushNotification> {
        self.sent.lock().await.clone()
    }

    /// Spawned notifications land asynchronously.
    pub async fn wait_for(&self, count: usize) -> Vec<PushNotification> {
        for _ in 0..100 {
            let sent = self.sent().await;
            if sent.len() >= count {
                return sent;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        self.sent().await
    }
}

#[async_trait]
impl PushGateway for RecordingPushGateway {
    async fn send(&self, notification: &PushNotification) -> Result<()> {
        self.sent.lock().await.push(notification.clone());
        if self.fail {
            return Err(anyhow!("gateway returned 503"));
        }
        Ok(())
    }
}

pub struct Harness {
    pub ctx: RealtimeContext,
    pub store: MemoryStore,
    pub push: RecordingPushGateway,
}

pub fn harness() -> Harness {
    harness_with(Limits::default(), RecordingPushGateway::default())
}

pub fn harness_with(limits: Limits, push: RecordingPushGateway) -> Harness {
    let store = MemoryStore::default();
    let ctx = RealtimeContext::new(
        store.clone(),
        Arc::new(StaticVerifier),
        Arc::new(push.clone()),
        limits,
    );
    Harness { ctx, store, push }
}

pub struct Client {
    pub session: Session,
    pub events: mpsc::Receiver<ServerEvent>,
}

impl Client {
    pub fn id(&self) -> shared::domain::ConnectionId {
        self.session.connection_id
    }

    /// Everything queued so far.
    pub fn drain(&mut self) -> Vec<ServerEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            events.push(event);
        }
        events
    }
}

pub async fn connect(ctx: &RealtimeContext, user_id: i64) -> Client {
    let (outbox, events) = mpsc::channel(64);
    let session = ctx
        .on_connect(&token_for(user_id), outbox)
        .await
        .expect("connect");
    let mut client = Client { session, events };
    client.drain();
    client
}

pub fn received_messages(events: &[ServerEvent]) -> Vec<String> {
    events
        .iter()
        .filter_map(|event| match event {
            ServerEvent::ReceiveMessage { message, .. } => Some(message.content.text.clone()),
            _ => None,
        })
        .collect()
}

//! Push notification dispatch for participants who are not looking at the conversation.

use anyhow::Result;
use async_trait::async_trait;
use shared::domain::{ConversationId, UserId, UserProfile};
use tracing::{debug, warn};

use crate::{store::ConversationRecord, RealtimeContext};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushNotification {
    pub user_id: UserId,
    pub token: String,
    pub title: String,
    pub body: String,
    pub conversation_id: ConversationId,
    pub is_online: bool,
}

#[async_trait]
pub trait PushGateway: Send + Sync {
    async fn send(&self, notification: &PushNotification) -> Result<()>;
}

/// Used when no gateway is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct DisabledPushGateway;

#[async_trait]
impl PushGateway for DisabledPushGateway {
    async fn send(&self, notification: &PushNotification) -> Result<()> {
        debug!(user_id = %notification.user_id, "push gateway disabled; skipping notification");
        Ok(())
    }
}

/// Fires notifications on a detached task. Nothing here can fail the send
/// that triggered it.
pub(crate) fn spawn_notifications(
    ctx: &RealtimeContext,
    sender: UserProfile,
    conversation: ConversationRecord,
    text: String,
) {
    let recipients: Vec<UserId> = conversation.other_participants(sender.user_id).collect();
    if recipients.is_empty() {
        return;
    }
    let ctx = ctx.clone();
    tokio::spawn(async move {
        let targets = match ctx.users.find_push_targets(&recipients).await {
            Ok(targets) => targets,
            Err(error) => {
                warn!(conversation_id = %conversation.id, error = %error, "failed to load push targets");
                return;
            }
        };
        let title = format!("New message from {}", sender.display_name());
        for target in targets {
            if target.in_conversation {
                continue;
            }
            let Some(token) = target.token.as_deref().map(str::trim).filter(|t| !t.is_empty())
            else {
                continue;
            };
            let notification = PushNotification {
                user_id: target.user_id,
                token: token.to_string(),
                title: title.clone(),
                body: text.clone(),
                conversation_id: conversation.id.clone(),
                is_online: ctx.registry.is_online(target.user_id),
            };
            match ctx.push.send(&notification).await {
                Ok(()) => debug!(user_id = %target.user_id, "push notification sent"),
                Err(error) => warn!(user_id = %target.user_id, error = %error, "push notification failed"),
            }
        }
    });
}

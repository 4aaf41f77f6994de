use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use realtime::store::{
    ConversationRecord, ConversationStore, MessageRecord, MessageStore, NewMessage, PushTarget,
    UserStore,
};
use shared::{
    domain::{
        ConversationId, ConversationKind, DeliveryStatus, MessageId, MessageKind, UserId,
        UserProfile,
    },
    protocol::{MediaPayload, MessageContent},
};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow},
    Pool, QueryBuilder, Row, Sqlite,
};
use std::{
    fs,
    path::{Path, PathBuf},
    str::FromStr,
};

const MESSAGE_COLUMNS: &str = "id, conversation_id, sender_id, body, content_type, media_json, \
     reply_to, status, is_deleted, created_at";

#[derive(Clone)]
pub struct Storage {
    pool: Pool<Sqlite>,
}

/// Push routing state of a single user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresenceFlags {
    pub is_online: bool,
    pub in_conversation: bool,
    pub push_token: Option<String>,
    pub last_seen: Option<DateTime<Utc>>,
}

impl Storage {
    pub async fn new(database_url: &str) -> Result<Self> {
        ensure_sqlite_parent_dir_exists(database_url)?;

        let connect_options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(connect_options)
            .await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    pub async fn health_check(&self) -> Result<()> {
        let _: i64 = sqlx::query_scalar("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .context("sqlite ping failed")?;
        Ok(())
    }

    pub async fn create_user(&self, username: &str) -> Result<UserId> {
        let username = username.trim();
        if username.is_empty() {
            bail!("username cannot be empty");
        }
        let rec = sqlx::query(
            "INSERT INTO users (username) VALUES (?)
             ON CONFLICT(username) DO UPDATE SET username=excluded.username
             RETURNING id",
        )
        .bind(username)
        .fetch_one(&self.pool)
        .await?;
        Ok(UserId(rec.get::<i64, _>(0)))
    }

    pub async fn update_profile(
        &self,
        user_id: UserId,
        first_name: &str,
        last_name: &str,
        avatar: Option<&str>,
    ) -> Result<bool> {
        let avatar = avatar.map(str::trim).filter(|avatar| !avatar.is_empty());
        let result =
            sqlx::query("UPDATE users SET first_name = ?, last_name = ?, avatar = ? WHERE id = ?")
                .bind(first_name.trim())
                .bind(last_name.trim())
                .bind(avatar)
                .bind(user_id.0)
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected() > 0)
    }

    /// `None` unregisters the device.
    pub async fn set_push_token(&self, user_id: UserId, token: Option<&str>) -> Result<bool> {
        let token = token.map(str::trim).filter(|token| !token.is_empty());
        let result = sqlx::query("UPDATE users SET push_token = ? WHERE id = ?")
            .bind(token)
            .bind(user_id.0)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn set_in_conversation(&self, user_id: UserId, in_conversation: bool) -> Result<bool> {
        let result = sqlx::query("UPDATE users SET in_conversation = ? WHERE id = ?")
            .bind(in_conversation)
            .bind(user_id.0)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn presence_flags(&self, user_id: UserId) -> Result<Option<PresenceFlags>> {
        let row = sqlx::query(
            "SELECT is_online, in_conversation, push_token, last_seen FROM users WHERE id = ?",
        )
        .bind(user_id.0)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|r| -> Result<PresenceFlags> {
            Ok(PresenceFlags {
                is_online: r.try_get("is_online")?,
                in_conversation: r.try_get("in_conversation")?,
                push_token: r.try_get("push_token")?,
                last_seen: r.try_get("last_seen")?,
            })
        })
        .transpose()
    }

    /// Returns the one private conversation between the two users, creating
    /// it on first contact and reviving it when it was deactivated.
    pub async fn get_or_create_private_conversation(
        &self,
        user_id: UserId,
        other_user_id: UserId,
    ) -> Result<ConversationRecord> {
        if user_id == other_user_id {
            bail!("cannot start a conversation with yourself");
        }
        let existing: Option<String> = sqlx::query_scalar(
            "SELECT c.id FROM conversations c
             WHERE c.kind = 'private'
               AND EXISTS (SELECT 1 FROM conversation_participants p
                           WHERE p.conversation_id = c.id AND p.user_id = ?)
               AND EXISTS (SELECT 1 FROM conversation_participants p
                           WHERE p.conversation_id = c.id AND p.user_id = ?)
             LIMIT 1",
        )
        .bind(user_id.0)
        .bind(other_user_id.0)
        .fetch_optional(&self.pool)
        .await?;

        let conversation_id = match existing {
            Some(id) => {
                let id = ConversationId(id);
                sqlx::query("UPDATE conversations SET is_active = 1 WHERE id = ?")
                    .bind(id.as_str())
                    .execute(&self.pool)
                    .await?;
                id
            }
            None => {
                self.insert_conversation(ConversationKind::Private, None, &[user_id, other_user_id])
                    .await?
            }
        };
        self.find_conversation(&conversation_id)
            .await?
            .context("conversation vanished after creation")
    }

    pub async fn create_group_conversation(
        &self,
        name: &str,
        creator: UserId,
        members: &[UserId],
    ) -> Result<ConversationRecord> {
        let name = name.trim();
        if name.is_empty() {
            bail!("group name cannot be empty");
        }
        let mut participants = vec![creator];
        for member in members {
            if !participants.contains(member) {
                participants.push(*member);
            }
        }
        if participants.len() < 2 {
            bail!("a group needs at least two participants");
        }
        let conversation_id = self
            .insert_conversation(ConversationKind::Group, Some(name), &participants)
            .await?;
        self.find_conversation(&conversation_id)
            .await?
            .context("conversation vanished after creation")
    }

    async fn insert_conversation(
        &self,
        kind: ConversationKind,
        name: Option<&str>,
        participants: &[UserId],
    ) -> Result<ConversationId> {
        let conversation_id = ConversationId::generate();
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "INSERT INTO conversations (id, kind, name, is_active, last_activity) VALUES (?, ?, ?, 1, ?)",
        )
        .bind(conversation_id.as_str())
        .bind(kind.as_str())
        .bind(name)
        .bind(Utc::now())
        .execute(&mut *tx)
        .await?;
        for participant in participants {
            sqlx::query(
                "INSERT INTO conversation_participants (conversation_id, user_id) VALUES (?, ?)",
            )
            .bind(conversation_id.as_str())
            .bind(participant.0)
            .execute(&mut *tx)
            .await
            .with_context(|| format!("failed to add participant {participant}"))?;
        }
        tx.commit().await?;
        Ok(conversation_id)
    }

    pub async fn deactivate_conversation(&self, id: &ConversationId) -> Result<bool> {
        let result = sqlx::query("UPDATE conversations SET is_active = 0 WHERE id = ?")
            .bind(id.as_str())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Newest `limit` live messages older than `before`, returned oldest first.
    pub async fn list_conversation_messages(
        &self,
        conversation_id: &ConversationId,
        limit: u32,
        before: Option<MessageId>,
    ) -> Result<Vec<MessageRecord>> {
        let mut rows = if let Some(before_id) = before {
            sqlx::query(&format!(
                "SELECT {MESSAGE_COLUMNS} FROM messages
                 WHERE conversation_id = ? AND is_deleted = 0 AND id < ?
                 ORDER BY id DESC
                 LIMIT ?"
            ))
            .bind(conversation_id.as_str())
            .bind(before_id.0)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?
        } else {
            sqlx::query(&format!(
                "SELECT {MESSAGE_COLUMNS} FROM messages
                 WHERE conversation_id = ? AND is_deleted = 0
                 ORDER BY id DESC
                 LIMIT ?"
            ))
            .bind(conversation_id.as_str())
            .bind(limit)
            .fetch_all(&self.pool)
            .await?
        };

        rows.reverse();
        rows.iter().map(message_from_row).collect()
    }

    /// Only the author can delete; returns whether anything changed.
    pub async fn soft_delete_message(&self, message_id: MessageId, sender_id: UserId) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE messages SET is_deleted = 1 WHERE id = ? AND sender_id = ? AND is_deleted = 0",
        )
        .bind(message_id.0)
        .bind(sender_id.0)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn participants(&self, conversation_id: &ConversationId) -> Result<Vec<UserId>> {
        let rows = sqlx::query(
            "SELECT user_id FROM conversation_participants
             WHERE conversation_id = ?
             ORDER BY joined_at, user_id",
        )
        .bind(conversation_id.as_str())
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|r| UserId(r.get::<i64, _>(0)))
            .collect())
    }

    async fn conversation_from_row(&self, row: &SqliteRow) -> Result<ConversationRecord> {
        let id = ConversationId(row.try_get("id")?);
        let participants = self.participants(&id).await?;
        Ok(ConversationRecord {
            kind: ConversationKind::parse(row.try_get::<&str, _>("kind")?),
            name: row.try_get("name")?,
            is_active: row.try_get("is_active")?,
            last_message_id: row.try_get::<Option<i64>, _>("last_message_id")?.map(MessageId),
            last_activity: row.try_get("last_activity")?,
            participants,
            id,
        })
    }
}

fn message_from_row(row: &SqliteRow) -> Result<MessageRecord> {
    let media = row
        .try_get::<Option<String>, _>("media_json")?
        .map(|raw| serde_json::from_str::<MediaPayload>(&raw))
        .transpose()
        .context("stored media payload is not valid json")?;
    Ok(MessageRecord {
        id: MessageId(row.try_get("id")?),
        conversation_id: ConversationId(row.try_get("conversation_id")?),
        sender_id: UserId(row.try_get("sender_id")?),
        content: MessageContent {
            text: row.try_get("body")?,
            kind: MessageKind::parse(row.try_get::<&str, _>("content_type")?),
            media,
        },
        reply_to: row.try_get::<Option<i64>, _>("reply_to")?.map(MessageId),
        status: DeliveryStatus::from_rank(row.try_get("status")?),
        is_deleted: row.try_get("is_deleted")?,
        created_at: row.try_get("created_at")?,
    })
}

fn ensure_sqlite_parent_dir_exists(database_url: &str) -> Result<()> {
    let Some(path) = sqlite_path(database_url) else {
        return Ok(());
    };

    let Some(parent) = path.parent() else {
        return Ok(());
    };

    fs::create_dir_all(parent).with_context(|| {
        format!(
            "failed to create parent directory '{}' for database url '{database_url}'",
            parent.display()
        )
    })?;

    Ok(())
}

fn sqlite_path(database_url: &str) -> Option<PathBuf> {
    if database_url == "sqlite::memory:" || !database_url.starts_with("sqlite:") {
        return None;
    }

    let path = database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .split('?')
        .next()
        .unwrap_or_default();

    if path.is_empty() || path == ":memory:" {
        return None;
    }

    Some(Path::new(path).to_path_buf())
}

#[async_trait]
impl ConversationStore for Storage {
    async fn find_conversations_for_user(&self, user_id: UserId) -> Result<Vec<ConversationRecord>> {
        let rows = sqlx::query(
            "SELECT c.id, c.kind, c.name, c.is_active, c.last_message_id, c.last_activity
             FROM conversations c
             JOIN conversation_participants p ON p.conversation_id = c.id
             WHERE p.user_id = ? AND c.is_active = 1
             ORDER BY c.last_activity DESC",
        )
        .bind(user_id.0)
        .fetch_all(&self.pool)
        .await?;
        let mut conversations = Vec::with_capacity(rows.len());
        for row in &rows {
            conversations.push(self.conversation_from_row(row).await?);
        }
        Ok(conversations)
    }

    async fn find_conversation(&self, id: &ConversationId) -> Result<Option<ConversationRecord>> {
        let row = sqlx::query(
            "SELECT id, kind, name, is_active, last_message_id, last_activity
             FROM conversations WHERE id = ?",
        )
        .bind(id.as_str())
        .fetch_optional(&self.pool)
        .await?;
        match row {
            Some(row) => Ok(Some(self.conversation_from_row(&row).await?)),
            None => Ok(None),
        }
    }

    async fn update_last_message(
        &self,
        id: &ConversationId,
        message_id: MessageId,
        at: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query("UPDATE conversations SET last_message_id = ?, last_activity = ? WHERE id = ?")
            .bind(message_id.0)
            .bind(at)
            .bind(id.as_str())
            .execute(&self.pool)
            .await
            .context("failed to update conversation last message")?;
        Ok(())
    }
}

#[async_trait]
impl MessageStore for Storage {
    async fn create(&self, message: NewMessage) -> Result<MessageId> {
        let media_json = message
            .content
            .media
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let rec = sqlx::query(
            "INSERT INTO messages
                (conversation_id, sender_id, body, content_type, media_json, reply_to, status, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)
             RETURNING id",
        )
        .bind(message.conversation_id.as_str())
        .bind(message.sender_id.0)
        .bind(&message.content.text)
        .bind(message.content.kind.as_str())
        .bind(media_json)
        .bind(message.reply_to.map(|id| id.0))
        .bind(message.status.rank())
        .bind(message.created_at)
        .fetch_one(&self.pool)
        .await
        .context("failed to insert message")?;
        Ok(MessageId(rec.get::<i64, _>(0)))
    }

    async fn find_by_id(&self, id: MessageId) -> Result<Option<MessageRecord>> {
        let row = sqlx::query(&format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = ?"))
            .bind(id.0)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(message_from_row).transpose()
    }

    async fn find_reply_target(
        &self,
        id: MessageId,
        conversation_id: &ConversationId,
    ) -> Result<Option<MessageRecord>> {
        let row = sqlx::query(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages
             WHERE id = ? AND conversation_id = ? AND is_deleted = 0"
        ))
        .bind(id.0)
        .bind(conversation_id.as_str())
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(message_from_row).transpose()
    }

    async fn find_behind(
        &self,
        conversation_ids: &[ConversationId],
        recipient: UserId,
        target: DeliveryStatus,
    ) -> Result<Vec<(ConversationId, MessageId)>> {
        if conversation_ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut query = QueryBuilder::<Sqlite>::new(
            "SELECT conversation_id, id FROM messages WHERE is_deleted = 0 AND sender_id != ",
        );
        query
            .push_bind(recipient.0)
            .push(" AND status < ")
            .push_bind(target.rank())
            .push(" AND conversation_id IN (");
        let mut ids = query.separated(", ");
        for conversation_id in conversation_ids {
            ids.push_bind(conversation_id.0.clone());
        }
        ids.push_unseparated(") ORDER BY id");

        let rows = query.build().fetch_all(&self.pool).await?;
        Ok(rows
            .into_iter()
            .map(|r| {
                (
                    ConversationId(r.get::<String, _>(0)),
                    MessageId(r.get::<i64, _>(1)),
                )
            })
            .collect())
    }

    async fn update_delivery_status(&self, ids: &[MessageId], status: DeliveryStatus) -> Result<u64> {
        if ids.is_empty() {
            return Ok(0);
        }
        let mut query = QueryBuilder::<Sqlite>::new("UPDATE messages SET status = ");
        query
            .push_bind(status.rank())
            .push(" WHERE status < ")
            .push_bind(status.rank())
            .push(" AND id IN (");
        let mut bound = query.separated(", ");
        for id in ids {
            bound.push_bind(id.0);
        }
        bound.push_unseparated(")");

        let result = query.build().execute(&self.pool).await?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl UserStore for Storage {
    async fn find_profile(&self, user_id: UserId) -> Result<Option<UserProfile>> {
        let row = sqlx::query(
            "SELECT id, username, first_name, last_name, avatar FROM users WHERE id = ?",
        )
        .bind(user_id.0)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|r| -> Result<UserProfile> {
            Ok(UserProfile {
                user_id: UserId(r.try_get("id")?),
                username: r.try_get("username")?,
                first_name: r.try_get("first_name")?,
                last_name: r.try_get("last_name")?,
                avatar: r.try_get("avatar")?,
            })
        })
        .transpose()
    }

    async fn set_online(&self, user_id: UserId, online: bool) -> Result<()> {
        if online {
            sqlx::query("UPDATE users SET is_online = 1 WHERE id = ?")
                .bind(user_id.0)
                .execute(&self.pool)
                .await?;
        } else {
            sqlx::query(
                "UPDATE users SET is_online = 0, in_conversation = 0, last_seen = ? WHERE id = ?",
            )
            .bind(Utc::now())
            .bind(user_id.0)
            .execute(&self.pool)
            .await?;
        }
        Ok(())
    }

    async fn find_push_targets(&self, user_ids: &[UserId]) -> Result<Vec<PushTarget>> {
        if user_ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut query = QueryBuilder::<Sqlite>::new(
            "SELECT id, push_token, in_conversation FROM users WHERE id IN (",
        );
        let mut bound = query.separated(", ");
        for user_id in user_ids {
            bound.push_bind(user_id.0);
        }
        bound.push_unseparated(") ORDER BY id");

        let rows = query.build().fetch_all(&self.pool).await?;
        rows.into_iter()
            .map(|r| -> Result<PushTarget> {
                Ok(PushTarget {
                    user_id: UserId(r.try_get("id")?),
                    token: r.try_get("push_token")?,
                    in_conversation: r.try_get("in_conversation")?,
                })
            })
            .collect()
    }
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;

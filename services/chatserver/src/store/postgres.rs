//! Postgres-backed implementation of the chat store.
//!
//! # Data model
//! Four tables: `chats`, `chat_members`, `messages` and `message_status` (the
//! receipt ledger). Every write that creates a message also creates its
//! receipt rows inside the same transaction, so consumers can rely on
//! "message visible implies receipt exists".
//!
//! # Receipt ledger as the durable queue
//! There is no separate undelivered queue. Reconnect catch-up is
//! `undelivered_messages`, a scan over `(user_id, status = 'SENT')`, and the
//! promotion statements are conditional updates so replays and races cannot
//! regress a receipt.
//!
//! # Private-chat uniqueness
//! PRIVATE chats carry a canonical `"<min>:<max>"` pair in `private_pair`
//! with a partial unique index. Concurrent get-or-create callers race on the
//! insert; the loser sees `23505`, re-reads and returns the winner's row.
//!
//! # Operational notes
//! - Migrations are embedded via `sqlx::migrate!` and applied at connect.
//! - Pool timeouts are explicit: hanging forever on an unhealthy database is
//!   worse than failing a request.
use super::{ChatPage, ChatStore, PAGE_SIZE, StoreError, StoreResult, private_pair};
use crate::config::PostgresConfig;
use crate::model::{
    Chat, ChatMember, ChatType, MemberRole, Message, MessageEvent, Receipt, ReceiptStatus,
    RemovalKind,
};
use anyhow::anyhow;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::{FromRow, PgPool};
use std::str::FromStr;
use std::time::Duration;

/// Embedded migrations; `main` reuses this for the shutdown rollback hook.
pub static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");

pub struct PostgresStore {
    pool: PgPool,
}

/// Row shape for `chats`. Kept separate from the domain `Chat` so schema
/// details (string enums) stay in this module.
#[derive(Debug, Clone, FromRow)]
struct DbChat {
    id: i64,
    chat_type: String,
    name: Option<String>,
    author_id: Option<i64>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, FromRow)]
struct DbMember {
    user_id: i64,
    role: String,
}

#[derive(Debug, Clone, FromRow)]
struct DbMessage {
    id: i64,
    chat_id: i64,
    from_user_id: i64,
    event_type: String,
    content: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, FromRow)]
struct DbReceipt {
    message_id: i64,
    user_id: i64,
    status: String,
    delivered_at: Option<DateTime<Utc>>,
    read_at: Option<DateTime<Utc>>,
}

impl TryFrom<DbChat> for Chat {
    type Error = StoreError;

    fn try_from(row: DbChat) -> StoreResult<Chat> {
        let chat_type = ChatType::parse(&row.chat_type)
            .ok_or_else(|| StoreError::Unexpected(anyhow!("bad chat_type {:?}", row.chat_type)))?;
        Ok(Chat {
            id: row.id,
            chat_type,
            name: row.name,
            author_id: row.author_id,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

impl TryFrom<DbMessage> for Message {
    type Error = StoreError;

    fn try_from(row: DbMessage) -> StoreResult<Message> {
        let event_type = MessageEvent::parse(&row.event_type).ok_or_else(|| {
            StoreError::Unexpected(anyhow!("bad event_type {:?}", row.event_type))
        })?;
        Ok(Message {
            id: row.id,
            chat_id: row.chat_id,
            from_user_id: row.from_user_id,
            event_type,
            content: row.content,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

const MESSAGE_COLUMNS: &str =
    "id, chat_id, from_user_id, event_type, content, created_at, updated_at";

impl PostgresStore {
    /// Connect, tune the pool, and run any pending migrations before the
    /// first query is served.
    pub async fn connect(config: &PostgresConfig) -> StoreResult<Self> {
        let options = PgConnectOptions::from_str(&config.url())
            .map_err(|err| StoreError::Unexpected(err.into()))?;
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(Duration::from_millis(config.acquire_timeout_ms))
            .connect_with(options)
            .await
            .map_err(|err| StoreError::Unexpected(err.into()))?;

        MIGRATOR
            .run(&pool)
            .await
            .map_err(|err| StoreError::Unexpected(err.into()))?;

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn find_private_chat(&self, pair: &str) -> StoreResult<Option<i64>> {
        sqlx::query_scalar::<_, i64>("SELECT id FROM chats WHERE private_pair = $1")
            .bind(pair)
            .fetch_optional(&self.pool)
            .await
            .map_err(|err| StoreError::Unexpected(err.into()))
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    if let sqlx::Error::Database(db_err) = err {
        return db_err.code().map(|code| code == "23505").unwrap_or(false);
    }
    false
}

fn unexpected(err: sqlx::Error) -> StoreError {
    StoreError::Unexpected(err.into())
}

#[async_trait]
impl ChatStore for PostgresStore {
    async fn insert_message(
        &self,
        chat_id: i64,
        from_user_id: i64,
        event: MessageEvent,
        content: Option<&str>,
    ) -> StoreResult<i64> {
        let mut tx = self.pool.begin().await.map_err(unexpected)?;

        let exists =
            sqlx::query_scalar::<_, bool>("SELECT EXISTS(SELECT 1 FROM chats WHERE id = $1)")
                .bind(chat_id)
                .fetch_one(&mut *tx)
                .await
                .map_err(unexpected)?;
        if !exists {
            return Err(StoreError::NotFound(format!("chat {chat_id}")));
        }

        let message_id = sqlx::query_scalar::<_, i64>(
            "INSERT INTO messages (chat_id, from_user_id, event_type, content) \
             VALUES ($1, $2, $3, $4) RETURNING id",
        )
        .bind(chat_id)
        .bind(from_user_id)
        .bind(event.as_str())
        .bind(content)
        .fetch_one(&mut *tx)
        .await
        .map_err(unexpected)?;

        // One SENT receipt per member at the moment of insert.
        sqlx::query(
            "INSERT INTO message_status (message_id, user_id, status) \
             SELECT $1, user_id, 'SENT' FROM chat_members WHERE chat_id = $2 \
             ON CONFLICT (message_id, user_id) DO NOTHING",
        )
        .bind(message_id)
        .bind(chat_id)
        .execute(&mut *tx)
        .await
        .map_err(unexpected)?;

        sqlx::query("UPDATE chats SET updated_at = now() WHERE id = $1")
            .bind(chat_id)
            .execute(&mut *tx)
            .await
            .map_err(unexpected)?;

        tx.commit().await.map_err(unexpected)?;
        Ok(message_id)
    }

    async fn get_or_create_private_chat(&self, a: i64, b: i64) -> StoreResult<(i64, bool)> {
        let pair = private_pair(a, b);
        if let Some(chat_id) = self.find_private_chat(&pair).await? {
            return Ok((chat_id, false));
        }

        let mut tx = self.pool.begin().await.map_err(unexpected)?;
        let inserted = sqlx::query_scalar::<_, i64>(
            "INSERT INTO chats (chat_type, private_pair) VALUES ('PRIVATE', $1) RETURNING id",
        )
        .bind(&pair)
        .fetch_one(&mut *tx)
        .await;

        let chat_id = match inserted {
            Ok(chat_id) => chat_id,
            Err(err) if is_unique_violation(&err) => {
                // A concurrent caller won the insert race; their row is ours.
                drop(tx);
                return match self.find_private_chat(&pair).await? {
                    Some(chat_id) => Ok((chat_id, false)),
                    None => Err(StoreError::Unexpected(anyhow!(
                        "private chat {pair} vanished after unique violation"
                    ))),
                };
            }
            Err(err) => return Err(unexpected(err)),
        };

        let mut member_ids = vec![a];
        if b != a {
            member_ids.push(b);
        }
        for user_id in member_ids {
            sqlx::query("INSERT INTO chat_members (chat_id, user_id, role) VALUES ($1, $2, 'MEMBER')")
                .bind(chat_id)
                .bind(user_id)
                .execute(&mut *tx)
                .await
                .map_err(unexpected)?;
        }

        tx.commit().await.map_err(unexpected)?;
        Ok((chat_id, true))
    }

    async fn create_group_chat(&self, name: &str, author_id: i64) -> StoreResult<i64> {
        let mut tx = self.pool.begin().await.map_err(unexpected)?;
        let chat_id = sqlx::query_scalar::<_, i64>(
            "INSERT INTO chats (chat_type, name, author_id) VALUES ('GROUP', $1, $2) RETURNING id",
        )
        .bind(name)
        .bind(author_id)
        .fetch_one(&mut *tx)
        .await
        .map_err(unexpected)?;

        sqlx::query("INSERT INTO chat_members (chat_id, user_id, role) VALUES ($1, $2, 'ADMIN')")
            .bind(chat_id)
            .bind(author_id)
            .execute(&mut *tx)
            .await
            .map_err(unexpected)?;

        tx.commit().await.map_err(unexpected)?;
        Ok(chat_id)
    }

    async fn delete_group_chat(&self, chat_id: i64) -> StoreResult<()> {
        // Members, messages and receipts go with the chat via ON DELETE CASCADE.
        let result = sqlx::query("DELETE FROM chats WHERE id = $1 AND chat_type = 'GROUP'")
            .bind(chat_id)
            .execute(&self.pool)
            .await
            .map_err(unexpected)?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("chat {chat_id}")));
        }
        Ok(())
    }

    async fn add_group_member(&self, chat_id: i64, user_id: i64) -> StoreResult<i64> {
        let mut tx = self.pool.begin().await.map_err(unexpected)?;

        let chat_type =
            sqlx::query_scalar::<_, String>("SELECT chat_type FROM chats WHERE id = $1")
                .bind(chat_id)
                .fetch_optional(&mut *tx)
                .await
                .map_err(unexpected)?;
        match chat_type.as_deref() {
            None => return Err(StoreError::NotFound(format!("chat {chat_id}"))),
            Some("GROUP") => {}
            Some(_) => return Err(StoreError::NotFound(format!("group chat {chat_id}"))),
        }

        let insert = sqlx::query("INSERT INTO chat_members (chat_id, user_id) VALUES ($1, $2)")
            .bind(chat_id)
            .bind(user_id)
            .execute(&mut *tx)
            .await;
        if let Err(err) = insert {
            if is_unique_violation(&err) {
                return Err(StoreError::Conflict(format!(
                    "user {user_id} already in chat {chat_id}"
                )));
            }
            return Err(unexpected(err));
        }

        let message_id = sqlx::query_scalar::<_, i64>(
            "INSERT INTO messages (chat_id, from_user_id, event_type) \
             VALUES ($1, $2, 'NEW_MEMBER') RETURNING id",
        )
        .bind(chat_id)
        .bind(user_id)
        .fetch_one(&mut *tx)
        .await
        .map_err(unexpected)?;

        sqlx::query(
            "INSERT INTO message_status (message_id, user_id, status) \
             SELECT $1, user_id, 'SENT' FROM chat_members WHERE chat_id = $2 \
             ON CONFLICT (message_id, user_id) DO NOTHING",
        )
        .bind(message_id)
        .bind(chat_id)
        .execute(&mut *tx)
        .await
        .map_err(unexpected)?;

        sqlx::query("UPDATE chats SET updated_at = now() WHERE id = $1")
            .bind(chat_id)
            .execute(&mut *tx)
            .await
            .map_err(unexpected)?;

        tx.commit().await.map_err(unexpected)?;
        Ok(message_id)
    }

    async fn remove_group_member(
        &self,
        chat_id: i64,
        user_id: i64,
        kind: RemovalKind,
    ) -> StoreResult<i64> {
        let mut tx = self.pool.begin().await.map_err(unexpected)?;

        let removed = sqlx::query("DELETE FROM chat_members WHERE chat_id = $1 AND user_id = $2")
            .bind(chat_id)
            .bind(user_id)
            .execute(&mut *tx)
            .await
            .map_err(unexpected)?;
        if removed.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!(
                "user {user_id} in chat {chat_id}"
            )));
        }

        let message_id = sqlx::query_scalar::<_, i64>(
            "INSERT INTO messages (chat_id, from_user_id, event_type) \
             VALUES ($1, $2, $3) RETURNING id",
        )
        .bind(chat_id)
        .bind(user_id)
        .bind(kind.event().as_str())
        .fetch_one(&mut *tx)
        .await
        .map_err(unexpected)?;

        sqlx::query(
            "INSERT INTO message_status (message_id, user_id, status) \
             SELECT $1, user_id, 'SENT' FROM chat_members WHERE chat_id = $2 \
             ON CONFLICT (message_id, user_id) DO NOTHING",
        )
        .bind(message_id)
        .bind(chat_id)
        .execute(&mut *tx)
        .await
        .map_err(unexpected)?;

        // The removed user is no longer in chat_members but still gets a
        // receipt for their own removal event.
        sqlx::query(
            "INSERT INTO message_status (message_id, user_id, status) VALUES ($1, $2, 'SENT') \
             ON CONFLICT (message_id, user_id) DO NOTHING",
        )
        .bind(message_id)
        .bind(user_id)
        .execute(&mut *tx)
        .await
        .map_err(unexpected)?;

        sqlx::query("UPDATE chats SET updated_at = now() WHERE id = $1")
            .bind(chat_id)
            .execute(&mut *tx)
            .await
            .map_err(unexpected)?;

        tx.commit().await.map_err(unexpected)?;
        Ok(message_id)
    }

    async fn change_member_role(
        &self,
        chat_id: i64,
        user_id: i64,
        role: MemberRole,
    ) -> StoreResult<()> {
        let result =
            sqlx::query("UPDATE chat_members SET role = $1 WHERE chat_id = $2 AND user_id = $3")
                .bind(role.as_str())
                .bind(chat_id)
                .bind(user_id)
                .execute(&self.pool)
                .await
                .map_err(unexpected)?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!(
                "user {user_id} in chat {chat_id}"
            )));
        }
        Ok(())
    }

    async fn edit_message(&self, message_id: i64, content: &str) -> StoreResult<()> {
        let result = sqlx::query(
            "UPDATE messages SET content = $1, event_type = 'EDIT', updated_at = now() \
             WHERE id = $2",
        )
        .bind(content)
        .bind(message_id)
        .execute(&self.pool)
        .await
        .map_err(unexpected)?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("message {message_id}")));
        }
        Ok(())
    }

    async fn delete_message(&self, message_id: i64) -> StoreResult<()> {
        let result = sqlx::query(
            "UPDATE messages SET content = NULL, event_type = 'DELETE', updated_at = now() \
             WHERE id = $1",
        )
        .bind(message_id)
        .execute(&self.pool)
        .await
        .map_err(unexpected)?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("message {message_id}")));
        }
        Ok(())
    }

    async fn paginate_chat(&self, chat_id: i64, cursor: Option<i64>) -> StoreResult<ChatPage> {
        // Fetch one row past the page to learn whether more history exists.
        let rows = sqlx::query_as::<_, DbMessage>(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages \
             WHERE chat_id = $1 AND ($2::BIGINT IS NULL OR id < $2) \
             ORDER BY id DESC LIMIT {}",
            PAGE_SIZE + 1
        ))
        .bind(chat_id)
        .bind(cursor)
        .fetch_all(&self.pool)
        .await
        .map_err(unexpected)?;

        let has_more = rows.len() > PAGE_SIZE;
        let mut messages = Vec::with_capacity(rows.len().min(PAGE_SIZE));
        for row in rows.into_iter().take(PAGE_SIZE) {
            messages.push(Message::try_from(row)?);
        }
        let next_cursor = messages.last().map(|m| m.id);
        Ok(ChatPage {
            messages,
            next_cursor,
            has_more,
        })
    }

    async fn undelivered_messages(&self, user_id: i64) -> StoreResult<Vec<Message>> {
        let rows = sqlx::query_as::<_, DbMessage>(
            "SELECT m.id, m.chat_id, m.from_user_id, m.event_type, m.content, \
                    m.created_at, m.updated_at \
             FROM messages m \
             JOIN message_status ms ON ms.message_id = m.id \
             WHERE ms.user_id = $1 AND ms.status = 'SENT' \
             ORDER BY m.id DESC",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
        .map_err(unexpected)?;
        rows.into_iter().map(Message::try_from).collect()
    }

    async fn set_delivered(&self, message_id: i64, user_id: i64) -> StoreResult<()> {
        // Conditional update keeps the transition monotone under replays.
        sqlx::query(
            "UPDATE message_status SET status = 'DELIVERED', delivered_at = now() \
             WHERE message_id = $1 AND user_id = $2 AND status = 'SENT'",
        )
        .bind(message_id)
        .bind(user_id)
        .execute(&self.pool)
        .await
        .map_err(unexpected)?;
        Ok(())
    }

    async fn set_read_up_to(
        &self,
        chat_id: i64,
        up_to_id: i64,
        user_id: i64,
    ) -> StoreResult<()> {
        sqlx::query(
            "UPDATE message_status ms SET status = 'READ', read_at = now() \
             FROM messages m \
             WHERE ms.message_id = m.id \
               AND m.chat_id = $1 \
               AND ms.message_id <= $2 \
               AND ms.user_id = $3 \
               AND ms.status = 'DELIVERED'",
        )
        .bind(chat_id)
        .bind(up_to_id)
        .bind(user_id)
        .execute(&self.pool)
        .await
        .map_err(unexpected)?;
        Ok(())
    }

    async fn chat(&self, chat_id: i64) -> StoreResult<Chat> {
        let row = sqlx::query_as::<_, DbChat>(
            "SELECT id, chat_type, name, author_id, created_at, updated_at \
             FROM chats WHERE id = $1",
        )
        .bind(chat_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(unexpected)?;
        match row {
            Some(row) => Chat::try_from(row),
            None => Err(StoreError::NotFound(format!("chat {chat_id}"))),
        }
    }

    async fn chat_members(&self, chat_id: i64) -> StoreResult<Vec<ChatMember>> {
        let rows = sqlx::query_as::<_, DbMember>(
            "SELECT user_id, role FROM chat_members WHERE chat_id = $1 ORDER BY id",
        )
        .bind(chat_id)
        .fetch_all(&self.pool)
        .await
        .map_err(unexpected)?;
        rows.into_iter()
            .map(|row| {
                let role = MemberRole::parse(&row.role).ok_or_else(|| {
                    StoreError::Unexpected(anyhow!("bad member role {:?}", row.role))
                })?;
                Ok(ChatMember {
                    user_id: row.user_id,
                    role,
                })
            })
            .collect()
    }

    async fn member_role(&self, user_id: i64, chat_id: i64) -> StoreResult<MemberRole> {
        let role = sqlx::query_scalar::<_, String>(
            "SELECT role FROM chat_members WHERE chat_id = $1 AND user_id = $2",
        )
        .bind(chat_id)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(unexpected)?;
        match role {
            Some(role) => MemberRole::parse(&role)
                .ok_or_else(|| StoreError::Unexpected(anyhow!("bad member role {role:?}"))),
            None => Err(StoreError::NotFound(format!(
                "user {user_id} in chat {chat_id}"
            ))),
        }
    }

    async fn message_author(&self, message_id: i64) -> StoreResult<i64> {
        sqlx::query_scalar::<_, i64>("SELECT from_user_id FROM messages WHERE id = $1")
            .bind(message_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(unexpected)?
            .ok_or_else(|| StoreError::NotFound(format!("message {message_id}")))
    }

    async fn user_chats(&self, user_id: i64) -> StoreResult<Vec<Chat>> {
        let rows = sqlx::query_as::<_, DbChat>(
            "SELECT c.id, c.chat_type, c.name, c.author_id, c.created_at, c.updated_at \
             FROM chats c \
             JOIN chat_members cm ON cm.chat_id = c.id \
             WHERE cm.user_id = $1 \
             ORDER BY c.updated_at DESC, c.id DESC",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
        .map_err(unexpected)?;
        rows.into_iter().map(Chat::try_from).collect()
    }

    async fn contacts(&self, user_id: i64) -> StoreResult<Vec<i64>> {
        sqlx::query_scalar::<_, i64>(
            "SELECT DISTINCT cm2.user_id \
             FROM chats c \
             JOIN chat_members cm ON cm.chat_id = c.id \
             JOIN chat_members cm2 ON cm2.chat_id = c.id \
             WHERE c.chat_type = 'PRIVATE' AND cm.user_id = $1 AND cm2.user_id != $1 \
             ORDER BY cm2.user_id",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
        .map_err(unexpected)
    }

    async fn chat_peers(&self, user_id: i64) -> StoreResult<Vec<i64>> {
        sqlx::query_scalar::<_, i64>(
            "SELECT DISTINCT cm2.user_id \
             FROM chat_members cm \
             JOIN chat_members cm2 ON cm2.chat_id = cm.chat_id \
             WHERE cm.user_id = $1 AND cm2.user_id != $1 \
             ORDER BY cm2.user_id",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
        .map_err(unexpected)
    }

    async fn receipt(&self, message_id: i64, user_id: i64) -> StoreResult<Option<Receipt>> {
        let row = sqlx::query_as::<_, DbReceipt>(
            "SELECT message_id, user_id, status, delivered_at, read_at \
             FROM message_status WHERE message_id = $1 AND user_id = $2",
        )
        .bind(message_id)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(unexpected)?;
        match row {
            None => Ok(None),
            Some(row) => {
                let status = ReceiptStatus::parse(&row.status).ok_or_else(|| {
                    StoreError::Unexpected(anyhow!("bad receipt status {:?}", row.status))
                })?;
                Ok(Some(Receipt {
                    message_id: row.message_id,
                    user_id: row.user_id,
                    status,
                    delivered_at: row.delivered_at,
                    read_at: row.read_at,
                }))
            }
        }
    }

    async fn health_check(&self) -> StoreResult<()> {
        sqlx::query_scalar::<_, i64>("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .map_err(unexpected)?;
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "postgres"
    }
}

//! Chat store: transactional persistence of chats, members, messages and
//! per-recipient receipts.
//!
//! Two backends implement [`ChatStore`]:
//! - [`postgres::PostgresStore`]: the durable production backend (sqlx).
//! - [`memory::MemoryStore`]: lock-guarded maps for dev and tests.
//!
//! Write operations that create a message always create its receipt rows in
//! the same transaction, so a reader never observes a message without a
//! receipt for itself. Receipt promotion is conditional (current state must
//! be less advanced than the target), which is what makes the
//! SENT -> DELIVERED -> READ progression monotone under retries.
use crate::model::{
    Chat, ChatMember, MemberRole, Message, MessageEvent, Receipt, RemovalKind,
};
use async_trait::async_trait;
use thiserror::Error;

pub mod memory;
pub mod postgres;

/// Page size for chat history pagination. One extra row is fetched to learn
/// whether more history exists.
pub const PAGE_SIZE: usize = 20;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error(transparent)]
    Unexpected(#[from] anyhow::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Clone)]
pub struct ChatPage {
    pub messages: Vec<Message>,
    pub next_cursor: Option<i64>,
    pub has_more: bool,
}

#[async_trait]
pub trait ChatStore: Send + Sync {
    /// Insert a message and one SENT receipt per current chat member, in a
    /// single transaction. Returns the assigned message id.
    async fn insert_message(
        &self,
        chat_id: i64,
        from_user_id: i64,
        event: MessageEvent,
        content: Option<&str>,
    ) -> StoreResult<i64>;

    /// Find the PRIVATE chat holding exactly `{a, b}`, creating it (and both
    /// memberships) when absent. Safe under concurrent callers: exactly one
    /// caller observes `created == true`.
    async fn get_or_create_private_chat(&self, a: i64, b: i64) -> StoreResult<(i64, bool)>;

    async fn create_group_chat(&self, name: &str, author_id: i64) -> StoreResult<i64>;

    /// Cascade-delete a group chat. Author checks happen above this layer.
    async fn delete_group_chat(&self, chat_id: i64) -> StoreResult<()>;

    /// Add a member and record the NEW_MEMBER event message. Receipts cover
    /// the post-change member set. Duplicate membership is a `Conflict`.
    async fn add_group_member(&self, chat_id: i64, user_id: i64) -> StoreResult<i64>;

    /// Remove a member and record the LEFT/KICKED event message. Receipts
    /// cover the post-change member set plus the removed user, so their
    /// clients also learn about the removal.
    async fn remove_group_member(
        &self,
        chat_id: i64,
        user_id: i64,
        kind: RemovalKind,
    ) -> StoreResult<i64>;

    async fn change_member_role(
        &self,
        chat_id: i64,
        user_id: i64,
        role: MemberRole,
    ) -> StoreResult<()>;

    async fn edit_message(&self, message_id: i64, content: &str) -> StoreResult<()>;

    /// Tombstone: the row survives with its content cleared and the event
    /// type flipped to DELETE.
    async fn delete_message(&self, message_id: i64) -> StoreResult<()>;

    /// History page, newest first. `cursor` is an exclusive upper bound on
    /// message id.
    async fn paginate_chat(&self, chat_id: i64, cursor: Option<i64>) -> StoreResult<ChatPage>;

    /// Messages whose receipt for `user_id` is still SENT, newest first.
    /// This is the reconnect catch-up query; the receipt table is the queue.
    async fn undelivered_messages(&self, user_id: i64) -> StoreResult<Vec<Message>>;

    /// SENT -> DELIVERED. No-op when the receipt is already at or past
    /// DELIVERED, or when no receipt exists.
    async fn set_delivered(&self, message_id: i64, user_id: i64) -> StoreResult<()>;

    /// DELIVERED -> READ for all of the user's receipts in the chat with
    /// `message_id <= up_to_id`. SENT receipts are left untouched.
    async fn set_read_up_to(&self, chat_id: i64, up_to_id: i64, user_id: i64)
    -> StoreResult<()>;

    async fn chat(&self, chat_id: i64) -> StoreResult<Chat>;
    async fn chat_members(&self, chat_id: i64) -> StoreResult<Vec<ChatMember>>;
    async fn member_role(&self, user_id: i64, chat_id: i64) -> StoreResult<MemberRole>;
    async fn message_author(&self, message_id: i64) -> StoreResult<i64>;
    async fn user_chats(&self, user_id: i64) -> StoreResult<Vec<Chat>>;

    /// Distinct counter-parties across the user's PRIVATE chats.
    async fn contacts(&self, user_id: i64) -> StoreResult<Vec<i64>>;

    /// Distinct users sharing at least one chat of any shape with `user_id`.
    /// Feeds presence fan-out.
    async fn chat_peers(&self, user_id: i64) -> StoreResult<Vec<i64>>;

    /// Receipt row for a (message, recipient) pair, if any.
    async fn receipt(&self, message_id: i64, user_id: i64) -> StoreResult<Option<Receipt>>;

    async fn health_check(&self) -> StoreResult<()>;
    fn backend_name(&self) -> &'static str;
}

/// Canonical unordered pair key for PRIVATE chat uniqueness.
pub(crate) fn private_pair(a: i64, b: i64) -> String {
    let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
    format!("{lo}:{hi}")
}

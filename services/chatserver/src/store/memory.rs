//! In-memory implementation of the chat store.
//!
//! Backs dev deployments and the test suite. All state lives in one
//! `RwLock`-guarded struct; taking the write lock for the duration of a
//! multi-row mutation is what gives this backend the same atomicity the
//! Postgres backend gets from transactions (a message is never visible
//! without its receipts). Not durable; restarts lose everything.
use super::{ChatPage, ChatStore, PAGE_SIZE, StoreError, StoreResult, private_pair};
use crate::model::{
    Chat, ChatMember, ChatType, MemberRole, Message, MessageEvent, Receipt, ReceiptStatus,
    RemovalKind,
};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::RwLock;

#[derive(Default)]
struct Inner {
    next_chat_id: i64,
    next_message_id: i64,
    chats: HashMap<i64, Chat>,
    /// Canonical pair -> chat id, the in-memory twin of the unique column.
    private_pairs: HashMap<String, i64>,
    /// chat id -> members.
    members: HashMap<i64, Vec<ChatMember>>,
    /// Ordered by id, which doubles as insertion order per chat.
    messages: BTreeMap<i64, Message>,
    receipts: HashMap<(i64, i64), Receipt>,
}

impl Inner {
    fn member_ids(&self, chat_id: i64) -> Vec<i64> {
        self.members
            .get(&chat_id)
            .map(|members| members.iter().map(|m| m.user_id).collect())
            .unwrap_or_default()
    }

    fn push_message(
        &mut self,
        chat_id: i64,
        from_user_id: i64,
        event: MessageEvent,
        content: Option<&str>,
        receipt_users: &[i64],
    ) -> i64 {
        let now = Utc::now();
        self.next_message_id += 1;
        let message_id = self.next_message_id;
        self.messages.insert(
            message_id,
            Message {
                id: message_id,
                chat_id,
                from_user_id,
                event_type: event,
                content: content.map(str::to_string),
                created_at: now,
                updated_at: now,
            },
        );
        for &user_id in receipt_users {
            self.receipts.entry((message_id, user_id)).or_insert(Receipt {
                message_id,
                user_id,
                status: ReceiptStatus::Sent,
                delivered_at: None,
                read_at: None,
            });
        }
        if let Some(chat) = self.chats.get_mut(&chat_id) {
            chat.updated_at = now;
        }
        message_id
    }
}

#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<RwLock<Inner>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ChatStore for MemoryStore {
    async fn insert_message(
        &self,
        chat_id: i64,
        from_user_id: i64,
        event: MessageEvent,
        content: Option<&str>,
    ) -> StoreResult<i64> {
        let mut inner = self.inner.write().await;
        if !inner.chats.contains_key(&chat_id) {
            return Err(StoreError::NotFound(format!("chat {chat_id}")));
        }
        let members = inner.member_ids(chat_id);
        Ok(inner.push_message(chat_id, from_user_id, event, content, &members))
    }

    async fn get_or_create_private_chat(&self, a: i64, b: i64) -> StoreResult<(i64, bool)> {
        let key = private_pair(a, b);
        let mut inner = self.inner.write().await;
        if let Some(&chat_id) = inner.private_pairs.get(&key) {
            return Ok((chat_id, false));
        }
        let now = Utc::now();
        inner.next_chat_id += 1;
        let chat_id = inner.next_chat_id;
        inner.chats.insert(
            chat_id,
            Chat {
                id: chat_id,
                chat_type: ChatType::Private,
                name: None,
                author_id: None,
                created_at: now,
                updated_at: now,
            },
        );
        inner.private_pairs.insert(key, chat_id);
        let mut members = vec![ChatMember {
            user_id: a,
            role: MemberRole::Member,
        }];
        if b != a {
            members.push(ChatMember {
                user_id: b,
                role: MemberRole::Member,
            });
        }
        inner.members.insert(chat_id, members);
        Ok((chat_id, true))
    }

    async fn create_group_chat(&self, name: &str, author_id: i64) -> StoreResult<i64> {
        let mut inner = self.inner.write().await;
        let now = Utc::now();
        inner.next_chat_id += 1;
        let chat_id = inner.next_chat_id;
        inner.chats.insert(
            chat_id,
            Chat {
                id: chat_id,
                chat_type: ChatType::Group,
                name: Some(name.to_string()),
                author_id: Some(author_id),
                created_at: now,
                updated_at: now,
            },
        );
        inner.members.insert(
            chat_id,
            vec![ChatMember {
                user_id: author_id,
                role: MemberRole::Admin,
            }],
        );
        Ok(chat_id)
    }

    async fn delete_group_chat(&self, chat_id: i64) -> StoreResult<()> {
        let mut inner = self.inner.write().await;
        if inner.chats.remove(&chat_id).is_none() {
            return Err(StoreError::NotFound(format!("chat {chat_id}")));
        }
        inner.members.remove(&chat_id);
        let message_ids: Vec<i64> = inner
            .messages
            .values()
            .filter(|m| m.chat_id == chat_id)
            .map(|m| m.id)
            .collect();
        for id in message_ids {
            inner.messages.remove(&id);
            inner.receipts.retain(|(message_id, _), _| *message_id != id);
        }
        Ok(())
    }

    async fn add_group_member(&self, chat_id: i64, user_id: i64) -> StoreResult<i64> {
        let mut inner = self.inner.write().await;
        match inner.chats.get(&chat_id) {
            None => return Err(StoreError::NotFound(format!("chat {chat_id}"))),
            Some(chat) if chat.chat_type != ChatType::Group => {
                return Err(StoreError::NotFound(format!("group chat {chat_id}")));
            }
            Some(_) => {}
        }
        let members = inner.members.entry(chat_id).or_default();
        if members.iter().any(|m| m.user_id == user_id) {
            return Err(StoreError::Conflict(format!(
                "user {user_id} already in chat {chat_id}"
            )));
        }
        members.push(ChatMember {
            user_id,
            role: MemberRole::Member,
        });
        let receipt_users = inner.member_ids(chat_id);
        Ok(inner.push_message(chat_id, user_id, MessageEvent::NewMember, None, &receipt_users))
    }

    async fn remove_group_member(
        &self,
        chat_id: i64,
        user_id: i64,
        kind: RemovalKind,
    ) -> StoreResult<i64> {
        let mut inner = self.inner.write().await;
        if !inner.chats.contains_key(&chat_id) {
            return Err(StoreError::NotFound(format!("chat {chat_id}")));
        }
        let members = inner.members.entry(chat_id).or_default();
        let before = members.len();
        members.retain(|m| m.user_id != user_id);
        if members.len() == before {
            return Err(StoreError::NotFound(format!(
                "user {user_id} in chat {chat_id}"
            )));
        }
        // The removed user still gets a receipt for their own removal event.
        let mut receipt_users = inner.member_ids(chat_id);
        receipt_users.push(user_id);
        Ok(inner.push_message(chat_id, user_id, kind.event(), None, &receipt_users))
    }

    async fn change_member_role(
        &self,
        chat_id: i64,
        user_id: i64,
        role: MemberRole,
    ) -> StoreResult<()> {
        let mut inner = self.inner.write().await;
        let members = inner
            .members
            .get_mut(&chat_id)
            .ok_or_else(|| StoreError::NotFound(format!("chat {chat_id}")))?;
        let member = members
            .iter_mut()
            .find(|m| m.user_id == user_id)
            .ok_or_else(|| StoreError::NotFound(format!("user {user_id} in chat {chat_id}")))?;
        member.role = role;
        Ok(())
    }

    async fn edit_message(&self, message_id: i64, content: &str) -> StoreResult<()> {
        let mut inner = self.inner.write().await;
        let message = inner
            .messages
            .get_mut(&message_id)
            .ok_or_else(|| StoreError::NotFound(format!("message {message_id}")))?;
        message.content = Some(content.to_string());
        message.event_type = MessageEvent::Edit;
        message.updated_at = Utc::now();
        Ok(())
    }

    async fn delete_message(&self, message_id: i64) -> StoreResult<()> {
        let mut inner = self.inner.write().await;
        let message = inner
            .messages
            .get_mut(&message_id)
            .ok_or_else(|| StoreError::NotFound(format!("message {message_id}")))?;
        message.content = None;
        message.event_type = MessageEvent::Delete;
        message.updated_at = Utc::now();
        Ok(())
    }

    async fn paginate_chat(&self, chat_id: i64, cursor: Option<i64>) -> StoreResult<ChatPage> {
        let inner = self.inner.read().await;
        let mut messages: Vec<Message> = inner
            .messages
            .values()
            .rev()
            .filter(|m| m.chat_id == chat_id)
            .filter(|m| cursor.is_none_or(|cursor| m.id < cursor))
            .take(PAGE_SIZE + 1)
            .cloned()
            .collect();
        let has_more = messages.len() > PAGE_SIZE;
        messages.truncate(PAGE_SIZE);
        let next_cursor = messages.last().map(|m| m.id);
        Ok(ChatPage {
            messages,
            next_cursor,
            has_more,
        })
    }

    async fn undelivered_messages(&self, user_id: i64) -> StoreResult<Vec<Message>> {
        let inner = self.inner.read().await;
        Ok(inner
            .messages
            .values()
            .rev()
            .filter(|m| {
                inner
                    .receipts
                    .get(&(m.id, user_id))
                    .is_some_and(|r| r.status == ReceiptStatus::Sent)
            })
            .cloned()
            .collect())
    }

    async fn set_delivered(&self, message_id: i64, user_id: i64) -> StoreResult<()> {
        let mut inner = self.inner.write().await;
        if let Some(receipt) = inner.receipts.get_mut(&(message_id, user_id)) {
            if receipt.status == ReceiptStatus::Sent {
                receipt.status = ReceiptStatus::Delivered;
                receipt.delivered_at = Some(Utc::now());
            }
        }
        Ok(())
    }

    async fn set_read_up_to(
        &self,
        chat_id: i64,
        up_to_id: i64,
        user_id: i64,
    ) -> StoreResult<()> {
        let mut inner = self.inner.write().await;
        let eligible: Vec<i64> = inner
            .messages
            .values()
            .filter(|m| m.chat_id == chat_id && m.id <= up_to_id)
            .map(|m| m.id)
            .collect();
        let now = Utc::now();
        for message_id in eligible {
            if let Some(receipt) = inner.receipts.get_mut(&(message_id, user_id)) {
                if receipt.status == ReceiptStatus::Delivered {
                    receipt.status = ReceiptStatus::Read;
                    receipt.read_at = Some(now);
                }
            }
        }
        Ok(())
    }

    async fn chat(&self, chat_id: i64) -> StoreResult<Chat> {
        let inner = self.inner.read().await;
        inner
            .chats
            .get(&chat_id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("chat {chat_id}")))
    }

    async fn chat_members(&self, chat_id: i64) -> StoreResult<Vec<ChatMember>> {
        let inner = self.inner.read().await;
        Ok(inner.members.get(&chat_id).cloned().unwrap_or_default())
    }

    async fn member_role(&self, user_id: i64, chat_id: i64) -> StoreResult<MemberRole> {
        let inner = self.inner.read().await;
        inner
            .members
            .get(&chat_id)
            .and_then(|members| members.iter().find(|m| m.user_id == user_id))
            .map(|m| m.role)
            .ok_or_else(|| StoreError::NotFound(format!("user {user_id} in chat {chat_id}")))
    }

    async fn message_author(&self, message_id: i64) -> StoreResult<i64> {
        let inner = self.inner.read().await;
        inner
            .messages
            .get(&message_id)
            .map(|m| m.from_user_id)
            .ok_or_else(|| StoreError::NotFound(format!("message {message_id}")))
    }

    async fn user_chats(&self, user_id: i64) -> StoreResult<Vec<Chat>> {
        let inner = self.inner.read().await;
        let mut chats: Vec<Chat> = inner
            .chats
            .values()
            .filter(|chat| {
                inner
                    .members
                    .get(&chat.id)
                    .is_some_and(|members| members.iter().any(|m| m.user_id == user_id))
            })
            .cloned()
            .collect();
        chats.sort_by(|a, b| b.updated_at.cmp(&a.updated_at).then(b.id.cmp(&a.id)));
        Ok(chats)
    }

    async fn contacts(&self, user_id: i64) -> StoreResult<Vec<i64>> {
        let inner = self.inner.read().await;
        let mut contacts: Vec<i64> = inner
            .chats
            .values()
            .filter(|chat| chat.chat_type == ChatType::Private)
            .filter_map(|chat| inner.members.get(&chat.id))
            .filter(|members| members.iter().any(|m| m.user_id == user_id))
            .flat_map(|members| members.iter().map(|m| m.user_id))
            .filter(|&id| id != user_id)
            .collect();
        contacts.sort_unstable();
        contacts.dedup();
        Ok(contacts)
    }

    async fn chat_peers(&self, user_id: i64) -> StoreResult<Vec<i64>> {
        let inner = self.inner.read().await;
        let mut peers: Vec<i64> = inner
            .members
            .values()
            .filter(|members| members.iter().any(|m| m.user_id == user_id))
            .flat_map(|members| members.iter().map(|m| m.user_id))
            .filter(|&id| id != user_id)
            .collect();
        peers.sort_unstable();
        peers.dedup();
        Ok(peers)
    }

    async fn receipt(&self, message_id: i64, user_id: i64) -> StoreResult<Option<Receipt>> {
        let inner = self.inner.read().await;
        Ok(inner.receipts.get(&(message_id, user_id)).copied())
    }

    async fn health_check(&self) -> StoreResult<()> {
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn group_with_members(store: &MemoryStore, users: &[i64]) -> i64 {
        let chat_id = store.create_group_chat("room", users[0]).await.expect("group");
        for &user in &users[1..] {
            store.add_group_member(chat_id, user).await.expect("member");
        }
        chat_id
    }

    #[tokio::test]
    async fn insert_message_creates_one_receipt_per_member() {
        let store = MemoryStore::new();
        let chat_id = group_with_members(&store, &[1, 2, 3]).await;
        let message_id = store
            .insert_message(chat_id, 1, MessageEvent::Send, Some("hi"))
            .await
            .expect("insert");
        for user in [1, 2, 3] {
            let receipt = store
                .receipt(message_id, user)
                .await
                .expect("receipt")
                .expect("exists");
            assert_eq!(receipt.status, ReceiptStatus::Sent);
        }
        assert!(
            store
                .receipt(message_id, 4)
                .await
                .expect("receipt")
                .is_none()
        );
    }

    #[tokio::test]
    async fn later_joiners_get_no_receipts_for_older_messages() {
        let store = MemoryStore::new();
        let chat_id = group_with_members(&store, &[1, 2]).await;
        let early = store
            .insert_message(chat_id, 1, MessageEvent::Send, Some("before"))
            .await
            .expect("insert");
        store.add_group_member(chat_id, 3).await.expect("member");
        assert!(store.receipt(early, 3).await.expect("receipt").is_none());
        let late = store
            .insert_message(chat_id, 1, MessageEvent::Send, Some("after"))
            .await
            .expect("insert");
        assert!(store.receipt(late, 3).await.expect("receipt").is_some());
    }

    #[tokio::test]
    async fn get_or_create_private_chat_is_idempotent() {
        let store = MemoryStore::new();
        let (chat_id, created) = store.get_or_create_private_chat(1, 2).await.expect("first");
        assert!(created);
        let (again, created) = store.get_or_create_private_chat(2, 1).await.expect("second");
        assert!(!created);
        assert_eq!(chat_id, again);
        let members = store.chat_members(chat_id).await.expect("members");
        assert_eq!(members.len(), 2);
        assert!(members.iter().all(|m| m.role == MemberRole::Member));
    }

    #[tokio::test]
    async fn concurrent_private_chat_creation_yields_one_created() {
        let store = MemoryStore::new();
        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store.get_or_create_private_chat(5, 9).await.expect("get-or-create")
            }));
        }
        let mut created_count = 0;
        let mut chat_ids = Vec::new();
        for handle in handles {
            let (chat_id, created) = handle.await.expect("join");
            chat_ids.push(chat_id);
            if created {
                created_count += 1;
            }
        }
        assert_eq!(created_count, 1);
        chat_ids.dedup();
        assert_eq!(chat_ids.len(), 1);
    }

    #[tokio::test]
    async fn duplicate_member_is_a_conflict() {
        let store = MemoryStore::new();
        let chat_id = group_with_members(&store, &[1, 2]).await;
        let err = store.add_group_member(chat_id, 2).await.expect_err("dup");
        assert!(matches!(err, StoreError::Conflict(_)));
    }

    #[tokio::test]
    async fn removed_member_still_receives_the_removal_event() {
        let store = MemoryStore::new();
        let chat_id = group_with_members(&store, &[1, 2, 3]).await;
        let message_id = store
            .remove_group_member(chat_id, 3, RemovalKind::Kicked)
            .await
            .expect("remove");
        // Post-change members and the kicked user all have receipts.
        for user in [1, 2, 3] {
            assert!(
                store
                    .receipt(message_id, user)
                    .await
                    .expect("receipt")
                    .is_some(),
                "user {user} should have a receipt"
            );
        }
        let members = store.chat_members(chat_id).await.expect("members");
        assert!(!members.iter().any(|m| m.user_id == 3));
    }

    #[tokio::test]
    async fn receipt_progression_is_monotone() {
        let store = MemoryStore::new();
        let chat_id = group_with_members(&store, &[1, 2]).await;
        let message_id = store
            .insert_message(chat_id, 1, MessageEvent::Send, Some("hi"))
            .await
            .expect("insert");

        store.set_delivered(message_id, 2).await.expect("deliver");
        let receipt = store.receipt(message_id, 2).await.expect("receipt").expect("row");
        assert_eq!(receipt.status, ReceiptStatus::Delivered);
        let delivered_at = receipt.delivered_at.expect("delivered_at");

        // Second delivery is a no-op and does not move the timestamp.
        store.set_delivered(message_id, 2).await.expect("deliver");
        let receipt = store.receipt(message_id, 2).await.expect("receipt").expect("row");
        assert_eq!(receipt.delivered_at, Some(delivered_at));

        store
            .set_read_up_to(chat_id, message_id, 2)
            .await
            .expect("read");
        let receipt = store.receipt(message_id, 2).await.expect("receipt").expect("row");
        assert_eq!(receipt.status, ReceiptStatus::Read);

        // Delivering a READ receipt must not regress it.
        store.set_delivered(message_id, 2).await.expect("deliver");
        let receipt = store.receipt(message_id, 2).await.expect("receipt").expect("row");
        assert_eq!(receipt.status, ReceiptStatus::Read);
    }

    #[tokio::test]
    async fn read_up_to_skips_sent_receipts() {
        let store = MemoryStore::new();
        let chat_id = group_with_members(&store, &[1, 2]).await;
        let mut ids = Vec::new();
        for n in 0..3 {
            ids.push(
                store
                    .insert_message(chat_id, 1, MessageEvent::Send, Some(&format!("m{n}")))
                    .await
                    .expect("insert"),
            );
        }
        // Only the first two are acknowledged as delivered.
        store.set_delivered(ids[0], 2).await.expect("deliver");
        store.set_delivered(ids[1], 2).await.expect("deliver");

        store.set_read_up_to(chat_id, ids[2], 2).await.expect("read");

        let statuses: Vec<ReceiptStatus> = {
            let mut out = Vec::new();
            for &id in &ids {
                out.push(store.receipt(id, 2).await.expect("receipt").expect("row").status);
            }
            out
        };
        assert_eq!(
            statuses,
            vec![
                ReceiptStatus::Read,
                ReceiptStatus::Read,
                ReceiptStatus::Sent
            ]
        );
    }

    #[tokio::test]
    async fn read_up_to_honors_the_bound() {
        let store = MemoryStore::new();
        let chat_id = group_with_members(&store, &[1, 2]).await;
        let mut ids = Vec::new();
        for n in 0..3 {
            ids.push(
                store
                    .insert_message(chat_id, 1, MessageEvent::Send, Some(&format!("m{n}")))
                    .await
                    .expect("insert"),
            );
        }
        for &id in &ids {
            store.set_delivered(id, 2).await.expect("deliver");
        }
        store.set_read_up_to(chat_id, ids[1], 2).await.expect("read");
        assert_eq!(
            store.receipt(ids[0], 2).await.expect("r").expect("row").status,
            ReceiptStatus::Read
        );
        assert_eq!(
            store.receipt(ids[1], 2).await.expect("r").expect("row").status,
            ReceiptStatus::Read
        );
        assert_eq!(
            store.receipt(ids[2], 2).await.expect("r").expect("row").status,
            ReceiptStatus::Delivered
        );
    }

    #[tokio::test]
    async fn pagination_returns_twenty_and_signals_more() {
        let store = MemoryStore::new();
        let chat_id = group_with_members(&store, &[1, 2]).await;
        for n in 0..25 {
            store
                .insert_message(chat_id, 1, MessageEvent::Send, Some(&format!("m{n}")))
                .await
                .expect("insert");
        }
        let page = store.paginate_chat(chat_id, None).await.expect("page");
        assert_eq!(page.messages.len(), PAGE_SIZE);
        assert!(page.has_more);
        // Newest first.
        assert!(page.messages[0].id > page.messages[19].id);

        let rest = store
            .paginate_chat(chat_id, page.next_cursor)
            .await
            .expect("page");
        assert_eq!(rest.messages.len(), 5);
        assert!(!rest.has_more);
        assert!(rest.messages[0].id < page.messages[19].id);
    }

    #[tokio::test]
    async fn undelivered_messages_come_back_newest_first() {
        let store = MemoryStore::new();
        let chat_id = group_with_members(&store, &[6, 7]).await;
        let mut ids = Vec::new();
        for n in 0..3 {
            ids.push(
                store
                    .insert_message(chat_id, 7, MessageEvent::Send, Some(&format!("m{n}")))
                    .await
                    .expect("insert"),
            );
        }
        let pending = store.undelivered_messages(6).await.expect("undelivered");
        let pending_ids: Vec<i64> = pending.iter().map(|m| m.id).collect();
        let mut expected = ids.clone();
        expected.reverse();
        assert_eq!(pending_ids, expected);

        store.set_delivered(ids[1], 6).await.expect("deliver");
        let pending = store.undelivered_messages(6).await.expect("undelivered");
        assert_eq!(pending.len(), 2);
    }

    #[tokio::test]
    async fn delete_message_leaves_a_tombstone() {
        let store = MemoryStore::new();
        let chat_id = group_with_members(&store, &[1, 2]).await;
        let message_id = store
            .insert_message(chat_id, 1, MessageEvent::Send, Some("secret"))
            .await
            .expect("insert");
        store.delete_message(message_id).await.expect("delete");
        let page = store.paginate_chat(chat_id, None).await.expect("page");
        let tombstone = page
            .messages
            .iter()
            .find(|m| m.id == message_id)
            .expect("row survives");
        assert_eq!(tombstone.event_type, MessageEvent::Delete);
        assert_eq!(tombstone.content, None);
    }

    #[tokio::test]
    async fn contacts_and_peers_are_distinct_sets() {
        let store = MemoryStore::new();
        store.get_or_create_private_chat(1, 2).await.expect("private");
        store.get_or_create_private_chat(1, 3).await.expect("private");
        let group = group_with_members(&store, &[1, 4]).await;
        store.add_group_member(group, 2).await.expect("member");

        // Contacts: private counter-parties only.
        assert_eq!(store.contacts(1).await.expect("contacts"), vec![2, 3]);
        // Peers: anyone sharing any chat.
        assert_eq!(store.chat_peers(1).await.expect("peers"), vec![2, 3, 4]);
    }

    #[tokio::test]
    async fn delete_group_chat_cascades() {
        let store = MemoryStore::new();
        let chat_id = group_with_members(&store, &[1, 2]).await;
        let message_id = store
            .insert_message(chat_id, 1, MessageEvent::Send, Some("bye"))
            .await
            .expect("insert");
        store.delete_group_chat(chat_id).await.expect("delete");
        assert!(matches!(
            store.chat(chat_id).await,
            Err(StoreError::NotFound(_))
        ));
        assert!(store.receipt(message_id, 2).await.expect("receipt").is_none());
        assert!(store.chat_members(chat_id).await.expect("members").is_empty());
    }
}

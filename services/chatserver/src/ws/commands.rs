//! Typed command handlers behind the websocket read loop.
//!
//! Every handler follows the same contract: mutate the store first, confirm
//! to the sender's own channel (so all of their devices reconcile optimistic
//! state), then fan out to the other chat members through the delivery
//! engine. Errors bubble up to the dispatcher, which logs and keeps the
//! connection alive.
use crate::app::AppState;
use crate::model::{MemberRole, MessageEvent};
use crate::store::ChatStore;
use anyhow::{Context, anyhow};
use chrono::Utc;
use murmur_wire::{
    DeleteMessage, DeletedMessage, DeliveredAck, DeliveredReceipt, EditMessage, EditedMessage,
    Envelope, EventKind, MessageConfirmed, NewChat, NewMessage, ReadAck, ReadReceipt,
    SendMessage,
};

/// Fan an envelope out to every chat member except `skip`.
async fn fan_out(
    state: &AppState,
    chat_id: i64,
    skip: Option<i64>,
    envelope: &Envelope,
) -> anyhow::Result<()> {
    let members = state
        .store
        .chat_members(chat_id)
        .await
        .context("load chat members")?;
    for member in members {
        if Some(member.user_id) == skip {
            continue;
        }
        state.delivery.deliver(member.user_id, envelope).await;
    }
    Ok(())
}

async fn confirm_to_sender(
    state: &AppState,
    sender: i64,
    temp_message_id: &str,
    message_id: i64,
    chat_id: i64,
    temp_chat_id: Option<String>,
    created_chat: bool,
) -> anyhow::Result<()> {
    let confirmed = Envelope::new(
        EventKind::MessageConfirmed,
        &MessageConfirmed {
            temp_message_id: temp_message_id.to_string(),
            message_id,
            chat_id,
            temp_chat_id,
            created_chat,
            created_at: Utc::now(),
        },
    )?;
    state.delivery.deliver(sender, &confirmed).await;
    Ok(())
}

pub(super) async fn send_message(
    state: &AppState,
    sender: i64,
    cmd: SendMessage,
) -> anyhow::Result<()> {
    // Resolve the chat: either it exists, or this send opens a private chat.
    let (chat_id, created) = match cmd.chat_id {
        Some(chat_id) => (chat_id, false),
        None => {
            let to_user = cmd
                .to_user_id
                .ok_or_else(|| anyhow!("send_message without chat_id or to_user_id"))?;
            state
                .store
                .get_or_create_private_chat(sender, to_user)
                .await
                .context("get or create private chat")?
        }
    };

    let message_id = state
        .store
        .insert_message(chat_id, sender, MessageEvent::Send, Some(&cmd.content))
        .await
        .context("insert message")?;

    // The sending device has the message by definition; settle its own
    // receipt so catch-up never echoes it back.
    if let Err(err) = state.store.set_delivered(message_id, sender).await {
        tracing::error!(sender, message_id, error = %err, "sender receipt update failed");
    }

    confirm_to_sender(
        state,
        sender,
        &cmd.temp_message_id,
        message_id,
        chat_id,
        cmd.temp_chat_id.clone(),
        created,
    )
    .await?;

    if created {
        if let Some(to_user) = cmd.to_user_id {
            let new_chat = Envelope::new(
                EventKind::NewChat,
                &NewChat {
                    chat_id,
                    chat_type: "PRIVATE".to_string(),
                    with_user_id: sender,
                    created_at: Utc::now(),
                },
            )?;
            state.delivery.deliver(to_user, &new_chat).await;
        }
    }

    let event = Envelope::new(
        EventKind::NewMessage,
        &NewMessage {
            chat_id,
            message_id,
            from_user_id: sender,
            content: cmd.content.clone(),
            created_at: Utc::now(),
        },
    )?;
    fan_out(state, chat_id, Some(sender), &event).await
}

pub(super) async fn edit_message(
    state: &AppState,
    sender: i64,
    cmd: EditMessage,
) -> anyhow::Result<()> {
    // Any member may edit; tightening this to the author would be a
    // one-line guard on message_author.
    state
        .store
        .edit_message(cmd.message_id, &cmd.content)
        .await
        .context("edit message")?;

    confirm_to_sender(
        state,
        sender,
        &cmd.temp_message_id,
        cmd.message_id,
        cmd.chat_id,
        None,
        false,
    )
    .await?;

    let event = Envelope::new(
        EventKind::EditMessage,
        &EditedMessage {
            chat_id: cmd.chat_id,
            message_id: cmd.message_id,
            new_content: cmd.content.clone(),
            edited_at: Utc::now(),
        },
    )?;
    fan_out(state, cmd.chat_id, Some(sender), &event).await
}

pub(super) async fn delete_message(
    state: &AppState,
    sender: i64,
    cmd: DeleteMessage,
) -> anyhow::Result<()> {
    let author = state
        .store
        .message_author(cmd.message_id)
        .await
        .context("load message author")?;
    let is_admin = matches!(
        state.store.member_role(sender, cmd.chat_id).await,
        Ok(MemberRole::Admin)
    );
    if sender != author && !is_admin {
        tracing::warn!(
            sender,
            message_id = cmd.message_id,
            "delete rejected: not author or admin"
        );
        return Ok(());
    }

    state
        .store
        .delete_message(cmd.message_id)
        .await
        .context("delete message")?;

    confirm_to_sender(
        state,
        sender,
        &cmd.temp_message_id,
        cmd.message_id,
        cmd.chat_id,
        None,
        false,
    )
    .await?;

    let event = Envelope::new(
        EventKind::DeleteMessage,
        &DeletedMessage {
            chat_id: cmd.chat_id,
            message_id: cmd.message_id,
        },
    )?;
    fan_out(state, cmd.chat_id, Some(sender), &event).await
}

pub(super) async fn mark_delivered(
    state: &AppState,
    sender: i64,
    cmd: DeliveredAck,
) -> anyhow::Result<()> {
    state
        .store
        .set_delivered(cmd.message_id, sender)
        .await
        .context("set delivered")?;

    // All members, sender included, so the sender's other devices mirror
    // the acknowledgement too.
    let event = Envelope::new(
        EventKind::MessageDelivered,
        &DeliveredReceipt {
            chat_id: cmd.chat_id,
            message_id: cmd.message_id,
        },
    )?;
    fan_out(state, cmd.chat_id, None, &event).await
}

pub(super) async fn mark_read(
    state: &AppState,
    sender: i64,
    cmd: ReadAck,
) -> anyhow::Result<()> {
    state
        .store
        .set_read_up_to(cmd.chat_id, cmd.up_to_id, sender)
        .await
        .context("set read up to")?;

    let event = Envelope::new(
        EventKind::MessageRead,
        &ReadReceipt {
            chat_id: cmd.chat_id,
            user_id: sender,
            up_to_id: cmd.up_to_id,
            read_at: Utc::now(),
        },
    )?;
    fan_out(state, cmd.chat_id, None, &event).await
}

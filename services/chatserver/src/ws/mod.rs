//! Per-endpoint duplex websocket handler.
//!
//! Each accepted socket gets a read task and a write task under a shared
//! cancellation scope: the first one to fail cancels the other, and teardown
//! (hub unregister, bus unsubscribe, socket close) is idempotent.
//!
//! The write task doubles as the keepalive driver: it pings every
//! `PING_PERIOD` and the peer's pongs both refresh the read deadline and
//! feed the heartbeat engine. The read task enforces the deadline by
//! timing out the socket read at `PONG_WAIT`.
use crate::app::AppState;
use crate::auth::AuthUser;
use crate::model::{Message as ChatMessage, MessageEvent};
use crate::store::ChatStore;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Extension, State};
use axum::response::IntoResponse;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use murmur_bus::{Bus, Subscription};
use murmur_wire::{ClientFrame, Envelope, EventKind, MembershipChange, NewMessage};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

mod commands;

pub const WRITE_WAIT: Duration = Duration::from_secs(10);
pub const PONG_WAIT: Duration = Duration::from_secs(10);
/// 9/10 of `PONG_WAIT`, so a ping is always in flight before the deadline.
pub const PING_PERIOD: Duration = Duration::from_millis(9_000);

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Extension(AuthUser(user_id)): Extension<AuthUser>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, user_id, state))
}

async fn handle_socket(socket: WebSocket, user_id: i64, state: AppState) {
    let endpoint_id = state.hub.register(user_id).await;

    // The connection itself is the first proof of life.
    if let Err(err) = state.heartbeat.handle_heartbeat(user_id).await {
        tracing::error!(user_id, error = %err, "initial heartbeat failed");
    }

    let subscription = match state.bus.subscribe(user_id).await {
        Ok(subscription) => subscription,
        Err(err) => {
            tracing::error!(user_id, error = %err, "bus subscribe failed");
            state.hub.unregister(user_id, endpoint_id).await;
            return;
        }
    };

    let (mut sink, stream) = socket.split();

    // Reconnect catch-up: everything still SENT for this user goes out
    // first, before live traffic starts flowing.
    replay_undelivered(&state, user_id, &mut sink).await;

    let scope = state.shutdown.child_token();
    let write = tokio::spawn(write_loop(
        sink,
        subscription,
        state.clone(),
        user_id,
        scope.clone(),
    ));
    let read = tokio::spawn(read_loop(stream, state.clone(), user_id, scope));

    let _ = read.await;
    let _ = write.await;

    state.hub.unregister(user_id, endpoint_id).await;
}

/// Wire envelope for a stored message, used for catch-up replay.
fn envelope_for_message(message: &ChatMessage) -> Option<Envelope> {
    let envelope = match message.event_type {
        MessageEvent::Send | MessageEvent::Edit | MessageEvent::Delete => Envelope::new(
            EventKind::NewMessage,
            &NewMessage {
                chat_id: message.chat_id,
                message_id: message.id,
                from_user_id: message.from_user_id,
                content: message.content.clone().unwrap_or_default(),
                created_at: message.created_at,
            },
        ),
        MessageEvent::NewMember | MessageEvent::LeftMember | MessageEvent::KickedMember => {
            let kind = match message.event_type {
                MessageEvent::NewMember => EventKind::NewMember,
                MessageEvent::LeftMember => EventKind::LeftMember,
                _ => EventKind::KickedMember,
            };
            Envelope::new(
                kind,
                &MembershipChange {
                    message_id: message.id,
                    chat_id: message.chat_id,
                    user_id: message.from_user_id,
                },
            )
        }
    };
    match envelope {
        Ok(envelope) => Some(envelope),
        Err(err) => {
            tracing::error!(message_id = message.id, error = %err, "encode failed");
            None
        }
    }
}

async fn replay_undelivered(
    state: &AppState,
    user_id: i64,
    sink: &mut SplitSink<WebSocket, Message>,
) {
    let pending = match state.store.undelivered_messages(user_id).await {
        Ok(pending) => pending,
        Err(err) => {
            tracing::error!(user_id, error = %err, "undelivered scan failed");
            return;
        }
    };
    for message in &pending {
        let Some(envelope) = envelope_for_message(message) else {
            continue;
        };
        let Ok(encoded) = envelope.encode() else {
            continue;
        };
        let Ok(text) = String::from_utf8(encoded) else {
            continue;
        };
        let written =
            tokio::time::timeout(WRITE_WAIT, sink.send(Message::Text(text))).await;
        match written {
            Ok(Ok(())) => {
                if let Err(err) = state.store.set_delivered(message.id, user_id).await {
                    tracing::error!(
                        user_id,
                        message_id = message.id,
                        error = %err,
                        "receipt update failed during replay"
                    );
                }
            }
            _ => {
                tracing::warn!(user_id, "replay write failed, stopping catch-up");
                return;
            }
        }
    }
    if !pending.is_empty() {
        tracing::debug!(user_id, count = pending.len(), "replayed undelivered messages");
    }
}

async fn read_loop(
    mut stream: SplitStream<WebSocket>,
    state: AppState,
    user_id: i64,
    scope: CancellationToken,
) {
    loop {
        let frame = tokio::select! {
            _ = scope.cancelled() => break,
            frame = tokio::time::timeout(PONG_WAIT, stream.next()) => frame,
        };

        let message = match frame {
            // No pong (or anything else) inside the deadline: peer is gone.
            Err(_) => {
                tracing::info!(user_id, "read deadline exceeded");
                break;
            }
            Ok(None) => break,
            Ok(Some(Err(err))) => {
                tracing::info!(user_id, error = %err, "websocket closed");
                break;
            }
            Ok(Some(Ok(message))) => message,
        };

        match message {
            Message::Pong(_) => {
                // Deadline already refreshed by the next loop turn; pongs are
                // also the application-level keepalive.
                if let Err(err) = state.heartbeat.handle_heartbeat(user_id).await {
                    tracing::error!(user_id, error = %err, "heartbeat failed");
                }
            }
            // The protocol layer answers pings on the next write.
            Message::Ping(_) => {}
            Message::Text(text) => dispatch_frame(&state, user_id, text.as_bytes()).await,
            Message::Binary(raw) => dispatch_frame(&state, user_id, &raw).await,
            Message::Close(_) => break,
        }
    }
    scope.cancel();
}

async fn dispatch_frame(state: &AppState, sender: i64, raw: &[u8]) {
    let frame = match ClientFrame::decode(raw) {
        Ok(frame) => frame,
        Err(err) => {
            // Malformed and unknown frames are logged and dropped; the
            // connection stays up.
            tracing::warn!(user_id = sender, error = %err, "dropping bad frame");
            return;
        }
    };

    let outcome = match frame {
        ClientFrame::SendMessage(cmd) => commands::send_message(state, sender, cmd).await,
        ClientFrame::EditMessage(cmd) => commands::edit_message(state, sender, cmd).await,
        ClientFrame::DeleteMessage(cmd) => commands::delete_message(state, sender, cmd).await,
        ClientFrame::MessageDelivered(cmd) => {
            commands::mark_delivered(state, sender, cmd).await
        }
        ClientFrame::MessageRead(cmd) => commands::mark_read(state, sender, cmd).await,
    };
    if let Err(err) = outcome {
        tracing::error!(user_id = sender, error = %err, "command failed");
    }
}

async fn write_loop(
    mut sink: SplitSink<WebSocket, Message>,
    mut subscription: Subscription,
    state: AppState,
    user_id: i64,
    scope: CancellationToken,
) {
    let mut ticker = tokio::time::interval(PING_PERIOD);
    // Skip the immediate first tick; the connection is brand new.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = scope.cancelled() => break,
            _ = ticker.tick() => {
                let ping = tokio::time::timeout(
                    WRITE_WAIT,
                    sink.send(Message::Ping(Vec::new())),
                )
                .await;
                if !matches!(ping, Ok(Ok(()))) {
                    tracing::info!(user_id, "ping write failed");
                    break;
                }
            }
            payload = subscription.recv() => {
                let Some(payload) = payload else { break };
                let envelope = match Envelope::decode(&payload) {
                    Ok(envelope) => envelope,
                    Err(err) => {
                        tracing::error!(user_id, error = %err, "bad bus payload");
                        continue;
                    }
                };
                let Ok(text) = String::from_utf8(payload.to_vec()) else {
                    tracing::error!(user_id, "bus payload was not utf-8");
                    continue;
                };
                let written = tokio::time::timeout(
                    WRITE_WAIT,
                    sink.send(Message::Text(text)),
                )
                .await;
                if !matches!(written, Ok(Ok(()))) {
                    tracing::info!(user_id, "event write failed");
                    break;
                }
                // Message-bearing events advance this endpoint's receipt.
                // Failures are logged, never fatal: the receipt is re-marked
                // on a later event or at the next reconnect.
                if let Some(message_id) = envelope.message_id() {
                    if let Err(err) = state.store.set_delivered(message_id, user_id).await {
                        tracing::error!(
                            user_id,
                            message_id,
                            error = %err,
                            "receipt update failed"
                        );
                    }
                }
            }
        }
    }
    scope.cancel();
    let _ = sink.close().await;
    subscription.close().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn ping_period_is_nine_tenths_of_pong_wait() {
        assert_eq!(PING_PERIOD, PONG_WAIT * 9 / 10);
    }

    #[test]
    fn replay_maps_storage_events_onto_wire_kinds() {
        let now = Utc::now();
        let base = ChatMessage {
            id: 1,
            chat_id: 2,
            from_user_id: 3,
            event_type: MessageEvent::Send,
            content: Some("hi".to_string()),
            created_at: now,
            updated_at: now,
        };
        let envelope = envelope_for_message(&base).expect("envelope");
        assert_eq!(envelope.kind, EventKind::NewMessage);
        assert_eq!(envelope.message_id(), Some(1));

        let kicked = ChatMessage {
            event_type: MessageEvent::KickedMember,
            content: None,
            ..base.clone()
        };
        let envelope = envelope_for_message(&kicked).expect("envelope");
        assert_eq!(envelope.kind, EventKind::KickedMember);
        assert_eq!(envelope.message_id(), Some(1));

        let tombstone = ChatMessage {
            event_type: MessageEvent::Delete,
            content: None,
            ..base
        };
        let envelope = envelope_for_message(&tombstone).expect("envelope");
        assert_eq!(envelope.kind, EventKind::NewMessage);
    }
}

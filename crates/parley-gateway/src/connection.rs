use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use tracing::{error, info, warn};
use uuid::Uuid;

use parley_chat::ChatService;
use parley_types::api::MessageKind;
use parley_types::error::ChatError;
use parley_types::events::{ClientCommand, ServerEvent};

use crate::auth::AuthedUser;
use crate::dispatcher::Dispatcher;
use crate::rate_limit::RateLimiter;

/// Heartbeat interval: server sends a Ping every 15 seconds.
/// If 2 consecutive Pongs are missed (~30s), the connection is dropped.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

/// Handle an authenticated WebSocket connection. The bearer credential was
/// already validated at the HTTP upgrade layer; a connection that reaches
/// this point is bound to its user's personal channel and enters the event
/// loop directly.
pub async fn handle_connection(
    socket: WebSocket,
    dispatcher: Dispatcher,
    chat: Arc<ChatService>,
    limiter: Arc<RateLimiter>,
    user: AuthedUser,
) {
    let (mut sender, mut receiver) = socket.split();
    let user_id = user.user_id;

    info!("{} ({}) connected to gateway", user.username, user_id);

    // Personal channel: targeted events and group broadcasts for this
    // connection arrive on event_rx.
    let (conn_id, mut event_rx) = dispatcher.register(user_id).await;

    // Shared flag for heartbeat
    let pong_received = Arc::new(AtomicBool::new(true));
    let pong_flag_send = pong_received.clone();
    let pong_flag_recv = pong_received.clone();

    // Forward dispatcher events -> client, with heartbeat
    let mut send_task = tokio::spawn(async move {
        let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
        heartbeat.tick().await;
        let mut missed_heartbeats: u8 = 0;

        loop {
            tokio::select! {
                result = event_rx.recv() => {
                    let event = match result {
                        Some(event) => event,
                        None => break,
                    };
                    let text = serde_json::to_string(&event).unwrap();
                    if sender.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                _ = heartbeat.tick() => {
                    if pong_flag_send.swap(false, Ordering::Acquire) {
                        missed_heartbeats = 0;
                    } else {
                        missed_heartbeats += 1;
                        if missed_heartbeats >= 2 {
                            warn!("Heartbeat timeout (missed {} pongs), dropping connection", missed_heartbeats);
                            break;
                        }
                    }
                    if sender.send(Message::Ping(vec![].into())).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    // Read commands from client
    let dispatcher_recv = dispatcher.clone();
    let chat_recv = chat.clone();
    let limiter_recv = limiter.clone();
    let username_recv = user.username.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = receiver.next().await {
            match msg {
                Message::Text(text) => {
                    match serde_json::from_str::<ClientCommand>(&text) {
                        Ok(cmd) => {
                            handle_command(
                                &dispatcher_recv,
                                &chat_recv,
                                &limiter_recv,
                                user_id,
                                conn_id,
                                cmd,
                            )
                            .await;
                        }
                        Err(e) => {
                            warn!(
                                "{} ({}) bad command: {} -- raw: {}",
                                username_recv,
                                user_id,
                                e,
                                text.chars().take(200).collect::<String>()
                            );
                        }
                    }
                }
                Message::Pong(_) => {
                    pong_flag_recv.store(true, Ordering::Release);
                }
                Message::Close(_) => break,
                _ => {}
            }
        }
    });

    // Wait for either task to finish
    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    // Implicit leave of all conversation groups
    dispatcher.unregister(conn_id).await;
    info!("{} ({}) disconnected from gateway", user.username, user_id);
}

async fn handle_command(
    dispatcher: &Dispatcher,
    chat: &Arc<ChatService>,
    limiter: &Arc<RateLimiter>,
    user_id: Uuid,
    conn_id: Uuid,
    cmd: ClientCommand,
) {
    match cmd {
        ClientCommand::ConversationJoin { conversation_id } => {
            let Some(conversation_id) = conversation_id else {
                reject(dispatcher, conn_id, &missing_conversation_id().to_string()).await;
                return;
            };

            let svc = chat.clone();
            let is_member =
                tokio::task::spawn_blocking(move || svc.is_participant(conversation_id, user_id))
                    .await;
            match is_member {
                Ok(Ok(true)) => {
                    dispatcher.join_conversation(conversation_id, conn_id).await;
                    dispatcher
                        .send_to_conn(conn_id, ServerEvent::ConversationJoined { conversation_id })
                        .await;
                }
                Ok(Ok(false)) => {
                    reject(dispatcher, conn_id, &ChatError::Forbidden.to_string()).await;
                }
                Ok(Err(e)) => {
                    error!("conversation:join membership check failed: {}", e);
                    reject(dispatcher, conn_id, "Failed to join conversation").await;
                }
                Err(e) => {
                    error!("spawn_blocking join error: {}", e);
                    reject(dispatcher, conn_id, "Failed to join conversation").await;
                }
            }
        }

        ClientCommand::MessageSend {
            conversation_id,
            kind,
            content,
        } => {
            let Some(conversation_id) = conversation_id else {
                reject(dispatcher, conn_id, &missing_conversation_id().to_string()).await;
                return;
            };

            // Quota first: a rate-limited send persists nothing.
            if !limiter.check(user_id).await {
                reject(dispatcher, conn_id, &ChatError::RateLimited.to_string()).await;
                return;
            }

            let kind = kind.unwrap_or(MessageKind::Text);
            let svc = chat.clone();
            let result = tokio::task::spawn_blocking(move || {
                svc.append_message(conversation_id, user_id, kind, content)
            })
            .await;

            let message = match result {
                Ok(Ok(message)) => message,
                Ok(Err(ChatError::Storage(e))) => {
                    error!("message:send persistence failed: {}", e);
                    reject(dispatcher, conn_id, "Failed to send message").await;
                    return;
                }
                Ok(Err(e)) => {
                    reject(dispatcher, conn_id, &e.to_string()).await;
                    return;
                }
                Err(e) => {
                    error!("spawn_blocking send error: {}", e);
                    reject(dispatcher, conn_id, "Failed to send message").await;
                    return;
                }
            };

            // Broadcast strictly after the durable copy exists. The sender's
            // other connections receive it too (multi-device sync).
            let message_id = message.id;
            let delivered_to_others = dispatcher
                .broadcast_to_conversation(conversation_id, user_id, ServerEvent::MessageNew(message))
                .await;

            if delivered_to_others > 0 {
                let svc = chat.clone();
                match tokio::task::spawn_blocking(move || svc.mark_delivered(message_id)).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => warn!("Failed to mark message {} delivered: {}", message_id, e),
                    Err(e) => warn!("spawn_blocking delivered error: {}", e),
                }
            }
        }

        // Typing indicators are ephemeral and skip per-event membership
        // re-validation; the join-time check gates the group itself.
        ClientCommand::TypingStart { conversation_id } => {
            if let Some(conversation_id) = conversation_id {
                dispatcher
                    .broadcast_to_conversation_except(
                        conversation_id,
                        conn_id,
                        ServerEvent::Typing {
                            user_id,
                            conversation_id,
                        },
                    )
                    .await;
            }
        }

        ClientCommand::TypingStop { conversation_id } => {
            if let Some(conversation_id) = conversation_id {
                dispatcher
                    .broadcast_to_conversation_except(
                        conversation_id,
                        conn_id,
                        ServerEvent::StoppedTyping {
                            user_id,
                            conversation_id,
                        },
                    )
                    .await;
            }
        }
    }
}

fn missing_conversation_id() -> ChatError {
    ChatError::Validation("conversationId required".into())
}

/// Errors go only to the originating connection, never the group.
async fn reject(dispatcher: &Dispatcher, conn_id: Uuid, message: &str) {
    dispatcher
        .send_to_conn(
            conn_id,
            ServerEvent::Error {
                message: message.to_string(),
            },
        )
        .await;
}

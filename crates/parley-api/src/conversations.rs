use axum::{
    Extension, Json,
    extract::{Path, Query, State},
    response::IntoResponse,
};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::error;
use uuid::Uuid;

use parley_chat::service::{DEFAULT_CONVERSATION_LIMIT, DEFAULT_MESSAGE_LIMIT};
use parley_types::api::{Claims, StartConversationRequest};
use parley_types::error::ChatError;

use crate::AppState;
use crate::error::ApiError;

#[derive(Debug, Deserialize)]
pub struct ConversationQuery {
    #[serde(default = "default_page")]
    pub page: u32,
    #[serde(default = "default_conversation_limit")]
    pub limit: u32,
}

#[derive(Debug, Deserialize)]
pub struct MessageQuery {
    #[serde(default = "default_message_limit")]
    pub limit: u32,
    /// Cursor-based pagination — pass the `createdAt` of the oldest message
    /// from the previous page to fetch older messages.
    pub before: Option<DateTime<Utc>>,
}

fn default_page() -> u32 {
    1
}

fn default_conversation_limit() -> u32 {
    DEFAULT_CONVERSATION_LIMIT
}

fn default_message_limit() -> u32 {
    DEFAULT_MESSAGE_LIMIT
}

/// Start-or-get the direct conversation with another user. Idempotent:
/// repeated calls return the same conversation.
pub async fn start_conversation(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<StartConversationRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let chat = state.chat.clone();
    let conversation = tokio::task::spawn_blocking(move || {
        chat.start_conversation(claims.sub, req.other_user_id)
    })
    .await
    .map_err(join_error)??;

    Ok(Json(conversation))
}

/// The caller's conversations, most recent activity first.
pub async fn list_conversations(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Query(query): Query<ConversationQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let chat = state.chat.clone();
    let page = tokio::task::spawn_blocking(move || {
        chat.list_conversations(claims.sub, query.page, query.limit)
    })
    .await
    .map_err(join_error)??;

    Ok(Json(page))
}

/// Cursor-paginated messages, newest first, decrypted before they leave the
/// store. Non-participants receive the same response as for a conversation
/// that does not exist.
pub async fn list_messages(
    State(state): State<AppState>,
    Path(conversation_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
    Query(query): Query<MessageQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let chat = state.chat.clone();
    let page = tokio::task::spawn_blocking(move || {
        chat.list_messages(conversation_id, claims.sub, query.limit, query.before)
    })
    .await
    .map_err(join_error)??;

    Ok(Json(page))
}

fn join_error(e: tokio::task::JoinError) -> ApiError {
    error!("spawn_blocking join error: {}", e);
    ApiError(ChatError::Storage(anyhow::anyhow!("blocking task failed")))
}

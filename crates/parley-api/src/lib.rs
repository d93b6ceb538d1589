/// REST retrieval surface: start-or-get a conversation, list conversations,
/// page through a conversation's messages. Real-time traffic lives in
/// parley-gateway; this crate only validates, delegates to the store, and
/// shapes responses.
pub mod conversations;
pub mod error;
pub mod middleware;

use std::sync::Arc;

use parley_chat::ChatService;

pub type AppState = Arc<AppStateInner>;

pub struct AppStateInner {
    pub chat: Arc<ChatService>,
}

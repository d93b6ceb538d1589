/// Conversation and message store for direct chats.
///
/// Business logic lives here; the REST handlers and the WebSocket router
/// validate input and emit. Content is encrypted before it reaches the
/// database and decrypted before it leaves this crate.
pub mod access;
pub mod service;

pub use access::{FollowGraph, can_chat};
pub use service::ChatService;

use thiserror::Error;

/// Domain error taxonomy. Every failure is scoped to one request or one
/// connection event — nothing here is process-fatal.
#[derive(Debug, Error)]
pub enum ChatError {
    /// Bad or missing credential. Connections are refused before any
    /// event is processed.
    #[error("Authentication required")]
    Unauthenticated,

    /// The follow-graph gate rejected a new conversation.
    #[error("You can only start a chat with users you follow or who follow you")]
    FollowRequired,

    /// Caller is not a participant. The message is identical to the
    /// not-found case so callers cannot probe for conversation existence.
    #[error("Conversation not found or access denied")]
    Forbidden,

    #[error("{0}")]
    Validation(String),

    /// Sender exceeded their send quota. Transient; retry after the window.
    #[error("Too many messages. Please slow down.")]
    RateLimited,

    /// Stored ciphertext was unreadable. Degraded per-message with a
    /// placeholder wherever a whole page is at stake.
    #[error("Unable to decrypt message content")]
    Decryption,

    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

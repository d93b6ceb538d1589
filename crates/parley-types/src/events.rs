use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::api::{MessageKind, MessageView};

/// Commands sent FROM client TO server over the WebSocket.
///
/// `conversation_id` fields are optional so that a missing field surfaces as
/// a validation error on the originating connection instead of a parse
/// failure the client never hears about.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all_fields = "camelCase")]
pub enum ClientCommand {
    /// Subscribe this connection to a conversation's broadcast group.
    #[serde(rename = "conversation:join")]
    ConversationJoin { conversation_id: Option<Uuid> },

    /// Persist and broadcast a message.
    #[serde(rename = "message:send")]
    MessageSend {
        conversation_id: Option<Uuid>,
        #[serde(rename = "type")]
        kind: Option<MessageKind>,
        content: Option<Value>,
    },

    /// Ephemeral typing indicator, not persisted.
    #[serde(rename = "typing:start")]
    TypingStart { conversation_id: Option<Uuid> },

    #[serde(rename = "typing:stop")]
    TypingStop { conversation_id: Option<Uuid> },
}

/// Events sent FROM server TO client over the WebSocket.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all_fields = "camelCase")]
pub enum ServerEvent {
    /// Ack for a successful conversation:join.
    #[serde(rename = "conversation:joined")]
    ConversationJoined { conversation_id: Uuid },

    /// A new message, decrypted, delivered to every connection in the
    /// conversation's group — including the sender's other devices.
    #[serde(rename = "message:new")]
    MessageNew(MessageView),

    #[serde(rename = "user:typing")]
    Typing {
        user_id: Uuid,
        conversation_id: Uuid,
    },

    #[serde(rename = "user:stopped-typing")]
    StoppedTyping {
        user_id: Uuid,
        conversation_id: Uuid,
    },

    /// Emitted only to the originating connection, never broadcast.
    #[serde(rename = "error")]
    Error { message: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_command_wire_format() {
        let cmd: ClientCommand = serde_json::from_str(
            r#"{"type":"conversation:join","data":{"conversationId":"00000000-0000-0000-0000-000000000001"}}"#,
        )
        .unwrap();
        match cmd {
            ClientCommand::ConversationJoin { conversation_id } => {
                assert!(conversation_id.is_some());
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn missing_conversation_id_parses_as_none() {
        let cmd: ClientCommand =
            serde_json::from_str(r#"{"type":"typing:start","data":{}}"#).unwrap();
        match cmd {
            ClientCommand::TypingStart { conversation_id } => assert!(conversation_id.is_none()),
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn server_event_names_use_colon_convention() {
        let event = ServerEvent::Error {
            message: "conversationId required".into(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "error");

        let event = ServerEvent::StoppedTyping {
            user_id: Uuid::nil(),
            conversation_id: Uuid::nil(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "user:stopped-typing");
        assert!(json["data"]["conversationId"].is_string());
    }
}

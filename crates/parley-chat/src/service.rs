use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::{Value, json};
use tracing::warn;
use uuid::Uuid;

use parley_crypto::MessageCodec;
use parley_db::models::{ConversationRow, MessageRow};
use parley_db::{Database, now_rfc3339};
use parley_types::api::{
    ConversationKind, ConversationView, LastMessagePreview, MessageKind, MessageStatus,
    MessageView, MessagesPage, Paginated, ReadReceipt,
};
use parley_types::error::ChatError;

use crate::access::can_chat;

/// Previews are truncated to this many characters before encryption.
pub const PREVIEW_MAX_LENGTH: usize = 80;

pub const DEFAULT_CONVERSATION_LIMIT: u32 = 20;
pub const DEFAULT_MESSAGE_LIMIT: u32 = 50;
const MAX_PAGE_LIMIT: u32 = 200;

/// Conversation & message store. All persistence goes through here; every
/// message is encrypted on the way in and decrypted on the way out.
///
/// Methods are blocking (rusqlite underneath) — async callers wrap them in
/// `spawn_blocking`.
pub struct ChatService {
    db: Arc<Database>,
    codec: MessageCodec,
}

impl ChatService {
    pub fn new(db: Arc<Database>, codec: MessageCodec) -> Self {
        Self { db, codec }
    }

    pub fn db(&self) -> &Arc<Database> {
        &self.db
    }

    /// Start or get the direct conversation between `requester` and `other`.
    /// Gated by the follow graph; idempotent; safe under concurrent calls
    /// for the same pair (UNIQUE constraint + retry lookup).
    pub fn start_conversation(
        &self,
        requester: Uuid,
        other: Uuid,
    ) -> Result<ConversationView, ChatError> {
        if !can_chat(self.db.as_ref(), requester, other)? {
            return Err(ChatError::FollowRequired);
        }

        let (a, b) = canonical_pair(requester, other);
        let (a, b) = (a.to_string(), b.to_string());

        if let Some(row) = self.db.find_direct_conversation(&a, &b)? {
            return Ok(self.conversation_view(row));
        }

        let id = Uuid::new_v4().to_string();
        let inserted = self.db.insert_conversation(&id, &a, &b, &now_rfc3339())?;
        if !inserted {
            // Lost the race to a concurrent start for the same pair; the
            // winner's row is the conversation.
            let row = self
                .db
                .find_direct_conversation(&a, &b)?
                .ok_or_else(|| anyhow::anyhow!("conversation vanished after insert conflict"))?;
            return Ok(self.conversation_view(row));
        }

        let row = self
            .db
            .get_conversation(&id)?
            .ok_or_else(|| anyhow::anyhow!("conversation missing after insert"))?;
        Ok(self.conversation_view(row))
    }

    /// Active conversations for `user`, most recent activity first, with the
    /// cached preview decrypted.
    pub fn list_conversations(
        &self,
        user: Uuid,
        page: u32,
        limit: u32,
    ) -> Result<Paginated<ConversationView>, ChatError> {
        let page = page.max(1);
        let limit = limit.clamp(1, MAX_PAGE_LIMIT);
        let offset = (page - 1) * limit;

        // Fetch one extra row to learn whether another page exists.
        let mut rows = self
            .db
            .list_conversations_for_user(&user.to_string(), limit + 1, offset)?;
        let has_more = rows.len() as u32 > limit;
        rows.truncate(limit as usize);

        let data = rows.into_iter().map(|row| self.conversation_view(row)).collect();

        Ok(Paginated {
            data,
            page,
            limit,
            has_more,
        })
    }

    /// Messages in a conversation, newest first. `before` is the created_at
    /// cursor of the oldest message from the previous page. The caller must
    /// be a participant; outsiders get the same error as a missing
    /// conversation.
    pub fn list_messages(
        &self,
        conversation: Uuid,
        caller: Uuid,
        limit: u32,
        before: Option<DateTime<Utc>>,
    ) -> Result<MessagesPage, ChatError> {
        self.require_participant(conversation, caller)?;

        let limit = limit.clamp(1, MAX_PAGE_LIMIT);
        let cursor = before.map(format_timestamp);
        let rows = self.db.get_messages(
            &conversation.to_string(),
            &caller.to_string(),
            limit,
            cursor.as_deref(),
        )?;

        let message_ids: Vec<String> = rows.iter().map(|r| r.id.clone()).collect();
        let mut receipts: HashMap<String, Vec<ReadReceipt>> = HashMap::new();
        for r in self.db.get_read_receipts(&message_ids)? {
            receipts.entry(r.message_id.clone()).or_default().push(ReadReceipt {
                user_id: parse_uuid(&r.user_id, "read receipt user"),
                read_at: parse_timestamp(&r.read_at, &r.message_id),
            });
        }

        let next_before = rows.last().map(|r| parse_timestamp(&r.created_at, &r.id));
        let data = rows
            .into_iter()
            .map(|row| {
                let read_by = receipts.remove(&row.id).unwrap_or_default();
                self.message_view(row, read_by)
            })
            .collect();

        Ok(MessagesPage { data, next_before })
    }

    /// Persist a message: membership check, encrypt, insert, then refresh
    /// the conversation's cached preview. The two writes are sequential and
    /// not transactional — a crash in between leaves the message durable and
    /// the (advisory) preview stale.
    ///
    /// Returns the message with decrypted content, ready for broadcast.
    pub fn append_message(
        &self,
        conversation: Uuid,
        sender: Uuid,
        kind: MessageKind,
        content: Option<Value>,
    ) -> Result<MessageView, ChatError> {
        self.require_participant(conversation, sender)?;

        let payload = normalize_payload(kind, content);
        let (ciphertext, nonce) = self
            .codec
            .encrypt_json(&payload)
            .map_err(|e| anyhow::anyhow!("message encryption failed: {}", e))?;

        let id = Uuid::new_v4();
        let now = now_rfc3339();
        self.db.insert_message(
            &id.to_string(),
            &conversation.to_string(),
            &sender.to_string(),
            kind.as_str(),
            &ciphertext,
            &nonce,
            None,
            &now,
        )?;

        let preview = preview_text(kind, &payload);
        let (preview_ct, preview_nonce) = self
            .codec
            .encrypt_json(&Value::String(preview))
            .map_err(|e| anyhow::anyhow!("preview encryption failed: {}", e))?;
        self.db.update_conversation_preview(
            &conversation.to_string(),
            &preview_ct,
            &preview_nonce,
            &sender.to_string(),
            &now,
        )?;

        Ok(MessageView {
            id,
            conversation_id: conversation,
            sender_id: sender,
            kind,
            content: payload,
            reply_to: None,
            status: MessageStatus::Sent,
            read_by: vec![],
            created_at: parse_timestamp(&now, "new message"),
        })
    }

    pub fn is_participant(&self, conversation: Uuid, user: Uuid) -> Result<bool, ChatError> {
        Ok(self
            .db
            .is_participant(&conversation.to_string(), &user.to_string())?)
    }

    /// Record read receipts for everything `reader` has not yet read in the
    /// conversation and advance those messages to 'read'. Returns the ids
    /// that were newly marked.
    pub fn mark_conversation_read(
        &self,
        conversation: Uuid,
        reader: Uuid,
    ) -> Result<Vec<Uuid>, ChatError> {
        self.require_participant(conversation, reader)?;
        let marked = self.db.mark_messages_read(
            &conversation.to_string(),
            &reader.to_string(),
            &now_rfc3339(),
        )?;
        Ok(marked
            .iter()
            .map(|id| parse_uuid(id, "read message"))
            .collect())
    }

    /// sent -> delivered, once the broadcast reached another live device.
    pub fn mark_delivered(&self, message: Uuid) -> Result<(), ChatError> {
        Ok(self.db.mark_delivered(&message.to_string())?)
    }

    /// Sender-side delete for everyone. Content is never mutated; the row is
    /// flagged and drops out of every participant's pages.
    pub fn delete_for_everyone(&self, message: Uuid, requester: Uuid) -> Result<(), ChatError> {
        let deleted = self
            .db
            .soft_delete_message(&message.to_string(), &requester.to_string())?;
        if !deleted {
            return Err(ChatError::Forbidden);
        }
        Ok(())
    }

    /// Hide a message from the requester's own view only.
    pub fn delete_for_me(&self, message: Uuid, requester: Uuid) -> Result<(), ChatError> {
        let row = self
            .db
            .get_message(&message.to_string())?
            .ok_or(ChatError::Forbidden)?;
        let conversation = parse_uuid(&row.conversation_id, &row.id);
        self.require_participant(conversation, requester)?;
        Ok(self.db.delete_message_for(&message.to_string(), &requester.to_string())?)
    }

    fn require_participant(&self, conversation: Uuid, user: Uuid) -> Result<(), ChatError> {
        if self.is_participant(conversation, user)? {
            Ok(())
        } else {
            Err(ChatError::Forbidden)
        }
    }

    fn conversation_view(&self, row: ConversationRow) -> ConversationView {
        let last_message = self.decrypt_preview(&row);
        ConversationView {
            id: parse_uuid(&row.id, "conversation"),
            kind: ConversationKind::Direct,
            participants: vec![
                parse_uuid(&row.participant_a, &row.id),
                parse_uuid(&row.participant_b, &row.id),
            ],
            last_message,
            is_active: row.is_active,
            created_at: parse_timestamp(&row.created_at, &row.id),
            updated_at: parse_timestamp(&row.updated_at, &row.id),
        }
    }

    fn decrypt_preview(&self, row: &ConversationRow) -> Option<LastMessagePreview> {
        let ciphertext = row.last_message_ciphertext.as_deref()?;
        let nonce = row.last_message_nonce.as_deref()?;
        let sender = row.last_message_sender.as_deref()?;
        let sent_at = row.last_message_at.as_deref()?;

        // A preview that cannot be decrypted degrades to a placeholder;
        // the conversation list never fails over one bad blob.
        let text = match self.codec.decrypt_json(ciphertext, nonce) {
            Ok(Value::String(text)) => text,
            Ok(other) => other
                .get("text")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| other.to_string()),
            Err(_) => "[Message]".to_string(),
        };

        Some(LastMessagePreview {
            text: truncate(&text, PREVIEW_MAX_LENGTH),
            sender_id: parse_uuid(sender, &row.id),
            sent_at: parse_timestamp(sent_at, &row.id),
        })
    }

    fn message_view(&self, row: MessageRow, read_by: Vec<ReadReceipt>) -> MessageView {
        // Per-message degradation: corrupt ciphertext yields a placeholder,
        // never a failed page.
        let content = match self.codec.decrypt_json(&row.ciphertext, &row.nonce) {
            Ok(content) => content,
            Err(e) => {
                warn!("Undecryptable content on message '{}': {}", row.id, e);
                json!({ "text": "[Unable to decrypt]" })
            }
        };

        MessageView {
            id: parse_uuid(&row.id, "message"),
            conversation_id: parse_uuid(&row.conversation_id, &row.id),
            sender_id: parse_uuid(&row.sender_id, &row.id),
            kind: MessageKind::parse(&row.msg_type).unwrap_or(MessageKind::Text),
            content,
            reply_to: row.reply_to.as_deref().map(|r| parse_uuid(r, &row.id)),
            status: MessageStatus::parse(&row.status).unwrap_or(MessageStatus::Sent),
            read_by,
            created_at: parse_timestamp(&row.created_at, &row.id),
        }
    }
}

/// Deterministic ordering of a participant pair; prevents duplicate direct
/// conversations for the same two users.
fn canonical_pair(a: Uuid, b: Uuid) -> (Uuid, Uuid) {
    if a <= b { (a, b) } else { (b, a) }
}

/// Text messages accept either a bare string or `{ "text": ... }`; other
/// kinds carry their payload object through unchanged.
fn normalize_payload(kind: MessageKind, content: Option<Value>) -> Value {
    match kind {
        MessageKind::Text => {
            let text = match content {
                Some(Value::String(s)) => s,
                Some(Value::Object(ref map)) => map
                    .get("text")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                _ => String::new(),
            };
            json!({ "text": text })
        }
        _ => content.unwrap_or_else(|| json!({})),
    }
}

fn preview_text(kind: MessageKind, payload: &Value) -> String {
    match kind {
        MessageKind::Text => {
            let text = payload.get("text").and_then(Value::as_str).unwrap_or_default();
            truncate(text, PREVIEW_MAX_LENGTH)
        }
        other => format!("[{}]", other.as_str()),
    }
}

fn truncate(s: &str, max_chars: usize) -> String {
    s.chars().take(max_chars).collect()
}

fn parse_uuid(raw: &str, context: &str) -> Uuid {
    raw.parse().unwrap_or_else(|e| {
        warn!("Corrupt id '{}' on {}: {}", raw, context, e);
        Uuid::default()
    })
}

fn parse_timestamp(raw: &str, context: &str) -> DateTime<Utc> {
    raw.parse::<DateTime<Utc>>().unwrap_or_else(|e| {
        warn!("Corrupt timestamp '{}' on {}: {}", raw, context, e);
        DateTime::default()
    })
}

fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(chrono::SecondsFormat::Micros, true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use parley_crypto::{MessageCodec, StaticKeyProvider, keys};

    fn service() -> (ChatService, Uuid, Uuid, Uuid) {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let codec = MessageCodec::new(Arc::new(StaticKeyProvider::new(keys::generate_key())));

        let alice = Uuid::new_v4();
        let bob = Uuid::new_v4();
        let carol = Uuid::new_v4();
        let now = now_rfc3339();
        db.create_user(&alice.to_string(), "alice", &now).unwrap();
        db.create_user(&bob.to_string(), "bob", &now).unwrap();
        db.create_user(&carol.to_string(), "carol", &now).unwrap();
        // alice follows bob; carol is a stranger to both
        db.add_follow(&alice.to_string(), &bob.to_string(), &now)
            .unwrap();

        (ChatService::new(db, codec), alice, bob, carol)
    }

    fn text(content: &str) -> Option<Value> {
        Some(json!({ "text": content }))
    }

    #[test]
    fn strangers_cannot_start_a_conversation() {
        let (svc, alice, _, carol) = service();

        let err = svc.start_conversation(alice, carol).unwrap_err();
        assert!(matches!(err, ChatError::FollowRequired));

        // and no row was created
        let page = svc.list_conversations(alice, 1, 20).unwrap();
        assert!(page.data.is_empty());
    }

    #[test]
    fn start_conversation_is_idempotent() {
        let (svc, alice, bob, _) = service();

        let first = svc.start_conversation(alice, bob).unwrap();
        let second = svc.start_conversation(bob, alice).unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(first.participants.len(), 2);
        assert!(first.participants.contains(&alice));
        assert!(first.participants.contains(&bob));
    }

    #[test]
    fn concurrent_starts_converge_to_one_conversation() {
        let (svc, alice, bob, _) = service();
        let svc = Arc::new(svc);

        let handles: Vec<_> = (0..4)
            .map(|i| {
                let svc = svc.clone();
                std::thread::spawn(move || {
                    let (a, b) = if i % 2 == 0 { (alice, bob) } else { (bob, alice) };
                    svc.start_conversation(a, b).unwrap().id
                })
            })
            .collect();

        let ids: Vec<Uuid> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert!(ids.windows(2).all(|w| w[0] == w[1]));
    }

    #[test]
    fn send_and_read_back_roundtrip() {
        let (svc, alice, bob, _) = service();
        let conv = svc.start_conversation(alice, bob).unwrap();

        let sent = svc
            .append_message(conv.id, alice, MessageKind::Text, text("Hello"))
            .unwrap();
        assert_eq!(sent.content["text"], "Hello");
        assert_eq!(sent.status, MessageStatus::Sent);

        // stored encrypted: the raw row's ciphertext is not the plaintext
        let row = svc.db().get_message(&sent.id.to_string()).unwrap().unwrap();
        assert_ne!(row.ciphertext, serde_json::to_vec(&sent.content).unwrap());

        let page = svc.list_messages(conv.id, bob, 50, None).unwrap();
        assert_eq!(page.data.len(), 1);
        assert_eq!(page.data[0].content["text"], "Hello");

        // preview decrypts to the plaintext
        let convs = svc.list_conversations(bob, 1, 20).unwrap();
        let preview = convs.data[0].last_message.as_ref().unwrap();
        assert_eq!(preview.text, "Hello");
        assert_eq!(preview.sender_id, alice);
    }

    #[test]
    fn outsiders_are_indistinguishable_from_missing_conversations() {
        let (svc, alice, bob, carol) = service();
        let conv = svc.start_conversation(alice, bob).unwrap();

        let listed = svc.list_messages(conv.id, carol, 50, None).unwrap_err();
        assert!(matches!(listed, ChatError::Forbidden));

        let sent = svc
            .append_message(conv.id, carol, MessageKind::Text, text("hi"))
            .unwrap_err();
        assert!(matches!(sent, ChatError::Forbidden));

        // a nonexistent conversation yields the very same error
        let missing = svc.list_messages(Uuid::new_v4(), alice, 50, None).unwrap_err();
        assert_eq!(missing.to_string(), listed.to_string());
    }

    #[test]
    fn corrupt_message_degrades_to_placeholder() {
        let (svc, alice, bob, _) = service();
        let conv = svc.start_conversation(alice, bob).unwrap();

        svc.append_message(conv.id, alice, MessageKind::Text, text("fine"))
            .unwrap();
        svc.db()
            .insert_message(
                &Uuid::new_v4().to_string(),
                &conv.id.to_string(),
                &alice.to_string(),
                "text",
                b"garbage",
                b"not-a-nonce!",
                None,
                &now_rfc3339(),
            )
            .unwrap();

        let page = svc.list_messages(conv.id, bob, 50, None).unwrap();
        assert_eq!(page.data.len(), 2);
        assert_eq!(page.data[0].content["text"], "[Unable to decrypt]");
        assert_eq!(page.data[1].content["text"], "fine");
    }

    #[test]
    fn preview_is_truncated() {
        let (svc, alice, bob, _) = service();
        let conv = svc.start_conversation(alice, bob).unwrap();

        let long = "x".repeat(200);
        svc.append_message(conv.id, alice, MessageKind::Text, text(&long))
            .unwrap();

        let convs = svc.list_conversations(alice, 1, 20).unwrap();
        let preview = convs.data[0].last_message.as_ref().unwrap();
        assert_eq!(preview.text.chars().count(), PREVIEW_MAX_LENGTH);
    }

    #[test]
    fn non_text_preview_shows_kind_tag() {
        let (svc, alice, bob, _) = service();
        let conv = svc.start_conversation(alice, bob).unwrap();

        svc.append_message(
            conv.id,
            alice,
            MessageKind::Image,
            Some(json!({ "url": "https://example.com/cat.png" })),
        )
        .unwrap();

        let convs = svc.list_conversations(alice, 1, 20).unwrap();
        assert_eq!(convs.data[0].last_message.as_ref().unwrap().text, "[image]");
    }

    #[test]
    fn read_receipts_and_status() {
        let (svc, alice, bob, _) = service();
        let conv = svc.start_conversation(alice, bob).unwrap();

        let m = svc
            .append_message(conv.id, alice, MessageKind::Text, text("read me"))
            .unwrap();

        let marked = svc.mark_conversation_read(conv.id, bob).unwrap();
        assert_eq!(marked, vec![m.id]);

        let page = svc.list_messages(conv.id, alice, 50, None).unwrap();
        assert_eq!(page.data[0].status, MessageStatus::Read);
        assert_eq!(page.data[0].read_by.len(), 1);
        assert_eq!(page.data[0].read_by[0].user_id, bob);

        // marking again is a no-op
        assert!(svc.mark_conversation_read(conv.id, bob).unwrap().is_empty());
    }

    #[test]
    fn delete_scopes() {
        let (svc, alice, bob, carol) = service();
        let conv = svc.start_conversation(alice, bob).unwrap();

        let m1 = svc
            .append_message(conv.id, alice, MessageKind::Text, text("one"))
            .unwrap();
        let m2 = svc
            .append_message(conv.id, alice, MessageKind::Text, text("two"))
            .unwrap();

        // only the sender can delete for everyone
        assert!(matches!(
            svc.delete_for_everyone(m1.id, bob).unwrap_err(),
            ChatError::Forbidden
        ));
        svc.delete_for_everyone(m1.id, alice).unwrap();
        assert_eq!(svc.list_messages(conv.id, bob, 50, None).unwrap().data.len(), 1);

        // delete-for-me hides from the caller only
        svc.delete_for_me(m2.id, bob).unwrap();
        assert!(svc.list_messages(conv.id, bob, 50, None).unwrap().data.is_empty());
        assert_eq!(svc.list_messages(conv.id, alice, 50, None).unwrap().data.len(), 1);

        // outsiders cannot touch either path
        assert!(matches!(
            svc.delete_for_me(m2.id, carol).unwrap_err(),
            ChatError::Forbidden
        ));
    }

    #[test]
    fn message_pages_stay_stable_under_inserts() {
        let (svc, alice, bob, _) = service();
        let conv = svc.start_conversation(alice, bob).unwrap();

        for i in 0..4 {
            svc.append_message(conv.id, alice, MessageKind::Text, text(&format!("m{}", i)))
                .unwrap();
        }

        let first = svc.list_messages(conv.id, bob, 2, None).unwrap();
        assert_eq!(first.data[0].content["text"], "m3");
        assert_eq!(first.data[1].content["text"], "m2");

        // a new message lands while the client pages
        svc.append_message(conv.id, alice, MessageKind::Text, text("m4"))
            .unwrap();

        let second = svc
            .list_messages(conv.id, bob, 2, first.next_before)
            .unwrap();
        assert_eq!(second.data[0].content["text"], "m1");
        assert_eq!(second.data[1].content["text"], "m0");
    }
}

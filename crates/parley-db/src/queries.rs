use anyhow::Result;
use rusqlite::OptionalExtension;

use crate::Database;
use crate::models::{ConversationRow, MessageRow, ReadReceiptRow, UserRow};

impl Database {
    // -- Users --

    pub fn create_user(&self, id: &str, username: &str, created_at: &str) -> Result<()> {
        self.with_conn_mut(|conn| {
            conn.execute(
                "INSERT INTO users (id, username, is_active, created_at) VALUES (?1, ?2, 1, ?3)",
                rusqlite::params![id, username, created_at],
            )?;
            Ok(())
        })
    }

    pub fn get_user_by_id(&self, id: &str) -> Result<Option<UserRow>> {
        self.with_conn(|conn| {
            let mut stmt =
                conn.prepare("SELECT id, username, is_active, created_at FROM users WHERE id = ?1")?;
            let row = stmt
                .query_row([id], |row| {
                    Ok(UserRow {
                        id: row.get(0)?,
                        username: row.get(1)?,
                        is_active: row.get(2)?,
                        created_at: row.get(3)?,
                    })
                })
                .optional()?;
            Ok(row)
        })
    }

    pub fn set_user_active(&self, id: &str, active: bool) -> Result<()> {
        self.with_conn_mut(|conn| {
            conn.execute(
                "UPDATE users SET is_active = ?2 WHERE id = ?1",
                rusqlite::params![id, active],
            )?;
            Ok(())
        })
    }

    // -- Follow edges --

    pub fn add_follow(&self, follower_id: &str, following_id: &str, created_at: &str) -> Result<()> {
        self.with_conn_mut(|conn| {
            conn.execute(
                "INSERT OR IGNORE INTO follows (follower_id, following_id, created_at)
                 VALUES (?1, ?2, ?3)",
                rusqlite::params![follower_id, following_id, created_at],
            )?;
            Ok(())
        })
    }

    pub fn remove_follow(&self, follower_id: &str, following_id: &str) -> Result<()> {
        self.with_conn_mut(|conn| {
            conn.execute(
                "DELETE FROM follows WHERE follower_id = ?1 AND following_id = ?2",
                rusqlite::params![follower_id, following_id],
            )?;
            Ok(())
        })
    }

    /// Directed follow check: does `follower_id` follow `following_id`?
    pub fn follow_exists(&self, follower_id: &str, following_id: &str) -> Result<bool> {
        self.with_conn(|conn| {
            let found: Option<i64> = conn
                .query_row(
                    "SELECT 1 FROM follows WHERE follower_id = ?1 AND following_id = ?2",
                    rusqlite::params![follower_id, following_id],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(found.is_some())
        })
    }

    // -- Conversations --

    /// Insert a direct conversation for a canonical (sorted) pair.
    /// Returns false if a conversation for the pair already exists — the
    /// UNIQUE constraint absorbs concurrent start attempts.
    pub fn insert_conversation(
        &self,
        id: &str,
        participant_a: &str,
        participant_b: &str,
        now: &str,
    ) -> Result<bool> {
        self.with_conn_mut(|conn| {
            let inserted = conn.execute(
                "INSERT INTO conversations
                     (id, conv_type, participant_a, participant_b, is_active, created_at, updated_at)
                 VALUES (?1, 'direct', ?2, ?3, 1, ?4, ?4)
                 ON CONFLICT (conv_type, participant_a, participant_b) DO NOTHING",
                rusqlite::params![id, participant_a, participant_b, now],
            )?;
            Ok(inserted > 0)
        })
    }

    pub fn find_direct_conversation(
        &self,
        participant_a: &str,
        participant_b: &str,
    ) -> Result<Option<ConversationRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {CONVERSATION_COLUMNS} FROM conversations
                 WHERE conv_type = 'direct' AND participant_a = ?1 AND participant_b = ?2",
            ))?;
            let row = stmt
                .query_row(rusqlite::params![participant_a, participant_b], conversation_from_row)
                .optional()?;
            Ok(row)
        })
    }

    pub fn get_conversation(&self, id: &str) -> Result<Option<ConversationRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {CONVERSATION_COLUMNS} FROM conversations WHERE id = ?1",
            ))?;
            let row = stmt.query_row([id], conversation_from_row).optional()?;
            Ok(row)
        })
    }

    pub fn is_participant(&self, conversation_id: &str, user_id: &str) -> Result<bool> {
        self.with_conn(|conn| {
            let found: Option<i64> = conn
                .query_row(
                    "SELECT 1 FROM conversations
                     WHERE id = ?1 AND (participant_a = ?2 OR participant_b = ?2)",
                    rusqlite::params![conversation_id, user_id],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(found.is_some())
        })
    }

    /// Active conversations for a user, most recent activity first.
    /// Callers pass limit + 1 to detect whether another page exists.
    pub fn list_conversations_for_user(
        &self,
        user_id: &str,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<ConversationRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {CONVERSATION_COLUMNS} FROM conversations
                 WHERE (participant_a = ?1 OR participant_b = ?1) AND is_active = 1
                 ORDER BY updated_at DESC
                 LIMIT ?2 OFFSET ?3",
            ))?;
            let rows = stmt
                .query_map(rusqlite::params![user_id, limit, offset], conversation_from_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    /// Update the cached preview after a message insert. Separate write from
    /// the insert itself; a crash in between leaves the preview stale, which
    /// is acceptable because the preview is advisory only.
    pub fn update_conversation_preview(
        &self,
        conversation_id: &str,
        ciphertext: &[u8],
        nonce: &[u8],
        sender_id: &str,
        now: &str,
    ) -> Result<()> {
        self.with_conn_mut(|conn| {
            conn.execute(
                "UPDATE conversations SET
                     last_message_ciphertext = ?2,
                     last_message_nonce = ?3,
                     last_message_sender = ?4,
                     last_message_at = ?5,
                     updated_at = ?5
                 WHERE id = ?1",
                rusqlite::params![conversation_id, ciphertext, nonce, sender_id, now],
            )?;
            Ok(())
        })
    }

    /// Conversations are never hard-deleted, only deactivated.
    pub fn deactivate_conversation(&self, id: &str) -> Result<()> {
        self.with_conn_mut(|conn| {
            conn.execute("UPDATE conversations SET is_active = 0 WHERE id = ?1", [id])?;
            Ok(())
        })
    }

    // -- Messages --

    #[allow(clippy::too_many_arguments)]
    pub fn insert_message(
        &self,
        id: &str,
        conversation_id: &str,
        sender_id: &str,
        msg_type: &str,
        ciphertext: &[u8],
        nonce: &[u8],
        reply_to: Option<&str>,
        created_at: &str,
    ) -> Result<()> {
        self.with_conn_mut(|conn| {
            conn.execute(
                "INSERT INTO messages
                     (id, conversation_id, sender_id, msg_type, ciphertext, nonce, reply_to, status, is_deleted, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 'sent', 0, ?8)",
                rusqlite::params![id, conversation_id, sender_id, msg_type, ciphertext, nonce, reply_to, created_at],
            )?;
            Ok(())
        })
    }

    pub fn get_message(&self, id: &str) -> Result<Option<MessageRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = ?1",
            ))?;
            let row = stmt.query_row([id], message_from_row).optional()?;
            Ok(row)
        })
    }

    /// Messages in a conversation, newest first, as seen by `viewer_id`:
    /// soft-deleted rows and rows the viewer deleted for themselves are
    /// excluded. `before` is a created_at cursor — pages stay stable under
    /// concurrent inserts because new rows sort after the cursor.
    pub fn get_messages(
        &self,
        conversation_id: &str,
        viewer_id: &str,
        limit: u32,
        before: Option<&str>,
    ) -> Result<Vec<MessageRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {MESSAGE_COLUMNS} FROM messages m
                 WHERE m.conversation_id = ?1
                   AND m.is_deleted = 0
                   AND NOT EXISTS (
                       SELECT 1 FROM message_deletes d
                       WHERE d.message_id = m.id AND d.user_id = ?2
                   )
                   AND (?3 IS NULL OR m.created_at < ?3)
                 ORDER BY m.created_at DESC
                 LIMIT ?4",
            ))?;
            let rows = stmt
                .query_map(
                    rusqlite::params![conversation_id, viewer_id, before, limit],
                    message_from_row,
                )?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    /// Record read receipts for every message in the conversation the reader
    /// has not yet read and did not send, and advance those messages to
    /// 'read'. Returns the ids that were newly marked.
    pub fn mark_messages_read(
        &self,
        conversation_id: &str,
        reader_id: &str,
        now: &str,
    ) -> Result<Vec<String>> {
        self.with_conn_mut(|conn| {
            let mut stmt = conn.prepare(
                "SELECT m.id FROM messages m
                 WHERE m.conversation_id = ?1
                   AND m.sender_id <> ?2
                   AND m.is_deleted = 0
                   AND NOT EXISTS (
                       SELECT 1 FROM message_reads r
                       WHERE r.message_id = m.id AND r.user_id = ?2
                   )",
            )?;
            let unread: Vec<String> = stmt
                .query_map(rusqlite::params![conversation_id, reader_id], |row| row.get(0))?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            drop(stmt);

            for id in &unread {
                conn.execute(
                    "INSERT OR IGNORE INTO message_reads (message_id, user_id, read_at)
                     VALUES (?1, ?2, ?3)",
                    rusqlite::params![id, reader_id, now],
                )?;
                conn.execute("UPDATE messages SET status = 'read' WHERE id = ?1", [id])?;
            }

            Ok(unread)
        })
    }

    /// sent -> delivered, guarded so a later 'read' is never regressed.
    pub fn mark_delivered(&self, message_id: &str) -> Result<()> {
        self.with_conn_mut(|conn| {
            conn.execute(
                "UPDATE messages SET status = 'delivered' WHERE id = ?1 AND status = 'sent'",
                [message_id],
            )?;
            Ok(())
        })
    }

    /// Sender-side delete for everyone. Returns false when the caller is not
    /// the sender; content itself is never mutated.
    pub fn soft_delete_message(&self, message_id: &str, sender_id: &str) -> Result<bool> {
        self.with_conn_mut(|conn| {
            let changed = conn.execute(
                "UPDATE messages SET is_deleted = 1 WHERE id = ?1 AND sender_id = ?2",
                rusqlite::params![message_id, sender_id],
            )?;
            Ok(changed > 0)
        })
    }

    /// Hide a message from one user's own view only.
    pub fn delete_message_for(&self, message_id: &str, user_id: &str) -> Result<()> {
        self.with_conn_mut(|conn| {
            conn.execute(
                "INSERT OR IGNORE INTO message_deletes (message_id, user_id) VALUES (?1, ?2)",
                rusqlite::params![message_id, user_id],
            )?;
            Ok(())
        })
    }

    /// Batch-fetch read receipts for a set of message IDs.
    pub fn get_read_receipts(&self, message_ids: &[String]) -> Result<Vec<ReadReceiptRow>> {
        if message_ids.is_empty() {
            return Ok(vec![]);
        }

        self.with_conn(|conn| {
            let placeholders: Vec<String> =
                (1..=message_ids.len()).map(|i| format!("?{}", i)).collect();
            let sql = format!(
                "SELECT message_id, user_id, read_at FROM message_reads WHERE message_id IN ({})",
                placeholders.join(", ")
            );

            let mut stmt = conn.prepare(&sql)?;
            let params: Vec<&dyn rusqlite::types::ToSql> = message_ids
                .iter()
                .map(|id| id as &dyn rusqlite::types::ToSql)
                .collect();

            let rows = stmt
                .query_map(params.as_slice(), |row| {
                    Ok(ReadReceiptRow {
                        message_id: row.get(0)?,
                        user_id: row.get(1)?,
                        read_at: row.get(2)?,
                    })
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;

            Ok(rows)
        })
    }
}

const CONVERSATION_COLUMNS: &str = "id, conv_type, participant_a, participant_b, \
     last_message_ciphertext, last_message_nonce, last_message_sender, last_message_at, \
     is_active, created_at, updated_at";

const MESSAGE_COLUMNS: &str = "id, conversation_id, sender_id, msg_type, ciphertext, nonce, \
     reply_to, status, is_deleted, created_at";

fn conversation_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ConversationRow> {
    Ok(ConversationRow {
        id: row.get(0)?,
        conv_type: row.get(1)?,
        participant_a: row.get(2)?,
        participant_b: row.get(3)?,
        last_message_ciphertext: row.get(4)?,
        last_message_nonce: row.get(5)?,
        last_message_sender: row.get(6)?,
        last_message_at: row.get(7)?,
        is_active: row.get(8)?,
        created_at: row.get(9)?,
        updated_at: row.get(10)?,
    })
}

fn message_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<MessageRow> {
    Ok(MessageRow {
        id: row.get(0)?,
        conversation_id: row.get(1)?,
        sender_id: row.get(2)?,
        msg_type: row.get(3)?,
        ciphertext: row.get(4)?,
        nonce: row.get(5)?,
        reply_to: row.get(6)?,
        status: row.get(7)?,
        is_deleted: row.get(8)?,
        created_at: row.get(9)?,
    })
}

use anyhow::Result;
use rusqlite::Connection;
use tracing::info;

pub fn run(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS users (
            id          TEXT PRIMARY KEY,
            username    TEXT NOT NULL UNIQUE,
            is_active   INTEGER NOT NULL DEFAULT 1,
            created_at  TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS follows (
            follower_id   TEXT NOT NULL REFERENCES users(id),
            following_id  TEXT NOT NULL REFERENCES users(id),
            created_at    TEXT NOT NULL,
            PRIMARY KEY (follower_id, following_id)
        );

        -- participant_a < participant_b (canonical sorted pair). The UNIQUE
        -- constraint is what guarantees at most one direct conversation per
        -- unordered pair, including under concurrent start attempts.
        CREATE TABLE IF NOT EXISTS conversations (
            id                       TEXT PRIMARY KEY,
            conv_type                TEXT NOT NULL DEFAULT 'direct',
            participant_a            TEXT NOT NULL REFERENCES users(id),
            participant_b            TEXT NOT NULL REFERENCES users(id),
            last_message_ciphertext  BLOB,
            last_message_nonce       BLOB,
            last_message_sender      TEXT,
            last_message_at          TEXT,
            is_active                INTEGER NOT NULL DEFAULT 1,
            created_at               TEXT NOT NULL,
            updated_at               TEXT NOT NULL,
            UNIQUE (conv_type, participant_a, participant_b)
        );

        CREATE INDEX IF NOT EXISTS idx_conversations_updated
            ON conversations(updated_at DESC);

        CREATE TABLE IF NOT EXISTS messages (
            id               TEXT PRIMARY KEY,
            conversation_id  TEXT NOT NULL REFERENCES conversations(id),
            sender_id        TEXT NOT NULL REFERENCES users(id),
            msg_type         TEXT NOT NULL DEFAULT 'text'
                CHECK (msg_type IN ('text', 'image', 'voice', 'file')),
            ciphertext       BLOB NOT NULL,
            nonce            BLOB NOT NULL,
            reply_to         TEXT REFERENCES messages(id),
            status           TEXT NOT NULL DEFAULT 'sent'
                CHECK (status IN ('sent', 'delivered', 'read')),
            is_deleted       INTEGER NOT NULL DEFAULT 0,
            created_at       TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_messages_conversation
            ON messages(conversation_id, created_at DESC);

        CREATE INDEX IF NOT EXISTS idx_messages_sender
            ON messages(sender_id, created_at DESC);

        CREATE TABLE IF NOT EXISTS message_reads (
            message_id  TEXT NOT NULL REFERENCES messages(id),
            user_id     TEXT NOT NULL REFERENCES users(id),
            read_at     TEXT NOT NULL,
            PRIMARY KEY (message_id, user_id)
        );

        CREATE TABLE IF NOT EXISTS message_deletes (
            message_id  TEXT NOT NULL REFERENCES messages(id),
            user_id     TEXT NOT NULL REFERENCES users(id),
            PRIMARY KEY (message_id, user_id)
        );
        ",
    )?;

    info!("Database migrations complete");
    Ok(())
}

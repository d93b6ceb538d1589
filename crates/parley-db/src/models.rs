/// Database row types — these map directly to SQLite rows.
/// Distinct from parley-types API models to keep the DB layer independent.

pub struct UserRow {
    pub id: String,
    pub username: String,
    pub is_active: bool,
    pub created_at: String,
}

pub struct ConversationRow {
    pub id: String,
    pub conv_type: String,
    pub participant_a: String,
    pub participant_b: String,
    pub last_message_ciphertext: Option<Vec<u8>>,
    pub last_message_nonce: Option<Vec<u8>>,
    pub last_message_sender: Option<String>,
    pub last_message_at: Option<String>,
    pub is_active: bool,
    pub created_at: String,
    pub updated_at: String,
}

pub struct MessageRow {
    pub id: String,
    pub conversation_id: String,
    pub sender_id: String,
    pub msg_type: String,
    pub ciphertext: Vec<u8>,
    pub nonce: Vec<u8>,
    pub reply_to: Option<String>,
    pub status: String,
    pub is_deleted: bool,
    pub created_at: String,
}

pub struct ReadReceiptRow {
    pub message_id: String,
    pub user_id: String,
    pub read_at: String,
}

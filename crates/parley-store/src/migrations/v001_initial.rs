//! v001 -- Initial schema creation.
//!
//! Creates the three core tables: `messages`, `participant_state`, and
//! `contacts`.

use rusqlite::Connection;

/// SQL executed when upgrading from version 0 to version 1.
const UP_SQL: &str = r#"
-- ----------------------------------------------------------------
-- Messages
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS messages (
    id                  TEXT PRIMARY KEY NOT NULL,  -- server id, or local temp id while pending
    local_temp_id       TEXT,                       -- client draft id, kept after promotion
    conversation_id     TEXT NOT NULL,
    sender_id           TEXT NOT NULL,
    created_at          INTEGER NOT NULL,           -- epoch millis, client clock
    message_seq         INTEGER,                    -- server sequence
    server_ack_at       INTEGER,                    -- epoch millis
    body                TEXT NOT NULL,
    content_type        TEXT NOT NULL,              -- text | encrypted | attachment_only
    ciphertext          TEXT,                       -- opaque JSON
    attachments         TEXT NOT NULL DEFAULT '[]', -- opaque JSON array
    reply_to_message_id TEXT,
    thread_root_id      TEXT,
    status              TEXT NOT NULL,              -- SENDING | SENT | DELIVERED | READ | ERROR
    edited_at           INTEGER,
    deleted_for_all_at  INTEGER,
    metadata            TEXT NOT NULL DEFAULT '{}'  -- opaque JSON object
);

CREATE INDEX IF NOT EXISTS idx_messages_conversation_seq
    ON messages(conversation_id, message_seq);

CREATE INDEX IF NOT EXISTS idx_messages_conversation_created
    ON messages(conversation_id, created_at);

CREATE UNIQUE INDEX IF NOT EXISTS idx_messages_local_temp_id
    ON messages(local_temp_id) WHERE local_temp_id IS NOT NULL;

CREATE INDEX IF NOT EXISTS idx_messages_reply_to ON messages(reply_to_message_id);
CREATE INDEX IF NOT EXISTS idx_messages_thread_root ON messages(thread_root_id);

-- ----------------------------------------------------------------
-- Participant state (per conversation x user)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS participant_state (
    conversation_id TEXT NOT NULL,
    user_id         TEXT NOT NULL,
    role            TEXT NOT NULL DEFAULT 'member',
    joined_at       INTEGER NOT NULL,
    left_at         INTEGER,
    mute_until      INTEGER,
    archived        INTEGER NOT NULL DEFAULT 0,   -- boolean 0/1
    pinned          INTEGER NOT NULL DEFAULT 0,   -- boolean 0/1
    pinned_at       INTEGER,
    last_read_at    INTEGER,
    last_read_seq   INTEGER,
    settings        TEXT NOT NULL DEFAULT '{}',   -- JSON object

    PRIMARY KEY (conversation_id, user_id)
);

CREATE INDEX IF NOT EXISTS idx_participant_state_user ON participant_state(user_id);

-- ----------------------------------------------------------------
-- Contacts (device address book, keyed by canonical phone number)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS contacts (
    phone_no      TEXT PRIMARY KEY NOT NULL,   -- canonical +<digits>
    id            TEXT NOT NULL,               -- device address-book id
    name          TEXT NOT NULL,
    description   TEXT,
    photo         TEXT,
    is_registered INTEGER NOT NULL DEFAULT 0,  -- boolean 0/1
    updated_at    INTEGER NOT NULL
);
"#;

/// Apply the initial migration.
pub fn up(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(UP_SQL)
}

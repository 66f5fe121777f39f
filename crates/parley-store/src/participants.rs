//! Per-(conversation, user) participant state: pin, mute, archive and the
//! read cursor.
//!
//! Rows are created lazily by the first setter that touches them. Message
//! writes never go through here.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};

use parley_shared::{ConversationId, UserId};

use crate::codec::{from_json, from_millis, invalid, millis, opt_from_millis, opt_millis, to_json};
use crate::database::Database;
use crate::error::{Result, StoreError};
use crate::models::{Participant, ParticipantRole};

const PARTICIPANT_COLUMNS: &str = "conversation_id, user_id, role, joined_at, left_at, \
     mute_until, archived, pinned, pinned_at, last_read_at, last_read_seq, settings";

impl Database {
    // ------------------------------------------------------------------
    // Create
    // ------------------------------------------------------------------

    /// Make sure a participant row exists, creating it with `role` if not.
    /// An existing row is returned unchanged.
    pub fn ensure_participant(
        &self,
        conversation_id: &ConversationId,
        user_id: &UserId,
        role: ParticipantRole,
        joined_at: DateTime<Utc>,
    ) -> Result<Participant> {
        insert_if_missing(self.conn(), conversation_id, user_id, role, joined_at)?;
        self.get_participant(conversation_id, user_id)?
            .ok_or(StoreError::NotFound)
    }

    // ------------------------------------------------------------------
    // Read
    // ------------------------------------------------------------------

    pub fn get_participant(
        &self,
        conversation_id: &ConversationId,
        user_id: &UserId,
    ) -> Result<Option<Participant>> {
        let sql = format!(
            "SELECT {PARTICIPANT_COLUMNS} FROM participant_state
             WHERE conversation_id = ?1 AND user_id = ?2"
        );
        let row = self
            .conn()
            .query_row(
                &sql,
                params![conversation_id.as_str(), user_id.as_str()],
                row_to_participant,
            )
            .optional()?;
        Ok(row)
    }

    /// Every conversation the user has state for.
    pub fn participants_for_user(&self, user_id: &UserId) -> Result<Vec<Participant>> {
        let sql = format!(
            "SELECT {PARTICIPANT_COLUMNS} FROM participant_state
             WHERE user_id = ?1
             ORDER BY conversation_id ASC"
        );
        let mut stmt = self.conn().prepare(&sql)?;
        let rows = stmt.query_map(params![user_id.as_str()], row_to_participant)?;

        let mut participants = Vec::new();
        for row in rows {
            participants.push(row?);
        }
        Ok(participants)
    }

    /// Earliest mute of `user_id` that is still running at `now`.
    pub fn next_mute_expiry(
        &self,
        user_id: &UserId,
        now: DateTime<Utc>,
    ) -> Result<Option<DateTime<Utc>>> {
        let until: Option<i64> = self.conn().query_row(
            "SELECT MIN(mute_until) FROM participant_state
             WHERE user_id = ?1 AND mute_until > ?2",
            params![user_id.as_str(), millis(&now)],
            |row| row.get(0),
        )?;
        Ok(until.map(|v| from_millis(0, v)).transpose()?)
    }

    /// Other users sharing a conversation with `user_id`.
    pub fn other_participants(
        &self,
        conversation_id: &ConversationId,
        user_id: &UserId,
    ) -> Result<Vec<UserId>> {
        let mut stmt = self.conn().prepare(
            "SELECT user_id FROM participant_state
             WHERE conversation_id = ?1 AND user_id != ?2 AND left_at IS NULL
             ORDER BY joined_at ASC",
        )?;
        let rows = stmt.query_map(params![conversation_id.as_str(), user_id.as_str()], |row| {
            row.get::<_, String>(0).map(UserId)
        })?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(StoreError::Sqlite)
    }

    // ------------------------------------------------------------------
    // Update
    // ------------------------------------------------------------------

    pub fn set_pinned(
        &self,
        conversation_id: &ConversationId,
        user_id: &UserId,
        pinned: bool,
        now: DateTime<Utc>,
    ) -> Result<Participant> {
        self.update_participant(
            conversation_id,
            user_id,
            now,
            "pinned = ?3, pinned_at = ?4",
            params![
                conversation_id.as_str(),
                user_id.as_str(),
                pinned as i32,
                pinned.then(|| millis(&now)),
            ],
        )
    }

    /// Mute until the given instant; `None` unmutes.
    pub fn set_muted_until(
        &self,
        conversation_id: &ConversationId,
        user_id: &UserId,
        until: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<Participant> {
        self.update_participant(
            conversation_id,
            user_id,
            now,
            "mute_until = ?3",
            params![
                conversation_id.as_str(),
                user_id.as_str(),
                opt_millis(until.as_ref()),
            ],
        )
    }

    pub fn set_archived(
        &self,
        conversation_id: &ConversationId,
        user_id: &UserId,
        archived: bool,
        now: DateTime<Utc>,
    ) -> Result<Participant> {
        self.update_participant(
            conversation_id,
            user_id,
            now,
            "archived = ?3",
            params![conversation_id.as_str(), user_id.as_str(), archived as i32],
        )
    }

    /// Advance the read cursor. Neither `last_read_seq` nor `last_read_at`
    /// ever moves backwards.
    pub fn mark_read(
        &self,
        conversation_id: &ConversationId,
        user_id: &UserId,
        seq: Option<i64>,
        now: DateTime<Utc>,
    ) -> Result<Participant> {
        self.update_participant(
            conversation_id,
            user_id,
            now,
            "last_read_seq = MAX(COALESCE(last_read_seq, ?3), COALESCE(?3, last_read_seq)),
             last_read_at = MAX(COALESCE(last_read_at, ?4), ?4)",
            params![
                conversation_id.as_str(),
                user_id.as_str(),
                seq,
                millis(&now),
            ],
        )
    }

    /// Set (or with `None`, remove) one free-form setting. Last writer wins.
    pub fn set_setting(
        &mut self,
        conversation_id: &ConversationId,
        user_id: &UserId,
        key: &str,
        value: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<Participant> {
        let tx = self.conn_mut().transaction()?;
        insert_if_missing(&tx, conversation_id, user_id, ParticipantRole::Member, now)?;

        let settings_json: String = tx.query_row(
            "SELECT settings FROM participant_state WHERE conversation_id = ?1 AND user_id = ?2",
            params![conversation_id.as_str(), user_id.as_str()],
            |row| row.get(0),
        )?;
        let mut settings: BTreeMap<String, String> = from_json(0, &settings_json)?;
        match value {
            Some(v) => settings.insert(key.to_string(), v.to_string()),
            None => settings.remove(key),
        };

        tx.execute(
            "UPDATE participant_state SET settings = ?3 WHERE conversation_id = ?1 AND user_id = ?2",
            params![conversation_id.as_str(), user_id.as_str(), to_json(&settings)?],
        )?;
        tx.commit()?;

        self.get_participant(conversation_id, user_id)?
            .ok_or(StoreError::NotFound)
    }

    fn update_participant(
        &self,
        conversation_id: &ConversationId,
        user_id: &UserId,
        now: DateTime<Utc>,
        assignments: &str,
        params: &[&dyn rusqlite::ToSql],
    ) -> Result<Participant> {
        insert_if_missing(self.conn(), conversation_id, user_id, ParticipantRole::Member, now)?;
        let sql = format!(
            "UPDATE participant_state SET {assignments}
             WHERE conversation_id = ?1 AND user_id = ?2"
        );
        self.conn().execute(&sql, params)?;
        self.get_participant(conversation_id, user_id)?
            .ok_or(StoreError::NotFound)
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn insert_if_missing(
    conn: &Connection,
    conversation_id: &ConversationId,
    user_id: &UserId,
    role: ParticipantRole,
    joined_at: DateTime<Utc>,
) -> Result<()> {
    conn.execute(
        "INSERT OR IGNORE INTO participant_state (conversation_id, user_id, role, joined_at)
         VALUES (?1, ?2, ?3, ?4)",
        params![
            conversation_id.as_str(),
            user_id.as_str(),
            role.as_str(),
            millis(&joined_at),
        ],
    )?;
    Ok(())
}

/// Map a `rusqlite::Row` to a [`Participant`].
fn row_to_participant(row: &rusqlite::Row<'_>) -> rusqlite::Result<Participant> {
    let role_str: String = row.get(2)?;
    let role = ParticipantRole::parse(&role_str)
        .ok_or_else(|| invalid(2, rusqlite::types::Type::Text, format!("role {role_str}")))?;
    let settings: String = row.get(11)?;

    Ok(Participant {
        conversation_id: ConversationId(row.get(0)?),
        user_id: UserId(row.get(1)?),
        role,
        joined_at: from_millis(3, row.get(3)?)?,
        left_at: opt_from_millis(4, row.get(4)?)?,
        mute_until: opt_from_millis(5, row.get(5)?)?,
        archived: row.get::<_, i32>(6)? != 0,
        pinned: row.get::<_, i32>(7)? != 0,
        pinned_at: opt_from_millis(8, row.get(8)?)?,
        last_read_at: opt_from_millis(9, row.get(9)?)?,
        last_read_seq: row.get(10)?,
        settings: from_json(11, &settings)?,
    })
}

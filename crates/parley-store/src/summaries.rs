//! Conversation summaries, derived on demand from messages and participant
//! state. Nothing here is persisted; the unread count in particular is
//! always recomputed from the read cursor.

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};

use parley_shared::constants::SETTING_DISPLAY_NAME;
use parley_shared::{ConversationId, UserId};

use crate::database::Database;
use crate::error::Result;
use crate::messages::{row_to_message, MESSAGE_COLUMNS};
use crate::models::{ConversationSummary, Message};

impl Database {
    /// Summaries of every conversation visible to `user_id`: pinned first,
    /// then by most recent activity.
    pub fn conversation_summaries(
        &self,
        user_id: &UserId,
        now: DateTime<Utc>,
    ) -> Result<Vec<ConversationSummary>> {
        let mut stmt = self.conn().prepare(
            "SELECT conversation_id FROM participant_state WHERE user_id = ?1 AND left_at IS NULL
             UNION
             SELECT DISTINCT conversation_id FROM messages",
        )?;
        let ids = stmt
            .query_map(params![user_id.as_str()], |row| {
                row.get::<_, String>(0).map(ConversationId)
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let mut summaries = Vec::with_capacity(ids.len());
        for id in &ids {
            summaries.push(self.conversation_summary(id, user_id, now)?);
        }

        summaries.sort_by(|a, b| {
            b.pinned
                .cmp(&a.pinned)
                .then_with(|| b.last_activity_at.cmp(&a.last_activity_at))
                .then_with(|| a.conversation_id.cmp(&b.conversation_id))
        });
        Ok(summaries)
    }

    /// Summary of one conversation as seen by `user_id`.
    pub fn conversation_summary(
        &self,
        conversation_id: &ConversationId,
        user_id: &UserId,
        now: DateTime<Utc>,
    ) -> Result<ConversationSummary> {
        let participant = self.get_participant(conversation_id, user_id)?;
        let last = self.last_visible_message(conversation_id)?;

        let last_read_seq = participant.as_ref().and_then(|p| p.last_read_seq);
        let unread: i64 = self.conn().query_row(
            "SELECT COUNT(*) FROM messages
             WHERE conversation_id = ?1
               AND message_seq > ?2
               AND sender_id != ?3
               AND deleted_for_all_at IS NULL",
            params![
                conversation_id.as_str(),
                last_read_seq.unwrap_or(i64::MIN),
                user_id.as_str(),
            ],
            |row| row.get(0),
        )?;

        let display_name = match participant
            .as_ref()
            .and_then(|p| p.settings.get(SETTING_DISPLAY_NAME))
        {
            Some(name) => name.clone(),
            None => self.fallback_display_name(conversation_id, user_id)?,
        };

        Ok(ConversationSummary {
            conversation_id: conversation_id.clone(),
            display_name,
            last_message_id: last.as_ref().map(|m| m.id.clone()),
            last_message_preview: last.as_ref().map(Message::preview),
            last_activity_at: last.as_ref().map(|m| m.created_at),
            unread_count: u32::try_from(unread).unwrap_or(u32::MAX),
            pinned: participant.as_ref().is_some_and(|p| p.pinned),
            muted: participant.as_ref().is_some_and(|p| p.is_muted(now)),
            archived: participant.as_ref().is_some_and(|p| p.archived),
        })
    }

    /// Newest non-deleted message by client creation time.
    fn last_visible_message(&self, conversation_id: &ConversationId) -> Result<Option<Message>> {
        let sql = format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages
             WHERE conversation_id = ?1 AND deleted_for_all_at IS NULL
             ORDER BY created_at DESC, id DESC
             LIMIT 1"
        );
        let row = self
            .conn()
            .query_row(&sql, params![conversation_id.as_str()], row_to_message)
            .optional()?;
        Ok(row)
    }

    /// Name of the first other participant as known from the address book,
    /// else their user id, else the conversation id.
    fn fallback_display_name(
        &self,
        conversation_id: &ConversationId,
        user_id: &UserId,
    ) -> Result<String> {
        let others = self.other_participants(conversation_id, user_id)?;
        let Some(first) = others.first() else {
            return Ok(conversation_id.to_string());
        };
        Ok(match self.contact_by_remote_uid(first)? {
            Some(contact) => contact.name,
            None => first.to_string(),
        })
    }
}

//! The local message cache.
//!
//! Rows are keyed by `id`. An outgoing message is first stored under its
//! client-generated temporary id with `local_temp_id` set; when the server
//! acknowledges it, the row is promoted in place to the server id and keeps
//! `local_temp_id`, so the draft can still be found by the id its author
//! knows. Every upsert runs in its own transaction, so an interrupted merge
//! leaves either the old row or the fully merged one.
//!
//! Rows are never hard-deleted through this API; `deleted_for_all_at` is the
//! only form of deletion.

use rusqlite::{params, Connection, OptionalExtension};

use parley_shared::{ConversationId, MessageId};

use crate::codec::{from_json, from_millis, invalid, millis, opt_from_millis, opt_millis, to_json};
use crate::database::Database;
use crate::error::{Result, StoreError};
use crate::models::{ContentType, Message, MessageStatus};

pub(crate) const MESSAGE_COLUMNS: &str = "id, local_temp_id, conversation_id, sender_id, created_at, \
     message_seq, server_ack_at, body, content_type, ciphertext, attachments, \
     reply_to_message_id, thread_root_id, status, edited_at, deleted_for_all_at, metadata";

/// What an upsert did to the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    /// No matching row existed.
    Inserted,
    /// The matching row was rewritten under the same id.
    Updated,
    /// A pending row was replaced by its server-identified version.
    Promoted,
    /// The merged row equals the stored one; nothing was written.
    Unchanged,
}

impl UpsertOutcome {
    pub fn changed(&self) -> bool {
        !matches!(self, Self::Unchanged)
    }
}

impl Database {
    // ------------------------------------------------------------------
    // Write
    // ------------------------------------------------------------------

    /// Insert or merge a single message.
    ///
    /// Matching is by `id`, then by `local_temp_id`. When both match
    /// different rows (the server echo of an outgoing message landed before
    /// its write acknowledgment), the pending row is folded into the server
    /// row and removed. Returns the stored row after the merge.
    pub fn upsert_message(&mut self, incoming: &Message) -> Result<(UpsertOutcome, Message)> {
        let tx = self.conn_mut().transaction()?;

        let by_id = select_message(&tx, "id = ?1", incoming.id.as_str())?;
        let by_temp = match &incoming.local_temp_id {
            Some(temp) => select_message(&tx, "local_temp_id = ?1", temp.as_str())?,
            None => None,
        };

        let (outcome, stored) = match (by_temp, by_id) {
            (None, None) => {
                let row = normalize(incoming.clone());
                write_message(&tx, &row)?;
                (UpsertOutcome::Inserted, row)
            }
            (Some(pending), Some(server)) if pending.id != server.id => {
                let merged = merge_message(&server, incoming);
                delete_row(&tx, &pending.id)?;
                write_message(&tx, &merged)?;
                (UpsertOutcome::Promoted, merged)
            }
            (Some(existing), _) | (None, Some(existing)) => {
                let merged = merge_message(&existing, incoming);
                if merged == existing {
                    (UpsertOutcome::Unchanged, existing)
                } else if merged.id != existing.id {
                    delete_row(&tx, &existing.id)?;
                    write_message(&tx, &merged)?;
                    (UpsertOutcome::Promoted, merged)
                } else {
                    write_message(&tx, &merged)?;
                    (UpsertOutcome::Updated, merged)
                }
            }
        };

        tx.commit()?;
        Ok((outcome, stored))
    }

    /// Upsert a batch. Each message is its own transaction; a failure stops
    /// the batch but leaves already-applied rows in place.
    pub fn upsert_messages(&mut self, messages: &[Message]) -> Result<Vec<(UpsertOutcome, Message)>> {
        messages.iter().map(|m| self.upsert_message(m)).collect()
    }

    /// Raise the status of an acknowledged message from a delivery or read
    /// receipt. Receipts never lower a status, and rows without a server
    /// sequence are left alone. Returns the row if it changed.
    pub fn apply_receipt(
        &mut self,
        message_id: &MessageId,
        status: MessageStatus,
    ) -> Result<Option<Message>> {
        let tx = self.conn_mut().transaction()?;

        let Some(existing) = select_message(&tx, "id = ?1", message_id.as_str())? else {
            return Ok(None);
        };
        if existing.message_seq.is_none() {
            tracing::debug!(message_id = %message_id, "receipt for unacknowledged message ignored");
            return Ok(None);
        }

        let merged_status = existing.status.merge(status);
        if merged_status == existing.status {
            return Ok(None);
        }

        tx.execute(
            "UPDATE messages SET status = ?1 WHERE id = ?2",
            params![merged_status.as_str(), message_id.as_str()],
        )?;
        tx.commit()?;

        Ok(Some(Message {
            status: merged_status,
            ..existing
        }))
    }

    /// Mark a pending message as failed. Acknowledged rows are untouched.
    pub fn mark_send_failed(&self, local_id: &MessageId) -> Result<Option<Message>> {
        let affected = self.conn().execute(
            "UPDATE messages SET status = ?1
             WHERE local_temp_id = ?2 AND message_seq IS NULL",
            params![MessageStatus::Error.as_str(), local_id.as_str()],
        )?;
        if affected == 0 {
            return Ok(None);
        }
        self.find_by_local_temp_id(local_id)
    }

    // ------------------------------------------------------------------
    // Read
    // ------------------------------------------------------------------

    /// Messages of a conversation in display order: by `message_seq`
    /// ascending, with unsequenced (pending) rows after every sequenced row,
    /// ordered among themselves by `created_at`.
    ///
    /// With a `limit`, the newest `limit` rows are returned, still in
    /// display order.
    pub fn query_messages(
        &self,
        conversation_id: &ConversationId,
        limit: Option<u32>,
    ) -> Result<Vec<Message>> {
        let sql = format!(
            "SELECT {MESSAGE_COLUMNS} FROM (
                 SELECT {MESSAGE_COLUMNS} FROM messages
                 WHERE conversation_id = ?1
                 ORDER BY message_seq IS NULL DESC, message_seq DESC, created_at DESC, id DESC
                 LIMIT ?2
             )
             ORDER BY message_seq IS NULL ASC, message_seq ASC, created_at ASC, id ASC"
        );
        let mut stmt = self.conn().prepare(&sql)?;

        let limit = limit.map(i64::from).unwrap_or(-1);
        let rows = stmt.query_map(params![conversation_id.as_str(), limit], row_to_message)?;

        let mut messages = Vec::new();
        for row in rows {
            messages.push(row?);
        }
        Ok(messages)
    }

    pub fn message_by_id(&self, id: &MessageId) -> Result<Message> {
        select_message(self.conn(), "id = ?1", id.as_str())?.ok_or(StoreError::NotFound)
    }

    /// The row created from the draft with this local id, pending or not.
    pub fn find_by_local_temp_id(&self, local_id: &MessageId) -> Result<Option<Message>> {
        select_message(self.conn(), "local_temp_id = ?1", local_id.as_str())
    }

    /// The row a caller holding `local_id` means: the promoted or pending
    /// row of that draft, else a row whose id is `local_id` (bridges that
    /// keep client ids as server ids).
    pub fn find_by_local_id(&self, local_id: &MessageId) -> Result<Option<Message>> {
        match self.find_by_local_temp_id(local_id)? {
            Some(m) => Ok(Some(m)),
            None => select_message(self.conn(), "id = ?1", local_id.as_str()),
        }
    }

    /// Highest server sequence stored for a conversation.
    pub fn max_message_seq(&self, conversation_id: &ConversationId) -> Result<Option<i64>> {
        let seq = self.conn().query_row(
            "SELECT MAX(message_seq) FROM messages WHERE conversation_id = ?1",
            params![conversation_id.as_str()],
            |row| row.get(0),
        )?;
        Ok(seq)
    }

    pub fn count_messages(&self, conversation_id: &ConversationId) -> Result<u64> {
        let count: i64 = self.conn().query_row(
            "SELECT COUNT(*) FROM messages WHERE conversation_id = ?1",
            params![conversation_id.as_str()],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    /// Direct replies to a message, oldest first.
    pub fn replies_to(&self, message_id: &MessageId) -> Result<Vec<Message>> {
        let sql = format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages
             WHERE reply_to_message_id = ?1
             ORDER BY message_seq IS NULL ASC, message_seq ASC, created_at ASC"
        );
        let mut stmt = self.conn().prepare(&sql)?;
        let rows = stmt.query_map(params![message_id.as_str()], row_to_message)?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(StoreError::Sqlite)
    }
}

// ---------------------------------------------------------------------------
// Merge rules
// ---------------------------------------------------------------------------

/// Combine a stored row with an incoming version of the same message.
///
/// * status only moves forward (see [`MessageStatus::merge`]);
/// * an assigned sequence and the first acknowledgment time never change;
/// * the id becomes the server id once the message is acknowledged;
/// * a soft delete is sticky, and a newer edit wins the content.
pub(crate) fn merge_message(existing: &Message, incoming: &Message) -> Message {
    if existing.status.is_acknowledged() && !incoming.status.is_acknowledged() {
        return existing.clone();
    }

    let status = existing.status.merge(incoming.status);
    let id = if existing.status.is_acknowledged() || !incoming.status.is_acknowledged() {
        existing.id.clone()
    } else {
        incoming.id.clone()
    };

    let content_from = if existing.edited_at > incoming.edited_at {
        existing
    } else {
        incoming
    };

    normalize(Message {
        id,
        local_temp_id: existing
            .local_temp_id
            .clone()
            .or_else(|| incoming.local_temp_id.clone()),
        conversation_id: existing.conversation_id.clone(),
        sender_id: existing.sender_id.clone(),
        created_at: existing.created_at,
        message_seq: existing.message_seq.or(incoming.message_seq),
        server_ack_at: existing.server_ack_at.or(incoming.server_ack_at),
        body: content_from.body.clone(),
        content_type: content_from.content_type,
        ciphertext: content_from.ciphertext.clone(),
        attachments: content_from.attachments.clone(),
        reply_to_message_id: content_from.reply_to_message_id.clone(),
        thread_root_id: content_from.thread_root_id.clone(),
        status,
        edited_at: existing.edited_at.max(incoming.edited_at),
        deleted_for_all_at: existing.deleted_for_all_at.or(incoming.deleted_for_all_at),
        metadata: content_from.metadata.clone(),
    })
}

/// A row carrying a server sequence is never left SENDING or ERROR.
fn normalize(mut message: Message) -> Message {
    if message.message_seq.is_some() && !message.status.is_acknowledged() {
        message.status = MessageStatus::Sent;
    }
    message
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn select_message(conn: &Connection, filter: &str, key: &str) -> Result<Option<Message>> {
    let sql = format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE {filter}");
    let row = conn
        .query_row(&sql, params![key], row_to_message)
        .optional()?;
    Ok(row)
}

fn write_message(conn: &Connection, m: &Message) -> Result<()> {
    let sql = format!(
        "INSERT OR REPLACE INTO messages ({MESSAGE_COLUMNS})
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)"
    );
    let ciphertext = m.ciphertext.as_ref().map(to_json).transpose()?;
    conn.execute(
        &sql,
        params![
            m.id.as_str(),
            m.local_temp_id.as_ref().map(|t| t.as_str()),
            m.conversation_id.as_str(),
            m.sender_id.as_str(),
            millis(&m.created_at),
            m.message_seq,
            opt_millis(m.server_ack_at.as_ref()),
            m.body,
            m.content_type.as_str(),
            ciphertext,
            to_json(&m.attachments)?,
            m.reply_to_message_id.as_ref().map(|r| r.as_str()),
            m.thread_root_id.as_ref().map(|r| r.as_str()),
            m.status.as_str(),
            opt_millis(m.edited_at.as_ref()),
            opt_millis(m.deleted_for_all_at.as_ref()),
            to_json(&m.metadata)?,
        ],
    )?;
    Ok(())
}

fn delete_row(conn: &Connection, id: &MessageId) -> Result<()> {
    conn.execute("DELETE FROM messages WHERE id = ?1", params![id.as_str()])?;
    Ok(())
}

/// Map a `rusqlite::Row` to a [`Message`].
pub(crate) fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<Message> {
    let content_type_str: String = row.get(8)?;
    let content_type = ContentType::parse(&content_type_str).ok_or_else(|| {
        invalid(8, rusqlite::types::Type::Text, format!("content type {content_type_str}"))
    })?;

    let status_str: String = row.get(13)?;
    let status = MessageStatus::parse(&status_str).ok_or_else(|| {
        invalid(13, rusqlite::types::Type::Text, format!("status {status_str}"))
    })?;

    let ciphertext: Option<String> = row.get(9)?;
    let attachments: String = row.get(10)?;
    let metadata: String = row.get(16)?;

    Ok(Message {
        id: MessageId(row.get(0)?),
        local_temp_id: row.get::<_, Option<String>>(1)?.map(MessageId),
        conversation_id: ConversationId(row.get(2)?),
        sender_id: parley_shared::UserId(row.get(3)?),
        created_at: from_millis(4, row.get(4)?)?,
        message_seq: row.get(5)?,
        server_ack_at: opt_from_millis(6, row.get(6)?)?,
        body: row.get(7)?,
        content_type,
        ciphertext: ciphertext.map(|c| from_json(9, &c)).transpose()?,
        attachments: from_json(10, &attachments)?,
        reply_to_message_id: row.get::<_, Option<String>>(11)?.map(MessageId),
        thread_root_id: row.get::<_, Option<String>>(12)?.map(MessageId),
        status,
        edited_at: opt_from_millis(14, row.get(14)?)?,
        deleted_for_all_at: opt_from_millis(15, row.get(15)?)?,
        metadata: from_json(16, &metadata)?,
    })
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use chrono::{DateTime, Duration, Utc};
    use parley_shared::UserId;

    use super::*;
    use crate::models::{AttachmentRef, MessageDraft, OpaqueBlob};

    fn db() -> Database {
        Database::open_in_memory().unwrap()
    }

    fn t0() -> DateTime<Utc> {
        DateTime::from_timestamp_millis(1_700_000_000_000).unwrap()
    }

    fn draft(local: &str, body: &str) -> MessageDraft {
        MessageDraft {
            local_id: MessageId::from(local),
            conversation_id: ConversationId::from("c1"),
            sender_id: UserId::from("me"),
            body: body.to_string(),
            content_type: ContentType::Text,
            ciphertext: None,
            attachments: Vec::new(),
            reply_to_message_id: None,
            thread_root_id: None,
            metadata: BTreeMap::new(),
            created_at: t0(),
        }
    }

    fn remote(id: &str, seq: i64, at: DateTime<Utc>) -> Message {
        Message {
            id: MessageId::from(id),
            local_temp_id: None,
            conversation_id: ConversationId::from("c1"),
            sender_id: UserId::from("them"),
            created_at: at,
            message_seq: Some(seq),
            server_ack_at: Some(at),
            body: format!("body {id}"),
            content_type: ContentType::Text,
            ciphertext: None,
            attachments: Vec::new(),
            reply_to_message_id: None,
            thread_root_id: None,
            status: MessageStatus::Sent,
            edited_at: None,
            deleted_for_all_at: None,
            metadata: BTreeMap::new(),
        }
    }

    fn acknowledged(pending: &Message, id: &str, seq: i64) -> Message {
        Message {
            id: MessageId::from(id),
            message_seq: Some(seq),
            server_ack_at: Some(t0() + Duration::seconds(1)),
            status: MessageStatus::Sent,
            ..pending.clone()
        }
    }

    #[test]
    fn test_status_merge_never_regresses() {
        use MessageStatus::*;
        assert_eq!(Read.merge(Delivered), Read);
        assert_eq!(Delivered.merge(Sent), Delivered);
        assert_eq!(Sent.merge(Sending), Sent);
        assert_eq!(Read.merge(Error), Read);
        assert_eq!(Sent.merge(Read), Read);
        assert_eq!(Error.merge(Sending), Sending);
        assert_eq!(Sending.merge(Error), Error);
    }

    #[test]
    fn test_promotion_replaces_pending_row() {
        let mut db = db();
        let pending = Message::pending_from_draft(&draft("t1", "hi"));
        let (outcome, _) = db.upsert_message(&pending).unwrap();
        assert_eq!(outcome, UpsertOutcome::Inserted);

        let (outcome, stored) = db.upsert_message(&acknowledged(&pending, "s1", 7)).unwrap();
        assert_eq!(outcome, UpsertOutcome::Promoted);
        assert_eq!(stored.id, MessageId::from("s1"));
        assert_eq!(stored.message_seq, Some(7));
        assert_eq!(stored.status, MessageStatus::Sent);
        assert_eq!(stored.local_temp_id, Some(MessageId::from("t1")));

        let all = db.query_messages(&ConversationId::from("c1"), None).unwrap();
        assert_eq!(all, vec![stored.clone()]);
        assert_eq!(
            db.find_by_local_id(&MessageId::from("t1")).unwrap(),
            Some(stored)
        );
        assert!(matches!(
            db.message_by_id(&MessageId::from("t1")),
            Err(StoreError::NotFound)
        ));
    }

    #[test]
    fn test_echo_before_ack_collapses_to_one_row() {
        let mut db = db();
        let pending = Message::pending_from_draft(&draft("t1", "hi"));
        db.upsert_message(&pending).unwrap();

        // Server echo without the client temp id arrives first.
        let echo = Message {
            local_temp_id: None,
            sender_id: UserId::from("me"),
            ..acknowledged(&pending, "s1", 7)
        };
        db.upsert_message(&echo).unwrap();
        assert_eq!(db.count_messages(&ConversationId::from("c1")).unwrap(), 2);

        let (outcome, stored) = db.upsert_message(&acknowledged(&pending, "s1", 7)).unwrap();
        assert_eq!(outcome, UpsertOutcome::Promoted);
        assert_eq!(stored.id, MessageId::from("s1"));
        assert_eq!(stored.local_temp_id, Some(MessageId::from("t1")));
        assert_eq!(db.count_messages(&ConversationId::from("c1")).unwrap(), 1);
    }

    #[test]
    fn test_promoted_row_stays_reachable_from_local_id() {
        let mut db = db();
        let pending = Message::pending_from_draft(&draft("t1", "hi"));
        db.upsert_message(&pending).unwrap();
        let (_, promoted) = db.upsert_message(&acknowledged(&pending, "s1", 7)).unwrap();

        // A late echo without the client id and a replay of the pending row
        // both land on the promoted row.
        let echo = Message {
            local_temp_id: None,
            ..promoted.clone()
        };
        let (outcome, _) = db.upsert_message(&echo).unwrap();
        assert_eq!(outcome, UpsertOutcome::Unchanged);
        let (outcome, _) = db.upsert_message(&pending).unwrap();
        assert_eq!(outcome, UpsertOutcome::Unchanged);

        assert_eq!(db.count_messages(&ConversationId::from("c1")).unwrap(), 1);
        assert_eq!(
            db.find_by_local_id(&MessageId::from("t1")).unwrap(),
            Some(promoted.clone())
        );
        assert_eq!(
            db.find_by_local_temp_id(&MessageId::from("t1")).unwrap(),
            Some(promoted)
        );
        assert!(db.mark_send_failed(&MessageId::from("t1")).unwrap().is_none());
    }

    #[test]
    fn test_find_by_local_id_falls_back_to_id() {
        let mut db = db();
        db.upsert_message(&remote("s1", 1, t0())).unwrap();
        let found = db.find_by_local_id(&MessageId::from("s1")).unwrap();
        assert_eq!(found.map(|m| m.id), Some(MessageId::from("s1")));
        assert!(db.find_by_local_id(&MessageId::from("t9")).unwrap().is_none());
    }

    #[test]
    fn test_sequence_is_never_reassigned() {
        let mut db = db();
        db.upsert_message(&remote("s1", 3, t0())).unwrap();
        let (_, stored) = db.upsert_message(&remote("s1", 9, t0())).unwrap();
        assert_eq!(stored.message_seq, Some(3));
    }

    #[test]
    fn test_reupsert_is_unchanged() {
        let mut db = db();
        let m = remote("s1", 1, t0());
        db.upsert_message(&m).unwrap();
        let (outcome, _) = db.upsert_message(&m).unwrap();
        assert_eq!(outcome, UpsertOutcome::Unchanged);
    }

    #[test]
    fn test_pending_rows_sort_after_sequenced_rows() {
        let mut db = db();
        let late_pending = Message::pending_from_draft(&MessageDraft {
            created_at: t0() - Duration::hours(1),
            ..draft("t-early", "early pending")
        });
        let later_pending = Message::pending_from_draft(&MessageDraft {
            created_at: t0() + Duration::hours(1),
            ..draft("t-late", "late pending")
        });
        db.upsert_messages(&[
            later_pending,
            remote("s2", 2, t0() + Duration::minutes(5)),
            late_pending,
            remote("s1", 1, t0() + Duration::minutes(10)),
        ])
        .unwrap();

        let ids: Vec<String> = db
            .query_messages(&ConversationId::from("c1"), None)
            .unwrap()
            .into_iter()
            .map(|m| m.id.0)
            .collect();
        assert_eq!(ids, vec!["s1", "s2", "t-early", "t-late"]);
    }

    #[test]
    fn test_limit_returns_newest_page_in_display_order() {
        let mut db = db();
        for seq in 1..=5 {
            db.upsert_message(&remote(&format!("s{seq}"), seq, t0())).unwrap();
        }
        let ids: Vec<String> = db
            .query_messages(&ConversationId::from("c1"), Some(2))
            .unwrap()
            .into_iter()
            .map(|m| m.id.0)
            .collect();
        assert_eq!(ids, vec!["s4", "s5"]);
    }

    #[test]
    fn test_receipts_are_monotonic() {
        let mut db = db();
        db.upsert_message(&remote("s1", 1, t0())).unwrap();
        let id = MessageId::from("s1");

        let read = db.apply_receipt(&id, MessageStatus::Read).unwrap();
        assert_eq!(read.map(|m| m.status), Some(MessageStatus::Read));
        assert!(db.apply_receipt(&id, MessageStatus::Delivered).unwrap().is_none());
        assert_eq!(db.message_by_id(&id).unwrap().status, MessageStatus::Read);

        // A remote re-delivery of the same message at SENT keeps READ.
        let (_, stored) = db.upsert_message(&remote("s1", 1, t0())).unwrap();
        assert_eq!(stored.status, MessageStatus::Read);
    }

    #[test]
    fn test_receipt_ignored_for_pending_rows() {
        let mut db = db();
        db.upsert_message(&Message::pending_from_draft(&draft("t1", "hi")))
            .unwrap();
        assert!(db
            .apply_receipt(&MessageId::from("t1"), MessageStatus::Delivered)
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_failed_send_keeps_body_and_resend_reuses_row() {
        let mut db = db();
        let pending = Message::pending_from_draft(&draft("t1", "retry me"));
        db.upsert_message(&pending).unwrap();

        let failed = db.mark_send_failed(&MessageId::from("t1")).unwrap().unwrap();
        assert_eq!(failed.status, MessageStatus::Error);
        assert_eq!(failed.body, "retry me");

        let (outcome, resent) = db.upsert_message(&pending).unwrap();
        assert_eq!(outcome, UpsertOutcome::Updated);
        assert_eq!(resent.status, MessageStatus::Sending);
        assert_eq!(db.count_messages(&ConversationId::from("c1")).unwrap(), 1);
    }

    #[test]
    fn test_soft_delete_is_sticky_and_newer_edit_wins() {
        let mut db = db();
        let original = remote("s1", 1, t0());
        db.upsert_message(&original).unwrap();

        let edited = Message {
            body: "edited".into(),
            edited_at: Some(t0() + Duration::minutes(1)),
            ..original.clone()
        };
        db.upsert_message(&edited).unwrap();

        let deleted = Message {
            deleted_for_all_at: Some(t0() + Duration::minutes(2)),
            ..original.clone()
        };
        let (_, stored) = db.upsert_message(&deleted).unwrap();
        assert_eq!(stored.body, "edited");
        assert!(stored.is_deleted());

        let (_, stored) = db.upsert_message(&original).unwrap();
        assert!(stored.is_deleted());
    }

    #[test]
    fn test_opaque_fields_survive_storage() {
        let mut db = db();
        let mut metadata = BTreeMap::new();
        metadata.insert("channel".to_string(), "sms-fallback".to_string());
        let message = Message {
            content_type: ContentType::Encrypted,
            ciphertext: Some(OpaqueBlob(serde_json::json!({"alg": "x", "ct": "AAAA"}))),
            attachments: vec![AttachmentRef {
                object_key: "obj/1".into(),
                mime: "image/png".into(),
                size: 42,
                thumbnail_key: Some("obj/1.thumb".into()),
                cipher: Some(OpaqueBlob(serde_json::json!({"k": [1, 2, 3]}))),
            }],
            metadata,
            reply_to_message_id: Some(MessageId::from("s0")),
            ..remote("s1", 1, t0())
        };
        db.upsert_message(&message).unwrap();

        assert_eq!(db.message_by_id(&MessageId::from("s1")).unwrap(), message);
        assert_eq!(db.replies_to(&MessageId::from("s0")).unwrap(), vec![message]);
    }

    #[test]
    fn test_max_seq() {
        let mut db = db();
        let conv = ConversationId::from("c1");
        assert_eq!(db.max_message_seq(&conv).unwrap(), None);
        db.upsert_message(&remote("s1", 4, t0())).unwrap();
        db.upsert_message(&remote("s2", 9, t0())).unwrap();
        assert_eq!(db.max_message_seq(&conv).unwrap(), Some(9));
    }
}

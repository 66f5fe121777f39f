//! Domain model structs persisted in the local SQLite database.
//!
//! Every struct derives `Serialize` and `Deserialize` so it can be handed
//! directly to a presentation layer or dumped by tooling.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use parley_shared::{ConversationId, MessageId, UserId};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Opaque payloads
// ---------------------------------------------------------------------------

/// A payload this crate stores and returns but never interprets (cipher
/// parameters, transport hints). Persisted as JSON text.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(transparent)]
pub struct OpaqueBlob(pub serde_json::Value);

/// Reference to an uploaded attachment object.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AttachmentRef {
    /// Object-storage key of the attachment body.
    pub object_key: String,
    pub mime: String,
    pub size: u64,
    pub thumbnail_key: Option<String>,
    /// Encryption parameters, passed through untouched.
    pub cipher: Option<OpaqueBlob>,
}

// ---------------------------------------------------------------------------
// Message
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageStatus {
    Sending,
    Sent,
    Delivered,
    Read,
    Error,
}

impl MessageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sending => "SENDING",
            Self::Sent => "SENT",
            Self::Delivered => "DELIVERED",
            Self::Read => "READ",
            Self::Error => "ERROR",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "SENDING" => Some(Self::Sending),
            "SENT" => Some(Self::Sent),
            "DELIVERED" => Some(Self::Delivered),
            "READ" => Some(Self::Read),
            "ERROR" => Some(Self::Error),
            _ => None,
        }
    }

    /// Position on the server-side ladder. Both local states rank zero.
    fn rank(&self) -> u8 {
        match self {
            Self::Sending | Self::Error => 0,
            Self::Sent => 1,
            Self::Delivered => 2,
            Self::Read => 3,
        }
    }

    /// Whether the server has acknowledged the message.
    pub fn is_acknowledged(&self) -> bool {
        self.rank() > 0
    }

    /// Combine a stored status with an incoming one without ever regressing.
    ///
    /// Once acknowledged, a message only moves up the
    /// SENT < DELIVERED < READ ladder. Before that, the incoming local state
    /// wins so a failed send can be retried (ERROR -> SENDING) and a pending
    /// send can fail (SENDING -> ERROR).
    pub fn merge(self, incoming: Self) -> Self {
        if self.is_acknowledged() || incoming.is_acknowledged() {
            if incoming.rank() > self.rank() {
                incoming
            } else {
                self
            }
        } else {
            incoming
        }
    }
}

impl std::fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ContentType {
    Text,
    Encrypted,
    AttachmentOnly,
}

impl ContentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Encrypted => "encrypted",
            Self::AttachmentOnly => "attachment_only",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "text" => Some(Self::Text),
            "encrypted" => Some(Self::Encrypted),
            "attachment_only" => Some(Self::AttachmentOnly),
            _ => None,
        }
    }
}

/// A single chat message. Content is immutable; `status` and the
/// acknowledgment fields follow the send lifecycle.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    pub id: MessageId,
    /// Client id of the draft this row was written from. Kept after
    /// promotion; `None` for messages authored elsewhere.
    pub local_temp_id: Option<MessageId>,
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    /// Client clock, used for optimistic ordering of pending rows.
    pub created_at: DateTime<Utc>,
    /// Server-assigned sequence; authoritative ordering once present.
    pub message_seq: Option<i64>,
    pub server_ack_at: Option<DateTime<Utc>>,
    pub body: String,
    pub content_type: ContentType,
    pub ciphertext: Option<OpaqueBlob>,
    pub attachments: Vec<AttachmentRef>,
    pub reply_to_message_id: Option<MessageId>,
    pub thread_root_id: Option<MessageId>,
    pub status: MessageStatus,
    pub edited_at: Option<DateTime<Utc>>,
    pub deleted_for_all_at: Option<DateTime<Utc>>,
    pub metadata: BTreeMap<String, String>,
}

impl Message {
    /// Build the optimistic SENDING row for an outgoing draft.
    pub fn pending_from_draft(draft: &MessageDraft) -> Self {
        Self {
            id: draft.local_id.clone(),
            local_temp_id: Some(draft.local_id.clone()),
            conversation_id: draft.conversation_id.clone(),
            sender_id: draft.sender_id.clone(),
            created_at: draft.created_at,
            message_seq: None,
            server_ack_at: None,
            body: draft.body.clone(),
            content_type: draft.content_type,
            ciphertext: draft.ciphertext.clone(),
            attachments: draft.attachments.clone(),
            reply_to_message_id: draft.reply_to_message_id.clone(),
            thread_root_id: draft.thread_root_id.clone(),
            status: MessageStatus::Sending,
            edited_at: None,
            deleted_for_all_at: None,
            metadata: draft.metadata.clone(),
        }
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted_for_all_at.is_some()
    }

    /// Short text used for conversation list previews.
    pub fn preview(&self) -> String {
        match self.content_type {
            ContentType::Text => self.body.clone(),
            ContentType::Encrypted => "[encrypted message]".to_string(),
            ContentType::AttachmentOnly => match self.attachments.len() {
                1 => "[attachment]".to_string(),
                n => format!("[{n} attachments]"),
            },
        }
    }
}

/// A not-yet-persisted outgoing message as supplied by a caller.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MessageDraft {
    /// Client-generated id; reused on resend so the row is updated in place.
    pub local_id: MessageId,
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    pub body: String,
    pub content_type: ContentType,
    pub ciphertext: Option<OpaqueBlob>,
    pub attachments: Vec<AttachmentRef>,
    pub reply_to_message_id: Option<MessageId>,
    pub thread_root_id: Option<MessageId>,
    pub metadata: BTreeMap<String, String>,
    pub created_at: DateTime<Utc>,
}

impl MessageDraft {
    /// Plain text draft with a fresh local id.
    pub fn text(conversation_id: ConversationId, sender_id: UserId, body: impl Into<String>) -> Self {
        Self {
            local_id: MessageId::new_local(),
            conversation_id,
            sender_id,
            body: body.into(),
            content_type: ContentType::Text,
            ciphertext: None,
            attachments: Vec::new(),
            reply_to_message_id: None,
            thread_root_id: None,
            metadata: BTreeMap::new(),
            created_at: Utc::now(),
        }
    }
}

// ---------------------------------------------------------------------------
// Participant
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ParticipantRole {
    Owner,
    Admin,
    Member,
}

impl ParticipantRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Owner => "owner",
            Self::Admin => "admin",
            Self::Member => "member",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "owner" => Some(Self::Owner),
            "admin" => Some(Self::Admin),
            "member" => Some(Self::Member),
            _ => None,
        }
    }
}

/// Per-(conversation, user) mutable state.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Participant {
    pub conversation_id: ConversationId,
    pub user_id: UserId,
    pub role: ParticipantRole,
    pub joined_at: DateTime<Utc>,
    pub left_at: Option<DateTime<Utc>>,
    pub mute_until: Option<DateTime<Utc>>,
    pub archived: bool,
    pub pinned: bool,
    pub pinned_at: Option<DateTime<Utc>>,
    pub last_read_at: Option<DateTime<Utc>>,
    pub last_read_seq: Option<i64>,
    pub settings: BTreeMap<String, String>,
}

impl Participant {
    pub fn new(conversation_id: ConversationId, user_id: UserId, joined_at: DateTime<Utc>) -> Self {
        Self {
            conversation_id,
            user_id,
            role: ParticipantRole::Member,
            joined_at,
            left_at: None,
            mute_until: None,
            archived: false,
            pinned: false,
            pinned_at: None,
            last_read_at: None,
            last_read_seq: None,
            settings: BTreeMap::new(),
        }
    }

    pub fn is_muted(&self, now: DateTime<Utc>) -> bool {
        self.mute_until.is_some_and(|until| until > now)
    }
}

// ---------------------------------------------------------------------------
// ConversationSummary
// ---------------------------------------------------------------------------

/// Materialized view of one conversation for a given user. Never stored.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConversationSummary {
    pub conversation_id: ConversationId,
    pub display_name: String,
    pub last_message_id: Option<MessageId>,
    pub last_message_preview: Option<String>,
    /// `max(created_at)` over non-deleted messages.
    pub last_activity_at: Option<DateTime<Utc>>,
    pub unread_count: u32,
    pub pinned: bool,
    pub muted: bool,
    pub archived: bool,
}

// ---------------------------------------------------------------------------
// Contact
// ---------------------------------------------------------------------------

/// An address-book contact. The canonical phone number is the primary key.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Contact {
    /// Device address-book identifier.
    pub id: String,
    pub name: String,
    /// Canonical `+<digits>` phone number.
    pub phone_no: String,
    pub description: Option<String>,
    pub photo: Option<String>,
    pub is_registered: bool,
    /// Account id reported by the registration lookup, if confirmed.
    pub remote_uid: Option<UserId>,
}

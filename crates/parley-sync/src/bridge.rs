//! Contract with the remote message source of truth.
//!
//! The engine never talks to a transport directly. Anything that can stream
//! events for a conversation, page through its history and accept writes can
//! back it.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};

use parley_shared::{ConversationId, MessageId, UserId};
use parley_store::{AttachmentRef, ContentType, Message, MessageDraft, MessageStatus, OpaqueBlob};

use crate::error::BridgeError;

/// Live event stream for one conversation. Ends when the remote closes the
/// channel; an `Err` item means the channel broke.
pub type RemoteEventStream = BoxStream<'static, Result<RemoteEvent, BridgeError>>;

#[async_trait::async_trait]
pub trait RemoteMessageBridge: Send + Sync {
    /// Open a live channel carrying new messages and receipts.
    async fn subscribe(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<RemoteEventStream, BridgeError>;

    /// Messages whose server time is strictly after `since`, oldest first,
    /// at most `limit` of them.
    async fn fetch_since(
        &self,
        conversation_id: &ConversationId,
        since: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<RemoteMessage>, BridgeError>;

    /// Write an outgoing message. The acknowledgment carries the server
    /// sequence number and, if the server renames messages, the server id.
    async fn write(
        &self,
        conversation_id: &ConversationId,
        draft: &MessageDraft,
    ) -> Result<WriteAck, BridgeError>;
}

/// Acknowledgment of a successful write.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteAck {
    /// Server-assigned id; `None` keeps the client-generated id.
    pub id: Option<MessageId>,
    pub seq: i64,
    pub ack_at: DateTime<Utc>,
}

/// A message as delivered by the remote.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RemoteMessage {
    pub id: MessageId,
    /// Client id echoed back for messages this device wrote.
    pub client_temp_id: Option<MessageId>,
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    pub created_at: DateTime<Utc>,
    pub seq: i64,
    /// Server acceptance time; the catch-up cursor.
    pub server_time: DateTime<Utc>,
    pub body: String,
    pub content_type: ContentType,
    pub ciphertext: Option<OpaqueBlob>,
    #[serde(default)]
    pub attachments: Vec<AttachmentRef>,
    pub reply_to_message_id: Option<MessageId>,
    pub thread_root_id: Option<MessageId>,
    /// Delivery state as known by the server.
    pub status: MessageStatus,
    pub edited_at: Option<DateTime<Utc>>,
    pub deleted_for_all_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl RemoteMessage {
    /// Convert into the local row shape. Anything carrying a sequence number
    /// is at least SENT.
    pub fn into_message(self) -> Message {
        let status = if self.status.is_acknowledged() {
            self.status
        } else {
            MessageStatus::Sent
        };
        Message {
            id: self.id,
            local_temp_id: self.client_temp_id,
            conversation_id: self.conversation_id,
            sender_id: self.sender_id,
            created_at: self.created_at,
            message_seq: Some(self.seq),
            server_ack_at: Some(self.server_time),
            body: self.body,
            content_type: self.content_type,
            ciphertext: self.ciphertext,
            attachments: self.attachments,
            reply_to_message_id: self.reply_to_message_id,
            thread_root_id: self.thread_root_id,
            status,
            edited_at: self.edited_at,
            deleted_for_all_at: self.deleted_for_all_at,
            metadata: self.metadata,
        }
    }
}

/// Receipt kinds pushed by the remote.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReceiptKind {
    Delivered,
    Read,
}

impl ReceiptKind {
    pub fn status(self) -> MessageStatus {
        match self {
            Self::Delivered => MessageStatus::Delivered,
            Self::Read => MessageStatus::Read,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RemoteEvent {
    /// A new or changed message.
    Message(RemoteMessage),
    /// Delivery progress for a message already acknowledged.
    Receipt {
        conversation_id: ConversationId,
        message_id: MessageId,
        kind: ReceiptKind,
    },
}

impl RemoteEvent {
    pub fn conversation_id(&self) -> &ConversationId {
        match self {
            Self::Message(m) => &m.conversation_id,
            Self::Receipt { conversation_id, .. } => conversation_id,
        }
    }
}

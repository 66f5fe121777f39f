//! Async handle over the synchronous [`Database`].
//!
//! One connection sits behind a tokio mutex, so every read and write is
//! serialized. Writers publish a [`StoreChange`] after committing; observers
//! re-query when they see one that concerns them.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{broadcast, Mutex};

use parley_shared::{ConversationId, MessageId, UserId};
use parley_store::{ConversationSummary, Database, Message, MessageStatus, UpsertOutcome};

use crate::error::Result;

/// What changed in the store.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StoreChange {
    Messages(ConversationId),
    Participant {
        conversation_id: ConversationId,
        user_id: UserId,
    },
    Contacts,
}

#[derive(Clone)]
pub struct LocalStore {
    db: Arc<Mutex<Database>>,
    changes: broadcast::Sender<StoreChange>,
}

impl LocalStore {
    pub fn new(db: Database, change_capacity: usize) -> Self {
        let (changes, _) = broadcast::channel(change_capacity.max(1));
        Self {
            db: Arc::new(Mutex::new(db)),
            changes,
        }
    }

    /// Receive change notifications published after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<StoreChange> {
        self.changes.subscribe()
    }

    pub fn notify(&self, change: StoreChange) {
        // No receivers is fine.
        let _ = self.changes.send(change);
    }

    /// Run `f` with exclusive access to the database.
    pub async fn with_db<T>(
        &self,
        f: impl FnOnce(&mut Database) -> parley_store::Result<T>,
    ) -> Result<T> {
        let mut db = self.db.lock().await;
        Ok(f(&mut db)?)
    }

    // ------------------------------------------------------------------
    // Messages
    // ------------------------------------------------------------------

    /// Merge one message and notify observers of its conversation if the
    /// stored row changed.
    pub async fn upsert_message(&self, message: &Message) -> Result<(UpsertOutcome, Message)> {
        let (outcome, stored) = self.with_db(|db| db.upsert_message(message)).await?;
        if outcome.changed() {
            self.notify(StoreChange::Messages(stored.conversation_id.clone()));
        }
        Ok((outcome, stored))
    }

    pub async fn apply_receipt(
        &self,
        id: &MessageId,
        status: MessageStatus,
    ) -> Result<Option<Message>> {
        let updated = self.with_db(|db| db.apply_receipt(id, status)).await?;
        if let Some(m) = &updated {
            self.notify(StoreChange::Messages(m.conversation_id.clone()));
        }
        Ok(updated)
    }

    pub async fn mark_send_failed(&self, local_id: &MessageId) -> Result<Option<Message>> {
        let failed = self.with_db(|db| db.mark_send_failed(local_id)).await?;
        if let Some(m) = &failed {
            self.notify(StoreChange::Messages(m.conversation_id.clone()));
        }
        Ok(failed)
    }

    pub async fn query_messages(
        &self,
        conversation_id: &ConversationId,
        limit: Option<u32>,
    ) -> Result<Vec<Message>> {
        self.with_db(|db| db.query_messages(conversation_id, limit))
            .await
    }

    pub async fn find_message(&self, id: &MessageId) -> Result<Option<Message>> {
        self.with_db(|db| match db.message_by_id(id) {
            Ok(m) => Ok(Some(m)),
            Err(parley_store::StoreError::NotFound) => Ok(None),
            Err(e) => Err(e),
        })
        .await
    }

    /// The row written from the draft with this local id, before or after
    /// promotion.
    pub async fn find_by_local_id(&self, local_id: &MessageId) -> Result<Option<Message>> {
        self.with_db(|db| db.find_by_local_id(local_id)).await
    }

    pub async fn max_message_seq(&self, conversation_id: &ConversationId) -> Result<Option<i64>> {
        self.with_db(|db| db.max_message_seq(conversation_id)).await
    }

    // ------------------------------------------------------------------
    // Summaries
    // ------------------------------------------------------------------

    pub async fn conversation_summaries(
        &self,
        user_id: &UserId,
        now: DateTime<Utc>,
    ) -> Result<Vec<ConversationSummary>> {
        self.with_db(|db| db.conversation_summaries(user_id, now))
            .await
    }

    pub async fn next_mute_expiry(
        &self,
        user_id: &UserId,
        now: DateTime<Utc>,
    ) -> Result<Option<DateTime<Utc>>> {
        self.with_db(|db| db.next_mute_expiry(user_id, now)).await
    }
}

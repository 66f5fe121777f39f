//! Async facade over per-(conversation, user) participant state.
//!
//! Every setter publishes [`StoreChange::Participant`] so summary observers
//! pick up pin, mute, archive and read-cursor changes.

use chrono::{DateTime, Utc};

use parley_shared::{ConversationId, UserId};
use parley_store::{Participant, ParticipantRole};

use crate::error::Result;
use crate::store::{LocalStore, StoreChange};

#[derive(Clone)]
pub struct ParticipantStateStore {
    store: LocalStore,
}

impl ParticipantStateStore {
    pub fn new(store: LocalStore) -> Self {
        Self { store }
    }

    pub async fn get(
        &self,
        conversation_id: &ConversationId,
        user_id: &UserId,
    ) -> Result<Option<Participant>> {
        self.store
            .with_db(|db| db.get_participant(conversation_id, user_id))
            .await
    }

    pub async fn for_user(&self, user_id: &UserId) -> Result<Vec<Participant>> {
        self.store
            .with_db(|db| db.participants_for_user(user_id))
            .await
    }

    pub async fn ensure(
        &self,
        conversation_id: &ConversationId,
        user_id: &UserId,
        role: ParticipantRole,
    ) -> Result<Participant> {
        let now = Utc::now();
        let participant = self
            .store
            .with_db(|db| db.ensure_participant(conversation_id, user_id, role, now))
            .await?;
        self.changed(conversation_id, user_id);
        Ok(participant)
    }

    pub async fn set_pinned(
        &self,
        conversation_id: &ConversationId,
        user_id: &UserId,
        pinned: bool,
    ) -> Result<Participant> {
        let now = Utc::now();
        let participant = self
            .store
            .with_db(|db| db.set_pinned(conversation_id, user_id, pinned, now))
            .await?;
        tracing::debug!(conversation = %conversation_id, pinned, "pin state updated");
        self.changed(conversation_id, user_id);
        Ok(participant)
    }

    pub async fn set_muted_until(
        &self,
        conversation_id: &ConversationId,
        user_id: &UserId,
        until: Option<DateTime<Utc>>,
    ) -> Result<Participant> {
        let now = Utc::now();
        let participant = self
            .store
            .with_db(|db| db.set_muted_until(conversation_id, user_id, until, now))
            .await?;
        self.changed(conversation_id, user_id);
        Ok(participant)
    }

    pub async fn set_archived(
        &self,
        conversation_id: &ConversationId,
        user_id: &UserId,
        archived: bool,
    ) -> Result<Participant> {
        let now = Utc::now();
        let participant = self
            .store
            .with_db(|db| db.set_archived(conversation_id, user_id, archived, now))
            .await?;
        self.changed(conversation_id, user_id);
        Ok(participant)
    }

    /// Move the read cursor forward to `seq`. Never regresses.
    pub async fn mark_read(
        &self,
        conversation_id: &ConversationId,
        user_id: &UserId,
        seq: Option<i64>,
    ) -> Result<Participant> {
        let now = Utc::now();
        let participant = self
            .store
            .with_db(|db| db.mark_read(conversation_id, user_id, seq, now))
            .await?;
        self.changed(conversation_id, user_id);
        Ok(participant)
    }

    pub async fn set_setting(
        &self,
        conversation_id: &ConversationId,
        user_id: &UserId,
        key: &str,
        value: Option<&str>,
    ) -> Result<Participant> {
        let now = Utc::now();
        let participant = self
            .store
            .with_db(|db| db.set_setting(conversation_id, user_id, key, value, now))
            .await?;
        self.changed(conversation_id, user_id);
        Ok(participant)
    }

    fn changed(&self, conversation_id: &ConversationId, user_id: &UserId) {
        self.store.notify(StoreChange::Participant {
            conversation_id: conversation_id.clone(),
            user_id: user_id.clone(),
        });
    }
}

//! The message sync engine.
//!
//! Owns the outgoing lifecycle (optimistic SENDING row, remote write,
//! promotion to SENT or fall back to ERROR), mirrors live remote events into
//! the local store while a conversation is observed, runs paged catch-up
//! pulls and publishes conversation summaries.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::StreamExt;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{mpsc, OwnedMutexGuard};
use tokio_util::sync::CancellationToken;

use parley_shared::{ConversationId, MessageId, UserId};
use parley_store::{
    ConversationSummary, Message, MessageDraft, MessageStatus, Participant, StoreError,
};

use crate::bridge::{RemoteEvent, RemoteMessageBridge};
use crate::config::SyncConfig;
use crate::error::{BridgeError, Result, SyncError};
use crate::live::LiveFeeds;
use crate::participants::ParticipantStateStore;
use crate::store::{LocalStore, StoreChange};
use crate::subscription::Subscription;

/// Pages buffered per observer before the producer waits.
const OBSERVER_BUFFER: usize = 16;

#[derive(Clone)]
pub struct MessageSyncEngine {
    inner: Arc<EngineInner>,
}

struct EngineInner {
    store: LocalStore,
    participants: ParticipantStateStore,
    bridge: Arc<dyn RemoteMessageBridge>,
    config: SyncConfig,
    live: Arc<LiveFeeds>,
    sends: Arc<InFlightSends>,
}

/// One lock per draft local id, held from the optimistic insert until the
/// remote write settles.
#[derive(Default)]
struct InFlightSends {
    locks: Mutex<HashMap<MessageId, Arc<tokio::sync::Mutex<()>>>>,
}

impl InFlightSends {
    /// Wait for any earlier send of the same draft to settle, then claim it.
    async fn claim(self: &Arc<Self>, local_id: &MessageId) -> SendClaim {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
            Arc::clone(locks.entry(local_id.clone()).or_default())
        };
        let guard = lock.lock_owned().await;
        SendClaim {
            sends: Arc::clone(self),
            local_id: local_id.clone(),
            _guard: guard,
        }
    }
}

struct SendClaim {
    sends: Arc<InFlightSends>,
    local_id: MessageId,
    _guard: OwnedMutexGuard<()>,
}

impl Drop for SendClaim {
    fn drop(&mut self) {
        let mut locks = self
            .sends
            .locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        // The map and this claim hold the only references when nobody waits.
        if locks
            .get(&self.local_id)
            .is_some_and(|lock| Arc::strong_count(lock) == 2)
        {
            locks.remove(&self.local_id);
        }
    }
}

impl MessageSyncEngine {
    pub fn new(store: LocalStore, bridge: Arc<dyn RemoteMessageBridge>, config: SyncConfig) -> Self {
        let participants = ParticipantStateStore::new(store.clone());
        Self {
            inner: Arc::new(EngineInner {
                store,
                participants,
                bridge,
                config,
                live: Arc::new(LiveFeeds::default()),
                sends: Arc::new(InFlightSends::default()),
            }),
        }
    }

    pub fn store(&self) -> &LocalStore {
        &self.inner.store
    }

    pub fn participants(&self) -> &ParticipantStateStore {
        &self.inner.participants
    }

    pub fn config(&self) -> &SyncConfig {
        &self.inner.config
    }

    // ------------------------------------------------------------------
    // Outgoing
    // ------------------------------------------------------------------

    /// Send a draft.
    ///
    /// The SENDING row is written before the remote call so observers show it
    /// immediately. On acknowledgment the row is promoted in place; on failure
    /// it becomes ERROR with its content intact, and calling `send` again with
    /// the same draft retries under the same local id.
    ///
    /// The remote write runs on its own task: dropping the returned future
    /// does not abandon a write that is already in flight. Concurrent sends of
    /// the same draft run one after the other, so an acknowledged draft is
    /// written once.
    pub async fn send(&self, draft: MessageDraft) -> Result<Message> {
        let claim = self.inner.sends.claim(&draft.local_id).await;

        if let Some(existing) = self.inner.store.find_by_local_id(&draft.local_id).await? {
            if existing.status.is_acknowledged() {
                tracing::debug!(
                    local_id = %draft.local_id,
                    status = %existing.status,
                    "draft already acknowledged, not resending"
                );
                return Ok(existing);
            }
        }

        let pending = Message::pending_from_draft(&draft);
        self.inner.store.upsert_message(&pending).await?;
        tracing::debug!(
            conversation = %draft.conversation_id,
            local_id = %draft.local_id,
            "optimistic message stored"
        );

        let inner = Arc::clone(&self.inner);
        let write = tokio::spawn(async move {
            let _claim = claim;
            inner.complete_send(draft).await
        });
        write.await?
    }

    // ------------------------------------------------------------------
    // Observation
    // ------------------------------------------------------------------

    /// Stream the newest `page_size` messages of a conversation (the
    /// configured page size when `None`), re-emitted whenever they change.
    ///
    /// While at least one observer of the conversation exists, a live remote
    /// channel feeds new messages and receipts into the store. Remote failures
    /// are logged and retried with backoff; the stream itself only ends when
    /// the subscription is dropped or cancelled.
    ///
    /// Must be called from within a tokio runtime.
    pub fn observe_conversation(
        &self,
        conversation_id: &ConversationId,
        page_size: Option<u32>,
    ) -> Subscription<Vec<Message>> {
        let page_size = page_size.unwrap_or(self.inner.config.page_size);
        let (tx, rx) = mpsc::channel(OBSERVER_BUFFER);
        let cancel = CancellationToken::new();

        let lease = self.inner.live.acquire(conversation_id, |feed_cancel| {
            let inner = Arc::clone(&self.inner);
            let conversation_id = conversation_id.clone();
            tokio::spawn(async move { inner.run_live_feed(conversation_id, feed_cancel).await });
        });

        let inner = Arc::clone(&self.inner);
        let conversation_id = conversation_id.clone();
        let token = cancel.clone();
        tokio::spawn(async move {
            let _lease = lease;
            inner
                .run_message_observer(conversation_id, page_size, tx, token)
                .await;
        });

        Subscription::new(rx, cancel)
    }

    /// Stream the conversation list of `user_id`, recomputed whenever
    /// messages, participant state or contacts change.
    ///
    /// Must be called from within a tokio runtime.
    pub fn observe_conversation_summaries(
        &self,
        user_id: &UserId,
    ) -> Subscription<Vec<ConversationSummary>> {
        let (tx, rx) = mpsc::channel(OBSERVER_BUFFER);
        let cancel = CancellationToken::new();

        let inner = Arc::clone(&self.inner);
        let user_id = user_id.clone();
        let token = cancel.clone();
        tokio::spawn(async move { inner.run_summary_observer(user_id, tx, token).await });

        Subscription::new(rx, cancel)
    }

    /// Whether a live remote channel is currently held for the conversation.
    pub fn is_live(&self, conversation_id: &ConversationId) -> bool {
        self.inner.live.is_live(conversation_id)
    }

    // ------------------------------------------------------------------
    // Catch-up and merge
    // ------------------------------------------------------------------

    /// Pull everything the remote accepted after `since` and merge it.
    ///
    /// Pages of `fetch_page_size` are requested, each starting after the
    /// newest server time of the previous one, until a page comes back short.
    /// Re-running with the same `since` changes nothing. A remote failure ends
    /// the pull with whatever was merged before it (nothing, if the first page
    /// failed); only local storage errors are returned as errors.
    pub async fn sync_conversation(
        &self,
        conversation_id: &ConversationId,
        since: DateTime<Utc>,
    ) -> Result<Vec<Message>> {
        let limit = self.inner.config.fetch_page_size;
        let mut cursor = since;
        let mut merged = Vec::new();

        loop {
            let page = match self.inner.bridge.fetch_since(conversation_id, cursor, limit).await {
                Ok(page) => page,
                Err(e) => {
                    log_remote_failure(conversation_id, "catch-up fetch", &e);
                    break;
                }
            };

            let full_page = page.len() >= limit as usize;
            let newest = page.iter().map(|m| m.server_time).max();
            for remote in page {
                let (_, stored) = self.inner.store.upsert_message(&remote.into_message()).await?;
                merged.push(stored);
            }

            match newest {
                Some(newest) if full_page && newest > cursor => cursor = newest,
                _ => break,
            }
        }

        tracing::debug!(
            conversation = %conversation_id,
            merged = merged.len(),
            "catch-up finished"
        );
        Ok(merged)
    }

    /// Apply one remote event to the store. Returns the affected row when
    /// something changed (for receipts) or the stored row (for messages).
    pub async fn merge_event(&self, event: RemoteEvent) -> Result<Option<Message>> {
        self.inner.merge_event(event).await
    }

    /// One-shot read of a conversation in display order.
    pub async fn conversation_messages(
        &self,
        conversation_id: &ConversationId,
        limit: Option<u32>,
    ) -> Result<Vec<Message>> {
        self.inner.store.query_messages(conversation_id, limit).await
    }

    // ------------------------------------------------------------------
    // Participant state
    // ------------------------------------------------------------------

    /// Move the user's read cursor to the newest sequenced message.
    pub async fn mark_conversation_as_read(
        &self,
        conversation_id: &ConversationId,
        user_id: &UserId,
    ) -> Result<Participant> {
        let seq = self.inner.store.max_message_seq(conversation_id).await?;
        self.inner
            .participants
            .mark_read(conversation_id, user_id, seq)
            .await
    }

    pub async fn set_conversation_pinned(
        &self,
        conversation_id: &ConversationId,
        user_id: &UserId,
        pinned: bool,
    ) -> Result<Participant> {
        self.inner
            .participants
            .set_pinned(conversation_id, user_id, pinned)
            .await
    }

    pub async fn set_conversation_muted_until(
        &self,
        conversation_id: &ConversationId,
        user_id: &UserId,
        until: Option<DateTime<Utc>>,
    ) -> Result<Participant> {
        self.inner
            .participants
            .set_muted_until(conversation_id, user_id, until)
            .await
    }

    pub async fn set_conversation_archived(
        &self,
        conversation_id: &ConversationId,
        user_id: &UserId,
        archived: bool,
    ) -> Result<Participant> {
        self.inner
            .participants
            .set_archived(conversation_id, user_id, archived)
            .await
    }

    pub async fn set_conversation_setting(
        &self,
        conversation_id: &ConversationId,
        user_id: &UserId,
        key: &str,
        value: Option<&str>,
    ) -> Result<Participant> {
        self.inner
            .participants
            .set_setting(conversation_id, user_id, key, value)
            .await
    }
}

impl EngineInner {
    async fn complete_send(&self, draft: MessageDraft) -> Result<Message> {
        match self.bridge.write(&draft.conversation_id, &draft).await {
            Ok(ack) => {
                let mut confirmed = Message::pending_from_draft(&draft);
                if let Some(id) = ack.id {
                    confirmed.id = id;
                }
                confirmed.message_seq = Some(ack.seq);
                confirmed.server_ack_at = Some(ack.ack_at);
                confirmed.status = MessageStatus::Sent;

                let (outcome, stored) = self.store.upsert_message(&confirmed).await?;
                tracing::info!(
                    conversation = %draft.conversation_id,
                    local_id = %draft.local_id,
                    message_id = %stored.id,
                    seq = ack.seq,
                    ?outcome,
                    "message acknowledged"
                );
                Ok(stored)
            }
            Err(e) => {
                tracing::warn!(
                    conversation = %draft.conversation_id,
                    local_id = %draft.local_id,
                    error = %e,
                    "message write failed"
                );
                if let Some(failed) = self.store.mark_send_failed(&draft.local_id).await? {
                    return Ok(failed);
                }
                // The server echo promoted the row before the write reported.
                let stored = self
                    .store
                    .find_by_local_id(&draft.local_id)
                    .await?
                    .ok_or(SyncError::Store(StoreError::NotFound))?;
                tracing::info!(
                    local_id = %draft.local_id,
                    message_id = %stored.id,
                    status = %stored.status,
                    "write failed after the server accepted the message"
                );
                Ok(stored)
            }
        }
    }

    async fn merge_event(&self, event: RemoteEvent) -> Result<Option<Message>> {
        match event {
            RemoteEvent::Message(remote) => {
                let (outcome, stored) = self.store.upsert_message(&remote.into_message()).await?;
                tracing::trace!(message_id = %stored.id, ?outcome, "remote message merged");
                Ok(Some(stored))
            }
            RemoteEvent::Receipt {
                message_id, kind, ..
            } => self.store.apply_receipt(&message_id, kind.status()).await,
        }
    }

    /// Hold a live remote channel open until `cancel` fires, reconnecting with
    /// exponential backoff.
    async fn run_live_feed(&self, conversation_id: ConversationId, cancel: CancellationToken) {
        let initial = self.config.live_backoff_initial;
        let mut backoff = initial;

        loop {
            let subscribed = tokio::select! {
                _ = cancel.cancelled() => break,
                subscribed = self.bridge.subscribe(&conversation_id) => subscribed,
            };

            match subscribed {
                Ok(mut events) => {
                    tracing::debug!(conversation = %conversation_id, "live channel open");
                    backoff = initial;
                    loop {
                        let next = tokio::select! {
                            _ = cancel.cancelled() => return,
                            next = events.next() => next,
                        };
                        match next {
                            Some(Ok(event)) => {
                                if let Err(e) = self.merge_event(event).await {
                                    tracing::error!(
                                        conversation = %conversation_id,
                                        error = %e,
                                        "failed to store live event"
                                    );
                                }
                            }
                            Some(Err(e)) => {
                                log_remote_failure(&conversation_id, "live channel", &e);
                                break;
                            }
                            None => {
                                tracing::debug!(conversation = %conversation_id, "live channel closed by remote");
                                break;
                            }
                        }
                    }
                }
                Err(BridgeError::NotFound(reason)) => {
                    tracing::info!(
                        conversation = %conversation_id,
                        %reason,
                        "conversation gone remotely, live feed stopped"
                    );
                    break;
                }
                Err(e) => log_remote_failure(&conversation_id, "live subscribe", &e),
            }

            tracing::debug!(
                conversation = %conversation_id,
                delay_ms = backoff.as_millis() as u64,
                "reconnecting live channel"
            );
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(backoff) => {}
            }
            backoff = (backoff * 2).min(self.config.live_backoff_max);
        }

        tracing::debug!(conversation = %conversation_id, "live feed stopped");
    }

    async fn run_message_observer(
        &self,
        conversation_id: ConversationId,
        page_size: u32,
        tx: mpsc::Sender<Vec<Message>>,
        cancel: CancellationToken,
    ) {
        // Subscribe before the first read so no change slips in between.
        let mut changes = self.store.subscribe();
        let mut last: Option<Vec<Message>> = None;

        let mut dirty = true;
        loop {
            if dirty {
                match self.store.query_messages(&conversation_id, Some(page_size)).await {
                    Ok(page) if last.as_ref() != Some(&page) => {
                        if tx.send(page.clone()).await.is_err() {
                            break;
                        }
                        last = Some(page);
                    }
                    Ok(_) => {}
                    Err(e) => tracing::error!(
                        conversation = %conversation_id,
                        error = %e,
                        "failed to read messages for observer"
                    ),
                }
            }

            let change = tokio::select! {
                _ = cancel.cancelled() => break,
                change = changes.recv() => change,
            };
            dirty = match change {
                Ok(StoreChange::Messages(changed)) => changed == conversation_id,
                Ok(_) => false,
                Err(RecvError::Lagged(skipped)) => {
                    tracing::debug!(conversation = %conversation_id, skipped, "observer lagged, re-reading");
                    true
                }
                Err(RecvError::Closed) => break,
            };
        }
    }

    async fn run_summary_observer(
        &self,
        user_id: UserId,
        tx: mpsc::Sender<Vec<ConversationSummary>>,
        cancel: CancellationToken,
    ) {
        let mut changes = self.store.subscribe();
        let mut last: Option<Vec<ConversationSummary>> = None;
        let mut mute_expiry: Option<DateTime<Utc>> = None;

        let mut dirty = true;
        loop {
            if dirty {
                let now = Utc::now();
                match self.store.conversation_summaries(&user_id, now).await {
                    Ok(summaries) if last.as_ref() != Some(&summaries) => {
                        if tx.send(summaries.clone()).await.is_err() {
                            break;
                        }
                        last = Some(summaries);
                    }
                    Ok(_) => {}
                    Err(e) => tracing::error!(user = %user_id, error = %e, "failed to compute summaries"),
                }
                mute_expiry = match self.store.next_mute_expiry(&user_id, now).await {
                    Ok(expiry) => expiry,
                    Err(e) => {
                        tracing::error!(user = %user_id, error = %e, "failed to read mute expiry");
                        None
                    }
                };
            }

            // A mute running out changes `muted` without any store write.
            let wake = mute_expiry.map(|at| (at - Utc::now()).to_std().unwrap_or_default());
            let change = tokio::select! {
                _ = cancel.cancelled() => break,
                _ = sleep_or_forever(wake) => {
                    dirty = true;
                    continue;
                }
                change = changes.recv() => change,
            };
            dirty = match change {
                Ok(StoreChange::Participant { user_id: changed, .. }) => changed == user_id,
                Ok(StoreChange::Messages(_) | StoreChange::Contacts) => true,
                Err(RecvError::Lagged(_)) => true,
                Err(RecvError::Closed) => break,
            };
        }
    }
}

async fn sleep_or_forever(delay: Option<Duration>) {
    match delay {
        Some(delay) => tokio::time::sleep(delay).await,
        None => std::future::pending().await,
    }
}

fn log_remote_failure(conversation_id: &ConversationId, operation: &str, error: &BridgeError) {
    if error.is_transient() {
        tracing::warn!(conversation = %conversation_id, operation, error = %error, "remote call failed");
    } else {
        tracing::error!(conversation = %conversation_id, operation, error = %error, "remote call rejected");
    }
}

#[cfg(test)]
mod tests {
    use std::future::Future;
    use std::time::Duration;

    use parley_shared::MessageId;
    use parley_store::Database;

    use super::*;
    use crate::bridge::{ReceiptKind, RemoteMessage, WriteAck};
    use crate::memory::{text_message, InMemoryMessageBridge};

    const WAIT: Duration = Duration::from_secs(5);

    fn test_config() -> SyncConfig {
        SyncConfig {
            live_backoff_initial: Duration::from_millis(10),
            live_backoff_max: Duration::from_millis(40),
            ..SyncConfig::default()
        }
    }

    fn engine_with(config: SyncConfig) -> (MessageSyncEngine, InMemoryMessageBridge) {
        let store = LocalStore::new(Database::open_in_memory().unwrap(), 64);
        let bridge = InMemoryMessageBridge::new();
        let engine = MessageSyncEngine::new(store, Arc::new(bridge.clone()), config);
        (engine, bridge)
    }

    fn engine() -> (MessageSyncEngine, InMemoryMessageBridge) {
        engine_with(test_config())
    }

    fn t0() -> DateTime<Utc> {
        DateTime::from_timestamp_millis(1_700_000_000_000).unwrap()
    }

    fn draft(conv: &str, local_id: &str, body: &str) -> MessageDraft {
        MessageDraft {
            local_id: MessageId::from(local_id),
            ..MessageDraft::text(ConversationId::from(conv), UserId::from("me"), body)
        }
    }

    async fn next_where<T>(sub: &mut Subscription<T>, pred: impl Fn(&T) -> bool) -> T {
        tokio::time::timeout(WAIT, async {
            loop {
                let item = sub.next().await.expect("subscription ended");
                if pred(&item) {
                    return item;
                }
            }
        })
        .await
        .expect("timed out waiting for a matching item")
    }

    async fn eventually<F, Fut>(check: F)
    where
        F: Fn() -> Fut,
        Fut: Future<Output = bool>,
    {
        tokio::time::timeout(WAIT, async {
            while !check().await {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition never became true");
    }

    #[tokio::test]
    async fn test_send_promotes_pending_row_in_place() {
        let (engine, bridge) = engine();
        let conv = ConversationId::from("c1");
        bridge
            .script_ack(WriteAck {
                id: Some(MessageId::from("s1")),
                seq: 7,
                ack_at: t0(),
            })
            .await;

        let sent = engine.send(draft("c1", "t1", "hello")).await.unwrap();
        assert_eq!(sent.id, MessageId::from("s1"));
        assert_eq!(sent.message_seq, Some(7));
        assert_eq!(sent.status, MessageStatus::Sent);
        assert_eq!(sent.server_ack_at, Some(t0()));

        let rows = engine.conversation_messages(&conv, None).await.unwrap();
        assert_eq!(rows, vec![sent.clone()]);
        let with_local_id: Vec<_> = rows
            .iter()
            .filter(|m| m.local_temp_id == Some(MessageId::from("t1")))
            .collect();
        assert_eq!(with_local_id, vec![&sent]);
    }

    #[tokio::test]
    async fn test_resend_after_server_assigned_id_is_not_written_twice() {
        let (engine, bridge) = engine();
        let conv = ConversationId::from("c1");
        bridge
            .script_ack(WriteAck {
                id: Some(MessageId::from("s1")),
                seq: 7,
                ack_at: t0(),
            })
            .await;

        let first = engine.send(draft("c1", "t1", "hi")).await.unwrap();
        let again = engine.send(draft("c1", "t1", "hi")).await.unwrap();

        assert_eq!(first, again);
        assert_eq!(again.id, MessageId::from("s1"));
        assert_eq!(bridge.write_calls().await, 1);
        let rows = engine.conversation_messages(&conv, None).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].local_temp_id, Some(MessageId::from("t1")));
    }

    #[tokio::test]
    async fn test_write_error_after_echo_returns_promoted_row() {
        let (engine, bridge) = engine();
        let conv = ConversationId::from("c1");
        let me = UserId::from("me");
        bridge.set_write_delay(Some(Duration::from_millis(100))).await;
        bridge.fail_next_writes(1).await;

        let sender = engine.clone();
        let sending = tokio::spawn(async move { sender.send(draft("c1", "t1", "hello")).await });
        eventually(|| async { bridge.write_calls().await == 1 }).await;

        // The server committed and echoed before the write timed out.
        let echo = RemoteMessage {
            id: MessageId::from("s1"),
            client_temp_id: Some(MessageId::from("t1")),
            ..text_message(&conv, &me, "hello", 1, t0())
        };
        engine.merge_event(RemoteEvent::Message(echo)).await.unwrap();

        let result = sending.await.unwrap().unwrap();
        assert_eq!(result.id, MessageId::from("s1"));
        assert_eq!(result.status, MessageStatus::Sent);

        let again = engine.send(draft("c1", "t1", "hello")).await.unwrap();
        assert_eq!(again, result);
        assert_eq!(bridge.write_calls().await, 1);
        assert_eq!(engine.conversation_messages(&conv, None).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_sends_of_one_draft_write_once() {
        let (engine, bridge) = engine();
        let conv = ConversationId::from("c1");
        bridge.set_assign_ids(true).await;
        bridge.set_write_delay(Some(Duration::from_millis(50))).await;

        let (a, b) = tokio::join!(
            engine.send(draft("c1", "t1", "hello")),
            engine.send(draft("c1", "t1", "hello")),
        );
        let (a, b) = (a.unwrap(), b.unwrap());

        assert_eq!(a, b);
        assert_eq!(a.status, MessageStatus::Sent);
        assert_eq!(bridge.write_calls().await, 1);
        assert_eq!(engine.conversation_messages(&conv, None).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_failed_send_keeps_body_and_resend_updates_row() {
        let (engine, bridge) = engine();
        let conv = ConversationId::from("c1");
        bridge.fail_next_writes(1).await;

        let failed = engine.send(draft("c1", "t1", "hello")).await.unwrap();
        assert_eq!(failed.status, MessageStatus::Error);
        assert_eq!(failed.body, "hello");
        assert_eq!(failed.message_seq, None);

        let sent = engine.send(draft("c1", "t1", "hello")).await.unwrap();
        assert_eq!(sent.status, MessageStatus::Sent);
        assert_eq!(sent.id, MessageId::from("t1"));

        let rows = engine.conversation_messages(&conv, None).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(bridge.write_calls().await, 2);
    }

    #[tokio::test]
    async fn test_resend_of_acknowledged_draft_is_not_written_twice() {
        let (engine, bridge) = engine();
        let first = engine.send(draft("c1", "t1", "hello")).await.unwrap();
        let again = engine.send(draft("c1", "t1", "hello")).await.unwrap();

        assert_eq!(first, again);
        assert_eq!(bridge.write_calls().await, 1);
    }

    #[tokio::test]
    async fn test_send_completes_after_caller_is_dropped() {
        let (engine, bridge) = engine();
        let conv = ConversationId::from("c1");
        bridge.set_write_delay(Some(Duration::from_millis(100))).await;

        let sender = engine.clone();
        let caller = tokio::spawn(async move { sender.send(draft("c1", "t1", "hello")).await });
        eventually(|| async { bridge.write_calls().await == 1 }).await;
        caller.abort();

        eventually(|| async {
            let rows = engine.conversation_messages(&conv, None).await.unwrap();
            rows.len() == 1 && rows[0].status == MessageStatus::Sent
        })
        .await;
    }

    #[tokio::test]
    async fn test_echo_before_ack_collapses_into_one_row() {
        let (engine, bridge) = engine();
        let conv = ConversationId::from("c1");
        bridge.set_echo_writes(true).await;
        bridge.set_assign_ids(true).await;

        let mut observer = engine.observe_conversation(&conv, None);
        eventually(|| async { bridge.live_subscribers(&conv).await == 1 }).await;

        engine.send(draft("c1", "t1", "hello")).await.unwrap();
        let page = next_where(&mut observer, |page| {
            page.len() == 1 && page[0].status == MessageStatus::Sent
        })
        .await;
        assert_eq!(page[0].id, MessageId::from("srv-c1-1"));

        // Let the live feed drain the echo, then check nothing duplicated.
        tokio::time::sleep(Duration::from_millis(50)).await;
        let rows = engine.conversation_messages(&conv, None).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].local_temp_id, Some(MessageId::from("t1")));
    }

    #[tokio::test]
    async fn test_observer_replays_local_page_then_mirrors_live_messages() {
        let (engine, bridge) = engine();
        let conv = ConversationId::from("c1");
        engine.send(draft("c1", "t1", "first")).await.unwrap();

        let mut observer = engine.observe_conversation(&conv, None);
        let initial = next_where(&mut observer, |_| true).await;
        assert_eq!(initial.len(), 1);
        assert_eq!(initial[0].body, "first");

        eventually(|| async { bridge.live_subscribers(&conv).await == 1 }).await;
        bridge.incoming(&conv, &UserId::from("ada"), "second").await;

        let page = next_where(&mut observer, |page| page.len() == 2).await;
        let bodies: Vec<&str> = page.iter().map(|m| m.body.as_str()).collect();
        assert_eq!(bodies, vec!["first", "second"]);
        assert_eq!(page[1].message_seq, Some(2));
    }

    #[tokio::test]
    async fn test_pending_rows_sort_after_sequenced_rows() {
        let (engine, bridge) = engine();
        let conv = ConversationId::from("c1");
        bridge.fail_next_writes(1).await;
        engine.send(draft("c1", "t1", "stuck")).await.unwrap();
        engine
            .merge_event(RemoteEvent::Message(text_message(
                &conv,
                &UserId::from("ada"),
                "remote",
                3,
                t0(),
            )))
            .await
            .unwrap();

        let rows = engine.conversation_messages(&conv, None).await.unwrap();
        let bodies: Vec<&str> = rows.iter().map(|m| m.body.as_str()).collect();
        assert_eq!(bodies, vec!["remote", "stuck"]);
    }

    #[tokio::test]
    async fn test_live_feed_reconnects_after_failures() {
        let (engine, bridge) = engine();
        let conv = ConversationId::from("c1");
        bridge.fail_next_subscribes(2).await;

        let mut observer = engine.observe_conversation(&conv, None);
        eventually(|| async { bridge.live_subscribers(&conv).await == 1 }).await;
        assert_eq!(bridge.subscribe_calls().await, 3);

        bridge.disconnect(&conv).await;
        eventually(|| async { bridge.live_subscribers(&conv).await == 1 }).await;

        bridge.incoming(&conv, &UserId::from("ada"), "after reconnect").await;
        let page = next_where(&mut observer, |page| !page.is_empty()).await;
        assert_eq!(page[0].body, "after reconnect");
    }

    #[tokio::test]
    async fn test_live_feed_is_shared_and_closed_with_last_observer() {
        let (engine, bridge) = engine();
        let conv = ConversationId::from("c1");

        let first = engine.observe_conversation(&conv, None);
        let second = engine.observe_conversation(&conv, Some(10));
        eventually(|| async { bridge.live_subscribers(&conv).await == 1 }).await;
        assert_eq!(bridge.subscribe_calls().await, 1);

        drop(first);
        assert!(engine.is_live(&conv));

        drop(second);
        eventually(|| async { bridge.live_subscribers(&conv).await == 0 }).await;
        assert!(!engine.is_live(&conv));
    }

    #[tokio::test]
    async fn test_catch_up_is_paged_and_idempotent() {
        let (engine, bridge) = engine_with(SyncConfig {
            fetch_page_size: 2,
            ..test_config()
        });
        let conv = ConversationId::from("c1");
        let ada = UserId::from("ada");
        for seq in 1..=3 {
            let at = t0() + chrono::Duration::seconds(seq);
            bridge
                .deliver(text_message(&conv, &ada, &format!("m{seq}"), seq, at))
                .await;
        }

        let merged = engine.sync_conversation(&conv, t0()).await.unwrap();
        assert_eq!(merged.len(), 3);
        assert_eq!(bridge.fetch_calls().await, 2);
        let before = engine.conversation_messages(&conv, None).await.unwrap();

        engine.sync_conversation(&conv, t0()).await.unwrap();
        let after = engine.conversation_messages(&conv, None).await.unwrap();
        assert_eq!(before, after);
        assert_eq!(after.len(), 3);
    }

    #[tokio::test]
    async fn test_catch_up_failure_is_an_empty_batch() {
        let (engine, bridge) = engine();
        let conv = ConversationId::from("c1");
        bridge
            .deliver(text_message(&conv, &UserId::from("ada"), "m1", 1, t0()))
            .await;
        bridge.fail_next_fetches(1).await;

        let merged = engine
            .sync_conversation(&conv, t0() - chrono::Duration::seconds(1))
            .await
            .unwrap();
        assert!(merged.is_empty());
        assert!(engine
            .conversation_messages(&conv, None)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_receipts_never_lower_status() {
        let (engine, _) = engine();
        let conv = ConversationId::from("c1");
        let message = text_message(&conv, &UserId::from("me"), "hi", 1, t0());
        let id = message.id.clone();
        engine
            .merge_event(RemoteEvent::Message(message.clone()))
            .await
            .unwrap();

        let receipt = |kind| RemoteEvent::Receipt {
            conversation_id: conv.clone(),
            message_id: id.clone(),
            kind,
        };
        let read = engine.merge_event(receipt(ReceiptKind::Read)).await.unwrap();
        assert_eq!(read.map(|m| m.status), Some(MessageStatus::Read));

        assert!(engine
            .merge_event(receipt(ReceiptKind::Delivered))
            .await
            .unwrap()
            .is_none());
        engine.merge_event(RemoteEvent::Message(message)).await.unwrap();

        let rows = engine.conversation_messages(&conv, None).await.unwrap();
        assert_eq!(rows[0].status, MessageStatus::Read);
    }

    #[tokio::test]
    async fn test_summaries_follow_reads_and_pins() {
        let (engine, _) = engine();
        let me = UserId::from("me");
        let ada = UserId::from("ada");
        let older = ConversationId::from("older");
        let newer = ConversationId::from("newer");
        for (conv, at) in [(&older, t0()), (&newer, t0() + chrono::Duration::minutes(1))] {
            engine
                .merge_event(RemoteEvent::Message(text_message(conv, &ada, "hey", 1, at)))
                .await
                .unwrap();
        }

        let mut summaries = engine.observe_conversation_summaries(&me);
        let first = next_where(&mut summaries, |s| s.len() == 2).await;
        assert_eq!(first[0].conversation_id, newer);
        assert!(first.iter().all(|s| s.unread_count == 1));

        engine.mark_conversation_as_read(&older, &me).await.unwrap();
        let read = next_where(&mut summaries, |s| {
            s.iter().any(|c| c.conversation_id == older && c.unread_count == 0)
        })
        .await;
        assert_eq!(read[0].conversation_id, newer);

        engine.set_conversation_pinned(&older, &me, true).await.unwrap();
        let pinned = next_where(&mut summaries, |s| s[0].conversation_id == older).await;
        assert!(pinned[0].pinned);
    }

    #[tokio::test]
    async fn test_summaries_unmute_when_mute_expires() {
        let (engine, _) = engine();
        let me = UserId::from("me");
        let conv = ConversationId::from("c1");
        let until = Utc::now() + chrono::Duration::milliseconds(500);
        engine
            .set_conversation_muted_until(&conv, &me, Some(until))
            .await
            .unwrap();

        let mut summaries = engine.observe_conversation_summaries(&me);
        let muted = next_where(&mut summaries, |s| s.len() == 1).await;
        assert!(muted[0].muted);

        let unmuted = next_where(&mut summaries, |s| s.len() == 1 && !s[0].muted).await;
        assert_eq!(unmuted[0].conversation_id, conv);
        assert!(Utc::now() >= until);
    }
}

//! In-memory bridges for tests, demos and offline development.
//!
//! [`InMemoryMessageBridge`] behaves like a single-node server: it assigns
//! per-conversation sequence numbers, keeps a message log, fans live events
//! out to subscribers and can be scripted to fail. [`InMemoryLookup`] is a
//! registration directory backed by a map.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::StreamExt;
use tokio::sync::{broadcast, Mutex};

use parley_shared::{ConversationId, MessageId, UserId};
use parley_store::{ContentType, MessageDraft, MessageStatus};

use crate::bridge::{
    ReceiptKind, RemoteEvent, RemoteEventStream, RemoteMessage, RemoteMessageBridge, WriteAck,
};
use crate::error::BridgeError;
use crate::lookup::{LookupResult, RegistrationLookupBridge};

const FEED_CAPACITY: usize = 64;

// ---------------------------------------------------------------------------
// Messages
// ---------------------------------------------------------------------------

#[derive(Clone, Default)]
pub struct InMemoryMessageBridge {
    state: Arc<Mutex<BridgeState>>,
}

#[derive(Default)]
struct BridgeState {
    log: Vec<RemoteMessage>,
    next_seq: HashMap<ConversationId, i64>,
    feeds: HashMap<ConversationId, broadcast::Sender<RemoteEvent>>,
    scripted_acks: VecDeque<WriteAck>,
    fail_writes: usize,
    fail_subscribes: usize,
    fail_fetches: usize,
    echo_writes: bool,
    assign_ids: bool,
    write_delay: Option<Duration>,
    write_calls: usize,
    subscribe_calls: usize,
    fetch_calls: usize,
}

impl BridgeState {
    fn take_seq(&mut self, conversation_id: &ConversationId) -> i64 {
        let next = self.next_seq.entry(conversation_id.clone()).or_insert(1);
        let seq = *next;
        *next += 1;
        seq
    }

    fn reserve_seq(&mut self, conversation_id: &ConversationId, seq: i64) {
        let next = self.next_seq.entry(conversation_id.clone()).or_insert(1);
        *next = (*next).max(seq + 1);
    }

    fn record(&mut self, message: RemoteMessage) {
        self.reserve_seq(&message.conversation_id, message.seq);
        self.log.retain(|m| m.id != message.id);
        self.log.push(message);
    }

    fn publish(&self, event: RemoteEvent) {
        if let Some(tx) = self.feeds.get(event.conversation_id()) {
            let _ = tx.send(event);
        }
    }
}

impl InMemoryMessageBridge {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a message server-side and push it to live subscribers.
    pub async fn deliver(&self, message: RemoteMessage) {
        let mut state = self.state.lock().await;
        state.record(message.clone());
        state.publish(RemoteEvent::Message(message));
    }

    /// Simulate another user posting a text message now.
    pub async fn incoming(
        &self,
        conversation_id: &ConversationId,
        sender_id: &UserId,
        body: &str,
    ) -> RemoteMessage {
        let mut state = self.state.lock().await;
        let seq = state.take_seq(conversation_id);
        let now = Utc::now();
        let message = text_message(conversation_id, sender_id, body, seq, now);
        state.record(message.clone());
        state.publish(RemoteEvent::Message(message.clone()));
        message
    }

    pub async fn push_receipt(
        &self,
        conversation_id: &ConversationId,
        message_id: &MessageId,
        kind: ReceiptKind,
    ) {
        let state = self.state.lock().await;
        state.publish(RemoteEvent::Receipt {
            conversation_id: conversation_id.clone(),
            message_id: message_id.clone(),
            kind,
        });
    }

    /// Close every live channel of a conversation.
    pub async fn disconnect(&self, conversation_id: &ConversationId) {
        self.state.lock().await.feeds.remove(conversation_id);
    }

    /// Use `ack` for the next successful write instead of a generated one.
    pub async fn script_ack(&self, ack: WriteAck) {
        self.state.lock().await.scripted_acks.push_back(ack);
    }

    pub async fn fail_next_writes(&self, n: usize) {
        self.state.lock().await.fail_writes = n;
    }

    pub async fn fail_next_subscribes(&self, n: usize) {
        self.state.lock().await.fail_subscribes = n;
    }

    pub async fn fail_next_fetches(&self, n: usize) {
        self.state.lock().await.fail_fetches = n;
    }

    /// Echo accepted writes on the live channel, like a server broadcasting
    /// to every member including the author.
    pub async fn set_echo_writes(&self, echo: bool) {
        self.state.lock().await.echo_writes = echo;
    }

    /// Rename written messages to server ids instead of keeping client ids.
    pub async fn set_assign_ids(&self, assign: bool) {
        self.state.lock().await.assign_ids = assign;
    }

    pub async fn set_write_delay(&self, delay: Option<Duration>) {
        self.state.lock().await.write_delay = delay;
    }

    pub async fn write_calls(&self) -> usize {
        self.state.lock().await.write_calls
    }

    pub async fn subscribe_calls(&self) -> usize {
        self.state.lock().await.subscribe_calls
    }

    pub async fn fetch_calls(&self) -> usize {
        self.state.lock().await.fetch_calls
    }

    /// Open live channels for a conversation.
    pub async fn live_subscribers(&self, conversation_id: &ConversationId) -> usize {
        self.state
            .lock()
            .await
            .feeds
            .get(conversation_id)
            .map_or(0, |tx| tx.receiver_count())
    }

    /// Server-side log of a conversation, in sequence order.
    pub async fn messages(&self, conversation_id: &ConversationId) -> Vec<RemoteMessage> {
        let state = self.state.lock().await;
        let mut messages: Vec<_> = state
            .log
            .iter()
            .filter(|m| &m.conversation_id == conversation_id)
            .cloned()
            .collect();
        messages.sort_by_key(|m| m.seq);
        messages
    }
}

#[async_trait::async_trait]
impl RemoteMessageBridge for InMemoryMessageBridge {
    async fn subscribe(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<RemoteEventStream, BridgeError> {
        let mut state = self.state.lock().await;
        state.subscribe_calls += 1;
        if state.fail_subscribes > 0 {
            state.fail_subscribes -= 1;
            return Err(BridgeError::Network("live channel refused".into()));
        }
        let rx = state
            .feeds
            .entry(conversation_id.clone())
            .or_insert_with(|| broadcast::channel(FEED_CAPACITY).0)
            .subscribe();
        Ok(event_stream(rx))
    }

    async fn fetch_since(
        &self,
        conversation_id: &ConversationId,
        since: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<RemoteMessage>, BridgeError> {
        let mut state = self.state.lock().await;
        state.fetch_calls += 1;
        if state.fail_fetches > 0 {
            state.fail_fetches -= 1;
            return Err(BridgeError::Network("fetch timed out".into()));
        }
        let mut page: Vec<_> = state
            .log
            .iter()
            .filter(|m| &m.conversation_id == conversation_id && m.server_time > since)
            .cloned()
            .collect();
        page.sort_by(|a, b| a.server_time.cmp(&b.server_time).then(a.seq.cmp(&b.seq)));
        page.truncate(limit as usize);
        Ok(page)
    }

    async fn write(
        &self,
        conversation_id: &ConversationId,
        draft: &MessageDraft,
    ) -> Result<WriteAck, BridgeError> {
        let delay = {
            let mut state = self.state.lock().await;
            state.write_calls += 1;
            state.write_delay
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state.lock().await;
        if state.fail_writes > 0 {
            state.fail_writes -= 1;
            return Err(BridgeError::Network("write timed out".into()));
        }

        let ack = match state.scripted_acks.pop_front() {
            Some(ack) => ack,
            None => {
                let seq = state.take_seq(conversation_id);
                let id = state
                    .assign_ids
                    .then(|| MessageId(format!("srv-{conversation_id}-{seq}")));
                WriteAck {
                    id,
                    seq,
                    ack_at: Utc::now(),
                }
            }
        };

        let stored = RemoteMessage {
            id: ack.id.clone().unwrap_or_else(|| draft.local_id.clone()),
            client_temp_id: Some(draft.local_id.clone()),
            conversation_id: conversation_id.clone(),
            sender_id: draft.sender_id.clone(),
            created_at: draft.created_at,
            seq: ack.seq,
            server_time: ack.ack_at,
            body: draft.body.clone(),
            content_type: draft.content_type,
            ciphertext: draft.ciphertext.clone(),
            attachments: draft.attachments.clone(),
            reply_to_message_id: draft.reply_to_message_id.clone(),
            thread_root_id: draft.thread_root_id.clone(),
            status: MessageStatus::Sent,
            edited_at: None,
            deleted_for_all_at: None,
            metadata: draft.metadata.clone(),
        };
        state.record(stored.clone());
        if state.echo_writes {
            state.publish(RemoteEvent::Message(stored));
        }
        Ok(ack)
    }
}

fn event_stream(rx: broadcast::Receiver<RemoteEvent>) -> RemoteEventStream {
    futures::stream::unfold(rx, |mut rx| async move {
        loop {
            match rx.recv().await {
                Ok(event) => return Some((Ok(event), rx)),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "in-memory live channel lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    })
    .boxed()
}

/// A plain text message as the server would store it.
pub fn text_message(
    conversation_id: &ConversationId,
    sender_id: &UserId,
    body: &str,
    seq: i64,
    server_time: DateTime<Utc>,
) -> RemoteMessage {
    RemoteMessage {
        id: MessageId(format!("srv-{conversation_id}-{seq}")),
        client_temp_id: None,
        conversation_id: conversation_id.clone(),
        sender_id: sender_id.clone(),
        created_at: server_time,
        seq,
        server_time,
        body: body.to_string(),
        content_type: ContentType::Text,
        ciphertext: None,
        attachments: Vec::new(),
        reply_to_message_id: None,
        thread_root_id: None,
        status: MessageStatus::Sent,
        edited_at: None,
        deleted_for_all_at: None,
        metadata: Default::default(),
    }
}

// ---------------------------------------------------------------------------
// Registration lookup
// ---------------------------------------------------------------------------

#[derive(Clone, Default)]
pub struct InMemoryLookup {
    state: Arc<Mutex<LookupState>>,
}

#[derive(Default)]
struct LookupState {
    registered: HashMap<String, Option<UserId>>,
    poisoned: HashSet<String>,
    fail_calls: usize,
    calls: Vec<Vec<String>>,
}

impl InMemoryLookup {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, phone_no: &str, uid: Option<UserId>) {
        self.state
            .lock()
            .await
            .registered
            .insert(phone_no.to_string(), uid);
    }

    pub async fn unregister(&self, phone_no: &str) {
        self.state.lock().await.registered.remove(phone_no);
    }

    /// Fail every call whose batch contains `phone_no`.
    pub async fn fail_batches_with(&self, phone_no: &str) {
        self.state
            .lock()
            .await
            .poisoned
            .insert(phone_no.to_string());
    }

    pub async fn fail_next_calls(&self, n: usize) {
        self.state.lock().await.fail_calls = n;
    }

    /// Batches received so far, in call order.
    pub async fn calls(&self) -> Vec<Vec<String>> {
        self.state.lock().await.calls.clone()
    }
}

#[async_trait::async_trait]
impl RegistrationLookupBridge for InMemoryLookup {
    async fn check_many(&self, phone_numbers: &[String]) -> Result<LookupResult, BridgeError> {
        let mut state = self.state.lock().await;
        state.calls.push(phone_numbers.to_vec());

        if state.fail_calls > 0 {
            state.fail_calls -= 1;
            return Err(BridgeError::Network("lookup timed out".into()));
        }
        if phone_numbers.iter().any(|p| state.poisoned.contains(p)) {
            return Err(BridgeError::Rejected("lookup refused batch".into()));
        }

        let mut result = LookupResult::default();
        for phone in phone_numbers {
            match state.registered.get(phone) {
                Some(uid) => {
                    result.registered.push(phone.clone());
                    result.per_number.push((phone.clone(), uid.clone()));
                }
                None => result.per_number.push((phone.clone(), None)),
            }
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn writes_get_increasing_sequence_numbers() {
        let bridge = InMemoryMessageBridge::new();
        let conv = ConversationId::from("c1");
        let me = UserId::from("me");

        let first = bridge
            .write(&conv, &MessageDraft::text(conv.clone(), me.clone(), "a"))
            .await
            .unwrap();
        let second = bridge
            .write(&conv, &MessageDraft::text(conv.clone(), me.clone(), "b"))
            .await
            .unwrap();
        assert_eq!((first.seq, second.seq), (1, 2));
        assert_eq!(first.id, None);
        assert_eq!(bridge.messages(&conv).await.len(), 2);
    }

    #[tokio::test]
    async fn live_subscribers_receive_delivered_messages() {
        let bridge = InMemoryMessageBridge::new();
        let conv = ConversationId::from("c1");
        let mut events = bridge.subscribe(&conv).await.unwrap();
        assert_eq!(bridge.live_subscribers(&conv).await, 1);

        let sent = bridge.incoming(&conv, &UserId::from("ada"), "hello").await;
        let Some(Ok(RemoteEvent::Message(received))) = events.next().await else {
            panic!("expected a message event");
        };
        assert_eq!(received, sent);

        bridge.disconnect(&conv).await;
        assert!(events.next().await.is_none());
    }

    #[tokio::test]
    async fn lookup_reports_registered_numbers() {
        let lookup = InMemoryLookup::new();
        lookup.register("+1", Some(UserId::from("u1"))).await;

        let result = lookup
            .check_many(&["+1".to_string(), "+2".to_string()])
            .await
            .unwrap();
        assert_eq!(result.registered, vec!["+1".to_string()]);
        assert_eq!(result.uid_for("+1"), Some(&UserId::from("u1")));
        assert_eq!(result.uid_for("+2"), None);
    }
}

//! Reference-counted live feeds, one per conversation.
//!
//! The first observer of a conversation starts its feed; the feed is
//! cancelled when the last observer's lease is dropped.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use tokio_util::sync::CancellationToken;

use parley_shared::ConversationId;

struct Feed {
    observers: usize,
    cancel: CancellationToken,
}

#[derive(Default)]
pub(crate) struct LiveFeeds {
    feeds: Mutex<HashMap<ConversationId, Feed>>,
}

impl LiveFeeds {
    /// Register an observer. `start` runs only for the first one, with the
    /// token that will cancel the feed.
    pub(crate) fn acquire(
        self: &Arc<Self>,
        conversation_id: &ConversationId,
        start: impl FnOnce(CancellationToken),
    ) -> LiveLease {
        let mut feeds = self.feeds.lock().unwrap_or_else(PoisonError::into_inner);
        match feeds.get_mut(conversation_id) {
            Some(feed) => feed.observers += 1,
            None => {
                let cancel = CancellationToken::new();
                start(cancel.clone());
                feeds.insert(
                    conversation_id.clone(),
                    Feed {
                        observers: 1,
                        cancel,
                    },
                );
            }
        }
        LiveLease {
            feeds: Arc::clone(self),
            conversation_id: conversation_id.clone(),
        }
    }

    pub(crate) fn is_live(&self, conversation_id: &ConversationId) -> bool {
        self.feeds
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(conversation_id)
    }

    fn release(&self, conversation_id: &ConversationId) {
        let mut feeds = self.feeds.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(feed) = feeds.get_mut(conversation_id) else {
            return;
        };
        feed.observers -= 1;
        if feed.observers == 0 {
            if let Some(feed) = feeds.remove(conversation_id) {
                tracing::debug!(conversation = %conversation_id, "last observer gone, closing live feed");
                feed.cancel.cancel();
            }
        }
    }
}

/// Keeps a conversation's live feed running while held.
pub(crate) struct LiveLease {
    feeds: Arc<LiveFeeds>,
    conversation_id: ConversationId,
}

impl Drop for LiveLease {
    fn drop(&mut self) {
        self.feeds.release(&self.conversation_id);
    }
}

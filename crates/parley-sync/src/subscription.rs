//! Cancellable push subscriptions.

use std::pin::Pin;
use std::task::{Context, Poll};

use futures::Stream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// A stream of values pushed by a background task.
///
/// Dropping the subscription, or calling [`Subscription::cancel`], stops the
/// producer and releases whatever it holds (live remote channels included).
pub struct Subscription<T> {
    rx: mpsc::Receiver<T>,
    cancel: CancellationToken,
}

impl<T> Subscription<T> {
    pub(crate) fn new(rx: mpsc::Receiver<T>, cancel: CancellationToken) -> Self {
        Self { rx, cancel }
    }

    /// Next value, or `None` once the producer has stopped.
    pub async fn next(&mut self) -> Option<T> {
        self.rx.recv().await
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

impl<T> Drop for Subscription<T> {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl<T> Stream for Subscription<T> {
    type Item = T;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<T>> {
        self.rx.poll_recv(cx)
    }
}

#[cfg(test)]
mod tests {
    use futures::StreamExt;

    use super::*;

    #[tokio::test]
    async fn drop_cancels_the_producer() {
        let (tx, rx) = mpsc::channel(4);
        let token = CancellationToken::new();
        let producer_token = token.clone();

        let sub = Subscription::new(rx, token);
        tx.send(1).await.unwrap();
        drop(sub);

        assert!(producer_token.is_cancelled());
    }

    #[tokio::test]
    async fn behaves_as_a_stream() {
        let (tx, rx) = mpsc::channel(4);
        let sub = Subscription::new(rx, CancellationToken::new());
        tx.send("a").await.unwrap();
        tx.send("b").await.unwrap();
        drop(tx);

        let items: Vec<_> = sub.collect().await;
        assert_eq!(items, vec!["a", "b"]);
    }
}

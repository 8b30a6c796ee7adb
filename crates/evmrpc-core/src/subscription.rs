//! Subscription handles and their error channels.
//!
//! Every subscription exposes a one-shot error signal. The signal resolves
//! with `Some(err)` when the subscription failed, or with `None` once the
//! subscription was torn down (explicit unsubscribe, lifecycle epoch advance,
//! or the producer going away).

use std::sync::Arc;

use tokio::sync::watch;

use crate::error::{ClientError, TransportError};

/// Producer side of an error signal. Dropping it closes the signal.
#[derive(Debug)]
pub struct ErrSender<E> {
    tx: watch::Sender<Option<Arc<E>>>,
}

/// Consumer side of an error signal. Cheap to clone.
#[derive(Debug)]
pub struct ErrSignal<E> {
    rx: watch::Receiver<Option<Arc<E>>>,
}

impl<E> Clone for ErrSignal<E> {
    fn clone(&self) -> Self {
        Self { rx: self.rx.clone() }
    }
}

/// Create a linked sender/signal pair.
pub fn err_channel<E>() -> (ErrSender<E>, ErrSignal<E>) {
    let (tx, rx) = watch::channel(None);
    (ErrSender { tx }, ErrSignal { rx })
}

impl<E> ErrSender<E> {
    /// Publish the failure. Later calls overwrite earlier ones.
    pub fn send(&self, err: E) {
        self.tx.send_replace(Some(Arc::new(err)));
    }

    /// Another handle to the same signal.
    pub fn subscribe(&self) -> ErrSignal<E> {
        ErrSignal {
            rx: self.tx.subscribe(),
        }
    }
}

impl<E> ErrSignal<E> {
    /// Wait for the subscription to fail or close.
    pub async fn recv(&mut self) -> Option<Arc<E>> {
        loop {
            if let Some(err) = self.rx.borrow_and_update().clone() {
                return Some(err);
            }
            if self.rx.changed().await.is_err() {
                return self.rx.borrow().clone();
            }
        }
    }

    /// The failure, if one was published.
    pub fn error(&self) -> Option<Arc<E>> {
        self.rx.borrow().clone()
    }

    /// `true` once the producer side is gone.
    pub fn is_closed(&self) -> bool {
        self.rx.has_changed().is_err()
    }
}

/// A live push subscription.
pub trait Subscription: Send + Sync {
    type Error: Send + Sync + 'static;

    /// Stop delivery and release resources. Idempotent.
    fn unsubscribe(&self);

    /// Error signal of this subscription.
    fn err(&self) -> ErrSignal<Self::Error>;
}

/// Subscription opened directly on a transport.
pub type RawSubscription = Box<dyn Subscription<Error = TransportError>>;

/// Subscription handed out by the client.
pub type ManagedSubscription = Arc<dyn Subscription<Error = ClientError>>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn recv_returns_error_then_keeps_it() {
        let (tx, mut rx) = err_channel::<TransportError>();
        tx.send(TransportError::Closed);
        let err = rx.recv().await.unwrap();
        assert!(matches!(*err, TransportError::Closed));
        drop(tx);
        assert!(rx.recv().await.is_some());
        assert!(rx.is_closed());
    }

    #[tokio::test]
    async fn recv_returns_none_when_sender_dropped() {
        let (tx, mut rx) = err_channel::<TransportError>();
        assert!(!rx.is_closed());
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            drop(tx);
        });
        assert!(rx.recv().await.is_none());
        assert!(rx.is_closed());
    }

    #[test]
    fn cloned_signal_observes_same_error() {
        let (tx, rx) = err_channel::<TransportError>();
        let other = tx.subscribe();
        tx.send(TransportError::Cancelled);
        assert!(rx.clone().error().is_some());
        assert!(other.error().is_some());
    }
}

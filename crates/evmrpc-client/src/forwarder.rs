//! Subscription forwarder.
//!
//! Sits between a raw transport subscription and the caller's channel:
//! every upstream message is transformed (decoded, normalized, stamped) and
//! delivered downstream, upstream errors are wrapped in the client's error
//! envelope, and unsubscribing tears both sides down without waiting on the
//! caller to drain its channel.

use std::future::Future;
use std::sync::{Arc, Mutex};

use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use evmrpc_core::error::{ClientError, TransportError};
use evmrpc_core::subscription::{err_channel, ErrSender, ErrSignal, RawSubscription, Subscription};

/// Buffer of the channel the transport delivers raw notifications into.
///
/// Matches geth's client-side notification buffer: a subscriber is only
/// failed with a queue overflow once this many messages are pending.
const SOURCE_BUFFER: usize = 20_000;

/// Builder for one forwarded subscription.
///
/// `transform` returns `Ok(None)` to skip a message; an `Err` ends the
/// subscription and is reported as-is.
pub(crate) struct Forwarder<T, F> {
    dest: mpsc::Sender<T>,
    src_tx: mpsc::Sender<Value>,
    src_rx: mpsc::Receiver<Value>,
    transform: F,
}

impl<T, F, Fut> Forwarder<T, F>
where
    T: Send + 'static,
    F: FnMut(Value) -> Fut + Send + 'static,
    Fut: Future<Output = Result<Option<T>, ClientError>> + Send + 'static,
{
    pub(crate) fn new(dest: mpsc::Sender<T>, transform: F) -> Self {
        let (src_tx, src_rx) = mpsc::channel(SOURCE_BUFFER);
        Self {
            dest,
            src_tx,
            src_rx,
            transform,
        }
    }

    /// The sink to hand to the transport's `subscribe`.
    pub(crate) fn source(&self) -> mpsc::Sender<Value> {
        self.src_tx.clone()
    }

    /// Start forwarding from the subscription the transport returned.
    ///
    /// A failed upstream subscribe is wrapped with `wrap` and nothing is
    /// spawned.
    pub(crate) fn start<W>(
        self,
        upstream: Result<RawSubscription, TransportError>,
        wrap: W,
    ) -> Result<SubForwarder, ClientError>
    where
        W: Fn(TransportError) -> ClientError + Send + 'static,
    {
        let Self {
            dest,
            src_tx,
            src_rx,
            transform,
        } = self;
        // only the transport may keep the source open
        drop(src_tx);
        let upstream = upstream.map_err(&wrap)?;

        let (err_tx, err_rx) = err_channel();
        let err_tx = Arc::new(Mutex::new(Some(err_tx)));
        let stop = CancellationToken::new();
        tokio::spawn(forward(
            upstream,
            src_rx,
            dest,
            transform,
            wrap,
            stop.clone(),
            err_tx.clone(),
        ));
        Ok(SubForwarder {
            stop,
            err_tx,
            err_rx,
        })
    }
}

async fn forward<T, F, Fut, W>(
    upstream: RawSubscription,
    mut src: mpsc::Receiver<Value>,
    dest: mpsc::Sender<T>,
    mut transform: F,
    wrap: W,
    stop: CancellationToken,
    err_tx: Arc<Mutex<Option<ErrSender<ClientError>>>>,
) where
    T: Send + 'static,
    F: FnMut(Value) -> Fut + Send + 'static,
    Fut: Future<Output = Result<Option<T>, ClientError>> + Send + 'static,
    W: Fn(TransportError) -> ClientError + Send + 'static,
{
    let report = |err: ClientError| {
        if let Some(tx) = err_tx.lock().unwrap_or_else(|e| e.into_inner()).as_ref() {
            tx.send(err);
        }
    };
    let mut upstream_err = upstream.err();

    loop {
        let msg = tokio::select! {
            biased;
            _ = stop.cancelled() => break,
            err = upstream_err.recv() => {
                if let Some(err) = err {
                    report(wrap(err.duplicate()));
                }
                break;
            }
            msg = src.recv() => match msg {
                Some(msg) => msg,
                None => break,
            },
        };

        let out = tokio::select! {
            biased;
            _ = stop.cancelled() => break,
            out = transform(msg) => out,
        };
        match out {
            Ok(Some(item)) => {
                tokio::select! {
                    biased;
                    _ = stop.cancelled() => break,
                    sent = dest.send(item) => if sent.is_err() {
                        debug!("subscription receiver dropped");
                        break;
                    },
                }
            }
            Ok(None) => {}
            Err(err) => {
                report(err);
                break;
            }
        }
    }
    upstream.unsubscribe();
}

/// Handle of a running forwarder.
pub(crate) struct SubForwarder {
    stop: CancellationToken,
    err_tx: Arc<Mutex<Option<ErrSender<ClientError>>>>,
    err_rx: ErrSignal<ClientError>,
}

impl Subscription for SubForwarder {
    type Error = ClientError;

    /// Stops the worker and closes the error signal before returning.
    fn unsubscribe(&self) {
        self.stop.cancel();
        self.err_tx.lock().unwrap_or_else(|e| e.into_inner()).take();
    }

    fn err(&self) -> ErrSignal<ClientError> {
        self.err_rx.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    use futures::future::ready;
    use serde_json::json;

    type SharedErr = Arc<Mutex<Option<ErrSender<TransportError>>>>;

    struct Upstream {
        err_tx: SharedErr,
        err_rx: ErrSignal<TransportError>,
        unsubscribed: Arc<AtomicBool>,
    }

    impl Subscription for Upstream {
        type Error = TransportError;

        fn unsubscribe(&self) {
            self.unsubscribed.store(true, Ordering::SeqCst);
            self.err_tx.lock().unwrap().take();
        }

        fn err(&self) -> ErrSignal<TransportError> {
            self.err_rx.clone()
        }
    }

    fn upstream() -> (RawSubscription, SharedErr, Arc<AtomicBool>) {
        let (err_tx, err_rx) = err_channel();
        let err_tx = Arc::new(Mutex::new(Some(err_tx)));
        let flag = Arc::new(AtomicBool::new(false));
        let sub = Upstream {
            err_tx: err_tx.clone(),
            err_rx,
            unsubscribed: flag.clone(),
        };
        (Box::new(sub), err_tx, flag)
    }

    fn wrap(e: TransportError) -> ClientError {
        ClientError::call(e)
    }

    fn doubling(v: Value) -> futures::future::Ready<Result<Option<u64>, ClientError>> {
        ready(Ok(v.as_u64().map(|n| n * 2)))
    }

    #[tokio::test]
    async fn transforms_and_delivers() {
        let (dest, mut rx) = mpsc::channel(4);
        let fwd = Forwarder::new(dest, doubling);
        let src = fwd.source();
        let (up, _err, _flag) = upstream();
        let _sub = fwd.start(Ok(up), wrap).unwrap();

        src.send(json!(21)).await.unwrap();
        src.send(json!("skipped")).await.unwrap();
        src.send(json!(2)).await.unwrap();
        assert_eq!(rx.recv().await, Some(42));
        assert_eq!(rx.recv().await, Some(4));
    }

    #[tokio::test]
    async fn failed_subscribe_is_wrapped() {
        let (dest, _rx) = mpsc::channel::<u64>(1);
        let fwd = Forwarder::new(dest, doubling);
        let err = fwd
            .start(Err(TransportError::WebSocket("refused".into())), wrap)
            .err()
            .unwrap();
        assert_eq!(err.to_string(), "RPC call failed: WebSocket error: refused");
    }

    #[tokio::test]
    async fn upstream_error_is_wrapped_and_ends_forwarding() {
        let (dest, _rx) = mpsc::channel::<u64>(1);
        let fwd = Forwarder::new(dest, doubling);
        let (up, err_tx, flag) = upstream();
        let sub = fwd.start(Ok(up), wrap).unwrap();

        err_tx
            .lock()
            .unwrap()
            .as_ref()
            .unwrap()
            .send(TransportError::WebSocket("invalid message".into()));
        let err = sub.err().recv().await.unwrap();
        assert_eq!(err.to_string(), "RPC call failed: WebSocket error: invalid message");

        tokio::time::timeout(Duration::from_secs(1), async {
            while !flag.load(Ordering::SeqCst) {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn transform_error_passes_through_unwrapped() {
        let (dest, _rx) = mpsc::channel::<u64>(1);
        let fwd = Forwarder::new(dest, |_v: Value| {
            ready(Err::<Option<u64>, _>(ClientError::InvalidArgument("bad log".into())))
        });
        let src = fwd.source();
        let (up, _err, _flag) = upstream();
        let sub = fwd.start(Ok(up), wrap).unwrap();

        src.send(json!(1)).await.unwrap();
        let err = sub.err().recv().await.unwrap();
        assert_eq!(err.to_string(), "invalid argument: bad log");
    }

    #[tokio::test]
    async fn unsubscribe_does_not_wait_for_a_stalled_consumer() {
        let (dest, _rx) = mpsc::channel(1);
        let fwd = Forwarder::new(dest, doubling);
        let src = fwd.source();
        let (up, _err, flag) = upstream();
        let sub = fwd.start(Ok(up), wrap).unwrap();

        // fill the consumer channel, then leave one more message blocked
        src.send(json!(1)).await.unwrap();
        src.send(json!(2)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        sub.unsubscribe();
        assert!(sub.err().is_closed());
        assert!(sub.err().recv().await.is_none());
        tokio::time::timeout(Duration::from_secs(1), async {
            while !flag.load(Ordering::SeqCst) {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
    }
}

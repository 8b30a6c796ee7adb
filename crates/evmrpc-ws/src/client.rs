//! WebSocket JSON-RPC client with subscription support.
//!
//! The connection is opened eagerly by [`WsRpcClient::connect`]; one
//! background task owns the socket and the table of in-flight requests.
//! There is no automatic reconnection: when the socket drops every pending
//! call fails and every subscription receives an error, and the owner is
//! expected to dial a fresh client.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde::Serialize;
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use url::Url;

use evmrpc_core::context::RequestContext;
use evmrpc_core::error::TransportError;
use evmrpc_core::request::{JsonRpcRequest, JsonRpcResponse, RpcId};
use evmrpc_core::subscription::{err_channel, ErrSender, ErrSignal, RawSubscription, Subscription};
use evmrpc_core::transport::{PubSubTransport, RpcTransport};

use crate::subscriptions::{Dispatch, SubscriptionId, SubscriptionManager};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = futures::stream::SplitSink<WsStream, Message>;

type CallReply = oneshot::Sender<Result<JsonRpcResponse, TransportError>>;
type BatchReply = oneshot::Sender<Result<Vec<JsonRpcResponse>, TransportError>>;
type SubscribeReply = oneshot::Sender<Result<SubscriptionId, TransportError>>;

/// Commands sent from client handles to the background task.
enum WsCommand {
    Call {
        req: JsonRpcRequest,
        reply: CallReply,
    },
    Batch {
        reqs: Vec<JsonRpcRequest>,
        reply: BatchReply,
    },
    Subscribe {
        req: JsonRpcRequest,
        sink: mpsc::Sender<Value>,
        err: ErrSender<TransportError>,
        reply: SubscribeReply,
    },
    Unsubscribe {
        id: SubscriptionId,
    },
}

/// An in-flight request awaiting its response.
enum Pending {
    Call(CallReply),
    Subscribe {
        sink: mpsc::Sender<Value>,
        err: ErrSender<TransportError>,
        reply: SubscribeReply,
    },
    /// Response is not awaited (e.g. `eth_unsubscribe`).
    Ignore,
}

struct PendingBatch {
    ids: Vec<u64>,
    reply: BatchReply,
}

/// WebSocket JSON-RPC client.
pub struct WsRpcClient {
    url: String,
    cmd_tx: mpsc::UnboundedSender<WsCommand>,
    next_id: Arc<AtomicU64>,
    subscriptions: SubscriptionManager,
    shutdown: CancellationToken,
}

impl WsRpcClient {
    /// Dial `url` and start the connection task.
    ///
    /// The handshake is bounded by `ctx`; a failed handshake returns an error
    /// and leaves nothing running.
    pub async fn connect(ctx: &RequestContext, url: &Url) -> Result<Self, TransportError> {
        match url.scheme() {
            "ws" | "wss" => {}
            other => {
                return Err(TransportError::WebSocket(format!(
                    "unsupported URL scheme {other:?}, expected ws or wss"
                )))
            }
        }
        let (stream, _) = ctx
            .run(async {
                connect_async(url.as_str())
                    .await
                    .map_err(|e| TransportError::WebSocket(e.to_string()))
            })
            .await?;

        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let next_id = Arc::new(AtomicU64::new(1));
        let subscriptions = SubscriptionManager::new();
        let shutdown = CancellationToken::new();

        let task = WsTask {
            url: url.to_string(),
            next_id: next_id.clone(),
            subscriptions: subscriptions.clone(),
            pending: HashMap::new(),
            batches: HashMap::new(),
            batch_of: HashMap::new(),
        };
        tokio::spawn(task.run(stream, cmd_rx, shutdown.clone()));

        Ok(Self {
            url: url.to_string(),
            cmd_tx,
            next_id,
            subscriptions,
            shutdown,
        })
    }

    /// Number of active subscriptions on this connection.
    pub fn subscription_count(&self) -> usize {
        self.subscriptions.len()
    }

    /// `true` once the connection task has exited.
    pub fn is_closed(&self) -> bool {
        self.cmd_tx.is_closed()
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn command(&self, cmd: WsCommand) -> Result<(), TransportError> {
        self.cmd_tx.send(cmd).map_err(|_| TransportError::Closed)
    }
}

impl Drop for WsRpcClient {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

impl std::fmt::Debug for WsRpcClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WsRpcClient")
            .field("url", &self.url)
            .field("subscriptions", &self.subscriptions.len())
            .finish()
    }
}

#[async_trait]
impl RpcTransport for WsRpcClient {
    async fn send(
        &self,
        ctx: &RequestContext,
        mut req: JsonRpcRequest,
    ) -> Result<JsonRpcResponse, TransportError> {
        let original = std::mem::replace(&mut req.id, RpcId::Number(self.next_id()));
        let (reply, rx) = oneshot::channel();
        self.command(WsCommand::Call { req, reply })?;
        let mut resp = ctx
            .run(async { rx.await.map_err(|_| TransportError::Closed)? })
            .await?;
        resp.id = original;
        Ok(resp)
    }

    /// Sends the whole batch as one JSON array frame.
    async fn send_batch(
        &self,
        ctx: &RequestContext,
        mut reqs: Vec<JsonRpcRequest>,
    ) -> Result<Vec<JsonRpcResponse>, TransportError> {
        if reqs.is_empty() {
            return Ok(vec![]);
        }
        let mut originals = HashMap::with_capacity(reqs.len());
        for req in reqs.iter_mut() {
            let id = self.next_id();
            originals.insert(id, std::mem::replace(&mut req.id, RpcId::Number(id)));
        }
        let (reply, rx) = oneshot::channel();
        self.command(WsCommand::Batch { reqs, reply })?;
        let mut resps = ctx
            .run(async { rx.await.map_err(|_| TransportError::Closed)? })
            .await?;
        for resp in resps.iter_mut() {
            if let Some(original) = resp.id.as_u64().and_then(|id| originals.remove(&id)) {
                resp.id = original;
            }
        }
        Ok(resps)
    }

    fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl PubSubTransport for WsRpcClient {
    async fn subscribe(
        &self,
        ctx: &RequestContext,
        params: Vec<Value>,
        sink: mpsc::Sender<Value>,
    ) -> Result<RawSubscription, TransportError> {
        let req = JsonRpcRequest::new(self.next_id(), "eth_subscribe", params);
        let (err, err_rx) = err_channel();
        let (reply, rx) = oneshot::channel();
        self.command(WsCommand::Subscribe {
            req,
            sink,
            err,
            reply,
        })?;
        let id = ctx
            .run(async { rx.await.map_err(|_| TransportError::Closed)? })
            .await?;
        tracing::debug!(url = %self.url, subscription = %id, "subscribed");
        Ok(Box::new(WsSubscription {
            id,
            cmd_tx: self.cmd_tx.clone(),
            err: err_rx,
            done: AtomicBool::new(false),
        }))
    }

    fn close(&self) {
        self.shutdown.cancel();
    }
}

/// Handle of one `eth_subscribe` subscription.
pub struct WsSubscription {
    id: SubscriptionId,
    cmd_tx: mpsc::UnboundedSender<WsCommand>,
    err: ErrSignal<TransportError>,
    done: AtomicBool,
}

impl WsSubscription {
    pub fn id(&self) -> &SubscriptionId {
        &self.id
    }
}

impl Subscription for WsSubscription {
    type Error = TransportError;

    fn unsubscribe(&self) {
        if self.done.swap(true, Ordering::SeqCst) {
            return;
        }
        // connection already gone: nothing to cancel on the node
        let _ = self.cmd_tx.send(WsCommand::Unsubscribe {
            id: self.id.clone(),
        });
    }

    fn err(&self) -> ErrSignal<TransportError> {
        self.err.clone()
    }
}

enum Exit {
    Closed,
    Lost(String),
}

/// State owned by the connection task.
struct WsTask {
    url: String,
    next_id: Arc<AtomicU64>,
    subscriptions: SubscriptionManager,
    pending: HashMap<u64, Pending>,
    /// Batches keyed by their first request id.
    batches: HashMap<u64, PendingBatch>,
    batch_of: HashMap<u64, u64>,
}

impl WsTask {
    async fn run(
        mut self,
        stream: WsStream,
        mut cmd_rx: mpsc::UnboundedReceiver<WsCommand>,
        shutdown: CancellationToken,
    ) {
        let (mut sink, mut stream) = stream.split();
        tracing::debug!(url = %self.url, "websocket connected");

        let exit = loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    let _ = sink.send(Message::Close(None)).await;
                    break Exit::Closed;
                }
                cmd = cmd_rx.recv() => match cmd {
                    Some(cmd) => {
                        if let Err(e) = self.handle_command(&mut sink, cmd).await {
                            break Exit::Lost(e);
                        }
                    }
                    None => break Exit::Closed,
                },
                msg = stream.next() => match msg {
                    Some(Ok(Message::Text(text))) => {
                        if let Err(e) = self.handle_frame(&mut sink, text.as_str()).await {
                            break Exit::Lost(e);
                        }
                    }
                    Some(Ok(Message::Binary(bin))) => {
                        let text = String::from_utf8_lossy(&bin).into_owned();
                        if let Err(e) = self.handle_frame(&mut sink, &text).await {
                            break Exit::Lost(e);
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        break Exit::Lost("connection closed by peer".into());
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => break Exit::Lost(e.to_string()),
                },
            }
        };

        // Stop accepting commands before failing what is in flight.
        cmd_rx.close();
        let make_err = || match &exit {
            Exit::Closed => TransportError::Closed,
            Exit::Lost(reason) => TransportError::WebSocket(reason.clone()),
        };
        match &exit {
            Exit::Closed => tracing::debug!(url = %self.url, "websocket closed"),
            Exit::Lost(reason) => tracing::warn!(url = %self.url, %reason, "websocket connection lost"),
        }
        for (_, pending) in self.pending.drain() {
            match pending {
                Pending::Call(reply) => {
                    let _ = reply.send(Err(make_err()));
                }
                Pending::Subscribe { reply, .. } => {
                    let _ = reply.send(Err(make_err()));
                }
                Pending::Ignore => {}
            }
        }
        for (_, batch) in self.batches.drain() {
            let _ = batch.reply.send(Err(make_err()));
        }
        while let Ok(cmd) = cmd_rx.try_recv() {
            fail_command(cmd, make_err());
        }
        self.subscriptions.fail_all(make_err);
    }

    async fn handle_command(&mut self, sink: &mut WsSink, cmd: WsCommand) -> Result<(), String> {
        match cmd {
            WsCommand::Call { req, reply } => {
                let Some(id) = req.id.as_u64() else {
                    let _ = reply.send(Err(TransportError::Other("non-numeric request id".into())));
                    return Ok(());
                };
                self.pending.insert(id, Pending::Call(reply));
                self.write(sink, &req).await
            }
            WsCommand::Batch { reqs, reply } => {
                let ids: Vec<u64> = reqs.iter().filter_map(|r| r.id.as_u64()).collect();
                let Some(&key) = ids.first() else {
                    let _ = reply.send(Ok(vec![]));
                    return Ok(());
                };
                for id in &ids {
                    self.batch_of.insert(*id, key);
                }
                self.batches.insert(key, PendingBatch { ids, reply });
                self.write(sink, &reqs).await
            }
            WsCommand::Subscribe {
                req,
                sink: notify,
                err,
                reply,
            } => {
                let Some(id) = req.id.as_u64() else {
                    let _ = reply.send(Err(TransportError::Other("non-numeric request id".into())));
                    return Ok(());
                };
                self.pending.insert(
                    id,
                    Pending::Subscribe {
                        sink: notify,
                        err,
                        reply,
                    },
                );
                self.write(sink, &req).await
            }
            WsCommand::Unsubscribe { id } => {
                if self.subscriptions.remove(&id) {
                    self.unsubscribe_remote(sink, id).await
                } else {
                    Ok(())
                }
            }
        }
    }

    async fn handle_frame(&mut self, sink: &mut WsSink, text: &str) -> Result<(), String> {
        // Non-JSON frames end the connection; subscribers receive the decode error.
        let value: Value = serde_json::from_str(text).map_err(|e| format!("invalid message: {e}"))?;

        let stale = match value {
            Value::Array(items) => {
                self.handle_batch_response(items);
                None
            }
            Value::Object(ref obj) if obj.get("method").and_then(Value::as_str) == Some("eth_subscription") => {
                self.handle_notification(&value)
            }
            Value::Object(_) => match serde_json::from_value::<JsonRpcResponse>(value) {
                Ok(resp) => self.handle_response(resp),
                Err(e) => {
                    tracing::warn!(url = %self.url, error = %e, "dropping malformed response");
                    None
                }
            },
            _ => None,
        };

        match stale {
            Some(id) => self.unsubscribe_remote(sink, id).await,
            None => Ok(()),
        }
    }

    /// Returns a subscription id whose subscriber is gone and should be
    /// cancelled on the node.
    fn handle_notification(&self, value: &Value) -> Option<SubscriptionId> {
        let params = value.get("params")?;
        let id = SubscriptionId(params.get("subscription")?.as_str()?.to_string());
        let result = params.get("result").cloned().unwrap_or(Value::Null);
        match self.subscriptions.dispatch(&id, result) {
            Dispatch::Delivered | Dispatch::Unknown => None,
            Dispatch::Dropped => Some(id),
        }
    }

    fn handle_response(&mut self, resp: JsonRpcResponse) -> Option<SubscriptionId> {
        let pending = resp.id.as_u64().and_then(|id| self.pending.remove(&id));
        match pending {
            Some(Pending::Call(reply)) => {
                let _ = reply.send(Ok(resp));
                None
            }
            Some(Pending::Subscribe { sink, err, reply }) => match resp.into_result() {
                Ok(Value::String(id)) => {
                    let id = SubscriptionId(id);
                    // registered before the next frame is read, so no
                    // notification can be missed
                    self.subscriptions.register(id.clone(), sink, err);
                    match reply.send(Ok(id)) {
                        Ok(()) => None,
                        Err(Ok(id)) => {
                            self.subscriptions.remove(&id);
                            Some(id)
                        }
                        Err(Err(_)) => None,
                    }
                }
                Ok(other) => {
                    let _ = reply.send(Err(TransportError::Other(format!(
                        "invalid subscription id: {other}"
                    ))));
                    None
                }
                Err(e) => {
                    let _ = reply.send(Err(TransportError::Rpc(e)));
                    None
                }
            },
            Some(Pending::Ignore) => None,
            None => {
                tracing::debug!(url = %self.url, id = %resp.id, "response for unknown request");
                None
            }
        }
    }

    fn handle_batch_response(&mut self, items: Vec<Value>) {
        let resps: Vec<JsonRpcResponse> = items
            .into_iter()
            .filter_map(|v| serde_json::from_value(v).ok())
            .collect();
        let key = resps
            .iter()
            .find_map(|r| r.id.as_u64().and_then(|id| self.batch_of.get(&id).copied()));
        let Some(batch) = key.and_then(|k| self.batches.remove(&k)) else {
            tracing::debug!(url = %self.url, "batch response for unknown request");
            return;
        };
        for id in &batch.ids {
            self.batch_of.remove(id);
        }
        let _ = batch.reply.send(Ok(resps));
    }

    async fn unsubscribe_remote(&mut self, sink: &mut WsSink, id: SubscriptionId) -> Result<(), String> {
        let req_id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.pending.insert(req_id, Pending::Ignore);
        let req = JsonRpcRequest::new(req_id, "eth_unsubscribe", vec![Value::String(id.0)]);
        self.write(sink, &req).await
    }

    async fn write<T: Serialize>(&self, sink: &mut WsSink, msg: &T) -> Result<(), String> {
        let text = serde_json::to_string(msg).map_err(|e| e.to_string())?;
        sink.send(Message::Text(text.into()))
            .await
            .map_err(|e| format!("write failed: {e}"))
    }
}

fn fail_command(cmd: WsCommand, err: TransportError) {
    match cmd {
        WsCommand::Call { reply, .. } => {
            let _ = reply.send(Err(err));
        }
        WsCommand::Batch { reply, .. } => {
            let _ = reply.send(Err(err));
        }
        WsCommand::Subscribe { reply, .. } => {
            let _ = reply.send(Err(err));
        }
        WsCommand::Unsubscribe { .. } => {}
    }
}

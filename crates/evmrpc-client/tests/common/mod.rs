//! Test nodes: an in-process WebSocket JSON-RPC server and a wiremock
//! responder for HTTP, both driven by the same per-method handler.

#![allow(dead_code)]

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use url::Url;
use wiremock::{Request, Respond, ResponseTemplate};

use evmrpc_client::{ClientConfig, RpcClient};

/// How the node answers one request.
pub enum Reply {
    Result(Value),
    Error(i64, String),
    /// Never answer.
    Hang,
}

pub type Handler = Arc<dyn Fn(&str, &Value) -> Reply + Send + Sync>;

pub fn handler(f: impl Fn(&str, &Value) -> Reply + Send + Sync + 'static) -> Handler {
    Arc::new(f)
}

/// Every method answers `null`.
pub fn null_handler() -> Handler {
    handler(|_, _| Reply::Result(Value::Null))
}

pub fn head_json(number: u64) -> Value {
    json!({
        "number": format!("{number:#x}"),
        "hash": format!("0x{number:064x}"),
        "parentHash": format!("0x{:064x}", number.saturating_sub(1)),
        "timestamp": "0x0",
    })
}

pub fn head_json_with_td(number: u64, td: u64) -> Value {
    let mut head = head_json(number);
    head["totalDifficulty"] = json!(format!("{td:#x}"));
    head
}

/// Answer one JSON-RPC message (single or batch). `None` means stay silent.
fn answer(handler: &Handler, calls: &Mutex<Vec<(String, Value)>>, req: &Value) -> Option<Value> {
    if let Value::Array(items) = req {
        let mut out = Vec::with_capacity(items.len());
        for item in items {
            out.push(answer(handler, calls, item)?);
        }
        return Some(Value::Array(out));
    }
    let method = req["method"].as_str().unwrap_or_default().to_string();
    let params = req["params"].clone();
    calls.lock().unwrap().push((method.clone(), params.clone()));
    let id = req["id"].clone();
    match handler(&method, &params) {
        Reply::Result(result) => Some(json!({"jsonrpc": "2.0", "id": id, "result": result})),
        Reply::Error(code, message) => Some(json!({
            "jsonrpc": "2.0", "id": id, "error": {"code": code, "message": message}
        })),
        Reply::Hang => None,
    }
}

#[derive(Clone, Debug)]
enum Push {
    Notify(Value),
    Raw(String),
}

/// In-process WebSocket JSON-RPC node.
///
/// `eth_subscribe` / `eth_unsubscribe` are handled by the server itself;
/// everything else goes to the handler.
pub struct WsNode {
    url: Url,
    push: broadcast::Sender<Push>,
    calls: Arc<Mutex<Vec<(String, Value)>>>,
    shutdown: CancellationToken,
}

impl WsNode {
    pub async fn start(handler: Handler) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = Url::parse(&format!("ws://{}", listener.local_addr().unwrap())).unwrap();
        let (push, _) = broadcast::channel(1024);
        let calls = Arc::new(Mutex::new(Vec::new()));
        let shutdown = CancellationToken::new();

        let (push_tx, calls_c, stop) = (push.clone(), calls.clone(), shutdown.clone());
        tokio::spawn(async move {
            loop {
                let tcp = tokio::select! {
                    _ = stop.cancelled() => return,
                    accepted = listener.accept() => match accepted {
                        Ok((tcp, _)) => tcp,
                        Err(_) => return,
                    },
                };
                tokio::spawn(serve(
                    tcp,
                    handler.clone(),
                    calls_c.clone(),
                    push_tx.subscribe(),
                    stop.clone(),
                ));
            }
        });
        Self {
            url,
            push,
            calls,
            shutdown,
        }
    }

    pub fn url(&self) -> Url {
        self.url.clone()
    }

    /// Push `result` to every live subscription.
    pub fn notify(&self, result: Value) {
        let _ = self.push.send(Push::Notify(result));
    }

    /// Send a raw text frame on every connection.
    pub fn send_raw(&self, text: &str) {
        let _ = self.push.send(Push::Raw(text.to_string()));
    }

    pub fn calls(&self) -> Vec<(String, Value)> {
        self.calls.lock().unwrap().clone()
    }

    /// Stop accepting and drop every connection.
    pub fn close(&self) {
        self.shutdown.cancel();
    }
}

impl Drop for WsNode {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn serve(
    tcp: tokio::net::TcpStream,
    handler: Handler,
    calls: Arc<Mutex<Vec<(String, Value)>>>,
    mut push: broadcast::Receiver<Push>,
    stop: CancellationToken,
) {
    let Ok(mut ws) = accept_async(tcp).await else {
        return;
    };
    let mut subs: HashSet<String> = HashSet::new();
    let mut next_sub = 0u64;

    loop {
        let out: Vec<String> = tokio::select! {
            _ = stop.cancelled() => return,
            pushed = push.recv() => match pushed {
                Ok(Push::Notify(result)) => subs
                    .iter()
                    .map(|id| json!({
                        "jsonrpc": "2.0",
                        "method": "eth_subscription",
                        "params": {"subscription": id, "result": result},
                    }).to_string())
                    .collect(),
                Ok(Push::Raw(text)) => vec![text],
                Err(broadcast::error::RecvError::Lagged(_)) => vec![],
                Err(broadcast::error::RecvError::Closed) => return,
            },
            frame = ws.next() => {
                let Some(Ok(Message::Text(text))) = frame else {
                    return;
                };
                let Ok(req) = serde_json::from_str::<Value>(text.as_str()) else {
                    continue;
                };
                match req["method"].as_str() {
                    Some("eth_subscribe") => {
                        calls.lock().unwrap().push(("eth_subscribe".into(), req["params"].clone()));
                        next_sub += 1;
                        let id = format!("{next_sub:#x}");
                        subs.insert(id.clone());
                        vec![json!({"jsonrpc": "2.0", "id": req["id"], "result": id}).to_string()]
                    }
                    Some("eth_unsubscribe") => {
                        let id = req["params"][0].as_str().unwrap_or_default();
                        let removed = subs.remove(id);
                        vec![json!({"jsonrpc": "2.0", "id": req["id"], "result": removed}).to_string()]
                    }
                    _ => answer(&handler, &calls, &req).map(|v| v.to_string()).into_iter().collect(),
                }
            }
        };
        for text in out {
            if ws.send(Message::Text(text.into())).await.is_err() {
                return;
            }
        }
    }
}

/// wiremock responder speaking JSON-RPC over HTTP.
pub struct JsonRpcResponder {
    handler: Handler,
    calls: Arc<Mutex<Vec<(String, Value)>>>,
}

impl JsonRpcResponder {
    pub fn new(handler: Handler) -> (Self, Arc<Mutex<Vec<(String, Value)>>>) {
        let calls = Arc::new(Mutex::new(Vec::new()));
        (
            Self {
                handler,
                calls: calls.clone(),
            },
            calls,
        )
    }
}

impl Respond for JsonRpcResponder {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        let req: Value = match serde_json::from_slice(&request.body) {
            Ok(v) => v,
            Err(_) => return ResponseTemplate::new(400),
        };
        match answer(&self.handler, &self.calls, &req) {
            Some(body) => ResponseTemplate::new(200).set_body_json(body),
            None => ResponseTemplate::new(200)
                .set_body_json(Value::Null)
                .set_delay(Duration::from_secs(3600)),
        }
    }
}

pub fn config() -> ClientConfig {
    ClientConfig {
        name: "test-node".into(),
        chain_id: 1337,
        rpc_timeout: Duration::from_secs(5),
        large_payload_rpc_timeout: Duration::from_secs(5),
        ..ClientConfig::default()
    }
}

pub fn ws_client(cfg: ClientConfig, node: &WsNode) -> RpcClient {
    RpcClient::new(cfg, Some(node.url()), None)
}

/// Bound a test step so a hang fails instead of stalling the suite.
pub async fn within<F: std::future::Future>(fut: F) -> F::Output {
    tokio::time::timeout(Duration::from_secs(10), fut)
        .await
        .expect("test step timed out")
}

//! The RPC client: one node reached over a WebSocket and/or an HTTP endpoint.
//!
//! Reads prefer HTTP (it honours the response-size limit); the WebSocket
//! connection is used for subscriptions and as the fallback when no HTTP
//! endpoint is configured. Every call runs under a query context derived from
//! the current lifecycle epoch, so [`RpcClient::close`] cancels everything
//! still in flight.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use arc_swap::ArcSwapOption;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, debug_span, error, info, trace, warn, Instrument, Span};
use url::Url;
use uuid::Uuid;

use evmrpc_core::base::RpcClientBase;
use evmrpc_core::chain::ChainType;
use evmrpc_core::context::RequestContext;
use evmrpc_core::error::{CallError, ClientError, TransportError};
use evmrpc_core::request::BatchElem;
use evmrpc_core::transport::{PubSubTransport, RpcTransport};
use evmrpc_core::types::{BlockTag, Head};
use evmrpc_http::HttpRpcClient;
use evmrpc_ws::WsRpcClient;

use crate::config::{redacted, ClientConfig};
use crate::metrics::RpcMetrics;

/// One transport slot: the endpoint plus, once dialed, its connection.
pub(crate) struct RawClient {
    pub(crate) uri: Url,
    pub(crate) rpc: Option<Arc<dyn RpcTransport>>,
    pub(crate) pubsub: Option<Arc<dyn PubSubTransport>>,
}

impl RawClient {
    fn undialed(uri: Url) -> Self {
        Self {
            uri,
            rpc: None,
            pubsub: None,
        }
    }
}

/// Snapshot taken at the start of an operation.
///
/// Holds its own references to the slots, so a concurrent dial never changes
/// the connection an operation is using.
pub(crate) struct QueryScope {
    pub(crate) ctx: RequestContext,
    pub(crate) lifecycle: CancellationToken,
    pub(crate) ws: Option<Arc<RawClient>>,
    pub(crate) http: Option<Arc<RawClient>>,
}

struct Inner {
    cfg: ClientConfig,
    ws: ArcSwapOption<RawClient>,
    /// Size-limited WebSocket slot; never dialed, closed with the others.
    limited_ws: ArcSwapOption<RawClient>,
    http: ArcSwapOption<RawClient>,
    base: RpcClientBase,
    metrics: RpcMetrics,
    label: String,
    rpc_domain: String,
}

/// Ethereum JSON-RPC client for a single node.
///
/// Cheap to clone; clones share connections, subscriptions and chain-info
/// bookkeeping.
#[derive(Clone)]
pub struct RpcClient {
    inner: Arc<Inner>,
}

impl RpcClient {
    /// Create a client. No connection is opened until [`dial`](Self::dial).
    pub fn new(cfg: ClientConfig, ws_url: Option<Url>, http_url: Option<Url>) -> Self {
        let metrics = RpcMetrics::global(cfg.chain_id, &cfg.name);
        Self::with_metrics(cfg, ws_url, http_url, metrics)
    }

    /// Like [`new`](Self::new), recording into the given instruments.
    pub fn with_metrics(
        cfg: ClientConfig,
        ws_url: Option<Url>,
        http_url: Option<Url>,
        metrics: RpcMetrics,
    ) -> Self {
        let mut label = format!("({}){}", cfg.tier, cfg.name);
        if let Some(ws) = &ws_url {
            label.push(':');
            label.push_str(&redacted(ws));
        }
        if let Some(http) = &http_url {
            label.push(':');
            label.push_str(&redacted(http));
        }
        let rpc_domain = http_url
            .as_ref()
            .or(ws_url.as_ref())
            .and_then(Url::host_str)
            .unwrap_or_default()
            .to_string();

        if http_url.is_none() && cfg.external_request_max_response_size > 0 {
            error!(
                node = %label,
                max_response_size = cfg.external_request_max_response_size,
                "external request response size limit is set, but only a WS url is configured; \
                 the limit cannot be enforced and the node is exposed to oversized responses"
            );
        }

        let base = RpcClientBase::new(cfg.base_config());
        Self {
            inner: Arc::new(Inner {
                ws: ArcSwapOption::new(ws_url.clone().map(|u| Arc::new(RawClient::undialed(u)))),
                limited_ws: ArcSwapOption::new(ws_url.map(|u| Arc::new(RawClient::undialed(u)))),
                http: ArcSwapOption::new(http_url.map(|u| Arc::new(RawClient::undialed(u)))),
                base,
                metrics,
                label,
                rpc_domain,
                cfg,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.cfg.name
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.cfg
    }

    pub fn chain_type(&self) -> ChainType {
        self.inner.cfg.chain_type
    }

    pub(crate) fn base(&self) -> &RpcClientBase {
        &self.inner.base
    }

    pub(crate) fn rpc_timeout(&self) -> Duration {
        self.inner.cfg.rpc_timeout
    }

    pub(crate) fn large_payload_timeout(&self) -> Duration {
        self.inner.cfg.large_payload_rpc_timeout
    }

    /// Open the WebSocket connection (if configured) and set up the HTTP
    /// client (if configured).
    pub async fn dial(&self, caller: &RequestContext) -> Result<(), ClientError> {
        let scope = self.acquire_query_ctx(caller, self.rpc_timeout());
        if scope.ws.is_none() && scope.http.is_none() {
            return Err(ClientError::MissingEndpoints);
        }

        if let Some(ws) = &scope.ws {
            let url = redacted(&ws.uri);
            self.inner.metrics.record_dial();
            debug!(ws_uri = %url, "RPC dial: websocket");
            let conn = match WsRpcClient::connect(&scope.ctx, &ws.uri).await {
                Ok(conn) => Arc::new(conn),
                Err(source) => {
                    self.inner.metrics.record_dial_result(false);
                    let err = ClientError::Dial {
                        kind: "websocket",
                        url,
                        source,
                    };
                    info!(error = %err, "RPC dial failed");
                    return Err(err);
                }
            };
            self.inner.ws.store(Some(Arc::new(RawClient {
                uri: ws.uri.clone(),
                rpc: Some(conn.clone()),
                pubsub: Some(conn),
            })));
            self.inner.metrics.record_dial_result(true);
        }

        if scope.http.is_some() {
            self.dial_http()?;
        }
        info!(node = %self, "RPC dial: success");
        Ok(())
    }

    /// Set up the HTTP client. Performs no network I/O; fails only on a URL
    /// the HTTP transport cannot use.
    pub fn dial_http(&self) -> Result<(), ClientError> {
        let Some(http) = self.inner.http.load_full() else {
            return Err(ClientError::MissingEndpoints);
        };
        let url = redacted(&http.uri);
        self.inner.metrics.record_dial();
        debug!(http_uri = %url, "RPC dial: http");

        let client = HttpRpcClient::new(http.uri.clone()).map_err(|source| {
            self.inner.metrics.record_dial_result(false);
            ClientError::Dial {
                kind: "HTTP",
                url,
                source,
            }
        })?;
        self.inner.http.store(Some(Arc::new(RawClient {
            uri: http.uri.clone(),
            rpc: Some(Arc::new(client)),
            pubsub: None,
        })));
        self.inner.metrics.record_dial_result(true);
        Ok(())
    }

    /// Advance the lifecycle epoch and close the WebSocket connections.
    ///
    /// In-flight calls are cancelled and subscriptions torn down; the
    /// highest-user-observation watermark survives. The client can be dialed
    /// again afterwards.
    pub fn close(&self) {
        self.inner.base.close();
        for slot in [&self.inner.ws, &self.inner.limited_ws] {
            if let Some(pubsub) = slot.load_full().and_then(|raw| raw.pubsub.clone()) {
                pubsub.close();
            }
        }
    }

    /// Derive a query context from `parent` bounded by `timeout` and the
    /// current lifecycle epoch, together with a snapshot of the slots.
    pub(crate) fn acquire_query_ctx(&self, parent: &RequestContext, timeout: Duration) -> QueryScope {
        let (ctx, lifecycle) = self.inner.base.acquire_query_ctx(parent, timeout);
        QueryScope {
            ctx,
            lifecycle,
            ws: self.inner.ws.load_full(),
            http: self.inner.http.load_full(),
        }
    }

    /// The transport to run a read on: HTTP when dialed, the WebSocket
    /// connection otherwise.
    pub(crate) fn live_client(
        &self,
        parent: &RequestContext,
        timeout: Duration,
    ) -> Result<(RequestContext, Arc<dyn RpcTransport>), ClientError> {
        let scope = self.acquire_query_ctx(parent, timeout);
        if let Some(rpc) = scope.http.as_ref().and_then(|c| c.rpc.clone()) {
            return Ok((scope.ctx, rpc));
        }
        if let Some(limit) = scope.ctx.response_size_limit() {
            warn!(
                node = %self,
                limit,
                "RPC Request size limit is set, but ignored because only WS URL is configured. \
                 Consider configuring an HTTP URL to enforce the limit"
            );
        }
        match scope.ws.as_ref().and_then(|c| c.rpc.clone()) {
            Some(rpc) => Ok((scope.ctx, rpc)),
            None => Err(ClientError::call(TransportError::Closed)),
        }
    }

    /// Apply the external-request response-size limit.
    pub(crate) fn wrap_ctx(&self, ctx: &RequestContext, is_external_request: bool) -> RequestContext {
        if is_external_request {
            ctx.with_response_size_limit(self.inner.cfg.external_request_max_response_size)
        } else {
            ctx.clone()
        }
    }

    /// Wrap a transport failure in the generic `RPC call failed` envelope.
    pub(crate) fn wrap_error(&self, err: TransportError) -> ClientError {
        let err = ClientError::call(err);
        info!(node = %self, error = %err, "RPC call failed");
        err
    }

    pub(crate) fn request_span(&self) -> Span {
        debug_span!(
            "rpc_request",
            request_id = %Uuid::new_v4(),
            node = %self.inner.label,
            chain_id = self.inner.cfg.chain_id,
        )
    }

    pub(crate) fn log_result(&self, call_name: &str, elapsed: Duration, err: Option<&ClientError>) {
        self.inner
            .metrics
            .record_call(&self.inner.rpc_domain, call_name, err.is_none(), elapsed);
        match err {
            None => trace!(call = call_name, ?elapsed, "RPC call success"),
            Some(err) => debug!(call = call_name, ?elapsed, error = %err, "RPC call failure"),
        }
    }

    /// Run one call and decode its result; `Ok(None)` means the node
    /// returned `null`.
    pub(crate) async fn exec<T: DeserializeOwned>(
        &self,
        ctx: &RequestContext,
        timeout: Duration,
        call_name: &str,
        method: &str,
        params: Vec<Value>,
    ) -> Result<Option<T>, ClientError> {
        let (ctx, rpc) = self.live_client(ctx, timeout)?;
        async {
            debug!(method, args = ?params, "RPC call: {call_name}");
            let start = Instant::now();
            let res = match rpc.request(&ctx, method, params).await {
                Ok(value) => decode(value),
                Err(e) => Err(e),
            }
            .map_err(|e| self.wrap_error(e));
            self.log_result(call_name, start.elapsed(), res.as_ref().err());
            res
        }
        .instrument(self.request_span())
        .await
    }

    /// Call `method` with the large-payload timeout.
    pub async fn call_context<T: DeserializeOwned>(
        &self,
        ctx: &RequestContext,
        method: &str,
        params: Vec<Value>,
    ) -> Result<Option<T>, ClientError> {
        self.exec(ctx, self.large_payload_timeout(), "CallContext", method, params)
            .await
    }

    /// Execute `batch` in one round trip with the large-payload timeout.
    ///
    /// Per-element failures land in each element. On chains with custom
    /// finality, elements requesting the `finalized` block are answered with
    /// the chain's own finalized block, fetched before the batch runs, and
    /// `eth_getLogs` is rejected.
    pub async fn batch_call_context(
        &self,
        ctx: &RequestContext,
        batch: &mut [BatchElem],
    ) -> Result<(), ClientError> {
        let chain = self.chain_type();
        let mut custom_finalized = None;
        if chain.caps().custom_finality {
            if batch.iter().any(|el| el.method == "eth_getLogs") {
                error!(node = %self, %chain, "eth_getLogs is not supported in batch calls");
                return Err(ClientError::BatchLogsUnsupported(chain));
            }
            if batch.iter().any(is_requesting_finalized_block) {
                let raw = self
                    .astar_latest_finalized_block(ctx)
                    .await
                    .map_err(|e| ClientError::AstarFinality(Box::new(e)))?;
                custom_finalized = Some(raw);
            }
        }

        let (ctx, rpc) = self.live_client(ctx, self.large_payload_timeout())?;
        async {
            debug!(
                n_batch_elems = batch.len(),
                batch_elems = ?batch.iter().map(|el| el.method.as_str()).collect::<Vec<_>>(),
                "RPC call: BatchCallContext"
            );
            let start = Instant::now();
            let res = rpc
                .batch_call(&ctx, &mut *batch)
                .await
                .map_err(|e| self.wrap_error(e));
            self.log_result("BatchCallContext", start.elapsed(), res.as_ref().err());
            res
        }
        .instrument(self.request_span())
        .await?;

        if let Some(raw) = custom_finalized {
            for el in batch.iter_mut().filter(|el| is_requesting_finalized_block(el)) {
                el.error = None;
                match serde_json::from_value::<Option<Head>>(raw.clone()) {
                    Ok(_) => el.result = Some(raw.clone()),
                    Err(e) => {
                        el.result = None;
                        el.error = Some(TransportError::Other(format!(
                            "failed to unmarshal astar finalized block into provided struct: {e}"
                        )));
                    }
                }
            }
        }
        Ok(())
    }

    /// Raw finalized block of a chain with custom finality:
    /// `chain_getFinalizedHead` → `chain_getHeader` → `eth_getBlockByNumber`.
    pub(crate) async fn astar_latest_finalized_block(
        &self,
        ctx: &RequestContext,
    ) -> Result<Value, ClientError> {
        #[derive(Deserialize)]
        struct SubstrateHeader {
            #[serde(default)]
            number: Option<String>,
        }

        let hash: Value = self
            .call_context(ctx, "chain_getFinalizedHead", vec![])
            .await?
            .unwrap_or(Value::Null);
        let header: Option<SubstrateHeader> = self
            .call_context(ctx, "chain_getHeader", vec![hash, json!(false)])
            .await?;
        let Some(number) = header.and_then(|h| h.number) else {
            return Err(ClientError::call(CallError::Other(
                "expected non empty head number of finalized block".into(),
            )));
        };

        let block: Option<Value> = self
            .exec(
                ctx,
                self.rpc_timeout(),
                "BlockByNumber",
                "eth_getBlockByNumber",
                vec![json!(number), json!(false)],
            )
            .await?;
        Ok(block.unwrap_or(Value::Null))
    }
}

impl fmt::Display for RpcClient {
    /// `(tier)name:ws-uri:http-uri` with passwords redacted.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.inner.label)
    }
}

impl fmt::Debug for RpcClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RpcClient")
            .field("node", &self.inner.label)
            .field("chain_id", &self.inner.cfg.chain_id)
            .field("chain_type", &self.inner.cfg.chain_type)
            .finish_non_exhaustive()
    }
}

fn decode<T: DeserializeOwned>(value: Value) -> Result<Option<T>, TransportError> {
    if value.is_null() {
        return Ok(None);
    }
    serde_json::from_value(value)
        .map(Some)
        .map_err(TransportError::Deserialization)
}

fn is_requesting_finalized_block(el: &BatchElem) -> bool {
    el.method == "eth_getBlockByNumber"
        && el.args.first().and_then(Value::as_str) == Some(BlockTag::Finalized.as_str())
}

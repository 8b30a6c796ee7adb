//! Head and log subscriptions.
//!
//! With a poll interval configured, heads are delivered by polling through
//! [`RpcClientBase`](evmrpc_core::base::RpcClientBase); otherwise they are
//! pushed over the WebSocket connection through a [`Forwarder`]. Every
//! subscription is registered under the lifecycle epoch current at
//! subscribe time and dies with it.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::future::ready;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{debug, Instrument};

use evmrpc_core::base::{ChainInfo, HeadSource};
use evmrpc_core::context::RequestContext;
use evmrpc_core::error::{ClientError, TransportError};
use evmrpc_core::subscription::ManagedSubscription;
use evmrpc_core::transport::PubSubTransport;
use evmrpc_core::types::{FilterQuery, Head, Log};

use crate::client::{QueryScope, RpcClient};
use crate::forwarder::Forwarder;
use crate::logs::make_log_valid;

/// Capacity of the channel heads are delivered on.
const HEAD_BUFFER: usize = 1;

#[async_trait]
impl HeadSource for RpcClient {
    async fn latest_block(&self, ctx: &RequestContext) -> Result<Head, ClientError> {
        self.block_by_number(ctx, None).await
    }

    async fn latest_finalized_block(&self, ctx: &RequestContext) -> Result<Head, ClientError> {
        RpcClient::latest_finalized_block(self, ctx).await
    }
}

impl RpcClient {
    /// Deliver new heads, stamped with the chain id.
    ///
    /// Each delivered head is also recorded as a head observation.
    pub async fn subscribe_to_heads(
        &self,
        ctx: &RequestContext,
    ) -> Result<(mpsc::Receiver<Head>, ManagedSubscription), ClientError> {
        if !self.config().new_heads_poll_interval.is_zero() {
            debug!(node = %self, "polling for new heads");
            return self.base().subscribe_to_heads(ctx, Arc::new(self.clone()));
        }

        let scope = self.acquire_query_ctx(ctx, self.rpc_timeout());
        let pubsub = ws_pubsub(&scope, "SubscribeNewHead")?;

        let (tx, rx) = mpsc::channel(HEAD_BUFFER);
        let client = self.clone();
        let observe_ctx = scope.ctx.clone();
        let lifecycle = scope.lifecycle.clone();
        let forwarder = Forwarder::new(tx, move |raw: Value| {
            let res = serde_json::from_value::<Head>(raw)
                .map_err(|e| client.wrap_error(TransportError::Deserialization(e)))
                .map(|head| {
                    let head = client.stamp(head);
                    client.base().on_new_head(&observe_ctx, &lifecycle, &head);
                    Some(head)
                });
            ready(res)
        });

        let sub = self
            .eth_subscribe(&scope, pubsub, forwarder, vec![json!("newHeads")])
            .await?;
        Ok((rx, sub))
    }

    /// Deliver the finalized head each time it advances.
    ///
    /// There is no push topic for finalized heads, so without a poll interval
    /// every pushed new head triggers a fetch of the latest finalized block.
    pub async fn subscribe_to_finalized_heads(
        &self,
        ctx: &RequestContext,
    ) -> Result<(mpsc::Receiver<Head>, ManagedSubscription), ClientError> {
        if !self.config().finalized_block_poll_interval.is_zero() {
            debug!(node = %self, "polling for finalized heads");
            return self
                .base()
                .subscribe_to_finalized_heads(ctx, Arc::new(self.clone()));
        }

        let scope = self.acquire_query_ctx(ctx, self.rpc_timeout());
        let pubsub = ws_pubsub(&scope, "SubscribeFinalizedHeads")?;

        let (tx, rx) = mpsc::channel(HEAD_BUFFER);
        let client = self.clone();
        let fetch_ctx = ctx.detached().with_cancellation(scope.lifecycle.clone());
        let last = Arc::new(AtomicI64::new(-1));
        let forwarder = Forwarder::new(tx, move |_new_head: Value| {
            let client = client.clone();
            let ctx = fetch_ctx.clone();
            let last = last.clone();
            async move {
                let head = RpcClient::latest_finalized_block(&client, &ctx).await?;
                let advanced = last.fetch_max(head.number, Ordering::SeqCst) < head.number;
                Ok(advanced.then_some(head))
            }
        });

        let sub = self
            .eth_subscribe(&scope, pubsub, forwarder, vec![json!("newHeads")])
            .await?;
        Ok((rx, sub))
    }

    /// Deliver logs matching `query` into `sink`, with log indices normalized
    /// for the chain.
    pub async fn subscribe_filter_logs(
        &self,
        ctx: &RequestContext,
        query: &FilterQuery,
        sink: mpsc::Sender<Log>,
    ) -> Result<ManagedSubscription, ClientError> {
        let scope = self.acquire_query_ctx(ctx, self.rpc_timeout());
        let pubsub = ws_pubsub(&scope, "SubscribeFilterLogs")?;
        let filter = query.to_filter_arg()?;

        let chain = self.chain_type();
        let client = self.clone();
        let forwarder = Forwarder::new(sink, move |raw: Value| {
            let res = serde_json::from_value::<Log>(raw)
                .map_err(|e| client.wrap_error(TransportError::Deserialization(e)))
                .and_then(|mut log| {
                    make_log_valid(chain, &mut log)?;
                    Ok(Some(log))
                });
            ready(res)
        });

        self.eth_subscribe(&scope, pubsub, forwarder, vec![json!("logs"), filter])
            .await
    }

    /// Open an `eth_subscribe` subscription, forward it and register it
    /// under the scope's lifecycle epoch.
    async fn eth_subscribe<T, F, Fut>(
        &self,
        scope: &QueryScope,
        pubsub: Arc<dyn PubSubTransport>,
        forwarder: Forwarder<T, F>,
        params: Vec<Value>,
    ) -> Result<ManagedSubscription, ClientError>
    where
        T: Send + 'static,
        F: FnMut(Value) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = Result<Option<T>, ClientError>> + Send + 'static,
    {
        async {
            debug!(args = ?params, "RPC call: EthSubscribe");
            let start = Instant::now();
            let upstream = pubsub
                .subscribe(&scope.ctx, params, forwarder.source())
                .await;
            let wrapper = self.clone();
            let res = forwarder.start(upstream, move |e| wrapper.wrap_error(e));
            self.log_result("EthSubscribe", start.elapsed(), res.as_ref().err());
            let sub = res?;
            self.base().register_sub(Box::new(sub), &scope.lifecycle)
        }
        .instrument(self.request_span())
        .await
    }

    /// Unsubscribe every registered subscription except `keep`.
    pub fn unsubscribe_all_except(&self, keep: &[ManagedSubscription]) {
        self.base().unsubscribe_all_except(keep);
    }

    /// Number of live registered subscriptions.
    pub fn subscriber_count(&self) -> usize {
        self.base().subscriber_count()
    }

    /// `(latest, highest_user_observations)`.
    pub fn latest_chain_info(&self) -> (ChainInfo, ChainInfo) {
        self.base().latest_chain_info()
    }
}

fn ws_pubsub(
    scope: &QueryScope,
    operation: &'static str,
) -> Result<Arc<dyn PubSubTransport>, ClientError> {
    scope
        .ws
        .as_ref()
        .and_then(|ws| ws.pubsub.clone())
        .ok_or(ClientError::WsRequired(operation))
}

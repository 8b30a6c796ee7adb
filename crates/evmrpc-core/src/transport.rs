//! The `RpcTransport` trait, the core abstraction for both HTTP and WS.

use std::collections::HashMap;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::context::RequestContext;
use crate::error::TransportError;
use crate::request::{BatchElem, JsonRpcRequest, JsonRpcResponse};
use crate::subscription::RawSubscription;

/// The central async trait every RPC transport must implement.
///
/// # Thread Safety
/// Implementations must be `Send + Sync` for use across Tokio tasks.
///
/// # Object Safety
/// The trait is object-safe and can be stored as `Arc<dyn RpcTransport>`.
#[async_trait]
pub trait RpcTransport: Send + Sync + 'static {
    /// Send a single JSON-RPC request and return the response.
    async fn send(
        &self,
        ctx: &RequestContext,
        req: JsonRpcRequest,
    ) -> Result<JsonRpcResponse, TransportError>;

    /// Send a batch of JSON-RPC requests in one round trip.
    ///
    /// Default implementation sends them sequentially; override for true batching.
    async fn send_batch(
        &self,
        ctx: &RequestContext,
        reqs: Vec<JsonRpcRequest>,
    ) -> Result<Vec<JsonRpcResponse>, TransportError> {
        let mut responses = Vec::with_capacity(reqs.len());
        for req in reqs {
            responses.push(self.send(ctx, req).await?);
        }
        Ok(responses)
    }

    /// Return the transport's identifier (URL or name).
    fn url(&self) -> &str;

    /// Convenience: call a method and return the raw result.
    async fn request(
        &self,
        ctx: &RequestContext,
        method: &str,
        params: Vec<Value>,
    ) -> Result<Value, TransportError> {
        let resp = self.send(ctx, JsonRpcRequest::new(1, method, params)).await?;
        resp.into_result().map_err(TransportError::Rpc)
    }

    /// Execute `batch` and attach each response to its element by position.
    ///
    /// Returns an error only when the round trip itself fails; node errors
    /// for individual elements land in that element's `error` field.
    async fn batch_call(
        &self,
        ctx: &RequestContext,
        batch: &mut [BatchElem],
    ) -> Result<(), TransportError> {
        if batch.is_empty() {
            return Ok(());
        }
        let reqs = batch
            .iter()
            .enumerate()
            .map(|(i, el)| JsonRpcRequest::new(i as u64 + 1, el.method.clone(), el.args.clone()))
            .collect();
        let resps = self.send_batch(ctx, reqs).await?;

        let mut by_id: HashMap<u64, JsonRpcResponse> = resps
            .into_iter()
            .filter_map(|r| r.id.as_u64().map(|id| (id, r)))
            .collect();
        for (i, el) in batch.iter_mut().enumerate() {
            match by_id.remove(&(i as u64 + 1)) {
                Some(resp) => el.apply(resp),
                None => {
                    el.result = None;
                    el.error = Some(TransportError::Other(
                        "missing response for batch element".into(),
                    ));
                }
            }
        }
        Ok(())
    }
}

/// A transport that can also open push subscriptions (`eth_subscribe`).
#[async_trait]
pub trait PubSubTransport: RpcTransport {
    /// Open a subscription with the given `eth_subscribe` params.
    ///
    /// Every notification payload is pushed onto `sink`. The subscription is
    /// confirmed by the node before this returns.
    async fn subscribe(
        &self,
        ctx: &RequestContext,
        params: Vec<Value>,
        sink: mpsc::Sender<Value>,
    ) -> Result<RawSubscription, TransportError>;

    /// Close the underlying connection. Pending calls fail, subscriptions
    /// receive an error.
    fn close(&self);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::RpcId;

    /// Answers in reverse order and drops the element with id 2.
    struct ShuffledTransport;

    #[async_trait]
    impl RpcTransport for ShuffledTransport {
        async fn send(
            &self,
            _ctx: &RequestContext,
            req: JsonRpcRequest,
        ) -> Result<JsonRpcResponse, TransportError> {
            Ok(JsonRpcResponse {
                jsonrpc: "2.0".into(),
                id: req.id,
                result: Some(Value::from(req.method)),
                error: None,
            })
        }

        async fn send_batch(
            &self,
            _ctx: &RequestContext,
            reqs: Vec<JsonRpcRequest>,
        ) -> Result<Vec<JsonRpcResponse>, TransportError> {
            Ok(reqs
                .into_iter()
                .rev()
                .filter(|r| r.id != RpcId::Number(2))
                .map(|r| JsonRpcResponse {
                    jsonrpc: "2.0".into(),
                    id: r.id,
                    result: Some(Value::from(r.method)),
                    error: None,
                })
                .collect())
        }

        fn url(&self) -> &str {
            "mock://shuffled"
        }
    }

    #[tokio::test]
    async fn batch_call_matches_by_position() {
        let mut batch = vec![
            BatchElem::new("a", vec![]),
            BatchElem::new("b", vec![]),
            BatchElem::new("c", vec![]),
        ];
        ShuffledTransport
            .batch_call(&RequestContext::background(), &mut batch)
            .await
            .unwrap();

        assert_eq!(batch[0].decode::<String>().unwrap().as_deref(), Some("a"));
        assert!(batch[1].error.is_some());
        assert_eq!(batch[2].decode::<String>().unwrap().as_deref(), Some("c"));
    }

    #[tokio::test]
    async fn request_returns_raw_result() {
        let v = ShuffledTransport
            .request(&RequestContext::background(), "eth_chainId", vec![])
            .await
            .unwrap();
        assert_eq!(v, Value::from("eth_chainId"));
    }
}

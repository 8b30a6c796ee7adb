//! HTTP JSON-RPC client backed by `reqwest`.
//!
//! Every round trip goes through [`LimitedTransport`], so a response-size
//! limit attached to the request context is always enforced. Nothing is
//! retried here; failures are surfaced to the caller as-is.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::Value;
use url::Url;

use evmrpc_core::context::RequestContext;
use evmrpc_core::error::TransportError;
use evmrpc_core::request::{JsonRpcError, JsonRpcRequest, JsonRpcResponse};
use evmrpc_core::transport::RpcTransport;

use crate::limited::{LimitedTransport, ResponseBody};

/// HTTP JSON-RPC client.
///
/// Construction performs no network I/O; connections are opened lazily per
/// request.
#[derive(Debug, Clone)]
pub struct HttpRpcClient {
    url: Url,
    url_str: String,
    transport: LimitedTransport,
}

impl HttpRpcClient {
    /// Create a new client for the given JSON-RPC endpoint URL.
    ///
    /// Fails only if the URL is not an `http`/`https` URL.
    pub fn new(url: Url) -> Result<Self, TransportError> {
        Self::with_transport(url, LimitedTransport::new()?)
    }

    pub fn with_transport(url: Url, transport: LimitedTransport) -> Result<Self, TransportError> {
        match url.scheme() {
            "http" | "https" => {}
            other => {
                return Err(TransportError::Http(format!(
                    "unsupported URL scheme {other:?}, expected http or https"
                )))
            }
        }
        if url.host_str().is_none() {
            return Err(TransportError::Http("URL has no host".into()));
        }
        Ok(Self {
            url_str: url.to_string(),
            url,
            transport,
        })
    }

    async fn post<T: DeserializeOwned>(
        &self,
        ctx: &RequestContext,
        payload: Vec<u8>,
    ) -> Result<T, TransportError> {
        let (status, body) = ctx
            .run(self.transport.round_trip(ctx, &self.url, payload))
            .await?;

        if !status.is_success() {
            let text = String::from_utf8_lossy(&body.bytes);
            return Err(TransportError::Http(format!(
                "HTTP {}: {}",
                status.as_u16(),
                text.trim()
            )));
        }
        decode_body(body)
    }
}

/// Decode a (possibly truncated) body.
///
/// A body cut off at the limit still decodes when the delivered prefix is a
/// complete document (a response of exactly the limit size); otherwise the
/// size-limit error is reported instead of the parse error.
fn decode_body<T: DeserializeOwned>(body: ResponseBody) -> Result<T, TransportError> {
    match serde_json::from_slice(&body.bytes) {
        Ok(v) => Ok(v),
        Err(e) => match body.truncated_at {
            Some(limit) => {
                tracing::debug!(limit, read = body.bytes.len(), "response truncated at size limit");
                Err(TransportError::read_limit(limit))
            }
            None => Err(TransportError::Deserialization(e)),
        },
    }
}

#[async_trait]
impl RpcTransport for HttpRpcClient {
    async fn send(
        &self,
        ctx: &RequestContext,
        req: JsonRpcRequest,
    ) -> Result<JsonRpcResponse, TransportError> {
        let payload = serde_json::to_vec(&req)?;
        self.post(ctx, payload).await
    }

    /// True HTTP batch: send all requests as a JSON array in one HTTP call.
    async fn send_batch(
        &self,
        ctx: &RequestContext,
        reqs: Vec<JsonRpcRequest>,
    ) -> Result<Vec<JsonRpcResponse>, TransportError> {
        if reqs.is_empty() {
            return Ok(vec![]);
        }
        let payload = serde_json::to_vec(&reqs)?;
        let value: Value = self.post(ctx, payload).await?;
        match value {
            Value::Array(_) => Ok(serde_json::from_value(value)?),
            // Some nodes reject a whole batch with a single error object.
            Value::Object(ref obj) if obj.contains_key("error") => {
                let resp: JsonRpcResponse = serde_json::from_value(value)?;
                Err(TransportError::Rpc(resp.error.unwrap_or(JsonRpcError {
                    code: -32603,
                    message: "batch rejected".into(),
                    data: None,
                })))
            }
            other => Err(TransportError::Other(format!(
                "unexpected batch response: {other}"
            ))),
        }
    }

    fn url(&self) -> &str {
        &self.url_str
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use evmrpc_core::request::BatchElem;
    use serde_json::json;
    use std::time::Duration;
    use wiremock::matchers::method;
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client(server: &MockServer) -> HttpRpcClient {
        HttpRpcClient::new(Url::parse(&server.uri()).unwrap()).unwrap()
    }

    #[test]
    fn rejects_non_http_urls() {
        assert!(HttpRpcClient::new(Url::parse("ws://localhost:8546").unwrap()).is_err());
        assert!(HttpRpcClient::new(Url::parse("http://localhost:8545").unwrap()).is_ok());
    }

    #[tokio::test]
    async fn single_call() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "jsonrpc": "2.0", "id": 1, "result": "0x10"
            })))
            .mount(&server)
            .await;

        let v = client(&server)
            .request(&RequestContext::background(), "eth_blockNumber", vec![])
            .await
            .unwrap();
        assert_eq!(v, json!("0x10"));
    }

    #[tokio::test]
    async fn node_error_is_rpc_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "jsonrpc": "2.0", "id": 1,
                "error": {"code": -32000, "message": "execution reverted"}
            })))
            .mount(&server)
            .await;

        let err = client(&server)
            .request(&RequestContext::background(), "eth_call", vec![])
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Rpc(ref e) if e.message == "execution reverted"));
    }

    #[tokio::test]
    async fn http_status_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503).set_body_string("unavailable"))
            .mount(&server)
            .await;

        let err = client(&server)
            .request(&RequestContext::background(), "eth_chainId", vec![])
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "HTTP error: HTTP 503: unavailable");
    }

    #[tokio::test]
    async fn oversized_response_fails_with_limit_error() {
        let server = MockServer::start().await;
        let big = "ab".repeat(1024);
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "jsonrpc": "2.0", "id": 1, "result": big
            })))
            .mount(&server)
            .await;

        let c = client(&server);
        let limited = RequestContext::background().with_response_size_limit(100);
        let err = c.request(&limited, "eth_getCode", vec![]).await.unwrap_err();
        assert!(err.is_response_too_large());
        assert!(err.to_string().contains("reached read limit of 100 bytes"));

        // unlimited context reads the same body fine
        let v = c
            .request(&RequestContext::background(), "eth_getCode", vec![])
            .await
            .unwrap();
        assert_eq!(v.as_str().map(str::len), Some(2048));
    }

    #[tokio::test]
    async fn response_of_exactly_limit_size_decodes() {
        let server = MockServer::start().await;
        let body = r#"{"jsonrpc":"2.0","id":1,"result":"0x1"}"#;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(body, "application/json"))
            .mount(&server)
            .await;

        let ctx = RequestContext::background().with_response_size_limit(body.len() as u32);
        let v = client(&server).request(&ctx, "eth_chainId", vec![]).await.unwrap();
        assert_eq!(v, json!("0x1"));
    }

    #[tokio::test]
    async fn batch_results_are_matched_by_id() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                {"jsonrpc": "2.0", "id": 2, "error": {"code": -32000, "message": "boom"}},
                {"jsonrpc": "2.0", "id": 1, "result": "0x1"}
            ])))
            .mount(&server)
            .await;

        let mut batch = vec![
            BatchElem::new("eth_chainId", vec![]),
            BatchElem::new("eth_call", vec![]),
        ];
        client(&server)
            .batch_call(&RequestContext::background(), &mut batch)
            .await
            .unwrap();
        assert_eq!(batch[0].decode::<String>().unwrap().as_deref(), Some("0x1"));
        assert!(matches!(batch[1].error, Some(TransportError::Rpc(_))));
    }

    #[tokio::test]
    async fn deadline_bounds_the_round_trip() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"jsonrpc": "2.0", "id": 1, "result": "0x1"}))
                    .set_delay(Duration::from_secs(5)),
            )
            .mount(&server)
            .await;

        let ctx = RequestContext::background().with_timeout(Duration::from_millis(100));
        let err = client(&server)
            .request(&ctx, "eth_chainId", vec![])
            .await
            .unwrap_err();
        assert!(err.is_timeout());
    }
}

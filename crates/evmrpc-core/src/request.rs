//! JSON-RPC 2.0 wire types.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::TransportError;

/// JSON-RPC request ID: string, number or null.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RpcId {
    Number(u64),
    String(String),
    Null,
}

impl RpcId {
    pub fn number(n: u64) -> Self {
        Self::Number(n)
    }

    /// Numeric value of the id, if it is a number.
    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Self::Number(n) => Some(*n),
            _ => None,
        }
    }
}

impl std::fmt::Display for RpcId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Number(n) => write!(f, "{n}"),
            Self::String(s) => write!(f, "{s}"),
            Self::Null => write!(f, "null"),
        }
    }
}

/// A single JSON-RPC parameter value.
pub type RpcParam = Value;

/// A JSON-RPC 2.0 request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    pub method: String,
    pub params: Vec<RpcParam>,
    pub id: RpcId,
}

impl JsonRpcRequest {
    /// Create a new JSON-RPC 2.0 request.
    pub fn new(id: u64, method: impl Into<String>, params: Vec<RpcParam>) -> Self {
        Self {
            jsonrpc: "2.0".into(),
            method: method.into(),
            params,
            id: RpcId::Number(id),
        }
    }
}

/// A JSON-RPC 2.0 error object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl std::fmt::Display for JsonRpcError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "JSON-RPC error {}: {}", self.code, self.message)
    }
}

/// A JSON-RPC 2.0 response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,
    pub id: RpcId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

impl JsonRpcResponse {
    /// Returns `true` if this is a successful response (no error object).
    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }

    /// Unwrap the result value or return the node's error.
    ///
    /// A response with neither field set yields `Value::Null`, which callers
    /// treat as "not found".
    pub fn into_result(self) -> Result<Value, JsonRpcError> {
        if let Some(err) = self.error {
            Err(err)
        } else {
            Ok(self.result.unwrap_or(Value::Null))
        }
    }
}

/// One element of a batch round trip.
///
/// After the batch completes, exactly one of `result` / `error` is set for
/// every element; elements are matched back to responses by position in the
/// submitted slice, never by arrival order.
#[derive(Debug)]
pub struct BatchElem {
    pub method: String,
    pub args: Vec<RpcParam>,
    /// Raw JSON result filled in by the batch call.
    pub result: Option<Value>,
    /// Per-element failure. Never fails sibling elements.
    pub error: Option<TransportError>,
}

impl BatchElem {
    pub fn new(method: impl Into<String>, args: Vec<RpcParam>) -> Self {
        Self {
            method: method.into(),
            args,
            result: None,
            error: None,
        }
    }

    /// Decode the raw result. `Ok(None)` means the node returned `null`.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<Option<T>, TransportError> {
        match &self.result {
            None | Some(Value::Null) => Ok(None),
            Some(v) => serde_json::from_value(v.clone())
                .map(Some)
                .map_err(TransportError::Deserialization),
        }
    }

    /// Fill this element from the matching response.
    pub fn apply(&mut self, resp: JsonRpcResponse) {
        match resp.into_result() {
            Ok(v) => {
                self.result = Some(v);
                self.error = None;
            }
            Err(e) => {
                self.result = None;
                self.error = Some(TransportError::Rpc(e));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_serialization() {
        let req = JsonRpcRequest::new(7, "eth_getBlockByNumber", vec![Value::from("latest"), Value::Bool(false)]);
        let json = serde_json::to_string(&req).unwrap();
        assert!(json.contains("\"jsonrpc\":\"2.0\""));
        assert!(json.contains("\"params\":[\"latest\",false]"));
        assert!(json.contains("\"id\":7"));
    }

    #[test]
    fn response_without_result_is_null() {
        let resp: JsonRpcResponse = serde_json::from_str(r#"{"jsonrpc":"2.0","id":1}"#).unwrap();
        assert!(resp.is_ok());
        assert_eq!(resp.into_result().unwrap(), Value::Null);
    }

    #[test]
    fn response_into_result_error() {
        let resp = JsonRpcResponse {
            jsonrpc: "2.0".into(),
            id: RpcId::Number(1),
            result: None,
            error: Some(JsonRpcError {
                code: -32000,
                message: "execution reverted".into(),
                data: None,
            }),
        };
        assert!(!resp.is_ok());
        let err = resp.into_result().unwrap_err();
        assert_eq!(err.code, -32000);
    }

    #[test]
    fn batch_elem_apply_and_decode() {
        let mut elem = BatchElem::new("eth_blockNumber", vec![]);
        elem.apply(JsonRpcResponse {
            jsonrpc: "2.0".into(),
            id: RpcId::Number(1),
            result: Some(Value::from("0x10")),
            error: None,
        });
        assert!(elem.error.is_none());
        assert_eq!(elem.decode::<String>().unwrap().as_deref(), Some("0x10"));

        elem.apply(JsonRpcResponse {
            jsonrpc: "2.0".into(),
            id: RpcId::Number(1),
            result: None,
            error: Some(JsonRpcError { code: -1, message: "boom".into(), data: None }),
        });
        assert!(elem.result.is_none());
        assert!(matches!(elem.error, Some(TransportError::Rpc(_))));
    }

    #[test]
    fn batch_elem_null_decodes_to_none() {
        let mut elem = BatchElem::new("eth_getBlockByNumber", vec![]);
        elem.result = Some(Value::Null);
        assert!(elem.decode::<serde_json::Map<String, Value>>().unwrap().is_none());
    }
}

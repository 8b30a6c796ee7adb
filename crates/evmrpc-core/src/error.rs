//! Transport-level and client-level error types.

use std::error::Error as StdError;

use alloy_primitives::B256;
use thiserror::Error;

use crate::chain::ChainType;
use crate::request::JsonRpcError;
use crate::types::ConfidenceLevel;

/// Sentinel carried by every size-limit failure.
///
/// Callers detect an oversized response by looking for this type in the
/// error's source chain (see [`ClientError::is_response_too_large`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("response is too large")]
pub struct ResponseTooLarge;

/// Errors that can occur during an RPC transport operation.
#[derive(Debug, Error)]
pub enum TransportError {
    /// HTTP request failed (connection refused, bad status, body read error).
    #[error("HTTP error: {0}")]
    Http(String),

    /// WebSocket connection/send/receive error.
    #[error("WebSocket error: {0}")]
    WebSocket(String),

    /// JSON-RPC protocol-level error returned by the node.
    #[error("RPC error {}: {}", .0.code, .0.message)]
    Rpc(JsonRpcError),

    /// The request context was cancelled (caller or lifecycle epoch).
    #[error("context canceled")]
    Cancelled,

    /// The request context deadline passed before a response arrived.
    #[error("context deadline exceeded")]
    DeadlineExceeded,

    /// The underlying connection was closed.
    #[error("client is closed")]
    Closed,

    /// The response body exceeded the per-request byte limit.
    #[error("reached read limit of {limit} bytes: {source}")]
    ReadLimit {
        limit: u64,
        #[source]
        source: ResponseTooLarge,
    },

    /// Response could not be deserialized.
    #[error("{0}")]
    Deserialization(#[from] serde_json::Error),

    /// An unexpected error.
    #[error("{0}")]
    Other(String),
}

impl TransportError {
    /// Build the size-limit failure for a limit of `limit` bytes.
    pub fn read_limit(limit: u64) -> Self {
        Self::ReadLimit {
            limit,
            source: ResponseTooLarge,
        }
    }

    /// Returns `true` if the proximate cause is a deadline.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::DeadlineExceeded)
    }

    /// Returns `true` if this is a node-side execution error.
    pub fn is_execution_error(&self) -> bool {
        matches!(self, Self::Rpc(_))
    }

    /// Returns `true` if the response-size limit was hit.
    pub fn is_response_too_large(&self) -> bool {
        matches!(self, Self::ReadLimit { .. })
    }

    /// An owned copy of a shared error (e.g. one read from an error signal).
    /// Deserialization failures keep only their message.
    pub fn duplicate(&self) -> Self {
        match self {
            Self::Http(s) => Self::Http(s.clone()),
            Self::WebSocket(s) => Self::WebSocket(s.clone()),
            Self::Rpc(e) => Self::Rpc(e.clone()),
            Self::Cancelled => Self::Cancelled,
            Self::DeadlineExceeded => Self::DeadlineExceeded,
            Self::Closed => Self::Closed,
            Self::ReadLimit { limit, .. } => Self::read_limit(*limit),
            Self::Deserialization(e) => Self::Other(e.to_string()),
            Self::Other(s) => Self::Other(s.clone()),
        }
    }
}

/// The inner cause of a failed RPC round trip.
///
/// Always surfaced wrapped in [`ClientError::Call`], which renders as
/// `RPC call failed: <cause>`.
#[derive(Debug, Error)]
pub enum CallError {
    #[error("remote node timed out: {0}")]
    TimedOut(#[source] TransportError),

    #[error(transparent)]
    Transport(TransportError),

    #[error("not found")]
    NotFound,

    #[error("caller request failed: {0}")]
    CallerRequest(#[source] TransportError),

    #[error("referenced block request failed: {0}")]
    ReferenceRequest(#[source] TransportError),

    #[error(
        "data was requested at block {requested} while max available height with confidence level {confidence} is {max_available}"
    )]
    NotYetAvailable {
        requested: i64,
        confidence: ConfidenceLevel,
        max_available: i64,
    },

    #[error("{0}")]
    Other(String),
}

impl From<TransportError> for CallError {
    fn from(err: TransportError) -> Self {
        if err.is_timeout() {
            Self::TimedOut(err)
        } else {
            Self::Transport(err)
        }
    }
}

/// Errors returned by the RPC client.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("cannot dial rpc client when both ws and http info are missing")]
    MissingEndpoints,

    #[error("invalid {kind} url {url}: {reason}")]
    InvalidUrl {
        kind: &'static str,
        url: String,
        reason: String,
    },

    #[error("error while dialing {kind}: {url}: {source}")]
    Dial {
        kind: &'static str,
        url: String,
        #[source]
        source: TransportError,
    },

    /// Generic envelope for any failed round trip. Carries no node identity
    /// so it can be surfaced to external callers.
    #[error("RPC call failed: {0}")]
    Call(#[source] CallError),

    #[error("failed to execute batch call: {0}")]
    Batch(#[source] Box<ClientError>),

    #[error("failed to get astar latest finalized block: {0}")]
    AstarFinality(#[source] Box<ClientError>),

    #[error("eth_getLogs is not supported in batch calls on {0}")]
    BatchLogsUnsupported(ChainType),

    #[error("confidence level {0} not supported")]
    UnsupportedConfidence(ConfidenceLevel),

    #[error("blockNumber must be non nil and fit into int64. Got: {0}")]
    InvalidBlockNumber(String),

    #[error("referenced block request returned nil. RPC is unhealthy or chain does not support specified tag")]
    NilReferenceBlock,

    #[error("TxIndex of tx {tx_hash} exceeds max supported value of {max}")]
    TxIndexOverflow { tx_hash: B256, max: u32 },

    #[error("log's index {index} of tx {tx_hash} exceeds max supported value of {max}")]
    LogIndexOverflow { index: u64, tx_hash: B256, max: u32 },

    #[error("{operation} not supported for {chain}")]
    Unsupported {
        operation: &'static str,
        chain: ChainType,
    },

    #[error("{0} is not allowed without ws url")]
    WsRequired(&'static str),

    #[error("failed to register subscription - all in-flight requests were canceled")]
    StaleLifecycle,

    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

impl ClientError {
    /// Wrap a call-level failure in the generic `RPC call failed` envelope.
    pub fn call(err: impl Into<CallError>) -> Self {
        Self::Call(err.into())
    }

    /// `RPC call failed: not found`.
    pub fn not_found() -> Self {
        Self::Call(CallError::NotFound)
    }

    /// Returns `true` if the call ended because a deadline passed.
    pub fn is_timeout(&self) -> bool {
        match self {
            Self::Call(CallError::TimedOut(_)) => true,
            Self::Call(CallError::Transport(e))
            | Self::Call(CallError::CallerRequest(e))
            | Self::Call(CallError::ReferenceRequest(e)) => e.is_timeout(),
            Self::Dial { source, .. } => source.is_timeout(),
            Self::Batch(inner) | Self::AstarFinality(inner) => inner.is_timeout(),
            _ => false,
        }
    }

    /// Returns `true` if the node reported no such object.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Call(CallError::NotFound))
    }

    /// Returns `true` if a size-limited read was cut off.
    pub fn is_response_too_large(&self) -> bool {
        source_chain_contains::<ResponseTooLarge>(self)
    }
}

fn source_chain_contains<E: StdError + 'static>(err: &(dyn StdError + 'static)) -> bool {
    let mut cur = Some(err);
    while let Some(e) = cur {
        if e.is::<E>() {
            return true;
        }
        cur = e.source();
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_limit_message_and_sentinel() {
        let err = TransportError::read_limit(42);
        assert_eq!(err.to_string(), "reached read limit of 42 bytes: response is too large");
        assert!(err.is_response_too_large());

        let wrapped = ClientError::call(CallError::CallerRequest(TransportError::read_limit(42)));
        assert!(wrapped.is_response_too_large());
        let wrapped = ClientError::call(TransportError::read_limit(7));
        assert!(wrapped.is_response_too_large());
        assert!(!ClientError::not_found().is_response_too_large());
    }

    #[test]
    fn deadline_is_annotated_as_timeout() {
        let err = ClientError::call(TransportError::DeadlineExceeded);
        assert_eq!(
            err.to_string(),
            "RPC call failed: remote node timed out: context deadline exceeded"
        );
        assert!(err.is_timeout());

        let err = ClientError::call(TransportError::Cancelled);
        assert_eq!(err.to_string(), "RPC call failed: context canceled");
        assert!(!err.is_timeout());
    }

    #[test]
    fn batch_wrapper_keeps_timeout() {
        let err = ClientError::Batch(Box::new(ClientError::call(TransportError::DeadlineExceeded)));
        assert!(err.is_timeout());
        assert!(err.to_string().starts_with("failed to execute batch call: RPC call failed"));
    }

    #[test]
    fn not_yet_available_names_block_level_and_height() {
        let err = ClientError::call(CallError::NotYetAvailable {
            requested: 91,
            confidence: ConfidenceLevel::Finalized,
            max_available: 90,
        });
        assert_eq!(
            err.to_string(),
            "RPC call failed: data was requested at block 91 while max available height with confidence level finalized is 90"
        );
    }
}

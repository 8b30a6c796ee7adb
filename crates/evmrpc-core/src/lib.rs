//! evmrpc-core — foundation traits and types for EvmRPC.
//!
//! # Overview
//!
//! EvmRPC is a resilient Ethereum JSON-RPC client with a WebSocket and an
//! HTTP transport. The core crate defines:
//!
//! - [`RpcTransport`] / [`PubSubTransport`]: the async traits every transport implements
//! - [`RequestContext`]: cancellation, deadline and response-size limit of one call
//! - [`JsonRpcRequest`] / [`JsonRpcResponse`] / [`BatchElem`]: wire types
//! - [`TransportError`] / [`ClientError`]: structured error types
//! - [`ChainType`]: chain families and their capability table
//! - [`types`] module: heads, logs, receipts, call and filter arguments
//! - [`base`] module: lifecycle epochs, subscription registry, head bookkeeping

pub mod base;
pub mod chain;
pub mod context;
pub mod error;
pub mod request;
pub mod subscription;
pub mod transport;
pub mod types;

pub use base::{BaseConfig, ChainInfo, HeadSource, RpcClientBase};
pub use chain::{ChainCaps, ChainType};
pub use context::RequestContext;
pub use error::{CallError, ClientError, ResponseTooLarge, TransportError};
pub use request::{BatchElem, JsonRpcError, JsonRpcRequest, JsonRpcResponse, RpcId, RpcParam};
pub use subscription::{
    err_channel, ErrSender, ErrSignal, ManagedSubscription, RawSubscription, Subscription,
};
pub use transport::{PubSubTransport, RpcTransport};
pub use types::{
    block_number_arg, BlockTag, CallMsg, ConfidenceLevel, FeeHistory, FilterQuery, Head, Header,
    Log, ReadOpts, Receipt, Transaction,
};

//! evmrpc-http — HTTP JSON-RPC transport for EvmRPC.
//!
//! - [`HttpRpcClient`]: `RpcTransport` over HTTP with true batch support
//! - [`LimitedTransport`] / [`LimitedReader`]: per-request response-size limit

pub mod client;
pub mod limited;

pub use client::HttpRpcClient;
pub use limited::{LimitedReader, LimitedTransport, ResponseBody};

//! evmrpc-ws — WebSocket JSON-RPC transport for EvmRPC.
//!
//! - [`WsRpcClient`]: `RpcTransport` + `PubSubTransport` over one socket
//! - [`SubscriptionManager`]: routes `eth_subscription` notifications

pub mod client;
pub mod subscriptions;

pub use client::{WsRpcClient, WsSubscription};
pub use subscriptions::{Dispatch, SubscriptionId, SubscriptionManager};

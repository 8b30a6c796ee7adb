//! evmrpc-client — resilient Ethereum JSON-RPC client for a single node.
//!
//! # Overview
//!
//! [`RpcClient`] talks to one node over a WebSocket and/or an HTTP endpoint:
//!
//! - reads go over HTTP when available, so the per-request response-size
//!   limit for externally triggered reads can be enforced
//! - `*_with_opts` reads can demand `finalized` or `safe` confidence; the
//!   read and its reference-block check travel in one batch
//! - chain quirks are handled in one place: Astar's finalized block comes
//!   from its native finality RPCs, Tron rejects nonce and send calls, and
//!   Sei/Hedera/Rootstock/Pharos log indices are made block-unique
//! - head and log subscriptions are forwarded through a transform stage and
//!   registered under the client's lifecycle epoch; [`RpcClient::close`]
//!   cancels in-flight calls and tears every subscription down
//!
//! # Example
//!
//! ```rust,no_run
//! use evmrpc_client::{ClientConfig, RpcClient};
//! use evmrpc_core::{ConfidenceLevel, ReadOpts, RequestContext};
//! use url::Url;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let client = RpcClient::new(
//!     ClientConfig::default(),
//!     Some(Url::parse("wss://node.example/ws")?),
//!     Some(Url::parse("https://node.example/rpc")?),
//! );
//! let ctx = RequestContext::background();
//! client.dial(&ctx).await?;
//!
//! let head = client
//!     .header_by_number_with_opts(&ctx, Some(19_000_000), ReadOpts::confidence(ConfidenceLevel::Finalized))
//!     .await?;
//! println!("finalized block {} {}", head.number, head.hash);
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod config;
pub mod confidence;
pub mod eth;
pub(crate) mod forwarder;
pub mod logs;
pub mod metrics;
pub mod subscribe;

pub use client::RpcClient;
pub use config::{redacted, ClientConfig, NodeTier};
pub use logs::{make_log_valid, make_logs_valid};
pub use metrics::RpcMetrics;

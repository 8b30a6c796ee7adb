//! Per-node client configuration.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

use evmrpc_core::base::BaseConfig;
use evmrpc_core::chain::ChainType;

/// Role of the node within its pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeTier {
    #[default]
    Primary,
    Sendonly,
}

impl NodeTier {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Primary => "primary",
            Self::Sendonly => "sendonly",
        }
    }
}

impl fmt::Display for NodeTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Configuration of one [`RpcClient`](crate::RpcClient).
///
/// Durations are milliseconds in serialized form; a zero poll interval
/// selects push delivery over the WebSocket connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Node name used in logs, metrics and `Display`.
    pub name: String,
    pub id: i32,
    pub tier: NodeTier,
    /// Stamped on every head this client returns.
    pub chain_id: u64,
    pub chain_type: ChainType,
    /// Timeout of ordinary reads.
    #[serde(with = "duration_ms")]
    pub rpc_timeout: Duration,
    /// Timeout of calls with large request or response bodies
    /// (`eth_call`, `eth_estimateGas`, `eth_sendRawTransaction`, batches).
    #[serde(with = "duration_ms")]
    pub large_payload_rpc_timeout: Duration,
    /// Whether the node answers the `finalized`/`safe` tags.
    pub finality_tag_enabled: bool,
    /// Depth below latest treated as finalized when tags are disabled.
    pub finality_depth: u32,
    /// Depth below latest treated as safe when tags are disabled.
    pub safe_depth: u32,
    /// Response-size limit applied to externally triggered reads; zero
    /// disables it.
    pub external_request_max_response_size: u32,
    #[serde(with = "duration_ms")]
    pub new_heads_poll_interval: Duration,
    #[serde(with = "duration_ms")]
    pub finalized_block_poll_interval: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            name: "evm-node".into(),
            id: 0,
            tier: NodeTier::Primary,
            chain_id: 1,
            chain_type: ChainType::Generic,
            rpc_timeout: Duration::from_secs(30),
            large_payload_rpc_timeout: Duration::from_secs(120),
            finality_tag_enabled: false,
            finality_depth: 50,
            safe_depth: 0,
            external_request_max_response_size: 0,
            new_heads_poll_interval: Duration::ZERO,
            finalized_block_poll_interval: Duration::ZERO,
        }
    }
}

impl ClientConfig {
    pub(crate) fn base_config(&self) -> BaseConfig {
        BaseConfig {
            new_heads_poll_interval: self.new_heads_poll_interval,
            finalized_block_poll_interval: self.finalized_block_poll_interval,
        }
    }
}

/// The URL with any password replaced by `xxxxx`, safe for logs.
pub fn redacted(url: &Url) -> String {
    if url.password().is_none() {
        return url.to_string();
    }
    let mut url = url.clone();
    // only fails for URLs that cannot carry credentials, which have no password
    let _ = url.set_password(Some("xxxxx"));
    url.to_string()
}

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

//! Chain families and their protocol quirks.
//!
//! Every chain-specific branch in the client goes through [`ChainType::caps`],
//! so adding a family means adding one row here.

use serde::{Deserialize, Serialize};

/// Chain family tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChainType {
    #[default]
    Generic,
    Arbitrum,
    Astar,
    Celo,
    Gnosis,
    Hedera,
    Optimism,
    Pharos,
    Rootstock,
    Scroll,
    Sei,
    Tron,
    ZkSync,
}

/// What a chain family can and cannot do over standard Ethereum JSON-RPC.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChainCaps {
    /// Log indices reset per transaction instead of running block-wide.
    pub non_unique_log_index: bool,
    /// The `finalized` tag is weaker than required; use the chain's native
    /// `chain_getFinalizedHead` instead.
    pub custom_finality: bool,
    /// Accounts carry nonces (`eth_getTransactionCount` is meaningful).
    pub supports_nonces: bool,
    /// Raw transactions can be submitted through `eth_sendRawTransaction`.
    pub supports_send_transaction: bool,
    /// Call arguments may carry EIP-1559 fee fields.
    pub accepts_fee_fields_in_calls: bool,
}

const STANDARD: ChainCaps = ChainCaps {
    non_unique_log_index: false,
    custom_finality: false,
    supports_nonces: true,
    supports_send_transaction: true,
    accepts_fee_fields_in_calls: true,
};

impl ChainType {
    pub fn caps(self) -> ChainCaps {
        match self {
            Self::Sei | Self::Hedera | Self::Rootstock | Self::Pharos => ChainCaps {
                non_unique_log_index: true,
                ..STANDARD
            },
            Self::Astar => ChainCaps {
                custom_finality: true,
                ..STANDARD
            },
            Self::Tron => ChainCaps {
                supports_nonces: false,
                supports_send_transaction: false,
                accepts_fee_fields_in_calls: false,
                ..STANDARD
            },
            _ => STANDARD,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Generic => "generic",
            Self::Arbitrum => "arbitrum",
            Self::Astar => "astar",
            Self::Celo => "celo",
            Self::Gnosis => "gnosis",
            Self::Hedera => "hedera",
            Self::Optimism => "optimism",
            Self::Pharos => "pharos",
            Self::Rootstock => "rootstock",
            Self::Scroll => "scroll",
            Self::Sei => "sei",
            Self::Tron => "tron",
            Self::ZkSync => "zksync",
        }
    }
}

impl std::fmt::Display for ChainType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ChainType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let ct = match s.to_ascii_lowercase().as_str() {
            "" | "generic" => Self::Generic,
            "arbitrum" => Self::Arbitrum,
            "astar" => Self::Astar,
            "celo" => Self::Celo,
            "gnosis" | "xdai" => Self::Gnosis,
            "hedera" => Self::Hedera,
            "optimism" | "optimismbedrock" => Self::Optimism,
            "pharos" => Self::Pharos,
            "rootstock" | "rsk" => Self::Rootstock,
            "scroll" => Self::Scroll,
            "sei" => Self::Sei,
            "tron" => Self::Tron,
            "zksync" => Self::ZkSync,
            other => return Err(format!("unknown chain type: {other}")),
        };
        Ok(ct)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_index_quirk_set() {
        let quirky: Vec<_> = [
            ChainType::Generic,
            ChainType::Arbitrum,
            ChainType::Astar,
            ChainType::Hedera,
            ChainType::Pharos,
            ChainType::Rootstock,
            ChainType::Sei,
            ChainType::Tron,
        ]
        .into_iter()
        .filter(|c| c.caps().non_unique_log_index)
        .collect();
        assert_eq!(
            quirky,
            vec![ChainType::Hedera, ChainType::Pharos, ChainType::Rootstock, ChainType::Sei]
        );
    }

    #[test]
    fn tron_has_no_nonces_or_sends() {
        let caps = ChainType::Tron.caps();
        assert!(!caps.supports_nonces);
        assert!(!caps.supports_send_transaction);
        assert!(ChainType::Generic.caps().supports_nonces);
    }

    #[test]
    fn parse_round_trips_display() {
        for ct in [ChainType::Astar, ChainType::Sei, ChainType::ZkSync] {
            assert_eq!(ct.to_string().parse::<ChainType>().unwrap(), ct);
        }
        assert_eq!("".parse::<ChainType>().unwrap(), ChainType::Generic);
        assert!("solana".parse::<ChainType>().is_err());
    }
}

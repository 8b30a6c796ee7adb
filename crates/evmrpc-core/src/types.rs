//! Ethereum protocol types as seen on the wire, plus call-argument encoding.

use alloy_primitives::{Address, Bytes, B256, U256};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::chain::ChainType;
use crate::error::ClientError;

/// Hex-quantity (de)serialization for plain integers.
///
/// Accepts `"0x…"` strings, decimal strings and bare JSON numbers.
pub mod quantity {
    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer, Serializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Str(String),
        Num(u64),
    }

    pub fn parse(s: &str) -> Result<u64, String> {
        match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
            Some("") => Ok(0),
            Some(hex) => u64::from_str_radix(hex, 16).map_err(|e| format!("invalid quantity {s}: {e}")),
            None => s.parse().map_err(|e| format!("invalid quantity {s}: {e}")),
        }
    }

    pub fn serialize<S: Serializer>(v: &u64, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&format!("{v:#x}"))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<u64, D::Error> {
        match Raw::deserialize(d)? {
            Raw::Num(n) => Ok(n),
            Raw::Str(s) => parse(&s).map_err(D::Error::custom),
        }
    }

    /// Same encoding for `i64` fields that must stay non-negative on the wire.
    pub mod signed {
        use super::*;
        use serde::de::Error as _;

        pub fn serialize<S: Serializer>(v: &i64, s: S) -> Result<S::Ok, S::Error> {
            s.serialize_str(&format!("{v:#x}"))
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<i64, D::Error> {
            let n = super::deserialize(d)?;
            i64::try_from(n).map_err(|_| D::Error::custom(format!("quantity {n} overflows int64")))
        }
    }

    pub mod opt {
        use super::*;
        use serde::de::Error as _;

        pub fn serialize<S: Serializer>(v: &Option<u64>, s: S) -> Result<S::Ok, S::Error> {
            match v {
                Some(v) => super::serialize(v, s),
                None => s.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<u64>, D::Error> {
            match Option::<Raw>::deserialize(d)? {
                None => Ok(None),
                Some(Raw::Num(n)) => Ok(Some(n)),
                Some(Raw::Str(s)) => parse(&s).map(Some).map_err(D::Error::custom),
            }
        }
    }
}

/// A block header as returned by `eth_getBlockByNumber(…, false)`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Head {
    #[serde(with = "quantity::signed")]
    pub number: i64,
    #[serde(default)]
    pub hash: B256,
    #[serde(default)]
    pub parent_hash: B256,
    #[serde(default, with = "quantity")]
    pub timestamp: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_fee_per_gas: Option<U256>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_difficulty: Option<U256>,
    /// Stamped locally, never sent by the node.
    #[serde(skip)]
    pub evm_chain_id: Option<u64>,
}

/// Headers and blocks share one representation.
pub type Header = Head;

/// An event log.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Log {
    pub address: Address,
    #[serde(default)]
    pub topics: Vec<B256>,
    #[serde(default)]
    pub data: Bytes,
    #[serde(default, with = "quantity")]
    pub block_number: u64,
    #[serde(default)]
    pub block_hash: B256,
    #[serde(default)]
    pub transaction_hash: B256,
    #[serde(default, with = "quantity")]
    pub transaction_index: u64,
    #[serde(default, with = "quantity")]
    pub log_index: u64,
    #[serde(default)]
    pub removed: bool,
}

/// A transaction receipt.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Receipt {
    pub transaction_hash: B256,
    #[serde(default, with = "quantity")]
    pub transaction_index: u64,
    #[serde(default)]
    pub block_hash: B256,
    #[serde(default, with = "quantity")]
    pub block_number: u64,
    #[serde(default)]
    pub from: Address,
    #[serde(default)]
    pub to: Option<Address>,
    #[serde(default, with = "quantity")]
    pub gas_used: u64,
    #[serde(default, with = "quantity")]
    pub cumulative_gas_used: u64,
    #[serde(default)]
    pub effective_gas_price: Option<U256>,
    #[serde(default)]
    pub contract_address: Option<Address>,
    #[serde(default)]
    pub logs: Vec<Log>,
    #[serde(default, with = "quantity")]
    pub status: u64,
    #[serde(default, rename = "type", with = "quantity")]
    pub tx_type: u64,
}

/// A transaction as returned by `eth_getTransactionByHash`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Transaction {
    pub hash: B256,
    #[serde(default, with = "quantity")]
    pub nonce: u64,
    #[serde(default)]
    pub block_hash: Option<B256>,
    #[serde(default, with = "quantity::opt")]
    pub block_number: Option<u64>,
    #[serde(default, with = "quantity::opt")]
    pub transaction_index: Option<u64>,
    #[serde(default)]
    pub from: Address,
    #[serde(default)]
    pub to: Option<Address>,
    #[serde(default)]
    pub value: U256,
    #[serde(default, with = "quantity")]
    pub gas: u64,
    #[serde(default)]
    pub gas_price: Option<U256>,
    #[serde(default)]
    pub max_fee_per_gas: Option<U256>,
    #[serde(default)]
    pub max_priority_fee_per_gas: Option<U256>,
    #[serde(default)]
    pub input: Bytes,
    #[serde(default, rename = "type", with = "quantity")]
    pub tx_type: u64,
}

/// Result of `eth_feeHistory`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeeHistory {
    #[serde(with = "quantity")]
    pub oldest_block: u64,
    #[serde(default)]
    pub reward: Vec<Vec<U256>>,
    #[serde(default)]
    pub base_fee_per_gas: Vec<U256>,
    #[serde(default)]
    pub gas_used_ratio: Vec<f64>,
}

/// A message call, as used by `eth_call` and `eth_estimateGas`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallMsg {
    pub from: Option<Address>,
    pub to: Option<Address>,
    pub gas: Option<u64>,
    pub gas_price: Option<U256>,
    pub gas_fee_cap: Option<U256>,
    pub gas_tip_cap: Option<U256>,
    pub value: Option<U256>,
    pub data: Option<Bytes>,
}

impl CallMsg {
    /// JSON call object using the backward-compatible `data` key.
    ///
    /// Chains that reject EIP-1559 fee fields on calls get them stripped.
    pub fn to_call_arg(&self, chain: ChainType) -> Value {
        let mut arg = Map::new();
        if let Some(from) = self.from {
            arg.insert("from".into(), json!(from));
        }
        if let Some(to) = self.to {
            arg.insert("to".into(), json!(to));
        }
        if let Some(data) = self.data.as_ref().filter(|d| !d.is_empty()) {
            arg.insert("data".into(), json!(data));
        }
        if let Some(value) = self.value {
            arg.insert("value".into(), json!(value));
        }
        if let Some(gas) = self.gas.filter(|g| *g != 0) {
            arg.insert("gas".into(), Value::from(format!("{gas:#x}")));
        }
        if let Some(gas_price) = self.gas_price {
            arg.insert("gasPrice".into(), json!(gas_price));
        }
        if chain.caps().accepts_fee_fields_in_calls {
            if let Some(cap) = self.gas_fee_cap {
                arg.insert("maxFeePerGas".into(), json!(cap));
            }
            if let Some(tip) = self.gas_tip_cap {
                arg.insert("maxPriorityFeePerGas".into(), json!(tip));
            }
        }
        Value::Object(arg)
    }
}

/// Log filter. Either `block_hash` or a block range, never both.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FilterQuery {
    pub block_hash: Option<B256>,
    /// `None` means genesis.
    pub from_block: Option<i64>,
    /// `None` means latest.
    pub to_block: Option<i64>,
    pub addresses: Vec<Address>,
    /// Per-position alternatives; an empty position matches anything.
    pub topics: Vec<Vec<B256>>,
}

impl FilterQuery {
    pub fn to_filter_arg(&self) -> Result<Value, ClientError> {
        let topics: Vec<Value> = self
            .topics
            .iter()
            .map(|alts| if alts.is_empty() { Value::Null } else { json!(alts) })
            .collect();
        let mut arg = Map::new();
        arg.insert("address".into(), json!(self.addresses));
        arg.insert("topics".into(), Value::Array(topics));

        if let Some(hash) = self.block_hash {
            if self.from_block.is_some() || self.to_block.is_some() {
                return Err(ClientError::InvalidArgument(
                    "cannot specify both BlockHash and FromBlock/ToBlock".into(),
                ));
            }
            arg.insert("blockHash".into(), json!(hash));
        } else {
            let from = match self.from_block {
                None => "0x0".to_string(),
                Some(n) => block_number_arg(Some(n))?,
            };
            arg.insert("fromBlock".into(), Value::from(from));
            arg.insert("toBlock".into(), Value::from(block_number_arg(self.to_block)?));
        }
        Ok(Value::Object(arg))
    }
}

/// Reserved block tags and their negative shorthands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockTag {
    Latest,
    Finalized,
    Safe,
    Pending,
    Earliest,
}

impl BlockTag {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Latest => "latest",
            Self::Finalized => "finalized",
            Self::Safe => "safe",
            Self::Pending => "pending",
            Self::Earliest => "earliest",
        }
    }

    /// Negative sentinel callers use in place of a height.
    pub const fn sentinel(self) -> i64 {
        match self {
            Self::Pending => -1,
            Self::Latest => -2,
            Self::Finalized => -3,
            Self::Safe => -4,
            Self::Earliest => -5,
        }
    }

    pub fn from_sentinel(n: i64) -> Option<Self> {
        match n {
            -1 => Some(Self::Pending),
            -2 => Some(Self::Latest),
            -3 => Some(Self::Finalized),
            -4 => Some(Self::Safe),
            -5 => Some(Self::Earliest),
            _ => None,
        }
    }
}

impl std::fmt::Display for BlockTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Encode a block selector for the wire.
///
/// `None` is `latest`, negative sentinels become their tag, everything else
/// is hex. A negative value that is not a known sentinel is rejected rather
/// than sent as negative hex.
pub fn block_number_arg(number: Option<i64>) -> Result<String, ClientError> {
    match number {
        None => Ok(BlockTag::Latest.as_str().to_string()),
        Some(n) if n < 0 => BlockTag::from_sentinel(n)
            .map(|t| t.as_str().to_string())
            .ok_or_else(|| ClientError::InvalidArgument(format!("unsupported block number {n}"))),
        Some(n) => Ok(format!("{n:#x}")),
    }
}

/// Caller-declared minimum safety level of a read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConfidenceLevel {
    #[default]
    #[serde(alias = "")]
    Unconfirmed,
    Finalized,
    Safe,
}

impl ConfidenceLevel {
    /// Unconfirmed reads bypass the reference-block check entirely.
    pub fn is_unconfirmed(self) -> bool {
        self == Self::Unconfirmed
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unconfirmed => "unconfirmed",
            Self::Finalized => "finalized",
            Self::Safe => "safe",
        }
    }
}

impl std::fmt::Display for ConfidenceLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ConfidenceLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "" | "unconfirmed" => Ok(Self::Unconfirmed),
            "finalized" => Ok(Self::Finalized),
            "safe" => Ok(Self::Safe),
            other => Err(format!("unknown confidence level: {other}")),
        }
    }
}

/// Options shared by the `*_with_opts` reads.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReadOpts {
    pub confidence: ConfidenceLevel,
    /// Request was triggered from outside the node; apply the response-size
    /// limit.
    pub is_external_request: bool,
}

impl ReadOpts {
    pub fn confidence(confidence: ConfidenceLevel) -> Self {
        Self {
            confidence,
            ..Self::default()
        }
    }

    pub fn external(mut self) -> Self {
        self.is_external_request = true;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_number_sentinels_become_tags() {
        assert_eq!(block_number_arg(None).unwrap(), "latest");
        assert_eq!(block_number_arg(Some(-1)).unwrap(), "pending");
        assert_eq!(block_number_arg(Some(-2)).unwrap(), "latest");
        assert_eq!(block_number_arg(Some(-3)).unwrap(), "finalized");
        assert_eq!(block_number_arg(Some(-4)).unwrap(), "safe");
        assert_eq!(block_number_arg(Some(0)).unwrap(), "0x0");
        assert_eq!(block_number_arg(Some(100)).unwrap(), "0x64");
        assert!(block_number_arg(Some(-42)).is_err());
    }

    #[test]
    fn head_decodes_hex_quantities() {
        let head: Head = serde_json::from_value(json!({
            "number": "0x64",
            "hash": "0x0000000000000000000000000000000000000000000000000000000000000001",
            "timestamp": "0x10",
            "totalDifficulty": "0x2"
        }))
        .unwrap();
        assert_eq!(head.number, 100);
        assert_eq!(head.timestamp, 16);
        assert_eq!(head.total_difficulty, Some(U256::from(2)));
        assert_eq!(head.evm_chain_id, None);
    }

    #[test]
    fn head_number_must_fit_int64() {
        let res = serde_json::from_value::<Head>(json!({"number": "0xffffffffffffffff"}));
        assert!(res.is_err());
    }

    #[test]
    fn call_arg_uses_data_key_and_strips_fees_for_tron() {
        let msg = CallMsg {
            to: Some(Address::repeat_byte(0x11)),
            data: Some(Bytes::from(vec![0xde, 0xad])),
            gas_fee_cap: Some(U256::from(10)),
            gas_tip_cap: Some(U256::from(1)),
            ..Default::default()
        };
        let generic = msg.to_call_arg(ChainType::Generic);
        assert_eq!(generic["data"], "0xdead");
        assert!(generic.get("input").is_none());
        assert_eq!(generic["maxFeePerGas"], "0xa");

        let tron = msg.to_call_arg(ChainType::Tron);
        assert!(tron.get("maxFeePerGas").is_none());
        assert!(tron.get("maxPriorityFeePerGas").is_none());
        assert_eq!(tron["data"], "0xdead");
    }

    #[test]
    fn filter_arg_range_and_hash_are_exclusive() {
        let q = FilterQuery {
            from_block: Some(10),
            to_block: None,
            topics: vec![vec![], vec![B256::repeat_byte(1)]],
            ..Default::default()
        };
        let arg = q.to_filter_arg().unwrap();
        assert_eq!(arg["fromBlock"], "0xa");
        assert_eq!(arg["toBlock"], "latest");
        assert_eq!(arg["topics"][0], Value::Null);

        let q = FilterQuery {
            block_hash: Some(B256::repeat_byte(2)),
            to_block: Some(5),
            ..Default::default()
        };
        assert!(q.to_filter_arg().is_err());
    }

    #[test]
    fn empty_confidence_is_unconfirmed() {
        let c: ConfidenceLevel = serde_json::from_value(json!("")).unwrap();
        assert!(c.is_unconfirmed());
        assert_eq!("Finalized".parse::<ConfidenceLevel>().unwrap(), ConfidenceLevel::Finalized);
    }
}

//! Typed `eth_*` surface of [`RpcClient`].

use std::str::FromStr;
use std::time::Duration;

use alloy_primitives::{Address, Bytes, B256, U256};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};

use evmrpc_core::context::RequestContext;
use evmrpc_core::error::{CallError, ClientError, TransportError};
use evmrpc_core::types::{
    block_number_arg, quantity, BlockTag, CallMsg, FeeHistory, FilterQuery, Head, Header, Log,
    Receipt, Transaction,
};

use crate::client::RpcClient;
use crate::logs::make_logs_valid;

/// `balanceOf(address)` selector.
const BALANCE_OF: [u8; 4] = [0x70, 0xa0, 0x82, 0x31];

impl RpcClient {
    async fn read<T: DeserializeOwned>(
        &self,
        ctx: &RequestContext,
        call_name: &str,
        method: &str,
        params: Vec<Value>,
    ) -> Result<Option<T>, ClientError> {
        self.exec(ctx, self.rpc_timeout(), call_name, method, params)
            .await
    }

    async fn read_quantity(
        &self,
        ctx: &RequestContext,
        timeout: Duration,
        call_name: &str,
        method: &str,
        params: Vec<Value>,
    ) -> Result<u64, ClientError> {
        let raw: String = self
            .exec(ctx, timeout, call_name, method, params)
            .await?
            .ok_or_else(ClientError::not_found)?;
        quantity::parse(&raw).map_err(|e| self.wrap_error(TransportError::Other(e)))
    }

    pub(crate) fn stamp(&self, mut head: Head) -> Head {
        head.evm_chain_id = Some(self.config().chain_id);
        head
    }

    pub async fn client_version(&self, ctx: &RequestContext) -> Result<String, ClientError> {
        self.read(ctx, "ClientVersion", "web3_clientVersion", vec![])
            .await?
            .ok_or_else(ClientError::not_found)
    }

    pub async fn chain_id(&self, ctx: &RequestContext) -> Result<u64, ClientError> {
        self.read_quantity(ctx, self.rpc_timeout(), "ChainID", "eth_chainId", vec![])
            .await
    }

    pub async fn block_number(&self, ctx: &RequestContext) -> Result<u64, ClientError> {
        self.read_quantity(ctx, self.rpc_timeout(), "BlockNumber", "eth_blockNumber", vec![])
            .await
    }

    /// Height of the node's latest block.
    pub async fn latest_block_height(&self, ctx: &RequestContext) -> Result<u64, ClientError> {
        self.read_quantity(ctx, self.rpc_timeout(), "LatestBlockHeight", "eth_blockNumber", vec![])
            .await
    }

    /// Any result other than `false` means the node is still syncing.
    pub async fn is_syncing(&self, ctx: &RequestContext) -> Result<bool, ClientError> {
        let status: Option<Value> = self.read(ctx, "IsSyncing", "eth_syncing", vec![]).await?;
        Ok(!matches!(status, None | Some(Value::Bool(false))))
    }

    /// Block header at `number` (`None` is latest).
    ///
    /// A fetch at `latest` is also recorded as a new head observation.
    pub async fn block_by_number(
        &self,
        ctx: &RequestContext,
        number: Option<i64>,
    ) -> Result<Head, ClientError> {
        let scope = self.acquire_query_ctx(ctx, self.rpc_timeout());
        let tag = block_number_arg(number)?;
        let head: Head = self
            .read(
                &scope.ctx,
                "BlockByNumber",
                "eth_getBlockByNumber",
                vec![json!(tag), json!(false)],
            )
            .await?
            .ok_or_else(ClientError::not_found)?;
        let head = self.stamp(head);

        if tag == BlockTag::Latest.as_str() {
            self.base().on_new_head(&scope.ctx, &scope.lifecycle, &head);
        }
        Ok(head)
    }

    pub async fn block_by_hash(&self, ctx: &RequestContext, hash: B256) -> Result<Head, ClientError> {
        let head: Head = self
            .read(ctx, "BlockByHash", "eth_getBlockByHash", vec![json!(hash), json!(false)])
            .await?
            .ok_or_else(ClientError::not_found)?;
        Ok(self.stamp(head))
    }

    /// Header at `number` without any chain-info bookkeeping.
    pub async fn header_by_number(
        &self,
        ctx: &RequestContext,
        number: Option<i64>,
    ) -> Result<Header, ClientError> {
        let tag = block_number_arg(number)?;
        let head: Header = self
            .read(ctx, "HeaderByNumber", "eth_getBlockByNumber", vec![json!(tag), json!(false)])
            .await?
            .ok_or_else(ClientError::not_found)?;
        Ok(self.stamp(head))
    }

    pub async fn header_by_hash(&self, ctx: &RequestContext, hash: B256) -> Result<Header, ClientError> {
        let head: Header = self
            .read(ctx, "HeaderByHash", "eth_getBlockByHash", vec![json!(hash), json!(false)])
            .await?
            .ok_or_else(ClientError::not_found)?;
        Ok(self.stamp(head))
    }

    pub async fn latest_safe_block(&self, ctx: &RequestContext) -> Result<Head, ClientError> {
        let head: Head = self
            .read(
                ctx,
                "LatestSafeBlock",
                "eth_getBlockByNumber",
                vec![json!(BlockTag::Safe.as_str()), json!(false)],
            )
            .await?
            .ok_or_else(ClientError::not_found)?;
        Ok(self.stamp(head))
    }

    /// Latest finalized block, recorded as a finalized-head observation.
    ///
    /// Chains with custom finality are asked through their native
    /// `chain_getFinalizedHead` instead of the `finalized` tag.
    pub async fn latest_finalized_block(&self, ctx: &RequestContext) -> Result<Head, ClientError> {
        let scope = self.acquire_query_ctx(ctx, self.rpc_timeout());
        let raw = if self.chain_type().caps().custom_finality {
            self.astar_latest_finalized_block(&scope.ctx).await?
        } else {
            self.read::<Value>(
                &scope.ctx,
                "LatestFinalizedBlock",
                "eth_getBlockByNumber",
                vec![json!(BlockTag::Finalized.as_str()), json!(false)],
            )
            .await?
            .unwrap_or(Value::Null)
        };
        let head: Head = serde_json::from_value::<Option<Head>>(raw)
            .map_err(|e| self.wrap_error(TransportError::Deserialization(e)))?
            .ok_or_else(ClientError::not_found)?;
        let head = self.stamp(head);

        self.base()
            .on_new_finalized_head(&scope.ctx, &scope.lifecycle, &head);
        Ok(head)
    }

    pub async fn transaction_receipt(
        &self,
        ctx: &RequestContext,
        tx_hash: B256,
    ) -> Result<Receipt, ClientError> {
        self.read(ctx, "TransactionReceipt", "eth_getTransactionReceipt", vec![json!(tx_hash)])
            .await?
            .ok_or_else(ClientError::not_found)
    }

    pub async fn transaction_by_hash(
        &self,
        ctx: &RequestContext,
        tx_hash: B256,
    ) -> Result<Transaction, ClientError> {
        self.read(ctx, "TransactionByHash", "eth_getTransactionByHash", vec![json!(tx_hash)])
            .await?
            .ok_or_else(ClientError::not_found)
    }

    /// Submit a signed raw transaction.
    pub async fn send_transaction(&self, ctx: &RequestContext, raw_tx: &Bytes) -> Result<(), ClientError> {
        if !self.chain_type().caps().supports_send_transaction {
            return Err(ClientError::Unsupported {
                operation: "SendTransaction",
                chain: self.chain_type(),
            });
        }
        self.exec::<Value>(
            ctx,
            self.large_payload_timeout(),
            "SendTransaction",
            "eth_sendRawTransaction",
            vec![json!(raw_tx)],
        )
        .await?;
        Ok(())
    }

    pub async fn pending_sequence_at(
        &self,
        ctx: &RequestContext,
        account: Address,
    ) -> Result<u64, ClientError> {
        self.ensure_nonces()?;
        self.read_quantity(
            ctx,
            self.rpc_timeout(),
            "PendingSequenceAt",
            "eth_getTransactionCount",
            vec![json!(account), json!(BlockTag::Pending.as_str())],
        )
        .await
    }

    pub async fn nonce_at(
        &self,
        ctx: &RequestContext,
        account: Address,
        number: Option<i64>,
    ) -> Result<u64, ClientError> {
        self.ensure_nonces()?;
        self.read_quantity(
            ctx,
            self.rpc_timeout(),
            "NonceAt",
            "eth_getTransactionCount",
            vec![json!(account), json!(block_number_arg(number)?)],
        )
        .await
    }

    fn ensure_nonces(&self) -> Result<(), ClientError> {
        if self.chain_type().caps().supports_nonces {
            return Ok(());
        }
        Err(ClientError::Unsupported {
            operation: "eth_getTransactionCount",
            chain: self.chain_type(),
        })
    }

    pub async fn pending_code_at(&self, ctx: &RequestContext, account: Address) -> Result<Bytes, ClientError> {
        let code = self
            .read(
                ctx,
                "PendingCodeAt",
                "eth_getCode",
                vec![json!(account), json!(BlockTag::Pending.as_str())],
            )
            .await?;
        Ok(code.unwrap_or_default())
    }

    pub async fn code_at(
        &self,
        ctx: &RequestContext,
        account: Address,
        number: Option<i64>,
    ) -> Result<Bytes, ClientError> {
        let code = self
            .read(
                ctx,
                "CodeAt",
                "eth_getCode",
                vec![json!(account), json!(block_number_arg(number)?)],
            )
            .await?;
        Ok(code.unwrap_or_default())
    }

    pub async fn estimate_gas(&self, ctx: &RequestContext, call: &CallMsg) -> Result<u64, ClientError> {
        self.read_quantity(
            ctx,
            self.large_payload_timeout(),
            "EstimateGas",
            "eth_estimateGas",
            vec![call.to_call_arg(self.chain_type())],
        )
        .await
    }

    pub async fn suggest_gas_price(&self, ctx: &RequestContext) -> Result<U256, ClientError> {
        self.read(ctx, "SuggestGasPrice", "eth_gasPrice", vec![])
            .await?
            .ok_or_else(ClientError::not_found)
    }

    pub async fn suggest_gas_tip_cap(&self, ctx: &RequestContext) -> Result<U256, ClientError> {
        self.read(ctx, "SuggestGasTipCap", "eth_maxPriorityFeePerGas", vec![])
            .await?
            .ok_or_else(ClientError::not_found)
    }

    pub async fn fee_history(
        &self,
        ctx: &RequestContext,
        block_count: u64,
        last_block: Option<i64>,
        reward_percentiles: &[f64],
    ) -> Result<FeeHistory, ClientError> {
        self.read(
            ctx,
            "FeeHistory",
            "eth_feeHistory",
            vec![
                json!(format!("{block_count:#x}")),
                json!(block_number_arg(last_block)?),
                json!(reward_percentiles),
            ],
        )
        .await?
        .ok_or_else(ClientError::not_found)
    }

    /// `eth_call` at `number` (`None` is latest).
    pub async fn call_contract(
        &self,
        ctx: &RequestContext,
        call: &CallMsg,
        number: Option<i64>,
    ) -> Result<Bytes, ClientError> {
        let out = self
            .exec(
                ctx,
                self.large_payload_timeout(),
                "CallContract",
                "eth_call",
                vec![call.to_call_arg(self.chain_type()), json!(block_number_arg(number)?)],
            )
            .await?;
        Ok(out.unwrap_or_default())
    }

    pub async fn pending_call_contract(&self, ctx: &RequestContext, call: &CallMsg) -> Result<Bytes, ClientError> {
        let out = self
            .exec(
                ctx,
                self.large_payload_timeout(),
                "PendingCallContract",
                "eth_call",
                vec![call.to_call_arg(self.chain_type()), json!(BlockTag::Pending.as_str())],
            )
            .await?;
        Ok(out.unwrap_or_default())
    }

    pub async fn balance_at(
        &self,
        ctx: &RequestContext,
        account: Address,
        number: Option<i64>,
    ) -> Result<U256, ClientError> {
        self.read(
            ctx,
            "BalanceAt",
            "eth_getBalance",
            vec![json!(account), json!(block_number_arg(number)?)],
        )
        .await?
        .ok_or_else(ClientError::not_found)
    }

    /// ERC-20 `balanceOf(account)` of `token` at the latest block.
    pub async fn token_balance(
        &self,
        ctx: &RequestContext,
        account: Address,
        token: Address,
    ) -> Result<U256, ClientError> {
        let mut data = Vec::with_capacity(36);
        data.extend_from_slice(&BALANCE_OF);
        data.extend_from_slice(&[0u8; 12]);
        data.extend_from_slice(account.as_slice());
        let call = json!({ "to": token, "data": Bytes::from(data) });

        let raw: String = self
            .exec(
                ctx,
                self.large_payload_timeout(),
                "TokenBalance",
                "eth_call",
                vec![call, json!(BlockTag::Latest.as_str())],
            )
            .await?
            .unwrap_or_default();
        U256::from_str(&raw)
            .map_err(|_| ClientError::call(CallError::Other(format!("failed to parse int: {raw}"))))
    }

    /// Logs matching `query`, with log indices normalized for the chain.
    pub async fn filter_logs(&self, ctx: &RequestContext, query: &FilterQuery) -> Result<Vec<Log>, ClientError> {
        let mut logs: Vec<Log> = self
            .read(ctx, "FilterLogs", "eth_getLogs", vec![query.to_filter_arg()?])
            .await?
            .unwrap_or_default();
        make_logs_valid(self.chain_type(), &mut logs)?;
        Ok(logs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn balance_of_selector() {
        assert_eq!(
            alloy_primitives::keccak256("balanceOf(address)")[..4],
            BALANCE_OF
        );
    }
}

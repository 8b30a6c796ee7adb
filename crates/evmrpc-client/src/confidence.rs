//! Confidence-level reads.
//!
//! A read at block `n` with confidence `finalized` or `safe` is sent in the
//! same batch as a fetch of the reference block for that confidence level.
//! The result is only returned when `n` is at or below the highest block the
//! reference allows; a node that has not yet finalized `n` cannot hand out
//! data for it. Unconfirmed reads, and reads without a concrete non-negative
//! height, take the ordinary single-call path unchanged.

use std::time::Instant;

use alloy_primitives::{Address, Bytes, B256, U256};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use tracing::{debug, Instrument};

use evmrpc_core::context::RequestContext;
use evmrpc_core::error::{CallError, ClientError};
use evmrpc_core::request::BatchElem;
use evmrpc_core::types::{
    block_number_arg, BlockTag, CallMsg, ConfidenceLevel, FilterQuery, Head, Header, Log,
    ReadOpts, Receipt, Transaction,
};

use crate::client::RpcClient;
use crate::logs::make_logs_valid;

impl RpcClient {
    /// Block tag whose head bounds reads at `confidence`.
    ///
    /// Nodes without finality tags are bounded by `latest` minus a depth.
    pub fn confidence_to_block_tag(&self, confidence: ConfidenceLevel) -> Result<BlockTag, ClientError> {
        let tag = match confidence {
            ConfidenceLevel::Finalized => BlockTag::Finalized,
            ConfidenceLevel::Safe => BlockTag::Safe,
            other => return Err(ClientError::UnsupportedConfidence(other)),
        };
        if !self.config().finality_tag_enabled {
            return Ok(BlockTag::Latest);
        }
        Ok(tag)
    }

    /// Highest block readable at `confidence` given the reference head.
    pub fn reference_head_to_max_available_height(
        &self,
        confidence: ConfidenceLevel,
        reference_head: i64,
    ) -> Result<i64, ClientError> {
        let cfg = self.config();
        if cfg.finality_tag_enabled {
            return Ok(reference_head);
        }
        let depth = match confidence {
            ConfidenceLevel::Finalized => cfg.finality_depth,
            ConfidenceLevel::Safe => cfg.safe_depth,
            other => return Err(ClientError::UnsupportedConfidence(other)),
        };
        Ok((reference_head - i64::from(depth)).max(0))
    }

    /// Run `request` together with the reference-block fetch and return it
    /// once `number` is known to be available at `confidence`.
    pub async fn do_with_confidence(
        &self,
        ctx: &RequestContext,
        request: BatchElem,
        number: Option<i64>,
        confidence: ConfidenceLevel,
    ) -> Result<BatchElem, ClientError> {
        let Some(number) = number else {
            return Err(ClientError::InvalidBlockNumber("<nil>".into()));
        };
        let reference = self.confidence_to_block_tag(confidence)?;

        let call_name = format!("{}WithConfidence", request.method);
        async {
            debug!(
                method = %call_name,
                args = ?request.args,
                block_number = number,
                %confidence,
                "RPC call: {call_name}"
            );
            let start = Instant::now();
            let res = self
                .confirm_batch(ctx, request, reference, number, confidence)
                .await;
            self.log_result(&call_name, start.elapsed(), res.as_ref().err());
            res
        }
        .instrument(self.request_span())
        .await
    }

    /// One round trip carrying `request` and the reference block, then the
    /// availability check of `number` against that block.
    async fn confirm_batch(
        &self,
        ctx: &RequestContext,
        request: BatchElem,
        reference: BlockTag,
        number: i64,
        confidence: ConfidenceLevel,
    ) -> Result<BatchElem, ClientError> {
        let mut batch = [
            request,
            BatchElem::new(
                "eth_getBlockByNumber",
                vec![json!(reference.as_str()), json!(false)],
            ),
        ];
        self.batch_call_context(ctx, &mut batch)
            .await
            .map_err(|e| ClientError::Batch(Box::new(e)))?;

        let [request, reference_block] = batch;
        if let Some(err) = request.error {
            return Err(ClientError::call(CallError::CallerRequest(err)));
        }
        if let Some(err) = reference_block.error {
            return Err(ClientError::call(CallError::ReferenceRequest(err)));
        }
        let head: Option<Head> = reference_block
            .decode()
            .map_err(|e| ClientError::call(CallError::ReferenceRequest(e)))?;
        let Some(head) = head else {
            return Err(ClientError::NilReferenceBlock);
        };

        let max_available = self.reference_head_to_max_available_height(confidence, head.number)?;
        if max_available < number {
            return Err(ClientError::call(CallError::NotYetAvailable {
                requested: number,
                confidence,
                max_available,
            }));
        }
        Ok(request)
    }

    async fn confirmed<T: DeserializeOwned>(
        &self,
        ctx: &RequestContext,
        method: &str,
        args: Vec<Value>,
        number: i64,
        confidence: ConfidenceLevel,
    ) -> Result<Option<T>, ClientError> {
        let el = self
            .do_with_confidence(ctx, BatchElem::new(method, args), Some(number), confidence)
            .await?;
        el.decode()
            .map_err(|e| ClientError::call(CallError::CallerRequest(e)))
    }

    /// Header at `number`, returned only once available at the requested
    /// confidence.
    pub async fn header_by_number_with_opts(
        &self,
        ctx: &RequestContext,
        number: Option<i64>,
        opts: ReadOpts,
    ) -> Result<Header, ClientError> {
        let ctx = self.wrap_ctx(ctx, opts.is_external_request);
        let Some(n) = confirmed_height(number, opts) else {
            return self.block_by_number(&ctx, number).await;
        };
        let head: Head = self
            .confirmed(
                &ctx,
                "eth_getBlockByNumber",
                vec![json!(block_number_arg(Some(n))?), json!(false)],
                n,
                opts.confidence,
            )
            .await?
            .ok_or_else(ClientError::not_found)?;
        Ok(self.stamp(head))
    }

    pub async fn balance_at_with_opts(
        &self,
        ctx: &RequestContext,
        account: Address,
        number: Option<i64>,
        opts: ReadOpts,
    ) -> Result<U256, ClientError> {
        let ctx = self.wrap_ctx(ctx, opts.is_external_request);
        let Some(n) = confirmed_height(number, opts) else {
            return self.balance_at(&ctx, account, number).await;
        };
        self.confirmed(
            &ctx,
            "eth_getBalance",
            vec![json!(account), json!(block_number_arg(Some(n))?)],
            n,
            opts.confidence,
        )
        .await?
        .ok_or_else(ClientError::not_found)
    }

    pub async fn call_contract_with_opts(
        &self,
        ctx: &RequestContext,
        call: &CallMsg,
        number: Option<i64>,
        opts: ReadOpts,
    ) -> Result<Bytes, ClientError> {
        let ctx = self.wrap_ctx(ctx, opts.is_external_request);
        let Some(n) = confirmed_height(number, opts) else {
            return self.call_contract(&ctx, call, number).await;
        };
        let out: Option<Bytes> = self
            .confirmed(
                &ctx,
                "eth_call",
                vec![
                    call.to_call_arg(self.chain_type()),
                    json!(block_number_arg(Some(n))?),
                ],
                n,
                opts.confidence,
            )
            .await?;
        Ok(out.unwrap_or_default())
    }

    /// Logs in `query`'s range, checked against its upper bound.
    ///
    /// Both range ends must be concrete non-negative heights for the
    /// confidence check to apply.
    pub async fn filter_logs_with_opts(
        &self,
        ctx: &RequestContext,
        query: &FilterQuery,
        opts: ReadOpts,
    ) -> Result<Vec<Log>, ClientError> {
        let ctx = self.wrap_ctx(ctx, opts.is_external_request);
        let bounded = matches!(query.from_block, Some(from) if from >= 0);
        let to_block = confirmed_height(query.to_block, opts).filter(|_| bounded);
        let Some(to) = to_block else {
            return self.filter_logs(&ctx, query).await;
        };

        let mut logs: Vec<Log> = self
            .confirmed(&ctx, "eth_getLogs", vec![query.to_filter_arg()?], to, opts.confidence)
            .await?
            .unwrap_or_default();
        make_logs_valid(self.chain_type(), &mut logs)?;
        Ok(logs)
    }

    pub async fn transaction_receipt_with_opts(
        &self,
        ctx: &RequestContext,
        tx_hash: B256,
        opts: ReadOpts,
    ) -> Result<Receipt, ClientError> {
        let ctx = self.wrap_ctx(ctx, opts.is_external_request);
        self.transaction_receipt(&ctx, tx_hash).await
    }

    pub async fn transaction_by_hash_with_opts(
        &self,
        ctx: &RequestContext,
        tx_hash: B256,
        opts: ReadOpts,
    ) -> Result<Transaction, ClientError> {
        let ctx = self.wrap_ctx(ctx, opts.is_external_request);
        self.transaction_by_hash(&ctx, tx_hash).await
    }
}

/// The height to check, or `None` when the read takes the unchecked path.
fn confirmed_height(number: Option<i64>, opts: ReadOpts) -> Option<i64> {
    if opts.confidence.is_unconfirmed() {
        return None;
    }
    number.filter(|n| *n >= 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClientConfig;

    fn client(finality_tag_enabled: bool) -> RpcClient {
        let cfg = ClientConfig {
            finality_tag_enabled,
            finality_depth: 10,
            safe_depth: 3,
            ..ClientConfig::default()
        };
        RpcClient::new(cfg, None, None)
    }

    #[test]
    fn reference_tag_follows_finality_tag_support() {
        let tagged = client(true);
        assert_eq!(
            tagged.confidence_to_block_tag(ConfidenceLevel::Finalized).unwrap(),
            BlockTag::Finalized
        );
        assert_eq!(tagged.confidence_to_block_tag(ConfidenceLevel::Safe).unwrap(), BlockTag::Safe);

        let untagged = client(false);
        assert_eq!(
            untagged.confidence_to_block_tag(ConfidenceLevel::Finalized).unwrap(),
            BlockTag::Latest
        );
        assert_eq!(untagged.confidence_to_block_tag(ConfidenceLevel::Safe).unwrap(), BlockTag::Latest);

        let err = untagged
            .confidence_to_block_tag(ConfidenceLevel::Unconfirmed)
            .unwrap_err();
        assert_eq!(err.to_string(), "confidence level unconfirmed not supported");
    }

    #[test]
    fn max_available_height_subtracts_depth_and_clamps() {
        let tagged = client(true);
        assert_eq!(
            tagged.reference_head_to_max_available_height(ConfidenceLevel::Finalized, 100).unwrap(),
            100
        );

        let untagged = client(false);
        assert_eq!(
            untagged.reference_head_to_max_available_height(ConfidenceLevel::Finalized, 100).unwrap(),
            90
        );
        assert_eq!(
            untagged.reference_head_to_max_available_height(ConfidenceLevel::Safe, 100).unwrap(),
            97
        );
        assert_eq!(
            untagged.reference_head_to_max_available_height(ConfidenceLevel::Finalized, 4).unwrap(),
            0
        );
        assert!(untagged
            .reference_head_to_max_available_height(ConfidenceLevel::Unconfirmed, 4)
            .is_err());
    }

    #[test]
    fn unchecked_path_selection() {
        let finalized = ReadOpts::confidence(ConfidenceLevel::Finalized);
        assert_eq!(confirmed_height(Some(10), finalized), Some(10));
        assert_eq!(confirmed_height(Some(0), finalized), Some(0));
        assert_eq!(confirmed_height(None, finalized), None);
        assert_eq!(confirmed_height(Some(-2), finalized), None);
        assert_eq!(confirmed_height(Some(10), ReadOpts::default()), None);
    }

    #[tokio::test]
    async fn missing_block_number_is_rejected_before_io() {
        let c = client(true);
        let err = c
            .do_with_confidence(
                &RequestContext::background(),
                BatchElem::new("eth_getBalance", vec![]),
                None,
                ConfidenceLevel::Finalized,
            )
            .await
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "blockNumber must be non nil and fit into int64. Got: <nil>"
        );

        let err = c
            .do_with_confidence(
                &RequestContext::background(),
                BatchElem::new("eth_getBalance", vec![]),
                Some(1),
                ConfidenceLevel::Unconfirmed,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::UnsupportedConfidence(_)));
    }
}

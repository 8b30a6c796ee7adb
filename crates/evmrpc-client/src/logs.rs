//! Log-index normalization for chains whose nodes reset `logIndex` per
//! transaction.
//!
//! On those chains `(block, logIndex)` does not identify a log, so the index
//! is rebuilt as `(txIndex << 32) | logIndex`. Both halves must fit in 32
//! bits; anything larger is rejected rather than silently colliding.

use evmrpc_core::chain::ChainType;
use evmrpc_core::error::ClientError;
use evmrpc_core::types::Log;

/// Normalize one log in place. Leaves the log untouched on error.
pub fn make_log_valid(chain: ChainType, log: &mut Log) -> Result<(), ClientError> {
    if !chain.caps().non_unique_log_index {
        return Ok(());
    }
    let max = u32::MAX;
    if log.transaction_index > u64::from(max) {
        return Err(ClientError::TxIndexOverflow {
            tx_hash: log.transaction_hash,
            max,
        });
    }
    if log.log_index > u64::from(max) {
        return Err(ClientError::LogIndexOverflow {
            index: log.log_index,
            tx_hash: log.transaction_hash,
            max,
        });
    }
    log.log_index |= log.transaction_index << 32;
    Ok(())
}

/// Normalize every log; stops at the first log that does not fit.
pub fn make_logs_valid(chain: ChainType, logs: &mut [Log]) -> Result<(), ClientError> {
    if !chain.caps().non_unique_log_index {
        return Ok(());
    }
    logs.iter_mut().try_for_each(|log| make_log_valid(chain, log))
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_primitives::B256;

    fn log(tx_index: u64, log_index: u64) -> Log {
        Log {
            transaction_index: tx_index,
            log_index,
            transaction_hash: B256::repeat_byte(0xab),
            ..Log::default()
        }
    }

    #[test]
    fn non_unique_chains_pack_tx_index() {
        for chain in [ChainType::Sei, ChainType::Hedera, ChainType::Rootstock, ChainType::Pharos] {
            let mut l = log(3, 7);
            make_log_valid(chain, &mut l).unwrap();
            assert_eq!(l.log_index, (3 << 32) | 7, "{chain}");
            assert_eq!(l.transaction_index, 3);
        }
    }

    #[test]
    fn other_chains_are_untouched() {
        for chain in [ChainType::Generic, ChainType::Astar, ChainType::Tron] {
            let mut l = log(u64::MAX, u64::MAX);
            make_log_valid(chain, &mut l).unwrap();
            assert_eq!(l, log(u64::MAX, u64::MAX));
        }
    }

    #[test]
    fn max_values_still_fit() {
        let mut l = log(u64::from(u32::MAX), u64::from(u32::MAX));
        make_log_valid(ChainType::Sei, &mut l).unwrap();
        assert_eq!(l.log_index, u64::MAX);
    }

    #[test]
    fn overflowing_tx_index_is_rejected() {
        let mut l = log(u64::from(u32::MAX) + 1, 0);
        let err = make_log_valid(ChainType::Sei, &mut l).unwrap_err();
        assert_eq!(
            err.to_string(),
            format!(
                "TxIndex of tx {} exceeds max supported value of 4294967295",
                B256::repeat_byte(0xab)
            )
        );
        assert_eq!(l, log(u64::from(u32::MAX) + 1, 0));
    }

    #[test]
    fn overflowing_log_index_is_rejected() {
        let mut l = log(1, u64::from(u32::MAX) + 1);
        let err = make_log_valid(ChainType::Hedera, &mut l).unwrap_err();
        assert!(err.to_string().starts_with("log's index 4294967296 of tx"));
        assert_eq!(l.log_index, u64::from(u32::MAX) + 1);
    }

    #[test]
    fn batch_stops_at_first_bad_log() {
        let mut logs = vec![log(1, 1), log(u64::from(u32::MAX) + 1, 0), log(2, 2)];
        assert!(make_logs_valid(ChainType::Pharos, &mut logs).is_err());
        assert_eq!(logs[0].log_index, (1 << 32) | 1);
        assert_eq!(logs[2].log_index, 2);
    }
}

//! On-chain ledger access for the managed Liquidity Book pair.
//!
//! The [`Ledger`] trait is the only way the rest of the crate touches
//! the chain: reading the pair layout and the owner's per-bin balances,
//! and the two write operations a rebalance is composed of.
//!
//! Writes are not idempotent. A request that times out after
//! submission may still land on chain, so callers must treat a failed
//! write as "state unknown" rather than "nothing happened".

use std::sync::Arc;

use alloy::primitives::{Address, TxHash, U256};
use alloy::rpc::client::RpcClient;
use alloy::rpc::types::TransactionReceipt;
use alloy::transports::layers::RetryBackoffLayer;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use url::Url;

use moe_evm::EvmError;

mod evm;
#[cfg(test)]
pub(crate) mod mock;

pub(crate) use evm::EvmLedger;

/// Maximum retries for transient RPC errors (rate limits, null responses, etc.)
const RPC_MAX_RETRIES: u32 = 10;

/// Initial backoff duration in milliseconds before retrying
const RPC_INITIAL_BACKOFF_MS: u64 = 1000;

/// Compute units per second budget for rate limiting
const RPC_COMPUTE_UNITS_PER_SECOND: u64 = 100;

/// HTTP RPC client that retries transient errors with backoff.
pub(crate) fn http_client_with_retry(url: Url) -> RpcClient {
    let retry_layer = RetryBackoffLayer::new(
        RPC_MAX_RETRIES,
        RPC_INITIAL_BACKOFF_MS,
        RPC_COMPUTE_UNITS_PER_SECOND,
    );
    RpcClient::builder().layer(retry_layer).http(url)
}

#[derive(Debug, thiserror::Error)]
pub(crate) enum LedgerError {
    #[error("EVM error: {0}")]
    Evm(#[from] EvmError),
    #[error("withdraw request has {ids} bin ids but {amounts} amounts")]
    LengthMismatch { ids: usize, amounts: usize },
    #[error("requested balances for {expected} bins but received {actual}")]
    BalanceCountMismatch { expected: usize, actual: usize },
    #[error("withdraw {tx_hash} confirmed but the withdrawn amounts could not be read: {source}")]
    WithdrawUnmeasured {
        tx_hash: TxHash,
        source: Box<LedgerError>,
    },
    #[error("deadline {0} is before the unix epoch")]
    InvalidDeadline(DateTime<Utc>),
}

/// Layout of the pair plus its current active bin.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct PairInfo {
    pub(crate) active_bin_id: u32,
    pub(crate) bin_step: u16,
    pub(crate) token_x: Address,
    pub(crate) token_y: Address,
    pub(crate) decimals_x: u8,
    pub(crate) decimals_y: u8,
}

/// Gas spent by a confirmed transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub(crate) struct GasCost {
    pub(crate) gas_used: u64,
    pub(crate) cost_wei: u128,
}

impl GasCost {
    pub(crate) fn from_receipt(receipt: &TransactionReceipt) -> Self {
        Self {
            gas_used: receipt.gas_used,
            cost_wei: u128::from(receipt.gas_used).saturating_mul(receipt.effective_gas_price),
        }
    }

    pub(crate) fn saturating_add(self, other: Self) -> Self {
        Self {
            gas_used: self.gas_used.saturating_add(other.gas_used),
            cost_wei: self.cost_wei.saturating_add(other.cost_wei),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct WithdrawRequest {
    pub(crate) bin_ids: Vec<u32>,
    pub(crate) amounts: Vec<U256>,
    pub(crate) amount_x_min: U256,
    pub(crate) amount_y_min: U256,
    pub(crate) recipient: Address,
    pub(crate) deadline: DateTime<Utc>,
}

/// Outcome of a confirmed withdraw. `amount_x`/`amount_y` are the token
/// balances the recipient gained across the transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct WithdrawReceipt {
    pub(crate) tx_hash: TxHash,
    pub(crate) amount_x: U256,
    pub(crate) amount_y: U256,
    pub(crate) gas: GasCost,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct DepositRequest {
    pub(crate) target_bin_id: u32,
    pub(crate) amount_x: U256,
    pub(crate) amount_y: U256,
    pub(crate) amount_x_min: U256,
    pub(crate) amount_y_min: U256,
    pub(crate) id_slippage: u32,
    pub(crate) recipient: Address,
    pub(crate) deadline: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct DepositReceipt {
    pub(crate) tx_hash: TxHash,
    pub(crate) gas: GasCost,
}

#[async_trait]
pub(crate) trait Ledger: Send + Sync {
    /// Address whose liquidity is managed.
    fn owner(&self) -> Address;

    async fn pair_info(&self) -> Result<PairInfo, LedgerError>;

    /// LB-token balance of `owner` in each of `bin_ids`, in request order.
    async fn balances(&self, owner: Address, bin_ids: &[u32]) -> Result<Vec<U256>, LedgerError>;

    async fn withdraw(&self, request: &WithdrawRequest) -> Result<WithdrawReceipt, LedgerError>;

    async fn deposit(&self, request: &DepositRequest) -> Result<DepositReceipt, LedgerError>;
}

#[async_trait]
impl<T: Ledger + ?Sized> Ledger for Arc<T> {
    fn owner(&self) -> Address {
        (**self).owner()
    }

    async fn pair_info(&self) -> Result<PairInfo, LedgerError> {
        (**self).pair_info().await
    }

    async fn balances(&self, owner: Address, bin_ids: &[u32]) -> Result<Vec<U256>, LedgerError> {
        (**self).balances(owner, bin_ids).await
    }

    async fn withdraw(&self, request: &WithdrawRequest) -> Result<WithdrawReceipt, LedgerError> {
        (**self).withdraw(request).await
    }

    async fn deposit(&self, request: &DepositRequest) -> Result<DepositReceipt, LedgerError> {
        (**self).deposit(request).await
    }
}

/// Non-zero balances of `owner` within `bin_ids`, paired with their bin.
pub(crate) async fn owned_bins<L: Ledger + ?Sized>(
    ledger: &L,
    owner: Address,
    bin_ids: &[u32],
) -> Result<Vec<(u32, U256)>, LedgerError> {
    let balances = ledger.balances(owner, bin_ids).await?;

    if balances.len() != bin_ids.len() {
        return Err(LedgerError::BalanceCountMismatch {
            expected: bin_ids.len(),
            actual: balances.len(),
        });
    }

    Ok(bin_ids
        .iter()
        .copied()
        .zip(balances)
        .filter(|(_, balance)| !balance.is_zero())
        .collect())
}

#[cfg(test)]
mod tests {
    use super::mock::MockLedger;
    use super::*;

    #[tokio::test]
    async fn owned_bins_skips_empty_bins() {
        let ledger = MockLedger::new()
            .with_balance(99, U256::from(5_u64))
            .with_balance(101, U256::from(7_u64));

        let owned = owned_bins(&ledger, ledger.owner(), &[99, 100, 101]).await.unwrap();

        assert_eq!(owned, vec![(99, U256::from(5_u64)), (101, U256::from(7_u64))]);
    }

    #[test]
    fn gas_costs_accumulate() {
        let withdraw = GasCost {
            gas_used: 100_000,
            cost_wei: 2_000_000,
        };
        let deposit = GasCost {
            gas_used: 150_000,
            cost_wei: 3_000_000,
        };

        assert_eq!(
            withdraw.saturating_add(deposit),
            GasCost {
                gas_used: 250_000,
                cost_wei: 5_000_000,
            }
        );
    }
}

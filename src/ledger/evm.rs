//! [`Ledger`] backed by an EVM wallet talking to the Liquidity Book
//! pair and router contracts.

use alloy::primitives::{Address, I256, U256};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::OnceCell;
use tracing::{debug, info};

use moe_evm::{Wallet, submit, view};

use super::{
    DepositReceipt, DepositRequest, GasCost, Ledger, LedgerError, PairInfo, WithdrawReceipt,
    WithdrawRequest,
};
use crate::bindings::{IERC20, ILBPair, ILBRouter};

/// 100% in the router's 1e18 fixed-point distribution format.
const FULL_DISTRIBUTION: u64 = 1_000_000_000_000_000_000;

/// Pair properties that never change for a deployed pair.
#[derive(Debug, Clone, Copy)]
struct PairLayout {
    bin_step: u16,
    token_x: Address,
    token_y: Address,
    decimals_x: u8,
    decimals_y: u8,
}

pub(crate) struct EvmLedger<W> {
    wallet: W,
    pair: Address,
    router: Address,
    layout: OnceCell<PairLayout>,
}

impl<W: Wallet> EvmLedger<W> {
    pub(crate) fn new(wallet: W, pair: Address, router: Address) -> Self {
        Self {
            wallet,
            pair,
            router,
            layout: OnceCell::new(),
        }
    }

    async fn layout(&self) -> Result<PairLayout, LedgerError> {
        let layout = self
            .layout
            .get_or_try_init(|| async {
                let bin_step = view(&self.wallet, self.pair, ILBPair::getBinStepCall {}).await?;
                let token_x = view(&self.wallet, self.pair, ILBPair::getTokenXCall {}).await?;
                let token_y = view(&self.wallet, self.pair, ILBPair::getTokenYCall {}).await?;
                let decimals_x = view(&self.wallet, token_x, IERC20::decimalsCall {}).await?;
                let decimals_y = view(&self.wallet, token_y, IERC20::decimalsCall {}).await?;

                info!(
                    pair = %self.pair,
                    %token_x,
                    %token_y,
                    bin_step,
                    decimals_x,
                    decimals_y,
                    "Loaded pair layout"
                );

                Ok::<_, LedgerError>(PairLayout {
                    bin_step,
                    token_x,
                    token_y,
                    decimals_x,
                    decimals_y,
                })
            })
            .await?;

        Ok(*layout)
    }

    async fn token_balance(&self, token: Address, account: Address) -> Result<U256, LedgerError> {
        Ok(view(&self.wallet, token, IERC20::balanceOfCall { account }).await?)
    }

    async fn ensure_pair_approval(&self) -> Result<(), LedgerError> {
        let approved = view(
            &self.wallet,
            self.pair,
            ILBPair::isApprovedForAllCall {
                owner: self.wallet.address(),
                spender: self.router,
            },
        )
        .await?;

        if approved {
            debug!(router = %self.router, "Router already approved for LB tokens");
            return Ok(());
        }

        submit(
            &self.wallet,
            self.pair,
            ILBPair::approveForAllCall {
                spender: self.router,
                approved: true,
            },
            "approve router for LB tokens",
        )
        .await?;

        Ok(())
    }

    async fn ensure_token_allowance(&self, token: Address, amount: U256) -> Result<(), LedgerError> {
        if amount.is_zero() {
            return Ok(());
        }

        let allowance = view(
            &self.wallet,
            token,
            IERC20::allowanceCall {
                owner: self.wallet.address(),
                spender: self.router,
            },
        )
        .await?;

        if allowance >= amount {
            return Ok(());
        }

        submit(
            &self.wallet,
            token,
            IERC20::approveCall {
                spender: self.router,
                amount: U256::MAX,
            },
            "approve router for token",
        )
        .await?;

        Ok(())
    }
}

fn deadline_timestamp(deadline: DateTime<Utc>) -> Result<U256, LedgerError> {
    u64::try_from(deadline.timestamp())
        .map(U256::from)
        .map_err(|_| LedgerError::InvalidDeadline(deadline))
}

#[async_trait]
impl<W: Wallet> Ledger for EvmLedger<W> {
    fn owner(&self) -> Address {
        self.wallet.address()
    }

    #[tracing::instrument(skip(self), level = tracing::Level::DEBUG)]
    async fn pair_info(&self) -> Result<PairInfo, LedgerError> {
        let layout = self.layout().await?;
        let active_id = view(&self.wallet, self.pair, ILBPair::getActiveIdCall {}).await?;

        Ok(PairInfo {
            active_bin_id: active_id.to::<u32>(),
            bin_step: layout.bin_step,
            token_x: layout.token_x,
            token_y: layout.token_y,
            decimals_x: layout.decimals_x,
            decimals_y: layout.decimals_y,
        })
    }

    async fn balances(&self, owner: Address, bin_ids: &[u32]) -> Result<Vec<U256>, LedgerError> {
        let balances = view(
            &self.wallet,
            self.pair,
            ILBPair::balanceOfBatchCall {
                accounts: vec![owner; bin_ids.len()],
                ids: bin_ids.iter().map(|id| U256::from(*id)).collect(),
            },
        )
        .await?;

        if balances.len() != bin_ids.len() {
            return Err(LedgerError::BalanceCountMismatch {
                expected: bin_ids.len(),
                actual: balances.len(),
            });
        }

        Ok(balances)
    }

    #[tracing::instrument(skip(self), fields(bins = ?request.bin_ids), level = tracing::Level::DEBUG)]
    async fn withdraw(&self, request: &WithdrawRequest) -> Result<WithdrawReceipt, LedgerError> {
        if request.bin_ids.len() != request.amounts.len() {
            return Err(LedgerError::LengthMismatch {
                ids: request.bin_ids.len(),
                amounts: request.amounts.len(),
            });
        }

        let layout = self.layout().await?;
        let deadline = deadline_timestamp(request.deadline)?;

        self.ensure_pair_approval().await?;

        let before_x = self.token_balance(layout.token_x, request.recipient).await?;
        let before_y = self.token_balance(layout.token_y, request.recipient).await?;

        let receipt = submit(
            &self.wallet,
            self.router,
            ILBRouter::removeLiquidityCall {
                tokenX: layout.token_x,
                tokenY: layout.token_y,
                binStep: layout.bin_step,
                amountXMin: request.amount_x_min,
                amountYMin: request.amount_y_min,
                ids: request.bin_ids.iter().map(|id| U256::from(*id)).collect(),
                amounts: request.amounts.clone(),
                to: request.recipient,
                deadline,
            },
            "remove liquidity",
        )
        .await?;

        let tx_hash = receipt.transaction_hash;
        let unmeasured = |source| LedgerError::WithdrawUnmeasured {
            tx_hash,
            source: Box::new(source),
        };
        let after_x = self
            .token_balance(layout.token_x, request.recipient)
            .await
            .map_err(unmeasured)?;
        let after_y = self
            .token_balance(layout.token_y, request.recipient)
            .await
            .map_err(unmeasured)?;

        Ok(WithdrawReceipt {
            tx_hash,
            amount_x: after_x.saturating_sub(before_x),
            amount_y: after_y.saturating_sub(before_y),
            gas: GasCost::from_receipt(&receipt),
        })
    }

    #[tracing::instrument(skip(self), fields(target = request.target_bin_id), level = tracing::Level::DEBUG)]
    async fn deposit(&self, request: &DepositRequest) -> Result<DepositReceipt, LedgerError> {
        let layout = self.layout().await?;
        let deadline = deadline_timestamp(request.deadline)?;

        self.ensure_token_allowance(layout.token_x, request.amount_x).await?;
        self.ensure_token_allowance(layout.token_y, request.amount_y).await?;

        let parameters = ILBRouter::LiquidityParameters {
            tokenX: layout.token_x,
            tokenY: layout.token_y,
            binStep: U256::from(layout.bin_step),
            amountX: request.amount_x,
            amountY: request.amount_y,
            amountXMin: request.amount_x_min,
            amountYMin: request.amount_y_min,
            activeIdDesired: U256::from(request.target_bin_id),
            idSlippage: U256::from(request.id_slippage),
            deltaIds: vec![I256::ZERO],
            distributionX: vec![U256::from(FULL_DISTRIBUTION)],
            distributionY: vec![U256::from(FULL_DISTRIBUTION)],
            to: request.recipient,
            refundTo: request.recipient,
            deadline,
        };

        let receipt = submit(
            &self.wallet,
            self.router,
            ILBRouter::addLiquidityCall {
                liquidityParameters: parameters,
            },
            "add liquidity",
        )
        .await?;

        Ok(DepositReceipt {
            tx_hash: receipt.transaction_hash,
            gas: GasCost::from_receipt(&receipt),
        })
    }
}

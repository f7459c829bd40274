//! Moves the managed liquidity into the active bin.
//!
//! A rebalance is two transactions, a `removeLiquidity` over every owned
//! bin that should be vacated followed by an `addLiquidity` of the
//! withdrawn tokens into the target bin. They cannot be made atomic, so
//! each step is recorded in a [`SagaStore`] row before the next one
//! starts. A deposit failing after a confirmed withdraw leaves the
//! tokens in the wallet and is reported as
//! [`RebalanceError::PartiallyApplied`]; nothing retries it
//! automatically.

use alloy::primitives::{TxHash, U256};
use chrono::{DateTime, TimeDelta, Utc};
use serde::Deserialize;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::ledger::{
    DepositRequest, GasCost, Ledger, LedgerError, WithdrawReceipt, WithdrawRequest, owned_bins,
};
use crate::policy::{RebalanceIntent, RebalanceTrigger};
use crate::pool::window_ids;

mod saga;

pub(crate) use saga::{SagaError, SagaStatus, SagaStore};

const DEFAULT_DEADLINE_SECS: u64 = 1800;
const DEFAULT_SLIPPAGE_BPS: u16 = 50;
const DEFAULT_ID_SLIPPAGE: u32 = 1;
const DEFAULT_KEEP_RADIUS: u32 = 0;
const DEFAULT_REQUIRED_CONFIRMATIONS: u64 = 1;
const BPS_DENOMINATOR: u16 = 10_000;

/// `[execution]` section of the plaintext config.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct ExecutionConfig {
    pub(crate) deadline_secs: Option<u64>,
    pub(crate) slippage_bps: Option<u16>,
    pub(crate) id_slippage: Option<u32>,
    /// Owned bins this close to the target are left in place.
    pub(crate) keep_radius: Option<u32>,
    pub(crate) required_confirmations: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ExecutionCtx {
    pub(crate) deadline: TimeDelta,
    pub(crate) slippage_bps: u16,
    pub(crate) id_slippage: u32,
    pub(crate) keep_radius: u32,
    pub(crate) required_confirmations: u64,
}

impl ExecutionCtx {
    pub(crate) fn new(config: Option<ExecutionConfig>) -> Self {
        let config = config.unwrap_or_default();
        let deadline_secs = config.deadline_secs.unwrap_or(DEFAULT_DEADLINE_SECS);

        Self {
            deadline: i64::try_from(deadline_secs)
                .ok()
                .and_then(TimeDelta::try_seconds)
                .unwrap_or(TimeDelta::MAX),
            slippage_bps: config.slippage_bps.unwrap_or(DEFAULT_SLIPPAGE_BPS),
            id_slippage: config.id_slippage.unwrap_or(DEFAULT_ID_SLIPPAGE),
            keep_radius: config.keep_radius.unwrap_or(DEFAULT_KEEP_RADIUS),
            required_confirmations: config
                .required_confirmations
                .unwrap_or(DEFAULT_REQUIRED_CONFIRMATIONS),
        }
    }

    /// Lowest acceptable amount after `slippage_bps`.
    fn min_amount(&self, amount: U256) -> U256 {
        let slippage = amount.saturating_mul(U256::from(self.slippage_bps))
            / U256::from(BPS_DENOMINATOR);
        amount.saturating_sub(slippage)
    }
}

impl Default for ExecutionCtx {
    fn default() -> Self {
        Self::new(None)
    }
}

#[derive(Debug, thiserror::Error)]
pub(crate) enum RebalanceError {
    #[error("ledger read failed: {0}")]
    Ledger(#[from] LedgerError),
    #[error("saga bookkeeping failed: {0}")]
    Saga(#[from] SagaError),
    #[error("no owned liquidity to move into bin {target_bin}")]
    NothingToWithdraw { target_bin: u32 },
    #[error("rebalance {saga_id} withdraw failed: {source}")]
    WithdrawFailed { saga_id: Uuid, source: LedgerError },
    #[error(
        "rebalance {saga_id} partially applied: withdraw {withdraw_tx} confirmed \
         but the deposit did not complete: {source}"
    )]
    PartiallyApplied {
        saga_id: Uuid,
        withdraw_tx: TxHash,
        /// Token amounts received from the withdraw, when they could be
        /// measured.
        withdrawn: Option<(U256, U256)>,
        source: LedgerError,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct RebalanceReceipt {
    pub(crate) saga_id: Uuid,
    pub(crate) from_bins: Vec<u32>,
    pub(crate) to_bin: u32,
    pub(crate) withdraw_tx: TxHash,
    pub(crate) deposit_tx: TxHash,
    pub(crate) gas: GasCost,
}

pub(crate) struct RebalanceExecutor<L> {
    ledger: L,
    sagas: SagaStore,
    ctx: ExecutionCtx,
    bin_radius: u32,
}

impl<L: Ledger> RebalanceExecutor<L> {
    pub(crate) fn new(ledger: L, sagas: SagaStore, ctx: ExecutionCtx, bin_radius: u32) -> Self {
        Self {
            ledger,
            sagas,
            ctx,
            bin_radius,
        }
    }

    /// Owned bins to vacate: every non-empty bin in the window around the
    /// target except those within `keep_radius` of it. The intent's source
    /// bin is always vacated.
    async fn withdraw_set(
        &self,
        intent: &RebalanceIntent,
    ) -> Result<Vec<(u32, U256)>, LedgerError> {
        let target = intent.deposit_to;
        let mut candidates = window_ids(target, self.bin_radius);
        if !candidates.contains(&intent.withdraw_from) {
            candidates.push(intent.withdraw_from);
            candidates.sort_unstable();
        }

        let owned = owned_bins(&self.ledger, self.ledger.owner(), &candidates).await?;

        Ok(owned
            .into_iter()
            .filter(|(bin_id, _)| {
                *bin_id == intent.withdraw_from || bin_id.abs_diff(target) > self.ctx.keep_radius
            })
            .collect())
    }

    #[instrument(skip(self, intent), fields(from = intent.withdraw_from, to = intent.deposit_to))]
    pub(crate) async fn execute(
        &self,
        intent: &RebalanceIntent,
        trigger: RebalanceTrigger,
        now: DateTime<Utc>,
    ) -> Result<RebalanceReceipt, RebalanceError> {
        let target_bin = intent.deposit_to;
        let withdraw_set = self.withdraw_set(intent).await?;

        if withdraw_set.is_empty() {
            return Err(RebalanceError::NothingToWithdraw { target_bin });
        }

        let (from_bins, amounts): (Vec<u32>, Vec<U256>) = withdraw_set.into_iter().unzip();
        let saga_id = self.sagas.start(&from_bins, target_bin, trigger, now).await?;
        let recipient = self.ledger.owner();
        let deadline = now
            .checked_add_signed(self.ctx.deadline)
            .unwrap_or(DateTime::<Utc>::MAX_UTC);

        info!(%saga_id, ?from_bins, "Withdrawing liquidity");

        let withdraw = WithdrawRequest {
            bin_ids: from_bins.clone(),
            amounts,
            amount_x_min: U256::ZERO,
            amount_y_min: U256::ZERO,
            recipient,
            deadline,
        };

        let withdrawn = match self.ledger.withdraw(&withdraw).await {
            Ok(receipt) => receipt,
            Err(LedgerError::WithdrawUnmeasured { tx_hash, source }) => {
                let source = *source;
                self.record_deposit_failure(saga_id, &source, now).await;
                return Err(RebalanceError::PartiallyApplied {
                    saga_id,
                    withdraw_tx: tx_hash,
                    withdrawn: None,
                    source,
                });
            }
            Err(source) => {
                self.sagas
                    .mark_withdraw_failed(saga_id, &source.to_string(), now)
                    .await
                    .inspect_err(|error| {
                        warn!(%saga_id, ?error, "Failed to record withdraw failure");
                    })
                    .ok();
                return Err(RebalanceError::WithdrawFailed { saga_id, source });
            }
        };

        let WithdrawReceipt {
            tx_hash: withdraw_tx,
            amount_x,
            amount_y,
            gas: withdraw_gas,
        } = withdrawn;

        self.sagas
            .mark_withdrawn(saga_id, withdraw_tx, amount_x, amount_y, now)
            .await
            .inspect_err(|error| {
                warn!(%saga_id, ?error, "Failed to record withdraw");
            })
            .ok();

        info!(%saga_id, %withdraw_tx, %amount_x, %amount_y, "Depositing into target bin");

        let deposit = DepositRequest {
            target_bin_id: target_bin,
            amount_x,
            amount_y,
            amount_x_min: self.ctx.min_amount(amount_x),
            amount_y_min: self.ctx.min_amount(amount_y),
            id_slippage: self.ctx.id_slippage,
            recipient,
            deadline,
        };

        let deposited = match self.ledger.deposit(&deposit).await {
            Ok(receipt) => receipt,
            Err(source) => {
                self.record_deposit_failure(saga_id, &source, now).await;
                return Err(RebalanceError::PartiallyApplied {
                    saga_id,
                    withdraw_tx,
                    withdrawn: Some((amount_x, amount_y)),
                    source,
                });
            }
        };

        self.sagas
            .mark_completed(saga_id, deposited.tx_hash, now)
            .await
            .inspect_err(|error| {
                warn!(%saga_id, ?error, "Failed to record completion");
            })
            .ok();

        let gas = withdraw_gas.saturating_add(deposited.gas);
        info!(
            %saga_id,
            %withdraw_tx,
            deposit_tx = %deposited.tx_hash,
            gas_used = gas.gas_used,
            cost_wei = gas.cost_wei,
            "Rebalance completed"
        );

        Ok(RebalanceReceipt {
            saga_id,
            from_bins,
            to_bin: target_bin,
            withdraw_tx,
            deposit_tx: deposited.tx_hash,
            gas,
        })
    }

    async fn record_deposit_failure(&self, saga_id: Uuid, source: &LedgerError, now: DateTime<Utc>) {
        error!(%saga_id, error = %source, "Liquidity withdrawn but not redeposited");

        self.sagas
            .mark_deposit_failed(saga_id, &source.to_string(), now)
            .await
            .inspect_err(|error| {
                warn!(%saga_id, ?error, "Failed to record deposit failure");
            })
            .ok();
    }
}

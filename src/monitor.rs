//! The agent's control loop.
//!
//! Every tick pulls a fresh [`PoolState`] and [`MarketReference`], rolls
//! the action budget over when its period has expired, evaluates the
//! policy and, when the policy asks for it and the budget allows, runs a
//! rebalance. The resulting [`AgentState`] is persisted at the end of
//! every completed cycle.
//!
//! A failing cycle is logged and audited, never fatal: the next tick
//! starts from the last committed state.

use std::time::Duration;

use alloy::primitives::U256;
use chrono::{DateTime, Utc};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, instrument, warn};

use crate::audit::{AuditEvent, AuditSink};
use crate::budget::{ActionBudgetState, BudgetConfig};
use crate::ledger::{Ledger, LedgerError, owned_bins};
use crate::oracle::{MarketReference, OracleError, PriceOracle};
use crate::policy::{Decision, PolicyConfig, Position, RebalanceTrigger, WaitReason, evaluate};
use crate::pool::{PoolState, window_ids};
use crate::rebalance::{RebalanceError, RebalanceExecutor, RebalanceReceipt};
use crate::state::{AgentState, StateError, StateStore};

pub(crate) trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

pub(crate) struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct MonitorCtx {
    pub(crate) poll_interval: Duration,
    pub(crate) bin_radius: u32,
    pub(crate) policy: PolicyConfig,
    pub(crate) budget: BudgetConfig,
}

#[derive(Debug, thiserror::Error)]
pub(crate) enum CycleError {
    #[error("oracle error: {0}")]
    Oracle(#[from] OracleError),
    #[error("ledger error: {0}")]
    Ledger(#[from] LedgerError),
    #[error("state persistence error: {0}")]
    State(#[from] StateError),
    #[error("cannot size the action budget: no bin around {active_bin_id} holds liquidity")]
    EmptyWindow { active_bin_id: u32 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum CycleOutcome {
    Held,
    Waiting(WaitReason),
    Rebalanced(RebalanceReceipt),
    BudgetExhausted,
    RebalanceFailed,
}

pub(crate) struct MonitorLoop<O, L, A, C> {
    ctx: MonitorCtx,
    oracle: O,
    ledger: L,
    executor: RebalanceExecutor<L>,
    audit: A,
    store: StateStore,
    clock: C,
    state: Option<AgentState>,
    last_active_bin: Option<u32>,
}

impl<O, L, A, C> MonitorLoop<O, L, A, C>
where
    O: PriceOracle,
    L: Ledger,
    A: AuditSink,
    C: Clock,
{
    pub(crate) fn new(
        ctx: MonitorCtx,
        oracle: O,
        ledger: L,
        executor: RebalanceExecutor<L>,
        audit: A,
        store: StateStore,
        clock: C,
    ) -> Self {
        Self {
            ctx,
            oracle,
            ledger,
            executor,
            audit,
            store,
            clock,
            state: None,
            last_active_bin: None,
        }
    }

    /// Runs cycles forever, one per `poll_interval`. The first cycle
    /// starts immediately and a slow cycle delays the next one instead of
    /// stacking up missed ticks.
    pub(crate) async fn run(mut self) {
        let mut interval = tokio::time::interval(self.ctx.poll_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            poll_interval = ?self.ctx.poll_interval,
            bin_radius = self.ctx.bin_radius,
            "Starting monitor loop"
        );

        loop {
            interval.tick().await;

            match self.tick().await {
                Ok(outcome) => debug!(?outcome, "Monitor cycle finished"),
                Err(error) => {
                    error!(%error, "Monitor cycle failed");
                    self.audit
                        .record(
                            &AuditEvent::CycleFailed {
                                error: error.to_string(),
                            },
                            self.clock.now(),
                        )
                        .await;
                }
            }
        }
    }

    /// One full observe-decide-act cycle.
    #[instrument(skip(self), level = tracing::Level::DEBUG)]
    pub(crate) async fn tick(&mut self) -> Result<CycleOutcome, CycleError> {
        let now = self.clock.now();
        let pool = self.oracle.pool_state().await?;
        let market = self.oracle.market_reference().await?;

        let mut state = self.current_state(&pool, now).await?;

        if let Some(share) = pool.dominant_bin_share()
            && state.budget.rollover_if_expired(now, share, &self.ctx.budget)
        {
            info!(
                max_actions = state.budget.max_actions,
                %share,
                "Action budget rolled over"
            );
            self.audit
                .record(
                    &AuditEvent::BudgetRollover {
                        max_actions: state.budget.max_actions,
                    },
                    now,
                )
                .await;
        }

        self.observe_active_bin(pool.active_bin_id, now).await;

        let outcome = self.decide_and_act(&mut state, &pool, &market, now).await;

        self.state = Some(state.clone());
        self.store.save(&state, now).await?;

        Ok(outcome)
    }

    async fn decide_and_act(
        &self,
        state: &mut AgentState,
        pool: &PoolState,
        market: &MarketReference,
        now: DateTime<Utc>,
    ) -> CycleOutcome {
        let observed = state.position;
        let policy = evaluate(&observed, pool, market, now, &self.ctx.policy);
        state.position = policy.position;

        let (intent, trigger) = match policy.decision {
            Decision::Hold => {
                debug!(bin_id = state.position.current_bin_id, "Position is in range");
                return CycleOutcome::Held;
            }
            Decision::Wait(reason) => {
                debug!(
                    current_bin_id = state.position.current_bin_id,
                    active_bin_id = pool.active_bin_id,
                    market_price = %market.price,
                    ?reason,
                    "Waiting before rebalancing"
                );
                return CycleOutcome::Waiting(reason);
            }
            Decision::Rebalance { intent, trigger } => (intent, trigger),
        };

        let budget_before = state.budget.clone();
        // A skipped or failed rebalance leaves the position as it was
        // before this cycle's evaluation.
        if !state.budget.try_consume() {
            state.position = observed;
            warn!(
                max_actions = state.budget.max_actions,
                %trigger,
                "Action budget exhausted, skipping rebalance"
            );
            self.audit
                .record(
                    &AuditEvent::BudgetExhausted {
                        max_actions: state.budget.max_actions,
                        trigger,
                    },
                    now,
                )
                .await;
            return CycleOutcome::BudgetExhausted;
        }

        info!(
            from = intent.withdraw_from,
            to = intent.deposit_to,
            %trigger,
            remaining = state.budget.remaining(),
            "Rebalancing"
        );

        match self.executor.execute(&intent, trigger, now).await {
            Ok(receipt) => {
                state.position = Position::at(intent.deposit_to);
                self.record_executed(&receipt, trigger, now).await;
                CycleOutcome::Rebalanced(receipt)
            }
            Err(error) => {
                self.record_failure(&error, now).await;
                state.position = observed;

                // Nothing reached the chain, so the attempt is not charged.
                if !submitted_transaction(&error) {
                    state.budget = budget_before;
                }

                CycleOutcome::RebalanceFailed
            }
        }
    }

    async fn current_state(
        &self,
        pool: &PoolState,
        now: DateTime<Utc>,
    ) -> Result<AgentState, CycleError> {
        if let Some(state) = &self.state {
            return Ok(state.clone());
        }

        let state = match self.store.load().await? {
            Some(state) => {
                info!(
                    current_bin_id = state.position.current_bin_id,
                    actions_taken = state.budget.actions_taken,
                    max_actions = state.budget.max_actions,
                    "Restored agent state"
                );
                state
            }
            None => self.bootstrap(pool, now).await?,
        };

        self.audit
            .record(
                &AuditEvent::Started {
                    current_bin_id: state.position.current_bin_id,
                    max_actions: state.budget.max_actions,
                },
                now,
            )
            .await;

        Ok(state)
    }

    /// Fresh state for a first start: the position is the owned bin with
    /// the largest balance around the active bin, or the active bin when
    /// nothing is owned there.
    async fn bootstrap(&self, pool: &PoolState, now: DateTime<Utc>) -> Result<AgentState, CycleError> {
        let active_bin_id = pool.active_bin_id;
        let share = pool
            .dominant_bin_share()
            .ok_or(CycleError::EmptyWindow { active_bin_id })?;

        let window = window_ids(active_bin_id, self.ctx.bin_radius);
        let owned = owned_bins(&self.ledger, self.ledger.owner(), &window).await?;
        let current_bin_id = largest_holding(&owned).unwrap_or(active_bin_id);

        let budget = ActionBudgetState::bootstrap(now, share, &self.ctx.budget);

        info!(
            current_bin_id,
            active_bin_id,
            owned_bins = owned.len(),
            max_actions = budget.max_actions,
            "Bootstrapped agent state"
        );

        Ok(AgentState {
            position: Position::at(current_bin_id),
            budget,
        })
    }

    async fn observe_active_bin(&mut self, active_bin_id: u32, now: DateTime<Utc>) {
        if let Some(previous) = self.last_active_bin
            && previous != active_bin_id
        {
            info!(from = previous, to = active_bin_id, "Active bin changed");
            self.audit
                .record(
                    &AuditEvent::ActiveBinChanged {
                        from: previous,
                        to: active_bin_id,
                    },
                    now,
                )
                .await;
        }

        self.last_active_bin = Some(active_bin_id);
    }

    async fn record_executed(
        &self,
        receipt: &RebalanceReceipt,
        trigger: RebalanceTrigger,
        now: DateTime<Utc>,
    ) {
        self.audit
            .record(
                &AuditEvent::RebalanceExecuted {
                    saga_id: receipt.saga_id,
                    from_bins: receipt.from_bins.clone(),
                    to_bin: receipt.to_bin,
                    trigger,
                    withdraw_tx: receipt.withdraw_tx,
                    deposit_tx: receipt.deposit_tx,
                    gas_used: receipt.gas.gas_used,
                    cost_wei: receipt.gas.cost_wei,
                },
                now,
            )
            .await;
    }

    async fn record_failure(&self, error: &RebalanceError, now: DateTime<Utc>) {
        let event = match error {
            RebalanceError::PartiallyApplied {
                saga_id,
                withdraw_tx,
                withdrawn,
                ..
            } => {
                error!(
                    %saga_id,
                    %withdraw_tx,
                    ?withdrawn,
                    %error,
                    "Rebalance partially applied, withdrawn tokens need manual redeposit"
                );
                AuditEvent::PartialRebalance {
                    saga_id: *saga_id,
                    withdraw_tx: *withdraw_tx,
                    error: error.to_string(),
                }
            }
            _ => {
                error!(%error, "Rebalance failed");
                AuditEvent::RebalanceFailed {
                    error: error.to_string(),
                }
            }
        };

        self.audit.record(&event, now).await;
    }
}

fn largest_holding(owned: &[(u32, U256)]) -> Option<u32> {
    owned
        .iter()
        .max_by(|(id_a, balance_a), (id_b, balance_b)| {
            balance_a.cmp(balance_b).then(id_b.cmp(id_a))
        })
        .map(|(bin_id, _)| *bin_id)
}

fn submitted_transaction(error: &RebalanceError) -> bool {
    match error {
        RebalanceError::Ledger(_)
        | RebalanceError::Saga(_)
        | RebalanceError::NothingToWithdraw { .. } => false,
        RebalanceError::WithdrawFailed { .. } | RebalanceError::PartiallyApplied { .. } => true,
    }
}

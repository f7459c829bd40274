//! Rebalance decision policy.
//!
//! A pure function of the agent's [`Position`], the [`PoolState`], the
//! [`MarketReference`] and the current time. The state machine is
//! implicit in `Position::inactive_since`:
//!
//! ```text
//!            current == active
//!   ┌────────────────────────────────┐
//!   v                                │
//! Active ──diverged──> Inactive-Waiting ──stale_after elapsed──> Inactive-Forced
//!   ^                        │                                         │
//!   └────rebalance executed──┴─────────────────────────────────────────┘
//! ```
//!
//! While waiting, the agent only moves when the market has come to meet
//! the active bin and that bin carries enough depth. Once the position
//! has been out of range for `stale_after`, it moves regardless of
//! price. The action budget is enforced by the caller, not here.

use std::fmt;

use chrono::{DateTime, TimeDelta, Utc};
use rust_decimal::Decimal;
use serde::Serialize;

use crate::oracle::MarketReference;
use crate::pool::{BinSnapshot, PoolState};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct PolicyConfig {
    /// Largest price difference still treated as a match.
    pub(crate) epsilon: Decimal,
    /// Minimum active-bin liquidity as a fraction of the agent's bin.
    pub(crate) liquidity_ratio: Decimal,
    /// Inactivity after which the price rule is bypassed.
    pub(crate) stale_after: TimeDelta,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Position {
    pub(crate) current_bin_id: u32,
    pub(crate) inactive_since: Option<DateTime<Utc>>,
}

impl Position {
    pub(crate) fn at(bin_id: u32) -> Self {
        Self {
            current_bin_id: bin_id,
            inactive_since: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub(crate) struct RebalanceIntent {
    pub(crate) withdraw_from: u32,
    pub(crate) deposit_to: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub(crate) enum RebalanceTrigger {
    PriceConverged,
    StaleOverride,
}

impl fmt::Display for RebalanceTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PriceConverged => write!(f, "price_converged"),
            Self::StaleOverride => write!(f, "stale_override"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WaitReason {
    /// The agent's bin already trades at the market price.
    AtMarket,
    /// The active bin matches the market but is too shallow to move into.
    ShallowActiveBin,
    /// Neither bin matches the market.
    NoMarketMatch,
    /// The active bin or the agent's bin is outside the polled window.
    MissingBinData,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Decision {
    Hold,
    Wait(WaitReason),
    Rebalance {
        intent: RebalanceIntent,
        trigger: RebalanceTrigger,
    },
}

/// Decision plus the position with inactivity bookkeeping applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct PolicyOutcome {
    pub(crate) decision: Decision,
    pub(crate) position: Position,
}

fn within(a: Decimal, b: Decimal, epsilon: Decimal) -> bool {
    (a - b).abs() <= epsilon
}

pub(crate) fn evaluate(
    position: &Position,
    pool: &PoolState,
    market: &MarketReference,
    now: DateTime<Utc>,
    config: &PolicyConfig,
) -> PolicyOutcome {
    let current = position.current_bin_id;
    let active = pool.active_bin_id;

    if current == active {
        return PolicyOutcome {
            decision: Decision::Hold,
            position: Position::at(current),
        };
    }

    // Stamped on first divergence and never moved forward afterwards.
    let inactive_since = position.inactive_since.unwrap_or(now);
    let position = Position {
        current_bin_id: current,
        inactive_since: Some(inactive_since),
    };
    let intent = RebalanceIntent {
        withdraw_from: current,
        deposit_to: active,
    };

    let decide = |decision| PolicyOutcome { decision, position };

    if now - inactive_since >= config.stale_after {
        return decide(Decision::Rebalance {
            intent,
            trigger: RebalanceTrigger::StaleOverride,
        });
    }

    let (Some(active_bin), Some(my_bin)) = (pool.active_bin(), pool.bin(current)) else {
        return decide(Decision::Wait(WaitReason::MissingBinData));
    };

    let active_matches = within(active_bin.price, market.price, config.epsilon);
    if active_matches && has_depth(active_bin, my_bin, config.liquidity_ratio) {
        return decide(Decision::Rebalance {
            intent,
            trigger: RebalanceTrigger::PriceConverged,
        });
    }

    if within(my_bin.price, market.price, config.epsilon) {
        return decide(Decision::Wait(WaitReason::AtMarket));
    }

    if active_matches {
        return decide(Decision::Wait(WaitReason::ShallowActiveBin));
    }

    decide(Decision::Wait(WaitReason::NoMarketMatch))
}

/// Whether the active bin holds at least `ratio` times the agent's bin
/// liquidity. A required depth too large to represent is never met.
fn has_depth(active_bin: &BinSnapshot, my_bin: &BinSnapshot, ratio: Decimal) -> bool {
    ratio
        .checked_mul(my_bin.liquidity())
        .is_some_and(|required| active_bin.liquidity() >= required)
}

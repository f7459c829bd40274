//! Daily action budget.
//!
//! Every rebalance pays swap fees on the liquidity it moves, so the
//! agent caps how many rebalances it performs per 24h period. The cap is
//! derived from an assumed annual yield and a per-action fee, scaled by
//! the reserve-X share of the pool's most liquid bin:
//!
//! ```text
//! max_actions = floor((apr / 365) / (share * fee))
//! ```
//!
//! A period lasts 24 hours from `period_start`. The cap is recomputed
//! only at rollover and `actions_taken` only ever grows within a period.

use chrono::{DateTime, TimeDelta, Utc};
use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal_macros::dec;
use serde::Deserialize;

const DAYS_PER_YEAR: Decimal = dec!(365);
const PERIOD_HOURS: i64 = 24;

/// `[budget]` section of the plaintext config. Missing keys take their
/// defaults.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub(crate) struct BudgetConfig {
    /// Assumed annual yield of the position, as a fraction.
    pub(crate) apr: Decimal,
    /// Fee paid per rebalance, as a fraction of the moved liquidity.
    pub(crate) fee: Decimal,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            apr: dec!(0.08),
            fee: dec!(0.0001),
        }
    }
}

/// Maximum number of actions for a period given the dominant bin share.
///
/// A non-positive share yields zero. A share small enough to overflow
/// the quotient saturates at `u32::MAX`.
pub(crate) fn max_actions_for_share(share: Decimal, config: &BudgetConfig) -> u32 {
    if share <= Decimal::ZERO || config.fee <= Decimal::ZERO || config.apr <= Decimal::ZERO {
        return 0;
    }

    let daily_yield = config.apr / DAYS_PER_YEAR;

    let Some(cost) = share.checked_mul(config.fee).filter(|cost| !cost.is_zero()) else {
        return u32::MAX;
    };

    daily_yield
        .checked_div(cost)
        .map_or(u32::MAX, |quotient| quotient.floor().to_u32().unwrap_or(u32::MAX))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ActionBudgetState {
    pub(crate) period_start: DateTime<Utc>,
    pub(crate) max_actions: u32,
    pub(crate) actions_taken: u32,
}

impl ActionBudgetState {
    /// Opens the first period at `now` with a freshly computed cap.
    pub(crate) fn bootstrap(now: DateTime<Utc>, share: Decimal, config: &BudgetConfig) -> Self {
        Self {
            period_start: now,
            max_actions: max_actions_for_share(share, config),
            actions_taken: 0,
        }
    }

    pub(crate) fn recompute_for_period(&mut self, share: Decimal, config: &BudgetConfig) -> u32 {
        self.max_actions = max_actions_for_share(share, config);
        self.max_actions
    }

    /// Starts a new period when more than 24h have passed since
    /// `period_start`. Returns whether a rollover happened.
    pub(crate) fn rollover_if_expired(
        &mut self,
        now: DateTime<Utc>,
        share: Decimal,
        config: &BudgetConfig,
    ) -> bool {
        if now - self.period_start <= TimeDelta::hours(PERIOD_HOURS) {
            return false;
        }

        self.recompute_for_period(share, config);
        self.actions_taken = 0;
        self.period_start = now;
        true
    }

    /// Claims one action from the budget. Leaves the state untouched and
    /// returns `false` once the cap is reached.
    pub(crate) fn try_consume(&mut self) -> bool {
        if self.actions_taken >= self.max_actions {
            return false;
        }

        self.actions_taken += 1;
        true
    }

    pub(crate) fn remaining(&self) -> u32 {
        self.max_actions.saturating_sub(self.actions_taken)
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use proptest::prelude::*;

    use super::*;

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).unwrap()
    }

    #[test]
    fn default_constants_allow_four_actions_for_balanced_bin() {
        // 0.08 / 365 / (0.5 * 0.0001) = 4.38...
        let max = max_actions_for_share(dec!(0.5), &BudgetConfig::default());
        assert_eq!(max, 4);
    }

    #[test]
    fn one_sided_bin_allows_two_actions() {
        // 0.08 / 365 / 0.0001 = 2.19...
        let max = max_actions_for_share(Decimal::ONE, &BudgetConfig::default());
        assert_eq!(max, 2);
    }

    #[test]
    fn zero_share_yields_empty_budget() {
        assert_eq!(max_actions_for_share(Decimal::ZERO, &BudgetConfig::default()), 0);
        assert_eq!(max_actions_for_share(dec!(-0.1), &BudgetConfig::default()), 0);
    }

    #[test]
    fn vanishing_share_saturates() {
        let max = max_actions_for_share(dec!(0.0000000000000000000000000001), &BudgetConfig::default());
        assert_eq!(max, u32::MAX);
    }

    #[test]
    fn try_consume_stops_at_cap() {
        let mut budget = ActionBudgetState {
            period_start: start(),
            max_actions: 2,
            actions_taken: 0,
        };

        assert!(budget.try_consume());
        assert!(budget.try_consume());
        assert!(!budget.try_consume());
        assert_eq!(budget.actions_taken, 2);
        assert_eq!(budget.remaining(), 0);
    }

    #[test]
    fn empty_budget_never_consumes() {
        let mut budget = ActionBudgetState {
            period_start: start(),
            max_actions: 0,
            actions_taken: 0,
        };

        assert!(!budget.try_consume());
        assert_eq!(budget.actions_taken, 0);
    }

    #[test]
    fn rollover_waits_for_full_period() {
        let config = BudgetConfig::default();
        let mut budget = ActionBudgetState::bootstrap(start(), dec!(0.5), &config);
        budget.try_consume();

        let exactly_one_day = start() + TimeDelta::hours(24);
        assert!(!budget.rollover_if_expired(exactly_one_day, Decimal::ONE, &config));
        assert_eq!(budget.actions_taken, 1);
        assert_eq!(budget.max_actions, 4);
    }

    #[test]
    fn rollover_resets_counter_and_recomputes_cap() {
        let config = BudgetConfig::default();
        let mut budget = ActionBudgetState::bootstrap(start(), dec!(0.5), &config);
        budget.try_consume();

        let later = start() + TimeDelta::hours(24) + TimeDelta::seconds(1);
        assert!(budget.rollover_if_expired(later, Decimal::ONE, &config));

        assert_eq!(
            budget,
            ActionBudgetState {
                period_start: later,
                max_actions: 2,
                actions_taken: 0,
            }
        );
    }

    #[test]
    fn rollover_is_idempotent_within_period() {
        let config = BudgetConfig::default();
        let mut budget = ActionBudgetState::bootstrap(start(), dec!(0.5), &config);

        let later = start() + TimeDelta::hours(25);
        assert!(budget.rollover_if_expired(later, dec!(0.25), &config));
        let after_first = budget.clone();

        assert!(!budget.rollover_if_expired(later + TimeDelta::hours(1), dec!(0.9), &config));
        assert_eq!(budget, after_first);
    }

    fn arb_share() -> impl Strategy<Value = Decimal> {
        (1_u32..=1_000_000).prop_map(|millionths| Decimal::new(i64::from(millionths), 6))
    }

    proptest! {
        #[test]
        fn cap_matches_formula(share in arb_share()) {
            let config = BudgetConfig::default();
            let expected = (config.apr / DAYS_PER_YEAR / (share * config.fee)).floor();

            let max = max_actions_for_share(share, &config);

            prop_assert_eq!(Decimal::from(max), expected.min(Decimal::from(u32::MAX)));
        }

        #[test]
        fn cap_is_non_increasing_in_share(a in arb_share(), b in arb_share()) {
            let config = BudgetConfig::default();
            let (low, high) = if a <= b { (a, b) } else { (b, a) };

            prop_assert!(max_actions_for_share(low, &config) >= max_actions_for_share(high, &config));
        }

        #[test]
        fn consume_never_exceeds_cap(max in 0_u32..50, attempts in 0_usize..100) {
            let mut budget = ActionBudgetState {
                period_start: start(),
                max_actions: max,
                actions_taken: 0,
            };

            let granted = (0..attempts).filter(|_| budget.try_consume()).count();

            prop_assert!(budget.actions_taken <= budget.max_actions);
            prop_assert_eq!(granted, attempts.min(max as usize));
        }
    }
}

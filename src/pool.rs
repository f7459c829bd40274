//! Point-in-time views of a Liquidity Book pool.
//!
//! Bins are discrete price buckets. Bin `2^23` trades at price 1 and
//! every step away multiplies the price by `1 + bin_step / 10_000`.
//! Prices are rounded to a fixed number of decimal places before they
//! are compared against the market.

use std::collections::BTreeMap;

use rust_decimal::{Decimal, MathematicalOps, RoundingStrategy};
use rust_decimal_macros::dec;

pub(crate) const UNIT_PRICE_BIN_ID: u32 = 1 << 23;
const BASIS_POINT_MAX: Decimal = dec!(10000);

pub(crate) fn round_price(price: Decimal, precision: u32) -> Decimal {
    price.round_dp_with_strategy(precision, RoundingStrategy::MidpointAwayFromZero)
}

/// Price of token X in token Y for `bin_id`, adjusted for token decimals.
///
/// Returns `None` if the power overflows the decimal range, which only
/// happens for bins far outside any realistic trading range.
pub(crate) fn bin_price(
    bin_id: u32,
    bin_step: u16,
    decimals_x: u8,
    decimals_y: u8,
) -> Option<Decimal> {
    let base = Decimal::ONE + Decimal::from(bin_step) / BASIS_POINT_MAX;
    let exponent = i64::from(bin_id) - i64::from(UNIT_PRICE_BIN_ID);

    let raw = if exponent >= 0 {
        base.checked_powu(exponent.unsigned_abs())?
    } else {
        Decimal::ONE.checked_div(base.checked_powu(exponent.unsigned_abs())?)?
    };

    let decimal_shift = i64::from(decimals_x) - i64::from(decimals_y);
    let scale = Decimal::TEN.checked_powu(decimal_shift.unsigned_abs())?;

    if decimal_shift >= 0 {
        raw.checked_mul(scale)
    } else {
        raw.checked_div(scale)
    }
}

/// Bin ids within `radius` of `active_bin_id`, clamped to the valid
/// 24-bit id range.
pub(crate) fn window_ids(active_bin_id: u32, radius: u32) -> Vec<u32> {
    let max_bin_id = (1_u32 << 24) - 1;
    let low = active_bin_id.saturating_sub(radius);
    let high = active_bin_id.saturating_add(radius).min(max_bin_id);
    (low..=high).collect()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct BinSnapshot {
    pub(crate) bin_id: u32,
    pub(crate) reserve_x: Decimal,
    pub(crate) reserve_y: Decimal,
    pub(crate) price: Decimal,
}

impl BinSnapshot {
    pub(crate) fn new(
        bin_id: u32,
        reserve_x: Decimal,
        reserve_y: Decimal,
        price: Decimal,
        precision: u32,
    ) -> Self {
        Self {
            bin_id,
            reserve_x: reserve_x.max(Decimal::ZERO),
            reserve_y: reserve_y.max(Decimal::ZERO),
            price: round_price(price, precision),
        }
    }

    pub(crate) fn liquidity(&self) -> Decimal {
        self.reserve_x.saturating_add(self.reserve_y)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct PoolState {
    pub(crate) active_bin_id: u32,
    pub(crate) bin_step: u16,
    pub(crate) bins: BTreeMap<u32, BinSnapshot>,
}

impl PoolState {
    pub(crate) fn new(active_bin_id: u32, bin_step: u16, bins: Vec<BinSnapshot>) -> Self {
        Self {
            active_bin_id,
            bin_step,
            bins: bins.into_iter().map(|bin| (bin.bin_id, bin)).collect(),
        }
    }

    pub(crate) fn bin(&self, bin_id: u32) -> Option<&BinSnapshot> {
        self.bins.get(&bin_id)
    }

    pub(crate) fn active_bin(&self) -> Option<&BinSnapshot> {
        self.bin(self.active_bin_id)
    }

    /// Reserve-X share of the most liquid bin in the window.
    ///
    /// `None` when no bin in the window holds any liquidity. Ties go to
    /// the lowest bin id.
    pub(crate) fn dominant_bin_share(&self) -> Option<Decimal> {
        let mut dominant: Option<&BinSnapshot> = None;

        for bin in self.bins.values() {
            let is_deeper = dominant.is_none_or(|best| bin.liquidity() > best.liquidity());
            if bin.liquidity() > Decimal::ZERO && is_deeper {
                dominant = Some(bin);
            }
        }

        dominant.map(|bin| bin.reserve_x / bin.liquidity())
    }
}

//! Price and pool data retrieval.
//!
//! A [`PriceOracle`] answers two questions per cycle: what the pool
//! looks like around its active bin ([`PoolState`]), and what the
//! outside market says the pair is worth ([`MarketReference`]). No
//! decisions are made here.

use std::sync::Arc;

use async_trait::async_trait;
use reqwest::StatusCode;
use rust_decimal::Decimal;

use crate::ledger::LedgerError;
use crate::pool::{PoolState, round_price};

mod http;
#[cfg(test)]
pub(crate) mod mock;

pub(crate) use http::{HttpPriceOracle, OracleConfig, OracleCtx};

#[derive(Debug, thiserror::Error)]
pub(crate) enum OracleError {
    #[error("HTTP request failed: {0}")]
    Reqwest(#[from] reqwest::Error),
    #[error("API error (status {status}): {message}")]
    Api { status: StatusCode, message: String },
    #[error("invalid feed URL: {0}")]
    Url(#[from] url::ParseError),
    #[error("ledger read failed: {0}")]
    Ledger(#[from] LedgerError),
    #[error("no usable market samples for {pair}")]
    NoMarketSamples { pair: String },
}

/// One external venue's quote for the pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct MarketSample {
    pub(crate) price: Decimal,
    pub(crate) volume: Decimal,
}

/// Reference price of the pair across the most liquid venues.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct MarketReference {
    pub(crate) price: Decimal,
    pub(crate) venues: usize,
}

impl MarketReference {
    /// Simple mean of the `top_venues` samples with the highest volume,
    /// rounded to `precision` decimal places. Samples without a positive
    /// price are ignored. `None` when nothing usable remains.
    pub(crate) fn from_samples(
        samples: &[MarketSample],
        top_venues: usize,
        precision: u32,
    ) -> Option<Self> {
        let mut usable: Vec<_> = samples
            .iter()
            .filter(|sample| sample.price > Decimal::ZERO)
            .collect();
        usable.sort_by(|a, b| b.volume.cmp(&a.volume));
        usable.truncate(top_venues);

        if usable.is_empty() {
            return None;
        }

        let total: Decimal = usable.iter().map(|sample| sample.price).sum();
        let mean = total / Decimal::from(usable.len());

        Some(Self {
            price: round_price(mean, precision),
            venues: usable.len(),
        })
    }
}

#[async_trait]
pub(crate) trait PriceOracle: Send + Sync {
    async fn pool_state(&self) -> Result<PoolState, OracleError>;

    async fn market_reference(&self) -> Result<MarketReference, OracleError>;
}

#[async_trait]
impl<T: PriceOracle + ?Sized> PriceOracle for Arc<T> {
    async fn pool_state(&self) -> Result<PoolState, OracleError> {
        (**self).pool_state().await
    }

    async fn market_reference(&self) -> Result<MarketReference, OracleError> {
        (**self).market_reference().await
    }
}

#[cfg(test)]
mod tests {
    use rust_decimal_macros::dec;

    use super::*;

    fn sample(price: Decimal, volume: Decimal) -> MarketSample {
        MarketSample { price, volume }
    }

    #[test]
    fn averages_highest_volume_venues() {
        let samples = [
            sample(dec!(1.0002), dec!(10)),
            sample(dec!(0.9000), dec!(1)),
            sample(dec!(1.0000), dec!(500)),
            sample(dec!(1.0001), dec!(200)),
        ];

        let reference = MarketReference::from_samples(&samples, 3, 4).unwrap();

        assert_eq!(reference.price, dec!(1.0001));
        assert_eq!(reference.venues, 3);
    }

    #[test]
    fn mean_is_rounded_to_precision() {
        let samples = [sample(dec!(1.00001), dec!(1)), sample(dec!(1.00008), dec!(1))];

        let reference = MarketReference::from_samples(&samples, 10, 4).unwrap();

        // (1.00001 + 1.00008) / 2 = 1.000045
        assert_eq!(reference.price, dec!(1.0000));
    }

    #[test]
    fn ignores_non_positive_prices() {
        let samples = [sample(Decimal::ZERO, dec!(1000)), sample(dec!(0.9998), dec!(1))];

        let reference = MarketReference::from_samples(&samples, 1, 4).unwrap();

        assert_eq!(reference.price, dec!(0.9998));
    }

    #[test]
    fn no_samples_yields_none() {
        assert_eq!(MarketReference::from_samples(&[], 10, 4), None);
        assert_eq!(
            MarketReference::from_samples(&[sample(dec!(-1), dec!(5))], 10, 4),
            None
        );
    }
}

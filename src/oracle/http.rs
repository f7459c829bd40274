//! HTTP-backed [`PriceOracle`].
//!
//! Market samples come from a DEX aggregator search endpoint; per-bin
//! reserves come from the Merchant Moe bin API. The active bin itself is
//! read from the chain through the [`Ledger`], so a stale API response
//! can never move the agent's notion of the active bin.

use std::time::Duration;

use alloy::primitives::Address;
use async_trait::async_trait;
use backon::{ExponentialBuilder, Retryable};
use reqwest::Client;
use rust_decimal::Decimal;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};
use url::Url;

use super::{MarketReference, MarketSample, OracleError, PriceOracle};
use crate::ledger::Ledger;
use crate::pool::{BinSnapshot, PoolState, bin_price};

const DEFAULT_MARKET_URL: &str = "https://api.dexscreener.com/latest/dex/search/";
const DEFAULT_BINS_URL: &str = "https://barn.merchantmoe.com/v1/lb/bin/mantle/";
const DEFAULT_TOP_VENUES: usize = 10;
const DEFAULT_CHAIN_ID: &str = "mantle";

const FEED_MAX_RETRIES: usize = 3;
const FEED_MIN_DELAY: Duration = Duration::from_millis(500);
const FEED_MAX_DELAY: Duration = Duration::from_secs(5);
const FEED_TIMEOUT: Duration = Duration::from_secs(15);

fn feed_retry_strategy() -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_max_times(FEED_MAX_RETRIES)
        .with_min_delay(FEED_MIN_DELAY)
        .with_max_delay(FEED_MAX_DELAY)
        .with_jitter()
}

/// `[oracle]` section of the plaintext config.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct OracleConfig {
    pub(crate) market_url: Option<Url>,
    pub(crate) bins_url: Option<Url>,
    pub(crate) top_venues: Option<usize>,
    /// Only venues on this chain count towards the market reference.
    /// Set to an empty string to accept every chain.
    pub(crate) chain_id: Option<String>,
}

/// Runtime settings of the HTTP oracle, assembled from several config
/// sections.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct OracleCtx {
    pub(crate) market_url: Url,
    pub(crate) bins_url: Url,
    pub(crate) top_venues: usize,
    pub(crate) chain_id: Option<String>,
    pub(crate) pair: Address,
    pub(crate) base_symbol: String,
    pub(crate) quote_symbol: String,
    pub(crate) bin_radius: u32,
    pub(crate) price_precision: u32,
}

impl OracleCtx {
    pub(crate) fn new(
        config: Option<OracleConfig>,
        pair: Address,
        base_symbol: String,
        quote_symbol: String,
        bin_radius: u32,
        price_precision: u32,
    ) -> Result<Self, url::ParseError> {
        let config = config.unwrap_or(OracleConfig {
            market_url: None,
            bins_url: None,
            top_venues: None,
            chain_id: None,
        });

        let chain_id = match config.chain_id {
            Some(chain_id) if chain_id.is_empty() => None,
            Some(chain_id) => Some(chain_id),
            None => Some(DEFAULT_CHAIN_ID.to_string()),
        };

        Ok(Self {
            market_url: match config.market_url {
                Some(url) => url,
                None => Url::parse(DEFAULT_MARKET_URL)?,
            },
            bins_url: match config.bins_url {
                Some(url) => url,
                None => Url::parse(DEFAULT_BINS_URL)?,
            },
            top_venues: config.top_venues.unwrap_or(DEFAULT_TOP_VENUES),
            chain_id,
            pair,
            base_symbol,
            quote_symbol,
            bin_radius,
            price_precision,
        })
    }

    fn market_query(&self) -> String {
        format!("{}/{}", self.base_symbol, self.quote_symbol)
    }
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    pairs: Option<Vec<VenuePair>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VenuePair {
    chain_id: String,
    base_token: VenueToken,
    quote_token: VenueToken,
    price_native: Option<Decimal>,
    #[serde(default)]
    volume: VenueVolume,
}

#[derive(Debug, Deserialize)]
struct VenueToken {
    symbol: String,
}

#[derive(Debug, Default, Deserialize)]
struct VenueVolume {
    #[serde(default)]
    h24: Decimal,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BinEntry {
    bin_id: u32,
    reserve_x: Decimal,
    reserve_y: Decimal,
    #[serde(default, rename = "priceXY")]
    price_xy: Option<Decimal>,
}

pub(crate) struct HttpPriceOracle<L> {
    client: Client,
    ctx: OracleCtx,
    ledger: L,
    retry_strategy: ExponentialBuilder,
}

impl<L: Ledger> HttpPriceOracle<L> {
    pub(crate) fn new(ctx: OracleCtx, ledger: L) -> Result<Self, OracleError> {
        let client = Client::builder().timeout(FEED_TIMEOUT).build()?;

        Ok(Self {
            client,
            ctx,
            ledger,
            retry_strategy: feed_retry_strategy(),
        })
    }

    #[cfg(test)]
    fn with_retry_strategy(mut self, retry_strategy: ExponentialBuilder) -> Self {
        self.retry_strategy = retry_strategy;
        self
    }

    async fn fetch_json<T: DeserializeOwned>(&self, url: &Url) -> Result<T, OracleError> {
        let response = self.client.get(url.clone()).send().await?;
        let status = response.status();

        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(OracleError::Api { status, message });
        }

        Ok(response.json::<T>().await?)
    }

    async fn get_json<T: DeserializeOwned>(&self, url: Url) -> Result<T, OracleError> {
        (|| async { self.fetch_json::<T>(&url).await })
            .retry(self.retry_strategy.clone())
            .notify(|error, delay| {
                warn!(%url, %error, ?delay, "Feed request failed, retrying");
            })
            .await
    }

    fn bins_url(&self, active_bin_id: u32) -> Result<Url, OracleError> {
        let mut url = self
            .ctx
            .bins_url
            .join(&format!("{:#x}/{active_bin_id}", self.ctx.pair))?;

        url.query_pairs_mut()
            .append_pair("filterBy", "1d")
            .append_pair("radius", &self.ctx.bin_radius.to_string());

        Ok(url)
    }

    fn market_url(&self) -> Url {
        let mut url = self.ctx.market_url.clone();
        url.query_pairs_mut().append_pair("q", &self.ctx.market_query());
        url
    }

    /// Price of base in quote, if `pair` quotes the configured assets on
    /// the configured chain.
    fn venue_price(&self, pair: &VenuePair) -> Option<Decimal> {
        if let Some(chain_id) = &self.ctx.chain_id
            && !pair.chain_id.eq_ignore_ascii_case(chain_id)
        {
            return None;
        }

        let base = &pair.base_token.symbol;
        let quote = &pair.quote_token.symbol;
        let price = pair.price_native.filter(|price| *price > Decimal::ZERO)?;

        if base.eq_ignore_ascii_case(&self.ctx.base_symbol)
            && quote.eq_ignore_ascii_case(&self.ctx.quote_symbol)
        {
            Some(price)
        } else if base.eq_ignore_ascii_case(&self.ctx.quote_symbol)
            && quote.eq_ignore_ascii_case(&self.ctx.base_symbol)
        {
            Decimal::ONE.checked_div(price)
        } else {
            None
        }
    }
}

#[async_trait]
impl<L: Ledger> PriceOracle for HttpPriceOracle<L> {
    #[tracing::instrument(skip(self), level = tracing::Level::DEBUG)]
    async fn pool_state(&self) -> Result<PoolState, OracleError> {
        let pair = self.ledger.pair_info().await?;
        let entries: Vec<BinEntry> = self.get_json(self.bins_url(pair.active_bin_id)?).await?;

        let low = pair.active_bin_id.saturating_sub(self.ctx.bin_radius);
        let high = pair.active_bin_id.saturating_add(self.ctx.bin_radius);

        let bins = entries
            .into_iter()
            .filter(|entry| (low..=high).contains(&entry.bin_id))
            .filter_map(|entry| {
                let price = entry.price_xy.or_else(|| {
                    bin_price(entry.bin_id, pair.bin_step, pair.decimals_x, pair.decimals_y)
                });

                let Some(price) = price else {
                    warn!(bin_id = entry.bin_id, "Bin price out of range, skipping bin");
                    return None;
                };

                Some(BinSnapshot::new(
                    entry.bin_id,
                    entry.reserve_x,
                    entry.reserve_y,
                    price,
                    self.ctx.price_precision,
                ))
            })
            .collect::<Vec<_>>();

        debug!(
            active_bin_id = pair.active_bin_id,
            bins = bins.len(),
            "Fetched pool state"
        );

        Ok(PoolState::new(pair.active_bin_id, pair.bin_step, bins))
    }

    #[tracing::instrument(skip(self), level = tracing::Level::DEBUG)]
    async fn market_reference(&self) -> Result<MarketReference, OracleError> {
        let response: SearchResponse = self.get_json(self.market_url()).await?;

        let samples = response
            .pairs
            .unwrap_or_default()
            .iter()
            .filter_map(|pair| {
                self.venue_price(pair).map(|price| MarketSample {
                    price,
                    volume: pair.volume.h24,
                })
            })
            .collect::<Vec<_>>();

        let reference = MarketReference::from_samples(
            &samples,
            self.ctx.top_venues,
            self.ctx.price_precision,
        )
        .ok_or_else(|| OracleError::NoMarketSamples {
            pair: self.ctx.market_query(),
        })?;

        debug!(
            price = %reference.price,
            venues = reference.venues,
            candidates = samples.len(),
            "Computed market reference"
        );

        Ok(reference)
    }
}

//! Scriptable [`PriceOracle`] for tests.

use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use reqwest::StatusCode;

use super::{MarketReference, OracleError, PriceOracle};
use crate::pool::PoolState;

pub(crate) struct MockPriceOracle {
    pool: Mutex<PoolState>,
    market: Mutex<MarketReference>,
    fail: AtomicBool,
    pool_calls: AtomicUsize,
}

impl MockPriceOracle {
    pub(crate) fn new(pool: PoolState, market: MarketReference) -> Self {
        Self {
            pool: Mutex::new(pool),
            market: Mutex::new(market),
            fail: AtomicBool::new(false),
            pool_calls: AtomicUsize::new(0),
        }
    }

    pub(crate) fn set_pool(&self, pool: PoolState) {
        *self.pool.lock().unwrap() = pool;
    }

    /// Makes every subsequent fetch fail until reset.
    pub(crate) fn set_failing(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub(crate) fn pool_calls(&self) -> usize {
        self.pool_calls.load(Ordering::SeqCst)
    }

    fn unavailable() -> OracleError {
        OracleError::Api {
            status: StatusCode::SERVICE_UNAVAILABLE,
            message: "mock feed unavailable".to_string(),
        }
    }
}

#[async_trait]
impl PriceOracle for MockPriceOracle {
    async fn pool_state(&self) -> Result<PoolState, OracleError> {
        self.pool_calls.fetch_add(1, Ordering::SeqCst);

        if self.fail.load(Ordering::SeqCst) {
            return Err(Self::unavailable());
        }

        Ok(self.pool.lock().unwrap().clone())
    }

    async fn market_reference(&self) -> Result<MarketReference, OracleError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(Self::unavailable());
        }

        Ok(*self.market.lock().unwrap())
    }
}

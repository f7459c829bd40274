//! Liquidity Book rebalancing agent.
//!
//! Keeps a single-bin liquidity position on a Merchant Moe pair next to
//! the market: it watches the pair's active bin, compares it against an
//! external market reference and moves the position into the active bin
//! when the market has converged there or when the position has been out
//! of range for too long, within a fee-aware daily action budget.

use std::sync::Arc;

use alloy::network::EthereumWallet;
use alloy::providers::ProviderBuilder;
use alloy::signers::local::PrivateKeySigner;
use chrono::Utc;
use tracing::{info, warn};

use moe_evm::local::PrivateKeyWallet;

mod audit;
mod bindings;
mod budget;
pub mod config;
mod ledger;
mod monitor;
mod oracle;
mod policy;
mod pool;
mod rebalance;
mod state;

#[cfg(test)]
pub(crate) mod test_utils;

use crate::audit::{AuditEvent, AuditSink, SqliteAuditLog};
use crate::config::Ctx;
use crate::ledger::{EvmLedger, Ledger, http_client_with_retry};
use crate::monitor::{MonitorLoop, SystemClock};
use crate::oracle::HttpPriceOracle;
use crate::rebalance::{RebalanceExecutor, SagaStore};
use crate::state::StateStore;

pub async fn launch(ctx: Ctx) -> anyhow::Result<()> {
    let pool = ctx.get_sqlite_pool().await?;
    sqlx::migrate!().run(&pool).await?;

    let signer = PrivateKeySigner::from_bytes(&ctx.evm.private_key)?;
    let provider = ProviderBuilder::new()
        .wallet(EthereumWallet::from(signer))
        .connect_client(http_client_with_retry(ctx.evm.rpc_url.clone()));
    let wallet = PrivateKeyWallet::new(provider, ctx.execution.required_confirmations);
    let ledger = Arc::new(EvmLedger::new(wallet, ctx.pool.pair, ctx.pool.router));

    let pair = ledger.pair_info().await?;
    info!(
        owner = %ledger.owner(),
        pair = %ctx.pool.pair,
        active_bin_id = pair.active_bin_id,
        bin_step = pair.bin_step,
        base = %ctx.pool.base_symbol,
        quote = %ctx.pool.quote_symbol,
        "Connected to pair"
    );

    let audit = SqliteAuditLog::new(pool.clone());
    let sagas = SagaStore::new(pool.clone());

    let started_at = Utc::now();
    let interrupted = sagas.flag_interrupted(started_at).await?;
    if !interrupted.is_empty() {
        warn!(
            count = interrupted.len(),
            "Found interrupted rebalances from a previous run"
        );
    }
    for saga in interrupted {
        audit
            .record(
                &AuditEvent::InterruptedSaga {
                    saga_id: saga.saga_id,
                    status: saga.status,
                },
                started_at,
            )
            .await;
    }

    let oracle = HttpPriceOracle::new(ctx.oracle.clone(), Arc::clone(&ledger))?;
    let executor = RebalanceExecutor::new(
        Arc::clone(&ledger),
        sagas,
        ctx.execution,
        ctx.monitor.bin_radius,
    );
    let monitor = MonitorLoop::new(
        ctx.monitor,
        oracle,
        ledger,
        executor,
        audit,
        StateStore::new(pool.clone()),
        SystemClock,
    );

    tokio::select! {
        () = monitor.run() => {}
        result = tokio::signal::ctrl_c() => {
            result?;
            info!("Received shutdown signal");
        }
    }

    pool.close().await;
    info!("Shutdown complete");
    Ok(())
}

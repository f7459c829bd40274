//! Durable record of what the agent observed and did.
//!
//! Recording is fire-and-forget: a sink that cannot persist an event
//! logs a warning and the cycle carries on.

use alloy::primitives::TxHash;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::SqlitePool;
use tracing::warn;
use uuid::Uuid;

use crate::policy::RebalanceTrigger;
use crate::rebalance::SagaStatus;

#[cfg(test)]
pub(crate) mod mock;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub(crate) enum AuditEvent {
    Started {
        current_bin_id: u32,
        max_actions: u32,
    },
    ActiveBinChanged {
        from: u32,
        to: u32,
    },
    BudgetRollover {
        max_actions: u32,
    },
    RebalanceExecuted {
        saga_id: Uuid,
        from_bins: Vec<u32>,
        to_bin: u32,
        trigger: RebalanceTrigger,
        withdraw_tx: TxHash,
        deposit_tx: TxHash,
        gas_used: u64,
        cost_wei: u128,
    },
    BudgetExhausted {
        max_actions: u32,
        trigger: RebalanceTrigger,
    },
    RebalanceFailed {
        error: String,
    },
    PartialRebalance {
        saga_id: Uuid,
        withdraw_tx: TxHash,
        error: String,
    },
    CycleFailed {
        error: String,
    },
    InterruptedSaga {
        saga_id: Uuid,
        status: SagaStatus,
    },
}

impl AuditEvent {
    pub(crate) fn kind(&self) -> &'static str {
        match self {
            Self::Started { .. } => "started",
            Self::ActiveBinChanged { .. } => "active_bin_changed",
            Self::BudgetRollover { .. } => "budget_rollover",
            Self::RebalanceExecuted { .. } => "rebalance_executed",
            Self::BudgetExhausted { .. } => "budget_exhausted",
            Self::RebalanceFailed { .. } => "rebalance_failed",
            Self::PartialRebalance { .. } => "partial_rebalance",
            Self::CycleFailed { .. } => "cycle_failed",
            Self::InterruptedSaga { .. } => "interrupted_saga",
        }
    }
}

#[async_trait]
pub(crate) trait AuditSink: Send + Sync {
    /// Records `event` as having happened at `at`.
    async fn record(&self, event: &AuditEvent, at: DateTime<Utc>);
}

#[async_trait]
impl<T: AuditSink + ?Sized> AuditSink for std::sync::Arc<T> {
    async fn record(&self, event: &AuditEvent, at: DateTime<Utc>) {
        (**self).record(event, at).await;
    }
}

/// Appends events as JSON rows to the `audit_log` table.
#[derive(Clone)]
pub(crate) struct SqliteAuditLog {
    pool: SqlitePool,
}

impl SqliteAuditLog {
    pub(crate) fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    async fn insert(&self, event: &AuditEvent, at: DateTime<Utc>) -> Result<(), AuditWriteError> {
        let detail = serde_json::to_string(event)?;

        sqlx::query("INSERT INTO audit_log (kind, detail, created_at) VALUES (?1, ?2, ?3)")
            .bind(event.kind())
            .bind(detail)
            .bind(at)
            .execute(&self.pool)
            .await?;

        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
enum AuditWriteError {
    #[error("failed to serialize audit event: {0}")]
    Json(#[from] serde_json::Error),
    #[error("failed to write audit event: {0}")]
    Database(#[from] sqlx::Error),
}

#[async_trait]
impl AuditSink for SqliteAuditLog {
    async fn record(&self, event: &AuditEvent, at: DateTime<Utc>) {
        self.insert(event, at)
            .await
            .inspect_err(|error| {
                warn!(kind = event.kind(), ?error, "Failed to record audit event");
            })
            .ok();
    }
}

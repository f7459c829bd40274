//! Persistence for the withdraw-then-deposit rebalance saga.
//!
//! ```text
//! Started ──withdraw ok──> Withdrawn ──deposit ok──> Completed
//!    │                        │
//!    v                        v
//! WithdrawFailed          DepositFailed
//! ```
//!
//! A saga still `Started` or `Withdrawn` when the process starts was cut
//! off mid-flight and is flagged `Interrupted` for manual reconciliation.

use std::fmt;

use alloy::primitives::{TxHash, U256};
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::SqlitePool;
use tracing::error;
use uuid::Uuid;

use crate::policy::RebalanceTrigger;

#[derive(Debug, thiserror::Error)]
pub(crate) enum SagaError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("failed to encode bin ids: {0}")]
    Json(#[from] serde_json::Error),
    #[error("saga {0} not found")]
    NotFound(Uuid),
    #[error("stored saga id {0} is not a uuid")]
    InvalidId(String),
    #[error("unknown saga status {0}")]
    UnknownStatus(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub(crate) enum SagaStatus {
    Started,
    Withdrawn,
    Completed,
    WithdrawFailed,
    DepositFailed,
    Interrupted,
}

impl SagaStatus {
    fn as_str(self) -> &'static str {
        match self {
            Self::Started => "started",
            Self::Withdrawn => "withdrawn",
            Self::Completed => "completed",
            Self::WithdrawFailed => "withdraw_failed",
            Self::DepositFailed => "deposit_failed",
            Self::Interrupted => "interrupted",
        }
    }

    fn parse(value: &str) -> Result<Self, SagaError> {
        match value {
            "started" => Ok(Self::Started),
            "withdrawn" => Ok(Self::Withdrawn),
            "completed" => Ok(Self::Completed),
            "withdraw_failed" => Ok(Self::WithdrawFailed),
            "deposit_failed" => Ok(Self::DepositFailed),
            "interrupted" => Ok(Self::Interrupted),
            other => Err(SagaError::UnknownStatus(other.to_string())),
        }
    }
}

impl fmt::Display for SagaStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A saga found in a non-terminal state at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct InterruptedSaga {
    pub(crate) saga_id: Uuid,
    pub(crate) status: SagaStatus,
    pub(crate) withdraw_tx: Option<String>,
}

#[derive(Clone)]
pub(crate) struct SagaStore {
    pool: SqlitePool,
}

impl SagaStore {
    pub(crate) fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub(crate) async fn start(
        &self,
        from_bins: &[u32],
        to_bin: u32,
        trigger: RebalanceTrigger,
        now: DateTime<Utc>,
    ) -> Result<Uuid, SagaError> {
        let saga_id = Uuid::new_v4();

        sqlx::query(
            "INSERT INTO rebalance_sagas
                (id, from_bins, to_bin, trigger, status, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)",
        )
        .bind(saga_id.to_string())
        .bind(serde_json::to_string(from_bins)?)
        .bind(i64::from(to_bin))
        .bind(trigger.to_string())
        .bind(SagaStatus::Started.as_str())
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(saga_id)
    }

    pub(crate) async fn mark_withdrawn(
        &self,
        saga_id: Uuid,
        withdraw_tx: TxHash,
        amount_x: U256,
        amount_y: U256,
        now: DateTime<Utc>,
    ) -> Result<(), SagaError> {
        let result = sqlx::query(
            "UPDATE rebalance_sagas
             SET status = ?2, withdraw_tx = ?3, amount_x = ?4, amount_y = ?5, updated_at = ?6
             WHERE id = ?1",
        )
        .bind(saga_id.to_string())
        .bind(SagaStatus::Withdrawn.as_str())
        .bind(withdraw_tx.to_string())
        .bind(amount_x.to_string())
        .bind(amount_y.to_string())
        .bind(now)
        .execute(&self.pool)
        .await?;

        ensure_updated(saga_id, result.rows_affected())
    }

    pub(crate) async fn mark_completed(
        &self,
        saga_id: Uuid,
        deposit_tx: TxHash,
        now: DateTime<Utc>,
    ) -> Result<(), SagaError> {
        let result = sqlx::query(
            "UPDATE rebalance_sagas
             SET status = ?2, deposit_tx = ?3, updated_at = ?4
             WHERE id = ?1",
        )
        .bind(saga_id.to_string())
        .bind(SagaStatus::Completed.as_str())
        .bind(deposit_tx.to_string())
        .bind(now)
        .execute(&self.pool)
        .await?;

        ensure_updated(saga_id, result.rows_affected())
    }

    pub(crate) async fn mark_withdraw_failed(
        &self,
        saga_id: Uuid,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<(), SagaError> {
        self.mark_failed(saga_id, SagaStatus::WithdrawFailed, reason, now)
            .await
    }

    pub(crate) async fn mark_deposit_failed(
        &self,
        saga_id: Uuid,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<(), SagaError> {
        self.mark_failed(saga_id, SagaStatus::DepositFailed, reason, now)
            .await
    }

    async fn mark_failed(
        &self,
        saga_id: Uuid,
        status: SagaStatus,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<(), SagaError> {
        let result = sqlx::query(
            "UPDATE rebalance_sagas
             SET status = ?2, error = ?3, updated_at = ?4
             WHERE id = ?1",
        )
        .bind(saga_id.to_string())
        .bind(status.as_str())
        .bind(reason)
        .bind(now)
        .execute(&self.pool)
        .await?;

        ensure_updated(saga_id, result.rows_affected())
    }

    #[cfg(test)]
    pub(crate) async fn status(&self, saga_id: Uuid) -> Result<SagaStatus, SagaError> {
        let status: Option<String> =
            sqlx::query_scalar("SELECT status FROM rebalance_sagas WHERE id = ?1")
                .bind(saga_id.to_string())
                .fetch_optional(&self.pool)
                .await?;

        SagaStatus::parse(&status.ok_or(SagaError::NotFound(saga_id))?)
    }

    /// Flags every saga left in `Started` or `Withdrawn` as `Interrupted`
    /// and returns them as they were found.
    pub(crate) async fn flag_interrupted(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<InterruptedSaga>, SagaError> {
        let mut tx = self.pool.begin().await?;

        let rows: Vec<(String, String, Option<String>)> = sqlx::query_as(
            "SELECT id, status, withdraw_tx
             FROM rebalance_sagas
             WHERE status IN ('started', 'withdrawn')
             ORDER BY created_at",
        )
        .fetch_all(&mut *tx)
        .await?;

        let interrupted = rows
            .into_iter()
            .map(|(id, status, withdraw_tx)| {
                Ok(InterruptedSaga {
                    saga_id: Uuid::parse_str(&id).map_err(|_| SagaError::InvalidId(id))?,
                    status: SagaStatus::parse(&status)?,
                    withdraw_tx,
                })
            })
            .collect::<Result<Vec<_>, SagaError>>()?;

        sqlx::query(
            "UPDATE rebalance_sagas
             SET status = 'interrupted', updated_at = ?1
             WHERE status IN ('started', 'withdrawn')",
        )
        .bind(now)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        for saga in &interrupted {
            error!(
                saga_id = %saga.saga_id,
                status = %saga.status,
                withdraw_tx = saga.withdraw_tx.as_deref(),
                "Rebalance saga was interrupted and needs manual reconciliation"
            );
        }

        Ok(interrupted)
    }
}

fn ensure_updated(saga_id: Uuid, rows_affected: u64) -> Result<(), SagaError> {
    if rows_affected == 0 {
        return Err(SagaError::NotFound(saga_id));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use alloy::primitives::B256;
    use chrono::{TimeDelta, TimeZone};
    use tracing_test::traced_test;

    use super::*;
    use crate::test_utils::setup_test_db;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap()
    }

    #[tokio::test]
    async fn timestamps_come_from_the_caller() {
        let pool = setup_test_db().await;
        let store = SagaStore::new(pool.clone());
        let later = now() + TimeDelta::minutes(3);

        let saga_id = store
            .start(&[7], 9, RebalanceTrigger::PriceConverged, now())
            .await
            .unwrap();
        store
            .mark_withdrawn(saga_id, B256::repeat_byte(0x11), U256::from(1), U256::from(2), later)
            .await
            .unwrap();

        let (created_at, updated_at): (DateTime<Utc>, DateTime<Utc>) =
            sqlx::query_as("SELECT created_at, updated_at FROM rebalance_sagas WHERE id = ?1")
                .bind(saga_id.to_string())
                .fetch_one(&pool)
                .await
                .unwrap();

        assert_eq!(created_at, now());
        assert_eq!(updated_at, later);
    }

    #[tokio::test]
    async fn saga_walks_through_happy_path() {
        let store = SagaStore::new(setup_test_db().await);

        let saga_id = store
            .start(&[8_388_605, 8_388_606], 8_388_608, RebalanceTrigger::PriceConverged, now())
            .await
            .unwrap();
        assert_eq!(store.status(saga_id).await.unwrap(), SagaStatus::Started);

        store
            .mark_withdrawn(saga_id, B256::repeat_byte(0x11), U256::from(10), U256::from(20), now())
            .await
            .unwrap();
        assert_eq!(store.status(saga_id).await.unwrap(), SagaStatus::Withdrawn);

        store
            .mark_completed(saga_id, B256::repeat_byte(0x22), now())
            .await
            .unwrap();
        assert_eq!(store.status(saga_id).await.unwrap(), SagaStatus::Completed);
    }

    #[tokio::test]
    async fn failures_record_the_error() {
        let pool = setup_test_db().await;
        let store = SagaStore::new(pool.clone());

        let saga_id = store
            .start(&[7], 9, RebalanceTrigger::StaleOverride, now())
            .await
            .unwrap();
        store
            .mark_withdraw_failed(saga_id, "execution reverted", now())
            .await
            .unwrap();

        let (status, error): (String, Option<String>) =
            sqlx::query_as("SELECT status, error FROM rebalance_sagas WHERE id = ?1")
                .bind(saga_id.to_string())
                .fetch_one(&pool)
                .await
                .unwrap();

        assert_eq!(status, "withdraw_failed");
        assert_eq!(error.as_deref(), Some("execution reverted"));
    }

    #[tokio::test]
    async fn updating_unknown_saga_fails() {
        let store = SagaStore::new(setup_test_db().await);
        let missing = Uuid::new_v4();

        let error = store
            .mark_completed(missing, B256::repeat_byte(0x22), now())
            .await
            .unwrap_err();

        assert!(matches!(error, SagaError::NotFound(id) if id == missing));
    }

    #[traced_test]
    #[tokio::test]
    async fn non_terminal_sagas_are_flagged_interrupted() {
        let store = SagaStore::new(setup_test_db().await);

        let started = store
            .start(&[1], 2, RebalanceTrigger::PriceConverged, now())
            .await
            .unwrap();
        let withdrawn = store
            .start(&[3], 4, RebalanceTrigger::PriceConverged, now())
            .await
            .unwrap();
        store
            .mark_withdrawn(withdrawn, B256::repeat_byte(0x11), U256::from(1), U256::from(1), now())
            .await
            .unwrap();
        let completed = store
            .start(&[5], 6, RebalanceTrigger::PriceConverged, now())
            .await
            .unwrap();
        store
            .mark_withdrawn(completed, B256::repeat_byte(0x11), U256::from(1), U256::from(1), now())
            .await
            .unwrap();
        store
            .mark_completed(completed, B256::repeat_byte(0x22), now())
            .await
            .unwrap();

        let interrupted = store.flag_interrupted(now()).await.unwrap();

        let mut flagged: Vec<_> = interrupted
            .iter()
            .map(|saga| (saga.saga_id, saga.status))
            .collect();
        flagged.sort_by_key(|(saga_id, _)| *saga_id);
        let mut expected = vec![
            (started, SagaStatus::Started),
            (withdrawn, SagaStatus::Withdrawn),
        ];
        expected.sort_by_key(|(saga_id, _)| *saga_id);
        assert_eq!(flagged, expected);

        assert_eq!(store.status(started).await.unwrap(), SagaStatus::Interrupted);
        assert_eq!(store.status(withdrawn).await.unwrap(), SagaStatus::Interrupted);
        assert_eq!(store.status(completed).await.unwrap(), SagaStatus::Completed);
        assert!(logs_contain("needs manual reconciliation"));

        assert!(store.flag_interrupted(now()).await.unwrap().is_empty());
    }
}
